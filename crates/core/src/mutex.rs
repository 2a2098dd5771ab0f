//! Cross-process mutex: a 32-bit futex word living inside a shared memory
//! segment, with three states instead of the usual two.
//!
//! Freshly `shm_open`'d + `ftruncate`'d memory reads back as all zero bytes,
//! so the zero state ([`NOTREADY`]) doubly serves as "nobody has created
//! this mutex yet". `create` is the one-time transition out of that state
//! and must be called by exactly one process, as the *last* write of a
//! segment's initialisation sequence (see [`crate::vector`]).

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::error;

use crate::error::{ShmError, ShmResult};

const NOTREADY: u32 = 0;
const AVAILABLE: u32 = 1;
const TAKEN: u32 = 2;

/// A three-state mutex word, stored `repr(C)` so its layout matches a
/// 32-bit field in a shared memory segment exactly.
///
/// # Safety
/// Instances of this type are only ever accessed through a reference into
/// a shared memory mapping; they must never be copied by value or moved,
/// since every process racing on the segment waits on this exact address.
/// The all-zero byte pattern is a valid (and the only "unready") value.
#[repr(C)]
pub struct ShmMutex {
    state: AtomicU32,
}

/// RAII guard returned by [`ShmMutex::lock`]. Releasing the lock on every
/// exit path (including error paths) is mandatory;
/// tying release to `Drop` makes that guarantee structural rather than a
/// discipline every call site has to uphold by hand.
#[must_use = "the lock is released when this guard is dropped"]
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.mutex.raw_unlock() {
            error!(?err, "failed to release shared mutex on guard drop");
        }
    }
}

impl ShmMutex {
    /// Reinterpret a raw pointer to a 32-bit word embedded in shared
    /// memory as a mutex handle. Used by overlay layers that embed a
    /// `ShmMutex` inside a larger `Copy`/`ShmPod` element (e.g. the
    /// counter set's per-counter mutex): since `ShmPod` requires `Copy`
    /// and `AtomicU32` is not `Copy`, those elements store the word as a
    /// plain `u32` field and recover mutex behaviour through this cast
    /// rather than holding an `ShmMutex` field directly.
    ///
    /// # Safety
    /// `ptr` must be validly aligned for a `u32` and point at memory that
    /// every process treats exclusively as a three-state mutex word for
    /// as long as the returned reference is used.
    pub(crate) unsafe fn from_raw<'a>(ptr: *mut u32) -> &'a ShmMutex {
        &*(ptr as *const ShmMutex)
    }

    /// Transition a freshly zeroed mutex word to `Available`. Must be
    /// called by exactly one process, and only after every other field in
    /// the enclosing segment header has already been written: this store
    /// is the readiness fence every other opener synchronises against.
    ///
    /// # Safety
    /// Callers must guarantee single-writer, one-time use on memory that
    /// started zero-filled.
    pub unsafe fn create(&self) {
        self.state.store(AVAILABLE, Ordering::Release);
    }

    /// Spin on `Available -> Taken`, parking in the kernel between
    /// attempts. Returns a guard that releases the lock on drop.
    ///
    /// No reentrancy: locking again from the same holder deadlocks, same
    /// as the primitive this replaces.
    pub fn lock(&self) -> ShmResult<ShmMutexGuard<'_>> {
        loop {
            match self.state.compare_exchange(
                AVAILABLE,
                TAKEN,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(ShmMutexGuard { mutex: self }),
                Err(NOTREADY) => return Err(ShmError::MutexRetired),
                Err(_) => futex_wait(&self.state, TAKEN)?,
            }
        }
    }

    /// Block until the word reads `Available`, without taking the lock.
    ///
    /// Unlike [`Self::lock`], this does not treat `NotReady` as a retired
    /// mutex: a segment under construction legitimately sits at `NotReady`
    /// for the short window between `ftruncate` and the creator's call to
    /// [`Self::create`], and a loser attaching mid-creation must wait that
    /// window out rather than bail. Used by [`crate::vector`]'s attach path
    /// as the synchronisation point for the creator's readiness fence.
    pub(crate) fn wait_until_available(&self) -> ShmResult<()> {
        loop {
            match self.state.load(Ordering::Acquire) {
                AVAILABLE => return Ok(()),
                NOTREADY => futex_wait(&self.state, NOTREADY)?,
                _ => futex_wait(&self.state, TAKEN)?,
            }
        }
    }

    fn raw_unlock(&self) -> ShmResult<()> {
        match self
            .state
            .compare_exchange(TAKEN, AVAILABLE, Ordering::Release, Ordering::Relaxed)
        {
            Ok(_) => futex_wake(&self.state, 1),
            Err(_) => Err(ShmError::MutexNotHeld),
        }
    }

    /// Drain the mutex to `NotReady`, waiting out any current holder first.
    /// Safe to call from every attached process.
    pub fn destroy(&self) -> ShmResult<()> {
        loop {
            let available = AVAILABLE;
            if self
                .state
                .compare_exchange(available, NOTREADY, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
            if self.state.load(Ordering::Acquire) == NOTREADY {
                return Ok(());
            }
            futex_wait(&self.state, TAKEN)?;
        }
    }

    /// Retire a mutex the caller knows is currently held (e.g. the last
    /// counter reference tearing down its slot). Wakes every waiter, not
    /// just one, so nobody is left parked on a word that will never
    /// change again.
    pub fn destroy_if_locked(&self) -> ShmResult<()> {
        match self
            .state
            .compare_exchange(TAKEN, NOTREADY, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => futex_wake(&self.state, i32::MAX),
            Err(_) => Err(ShmError::MutexNotHeld),
        }
    }
}

/// Thin wrapper around the raw `futex(2)` syscall; `nix` and `libc` do not
/// expose a safe futex API, so this talks to the kernel directly.
fn futex(uaddr: &AtomicU32, op: libc::c_int, val: u32) -> io::Result<i64> {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            uaddr as *const AtomicU32 as *const u32,
            op,
            val,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0i32,
        )
    };
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

fn futex_wait(uaddr: &AtomicU32, expected: u32) -> ShmResult<()> {
    match futex(uaddr, libc::FUTEX_WAIT, expected) {
        Ok(_) => Ok(()),
        Err(err) => match err.raw_os_error() {
            // The word changed between our CAS failure and the wait call,
            // or we were woken spuriously; both are benign, just retry.
            Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(()),
            _ => {
                error!(%err, "futex wait failed");
                Err(ShmError::Futex(err))
            }
        },
    }
}

fn futex_wake(uaddr: &AtomicU32, count: i32) -> ShmResult<()> {
    match futex(uaddr, libc::FUTEX_WAKE, count as u32) {
        Ok(_) => Ok(()),
        Err(err) => {
            error!(%err, "futex wake failed");
            Err(ShmError::Futex(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn fresh() -> ShmMutex {
        let m = ShmMutex {
            state: AtomicU32::new(NOTREADY),
        };
        unsafe { m.create() };
        m
    }

    #[test]
    fn zeroed_state_is_notready() {
        let m = ShmMutex {
            state: AtomicU32::new(0),
        };
        assert!(m.lock().is_err());
    }

    #[test]
    fn lock_unlock_round_trip() {
        let m = fresh();
        {
            let _g = m.lock().unwrap();
            assert_eq!(m.state.load(Ordering::SeqCst), TAKEN);
        }
        assert_eq!(m.state.load(Ordering::SeqCst), AVAILABLE);
    }

    #[test]
    fn contended_lock_serialises_threads() {
        let m = Arc::new(fresh());
        let counter = Arc::new(std::sync::Mutex::new(0u32));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = Arc::clone(&m);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let _g = m.lock().unwrap();
                    let mut c = counter.lock().unwrap();
                    *c += 1;
                    thread::sleep(Duration::from_micros(1));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 400);
    }

    #[test]
    fn destroy_if_locked_wakes_all_waiters() {
        let m = Arc::new(fresh());
        {
            let _g = m.lock().unwrap();
            std::mem::forget(_g); // simulate a still-held lock without unlocking
        }
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let m = Arc::clone(&m);
            waiters.push(thread::spawn(move || m.lock().is_err()));
        }
        thread::sleep(Duration::from_millis(20));
        m.destroy_if_locked().unwrap();
        for w in waiters {
            assert!(w.join().unwrap());
        }
    }

    #[test]
    fn destroy_drains_available_mutex() {
        let m = fresh();
        m.destroy().unwrap();
        assert_eq!(m.state.load(Ordering::SeqCst), NOTREADY);
    }

    #[test]
    fn wait_until_available_returns_immediately_when_already_available() {
        let m = fresh();
        m.wait_until_available().unwrap();
    }

    #[test]
    fn wait_until_available_spins_through_notready_until_create() {
        let m = Arc::new(ShmMutex {
            state: AtomicU32::new(NOTREADY),
        });
        let waiter = Arc::clone(&m);
        let handle = thread::spawn(move || waiter.wait_until_available().unwrap());
        thread::sleep(Duration::from_millis(20));
        unsafe { m.create() };
        futex_wake(&m.state, i32::MAX).unwrap();
        handle.join().unwrap();
    }
}
