//! Fixed-capacity shared-memory vector with stable indices and hole reuse.
//!
//! A single named segment holds a header followed by a contiguous element
//! region and an active-bitmap region. Exactly one process wins the
//! exclusive create and writes the header; every other opener polls and
//! synchronises on the embedded lock before touching the rest of the
//! segment.

use std::ffi::CString;
use std::marker::PhantomData;
use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::{fstat, Mode};
use nix::unistd::{close, ftruncate};
use tracing::{debug, warn};

use crate::error::{ShmError, ShmResult};
use crate::mutex::ShmMutex;

/// Marker for types that may be stored directly in a shared memory
/// segment: no pointers, no `Drop` glue, and the all-zero bit pattern
/// must be a valid value (segments start zero-filled, same invariant
/// [`ShmMutex`] relies on).
///
/// # Safety
/// Implementors must be `Copy`, contain no padding-sensitive invariants,
/// and be safe to read and write from another process's address space at
/// any time: the byte pattern in the segment *is* the value.
pub unsafe trait ShmPod: Copy {}

macro_rules! impl_shm_pod {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl ShmPod for $t {})*
    };
}

impl_shm_pod!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64, usize, isize, bool);

/// Distinguished not-found index, used internally by scan code and kept
/// off the public API, where callers get `Option`/`Result` instead.
pub(crate) const NOT_FOUND: usize = usize::MAX;

const POLL_INTERVAL: Duration = Duration::from_micros(50);
const POLL_WARN_AFTER: Duration = Duration::from_millis(250);

#[repr(C)]
struct VectorHeader {
    lock: ShmMutex,
    capacity: AtomicUsize,
    esize: AtomicUsize,
    active_count: AtomicUsize,
    next_back_idx: AtomicUsize,
    eles_offset: AtomicUsize,
    actives_offset: AtomicUsize,
}

fn segment_size(capacity: usize, esize: usize) -> usize {
    size_of::<VectorHeader>() + capacity * esize + capacity
}

/// A handle to a shared-memory vector of `T`. Never shared between
/// processes itself; only the segment it maps is shared.
pub struct SharedVector<T: ShmPod> {
    name: String,
    fd: RawFd,
    base: NonNull<u8>,
    map_len: usize,
    _marker: PhantomData<T>,
}

unsafe impl<T: ShmPod + Send> Send for SharedVector<T> {}
unsafe impl<T: ShmPod + Send> Sync for SharedVector<T> {}

impl<T: ShmPod> SharedVector<T> {
    /// Create the segment if this process wins the exclusive open, else
    /// attach to whichever process is initialising or already initialised
    /// it. Both paths return an equally usable handle.
    pub fn create_or_open(name: &str, capacity: usize) -> ShmResult<Self> {
        if capacity == 0 {
            return Err(ShmError::InvalidConfig(
                "vector capacity must be non-zero".to_string(),
            ));
        }
        let esize = size_of::<T>();
        let cname = CString::new(name).map_err(|_| {
            ShmError::InvalidConfig(format!("segment name {name:?} contains a NUL byte"))
        })?;

        match shm_open(
            cname.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        ) {
            Ok(fd) => Self::init_as_winner(fd, name, capacity, esize),
            Err(nix::Error::EEXIST) => Self::attach_as_loser(name, esize),
            Err(e) => Err(ShmError::Open {
                name: name.to_string(),
                source: e,
            }),
        }
    }

    fn init_as_winner(
        fd: std::os::fd::OwnedFd,
        name: &str,
        capacity: usize,
        esize: usize,
    ) -> ShmResult<Self> {
        let segsize = segment_size(capacity, esize);
        if let Err(e) = ftruncate(&fd, segsize as i64) {
            let _ = close(std::os::fd::AsRawFd::as_raw_fd(&fd));
            return Err(ShmError::Truncate {
                name: name.to_string(),
                size: segsize,
                source: e,
            });
        }

        let base = map_segment(&fd, segsize, name)?;
        let fd = std::os::fd::IntoRawFd::into_raw_fd(fd);

        // SAFETY: freshly ftruncate'd memory is zero-filled; we hold the
        // only reference to it and no other process has observed the
        // segment yet (O_EXCL guarantees we are the sole creator).
        let header = unsafe { base.cast::<VectorHeader>().as_ref() };
        header.capacity.store(capacity, Ordering::Relaxed);
        header.esize.store(esize, Ordering::Relaxed);
        header.active_count.store(0, Ordering::Relaxed);
        header.next_back_idx.store(0, Ordering::Relaxed);
        header
            .eles_offset
            .store(size_of::<VectorHeader>(), Ordering::Relaxed);
        header.actives_offset.store(
            size_of::<VectorHeader>() + capacity * esize,
            Ordering::Relaxed,
        );

        // Last: flip the lock to Available. Every other writer above this
        // line must be visible to a loser that observes Available.
        unsafe { header.lock.create() };

        Ok(Self {
            name: name.to_string(),
            fd,
            base,
            map_len: segsize,
            _marker: PhantomData,
        })
    }

    fn attach_as_loser(name: &str, esize: usize) -> ShmResult<Self> {
        let cname = CString::new(name).expect("validated above");
        let fd = shm_open(
            cname.as_c_str(),
            OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| ShmError::Open {
            name: name.to_string(),
            source: e,
        })?;

        let header_len = size_of::<VectorHeader>();
        let started = Instant::now();
        let mut warned = false;
        loop {
            let size = fstat(std::os::fd::AsRawFd::as_raw_fd(&fd))
                .map_err(|e| ShmError::Open {
                    name: name.to_string(),
                    source: e,
                })?
                .st_size as usize;
            if size >= header_len {
                break;
            }
            if !warned && started.elapsed() > POLL_WARN_AFTER {
                warn!(
                    segment = name,
                    "still waiting for vector creator to finish sizing segment"
                );
                warned = true;
            } else {
                debug!(
                    segment = name,
                    "waiting for vector creator to extend segment"
                );
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        // The file reaching `header_len` only means the winner's `ftruncate`
        // ran; the header fields and the lock's Available transition still
        // land afterwards. Wait for the lock itself rather than treating
        // file size as the readiness signal: a successful wait happens-after
        // the creator's release store in `ShmMutex::create`, which
        // happens-after every preceding header write (program order on the
        // winner's side).
        let header_map = map_segment(&fd, header_len, name)?;
        {
            let header = unsafe { header_map.cast::<VectorHeader>().as_ref() };
            header.lock.wait_until_available()?;
        }
        let (capacity, observed_esize) = {
            let header = unsafe { header_map.cast::<VectorHeader>().as_ref() };
            (
                header.capacity.load(Ordering::Acquire),
                header.esize.load(Ordering::Acquire),
            )
        };
        unmap_segment(header_map, header_len, name)?;

        if observed_esize != esize {
            let _ = close(std::os::fd::AsRawFd::as_raw_fd(&fd));
            return Err(ShmError::InvalidConfig(format!(
                "segment {name:?} element size {observed_esize} does not match requested {esize}"
            )));
        }

        let segsize = segment_size(capacity, esize);
        let base = map_segment(&fd, segsize, name)?;
        let fd = std::os::fd::IntoRawFd::into_raw_fd(fd);

        Ok(Self {
            name: name.to_string(),
            fd,
            base,
            map_len: segsize,
            _marker: PhantomData,
        })
    }

    fn header(&self) -> &VectorHeader {
        unsafe { self.base.cast::<VectorHeader>().as_ref() }
    }

    fn eles_ptr(&self) -> *mut T {
        let offset = self.header().eles_offset.load(Ordering::Relaxed);
        unsafe { self.base.as_ptr().add(offset) as *mut T }
    }

    /// Raw pointer to slot `idx`'s backing bytes, without an activity
    /// check or a copy. Overlay layers (list, counter set) that embed
    /// their own sub-structures (a mutex word, ring links) in `T` use
    /// this to mutate those fields in place; `at`/`insert_at` copy the
    /// whole element by value and so cannot be used for that.
    pub(crate) fn slot_ptr(&self, idx: usize) -> *mut T {
        debug_assert!(idx < self.capacity());
        unsafe { self.eles_ptr().add(idx) }
    }

    fn actives_ptr(&self) -> *mut bool {
        let offset = self.header().actives_offset.load(Ordering::Relaxed);
        unsafe { self.base.as_ptr().add(offset) as *mut bool }
    }

    fn actives(&self) -> &[bool] {
        unsafe { std::slice::from_raw_parts(self.actives_ptr(), self.capacity()) }
    }

    /// Number of slots this segment was created with.
    pub fn capacity(&self) -> usize {
        self.header().capacity.load(Ordering::Relaxed)
    }

    /// Best-effort read of the live slot count; no lock is taken. Callers
    /// making compound decisions must hold the lock themselves (`lock()`).
    pub fn size(&self) -> usize {
        self.header().active_count.load(Ordering::Relaxed)
    }

    /// Acquire the segment lock directly, for callers composing several
    /// operations atomically (e.g. the list and counter-set overlays).
    pub fn lock(&self) -> ShmResult<crate::mutex::ShmMutexGuard<'_>> {
        self.header().lock.lock()
    }

    /// Slot `i` if it is within the high-water mark and marked active.
    pub fn at(&self, idx: usize) -> Option<T> {
        let next_back = self.header().next_back_idx.load(Ordering::Relaxed);
        if idx < next_back && self.actives().get(idx).copied().unwrap_or(false) {
            Some(unsafe { *self.eles_ptr().add(idx) })
        } else {
            None
        }
    }

    /// Lock-protected variant of [`Self::at`].
    pub fn safe_at(&self, idx: usize) -> ShmResult<Option<T>> {
        let _guard = self.lock()?;
        Ok(self.at(idx))
    }

    /// Append `ele` at `next_back_idx` if there is room.
    pub fn push_back(&self, ele: T) -> ShmResult<usize> {
        let header = self.header();
        let next_back = header.next_back_idx.load(Ordering::Relaxed);
        let capacity = header.capacity.load(Ordering::Relaxed);
        if next_back >= capacity {
            return Err(ShmError::CapacityExhausted { capacity });
        }
        unsafe { *self.eles_ptr().add(next_back) = ele };
        unsafe { *self.actives_ptr().add(next_back) = true };
        header.next_back_idx.store(next_back + 1, Ordering::Relaxed);
        header.active_count.fetch_add(1, Ordering::Relaxed);
        Ok(next_back)
    }

    /// Lock-protected variant of [`Self::push_back`].
    pub fn safe_push_back(&self, ele: T) -> ShmResult<usize> {
        let _guard = self.lock()?;
        self.push_back(ele)
    }

    /// Write `ele` at `idx`, updating the active bit and high-water mark
    /// as needed. Overwriting an already-active slot does not change the
    /// live count.
    pub fn insert_at(&self, idx: usize, ele: T) -> ShmResult<usize> {
        let header = self.header();
        let capacity = header.capacity.load(Ordering::Relaxed);
        if idx >= capacity {
            return Err(ShmError::CapacityExhausted { capacity });
        }
        unsafe { *self.eles_ptr().add(idx) = ele };
        let actives = self.actives_ptr();
        if !unsafe { *actives.add(idx) } {
            unsafe { *actives.add(idx) = true };
            header.active_count.fetch_add(1, Ordering::Relaxed);
        }
        let next_back = header.next_back_idx.load(Ordering::Relaxed);
        if idx >= next_back {
            header.next_back_idx.store(idx + 1, Ordering::Relaxed);
        }
        Ok(idx)
    }

    /// Reserve a slot without writing user data: prefer the high-water
    /// mark, falling back to the lowest inactive slot below it.
    pub fn insert_quick(&self) -> ShmResult<usize> {
        let header = self.header();
        let capacity = header.capacity.load(Ordering::Relaxed);
        let active_count = header.active_count.load(Ordering::Relaxed);
        if active_count >= capacity {
            return Err(ShmError::CapacityExhausted { capacity });
        }
        let next_back = header.next_back_idx.load(Ordering::Relaxed);
        if next_back < capacity {
            unsafe { *self.actives_ptr().add(next_back) = true };
            header.next_back_idx.store(next_back + 1, Ordering::Relaxed);
            header.active_count.fetch_add(1, Ordering::Relaxed);
            return Ok(next_back);
        }
        let actives = self.actives_ptr();
        for i in 0..capacity {
            if !unsafe { *actives.add(i) } {
                unsafe { *actives.add(i) = true };
                header.active_count.fetch_add(1, Ordering::Relaxed);
                return Ok(i);
            }
        }
        Err(ShmError::CapacityExhausted { capacity })
    }

    /// Clear the active bit at `idx`, if set. Does not move
    /// `next_back_idx` back down.
    pub fn del(&self, idx: usize) -> bool {
        let actives = self.actives_ptr();
        if idx >= self.capacity() {
            return false;
        }
        if unsafe { *actives.add(idx) } {
            unsafe { *actives.add(idx) = false };
            self.header().active_count.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Scan `[0, capacity)` in ascending order for the first active slot
    /// where `cmp` returns `true`. Returns [`NOT_FOUND`] if none match.
    pub fn find_first_of(&self, mut cmp: impl FnMut(&T) -> bool) -> usize {
        let actives = self.actives();
        let eles = self.eles_ptr();
        for (i, active) in actives.iter().enumerate() {
            if *active {
                let slot = unsafe { &*eles.add(i) };
                if cmp(slot) {
                    return i;
                }
            }
        }
        NOT_FOUND
    }

    /// Retire the lock, unlink the backing object, and unmap. Callers
    /// must ensure no other process still needs the segment.
    pub fn destroy(self) -> ShmResult<()> {
        self.header().lock.destroy()?;
        self.unlink()?;
        Ok(())
    }

    /// Unlink the segment under the lock, but leave the lock itself
    /// un-retired: other attached processes keep a usable (if orphaned)
    /// mapping until they exit. This is a best-effort teardown, not a
    /// coordinated one: nothing here tells other processes the segment is
    /// gone.
    pub fn destroy_safe(self) -> ShmResult<()> {
        warn!(segment = %self.name, "destroy_safe called; it may not free all resources");
        let guard = self.lock()?;
        let result = self.unlink();
        drop(guard);
        result
    }

    fn unlink(&self) -> ShmResult<()> {
        shm_unlink(self.name.as_str()).map_err(|e| ShmError::Unlink {
            name: self.name.clone(),
            source: e,
        })
    }
}

impl<T: ShmPod> Drop for SharedVector<T> {
    fn drop(&mut self) {
        if let Err(err) = unmap_segment(self.base, self.map_len, &self.name) {
            warn!(segment = %self.name, %err, "failed to unmap vector segment");
        }
        if let Err(err) = close(self.fd) {
            warn!(segment = %self.name, %err, "failed to close vector segment descriptor");
        }
    }
}

fn map_segment(fd: &impl std::os::fd::AsFd, len: usize, name: &str) -> ShmResult<NonNull<u8>> {
    let len = std::num::NonZeroUsize::new(len).expect("segment length is always non-zero");
    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            Some(fd),
            0,
        )
    }
    .map_err(|e| ShmError::Map {
        name: name.to_string(),
        source: e,
    })?;
    Ok(NonNull::new(ptr as *mut u8).expect("mmap returns a non-null pointer on success"))
}

fn unmap_segment(base: NonNull<u8>, len: usize, name: &str) -> ShmResult<()> {
    unsafe { munmap(base.as_ptr() as *mut std::ffi::c_void, len) }.map_err(|e| ShmError::Map {
        name: name.to_string(),
        source: e,
    })
}
