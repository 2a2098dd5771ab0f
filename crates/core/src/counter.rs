//! Refcounted, composite-keyed counter set overlay on the shared vector.
//! Each counter set is a vector of fixed-layout slots holding an embedded
//! per-counter mutex, a uid, a refcount, and a signed count. Mutating
//! operations nest the per-counter mutex inside the vector's own lock, so
//! no other process can delete a slot out from under a concurrent
//! read-modify-write.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::error::{ShmError, ShmResult};
use crate::mutex::ShmMutex;
use crate::vector::{SharedVector, ShmPod, NOT_FOUND};

/// Default counter set size.
pub const DEFAULT_SET_SIZE: usize = 1024;

/// Composite 4-tuple key identifying a counter within a set: `(group,
/// ctype, tag, lid)`. Comparison order of the four fields is irrelevant
/// to correctness, only that all four match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterUid {
    pub group: i64,
    pub ctype: i64,
    pub tag: i64,
    pub lid: i64,
}

impl CounterUid {
    pub const fn new(group: i64, ctype: i64, tag: i64, lid: i64) -> Self {
        Self {
            group,
            ctype,
            tag,
            lid,
        }
    }

    fn matches(&self, raw: &[i64; 4]) -> bool {
        raw[0] == self.group && raw[1] == self.ctype && raw[2] == self.tag && raw[3] == self.lid
    }

    fn to_raw(self) -> [i64; 4] {
        [self.group, self.ctype, self.tag, self.lid]
    }
}

/// The all-`0xDEADBEEF...` uid reserved and never assigned to
/// an application counter.
pub const RESERVED_UID: CounterUid = CounterUid::new(
    0xDEAD_BEEF_DEAD_BEEFu64 as i64,
    0xDEAD_BEEF_DEAD_BEEFu64 as i64,
    0xDEAD_BEEF_DEAD_BEEFu64 as i64,
    0xDEAD_BEEF_DEAD_BEEFu64 as i64,
);

/// On-segment layout of one counter slot. Field types are plain (never
/// `Atomic*`) so the struct stays `Copy`, as `ShmPod` requires for
/// anything [`SharedVector`] stores by value; code that mutates a live
/// slot in place instead reinterprets the relevant field as its atomic
/// counterpart through a raw pointer (see [`Self::mutex`],
/// [`Self::count_atomic`], [`Self::refcount_atomic`]) rather than going
/// through a `&mut CounterSlot`, since other processes may be
/// concurrently touching sibling fields of the same slot.
#[repr(C)]
#[derive(Clone, Copy)]
struct CounterSlot {
    lock: u32,
    _pad: u32,
    uid: [i64; 4],
    refcount: u64,
    count: i64,
}

unsafe impl ShmPod for CounterSlot {}

impl CounterSlot {
    const fn fresh(uid: [i64; 4]) -> Self {
        Self {
            lock: 0,
            _pad: 0,
            uid,
            refcount: 0,
            count: 0,
        }
    }

    /// # Safety
    /// `ptr` must address a live slot in the owning vector's segment.
    unsafe fn mutex<'a>(ptr: *mut CounterSlot) -> &'a ShmMutex {
        ShmMutex::from_raw(std::ptr::addr_of_mut!((*ptr).lock))
    }

    unsafe fn refcount_atomic<'a>(ptr: *mut CounterSlot) -> &'a AtomicU64 {
        &*(std::ptr::addr_of_mut!((*ptr).refcount) as *const AtomicU64)
    }

    unsafe fn count_atomic<'a>(ptr: *mut CounterSlot) -> &'a AtomicI64 {
        &*(std::ptr::addr_of_mut!((*ptr).count) as *const AtomicI64)
    }
}

/// A named collection of refcounted, composite-keyed counters.
pub struct CounterSet {
    vector: SharedVector<CounterSlot>,
}

/// A reference-counted handle to one counter within a [`CounterSet`].
/// Two handles created for the same uid always address the same slot and
/// so observe each other's mutations. Release a handle explicitly via
/// [`CounterSet::counter_destroy`]; there is no `Drop` glue, matching the
/// explicit create/destroy pairing elsewhere in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterHandle {
    idx: usize,
}

impl CounterHandle {
    /// The vector slot this handle currently addresses.
    pub fn slot(&self) -> usize {
        self.idx
    }
}

/// Outcome of [`CounterSet::set_if_zero`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetIfZeroOutcome {
    Set,
    NotSet,
}

impl CounterSet {
    /// Create or attach to a named counter set with room for `set_size`
    /// counters.
    pub fn create_or_open(name: &str, set_size: usize) -> ShmResult<Self> {
        Ok(Self {
            vector: SharedVector::create_or_open(name, set_size)?,
        })
    }

    fn find_locked(&self, uid: CounterUid) -> usize {
        self.vector.find_first_of(|slot| uid.matches(&slot.uid))
    }

    /// Find-or-insert the slot for `uid`, bump its refcount under the
    /// per-counter mutex (creating that mutex first if the slot was
    /// freshly inserted), and return a handle.
    pub fn counter_create(&self, uid: CounterUid) -> ShmResult<CounterHandle> {
        if uid == RESERVED_UID {
            return Err(ShmError::InvalidConfig(
                "counter uid is reserved".to_string(),
            ));
        }
        let _vguard = self.vector.lock()?;
        let mut idx = self.find_locked(uid);
        let fresh = idx == NOT_FOUND;
        if fresh {
            idx = self.vector.insert_quick()?;
            self.vector
                .insert_at(idx, CounterSlot::fresh(uid.to_raw()))?;
        }
        let ptr = self.vector.slot_ptr(idx);
        // SAFETY: idx was just located or reserved under the vector lock
        // and addresses a live slot in this vector's segment.
        let mtx = unsafe { CounterSlot::mutex(ptr) };
        if fresh {
            // SAFETY: this process just wrote the zeroed slot above; no
            // other opener can have raced the mutex's NotReady->Available
            // transition while we hold the vector lock.
            unsafe { mtx.create() };
        }
        let _cguard = mtx.lock()?;
        unsafe { CounterSlot::refcount_atomic(ptr) }.fetch_add(1, Ordering::AcqRel);
        Ok(CounterHandle { idx })
    }

    /// Decrement the refcount under both locks; on the last reference,
    /// zero the slot and free it from the vector. The per-counter mutex
    /// is retired with the slot rather than unlocked: there is no holder
    /// left to release it to.
    pub fn counter_destroy(&self, handle: CounterHandle) -> ShmResult<()> {
        let _vguard = self.vector.lock()?;
        let ptr = self.vector.slot_ptr(handle.idx);
        let mtx = unsafe { CounterSlot::mutex(ptr) };
        let cguard = mtx.lock()?;
        let remaining =
            unsafe { CounterSlot::refcount_atomic(ptr) }.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            std::mem::forget(cguard);
            unsafe { std::ptr::write_bytes(ptr, 0, 1) };
            self.vector.del(handle.idx);
        }
        Ok(())
    }

    /// `count += delta`.
    pub fn inc(&self, handle: CounterHandle, delta: i64) -> ShmResult<i64> {
        let _vguard = self.vector.lock()?;
        let ptr = self.vector.slot_ptr(handle.idx);
        let mtx = unsafe { CounterSlot::mutex(ptr) };
        let _cguard = mtx.lock()?;
        Ok(unsafe { CounterSlot::count_atomic(ptr) }.fetch_add(delta, Ordering::AcqRel) + delta)
    }

    /// `count -= delta`; the result may go negative.
    pub fn dec(&self, handle: CounterHandle, delta: i64) -> ShmResult<i64> {
        self.inc(handle, -delta)
    }

    /// Unlocked best-effort read of `count`.
    pub fn value(&self, handle: CounterHandle) -> i64 {
        let ptr = self.vector.slot_ptr(handle.idx);
        unsafe { CounterSlot::count_atomic(ptr) }.load(Ordering::Relaxed)
    }

    /// Unlocked best-effort equality check against `count`.
    pub fn is_value(&self, handle: CounterHandle, v: i64) -> bool {
        self.value(handle) == v
    }

    /// Atomic test-and-set: if `count == 0`, set it to `v` and report
    /// [`SetIfZeroOutcome::Set`]; otherwise leave it untouched.
    pub fn set_if_zero(&self, handle: CounterHandle, v: i64) -> ShmResult<SetIfZeroOutcome> {
        let _vguard = self.vector.lock()?;
        let ptr = self.vector.slot_ptr(handle.idx);
        let mtx = unsafe { CounterSlot::mutex(ptr) };
        let _cguard = mtx.lock()?;
        let count = unsafe { CounterSlot::count_atomic(ptr) };
        match count.compare_exchange(0, v, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(SetIfZeroOutcome::Set),
            Err(_) => Ok(SetIfZeroOutcome::NotSet),
        }
    }

    /// Short-circuit when both handles already address the same slot;
    /// otherwise acquire both per-counter mutexes in fixed slot-index
    /// order inside the vector lock and compare snapshots.
    pub fn is_equal_safe(&self, l: CounterHandle, r: CounterHandle) -> ShmResult<bool> {
        if l.idx == r.idx {
            return Ok(true);
        }
        let _vguard = self.vector.lock()?;
        let (lo, hi) = if l.idx < r.idx {
            (l.idx, r.idx)
        } else {
            (r.idx, l.idx)
        };
        let lo_ptr = self.vector.slot_ptr(lo);
        let hi_ptr = self.vector.slot_ptr(hi);
        let lo_mtx = unsafe { CounterSlot::mutex(lo_ptr) };
        let hi_mtx = unsafe { CounterSlot::mutex(hi_ptr) };
        let _g1 = lo_mtx.lock()?;
        let _g2 = hi_mtx.lock()?;
        let lo_count = unsafe { CounterSlot::count_atomic(lo_ptr) }.load(Ordering::Acquire);
        let hi_count = unsafe { CounterSlot::count_atomic(hi_ptr) }.load(Ordering::Acquire);
        Ok(lo_count == hi_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process;
    use std::sync::atomic::{AtomicU64, Ordering as O};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_name(tag: &str) -> String {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos() as u64;
        let seq = COUNTER.fetch_add(1, O::Relaxed);
        format!(
            "/shmutils_test_counter_{}_{}_{}_{}",
            tag,
            process::id(),
            nanos,
            seq
        )
    }

    struct UnlinkGuard(String);

    impl Drop for UnlinkGuard {
        fn drop(&mut self) {
            let _ = nix::sys::mman::shm_unlink(self.0.as_str());
        }
    }

    #[test]
    fn counter_reuse_across_create_destroy() {
        let name = unique_name("reuse");
        let _cleanup = UnlinkGuard(name.clone());
        let set = CounterSet::create_or_open(&name, 16).unwrap();
        let uid = CounterUid::new(75, 1, 0, 4);

        let h = set.counter_create(uid).unwrap();
        assert_eq!(set.value(h), 0);
        set.inc(h, 1).unwrap();
        assert_eq!(set.value(h), 1);
        set.counter_destroy(h).unwrap();

        let h2 = set.counter_create(uid).unwrap();
        assert_eq!(set.value(h2), 0);
        assert_eq!(set.vector.size(), 1);
        set.counter_destroy(h2).unwrap();
        set.vector.destroy().unwrap();
    }

    #[test]
    fn two_handle_visibility() {
        let name = unique_name("twohandle");
        let _cleanup = UnlinkGuard(name.clone());
        let set = CounterSet::create_or_open(&name, 16).unwrap();
        let uid = CounterUid::new(1, 1, 1, 1);

        let a = set.counter_create(uid).unwrap();
        let b = set.counter_create(uid).unwrap();
        assert_eq!(a.slot(), b.slot());

        set.inc(a, 1).unwrap();
        assert_eq!(set.value(a), 1);
        assert_eq!(set.value(b), 1);

        set.inc(b, 1).unwrap();
        assert_eq!(set.value(a), 2);
        assert_eq!(set.value(b), 2);

        set.counter_destroy(a).unwrap();
        set.counter_destroy(b).unwrap();
        set.vector.destroy().unwrap();
    }

    #[test]
    fn set_if_zero_fires_once() {
        let name = unique_name("setifzero");
        let _cleanup = UnlinkGuard(name.clone());
        let set = CounterSet::create_or_open(&name, 16).unwrap();
        let uid = CounterUid::new(1, 1, 1, 1);

        let a = set.counter_create(uid).unwrap();
        assert_eq!(set.set_if_zero(a, 11).unwrap(), SetIfZeroOutcome::Set);
        assert_eq!(set.value(a), 11);

        let b = set.counter_create(uid).unwrap();
        assert_eq!(set.set_if_zero(b, 4).unwrap(), SetIfZeroOutcome::NotSet);
        assert_eq!(set.value(b), 11);

        set.counter_destroy(a).unwrap();
        set.counter_destroy(b).unwrap();
        set.vector.destroy().unwrap();
    }

    #[test]
    fn dec_may_go_negative() {
        let name = unique_name("negative");
        let _cleanup = UnlinkGuard(name.clone());
        let set = CounterSet::create_or_open(&name, 16).unwrap();
        let h = set.counter_create(CounterUid::new(2, 2, 2, 2)).unwrap();
        set.dec(h, 5).unwrap();
        assert_eq!(set.value(h), -5);
        set.counter_destroy(h).unwrap();
        set.vector.destroy().unwrap();
    }

    #[test]
    fn refcount_releases_slot_only_after_every_handle_destroyed() {
        let name = unique_name("refcount");
        let _cleanup = UnlinkGuard(name.clone());
        let set = CounterSet::create_or_open(&name, 16).unwrap();
        let uid = CounterUid::new(3, 3, 3, 3);
        let a = set.counter_create(uid).unwrap();
        let b = set.counter_create(uid).unwrap();
        assert_eq!(set.vector.size(), 1);
        set.counter_destroy(a).unwrap();
        assert_eq!(
            set.vector.size(),
            1,
            "slot survives while a second handle is outstanding"
        );
        set.counter_destroy(b).unwrap();
        assert_eq!(
            set.vector.size(),
            0,
            "slot is released once the last handle is destroyed"
        );
        set.vector.destroy().unwrap();
    }

    #[test]
    fn is_equal_safe_compares_distinct_counters() {
        let name = unique_name("isequal");
        let _cleanup = UnlinkGuard(name.clone());
        let set = CounterSet::create_or_open(&name, 16).unwrap();
        let a = set.counter_create(CounterUid::new(4, 0, 0, 0)).unwrap();
        let b = set.counter_create(CounterUid::new(5, 0, 0, 0)).unwrap();
        assert_ne!(
            a.slot(),
            b.slot(),
            "distinct uids must land in distinct slots"
        );
        assert!(set.is_equal_safe(a, a).unwrap());
        assert!(set.is_equal_safe(a, b).unwrap(), "both start at count 0");
        set.inc(a, 7).unwrap();
        assert!(!set.is_equal_safe(a, b).unwrap(), "only a was incremented");
        set.inc(b, 7).unwrap();
        assert!(set.is_equal_safe(a, b).unwrap());
        set.counter_destroy(a).unwrap();
        set.counter_destroy(b).unwrap();
        set.vector.destroy().unwrap();
    }

    #[test]
    fn reserved_uid_is_rejected() {
        let name = unique_name("reserved");
        let _cleanup = UnlinkGuard(name.clone());
        let set = CounterSet::create_or_open(&name, 16).unwrap();
        assert!(set.counter_create(RESERVED_UID).is_err());
        set.vector.destroy().unwrap();
    }
}
