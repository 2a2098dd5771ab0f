//! Exercises the winner/loser segment-creation protocol across two real
//! address spaces, via a genuine `fork(2)` rather than threads sharing a
//! process's memory map. Threads would let both racers observe the same
//! virtual address for the segment; a forked child has to go through its
//! own `shm_open`/`mmap` and so actually exercises the loser's attach path.

use std::process::exit;

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};

use shmutils_core::SharedVector;

fn unique_name(tag: &str) -> String {
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!(
        "/shmutils_test_race_{tag}_{}_{nanos}_{n}",
        std::process::id()
    )
}

/// Attempt `create_or_open` on `name`, push one element tagged `mark`, and
/// report through the process exit code whether the segment came back
/// with the expected capacity and the element round-tripped.
fn race(name: &str, capacity: usize, mark: u32) -> ! {
    let outcome = (|| -> Option<()> {
        let v = SharedVector::<u32>::create_or_open(name, capacity).ok()?;
        if v.capacity() != capacity {
            return None;
        }
        let idx = v.safe_push_back(mark).ok()?;
        if v.at(idx) != Some(mark) {
            return None;
        }
        Some(())
    })();
    exit(if outcome.is_some() { 0 } else { 1 });
}

#[test]
fn two_processes_racing_create_or_open_both_succeed() {
    let name = unique_name("fork");
    let capacity = 32;

    // SAFETY: the child calls only async-signal-safe-ish shm/mmap/futex
    // operations and exits immediately without unwinding back into the
    // test harness, satisfying fork(2)'s usual post-fork constraints.
    match unsafe { fork() }.expect("fork should succeed") {
        ForkResult::Child => race(&name, capacity, 0xC411D),
        ForkResult::Parent { child } => {
            // The parent races the same creation path concurrently with
            // the child instead of waiting for it first.
            let parent_vec = SharedVector::<u32>::create_or_open(&name, capacity)
                .expect("parent side of the creation race should succeed");
            assert_eq!(parent_vec.capacity(), capacity);
            let parent_idx = parent_vec
                .safe_push_back(0xFEED)
                .expect("parent push_back should succeed");
            assert_eq!(parent_vec.at(parent_idx), Some(0xFEED));

            let status = waitpid(child, None).expect("waitpid should succeed");
            match status {
                WaitStatus::Exited(_, code) => {
                    assert_eq!(
                        code, 0,
                        "child side of the creation race should also succeed"
                    );
                }
                other => panic!("unexpected child wait status: {other:?}"),
            }

            // Whichever side actually won the exclusive create, both
            // processes must now agree on the segment's shape.
            let reopened = SharedVector::<u32>::create_or_open(&name, capacity)
                .expect("reopen after race should succeed");
            assert_eq!(reopened.capacity(), capacity);
            assert!(
                reopened.size() >= 2,
                "both racers' pushes should be visible"
            );

            parent_vec.destroy().expect("cleanup should succeed");
        }
    }
}
