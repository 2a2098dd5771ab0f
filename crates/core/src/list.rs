//! Doubly linked list overlay: a ring of vector slots linked by index,
//! with slot 0 reserved as a sentinel. All compound operations take the
//! underlying vector's lock for their own duration; a per-process cursor
//! supports the fluent `head()/tail()/next()/prev()` navigation API.

use crate::error::ShmResult;
use crate::vector::{SharedVector, ShmPod};

const SENTINEL: usize = 0;

/// On-segment layout of one list node: its own index (for
/// cross-checking against the slot it's read from), ring neighbours,
/// and the user payload.
#[repr(C)]
#[derive(Clone, Copy)]
struct ListNode<T> {
    idx: usize,
    next_idx: usize,
    prev_idx: usize,
    data: T,
}

unsafe impl<T: ShmPod> ShmPod for ListNode<T> {}

fn zeroed<T: ShmPod>() -> T {
    // SAFETY: `ShmPod` guarantees the all-zero bit pattern is a valid value.
    unsafe { std::mem::zeroed() }
}

/// Where a list handle's cursor currently points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    AtSentinel,
    AtLive,
    /// The slot the cursor names was deleted by another process since
    /// this handle last looked. Only observable by a caller that peeked
    /// the cursor after releasing the lock; this is treated as
    /// caller error rather than something the list recovers from.
    Dangling,
}

/// A doubly linked list whose nodes each live in one [`SharedVector`]
/// slot, with slot 0 reserved as the ring's sentinel.
pub struct SharedList<T: ShmPod> {
    vector: SharedVector<ListNode<T>>,
    cur_idx: usize,
}

impl<T: ShmPod> SharedList<T> {
    /// Create or attach to a named list with room for `capacity` user
    /// elements (the backing vector is sized `capacity + 1` for the
    /// sentinel). Sentinel insertion is idempotent across processes:
    /// only the first opener to observe an inactive slot 0 writes it.
    pub fn create_or_open(name: &str, capacity: usize) -> ShmResult<Self> {
        let vector = SharedVector::<ListNode<T>>::create_or_open(name, capacity + 1)?;
        {
            let _guard = vector.lock()?;
            if vector.at(SENTINEL).is_none() {
                vector.insert_at(
                    SENTINEL,
                    ListNode {
                        idx: SENTINEL,
                        next_idx: SENTINEL,
                        prev_idx: SENTINEL,
                        data: zeroed(),
                    },
                )?;
            }
        }
        Ok(Self {
            vector,
            cur_idx: SENTINEL,
        })
    }

    /// `length == active_count - 1`; the sentinel is never user-visible.
    pub fn length(&self) -> usize {
        self.vector.size().saturating_sub(1)
    }

    /// True when the sentinel's `next_idx` loops back to itself.
    pub fn is_empty(&self) -> bool {
        self.sentinel().next_idx == SENTINEL
    }

    fn sentinel(&self) -> ListNode<T> {
        self.vector
            .at(SENTINEL)
            .expect("sentinel is written at list creation and never deleted")
    }

    fn node(&self, idx: usize) -> Option<ListNode<T>> {
        let node = self.vector.at(idx)?;
        debug_assert_eq!(
            node.idx, idx,
            "list node stored at a slot other than its own index"
        );
        Some(node)
    }

    /// Append `e` at the tail (immediately before the sentinel), moving
    /// the cursor to the new node. Fails if the vector is full.
    pub fn add_tail(&mut self, e: T) -> ShmResult<usize> {
        let _guard = self.vector.lock()?;
        let idx = self.vector.insert_quick()?;
        let mut sentinel = self.sentinel();
        let old_tail = sentinel.prev_idx;
        self.vector.insert_at(
            idx,
            ListNode {
                idx,
                next_idx: SENTINEL,
                prev_idx: old_tail,
                data: e,
            },
        )?;
        if old_tail == SENTINEL {
            sentinel.next_idx = idx;
        } else {
            let mut tail_node = self
                .node(old_tail)
                .expect("tail index tracked by sentinel is always live");
            tail_node.next_idx = idx;
            self.vector.insert_at(old_tail, tail_node)?;
        }
        sentinel.prev_idx = idx;
        self.vector.insert_at(SENTINEL, sentinel)?;
        self.cur_idx = idx;
        Ok(idx)
    }

    /// Splice `cursor` out of the ring and free its slot; a no-op,
    /// successful, if `cursor` already names the sentinel.
    pub fn del(&mut self, cursor: usize) -> ShmResult<()> {
        let _guard = self.vector.lock()?;
        if let Some(next) = self.del_locked(cursor)? {
            if self.cur_idx == cursor {
                self.cur_idx = next;
            }
        }
        Ok(())
    }

    /// Splice `cursor` out of the ring and free its slot. Returns the
    /// node's former successor (for a caller that wants to advance a
    /// cursor sitting on the deleted slot), or `None` if `cursor` named
    /// the sentinel or an already-inactive slot.
    ///
    /// Takes `&self` rather than `&mut self` so it composes with a live
    /// `self.vector.lock()` guard held across the call; callers update
    /// `self.cur_idx` themselves afterwards.
    fn del_locked(&self, cursor: usize) -> ShmResult<Option<usize>> {
        if cursor == SENTINEL {
            return Ok(None);
        }
        let node = match self.node(cursor) {
            Some(n) => n,
            None => return Ok(None),
        };
        self.relink(node.prev_idx, node.next_idx)?;
        self.vector.del(cursor);
        Ok(Some(node.next_idx))
    }

    /// Point `prev`'s next and `next`'s prev at each other, correctly
    /// even when `prev == next` (the one-element-list case, where both
    /// neighbours are the sentinel): the second read observes the first
    /// write's result, so the final state is consistent either way.
    fn relink(&self, prev: usize, next: usize) -> ShmResult<()> {
        let mut prev_node = self
            .node(prev)
            .expect("ring neighbour of a live node is always live");
        prev_node.next_idx = next;
        self.vector.insert_at(prev, prev_node)?;
        let mut next_node = self
            .node(next)
            .expect("ring neighbour of a live node is always live");
        next_node.prev_idx = prev;
        self.vector.insert_at(next, next_node)?;
        Ok(())
    }

    /// Move the cursor to the head (the sentinel, for an empty list) and
    /// return `self` for fluent chaining.
    pub fn head(&mut self) -> &mut Self {
        self.cur_idx = self.sentinel().next_idx;
        self
    }

    /// Move the cursor to the tail (the sentinel, for an empty list).
    pub fn tail(&mut self) -> &mut Self {
        self.cur_idx = self.sentinel().prev_idx;
        self
    }

    /// Advance the cursor to the current node's successor.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> &mut Self {
        if let Some(node) = self.node(self.cur_idx) {
            self.cur_idx = node.next_idx;
        }
        self
    }

    /// Move the cursor to the current node's predecessor.
    pub fn prev(&mut self) -> &mut Self {
        if let Some(node) = self.node(self.cur_idx) {
            self.cur_idx = node.prev_idx;
        }
        self
    }

    /// The cursor's current slot index.
    pub fn cursor(&self) -> usize {
        self.cur_idx
    }

    /// Payload at the current cursor slot, or `None` at the sentinel or
    /// a dangling cursor.
    pub fn get_data(&self) -> Option<T> {
        if self.cur_idx == SENTINEL {
            return None;
        }
        self.node(self.cur_idx).map(|n| n.data)
    }

    /// Cursor liveness, for callers that peeked a cursor without holding
    /// the lock.
    pub fn cursor_state(&self) -> CursorState {
        if self.cur_idx == SENTINEL {
            CursorState::AtSentinel
        } else if self.node(self.cur_idx).is_some() {
            CursorState::AtLive
        } else {
            CursorState::Dangling
        }
    }

    /// Splice out and return the head element, or `None` if the list is
    /// empty.
    pub fn extract_head(&mut self) -> ShmResult<Option<T>> {
        let _guard = self.vector.lock()?;
        let head = self.sentinel().next_idx;
        if head == SENTINEL {
            return Ok(None);
        }
        let data = self
            .node(head)
            .expect("head index tracked by sentinel is always live")
            .data;
        if let Some(next) = self.del_locked(head)? {
            if self.cur_idx == head {
                self.cur_idx = next;
            }
        }
        Ok(Some(data))
    }

    /// Walk from the head; on the first node where `cmp` returns `true`,
    /// splice it out and return its payload.
    pub fn extract_first_match(&mut self, mut cmp: impl FnMut(&T) -> bool) -> ShmResult<Option<T>> {
        let _guard = self.vector.lock()?;
        let mut idx = self.sentinel().next_idx;
        while idx != SENTINEL {
            let node = self.node(idx).expect("ring walk only visits live nodes");
            if cmp(&node.data) {
                if let Some(next) = self.del_locked(idx)? {
                    if self.cur_idx == idx {
                        self.cur_idx = next;
                    }
                }
                return Ok(Some(node.data));
            }
            idx = node.next_idx;
        }
        Ok(None)
    }

    /// First pass: walk the ring head-to-tail recording up to `n_max`
    /// matching indices. Second pass: copy each match's payload and free
    /// its slot. Returns the matches in head-to-tail order; empty iff
    /// nothing matched.
    pub fn extract_n_matches(
        &mut self,
        n_max: usize,
        mut cmp: impl FnMut(&T) -> bool,
    ) -> ShmResult<Vec<T>> {
        let _guard = self.vector.lock()?;
        let mut matches = Vec::new();
        let mut idx = self.sentinel().next_idx;
        while idx != SENTINEL && matches.len() < n_max {
            let node = self.node(idx).expect("ring walk only visits live nodes");
            if cmp(&node.data) {
                matches.push(idx);
            }
            idx = node.next_idx;
        }
        let mut out = Vec::with_capacity(matches.len());
        for idx in matches {
            let data = self
                .node(idx)
                .expect("recorded match is still live under the held lock")
                .data;
            if let Some(next) = self.del_locked(idx)? {
                if self.cur_idx == idx {
                    self.cur_idx = next;
                }
            }
            out.push(data);
        }
        Ok(out)
    }
}
