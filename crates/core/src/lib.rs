//! Inter-process shared-memory data structures: a cross-process mutex, a
//! fixed-capacity slotted vector, a doubly linked list overlay, and a
//! refcounted composite-keyed counter set overlay.
//!
//! Every participating process maps the same POSIX shared-memory segment
//! and mutates the same bytes; there is no central server and no
//! in-process synchronisation assumption. See [`mutex`] for the lock
//! primitive everything else is built on, [`vector`] for the slotted
//! array all higher layers consume, and [`list`]/[`counter`] for the two
//! overlays.

pub mod counter;
pub mod error;
pub mod list;
pub mod mutex;
pub mod vector;

pub use error::{ShmError, ShmResult};
pub use list::SharedList;
pub use mutex::{ShmMutex, ShmMutexGuard};
pub use vector::{SharedVector, ShmPod};
