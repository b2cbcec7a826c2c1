//! Bounded pool of numbered runner slots for a single host.
//!
//! One `Slot` ties a dense index `0..N-1` to the microVM currently bound
//! to it. Acquire/release is guarded by a single `parking_lot::Mutex`:
//! this workspace reaches for `parking_lot` over `std::sync::Mutex`
//! everywhere a lock is held only briefly and never across an `.await`.

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const UID_LEN: usize = 6;

fn generate_uid() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(UID_LEN)
        .map(char::from)
        .collect()
}

struct Slot {
    id: usize,
    uid: String,
    in_use: bool,
    cancel: Option<CancellationToken>,
}

impl Slot {
    fn empty(id: usize) -> Self {
        Self {
            id,
            uid: String::new(),
            in_use: false,
            cancel: None,
        }
    }
}

/// A live reservation returned by `SlotPool::next`. Holding one implies
/// `in_use == true` for `id()` in the owning pool until `free` is called
/// with that id.
#[derive(Debug, Clone)]
pub struct SlotHandle {
    id: usize,
    uid: String,
}

impl SlotHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Runner-name this slot's tenant should register under, given the
    /// host's own name.
    pub fn runner_name(&self, hostname: &str) -> String {
        ci_broker_types::make_runner_name(hostname, &self.uid)
    }
}

/// Ordered sequence of N slots plus an exclusion lock. See the module
/// docs for the locking discipline.
pub struct SlotPool {
    slots: Mutex<Vec<Slot>>,
    scratch_root: PathBuf,
}

impl SlotPool {
    pub fn new(num_slots: usize, scratch_root: impl Into<PathBuf>) -> Self {
        let slots = (0..num_slots).map(Slot::empty).collect();
        Self {
            slots: Mutex::new(slots),
            scratch_root: scratch_root.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-slot scratch directory used to name on-disk artifacts for the
    /// current tenancy. Does not create the directory; callers that need
    /// it to exist are responsible for that.
    pub fn scratch_dir(&self, id: usize) -> PathBuf {
        self.scratch_root.join(format!("slot-{id}"))
    }

    /// Linear scan for the first free slot, lowest index first. On
    /// success, marks it in-use with a freshly generated uid and returns
    /// a handle. Never blocks beyond acquiring the pool mutex.
    pub fn next(&self) -> Option<SlotHandle> {
        let mut slots = self.slots.lock();
        let slot = slots.iter_mut().find(|s| !s.in_use)?;
        slot.in_use = true;
        slot.uid = generate_uid();
        debug!(id = slot.id, uid = %slot.uid, "slot acquired");
        Some(SlotHandle {
            id: slot.id,
            uid: slot.uid.clone(),
        })
    }

    /// Attach a cancellation token to a slot that is already in use. Only
    /// meaningful between `next()` returning and the corresponding
    /// `free()`; a no-op if the slot has since been freed or reused.
    pub fn set_cancel(&self, handle: &SlotHandle, cancel: CancellationToken) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(handle.id) {
            if slot.in_use && slot.uid == handle.uid {
                slot.cancel = Some(cancel);
            }
        }
    }

    /// Release a slot. Invokes its cancel handle if present, removes its
    /// scratch directory, clears `uid`/`cancel`, and sets `in_use =
    /// false`. Idempotent: calling this twice for the same id (or for an
    /// id that was never acquired) is a no-op the second time.
    pub fn free(&self, id: usize) {
        let (cancel, scratch) = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(id) else {
                return;
            };
            if !slot.in_use {
                return;
            }
            let cancel = slot.cancel.take();
            slot.in_use = false;
            slot.uid.clear();
            (cancel, self.scratch_root.join(format!("slot-{id}")))
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        remove_scratch_dir(&scratch);
        debug!(id, "slot released");
    }

    /// Number of slots currently in use. Exposed for `/status`.
    pub fn in_use_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.in_use).count()
    }
}

fn remove_scratch_dir(path: &Path) {
    if let Err(err) = std::fs::remove_dir_all(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), %err, "failed to remove slot scratch directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturation_and_reacquire() {
        let pool = SlotPool::new(2, std::env::temp_dir().join("ci-broker-slots-test"));

        let a = pool.next().expect("slot 0");
        let b = pool.next().expect("slot 1");
        assert_ne!(a.id(), b.id());
        assert!(pool.next().is_none());

        let old_uid = a.uid().to_string();
        pool.free(a.id());
        assert_eq!(pool.in_use_count(), 1);

        let reacquired = pool.next().expect("slot 0 again");
        assert_eq!(reacquired.id(), a.id());
        assert_ne!(reacquired.uid(), old_uid);
    }

    #[test]
    fn free_is_idempotent() {
        let pool = SlotPool::new(1, std::env::temp_dir().join("ci-broker-slots-test2"));
        let handle = pool.next().unwrap();
        pool.free(handle.id());
        pool.free(handle.id());
        assert_eq!(pool.in_use_count(), 0);
        assert!(pool.next().is_some());
    }

    #[test]
    fn free_cancels_and_clears() {
        let pool = SlotPool::new(1, std::env::temp_dir().join("ci-broker-slots-test3"));
        let handle = pool.next().unwrap();
        let token = CancellationToken::new();
        pool.set_cancel(&handle, token.clone());
        assert!(!token.is_cancelled());
        pool.free(handle.id());
        assert!(token.is_cancelled());
    }

    #[test]
    fn lowest_index_first() {
        let pool = SlotPool::new(3, std::env::temp_dir().join("ci-broker-slots-test4"));
        let first = pool.next().unwrap();
        assert_eq!(first.id(), 0);
        pool.free(first.id());
        let second = pool.next().unwrap();
        assert_eq!(second.id(), 0);
    }
}
