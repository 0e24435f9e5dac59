use std::collections::{HashSet, VecDeque};

use tracing::warn;

use super::PendingEntry;
use crate::driver::OperationHandle;

/// What the poller decided for one pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Still in flight; visit again on a later drain.
    Keep,
    /// Done with; drop the entry and release its handle.
    Retire,
    /// The driver no longer knows the handle; drop the entry without release.
    Invalidate,
}

/// Insertion-ordered pending entries, addressable by operation handle.
///
/// A pending entry holds a reference, so the driver cannot recycle its
/// handle. A handle recorded again while pending is therefore the same live
/// object: the older entry is dropped and its reference released, leaving
/// one entry and one outstanding reference.
#[derive(Default)]
pub(crate) struct PendingList {
    entries: VecDeque<PendingEntry>,
    index: HashSet<OperationHandle>,
}

impl PendingList {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, handle: OperationHandle) -> bool {
        self.index.contains(&handle)
    }

    /// Append an entry. Returns true when a stale entry was displaced.
    pub fn push(&mut self, entry: PendingEntry) -> bool {
        let handle = entry.handle();
        let displaced = !self.index.insert(handle);

        if displaced {
            if let Some(pos) = self.entries.iter().position(|e| e.handle() == handle) {
                if let Some(stale) = self.entries.remove(pos) {
                    warn!(
                        %handle,
                        stale_tag = %stale.tag,
                        stale_sequence = stale.sequence,
                        "handle recorded again while pending, replacing older entry"
                    );
                }
            }
        }

        self.entries.push_back(entry);
        displaced
    }

    /// Visit every entry once, in insertion order, removing the ones the
    /// visitor is done with.
    pub fn retain_with<F>(&mut self, mut visit: F)
    where
        F: FnMut(&PendingEntry) -> Disposition,
    {
        let index = &mut self.index;
        self.entries.retain_mut(|entry| match visit(entry) {
            Disposition::Keep => true,
            Disposition::Retire => {
                index.remove(&entry.handle());
                false
            }
            Disposition::Invalidate => {
                index.remove(&entry.handle());
                entry.retained.disarm();
                false
            }
        });
    }

    /// Forget every entry without releasing any handle.
    pub fn abandon_all(&mut self) {
        for mut entry in self.entries.drain(..) {
            entry.retained.disarm();
        }
        self.index.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.iter()
    }
}
