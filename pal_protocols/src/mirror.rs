//! Per-listener memory-map mirror.
//!
//! The mirror is the ground truth for client requests between orchestrator
//! sync cycles. Reads are served from the snapshot; writes are validated
//! against it and buffered in a pending list that the orchestrator drains
//! atomically at the next sync. Pending writes never mutate the visible
//! snapshot — a client write becomes readable only after it has round-
//! tripped through the device (exactly one sync cycle).

use std::sync::Arc;

use parking_lot::Mutex;

use pal_common::memory::{AddressKey, AddressSpace, MapDelta, MemoryMapSnapshot, Value};

/// Why a queued write was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteReject {
    /// Address not mapped on this device.
    Unmapped,
    /// Address space is read-only to external clients.
    NotWritable,
}

#[derive(Debug, Default)]
struct MirrorInner {
    snap: MemoryMapSnapshot,
    pending: MapDelta,
}

/// Shared handle to one listener's mirror.
#[derive(Debug, Clone, Default)]
pub struct SharedMirror {
    inner: Arc<Mutex<MirrorInner>>,
}

impl SharedMirror {
    /// Create a mirror seeded with an initial device snapshot.
    pub fn new(snapshot: MemoryMapSnapshot) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MirrorInner {
                snap: snapshot,
                pending: Vec::new(),
            })),
        }
    }

    /// Replace the visible snapshot (orchestrator push).
    pub fn push(&self, snapshot: MemoryMapSnapshot) {
        self.inner.lock().snap = snapshot;
    }

    /// Drain the pending client writes (orchestrator pull).
    pub fn take_pending(&self) -> MapDelta {
        std::mem::take(&mut self.inner.lock().pending)
    }

    /// Pending writes count (diagnostics/tests).
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Read a bit range from the snapshot; `None` when any index is
    /// unmapped or the space is not a bit space.
    pub fn read_bits(&self, space: AddressSpace, start: u16, count: u16) -> Option<Vec<bool>> {
        self.inner.lock().snap.read_bits(space, start, count)
    }

    /// Read a word range from the snapshot; `None` when any index is
    /// unmapped or the space is not a word space.
    pub fn read_words(&self, space: AddressSpace, start: u16, count: u16) -> Option<Vec<u16>> {
        self.inner.lock().snap.read_words(space, start, count)
    }

    /// Validate one write against the snapshot without queueing.
    pub fn check_write(&self, key: AddressKey) -> Result<(), WriteReject> {
        let inner = self.inner.lock();
        check(&inner.snap, key)
    }

    /// Validate and queue a batch of writes atomically: either the whole
    /// batch is queued or none of it is. The mirror is locked per batch,
    /// not per value.
    pub fn queue_writes(&self, writes: &[(AddressKey, Value)]) -> Result<(), WriteReject> {
        let mut inner = self.inner.lock();
        for (key, _) in writes {
            check(&inner.snap, *key)?;
        }
        inner.pending.extend_from_slice(writes);
        Ok(())
    }
}

fn check(snap: &MemoryMapSnapshot, key: AddressKey) -> Result<(), WriteReject> {
    if !key.space.external_writable() {
        return Err(WriteReject::NotWritable);
    }
    if !snap.is_mapped(key) {
        return Err(WriteReject::Unmapped);
    }
    Ok(())
}
