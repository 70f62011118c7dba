//! Slot-keyed registry of worker records.

use std::collections::BTreeMap;

use super::protocol::Slot;
use super::record::{ConnId, RecordId, WorkerRecord, WorkerStatus};
use crate::error::{PoolError, Result};

/// Which records `by_status` should yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Any,
    Only(WorkerStatus),
}

impl StatusFilter {
    fn matches(self, status: WorkerStatus) -> bool {
        match self {
            Self::Any => true,
            Self::Only(wanted) => wanted == status,
        }
    }
}

/// Exactly one record per slot, iterated in slot order.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    records: BTreeMap<Slot, WorkerRecord>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `record`. Fails if its slot is already taken.
    pub fn add(&mut self, record: WorkerRecord) -> Result<()> {
        let slot = record.slot();
        if self.records.contains_key(&slot) {
            return Err(PoolError::DuplicateSlot(slot));
        }
        self.records.insert(slot, record);
        Ok(())
    }

    /// Remove the record in `slot`, but only if it is still instance `id`.
    ///
    /// Removing a slot that is empty or already holds a newer record is a
    /// no-op, so a late crash notification cannot evict its replacement.
    pub fn remove(&mut self, slot: Slot, id: RecordId) -> Option<WorkerRecord> {
        if self.records.get(&slot).is_some_and(|r| r.id() == id) {
            self.records.remove(&slot)
        } else {
            None
        }
    }

    pub fn by_slot(&self, slot: Slot) -> Result<&WorkerRecord> {
        self.records.get(&slot).ok_or(PoolError::SlotNotFound(slot))
    }

    pub fn by_slot_mut(&mut self, slot: Slot) -> Result<&mut WorkerRecord> {
        self.records
            .get_mut(&slot)
            .ok_or(PoolError::SlotNotFound(slot))
    }

    /// Find the record registered on control connection `conn`.
    pub fn by_connection(&self, conn: ConnId) -> Result<&WorkerRecord> {
        self.records
            .values()
            .find(|r| r.connection() == Some(conn))
            .ok_or(PoolError::ConnectionNotFound(conn))
    }

    pub fn by_status(&self, filter: StatusFilter) -> impl Iterator<Item = &WorkerRecord> {
        self.records
            .values()
            .filter(move |r| filter.matches(r.status()))
    }

    /// Number of records in each status. Statuses with no records are absent.
    pub fn status_summary(&self) -> BTreeMap<WorkerStatus, usize> {
        let mut summary = BTreeMap::new();
        for record in self.records.values() {
            *summary.entry(record.status()).or_insert(0) += 1;
        }
        summary
    }

    /// Workers that have finished bootstrapping and are still in service.
    pub fn count_available(&self) -> usize {
        self.records
            .values()
            .filter(|r| matches!(r.status(), WorkerStatus::Ready | WorkerStatus::Busy))
            .count()
    }

    /// Lowest-numbered slot that is idle.
    pub fn first_ready(&self) -> Option<Slot> {
        self.by_status(StatusFilter::Only(WorkerStatus::Ready))
            .next()
            .map(WorkerRecord::slot)
    }

    pub fn slots(&self) -> Vec<Slot> {
        self.records.keys().copied().collect()
    }

    pub fn contains(&self, slot: Slot) -> bool {
        self.records.contains_key(&slot)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.records.values()
    }
}
