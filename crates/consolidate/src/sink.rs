//! Transactional destination for consolidated state.

use crate::audit::{AuditEntry, AuditLog};
use crate::backup::Snapshot;
use crate::error::ConsolidateError;
use crate::model::{ChangeEntry, Entity, FactRecord};

/// Writes between `begin` and `commit` must become visible all at once or not at all.
pub trait Sink {
    fn begin(&mut self) -> Result<(), ConsolidateError>;
    fn write_entities(&mut self, entities: &[Entity]) -> Result<(), ConsolidateError>;
    fn write_facts(&mut self, facts: &[FactRecord]) -> Result<(), ConsolidateError>;
    fn write_changes(&mut self, changes: &[ChangeEntry]) -> Result<(), ConsolidateError>;
    fn write_audit(&mut self, entries: &[AuditEntry]) -> Result<(), ConsolidateError>;
    fn commit(&mut self) -> Result<(), ConsolidateError>;
    fn rollback(&mut self) -> Result<(), ConsolidateError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkState {
    pub entities: Vec<Entity>,
    pub facts: Vec<FactRecord>,
    pub changes: Vec<ChangeEntry>,
    pub audit: Vec<AuditEntry>,
}

/// In-memory sink used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    committed: SinkState,
    staged: Option<SinkState>,
    commits: usize,
    rollbacks: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing committed state.
    pub fn with_state(state: SinkState) -> Self {
        Self {
            committed: state,
            ..Self::default()
        }
    }

    pub fn committed(&self) -> &SinkState {
        &self.committed
    }

    pub fn in_transaction(&self) -> bool {
        self.staged.is_some()
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks
    }

    fn staged(&mut self) -> Result<&mut SinkState, ConsolidateError> {
        self.staged
            .as_mut()
            .ok_or_else(|| ConsolidateError::Sink("write outside a transaction".into()))
    }
}

impl Sink for MemorySink {
    fn begin(&mut self) -> Result<(), ConsolidateError> {
        if self.staged.is_some() {
            return Err(ConsolidateError::Sink("transaction already open".into()));
        }
        self.staged = Some(self.committed.clone());
        Ok(())
    }

    fn write_entities(&mut self, entities: &[Entity]) -> Result<(), ConsolidateError> {
        self.staged()?.entities = entities.to_vec();
        Ok(())
    }

    fn write_facts(&mut self, facts: &[FactRecord]) -> Result<(), ConsolidateError> {
        self.staged()?.facts = facts.to_vec();
        Ok(())
    }

    fn write_changes(&mut self, changes: &[ChangeEntry]) -> Result<(), ConsolidateError> {
        self.staged()?.changes.extend_from_slice(changes);
        Ok(())
    }

    fn write_audit(&mut self, entries: &[AuditEntry]) -> Result<(), ConsolidateError> {
        self.staged()?.audit.extend_from_slice(entries);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ConsolidateError> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| ConsolidateError::Sink("commit without begin".into()))?;
        self.committed = staged;
        self.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), ConsolidateError> {
        self.staged = None;
        self.rollbacks += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// One run's mutating phase. Owns the sink borrow, the snapshot and the
/// audit log; dropping it without `commit` or `rollback` rolls the sink back.
pub struct Transaction<'s> {
    sink: &'s mut dyn Sink,
    snapshot: Snapshot,
    audit: AuditLog,
    finished: bool,
}

impl<'s> Transaction<'s> {
    pub fn begin(sink: &'s mut dyn Sink, snapshot: Snapshot) -> Result<Self, ConsolidateError> {
        sink.begin()?;
        log::debug!("transaction opened for snapshot {}", snapshot.id());
        Ok(Self {
            sink,
            snapshot,
            audit: AuditLog::new(),
            finished: false,
        })
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn audit_mut(&mut self) -> &mut AuditLog {
        &mut self.audit
    }

    /// Hand the consolidated state to the sink (still uncommitted).
    pub fn stage(
        &mut self,
        entities: &[Entity],
        facts: &[FactRecord],
        changes: &[ChangeEntry],
    ) -> Result<(), ConsolidateError> {
        self.sink.write_entities(entities)?;
        self.sink.write_facts(facts)?;
        self.sink.write_changes(changes)
    }

    /// Write the audit trail and commit. Returns the audit entries.
    pub fn commit(mut self) -> Result<Vec<AuditEntry>, ConsolidateError> {
        self.sink.write_audit(self.audit.entries())?;
        self.sink.commit()?;
        self.finished = true;
        log::info!("committed {} audit entr(ies)", self.audit.len());
        Ok(std::mem::take(&mut self.audit).into_entries())
    }

    pub fn rollback(mut self) -> Result<(), ConsolidateError> {
        self.finished = true;
        log::warn!(
            "rolling back; snapshot {} is authoritative ({} audit entr(ies) discarded)",
            self.snapshot.id(),
            self.audit.len()
        );
        self.sink.rollback()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        log::warn!("transaction dropped unfinished; rolling back");
        if let Err(e) = self.sink.rollback() {
            log::error!("rollback failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditOp;

    #[test]
    fn commit_publishes_staged_state() {
        let mut sink = MemorySink::new();
        let snapshot = Snapshot::capture(&[Entity::new("8d0d", "Nintendo Switch")], &[]);
        let id = snapshot.id().to_string();
        let mut tx = Transaction::begin(&mut sink, snapshot).unwrap();
        assert_eq!(tx.snapshot().id(), id);
        assert_eq!(tx.snapshot().entities().len(), 1);
        tx.stage(&[Entity::new("e682", "Nintendo Switch")], &[], &[]).unwrap();
        tx.audit_mut().record(AuditOp::RemoveEntityRow, "8d0d", "name", "Nintendo Switch", "e682");
        let entries = tx.commit().unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(sink.commits(), 1);
        assert!(!sink.in_transaction());
        assert_eq!(sink.committed().entities.len(), 1);
        assert_eq!(sink.committed().audit.len(), 1);
    }

    #[test]
    fn rollback_discards_staged_state() {
        let before = SinkState {
            entities: vec![Entity::new("8d0d", "Nintendo Switch")],
            ..SinkState::default()
        };
        let mut sink = MemorySink::with_state(before.clone());
        let mut tx = Transaction::begin(&mut sink, Snapshot::capture(&before.entities, &[])).unwrap();
        tx.stage(&[], &[], &[]).unwrap();
        tx.rollback().unwrap();

        assert_eq!(sink.committed(), &before);
        assert_eq!(sink.rollbacks(), 1);
    }

    #[test]
    fn dropping_unfinished_transaction_rolls_back() {
        let mut sink = MemorySink::new();
        {
            let mut tx = Transaction::begin(&mut sink, Snapshot::capture(&[], &[])).unwrap();
            tx.stage(&[Entity::new("a", "A")], &[], &[]).unwrap();
        }
        assert!(!sink.in_transaction());
        assert_eq!(sink.rollbacks(), 1);
        assert!(sink.committed().entities.is_empty());
    }

    #[test]
    fn writes_outside_transaction_fail() {
        let mut sink = MemorySink::new();
        assert!(matches!(sink.write_entities(&[]), Err(ConsolidateError::Sink(_))));
        assert!(matches!(sink.commit(), Err(ConsolidateError::Sink(_))));
    }
}
