use super::ManifestCommittable;
use crate::committable::CheckpointId;
use crate::error::SinkError;
use crate::gate::CheckpointBarrier;
use crate::store::Snapshot;

/// Side effect attached to the global committer.
///
/// Hooks run on the committer's thread. Errors for which
/// [`SinkError::is_fatal`] is false are reported but never undo a commit.
pub trait CommitHook: Send {
    fn name(&self) -> &'static str;

    /// Called once a barrier has aligned, before its checkpoint is committed.
    fn on_checkpoint(&mut self, _barrier: &CheckpointBarrier) {}

    fn on_checkpoint_aborted(&mut self, _checkpoint_id: CheckpointId) -> Result<(), SinkError> {
        Ok(())
    }

    fn pre_commit(&mut self, _committable: &ManifestCommittable) -> Result<(), SinkError> {
        Ok(())
    }

    /// Called after `committable` became durable as `snapshot`.
    fn post_commit(
        &mut self,
        _committable: &ManifestCommittable,
        _snapshot: &Snapshot,
    ) -> Result<(), SinkError> {
        Ok(())
    }

    /// Called once `checkpoint_id` concluded, whether or not it produced a snapshot.
    fn on_checkpoint_committed(&mut self, _checkpoint_id: CheckpointId) {}

    /// Called when every upstream producer finished and the final commit concluded.
    fn on_end_input(&mut self, _latest: Option<&Snapshot>) -> Result<(), SinkError> {
        Ok(())
    }
}
