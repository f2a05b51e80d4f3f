use crate::committable::{CheckpointId, CommitMessage};
use serde::{Deserialize, Serialize};

/// Everything one checkpoint contributes to the table, applied as a single unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestCommittable {
    identifier: CheckpointId,
    watermark: Option<i64>,
    messages: Vec<CommitMessage>,
}

impl ManifestCommittable {
    pub fn new(identifier: CheckpointId, watermark: Option<i64>) -> Self {
        Self {
            identifier,
            watermark,
            messages: Vec::new(),
        }
    }

    pub fn identifier(&self) -> CheckpointId {
        self.identifier
    }

    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    pub fn messages(&self) -> &[CommitMessage] {
        &self.messages
    }

    pub fn add_message(&mut self, message: CommitMessage) {
        if !message.is_empty() {
            self.messages.push(message);
        }
    }

    /// True when applying this unit would change no files.
    pub fn is_empty(&self) -> bool {
        self.messages.iter().all(CommitMessage::is_empty)
    }

    pub fn file_count(&self) -> usize {
        self.messages.iter().map(CommitMessage::file_count).sum()
    }
}
