use super::CommitHook;
use crate::config::RuntimeMode;
use crate::error::{SinkError, StoreError};
use crate::store::{Snapshot, TableStore};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const BATCH_TAG_PREFIX: &str = "batch-write-";

/// Creates one tag for the final snapshot of a bounded run.
pub struct BatchTagGenerator {
    store: Arc<dyn TableStore>,
    runtime_mode: RuntimeMode,
    time_retained: Option<Duration>,
    num_retained_max: Option<usize>,
}

impl BatchTagGenerator {
    pub fn new(
        store: Arc<dyn TableStore>,
        runtime_mode: RuntimeMode,
        time_retained: Option<Duration>,
        num_retained_max: Option<usize>,
    ) -> Self {
        Self {
            store,
            runtime_mode,
            time_retained,
            num_retained_max,
        }
    }

    /// `batch-write-<yyyy-MM-dd>` for the UTC day of `time_millis`.
    pub fn tag_name(time_millis: u64) -> Result<String, SinkError> {
        let millis = i64::try_from(time_millis).map_err(|_| SinkError::TagCreation {
            name: BATCH_TAG_PREFIX.to_string(),
            reason: format!("snapshot time {time_millis} out of range"),
        })?;
        let instant = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| SinkError::TagCreation {
                name: BATCH_TAG_PREFIX.to_string(),
                reason: format!("snapshot time {time_millis} out of range"),
            })?;
        Ok(format!("{BATCH_TAG_PREFIX}{}", instant.format("%Y-%m-%d")))
    }

    fn tag_error(name: &str, err: StoreError) -> SinkError {
        SinkError::TagCreation {
            name: name.to_string(),
            reason: err.to_string(),
        }
    }

    fn expire(&self) -> Result<(), SinkError> {
        let Some(max) = self.num_retained_max else {
            return Ok(());
        };
        let mut batch_tags: Vec<_> = self
            .store
            .list_tags()
            .map_err(|err| Self::tag_error(BATCH_TAG_PREFIX, err))?
            .into_iter()
            .filter(|tag| tag.name.starts_with(BATCH_TAG_PREFIX))
            .collect();
        if batch_tags.len() <= max {
            return Ok(());
        }
        batch_tags.sort_by(|a, b| {
            a.snapshot_id
                .cmp(&b.snapshot_id)
                .then_with(|| a.name.cmp(&b.name))
        });
        let excess = batch_tags.len() - max;
        for tag in batch_tags.into_iter().take(excess) {
            match self.store.delete_tag(&tag.name) {
                Ok(()) | Err(StoreError::TagNotFound { .. }) => {
                    info!(tag = %tag.name, "expired batch tag");
                }
                Err(err) => return Err(Self::tag_error(&tag.name, err)),
            }
        }
        Ok(())
    }
}

impl CommitHook for BatchTagGenerator {
    fn name(&self) -> &'static str {
        "batch-tag-generator"
    }

    fn on_end_input(&mut self, latest: Option<&Snapshot>) -> Result<(), SinkError> {
        if self.runtime_mode != RuntimeMode::Batch {
            return Ok(());
        }
        let Some(snapshot) = latest else {
            debug!("bounded run produced no snapshot, no batch tag");
            return Ok(());
        };
        let name = Self::tag_name(snapshot.time_millis)?;
        match self.store.delete_tag(&name) {
            Ok(()) => info!(tag = %name, "replacing existing batch tag"),
            Err(StoreError::TagNotFound { .. }) => {}
            Err(err) => return Err(Self::tag_error(&name, err)),
        }
        let tag = self
            .store
            .create_tag(snapshot, &name, self.time_retained)
            .map_err(|err| Self::tag_error(&name, err))?;
        info!(tag = %tag.name, snapshot_id = tag.snapshot_id, "created batch tag");
        self.expire()
    }
}
