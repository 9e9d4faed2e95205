use super::frame::FrameReader;
use super::oplog::{OpType, OplogEntry};
use super::termination::Termination;
use super::time_helper;
use crate::blocking::RestoreTarget;
use crate::error::{RestoreError, Result};
use crate::MAX_BSON_SIZE;
use bson::{Document, Timestamp};
use std::io::Read;
use tracing::{debug, info};

/// Max serialized size of one `applyOps` command: one max document plus room for the
/// command envelope.
pub const OPLOG_BATCH_CEILING: usize = MAX_BSON_SIZE + 512 * 1024;

/// Bytes of `{applyOps: []}` around the entries: document length and trailing null, the
/// array element type and key, the array length and trailing null.
const APPLY_OPS_ENVELOPE: usize = 4 + 1 + "applyOps".len() + 1 + 4 + 1 + 1;

/// Bytes taken by an entry of `size` bytes at position `index` of the `applyOps` array:
/// element type, decimal index key with its null terminator, and the entry itself.
fn array_element_size(index: usize, size: usize) -> usize {
    1 + decimal_len(index) + 1 + size
}

fn decimal_len(mut n: usize) -> usize {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}

/// Counters of one replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// entries sent to the server.
    pub applied: u64,
    /// noops, entries on server local namespaces, and entries at or after the limit.
    pub skipped: u64,
    /// `applyOps` commands issued.
    pub batches: u64,
    /// timestamp of the last applied entry.
    pub last_ts: Option<Timestamp>,
}

/// Replays a dumped oplog, in batches of atomic `applyOps` commands.
///
/// Entries are expected in timestamp order.  Any failing batch stops the replay, a gap in
/// the replayed oplog would leave the destination in a state which never existed.
pub struct OplogReplayer<'a, T: RestoreTarget + ?Sized> {
    target: &'a T,
    limit: Option<Timestamp>,
    preserve_uuid: bool,
    ceiling: usize,
    termination: Termination,
}

impl<'a, T: RestoreTarget + ?Sized> OplogReplayer<'a, T> {
    /// create a replayer which applies entries to `target`.
    pub fn new(target: &'a T) -> Self {
        OplogReplayer {
            target,
            limit: None,
            preserve_uuid: false,
            ceiling: OPLOG_BATCH_CEILING,
            termination: Termination::new(),
        }
    }

    /// only replay entries strictly before `limit`.
    pub fn with_limit(mut self, limit: Option<Timestamp>) -> Self {
        self.limit = limit;
        self
    }

    /// keep collection uuids in entries.
    pub fn with_preserve_uuid(mut self, preserve_uuid: bool) -> Self {
        self.preserve_uuid = preserve_uuid;
        self
    }

    /// Change the byte ceiling of one batch, it can't exceed [OPLOG_BATCH_CEILING].
    pub fn with_ceiling(mut self, ceiling: usize) -> Self {
        self.ceiling = ceiling.min(OPLOG_BATCH_CEILING);
        self
    }

    /// stop between entries once `termination` is raised.
    pub fn with_termination(mut self, termination: Termination) -> Self {
        self.termination = termination;
        self
    }

    /// Replay every entry read from `reader`.
    pub fn replay<R: Read>(&self, reader: &mut FrameReader<R>) -> Result<ReplayStats> {
        info!(limit = ?self.limit, "Start replaying oplog.");
        let mut stats = ReplayStats::default();
        let mut batch: Vec<Document> = vec![];
        let mut batch_size = APPLY_OPS_ENVELOPE;

        while let Some(frame) = reader.next_frame()? {
            if self.termination.is_terminated() {
                return Err(RestoreError::Terminated);
            }
            let mut entry = OplogEntry::from_frame(frame)?;
            if !self.should_apply(&entry) {
                stats.skipped += 1;
                continue;
            }
            if !self.preserve_uuid {
                entry.strip_uuid();
            }

            let size = entry.size();
            // an entry too large for any batch still goes alone.
            if !batch.is_empty()
                && batch_size + array_element_size(batch.len(), size) > self.ceiling
            {
                self.flush(&mut batch, &mut stats)?;
                batch_size = APPLY_OPS_ENVELOPE;
            }
            batch_size += array_element_size(batch.len(), size);
            stats.last_ts = Some(entry.ts);
            batch.push(entry.into_document());
        }
        self.flush(&mut batch, &mut stats)?;

        let last_applied = stats
            .last_ts
            .as_ref()
            .and_then(time_helper::to_datetime)
            .map(|t| t.to_rfc3339());
        info!(
            applied = stats.applied,
            skipped = stats.skipped,
            batches = stats.batches,
            ?last_applied,
            "Oplog replay done."
        );
        Ok(stats)
    }

    fn should_apply(&self, entry: &OplogEntry) -> bool {
        if entry.op == OpType::Noop || entry.is_skipped_namespace() {
            return false;
        }
        match &self.limit {
            Some(limit) => time_helper::ts_key(&entry.ts) < time_helper::ts_key(limit),
            None => true,
        }
    }

    fn flush(&self, batch: &mut Vec<Document>, stats: &mut ReplayStats) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let entries = std::mem::take(batch);
        let count = entries.len() as u64;
        self.target.apply_ops(entries)?;
        stats.applied += count;
        stats.batches += 1;
        debug!(count, total = stats.applied, "Applied oplog batch.");
        Ok(())
    }
}
