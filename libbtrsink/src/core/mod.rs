pub mod drive;
pub mod estimate;
pub mod local;
pub mod object;
pub mod plan;
pub mod remote;
pub mod server;

use crate::model::{Diff, Volume};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Instant;
use strum_macros::Display as StrumDisplay;
use uuid::Uuid;

/// How a store was opened. Sources open read; destinations open append, or
/// write when pruning is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
#[strum(serialize_all = "lowercase")]
pub enum StoreMode {
    Read,
    Append,
    Write,
}

impl StoreMode {
    pub fn for_destination(delete: bool) -> Self {
        if delete {
            StoreMode::Write
        } else {
            StoreMode::Append
        }
    }

    pub fn allows_receive(self) -> bool {
        !matches!(self, StoreMode::Read)
    }

    pub fn allows_delete(self) -> bool {
        matches!(self, StoreMode::Write)
    }

    pub fn flag(self) -> &'static str {
        match self {
            StoreMode::Read => "r",
            StoreMode::Append => "a",
            StoreMode::Write => "w",
        }
    }

    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "r" => Some(StoreMode::Read),
            "a" => Some(StoreMode::Append),
            "w" => Some(StoreMode::Write),
            _ => None,
        }
    }
}

/// Error kinds the transfer driver distinguishes. Everything else surfacing
/// from a backend is treated as fatal.
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("store unreachable: {0}")]
    StoreUnreachable(String),
    #[error("store opened read-only: {0}")]
    StoreReadonly(String),
    #[error("volume not found: {0}")]
    VolumeNotFound(Uuid),
    #[error("no diff path can reach volume {0}")]
    DiffUnreachable(Uuid),
    #[error("transient transfer failure: {0}")]
    TransferTransient(String),
    #[error("fatal transfer failure: {0}")]
    TransferFatal(String),
    #[error("corrupt metadata: {0}")]
    MetadataCorrupt(String),
}

impl SyncError {
    pub fn of(error: &anyhow::Error) -> Option<&SyncError> {
        error.downcast_ref::<SyncError>()
    }

    pub fn is_transient(error: &anyhow::Error) -> bool {
        matches!(Self::of(error), Some(SyncError::TransferTransient(_)))
    }
}

/// Byte counter for one in-flight transfer.
pub struct TransferProgress {
    bytes: u64,
    started: Instant,
}

impl TransferProgress {
    pub fn new() -> Self {
        Self {
            bytes: 0,
            started: Instant::now(),
        }
    }

    pub fn add(&mut self, count: u64) {
        self.bytes += count;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn describe(&self) -> String {
        let elapsed = self.started.elapsed();
        let rate = match elapsed.as_secs() {
            0 => self.bytes,
            secs => self.bytes / secs,
        };
        format!(
            "{} in {} ({}/s)",
            humanize(self.bytes),
            humantime::format_duration(std::time::Duration::from_secs(elapsed.as_secs())),
            humanize(rate)
        )
    }
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::new()
    }
}

pub fn humanize(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Receiving half of one diff transfer. Obtained from the destination store,
/// fed by the source store's sender, then finalized or aborted exactly once.
#[async_trait]
pub trait DiffSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    /// Finalize the transfer and report the volume now held by the store.
    async fn finish(self: Box<Self>) -> Result<Volume>;

    /// Tear down the transfer, leaving no visible volume behind.
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// The uniform capability set every snapshot store backend exposes.
///
/// Listings are cached per call to `list_volumes` so that edge and path
/// queries are stable within one planning round.
#[async_trait]
pub trait Store: Send {
    /// Stable identifier, used as the diff sink name and in tie-breaks.
    fn name(&self) -> &str;

    fn mode(&self) -> StoreMode;

    /// Enumerate all snapshots currently held.
    async fn list_volumes(&mut self) -> Result<Vec<Volume>>;

    /// The incremental and full diffs this store could produce for `volume`.
    /// Sizes are filled in later by the estimator.
    async fn edges(&mut self, volume: &Volume) -> Result<Vec<Diff>>;

    async fn has_volume(&mut self, uuid: Uuid) -> Result<bool>;

    /// Exact stream size for a diff. May be expensive.
    async fn measure_size(&mut self, diff: &Diff) -> Result<u64>;

    /// Cheap upper-bound-ish stream size for a diff.
    async fn estimate_size(&mut self, diff: &Diff) -> Result<u64>;

    /// Refresh per-volume size accounting used by `estimate_size`.
    async fn rescan_sizes(&mut self) -> Result<()>;

    async fn paths(&mut self, volume: &Volume) -> Result<Vec<String>>;

    /// Stream the bytes of `diff` into `sink`, updating `progress` as chunks
    /// are handed off.
    async fn send_diff(
        &mut self,
        diff: &Diff,
        sink: &mut dyn DiffSink,
        progress: &mut TransferProgress,
    ) -> Result<()>;

    /// Open a sink that will materialize `volume` via `diff`.
    async fn receive_diff(&mut self, diff: &Diff, volume: &Volume) -> Result<Box<dyn DiffSink>>;

    async fn delete_volume(&mut self, uuid: Uuid) -> Result<()>;

    /// Remove debris from receives that never finalized.
    async fn delete_partials(&mut self) -> Result<()>;

    /// Flush metadata and close sessions. Called on every exit path.
    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humanize_picks_binary_units() {
        assert_eq!(humanize(512), "512 B");
        assert_eq!(humanize(2048), "2.0 KiB");
        assert_eq!(humanize(20 * 1024 * 1024), "20.0 MiB");
    }

    #[test]
    fn destination_mode_follows_delete_flag() {
        assert_eq!(StoreMode::for_destination(false), StoreMode::Append);
        assert_eq!(StoreMode::for_destination(true), StoreMode::Write);
        assert!(!StoreMode::Read.allows_receive());
        assert!(!StoreMode::Append.allows_delete());
        assert!(StoreMode::Write.allows_delete());
    }

    #[test]
    fn mode_flags_round_trip() {
        for mode in &[StoreMode::Read, StoreMode::Append, StoreMode::Write] {
            assert_eq!(StoreMode::from_flag(mode.flag()), Some(*mode));
        }
        assert_eq!(StoreMode::from_flag("x"), None);
    }
}
