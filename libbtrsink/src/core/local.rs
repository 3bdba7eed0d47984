use super::{DiffSink, Store, StoreMode, SyncError, TransferProgress};
use crate::model::{Diff, Volume};
use crate::parsing::StoreUri;
use crate::sys::btrfs::{self, QgroupUsage, Subvolume};
use crate::sys::fs::{find_mountentry, BtrfsMountEntry, StoreLock};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

const LOCK_FILE: &str = ".btrsink.lock";
const READ_BUFFER: usize = 256 * 1024;

/// A directory of snapshots on a mounted btrfs filesystem.
pub struct LocalStore {
    name: String,
    mode: StoreMode,
    /// Where the filesystem is mounted.
    mountpoint: PathBuf,
    /// The mounted subvolume's path within the filesystem tree.
    mount_tree_path: PathBuf,
    /// The snapshot container, relative to the filesystem tree root.
    tree_prefix: PathBuf,
    /// The snapshot container as an absolute path.
    container: PathBuf,
    /// Restricts the store to one snapshot (locator without trailing slash).
    snapshot: Option<String>,
    subvols: Vec<Subvolume>,
    sizes: HashMap<Uuid, QgroupUsage>,
    _lock: Option<StoreLock>,
}

impl LocalStore {
    pub fn open(uri: &StoreUri, mode: StoreMode) -> Result<Self> {
        let (dir, snapshot) = uri.split_snapshot();
        let container = PathBuf::from(&dir);
        if !container.is_dir() {
            return Err(anyhow!(SyncError::StoreUnreachable(format!(
                "{} is not a directory",
                dir
            ))));
        }
        let container = container
            .canonicalize()
            .map_err(|e| anyhow!(SyncError::StoreUnreachable(format!("{}: {}", dir, e))))?;

        let mountentry = find_mountentry(&container).ok_or_else(|| {
            anyhow!(SyncError::StoreUnreachable(format!("no filesystem mounted at {}", dir)))
        })?;
        let mountpoint = mountentry.file.clone();
        let btrfs_entry = BtrfsMountEntry::try_from(mountentry)
            .map_err(|e| anyhow!(SyncError::StoreUnreachable(format!("{:#}", e))))?;
        let mount_tree_path = btrfs_entry.fstree_path();
        let tree_prefix = mount_tree_path.join(
            container
                .strip_prefix(&mountpoint)
                .expect("container is below its own mountpoint"),
        );

        let lock = if mode.allows_receive() {
            Some(StoreLock::acquire(&container.join(LOCK_FILE)).context("destination store is busy")?)
        } else {
            None
        };

        Ok(Self {
            name: uri.to_string(),
            mode,
            mountpoint,
            mount_tree_path,
            tree_prefix,
            container,
            snapshot,
            subvols: Vec::new(),
            sizes: HashMap::new(),
            _lock: lock,
        })
    }

    fn refresh(&mut self) -> Result<()> {
        let snapshot = self.snapshot.clone();
        self.subvols = Subvolume::list_snapshots(&self.container)?
            .into_iter()
            .filter(|s| s.path.starts_with(&self.tree_prefix))
            .filter(|s| match &snapshot {
                Some(name) => s.path.file_name().map(|f| f == name.as_str()).unwrap_or(false),
                None => true,
            })
            .collect();
        Ok(())
    }

    fn ensure_listed(&mut self) -> Result<()> {
        if self.subvols.is_empty() {
            self.refresh()?;
        }
        Ok(())
    }

    fn subvol_by_identity(&self, uuid: Uuid) -> Option<&Subvolume> {
        self.subvols
            .iter()
            .find(|s| s.uuid == uuid || s.received_uuid == Some(uuid))
    }

    /// Absolute path of a listed subvolume. Listing paths are relative to
    /// the filesystem tree root, the mount may not be.
    fn abs_path(&self, subvol: &Subvolume) -> Result<PathBuf> {
        subvol
            .path
            .strip_prefix(&self.mount_tree_path)
            .map(|rel| rel.as_pathbuf(&self.mountpoint))
    }

    fn store_relative(&self, subvol: &Subvolume) -> String {
        subvol
            .path
            .strip_prefix(&self.tree_prefix)
            .map(|rel| rel.to_string_lossy())
            .unwrap_or_else(|_| subvol.path.to_string_lossy())
    }

    fn to_volume(&self, subvol: &Subvolume) -> Volume {
        Volume {
            uuid: subvol.uuid,
            parent_uuid: subvol.parent_uuid,
            received_uuid: subvol.received_uuid,
            otime: subvol.otime,
            size: self.sizes.get(&subvol.uuid).map(|u| u.exclusive).unwrap_or(0),
            paths: vec![self.store_relative(subvol)],
        }
    }

    #[cfg(test)]
    fn for_test(name: &str, mode: StoreMode, subvols: Vec<Subvolume>, sizes: HashMap<Uuid, QgroupUsage>) -> Self {
        Self {
            name: name.to_string(),
            mode,
            mountpoint: PathBuf::from("/mnt/data"),
            mount_tree_path: PathBuf::new(),
            tree_prefix: PathBuf::from("snaps"),
            container: PathBuf::from("/mnt/data/snaps"),
            snapshot: None,
            subvols,
            sizes,
            _lock: None,
        }
    }
}

#[async_trait]
impl Store for LocalStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> StoreMode {
        self.mode
    }

    async fn list_volumes(&mut self) -> Result<Vec<Volume>> {
        self.refresh()?;
        let volumes = self.subvols.iter().map(|s| self.to_volume(s)).collect();
        Ok(volumes)
    }

    async fn edges(&mut self, volume: &Volume) -> Result<Vec<Diff>> {
        self.ensure_listed()?;
        let subvol = match self.subvol_by_identity(volume.uuid) {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };

        let mut edges = vec![Diff {
            to_uuid: volume.uuid,
            from_uuid: None,
            sink: self.name.clone(),
            size: self.sizes.get(&subvol.uuid).map(|u| u.referenced).unwrap_or(0),
            exact: false,
        }];

        // One incremental edge per ancestor reachable through local parent
        // metadata, guarded against corrupt parent loops.
        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut current = subvol;
        while let Some(parent_uuid) = current.parent_uuid {
            if !visited.insert(parent_uuid) {
                slog_scope::warn!("parent loop in subvolume metadata at {}", parent_uuid);
                break;
            }
            match self.subvol_by_identity(parent_uuid) {
                Some(parent) => {
                    edges.push(Diff {
                        to_uuid: volume.uuid,
                        from_uuid: Some(parent_uuid),
                        sink: self.name.clone(),
                        size: self.sizes.get(&subvol.uuid).map(|u| u.exclusive).unwrap_or(0),
                        exact: false,
                    });
                    current = parent;
                }
                None => break,
            }
        }

        Ok(edges)
    }

    async fn has_volume(&mut self, uuid: Uuid) -> Result<bool> {
        self.ensure_listed()?;
        Ok(self.subvol_by_identity(uuid).is_some())
    }

    async fn measure_size(&mut self, diff: &Diff) -> Result<u64> {
        self.ensure_listed()?;
        let to = self
            .subvol_by_identity(diff.to_uuid)
            .ok_or_else(|| anyhow!(SyncError::VolumeNotFound(diff.to_uuid)))?;
        let to_path = self.abs_path(to)?;
        let parent_path = match diff.from_uuid {
            Some(from) => Some(
                self.abs_path(
                    self.subvol_by_identity(from)
                        .ok_or_else(|| anyhow!(SyncError::VolumeNotFound(from)))?,
                )?,
            ),
            None => None,
        };
        btrfs::measure_snapshot(&to_path, parent_path.as_deref())
            .measure()
            .await
            .context(format!("failed to measure {}", diff))
    }

    async fn estimate_size(&mut self, diff: &Diff) -> Result<u64> {
        self.ensure_listed()?;
        let to = self
            .subvol_by_identity(diff.to_uuid)
            .ok_or_else(|| anyhow!(SyncError::VolumeNotFound(diff.to_uuid)))?;
        let usage = self.sizes.get(&to.uuid).copied().unwrap_or_default();
        Ok(match diff.from_uuid {
            Some(_) => usage.exclusive,
            None => usage.referenced,
        })
    }

    async fn rescan_sizes(&mut self) -> Result<()> {
        self.ensure_listed()?;
        if let Err(error) = btrfs::quota_rescan(&self.container) {
            slog_scope::warn!("quota rescan failed, estimates degrade: {:#}", error);
            return Ok(());
        }
        match btrfs::qgroup_usage(&self.container) {
            Ok(by_id) => {
                self.sizes = self
                    .subvols
                    .iter()
                    .filter_map(|s| by_id.get(&s.id).map(|usage| (s.uuid, *usage)))
                    .collect();
            }
            Err(error) => {
                slog_scope::warn!("qgroup query failed, estimates degrade: {:#}", error);
            }
        }
        Ok(())
    }

    async fn paths(&mut self, volume: &Volume) -> Result<Vec<String>> {
        self.ensure_listed()?;
        Ok(self
            .subvol_by_identity(volume.uuid)
            .map(|s| vec![self.store_relative(s)])
            .unwrap_or_else(|| volume.paths.clone()))
    }

    async fn send_diff(
        &mut self,
        diff: &Diff,
        sink: &mut dyn DiffSink,
        progress: &mut TransferProgress,
    ) -> Result<()> {
        self.ensure_listed()?;
        let to = self
            .subvol_by_identity(diff.to_uuid)
            .ok_or_else(|| anyhow!(SyncError::VolumeNotFound(diff.to_uuid)))?;
        let to_path = self.abs_path(to)?;
        let parent_path = match diff.from_uuid {
            Some(from) => Some(
                self.abs_path(
                    self.subvol_by_identity(from)
                        .ok_or_else(|| anyhow!(SyncError::VolumeNotFound(from)))?,
                )?,
            ),
            None => None,
        };

        let mut sender = btrfs::send_snapshot(&to_path, parent_path.as_deref()).start()?;
        let mut reader = sender.reader();
        let mut buffer = BytesMut::with_capacity(READ_BUFFER);
        loop {
            let count = reader.read_buf(&mut buffer).await?;
            if count == 0 {
                break;
            }
            sink.write_chunk(&buffer).await?;
            progress.add(buffer.len() as u64);
            buffer.clear();
        }
        drop(reader);
        sender
            .wait()
            .await
            .map_err(|e| anyhow!(SyncError::TransferFatal(format!("btrfs send failed: {:#}", e))))
    }

    async fn receive_diff(&mut self, _diff: &Diff, _volume: &Volume) -> Result<Box<dyn DiffSink>> {
        if !self.mode.allows_receive() {
            return Err(anyhow!(SyncError::StoreReadonly(self.name.clone())));
        }
        let mut receiver = btrfs::receive_snapshot(&self.container).start()?;
        let writer = receiver.writer();
        Ok(Box::new(LocalDiffSink {
            receiver,
            writer: Some(writer),
            container: self.container.clone(),
            bytes: 0,
        }))
    }

    async fn delete_volume(&mut self, uuid: Uuid) -> Result<()> {
        if !self.mode.allows_delete() {
            return Err(anyhow!(SyncError::StoreReadonly(self.name.clone())));
        }
        self.ensure_listed()?;
        let subvol = self
            .subvol_by_identity(uuid)
            .ok_or_else(|| anyhow!(SyncError::VolumeNotFound(uuid)))?;
        let path = self.abs_path(subvol)?;
        btrfs::delete_subvolume(&path)
    }

    async fn delete_partials(&mut self) -> Result<()> {
        if !self.mode.allows_receive() {
            return Err(anyhow!(SyncError::StoreReadonly(self.name.clone())));
        }
        self.refresh()?;
        let finalized: HashSet<Uuid> = self.subvols.iter().map(|s| s.uuid).collect();
        let partials: Vec<_> = Subvolume::list_all(&self.container)?
            .into_iter()
            .filter(|s| s.path.starts_with(&self.tree_prefix))
            .filter(|s| s.received_uuid.is_none() && !finalized.contains(&s.uuid))
            .collect();
        for partial in partials {
            slog_scope::warn!("removing partially received subvolume {}", partial.path.to_string_lossy());
            let path = partial
                .path
                .strip_prefix(&self.mount_tree_path)
                .map(|rel| rel.as_pathbuf(&self.mountpoint))?;
            if let Err(error) = btrfs::delete_subvolume(&path) {
                slog_scope::warn!("failed to remove partial: {:#}", error);
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.subvols.clear();
        self.sizes.clear();
        Ok(())
    }
}

struct LocalDiffSink {
    receiver: btrfs::StartedSnapshotReceiver,
    writer: Option<tokio::process::ChildStdin>,
    container: PathBuf,
    bytes: u64,
}

#[async_trait]
impl DiffSink for LocalDiffSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().expect("chunks only arrive before finalization");
        writer
            .write_all(chunk)
            .await
            .map_err(|e| anyhow!(SyncError::TransferTransient(format!("receive pipe: {}", e))))?;
        self.bytes += chunk.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<Volume> {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        let name = self.receiver.wait().await?;
        let subvol = Subvolume::from_path(&self.container.join(&name))
            .context("received snapshot did not materialize")?;
        Ok(Volume {
            uuid: subvol.uuid,
            parent_uuid: subvol.parent_uuid,
            received_uuid: subvol.received_uuid,
            otime: subvol.otime,
            size: self.bytes,
            paths: vec![name],
        })
    }

    async fn abort(mut self: Box<Self>) -> Result<()> {
        self.writer.take();
        self.receiver.abort().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use crate::sys::fs::FsPathBuf;

    fn subvol(id: u64, uuid: u128, parent: Option<u128>, received: Option<u128>, path: &str, otime: i64) -> Subvolume {
        Subvolume {
            id,
            uuid: Uuid::from_u128(uuid),
            path: FsPathBuf::from(path),
            parent_uuid: parent.map(Uuid::from_u128),
            received_uuid: received.map(Uuid::from_u128),
            otime: Utc.timestamp(otime, 0),
        }
    }

    fn usage(referenced: u64, exclusive: u64) -> QgroupUsage {
        QgroupUsage { referenced, exclusive }
    }

    fn chain_store() -> LocalStore {
        let mut sizes = HashMap::new();
        sizes.insert(Uuid::from_u128(1), usage(100, 100));
        sizes.insert(Uuid::from_u128(2), usage(105, 10));
        sizes.insert(Uuid::from_u128(3), usage(108, 12));
        LocalStore::for_test(
            "/mnt/data/snaps/",
            StoreMode::Read,
            vec![
                subvol(10, 1, None, None, "snaps/a", 1),
                subvol(11, 2, Some(1), None, "snaps/b", 2),
                subvol(12, 3, Some(2), None, "snaps/c", 3),
            ],
            sizes,
        )
    }

    fn volume_for(uuid: u128) -> Volume {
        Volume {
            uuid: Uuid::from_u128(uuid),
            parent_uuid: None,
            received_uuid: None,
            otime: Utc.timestamp(0, 0),
            size: 0,
            paths: vec![],
        }
    }

    #[tokio::test]
    async fn edges_cover_full_send_and_every_ancestor() {
        let mut store = chain_store();
        let edges = store.edges(&volume_for(3)).await.unwrap();

        assert_eq!(edges.len(), 3);
        assert_eq!(edges[0].from_uuid, None);
        assert_eq!(edges[1].from_uuid, Some(Uuid::from_u128(2)));
        assert_eq!(edges[2].from_uuid, Some(Uuid::from_u128(1)));
        assert!(edges.iter().all(|e| e.sink == "/mnt/data/snaps/"));
    }

    #[tokio::test]
    async fn edges_follow_received_identity() {
        // The local copy of the parent was itself received: its own uuid
        // differs, but parent metadata points at the source-side uuid.
        let mut sizes = HashMap::new();
        sizes.insert(Uuid::from_u128(70), usage(100, 100));
        let mut store = LocalStore::for_test(
            "dst",
            StoreMode::Read,
            vec![
                subvol(10, 70, None, Some(1), "snaps/a", 1),
                subvol(11, 71, Some(1), Some(2), "snaps/b", 2),
            ],
            sizes,
        );
        let edges = store.edges(&volume_for(2)).await.unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[1].from_uuid, Some(Uuid::from_u128(1)));
    }

    #[tokio::test]
    async fn edges_for_unknown_volume_are_empty() {
        let mut store = chain_store();
        assert!(store.edges(&volume_for(42)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn edge_walk_survives_parent_loops() {
        let mut store = LocalStore::for_test(
            "src",
            StoreMode::Read,
            vec![
                subvol(10, 1, Some(2), None, "snaps/a", 1),
                subvol(11, 2, Some(1), None, "snaps/b", 2),
            ],
            HashMap::new(),
        );
        let edges = store.edges(&volume_for(1)).await.unwrap();
        // full, 2, then the walk stops when 1 reappears
        assert_eq!(edges.len(), 3);
    }

    #[tokio::test]
    async fn estimates_use_exclusive_for_incremental_and_referenced_for_full() {
        let mut store = chain_store();
        let incremental = Diff {
            to_uuid: Uuid::from_u128(3),
            from_uuid: Some(Uuid::from_u128(2)),
            sink: String::from("src"),
            size: 0,
            exact: false,
        };
        let full = Diff {
            from_uuid: None,
            ..incremental.clone()
        };
        assert_eq!(store.estimate_size(&incremental).await.unwrap(), 12);
        assert_eq!(store.estimate_size(&full).await.unwrap(), 108);
    }

    #[tokio::test]
    async fn paths_are_container_relative() {
        let mut store = chain_store();
        assert_eq!(store.paths(&volume_for(2)).await.unwrap(), vec![String::from("b")]);
    }

    #[tokio::test]
    async fn receive_requires_writable_mode() {
        let mut store = chain_store();
        let diff = Diff {
            to_uuid: Uuid::from_u128(5),
            from_uuid: None,
            sink: String::from("src"),
            size: 0,
            exact: false,
        };
        let error = match store.receive_diff(&diff, &volume_for(5)).await {
            Err(e) => e,
            Ok(_) => panic!("expected receive_diff to fail"),
        };
        assert!(matches!(SyncError::of(&error), Some(SyncError::StoreReadonly(_))));
    }

    #[tokio::test]
    async fn delete_requires_write_mode() {
        let mut store = chain_store();
        let error = store.delete_volume(Uuid::from_u128(1)).await.unwrap_err();
        assert!(matches!(SyncError::of(&error), Some(SyncError::StoreReadonly(_))));
    }
}
