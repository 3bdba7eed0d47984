use super::{DiffSink, Store, StoreMode, SyncError, TransferProgress};
use crate::model::{Diff, Volume};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// An in-memory Store used to exercise the estimator and the transfer
/// driver without a filesystem.
pub struct MemoryStore {
    name: String,
    mode: StoreMode,
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
pub struct MemoryInner {
    pub volumes: Vec<Volume>,
    pub edges: HashMap<Uuid, Vec<Diff>>,
    pub measured: HashMap<(Option<Uuid>, Uuid), u64>,
    pub received: Vec<(Uuid, u64)>,
    pub deleted: Vec<Uuid>,
    pub rescans: u32,
    pub partial_sweeps: u32,
    pub closed: bool,
    pub failing_sends: u32,
}

impl MemoryStore {
    pub fn new(name: &str, mode: StoreMode) -> Self {
        Self {
            name: name.to_string(),
            mode,
            inner: Arc::new(Mutex::new(MemoryInner::default())),
        }
    }

    pub fn with_volume(self, volume: Volume) -> Self {
        self.inner.lock().unwrap().volumes.push(volume);
        self
    }

    pub fn with_edge(self, diff: Diff) -> Self {
        self.inner.lock().unwrap().edges.entry(diff.to_uuid).or_default().push(diff);
        self
    }

    pub fn with_measurement(self, from: Option<Uuid>, to: Uuid, size: u64) -> Self {
        self.inner.lock().unwrap().measured.insert((from, to), size);
        self
    }

    pub fn failing_sends(self, count: u32) -> Self {
        self.inner.lock().unwrap().failing_sends = count;
        self
    }

    pub fn handle(&self) -> Arc<Mutex<MemoryInner>> {
        Arc::clone(&self.inner)
    }

    /// Deterministic uuid for the store-local copy of a received volume.
    pub fn received_uuid_for(uuid: Uuid) -> Uuid {
        Uuid::from_u128(uuid.as_u128() ^ 0x4d454d53544f5245)
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> StoreMode {
        self.mode
    }

    async fn list_volumes(&mut self) -> Result<Vec<Volume>> {
        Ok(self.inner.lock().unwrap().volumes.clone())
    }

    async fn edges(&mut self, volume: &Volume) -> Result<Vec<Diff>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.edges.get(&volume.uuid).cloned().unwrap_or_default())
    }

    async fn has_volume(&mut self, uuid: Uuid) -> Result<bool> {
        Ok(self.inner.lock().unwrap().volumes.iter().any(|v| v.mirrors(uuid)))
    }

    async fn measure_size(&mut self, diff: &Diff) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .measured
            .get(&(diff.from_uuid, diff.to_uuid))
            .copied()
            .ok_or_else(|| anyhow!(SyncError::VolumeNotFound(diff.to_uuid)))
    }

    async fn estimate_size(&mut self, diff: &Diff) -> Result<u64> {
        Ok(diff.size)
    }

    async fn rescan_sizes(&mut self) -> Result<()> {
        self.inner.lock().unwrap().rescans += 1;
        Ok(())
    }

    async fn paths(&mut self, volume: &Volume) -> Result<Vec<String>> {
        Ok(volume.paths.clone())
    }

    async fn send_diff(
        &mut self,
        diff: &Diff,
        sink: &mut dyn DiffSink,
        progress: &mut TransferProgress,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.failing_sends > 0 {
                inner.failing_sends -= 1;
                return Err(anyhow!(SyncError::TransferTransient(format!(
                    "simulated stream hiccup for {}",
                    diff
                ))));
            }
        }
        let payload = vec![0xb7u8; diff.size as usize];
        for chunk in payload.chunks(3) {
            sink.write_chunk(chunk).await?;
            progress.add(chunk.len() as u64);
        }
        Ok(())
    }

    async fn receive_diff(&mut self, diff: &Diff, volume: &Volume) -> Result<Box<dyn DiffSink>> {
        if !self.mode.allows_receive() {
            return Err(anyhow!(SyncError::StoreReadonly(self.name.clone())));
        }
        Ok(Box::new(MemorySink {
            inner: Arc::clone(&self.inner),
            volume: volume.clone(),
            diff: diff.clone(),
            bytes: 0,
        }))
    }

    async fn delete_volume(&mut self, uuid: Uuid) -> Result<()> {
        if !self.mode.allows_delete() {
            return Err(anyhow!(SyncError::StoreReadonly(self.name.clone())));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.volumes.retain(|v| v.uuid != uuid);
        inner.deleted.push(uuid);
        Ok(())
    }

    async fn delete_partials(&mut self) -> Result<()> {
        self.inner.lock().unwrap().partial_sweeps += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.lock().unwrap().closed = true;
        Ok(())
    }
}

struct MemorySink {
    inner: Arc<Mutex<MemoryInner>>,
    volume: Volume,
    diff: Diff,
    bytes: u64,
}

#[async_trait]
impl DiffSink for MemorySink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.bytes += chunk.len() as u64;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<Volume> {
        let materialized = Volume {
            uuid: MemoryStore::received_uuid_for(self.volume.uuid),
            received_uuid: Some(self.volume.uuid),
            size: self.bytes,
            ..self.volume.clone()
        };
        let mut inner = self.inner.lock().unwrap();
        inner.received.push((self.diff.to_uuid, self.bytes));
        inner.volumes.push(materialized.clone());
        Ok(materialized)
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
