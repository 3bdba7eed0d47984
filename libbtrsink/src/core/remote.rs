//! Remote btrfs store: a peer copy of this program is spawned on the remote
//! host in `--server` mode and the full store contract is forwarded to it as
//! length-prefixed request/response frames over the shell channel's stdio.
//! Diff payloads travel as raw data frames between a request and its final
//! response.

use super::{DiffSink, Store, StoreMode, SyncError, TransferProgress};
use crate::model::{Diff, Volume};
use crate::parsing::StoreUri;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use derivative::Derivative;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use uuid::Uuid;

pub(crate) const FRAME_CONTROL: u8 = 0;
pub(crate) const FRAME_DATA: u8 = 1;
pub(crate) const FRAME_END: u8 = 2;
pub(crate) const FRAME_ABORT: u8 = 3;
const MAX_FRAME: u32 = 64 << 20;

#[derive(Serialize, Deserialize, Debug)]
pub(crate) enum Request {
    Ping,
    ListVolumes,
    Edges { volume: Volume },
    HasVolume { uuid: Uuid },
    MeasureSize { diff: Diff },
    EstimateSize { diff: Diff },
    RescanSizes,
    Paths { volume: Volume },
    SendDiff { diff: Diff },
    ReceiveDiff { diff: Diff, volume: Volume },
    DeleteVolume { uuid: Uuid },
    DeletePartials,
    Close,
}

#[derive(Serialize, Deserialize, Debug)]
pub(crate) enum Response {
    Unit,
    Bool(bool),
    Size(u64),
    Volumes(Vec<Volume>),
    Diffs(Vec<Diff>),
    Paths(Vec<String>),
    Volume(Volume),
    Failed {
        kind: Option<String>,
        uuid: Option<Uuid>,
        message: String,
    },
}

impl Response {
    pub(crate) fn failed(error: &anyhow::Error) -> Self {
        let kind = SyncError::of(error);
        Response::Failed {
            kind: kind.map(kind_tag),
            uuid: match kind {
                Some(SyncError::VolumeNotFound(uuid)) | Some(SyncError::DiffUnreachable(uuid)) => Some(*uuid),
                _ => None,
            },
            message: format!("{:#}", error),
        }
    }
}

fn kind_tag(error: &SyncError) -> String {
    match error {
        SyncError::StoreUnreachable(_) => "unreachable",
        SyncError::StoreReadonly(_) => "readonly",
        SyncError::VolumeNotFound(_) => "volume_not_found",
        SyncError::DiffUnreachable(_) => "diff_unreachable",
        SyncError::TransferTransient(_) => "transient",
        SyncError::TransferFatal(_) => "fatal",
        SyncError::MetadataCorrupt(_) => "corrupt",
    }
    .to_string()
}

/// Rebuild a typed error on the proxy side so the driver's retry policy
/// sees the same kind the remote backend raised. The uuid-carrying kinds
/// take their identity from the frame; the message already restates it.
pub(crate) fn rebuild_error(kind: Option<String>, uuid: Option<Uuid>, message: String) -> anyhow::Error {
    match (kind.as_deref(), uuid) {
        (Some("unreachable"), _) => anyhow!(SyncError::StoreUnreachable(message)),
        (Some("readonly"), _) => anyhow!(SyncError::StoreReadonly(message)),
        (Some("volume_not_found"), Some(uuid)) => anyhow!(SyncError::VolumeNotFound(uuid)),
        (Some("diff_unreachable"), Some(uuid)) => anyhow!(SyncError::DiffUnreachable(uuid)),
        (Some("transient"), _) => anyhow!(SyncError::TransferTransient(message)),
        (Some("fatal"), _) => anyhow!(SyncError::TransferFatal(message)),
        (Some("corrupt"), _) => anyhow!(SyncError::MetadataCorrupt(message)),
        _ => anyhow!("remote: {}", message),
    }
}

/// Framed message channel over any byte stream pair.
pub(crate) struct Channel<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> Channel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    pub async fn write_frame(&mut self, tag: u8, payload: &[u8]) -> Result<()> {
        if payload.len() as u64 > MAX_FRAME as u64 {
            bail!("frame of {} bytes exceeds protocol limit", payload.len());
        }
        self.writer.write_u8(tag).await?;
        self.writer.write_u32(payload.len() as u32).await?;
        self.writer.write_all(payload).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn read_frame(&mut self) -> Result<(u8, Vec<u8>)> {
        let tag = self.reader.read_u8().await?;
        let length = self.reader.read_u32().await?;
        if length > MAX_FRAME {
            bail!(SyncError::MetadataCorrupt(format!(
                "frame length {} exceeds protocol limit",
                length
            )));
        }
        let mut payload = vec![0u8; length as usize];
        self.reader.read_exact(&mut payload).await?;
        Ok((tag, payload))
    }

    pub async fn send_control<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.write_frame(FRAME_CONTROL, &payload).await
    }

    pub async fn recv_control<T: DeserializeOwned>(&mut self) -> Result<T> {
        let (tag, payload) = self.read_frame().await?;
        if tag != FRAME_CONTROL {
            bail!(SyncError::MetadataCorrupt(format!(
                "expected control frame, got tag {}",
                tag
            )));
        }
        serde_json::from_slice(&payload).context("malformed protocol message")
    }
}

type PeerChannel = Channel<BufReader<tokio::process::ChildStdout>, tokio::process::ChildStdin>;

/// Proxy store that forwards every capability call to a `--server` peer
/// spawned over ssh.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RemoteStore {
    name: String,
    mode: StoreMode,
    #[derivative(Debug = "ignore")]
    child: Child,
    #[derivative(Debug = "ignore")]
    chan: Arc<Mutex<PeerChannel>>,
}

impl RemoteStore {
    pub async fn open(uri: &StoreUri, mode: StoreMode) -> Result<Self> {
        let host = uri
            .host
            .clone()
            .ok_or_else(|| anyhow!(SyncError::StoreUnreachable(format!("{} has no host", uri))))?;

        let mut command = Command::new("ssh");
        command
            .arg(&host)
            .arg("btrsink")
            .arg("--server")
            .arg("--mode")
            .arg(mode.flag())
            .arg(format!("/{}", uri.path))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| anyhow!(SyncError::StoreUnreachable(format!("failed to spawn ssh: {}", e))))?;

        let chan = Channel::new(
            BufReader::new(child.stdout.take().expect("stdout is piped")),
            child.stdin.take().expect("stdin is piped"),
        );
        let mut store = Self {
            name: uri.to_string(),
            mode,
            child,
            chan: Arc::new(Mutex::new(chan)),
        };

        match store.roundtrip(&Request::Ping).await {
            Ok(Response::Unit) => Ok(store),
            Ok(other) => Err(anyhow!(SyncError::StoreUnreachable(format!(
                "unexpected handshake response {:?}",
                other
            )))),
            Err(error) => Err(anyhow!(SyncError::StoreUnreachable(format!(
                "{}: {:#}",
                store.name, error
            )))),
        }
    }

    async fn roundtrip(&mut self, request: &Request) -> Result<Response> {
        let mut chan = self.chan.lock().await;
        chan.send_control(request).await?;
        match chan.recv_control().await? {
            Response::Failed { kind, uuid, message } => Err(rebuild_error(kind, uuid, message)),
            response => Ok(response),
        }
    }
}

#[async_trait]
impl Store for RemoteStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> StoreMode {
        self.mode
    }

    async fn list_volumes(&mut self) -> Result<Vec<Volume>> {
        match self.roundtrip(&Request::ListVolumes).await? {
            Response::Volumes(volumes) => Ok(volumes),
            other => bail!("protocol violation: {:?}", other),
        }
    }

    async fn edges(&mut self, volume: &Volume) -> Result<Vec<Diff>> {
        match self.roundtrip(&Request::Edges { volume: volume.clone() }).await? {
            Response::Diffs(diffs) => Ok(diffs),
            other => bail!("protocol violation: {:?}", other),
        }
    }

    async fn has_volume(&mut self, uuid: Uuid) -> Result<bool> {
        match self.roundtrip(&Request::HasVolume { uuid }).await? {
            Response::Bool(value) => Ok(value),
            other => bail!("protocol violation: {:?}", other),
        }
    }

    async fn measure_size(&mut self, diff: &Diff) -> Result<u64> {
        match self.roundtrip(&Request::MeasureSize { diff: diff.clone() }).await? {
            Response::Size(size) => Ok(size),
            other => bail!("protocol violation: {:?}", other),
        }
    }

    async fn estimate_size(&mut self, diff: &Diff) -> Result<u64> {
        match self.roundtrip(&Request::EstimateSize { diff: diff.clone() }).await? {
            Response::Size(size) => Ok(size),
            other => bail!("protocol violation: {:?}", other),
        }
    }

    async fn rescan_sizes(&mut self) -> Result<()> {
        match self.roundtrip(&Request::RescanSizes).await? {
            Response::Unit => Ok(()),
            other => bail!("protocol violation: {:?}", other),
        }
    }

    async fn paths(&mut self, volume: &Volume) -> Result<Vec<String>> {
        match self.roundtrip(&Request::Paths { volume: volume.clone() }).await? {
            Response::Paths(paths) => Ok(paths),
            other => bail!("protocol violation: {:?}", other),
        }
    }

    async fn send_diff(
        &mut self,
        diff: &Diff,
        sink: &mut dyn DiffSink,
        progress: &mut TransferProgress,
    ) -> Result<()> {
        let mut chan = self.chan.lock().await;
        chan.send_control(&Request::SendDiff { diff: diff.clone() }).await?;
        loop {
            let (tag, payload) = chan
                .read_frame()
                .await
                .map_err(|e| anyhow!(SyncError::TransferTransient(format!("peer stream: {:#}", e))))?;
            match tag {
                FRAME_DATA => {
                    sink.write_chunk(&payload).await?;
                    progress.add(payload.len() as u64);
                }
                FRAME_END => break,
                FRAME_CONTROL => {
                    return match serde_json::from_slice(&payload).context("malformed protocol message")? {
                        Response::Failed { kind, uuid, message } => Err(rebuild_error(kind, uuid, message)),
                        other => bail!("protocol violation: {:?}", other),
                    };
                }
                tag => bail!("protocol violation: unexpected frame tag {}", tag),
            }
        }
        match chan.recv_control().await? {
            Response::Unit => Ok(()),
            Response::Failed { kind, uuid, message } => Err(rebuild_error(kind, uuid, message)),
            other => bail!("protocol violation: {:?}", other),
        }
    }

    async fn receive_diff(&mut self, diff: &Diff, volume: &Volume) -> Result<Box<dyn DiffSink>> {
        if !self.mode.allows_receive() {
            return Err(anyhow!(SyncError::StoreReadonly(self.name.clone())));
        }
        match self
            .roundtrip(&Request::ReceiveDiff {
                diff: diff.clone(),
                volume: volume.clone(),
            })
            .await?
        {
            Response::Unit => Ok(Box::new(RemoteDiffSink {
                chan: Arc::clone(&self.chan),
            })),
            other => bail!("protocol violation: {:?}", other),
        }
    }

    async fn delete_volume(&mut self, uuid: Uuid) -> Result<()> {
        match self.roundtrip(&Request::DeleteVolume { uuid }).await? {
            Response::Unit => Ok(()),
            other => bail!("protocol violation: {:?}", other),
        }
    }

    async fn delete_partials(&mut self) -> Result<()> {
        match self.roundtrip(&Request::DeletePartials).await? {
            Response::Unit => Ok(()),
            other => bail!("protocol violation: {:?}", other),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Err(error) = self.roundtrip(&Request::Close).await {
            slog_scope::debug!("peer close: {:#}", error);
        }
        match tokio::time::timeout(Duration::from_secs(10), self.child.wait()).await {
            Ok(status) => {
                status.context("waiting for peer exit")?;
            }
            Err(_) => {
                slog_scope::warn!("peer did not exit, killing");
                self.child.kill().await.context("failed to kill peer")?;
            }
        }
        Ok(())
    }
}

struct RemoteDiffSink {
    chan: Arc<Mutex<PeerChannel>>,
}

#[async_trait]
impl DiffSink for RemoteDiffSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let mut chan = self.chan.lock().await;
        chan.write_frame(FRAME_DATA, chunk)
            .await
            .map_err(|e| anyhow!(SyncError::TransferTransient(format!("peer stream: {:#}", e))))
    }

    async fn finish(self: Box<Self>) -> Result<Volume> {
        let mut chan = self.chan.lock().await;
        chan.write_frame(FRAME_END, &[]).await?;
        match chan.recv_control().await? {
            Response::Volume(volume) => Ok(volume),
            Response::Failed { kind, uuid, message } => Err(rebuild_error(kind, uuid, message)),
            other => bail!("protocol violation: {:?}", other),
        }
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let mut chan = self.chan.lock().await;
        chan.write_frame(FRAME_ABORT, &[]).await?;
        match chan.recv_control().await? {
            Response::Unit => Ok(()),
            Response::Failed { kind, uuid, message } => Err(rebuild_error(kind, uuid, message)),
            other => bail!("protocol violation: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip() {
        let (client, server) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let mut sender = Channel::new(client_read, client_write);
        let mut receiver = Channel::new(server_read, server_write);

        sender.write_frame(FRAME_DATA, b"stream bytes").await.unwrap();
        sender.send_control(&Request::Ping).await.unwrap();

        let (tag, payload) = receiver.read_frame().await.unwrap();
        assert_eq!(tag, FRAME_DATA);
        assert_eq!(payload, b"stream bytes");
        let request: Request = receiver.recv_control().await.unwrap();
        assert!(matches!(request, Request::Ping));
    }

    #[tokio::test]
    async fn control_frame_expected_where_data_arrives() {
        let (client, server) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let mut sender = Channel::new(client_read, client_write);
        let mut receiver = Channel::new(server_read, server_write);

        sender.write_frame(FRAME_DATA, b"x").await.unwrap();
        let error = receiver.recv_control::<Request>().await.unwrap_err();
        assert!(matches!(
            SyncError::of(&error),
            Some(SyncError::MetadataCorrupt(_))
        ));
    }

    #[test]
    fn failed_responses_rebuild_their_kind() {
        let original = anyhow!(SyncError::TransferTransient(String::from("socket reset")));
        let response = Response::failed(&original);
        if let Response::Failed { kind, uuid, message } = response {
            assert_eq!(uuid, None);
            let rebuilt = rebuild_error(kind, uuid, message);
            assert!(SyncError::is_transient(&rebuilt));
        } else {
            panic!("expected failed response");
        }
    }

    #[test]
    fn uuid_kinds_survive_the_wire() {
        let volume = Uuid::from_u128(7);
        for original in vec![
            anyhow!(SyncError::VolumeNotFound(volume)),
            anyhow!(SyncError::DiffUnreachable(volume)),
        ] {
            let response = Response::failed(&original);
            if let Response::Failed { kind, uuid, message } = response {
                assert_eq!(uuid, Some(volume));
                let rebuilt = rebuild_error(kind, uuid, message);
                match SyncError::of(&rebuilt) {
                    Some(SyncError::VolumeNotFound(u)) | Some(SyncError::DiffUnreachable(u)) => {
                        assert_eq!(*u, volume)
                    }
                    other => panic!("kind lost across the wire: {:?}", other),
                }
            } else {
                panic!("expected failed response");
            }
        }
    }

    #[test]
    fn unknown_kind_rebuilds_as_plain_error() {
        let rebuilt = rebuild_error(None, None, String::from("who knows"));
        assert!(SyncError::of(&rebuilt).is_none());
        assert!(rebuilt.to_string().contains("who knows"));

        // A uuid kind whose frame lost the uuid degrades to a plain error
        // instead of fabricating an identity.
        let rebuilt = rebuild_error(Some(String::from("volume_not_found")), None, String::from("gone"));
        assert!(SyncError::of(&rebuilt).is_none());
    }
}
