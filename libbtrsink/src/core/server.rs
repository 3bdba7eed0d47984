//! Peer side of the remote protocol: wraps a local store and answers one
//! request per frame read from stdin, writing responses to stdout. All
//! logging must stay off stdout, which carries protocol frames.

use super::local::LocalStore;
use super::remote::{Channel, Request, Response, FRAME_ABORT, FRAME_CONTROL, FRAME_DATA, FRAME_END};
use super::{DiffSink, Store, StoreMode, TransferProgress};
use crate::model::Volume;
use crate::parsing::StoreUri;
use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

pub async fn serve(path: &str, mode: StoreMode) -> Result<()> {
    let uri: StoreUri = path.parse()?;
    let mut store = LocalStore::open(&uri, mode)?;
    slog_scope::info!("serving {} in {} mode", store.name(), mode);
    let result = serve_store(
        &mut store,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await;
    store.close().await?;
    result
}

/// Answer requests until the peer disconnects.
pub(crate) async fn serve_store<R, W>(store: &mut dyn Store, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut chan = Channel::new(reader, writer);
    loop {
        let request: Request = match chan.recv_control().await {
            Ok(request) => request,
            Err(error) => {
                slog_scope::debug!("peer channel closed: {:#}", error);
                return Ok(());
            }
        };
        match request {
            Request::Ping => chan.send_control(&Response::Unit).await?,
            Request::ListVolumes => {
                respond(&mut chan, store.list_volumes().await.map(Response::Volumes)).await?
            }
            Request::Edges { volume } => {
                respond(&mut chan, store.edges(&volume).await.map(Response::Diffs)).await?
            }
            Request::HasVolume { uuid } => {
                respond(&mut chan, store.has_volume(uuid).await.map(Response::Bool)).await?
            }
            Request::MeasureSize { diff } => {
                respond(&mut chan, store.measure_size(&diff).await.map(Response::Size)).await?
            }
            Request::EstimateSize { diff } => {
                respond(&mut chan, store.estimate_size(&diff).await.map(Response::Size)).await?
            }
            Request::RescanSizes => {
                respond(&mut chan, store.rescan_sizes().await.map(|_| Response::Unit)).await?
            }
            Request::Paths { volume } => {
                respond(&mut chan, store.paths(&volume).await.map(Response::Paths)).await?
            }
            Request::DeleteVolume { uuid } => {
                respond(&mut chan, store.delete_volume(uuid).await.map(|_| Response::Unit)).await?
            }
            Request::DeletePartials => {
                respond(&mut chan, store.delete_partials().await.map(|_| Response::Unit)).await?
            }
            Request::SendDiff { diff } => {
                let mut progress = TransferProgress::new();
                let result = {
                    let mut forwarder = FrameForwarder { chan: &mut chan };
                    store.send_diff(&diff, &mut forwarder, &mut progress).await
                };
                match result {
                    Ok(()) => {
                        chan.write_frame(FRAME_END, &[]).await?;
                        chan.send_control(&Response::Unit).await?;
                        slog_scope::info!("served {} ({})", diff, progress.describe());
                    }
                    Err(error) => chan.send_control(&Response::failed(&error)).await?,
                }
            }
            Request::ReceiveDiff { diff, volume } => match store.receive_diff(&diff, &volume).await {
                Err(error) => chan.send_control(&Response::failed(&error)).await?,
                Ok(sink) => {
                    chan.send_control(&Response::Unit).await?;
                    receive_stream(&mut chan, sink).await?;
                }
            },
            Request::Close => {
                chan.send_control(&Response::Unit).await?;
                return Ok(());
            }
        }
    }
}

/// Drain one incoming diff stream into `sink`. A chunk failure is remembered
/// and reported once the peer terminates the stream, so framing stays in
/// step.
async fn receive_stream<R, W>(chan: &mut Channel<R, W>, mut sink: Box<dyn DiffSink>) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut failure: Option<anyhow::Error> = None;
    loop {
        let (tag, payload) = chan.read_frame().await?;
        match tag {
            FRAME_DATA => {
                if failure.is_none() {
                    if let Err(error) = sink.write_chunk(&payload).await {
                        failure = Some(error);
                    }
                }
            }
            FRAME_END => {
                let response = match failure {
                    Some(error) => {
                        let _ = sink.abort().await;
                        Response::failed(&error)
                    }
                    None => match sink.finish().await {
                        Ok(volume) => Response::Volume(volume),
                        Err(error) => Response::failed(&error),
                    },
                };
                return chan.send_control(&response).await;
            }
            FRAME_ABORT => {
                let response = match sink.abort().await {
                    Ok(()) => Response::Unit,
                    Err(error) => Response::failed(&error),
                };
                return chan.send_control(&response).await;
            }
            tag => bail!("protocol violation: unexpected frame tag {}", tag),
        }
    }
}

async fn respond<R, W>(chan: &mut Channel<R, W>, result: Result<Response>) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let response = match result {
        Ok(response) => response,
        Err(error) => Response::failed(&error),
    };
    chan.send_control(&response).await
}

struct FrameForwarder<'a, R, W> {
    chan: &'a mut Channel<R, W>,
}

#[async_trait]
impl<'a, R, W> DiffSink for FrameForwarder<'a, R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.chan.write_frame(FRAME_DATA, chunk).await
    }

    async fn finish(self: Box<Self>) -> Result<Volume> {
        bail!("stream forwarder has no volume to finalize")
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::MemoryStore;
    use crate::model::Diff;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn vol(uuid: u128) -> Volume {
        Volume {
            uuid: Uuid::from_u128(uuid),
            parent_uuid: None,
            received_uuid: None,
            otime: Utc.timestamp(1, 0),
            size: 0,
            paths: vec![String::from("a")],
        }
    }

    #[tokio::test]
    async fn server_answers_listing_and_close() {
        let mut store = MemoryStore::new("peer", StoreMode::Read).with_volume(vol(1));
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);

        let serving = tokio::spawn(async move {
            serve_store(&mut store, server_read, server_write).await.unwrap();
        });

        let mut chan = Channel::new(client_read, client_write);
        chan.send_control(&Request::ListVolumes).await.unwrap();
        match chan.recv_control().await.unwrap() {
            Response::Volumes(volumes) => assert_eq!(volumes, vec![vol(1)]),
            other => panic!("unexpected {:?}", other),
        }
        chan.send_control(&Request::HasVolume {
            uuid: Uuid::from_u128(1),
        })
        .await
        .unwrap();
        assert!(matches!(chan.recv_control().await.unwrap(), Response::Bool(true)));
        chan.send_control(&Request::HasVolume {
            uuid: Uuid::from_u128(9),
        })
        .await
        .unwrap();
        assert!(matches!(chan.recv_control().await.unwrap(), Response::Bool(false)));
        chan.send_control(&Request::Close).await.unwrap();
        assert!(matches!(chan.recv_control().await.unwrap(), Response::Unit));
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn server_streams_diffs_as_data_frames() {
        let diff = Diff {
            to_uuid: Uuid::from_u128(1),
            from_uuid: None,
            sink: String::from("peer"),
            size: 7,
            exact: true,
        };
        let mut store = MemoryStore::new("peer", StoreMode::Read).with_volume(vol(1));
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);

        let serving = tokio::spawn(async move {
            serve_store(&mut store, server_read, server_write).await.unwrap();
        });

        let mut chan = Channel::new(client_read, client_write);
        chan.send_control(&Request::SendDiff { diff }).await.unwrap();
        let mut bytes = 0usize;
        loop {
            let (tag, payload) = chan.read_frame().await.unwrap();
            match tag {
                FRAME_DATA => bytes += payload.len(),
                FRAME_END => break,
                tag => panic!("unexpected tag {}", tag),
            }
        }
        assert_eq!(bytes, 7);
        assert!(matches!(chan.recv_control().await.unwrap(), Response::Unit));

        chan.send_control(&Request::Close).await.unwrap();
        assert!(matches!(chan.recv_control().await.unwrap(), Response::Unit));
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn server_receives_stream_and_reports_volume() {
        let diff = Diff {
            to_uuid: Uuid::from_u128(5),
            from_uuid: None,
            sink: String::from("src"),
            size: 4,
            exact: true,
        };
        let store = MemoryStore::new("peer", StoreMode::Append);
        let state = store.handle();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);

        let serving = tokio::spawn(async move {
            let mut store = store;
            serve_store(&mut store, server_read, server_write).await.unwrap();
        });

        let mut chan = Channel::new(client_read, client_write);
        chan.send_control(&Request::ReceiveDiff {
            diff,
            volume: vol(5),
        })
        .await
        .unwrap();
        assert!(matches!(chan.recv_control().await.unwrap(), Response::Unit));
        chan.write_frame(FRAME_DATA, b"abcd").await.unwrap();
        chan.write_frame(FRAME_END, &[]).await.unwrap();
        match chan.recv_control().await.unwrap() {
            Response::Volume(volume) => {
                assert_eq!(volume.received_uuid, Some(Uuid::from_u128(5)));
                assert_eq!(volume.size, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
        chan.send_control(&Request::Close).await.unwrap();
        assert!(matches!(chan.recv_control().await.unwrap(), Response::Unit));
        serving.await.unwrap();

        assert_eq!(state.lock().unwrap().received, vec![(Uuid::from_u128(5), 4)]);
    }
}
