//! Object-storage snapshot store: every diff stream is an opaque blob named
//! by the volume it materializes, with a key=value sidecar carrying the
//! metadata needed to rebuild the volume set without a filesystem. Requests
//! are unsigned; deployments front the bucket with a signing gateway or an
//! anonymously writable endpoint.

use super::{DiffSink, Store, StoreMode, SyncError, TransferProgress};
use crate::model::{Diff, Volume};
use crate::once_regex;
use crate::parsing::{encode_key_value_data, parse_key_value_data, parse_uuid, StoreUri, StringPair};
use crate::sys::net::HttpsClient;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use derivative::Derivative;
use http::Request;
use hyper::{body::HttpBody as _, Body, StatusCode, Uri};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

const SIDECAR_SUFFIX: &str = ".info";

#[derive(Derivative)]
#[derivative(Debug)]
pub struct ObjectStore {
    name: String,
    mode: StoreMode,
    #[derivative(Debug = "ignore")]
    client: Arc<HttpsClient>,
    host: String,
    prefix: String,
    /// Restricts the store to one snapshot (locator without trailing slash).
    snapshot: Option<String>,
    part_size: usize,
    volumes: Vec<Volume>,
    blobs: HashMap<Uuid, BlobRecord>,
}

/// One stored diff stream, reconstructed from its sidecar.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobRecord {
    pub to_uuid: Uuid,
    pub from_uuid: Option<Uuid>,
    pub size: u64,
    pub otime: DateTime<Utc>,
    pub paths: Vec<String>,
}

impl ObjectStore {
    pub fn open(uri: &StoreUri, mode: StoreMode, part_size_mib: u64) -> Result<Self> {
        let host = uri
            .host
            .clone()
            .ok_or_else(|| anyhow!(SyncError::StoreUnreachable(format!("{} has no bucket host", uri))))?;
        let (prefix, snapshot) = uri.split_snapshot();
        Ok(Self {
            name: uri.to_string(),
            mode,
            client: Arc::new(HttpsClient::default()),
            host,
            prefix,
            snapshot,
            part_size: (part_size_mib.max(1) as usize) << 20,
            volumes: Vec::new(),
            blobs: HashMap::new(),
        })
    }

    fn blob_key(&self, uuid: Uuid) -> String {
        format!("{}{}", self.prefix, uuid)
    }

    fn object_uri(host: &str, key: &str, query: &str) -> Result<Uri> {
        format!("https://{}/{}{}", host, key, query)
            .parse()
            .context("malformed object uri")
    }

    async fn get_text(&self, key: &str, query: &str) -> Result<String> {
        let uri = Self::object_uri(&self.host, key, query)?;
        let mut response = self
            .client
            .get(uri)
            .await
            .map_err(|e| anyhow!(SyncError::StoreUnreachable(format!("{}: {}", self.name, e))))?;
        status_as_result(response.status(), &format!("fetch {}", key))?;
        let mut data = Vec::new();
        while let Some(chunk) = response.body_mut().data().await {
            data.extend_from_slice(&chunk.map_err(|e| anyhow!(SyncError::TransferTransient(e.to_string())))?);
        }
        String::from_utf8(data).context("object body is not utf8")
    }

    /// One page of keys per request; truncated listings are followed until
    /// the bucket is exhausted so residency never under-reports.
    async fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let query = match &token {
                Some(token) => format!(
                    "?list-type=2&prefix={}&continuation-token={}",
                    self.prefix,
                    urlencode(token)
                ),
                None => format!("?list-type=2&prefix={}", self.prefix),
            };
            let listing = self.get_text("", &query).await.context("failed to list bucket")?;
            keys.extend(parse_list_keys(&listing));
            match parse_next_continuation(&listing) {
                Some(next) => token = Some(next),
                None => return Ok(keys),
            }
        }
    }

    async fn refresh(&mut self) -> Result<()> {
        let keys = self.list_keys().await?;
        let mut volumes = Vec::new();
        let mut blobs = HashMap::new();
        for key in keys {
            if !key.ends_with(SIDECAR_SUFFIX) {
                continue;
            }
            let sidecar = self.get_text(&key, "").await?;
            match parse_sidecar(&sidecar) {
                Ok(record) => {
                    if let Some(name) = &self.snapshot {
                        if !record.paths.iter().any(|p| p == name || p.ends_with(&format!("/{}", name))) {
                            continue;
                        }
                    }
                    volumes.push(Volume {
                        uuid: record.to_uuid,
                        parent_uuid: record.from_uuid,
                        received_uuid: None,
                        otime: record.otime,
                        size: record.size,
                        paths: record.paths.clone(),
                    });
                    blobs.insert(record.to_uuid, record);
                }
                Err(error) => {
                    slog_scope::warn!("skipping corrupt sidecar {}: {:#}", key, error);
                }
            }
        }
        self.volumes = volumes;
        self.blobs = blobs;
        Ok(())
    }

    fn record_for(&self, diff: &Diff) -> Result<&BlobRecord> {
        self.blobs
            .get(&diff.to_uuid)
            .filter(|r| r.from_uuid == diff.from_uuid)
            .ok_or_else(|| anyhow!(SyncError::VolumeNotFound(diff.to_uuid)))
    }
}

#[async_trait]
impl Store for ObjectStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> StoreMode {
        self.mode
    }

    async fn list_volumes(&mut self) -> Result<Vec<Volume>> {
        self.refresh().await?;
        Ok(self.volumes.clone())
    }

    async fn edges(&mut self, volume: &Volume) -> Result<Vec<Diff>> {
        // An object store can only replay the exact streams it holds.
        Ok(self
            .blobs
            .get(&volume.uuid)
            .map(|record| {
                vec![Diff {
                    to_uuid: record.to_uuid,
                    from_uuid: record.from_uuid,
                    sink: self.name.clone(),
                    size: record.size,
                    exact: true,
                }]
            })
            .unwrap_or_default())
    }

    async fn has_volume(&mut self, uuid: Uuid) -> Result<bool> {
        Ok(self.blobs.contains_key(&uuid))
    }

    async fn measure_size(&mut self, diff: &Diff) -> Result<u64> {
        self.record_for(diff).map(|r| r.size)
    }

    async fn estimate_size(&mut self, diff: &Diff) -> Result<u64> {
        self.record_for(diff).map(|r| r.size)
    }

    async fn rescan_sizes(&mut self) -> Result<()> {
        // Sidecar sizes are exact; nothing to recompute.
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
        let record = self.record_for(diff)?;
        let key = self.blob_key(record.to_uuid);
        let uri = Self::object_uri(&self.host, &key, "")?;
        let mut response = self
            .client
            .get(uri)
            .await
            .map_err(|e| anyhow!(SyncError::TransferTransient(e.to_string())))?;
        status_as_result(response.status(), &format!("download {}", key))?;
        while let Some(chunk) = response.body_mut().data().await {
            let chunk = chunk.map_err(|e| anyhow!(SyncError::TransferTransient(e.to_string())))?;
            sink.write_chunk(&chunk).await?;
            progress.add(chunk.len() as u64);
        }
        Ok(())
    }

    async fn receive_diff(&mut self, diff: &Diff, volume: &Volume) -> Result<Box<dyn DiffSink>> {
        if !self.mode.allows_receive() {
            return Err(anyhow!(SyncError::StoreReadonly(self.name.clone())));
        }
        let key = self.blob_key(diff.to_uuid);
        let initiate = self
            .client
            .request(
                Request::post(Self::object_uri(&self.host, &key, "?uploads")?)
                    .body(Body::empty())
                    .expect("valid request setup"),
            )
            .await
            .map_err(|e| anyhow!(SyncError::TransferTransient(e.to_string())))?;
        status_as_result(initiate.status(), &format!("initiate upload of {}", key))?;
        let body = read_body(initiate.into_body()).await?;
        let upload_id = parse_upload_id(&body)?;

        Ok(Box::new(ObjectDiffSink {
            client: Arc::clone(&self.client),
            host: self.host.clone(),
            key,
            upload_id,
            part_size: self.part_size,
            buffer: BytesMut::with_capacity(self.part_size),
            parts: Vec::new(),
            bytes: 0,
            record: BlobRecord {
                to_uuid: diff.to_uuid,
                from_uuid: diff.from_uuid,
                size: 0,
                otime: volume.otime,
                paths: volume.paths.clone(),
            },
        }))
    }

    async fn delete_volume(&mut self, uuid: Uuid) -> Result<()> {
        if !self.mode.allows_delete() {
            return Err(anyhow!(SyncError::StoreReadonly(self.name.clone())));
        }
        if !self.blobs.contains_key(&uuid) {
            return Err(anyhow!(SyncError::VolumeNotFound(uuid)));
        }
        let key = self.blob_key(uuid);
        for target in &[key.clone(), format!("{}{}", key, SIDECAR_SUFFIX)] {
            let response = self
                .client
                .request(
                    Request::delete(Self::object_uri(&self.host, target, "")?)
                        .body(Body::empty())
                        .expect("valid request setup"),
                )
                .await
                .map_err(|e| anyhow!(SyncError::TransferTransient(e.to_string())))?;
            status_as_result(response.status(), &format!("delete {}", target))?;
        }
        self.blobs.remove(&uuid);
        self.volumes.retain(|v| v.uuid != uuid);
        Ok(())
    }

    async fn delete_partials(&mut self) -> Result<()> {
        if !self.mode.allows_receive() {
            return Err(anyhow!(SyncError::StoreReadonly(self.name.clone())));
        }
        let listing = self.get_text("", "?uploads").await.context("failed to list uploads")?;
        for (key, upload_id) in parse_multipart_uploads(&listing) {
            if !key.starts_with(&self.prefix) {
                continue;
            }
            slog_scope::warn!("aborting stale multipart upload of {}", key);
            let response = self
                .client
                .request(
                    Request::delete(Self::object_uri(&self.host, &key, &format!("?uploadId={}", upload_id))?)
                        .body(Body::empty())
                        .expect("valid request setup"),
                )
                .await
                .map_err(|e| anyhow!(SyncError::TransferTransient(e.to_string())))?;
            if let Err(error) = status_as_result(response.status(), &format!("abort upload of {}", key)) {
                slog_scope::warn!("{:#}", error);
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // Sidecars are flushed when each receive finalizes.
        self.volumes.clear();
        self.blobs.clear();
        Ok(())
    }
}

struct ObjectDiffSink {
    client: Arc<HttpsClient>,
    host: String,
    key: String,
    upload_id: String,
    part_size: usize,
    buffer: BytesMut,
    parts: Vec<String>,
    bytes: u64,
    record: BlobRecord,
}

impl ObjectDiffSink {
    async fn upload_part(&mut self, part: Bytes) -> Result<()> {
        let number = self.parts.len() + 1;
        let query = format!("?partNumber={}&uploadId={}", number, self.upload_id);
        let response = self
            .client
            .request(
                Request::put(ObjectStore::object_uri(&self.host, &self.key, &query)?)
                    .body(Body::from(part))
                    .expect("valid request setup"),
            )
            .await
            .map_err(|e| anyhow!(SyncError::TransferTransient(e.to_string())))?;
        status_as_result(response.status(), &format!("upload part {} of {}", number, self.key))?;
        let etag = response
            .headers()
            .get(http::header::ETAG)
            .and_then(|t| t.to_str().ok())
            .ok_or_else(|| anyhow!(SyncError::TransferFatal(format!("no etag for part {} of {}", number, self.key))))?
            .to_string();
        self.parts.push(etag);
        Ok(())
    }
}

#[async_trait]
impl DiffSink for ObjectDiffSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(chunk);
        self.bytes += chunk.len() as u64;
        while self.buffer.len() >= self.part_size {
            let part = self.buffer.split_to(self.part_size).freeze();
            self.upload_part(part).await?;
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<Volume> {
        if !self.buffer.is_empty() || self.parts.is_empty() {
            let part = self.buffer.split().freeze();
            self.upload_part(part).await?;
        }

        let complete = complete_body(&self.parts);
        let query = format!("?uploadId={}", self.upload_id);
        let response = self
            .client
            .request(
                Request::post(ObjectStore::object_uri(&self.host, &self.key, &query)?)
                    .body(Body::from(complete))
                    .expect("valid request setup"),
            )
            .await
            .map_err(|e| anyhow!(SyncError::TransferTransient(e.to_string())))?;
        status_as_result(response.status(), &format!("complete upload of {}", self.key))?;

        self.record.size = self.bytes;
        let sidecar_key = format!("{}{}", self.key, SIDECAR_SUFFIX);
        let response = self
            .client
            .request(
                Request::put(ObjectStore::object_uri(&self.host, &sidecar_key, "")?)
                    .body(Body::from(encode_sidecar(&self.record)))
                    .expect("valid request setup"),
            )
            .await
            .map_err(|e| anyhow!(SyncError::TransferTransient(e.to_string())))?;
        status_as_result(response.status(), &format!("write sidecar {}", sidecar_key))?;

        Ok(Volume {
            uuid: self.record.to_uuid,
            parent_uuid: self.record.from_uuid,
            received_uuid: None,
            otime: self.record.otime,
            size: self.record.size,
            paths: self.record.paths.clone(),
        })
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let query = format!("?uploadId={}", self.upload_id);
        let response = self
            .client
            .request(
                Request::delete(ObjectStore::object_uri(&self.host, &self.key, &query)?)
                    .body(Body::empty())
                    .expect("valid request setup"),
            )
            .await
            .map_err(|e| anyhow!(SyncError::TransferTransient(e.to_string())))?;
        status_as_result(response.status(), &format!("abort upload of {}", self.key))
    }
}

async fn read_body(mut body: Body) -> Result<String> {
    let mut data = Vec::new();
    while let Some(chunk) = body.data().await {
        data.extend_from_slice(&chunk.map_err(|e| anyhow!(SyncError::TransferTransient(e.to_string())))?);
    }
    String::from_utf8(data).context("object body is not utf8")
}

fn status_as_result(status: StatusCode, action: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        anyhow!(SyncError::TransferTransient(format!("{}: {}", action, status)))
    } else {
        anyhow!(SyncError::TransferFatal(format!("{}: {}", action, status)))
    })
}

fn parse_list_keys(listing: &str) -> Vec<String> {
    let key_regex = once_regex!(r"<Key>([^<]+)</Key>");
    key_regex
        .captures_iter(listing)
        .map(|m| m.get(1).unwrap().as_str().to_string())
        .collect()
}

/// The token to continue a truncated listing with, if there is one.
fn parse_next_continuation(listing: &str) -> Option<String> {
    let truncated_regex = once_regex!(r"<IsTruncated>\s*true\s*</IsTruncated>");
    let token_regex = once_regex!(r"<NextContinuationToken>([^<]+)</NextContinuationToken>");
    if !truncated_regex.is_match(listing) {
        return None;
    }
    token_regex
        .captures(listing)
        .map(|m| m.get(1).unwrap().as_str().to_string())
}

/// Continuation tokens are opaque base64-ish strings; everything outside
/// the unreserved set must be escaped before reuse in a query string.
fn urlencode(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => (b as char).to_string(),
            other => format!("%{:02X}", other),
        })
        .collect()
}

fn parse_upload_id(body: &str) -> Result<String> {
    let id_regex = once_regex!(r"<UploadId>([^<]+)</UploadId>");
    id_regex
        .captures(body)
        .map(|m| m.get(1).unwrap().as_str().to_string())
        .ok_or_else(|| anyhow!(SyncError::TransferFatal(String::from("initiate response carried no upload id"))))
}

fn parse_multipart_uploads(listing: &str) -> Vec<(String, String)> {
    let upload_regex = once_regex!(r"(?s)<Upload>.*?<Key>([^<]+)</Key>.*?<UploadId>([^<]+)</UploadId>.*?</Upload>");
    upload_regex
        .captures_iter(listing)
        .map(|m| {
            (
                m.get(1).unwrap().as_str().to_string(),
                m.get(2).unwrap().as_str().to_string(),
            )
        })
        .collect()
}

fn complete_body(etags: &[String]) -> String {
    let parts = etags
        .iter()
        .enumerate()
        .map(|(index, etag)| {
            format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                index + 1,
                etag
            )
        })
        .collect::<String>();
    format!("<CompleteMultipartUpload>{}</CompleteMultipartUpload>", parts)
}

fn encode_sidecar(record: &BlobRecord) -> String {
    let pairs: Vec<StringPair> = vec![
        (String::from("to_uuid"), record.to_uuid.to_string()),
        (
            String::from("from_uuid"),
            record.from_uuid.map(|u| u.to_string()).unwrap_or_else(|| String::from("-")),
        ),
        (String::from("size"), record.size.to_string()),
        (
            String::from("otime"),
            record.otime.to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
        (String::from("paths"), record.paths.join(",")),
    ];
    encode_key_value_data(&pairs)
}

fn parse_sidecar(data: &str) -> Result<BlobRecord> {
    let fields: HashMap<String, String> = parse_key_value_data(data)?;
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| anyhow!(SyncError::MetadataCorrupt(format!("sidecar is missing {}", name))))
    };
    Ok(BlobRecord {
        to_uuid: parse_uuid(field("to_uuid")?)?,
        from_uuid: match field("from_uuid")?.as_str() {
            "-" => None,
            other => Some(parse_uuid(other)?),
        },
        size: field("size")?.parse().context("sidecar size is not numeric")?,
        otime: DateTime::parse_from_rfc3339(field("otime")?)
            .context("sidecar otime is not rfc3339")?
            .with_timezone(&Utc),
        paths: match field("paths")?.as_str() {
            "" => Vec::new(),
            joined => joined.split(',').map(|s| s.to_string()).collect(),
        },
    })
}
