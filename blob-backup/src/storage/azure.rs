//! Azure Blob Storage backend over the REST API.
//!
//! Implements the [`ObjectStore`] contract with plain HTTP calls:
//! - `ensure_ready`: create the container, tolerating "already exists"
//! - `try_get_info`: `HEAD` the blob, 404 means absent
//! - `upload`: single `PUT` block blob with tier and fingerprint metadata,
//!   or staged blocks plus a committed block list for large bodies
//! - `rehydrate`: `Set Blob Tier` to Hot at standard priority
//!
//! Credentials are not acquired here. A SAS token or a bearer token is read
//! from the environment by [`AzureCredential::from_env`]; without either the
//! requests are anonymous. Transport retries are intentionally absent.

use super::{
    cancellable, ObjectBody, ObjectStore, StorageUploadOptions, StoreFactory, StoredObjectInfo,
};
use crate::config::{DestinationSpec, StorageTier};
use crate::transfer::progress_stream::{ProgressStream, UploadProgress};
use crate::utils::{Result, SyncError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, IF_NONE_MATCH};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::fmt;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// REST API version sent with every request
const API_VERSION: &str = "2021-08-06";

pub const SAS_TOKEN_ENV: &str = "AZURE_STORAGE_SAS_TOKEN";
pub const BEARER_TOKEN_ENV: &str = "AZURE_STORAGE_BEARER_TOKEN";

/// Fingerprints live in the blob's `sha256` metadata entry
const FINGERPRINT_HEADER: &str = "x-ms-meta-sha256";
const ACCESS_TIER_HEADER: &str = "x-ms-access-tier";
const ARCHIVE_STATUS_HEADER: &str = "x-ms-archive-status";
const ERROR_CODE_HEADER: &str = "x-ms-error-code";
const BLOB_CONTENT_TYPE_HEADER: &str = "x-ms-blob-content-type";

/// Bodies larger than this are staged as blocks instead of one `Put Blob`
pub const SINGLE_PUT_LIMIT: u64 = 256 * 1024 * 1024;
/// Size of each staged block
pub const BLOCK_SIZE: usize = 64 * 1024 * 1024;

/// How requests are authorized
#[derive(Clone, Default)]
pub enum AzureCredential {
    #[default]
    Anonymous,
    /// Shared access signature, appended to every request's query string
    SasToken(String),
    /// OAuth access token for the storage resource
    BearerToken(String),
}

impl AzureCredential {
    /// SAS token takes precedence over a bearer token.
    pub fn from_env() -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        if let Some(token) = non_empty(SAS_TOKEN_ENV) {
            AzureCredential::SasToken(token)
        } else if let Some(token) = non_empty(BEARER_TOKEN_ENV) {
            AzureCredential::BearerToken(token)
        } else {
            AzureCredential::Anonymous
        }
    }
}

impl fmt::Debug for AzureCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AzureCredential::Anonymous => f.write_str("Anonymous"),
            AzureCredential::SasToken(_) => f.write_str("SasToken(***)"),
            AzureCredential::BearerToken(_) => f.write_str("BearerToken(***)"),
        }
    }
}

/// One container in one storage account
pub struct AzureBlobStore {
    client: Client,
    container_url: Url,
    credential: AzureCredential,
    single_put_limit: u64,
    block_size: usize,
}

impl AzureBlobStore {
    pub fn new(
        client: Client,
        service_uri: &str,
        container: &str,
        credential: AzureCredential,
    ) -> Result<Self> {
        let mut container_url = Url::parse(service_uri).map_err(|e| {
            SyncError::Config(format!("invalid serviceUri '{service_uri}': {e}"))
        })?;
        container_url
            .path_segments_mut()
            .map_err(|_| SyncError::Config(format!("serviceUri '{service_uri}' cannot hold a path")))?
            .pop_if_empty()
            .push(container);

        Ok(Self {
            client,
            container_url,
            credential,
            single_put_limit: SINGLE_PUT_LIMIT,
            block_size: BLOCK_SIZE,
        })
    }

    /// Override when uploads switch to blocks and how large each block is.
    pub fn with_block_upload(mut self, single_put_limit: u64, block_size: usize) -> Self {
        self.single_put_limit = single_put_limit;
        self.block_size = block_size.max(1);
        self
    }

    fn container_endpoint(&self, params: &[(&str, &str)]) -> Url {
        self.with_query(self.container_url.clone(), params)
    }

    fn blob_endpoint(&self, key: &str, params: &[(&str, &str)]) -> Url {
        let mut url = self.container_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.extend(key.split('/'));
        }
        self.with_query(url, params)
    }

    fn with_query(&self, mut url: Url, params: &[(&str, &str)]) -> Url {
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        if let AzureCredential::SasToken(token) = &self.credential {
            let token = token.trim_start_matches('?');
            let query = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{token}"),
                _ => token.to_string(),
            };
            url.set_query(Some(&query));
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header("x-ms-version", API_VERSION)
            .header(
                "x-ms-date",
                Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            );

        match &self.credential {
            AzureCredential::BearerToken(token) => builder.bearer_auth(token),
            _ => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, cancel: &CancellationToken) -> Result<Response> {
        cancellable(cancel, async { Ok(builder.send().await?) }).await
    }

    async fn upload_single(
        &self,
        key: &str,
        body: reqwest::Body,
        len: u64,
        options: &StorageUploadOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut builder = self
            .request(Method::PUT, self.blob_endpoint(key, &[]))
            .header("x-ms-blob-type", "BlockBlob")
            .header(ACCESS_TIER_HEADER, options.tier.as_str())
            .header(CONTENT_LENGTH, len)
            .body(body);

        if let Some(fingerprint) = &options.fingerprint {
            builder = builder.header(FINGERPRINT_HEADER, fingerprint.as_str());
        }
        if let Some(content_type) = &options.content_type {
            builder = builder.header(CONTENT_TYPE, content_type.as_str());
        }
        if !options.overwrite {
            builder = builder.header(IF_NONE_MATCH, "*");
        }

        let response = self.send(builder, cancel).await?;
        if !response.status().is_success() {
            return Err(status_error("put-blob", response).await);
        }
        Ok(())
    }

    /// Stage the body as fixed-size blocks, then commit them in order.
    ///
    /// Tier, fingerprint and content type are set on the commit, and the
    /// blob only becomes visible once the block list is accepted.
    async fn upload_blocks<S>(
        &self,
        key: &str,
        mut body: S,
        len: u64,
        options: &StorageUploadOptions,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    {
        let block_size = self.block_size;
        info!(
            key,
            size = len,
            blocks = len.div_ceil(block_size as u64),
            "Starting block upload"
        );

        let mut block_ids = Vec::new();
        let mut pending = BytesMut::with_capacity(block_size);

        while let Some(chunk) =
            cancellable(cancel, async { Ok(body.next().await.transpose()?) }).await?
        {
            pending.extend_from_slice(&chunk);
            while pending.len() >= block_size {
                let block = pending.split_to(block_size).freeze();
                block_ids.push(self.put_block(key, block_ids.len(), block, cancel).await?);
            }
        }
        if !pending.is_empty() {
            block_ids.push(self.put_block(key, block_ids.len(), pending.freeze(), cancel).await?);
        }

        self.put_block_list(key, &block_ids, options, cancel).await
    }

    async fn put_block(
        &self,
        key: &str,
        index: usize,
        block: Bytes,
        cancel: &CancellationToken,
    ) -> Result<String> {
        // Every ID in a blob must encode to the same length
        let block_id = STANDARD.encode(format!("{index:08}"));
        let url = self.blob_endpoint(key, &[("comp", "block"), ("blockid", &block_id)]);
        let builder = self
            .request(Method::PUT, url)
            .header(CONTENT_LENGTH, block.len())
            .body(block);

        let response = self.send(builder, cancel).await?;
        if !response.status().is_success() {
            return Err(status_error("put-block", response).await);
        }
        debug!(key, block = index, "Staged block");
        Ok(block_id)
    }

    async fn put_block_list(
        &self,
        key: &str,
        block_ids: &[String],
        options: &StorageUploadOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
        for id in block_ids {
            xml.push_str("<Latest>");
            xml.push_str(id);
            xml.push_str("</Latest>");
        }
        xml.push_str("</BlockList>");

        let url = self.blob_endpoint(key, &[("comp", "blocklist")]);
        let mut builder = self
            .request(Method::PUT, url)
            .header(ACCESS_TIER_HEADER, options.tier.as_str())
            .header(CONTENT_LENGTH, xml.len());

        if let Some(fingerprint) = &options.fingerprint {
            builder = builder.header(FINGERPRINT_HEADER, fingerprint.as_str());
        }
        if let Some(content_type) = &options.content_type {
            builder = builder.header(BLOB_CONTENT_TYPE_HEADER, content_type.as_str());
        }
        if !options.overwrite {
            builder = builder.header(IF_NONE_MATCH, "*");
        }

        let response = self.send(builder.body(xml), cancel).await?;
        if !response.status().is_success() {
            return Err(status_error("put-block-list", response).await);
        }
        Ok(())
    }
}

/// Turn an unexpected response into an error, preferring the service's error code.
async fn status_error(operation: &'static str, response: Response) -> SyncError {
    let status = response.status().as_u16();
    let code = response
        .headers()
        .get(ERROR_CODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let message = match code {
        Some(code) => code,
        None => response
            .text()
            .await
            .ok()
            .filter(|body| !body.is_empty())
            .unwrap_or_else(|| "no details".to_string()),
    };

    SyncError::Status {
        operation,
        status,
        message,
    }
}

fn header_string(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl ObjectStore for AzureBlobStore {
    fn describe(&self) -> String {
        let mut url = self.container_url.clone();
        url.set_query(None);
        url.to_string()
    }

    async fn ensure_ready(&self, cancel: &CancellationToken) -> Result<()> {
        let url = self.container_endpoint(&[("restype", "container")]);
        let response = self
            .send(self.request(Method::PUT, url).header(CONTENT_LENGTH, 0), cancel)
            .await?;

        match response.status() {
            StatusCode::CREATED => {
                info!(container = %self.describe(), "Created container");
                Ok(())
            }
            StatusCode::CONFLICT => {
                debug!(container = %self.describe(), "Container already exists");
                Ok(())
            }
            _ => Err(status_error("create-container", response).await),
        }
    }

    async fn try_get_info(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<StoredObjectInfo>> {
        let url = self.blob_endpoint(key, &[]);
        let response = self.send(self.request(Method::HEAD, url), cancel).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error("get-properties", response).await);
        }

        Ok(Some(StoredObjectInfo {
            key: key.to_string(),
            fingerprint: header_string(&response, FINGERPRINT_HEADER),
            tier: header_string(&response, ACCESS_TIER_HEADER),
            archive_status: header_string(&response, ARCHIVE_STATUS_HEADER),
        }))
    }

    async fn upload(
        &self,
        key: &str,
        body: ObjectBody,
        options: &StorageUploadOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let len = body.len();
        let progress_key = key.to_string();
        let stream = ProgressStream::new(
            ReaderStream::new(body.into_reader()),
            len,
            Arc::new(move |progress: UploadProgress| {
                info!(
                    key = %progress_key,
                    sent = progress.sent,
                    total = progress.total,
                    "Uploading ({:.1}%)",
                    progress.percent()
                )
            }),
        );

        if len > self.single_put_limit {
            self.upload_blocks(key, stream, len, options, cancel).await
        } else {
            self.upload_single(key, reqwest::Body::wrap_stream(stream), len, options, cancel)
                .await
        }
    }

    async fn rehydrate(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        let url = self.blob_endpoint(key, &[("comp", "tier")]);
        let builder = self
            .request(Method::PUT, url)
            .header(ACCESS_TIER_HEADER, StorageTier::Hot.as_str())
            .header("x-ms-rehydrate-priority", "Standard")
            .header(CONTENT_LENGTH, 0);

        let response = self.send(builder, cancel).await?;
        if !response.status().is_success() {
            return Err(status_error("set-blob-tier", response).await);
        }
        Ok(())
    }
}

/// Builds [`AzureBlobStore`]s sharing one HTTP client and credential
pub struct AzureStoreFactory {
    client: Client,
    credential: AzureCredential,
}

impl AzureStoreFactory {
    pub fn new(credential: AzureCredential) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("blob-backup/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, credential })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(AzureCredential::from_env())
    }
}

impl StoreFactory for AzureStoreFactory {
    fn create(&self, destination: &DestinationSpec) -> Result<Arc<dyn ObjectStore>> {
        let azure = destination.azure()?;
        let store = AzureBlobStore::new(
            self.client.clone(),
            &azure.service_uri,
            &azure.container,
            self.credential.clone(),
        )?;
        Ok(Arc::new(store))
    }
}
