//! Content store over the OCI distribution API of a remote registry.
//!
//! The store consumes the HTTP machinery through the [`RegistryTransport`] trait; the default
//! [`HttpTransport`] implementation speaks the distribution API with token authentication and
//! a single transparent retry for transient transport errors. Blob uploads stream through the
//! POST / PATCH / PUT monolithic-upload flow, so a layer never has to be buffered in memory.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use oci_spec::image::{Descriptor, Digest};
use reqwest::{header, Body, Client, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use tokio::{sync::RwLock, task};

use crate::{media, reference::Reference, utils, EdgepackError, EdgepackResult};

use super::{BlobFetcher, BlobPusher, BlobStream, BlobWriter, ContentStore};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Transient transport errors are retried at most this many times before surfacing.
const MAX_TRANSPORT_RETRIES: u32 = 1;

const UPLOAD_PIPE_DEPTH: usize = 4;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The transport a [`RegistryStore`] drives the distribution API through.
///
/// The store itself is transport-agnostic; anything that can resolve manifests, move blob
/// bytes and finish uploads can stand in, which is how the tests run without a network.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Resolves a reference to its manifest descriptor.
    async fn resolve(&self, reference: &Reference) -> EdgepackResult<Descriptor>;

    /// Opens a byte stream over a manifest or blob.
    async fn fetch(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
    ) -> EdgepackResult<BlobStream>;

    /// Checks whether the repository already holds a blob.
    async fn blob_exists(&self, reference: &Reference, digest: &Digest) -> EdgepackResult<bool>;

    /// Starts a blob upload session, returning its location URL.
    async fn begin_blob_upload(&self, reference: &Reference) -> EdgepackResult<String>;

    /// Streams blob bytes into an upload session, returning the location to complete at.
    async fn upload_blob(&self, location: String, body: BlobStream) -> EdgepackResult<String>;

    /// Completes an upload session, registering the blob under its digest.
    async fn complete_blob_upload(&self, location: String, digest: &Digest)
        -> EdgepackResult<()>;

    /// Publishes a manifest under the reference's tag.
    async fn put_manifest(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        payload: Bytes,
    ) -> EdgepackResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A content store backed by a remote registry.
#[derive(Clone)]
pub struct RegistryStore {
    transport: Arc<dyn RegistryTransport>,
}

struct RegistryFetcher {
    transport: Arc<dyn RegistryTransport>,
    reference: Reference,
}

struct RegistryPusher {
    transport: Arc<dyn RegistryTransport>,
    reference: Reference,
}

/// Streams blob bytes into an open upload session.
struct UploadWriter {
    transport: Arc<dyn RegistryTransport>,
    tx: Option<futures::channel::mpsc::Sender<EdgepackResult<Bytes>>>,
    upload: Option<task::JoinHandle<EdgepackResult<String>>>,
    hasher: Sha256,
    size: u64,
    committed: bool,
}

/// Receives a blob the registry already holds; commit verifies and succeeds without
/// re-uploading.
struct ExistingBlobWriter {
    hasher: Sha256,
    size: u64,
    committed: bool,
}

/// Caches manifest bytes and publishes them on commit.
struct ManifestWriter {
    transport: Arc<dyn RegistryTransport>,
    reference: Reference,
    descriptor: Descriptor,
    buffer: Vec<u8>,
    committed: bool,
}

/// The default [`RegistryTransport`]: reqwest with retry middleware and Bearer-token auth.
pub struct HttpTransport {
    client: ClientWithMiddleware,
    tokens: RwLock<HashMap<String, String>>,
    username: Option<String>,
    password: Option<String>,
    plain_http: bool,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// A parsed `WWW-Authenticate: Bearer` challenge.
#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: String,
    scope: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegistryStore {
    /// Creates a store over the given transport.
    pub fn new(transport: Arc<dyn RegistryTransport>) -> Self {
        Self { transport }
    }
}

impl HttpTransport {
    /// Creates a transport with anonymous credentials.
    pub fn new() -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(MAX_TRANSPORT_RETRIES);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            tokens: RwLock::new(HashMap::new()),
            username: None,
            password: None,
            plain_http: false,
        }
    }

    /// Sets basic credentials used when fetching tokens.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Talks plain HTTP instead of HTTPS, for local registries.
    pub fn with_plain_http(mut self) -> Self {
        self.plain_http = true;
        self
    }

    fn scheme(&self) -> &'static str {
        if self.plain_http {
            "http"
        } else {
            "https"
        }
    }

    fn base_url(&self, reference: &Reference) -> String {
        format!(
            "{}://{}/v2/{}",
            self.scheme(),
            reference.api_host(),
            reference.get_repository()
        )
    }

    fn absolutize(&self, reference: &Reference, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}://{}{}", self.scheme(), reference.api_host(), location)
        }
    }

    async fn bearer_token(&self, reference: &Reference) -> Option<String> {
        let tokens = self.tokens.read().await;
        tokens.get(reference.get_repository()).cloned()
    }

    /// Obtains a token for the challenge and caches it per repository.
    async fn authenticate(
        &self,
        reference: &Reference,
        challenge_header: &str,
    ) -> EdgepackResult<()> {
        let challenge = parse_bearer_challenge(challenge_header).ok_or_else(|| {
            EdgepackError::TransportAuth(format!(
                "unsupported authentication challenge: {}",
                challenge_header
            ))
        })?;

        let scope = challenge
            .scope
            .unwrap_or_else(|| format!("repository:{}:pull,push", reference.get_repository()));

        let mut request = self
            .client
            .get(&challenge.realm)
            .query(&[("service", challenge.service.as_str()), ("scope", scope.as_str())]);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(EdgepackError::TransportAuth(format!(
                "token fetch failed with status {}",
                response.status()
            )));
        }

        let material: TokenResponse = response.json().await?;
        let token = material
            .token
            .or(material.access_token)
            .ok_or_else(|| EdgepackError::TransportAuth("token missing in response".into()))?;

        self.tokens
            .write()
            .await
            .insert(reference.get_repository().clone(), token);
        Ok(())
    }

    /// Sends the request built by `build`, re-authenticating and retrying once on a 401.
    async fn execute<F>(&self, reference: &Reference, build: F) -> EdgepackResult<reqwest::Response>
    where
        F: Fn(&ClientWithMiddleware) -> reqwest_middleware::RequestBuilder + Send + Sync,
    {
        let mut request = build(&self.client);
        if let Some(token) = self.bearer_token(reference).await {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                EdgepackError::TransportAuth("401 without authentication challenge".into())
            })?;
        self.authenticate(reference, &challenge).await?;

        let mut request = build(&self.client);
        if let Some(token) = self.bearer_token(reference).await {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a `Bearer realm="…",service="…",scope="…"` challenge.
fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let rest = header.trim().strip_prefix("Bearer ")?;

    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for part in rest.split(',') {
        let part = part.trim();
        let (key, value) = part.split_once('=')?;
        let value = value.trim_matches('"').to_string();
        match key {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }

    Some(BearerChallenge {
        realm: realm?,
        service: service.unwrap_or_default(),
        scope,
    })
}

/// Appends the digest query parameter to an upload location.
fn complete_url(location: &str, digest: &Digest) -> String {
    let separator = if location.contains('?') { '&' } else { '?' };
    format!("{}{}digest={}", location, separator, digest)
}

fn status_error(operation: &str, status: StatusCode) -> EdgepackError {
    match status {
        StatusCode::NOT_FOUND => EdgepackError::NotFound(operation.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            EdgepackError::TransportAuth(format!("{}: status {}", operation, status))
        }
        status => EdgepackError::Transport(format!("{}: unexpected status {}", operation, status)),
    }
}

fn verify(
    expected_size: u64,
    expected_digest: Option<Digest>,
    actual_size: u64,
    actual_digest: Digest,
) -> EdgepackResult<()> {
    if expected_size > 0 && expected_size != actual_size {
        return Err(EdgepackError::SizeMismatch {
            expected: expected_size,
            actual: actual_size,
        });
    }
    if let Some(expected) = expected_digest {
        if expected != actual_digest {
            return Err(EdgepackError::DigestMismatch {
                expected: expected.to_string(),
                actual: actual_digest.to_string(),
            });
        }
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentStore for RegistryStore {
    async fn resolve(&self, reference: &str) -> EdgepackResult<Descriptor> {
        let reference: Reference = reference.parse()?;
        self.transport.resolve(&reference).await
    }

    async fn fetcher(&self, reference: &str) -> EdgepackResult<Box<dyn BlobFetcher>> {
        let reference: Reference = reference.parse()?;
        Ok(Box::new(RegistryFetcher {
            transport: self.transport.clone(),
            reference,
        }))
    }

    async fn pusher(&self, reference: &str) -> EdgepackResult<Box<dyn BlobPusher>> {
        let reference: Reference = reference.parse()?;
        Ok(Box::new(RegistryPusher {
            transport: self.transport.clone(),
            reference,
        }))
    }

    async fn finalize(&self, _reference: &str) -> EdgepackResult<()> {
        Ok(())
    }
}

#[async_trait]
impl BlobFetcher for RegistryFetcher {
    async fn fetch(&self, descriptor: &Descriptor) -> EdgepackResult<BlobStream> {
        self.transport.fetch(&self.reference, descriptor).await
    }
}

#[async_trait]
impl BlobPusher for RegistryPusher {
    async fn push(&self, descriptor: &Descriptor) -> EdgepackResult<Box<dyn BlobWriter>> {
        if media::is_manifest_media_type(&descriptor.media_type().to_string()) {
            return Ok(Box::new(ManifestWriter {
                transport: self.transport.clone(),
                reference: self.reference.clone(),
                descriptor: descriptor.clone(),
                buffer: Vec::with_capacity(descriptor.size() as usize),
                committed: false,
            }));
        }

        if self
            .transport
            .blob_exists(&self.reference, descriptor.digest())
            .await?
        {
            tracing::debug!("blob {} already present, skipping upload", descriptor.digest());
            return Ok(Box::new(ExistingBlobWriter {
                hasher: Sha256::new(),
                size: 0,
                committed: false,
            }));
        }

        let location = self.transport.begin_blob_upload(&self.reference).await?;
        let (tx, rx) = futures::channel::mpsc::channel::<EdgepackResult<Bytes>>(UPLOAD_PIPE_DEPTH);
        let transport = self.transport.clone();
        let upload = task::spawn(async move { transport.upload_blob(location, rx.boxed()).await });

        Ok(Box::new(UploadWriter {
            transport: self.transport.clone(),
            tx: Some(tx),
            upload: Some(upload),
            hasher: Sha256::new(),
            size: 0,
            committed: false,
        }))
    }
}

#[async_trait]
impl BlobWriter for UploadWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> EdgepackResult<()> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| EdgepackError::WriterClosed("registry upload".into()))?;

        if tx.send(Ok(Bytes::copy_from_slice(bytes))).await.is_err() {
            // The upload task bailed out; join it to surface the real error.
            if let Some(upload) = self.upload.take() {
                upload.await.map_err(EdgepackError::custom)??;
            }
            return Err(EdgepackError::Transport("blob upload aborted".into()));
        }

        self.hasher.update(bytes);
        self.size += bytes.len() as u64;
        Ok(())
    }

    fn digest(&self) -> Digest {
        utils::digest_from_sha256(self.hasher.clone().finalize().as_slice())
    }

    async fn commit(
        &mut self,
        expected_size: u64,
        expected_digest: Option<Digest>,
    ) -> EdgepackResult<()> {
        if self.committed {
            return Ok(());
        }

        self.tx.take();
        let location = match self.upload.take() {
            Some(upload) => upload.await.map_err(EdgepackError::custom)??,
            None => return Err(EdgepackError::WriterClosed("registry upload".into())),
        };

        let actual = self.digest();
        verify(expected_size, expected_digest.clone(), self.size, actual.clone())?;

        let digest = expected_digest.unwrap_or(actual);
        self.transport.complete_blob_upload(location, &digest).await?;
        self.committed = true;
        Ok(())
    }

    async fn close(&mut self) -> EdgepackResult<()> {
        self.tx.take();
        if let Some(upload) = self.upload.take() {
            upload.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl BlobWriter for ExistingBlobWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> EdgepackResult<()> {
        self.hasher.update(bytes);
        self.size += bytes.len() as u64;
        Ok(())
    }

    fn digest(&self) -> Digest {
        utils::digest_from_sha256(self.hasher.clone().finalize().as_slice())
    }

    async fn commit(
        &mut self,
        expected_size: u64,
        expected_digest: Option<Digest>,
    ) -> EdgepackResult<()> {
        if self.committed {
            return Ok(());
        }
        verify(expected_size, expected_digest, self.size, self.digest())?;
        self.committed = true;
        Ok(())
    }

    async fn close(&mut self) -> EdgepackResult<()> {
        Ok(())
    }
}

#[async_trait]
impl BlobWriter for ManifestWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> EdgepackResult<()> {
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn digest(&self) -> Digest {
        utils::sha256_digest(&self.buffer)
    }

    async fn commit(
        &mut self,
        expected_size: u64,
        expected_digest: Option<Digest>,
    ) -> EdgepackResult<()> {
        if self.committed {
            return Ok(());
        }

        verify(
            expected_size,
            expected_digest,
            self.buffer.len() as u64,
            self.digest(),
        )?;

        let payload = Bytes::from(std::mem::take(&mut self.buffer));
        self.transport
            .put_manifest(&self.reference, &self.descriptor, payload)
            .await?;
        self.committed = true;
        Ok(())
    }

    async fn close(&mut self) -> EdgepackResult<()> {
        self.buffer.clear();
        Ok(())
    }
}

#[async_trait]
impl RegistryTransport for HttpTransport {
    async fn resolve(&self, reference: &Reference) -> EdgepackResult<Descriptor> {
        let url = format!(
            "{}/manifests/{}",
            self.base_url(reference),
            reference.tag_or_digest()
        );
        let response = self
            .execute(reference, |client| {
                client.get(&url).header(header::ACCEPT, MANIFEST_ACCEPT)
            })
            .await?;

        if !response.status().is_success() {
            return Err(status_error(
                &format!("resolve {}", reference),
                response.status(),
            ));
        }

        let media_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(media::MEDIA_TYPE_OCI_IMAGE_MANIFEST)
            .to_string();
        let header_digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let body = response.bytes().await?;
        let digest = match header_digest {
            Some(digest) => utils::parse_digest(&digest)?,
            None => utils::sha256_digest(&body),
        };

        utils::new_descriptor(&media_type, digest, body.len() as u64, HashMap::new())
    }

    async fn fetch(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
    ) -> EdgepackResult<BlobStream> {
        let media_type = descriptor.media_type().to_string();
        let url = if media::is_manifest_media_type(&media_type) {
            format!("{}/manifests/{}", self.base_url(reference), descriptor.digest())
        } else {
            format!("{}/blobs/{}", self.base_url(reference), descriptor.digest())
        };

        let response = self
            .execute(reference, |client| {
                client.get(&url).header(header::ACCEPT, MANIFEST_ACCEPT)
            })
            .await?;

        if !response.status().is_success() {
            return Err(status_error(
                &format!("fetch {}", descriptor.digest()),
                response.status(),
            ));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(EdgepackError::from));
        Ok(stream.boxed())
    }

    async fn blob_exists(&self, reference: &Reference, digest: &Digest) -> EdgepackResult<bool> {
        let url = format!("{}/blobs/{}", self.base_url(reference), digest);
        let response = self.execute(reference, |client| client.head(&url)).await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(status_error(&format!("head {}", digest), status)),
        }
    }

    async fn begin_blob_upload(&self, reference: &Reference) -> EdgepackResult<String> {
        let url = format!("{}/blobs/uploads/", self.base_url(reference));
        let response = self
            .execute(reference, |client| {
                client.post(&url).header(header::CONTENT_LENGTH, 0)
            })
            .await?;

        if response.status() != StatusCode::ACCEPTED {
            return Err(status_error("begin blob upload", response.status()));
        }

        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                EdgepackError::Transport("upload start did not return a location".into())
            })?;
        Ok(self.absolutize(reference, location))
    }

    async fn upload_blob(&self, location: String, body: BlobStream) -> EdgepackResult<String> {
        // The body stream can only be consumed once, so this request runs outside the
        // challenge-retry loop; the session token was already obtained when the upload began.
        let response = self
            .client
            .patch(&location)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::wrap_stream(body))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error("patch blob upload", response.status()));
        }

        let next = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .unwrap_or(location);
        Ok(next)
    }

    async fn complete_blob_upload(
        &self,
        location: String,
        digest: &Digest,
    ) -> EdgepackResult<()> {
        let url = complete_url(&location, digest);
        let response = self
            .client
            .put(&url)
            .header(header::CONTENT_LENGTH, 0)
            .send()
            .await?;

        if response.status() != StatusCode::CREATED && !response.status().is_success() {
            return Err(status_error("complete blob upload", response.status()));
        }
        Ok(())
    }

    async fn put_manifest(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        payload: Bytes,
    ) -> EdgepackResult<()> {
        let target = reference
            .tag()
            .map(str::to_string)
            .unwrap_or_else(|| descriptor.digest().to_string());
        let url = format!("{}/manifests/{}", self.base_url(reference), target);
        let media_type = descriptor.media_type().to_string();

        let response = self
            .execute(reference, move |client| {
                client
                    .put(&url)
                    .header(header::CONTENT_TYPE, media_type.clone())
                    .body(payload.clone())
            })
            .await?;

        if !response.status().is_success() {
            return Err(status_error("put manifest", response.status()));
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
