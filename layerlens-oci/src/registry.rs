use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::TryStreamExt;
use reqwest::header::{
    HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_TYPE, LINK, LOCATION, WWW_AUTHENTICATE,
};
use reqwest::{StatusCode, Url};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::auth::{parse_scope, Authenticator, Challenge, Scope};
use crate::cache::BlobStore;
use crate::digest::Digest;
use crate::error::{OciError, Result};
use crate::manifest::{self, Image, ImageConfig, Layer, Manifest};

/// Header carrying the canonical digest of a manifest response.
const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Manifest lists may point at images, never at further lists.
const MAX_LIST_DEPTH: usize = 1;

/// Registry used for references without a host component.
pub const DOCKER_HUB: &str = "registry-1.docker.io";

// ---------------------------------------------------------------------------
// ImageRef
// ---------------------------------------------------------------------------

/// A parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry hostname (e.g. "registry-1.docker.io").
    pub registry: String,
    /// Repository path (e.g. "library/alpine").
    pub repository: String,
    /// Tag or digest reference (e.g. "latest" or "sha256:abc123").
    pub reference: String,
}

impl ImageRef {
    /// Parse a raw image reference string.
    ///
    /// Supported formats:
    /// - `alpine:latest`
    /// - `ubuntu`
    /// - `ghcr.io/foo/bar:v1`
    /// - `my.registry.io/org/repo@sha256:abc123`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OciError::Reference("empty image reference".to_string()));
        }

        let (name_part, reference) = if let Some(at_pos) = raw.find('@') {
            (&raw[..at_pos], raw[at_pos + 1..].to_string())
        } else if let Some(colon_pos) = raw.rfind(':') {
            // A tag colon always comes after the last '/'; anything earlier
            // is a registry port (e.g. "localhost:5000/repo").
            let after_last_slash = raw.rfind('/').map(|p| p + 1).unwrap_or(0);
            if colon_pos > after_last_slash {
                (&raw[..colon_pos], raw[colon_pos + 1..].to_string())
            } else {
                (raw, "latest".to_string())
            }
        } else {
            (raw, "latest".to_string())
        };

        if name_part.is_empty() || reference.is_empty() {
            return Err(OciError::Reference(format!("malformed image reference {raw:?}")));
        }

        // A component is treated as a registry hostname when it contains a
        // dot or a colon (port), or is "localhost".
        let (registry, repository) = match name_part.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB.to_string(), name_part.to_string()),
        };

        // Docker Hub official images live under "library/".
        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        if repository.is_empty() {
            return Err(OciError::Reference(format!("missing repository in {raw:?}")));
        }

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// Like [`ImageRef::parse`], but references that do not name a registry
    /// resolve against `default_registry` instead of Docker Hub.
    pub fn parse_with_registry(raw: &str, default_registry: &str) -> Result<Self> {
        let raw = raw.trim();
        let names_registry = raw.split_once('/').is_some_and(|(first, _)| {
            first.contains('.') || first.contains(':') || first == "localhost"
        });
        if names_registry || default_registry == DOCKER_HUB || default_registry.is_empty() {
            Self::parse(raw)
        } else {
            Self::parse(&format!("{default_registry}/{raw}"))
        }
    }

    /// `true` when the reference pins a digest rather than a tag.
    pub fn is_digest(&self) -> bool {
        self.reference.contains(':')
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sep = if self.is_digest() { '@' } else { ':' };
        write!(f, "{}/{}{}{}", self.registry, self.repository, sep, self.reference)
    }
}

/// Return the base URL scheme for a registry host.
/// Localhost and loopback registries default to HTTP; everything else to HTTPS.
fn registry_scheme(registry: &str) -> &'static str {
    let host = registry.split(':').next().unwrap_or(registry);
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        "http"
    } else {
        "https"
    }
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// Transport settings for [`RegistryClient`].
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Extra attempts after the first one; redirects and token refreshes
    /// spend from the same budget.
    pub retries: u32,
    pub retry_delay: Duration,
    /// Overall timeout for each HTTP request.
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(60),
            user_agent: concat!("layerlens/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// A manifest as returned by the registry (or the blob store).
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    /// Canonical digest of the manifest bytes.
    pub digest: String,
    pub manifest: Manifest,
}

/// Read-side OCI Distribution client for a single registry.
///
/// Every request goes through [`RegistryClient::send`], which attaches the
/// cached bearer token for the request's scope, answers auth challenges,
/// follows redirects by hand and retries transient failures, all from one
/// bounded budget.
pub struct RegistryClient {
    client: reqwest::Client,
    /// Used for foreign layers only; follows redirects and never carries
    /// registry credentials.
    foreign: reqwest::Client,
    registry: String,
    base_url: Url,
    auth: Arc<Authenticator>,
    store: BlobStore,
    retries: u32,
    retry_delay: Duration,
}

impl RegistryClient {
    pub fn new(registry: &str, store: BlobStore, options: RegistryOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(options.user_agent.as_str())
            .timeout(options.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let foreign = reqwest::Client::builder()
            .user_agent(options.user_agent.as_str())
            .timeout(options.timeout)
            .build()?;
        let base_url = Url::parse(&format!("{}://{}/", registry_scheme(registry), registry))
            .map_err(|e| OciError::Reference(format!("invalid registry host {registry:?}: {e}")))?;

        let auth = Arc::new(Authenticator::new(client.clone()));
        auth.login(registry, None, None);

        Ok(Self {
            client,
            foreign,
            registry: registry.to_string(),
            base_url,
            auth,
            store,
            retries: options.retries,
            retry_delay: options.retry_delay,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// The authenticator negotiating tokens for this registry.
    pub fn authenticator(&self) -> Arc<Authenticator> {
        Arc::clone(&self.auth)
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    /// Replace the credentials used for token requests.
    pub fn login(&self, username: Option<String>, password: Option<SecretString>) {
        self.auth.login(&self.registry, username, password);
    }

    // -- public API ---------------------------------------------------------

    /// Repositories hosted by the registry.
    pub async fn catalog(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct CatalogPage {
            #[serde(default)]
            repositories: Option<Vec<String>>,
        }

        let url = self.endpoint("/v2/_catalog")?;
        self.collect_pages(url, |page: CatalogPage| page.repositories.unwrap_or_default())
            .await
    }

    /// Tags of `repository`. A repository without a tag list has no tags.
    pub async fn tags(&self, repository: &str) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct TagsPage {
            #[serde(default)]
            tags: Option<Vec<String>>,
        }

        let url = self.endpoint(&format!("/v2/{repository}/tags/list"))?;
        match self
            .collect_pages(url, |page: TagsPage| page.tags.unwrap_or_default())
            .await
        {
            Err(e) if e.is_not_found() => {
                debug!(repository, "no tag list");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// Resolve `reference` (tag or digest) to the concrete images it names.
    /// A manifest list yields one image per entry, in list order.
    pub fn images<'a>(
        &'a self,
        repository: &'a str,
        reference: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Image>>> {
        self.resolve(repository, reference.to_string(), 0)
    }

    fn resolve<'a>(
        &'a self,
        repository: &'a str,
        reference: String,
        depth: usize,
    ) -> BoxFuture<'a, Result<Vec<Image>>> {
        Box::pin(async move {
            let fetched = self.fetch_manifest(repository, &reference).await?;
            match fetched.manifest {
                Manifest::Fat(list) => {
                    if depth >= MAX_LIST_DEPTH {
                        return Err(OciError::Manifest(format!(
                            "manifest list {} nested inside another list",
                            fetched.digest
                        )));
                    }
                    debug!(
                        repository,
                        digest = %fetched.digest,
                        entries = list.manifests.len(),
                        "resolving manifest list"
                    );
                    let mut images = Vec::with_capacity(list.manifests.len());
                    for entry in &list.manifests {
                        let children = self
                            .resolve(repository, entry.digest.clone(), depth + 1)
                            .await?;
                        for mut image in children {
                            if image.platform.is_none() {
                                image.platform = entry.platform.clone();
                            }
                            images.push(image);
                        }
                    }
                    Ok(images)
                }
                Manifest::Thin(thin) => {
                    let config = self.fetch_config(repository, &thin.config.digest).await?;
                    Ok(vec![Image::from_thin(&fetched.digest, &thin, config)])
                }
                Manifest::Legacy(legacy) => Ok(vec![Image::from_legacy(&fetched.digest, &legacy)?]),
            }
        })
    }

    /// Fetch and parse one manifest. Manifests requested by digest are
    /// verified and kept in the blob store; repeated lookups read from disk.
    pub async fn fetch_manifest(&self, repository: &str, reference: &str) -> Result<FetchedManifest> {
        let pinned = if reference.contains(':') {
            Some(Digest::parse(reference)?)
        } else {
            None
        };

        if let Some(digest) = &pinned {
            if self.store.contains(digest) {
                debug!(repository, digest = %digest, "manifest served from store");
                let body = self.store.read(digest).await?;
                return Ok(FetchedManifest {
                    digest: digest.to_string(),
                    manifest: Manifest::parse(None, &body)?,
                });
            }
        }

        let url = self.endpoint(&format!("/v2/{repository}/manifests/{reference}"))?;
        let accept = manifest::manifest_accept_header();
        let resp = self.send(url, Some(&accept)).await?;
        let content_type = header_str(resp.headers(), CONTENT_TYPE.as_str());
        let advertised = header_str(resp.headers(), DOCKER_CONTENT_DIGEST);
        let body = resp.bytes().await?;

        let manifest = Manifest::parse(content_type.as_deref(), &body)?;

        let digest = match pinned {
            Some(digest) => {
                self.store.store_bytes(&digest, &body).await?;
                digest
            }
            None => {
                let digest = advertised
                    .as_deref()
                    .and_then(|d| Digest::parse(d).ok())
                    .unwrap_or_else(|| Digest::sha256_of(&body));
                if let Err(e) = self.store.store_bytes(&digest, &body).await {
                    warn!(repository, reference, digest = %digest, error = %e, "manifest not cached");
                }
                digest
            }
        };

        info!(repository, reference, digest = %digest, "fetched manifest");
        Ok(FetchedManifest {
            digest: digest.to_string(),
            manifest,
        })
    }

    /// Make `layer` available in the blob store and return its path.
    /// Foreign layers come straight from their declared URLs without
    /// registry credentials; every blob is verified against its digest.
    pub async fn fetch_blob(&self, repository: &str, layer: &Layer) -> Result<PathBuf> {
        let digest = Digest::parse(&layer.digest)?;
        if layer.is_foreign() && !layer.urls.is_empty() {
            return self.fetch_foreign(&digest, &layer.urls).await;
        }
        self.fetch_registry_blob(repository, &digest).await
    }

    // -- internals ----------------------------------------------------------

    async fn fetch_config(&self, repository: &str, digest: &str) -> Result<ImageConfig> {
        let digest = Digest::parse(digest)?;
        let path = self.fetch_registry_blob(repository, &digest).await?;
        let bytes = tokio::fs::read(&path).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| OciError::Manifest(format!("bad image config {digest}: {e}")))
    }

    async fn fetch_registry_blob(&self, repository: &str, digest: &Digest) -> Result<PathBuf> {
        let url = self.endpoint(&format!("/v2/{repository}/blobs/{digest}"))?;
        self.store
            .get_or_fetch(digest, move || async move {
                let resp = self.send(url, None).await?;
                Ok::<_, OciError>(resp.bytes_stream().map_err(OciError::from))
            })
            .await
    }

    async fn fetch_foreign(&self, digest: &Digest, urls: &[String]) -> Result<PathBuf> {
        self.store
            .get_or_fetch(digest, move || async move {
                let mut last = String::new();
                for url in urls {
                    debug!(%url, digest = %digest, "fetching foreign layer");
                    match self.foreign.get(url).send().await {
                        Ok(resp) if resp.status().is_success() => {
                            return Ok(resp.bytes_stream().map_err(OciError::from));
                        }
                        Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                            last = format!("GET {url} returned 404");
                        }
                        Ok(resp) => last = format!("GET {url} returned {}", resp.status()),
                        Err(e) => last = format!("GET {url}: {e}"),
                    }
                    warn!(%url, error = %last, "foreign layer source failed");
                }
                Err(OciError::Transport(format!(
                    "no source for foreign layer {digest}: {last}"
                )))
            })
            .await
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| OciError::Reference(format!("invalid registry path {path:?}: {e}")))
    }

    /// Follow `Link: <…>; rel="next"` pagination, concatenating pages.
    async fn collect_pages<T, F>(&self, first: Url, mut extract: F) -> Result<Vec<String>>
    where
        T: DeserializeOwned,
        F: FnMut(T) -> Vec<String>,
    {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut url = first;
        loop {
            seen.insert(url.to_string());
            let resp = self.send(url.clone(), None).await?;
            let next = next_link(resp.headers());
            let page: T = serde_json::from_slice(&resp.bytes().await?)?;
            out.extend(extract(page));

            let Some(link) = next else { break };
            let next = url
                .join(&link)
                .map_err(|e| OciError::Transport(format!("bad pagination link {link:?}: {e}")))?;
            if seen.contains(next.as_str()) {
                warn!(url = %next, "pagination loops back; stopping");
                break;
            }
            url = next;
        }
        Ok(out)
    }

    /// Issue a GET against the registry.
    ///
    /// Attempts are bounded by `retries + 1`: 5xx and transport errors sleep
    /// and retry, redirects and successful token refreshes retry at once,
    /// and each of those spends one unit. 404 and auth failures are final.
    pub async fn send(&self, url: Url, accept: Option<&str>) -> Result<reqwest::Response> {
        let mut url = url;
        let mut budget = self.retries;

        loop {
            let scope = parse_scope(url.as_str()).ok();

            let mut req = self.client.get(url.clone());
            if let Some(accept) = accept {
                req = req.header(ACCEPT, accept);
            }
            let cached = scope.as_deref().and_then(|s| self.auth.get_authorization(s));
            if let Some(authorization) = &cached {
                req = req.header(AUTHORIZATION, authorization.header_value());
            }

            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    if budget == 0 {
                        return Err(OciError::Transport(format!("GET {url}: {e}")));
                    }
                    warn!(%url, error = %e, remaining = budget, "request failed, retrying");
                    budget -= 1;
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
            };

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }

            if status == StatusCode::UNAUTHORIZED {
                let header = header_str(resp.headers(), WWW_AUTHENTICATE.as_str()).ok_or_else(|| {
                    OciError::Unauthorized(format!("GET {url} returned 401 without a challenge"))
                })?;
                let requested = scope.ok_or_else(|| {
                    OciError::Unauthorized(format!("GET {url} returned 401 for an unscoped path"))
                })?;
                let challenge = Challenge::parse(&header)?;
                if let Some(challenged) = &challenge.scope {
                    if Scope::parse(challenged)?.resource() != requested {
                        return Err(OciError::ScopeMismatch {
                            requested,
                            challenged: challenged.clone(),
                        });
                    }
                }
                if cached.is_some() {
                    // The registry no longer honours the token we sent.
                    self.auth.revoke(&requested);
                }
                if budget == 0 {
                    return Err(OciError::Unauthorized(format!(
                        "GET {url}: challenge repeated after token refresh"
                    )));
                }
                if !self.auth.update_authorization(&header).await? {
                    return Err(OciError::Unauthorized(format!(
                        "registry refused access to {requested}"
                    )));
                }
                debug!(%url, scope = %requested, "token refreshed, retrying");
                budget -= 1;
                continue;
            }

            if status.is_redirection() {
                let location = header_str(resp.headers(), LOCATION.as_str()).ok_or_else(|| {
                    OciError::Transport(format!("GET {url} returned {status} without Location"))
                })?;
                if budget == 0 {
                    return Err(OciError::Transport(format!(
                        "GET {url}: too many redirects"
                    )));
                }
                let next = url.join(&location).map_err(|e| {
                    OciError::Transport(format!("bad redirect {location:?} from {url}: {e}"))
                })?;
                debug!(from = %url, to = %next, "following redirect");
                url = next;
                budget -= 1;
                continue;
            }

            if status == StatusCode::NOT_FOUND {
                return Err(OciError::NotFound(url.to_string()));
            }

            if budget == 0 {
                return Err(OciError::Transport(format!("GET {url} returned {status}")));
            }
            warn!(%url, %status, remaining = budget, "registry error, retrying");
            budget -= 1;
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Target of the `rel="next"` entry of a `Link` header.
fn next_link(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(LINK)?.to_str().ok()?;
    value.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.contains("rel=\"next\"") {
            return None;
        }
        Some(
            target
                .trim()
                .trim_start_matches('<')
                .trim_end_matches('>')
                .to_string(),
        )
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::jwt;
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn parse_simple_name() {
        let r = ImageRef::parse("ubuntu").unwrap();
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "library/ubuntu");
        assert_eq!(r.reference, "latest");
    }

    #[test]
    fn parse_name_with_tag() {
        let r = ImageRef::parse("alpine:latest").unwrap();
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.reference, "latest");
    }

    #[test]
    fn parse_ghcr() {
        let r = ImageRef::parse("ghcr.io/foo/bar:v1").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "foo/bar");
        assert_eq!(r.reference, "v1");
        assert_eq!(r.to_string(), "ghcr.io/foo/bar:v1");
    }

    #[test]
    fn parse_digest_reference() {
        let r = ImageRef::parse("my.registry.io/org/repo@sha256:abc123").unwrap();
        assert_eq!(r.registry, "my.registry.io");
        assert_eq!(r.repository, "org/repo");
        assert_eq!(r.reference, "sha256:abc123");
        assert!(r.is_digest());
        assert_eq!(r.to_string(), "my.registry.io/org/repo@sha256:abc123");
    }

    #[test]
    fn parse_docker_hub_user_repo() {
        let r = ImageRef::parse("myuser/myrepo:v2").unwrap();
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "myuser/myrepo");
        assert_eq!(r.reference, "v2");
    }

    #[test]
    fn parse_registry_with_port() {
        let r = ImageRef::parse("localhost:5000/myrepo:tag").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "myrepo");
        assert_eq!(r.reference, "tag");
    }

    #[test]
    fn parse_against_default_registry() {
        let r = ImageRef::parse_with_registry("team/app:v3", "registry.internal:5000").unwrap();
        assert_eq!(r.registry, "registry.internal:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.reference, "v3");

        let r = ImageRef::parse_with_registry("ghcr.io/foo/bar", "registry.internal").unwrap();
        assert_eq!(r.registry, "ghcr.io");

        let r = ImageRef::parse_with_registry("alpine", DOCKER_HUB).unwrap();
        assert_eq!(r.repository, "library/alpine");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("alpine:").is_err());
        assert!(ImageRef::parse("ghcr.io/").is_err());
    }

    #[test]
    fn registry_scheme_localhost_is_http() {
        assert_eq!(registry_scheme("localhost:5555"), "http");
        assert_eq!(registry_scheme("localhost"), "http");
        assert_eq!(registry_scheme("127.0.0.1:5000"), "http");
    }

    #[test]
    fn registry_scheme_remote_is_https() {
        assert_eq!(registry_scheme("ghcr.io"), "https");
        assert_eq!(registry_scheme("registry-1.docker.io"), "https");
        assert_eq!(registry_scheme("my.registry.io:443"), "https");
    }

    #[test]
    fn next_link_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            r#"</v2/_catalog?last=b&n=2>; rel="next""#.parse().unwrap(),
        );
        assert_eq!(
            next_link(&headers).as_deref(),
            Some("/v2/_catalog?last=b&n=2")
        );
        assert!(next_link(&HeaderMap::new()).is_none());
    }

    // -- mock registry ------------------------------------------------------

    fn client_for(server: &MockServer, store: &std::path::Path) -> RegistryClient {
        RegistryClient::new(
            &server.address().to_string(),
            BlobStore::new(store),
            RegistryOptions {
                retry_delay: Duration::from_millis(1),
                ..RegistryOptions::default()
            },
        )
        .unwrap()
    }

    fn digest_of(body: &str) -> String {
        Digest::sha256_of(body.as_bytes()).to_string()
    }

    fn config_json(arch: &str) -> String {
        json!({
            "architecture": arch,
            "os": "linux",
            "history": [{ "created_by": format!("ADD {arch}.tar /") }]
        })
        .to_string()
    }

    fn thin_json(config_digest: &str, layer_digest: &str) -> String {
        json!({
            "schemaVersion": 2,
            "mediaType": manifest::MEDIA_TYPE_DOCKER_MANIFEST,
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "digest": config_digest,
                "size": 10
            },
            "layers": [{
                "mediaType": manifest::MEDIA_TYPE_DOCKER_LAYER,
                "digest": layer_digest,
                "size": 20
            }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn catalog_follows_pagination() {
        let server = MockServer::start_async().await;
        let page2 = server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/_catalog").query_param("last", "b");
                then.status(200).json_body(json!({ "repositories": ["c"] }));
            })
            .await;
        let page1 = server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/_catalog").query_param_missing("last");
                then.status(200)
                    .header("link", r#"</v2/_catalog?last=b>; rel="next""#)
                    .json_body(json!({ "repositories": ["a", "b"] }));
            })
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());
        assert_eq!(client.catalog().await.unwrap(), vec!["a", "b", "c"]);
        page1.assert_async().await;
        page2.assert_async().await;
    }

    #[tokio::test]
    async fn missing_tag_list_is_empty() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/ghost/tags/list");
                then.status(404);
            })
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());
        assert!(client.tags("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_errors_exhaust_retry_budget() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/flaky/tags/list");
                then.status(503);
            })
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());
        let err = client.tags("flaky").await.unwrap_err();
        assert!(matches!(err, OciError::Transport(_)), "{err:?}");
        mock.assert_hits_async(4).await;
    }

    #[tokio::test]
    async fn redirect_loop_terminates() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/loop/manifests/latest");
                then.status(307).header("location", "/v2/loop/manifests/latest");
            })
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());
        let err = client.images("loop", "latest").await.unwrap_err();
        assert!(matches!(err, OciError::Transport(_)), "{err:?}");
        mock.assert_hits_async(4).await;
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/nope/manifests/latest");
                then.status(404);
            })
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());
        let err = client.images("nope", "latest").await.unwrap_err();
        assert!(err.is_not_found());
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn challenge_then_token_then_success() {
        let server = MockServer::start_async().await;
        let token = jwt("repository", "private/app", &["pull"]);
        let challenge = format!(
            r#"Bearer realm="{}",service="mock",scope="repository:private/app:pull""#,
            server.url("/token")
        );

        let denied = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v2/private/app/tags/list")
                    .header_missing("authorization");
                then.status(401).header("www-authenticate", challenge.as_str());
            })
            .await;
        let allowed = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v2/private/app/tags/list")
                    .header("authorization", format!("Bearer {token}"));
                then.status(200)
                    .json_body(json!({ "name": "private/app", "tags": ["v1", "v2"] }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/token");
                then.status(200).json_body(json!({ "token": token }));
            })
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());
        assert_eq!(client.tags("private/app").await.unwrap(), vec!["v1", "v2"]);
        denied.assert_hits_async(1).await;
        allowed.assert_hits_async(1).await;

        // The cached token is attached up front on the next call.
        client.tags("private/app").await.unwrap();
        denied.assert_hits_async(1).await;
        allowed.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn rejected_token_is_dropped() {
        let server = MockServer::start_async().await;
        let token = jwt("repository", "private/app", &["pull"]);
        let challenge = format!(
            r#"Bearer realm="{}",service="mock",scope="repository:private/app:pull""#,
            server.url("/token")
        );

        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v2/private/app/tags/list")
                    .header_missing("authorization");
                then.status(401).header("www-authenticate", challenge.as_str());
            })
            .await;
        let mut allowed = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v2/private/app/tags/list")
                    .header("authorization", format!("Bearer {token}"));
                then.status(200)
                    .json_body(json!({ "name": "private/app", "tags": ["v1"] }));
            })
            .await;
        let mut grant = server
            .mock_async(|when, then| {
                when.method(GET).path("/token");
                then.status(200).json_body(json!({ "token": token }));
            })
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());
        client.tags("private/app").await.unwrap();
        let auth = client.authenticator();
        assert!(auth.get_authorization("repository:private/app").is_some());

        // Access is withdrawn server side: the token is now refused and no
        // new one is issued.
        allowed.delete_async().await;
        grant.delete_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v2/private/app/tags/list")
                    .header("authorization", format!("Bearer {token}"));
                then.status(401).header("www-authenticate", challenge.as_str());
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/token");
                then.status(401);
            })
            .await;

        let err = client.tags("private/app").await.unwrap_err();
        assert!(err.is_unauthorized(), "{err:?}");
        assert!(auth.get_authorization("repository:private/app").is_none());
    }

    #[tokio::test]
    async fn mismatched_challenge_scope_fails_hard() {
        let server = MockServer::start_async().await;
        let challenge = format!(
            r#"Bearer realm="{}",service="mock",scope="repository:other:pull""#,
            server.url("/token")
        );
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/mine/tags/list");
                then.status(401).header("www-authenticate", challenge.as_str());
            })
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());
        let err = client.tags("mine").await.unwrap_err();
        assert!(matches!(err, OciError::ScopeMismatch { .. }), "{err:?}");
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn narrower_grant_is_unauthorized() {
        let server = MockServer::start_async().await;
        let token = jwt("repository", "private/app", &[]);
        let challenge = format!(
            r#"Bearer realm="{}",service="mock",scope="repository:private/app:pull""#,
            server.url("/token")
        );
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/private/app/tags/list");
                then.status(401).header("www-authenticate", challenge.as_str());
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/token");
                then.status(200).json_body(json!({ "token": token }));
            })
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());
        let err = client.tags("private/app").await.unwrap_err();
        assert!(err.is_unauthorized(), "{err:?}");
    }

    #[tokio::test]
    async fn manifest_list_resolves_children_in_order() {
        let server = MockServer::start_async().await;

        let amd_config = config_json("amd64");
        let arm_config = config_json("arm64");
        let amd = thin_json(&digest_of(&amd_config), "sha256:aaaa");
        let arm = thin_json(&digest_of(&arm_config), "sha256:bbbb");
        let list = json!({
            "schemaVersion": 2,
            "mediaType": manifest::MEDIA_TYPE_DOCKER_MANIFEST_LIST,
            "manifests": [
                { "mediaType": manifest::MEDIA_TYPE_DOCKER_MANIFEST, "digest": digest_of(&arm), "size": 1,
                  "platform": { "architecture": "arm64", "os": "linux", "variant": "v8" } },
                { "mediaType": manifest::MEDIA_TYPE_DOCKER_MANIFEST, "digest": digest_of(&amd), "size": 1,
                  "platform": { "architecture": "amd64", "os": "linux" } }
            ]
        })
        .to_string();

        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/multi/manifests/latest");
                then.status(200)
                    .header("content-type", manifest::MEDIA_TYPE_DOCKER_MANIFEST_LIST)
                    .header("docker-content-digest", digest_of(&list))
                    .body(list.as_str());
            })
            .await;
        let mut child_mocks = Vec::new();
        for (body, config) in [(&arm, &arm_config), (&amd, &amd_config)] {
            child_mocks.push(
                server
                    .mock_async(|when, then| {
                        when.method(GET)
                            .path(format!("/v2/multi/manifests/{}", digest_of(body)));
                        then.status(200)
                            .header("content-type", manifest::MEDIA_TYPE_DOCKER_MANIFEST)
                            .body(body.as_str());
                    })
                    .await,
            );
            server
                .mock_async(|when, then| {
                    when.method(GET)
                        .path(format!("/v2/multi/blobs/{}", digest_of(config)));
                    then.status(200).body(config.as_str());
                })
                .await;
        }

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());
        let images = client.images("multi", "latest").await.unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].digest, digest_of(&arm));
        assert_eq!(images[0].platform.as_ref().unwrap().architecture, "arm64");
        assert_eq!(images[0].layers[0].digest, "sha256:bbbb");
        assert_eq!(images[1].platform.as_ref().unwrap().architecture, "amd64");
        assert_eq!(images[1].history[0].created_by.as_deref(), Some("ADD amd64.tar /"));

        // Children were fetched by digest and are now served from disk.
        client.images("multi", "latest").await.unwrap();
        for mock in &child_mocks {
            mock.assert_hits_async(1).await;
        }
    }

    #[tokio::test]
    async fn legacy_manifest_resolves_without_config() {
        let server = MockServer::start_async().await;
        let body = json!({
            "schemaVersion": 1,
            "name": "old",
            "tag": "v1",
            "fsLayers": [{ "blobSum": "sha256:top" }, { "blobSum": "sha256:base" }],
            "history": [
                { "v1Compatibility": json!({ "id": "2", "os": "linux", "architecture": "386" }).to_string() },
                { "v1Compatibility": json!({ "id": "1" }).to_string() }
            ]
        })
        .to_string();
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/old/manifests/v1");
                then.status(200)
                    .header("content-type", manifest::MEDIA_TYPE_DOCKER_MANIFEST_V1_SIGNED)
                    .body(body.as_str());
            })
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());
        let images = client.images("old", "v1").await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].digest, digest_of(&body));
        assert_eq!(images[0].platform.as_ref().unwrap().architecture, "386");
        assert_eq!(images[0].layers[0].digest, "sha256:base");
    }

    #[tokio::test]
    async fn foreign_layer_bypasses_registry() {
        let server = MockServer::start_async().await;
        let content = "foreign layer bytes";
        let external = server
            .mock_async(|when, then| {
                when.method(GET).path("/external/layer.tar.gz");
                then.status(200).body(content);
            })
            .await;
        let registry_blob = server
            .mock_async(|when, then| {
                when.method(GET).path_includes("/blobs/");
                then.status(500);
            })
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());
        let layer = Layer {
            digest: digest_of(content),
            size: content.len() as u64,
            media_type: manifest::MEDIA_TYPE_DOCKER_FOREIGN_LAYER.to_string(),
            urls: vec![server.url("/external/layer.tar.gz")],
        };
        let path = client.fetch_blob("win", &layer).await.unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), content);
        external.assert_hits_async(1).await;
        registry_blob.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn corrupted_blob_is_rejected() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path_includes("/v2/app/blobs/");
                then.status(200).body("not what was promised");
            })
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let client = client_for(&server, tmp.path());
        let layer = Layer {
            digest: digest_of("the real layer"),
            size: 14,
            media_type: manifest::MEDIA_TYPE_DOCKER_LAYER.to_string(),
            urls: vec![],
        };
        let err = client.fetch_blob("app", &layer).await.unwrap_err();
        assert!(matches!(err, OciError::DigestMismatch { .. }), "{err:?}");
        // Integrity failures are not retried.
        mock.assert_hits_async(1).await;
        assert!(!client
            .store()
            .contains(&Digest::parse(&layer.digest).unwrap()));
    }
}
