//! End-to-end browsing against a mock registry serving real layer archives.

use std::time::Duration;

use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use httpmock::prelude::*;
use httpmock::Mock;
use layerlens::oci::manifest::{MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST};
use layerlens::oci::Platform;
use layerlens::{Config, Error, ImageBrowser};
use secrecy::SecretString;
use sha2::{Digest as _, Sha256};

const REPO: &str = "team/app";
const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

fn sha256(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

fn layer(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn config_for(server: &MockServer, dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.registry.host = server.address().to_string();
    config.registry.retries = 2;
    config.registry.retry_delay = Duration::from_millis(10);
    config.cache.dir = dir.to_path_buf();
    config
}

async fn serve_blob<'a>(server: &'a MockServer, data: &[u8]) -> Mock<'a> {
    let path = format!("/v2/{REPO}/blobs/{}", sha256(data));
    let data = data.to_vec();
    server
        .mock_async(move |when, then| {
            when.method(GET).path(path);
            then.status(200).body(data);
        })
        .await
}

async fn serve_manifest<'a>(
    server: &'a MockServer,
    reference: &str,
    media_type: &str,
    body: &[u8],
) -> Mock<'a> {
    let path = format!("/v2/{REPO}/manifests/{reference}");
    let media_type = media_type.to_string();
    let digest = sha256(body);
    let body = body.to_vec();
    server
        .mock_async(move |when, then| {
            when.method(GET).path(path);
            then.status(200)
                .header("content-type", media_type)
                .header("docker-content-digest", digest)
                .body(body);
        })
        .await
}

/// Serve config and layers of a single-platform image; returns the
/// manifest bytes and the layer mocks, base layer first.
async fn publish<'a>(
    server: &'a MockServer,
    os: &str,
    arch: &str,
    layers: &[Vec<u8>],
) -> (Vec<u8>, Vec<Mock<'a>>) {
    let config = serde_json::json!({
        "architecture": arch,
        "os": os,
        "config": { "Env": ["PATH=/usr/bin:/bin"], "Cmd": ["/app/run.sh"] },
        "rootfs": { "type": "layers", "diff_ids": [] },
    })
    .to_string()
    .into_bytes();
    serve_blob(server, &config).await;

    let mut mocks = Vec::new();
    let mut descriptors = Vec::new();
    for data in layers {
        mocks.push(serve_blob(server, data).await);
        descriptors.push(serde_json::json!({
            "mediaType": OCI_LAYER,
            "digest": sha256(data),
            "size": data.len(),
        }));
    }

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_OCI_MANIFEST,
        "config": { "mediaType": OCI_CONFIG, "digest": sha256(&config), "size": config.len() },
        "layers": descriptors,
    })
    .to_string()
    .into_bytes();
    (manifest, mocks)
}

fn whiteout_stack() -> Vec<Vec<u8>> {
    let base = layer(&[
        ("bin/sh", b"#!/bin/busybox"),
        ("etc/os-release", b"ID=base"),
        ("etc/passwd", b"root:x:0:0"),
        ("usr/share/doc/README", b"old docs"),
        ("var/cache/apt/pkgcache.bin", b"stale"),
    ]);
    let mid = layer(&[
        ("etc/passwd", b"root:x:0:0\napp:x:1000:1000"),
        ("usr/.wh.share", b""),
        ("var/cache/apt/.wh..wh..opq", b""),
        ("var/cache/apt/fresh.bin", b"fresh"),
    ]);
    let top = layer(&[
        ("app/run.sh", b"exec /app/server"),
        ("etc/os-release", b"ID=layerlens"),
        (".wh..wh.aufs", b""),
    ]);
    vec![base, mid, top]
}

#[tokio::test]
async fn merged_view_honours_whiteouts() {
    let server = MockServer::start_async().await;
    let tmp = tempfile::tempdir().unwrap();
    let layers = whiteout_stack();
    let (manifest, layer_mocks) = publish(&server, "linux", "amd64", &layers).await;
    let manifest_mock = serve_manifest(&server, "v1", MEDIA_TYPE_OCI_MANIFEST, &manifest).await;

    let browser = ImageBrowser::new(&config_for(&server, tmp.path())).unwrap();
    let amd64 = Platform::parse("linux/amd64").unwrap();
    let image = browser.image(REPO, "v1", Some(&amd64)).await.unwrap();
    assert_eq!(image.digest, sha256(&manifest));
    assert_eq!(image.layers.len(), 3);
    assert_eq!(image.config.as_ref().unwrap().cmd, vec!["/app/run.sh"]);

    let files = browser.list_files(REPO, &image).await.unwrap();
    let view: Vec<(u32, &str)> = files.iter().map(|f| (f.depth, f.path.as_str())).collect();
    assert_eq!(
        view,
        vec![
            (1, "app/run.sh"),
            (3, "bin/sh"),
            (1, "etc/os-release"),
            (2, "etc/passwd"),
            (2, "var/cache/apt/fresh.bin"),
        ]
    );
    assert_eq!(files[1].digest, sha256(&layers[0]));

    let passwd = browser.find_file(REPO, &image, "/etc/passwd").await.unwrap();
    assert_eq!(passwd.digest, sha256(&layers[1]));
    assert_eq!(
        browser.read_file(REPO, &image, "etc/os-release").await.unwrap(),
        b"ID=layerlens"
    );
    assert_eq!(
        browser.read_file(REPO, &image, "\\bin\\sh").await.unwrap(),
        b"#!/bin/busybox"
    );

    for gone in ["usr/share/doc/README", "var/cache/apt/pkgcache.bin", "usr/share"] {
        let err = browser.read_file(REPO, &image, gone).await.unwrap_err();
        assert!(err.is_not_found(), "{gone}: {err}");
        assert_eq!(err.status_code(), 404);
    }

    // Each blob crossed the wire once.
    for mock in &layer_mocks {
        mock.assert_hits_async(1).await;
    }
    manifest_mock.assert_hits_async(1).await;

    // A fresh browser over the same cache dir re-resolves the tag but reads
    // layers from disk.
    let again = ImageBrowser::new(&config_for(&server, tmp.path())).unwrap();
    let image = again.image(REPO, "v1", None).await.unwrap();
    assert_eq!(again.list_files(REPO, &image).await.unwrap().len(), 5);
    manifest_mock.assert_hits_async(2).await;
    for mock in &layer_mocks {
        mock.assert_hits_async(1).await;
    }
}

#[tokio::test]
async fn index_selects_platform() {
    let server = MockServer::start_async().await;
    let tmp = tempfile::tempdir().unwrap();

    let (amd, _) = publish(
        &server,
        "linux",
        "amd64",
        &[layer(&[("etc/arch", b"x86_64")])],
    )
    .await;
    let (arm, _) = publish(
        &server,
        "linux",
        "arm64",
        &[layer(&[("etc/arch", b"aarch64")])],
    )
    .await;
    serve_manifest(&server, &sha256(&amd), MEDIA_TYPE_OCI_MANIFEST, &amd).await;
    serve_manifest(&server, &sha256(&arm), MEDIA_TYPE_OCI_MANIFEST, &arm).await;

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_OCI_INDEX,
        "manifests": [
            { "mediaType": MEDIA_TYPE_OCI_MANIFEST, "digest": sha256(&amd), "size": amd.len(),
              "platform": { "architecture": "amd64", "os": "linux" } },
            { "mediaType": MEDIA_TYPE_OCI_MANIFEST, "digest": sha256(&arm), "size": arm.len(),
              "platform": { "architecture": "arm64", "os": "linux" } },
        ],
    })
    .to_string()
    .into_bytes();
    serve_manifest(&server, "multi", MEDIA_TYPE_OCI_INDEX, &index).await;

    let browser = ImageBrowser::new(&config_for(&server, tmp.path())).unwrap();
    let images = browser.images(REPO, "multi").await.unwrap();
    let platforms: Vec<String> = images
        .iter()
        .map(|i| i.platform.as_ref().unwrap().to_string())
        .collect();
    assert_eq!(platforms, vec!["linux/amd64", "linux/arm64"]);

    let arm64 = Platform::parse("linux/arm64").unwrap();
    let image = browser.image(REPO, "multi", Some(&arm64)).await.unwrap();
    assert_eq!(image.digest, sha256(&arm));
    assert_eq!(
        browser.read_file(REPO, &image, "etc/arch").await.unwrap(),
        b"aarch64"
    );

    // No match falls back to the first entry.
    let s390x = Platform::parse("linux/s390x").unwrap();
    let image = browser.image(REPO, "multi", Some(&s390x)).await.unwrap();
    assert_eq!(image.digest, sha256(&amd));
}

#[tokio::test]
async fn catalog_and_missing_tags() {
    let server = MockServer::start_async().await;
    let tmp = tempfile::tempdir().unwrap();
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/_catalog");
            then.status(200)
                .json_body(serde_json::json!({ "repositories": ["team/app", "team/db"] }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v2/team/empty/tags/list");
            then.status(404);
        })
        .await;

    let browser = ImageBrowser::new(&config_for(&server, tmp.path())).unwrap();
    assert_eq!(browser.catalog().await.unwrap(), vec!["team/app", "team/db"]);
    assert!(browser.tags("team/empty").await.unwrap().is_empty());

    let err = browser.images("team/empty", "latest").await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

fn jwt(name: &str) -> String {
    let claims = serde_json::json!({
        "iss": "mock",
        "access": [{ "type": "repository", "name": name, "actions": ["pull"] }],
    });
    let enc = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    format!(
        "{}.{}.sig",
        enc.encode(br#"{"alg":"none"}"#),
        enc.encode(claims.to_string())
    )
}

fn basic(user: &str, password: &str) -> String {
    let enc = base64::engine::general_purpose::STANDARD;
    format!("Basic {}", enc.encode(format!("{user}:{password}")))
}

#[tokio::test]
async fn revoked_credentials_cannot_read_cached_tags() {
    let server = MockServer::start_async().await;
    let tmp = tempfile::tempdir().unwrap();
    let token = jwt(REPO);
    let challenge = format!(
        r#"Bearer realm="{}",service="mock-registry",scope="repository:{REPO}:pull""#,
        server.url("/token")
    );

    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/v2/{REPO}/tags/list"))
                .header_missing("authorization");
            then.status(401).header("www-authenticate", challenge);
        })
        .await;
    let tags = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/v2/{REPO}/tags/list"))
                .header("authorization", format!("Bearer {token}"));
            then.status(200)
                .json_body(serde_json::json!({ "name": REPO, "tags": ["v1", "v2"] }));
        })
        .await;
    let granted = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/token")
                .header("authorization", basic("reader", "pw"));
            then.status(200)
                .json_body(serde_json::json!({ "token": token, "expires_in": 300 }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/token")
                .header("authorization", basic("revoked", "pw"));
            then.status(401);
        })
        .await;

    let mut config = config_for(&server, tmp.path());
    config.registry.username = Some("reader".to_string());
    config.registry.password = Some(SecretString::from("pw"));
    let browser = ImageBrowser::new(&config).unwrap();

    assert_eq!(browser.tags(REPO).await.unwrap(), vec!["v1", "v2"]);
    assert_eq!(browser.tags(REPO).await.unwrap(), vec!["v1", "v2"]);
    tags.assert_hits_async(1).await;
    granted.assert_hits_async(1).await;

    // New identity, no grant: the cached tag list must not be served.
    browser.login(Some("revoked".to_string()), Some(SecretString::from("pw")));
    let err = browser.tags(REPO).await.unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)), "{err}");
    assert_eq!(err.status_code(), 401);
    tags.assert_hits_async(1).await;
}
