use serde::{Deserialize, Serialize};

use crate::{OciError, Result};

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_V1: &str =
    "application/vnd.docker.distribution.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";

pub const MEDIA_TYPE_DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const MEDIA_TYPE_DOCKER_FOREIGN_LAYER: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

/// The `Accept` header sent for manifest requests, most preferred first.
pub fn manifest_accept_header() -> String {
    [
        MEDIA_TYPE_DOCKER_MANIFEST_LIST,
        MEDIA_TYPE_OCI_INDEX,
        MEDIA_TYPE_DOCKER_MANIFEST,
        MEDIA_TYPE_OCI_MANIFEST,
        MEDIA_TYPE_DOCKER_MANIFEST_V1_SIGNED,
        MEDIA_TYPE_DOCKER_MANIFEST_V1,
    ]
    .join(", ")
}

/// Returns `true` when `media_type` is an image index / manifest list.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

/// Returns `true` when `media_type` is a single image manifest.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

/// Returns `true` for the schema 1 formats.
pub fn is_legacy_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_DOCKER_MANIFEST_V1 || media_type == MEDIA_TYPE_DOCKER_MANIFEST_V1_SIGNED
}

/// Layers that must be fetched from their declared URLs instead of the
/// registry's blob endpoint.
pub fn is_foreign_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_DOCKER_FOREIGN_LAYER || media_type.contains(".nondistributable.")
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A content-addressable descriptor used in both manifests and image indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub digest: String,

    #[serde(default)]
    pub size: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Target platform of an image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Build a `Platform` matching the current host.
    pub fn host() -> Self {
        Self {
            architecture: host_arch().to_string(),
            os: "linux".to_string(),
            os_version: None,
            variant: None,
        }
    }

    /// Parse `os/arch[/variant]`.
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split('/').collect();
        match parts.as_slice() {
            [os, arch] | [os, arch, _] if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                os_version: None,
                variant: parts.get(2).map(|v| v.to_string()),
            }),
            _ => Err(OciError::Manifest(format!(
                "invalid platform {raw:?}, expected os/arch[/variant]"
            ))),
        }
    }

    /// `true` if `self` satisfies `target`; an unset target variant matches
    /// any variant.
    pub fn matches(&self, target: &Platform) -> bool {
        self.architecture == target.architecture
            && self.os == target.os
            && (target.variant.is_none() || self.variant == target.variant)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(v) = &self.variant {
            write!(f, "/{}", v)?;
        }
        Ok(())
    }
}

/// Map Rust `std::env::consts::ARCH` values to OCI / Docker platform strings.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        "s390x" => "s390x",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Manifest variants
// ---------------------------------------------------------------------------

/// A single-platform manifest (OCI image manifest or Docker schema 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,
}

/// A multi-platform manifest list / OCI image index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestList {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub manifests: Vec<Descriptor>,
}

/// Docker schema 1 manifest. Layers and history are listed newest first and
/// carry their metadata inline as `v1Compatibility` JSON strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub tag: String,

    #[serde(default)]
    pub architecture: String,

    #[serde(rename = "fsLayers")]
    pub fs_layers: Vec<FsLayer>,

    #[serde(default)]
    pub history: Vec<V1History>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V1History {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

#[derive(Debug, Default, Deserialize)]
struct V1Compatibility {
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    os: Option<String>,
    #[serde(default)]
    architecture: Option<String>,
    #[serde(default)]
    variant: Option<String>,
    #[serde(default)]
    throwaway: bool,
    #[serde(default)]
    container_config: Option<V1ContainerConfig>,
    #[serde(default)]
    config: Option<ContainerConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct V1ContainerConfig {
    #[serde(rename = "Cmd", default)]
    cmd: Option<Vec<String>>,
}

/// A parsed manifest of any supported shape.
#[derive(Debug, Clone)]
pub enum Manifest {
    Legacy(LegacyManifest),
    Thin(ThinManifest),
    Fat(ManifestList),
}

impl Manifest {
    /// Parse a manifest body. `content_type` is the response `Content-Type`;
    /// when it is missing or not a manifest type, the body's `mediaType` and
    /// then its shape decide.
    pub fn parse(content_type: Option<&str>, body: &[u8]) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| OciError::Manifest(format!("manifest is not JSON: {e}")))?;

        let header_type = content_type
            .map(|ct| ct.split(';').next().unwrap_or("").trim().to_string())
            .filter(|ct| is_known_manifest_type(ct));
        let body_type = raw
            .get("mediaType")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let media_type = match header_type.or(body_type) {
            Some(mt) => mt,
            None => infer_media_type(&raw)?,
        };

        let parsed = if is_index_media_type(&media_type) {
            Manifest::Fat(serde_json::from_value(raw).map_err(manifest_err)?)
        } else if is_manifest_media_type(&media_type) {
            Manifest::Thin(serde_json::from_value(raw).map_err(manifest_err)?)
        } else if is_legacy_media_type(&media_type) {
            Manifest::Legacy(serde_json::from_value(raw).map_err(manifest_err)?)
        } else {
            return Err(OciError::UnsupportedMediaType(media_type));
        };
        Ok(parsed)
    }
}

fn is_known_manifest_type(media_type: &str) -> bool {
    is_index_media_type(media_type)
        || is_manifest_media_type(media_type)
        || is_legacy_media_type(media_type)
}

fn infer_media_type(raw: &serde_json::Value) -> Result<String> {
    let schema = raw.get("schemaVersion").and_then(|v| v.as_u64());
    if schema == Some(1) {
        Ok(MEDIA_TYPE_DOCKER_MANIFEST_V1.to_string())
    } else if raw.get("manifests").is_some() {
        Ok(MEDIA_TYPE_OCI_INDEX.to_string())
    } else if raw.get("config").is_some() && raw.get("layers").is_some() {
        Ok(MEDIA_TYPE_OCI_MANIFEST.to_string())
    } else {
        Err(OciError::Manifest(
            "cannot determine manifest media type".to_string(),
        ))
    }
}

fn manifest_err(e: serde_json::Error) -> OciError {
    OciError::Manifest(e.to_string())
}

// ---------------------------------------------------------------------------
// Image Config
// ---------------------------------------------------------------------------

/// Top-level image configuration blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(rename = "os.version", default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub config: Option<ContainerConfig>,
}

impl ImageConfig {
    pub fn platform(&self) -> Option<Platform> {
        match (&self.os, &self.architecture) {
            (Some(os), Some(arch)) if !os.is_empty() && !arch.is_empty() => Some(Platform {
                os: os.clone(),
                architecture: arch.clone(),
                os_version: self.os_version.clone(),
                variant: self.variant.clone(),
            }),
            _ => None,
        }
    }
}

/// Container runtime configuration extracted from the image config blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContainerConfig {
    #[serde(rename = "Env", default, deserialize_with = "null_as_default")]
    pub env: Vec<String>,

    #[serde(rename = "Cmd", default, deserialize_with = "null_as_default")]
    pub cmd: Vec<String>,

    #[serde(rename = "Entrypoint", default, deserialize_with = "null_as_default")]
    pub entrypoint: Vec<String>,

    #[serde(rename = "WorkingDir", default, deserialize_with = "null_as_default")]
    pub working_dir: String,
}

fn null_as_default<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

/// One build step of an image, oldest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub empty_layer: bool,
}

// ---------------------------------------------------------------------------
// Image model
// ---------------------------------------------------------------------------

/// A layer of a resolved image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Layer {
    pub digest: String,
    pub size: u64,
    pub media_type: String,
    /// Download locations for foreign layers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

impl Layer {
    pub fn is_foreign(&self) -> bool {
        is_foreign_media_type(&self.media_type)
    }
}

impl From<&Descriptor> for Layer {
    fn from(d: &Descriptor) -> Self {
        Self {
            digest: d.digest.clone(),
            size: d.size,
            media_type: d.media_type.clone(),
            urls: d.urls.clone(),
        }
    }
}

/// One concrete, single-platform image. Layers are listed base first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Image {
    pub digest: String,
    pub media_type: String,
    pub platform: Option<Platform>,
    pub layers: Vec<Layer>,
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ContainerConfig>,
}

impl Image {
    /// Build from a thin manifest and its config blob.
    pub fn from_thin(digest: &str, manifest: &ThinManifest, config: ImageConfig) -> Self {
        let media_type = if manifest.media_type.is_empty() {
            MEDIA_TYPE_OCI_MANIFEST.to_string()
        } else {
            manifest.media_type.clone()
        };
        Self {
            digest: digest.to_string(),
            media_type,
            platform: config.platform(),
            layers: manifest.layers.iter().map(Layer::from).collect(),
            history: config.history,
            config: config.config,
        }
    }

    /// Build from a schema 1 manifest, whose metadata is inline.
    pub fn from_legacy(digest: &str, manifest: &LegacyManifest) -> Result<Self> {
        let compat = manifest
            .history
            .iter()
            .map(|h| {
                serde_json::from_str::<V1Compatibility>(&h.v1_compatibility).map_err(|e| {
                    OciError::Manifest(format!("bad v1Compatibility entry: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // Newest entry that names both OS and architecture wins; entries
        // without them contribute no platform.
        let platform = compat.iter().find_map(|c| match (&c.os, &c.architecture) {
            (Some(os), Some(arch)) if !os.is_empty() && !arch.is_empty() => Some(Platform {
                os: os.clone(),
                architecture: arch.clone(),
                os_version: None,
                variant: c.variant.clone(),
            }),
            _ => None,
        });
        let config = compat.first().and_then(|c| c.config.clone());

        let history = compat
            .into_iter()
            .rev()
            .map(|c| HistoryEntry {
                created: c.created,
                created_by: c
                    .container_config
                    .and_then(|cc| cc.cmd)
                    .map(|cmd| cmd.join(" ")),
                author: c.author,
                comment: c.comment,
                empty_layer: c.throwaway,
            })
            .collect();

        let layers = manifest
            .fs_layers
            .iter()
            .rev()
            .map(|l| Layer {
                digest: l.blob_sum.clone(),
                size: 0,
                media_type: MEDIA_TYPE_DOCKER_LAYER.to_string(),
                urls: Vec::new(),
            })
            .collect();

        Ok(Self {
            digest: digest.to_string(),
            media_type: MEDIA_TYPE_DOCKER_MANIFEST_V1.to_string(),
            platform,
            layers,
            history,
            config,
        })
    }

    /// Layers newest first, paired with their depth (1 = newest).
    pub fn search_order(&self) -> impl Iterator<Item = (u32, &Layer)> {
        self.layers
            .iter()
            .rev()
            .enumerate()
            .map(|(i, l)| (i as u32 + 1, l))
    }
}

/// Pick the image built for `target`, if any.
pub fn select_image<'a>(images: &'a [Image], target: &Platform) -> Option<&'a Image> {
    images
        .iter()
        .find(|img| img.platform.as_ref().is_some_and(|p| p.matches(target)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
