//! Read-side OCI registry client and layer tooling.
//!
//! [`registry::RegistryClient`] resolves tags to [`manifest::Image`]s and
//! downloads blobs into a verified [`cache::BlobStore`], negotiating bearer
//! tokens through [`auth::Authenticator`]. [`layer`] reads listings and
//! files out of the stored archives and [`aufs`] merges per-layer listings
//! into the view an overlay mount would show.

pub mod aufs;
pub mod auth;
pub mod cache;
pub mod digest;
pub mod error;
pub mod layer;
pub mod lock;
pub mod manifest;
pub mod registry;

pub use aufs::{filter_layers, AufsFilter, LayerIndex, SearchPath, Step};
pub use auth::{Authenticator, Authorizer};
pub use cache::BlobStore;
pub use digest::Digest;
pub use error::{OciError, Result};
pub use lock::{FileLocker, LockGuard, Locker, MemoryLocker};
pub use manifest::{select_image, HistoryEntry, Image, Layer, Platform};
pub use registry::{ImageRef, RegistryClient, RegistryOptions};
