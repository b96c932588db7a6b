//! layerlens: browse container image contents without pulling the image
//!
//! Images are resolved against the registry, layer blobs are downloaded once
//! into a content-addressed store, and the per-layer listings are merged the
//! way an overlay mount would merge them: newer layers shadow older ones and
//! whiteout entries delete paths from everything beneath them.
//!
//! # Example
//!
//! ```no_run
//! use layerlens::{Config, ImageBrowser};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let browser = ImageBrowser::new(&Config::default())?;
//!     let image = browser.image("library/alpine", "3.20", None).await?;
//!
//!     for entry in browser.list_files("library/alpine", &image).await? {
//!         println!("{} {}", entry.depth, entry.path);
//!     }
//!
//!     let release = browser
//!         .read_file("library/alpine", &image, "/etc/alpine-release")
//!         .await?;
//!     print!("{}", String::from_utf8_lossy(&release));
//!     Ok(())
//! }
//! ```
//!
//! Registry protocol, blob storage and layer parsing live in
//! [`layerlens_oci`], re-exported here as [`oci`].

pub mod browse;
pub mod cache;
pub mod config;
pub mod error;

pub use browse::{FileEntry, ImageBrowser};
pub use cache::ObjectCache;
pub use config::Config;
pub use error::{Error, Result};

pub use layerlens_oci as oci;
pub use layerlens_oci::{Image, ImageRef, LayerIndex, Platform};
