use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::{Stream, StreamExt};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::digest::{hex_encode, Digest};
use crate::error::{OciError, Result};
use crate::lock::{FileLocker, LockGuard, Locker};

/// Default time a download may hold a blob lock before it is considered stale.
pub const DEFAULT_LOCK_HOLD: Duration = Duration::from_secs(10 * 60);
/// Default time to wait for another caller's download of the same blob.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Content-addressed store for manifests and blobs, laid out as
/// `<root>/<algorithm>/<first two hex chars>/<algorithm>:<hex>`.
///
/// Writes go to a temporary sibling and are renamed into place only after
/// the digest verifies, so a visible blob is always complete. Concurrent
/// fetches of the same digest are serialized through a `.lock` sentinel
/// next to the blob.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    locker: FileLocker,
    lock_hold: Duration,
    lock_timeout: Duration,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            locker: FileLocker::new(root.clone()),
            root,
            lock_hold: DEFAULT_LOCK_HOLD,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timing(mut self, hold: Duration, timeout: Duration) -> Self {
        self.lock_hold = hold;
        self.lock_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.locker = self.locker.with_poll_interval(poll);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Key relative to the root: `sha256/ab/sha256:ab...`.
    fn relative_key(digest: &Digest) -> String {
        format!(
            "{}/{}/{}",
            digest.algorithm(),
            &digest.hex()[..2],
            digest
        )
    }

    /// Where the blob for `digest` lives (whether or not it exists yet).
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(Self::relative_key(digest))
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Read a stored blob into memory.
    pub async fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(OciError::NotFound(format!("blob {digest} not in store")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Verify and persist an in-memory blob (manifests, configs).
    pub async fn store_bytes(&self, digest: &Digest, data: &[u8]) -> Result<PathBuf> {
        digest.verify(data)?;
        let path = self.blob_path(digest);
        if is_stored(&path).await {
            return Ok(path);
        }
        let _guard = self.lock(digest).await?;
        if is_stored(&path).await {
            return Ok(path);
        }

        let tmp = self.temp_path(&path).await?;
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;
        debug!(digest = %digest, path = %path.display(), "stored blob");
        Ok(path)
    }

    /// Return the path of `digest`, downloading it with `fetch` first if it
    /// is not already present. The stream is hashed while it is written and
    /// rejected on mismatch.
    pub async fn get_or_fetch<F, Fut, S, B>(&self, digest: &Digest, fetch: F) -> Result<PathBuf>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S>>,
        S: Stream<Item = Result<B>>,
        B: AsRef<[u8]>,
    {
        // Fail fast on algorithms we cannot verify, before any network I/O.
        digest.verifier()?;

        let path = self.blob_path(digest);
        if is_stored(&path).await {
            debug!(digest = %digest, "blob already cached");
            return Ok(path);
        }

        let mut guard = self.lock(digest).await?;
        // Somebody else may have finished the download while we waited.
        if is_stored(&path).await {
            debug!(digest = %digest, "blob cached by concurrent fetch");
            return Ok(path);
        }

        info!(digest = %digest, "downloading blob");
        let stream = fetch().await?;
        let tmp = self.temp_path(&path).await?;
        match write_verified(digest, stream, &tmp, &mut guard, self.lock_hold).await {
            Ok(written) => {
                fs::rename(&tmp, &path).await?;
                debug!(digest = %digest, bytes = written, "blob stored");
                Ok(path)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&tmp).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %tmp.display(), error = %rm, "failed to remove partial blob");
                    }
                }
                Err(e)
            }
        }
    }

    async fn lock(&self, digest: &Digest) -> Result<LockGuard> {
        self.locker
            .take_lock(&Self::relative_key(digest), self.lock_hold, self.lock_timeout)
            .await
    }

    async fn temp_path(&self, path: &Path) -> Result<PathBuf> {
        let parent = path
            .parent()
            .ok_or_else(|| OciError::Layer(format!("bad blob path {}", path.display())))?;
        fs::create_dir_all(parent).await?;
        let mut nonce = [0u8; 8];
        getrandom::fill(&mut nonce)
            .map_err(|e| OciError::Io(std::io::Error::other(format!("temp name: {e}"))))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(parent.join(format!(".{}.{}.partial", name, hex_encode(&nonce))))
    }
}

async fn is_stored(path: &Path) -> bool {
    fs::metadata(path).await.is_ok_and(|m| m.is_file())
}

/// Stream `stream` into `tmp`, hashing as it goes. The blob lock is pushed
/// out by `hold` whenever half of it has passed, so a download slower than
/// `hold` is not mistaken for a dead holder.
async fn write_verified<S, B>(
    digest: &Digest,
    stream: S,
    tmp: &Path,
    guard: &mut LockGuard,
    hold: Duration,
) -> Result<u64>
where
    S: Stream<Item = Result<B>>,
    B: AsRef<[u8]>,
{
    let mut verifier = digest.verifier()?;
    let mut file = fs::File::create(tmp).await?;
    let mut written = 0u64;
    let mut extended = Instant::now();

    let mut stream = std::pin::pin!(stream);
    while let Some(chunk) = stream.next().await {
        if extended.elapsed() >= hold / 2 {
            guard.extend(hold)?;
            extended = Instant::now();
            debug!(key = guard.key(), bytes = written, "extended blob lock");
        }
        let chunk = chunk?;
        let data = chunk.as_ref();
        verifier.update(data);
        file.write_all(data).await?;
        written += data.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    verifier.finish()?;
    Ok(written)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
