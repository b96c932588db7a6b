//! Named, expiring locks used to keep concurrent callers from doing the same
//! expensive work twice (downloading one blob, indexing one image).
//!
//! Two back-ends share the [`Locker`] contract:
//!
//! - [`FileLocker`] -- a sentinel file created with `O_EXCL`, holding a random
//!   token and an expiry timestamp. Works across processes sharing a cache
//!   directory. Sentinels past their expiry are reclaimed by the next waiter.
//! - [`MemoryLocker`] -- an in-process table, for callers that never share
//!   state across processes.
//!
//! A waiter polls at a fixed interval until the lock frees up or its
//! acquire timeout elapses. The returned [`LockGuard`] releases on drop and
//! can be extended while held.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::digest::hex_encode;
use crate::error::{OciError, Result};

/// Default interval between acquisition attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a malformed sentinel (a writer died mid-write) is honoured.
const MALFORMED_SENTINEL_GRACE: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Locker: Send + Sync {
    /// Block until `key` is free (or `timeout` elapses), then hold it for
    /// `hold`. Fails with [`OciError::LockTimeout`] on timeout.
    async fn take_lock(&self, key: &str, hold: Duration, timeout: Duration) -> Result<LockGuard>;
}

/// Back-end specific half of a held lock.
pub trait LockHandle: Send + Sync {
    fn extend(&mut self, hold: Duration) -> Result<()>;
    fn release(&mut self);
}

/// A held lock. Dropping it releases the lock.
pub struct LockGuard {
    key: String,
    handle: Option<Box<dyn LockHandle>>,
}

impl LockGuard {
    pub fn new(key: impl Into<String>, handle: Box<dyn LockHandle>) -> Self {
        Self {
            key: key.into(),
            handle: Some(handle),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Push the expiry out to `hold` from now. Fails with
    /// [`OciError::LockLost`] if the lock expired and somebody else took it.
    pub fn extend(&mut self, hold: Duration) -> Result<()> {
        match self.handle.as_mut() {
            Some(h) => h.extend(hold),
            None => Err(OciError::LockLost(self.key.clone())),
        }
    }

    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(mut h) = self.handle.take() {
            h.release();
            debug!(key = %self.key, "lock released");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("held", &self.handle.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FileLocker
// ---------------------------------------------------------------------------

/// Sentinel-file locks rooted at a directory. Key `a/b` maps to
/// `<dir>/a/b.lock`.
#[derive(Debug, Clone)]
pub struct FileLocker {
    dir: PathBuf,
    poll: Duration,
}

impl FileLocker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Path of the sentinel file guarding `key`.
    pub fn sentinel_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", sanitize_key(key)))
    }
}

#[async_trait]
impl Locker for FileLocker {
    async fn take_lock(&self, key: &str, hold: Duration, timeout: Duration) -> Result<LockGuard> {
        let path = self.sentinel_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let token = random_token()?;
            let mut reclaimed = false;

            if try_create_sentinel(&path, &token, expiry_ms(hold)).await? {
                // Confirm the sentinel still carries our token before
                // treating the lock as won.
                if read_sentinel(&path).await?.is_some_and(|s| s.token == token) {
                    debug!(key, path = %path.display(), "lock acquired");
                    return Ok(LockGuard::new(key, Box::new(FileLockHandle { path, token })));
                }
            } else if let Some(existing) = read_sentinel(&path).await? {
                if existing.expires_ms <= now_ms() {
                    warn!(key, path = %path.display(), "reclaiming expired lock");
                    reclaimed = tokio::fs::remove_file(&path).await.is_ok();
                }
            }

            if Instant::now() >= deadline {
                return Err(OciError::LockTimeout(key.to_string()));
            }
            if !reclaimed {
                tokio::time::sleep(self.poll).await;
            }
        }
    }
}

struct FileLockHandle {
    path: PathBuf,
    token: String,
}

impl LockHandle for FileLockHandle {
    fn extend(&mut self, hold: Duration) -> Result<()> {
        match read_sentinel_blocking(&self.path)? {
            Some(s) if s.token == self.token => {
                fs::write(&self.path, sentinel_body(&self.token, expiry_ms(hold)))?;
                Ok(())
            }
            _ => Err(OciError::LockLost(self.path.display().to_string())),
        }
    }

    fn release(&mut self) {
        match read_sentinel_blocking(&self.path) {
            Ok(Some(s)) if s.token == self.token => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "failed to remove lock sentinel");
                }
            }
            Ok(_) => debug!(path = %self.path.display(), "lock already taken over; not removing"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to read lock sentinel"),
        }
    }
}

struct Sentinel {
    token: String,
    expires_ms: u64,
}

fn sentinel_body(token: &str, expires_ms: u64) -> String {
    format!("{token} {expires_ms}\n")
}

/// Atomically create the sentinel. Returns `false` if it already exists.
async fn try_create_sentinel(path: &Path, token: &str, expires_ms: u64) -> Result<bool> {
    let opened = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await;
    match opened {
        Ok(mut f) => {
            f.write_all(sentinel_body(token, expires_ms).as_bytes()).await?;
            f.sync_all().await?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn read_sentinel(path: &Path) -> Result<Option<Sentinel>> {
    let body = match tokio::fs::read_to_string(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let modified = match parse_sentinel(&body) {
        Some(sentinel) => return Ok(Some(sentinel)),
        None => tokio::fs::metadata(path).await.and_then(|m| m.modified()),
    };
    Ok(Some(malformed_sentinel(modified)))
}

/// Blocking twin of [`read_sentinel`] for [`LockHandle`], whose methods are
/// synchronous because release runs from `Drop`.
fn read_sentinel_blocking(path: &Path) -> Result<Option<Sentinel>> {
    let body = match fs::read_to_string(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let modified = match parse_sentinel(&body) {
        Some(sentinel) => return Ok(Some(sentinel)),
        None => fs::metadata(path).and_then(|m| m.modified()),
    };
    Ok(Some(malformed_sentinel(modified)))
}

fn parse_sentinel(body: &str) -> Option<Sentinel> {
    let mut parts = body.split_whitespace();
    let token = parts.next()?;
    let expires_ms = parts.next()?.parse().ok()?;
    Some(Sentinel {
        token: token.to_string(),
        expires_ms,
    })
}

/// Half-written sentinel: honour it for a grace period past its mtime.
fn malformed_sentinel(modified: io::Result<SystemTime>) -> Sentinel {
    let modified = modified.map(system_time_ms).unwrap_or(0);
    Sentinel {
        token: String::new(),
        expires_ms: modified + MALFORMED_SENTINEL_GRACE.as_millis() as u64,
    }
}

/// Keys become relative paths; anything that could escape `dir` is folded.
fn sanitize_key(key: &str) -> String {
    key.split('/')
        .filter(|c| !c.is_empty())
        .map(|c| {
            if c == "." || c == ".." {
                "_".to_string()
            } else {
                c.chars()
                    .map(|ch| {
                        if ch.is_ascii_alphanumeric() || "._:-+@".contains(ch) {
                            ch
                        } else {
                            '_'
                        }
                    })
                    .collect()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn random_token() -> Result<String> {
    let mut buf = [0u8; 16];
    getrandom::fill(&mut buf)
        .map_err(|e| OciError::Io(io::Error::other(format!("lock token: {e}"))))?;
    Ok(hex_encode(&buf))
}

fn system_time_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn now_ms() -> u64 {
    system_time_ms(SystemTime::now())
}

fn expiry_ms(hold: Duration) -> u64 {
    now_ms().saturating_add(hold.as_millis() as u64)
}

// ---------------------------------------------------------------------------
// MemoryLocker
// ---------------------------------------------------------------------------

/// In-process lock table.
#[derive(Clone)]
pub struct MemoryLocker {
    held: Arc<Mutex<HashMap<String, Held>>>,
    next_token: Arc<AtomicU64>,
    poll: Duration,
}

struct Held {
    token: u64,
    expires: Instant,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self {
            held: Arc::new(Mutex::new(HashMap::new())),
            next_token: Arc::new(AtomicU64::new(1)),
            poll: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    fn try_take(&self, key: &str, hold: Duration) -> Option<u64> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if held.get(key).is_some_and(|h| h.expires > now) {
            return None;
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        held.insert(
            key.to_string(),
            Held {
                token,
                expires: now + hold,
            },
        );
        Some(token)
    }
}

impl Default for MemoryLocker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn take_lock(&self, key: &str, hold: Duration, timeout: Duration) -> Result<LockGuard> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(token) = self.try_take(key, hold) {
                debug!(key, "lock acquired");
                return Ok(LockGuard::new(
                    key,
                    Box::new(MemoryLockHandle {
                        held: Arc::clone(&self.held),
                        key: key.to_string(),
                        token,
                    }),
                ));
            }
            if Instant::now() >= deadline {
                return Err(OciError::LockTimeout(key.to_string()));
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}

struct MemoryLockHandle {
    held: Arc<Mutex<HashMap<String, Held>>>,
    key: String,
    token: u64,
}

impl LockHandle for MemoryLockHandle {
    fn extend(&mut self, hold: Duration) -> Result<()> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        match held.get_mut(&self.key) {
            Some(h) if h.token == self.token => {
                h.expires = Instant::now() + hold;
                Ok(())
            }
            _ => Err(OciError::LockLost(self.key.clone())),
        }
    }

    fn release(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.get(&self.key).is_some_and(|h| h.token == self.token) {
            held.remove(&self.key);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
