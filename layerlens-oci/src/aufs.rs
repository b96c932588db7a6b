//! Coalescing layer listings into the merged view an overlay mount shows.
//!
//! Layers are fed newest first. A file is visible if no newer layer already
//! provided the same path and no newer layer whited it out. Whiteouts come
//! in two forms:
//!
//! - `dir/.wh.name` hides `dir/name` (and everything below it)
//! - `dir/.wh..wh..opq` hides all older content of `dir`
//!
//! A layer's whiteouts only apply to older layers, never to entries in the
//! same layer.

use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use crate::error::{OciError, Result};

pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Opaque directory marker as written by AUFS.
pub const OPAQUE_MARKER: &str = ".wh..wh.opq";
/// Opaque directory marker as written by OCI image tooling.
pub const OCI_OPAQUE_MARKER: &str = ".wh..wh..opq";
/// Prefix of AUFS bookkeeping entries (`.wh..wh.plnk`, `.wh..wh.aufs`, …).
const METADATA_PREFIX: &str = ".wh..wh.";

// ---------------------------------------------------------------------------
// Whiteout grammar
// ---------------------------------------------------------------------------

/// What a layer entry means for the merged view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// An ordinary file.
    File,
    /// A deletion marker hiding the given path prefix (`""` hides everything).
    Whiteout(String),
    /// AUFS bookkeeping; not part of the merged view.
    Metadata,
}

/// Classify one entry path.
pub fn classify(path: &str) -> EntryKind {
    let (dir, base) = match path.rfind('/') {
        Some(pos) => (Some(&path[..pos]), &path[pos + 1..]),
        None => (None, path),
    };

    // Everything under an AUFS bookkeeping directory (`.wh..wh.plnk/...`)
    // is bookkeeping too.
    if dir.is_some_and(|d| d.split('/').any(|c| c.starts_with(METADATA_PREFIX))) {
        return EntryKind::Metadata;
    }
    if base == OPAQUE_MARKER || base == OCI_OPAQUE_MARKER {
        return EntryKind::Whiteout(dir.unwrap_or("").to_string());
    }
    if base.starts_with(METADATA_PREFIX) {
        return EntryKind::Metadata;
    }
    match base.strip_prefix(WHITEOUT_PREFIX) {
        Some(hidden) if !hidden.is_empty() => EntryKind::Whiteout(match dir {
            Some(dir) => format!("{dir}/{hidden}"),
            None => hidden.to_string(),
        }),
        _ => EntryKind::File,
    }
}

/// The path a whiteout entry hides, or `None` if `path` is not a whiteout.
pub fn whiteout_target(path: &str) -> Option<String> {
    match classify(path) {
        EntryKind::Whiteout(target) => Some(target),
        _ => None,
    }
}

/// `true` if whiteout `target` hides `path`.
pub fn masks(target: &str, path: &str) -> bool {
    target.is_empty()
        || path
            .strip_prefix(target)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

// ---------------------------------------------------------------------------
// SearchPath
// ---------------------------------------------------------------------------

/// A normalized lookup path plus the whiteout entries that would hide it
/// when they sit in its own directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPath {
    pub search_path: String,
    pub file_whiteout: String,
    pub path_whiteout: String,
}

impl SearchPath {
    pub fn new(raw: &str) -> Self {
        let unified = raw.replace('\\', "/");
        let search_path = unified.trim_start_matches('/').to_string();
        let (file_whiteout, path_whiteout) = match search_path.rsplit_once('/') {
            Some((dir, base)) => (
                format!("{dir}/{WHITEOUT_PREFIX}{base}"),
                format!("{dir}/{OPAQUE_MARKER}"),
            ),
            None => (
                format!("{WHITEOUT_PREFIX}{search_path}"),
                OPAQUE_MARKER.to_string(),
            ),
        };
        Self {
            search_path,
            file_whiteout,
            path_whiteout,
        }
    }
}

// ---------------------------------------------------------------------------
// LayerIndex + filter
// ---------------------------------------------------------------------------

/// Files attributed to one layer. Depth 1 is the newest layer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LayerIndex {
    pub digest: String,
    pub depth: u32,
    pub files: BTreeSet<String>,
}

/// Outcome of feeding one layer to an [`AufsFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep feeding older layers.
    Continue,
    /// The target path became visible in this layer.
    Found,
    /// The target path is whited out; no older layer can provide it.
    Hidden,
}

/// Incremental whiteout-aware coalescing. Feed layers newest first with
/// strictly increasing depth; with a target path, stop once
/// [`Step::Found`] or [`Step::Hidden`] is returned.
#[derive(Debug)]
pub struct AufsFilter {
    target: Option<SearchPath>,
    last_depth: u32,
    digests: HashSet<String>,
    recorded: HashSet<String>,
    whiteouts: HashSet<String>,
    groups: Vec<LayerIndex>,
    done: Option<Step>,
}

impl AufsFilter {
    /// `target` enables early exit for a single-path lookup; pass `None` for
    /// a full listing.
    pub fn new(target: Option<&str>) -> Self {
        Self {
            target: target.map(SearchPath::new),
            last_depth: 0,
            digests: HashSet::new(),
            recorded: HashSet::new(),
            whiteouts: HashSet::new(),
            groups: Vec::new(),
            done: None,
        }
    }

    /// Once a target lookup has concluded, further layers are ignored.
    pub fn is_done(&self) -> bool {
        self.done.is_some()
    }

    pub fn push(&mut self, layer: LayerIndex) -> Result<Step> {
        if let Some(step) = self.done {
            return Ok(step);
        }
        if layer.depth <= self.last_depth {
            return Err(OciError::Layer(format!(
                "layer {} at depth {} does not follow depth {}",
                layer.digest, layer.depth, self.last_depth
            )));
        }
        self.last_depth = layer.depth;

        if !self.digests.insert(layer.digest.clone()) {
            // Same blob listed twice: its files were already evaluated at
            // the shallower depth.
            debug!(digest = %layer.digest, depth = layer.depth, "skipping repeated layer");
            return Ok(Step::Continue);
        }

        let mut visible = BTreeSet::new();
        let mut layer_whiteouts = Vec::new();
        // A whiteout sitting next to the target hides it without a prefix scan.
        let mut hides_target = false;
        for path in layer.files {
            match classify(&path) {
                EntryKind::Whiteout(target) => {
                    hides_target |= self
                        .target
                        .as_ref()
                        .is_some_and(|t| path == t.file_whiteout || path == t.path_whiteout);
                    layer_whiteouts.push(target);
                }
                EntryKind::Metadata => {}
                EntryKind::File => {
                    if !self.recorded.contains(&path) && !self.is_masked(&path) {
                        visible.insert(path);
                    }
                }
            }
        }

        let found = self
            .target
            .as_ref()
            .is_some_and(|t| visible.contains(&t.search_path));

        self.recorded.extend(visible.iter().cloned());
        if !visible.is_empty() {
            self.groups.push(LayerIndex {
                digest: layer.digest,
                depth: layer.depth,
                files: visible,
            });
        }

        if found {
            self.done = Some(Step::Found);
            return Ok(Step::Found);
        }

        self.whiteouts.extend(layer_whiteouts);

        if let Some(target) = &self.target {
            if hides_target || self.is_masked(&target.search_path) {
                self.done = Some(Step::Hidden);
                return Ok(Step::Hidden);
            }
        }
        Ok(Step::Continue)
    }

    /// Layers that contributed at least one visible file, newest first.
    pub fn finish(self) -> Vec<LayerIndex> {
        self.groups
    }

    /// `true` if a whiteout seen so far hides `path`: the path itself, any
    /// ancestor directory, or the root.
    fn is_masked(&self, path: &str) -> bool {
        if self.whiteouts.is_empty() {
            return false;
        }
        if self.whiteouts.contains("") || self.whiteouts.contains(path) {
            return true;
        }
        path.match_indices('/')
            .any(|(pos, _)| self.whiteouts.contains(&path[..pos]))
    }
}

/// Coalesce a complete newest-first stack in one call.
pub fn filter_layers<I>(layers: I, target: Option<&str>) -> Result<Vec<LayerIndex>>
where
    I: IntoIterator<Item = LayerIndex>,
{
    let mut filter = AufsFilter::new(target);
    for layer in layers {
        if filter.push(layer)? != Step::Continue {
            break;
        }
    }
    Ok(filter.finish())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
