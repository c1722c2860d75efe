//! Backend discovery: filesystem scanning and the optional HTTP catalog.
//!
//! Discovery is best-effort per source. An unreadable directory or an
//! unreachable catalog logs a warning and contributes nothing; it never
//! fails the refresh cycle.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{BackendId, ModelFormat};

/// A model found by discovery, before benchmarking and tier assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredModel {
    /// Identifier derived from the file stem (or catalog name).
    pub id: BackendId,
    /// Human-readable name.
    pub display_name: String,
    /// Serialization format inferred from the file extension.
    pub format: ModelFormat,
    /// File size in bytes.
    pub size_bytes: u64,
    /// On-disk location; `None` for catalog-sourced models.
    pub path: Option<PathBuf>,
}

/// One entry in the HTTP model catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    /// Model name, used as both id and display name.
    pub name: String,
    /// Declared format, e.g. `"gguf"`.
    pub format: String,
    /// Declared size in bytes.
    pub size_bytes: u64,
}

/// Derive a stable backend id from a display name.
///
/// Lowercased, with runs of non-alphanumeric characters collapsed to a
/// single `-`, so `Qwen2.5 Coder (7B)` and `qwen2.5-coder-7b.gguf` yield
/// comparable ids.
pub(crate) fn id_from_name(name: &str) -> BackendId {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    BackendId::new(out)
}

// ── Filesystem scan ──────────────────────────────────────────────────────

/// Recursively scan directories for model files with a recognized extension.
///
/// Unreadable roots and entries are logged and skipped. Files whose
/// extension maps to [`ModelFormat::Unknown`] are ignored.
pub fn scan_roots(roots: &[PathBuf]) -> Vec<DiscoveredModel> {
    let mut found = Vec::new();
    for root in roots {
        scan_dir(root, &mut found);
    }
    debug!(models = found.len(), roots = roots.len(), "filesystem scan complete");
    found
}

fn scan_dir(dir: &Path, found: &mut Vec<DiscoveredModel>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "skipping unreadable discovery root");
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        let path = entry.path();
        if path.is_dir() {
            scan_dir(&path, found);
            continue;
        }

        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        let format = ModelFormat::from_extension(ext);
        if format == ModelFormat::Unknown {
            continue;
        }

        let size_bytes = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unstattable model file");
                continue;
            }
        };

        let display_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unnamed")
            .to_string();

        found.push(DiscoveredModel {
            id: id_from_name(&display_name),
            display_name,
            format,
            size_bytes,
            path: Some(path),
        });
    }
}

// ── HTTP catalog ─────────────────────────────────────────────────────────

/// Fetch the optional HTTP model catalog.
///
/// The catalog is a JSON array of [`CatalogEntry`]. Network or decode
/// failures bubble up to the caller, which logs and carries on with the
/// filesystem results alone.
pub async fn fetch_catalog(
    client: &reqwest::Client,
    url: &str,
) -> Result<Vec<DiscoveredModel>, reqwest::Error> {
    let entries: Vec<CatalogEntry> = client.get(url).send().await?.error_for_status()?.json().await?;
    Ok(entries.into_iter().map(DiscoveredModel::from).collect())
}

impl From<CatalogEntry> for DiscoveredModel {
    fn from(entry: CatalogEntry) -> Self {
        DiscoveredModel {
            id: id_from_name(&entry.name),
            format: ModelFormat::from_extension(&entry.format),
            size_bytes: entry.size_bytes,
            display_name: entry.name,
            path: None,
        }
    }
}
