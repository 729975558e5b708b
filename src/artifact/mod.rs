//! Server artifact (jar) lookup - on disk and through the catalog.

pub mod download;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::supervisor::error::{SupervisorError, SupervisorResult};

pub use download::Downloader;

/// One downloadable server version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// e.g. `1.20.1`
    pub version: String,
    /// File name on disk, e.g. `minecraft_server-1.20.1.jar`
    pub name: String,
    pub url: String,
    /// Optional hex SHA-256 of the file, checked after download
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Resolves version names to download locations. Injected into the supervisor.
#[async_trait]
pub trait ArtifactResolver: Send + Sync {
    /// The newest stable version.
    async fn latest_stable(&self) -> SupervisorResult<ArtifactEntry>;

    /// Look up a specific artifact by its file name.
    async fn resolve(&self, name: &str) -> SupervisorResult<ArtifactEntry>;
}

/// Find artifact files in `dir` matching `pattern` (e.g. `minecraft_server-*.jar`).
///
/// Returns the bare file names, sorted. A missing directory yields no matches.
pub fn locate_artifacts(dir: &Path, pattern: &str) -> SupervisorResult<Vec<String>> {
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        pattern
    );
    let paths = glob::glob(&full)
        .map_err(|e| anyhow::anyhow!("Invalid artifact pattern '{}': {}", pattern, e))?;

    let mut names: Vec<String> = paths
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!("Skipping unreadable path while locating artifacts: {}", e);
                None
            }
        })
        .filter(|path| path.is_file())
        .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    names.sort();
    Ok(names)
}

/// `true` if `name` is a bare file name (no directories, no `..`).
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name)
        && name != ".."
}

/// Extract the version from `<prefix>-<version>.<ext>`.
pub fn version_of(file_name: &str) -> Option<String> {
    let (_, rest) = file_name.split_once('-')?;
    let version = match rest.rsplit_once('.') {
        Some((version, _ext)) => version,
        None => rest,
    };
    (!version.is_empty()).then(|| version.to_string())
}

fn is_stable(version: &str) -> bool {
    version.chars().all(|c| c.is_ascii_digit() || c == '.') && version.chars().any(|c| c.is_ascii_digit())
}

fn version_key(version: &str) -> Vec<u64> {
    version
        .split('.')
        .filter_map(|part| part.parse::<u64>().ok())
        .collect()
}

// ─── File Catalog ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CatalogValue {
    Url(String),
    Detailed {
        url: String,
        #[serde(default)]
        sha256: Option<String>,
    },
}

/// Versions split the way the catalog presents them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogVersions {
    /// Newest first
    pub stable: Vec<ArtifactEntry>,
    /// Catalog order is not meaningful for snapshots; sorted by name
    pub snapshot: Vec<ArtifactEntry>,
}

/// [`ArtifactResolver`] backed by a local JSON file mapping file names to URLs:
///
/// ```json
/// { "minecraft_server-1.20.1.jar": "https://...",
///   "minecraft_server-23w31a.jar": { "url": "https://...", "sha256": "..." } }
/// ```
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn versions(&self) -> SupervisorResult<CatalogVersions> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SupervisorError::Catalog(format!("Cannot read catalog {}: {}", self.path.display(), e))
        })?;
        parse_catalog(&content)
    }
}

fn parse_catalog(content: &str) -> SupervisorResult<CatalogVersions> {
    let raw: HashMap<String, CatalogValue> = serde_json::from_str(content)
        .map_err(|e| SupervisorError::Catalog(format!("Malformed catalog: {}", e)))?;

    let mut versions = CatalogVersions::default();
    for (name, value) in raw {
        let Some(version) = version_of(&name) else {
            tracing::debug!("Ignoring catalog entry without version: {}", name);
            continue;
        };
        let (url, sha256) = match value {
            CatalogValue::Url(url) => (url, None),
            CatalogValue::Detailed { url, sha256 } => (url, sha256),
        };
        let entry = ArtifactEntry { version, name, url, sha256 };
        if is_stable(&entry.version) {
            versions.stable.push(entry);
        } else {
            versions.snapshot.push(entry);
        }
    }

    versions
        .stable
        .sort_by(|a, b| version_key(&b.version).cmp(&version_key(&a.version)));
    versions.snapshot.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(versions)
}

#[async_trait]
impl ArtifactResolver for FileCatalog {
    async fn latest_stable(&self) -> SupervisorResult<ArtifactEntry> {
        self.versions()
            .await?
            .stable
            .into_iter()
            .next()
            .ok_or_else(|| SupervisorError::Catalog("Catalog has no stable versions".into()))
    }

    async fn resolve(&self, name: &str) -> SupervisorResult<ArtifactEntry> {
        let versions = self.versions().await?;
        let mut found: Vec<ArtifactEntry> = versions
            .stable
            .into_iter()
            .chain(versions.snapshot)
            .filter(|e| e.name == name)
            .collect();
        match found.len() {
            0 => Err(SupervisorError::NotFound(format!("{} (not in catalog)", name))),
            1 => Ok(found.remove(0)),
            _ => Err(SupervisorError::Catalog(format!("More than one link found for {}", name))),
        }
    }
}
