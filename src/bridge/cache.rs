//! Named on-disk asset caches
//!
//! Each cache is a directory under the cache root named after the worker
//! version (e.g. `benji-assets-v6`). Activating a version deletes the other
//! `benji-assets-*` directories; anything else under the root is left alone.

use std::path::{Component, Path, PathBuf};

use url::Url;

use crate::{Error, Result};

/// Current worker version tag
pub const CACHE_VERSION: &str = "v6";

/// Prefix shared by every cache this worker creates
pub const CACHE_PREFIX: &str = "benji-assets-";

/// Keyword model shipped with the front-end
pub const KEYWORD_MODEL_ASSET: &str = "/models/hello_benji.bnjw";

/// Assets required to start offline, the keyword model included
pub const CRITICAL_ASSETS: [&str; 4] = ["/", "/offline", "/manifest.json", KEYWORD_MODEL_ASSET];

/// Page served for navigations that fail while offline
pub const OFFLINE_ASSET: &str = "/offline";

/// Cache name for a version tag
#[must_use]
pub fn cache_name(version: &str) -> String {
    format!("{CACHE_PREFIX}{version}")
}

/// One named cache directory
#[derive(Debug, Clone)]
pub struct AssetCache {
    name: String,
    dir: PathBuf,
}

impl AssetCache {
    /// Open (creating if needed) the cache `name` under `root`
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub async fn open(root: &Path, name: &str) -> Result<Self> {
        let dir = root.join(name);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            name: name.to_string(),
            dir,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn path_for(&self, asset: &str) -> Result<PathBuf> {
        let relative = asset.trim_start_matches('/');
        if relative.is_empty() {
            return Ok(self.dir.join("_root"));
        }

        let relative = Path::new(relative);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::Bridge(format!("invalid asset path {asset:?}")));
        }
        Ok(self.dir.join(relative))
    }

    /// Store an asset
    ///
    /// # Errors
    ///
    /// Returns error if the path is invalid or the write fails
    pub async fn put(&self, asset: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(asset)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        tracing::trace!(cache = %self.name, asset, bytes = bytes.len(), "asset cached");
        Ok(())
    }

    /// Read an asset; `None` when not cached
    ///
    /// # Errors
    ///
    /// Returns error if the path is invalid or the read fails
    pub async fn get(&self, asset: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(asset)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Names of all caches under `root`
///
/// # Errors
///
/// Returns error if the directory cannot be listed
pub async fn cache_names(root: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Delete every cache this worker owns except `keep`; returns the deleted names
///
/// # Errors
///
/// Returns error if the root cannot be listed
pub async fn purge_stale(root: &Path, keep: &str) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in cache_names(root).await? {
        if name == keep || !name.starts_with(CACHE_PREFIX) {
            continue;
        }
        match tokio::fs::remove_dir_all(root.join(&name)).await {
            Ok(()) => {
                tracing::info!(cache = %name, "deleted stale cache");
                deleted.push(name);
            }
            Err(e) => tracing::warn!(cache = %name, error = %e, "failed to delete cache"),
        }
    }
    Ok(deleted)
}

/// Where uncached assets come from
#[derive(Debug, Clone)]
pub enum AssetOrigin {
    /// Fetched over HTTP relative to a base URL
    Remote { client: reqwest::Client, base: Url },
    /// Read from a local directory
    Local(PathBuf),
}

impl AssetOrigin {
    /// Build from a configured base URL or fall back to a local directory
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is malformed
    pub fn from_config(base_url: Option<&str>, local_dir: PathBuf) -> Result<Self> {
        match base_url {
            Some(raw) => {
                let base = Url::parse(raw)
                    .map_err(|e| Error::Config(format!("invalid asset base URL {raw:?}: {e}")))?;
                Ok(Self::Remote {
                    client: reqwest::Client::new(),
                    base,
                })
            }
            None => Ok(Self::Local(local_dir)),
        }
    }

    /// Fetch an asset; `Ok(None)` when the origin doesn't have it
    ///
    /// # Errors
    ///
    /// Returns error if the origin is unreachable
    pub async fn fetch(&self, asset: &str) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Remote { client, base } => {
                let url = base
                    .join(asset.trim_start_matches('/'))
                    .map_err(|e| Error::Bridge(format!("invalid asset path {asset:?}: {e}")))?;
                let response = client.get(url).send().await?;
                if response.status() != reqwest::StatusCode::OK {
                    return Ok(None);
                }
                Ok(Some(response.bytes().await?.to_vec()))
            }
            Self::Local(dir) => {
                let relative = asset.trim_start_matches('/');
                let relative = if relative.is_empty() {
                    "index.html"
                } else {
                    relative
                };
                if Path::new(relative)
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_)))
                {
                    return Err(Error::Bridge(format!("invalid asset path {asset:?}")));
                }
                match tokio::fs::read(dir.join(relative)).await {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

/// Outcome of pre-caching the critical assets
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub cached: Vec<String>,
    pub failed: Vec<String>,
}

/// Pre-cache `assets`; individual failures are logged, not fatal
pub async fn install(cache: &AssetCache, origin: &AssetOrigin, assets: &[&str]) -> InstallReport {
    let mut report = InstallReport::default();
    for &asset in assets {
        let outcome = match origin.fetch(asset).await {
            Ok(Some(bytes)) => cache.put(asset, &bytes).await,
            Ok(None) => Err(Error::Bridge("not found at origin".to_string())),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => report.cached.push(asset.to_string()),
            Err(e) => {
                tracing::warn!(asset, error = %e, "failed to pre-cache asset");
                report.failed.push(asset.to_string());
            }
        }
    }
    tracing::info!(
        cache = %cache.name(),
        cached = report.cached.len(),
        failed = report.failed.len(),
        "critical assets cached"
    );
    report
}

/// Static asset extensions cached on first fetch
fn is_static_asset(asset: &str) -> bool {
    const EXTENSIONS: [&str; 8] = ["js", "css", "png", "jpg", "jpeg", "svg", "woff", "woff2"];
    Path::new(asset)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| EXTENSIONS.contains(&ext))
}

/// Navigations are extension-less page paths
fn is_navigation(asset: &str) -> bool {
    Path::new(asset).extension().is_none()
}

/// Cache-first lookup
///
/// Serves from the cache, otherwise from the origin (caching static assets on
/// the way). A navigation that cannot be fetched falls back to the offline page.
///
/// # Errors
///
/// Returns error only for invalid asset paths
pub async fn lookup(cache: &AssetCache, origin: &AssetOrigin, asset: &str) -> Result<Option<Vec<u8>>> {
    if let Some(bytes) = cache.get(asset).await? {
        return Ok(Some(bytes));
    }

    match origin.fetch(asset).await {
        Ok(Some(bytes)) => {
            if is_static_asset(asset)
                && let Err(e) = cache.put(asset, &bytes).await
            {
                tracing::debug!(asset, error = %e, "failed to cache asset");
            }
            Ok(Some(bytes))
        }
        Ok(None) => Ok(None),
        Err(Error::Bridge(msg)) => Err(Error::Bridge(msg)),
        Err(e) => {
            tracing::debug!(asset, error = %e, "origin unreachable");
            if is_navigation(asset) {
                cache.get(OFFLINE_ASSET).await
            } else {
                Ok(None)
            }
        }
    }
}
