use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::ArtifactError;

/// Resolves an artifact URI to a readable local file.
pub trait ArtifactFetcher: Send + Sync {
    /// Returns a local path for `uri`. Remote artifacts are cached under
    /// `subdir` of the fetcher's data root.
    fn fetch(&self, uri: &str, subdir: &str) -> Result<PathBuf, ArtifactError>;
}

/// Fetcher backed by an on-disk cache at `<data_root>/<subdir>/<file name>`.
///
/// * `http://` and `https://` URIs are downloaded once and reused afterwards.
/// * `file://` URIs and absolute paths are used in place.
/// * Relative paths are resolved against the data root.
///
/// A download is written to `<file>.part` and renamed on completion, so an
/// interrupted transfer never shows up as a cached artifact. Concurrent
/// writers to the same cache are not coordinated.
#[derive(Debug, Clone)]
pub struct CachedFetcher {
    data_root: PathBuf,
    offline: bool,
}

impl CachedFetcher {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            offline: false,
        }
    }

    /// Only serves artifacts that are already cached or local.
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// Cache location a remote `uri` maps to.
    pub fn cache_path(&self, uri: &str, subdir: &str) -> Result<PathBuf, ArtifactError> {
        let name = infer_filename_from_url(uri).ok_or_else(|| ArtifactError::Fetch {
            uri: uri.to_string(),
            reason: "cannot infer a file name".into(),
        })?;
        Ok(self.data_root.join(subdir).join(name))
    }
}

impl ArtifactFetcher for CachedFetcher {
    fn fetch(&self, uri: &str, subdir: &str) -> Result<PathBuf, ArtifactError> {
        if is_remote(uri) {
            let target = self.cache_path(uri, subdir)?;
            if target.exists() {
                debug!(uri, path = %target.display(), "artifact cache hit");
                return Ok(target);
            }
            if self.offline {
                return Err(ArtifactError::Fetch {
                    uri: uri.to_string(),
                    reason: "not cached and fetcher is offline".into(),
                });
            }
            download_to_path(&target, uri)?;
            return Ok(target);
        }

        let local = match uri.strip_prefix("file://") {
            Some(path) => PathBuf::from(path),
            None => {
                let path = Path::new(uri);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    self.data_root.join(path)
                }
            }
        };
        if local.is_file() {
            Ok(local)
        } else {
            Err(ArtifactError::Fetch {
                uri: uri.to_string(),
                reason: format!("no such file: {}", local.display()),
            })
        }
    }
}

fn is_remote(uri: &str) -> bool {
    uri.starts_with("http://") || uri.starts_with("https://")
}

/// Downloads `url` into `target`, creating parent directories as needed.
fn download_to_path(target: &Path, url: &str) -> Result<(), ArtifactError> {
    if let Some(parent) = target.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    info!(url, path = %target.display(), "downloading artifact");

    let fetch_err = |reason: String| ArtifactError::Fetch {
        uri: url.to_string(),
        reason,
    };
    let response = reqwest::blocking::get(url).map_err(|e| fetch_err(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(fetch_err(format!("unexpected status {status}")));
    }

    let bytes = response.bytes().map_err(|e| fetch_err(e.to_string()))?;

    let mut partial = target.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);
    fs::write(&partial, &bytes)?;
    fs::rename(&partial, target)?;
    info!(bytes = bytes.len(), path = %target.display(), "artifact cached");
    Ok(())
}

/// Extracts a filename from the provided URL, stripping query/fragment parts.
fn infer_filename_from_url(url: &str) -> Option<String> {
    url.split('/')
        .rev()
        .find(|segment| !segment.is_empty())
        .map(|segment| segment.split(['?', '#']).next().unwrap_or(segment))
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .map(|segment| segment.to_string())
}
