//! Source providers hand out the raw video bytes for a locator

use std::fmt;
use std::fs::File;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::SourceUnavailable;

/// Opaque address of a video in some storage service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocator {
    pub bucket: String,
    pub path: String,
}

impl SourceLocator {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bucket.is_empty() {
            f.write_str(&self.path)
        } else {
            write!(f, "{}/{}", self.bucket, self.path)
        }
    }
}

#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn fetch(&self, locator: &SourceLocator) -> Result<Bytes, SourceUnavailable>;
}

/// Serves `root/bucket/path` from the local filesystem, memory-mapped
pub struct FsSourceProvider {
    root: PathBuf,
}

impl FsSourceProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, locator: &SourceLocator) -> PathBuf {
        let mut path = self.root.clone();
        if !locator.bucket.is_empty() {
            path.push(&locator.bucket);
        }
        path.push(&locator.path);
        path
    }
}

#[async_trait]
impl SourceProvider for FsSourceProvider {
    #[instrument(skip(self, locator), fields(locator = %locator))]
    async fn fetch(&self, locator: &SourceLocator) -> Result<Bytes, SourceUnavailable> {
        let path = self.resolve(locator);
        let unavailable = |reason: String| SourceUnavailable {
            locator: locator.to_string(),
            reason,
        };

        let mapped = tokio::task::spawn_blocking(move || -> std::io::Result<Option<Mmap>> {
            let file = File::open(&path)?;
            if file.metadata()?.len() == 0 {
                return Ok(None);
            }
            // SAFETY: the mapping is read-only; sources are not expected to be
            // rewritten while a session streams them.
            let map = unsafe { Mmap::map(&file)? };
            Ok(Some(map))
        })
        .await
        .map_err(|e| unavailable(e.to_string()))?
        .map_err(|e| unavailable(e.to_string()))?
        .ok_or_else(|| unavailable("empty object".into()))?;

        debug!(bytes = mapped.len(), "Mapped video source");
        Ok(Bytes::from_owner(mapped))
    }
}
