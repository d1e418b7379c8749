use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use md5::{Digest, Md5};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::GwasError;

pub const DEFAULT_RESPONSE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SWEEP_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Lookups (GET-shaped) and submissions (POST-shaped) are cached in separate
/// partitions so their descriptors cannot collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Lookup,
    Submission,
}

impl RequestKind {
    const ALL: [RequestKind; 2] = [RequestKind::Lookup, RequestKind::Submission];

    fn partition(&self) -> &'static str {
        match self {
            RequestKind::Lookup => "lookup",
            RequestKind::Submission => "submission",
        }
    }
}

/// Canonical identity of a remote request. Equal requests canonicalize to
/// equal text regardless of parameter order, so their md5 keys collide on
/// purpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    kind: RequestKind,
    canonical: String,
}

impl RequestDescriptor {
    pub fn lookup(url: &str, params: &[(&str, String)]) -> Self {
        let mut pairs = params
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>();
        pairs.sort();
        let canonical = if pairs.is_empty() {
            url.to_string()
        } else {
            format!("{url}?{}", pairs.join("&"))
        };
        Self {
            kind: RequestKind::Lookup,
            canonical,
        }
    }

    pub fn submission(url: &str, body: &Value) -> Self {
        // serde_json maps iterate key-sorted, so this rendering is canonical
        Self {
            kind: RequestKind::Submission,
            canonical: format!("{url}|{body}"),
        }
    }

    pub fn cache_key(&self) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub lookup_entries: usize,
    pub submission_entries: usize,
    pub total_bytes: u64,
}

/// File-backed TTL cache for remote JSON responses. Every failure mode on
/// the read side degrades to a miss; write failures are logged and dropped.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    root: Utf8PathBuf,
    max_age: Duration,
}

impl ResponseCache {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self {
            root,
            max_age: DEFAULT_RESPONSE_MAX_AGE,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn entry_path(&self, descriptor: &RequestDescriptor) -> Utf8PathBuf {
        self.root
            .join(descriptor.kind().partition())
            .join(format!("{}.json", descriptor.cache_key()))
    }

    pub fn get(&self, descriptor: &RequestDescriptor) -> Option<Value> {
        let path = self.entry_path(descriptor);
        let age = entry_age(&path)?;
        if age > self.max_age {
            debug!("cache entry for {} is stale, refetching", descriptor.canonical());
            return None;
        }
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) => {
                warn!("cache entry unreadable, refetching: {err}");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(value) => {
                debug!(
                    "using cached response for {} (age: {:.2}h)",
                    descriptor.canonical(),
                    age.as_secs_f64() / 3600.0
                );
                Some(value)
            }
            Err(err) => {
                warn!("cache entry corrupted, refetching: {err}");
                None
            }
        }
    }

    pub fn put(&self, descriptor: &RequestDescriptor, value: &Value) {
        if let Err(err) = self.write_entry(descriptor, value) {
            warn!("failed to cache response: {err}");
        }
    }

    fn write_entry(&self, descriptor: &RequestDescriptor, value: &Value) -> Result<(), GwasError> {
        let path = self.entry_path(descriptor);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| GwasError::Filesystem(err.to_string()))?;
        }
        let content =
            serde_json::to_vec_pretty(value).map_err(|err| GwasError::Json(err.to_string()))?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(tmp_path.as_std_path(), &content)
            .map_err(|err| GwasError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| GwasError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Blanket eviction across both partitions; returns the number of
    /// entries removed.
    pub fn sweep(&self, older_than: Duration) -> usize {
        let mut removed = 0usize;
        for kind in RequestKind::ALL {
            let dir = self.root.join(kind.partition());
            if !dir.as_std_path().exists() {
                continue;
            }
            let entries = match fs::read_dir(dir.as_std_path()) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("error cleaning cache partition {}: {err}", kind.partition());
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let age = entry.metadata().ok().and_then(|meta| {
                    meta.modified()
                        .ok()
                        .and_then(|modified| modified.elapsed().ok())
                });
                if let Some(age) = age {
                    if age > older_than && fs::remove_file(&path).is_ok() {
                        debug!("removed old cache entry {}", path.display());
                        removed += 1;
                    }
                }
            }
        }
        if removed > 0 {
            info!("removed {removed} cache entries older than {older_than:?}");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for kind in RequestKind::ALL {
            let dir = self.root.join(kind.partition());
            let Ok(entries) = fs::read_dir(dir.as_std_path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if !meta.is_file() {
                    continue;
                }
                match kind {
                    RequestKind::Lookup => stats.lookup_entries += 1,
                    RequestKind::Submission => stats.submission_entries += 1,
                }
                stats.total_bytes += meta.len();
            }
        }
        stats
    }
}

fn entry_age(path: &Utf8Path) -> Option<Duration> {
    let metadata = fs::metadata(path.as_std_path()).ok()?;
    let modified = metadata.modified().ok()?;
    modified.elapsed().ok()
}
