//! Audio artifact store
//!
//! Synthesized speech is written into one shared directory and served back
//! to the media engine over the control API's `/audio-files/` route. Files
//! are throwaway artifacts: a sweeper task reaps anything older than ten
//! minutes so an idle orchestrator does not accumulate audio on disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SpeechError};

/// Default artifact lifetime before the sweeper removes it
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(600);
/// Default sweep cadence (floor: two minutes)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(120);

/// A saved artifact: where it lives and the URL the engine fetches it from
#[derive(Debug, Clone)]
pub struct AudioRef {
    pub url: String,
    pub path: PathBuf,
}

/// Shared audio output directory with URL mapping
#[derive(Debug, Clone)]
pub struct AudioStore {
    dir: PathBuf,
    base_url: String,
}

impl AudioStore {
    /// Open (creating if needed) the artifact directory. `base_url` is the
    /// externally reachable prefix of the `/audio-files/` route, without a
    /// trailing slash.
    pub fn open(dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| SpeechError::Store { reason: format!("create {}: {}", dir.display(), e) })?;
        Ok(Self { dir, base_url: base_url.into().trim_end_matches('/').to_string() })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist one artifact under a fresh name, returning its URL.
    pub async fn save(&self, bytes: &[u8], ext: &str) -> Result<AudioRef> {
        let name = format!("{}.{}", Uuid::new_v4(), ext);
        let path = self.dir.join(&name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| SpeechError::Store { reason: format!("write {}: {}", path.display(), e) })?;
        debug!(file = %path.display(), size = bytes.len(), "saved audio artifact");
        Ok(AudioRef { url: format!("{}/{}", self.base_url, name), path })
    }

    /// Resolve a bare file name back to its path, rejecting traversal.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name.contains("..") || name.contains('/') || name.contains('\\') {
            return None;
        }
        let path = self.dir.join(name);
        path.is_file().then_some(path)
    }

    /// Spawn the background sweeper. Runs until the handle is aborted.
    pub fn spawn_sweeper(&self, max_age: Duration, sweep_interval: Duration) -> tokio::task::JoinHandle<()> {
        let dir = self.dir.clone();
        let cadence = sweep_interval.max(DEFAULT_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = interval(cadence);
            loop {
                ticker.tick().await;
                match sweep_once(&dir, max_age) {
                    Ok(0) => {}
                    Ok(n) => info!(removed = n, "swept stale audio artifacts"),
                    Err(e) => warn!("audio sweep failed: {}", e),
                }
            }
        })
    }
}

fn sweep_once(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let now = std::time::SystemTime::now();
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let stale = meta
            .modified()
            .ok()
            .and_then(|t| now.duration_since(t).ok())
            .map(|age| age > max_age)
            .unwrap_or(false);
        if stale && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_read_back_is_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AudioStore::open(tmp.path(), "http://127.0.0.1:3000/audio-files").unwrap();

        let payload = b"RIFFfake-audio-bytes";
        let art = store.save(payload, "wav").await.unwrap();
        assert!(art.url.starts_with("http://127.0.0.1:3000/audio-files/"));
        assert!(art.url.ends_with(".wav"));

        let back = tokio::fs::read(&art.path).await.unwrap();
        assert_eq!(back, payload);
    }

    #[tokio::test]
    async fn resolve_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AudioStore::open(tmp.path(), "http://h/audio-files").unwrap();
        let art = store.save(b"x", "mp3").await.unwrap();
        let name = art.path.file_name().unwrap().to_str().unwrap().to_string();

        assert!(store.resolve(&name).is_some());
        assert!(store.resolve("../etc/passwd").is_none());
        assert!(store.resolve("a/b.mp3").is_none());
        assert!(store.resolve("missing.mp3").is_none());
    }

    #[test]
    fn sweep_removes_only_stale_files() {
        let tmp = tempfile::tempdir().unwrap();
        let old = tmp.path().join("old.mp3");
        let fresh = tmp.path().join("fresh.mp3");
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&fresh, b"fresh").unwrap();

        assert_eq!(sweep_once(tmp.path(), Duration::from_secs(3600)).unwrap(), 0);
        assert!(old.exists() && fresh.exists());

        assert_eq!(sweep_once(tmp.path(), Duration::ZERO).unwrap(), 2);
        assert!(!old.exists() && !fresh.exists());
    }
}
