//! On-disk artifact store: one audio file per completed job.
//!
//! Files are named `{job_id}.{ext}` inside a single flat directory.  Writes
//! go to a hidden temp file first and are renamed into place, so a reader
//! never sees a half-written artifact.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tracing::{debug, info, warn};

use crate::{config::OutputFormat, error::NarrationError};

fn storage_err(context: &str, path: &Path, e: std::io::Error) -> NarrationError {
    NarrationError::Storage(format!("{context} {}: {e}", path.display()))
}

/// A flat name: no separators, no parent references, no hidden files.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && !name.contains("..")
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
    pub name: String,
    pub uri: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    uri_prefix: String,
    retention: Duration,
}

impl ArtifactStore {
    /// Open (creating if needed) the artifact directory.
    pub async fn open(
        dir: impl Into<PathBuf>,
        uri_prefix: impl Into<String>,
        retention: Duration,
    ) -> Result<Self, NarrationError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_err("cannot create", &dir, e))?;
        Ok(Self { dir, uri_prefix: uri_prefix.into(), retention })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn uri_for(&self, name: &str) -> String {
        if self.uri_prefix.ends_with('/') {
            format!("{}{name}", self.uri_prefix)
        } else {
            format!("{}/{name}", self.uri_prefix)
        }
    }

    /// Write a job's audio as `{job_id}.{ext}`.
    pub async fn put(
        &self,
        job_id: &str,
        format: OutputFormat,
        bytes: &[u8],
    ) -> Result<StoredArtifact, NarrationError> {
        let name = format!("{job_id}.{}", format.extension());
        if !is_valid_name(&name) {
            return Err(NarrationError::Storage(format!("invalid artifact name '{name}'")));
        }
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!(".{name}.partial"));
        tokio::fs::write(&tmp, bytes).await.map_err(|e| storage_err("cannot write", &tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(storage_err("cannot publish", &path, e));
        }
        debug!(path = %path.display(), bytes = bytes.len(), "artifact stored");
        Ok(StoredArtifact { uri: self.uri_for(&name), name, path })
    }

    /// Read an artifact by name, with its MIME type.  `Ok(None)` when it does
    /// not exist.
    pub async fn fetch(&self, name: &str) -> Result<Option<(Vec<u8>, &'static str)>, NarrationError> {
        if !is_valid_name(name) {
            return Err(NarrationError::Storage(format!("invalid artifact name '{name}'")));
        }
        let mime = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .and_then(OutputFormat::from_extension)
            .map_or("application/octet-stream", OutputFormat::mime_type);
        let path = self.dir.join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some((bytes, mime))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err("cannot read", &path, e)),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Delete artifacts older than `retention`.  Returns how many went.
    pub async fn sweep_expired(&self, retention: Duration) -> Result<usize, NarrationError> {
        self.sweep_older_than(SystemTime::now(), retention).await
    }

    async fn sweep_older_than(&self, now: SystemTime, retention: Duration) -> Result<usize, NarrationError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| storage_err("cannot list", &self.dir, e))?;
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|e| storage_err("cannot list", &self.dir, e))? {
            let path = entry.path();
            let Ok(meta) = entry.metadata().await else { continue };
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < retention {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "cannot remove expired artifact"),
            }
        }
        if removed > 0 {
            info!(removed, dir = %self.dir.display(), "swept expired artifacts");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(dir: &tempfile::TempDir) -> ArtifactStore {
        ArtifactStore::open(dir.path().join("audio_outputs"), "/api/v1/audio/", Duration::from_secs(3_600))
            .await
            .unwrap()
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("4f1c-0a.wav"));
        assert!(!is_valid_name("../secrets"));
        assert!(!is_valid_name("a/b.wav"));
        assert!(!is_valid_name(".hidden"));
        assert!(!is_valid_name(""));
    }

    #[tokio::test]
    async fn test_put_then_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let stored = store.put("job", OutputFormat::Wav, b"RIFF").await.unwrap();
        assert_eq!(stored.name, "job.wav");
        assert_eq!(stored.uri, "/api/v1/audio/job.wav");
        assert!(stored.path.ends_with("audio_outputs/job.wav"));

        let (bytes, mime) = store.fetch("job.wav").await.unwrap().unwrap();
        assert_eq!(bytes, b"RIFF");
        assert_eq!(mime, "audio/wav");
        assert_eq!(store.fetch("other.wav").await.unwrap(), None);
        assert!(store.fetch("../job.wav").await.is_err());
    }

    #[tokio::test]
    async fn test_no_partial_files_left() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store.put("a", OutputFormat::Mp3, &[0u8; 64]).await.unwrap();
        let names: Vec<String> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.mp3".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_respects_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store.put("old", OutputFormat::Wav, b"x").await.unwrap();
        assert_eq!(store.sweep_expired(store.retention()).await.unwrap(), 0);

        let later = SystemTime::now() + Duration::from_secs(7_200);
        assert_eq!(store.sweep_older_than(later, Duration::from_secs(3_600)).await.unwrap(), 1);
        assert_eq!(store.fetch("old.wav").await.unwrap(), None);
    }
}
