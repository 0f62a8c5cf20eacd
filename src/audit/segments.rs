//! Size-rotated append-only segment files.
//!
//! The live segment is `audit.log`. When an append would push it past
//! `max_bytes` it is renamed to `audit.log.1`, older segments shift up by
//! one, and anything past `audit.log.<max_segments>` is deleted.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::InfraError;

const LIVE_SEGMENT: &str = "audit.log";
const REWRITE_SEGMENT: &str = "audit.log.rewrite";

async fn remove_if_exists(path: &Path) -> Result<bool, InfraError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn rename_if_exists(from: &Path, to: &Path) -> Result<(), InfraError> {
    match fs::rename(from, to).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Rotating JSON-lines segment files in one directory.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    dir: PathBuf,
    max_bytes: u64,
    max_segments: usize,
}

impl SegmentStore {
    /// Creates `dir` if needed.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Io`] if the directory cannot be created.
    pub async fn open(
        dir: impl Into<PathBuf>,
        max_bytes: u64,
        max_segments: usize,
    ) -> Result<Self, InfraError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            max_bytes: max_bytes.max(1),
            max_segments,
        })
    }

    /// Directory holding the segments.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of segment `index`; `0` is the live segment.
    #[must_use]
    pub fn segment_path(&self, index: usize) -> PathBuf {
        match index {
            0 => self.dir.join(LIVE_SEGMENT),
            n => self.dir.join(format!("{LIVE_SEGMENT}.{n}")),
        }
    }

    /// Appends one line to the live segment, rotating first if it would
    /// overflow.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Io`] on filesystem failure.
    pub async fn append(&self, line: &str) -> Result<(), InfraError> {
        let live = self.segment_path(0);
        let current = match fs::metadata(&live).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let incoming = u64::try_from(line.len()).unwrap_or(u64::MAX).saturating_add(1);
        if current > 0 && current.saturating_add(incoming) > self.max_bytes {
            self.rotate().await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&live)
            .await?;
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn rotate(&self) -> Result<(), InfraError> {
        if self.max_segments == 0 {
            remove_if_exists(&self.segment_path(0)).await?;
            return Ok(());
        }
        if remove_if_exists(&self.segment_path(self.max_segments)).await? {
            tracing::info!(dir = %self.dir.display(), "oldest audit segment dropped");
        }
        for index in (0..self.max_segments).rev() {
            rename_if_exists(&self.segment_path(index), &self.segment_path(index + 1)).await?;
        }
        tracing::info!(dir = %self.dir.display(), segments = self.max_segments, "audit log rotated");
        Ok(())
    }

    /// Every stored line, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Io`] if a segment cannot be read.
    pub async fn read_lines(&self) -> Result<Vec<String>, InfraError> {
        let mut lines = Vec::new();
        for index in (0..=self.max_segments).rev() {
            let contents = match fs::read_to_string(self.segment_path(index)).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            lines.extend(
                contents
                    .lines()
                    .filter(|line| !line.trim().is_empty())
                    .map(str::to_string),
            );
        }
        Ok(lines)
    }

    /// Replaces every segment with a single live segment holding `lines`.
    ///
    /// The new contents are synced to a staging file before any segment is
    /// removed, then renamed over the live segment. A failure before the
    /// rename leaves the existing segments untouched.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Io`] on filesystem failure.
    pub async fn replace_all(&self, lines: &[String]) -> Result<(), InfraError> {
        let staging = self.dir.join(REWRITE_SEGMENT);
        let mut file = fs::File::create(&staging).await?;
        for line in lines {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        for index in 1..=self.max_segments {
            remove_if_exists(&self.segment_path(index)).await?;
        }
        fs::rename(&staging, self.segment_path(0)).await?;
        tracing::debug!(dir = %self.dir.display(), lines = lines.len(), "audit segments rewritten");
        Ok(())
    }

    /// Deletes every segment.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Io`] if a segment cannot be removed.
    pub async fn clear(&self) -> Result<(), InfraError> {
        for index in 0..=self.max_segments {
            remove_if_exists(&self.segment_path(index)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rotation_keeps_bounded_segments() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir failed");
        };
        let Ok(store) = SegmentStore::open(dir.path(), 20, 2).await else {
            panic!("open failed");
        };
        for n in 0..10 {
            let Ok(()) = store.append(&format!("line-{n:04}")).await else {
                panic!("append failed");
            };
        }
        assert!(store.segment_path(0).exists());
        assert!(store.segment_path(1).exists());
        assert!(store.segment_path(2).exists());
        assert!(!store.segment_path(3).exists());

        let Ok(lines) = store.read_lines().await else {
            panic!("read failed");
        };
        // Ten-byte lines, two per segment, three segments.
        assert_eq!(lines.len(), 6);
        assert_eq!(lines.first().map(String::as_str), Some("line-0004"));
        assert_eq!(lines.last().map(String::as_str), Some("line-0009"));
    }

    #[tokio::test]
    async fn zero_history_truncates_in_place() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir failed");
        };
        let Ok(store) = SegmentStore::open(dir.path(), 10, 0).await else {
            panic!("open failed");
        };
        for line in ["aaaaaaaa", "bbbbbbbb"] {
            let Ok(()) = store.append(line).await else {
                panic!("append failed");
            };
        }
        let Ok(lines) = store.read_lines().await else {
            panic!("read failed");
        };
        assert_eq!(lines, vec!["bbbbbbbb".to_string()]);
    }

    #[tokio::test]
    async fn replace_all_collapses_segments_into_live() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir failed");
        };
        let Ok(store) = SegmentStore::open(dir.path(), 10, 3).await else {
            panic!("open failed");
        };
        for n in 0..4 {
            let Ok(()) = store.append(&format!("old-{n:04}")).await else {
                panic!("append failed");
            };
        }
        assert!(store.segment_path(2).exists());

        let kept = vec!["keep-0001".to_string(), "keep-0002".to_string()];
        let Ok(()) = store.replace_all(&kept).await else {
            panic!("replace failed");
        };
        assert!(!store.segment_path(1).exists());
        assert!(!store.segment_path(2).exists());
        assert!(!dir.path().join(REWRITE_SEGMENT).exists());
        assert_eq!(store.read_lines().await.ok(), Some(kept));

        // Appends carry on rotating from the rewritten live segment.
        let Ok(()) = store.append("next-0003").await else {
            panic!("append failed");
        };
        let Ok(lines) = store.read_lines().await else {
            panic!("read failed");
        };
        assert_eq!(lines.last().map(String::as_str), Some("next-0003"));
        assert_eq!(lines.len(), 3);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir failed");
        };
        let Ok(store) = SegmentStore::open(dir.path(), 5, 3).await else {
            panic!("open failed");
        };
        for _ in 0..4 {
            let Ok(()) = store.append("xxxx").await else {
                panic!("append failed");
            };
        }
        let Ok(()) = store.clear().await else {
            panic!("clear failed");
        };
        assert_eq!(store.read_lines().await.ok(), Some(Vec::new()));
    }
}
