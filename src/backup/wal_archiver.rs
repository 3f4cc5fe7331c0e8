use super::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Archive of write-ahead log segments for point-in-time recovery.
///
/// PostgreSQL hands segments over through `archive_command`, e.g.
/// `codex-backup wal archive %p %f`.
#[derive(Debug, Clone)]
pub struct WalArchiver {
    archive_directory: PathBuf,
    archive_status: Arc<RwLock<ArchiveStatus>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveStatus {
    pub last_archived_wal: Option<String>,
    pub last_archive_time: Option<DateTime<Utc>>,
    pub archived_wal_count: u64,
    pub failed_archives: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalSegment {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub archived_at: DateTime<Utc>,
}

impl WalArchiver {
    pub fn new(archive_directory: impl Into<PathBuf>) -> Self {
        Self {
            archive_directory: archive_directory.into(),
            archive_status: Arc::new(RwLock::new(ArchiveStatus::default())),
        }
    }

    pub fn archive_directory(&self) -> &Path {
        &self.archive_directory
    }

    pub async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.archive_directory).await?;
        debug!("WAL archive at {}", self.archive_directory.display());
        Ok(())
    }

    /// Copy one segment into the archive.
    ///
    /// Re-archiving an identical segment succeeds; a different segment under
    /// an existing name is refused so history is never overwritten.
    pub async fn archive_segment(&self, source: &Path, name: &str) -> Result<WalSegment> {
        let result = self.archive_segment_inner(source, name).await;

        let mut status = self.archive_status.write().await;
        match &result {
            Ok(segment) => {
                status.last_archived_wal = Some(segment.name.clone());
                status.last_archive_time = Some(segment.archived_at);
                status.archived_wal_count += 1;
            }
            Err(e) => {
                status.failed_archives += 1;
                error!("Failed to archive WAL segment {}: {}", name, e);
            }
        }
        result
    }

    async fn archive_segment_inner(&self, source: &Path, name: &str) -> Result<WalSegment> {
        if !Self::is_wal_filename(name) {
            return Err(BackupError::config(format!(
                "Not a WAL segment name: {name}"
            )));
        }

        self.initialize().await?;
        let destination = self.archive_directory.join(name);

        if fs::try_exists(&destination).await? {
            if fs::read(&destination).await? == fs::read(source).await? {
                debug!("WAL segment {} already archived", name);
                return self.segment_at(&destination).await;
            }
            return Err(BackupError::StorageError {
                message: format!("WAL segment {name} already archived with different contents"),
            });
        }

        // copy then rename so readers never see a half-written segment
        let staging = self.archive_directory.join(format!(".{name}.tmp"));
        fs::copy(source, &staging).await?;
        fs::rename(&staging, &destination).await?;

        let segment = self.segment_at(&destination).await?;
        info!(
            "WAL segment archived: {} ({} bytes)",
            segment.name, segment.size_bytes
        );
        Ok(segment)
    }

    /// All archived segments in WAL order.
    pub async fn list_segments(&self) -> Result<Vec<WalSegment>> {
        let mut segments = Vec::new();
        let mut entries = match fs::read_dir(&self.archive_directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(segments),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_segment = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(Self::is_wal_filename)
                .unwrap_or(false);
            if is_segment && entry.file_type().await?.is_file() {
                segments.push(self.segment_at(&path).await?);
            }
        }

        segments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(segments)
    }

    /// Segments needed to roll a base backup taken at `after` forward to
    /// `until`: everything archived since the base, plus the first segment
    /// archived after `until`, which holds the records up to the target.
    pub async fn segments_for_window(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<WalSegment>> {
        let mut selected = Vec::new();
        for segment in self.list_segments().await? {
            if segment.archived_at < after {
                continue;
            }
            let past_target = segment.archived_at > until;
            selected.push(segment);
            if past_target {
                break;
            }
        }
        debug!(
            "{} WAL segments cover {} .. {}",
            selected.len(),
            after,
            until
        );
        Ok(selected)
    }

    /// Remove segments archived before `cutoff`.
    pub async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<u32> {
        let mut removed = 0;
        for segment in self.list_segments().await? {
            if segment.archived_at >= cutoff {
                continue;
            }
            match fs::remove_file(&segment.path).await {
                Ok(()) => {
                    removed += 1;
                    debug!("Deleted old WAL segment: {}", segment.name);
                }
                Err(e) => warn!("Failed to delete old WAL segment {}: {}", segment.name, e),
            }
        }
        info!("WAL archive cleanup completed: {} segments deleted", removed);
        Ok(removed)
    }

    pub async fn get_archive_status(&self) -> ArchiveStatus {
        self.archive_status.read().await.clone()
    }

    /// 24 hex digits (timeline, log, segment), optionally `.partial`, or a
    /// `.backup` history label.
    pub fn is_wal_filename(name: &str) -> bool {
        let (stem, suffix) = match name.split_once('.') {
            Some((stem, suffix)) => (stem, Some(suffix)),
            None => (name, None),
        };
        let stem_ok = stem.len() == 24 && stem.chars().all(|c| c.is_ascii_hexdigit());
        match suffix {
            None | Some("partial") => stem_ok,
            Some(label) => stem_ok && label.ends_with("backup"),
        }
    }

    async fn segment_at(&self, path: &Path) -> Result<WalSegment> {
        let metadata = fs::metadata(path).await?;
        let archived_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(WalSegment {
            name: path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string(),
            path: path.to_path_buf(),
            size_bytes: metadata.len(),
            archived_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    #[test]
    fn test_wal_filename_validation() {
        assert!(WalArchiver::is_wal_filename("000000010000000000000001"));
        assert!(WalArchiver::is_wal_filename("000000010000000000000001.partial"));
        assert!(WalArchiver::is_wal_filename("000000010000000000000002.00000028.backup"));
        assert!(!WalArchiver::is_wal_filename("invalid_filename"));
        assert!(!WalArchiver::is_wal_filename("short"));
        assert!(!WalArchiver::is_wal_filename("00000001000000000000000G"));
        assert!(!WalArchiver::is_wal_filename("000000010000000000000001.txt"));
    }

    #[tokio::test]
    async fn test_archive_is_idempotent_and_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let archiver = WalArchiver::new(dir.path().join("archive"));
        let source = dir.path().join("seg");
        std::fs::write(&source, b"wal bytes").unwrap();

        let name = "000000010000000000000003";
        archiver.archive_segment(&source, name).await.unwrap();
        archiver.archive_segment(&source, name).await.unwrap();

        std::fs::write(&source, b"other bytes").unwrap();
        assert!(archiver.archive_segment(&source, name).await.is_err());
        assert!(archiver.archive_segment(&source, "not-a-wal").await.is_err());

        let status = archiver.get_archive_status().await;
        assert_eq!(status.archived_wal_count, 2);
        assert_eq!(status.failed_archives, 2);
        assert_eq!(archiver.list_segments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_segments_for_window() {
        let dir = TempDir::new().unwrap();
        let archiver = WalArchiver::new(dir.path());
        archiver.initialize().await.unwrap();

        let base = SystemTime::now() - Duration::from_secs(3600);
        for i in 1..=5u64 {
            let path = dir.path().join(format!("0000000100000000000000{i:02}"));
            std::fs::write(&path, b"x").unwrap();
            let file = std::fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(base + Duration::from_secs(i * 600)).unwrap();
        }
        std::fs::write(dir.path().join("README"), b"ignored").unwrap();

        let at = |secs: u64| DateTime::<Utc>::from(base + Duration::from_secs(secs));
        let names = |segments: Vec<WalSegment>| -> Vec<String> {
            segments.into_iter().map(|s| s.name[22..].to_string()).collect()
        };

        // base taken at +900s, target +2100s: segments 2, 3 and the one past the target
        let window = archiver.segments_for_window(at(900), at(2100)).await.unwrap();
        assert_eq!(names(window), vec!["02", "03", "04"]);

        let none = archiver.segments_for_window(at(4000), at(5000)).await.unwrap();
        assert!(none.is_empty());

        let removed = archiver.cleanup_older_than(at(1300)).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(archiver.list_segments().await.unwrap().len(), 3);
    }
}
