//! Content-addressed archive of ingested source files, kept for lineage.
//!
//! Layout: `<root>/<sha[..2]>/<sha>.<ext>`. One copy per checksum, whatever
//! the extension spelling of later uploads.

use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveAction {
    Written,
    /// An intact copy with this checksum was already present.
    AlreadyArchived,
    /// A copy existed but its size did not match; it was rewritten.
    Repaired,
}

#[derive(Debug, Clone)]
pub struct ArchivedSource {
    pub checksum: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: u64,
    pub action: ArchiveAction,
}

#[derive(Debug, Clone)]
pub struct SourceArchive {
    root: PathBuf,
}

impl SourceArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative_path(checksum: &str, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim().to_ascii_lowercase();
        let ext = if ext.is_empty() { "bin".to_string() } else { ext };
        PathBuf::from(Self::shard(checksum)).join(format!("{checksum}.{ext}"))
    }

    fn shard(checksum: &str) -> &str {
        checksum.get(..2).unwrap_or("00")
    }

    /// Existing archived copy for `checksum`, under any extension.
    pub async fn locate(&self, checksum: &str) -> anyhow::Result<Option<PathBuf>> {
        let shard_dir = self.root.join(Self::shard(checksum));
        let mut entries = match fs::read_dir(&shard_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("listing {}", shard_dir.display()))
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", shard_dir.display()))?
        {
            let path = entry.path();
            if path.file_stem().and_then(|s| s.to_str()) == Some(checksum) {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// Archive `bytes` under their checksum. An intact copy is reused; a
    /// copy whose size disagrees is replaced through a temp-file rename.
    pub async fn store_bytes(&self, extension: &str, bytes: &[u8]) -> anyhow::Result<ArchivedSource> {
        let checksum = sha256_hex(bytes);
        let expected_size = bytes.len() as u64;

        let mut action = ArchiveAction::Written;
        let mut target = self.root.join(Self::relative_path(&checksum, extension));
        if let Some(existing) = self.locate(&checksum).await? {
            let on_disk = fs::metadata(&existing)
                .await
                .with_context(|| format!("inspecting {}", existing.display()))?
                .len();
            if on_disk == expected_size {
                debug!(%checksum, path = %existing.display(), "source already archived");
                return Ok(self.archived(checksum, existing, expected_size, ArchiveAction::AlreadyArchived));
            }
            warn!(
                %checksum,
                path = %existing.display(),
                on_disk,
                expected_size,
                "archived copy has the wrong size; rewriting"
            );
            action = ArchiveAction::Repaired;
            target = existing;
        }

        self.write_atomically(&target, bytes).await?;
        Ok(self.archived(checksum, target, expected_size, action))
    }

    fn archived(&self, checksum: String, absolute_path: PathBuf, byte_size: u64, action: ArchiveAction) -> ArchivedSource {
        let relative_path = absolute_path
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| absolute_path.clone());
        ArchivedSource {
            checksum,
            relative_path,
            absolute_path,
            byte_size,
            action,
        }
    }

    async fn write_atomically(&self, target: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.partial", Uuid::new_v4()));
        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, target).await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("archiving {}", target.display()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn checksum_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_sources_are_archived_once_whatever_the_extension_case() {
        let dir = tempdir().expect("tempdir");
        let archive = SourceArchive::new(dir.path());

        let first = archive.store_bytes("xlsx", b"same workbook").await.expect("first");
        let second = archive.store_bytes(".XLSX", b"same workbook").await.expect("second");

        assert_eq!(first.action, ArchiveAction::Written);
        assert_eq!(second.action, ArchiveAction::AlreadyArchived);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
        assert_eq!(first.byte_size, 13);
        assert!(first
            .relative_path
            .to_string_lossy()
            .ends_with(&format!("{}.xlsx", first.checksum)));
    }

    #[tokio::test]
    async fn truncated_copy_is_rewritten() {
        let dir = tempdir().expect("tempdir");
        let archive = SourceArchive::new(dir.path());
        let bytes = b"provincia,canton\nPICHINCHA,QUITO\n";

        let first = archive.store_bytes("csv", bytes).await.unwrap();
        std::fs::write(&first.absolute_path, b"provincia").unwrap();

        let repaired = archive.store_bytes("csv", bytes).await.unwrap();
        assert_eq!(repaired.action, ArchiveAction::Repaired);
        assert_eq!(repaired.absolute_path, first.absolute_path);
        assert_eq!(std::fs::read(&repaired.absolute_path).unwrap(), bytes);

        let shard = first.absolute_path.parent().unwrap();
        assert_eq!(std::fs::read_dir(shard).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn locate_misses_unknown_checksums() {
        let dir = tempdir().expect("tempdir");
        let archive = SourceArchive::new(dir.path());
        assert!(archive.locate(&sha256_hex(b"nothing")).await.unwrap().is_none());

        let stored = archive.store_bytes("ods", b"hoja").await.unwrap();
        assert_eq!(
            archive.locate(&stored.checksum).await.unwrap(),
            Some(stored.absolute_path)
        );
    }
}
