//! Just-in-time backups: the first overwrite of an existing file snapshots
//! its pre-write contents into the backup directory, so a write that slips
//! past detection can still be rolled back by hand.
//!
//! Backups are best-effort and size-capped. Nothing indexes them; recovery is
//! a directory listing away. Nothing ever deletes them either.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::stats::WriteStats;

/// Name of the backup directory created directly under the storage root.
pub const BACKUP_DIR_NAME: &str = ".sentinelfs_backups";

/// Files larger than this are not snapshotted; copying them inline would turn
/// a single write into a visible latency spike.
pub const DEFAULT_SIZE_CAP: u64 = 50 * 1024 * 1024;

const COPY_BUF_BYTES: usize = 8192;

/// What a backup attempt did. Only `Created` touches the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// The source does not exist; there is nothing to preserve.
    NoSource,
    /// The source exists but is empty; an overwrite loses nothing.
    EmptySource,
    /// The source exceeds the size cap and was deliberately skipped.
    TooLarge,
    /// A snapshot was written to `backup_path`.
    Created { backup_path: PathBuf },
}

/// Copies a file's pre-write contents to a timestamped entry under the
/// backup directory.
pub struct JitBackup {
    backup_root: PathBuf,
    size_cap: u64,
    stats: Arc<WriteStats>,
}

impl JitBackup {
    /// Create the manager and its backup directory (idempotent, mode 0700).
    pub fn new(backup_root: PathBuf, size_cap: u64, stats: Arc<WriteStats>) -> Result<Self> {
        fs::create_dir_all(&backup_root)
            .with_context(|| format!("create backup dir {}", backup_root.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&backup_root, fs::Permissions::from_mode(0o700))
                .with_context(|| format!("restrict backup dir {}", backup_root.display()))?;
        }
        Ok(Self {
            backup_root,
            size_cap,
            stats,
        })
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Snapshot `source` if it exists, is non-empty, and fits the size cap.
    ///
    /// Callers treat an `Err` as advisory: a failed snapshot is logged and
    /// must not veto the write it precedes. Two writers racing on the same
    /// first write may both snapshot; that duplication is tolerated.
    pub fn backup_if_needed(&self, source: &Path) -> Result<BackupOutcome> {
        let meta = match fs::metadata(source) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BackupOutcome::NoSource)
            }
            Err(err) => {
                return Err(err).with_context(|| format!("stat {}", source.display()))
            }
        };

        if meta.len() == 0 {
            return Ok(BackupOutcome::EmptySource);
        }
        if meta.len() > self.size_cap {
            warn!(
                path = %source.display(),
                size = meta.len(),
                cap = self.size_cap,
                "skipping backup (file too large)"
            );
            return Ok(BackupOutcome::TooLarge);
        }

        let backup_path = self.backup_path_for(source);
        copy_contents(source, &backup_path)?;

        self.stats.record_backup();
        info!(
            source = %source.display(),
            backup = %backup_path.display(),
            "pre-write snapshot created"
        );
        Ok(BackupOutcome::Created { backup_path })
    }

    /// `<backup_root>/<basename>.<unix_seconds>.backup`
    fn backup_path_for(&self, source: &Path) -> PathBuf {
        let basename = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_owned());
        self.backup_root
            .join(format!("{}.{}.backup", basename, Utc::now().timestamp()))
    }
}

fn copy_contents(source: &Path, dest: &Path) -> Result<()> {
    let mut src =
        File::open(source).with_context(|| format!("open {}", source.display()))?;
    let mut dst =
        File::create(dest).with_context(|| format!("create {}", dest.display()))?;

    let mut buf = [0u8; COPY_BUF_BYTES];
    loop {
        let n = src
            .read(&mut buf)
            .with_context(|| format!("read {}", source.display()))?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])
            .with_context(|| format!("write {}", dest.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(root: &Path, cap: u64) -> JitBackup {
        JitBackup::new(root.join(BACKUP_DIR_NAME), cap, Arc::new(WriteStats::new())).unwrap()
    }

    #[test]
    fn missing_source_is_a_no_op() {
        let dir = tempdir().unwrap();
        let jit = manager(dir.path(), DEFAULT_SIZE_CAP);
        let outcome = jit.backup_if_needed(&dir.path().join("ghost.txt")).unwrap();
        assert_eq!(outcome, BackupOutcome::NoSource);
        assert_eq!(fs::read_dir(jit.backup_root()).unwrap().count(), 0);
    }

    #[test]
    fn empty_source_is_a_no_op() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("empty.txt");
        fs::write(&file, b"").unwrap();
        let jit = manager(dir.path(), DEFAULT_SIZE_CAP);
        assert_eq!(jit.backup_if_needed(&file).unwrap(), BackupOutcome::EmptySource);
    }

    #[test]
    fn snapshot_preserves_the_original_bytes() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("doc.txt");
        fs::write(&file, b"one hundred bytes of perfectly ordinary prose").unwrap();

        let jit = manager(dir.path(), DEFAULT_SIZE_CAP);
        let outcome = jit.backup_if_needed(&file).unwrap();
        let BackupOutcome::Created { backup_path } = outcome else {
            panic!("expected a snapshot, got {outcome:?}");
        };
        assert_eq!(
            fs::read(&backup_path).unwrap(),
            b"one hundred bytes of perfectly ordinary prose"
        );
    }

    #[test]
    fn entry_name_is_basename_seconds_backup() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("report.pdf");
        fs::write(&file, b"x").unwrap();

        let jit = manager(dir.path(), DEFAULT_SIZE_CAP);
        let BackupOutcome::Created { backup_path } = jit.backup_if_needed(&file).unwrap() else {
            panic!("expected a snapshot");
        };
        let name = backup_path.file_name().unwrap().to_str().unwrap();
        let mut parts = name.splitn(3, '.');
        assert_eq!(parts.next(), Some("report"));
        assert_eq!(parts.next(), Some("pdf"));
        let tail = parts.next().unwrap();
        let (seconds, suffix) = tail.split_once('.').unwrap();
        assert!(seconds.parse::<i64>().is_ok(), "bad timestamp in {name}");
        assert_eq!(suffix, "backup");
    }

    #[test]
    fn file_at_the_cap_is_snapshotted() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("edge.bin");
        fs::write(&file, vec![0x41u8; 4096]).unwrap();

        let jit = manager(dir.path(), 4096);
        assert!(matches!(
            jit.backup_if_needed(&file).unwrap(),
            BackupOutcome::Created { .. }
        ));
    }

    #[test]
    fn file_over_the_cap_is_skipped() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("edge.bin");
        fs::write(&file, vec![0x41u8; 4097]).unwrap();

        let jit = manager(dir.path(), 4096);
        assert_eq!(jit.backup_if_needed(&file).unwrap(), BackupOutcome::TooLarge);
        assert_eq!(fs::read_dir(jit.backup_root()).unwrap().count(), 0);
    }

    #[test]
    fn successful_snapshot_bumps_the_counter() {
        let dir = tempdir().unwrap();
        let stats = Arc::new(WriteStats::new());
        let jit = JitBackup::new(
            dir.path().join(BACKUP_DIR_NAME),
            DEFAULT_SIZE_CAP,
            stats.clone(),
        )
        .unwrap();

        let file = dir.path().join("counted.txt");
        fs::write(&file, b"contents").unwrap();
        jit.backup_if_needed(&file).unwrap();
        assert_eq!(stats.snapshot().backups_created, 1);

        // Skips do not count.
        jit.backup_if_needed(&dir.path().join("ghost")).unwrap();
        assert_eq!(stats.snapshot().backups_created, 1);
    }

    #[cfg(unix)]
    #[test]
    fn backup_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let jit = manager(dir.path(), DEFAULT_SIZE_CAP);
        let mode = fs::metadata(jit.backup_root()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
