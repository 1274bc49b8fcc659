//! The write gate and the pass-through operation set over the storage tree.
//!
//! Every mutating path translates the incoming virtual path and forwards to
//! the underlying storage; `write_at` is the decision point that sequences
//! snapshot, classification, entropy test, and forwarding. Verdicts are never
//! cached; each write is judged from scratch.

use anyhow::Result;
use sentinel_core::backup::{JitBackup, BACKUP_DIR_NAME, DEFAULT_SIZE_CAP};
use sentinel_core::entropy::shannon_entropy;
use sentinel_core::paths::PathTranslator;
use sentinel_core::sniff::{Classifier, ContentSniffer, MagicSniffer};
use sentinel_core::stats::{StatsSnapshot, WriteStats};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, DirEntryExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Writes with no safe-listed content type are rejected once their payload
/// entropy strictly exceeds this many bits per byte. Encrypted output sits at
/// 7.9–8.0; compressed-but-structured formats are rescued by the safe-list
/// before this test runs.
pub const ENTROPY_THRESHOLD: f64 = 7.5;

/// Access requested by an `open` permission probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

/// One directory entry: the minimal attribute set that identifies file kind.
#[derive(Debug)]
pub struct DirEntryInfo {
    pub name: OsString,
    pub ino: u64,
    pub kind: fs::FileType,
}

/// The engine behind every operation on the mount: path translation, the
/// per-write classifier, the JIT backup manager, and the write counters.
///
/// All fields are read-only after construction except the counters, which are
/// atomic; the whole struct is shared freely across transport threads.
pub struct SentinelFs {
    translator: PathTranslator,
    classifier: Classifier,
    backup: JitBackup,
    stats: Arc<WriteStats>,
}

impl SentinelFs {
    /// Build the engine over `storage_root`: classifier handle, backup
    /// directory (created idempotently, owner-only), counters. Runs before
    /// the mount is established, so no operation is served by a
    /// half-initialised engine; a failure here aborts startup.
    pub fn new(storage_root: PathBuf) -> Result<Self> {
        Self::with_sniffer(storage_root, Box::new(MagicSniffer::new()))
    }

    /// Same as [`SentinelFs::new`] with a caller-supplied sniffer.
    pub fn with_sniffer(storage_root: PathBuf, sniffer: Box<dyn ContentSniffer>) -> Result<Self> {
        let stats = Arc::new(WriteStats::new());
        let backup = JitBackup::new(
            storage_root.join(BACKUP_DIR_NAME),
            DEFAULT_SIZE_CAP,
            stats.clone(),
        )?;
        Ok(Self {
            translator: PathTranslator::new(storage_root),
            classifier: Classifier::new(sniffer),
            backup,
            stats,
        })
    }

    pub fn storage_root(&self) -> &Path {
        self.translator.storage_root()
    }

    pub fn backup_root(&self) -> &Path {
        self.backup.backup_root()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn translate(&self, vpath: &Path) -> io::Result<PathBuf> {
        self.translator.translate(vpath)
    }

    // ── Read-through operations ─────────────────────────────────────────

    /// Attributes of the path itself; symlinks are not followed.
    pub fn getattr(&self, vpath: &Path) -> io::Result<fs::Metadata> {
        fs::symlink_metadata(self.translate(vpath)?)
    }

    pub fn read_dir(&self, vpath: &Path) -> io::Result<Vec<DirEntryInfo>> {
        let concrete = self.translate(vpath)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(concrete)? {
            let entry = entry?;
            entries.push(DirEntryInfo {
                name: entry.file_name(),
                ino: entry.ino(),
                kind: entry.file_type()?,
            });
        }
        Ok(entries)
    }

    /// Permission probe: open with the requested access and close again.
    pub fn open_probe(&self, vpath: &Path, access: AccessMode) -> io::Result<()> {
        let concrete = self.translate(vpath)?;
        let mut options = OpenOptions::new();
        match access {
            AccessMode::Read => options.read(true),
            AccessMode::Write => options.write(true),
            AccessMode::ReadWrite => options.read(true).write(true),
        };
        options.open(concrete).map(drop)
    }

    /// One positioned read of up to `size` bytes at `offset`. May return
    /// fewer bytes near end of file.
    pub fn read_at(&self, vpath: &Path, offset: u64, size: usize) -> io::Result<Vec<u8>> {
        let file = File::open(self.translate(vpath)?)?;
        let mut buf = vec![0u8; size];
        let n = file.read_at(&mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    // ── Forwarded mutations ─────────────────────────────────────────────

    /// Create a new empty regular file with `mode`.
    pub fn create(&self, vpath: &Path, mode: u32) -> io::Result<()> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(self.translate(vpath)?)
            .map(drop)
    }

    pub fn mkdir(&self, vpath: &Path, mode: u32) -> io::Result<()> {
        fs::DirBuilder::new()
            .mode(mode)
            .create(self.translate(vpath)?)
    }

    pub fn unlink(&self, vpath: &Path) -> io::Result<()> {
        fs::remove_file(self.translate(vpath)?)
    }

    pub fn rmdir(&self, vpath: &Path) -> io::Result<()> {
        fs::remove_dir(self.translate(vpath)?)
    }

    pub fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(self.translate(from)?, self.translate(to)?)
    }

    pub fn chmod(&self, vpath: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(self.translate(vpath)?, fs::Permissions::from_mode(mode))
    }

    pub fn chown(&self, vpath: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        std::os::unix::fs::chown(self.translate(vpath)?, uid, gid)
    }

    pub fn truncate(&self, vpath: &Path, size: u64) -> io::Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(self.translate(vpath)?)?;
        file.set_len(size)
    }

    // ── The write gate ──────────────────────────────────────────────────

    /// Gate and forward one positioned write.
    ///
    /// An `offset == 0` write is treated as the first of a session: the
    /// current file contents are snapshotted before they can be clobbered.
    /// The snapshot is advisory: its failure is logged and the write
    /// proceeds. The classifier runs before the entropy test so structured
    /// high-entropy payloads (a PDF full of compressed streams, say) are not
    /// punished; payloads that are neither safe-listed nor below the entropy
    /// threshold are rejected with `EIO` and never reach the storage.
    ///
    /// Writes under the backup directory get no special treatment; backups
    /// are not privileged content.
    pub fn write_at(&self, vpath: &Path, data: &[u8], offset: u64) -> io::Result<usize> {
        let concrete = self.translate(vpath)?;

        if offset == 0 {
            if let Err(err) = self.backup.backup_if_needed(&concrete) {
                warn!(
                    path = %concrete.display(),
                    error = %err,
                    "pre-write snapshot failed; write continues"
                );
            }
        }

        self.stats.record_write();

        if !self.classifier.is_safe(data) {
            let entropy = shannon_entropy(data);
            if entropy > ENTROPY_THRESHOLD {
                self.stats.record_blocked();
                warn!(
                    path = %vpath.display(),
                    entropy,
                    threshold = ENTROPY_THRESHOLD,
                    "ransomware detected; write blocked"
                );
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
        }

        let file = OpenOptions::new().write(true).open(&concrete)?;
        file.write_at(data, offset)
    }
}
