//! FUSE transport adapter: maps the kernel's inode-based callbacks onto the
//! path-based operation set of [`SentinelFs`].
//!
//! Entry and attribute TTLs are zero and opens never request
//! `FOPEN_KEEP_CACHE`, so the kernel caches nothing and a blocked write can
//! never be masked by stale cached file data.

mod inodes;

use crate::gate::{AccessMode, SentinelFs};
use fuser::{
    BsdFileFlags, Errno, FileAttr, FileHandle, FileType, Filesystem, FopenFlags, Generation,
    INodeNo, KernelConfig, LockOwner, OpenFlags, RenameFlags, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
    WriteFlags,
};
use inodes::InodeTable;
use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const TTL: Duration = Duration::ZERO;

/// The mounted face of the engine. One instance per mount; the kernel drives
/// it through the [`Filesystem`] callbacks.
pub struct SentinelMount {
    fs: Arc<SentinelFs>,
    inodes: InodeTable,
}

impl SentinelMount {
    pub fn new(fs: Arc<SentinelFs>) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
        }
    }

    fn vpath(&self, ino: INodeNo) -> Result<PathBuf, Errno> {
        self.inodes.vpath(ino.0).ok_or(Errno::ENOENT)
    }

    fn child_vpath(&self, parent: INodeNo, name: &OsStr) -> Result<PathBuf, Errno> {
        let mut vpath = self.vpath(parent)?;
        vpath.push(name);
        Ok(vpath)
    }

    /// lstat a virtual path and register it in the inode table.
    fn stat_entry(&self, vpath: &Path) -> Result<FileAttr, Errno> {
        let meta = self.fs.getattr(vpath).map_err(|err| errno_from_io(&err))?;
        let ino = INodeNo(self.inodes.assign(vpath));
        file_attr(ino, &meta)
    }
}

impl Filesystem for SentinelMount {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> io::Result<()> {
        debug!(storage = %self.fs.storage_root().display(), "transport initialised");
        Ok(())
    }

    /// Clean unmount: report what the gate saw over the session's lifetime.
    fn destroy(&mut self) {
        let snap = self.fs.stats();
        let blocked_percent = format!("{:.2}%", snap.blocked_percent());
        info!(
            total_writes = snap.total_writes,
            blocked_writes = snap.blocked_writes,
            blocked_percent = %blocked_percent,
            backups_created = snap.backups_created,
            "shutdown summary"
        );
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let vpath = match self.child_vpath(parent, name) {
            Ok(vpath) => vpath,
            Err(errno) => return reply.error(errno),
        };
        match self.stat_entry(&vpath) {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        let result = self
            .vpath(ino)
            .and_then(|vpath| {
                let meta = self.fs.getattr(&vpath).map_err(|err| errno_from_io(&err))?;
                file_attr(ino, &meta)
            });
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        let vpath = match self.vpath(ino) {
            Ok(vpath) => vpath,
            Err(errno) => return reply.error(errno),
        };
        if let Some(mode) = mode {
            if let Err(err) = self.fs.chmod(&vpath, mode) {
                return reply.error(errno_from_io(&err));
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(err) = self.fs.chown(&vpath, uid, gid) {
                return reply.error(errno_from_io(&err));
            }
        }
        if let Some(size) = size {
            if let Err(err) = self.fs.truncate(&vpath, size) {
                return reply.error(errno_from_io(&err));
            }
        }
        // Timestamp updates are accepted and left to the underlying storage.
        match self.fs.getattr(&vpath) {
            Ok(meta) => match file_attr(ino, &meta) {
                Ok(attr) => reply.attr(&TTL, &attr),
                Err(errno) => reply.error(errno),
            },
            Err(err) => reply.error(errno_from_io(&err)),
        }
    }

    fn mkdir(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let vpath = match self.child_vpath(parent, name) {
            Ok(vpath) => vpath,
            Err(errno) => return reply.error(errno),
        };
        if let Err(err) = self.fs.mkdir(&vpath, mode & !umask) {
            return reply.error(errno_from_io(&err));
        }
        match self.stat_entry(&vpath) {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let vpath = match self.child_vpath(parent, name) {
            Ok(vpath) => vpath,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.unlink(&vpath) {
            Ok(()) => {
                self.inodes.remove(&vpath);
                reply.ok();
            }
            Err(err) => reply.error(errno_from_io(&err)),
        }
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let vpath = match self.child_vpath(parent, name) {
            Ok(vpath) => vpath,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.rmdir(&vpath) {
            Ok(()) => {
                self.inodes.remove(&vpath);
                reply.ok();
            }
            Err(err) => reply.error(errno_from_io(&err)),
        }
    }

    fn rename(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        _flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        let (from, to) = match (
            self.child_vpath(parent, name),
            self.child_vpath(newparent, newname),
        ) {
            (Ok(from), Ok(to)) => (from, to),
            (Err(errno), _) | (_, Err(errno)) => return reply.error(errno),
        };
        match self.fs.rename(&from, &to) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(err) => reply.error(errno_from_io(&err)),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let vpath = match self.vpath(ino) {
            Ok(vpath) => vpath,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.open_probe(&vpath, access_mode(flags)) {
            Ok(()) => reply.opened(FileHandle(0), FopenFlags::empty()),
            Err(err) => reply.error(errno_from_io(&err)),
        }
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let vpath = match self.vpath(ino) {
            Ok(vpath) => vpath,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.read_at(&vpath, offset, size as usize) {
            Ok(buf) => reply.data(&buf),
            Err(err) => reply.error(errno_from_io(&err)),
        }
    }

    fn write(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        let vpath = match self.vpath(ino) {
            Ok(vpath) => vpath,
            Err(errno) => return reply.error(errno),
        };
        if offset < 0 {
            return reply.error(Errno::EINVAL);
        }
        match self.fs.write_at(&vpath, data, offset as u64) {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(errno_from_io(&err)),
        }
    }

    fn create(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let vpath = match self.child_vpath(parent, name) {
            Ok(vpath) => vpath,
            Err(errno) => return reply.error(errno),
        };
        if let Err(err) = self.fs.create(&vpath, mode & !umask) {
            return reply.error(errno_from_io(&err));
        }
        match self.stat_entry(&vpath) {
            Ok(attr) => reply.created(&TTL, &attr, Generation(0), FileHandle(0), FopenFlags::empty()),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let vpath = match self.vpath(ino) {
            Ok(vpath) => vpath,
            Err(errno) => return reply.error(errno),
        };
        let entries = match self.fs.read_dir(&vpath) {
            Ok(entries) => entries,
            Err(err) => return reply.error(errno_from_io(&err)),
        };

        let parent_vpath = vpath
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| vpath.clone());
        let parent_ino = INodeNo(self.inodes.assign(&parent_vpath));

        let mut listing: Vec<(INodeNo, FileType, OsString)> = vec![
            (ino, FileType::Directory, OsString::from(".")),
            (parent_ino, FileType::Directory, OsString::from("..")),
        ];
        for entry in entries {
            // The underlying inode is forwarded as-is; it only identifies the
            // entry for the directory stream, lookups go through the table.
            let kind = FileType::from_std(entry.kind).unwrap_or(FileType::RegularFile);
            listing.push((INodeNo(entry.ino), kind, entry.name));
        }

        for (i, (entry_ino, kind, name)) in listing.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as u64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }
}

fn access_mode(flags: OpenFlags) -> AccessMode {
    match flags.0 & libc::O_ACCMODE {
        libc::O_WRONLY => AccessMode::Write,
        libc::O_RDWR => AccessMode::ReadWrite,
        _ => AccessMode::Read,
    }
}

fn errno_from_io(err: &io::Error) -> Errno {
    match err.raw_os_error() {
        Some(libc::ENOENT) => Errno::ENOENT,
        Some(libc::EACCES) => Errno::EACCES,
        Some(libc::EPERM) => Errno::EPERM,
        Some(libc::EEXIST) => Errno::EEXIST,
        Some(libc::ENOTDIR) => Errno::ENOTDIR,
        Some(libc::EISDIR) => Errno::EISDIR,
        Some(libc::ENOTEMPTY) => Errno::ENOTEMPTY,
        Some(libc::EINVAL) => Errno::EINVAL,
        Some(libc::ENAMETOOLONG) => Errno::ENAMETOOLONG,
        Some(libc::ENOSPC) => Errno::ENOSPC,
        Some(libc::EXDEV) => Errno::EXDEV,
        Some(libc::EROFS) => Errno::EROFS,
        Some(libc::EFBIG) => Errno::EFBIG,
        _ => Errno::EIO,
    }
}

fn file_attr(ino: INodeNo, meta: &std::fs::Metadata) -> Result<FileAttr, Errno> {
    let kind = FileType::from_std(meta.file_type()).ok_or(Errno::EIO)?;
    Ok(FileAttr {
        ino,
        size: meta.len(),
        blocks: meta.blocks(),
        atime: timestamp(meta.atime(), meta.atime_nsec()),
        mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
        ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind,
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    })
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}
