use std::{
    collections::HashMap,
    ffi::OsStr,
    time::{Duration, SystemTime},
};

use crossbeam_channel::Sender;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyXattr, Request,
};
use tracing::{debug, error, trace};

use crate::{
    error::Error,
    fs_ops::{Attr, EntryKind, FsOps, encode_xattr_names},
    metadata_index::{ROOT, child_path},
};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = fuser::FUSE_ROOT_ID;

/// Inodes are handed out on first sight of a path and never reused.
#[derive(Debug)]
struct Inodes {
    paths: Vec<String>,
    by_path: HashMap<String, u64>,
}

impl Inodes {
    fn new() -> Self {
        Self {
            paths: vec![ROOT.to_owned()],
            by_path: HashMap::from([(ROOT.to_owned(), ROOT_INO)]),
        }
    }

    fn ino(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.by_path.get(path) {
            return *ino;
        }
        self.paths.push(path.to_owned());
        let ino = self.paths.len() as u64;
        self.by_path.insert(path.to_owned(), ino);
        ino
    }

    fn path(&self, ino: u64) -> Option<&str> {
        let idx = ino.checked_sub(1)?;
        self.paths.get(idx as usize).map(|s| s.as_str())
    }
}

/// `fuser` adapter on top of [`FsOps`].
pub struct BtfsFilesystem {
    ops: FsOps,
    inodes: Inodes,
    uid: u32,
    gid: u32,
    unmounted: Option<Sender<()>>,
}

impl BtfsFilesystem {
    /// `unmounted` gets a message once the kernel tears the mount down.
    pub fn new(ops: FsOps, unmounted: Option<Sender<()>>) -> Self {
        // SAFETY: getuid() and getgid() can't fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            ops,
            inodes: Inodes::new(),
            uid,
            gid,
            unmounted,
        }
    }

    fn file_attr(&self, ino: u64, attr: &Attr) -> FileAttr {
        let now = SystemTime::now();
        let kind = match attr.kind {
            EntryKind::Directory => FileType::Directory,
            EntryKind::File => FileType::RegularFile,
        };
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            perm: attr.perm,
            nlink: match attr.kind {
                EntryKind::Directory => 2,
                EntryKind::File => 1,
            },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, Error> {
        self.inodes
            .path(ino)
            .map(str::to_owned)
            .ok_or(Error::NotFound)
    }
}

fn reply_xattr(reply: ReplyXattr, value: &[u8], size: u32) {
    if size == 0 {
        reply.size(value.len() as u32);
    } else if value.len() > size as usize {
        reply.error(Error::AttributeTooLarge(size).errno());
    } else {
        reply.data(value);
    }
}

impl Filesystem for BtfsFilesystem {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        debug!("mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("unmounted");
        if let Some(tx) = self.unmounted.take() {
            let _ = tx.send(());
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent = match self.path_of(parent) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(libc::ENOENT),
        };
        let path = child_path(&parent, name);
        match self.ops.getattr(&path) {
            Ok(attr) => {
                let ino = self.inodes.ino(&path);
                reply.entry(&TTL, &self.file_attr(ino, &attr), 0)
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.path_of(ino).and_then(|p| self.ops.getattr(&p)) {
            Ok(attr) => reply.attr(&TTL, &self.file_attr(ino, &attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.path_of(ino).and_then(|p| self.ops.open(&p, flags)) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let offset = match u64::try_from(offset) {
            Ok(o) => o,
            Err(_) => return reply.error(libc::EINVAL),
        };

        // Reads block until pieces arrive, keep them off the request loop.
        let ops = self.ops.clone();
        let spawned = std::thread::Builder::new()
            .name("read".to_owned())
            .spawn(move || match ops.read(&path, offset, size) {
                Ok(buf) => reply.data(&buf),
                Err(e) => {
                    debug!(path, offset, size, "read failed: {e:#}");
                    reply.error(e.errno())
                }
            });
        if let Err(e) = spawned {
            // The reply was dropped with the closure, which answers EIO.
            error!("error spawning read thread: {e:#}");
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.path_of(ino).and_then(|p| self.ops.getattr(&p)) {
            Ok(Attr {
                kind: EntryKind::Directory,
                ..
            }) => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let names = match self.ops.readdir(&path) {
            Ok(names) => names,
            Err(e) => return reply.error(e.errno()),
        };
        let index = self.ops.session().index();
        for (i, name) in names.iter().enumerate().skip(offset.max(0) as usize) {
            let (entry_ino, kind) = match name.as_str() {
                "." => (ino, FileType::Directory),
                ".." => {
                    let parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or(ROOT);
                    let parent = if parent.is_empty() { ROOT } else { parent };
                    (self.inodes.ino(parent), FileType::Directory)
                }
                _ => {
                    let child = child_path(&path, name);
                    let kind = if index.is_dir(&child) {
                        FileType::Directory
                    } else {
                        FileType::RegularFile
                    };
                    (self.inodes.ino(&child), kind)
                }
            };
            // The offset is that of the next entry.
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                trace!(path, "readdir buffer full");
                break;
            }
        }
        reply.ok()
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let s = self.ops.statfs();
        reply.statfs(
            s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
        )
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(Error::NoAttribute.errno()),
        };
        match self.path_of(ino).and_then(|p| self.ops.getxattr(&p, name)) {
            Ok(value) => reply_xattr(reply, &value, size),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.path_of(ino).and_then(|p| self.ops.listxattr(&p)) {
            Ok(names) => reply_xattr(reply, &encode_xattr_names(&names), size),
            Err(e) => reply.error(e.errno()),
        }
    }
}
