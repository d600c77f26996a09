//! Path-based filesystem handlers. These translate VFS calls into metadata
//! index lookups and session reads, and never touch download state for
//! anything but `read`.

use std::sync::Arc;

use tracing::trace;

use crate::{
    error::{Error, Result},
    lengths::ceil_div_u64,
    metadata_index::Lookup,
    session::Session,
};

pub const DIR_MODE: u16 = 0o755;
pub const FILE_MODE: u16 = 0o444;

/// Present on every path of a btfs mount.
pub const XATTR_IS_BTFS: &str = "user.btfs";
/// Decimal engine file index of a regular file.
pub const XATTR_FILE_INDEX: &str = "user.btfs.index";

const BLOCK_SIZE: u64 = 512;
const DEFAULT_BSIZE: u32 = 4096;
const MAX_NAME_LEN: u32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub kind: EntryKind,
    pub size: u64,
    /// 512-byte blocks actually downloaded, how progress is reported.
    pub blocks: u64,
    pub perm: u16,
    pub file_index: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

#[derive(Clone)]
pub struct FsOps {
    session: Arc<Session>,
}

impl FsOps {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn getattr(&self, path: &str) -> Result<Attr> {
        let index = self.session.index();
        match index.lookup(path).ok_or(Error::NotFound)? {
            Lookup::Dir(..) => Ok(Attr {
                kind: EntryKind::Directory,
                size: 0,
                blocks: 0,
                perm: DIR_MODE,
                file_index: None,
            }),
            Lookup::File(file) => {
                let downloaded = self.session.engine().file_progress(file.index);
                Ok(Attr {
                    kind: EntryKind::File,
                    size: file.len,
                    blocks: ceil_div_u64(downloaded, BLOCK_SIZE),
                    perm: FILE_MODE,
                    file_index: Some(file.index),
                })
            }
        }
    }

    /// Entry names, starting with "." and "..".
    pub fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let index = self.session.index();
        let children = match index.lookup(path).ok_or(Error::NotFound)? {
            Lookup::Dir(children) => children,
            Lookup::File(..) => return Err(Error::NotDirectory),
        };
        Ok([".", ".."]
            .into_iter()
            .map(str::to_owned)
            .chain(children.iter().cloned())
            .collect())
    }

    pub fn open(&self, path: &str, flags: i32) -> Result<()> {
        let index = self.session.index();
        match index.lookup(path).ok_or(Error::NotFound)? {
            Lookup::Dir(..) => Err(Error::IsDirectory),
            Lookup::File(..) if flags & libc::O_ACCMODE != libc::O_RDONLY => Err(Error::ReadOnly),
            Lookup::File(..) => Ok(()),
        }
    }

    pub fn read(&self, path: &str, offset: u64, size: u32) -> Result<Vec<u8>> {
        let index = self.session.index();
        let file = match index.lookup(path).ok_or(Error::NotFound)? {
            Lookup::Dir(..) => return Err(Error::IsDirectory),
            Lookup::File(file) => file.clone(),
        };
        if self.session.options().browse_only {
            return Err(Error::BrowseOnly);
        }
        trace!(path, offset, size, "read");
        self.session.read(&file, offset, size as u64)
    }

    pub fn statfs(&self) -> StatFs {
        let index = self.session.index();
        let bsize = match index.piece_length() {
            0 => DEFAULT_BSIZE,
            pl => pl,
        };
        StatFs {
            blocks: ceil_div_u64(index.total_length(), bsize as u64),
            bfree: 0,
            bavail: 0,
            files: (index.files().len() + index.dir_count()) as u64,
            ffree: 0,
            bsize,
            namelen: MAX_NAME_LEN,
            frsize: bsize,
        }
    }

    pub fn listxattr(&self, path: &str) -> Result<Vec<&'static str>> {
        let index = self.session.index();
        match index.lookup(path).ok_or(Error::NotFound)? {
            Lookup::Dir(..) => Ok(vec![XATTR_IS_BTFS]),
            Lookup::File(..) => Ok(vec![XATTR_IS_BTFS, XATTR_FILE_INDEX]),
        }
    }

    pub fn getxattr(&self, path: &str, name: &str) -> Result<Vec<u8>> {
        let index = self.session.index();
        let entry = index.lookup(path).ok_or(Error::NotFound)?;
        match (name, entry) {
            (XATTR_IS_BTFS, _) => Ok(b"1".to_vec()),
            (XATTR_FILE_INDEX, Lookup::File(file)) => Ok(file.index.to_string().into_bytes()),
            _ => Err(Error::NoAttribute),
        }
    }
}

/// The list of xattr names in the kernel's format: NUL-terminated, back to
/// back.
pub fn encode_xattr_names(names: &[&str]) -> Vec<u8> {
    let mut buf = Vec::new();
    for name in names {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
    }
    buf
}
