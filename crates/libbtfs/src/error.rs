use crate::lengths::ValidPieceIndex;

#[cfg(target_os = "macos")]
const ENOATTR: libc::c_int = libc::ENOATTR;
#[cfg(not(target_os = "macos"))]
const ENOATTR: libc::c_int = libc::ENODATA;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no such file or directory")]
    NotFound,

    #[error("is a directory")]
    IsDirectory,

    #[error("not a directory")]
    NotDirectory,

    #[error("the filesystem is read-only")]
    ReadOnly,

    #[error("reading is disabled in browse-only mode")]
    BrowseOnly,

    #[error("no such attribute")]
    NoAttribute,

    #[error("attribute value doesn't fit in {0} bytes")]
    AttributeTooLarge(u32),

    #[error("error reading piece {piece}: {reason}")]
    PieceFailed {
        piece: ValidPieceIndex,
        reason: String,
    },

    #[error("session is shut down")]
    SessionClosed,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// The errno to hand back across the filesystem boundary.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::IsDirectory => libc::EISDIR,
            Error::NotDirectory => libc::ENOTDIR,
            Error::ReadOnly | Error::BrowseOnly => libc::EACCES,
            Error::NoAttribute => ENOATTR,
            Error::AttributeTooLarge(..) => libc::ERANGE,
            Error::PieceFailed { .. } | Error::SessionClosed | Error::Anyhow(..) => libc::EIO,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
