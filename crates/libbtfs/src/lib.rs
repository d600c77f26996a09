//! Streams the contents of a torrent as a read-only filesystem.
//!
//! Files show up as soon as the torrent's metadata is known. Reading a file
//! blocks until the pieces holding the requested bytes are downloaded, and
//! every read pulls the download window to where the reader currently is, so
//! media can be played while it's still downloading.
//!
//! # Overview
//! The main type is [`Session`]: it owns a [`DownloadEngine`], runs the event
//! dispatch loop and serves reads. [`FsOps`] turns filesystem calls into
//! session operations, and with the `fuse` feature [`fuse::BtfsFilesystem`]
//! mounts them through FUSE.
//!
//! [`LocalEngine`] is a download engine that gets its pieces from a local copy
//! of the torrent's data.

pub mod engine;
mod error;
pub mod file_info;
pub mod fs_ops;
#[cfg(feature = "fuse")]
pub mod fuse;
pub mod lengths;
pub mod metadata_index;
pub mod piece_window;
pub mod read_request;
mod session;
pub mod torrent_metainfo;
#[cfg(feature = "tracing-subscriber-utils")]
pub mod tracing_subscriber_config_utils;

pub use engine::{
    DownloadEngine, EngineEvent, PiecePriority,
    local::{LocalEngine, LocalEngineOptions},
};
pub use error::{Error, Result};
pub use file_info::FileEntry;
pub use fs_ops::{FsOps, XATTR_FILE_INDEX, XATTR_IS_BTFS};
pub use metadata_index::MetadataIndex;
pub use piece_window::PieceWindowConfig;
pub use session::{EVENT_LOG_FILENAME, Session, SessionOptions};
pub use torrent_metainfo::{TorrentMeta, load_torrent_bytes};

#[cfg(test)]
mod tests;

/// The cargo version of libbtfs.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
