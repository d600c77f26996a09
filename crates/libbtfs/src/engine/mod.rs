//! The contract between the filesystem core and whatever actually moves torrent
//! data around.
//!
//! The core only ever talks to a [`DownloadEngine`]: it asks whether pieces are
//! there, nudges their priorities, asks for their bytes, and consumes the
//! engine's [`EngineEvent`]s on a single thread. How the engine gets the pieces
//! (peers, trackers, a local copy) is none of its business.

use std::time::Duration;

use bytes::Bytes;

use crate::{
    file_info::FileEntry,
    lengths::{Lengths, PieceRequest, ValidPieceIndex},
};

pub mod local;

/// Download priority of a piece. The numeric values follow the usual 0..7 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum PiecePriority {
    /// Never download.
    #[default]
    Skip = 0,
    Background = 1,
    Urgent = 7,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    TorrentAdded {
        has_metadata: bool,
    },
    MetadataReceived {
        files: Vec<FileEntry>,
    },
    MetadataFailed {
        error: String,
    },
    /// Answer to [`DownloadEngine::request_piece_readback`], or an unsolicited
    /// failure report for a piece the engine could not produce.
    PieceRead {
        piece: ValidPieceIndex,
        result: Result<Bytes, String>,
    },
    PieceFinished {
        piece: ValidPieceIndex,
    },
    HashFailed {
        piece: ValidPieceIndex,
    },
    Info(String),
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::TorrentAdded { .. } => "torrent_added",
            EngineEvent::MetadataReceived { .. } => "metadata_received",
            EngineEvent::MetadataFailed { .. } => "metadata_failed",
            EngineEvent::PieceRead { .. } => "read_piece",
            EngineEvent::PieceFinished { .. } => "piece_finished",
            EngineEvent::HashFailed { .. } => "hash_failed",
            EngineEvent::Info(..) => "info",
        }
    }
}

/// Everything the core needs from a download engine.
///
/// Implementations must never call back into the core synchronously: the core
/// calls most of these with its shared lock held.
pub trait DownloadEngine: Send + Sync {
    fn has_piece(&self, index: ValidPieceIndex) -> bool;

    fn set_piece_priority(&self, index: ValidPieceIndex, priority: PiecePriority);

    /// Ask for the bytes of a piece we have. They arrive later as
    /// [`EngineEvent::PieceRead`].
    fn request_piece_readback(&self, index: ValidPieceIndex);

    /// Map a byte range of a file to the piece holding its first byte. The
    /// returned length is clamped to the end of the file but may span pieces.
    fn map_byte_range(&self, file_index: usize, offset: u64, length: u64)
    -> Option<PieceRequest>;

    /// None until metadata is known.
    fn lengths(&self) -> Option<Lengths>;

    fn files(&self) -> Option<Vec<FileEntry>>;

    /// Bytes of the file that are downloaded and verified.
    fn file_progress(&self, file_index: usize) -> u64;

    /// Wait up to `timeout` for the next event.
    fn next_event(&self, timeout: Duration) -> Option<EngineEvent>;

    fn pause(&self);

    fn shutdown(&self, delete_files: bool) -> anyhow::Result<()>;

    fn piece_length(&self) -> u32 {
        self.lengths().map(|l| l.default_piece_length()).unwrap_or(0)
    }

    fn num_pieces(&self) -> u32 {
        self.lengths().map(|l| l.total_pieces()).unwrap_or(0)
    }

    fn piece_size(&self, index: ValidPieceIndex) -> u32 {
        self.lengths().map(|l| l.piece_length(index)).unwrap_or(0)
    }
}

/// Lay out files back to back the way a torrent does.
pub fn layout_files(
    files: impl IntoIterator<Item = (String, u64)>,
    lengths: &Lengths,
) -> Vec<FileEntry> {
    files
        .into_iter()
        .enumerate()
        .scan(0u64, |acc_offset, (index, (path, len))| {
            let offset = *acc_offset;
            *acc_offset += len;
            Some(FileEntry {
                index,
                path,
                len,
                offset_in_torrent: offset,
                piece_range: lengths.iter_pieces_within_offset(offset, len),
            })
        })
        .collect()
}

/// The usual implementation of [`DownloadEngine::map_byte_range`].
pub fn map_file_range(
    lengths: &Lengths,
    file: &FileEntry,
    offset: u64,
    length: u64,
) -> Option<PieceRequest> {
    if offset >= file.len {
        return None;
    }
    let length = length.min(file.len - offset);
    lengths.map_absolute(file.offset_in_torrent + offset, length)
}

/// Bytes of `file` covered by the pieces `have` says are present.
pub fn file_progress(lengths: &Lengths, file: &FileEntry, have: impl Fn(usize) -> bool) -> u64 {
    let file_end = file.offset_in_torrent + file.len;
    lengths
        .iter_piece_indices()
        .skip(file.piece_range.start as usize)
        .take(file.piece_range.len())
        .filter(|p| have(p.get() as usize))
        .map(|p| {
            let start = lengths.piece_offset(p).max(file.offset_in_torrent);
            let end = (lengths.piece_offset(p) + lengths.piece_length(p) as u64).min(file_end);
            end.saturating_sub(start)
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_files() -> (Lengths, Vec<FileEntry>) {
        let lengths = Lengths::new(50, 16).unwrap();
        let files = layout_files([("t/a".to_owned(), 40), ("t/b".to_owned(), 10)], &lengths);
        (lengths, files)
    }

    #[test]
    fn test_layout_files() {
        let (_, files) = two_files();
        assert_eq!(files[0].offset_in_torrent, 0);
        assert_eq!(files[0].piece_range, 0..3);
        assert_eq!(files[1].offset_in_torrent, 40);
        assert_eq!(files[1].piece_range, 2..4);
    }

    #[test]
    fn test_map_file_range_clamps_to_file_end() {
        let (lengths, files) = two_files();
        let r = map_file_range(&lengths, &files[1], 2, 100).unwrap();
        assert_eq!(r.piece.get(), 2);
        assert_eq!(r.start, 10);
        assert_eq!(r.length, 8);
        assert!(map_file_range(&lengths, &files[1], 10, 1).is_none());
    }

    #[test]
    fn test_file_progress() {
        let (lengths, files) = two_files();
        // piece 2 is [32, 48): 8 bytes of "a", 8 bytes of "b"
        assert_eq!(file_progress(&lengths, &files[0], |p| p == 2), 8);
        assert_eq!(file_progress(&lengths, &files[1], |p| p == 2), 8);
        assert_eq!(file_progress(&lengths, &files[1], |_| true), 10);
        assert_eq!(file_progress(&lengths, &files[0], |_| false), 0);
    }
}
