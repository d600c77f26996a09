use std::{
    collections::HashMap,
    io::Write,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use tempfile::TempDir;
use tracing::{info, trace};

use crate::{
    engine::{
        DownloadEngine, EngineEvent, PiecePriority, file_progress, layout_files, map_file_range,
    },
    file_info::FileEntry,
    lengths::{Lengths, PieceRequest, ValidPieceIndex},
    torrent_metainfo::{RawFile, RawInfo, TorrentMeta},
};

pub fn setup_test_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Byte at `offset` of every fake torrent.
pub fn content_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

pub fn write_file_with_content(path: &Path, offset_in_torrent: u64, len: u64) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let mut file = std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .unwrap();
    trace!(?path, "creating test file");
    let data: Vec<u8> = (offset_in_torrent..offset_in_torrent + len)
        .map(content_byte)
        .collect();
    file.write_all(&data).unwrap();
}

/// A directory holding the data of `files` laid out as one torrent.
pub fn create_source_dir(files: &[(&str, u64)]) -> TempDir {
    let dir = TempDir::with_prefix("btfs_test").unwrap();
    info!(path = ?dir.path(), "created tempdir");
    let mut offset = 0;
    for (path, len) in files {
        write_file_with_content(&dir.path().join(path), offset, *len);
        offset += len;
    }
    dir
}

#[derive(Serialize)]
struct TestTorrent {
    info: RawInfo,
}

/// Bencoded multi-file torrent over the content [`create_source_dir`] writes.
/// Every path must start with `name/`.
pub fn make_torrent_bytes(name: &str, piece_length: u32, files: &[(&str, u64)]) -> Vec<u8> {
    let total: u64 = files.iter().map(|(_, len)| *len).sum();
    let mut pieces = Vec::new();
    let mut offset = 0;
    while offset < total {
        let end = (offset + piece_length as u64).min(total);
        let data: Vec<u8> = (offset..end).map(content_byte).collect();
        pieces.extend_from_slice(&Sha1::digest(&data));
        offset = end;
    }
    let files = files
        .iter()
        .map(|(path, len)| RawFile {
            length: *len,
            path: path
                .strip_prefix(name)
                .and_then(|p| p.strip_prefix('/'))
                .unwrap()
                .split('/')
                .map(str::to_owned)
                .collect(),
        })
        .collect();
    serde_bencode::to_bytes(&TestTorrent {
        info: RawInfo {
            name: name.to_owned(),
            piece_length,
            pieces: ByteBuf::from(pieces),
            length: None,
            files: Some(files),
        },
    })
    .unwrap()
}

pub fn make_torrent(name: &str, piece_length: u32, files: &[(&str, u64)]) -> TorrentMeta {
    TorrentMeta::from_bytes(&make_torrent_bytes(name, piece_length, files)).unwrap()
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[derive(Default)]
struct FakeState {
    have: Vec<bool>,
    priorities: Vec<PiecePriority>,
    readbacks: Vec<u32>,
    broken: HashMap<u32, String>,
    paused: bool,
    shutdown: Option<bool>,
}

/// An in-memory engine driven by the test. Pieces only "download" when the
/// test says so, readbacks are answered right away.
pub struct FakeEngine {
    lengths: Lengths,
    files: Vec<FileEntry>,
    has_metadata: AtomicBool,
    state: Mutex<FakeState>,
    tx: Sender<EngineEvent>,
    rx: Receiver<EngineEvent>,
}

impl FakeEngine {
    /// Metadata is available right away, announced via `TorrentAdded`.
    pub fn new(piece_length: u32, files: &[(&str, u64)]) -> Self {
        let engine = Self::new_without_metadata(piece_length, files);
        engine.has_metadata.store(true, Ordering::SeqCst);
        engine.send(EngineEvent::TorrentAdded { has_metadata: true });
        engine
    }

    /// Metadata shows up only after [`FakeEngine::receive_metadata`].
    pub fn new_without_metadata(piece_length: u32, files: &[(&str, u64)]) -> Self {
        let total = files.iter().map(|(_, len)| *len).sum();
        let lengths = Lengths::new(total, piece_length).unwrap();
        let files = layout_files(
            files.iter().map(|(path, len)| ((*path).to_owned(), *len)),
            &lengths,
        );
        let pieces = lengths.total_pieces() as usize;
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            lengths,
            files,
            has_metadata: AtomicBool::new(false),
            state: Mutex::new(FakeState {
                have: vec![false; pieces],
                priorities: vec![PiecePriority::Skip; pieces],
                ..Default::default()
            }),
            tx,
            rx,
        }
    }

    pub fn receive_metadata(&self) {
        self.has_metadata.store(true, Ordering::SeqCst);
        self.send(EngineEvent::MetadataReceived {
            files: self.files.clone(),
        });
    }

    pub fn send(&self, event: EngineEvent) {
        self.tx.send(event).unwrap();
    }

    pub fn piece(&self, index: u32) -> ValidPieceIndex {
        self.lengths.validate_piece_index(index).unwrap()
    }

    pub fn file(&self, index: usize) -> FileEntry {
        self.files[index].clone()
    }

    pub fn piece_data(&self, index: u32) -> Vec<u8> {
        let piece = self.piece(index);
        let start = self.lengths.piece_offset(piece);
        let len = self.lengths.piece_length(piece) as u64;
        (start..start + len).map(content_byte).collect()
    }

    /// What reading `len` bytes of a file at `offset` must return.
    pub fn expected(&self, file_index: usize, offset: u64, len: u64) -> Vec<u8> {
        let file = &self.files[file_index];
        let start = offset.min(file.len);
        let end = offset.saturating_add(len).min(file.len);
        (file.offset_in_torrent + start..file.offset_in_torrent + end)
            .map(content_byte)
            .collect()
    }

    pub fn set_have(&self, index: u32) {
        self.state.lock().have[index as usize] = true;
    }

    /// Mark the piece downloaded and tell the session about it.
    pub fn complete_piece(&self, index: u32) {
        self.set_have(index);
        self.send(EngineEvent::PieceFinished {
            piece: self.piece(index),
        });
    }

    /// Readbacks of this piece will fail from now on.
    pub fn break_piece(&self, index: u32, reason: &str) {
        self.state.lock().broken.insert(index, reason.to_owned());
    }

    pub fn priority(&self, index: u32) -> PiecePriority {
        self.state.lock().priorities[index as usize]
    }

    pub fn readback_requests(&self) -> Vec<u32> {
        self.state.lock().readbacks.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// `Some(delete_files)` once shut down.
    pub fn shutdown_called(&self) -> Option<bool> {
        self.state.lock().shutdown
    }
}

impl DownloadEngine for FakeEngine {
    fn has_piece(&self, index: ValidPieceIndex) -> bool {
        self.state.lock().have[index.get() as usize]
    }

    fn set_piece_priority(&self, index: ValidPieceIndex, priority: PiecePriority) {
        self.state.lock().priorities[index.get() as usize] = priority;
    }

    fn request_piece_readback(&self, index: ValidPieceIndex) {
        let broken = {
            let mut g = self.state.lock();
            g.readbacks.push(index.get());
            g.broken.get(&index.get()).cloned()
        };
        let result = match broken {
            Some(reason) => Err(reason),
            None => Ok(Bytes::from(self.piece_data(index.get()))),
        };
        self.send(EngineEvent::PieceRead {
            piece: index,
            result,
        });
    }

    fn map_byte_range(
        &self,
        file_index: usize,
        offset: u64,
        length: u64,
    ) -> Option<PieceRequest> {
        map_file_range(&self.lengths, self.files.get(file_index)?, offset, length)
    }

    fn lengths(&self) -> Option<Lengths> {
        self.has_metadata
            .load(Ordering::SeqCst)
            .then_some(self.lengths)
    }

    fn files(&self) -> Option<Vec<FileEntry>> {
        self.has_metadata
            .load(Ordering::SeqCst)
            .then(|| self.files.clone())
    }

    fn file_progress(&self, file_index: usize) -> u64 {
        let file = match self.files.get(file_index) {
            Some(f) => f,
            None => return 0,
        };
        let g = self.state.lock();
        file_progress(&self.lengths, file, |p| g.have[p])
    }

    fn next_event(&self, timeout: Duration) -> Option<EngineEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    fn pause(&self) {
        self.state.lock().paused = true;
    }

    fn shutdown(&self, delete_files: bool) -> anyhow::Result<()> {
        self.state.lock().shutdown = Some(delete_files);
        Ok(())
    }
}
