//! A [`DownloadEngine`] that "downloads" pieces from a local copy of the
//! torrent's data, verifying them against the piece hashes and storing them in
//! the mount's data directory like a real client would.

use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    num::NonZeroU32,
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use anyhow::Context;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use governor::{
    DefaultDirectRateLimiter, Quota, RateLimiter,
    clock::{Clock, DefaultClock},
};
use parking_lot::{Condvar, Mutex};
use sha1::{Digest, Sha1};
use tracing::{debug, debug_span, info, trace, warn};

use crate::{
    engine::{DownloadEngine, EngineEvent, PiecePriority, layout_files, map_file_range},
    file_info::FileEntry,
    lengths::{Lengths, PieceRequest, ValidPieceIndex},
    torrent_metainfo::{InfoHash, TorrentMeta},
};

const THROTTLE_CHUNK: u32 = 16384;
const MAX_THROTTLE_SLEEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalEngineOptions {
    /// Bytes per second read from the source. Unlimited if not set.
    pub max_download_rate: Option<NonZeroU32>,
}

struct OpenedFile {
    path: PathBuf,
    file: Option<Mutex<File>>,
}

/// The files of one torrent under some directory.
struct FileSet {
    files: Vec<OpenedFile>,
}

impl FileSet {
    /// Missing files are tolerated, their pieces fail to download.
    fn open_source(dir: &Path, files: &[FileEntry]) -> Self {
        let files = files
            .iter()
            .map(|f| {
                let path = dir.join(&f.path);
                let file = match File::open(&path) {
                    Ok(file) => Some(Mutex::new(file)),
                    Err(e) => {
                        warn!(?path, "can't open source file: {e:#}");
                        None
                    }
                };
                OpenedFile { path, file }
            })
            .collect();
        Self { files }
    }

    /// Returns the set and whether any of the files was already there.
    fn open_storage(dir: &Path, files: &[FileEntry]) -> anyhow::Result<(Self, bool)> {
        let mut existed = false;
        let mut opened = Vec::with_capacity(files.len());
        for f in files {
            let path = dir.join(&f.path);
            std::fs::create_dir_all(path.parent().context("bug: no parent")?)
                .with_context(|| format!("error creating parent directory of {path:?}"))?;
            existed |= path.exists();
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)
                .with_context(|| format!("error opening {path:?} in read/write mode"))?;
            file.set_len(f.len)
                .with_context(|| format!("error setting length of {path:?}"))?;
            opened.push(OpenedFile {
                path,
                file: Some(Mutex::new(file)),
            });
        }
        Ok((Self { files: opened }, existed))
    }

    fn file(&self, file_id: usize) -> anyhow::Result<&Mutex<File>> {
        let f = self.files.get(file_id).context("no such file")?;
        f.file
            .as_ref()
            .with_context(|| format!("{:?} is not available", f.path))
    }

    fn pread_exact(&self, file_id: usize, offset: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        let mut g = self.file(file_id)?.lock();
        g.seek(SeekFrom::Start(offset))?;
        Ok(g.read_exact(buf)?)
    }

    fn pwrite_all(&self, file_id: usize, offset: u64, buf: &[u8]) -> anyhow::Result<()> {
        let mut g = self.file(file_id)?.lock();
        g.seek(SeekFrom::Start(offset))?;
        Ok(g.write_all(buf)?)
    }

    fn remove_files(&self) -> anyhow::Result<()> {
        for f in &self.files {
            match std::fs::remove_file(&f.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("error removing {:?}", f.path)),
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct FetchState {
    have: Vec<bool>,
    priorities: Vec<PiecePriority>,
    // Failed pieces, not retried until someone asks for them again.
    parked: Vec<bool>,
    readbacks: VecDeque<ValidPieceIndex>,
    paused: bool,
    cancelled: bool,
}

impl FetchState {
    /// Highest priority missing piece, lowest index first among equals.
    fn next_wanted(&self, lengths: &Lengths) -> Option<ValidPieceIndex> {
        lengths
            .iter_piece_indices()
            .filter(|p| {
                let i = p.get() as usize;
                !self.have[i] && !self.parked[i] && self.priorities[i] > PiecePriority::Skip
            })
            .max_by_key(|p| (self.priorities[p.get() as usize], std::cmp::Reverse(p.get())))
    }
}

enum Job {
    Readback(ValidPieceIndex),
    Fetch(ValidPieceIndex),
}

struct Inner {
    lengths: Lengths,
    files: Vec<FileEntry>,
    piece_hashes: Vec<InfoHash>,
    source: FileSet,
    storage: FileSet,
    state: Mutex<FetchState>,
    wakeup: Condvar,
    events: Sender<EngineEvent>,
    limiter: Option<DefaultDirectRateLimiter>,
}

pub struct LocalEngine {
    inner: Arc<Inner>,
    events: Receiver<EngineEvent>,
    fetcher: Mutex<Option<JoinHandle<()>>>,
}

impl LocalEngine {
    /// Serve `torrent` from the data in `source_dir`, storing verified pieces
    /// under `storage_dir`. Pieces already present in `storage_dir` (e.g. kept
    /// from an earlier run) are picked up without fetching them again.
    pub fn new(
        torrent: &TorrentMeta,
        source_dir: &Path,
        storage_dir: &Path,
        options: LocalEngineOptions,
    ) -> anyhow::Result<Self> {
        let lengths = torrent.lengths;
        let files = layout_files(torrent.files.iter().cloned(), &lengths);
        let pieces = lengths.total_pieces() as usize;

        let source = FileSet::open_source(source_dir, &files);
        let (storage, existed) = FileSet::open_storage(storage_dir, &files)
            .context("error initializing storage")?;

        let limiter = options.max_download_rate.map(|rate| {
            let burst = rate.max(NonZeroU32::new(THROTTLE_CHUNK).unwrap_or(rate));
            RateLimiter::direct(Quota::per_second(rate).allow_burst(burst))
        });

        let (tx, rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(Inner {
            lengths,
            files,
            piece_hashes: torrent.piece_hashes.clone(),
            source,
            storage,
            state: Mutex::new(FetchState {
                have: vec![false; pieces],
                priorities: vec![PiecePriority::Skip; pieces],
                parked: vec![false; pieces],
                ..Default::default()
            }),
            wakeup: Condvar::new(),
            events: tx,
            limiter,
        });

        if existed {
            inner.check_existing_pieces();
        }

        let fetcher = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name("fetcher".to_owned())
                .spawn(move || {
                    let _span = debug_span!("fetcher").entered();
                    inner.run_fetcher();
                })
                .context("error spawning fetcher thread")?
        };

        inner.emit(EngineEvent::TorrentAdded { has_metadata: true });

        Ok(Self {
            inner,
            events: rx,
            fetcher: Mutex::new(Some(fetcher)),
        })
    }

    fn slot(index: ValidPieceIndex) -> usize {
        index.get() as usize
    }
}

impl Inner {
    fn emit(&self, event: EngineEvent) {
        // Only fails once the engine is dropped.
        let _ = self.events.send(event);
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// (file index, offset in file, range in piece buffer) for every file
    /// the piece touches.
    fn piece_spans(
        &self,
        piece: ValidPieceIndex,
    ) -> impl Iterator<Item = (usize, u64, Range<usize>)> + '_ {
        let piece_start = self.lengths.piece_offset(piece);
        let piece_end = piece_start + self.lengths.piece_length(piece) as u64;
        self.files
            .iter()
            .filter(|f| f.len > 0)
            .filter_map(move |f| {
                let file_end = f.offset_in_torrent + f.len;
                let start = piece_start.max(f.offset_in_torrent);
                let end = piece_end.min(file_end);
                if start >= end {
                    return None;
                }
                let buf_start = (start - piece_start) as usize;
                let buf_end = (end - piece_start) as usize;
                Some((f.index, start - f.offset_in_torrent, buf_start..buf_end))
            })
    }

    fn read_piece_from(&self, set: &FileSet, piece: ValidPieceIndex) -> anyhow::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.lengths.piece_length(piece) as usize];
        for (file_id, offset, range) in self.piece_spans(piece) {
            set.pread_exact(file_id, offset, &mut buf[range])
                .with_context(|| format!("error reading piece {piece} from file {file_id}"))?;
        }
        Ok(buf)
    }

    fn write_piece(&self, piece: ValidPieceIndex, data: &[u8]) -> anyhow::Result<()> {
        for (file_id, offset, range) in self.piece_spans(piece) {
            self.storage
                .pwrite_all(file_id, offset, &data[range])
                .with_context(|| format!("error writing piece {piece} to file {file_id}"))?;
        }
        Ok(())
    }

    fn hash_matches(&self, piece: ValidPieceIndex, data: &[u8]) -> bool {
        let digest: InfoHash = Sha1::digest(data).into();
        self.piece_hashes
            .get(piece.get() as usize)
            .is_some_and(|h| *h == digest)
    }

    fn check_existing_pieces(&self) {
        let mut found = 0;
        for piece in self.lengths.iter_piece_indices() {
            let ok = self
                .read_piece_from(&self.storage, piece)
                .map(|data| self.hash_matches(piece, &data))
                .unwrap_or(false);
            if ok {
                self.state.lock().have[piece.get() as usize] = true;
                found += 1;
            }
        }
        info!(
            found,
            total = self.lengths.total_pieces(),
            "checked previously stored pieces"
        );
    }

    /// Sleep until the rate limit allows `len` more bytes. Returns false if
    /// cancelled meanwhile.
    fn throttle(&self, len: u32) -> bool {
        let limiter = match self.limiter.as_ref() {
            Some(l) => l,
            None => return true,
        };
        let clock = DefaultClock::default();
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(THROTTLE_CHUNK);
            let n = match NonZeroU32::new(chunk) {
                Some(n) => n,
                None => break,
            };
            loop {
                match limiter.check_n(n) {
                    Ok(Ok(())) => break,
                    Ok(Err(not_until)) => {
                        if self.is_cancelled() {
                            return false;
                        }
                        let wait = not_until.wait_time_from(clock.now());
                        std::thread::sleep(wait.min(MAX_THROTTLE_SLEEP));
                    }
                    Err(e) => {
                        // Chunk bigger than the burst. Can't happen with the
                        // quota built in new(), but don't spin on it.
                        debug!("rate limiter can't fit {chunk} bytes: {e}");
                        break;
                    }
                }
            }
            remaining -= chunk;
        }
        true
    }

    fn next_job(&self) -> Option<Job> {
        let mut g = self.state.lock();
        loop {
            if g.cancelled {
                return None;
            }
            if let Some(piece) = g.readbacks.pop_front() {
                return Some(Job::Readback(piece));
            }
            if !g.paused {
                if let Some(piece) = g.next_wanted(&self.lengths) {
                    return Some(Job::Fetch(piece));
                }
            }
            self.wakeup.wait(&mut g);
        }
    }

    fn run_fetcher(&self) {
        debug!("starting");
        while let Some(job) = self.next_job() {
            match job {
                Job::Readback(piece) => {
                    let result = self
                        .read_piece_from(&self.storage, piece)
                        .map(Bytes::from)
                        .map_err(|e| format!("{e:#}"));
                    self.emit(EngineEvent::PieceRead { piece, result });
                }
                Job::Fetch(piece) => self.fetch(piece),
            }
        }
        debug!("cancelled, exiting");
    }

    fn fetch(&self, piece: ValidPieceIndex) {
        trace!(%piece, "fetching");
        if !self.throttle(self.lengths.piece_length(piece)) {
            return;
        }
        let res = self
            .read_piece_from(&self.source, piece)
            .and_then(|data| {
                if !self.hash_matches(piece, &data) {
                    self.emit(EngineEvent::HashFailed { piece });
                    anyhow::bail!("piece {piece} failed hash check");
                }
                self.write_piece(piece, &data)
            });

        let mut g = self.state.lock();
        let idx = piece.get() as usize;
        match res {
            Ok(()) => {
                g.have[idx] = true;
                drop(g);
                self.emit(EngineEvent::PieceFinished { piece });
            }
            Err(e) => {
                g.parked[idx] = true;
                drop(g);
                debug!(%piece, "error fetching piece: {e:#}");
                self.emit(EngineEvent::PieceRead {
                    piece,
                    result: Err(format!("{e:#}")),
                });
            }
        }
    }
}

impl DownloadEngine for LocalEngine {
    fn has_piece(&self, index: ValidPieceIndex) -> bool {
        self.inner.state.lock().have[Self::slot(index)]
    }

    fn set_piece_priority(&self, index: ValidPieceIndex, priority: PiecePriority) {
        let i = Self::slot(index);
        let mut g = self.inner.state.lock();
        g.priorities[i] = priority;
        if priority > PiecePriority::Skip && g.parked[i] {
            trace!(%index, "retrying failed piece");
            g.parked[i] = false;
        }
        if priority > PiecePriority::Skip {
            self.inner.wakeup.notify_all();
        }
    }

    fn request_piece_readback(&self, index: ValidPieceIndex) {
        let mut g = self.inner.state.lock();
        if g.readbacks.contains(&index) {
            trace!(%index, "readback already queued");
            return;
        }
        g.readbacks.push_back(index);
        self.inner.wakeup.notify_all();
    }

    fn map_byte_range(
        &self,
        file_index: usize,
        offset: u64,
        length: u64,
    ) -> Option<PieceRequest> {
        map_file_range(
            &self.inner.lengths,
            self.inner.files.get(file_index)?,
            offset,
            length,
        )
    }

    fn lengths(&self) -> Option<Lengths> {
        Some(self.inner.lengths)
    }

    fn files(&self) -> Option<Vec<FileEntry>> {
        Some(self.inner.files.clone())
    }

    fn file_progress(&self, file_index: usize) -> u64 {
        let file = match self.inner.files.get(file_index) {
            Some(f) => f,
            None => return 0,
        };
        let g = self.inner.state.lock();
        super::file_progress(&self.inner.lengths, file, |p| g.have[p])
    }

    fn next_event(&self, timeout: Duration) -> Option<EngineEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    fn pause(&self) {
        debug!("pausing");
        self.inner.state.lock().paused = true;
    }

    fn shutdown(&self, delete_files: bool) -> anyhow::Result<()> {
        self.inner.state.lock().cancelled = true;
        self.inner.wakeup.notify_all();
        let handle = self.fetcher.lock().take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("fetcher thread panicked"))?;
        }
        if delete_files {
            self.inner
                .storage
                .remove_files()
                .context("error removing downloaded files")?;
        }
        Ok(())
    }
}

impl Drop for LocalEngine {
    fn drop(&mut self) {
        self.inner.state.lock().cancelled = true;
        self.inner.wakeup.notify_all();
    }
}
