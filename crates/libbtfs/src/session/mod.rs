use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use anyhow::Context;
use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::{
    engine::DownloadEngine,
    error::{Error, Result},
    file_info::FileEntry,
    metadata_index::MetadataIndex,
    piece_window::{PieceWindow, PieceWindowConfig},
    read_request::ReadRequest,
};

mod dispatch;
mod event_log;

pub use event_log::EVENT_LOG_FILENAME;

type ReadId = u64;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub window: PieceWindowConfig,

    /// Only fetch metadata, refuse to read file contents.
    pub browse_only: bool,

    /// Keep downloaded data (and the data directory) after shutdown.
    pub keep: bool,

    /// Per-mount working directory. Removed on shutdown unless `keep` is set.
    pub data_dir: Option<PathBuf>,

    /// Write a line per engine event to this file.
    pub event_log: Option<PathBuf>,

    /// How long the dispatch loop waits for an event before re-checking for
    /// cancellation.
    pub event_poll_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            window: Default::default(),
            browse_only: false,
            keep: false,
            data_dir: None,
            event_log: None,
            event_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Everything protected by the session lock.
pub(crate) struct SharedState {
    reads: HashMap<ReadId, ReadRequest>,
    next_read_id: ReadId,
    window: PieceWindow,
    closed: bool,
}

impl SharedState {
    fn register(&mut self, read: ReadRequest) -> ReadId {
        let id = self.next_read_id;
        self.next_read_id += 1;
        self.reads.insert(id, read);
        id
    }
}

/// The process-wide context of one mount: the engine, the metadata index and
/// the state shared between reading threads and the dispatch loop.
pub struct Session {
    engine: Arc<dyn DownloadEngine>,
    index: ArcSwap<MetadataIndex>,
    state: Mutex<SharedState>,
    // Signalled on any change of piece fill status.
    piece_event: Condvar,
    cancelled: AtomicBool,
    shut_down: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    options: SessionOptions,
}

impl Session {
    /// Create the session and start the dispatch loop.
    ///
    /// The dispatch thread holds a reference to the session until
    /// [`Session::shutdown`] is called.
    pub fn start(engine: Arc<dyn DownloadEngine>, options: SessionOptions) -> anyhow::Result<Arc<Self>> {
        let session = Arc::new(Self {
            engine,
            index: ArcSwap::from_pointee(MetadataIndex::empty()),
            state: Mutex::new(SharedState {
                reads: HashMap::new(),
                next_read_id: 0,
                window: PieceWindow::new(options.window),
                closed: false,
            }),
            piece_event: Condvar::new(),
            cancelled: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
            options,
        });
        let handle = dispatch::spawn(session.clone()).context("error starting dispatch loop")?;
        *session.dispatcher.lock() = Some(handle);
        Ok(session)
    }

    pub fn engine(&self) -> &dyn DownloadEngine {
        &*self.engine
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// The current metadata index. Never blocks on the session lock.
    pub fn index(&self) -> Arc<MetadataIndex> {
        self.index.load_full()
    }

    pub fn window_cursor(&self) -> u32 {
        self.state.lock().window.cursor()
    }

    pub fn active_reads(&self) -> usize {
        self.state.lock().reads.len()
    }

    /// Read up to `size` bytes of `file` at `offset`, blocking until the
    /// pieces holding them arrive. Returns fewer bytes at end of file, and
    /// nothing if the session shuts down while waiting.
    pub fn read(&self, file: &FileEntry, offset: u64, size: u64) -> Result<Vec<u8>> {
        let mut g = self.state.lock();
        if g.closed {
            return Err(Error::SessionClosed);
        }

        let read = ReadRequest::new(&*self.engine, file, offset, size);
        let id = g.register(read);

        let result = self.await_completion(&mut g, id);

        let read = g.reads.remove(&id);
        drop(g);

        let len = result?;
        let mut buf = read.map(|r| r.into_buffer()).unwrap_or_default();
        buf.truncate(len as usize);
        Ok(buf)
    }

    /// Block until the registered read `id` is done. Returns how many bytes it
    /// produced.
    fn await_completion(&self, g: &mut MutexGuard<'_, SharedState>, id: ReadId) -> Result<u64> {
        let (first_part, total_size) = match g.reads.get(&id) {
            Some(read) => (read.parts().first().cloned(), read.total_size()),
            None => return Err(Error::SessionClosed),
        };
        let first_part = match first_part {
            Some(p) if total_size > 0 => p,
            _ => return Ok(0),
        };

        // Pick up whatever is already downloaded.
        if let Some(read) = g.reads.get(&id) {
            read.trigger(&*self.engine);
        }

        // Move the window to the first piece serving this read. The read
        // doesn't have to start on a piece boundary.
        g.window.jump(
            &*self.engine,
            first_part.piece.get(),
            first_part.start as u64 + total_size,
        );

        loop {
            let read = match g.reads.get(&id) {
                Some(read) => read,
                None => return Err(Error::SessionClosed),
            };
            if let Some((piece, reason)) = read.failure() {
                return Err(Error::PieceFailed {
                    piece: *piece,
                    reason: reason.clone(),
                });
            }
            if read.finished() {
                return Ok(total_size);
            }
            if g.closed {
                debug!(id, "session closed while waiting for read");
                return Ok(0);
            }
            self.piece_event.wait(g);
        }
    }

    /// Stop the dispatch loop, wake up blocked readers and tear down the
    /// engine. Safe to call more than once.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.cancelled.store(true, Ordering::Release);
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("dispatch thread panicked"))?;
        }

        self.state.lock().closed = true;
        self.piece_event.notify_all();

        self.engine
            .shutdown(!self.options.keep)
            .context("error shutting down download engine")?;

        if let Some(data_dir) = self.options.data_dir.as_ref() {
            if self.options.keep {
                info!(?data_dir, "keeping downloaded data");
            } else if let Err(e) = std::fs::remove_dir_all(data_dir) {
                warn!(?data_dir, "error removing data directory: {e:#}");
            }
        }
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
