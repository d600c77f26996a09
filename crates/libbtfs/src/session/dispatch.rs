use std::{sync::Arc, thread::JoinHandle};

use anyhow::Context;
use tracing::{debug, error_span, info, trace, warn};

use crate::{
    engine::{EngineEvent, PiecePriority},
    file_info::FileEntry,
    metadata_index::MetadataIndex,
};

use super::{Session, SharedState, event_log::EventLog};

pub(super) fn spawn(session: Arc<Session>) -> anyhow::Result<JoinHandle<()>> {
    let event_log = match session.options.event_log.as_ref() {
        Some(path) => Some(EventLog::create(path)?),
        None => None,
    };
    std::thread::Builder::new()
        .name("alert".to_owned())
        .spawn(move || {
            let _span = error_span!("dispatch").entered();
            session.run_dispatch_loop(event_log);
        })
        .context("error spawning dispatch thread")
}

impl Session {
    fn run_dispatch_loop(&self, mut event_log: Option<EventLog>) {
        debug!("starting");
        while !self.is_cancelled() {
            let event = match self.engine.next_event(self.options.event_poll_interval) {
                Some(event) => event,
                None => continue,
            };
            if let Some(log) = event_log.as_mut() {
                log.record(&event);
            }

            let mut g = self.state.lock();
            self.handle_event(&mut g, event);
            drop(g);

            self.piece_event.notify_all();
        }

        if let Some(log) = event_log.take() {
            if let Err(e) = log.close() {
                warn!("error closing event log: {e:#}");
            }
        }
        debug!("cancelled, exiting");
    }

    fn handle_event(&self, g: &mut SharedState, event: EngineEvent) {
        let engine = &*self.engine;
        match event {
            EngineEvent::TorrentAdded { has_metadata } => {
                debug!(has_metadata, "torrent added");
                if has_metadata {
                    match engine.files() {
                        Some(files) => self.setup(files),
                        None => warn!("engine claims to have metadata, but no files"),
                    }
                }
            }
            EngineEvent::MetadataReceived { files } => self.setup(files),
            EngineEvent::MetadataFailed { error } => {
                warn!("error fetching metadata: {error}");
            }
            EngineEvent::PieceRead { piece, result } => match result {
                Ok(data) => {
                    trace!(%piece, size = data.len(), "read piece");
                    for read in g.reads.values_mut() {
                        read.copy(piece, &data);
                    }
                }
                Err(reason) => {
                    let failed = g
                        .reads
                        .values_mut()
                        .map(|read| read.fail(piece, &reason))
                        .filter(|failed| *failed)
                        .count();
                    warn!(%piece, failed_reads = failed, "error reading piece: {reason}");
                }
            },
            EngineEvent::PieceFinished { piece } => {
                trace!(%piece, "piece finished");
                for read in g.reads.values() {
                    read.trigger(engine);
                }
                g.window.advance(engine);
            }
            EngineEvent::HashFailed { piece } => {
                warn!(%piece, "piece failed hash check");
            }
            EngineEvent::Info(msg) => {
                debug!("{msg}");
            }
        }
    }

    /// Build the index once metadata is known. Nothing gets downloaded until a
    /// read asks for it.
    fn setup(&self, files: Vec<FileEntry>) {
        let engine = &*self.engine;
        let lengths = match engine.lengths() {
            Some(l) => l,
            None => {
                warn!("got a file list without piece lengths, ignoring");
                return;
            }
        };

        if self.options.browse_only {
            engine.pause();
        }

        for piece in lengths.iter_piece_indices() {
            engine.set_piece_priority(piece, PiecePriority::Skip);
        }

        for file in &files {
            debug!(path = %file.mount_path(), len = file.len, "torrent file");
        }
        let index = MetadataIndex::build(files, lengths.default_piece_length());
        info!(
            files = index.files().len(),
            pieces = lengths.total_pieces(),
            "got metadata, ready to start downloading"
        );
        self.index.store(Arc::new(index));
    }
}
