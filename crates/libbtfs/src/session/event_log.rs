use std::{
    fs::File,
    io::{LineWriter, Write},
    path::Path,
    time::Instant,
};

use anyhow::Context;
use tracing::warn;

use crate::engine::EngineEvent;

pub const EVENT_LOG_FILENAME: &str = "events.log";

/// Diagnostic log of every engine event, one line each.
pub(super) struct EventLog {
    writer: LineWriter<File>,
    started: Instant,
}

impl EventLog {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("error opening event log {path:?}"))?;
        Ok(Self {
            writer: LineWriter::new(file),
            started: Instant::now(),
        })
    }

    pub fn record(&mut self, event: &EngineEvent) {
        let ms = self.started.elapsed().as_millis();
        let res = match event {
            EngineEvent::PieceRead { piece, result } => match result {
                Ok(data) => writeln!(self.writer, "{ms} {} {piece} size={}", event.name(), data.len()),
                Err(e) => writeln!(self.writer, "{ms} {} {piece} error={e:?}", event.name()),
            },
            EngineEvent::PieceFinished { piece } | EngineEvent::HashFailed { piece } => {
                writeln!(self.writer, "{ms} {} {piece}", event.name())
            }
            EngineEvent::TorrentAdded { has_metadata } => {
                writeln!(self.writer, "{ms} {} has_metadata={has_metadata}", event.name())
            }
            EngineEvent::MetadataReceived { files } => {
                writeln!(self.writer, "{ms} {} files={}", event.name(), files.len())
            }
            EngineEvent::MetadataFailed { error } => {
                writeln!(self.writer, "{ms} {} {error:?}", event.name())
            }
            EngineEvent::Info(msg) => writeln!(self.writer, "{ms} {} {msg:?}", event.name()),
        };
        if let Err(e) = res {
            warn!("error writing event log: {e:#}");
        }
    }

    pub fn close(mut self) -> anyhow::Result<()> {
        self.writer.flush().context("error flushing event log")
    }
}
