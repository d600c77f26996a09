use tracing::{debug, trace};

use crate::{engine::DownloadEngine, file_info::FileEntry, lengths::ValidPieceIndex};

/// The slice of a read that falls inside one piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub piece: ValidPieceIndex,
    /// Offset inside the piece.
    pub start: u32,
    pub length: u32,
    /// Where the part goes in the output buffer.
    pub buf_offset: usize,
    pub filled: bool,
}

/// One in-flight filesystem read.
///
/// Created by the reading thread, filled in (or failed) by the dispatch loop
/// while the reader is blocked, and torn down by the reader again.
#[derive(Debug)]
pub struct ReadRequest {
    buf: Vec<u8>,
    parts: Vec<Part>,
    failure: Option<(ValidPieceIndex, String)>,
}

impl ReadRequest {
    /// Split `[offset, offset + size)` of `file` at piece boundaries.
    pub fn new(engine: &dyn DownloadEngine, file: &FileEntry, offset: u64, size: u64) -> Self {
        let mut parts = Vec::new();
        let mut offset = offset;
        let mut remaining = size;
        let mut buf_offset = 0usize;

        let lengths = engine.lengths();

        while remaining > 0 && offset < file.len {
            let req = match (&lengths, engine.map_byte_range(file.index, offset, remaining)) {
                (Some(lengths), Some(r)) => lengths.clamp_to_piece(r),
                _ => break,
            };
            let length = req.length;
            if length == 0 {
                debug!(?req, "engine mapped a read to an empty range");
                break;
            }

            parts.push(Part {
                piece: req.piece,
                start: req.start,
                length: length as u32,
                buf_offset,
                filled: false,
            });

            remaining -= length;
            offset += length;
            buf_offset += length as usize;
        }

        trace!(file = file.index, parts = parts.len(), size = buf_offset, "new read");

        Self {
            buf: vec![0; buf_offset],
            parts,
            failure: None,
        }
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Ask the engine for the bytes of every piece it already has.
    pub fn trigger(&self, engine: &dyn DownloadEngine) {
        for part in self.parts.iter().filter(|p| !p.filled) {
            if engine.has_piece(part.piece) {
                engine.request_piece_readback(part.piece);
            }
        }
    }

    /// Fill every part of `piece` from the piece's bytes.
    pub fn copy(&mut self, piece: ValidPieceIndex, data: &[u8]) {
        if self.failure.is_some() {
            return;
        }
        for part in self
            .parts
            .iter_mut()
            .filter(|p| p.piece == piece && !p.filled)
        {
            let start = part.start as usize;
            let src = match data.get(start..start + part.length as usize) {
                Some(src) => src,
                None => {
                    self.failure = Some((
                        piece,
                        format!("piece data too short: {} bytes", data.len()),
                    ));
                    return;
                }
            };
            self.buf[part.buf_offset..part.buf_offset + src.len()].copy_from_slice(src);
            part.filled = true;
        }
    }

    /// Fail the whole read if it still needs `piece`. Returns true if it did.
    pub fn fail(&mut self, piece: ValidPieceIndex, reason: &str) -> bool {
        if self.failure.is_some() {
            return false;
        }
        let needs_piece = self.parts.iter().any(|p| p.piece == piece && !p.filled);
        if needs_piece {
            self.failure = Some((piece, reason.to_owned()));
        }
        needs_piece
    }

    pub fn failure(&self) -> Option<&(ValidPieceIndex, String)> {
        self.failure.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn finished(&self) -> bool {
        self.parts.iter().all(|p| p.filled)
    }

    /// What the read can ultimately return, may be less than asked for at
    /// end of file.
    pub fn total_size(&self) -> u64 {
        self.parts.iter().map(|p| p.length as u64).sum()
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buf
    }
}
