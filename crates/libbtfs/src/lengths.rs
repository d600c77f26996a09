pub const fn ceil_div_u64(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

pub const fn last_element_size_u64(total: u64, chunk_size: u64) -> u64 {
    let rem = total % chunk_size;
    if rem == 0 {
        return chunk_size;
    }
    rem
}

/// A byte range that starts inside one piece. `length` is not clamped to the
/// piece boundary, callers that need that use [`Lengths::clamp_to_piece`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceRequest {
    pub piece: ValidPieceIndex,
    pub start: u32,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lengths {
    total_length: u64,
    piece_length: u32,
    last_piece_id: u32,
    last_piece_length: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidPieceIndex(u32);
impl std::fmt::Display for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::fmt::Debug for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl ValidPieceIndex {
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Lengths {
    pub fn new(total_length: u64, piece_length: u32) -> anyhow::Result<Self> {
        if piece_length == 0 {
            anyhow::bail!("piece length can't be 0");
        }
        if total_length == 0 {
            anyhow::bail!("torrent with 0 length")
        }
        let total_pieces = ceil_div_u64(total_length, piece_length as u64);
        let total_pieces: u32 = total_pieces
            .try_into()
            .map_err(|_| anyhow::anyhow!("too many pieces: {total_pieces}"))?;
        Ok(Self {
            piece_length,
            total_length,
            last_piece_id: total_pieces - 1,
            last_piece_length: last_element_size_u64(total_length, piece_length as u64) as u32,
        })
    }
    pub const fn total_length(&self) -> u64 {
        self.total_length
    }
    pub const fn validate_piece_index(&self, index: u32) -> Option<ValidPieceIndex> {
        if index > self.last_piece_id {
            return None;
        }
        Some(ValidPieceIndex(index))
    }
    pub const fn default_piece_length(&self) -> u32 {
        self.piece_length
    }
    pub const fn last_piece_id(&self) -> ValidPieceIndex {
        ValidPieceIndex(self.last_piece_id)
    }
    pub const fn total_pieces(&self) -> u32 {
        self.last_piece_id + 1
    }
    pub const fn piece_length(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return self.last_piece_length;
        }
        self.piece_length
    }
    pub const fn piece_offset(&self, index: ValidPieceIndex) -> u64 {
        index.0 as u64 * self.piece_length as u64
    }

    pub fn iter_piece_indices(&self) -> impl Iterator<Item = ValidPieceIndex> + use<> {
        (0..self.total_pieces()).map(ValidPieceIndex)
    }

    /// Locate the piece holding the absolute torrent offset.
    pub fn map_absolute(&self, offset: u64, length: u64) -> Option<PieceRequest> {
        if offset >= self.total_length {
            return None;
        }
        let piece = self.validate_piece_index((offset / self.piece_length as u64) as u32)?;
        Some(PieceRequest {
            piece,
            start: (offset % self.piece_length as u64) as u32,
            length,
        })
    }

    /// Cut the request so it doesn't cross into the next piece.
    pub fn clamp_to_piece(&self, req: PieceRequest) -> PieceRequest {
        let room = self.piece_length(req.piece).saturating_sub(req.start) as u64;
        PieceRequest {
            length: req.length.min(room),
            ..req
        }
    }

    /// The pieces that hold bytes [offset, offset + len) of the torrent.
    pub fn iter_pieces_within_offset(&self, offset: u64, len: u64) -> std::ops::Range<u32> {
        let start = (offset / self.piece_length as u64) as u32;
        if len == 0 {
            return start..start;
        }
        let end = ceil_div_u64(offset + len, self.piece_length as u64) as u32;
        start..end.min(self.total_pieces())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_lengths() -> Lengths {
        Lengths::new(1174243328, 262144).unwrap()
    }

    #[test]
    fn test_total_pieces() {
        let l = make_lengths();
        assert_eq!(l.total_pieces(), 4480);
    }

    #[test]
    fn test_piece_length() {
        let l = make_lengths();
        let p = l.validate_piece_index(4479).unwrap();

        assert_eq!(l.piece_length(l.validate_piece_index(0).unwrap()), 262144);
        assert_eq!(l.piece_length(p), 100352);
        assert!(l.validate_piece_index(4480).is_none());
    }

    #[test]
    fn test_zero_lengths_rejected() {
        assert!(Lengths::new(0, 16).is_err());
        assert!(Lengths::new(16, 0).is_err());
    }

    #[test]
    fn test_map_absolute() {
        let l = Lengths::new(40, 16).unwrap();
        let r = l.map_absolute(21, 100).unwrap();
        assert_eq!(r.piece.get(), 1);
        assert_eq!(r.start, 5);
        assert_eq!(r.length, 100);
        assert_eq!(l.clamp_to_piece(r).length, 11);

        // the last piece is only 8 bytes long
        let last = l.map_absolute(33, 100).unwrap();
        assert_eq!(l.clamp_to_piece(last).length, 7);

        assert!(l.map_absolute(40, 1).is_none());
    }

    #[test]
    fn test_iter_pieces_within_offset() {
        let l = Lengths::new(40, 16).unwrap();
        assert_eq!(l.iter_pieces_within_offset(0, 40), 0..3);
        assert_eq!(l.iter_pieces_within_offset(16, 16), 1..2);
        assert_eq!(l.iter_pieces_within_offset(17, 0), 1..1);
        assert_eq!(l.iter_pieces_within_offset(15, 2), 0..2);
    }
}
