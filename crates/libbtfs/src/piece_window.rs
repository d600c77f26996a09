use tracing::trace;

use crate::{
    engine::{DownloadEngine, PiecePriority},
    lengths::{ValidPieceIndex, ceil_div_u64},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceWindowConfig {
    /// How many pieces starting at the cursor get [`PiecePriority::Urgent`].
    pub urgent_pieces: u32,

    /// Extra bytes past the end of a read that get queued at
    /// [`PiecePriority::Background`].
    pub background_tail_bytes: u64,
}

impl Default for PieceWindowConfig {
    fn default() -> Self {
        Self {
            urgent_pieces: 16,
            background_tail_bytes: 0,
        }
    }
}

/// The forward-sliding download window.
///
/// The cursor is the first piece that wasn't downloaded at the time of the last
/// prioritization pass.
#[derive(Debug, Default)]
pub struct PieceWindow {
    config: PieceWindowConfig,
    cursor: u32,
}

fn move_to_next_unfinished(engine: &dyn DownloadEngine, piece: u32) -> Option<ValidPieceIndex> {
    let lengths = engine.lengths()?;
    (piece..lengths.total_pieces())
        .filter_map(|p| lengths.validate_piece_index(p))
        .find(|p| !engine.has_piece(*p))
}

impl PieceWindow {
    pub fn new(config: PieceWindowConfig) -> Self {
        Self { config, cursor: 0 }
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// The reader now cares about `size` bytes counted from the start of
    /// `piece`. Every piece in that range gets at least
    /// [`PiecePriority::Background`], whatever the burst size.
    pub fn jump(&mut self, engine: &dyn DownloadEngine, piece: u32, size: u64) {
        let lengths = match engine.lengths() {
            Some(l) => l,
            None => return,
        };
        let tail = match move_to_next_unfinished(engine, piece) {
            Some(p) => p.get(),
            None => {
                trace!(piece, "nothing left to download from here on");
                return;
            }
        };

        self.cursor = tail;

        let end = lengths.total_pieces();
        let burst_end = tail.saturating_add(self.config.urgent_pieces).min(end);
        for p in (tail..burst_end).filter_map(|p| lengths.validate_piece_index(p)) {
            engine.set_piece_priority(p, PiecePriority::Urgent);
        }

        // Pieces from `piece` onwards until the read (plus tail) is covered.
        // Finished ones are left alone.
        let wanted = ceil_div_u64(
            size.saturating_add(self.config.background_tail_bytes),
            lengths.default_piece_length() as u64,
        );
        let tail_end = (piece as u64).saturating_add(wanted).min(end as u64) as u32;
        for p in (burst_end..tail_end)
            .filter_map(|p| lengths.validate_piece_index(p))
            .filter(|p| !engine.has_piece(*p))
        {
            engine.set_piece_priority(p, PiecePriority::Background);
        }

        trace!(
            cursor = self.cursor,
            urgent = burst_end - tail,
            background = tail_end.saturating_sub(burst_end),
            "moved window"
        );
    }

    /// Slide the window past whatever got downloaded since the last pass.
    pub fn advance(&mut self, engine: &dyn DownloadEngine) {
        self.jump(engine, self.cursor, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_util::FakeEngine;

    fn priorities(engine: &FakeEngine) -> Vec<PiecePriority> {
        (0..engine.num_pieces()).map(|p| engine.priority(p)).collect()
    }

    #[test]
    fn test_jump_sets_urgent_burst() {
        let engine = FakeEngine::new(16, &[("t/a", 16 * 40)]);
        let mut w = PieceWindow::new(PieceWindowConfig::default());
        w.jump(&engine, 0, 0);
        assert_eq!(w.cursor(), 0);
        let p = priorities(&engine);
        assert!(p[..16].iter().all(|p| *p == PiecePriority::Urgent));
        assert!(p[16..].iter().all(|p| *p == PiecePriority::Skip));
    }

    #[test]
    fn test_jump_skips_finished_pieces() {
        let engine = FakeEngine::new(16, &[("t/a", 16 * 40)]);
        for p in 0..3 {
            engine.set_have(p);
        }
        let mut w = PieceWindow::new(PieceWindowConfig::default());
        w.jump(&engine, 0, 0);
        assert_eq!(w.cursor(), 3);
        assert_eq!(engine.priority(2), PiecePriority::Skip);
        assert_eq!(engine.priority(3), PiecePriority::Urgent);
        assert_eq!(engine.priority(18), PiecePriority::Urgent);
        assert_eq!(engine.priority(19), PiecePriority::Skip);
    }

    #[test]
    fn test_large_read_gets_background_tail() {
        let engine = FakeEngine::new(16, &[("t/a", 16 * 40)]);
        let mut w = PieceWindow::new(PieceWindowConfig {
            urgent_pieces: 4,
            background_tail_bytes: 0,
        });
        // 10 pieces worth of bytes starting at piece 2.
        w.jump(&engine, 2, 16 * 10);
        let p = priorities(&engine);
        assert_eq!(p[1], PiecePriority::Skip);
        assert!(p[2..6].iter().all(|p| *p == PiecePriority::Urgent));
        assert!(p[6..12].iter().all(|p| *p == PiecePriority::Background));
        assert_eq!(p[12], PiecePriority::Skip);
    }

    #[test]
    fn test_background_tail_bytes_extends_window() {
        let engine = FakeEngine::new(16, &[("t/a", 16 * 40)]);
        let mut w = PieceWindow::new(PieceWindowConfig {
            urgent_pieces: 2,
            background_tail_bytes: 16 * 3,
        });
        w.jump(&engine, 0, 1);
        let p = priorities(&engine);
        assert!(p[..2].iter().all(|p| *p == PiecePriority::Urgent));
        assert!(p[2..4].iter().all(|p| *p == PiecePriority::Background));
        assert_eq!(p[4], PiecePriority::Skip);
    }

    #[test]
    fn test_read_is_covered_without_urgent_burst() {
        let engine = FakeEngine::new(16, &[("t/a", 16 * 8)]);
        let mut w = PieceWindow::new(PieceWindowConfig {
            urgent_pieces: 0,
            background_tail_bytes: 0,
        });
        engine.set_have(1);
        // 8 bytes into piece 0, 40 bytes long: pieces 0 to 2.
        w.jump(&engine, 0, 8 + 40);
        let p = priorities(&engine);
        assert_eq!(p[0], PiecePriority::Background);
        assert_eq!(p[1], PiecePriority::Skip);
        assert_eq!(p[2], PiecePriority::Background);
        assert_eq!(p[3], PiecePriority::Skip);
    }

    #[test]
    fn test_window_is_clamped_to_last_piece() {
        let engine = FakeEngine::new(16, &[("t/a", 16 * 5)]);
        let mut w = PieceWindow::new(PieceWindowConfig::default());
        w.jump(&engine, 3, 16 * 100);
        assert_eq!(w.cursor(), 3);
        assert_eq!(engine.priority(4), PiecePriority::Urgent);
        assert_eq!(engine.priority(2), PiecePriority::Skip);
    }

    #[test]
    fn test_advance_moves_cursor_forward_only() {
        let engine = FakeEngine::new(16, &[("t/a", 16 * 40)]);
        let mut w = PieceWindow::new(PieceWindowConfig::default());
        w.jump(&engine, 5, 0);
        assert_eq!(w.cursor(), 5);

        // A piece behind the cursor completing doesn't move it back.
        engine.set_have(0);
        w.advance(&engine);
        assert_eq!(w.cursor(), 5);

        engine.set_have(5);
        engine.set_have(6);
        w.advance(&engine);
        assert_eq!(w.cursor(), 7);
        assert_eq!(engine.priority(7 + 15), PiecePriority::Urgent);
    }

    #[test]
    fn test_fully_downloaded_is_noop() {
        let engine = FakeEngine::new(16, &[("t/a", 16 * 4)]);
        let mut w = PieceWindow::new(PieceWindowConfig::default());
        w.jump(&engine, 1, 0);
        for p in 0..4 {
            engine.set_have(p);
        }
        w.advance(&engine);
        assert_eq!(w.cursor(), 1);
    }
}
