/// Why the entry list changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    InitialLoad,
    LiveAppend,
    HistoricPrepend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollAnchor {
    JumpToEnd,
    /// Follow the tail only if the user was already there. The render surface
    /// owns that check.
    AutoScrollIfAtBottom,
    /// The first `inserted` rows are new and sit above the current top.
    PrependPreservingOffset { inserted: usize },
}

/// Consumed once by the render surface, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollInstruction {
    pub anchor: ScrollAnchor,
    /// Row identities changed; previously measured row sizes are stale.
    pub reset_measurements: bool,
}

impl ScrollInstruction {
    fn jump_to_end() -> Self {
        Self {
            anchor: ScrollAnchor::JumpToEnd,
            reset_measurements: true,
        }
    }
}

pub fn compute_anchor(
    previous: usize,
    new: usize,
    cause: TransitionCause,
    initial_phase: bool,
) -> Option<ScrollInstruction> {
    if initial_phase || cause == TransitionCause::InitialLoad {
        return Some(ScrollInstruction::jump_to_end());
    }
    match cause {
        TransitionCause::InitialLoad => Some(ScrollInstruction::jump_to_end()),
        TransitionCause::LiveAppend => Some(ScrollInstruction {
            anchor: ScrollAnchor::AutoScrollIfAtBottom,
            reset_measurements: false,
        }),
        TransitionCause::HistoricPrepend if new > previous => Some(ScrollInstruction {
            anchor: ScrollAnchor::PrependPreservingOffset {
                inserted: new - previous,
            },
            reset_measurements: false,
        }),
        TransitionCause::HistoricPrepend => None,
    }
}

/// Tracks the entry count between transitions and whether the first paint
/// has happened yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollViewModel {
    previous_count: usize,
    initial_phase: bool,
}

impl Default for ScrollViewModel {
    fn default() -> Self {
        Self {
            previous_count: 0,
            initial_phase: true,
        }
    }
}

impl ScrollViewModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous_count(&self) -> usize {
        self.previous_count
    }

    pub fn in_initial_phase(&self) -> bool {
        self.initial_phase
    }

    pub fn transition(&mut self, new_count: usize, cause: TransitionCause) -> Option<ScrollInstruction> {
        let instruction = compute_anchor(self.previous_count, new_count, cause, self.initial_phase);
        self.previous_count = new_count;
        if cause == TransitionCause::InitialLoad {
            self.initial_phase = false;
        }
        instruction
    }

    /// Back to an empty list awaiting its initial load.
    pub fn reset(&mut self) -> ScrollInstruction {
        *self = Self::default();
        ScrollInstruction::jump_to_end()
    }
}
