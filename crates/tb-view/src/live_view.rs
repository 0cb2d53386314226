use std::sync::Arc;

use tb_core::history::{HistorySource, Keyed};
use tb_core::Snapshot;

use crate::history::{HistoryPager, LoadOutcome, TopTrigger};
use crate::scroll::{ScrollInstruction, ScrollViewModel, TransitionCause};

/// A live entry list with on-demand history, emitting one scroll instruction
/// per transition.
///
/// The first paint happens on the first live snapshot, or, when
/// `wait_for_history` is set, once both the live snapshot and the first
/// history page have arrived.
pub struct LiveView<E> {
    pager: HistoryPager<E>,
    scroll: ScrollViewModel,
    trigger: TopTrigger,
    wait_for_history: bool,
    live_ready: bool,
    history_ready: bool,
}

impl<E> LiveView<E> {
    pub fn new(wait_for_history: bool) -> Self {
        Self::with_trigger(wait_for_history, TopTrigger::default())
    }

    pub fn with_trigger(wait_for_history: bool, trigger: TopTrigger) -> Self {
        Self {
            pager: HistoryPager::new(),
            scroll: ScrollViewModel::new(),
            trigger,
            wait_for_history,
            live_ready: false,
            history_ready: false,
        }
    }

    pub fn pager(&self) -> &HistoryPager<E> {
        &self.pager
    }

    pub fn pager_mut(&mut self) -> &mut HistoryPager<E> {
        &mut self.pager
    }

    pub fn entries(&mut self) -> Arc<Vec<Keyed<E>>> {
        self.pager.merged()
    }

    pub fn is_painted(&self) -> bool {
        !self.scroll.in_initial_phase()
    }

    fn first_paint_due(&self) -> bool {
        self.scroll.in_initial_phase()
            && self.live_ready
            && (!self.wait_for_history || self.history_ready)
    }

    pub fn on_snapshot(&mut self, snapshot: Snapshot<E>) -> Option<ScrollInstruction> {
        self.pager.set_live(snapshot);
        self.live_ready = true;
        let cause = if self.first_paint_due() {
            TransitionCause::InitialLoad
        } else {
            TransitionCause::LiveAppend
        };
        let count = self.pager.merged().len();
        self.scroll.transition(count, cause)
    }

    pub fn on_page(&mut self, outcome: &LoadOutcome) -> Option<ScrollInstruction> {
        match outcome {
            LoadOutcome::Skipped | LoadOutcome::Stale => return None,
            LoadOutcome::Loaded { .. } | LoadOutcome::Failed(_) => self.history_ready = true,
        }
        let cause = if self.first_paint_due() {
            TransitionCause::InitialLoad
        } else if self.scroll.in_initial_phase() {
            return None;
        } else {
            TransitionCause::HistoricPrepend
        };
        let count = self.pager.merged().len();
        self.scroll.transition(count, cause)
    }

    /// Fetches the next older page and classifies the result.
    pub async fn load_more(&mut self, source: &dyn HistorySource<E>) -> Option<ScrollInstruction> {
        let outcome = self.pager.load_more(source).await;
        self.on_page(&outcome)
    }

    /// Reports the first visible row; true when the view should load older
    /// entries now.
    pub fn should_load_history(&mut self, first_visible_row: usize) -> bool {
        let can_load = self.pager.can_load();
        self.trigger.observe(first_visible_row, can_load)
    }

    /// Switches to a different stream: history and live state are dropped and
    /// the view waits for a fresh initial load.
    pub fn reset(&mut self) -> ScrollInstruction {
        self.pager.reset();
        self.live_ready = false;
        self.history_ready = false;
        self.trigger = TopTrigger::new(self.trigger.threshold_rows());
        self.scroll.reset()
    }
}
