//! View-side state for live board streams: merged history, scroll anchoring,
//! countdowns and board filters. Nothing here touches the network directly;
//! snapshots and history pages are fed in by the caller.

pub mod countdown;
pub mod debounce;
pub mod filters;
pub mod history;
pub mod live_view;
pub mod scroll;

pub use countdown::{compute_countdown, ApprovalCountdown, Countdown, CountdownTimer};
pub use filters::{Selection, TaskFilters};
pub use history::{HistoryPager, LoadOutcome, PageRequest, TopTrigger};
pub use live_view::LiveView;
pub use scroll::{compute_anchor, ScrollAnchor, ScrollInstruction, ScrollViewModel, TransitionCause};
