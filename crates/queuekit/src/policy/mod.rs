pub mod dead_letter;
pub mod stalled;

pub use dead_letter::{pending_entries, DeadLetterEntry, DeadLetterPolicy};
pub use stalled::{StalledJobReaper, STALLED_REASON};
