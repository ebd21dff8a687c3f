//! Events emitted by the session coordinator.
//!
//! Hosts that want to react to session changes (update a status line, play
//! a sound) pass an unbounded channel sender to the coordinator and
//! receive these events in order.
//!
//! # Example
//!
//! ```rust
//! use sessionguard::events::Event;
//!
//! fn handle_event(event: Event) {
//!     match event {
//!         Event::WarningShown { seconds_remaining } => {
//!             println!("session ends in {seconds_remaining}s");
//!         }
//!         Event::LoggedOut(reason) => println!("logged out: {reason}"),
//!         _ => {}
//!     }
//! }
//! ```

use std::fmt;

use crate::machine::LogoutReason;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// A new authenticated episode started, either from stored credentials
    /// or from a fresh sign-in.
    SignedIn,

    /// The renewal warning became visible.
    WarningShown { seconds_remaining: u32 },

    /// The user renewed the session and the warning was dismissed.
    Renewed,

    /// The session ended. Emitted once per episode.
    LoggedOut(LogoutReason),
}

impl Event {
    /// Short machine-readable name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Event::SignedIn => "signed_in",
            Event::WarningShown { .. } => "warning_shown",
            Event::Renewed => "renewed",
            Event::LoggedOut(_) => "logged_out",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::WarningShown { seconds_remaining } => {
                write!(f, "{} ({seconds_remaining}s)", self.name())
            }
            Event::LoggedOut(reason) => write!(f, "{} ({reason})", self.name()),
            _ => write!(f, "{}", self.name()),
        }
    }
}
