//! User activity signals.
//!
//! Hosts report user interaction to an [`ActivityBus`]. The coordinator
//! subscribes while the session is authenticated and drops its
//! [`Subscription`] when it is not, so listeners never outlive a sign-in.

use std::{fmt, str::FromStr};

use tokio::sync::broadcast::{self, error::RecvError};

use crate::error::Error;

/// Kinds of interaction that count as the user being active.
///
/// Passive events such as focus changes or rendering are deliberately not
/// part of the set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Activity {
    PointerDown,
    PointerMove,
    KeyPress,
    Scroll,
    TouchStart,
    Click,
}

impl Activity {
    pub const ALL: [Activity; 6] = [
        Activity::PointerDown,
        Activity::PointerMove,
        Activity::KeyPress,
        Activity::Scroll,
        Activity::TouchStart,
        Activity::Click,
    ];

    /// The DOM event name this activity is usually reported as.
    #[must_use]
    pub fn event_name(self) -> &'static str {
        match self {
            Activity::PointerDown => "mousedown",
            Activity::PointerMove => "mousemove",
            Activity::KeyPress => "keypress",
            Activity::Scroll => "scroll",
            Activity::TouchStart => "touchstart",
            Activity::Click => "click",
        }
    }
}

impl FromStr for Activity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mousedown" | "pointerdown" => Ok(Activity::PointerDown),
            "mousemove" | "pointermove" => Ok(Activity::PointerMove),
            "keypress" | "keydown" => Ok(Activity::KeyPress),
            "scroll" | "wheel" => Ok(Activity::Scroll),
            "touchstart" => Ok(Activity::TouchStart),
            "click" => Ok(Activity::Click),
            other => Err(Error::invalid_argument(format!(
                "{other} is not an activity event"
            ))),
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.event_name())
    }
}

/// Fan-out point for activity signals.
///
/// Emitting without subscribers is a no-op. Cloning the bus yields another
/// handle to the same channel.
#[derive(Clone, Debug)]
pub struct ActivityBus {
    tx: broadcast::Sender<Activity>,
}

impl ActivityBus {
    /// Lagging listeners lose signals, but one signal says as much as many.
    const CAPACITY: usize = 64;

    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(Self::CAPACITY);
        Self { tx }
    }

    /// Reports user activity to all current subscribers.
    pub fn emit(&self, activity: Activity) {
        // An error only means nobody is listening.
        let _ = self.tx.send(activity);
    }

    /// Attaches a listener. It is detached when the subscription is dropped.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of attached listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ActivityBus {
    fn default() -> Self {
        Self::new()
    }
}

/// An attached activity listener.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<Activity>,
}

impl Subscription {
    /// Waits for the next activity. Returns `None` once the bus is gone.
    ///
    /// When the listener fell behind, the missed signals are collapsed into
    /// a single pointer move: one signal says as much as many.
    pub async fn recv(&mut self) -> Option<Activity> {
        match self.rx.recv().await {
            Ok(activity) => Some(activity),
            Err(RecvError::Lagged(missed)) => {
                trace!("collapsed {missed} activity signals");
                Some(Activity::PointerMove)
            }
            Err(RecvError::Closed) => None,
        }
    }
}
