//! Session liveness state machine.
//!
//! ```text
//!             sign in / renewed
//!   LoggedOut ─────────────────▶ Hidden ◀──────────────┐
//!       ▲                          │                   │ renewed
//!       │       idle or expiry     ▼                   │
//!       └──────────────────── Warning(seconds) ────────┘
//!         countdown elapsed,
//!         idle logout, failure
//! ```
//!
//! The machine is synchronous and clock-agnostic: every input carries the
//! current instant, and timers are plain deadlines in a [`Scheduler`]. The
//! coordinator feeds it timer firings, activity and renewal outcomes, and
//! acts on the [`LogoutReason`] it returns.
//!
//! Every transition cancels the timers owned by the previous state before
//! arming new ones, so no stale timer can act after a transition.

use std::{
    fmt,
    time::{Duration, SystemTime},
};

use tokio::time::Instant;

use crate::{
    config::Config,
    scheduler::{Scheduler, Timer},
    token::AccessToken,
};

const ONE_SECOND: Duration = Duration::from_secs(1);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Authenticated, no warning on screen.
    Hidden,
    /// The renewal warning is visible and counting down.
    Warning { seconds_remaining: u32 },
    /// Not authenticated, either never signed in or ended.
    #[default]
    LoggedOut,
}

impl Phase {
    #[must_use]
    pub fn is_warning_visible(self) -> bool {
        matches!(self, Phase::Warning { .. })
    }

    /// Seconds left on the countdown; zero while no warning is visible.
    #[must_use]
    pub fn seconds_remaining(self) -> u32 {
        match self {
            Phase::Warning { seconds_remaining } => seconds_remaining,
            _ => 0,
        }
    }

    #[must_use]
    pub fn is_authenticated(self) -> bool {
        !matches!(self, Phase::LoggedOut)
    }
}

/// Why a session was ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LogoutReason {
    /// No activity for the full idle timeout.
    IdleTimeout,
    /// The warning countdown reached zero.
    CountdownElapsed,
    /// The access token had already expired.
    TokenExpired,
    /// Renewing the access token failed.
    RenewalFailed,
    /// The user chose to log out.
    UserRequested,
}

impl fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            LogoutReason::IdleTimeout => "idle timeout",
            LogoutReason::CountdownElapsed => "countdown elapsed",
            LogoutReason::TokenExpired => "access token expired",
            LogoutReason::RenewalFailed => "session renewal failed",
            LogoutReason::UserRequested => "user logged out",
        };
        write!(f, "{reason}")
    }
}

#[derive(Clone, Debug)]
pub struct Machine {
    idle_timeout: Duration,
    warning_lead: Duration,
    countdown: u32,

    phase: Phase,
    episode: u64,
    token: Option<AccessToken>,
    warning_deadline: Option<Instant>,
    scheduler: Scheduler,
}

impl Machine {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            warning_lead: config.warning_lead,
            countdown: config.countdown_seconds(),

            phase: Phase::LoggedOut,
            episode: 0,
            token: None,
            warning_deadline: None,
            scheduler: Scheduler::new(),
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Counter of authenticated episodes, incremented on every sign-in.
    #[must_use]
    pub fn episode(&self) -> u64 {
        self.episode
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.phase.is_authenticated()
    }

    #[must_use]
    pub fn token(&self) -> Option<&AccessToken> {
        self.token.as_ref()
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next().map(|(_, deadline)| deadline)
    }

    /// Disarms and returns the next timer due at `now`.
    pub fn take_due(&mut self, now: Instant) -> Option<Timer> {
        self.scheduler.take_due(now)
    }

    /// Starts a new authenticated episode with `token`.
    #[must_use]
    pub fn sign_in(
        &mut self,
        token: AccessToken,
        now: Instant,
        wall: SystemTime,
    ) -> Option<LogoutReason> {
        self.episode += 1;
        debug!("session episode {} started", self.episode);
        self.token = Some(token);
        self.rearm(now, wall)
    }

    /// Applies an explicitly renewed token: hides the warning and recomputes
    /// every timer from scratch. Ignored once logged out.
    #[must_use]
    pub fn renewed(
        &mut self,
        token: AccessToken,
        now: Instant,
        wall: SystemTime,
    ) -> Option<LogoutReason> {
        if !self.is_authenticated() {
            return None;
        }

        self.token = Some(token);
        self.rearm(now, wall)
    }

    /// Applies a token refreshed in the background.
    ///
    /// Only the expiry timer follows the new token. A visible warning stays
    /// up: it can only be dismissed by an explicit renewal.
    #[must_use]
    pub fn token_refreshed(
        &mut self,
        token: AccessToken,
        now: Instant,
        wall: SystemTime,
    ) -> Option<LogoutReason> {
        match self.phase {
            Phase::Hidden => {
                self.token = Some(token);
                self.arm_expiry(now, wall)
            }
            Phase::Warning { .. } => {
                self.token = Some(token);
                None
            }
            Phase::LoggedOut => None,
        }
    }

    /// Pushes the idle deadline forward, unless a warning is visible.
    pub fn on_activity(&mut self, now: Instant) {
        if self.phase == Phase::Hidden {
            self.arm_idle(now);
        }
    }

    /// Handles a timer that came due.
    #[must_use]
    pub fn on_timer(&mut self, timer: Timer, now: Instant) -> Option<LogoutReason> {
        trace!("{timer} fired");
        match (timer, self.phase) {
            (Timer::IdleWarning | Timer::ExpiryWarning, Phase::Hidden) => {
                self.show_warning(now, self.countdown)
            }
            (Timer::CountdownTick, Phase::Warning { .. }) => self.tick(now),
            (Timer::CountdownLogout, Phase::Warning { .. }) => {
                self.logout(LogoutReason::CountdownElapsed)
            }
            (Timer::IdleLogout, Phase::Hidden | Phase::Warning { .. }) => {
                self.logout(LogoutReason::IdleTimeout)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn renewal_failed(&mut self) -> Option<LogoutReason> {
        self.logout(LogoutReason::RenewalFailed)
    }

    #[must_use]
    pub fn logout_now(&mut self) -> Option<LogoutReason> {
        self.logout(LogoutReason::UserRequested)
    }

    /// Ends the session. Returns the reason only the first time, so the
    /// logout sink runs once per episode.
    #[must_use]
    fn logout(&mut self, reason: LogoutReason) -> Option<LogoutReason> {
        if !self.is_authenticated() {
            return None;
        }

        self.scheduler.cancel_all();
        self.warning_deadline = None;
        self.phase = Phase::LoggedOut;
        self.token = None;

        Some(reason)
    }

    /// Resets to `Hidden` with fresh idle and expiry timers.
    fn rearm(&mut self, now: Instant, wall: SystemTime) -> Option<LogoutReason> {
        self.scheduler.cancel_all();
        self.warning_deadline = None;
        self.phase = Phase::Hidden;

        self.arm_idle(now);
        self.arm_expiry(now, wall)
    }

    fn arm_idle(&mut self, now: Instant) {
        let countdown = Duration::from_secs(self.countdown.into());
        let warning_after = self.idle_timeout.saturating_sub(countdown);

        self.arm_after(Timer::IdleWarning, now, warning_after);
        self.arm_after(Timer::IdleLogout, now, self.idle_timeout);
    }

    /// Arms `timer` to fire `delay` after `now`. A deadline beyond the range
    /// of the clock never comes, so the timer is left disarmed.
    fn arm_after(&mut self, timer: Timer, now: Instant, delay: Duration) {
        match now.checked_add(delay) {
            Some(deadline) => self.scheduler.arm(timer, deadline),
            None => {
                warn!("{timer} is too far ahead to arm ({}s)", delay.as_secs());
                self.scheduler.cancel(timer);
            }
        }
    }

    fn arm_expiry(&mut self, now: Instant, wall: SystemTime) -> Option<LogoutReason> {
        self.scheduler.cancel(Timer::ExpiryWarning);

        let expires_at = self.token.as_ref().and_then(AccessToken::expires_at)?;
        let time_to_expiry = match expires_at.duration_since(wall) {
            Ok(remaining) if !remaining.is_zero() => remaining,
            _ => {
                warn!("access token has already expired");
                return self.logout(LogoutReason::TokenExpired);
            }
        };

        if time_to_expiry <= self.warning_lead {
            let whole_seconds = u32::try_from(time_to_expiry.as_secs()).unwrap_or(u32::MAX);
            let seconds = self.countdown.min(whole_seconds);
            if seconds == 0 {
                warn!("access token expires in under a second");
                return self.logout(LogoutReason::TokenExpired);
            }

            debug!("access token expires in {}s", time_to_expiry.as_secs());
            return self.show_warning(now, seconds);
        }

        let warning_after = time_to_expiry - self.warning_lead;
        debug!("expiry warning in {}s", warning_after.as_secs());
        self.arm_after(Timer::ExpiryWarning, now, warning_after);
        None
    }

    fn show_warning(&mut self, now: Instant, seconds: u32) -> Option<LogoutReason> {
        // Only one warning at a time; the idle logout stays armed as backup.
        self.scheduler.cancel(Timer::IdleWarning);
        self.scheduler.cancel(Timer::ExpiryWarning);

        let deadline = now + Duration::from_secs(seconds.into());
        self.warning_deadline = Some(deadline);
        self.phase = Phase::Warning {
            seconds_remaining: seconds,
        };
        info!("session ends in {seconds}s unless renewed");

        self.scheduler.arm(Timer::CountdownTick, now + ONE_SECOND);
        self.scheduler.arm(Timer::CountdownLogout, deadline);
        None
    }

    /// Recomputes the countdown from its deadline, so a tick that fires late
    /// shows the true remaining time instead of drifting.
    fn tick(&mut self, now: Instant) -> Option<LogoutReason> {
        let deadline = self.warning_deadline?;

        let seconds = ceil_seconds(deadline.saturating_duration_since(now));
        if seconds == 0 {
            return self.logout(LogoutReason::CountdownElapsed);
        }

        self.phase = Phase::Warning {
            seconds_remaining: seconds,
        };

        // Next tick on the following whole-second boundary of the countdown.
        let next = deadline - Duration::from_secs((seconds - 1).into());
        self.scheduler.arm(Timer::CountdownTick, next);
        None
    }
}

fn ceil_seconds(duration: Duration) -> u32 {
    let mut seconds = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        seconds += 1;
    }
    u32::try_from(seconds).unwrap_or(u32::MAX)
}
