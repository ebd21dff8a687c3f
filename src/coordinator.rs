//! The session coordinator.
//!
//! A single task owns the [`Machine`] and its timers. Hosts drive it through
//! a cloneable [`Handle`]: commands travel over a channel, and the current
//! [`Status`] is published on a watch channel. Because every state change
//! happens on that one task, timer firings, activity and user commands are
//! totally ordered.
//!
//! Network calls never run on the coordinator task. A renewal awaits the
//! shared refresher in the caller's task and only reports the outcome.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sessionguard::{
//!     auth::AuthClient,
//!     config::Config,
//!     coordinator::{ClearCredentials, Coordinator},
//!     credentials::{CredentialStore, MemoryStore},
//!     machine::LogoutReason,
//!     refresh::Refresher,
//! };
//!
//! # async fn example() -> sessionguard::error::Result<()> {
//! let config = Config::default();
//! let store: Arc<dyn CredentialStore> = Arc::new(MemoryStore::new());
//! let api = Arc::new(AuthClient::new(&config)?);
//! let refresher = Arc::new(Refresher::new(api, Arc::clone(&store)));
//!
//! let sink = ClearCredentials::new(store, |reason: LogoutReason| {
//!     println!("logged out: {reason}");
//! });
//! let handle = Coordinator::builder(&config, refresher, sink).spawn();
//!
//! if handle.status().is_warning_visible() {
//!     handle.renew().await?;
//! }
//! # Ok(())
//! # }
//! ```

use std::{ops::ControlFlow, sync::Arc, time::SystemTime};

use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};

use crate::{
    activity::{Activity, ActivityBus, Subscription},
    config::Config,
    credentials::{CredentialStore, ACCESS_TOKEN},
    error::{Error, Result},
    events::Event,
    machine::{LogoutReason, Machine, Phase},
    refresh::Renew,
    scheduler::Timer,
    token::AccessToken,
};

/// Receives forced logouts. Called at most once per authenticated episode,
/// after the timers are cancelled and the warning is hidden.
///
/// Closures taking a [`LogoutReason`] implement this trait.
pub trait LogoutSink: Send + Sync + 'static {
    fn logout(&self, reason: LogoutReason);
}

impl<F> LogoutSink for F
where
    F: Fn(LogoutReason) + Send + Sync + 'static,
{
    fn logout(&self, reason: LogoutReason) {
        self(reason);
    }
}

/// Logout sink that removes the stored tokens before passing the logout on.
pub struct ClearCredentials<S> {
    store: Arc<dyn CredentialStore>,
    then: S,
}

impl<S: LogoutSink> ClearCredentials<S> {
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>, then: S) -> Self {
        Self { store, then }
    }
}

impl<S: LogoutSink> LogoutSink for ClearCredentials<S> {
    fn logout(&self, reason: LogoutReason) {
        if let Err(e) = self.store.clear() {
            error!("failed clearing credentials: {e}");
        }
        self.then.logout(reason);
    }
}

/// Snapshot of the session as published by the coordinator.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Status {
    pub phase: Phase,
    /// Increments on every sign-in.
    pub episode: u64,
}

impl Status {
    #[must_use]
    pub fn is_warning_visible(&self) -> bool {
        self.phase.is_warning_visible()
    }

    #[must_use]
    pub fn seconds_remaining(&self) -> u32 {
        self.phase.seconds_remaining()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.phase.is_authenticated()
    }
}

#[derive(Debug)]
enum Command {
    SignedIn {
        token: AccessToken,
        reply: oneshot::Sender<()>,
    },
    Renewed {
        episode: u64,
        token: Option<AccessToken>,
        reply: oneshot::Sender<Result<()>>,
    },
    Refreshed {
        episode: u64,
        token: Option<AccessToken>,
    },
    LogoutNow {
        reply: oneshot::Sender<()>,
    },
    ArmedTimers {
        reply: oneshot::Sender<Vec<(Timer, Instant)>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Configures and spawns a coordinator.
pub struct Builder {
    machine: Machine,
    refresher: Arc<dyn Renew>,
    sink: Arc<dyn LogoutSink>,
    bus: ActivityBus,
    events: Option<mpsc::UnboundedSender<Event>>,
}

impl Builder {
    /// Listens on `bus` instead of a private activity bus.
    #[must_use]
    pub fn activity_bus(mut self, bus: ActivityBus) -> Self {
        self.bus = bus;
        self
    }

    /// Sends session events to `events`.
    #[must_use]
    pub fn events(mut self, events: mpsc::UnboundedSender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    /// Spawns the coordinator task.
    ///
    /// The session is resumed from the stored access token, if any, before
    /// this returns, so the first status seen through the handle already
    /// reflects it. The task runs until [`Handle::shutdown`] or until every
    /// handle is dropped.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    #[must_use]
    pub fn spawn(self) -> Handle {
        let (command_tx, command_rx) = mpsc::channel(Coordinator::COMMAND_QUEUE);
        let (status_tx, status_rx) = watch::channel(Status::default());

        let mut coordinator = Coordinator {
            machine: self.machine,
            commands: command_rx,
            status: status_tx,
            bus: self.bus.clone(),
            listener: None,
            store: Arc::clone(self.refresher.store()),
            sink: self.sink,
            events: self.events,
        };
        coordinator.resume();
        tokio::spawn(coordinator.run());

        Handle {
            commands: command_tx,
            status: status_rx,
            bus: self.bus,
            refresher: self.refresher,
        }
    }
}

pub struct Coordinator {
    machine: Machine,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<Status>,
    bus: ActivityBus,
    listener: Option<Subscription>,
    store: Arc<dyn CredentialStore>,
    sink: Arc<dyn LogoutSink>,
    events: Option<mpsc::UnboundedSender<Event>>,
}

impl Coordinator {
    const COMMAND_QUEUE: usize = 32;

    #[must_use]
    pub fn builder(
        config: &Config,
        refresher: Arc<dyn Renew>,
        sink: impl LogoutSink,
    ) -> Builder {
        Builder {
            machine: Machine::new(config),
            refresher,
            sink: Arc::new(sink),
            bus: ActivityBus::new(),
            events: None,
        }
    }

    async fn run(mut self) {
        loop {
            let deadline = self.machine.next_deadline();

            // Due timers first: they describe what happened before any
            // input that is waiting now. Activity comes before commands so
            // that a command observes all activity reported ahead of it.
            let flow = tokio::select! {
                biased;

                () = sleep_until(deadline) => {
                    self.fire_timers();
                    ControlFlow::Continue(())
                }

                Some(activity) = next_activity(self.listener.as_mut()) => {
                    trace!("user activity: {activity}");
                    self.machine.on_activity(Instant::now());
                    ControlFlow::Continue(())
                }

                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => ControlFlow::Break(()),
                },
            };

            if flow.is_break() {
                break;
            }
            self.sync();
        }

        debug!("session coordinator stopped");
    }

    fn resume(&mut self) {
        match self.store.get(ACCESS_TOKEN) {
            Some(token) => {
                info!("resuming session from stored credentials");
                self.start_episode(AccessToken::parse(token));
            }
            None => debug!("no stored credentials, waiting for sign-in"),
        }
        self.sync();
    }

    fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::SignedIn { token, reply } => {
                info!("signed in");
                self.start_episode(token);
                self.sync();
                let _ = reply.send(());
            }

            Command::Renewed {
                episode,
                token,
                reply,
            } => {
                let result = self.renewed(episode, token);
                self.sync();
                let _ = reply.send(result);
            }

            Command::Refreshed { episode, token } => self.refreshed(episode, token),

            Command::LogoutNow { reply } => {
                let logout = self.machine.logout_now();
                self.logged_out(logout);
                let _ = reply.send(());
            }

            Command::ArmedTimers { reply } => {
                let _ = reply.send(self.machine.scheduler().armed());
            }

            Command::Shutdown { reply } => {
                self.listener = None;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }

        ControlFlow::Continue(())
    }

    fn start_episode(&mut self, token: AccessToken) {
        let logout = self
            .machine
            .sign_in(token, Instant::now(), SystemTime::now());
        self.emit(Event::SignedIn);
        self.logged_out(logout);
    }

    fn renewed(&mut self, episode: u64, token: Option<AccessToken>) -> Result<()> {
        if self.is_stale(episode) {
            self.discard(token.is_some());
            return Err(Error::failed_precondition(
                "session ended before renewal completed",
            ));
        }

        let Some(token) = token else {
            let logout = self.machine.renewal_failed();
            self.logged_out(logout);
            return Err(Error::unauthenticated("session renewal failed"));
        };

        let logout = self
            .machine
            .renewed(token, Instant::now(), SystemTime::now());
        if logout.is_some() {
            self.logged_out(logout);
            return Err(Error::unauthenticated(
                "renewed access token has already expired",
            ));
        }

        info!("session renewed");
        self.emit(Event::Renewed);
        Ok(())
    }

    fn refreshed(&mut self, episode: u64, token: Option<AccessToken>) {
        if self.is_stale(episode) {
            self.discard(token.is_some());
            return;
        }

        let logout = match token {
            Some(token) => {
                self.machine
                    .token_refreshed(token, Instant::now(), SystemTime::now())
            }
            None => self.machine.renewal_failed(),
        };
        self.logged_out(logout);
    }

    /// Whether a renewal started in `episode` no longer applies.
    fn is_stale(&self, episode: u64) -> bool {
        !self.machine.is_authenticated() || self.machine.episode() != episode
    }

    fn discard(&self, stored_tokens: bool) {
        if self.machine.is_authenticated() {
            debug!("discarding renewal from an earlier session");
            return;
        }

        warn!("discarding renewal that completed after logout");
        // The refresher persisted tokens for a session that has ended.
        if stored_tokens {
            if let Err(e) = self.store.clear() {
                error!("failed clearing credentials: {e}");
            }
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(timer) = self.machine.take_due(now) {
            let logout = self.machine.on_timer(timer, now);
            self.logged_out(logout);
        }
    }

    /// Publishes the logout and hands it to the sink.
    fn logged_out(&mut self, logout: Option<LogoutReason>) {
        let Some(reason) = logout else {
            return;
        };

        info!("logged out: {reason}");
        self.sync();
        self.sink.logout(reason);
        self.emit(Event::LoggedOut(reason));
    }

    /// Publishes the current status and attaches or detaches the activity
    /// listener to match it.
    fn sync(&mut self) {
        let status = Status {
            phase: self.machine.phase(),
            episode: self.machine.episode(),
        };

        let previous = *self.status.borrow();
        if status.is_warning_visible() && !previous.is_warning_visible() {
            self.emit(Event::WarningShown {
                seconds_remaining: status.seconds_remaining(),
            });
        }

        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });

        match (status.is_authenticated(), self.listener.is_some()) {
            (true, false) => {
                trace!("attaching activity listener");
                self.listener = Some(self.bus.subscribe());
            }
            (false, true) => {
                trace!("detaching activity listener");
                self.listener = None;
            }
            _ => {}
        }
    }

    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                trace!("no event receiver for {event}");
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_activity(listener: Option<&mut Subscription>) -> Option<Activity> {
    match listener {
        Some(listener) => listener.recv().await,
        None => std::future::pending().await,
    }
}

/// Cloneable handle to a running coordinator.
#[derive(Clone)]
pub struct Handle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<Status>,
    bus: ActivityBus,
    refresher: Arc<dyn Renew>,
}

impl Handle {
    #[must_use]
    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    #[must_use]
    pub fn is_warning_visible(&self) -> bool {
        self.status().is_warning_visible()
    }

    #[must_use]
    pub fn seconds_remaining(&self) -> u32 {
        self.status().seconds_remaining()
    }

    /// A receiver that is notified on every status change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    /// Reports user activity. Ignored unless the session is authenticated
    /// and no warning is visible.
    pub fn activity(&self, activity: Activity) {
        self.bus.emit(activity);
    }

    #[must_use]
    pub fn activity_bus(&self) -> &ActivityBus {
        &self.bus
    }

    /// Starts a new authenticated episode. The caller stores the tokens
    /// first.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the coordinator has shut down.
    pub async fn signed_in(&self, token: AccessToken) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SignedIn { token, reply })
            .await?;
        Ok(rx.await?)
    }

    /// Explicit "stay logged in": renews the access token and, on success,
    /// hides the warning and restarts every timer.
    ///
    /// # Errors
    ///
    /// Will return `Err` if:
    /// - no session is active (`FailedPrecondition`), without a network call
    /// - the renewal failed (`Unauthenticated`); the session has then been
    ///   logged out
    /// - the session ended while the renewal was in flight
    ///   (`FailedPrecondition`)
    pub async fn renew(&self) -> Result<()> {
        let status = self.status();
        if !status.is_authenticated() {
            return Err(Error::failed_precondition("no session to renew"));
        }

        let token = self.refresher.renew().await;

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Renewed {
                episode: status.episode,
                token,
                reply,
            })
            .await?;
        rx.await?
    }

    /// Background renewal, as done after a request was rejected with 401.
    ///
    /// The outcome is reported to the coordinator, which moves the expiry
    /// warning for a fresh token or logs out on failure. A visible warning
    /// stays up either way.
    pub async fn refresh(&self) -> Option<AccessToken> {
        let status = self.status();
        if !status.is_authenticated() {
            return None;
        }

        let token = self.refresher.renew().await;

        let command = Command::Refreshed {
            episode: status.episode,
            token: token.clone(),
        };
        if self.commands.send(command).await.is_err() {
            debug!("coordinator stopped before background refresh completed");
        }

        token
    }

    /// Ends the session at the user's request. Does nothing when already
    /// logged out.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the coordinator has shut down.
    pub async fn logout_now(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::LogoutNow { reply }).await?;
        Ok(rx.await?)
    }

    /// Currently armed timers, earliest first.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the coordinator has shut down.
    pub async fn armed_timers(&self) -> Result<Vec<(Timer, Instant)>> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::ArmedTimers { reply }).await?;
        Ok(rx.await?)
    }

    /// Stops the coordinator. Pending timers are dropped without firing and
    /// the activity listener is detached. Safe to call more than once.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    #[must_use]
    pub fn refresher(&self) -> &Arc<dyn Renew> {
        &self.refresher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        credentials::{MemoryStore, REFRESH_TOKEN},
        error::ErrorKind,
        refresh::{tests::FakeAuthenticator, Refresher},
        token::tests::{token_expiring_at, token_with_payload},
    };
    use std::{sync::Mutex, time::Duration};

    struct Harness {
        handle: Handle,
        api: Arc<FakeAuthenticator>,
        store: Arc<dyn CredentialStore>,
        bus: ActivityBus,
        logouts: Arc<Mutex<Vec<LogoutReason>>>,
        events: mpsc::UnboundedReceiver<Event>,
    }

    impl Harness {
        fn new(store: MemoryStore, delay: Duration) -> Self {
            let api = Arc::new(FakeAuthenticator::new(delay));
            let store: Arc<dyn CredentialStore> = Arc::new(store);
            let refresher = Arc::new(Refresher::new(Arc::clone(&api), Arc::clone(&store)));

            let logouts = Arc::new(Mutex::new(Vec::new()));
            let sink = {
                let logouts = Arc::clone(&logouts);
                move |reason: LogoutReason| logouts.lock().unwrap().push(reason)
            };

            let bus = ActivityBus::new();
            let (events_tx, events) = mpsc::unbounded_channel();
            let handle = Coordinator::builder(&Config::default(), refresher, sink)
                .activity_bus(bus.clone())
                .events(events_tx)
                .spawn();

            Self {
                handle,
                api,
                store,
                bus,
                logouts,
                events,
            }
        }

        /// Round-trips a command so that the coordinator has processed
        /// everything before it.
        async fn settle(&self) {
            self.handle.armed_timers().await.unwrap();
        }

        async fn advance(&self, seconds: u64) {
            tokio::time::advance(Duration::from_secs(seconds)).await;
            self.settle().await;
        }

        fn logouts(&self) -> Vec<LogoutReason> {
            self.logouts.lock().unwrap().clone()
        }

        fn events(&mut self) -> Vec<Event> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn expiring_in(seconds: u64) -> String {
        token_expiring_at(SystemTime::now() + Duration::from_secs(seconds))
    }

    fn opaque() -> String {
        token_with_payload(r#"{"sub":"42"}"#)
    }

    fn signed_in_with(access_token: &str) -> MemoryStore {
        MemoryStore::with_tokens(access_token, Some("refresh"))
    }

    fn kinds(armed: &[(Timer, Instant)]) -> Vec<Timer> {
        armed.iter().map(|&(timer, _)| timer).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_warning_shows_lead_before_expiry() {
        let harness = Harness::new(signed_in_with(&expiring_in(90)), Duration::ZERO);

        harness.advance(28).await;
        assert_eq!(harness.handle.status().phase, Phase::Hidden);

        harness.advance(2).await;
        assert!(harness.handle.is_warning_visible());
        assert_eq!(harness.handle.seconds_remaining(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_logs_out_immediately() {
        let stale = token_expiring_at(SystemTime::now() - Duration::from_secs(5));
        let mut harness = Harness::new(signed_in_with(&stale), Duration::ZERO);
        harness.settle().await;

        assert_eq!(harness.logouts(), vec![LogoutReason::TokenExpired]);
        assert_eq!(
            harness.events(),
            vec![
                Event::SignedIn,
                Event::LoggedOut(LogoutReason::TokenExpired)
            ]
        );
        assert!(!harness.handle.status().is_authenticated());
        assert_eq!(harness.bus.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_postpones_idle_warning() {
        let start = Instant::now();
        let harness = Harness::new(signed_in_with(&opaque()), Duration::ZERO);

        harness.advance(200).await;
        harness.handle.activity(Activity::KeyPress);
        harness.settle().await;

        let armed = harness.handle.armed_timers().await.unwrap();
        assert_eq!(
            armed,
            vec![
                (Timer::IdleWarning, start + Duration::from_secs(470)),
                (Timer::IdleLogout, start + Duration::from_secs(500)),
            ]
        );

        harness.advance(260).await;
        assert!(!harness.handle.is_warning_visible());
        harness.advance(10).await;
        assert!(harness.handle.is_warning_visible());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_during_warning_changes_nothing() {
        let harness = Harness::new(signed_in_with(&opaque()), Duration::ZERO);

        harness.advance(270).await;
        assert_eq!(harness.handle.seconds_remaining(), 30);
        let before = harness.handle.armed_timers().await.unwrap();

        for activity in Activity::ALL {
            harness.handle.activity(activity);
        }
        harness.settle().await;

        assert_eq!(harness.handle.seconds_remaining(), 30);
        assert_eq!(harness.handle.armed_timers().await.unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_ends_session_once() {
        let mut harness = Harness::new(signed_in_with(&opaque()), Duration::ZERO);

        harness.advance(270).await;
        for _ in 0..10 {
            harness.advance(1).await;
        }
        assert_eq!(harness.handle.seconds_remaining(), 20);

        harness.advance(20).await;
        assert_eq!(harness.logouts(), vec![LogoutReason::CountdownElapsed]);
        assert!(harness.handle.armed_timers().await.unwrap().is_empty());

        harness.advance(600).await;
        harness.handle.logout_now().await.unwrap();
        assert_eq!(harness.logouts().len(), 1);
        assert_eq!(
            harness.events(),
            vec![
                Event::SignedIn,
                Event::WarningShown {
                    seconds_remaining: 30
                },
                Event::LoggedOut(LogoutReason::CountdownElapsed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_resets_every_timer() {
        let harness = Harness::new(signed_in_with(&expiring_in(3600)), Duration::ZERO);
        harness.advance(270).await;
        assert!(harness.handle.is_warning_visible());

        harness.api.reply(&expiring_in(7200), None);
        let renewed_at = Instant::now();
        harness.handle.renew().await.unwrap();

        assert_eq!(harness.handle.status().phase, Phase::Hidden);
        let armed = harness.handle.armed_timers().await.unwrap();
        assert_eq!(
            kinds(&armed),
            vec![Timer::IdleWarning, Timer::IdleLogout, Timer::ExpiryWarning]
        );
        assert_eq!(armed[0].1, renewed_at + Duration::from_secs(270));
        assert_eq!(armed[1].1, renewed_at + Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_between_idle_warning_and_idle_logout() {
        let start = Instant::now();
        let harness = Harness::new(signed_in_with(&opaque()), Duration::ZERO);
        harness.advance(270).await;
        harness.advance(10).await;
        assert_eq!(harness.handle.seconds_remaining(), 20);

        harness.api.reply(&opaque(), None);
        harness.handle.renew().await.unwrap();

        let armed = harness.handle.armed_timers().await.unwrap();
        assert_eq!(
            armed,
            vec![
                (Timer::IdleWarning, start + Duration::from_secs(550)),
                (Timer::IdleLogout, start + Duration::from_secs(580)),
            ]
        );

        // Past the idle logout of the first warning.
        harness.advance(30).await;
        assert!(harness.logouts().is_empty());
        assert_eq!(harness.handle.status().phase, Phase::Hidden);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_renewals_make_one_call() {
        let harness = Harness::new(signed_in_with(&opaque()), Duration::from_secs(1));
        harness.api.reply(&opaque(), None);

        let (first, second) = tokio::join!(harness.handle.renew(), harness.handle.renew());

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(harness.api.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_renewal_logs_out_once() {
        let harness = Harness::new(signed_in_with(&opaque()), Duration::ZERO);
        harness.api.fail();

        let err = harness.handle.renew().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthenticated);
        assert_eq!(harness.logouts(), vec![LogoutReason::RenewalFailed]);

        let err = harness.handle.renew().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::FailedPrecondition);
        assert_eq!(harness.api.calls(), 1);
        assert_eq!(harness.logouts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn renew_without_session_skips_network() {
        let harness = Harness::new(MemoryStore::new(), Duration::ZERO);
        harness.settle().await;

        let err = harness.handle.renew().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::FailedPrecondition);
        assert_eq!(harness.api.calls(), 0);
        assert!(harness.logouts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_completing_after_logout_is_discarded() {
        let harness = Harness::new(signed_in_with(&opaque()), Duration::from_secs(5));
        harness.api.reply(&opaque(), Some("rotated"));

        let renewing = tokio::spawn({
            let handle = harness.handle.clone();
            async move { handle.renew().await }
        });
        while harness.api.calls() == 0 {
            tokio::task::yield_now().await;
        }

        harness.handle.logout_now().await.unwrap();
        let err = renewing.await.unwrap().unwrap_err();

        assert_eq!(err.kind, ErrorKind::FailedPrecondition);
        assert_eq!(harness.logouts(), vec![LogoutReason::UserRequested]);
        assert_eq!(harness.store.get(ACCESS_TOKEN), None);
        assert_eq!(harness.store.get(REFRESH_TOKEN), None);
        assert!(!harness.handle.status().is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_from_previous_sign_in_keeps_new_tokens() {
        let harness = Harness::new(signed_in_with(&opaque()), Duration::from_secs(5));
        harness.api.reply(&opaque(), Some("rotated"));

        let renewing = tokio::spawn({
            let handle = harness.handle.clone();
            async move { handle.renew().await }
        });
        while harness.api.calls() == 0 {
            tokio::task::yield_now().await;
        }

        harness.handle.logout_now().await.unwrap();
        let access_token = expiring_in(3600);
        harness.store.set(ACCESS_TOKEN, &access_token).unwrap();
        harness.store.set(REFRESH_TOKEN, "second").unwrap();
        harness
            .handle
            .signed_in(AccessToken::parse(access_token.clone()))
            .await
            .unwrap();

        let err = renewing.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::FailedPrecondition);
        assert_eq!(harness.store.get(ACCESS_TOKEN), Some(access_token));
        assert_eq!(harness.store.get(REFRESH_TOKEN).as_deref(), Some("second"));

        harness.settle().await;
        assert_eq!(harness.handle.status().phase, Phase::Hidden);
        assert_eq!(harness.handle.status().episode, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn renew_right_after_spawn_uses_stored_session() {
        let harness = Harness::new(signed_in_with(&opaque()), Duration::ZERO);
        assert!(harness.handle.status().is_authenticated());

        harness.api.reply(&opaque(), None);
        harness.handle.renew().await.unwrap();

        assert_eq!(harness.api.calls(), 1);
        assert!(harness.logouts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn late_idle_warning_falls_back_to_idle_logout() {
        let mut harness = Harness::new(signed_in_with(&opaque()), Duration::ZERO);

        // Skip past the idle warning deadline, so that the warning appears
        // late and its countdown would outlast the idle timeout.
        harness.advance(280).await;
        assert_eq!(harness.handle.seconds_remaining(), 30);

        harness.advance(20).await;
        assert_eq!(harness.logouts(), vec![LogoutReason::IdleTimeout]);
        assert!(!harness.handle.status().is_authenticated());
        assert!(harness.handle.armed_timers().await.unwrap().is_empty());

        harness.advance(60).await;
        assert_eq!(harness.logouts(), vec![LogoutReason::IdleTimeout]);
        assert_eq!(
            harness.events(),
            vec![
                Event::SignedIn,
                Event::WarningShown {
                    seconds_remaining: 30
                },
                Event::LoggedOut(LogoutReason::IdleTimeout),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_fires_after_shutdown() {
        let harness = Harness::new(signed_in_with(&expiring_in(90)), Duration::ZERO);
        harness.settle().await;
        assert_eq!(harness.bus.listener_count(), 1);

        harness.handle.shutdown().await;
        assert_eq!(harness.bus.listener_count(), 0);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(harness.logouts().is_empty());
        assert_eq!(harness.api.calls(), 0);
        assert!(harness.handle.armed_timers().await.is_err());

        // A second shutdown is harmless.
        harness.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn listeners_follow_sign_in_cycles() {
        let harness = Harness::new(MemoryStore::new(), Duration::ZERO);
        harness.settle().await;
        assert_eq!(harness.bus.listener_count(), 0);

        for episode in 1..=3 {
            harness
                .handle
                .signed_in(AccessToken::parse(opaque()))
                .await
                .unwrap();
            harness.settle().await;
            assert_eq!(harness.bus.listener_count(), 1);
            assert_eq!(harness.handle.status().episode, episode);

            harness.handle.logout_now().await.unwrap();
            harness.settle().await;
            assert_eq!(harness.bus.listener_count(), 0);
        }

        assert_eq!(harness.logouts(), vec![LogoutReason::UserRequested; 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn status_changes_are_published() {
        let harness = Harness::new(signed_in_with(&opaque()), Duration::ZERO);
        let mut status = harness.handle.subscribe();
        harness.settle().await;
        let _ = status.borrow_and_update();

        harness.advance(270).await;
        assert!(status.has_changed().unwrap());
        assert!(status.borrow_and_update().is_warning_visible());
    }

    #[test]
    fn clearing_sink_removes_tokens() {
        let store: Arc<dyn CredentialStore> =
            Arc::new(MemoryStore::with_tokens("access", Some("refresh")));
        let seen = Arc::new(Mutex::new(None));
        let sink = ClearCredentials::new(Arc::clone(&store), {
            let seen = Arc::clone(&seen);
            move |reason: LogoutReason| *seen.lock().unwrap() = Some(reason)
        });

        sink.logout(LogoutReason::IdleTimeout);

        assert_eq!(store.get(ACCESS_TOKEN), None);
        assert_eq!(store.get(REFRESH_TOKEN), None);
        assert_eq!(*seen.lock().unwrap(), Some(LogoutReason::IdleTimeout));
    }
}
