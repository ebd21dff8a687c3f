use std::{error::Error, process, sync::Arc, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};

use sessionguard::{
    activity::Activity,
    auth::AuthClient,
    config::Config,
    coordinator::{ClearCredentials, Coordinator, Handle, Status},
    credentials::{save_tokens, CredentialStore, FileStore},
    events::Event,
    machine::LogoutReason,
    refresh::Refresher,
    token::AccessToken,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    ///
    /// TOML file with `api_url`, `idle_timeout`, `warning_lead` and
    /// `countdown`. Durations are in seconds.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    config_file: Option<String>,

    /// Credentials file
    ///
    /// Ensure that this file is kept secure and not shared publicly, as it
    /// contains tokens that grant access to your account.
    #[arg(short = 's', long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("credentials.toml"))]
    credentials_file: String,

    /// Base URL of the REST API
    #[arg(long, value_name = "URL", value_hint = ValueHint::Url)]
    api_url: Option<String>,

    /// Seconds of inactivity before the session ends
    #[arg(long, value_name = "SECONDS")]
    idle_timeout: Option<u64>,

    /// Seconds before token expiry to show the renewal warning
    #[arg(long, value_name = "SECONDS")]
    warning_lead: Option<u64>,

    /// Seconds of countdown before the session ends
    #[arg(long, value_name = "SECONDS")]
    countdown: Option<u64>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Builds the configuration from the optional file and the command line
/// overrides.
fn load_config(args: &Args) -> Result<Config, Box<dyn Error>> {
    let mut config = match &args.config_file {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(api_url) = &args.api_url {
        config.set_api_url(api_url.parse()?);
    }
    if let Some(seconds) = args.idle_timeout {
        config.idle_timeout = Duration::from_secs(seconds);
    }
    if let Some(seconds) = args.warning_lead {
        config.warning_lead = Duration::from_secs(seconds);
    }
    if let Some(seconds) = args.countdown {
        config.countdown = Duration::from_secs(seconds);
    }

    config.validate()?;
    Ok(config)
}

/// Handles one line typed by the user.
///
/// Network calls run on their own tasks so that the main loop keeps
/// responding to signals and timers.
fn on_input(
    line: &str,
    handle: &Handle,
    api: &Arc<AuthClient>,
    store: &Arc<dyn CredentialStore>,
) {
    let mut words = line.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some("renew"), None, None) => {
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = handle.renew().await {
                    error!("{e}");
                }
            });
        }

        (Some("logout"), None, None) => {
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = handle.logout_now().await {
                    error!("{e}");
                }
            });
        }

        (Some("status"), None, None) => info!("{}", describe(handle.status())),

        (Some("login"), Some(email), Some(password)) => {
            let (email, password) = (email.to_owned(), password.to_owned());
            let (handle, api, store) = (handle.clone(), Arc::clone(api), Arc::clone(store));
            tokio::spawn(async move {
                if let Err(e) = sign_in(&handle, &api, store.as_ref(), &email, &password).await {
                    error!("sign-in failed: {e}");
                }
            });
        }

        (Some("login"), ..) => warn!("usage: login <email> <password>"),

        _ => {
            // Any other input counts as the user being active.
            let activity = line.parse().unwrap_or(Activity::KeyPress);
            handle.activity(activity);
        }
    }
}

/// Signs in with email and password and starts a new session.
async fn sign_in(
    handle: &Handle,
    api: &AuthClient,
    store: &dyn CredentialStore,
    email: &str,
    password: &str,
) -> sessionguard::error::Result<()> {
    let tokens = api.login(email, password).await?;
    save_tokens(store, &tokens)?;
    handle
        .signed_in(AccessToken::parse(tokens.access_token))
        .await
}

fn describe(status: Status) -> String {
    if status.is_warning_visible() {
        format!(
            "session ends in {}s unless renewed",
            status.seconds_remaining()
        )
    } else if status.is_authenticated() {
        "signed in".to_owned()
    } else {
        "signed out".to_owned()
    }
}

/// Main application loop.
///
/// # Errors
///
/// This function returns an error when the configuration or credentials
/// cannot be loaded.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args)?;
    info!(
        "idle timeout {}s, warning lead {}s, countdown {}s",
        config.idle_timeout.as_secs(),
        config.warning_lead.as_secs(),
        config.countdown.as_secs()
    );

    let store: Arc<dyn CredentialStore> = Arc::new(FileStore::open(&args.credentials_file)?);
    let api = Arc::new(AuthClient::new(&config)?);
    let refresher = Arc::new(Refresher::new(Arc::clone(&api), Arc::clone(&store)));

    let sink = ClearCredentials::new(Arc::clone(&store), |reason: LogoutReason| {
        info!("credentials removed after logout: {reason}");
    });
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let handle = Coordinator::builder(&config, refresher, sink)
        .events(events_tx)
        .spawn();

    let mut status = handle.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down gracefully");
                break;
            }

            Some(event) = events.recv() => match event {
                Event::LoggedOut(LogoutReason::UserRequested) => {
                    info!("logged out; sign in with `login <email> <password>`");
                }
                Event::LoggedOut(reason) => {
                    warn!("session ended: {reason}");
                    break;
                }
                event => debug!("session event: {event}"),
            },

            Ok(()) = status.changed() => {
                let current = *status.borrow_and_update();
                let seconds = current.seconds_remaining();
                if current.is_warning_visible() && (seconds <= 10 || seconds % 10 == 0) {
                    warn!("{}; type `renew` to stay signed in", describe(current));
                }
            }

            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => on_input(line.trim(), &handle, &api, &store),
                Ok(None) => {
                    debug!("standard input closed");
                    stdin_open = false;
                }
                Err(e) => {
                    error!("failed reading standard input: {e}");
                    stdin_open = false;
                }
            },
        }
    }

    handle.shutdown().await;
    Ok(())
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
