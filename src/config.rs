//! Coordinator and client configuration.
//!
//! Defaults match a typical back-office console: five minutes of idle time,
//! a warning one minute before the access token expires, and a thirty second
//! countdown before the session is ended. All of them can be overridden from
//! a TOML file:
//!
//! ```toml
//! api_url = "https://console.example.com/api/"
//! idle_timeout = 300
//! warning_lead = 60
//! countdown = 30
//! ```

use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use url::Url;

use crate::error::{Error, Result};

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,

    pub user_agent: String,

    /// Base URL of the REST API. Always ends with a slash so that endpoint
    /// paths can be joined onto it.
    pub api_url: Url,

    /// Inactivity after which the session ends.
    pub idle_timeout: Duration,

    /// How long before token expiry the renewal warning is shown.
    pub warning_lead: Duration,

    /// Length of the visible countdown.
    pub countdown: Duration,
}

/// Settings as they appear in a configuration file. Every key is optional.
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Settings {
    api_url: Option<Url>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    idle_timeout: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    warning_lead: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    countdown: Option<Duration>,
}

impl Config {
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
    pub const DEFAULT_WARNING_LEAD: Duration = Duration::from_secs(60);
    pub const DEFAULT_COUNTDOWN: Duration = Duration::from_secs(30);

    const DEFAULT_API_URL: &'static str = "http://localhost:8080/api/";

    /// Longest accepted idle timeout.
    pub const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

    /// Configuration files are small; refuse anything larger.
    const MAX_FILE_SIZE: u64 = 16 * 1024;

    /// Loads a configuration file, using defaults for missing keys.
    ///
    /// # Errors
    ///
    /// Will return `Err` if:
    /// - the file cannot be read or is too large
    /// - the file is not valid TOML or contains unknown keys
    /// - the resulting durations are inconsistent
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Prevent out-of-memory condition: configuration should be small.
        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::out_of_range(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the text is not valid TOML, contains unknown
    /// keys, or results in inconsistent durations.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(contents)?;

        let mut config = Self::default();
        if let Some(api_url) = settings.api_url {
            config.set_api_url(api_url);
        }
        if let Some(idle_timeout) = settings.idle_timeout {
            config.idle_timeout = idle_timeout;
        }
        if let Some(warning_lead) = settings.warning_lead {
            config.warning_lead = warning_lead;
        }
        if let Some(countdown) = settings.countdown {
            config.countdown = countdown;
        }

        config.validate()?;
        Ok(config)
    }

    /// Sets the API base URL, appending a trailing slash if missing.
    pub fn set_api_url(&mut self, mut api_url: Url) {
        if !api_url.path().ends_with('/') {
            let path = format!("{}/", api_url.path());
            api_url.set_path(&path);
        }
        trace!("api url: {api_url}");
        self.api_url = api_url;
    }

    /// Checks that the durations describe a usable idle window.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the countdown is zero or not shorter than the
    /// idle timeout, or if the idle timeout exceeds a day.
    pub fn validate(&self) -> Result<()> {
        if self.countdown.is_zero() {
            return Err(Error::invalid_argument("countdown must not be zero"));
        }

        if self.idle_timeout > Self::MAX_IDLE_TIMEOUT {
            return Err(Error::invalid_argument(format!(
                "idle timeout ({}s) must not exceed {}s",
                self.idle_timeout.as_secs(),
                Self::MAX_IDLE_TIMEOUT.as_secs()
            )));
        }

        if self.countdown >= self.idle_timeout {
            return Err(Error::invalid_argument(format!(
                "countdown ({}s) must be shorter than the idle timeout ({}s)",
                self.countdown.as_secs(),
                self.idle_timeout.as_secs()
            )));
        }

        Ok(())
    }

    /// Whole seconds of the countdown, as shown to the user.
    #[must_use]
    pub fn countdown_seconds(&self) -> u32 {
        u32::try_from(self.countdown.as_secs()).unwrap_or(u32::MAX)
    }
}

impl Default for Config {
    fn default() -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name})");

        Self {
            app_name,
            app_version,
            user_agent,
            api_url: Url::parse(Self::DEFAULT_API_URL).expect("invalid default api url"),
            idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
            warning_lead: Self::DEFAULT_WARNING_LEAD,
            countdown: Self::DEFAULT_COUNTDOWN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.warning_lead, Duration::from_secs(60));
        assert_eq!(config.countdown_seconds(), 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let config = Config::from_toml(
            r#"
            api_url = "https://console.example.com/api"
            countdown = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.api_url.as_str(), "https://console.example.com/api/");
        assert_eq!(config.countdown, Duration::from_secs(10));
        assert_eq!(config.idle_timeout, Config::DEFAULT_IDLE_TIMEOUT);
    }

    #[test]
    fn rejects_countdown_longer_than_idle_timeout() {
        let err = Config::from_toml("idle_timeout = 20\ncountdown = 30").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn rejects_idle_timeout_beyond_a_day() {
        let err = Config::from_toml("idle_timeout = 9223372036854775807").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let config = Config::from_toml("idle_timeout = 86400").unwrap();
        assert_eq!(config.idle_timeout, Config::MAX_IDLE_TIMEOUT);
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = Config::from_toml("idle = 20").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessionguard.toml");
        fs::write(&path, "warning_lead = 120\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.warning_lead, Duration::from_secs(120));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
