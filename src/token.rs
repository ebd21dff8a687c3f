//! Access tokens and their expiry.
//!
//! Access tokens are compact `header.payload.signature` strings whose payload
//! is base64url-encoded JSON. Only the `exp` claim is of interest here: it is
//! read without verifying the signature, purely to schedule warnings. The
//! server remains the authority on whether a token is valid.
//!
//! Reading the expiry is best-effort and never fails. Anything that cannot be
//! decoded yields "no known expiry", which disables the expiry warning but
//! leaves idle detection alone.

use std::{
    convert::Infallible,
    fmt,
    str::FromStr,
    time::{Duration, SystemTime},
};

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use serde::Deserialize;
use serde_with::{formats::Flexible, serde_as, TimestampSeconds};
use veil::Redact;

/// Base64url decoder that accepts payloads with or without padding.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Claims we care about. Everything else in the payload is ignored.
#[serde_as]
#[derive(Debug, Deserialize)]
struct Claims {
    /// Seconds since epoch; servers emit integers, floats and sometimes
    /// numeric strings.
    #[serde_as(as = "Option<TimestampSeconds<i64, Flexible>>")]
    exp: Option<SystemTime>,
}

/// An access token together with its expiry, parsed once.
#[derive(Clone, Redact, PartialEq, Eq, Hash)]
pub struct AccessToken {
    #[redact]
    token: String,
    expires_at: Option<SystemTime>,
}

impl AccessToken {
    /// Wraps a raw token and reads its expiry claim.
    #[must_use]
    pub fn parse(token: impl Into<String>) -> Self {
        let token = token.into();
        let expires_at = expiry_of(Some(token.as_str()));
        if expires_at.is_none() {
            debug!("access token carries no readable expiry");
        }

        Self { token, expires_at }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// The instant the token expires, if it could be read.
    #[must_use]
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    /// Time left until expiry: `None` when unknown, `Duration::ZERO` once
    /// expired.
    #[must_use]
    pub fn time_to_live(&self) -> Option<Duration> {
        self.expires_at.map(|expires_at| {
            expires_at
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Whether the token is known to have expired. Tokens without a readable
    /// expiry are never considered expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| SystemTime::now() >= expires_at)
    }
}

impl FromStr for AccessToken {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)
    }
}

/// Reads the expiry claim of a raw token.
///
/// Returns `None` if the token is absent, is not made of exactly three
/// dot-separated parts, has a payload that is not base64url JSON, or has no
/// usable `exp` claim.
#[must_use]
pub fn expiry_of(token: Option<&str>) -> Option<SystemTime> {
    let token = token?;

    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };

    let bytes = PAYLOAD_ENGINE.decode(payload).ok()?;
    let claims = serde_json::from_slice::<Claims>(&bytes).ok()?;
    claims.exp
}
