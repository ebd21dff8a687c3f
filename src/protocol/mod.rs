//! Wire types for the Auth API.
//!
//! * [`auth`] - request bodies and the response envelope of the `/auth`
//!   endpoints
//!
//! Responses are parsed through [`json`], which logs what came back so that
//! protocol mismatches can be diagnosed with trace logging enabled. Token
//! fields are redacted in those logs.

pub mod auth;

use std::fmt::Debug;

use serde::Deserialize;

use crate::error::Result;

/// Parses and logs a JSON response body.
///
/// # Logging
///
/// * Success: logs the parsed structure at TRACE level
/// * Valid JSON of the wrong shape: logs the parse error at DEBUG level
/// * Invalid JSON: logs the parse error at ERROR level
///
/// Raw bodies are never logged.
///
/// # Errors
///
/// Returns error if the body is not valid JSON or does not match `T`.
pub fn json<T>(body: &str, origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    match serde_json::from_str(body) {
        Ok(result) => {
            trace!("{origin}: {result:#?}");
            Ok(result)
        }
        Err(e) => {
            if serde_json::from_str::<serde_json::Value>(body).is_ok() {
                // Bodies of auth endpoints may hold tokens: do not dump them.
                debug!("{origin}: unexpected response structure ({e})");
            } else {
                error!("{origin}: failed parsing response ({e})");
            }
            Err(e.into())
        }
    }
}
