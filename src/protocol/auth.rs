//! Request and response bodies of the `/auth` endpoints.
//!
//! # Example response
//!
//! ```json
//! {
//!     "success": true,
//!     "data": {
//!         "accessToken": "eyJhbGciOi...",
//!         "refreshToken": "b1c0..."
//!     }
//! }
//! ```
//!
//! The refresh token is only present when the server rotates it.

use serde::{Deserialize, Serialize};
use veil::Redact;

/// Body of `POST /auth/refresh`.
#[derive(Clone, Serialize, Redact, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[redact]
    pub refresh_token: String,
}

/// Body of `POST /auth/login`.
#[derive(Clone, Serialize, Redact, PartialEq, Eq)]
pub struct LoginRequest {
    pub email: String,
    #[redact]
    pub password: String,
}

/// Envelope around every Auth API response.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Response<T> {
    pub success: bool,

    pub data: Option<T>,

    /// Human-readable reason, usually only set on failure.
    #[serde(default)]
    pub message: Option<String>,
}

impl<T> Response<T> {
    /// The payload of a successful response.
    #[must_use]
    pub fn into_data(self) -> Option<T> {
        if self.success {
            self.data
        } else {
            None
        }
    }
}

/// Tokens issued by login and refresh.
#[derive(Clone, Deserialize, Redact, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Tokens {
    #[redact]
    pub access_token: String,

    /// Rotated refresh token, if the server issued a new one.
    #[redact]
    #[serde(default)]
    pub refresh_token: Option<String>,
}
