//! Session liveness for token-authenticated API clients.
//!
//! The [`coordinator`] keeps a signed-in session alive while the user is
//! active and ends it when they are not. It warns ahead of idle timeout and
//! access token expiry, lets the user renew with a single refresh call even
//! when requests race for one, and tells the host exactly once when the
//! session is over.
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod activity;
pub mod auth;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod events;
pub mod fetch;
pub mod http;
pub mod machine;
pub mod protocol;
pub mod refresh;
pub mod scheduler;
pub mod token;
