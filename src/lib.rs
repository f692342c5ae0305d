//! Headless voice-assistant protocol client.
//!
//! Decodes the service's multipart directive responses, sequences playback
//! through a single-writer command queue, and keeps a long-held
//! down-channel open for server-pushed directives, with all calls gated on
//! an OAuth token pair.
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

#[macro_use]
extern crate log;

pub mod auth;
pub mod channel;
pub mod client;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod protocol;
pub mod tokens;
pub mod uuid;
