//! Copilot Voice Token Proxy Library Crate
//!
//! This library contains the logic of the token proxy web service: the
//! configuration, the shared state, the token handler and the routing,
//! including the static hosting of the browser client. The `api` binary is a
//! thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
