//! A Rust client for the push event stream service.
//!
//! The crate is built around [`websocket::Session`], a resilient session that
//! keeps one logical subscription alive across reconnects, plus a
//! [`rest::Client`] for the control-plane subscription API and
//! [`auth::Credential`] covering both authentication variants (static shared
//! secret and minted access token).

pub mod auth;
pub mod error;
pub mod rest;
pub mod types;
pub mod websocket;

pub use error::{PushError, Result};
