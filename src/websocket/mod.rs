//! Resilient websocket session for the push event stream.
//!
//! This module keeps a single logical subscription alive across network
//! failures, token expiry and server-initiated disconnects, without losing or
//! duplicating events. The moving parts:
//!
//! - [`Session`]: the state machine owning the connection lifecycle end-to-end
//!   (`Idle → Connecting → AwaitingHandshake → Active → Reconnecting/Terminated`).
//! - [`backoff::Policy`]: the pure retry policy deciding delay, credential
//!   refresh and reconnect-token handling per disconnect cause.
//! - [`reason::DisconnectReason`]: a total classification of why a connection
//!   stopped being usable, derived from the peer's application close code
//!   (4000–4999) or the setup failure itself.
//! - [`pipeline`]: validation of inbound frames; malformed payloads are
//!   dropped and logged, never fatal.
//!
//! # Continuity
//!
//! The server's handshake (`init`) message carries a reconnect token. The
//! session stores it, overwrites it on every successful handshake, and sends
//! it on every reconnect attempt so the server can restore in-flight delivery
//! state. When the server rejects a stale token the session drops it and
//! reconnects fresh instead of repeating the rejected value.
//!
//! # Usage
//!
//! ```no_run
//! use pushstream_connector_rs::auth::Credential;
//! use pushstream_connector_rs::types::SubscriptionIdentity;
//! use pushstream_connector_rs::websocket::{Session, SessionConfig};
//! use std::sync::Arc;
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SessionConfig::new(
//!         Url::parse("wss://push.example.com/v0").unwrap(),
//!         SubscriptionIdentity::Name("sample_subscription".to_string()),
//!     );
//!
//!     let session = Session::start(
//!         config,
//!         Credential::Secret("your_secret".to_string()),
//!         Arc::new(|event| println!("{}: {}", event.channel, event.payload)),
//!         Arc::new(|reason| eprintln!("terminated: {}", reason)),
//!     )
//!     .expect("Failed to start session");
//!
//!     tokio::signal::ctrl_c().await.expect("Failed to listen for ctrl+c");
//!     session.stop().await;
//! }
//! ```
//!
//! # Failure handling
//!
//! Rate limiting waits 30 seconds, generic transport failures wait 5 seconds,
//! authorization failures against a refreshable token credential mint a fresh
//! token and retry immediately (once per connection cycle). Unknown or
//! missing subscriptions and exceeded subscriber quotas terminate the session
//! and invoke the termination callback exactly once. Keepalive pings are sent
//! every 30 seconds with a 3 second deadline; a failed ping is logged but
//! never triggers reconnection, which is the read loop's job alone.

pub mod backoff;
pub mod pipeline;
pub mod reason;
pub mod session;

pub use backoff::{Policy, RetryDecision};
pub use reason::DisconnectReason;
pub use session::{
    EmptyTokenPolicy, EventHandler, Session, SessionConfig, SessionState, TerminationHandler,
};
