//! Control-plane HTTP client for the push service.
//!
//! Subscriptions are managed over plain HTTP against the same host the
//! websocket stream runs on. [`Client`] covers the full surface: fetching the
//! service configuration, listing, registering, updating and deleting
//! subscriptions. Authentication material is passed per call as a
//! [`Credential`](crate::auth::Credential) so the same client serves both
//! the shared-secret and the minted-token variants.

pub mod client;

pub use client::Client;
