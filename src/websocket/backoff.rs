use crate::auth::CredentialKind;
use crate::websocket::reason::DisconnectReason;
use std::time::Duration;

pub const RATE_LIMIT_DELAY_SECS: u64 = 30;
pub const TRANSPORT_RETRY_DELAY_SECS: u64 = 5;

/// What the session should do before its next connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// How long to wait before reconnecting. Zero means retry immediately.
    pub delay: Duration,
    /// Mint a fresh access token before the next attempt.
    pub refresh_credential: bool,
    /// The server rejected the reconnect token; the next attempt must not
    /// carry it again.
    pub drop_reconnect_token: bool,
    /// No retry; the session terminates and reports the reason once.
    pub fatal: bool,
}

impl RetryDecision {
    fn retry_after(delay: Duration) -> Self {
        Self {
            delay,
            refresh_credential: false,
            drop_reconnect_token: false,
            fatal: false,
        }
    }

    fn fatal() -> Self {
        Self {
            delay: Duration::ZERO,
            refresh_credential: false,
            drop_reconnect_token: false,
            fatal: true,
        }
    }
}

/// The fixed delays used between reconnect attempts. Defaults are the
/// production values; tests shrink them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub rate_limit_delay: Duration,
    pub transport_retry_delay: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            rate_limit_delay: Duration::from_secs(RATE_LIMIT_DELAY_SECS),
            transport_retry_delay: Duration::from_secs(TRANSPORT_RETRY_DELAY_SECS),
        }
    }
}

impl Policy {
    /// Decides what to do about a disconnect. Pure lookup, no internal state:
    /// `(reason, credential kind) -> decision`.
    ///
    /// Authorization failures are only worth retrying when the credential can
    /// actually be refreshed; the session additionally enforces that a refresh
    /// happens at most once between successful handshakes.
    pub fn evaluate(&self, reason: DisconnectReason, credential: CredentialKind) -> RetryDecision {
        match reason {
            DisconnectReason::RateLimited => RetryDecision::retry_after(self.rate_limit_delay),
            DisconnectReason::TransportLevelError
            | DisconnectReason::ServerInternalError
            | DisconnectReason::Unrecognized(_) => {
                RetryDecision::retry_after(self.transport_retry_delay)
            }
            DisconnectReason::NotAuthorized | DisconnectReason::MissingOrInvalidCredential => {
                match credential {
                    CredentialKind::Token => RetryDecision {
                        delay: Duration::ZERO,
                        refresh_credential: true,
                        drop_reconnect_token: false,
                        fatal: false,
                    },
                    CredentialKind::Secret => RetryDecision::fatal(),
                }
            }
            DisconnectReason::InvalidReconnectToken => RetryDecision {
                delay: Duration::ZERO,
                refresh_credential: false,
                drop_reconnect_token: true,
                fatal: false,
            },
            DisconnectReason::UnknownSubscription
            | DisconnectReason::MissingSubscription
            | DisconnectReason::SubscriberLimitExceeded => RetryDecision::fatal(),
        }
    }
}
