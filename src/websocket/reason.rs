use std::fmt;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Error as WsError;

// Application close codes sent by the push service (4000-4999 range).
pub const CLOSE_SERVER_INTERNAL_ERROR: u16 = 4000;
pub const CLOSE_MISSING_OR_INVALID_CREDENTIAL: u16 = 4001;
pub const CLOSE_NOT_AUTHORIZED: u16 = 4002;
pub const CLOSE_RATE_LIMITED: u16 = 4003;
pub const CLOSE_MISSING_SUBSCRIPTION: u16 = 4005;
pub const CLOSE_UNKNOWN_SUBSCRIPTION: u16 = 4007;
pub const CLOSE_INVALID_RECONNECT_TOKEN: u16 = 4008;
pub const CLOSE_SUBSCRIBER_LIMIT_EXCEEDED: u16 = 4009;

/// Why a connection stopped being usable. Derived once per disconnect event
/// from the peer's close code (or from the setup failure itself) and never
/// mutated afterwards.
///
/// The mapping is total: codes the client does not know about land in
/// [`DisconnectReason::Unrecognized`] so server-side additions never break
/// classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    MissingOrInvalidCredential,
    NotAuthorized,
    RateLimited,
    UnknownSubscription,
    MissingSubscription,
    InvalidReconnectToken,
    SubscriberLimitExceeded,
    ServerInternalError,
    TransportLevelError,
    Unrecognized(u16),
}

impl DisconnectReason {
    /// Maps an application close code to a reason. Total over all codes.
    pub fn from_close_code(code: u16) -> Self {
        match code {
            CLOSE_SERVER_INTERNAL_ERROR => DisconnectReason::ServerInternalError,
            CLOSE_MISSING_OR_INVALID_CREDENTIAL => DisconnectReason::MissingOrInvalidCredential,
            CLOSE_NOT_AUTHORIZED => DisconnectReason::NotAuthorized,
            CLOSE_RATE_LIMITED => DisconnectReason::RateLimited,
            CLOSE_MISSING_SUBSCRIPTION => DisconnectReason::MissingSubscription,
            CLOSE_UNKNOWN_SUBSCRIPTION => DisconnectReason::UnknownSubscription,
            CLOSE_INVALID_RECONNECT_TOKEN => DisconnectReason::InvalidReconnectToken,
            CLOSE_SUBSCRIBER_LIMIT_EXCEEDED => DisconnectReason::SubscriberLimitExceeded,
            other => DisconnectReason::Unrecognized(other),
        }
    }

    /// Classifies a peer-initiated close frame. A missing frame carries no
    /// code and counts as a transport-level close.
    pub fn from_close_frame(frame: Option<&CloseFrame<'_>>) -> Self {
        match frame {
            Some(frame) => Self::from_close_code(u16::from(frame.code)),
            None => DisconnectReason::TransportLevelError,
        }
    }

    /// Classifies the HTTP status the server answered instead of completing
    /// the upgrade.
    pub fn from_setup_status(status: u16) -> Self {
        match status {
            401 => DisconnectReason::MissingOrInvalidCredential,
            403 => DisconnectReason::NotAuthorized,
            404 => DisconnectReason::UnknownSubscription,
            429 => DisconnectReason::RateLimited,
            500..=599 => DisconnectReason::ServerInternalError,
            _ => DisconnectReason::TransportLevelError,
        }
    }

    /// Classifies a websocket-level error, either during setup or while
    /// reading on an active connection.
    pub fn from_ws_error(err: &WsError) -> Self {
        match err {
            WsError::Http(response) => Self::from_setup_status(response.status().as_u16()),
            _ => DisconnectReason::TransportLevelError,
        }
    }

    /// Fatal reasons require caller intervention; the session terminates
    /// instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DisconnectReason::UnknownSubscription
                | DisconnectReason::MissingSubscription
                | DisconnectReason::SubscriberLimitExceeded
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::MissingOrInvalidCredential => {
                write!(f, "missing or invalid credential")
            }
            DisconnectReason::NotAuthorized => write!(f, "not authorized"),
            DisconnectReason::RateLimited => write!(f, "rate limited"),
            DisconnectReason::UnknownSubscription => write!(f, "unknown subscription"),
            DisconnectReason::MissingSubscription => write!(f, "missing subscription"),
            DisconnectReason::InvalidReconnectToken => write!(f, "invalid reconnect token"),
            DisconnectReason::SubscriberLimitExceeded => {
                write!(f, "subscriber or subscription limit exceeded")
            }
            DisconnectReason::ServerInternalError => write!(f, "server internal error"),
            DisconnectReason::TransportLevelError => write!(f, "transport-level error"),
            DisconnectReason::Unrecognized(code) => write!(f, "unrecognized close code {}", code),
        }
    }
}

/// Whether a read-loop error means the peer went away (recoverable by
/// reconnecting) as opposed to a local fault.
pub fn is_connection_closed_error(err: &WsError) -> bool {
    use tokio_tungstenite::tungstenite::error::ProtocolError;
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        WsError::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}
