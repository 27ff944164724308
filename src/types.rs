use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// --- Subscription wire shapes ---

/// A subscription registered with the push service: a named or identified set
/// of filters describing which events the server will deliver.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Subscription {
    /// Read-only, assigned by the server; never set by the client on create.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub filters: Vec<SubscriptionFilter>,
}

impl Subscription {
    /// Builds an unnamed subscription from a list of channel filters.
    pub fn from_channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            filters: channels
                .into_iter()
                .map(|c| SubscriptionFilter {
                    channel: Some(c.into()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SubscriptionFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_id: Option<i64>,
}

/// Identity a session (re)connects with: either the server-issued id or the
/// user-chosen subscription name. Immutable for the session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionIdentity {
    Id(Uuid),
    Name(String),
}

impl std::fmt::Display for SubscriptionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionIdentity::Id(id) => write!(f, "{}", id),
            SubscriptionIdentity::Name(name) => write!(f, "{}", name),
        }
    }
}

// --- Inbound frames ---

/// The push-event envelope delivered on every non-system frame.
#[derive(Deserialize, Debug, Clone)]
pub struct PushEvent {
    pub channel: String,
    pub uuid: Uuid,
    pub created_timestamp: i64,
    pub payload: Value,
}

/// The mandatory first frame after a successful upgrade: the `init` message on
/// the `system` channel. Decoded with a stricter schema than [`PushEvent`] and
/// never routed through the event pipeline.
#[derive(Deserialize, Debug, Clone)]
pub struct HandshakeFrame {
    pub channel: String,
    pub uuid: Uuid,
    pub cmd: String,
    pub subscriber_id: Uuid,
    pub reconnect_token: Uuid,
    pub subscription: Subscription,
    pub reconnected: bool,
}

impl HandshakeFrame {
    /// Parses and validates the handshake frame. Anything other than a
    /// `system`/`init` message is rejected.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let frame: HandshakeFrame = serde_json::from_str(raw).map_err(|e| {
            crate::error::PushError::HandshakeError(format!(
                "failed to decode init message: {} (raw: {})",
                e, raw
            ))
        })?;
        if frame.channel != "system" || frame.cmd != "init" {
            return Err(crate::error::PushError::HandshakeError(format!(
                "expected system/init as first frame, got {}/{}",
                frame.channel, frame.cmd
            )));
        }
        Ok(frame)
    }
}

// --- Control-plane responses ---

#[derive(Deserialize, Debug, Clone)]
pub struct AccessTokenResponse {
    pub access_token: String,
    pub expires_in: u64,
    pub token_type: String,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct SubscriptionIdResponse {
    pub id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_serializes_without_empty_fields() {
        let sub = Subscription::from_channels(["match", "series"]);
        let json = serde_json::to_value(&sub).unwrap();
        assert!(json.get("id").is_none());
        assert!(json.get("name").is_none());
        assert_eq!(json["filters"][0]["channel"], "match");
        assert!(json["filters"][0].get("game_id").is_none());
    }

    #[test]
    fn handshake_parse_accepts_init() {
        let raw = format!(
            r#"{{"channel":"system","uuid":"{}","cmd":"init",
                "subscriber_id":"{}","reconnect_token":"{}",
                "subscription":{{"filters":[]}},"reconnected":true}}"#,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        let frame = HandshakeFrame::parse(&raw).unwrap();
        assert!(frame.reconnected);
    }

    #[test]
    fn handshake_parse_rejects_push_event() {
        let raw = format!(
            r#"{{"channel":"match","uuid":"{}","cmd":"init",
                "subscriber_id":"{}","reconnect_token":"{}",
                "subscription":{{"filters":[]}},"reconnected":false}}"#,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        assert!(HandshakeFrame::parse(&raw).is_err());
    }

    #[test]
    fn handshake_parse_rejects_garbage() {
        assert!(HandshakeFrame::parse("not json").is_err());
        assert!(HandshakeFrame::parse("[1,2,3]").is_err());
    }
}
