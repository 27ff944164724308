use crate::types::PushEvent;
use crate::websocket::reason::DisconnectReason;
use log::{trace, warn};
use tokio_tungstenite::tungstenite::protocol::Message;

/// Outcome of classifying one inbound frame. Classification never fails the
/// read loop: malformed payloads are logged and dropped.
#[derive(Debug)]
pub enum Inbound {
    /// A validated push event, ready for the consumer callback.
    Event(PushEvent),
    /// The peer sent a Ping; the caller should answer with this payload.
    PongNeeded(Vec<u8>),
    /// Frame handled (or dropped), nothing to deliver.
    Handled,
    /// The peer closed the connection.
    Closed(DisconnectReason),
}

/// Turns a raw inbound frame into either a validated push event or a handled
/// control event. Pure with respect to the transport; the session owns all
/// I/O.
pub fn classify(msg: Message) -> Inbound {
    match msg {
        Message::Close(frame) => {
            let reason = DisconnectReason::from_close_frame(frame.as_ref());
            warn!("Peer closed connection: {} ({:?})", reason, frame);
            Inbound::Closed(reason)
        }
        Message::Text(text) => match serde_json::from_str::<PushEvent>(&text) {
            Ok(event) => Inbound::Event(event),
            Err(e) => {
                // Never fatal: drop the frame and keep reading.
                warn!("Dropping undecodable frame: {} (raw: {})", e, text);
                Inbound::Handled
            }
        },
        Message::Ping(payload) => {
            trace!("Received Ping ({} bytes)", payload.len());
            Inbound::PongNeeded(payload)
        }
        Message::Pong(_) => {
            trace!("Received Pong");
            Inbound::Handled
        }
        Message::Binary(bin) => {
            trace!("Ignoring binary frame ({} bytes)", bin.len());
            Inbound::Handled
        }
        Message::Frame(_) => Inbound::Handled,
    }
}
