use crate::auth::{get_timestamp_ms, Credential};
use crate::error::{PushError, Result};
use crate::rest;
use crate::types::{HandshakeFrame, PushEvent, SubscriptionIdentity};
use crate::websocket::backoff::Policy;
use crate::websocket::pipeline::{self, Inbound};
use crate::websocket::reason::{self, DisconnectReason};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;
use uuid::Uuid;

pub const KEEPALIVE_INTERVAL_SECS: u64 = 30;
pub const KEEPALIVE_SEND_TIMEOUT_SECS: u64 = 3;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Callback invoked once per validated push event, in arrival order, never
/// concurrently.
pub type EventHandler = Arc<dyn Fn(PushEvent) + Send + Sync>;
/// Callback invoked exactly once if the session reaches `Terminated`.
pub type TerminationHandler = Arc<dyn Fn(DisconnectReason) + Send + Sync>;

/// Lifecycle of a [`Session`]. `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    AwaitingHandshake,
    Active,
    Reconnecting,
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting",
            SessionState::AwaitingHandshake => "AwaitingHandshake",
            SessionState::Active => "Active",
            SessionState::Reconnecting => "Reconnecting",
            SessionState::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}

/// What to do with the stored reconnect token when a handshake carries a nil
/// token. The protocol does not pin this down, so it is explicit here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyTokenPolicy {
    /// Take the handshake at face value: a nil token clears the stored one.
    #[default]
    Replace,
    /// Treat a nil token as "no change" and keep the previous one.
    Retain,
}

/// Configuration for a [`Session`]. `new` fills in the production defaults;
/// the delay and keepalive knobs exist so tests can run fast.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The websocket endpoint, e.g. `wss://push.example.com/v0`.
    pub endpoint: Url,
    /// Which subscription to attach to; sent on every (re)connect attempt.
    pub subscription: SubscriptionIdentity,
    /// Token from a previous session, to restore subscriber state on connect.
    pub reconnect_token: Option<Uuid>,
    /// When true, `stop` deletes the subscription as part of shutdown.
    pub owns_subscription: bool,
    pub empty_token_policy: EmptyTokenPolicy,
    pub backoff: Policy,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
}

impl SessionConfig {
    pub fn new(endpoint: Url, subscription: SubscriptionIdentity) -> Self {
        Self {
            endpoint,
            subscription,
            reconnect_token: None,
            owns_subscription: false,
            empty_token_policy: EmptyTokenPolicy::default(),
            backoff: Policy::default(),
            keepalive_interval: Duration::from_secs(KEEPALIVE_INTERVAL_SECS),
            keepalive_timeout: Duration::from_secs(KEEPALIVE_SEND_TIMEOUT_SECS),
        }
    }
}

/// State shared between the session handle, the manager task and the
/// keepalive task. The write half of the current connection lives in a slot
/// owned here: the keepalive loop references the slot, never a raw handle, so
/// a reconnect's handle swap is observed by everyone without a race window.
struct Shared {
    writer: Mutex<Option<WsSink>>,
    state_tx: watch::Sender<SessionState>,
    credential: Mutex<Credential>,
    reconnect_token: Mutex<Option<Uuid>>,
    last_failure: Mutex<Option<DisconnectReason>>,
    last_handshake: Mutex<Option<HandshakeFrame>>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            info!("Session state: {} -> {}", prev, state);
        }
    }
}

/// A long-lived logical subscription to the push stream.
///
/// The session keeps one websocket connection alive across network failures,
/// token expiry and server-initiated disconnects, carrying the server-issued
/// reconnect token forward so no events are lost or duplicated. At most one
/// transport handle is owned at any instant; it is replaced, never reused, on
/// reconnect.
///
/// # Examples
///
/// ```no_run
/// use pushstream_connector_rs::auth::Credential;
/// use pushstream_connector_rs::types::SubscriptionIdentity;
/// use pushstream_connector_rs::websocket::{Session, SessionConfig};
/// use std::sync::Arc;
/// use url::Url;
///
/// #[tokio::main]
/// async fn main() {
///     let endpoint = Url::parse("wss://push.example.com/v0").unwrap();
///     let config = SessionConfig::new(
///         endpoint,
///         SubscriptionIdentity::Name("sample_subscription".to_string()),
///     );
///     let session = Session::start(
///         config,
///         Credential::Secret("your_secret".to_string()),
///         Arc::new(|event| println!("event on {}: {}", event.channel, event.payload)),
///         Arc::new(|reason| eprintln!("session terminated: {}", reason)),
///     )
///     .expect("Failed to start session");
///
///     tokio::signal::ctrl_c().await.expect("Failed to listen for ctrl+c");
///     session.stop().await;
/// }
/// ```
pub struct Session {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<SessionState>,
    manager: JoinHandle<()>,
    keepalive: JoinHandle<()>,
    rest: rest::Client,
    subscription: SubscriptionIdentity,
    owns_subscription: bool,
}

impl Session {
    /// Begins connecting asynchronously and returns immediately. Connection
    /// progress is observable through [`Session::state_updates`].
    pub fn start(
        config: SessionConfig,
        credential: Credential,
        on_event: EventHandler,
        on_terminated: TerminationHandler,
    ) -> Result<Self> {
        let rest = rest::Client::from_ws_endpoint(&config.endpoint, None)?;
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let shared = Arc::new(Shared {
            writer: Mutex::new(None),
            state_tx,
            credential: Mutex::new(credential),
            reconnect_token: Mutex::new(config.reconnect_token),
            last_failure: Mutex::new(None),
            last_handshake: Mutex::new(None),
        });

        let subscription = config.subscription.clone();
        let owns_subscription = config.owns_subscription;
        let keepalive_interval = config.keepalive_interval;
        let keepalive_timeout = config.keepalive_timeout;

        let manager = tokio::spawn(run_session(
            config,
            Arc::clone(&shared),
            rest.http().clone(),
            on_event,
            on_terminated,
        ));
        let keepalive = tokio::spawn(run_keepalive(
            Arc::clone(&shared),
            keepalive_interval,
            keepalive_timeout,
            state_rx.clone(),
        ));

        Ok(Self {
            shared,
            state_rx,
            manager,
            keepalive,
            rest,
            subscription,
            owns_subscription,
        })
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// A watch receiver that observes every state transition.
    pub fn state_updates(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// The reconnect token that would be used on the next attempt.
    pub async fn reconnect_token(&self) -> Option<Uuid> {
        *self.shared.reconnect_token.lock().await
    }

    /// The most recent classified failure, cleared on successful handshake.
    pub async fn last_failure(&self) -> Option<DisconnectReason> {
        *self.shared.last_failure.lock().await
    }

    /// The handshake of the current (or most recent) connection.
    pub async fn last_handshake(&self) -> Option<HandshakeFrame> {
        self.shared.last_handshake.lock().await.clone()
    }

    /// Shuts the session down: best-effort deletion of the subscription when
    /// this session created it, best-effort Close frame, then both tasks are
    /// stopped. Failures on this path are logged, never retried.
    pub async fn stop(self) {
        info!("Stopping session...");
        if self.owns_subscription {
            let credential = self.shared.credential.lock().await.clone();
            if let Err(e) = self
                .rest
                .delete_subscription(&credential, &self.subscription.to_string())
                .await
            {
                warn!("Failed to delete subscription on shutdown: {}", e);
            }
        }
        {
            let mut writer = self.shared.writer.lock().await;
            if let Some(sink) = writer.as_mut() {
                if let Err(e) = sink.send(Message::Close(None)).await {
                    warn!("Failed to send Close frame on shutdown: {}", e);
                }
            }
        }
        self.manager.abort();
        self.keepalive.abort();
        info!("Session stopped.");
    }
}

enum NextStep {
    Retry,
    Fatal(DisconnectReason),
}

enum ReadOutcome {
    Closed(DisconnectReason),
    Unrecoverable,
}

/// The manager task: drives one connection through setup, handshake and
/// active receipt, and loops back through the retry policy on recoverable
/// disconnects. Runs until the session terminates.
async fn run_session(
    config: SessionConfig,
    shared: Arc<Shared>,
    http: reqwest::Client,
    on_event: EventHandler,
    on_terminated: TerminationHandler,
) {
    // Whether the credential was already refreshed since the last successful
    // handshake; a second authorization failure in that window is fatal.
    let mut refreshed = false;

    let fatal = 'connect: loop {
        shared.set_state(SessionState::Connecting);
        *shared.writer.lock().await = None;

        let stream = match connect_once(&config, &shared, &http).await {
            Ok(stream) => stream,
            Err(err) => {
                let cause = classify_setup_error(&err);
                error!("Connection attempt failed: {} ({})", cause, err);
                match next_step(cause, &config, &shared, &http, &mut refreshed, false).await {
                    NextStep::Retry => continue 'connect,
                    NextStep::Fatal(reason) => break 'connect reason,
                }
            }
        };

        shared.set_state(SessionState::AwaitingHandshake);
        let (sink, mut source) = stream.split();
        *shared.writer.lock().await = Some(sink);

        // The first frame is always the handshake; it never goes through the
        // event pipeline.
        let handshake = match await_handshake(&mut source, &shared).await {
            Ok(handshake) => handshake,
            Err(HandshakeFailure::Closed(cause)) => {
                *shared.writer.lock().await = None;
                match next_step(cause, &config, &shared, &http, &mut refreshed, false).await {
                    NextStep::Retry => continue 'connect,
                    NextStep::Fatal(reason) => break 'connect reason,
                }
            }
            Err(HandshakeFailure::Invalid(err)) => {
                error!("Handshake failed: {}", err);
                break 'connect DisconnectReason::TransportLevelError;
            }
        };

        {
            let mut token = shared.reconnect_token.lock().await;
            if handshake.reconnect_token.is_nil() {
                match config.empty_token_policy {
                    EmptyTokenPolicy::Replace => *token = None,
                    EmptyTokenPolicy::Retain => {
                        debug!("Handshake carried a nil reconnect token; keeping previous")
                    }
                }
            } else {
                *token = Some(handshake.reconnect_token);
            }
        }
        info!(
            "Handshake complete: subscriber {} (reconnected: {})",
            handshake.subscriber_id, handshake.reconnected
        );
        *shared.last_handshake.lock().await = Some(handshake);
        *shared.last_failure.lock().await = None;
        refreshed = false;
        shared.set_state(SessionState::Active);

        let outcome = read_loop(&mut source, &shared, Arc::clone(&on_event)).await;

        // The old handle is already dead; abandon it before anything new is
        // installed so there is never a window with two live handles.
        *shared.writer.lock().await = None;

        match outcome {
            ReadOutcome::Closed(cause) => {
                match next_step(cause, &config, &shared, &http, &mut refreshed, true).await {
                    NextStep::Retry => continue 'connect,
                    NextStep::Fatal(reason) => break 'connect reason,
                }
            }
            ReadOutcome::Unrecoverable => break 'connect DisconnectReason::TransportLevelError,
        }
    };

    *shared.writer.lock().await = None;
    *shared.last_failure.lock().await = Some(fatal);
    shared.set_state(SessionState::Terminated);
    error!("Session terminated: {}", fatal);
    on_terminated(fatal);
}

/// One connection attempt: build the upgrade URL from the endpoint, the
/// subscription identity and the reconnect token (when present), attach the
/// credential, and perform the upgrade.
async fn connect_once(
    config: &SessionConfig,
    shared: &Shared,
    http: &reqwest::Client,
) -> Result<WsStream> {
    let mut url = config.endpoint.clone();
    url.query_pairs_mut()
        .append_pair("subscription_id", &config.subscription.to_string());
    if let Some(token) = *shared.reconnect_token.lock().await {
        url.query_pairs_mut()
            .append_pair("reconnect_token", &token.to_string());
    }

    let header = {
        let mut credential = shared.credential.lock().await;
        credential.ensure_token(http).await?;
        credential.apply_ws(&mut url)
    };

    let mut request = url.as_str().into_client_request()?;
    if let Some((name, value)) = header {
        let value = HeaderValue::from_str(&value)
            .map_err(|e| PushError::WebsocketError(format!("invalid credential header: {}", e)))?;
        request.headers_mut().insert(name, value);
    }

    info!("Connecting to {}", config.endpoint);
    let (stream, response) = connect_async(request).await?;
    debug!("Websocket upgrade complete ({})", response.status());
    Ok(stream)
}

fn classify_setup_error(err: &PushError) -> DisconnectReason {
    match err {
        PushError::TungsteniteError(e) => DisconnectReason::from_ws_error(e),
        PushError::AuthenticationError(_) | PushError::UnexpectedStatus { .. } => {
            DisconnectReason::MissingOrInvalidCredential
        }
        _ => DisconnectReason::TransportLevelError,
    }
}

enum HandshakeFailure {
    /// Peer closed (or the socket died) before the handshake arrived.
    Closed(DisconnectReason),
    /// The first payload frame was not a valid init message.
    Invalid(PushError),
}

/// Blocks for exactly one handshake frame. Pings and other control frames may
/// interleave and are handled transparently; the first Text frame must be the
/// init message.
async fn await_handshake(
    source: &mut WsSource,
    shared: &Shared,
) -> std::result::Result<HandshakeFrame, HandshakeFailure> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                return HandshakeFrame::parse(&text).map_err(HandshakeFailure::Invalid);
            }
            Some(Ok(Message::Ping(payload))) => {
                let mut writer = shared.writer.lock().await;
                if let Some(sink) = writer.as_mut() {
                    if let Err(e) = sink.send(Message::Pong(payload)).await {
                        warn!("Failed to answer Ping during handshake: {}", e);
                    }
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let cause = DisconnectReason::from_close_frame(frame.as_ref());
                warn!("Peer closed before handshake: {}", cause);
                return Err(HandshakeFailure::Closed(cause));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("Read failed while awaiting handshake: {}", e);
                return Err(HandshakeFailure::Closed(DisconnectReason::from_ws_error(&e)));
            }
            None => {
                return Err(HandshakeFailure::Invalid(PushError::HandshakeError(
                    "connection ended before the init message".to_string(),
                )));
            }
        }
    }
}

/// The blocking read loop: sole authority for detecting transport failure.
/// Runs until the connection stops being usable.
async fn read_loop(source: &mut WsSource, shared: &Shared, on_event: EventHandler) -> ReadOutcome {
    loop {
        match source.next().await {
            Some(Ok(msg)) => match pipeline::classify(msg) {
                Inbound::Event(event) => {
                    let latency_ms = get_timestamp_ms() - event.created_timestamp;
                    trace!(
                        "Event on '{}' delivered in {} ms",
                        event.channel,
                        latency_ms
                    );
                    on_event(event);
                }
                Inbound::PongNeeded(payload) => {
                    let mut writer = shared.writer.lock().await;
                    if let Some(sink) = writer.as_mut() {
                        if let Err(e) = sink.send(Message::Pong(payload)).await {
                            warn!("Failed to send Pong: {}", e);
                        }
                    }
                }
                Inbound::Handled => {}
                Inbound::Closed(reason) => return ReadOutcome::Closed(reason),
            },
            Some(Err(e)) => {
                return if reason::is_connection_closed_error(&e) {
                    warn!("Connection closed under us: {}", e);
                    ReadOutcome::Closed(DisconnectReason::TransportLevelError)
                } else {
                    error!("Unrecoverable read error: {}", e);
                    ReadOutcome::Unrecoverable
                };
            }
            None => {
                warn!("Websocket stream ended");
                return ReadOutcome::Closed(DisconnectReason::TransportLevelError);
            }
        }
    }
}

/// Applies the retry policy to a disconnect: record it, refresh the
/// credential or drop the reconnect token when asked to, wait out the delay,
/// and report whether the session should try again.
async fn next_step(
    cause: DisconnectReason,
    config: &SessionConfig,
    shared: &Shared,
    http: &reqwest::Client,
    refreshed: &mut bool,
    from_active: bool,
) -> NextStep {
    *shared.last_failure.lock().await = Some(cause);

    let kind = shared.credential.lock().await.kind();
    let decision = config.backoff.evaluate(cause, kind);

    if decision.fatal {
        return NextStep::Fatal(cause);
    }
    if decision.refresh_credential && *refreshed {
        error!("Still unauthorized after a credential refresh; giving up");
        return NextStep::Fatal(cause);
    }

    if from_active {
        shared.set_state(SessionState::Reconnecting);
    }

    if decision.refresh_credential {
        let mut credential = shared.credential.lock().await;
        if let Err(e) = credential.refresh(http).await {
            error!("Credential refresh failed: {}", e);
            return NextStep::Fatal(cause);
        }
        *refreshed = true;
    }
    if decision.drop_reconnect_token {
        info!("Dropping stale reconnect token before the next attempt");
        *shared.reconnect_token.lock().await = None;
    }
    if !decision.delay.is_zero() {
        warn!("Disconnected ({}); retrying in {:?}", cause, decision.delay);
        sleep(decision.delay).await;
    }
    NextStep::Retry
}

/// The keepalive loop: proves liveness of the current transport handle on a
/// fixed period. A failed or timed-out ping is logged and nothing more;
/// disconnect detection belongs to the read loop alone. The loop exits once
/// the session terminates.
async fn run_keepalive(
    shared: Arc<Shared>,
    interval: Duration,
    send_timeout: Duration,
    mut state_rx: watch::Receiver<SessionState>,
) {
    loop {
        tokio::select! {
            _ = sleep(interval) => {
                let mut writer = shared.writer.lock().await;
                if let Some(sink) = writer.as_mut() {
                    match timeout(send_timeout, sink.send(Message::Ping(Vec::new()))).await {
                        Ok(Ok(())) => trace!("Keepalive ping sent"),
                        Ok(Err(e)) => warn!("Keepalive ping failed: {}", e),
                        Err(_) => warn!("Keepalive ping timed out after {:?}", send_timeout),
                    }
                }
            }
            changed = state_rx.changed() => {
                let terminated = changed.is_err()
                    || *state_rx.borrow() == SessionState::Terminated;
                if terminated {
                    break;
                }
            }
        }
    }
    debug!("Keepalive loop stopped");
}
