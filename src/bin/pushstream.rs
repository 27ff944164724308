use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info};
use pushstream_connector_rs::auth::Credential;
use pushstream_connector_rs::rest;
use pushstream_connector_rs::types::{Subscription, SubscriptionIdentity};
use pushstream_connector_rs::websocket::{Session, SessionConfig};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use url::Url;
use uuid::Uuid;

/// Stream push events from the command line.
///
/// Registers a subscription from the given channel filters, connects the
/// resilient session, and pretty-prints every event until interrupted. A
/// subscription created by this run is deleted again on shutdown.
#[derive(Parser, Debug)]
#[command(name = "pushstream", version)]
struct Args {
    /// Websocket endpoint of the push service
    #[arg(long, default_value = "wss://push.example.com/v0")]
    addr: Url,

    /// Static shared secret
    #[arg(long)]
    secret: Option<String>,

    /// Client id for minting an access token
    #[arg(long, requires = "client_secret")]
    client_id: Option<String>,

    /// Client secret for minting an access token
    #[arg(long, requires = "client_id")]
    client_secret: Option<String>,

    /// Use an already-minted access token instead of client id + secret
    #[arg(long, conflicts_with_all = ["secret", "client_id", "client_secret"])]
    access_token: Option<String>,

    /// Base URL of the token-minting API
    #[arg(long, default_value = "https://api.example.com/v2")]
    token_url: Url,

    /// Reconnect token from a previous run, to restore subscriber state
    #[arg(long)]
    reconnect_token: Option<Uuid>,

    /// Optional name for the registered subscription
    #[arg(long)]
    subscription_name: Option<String>,

    /// Channel to subscribe to (repeatable)
    #[arg(long = "channel", default_values_t = ["match".to_string(), "series".to_string()])]
    channels: Vec<String>,
}

fn build_credential(args: &Args) -> Result<Credential> {
    if let Some(secret) = &args.secret {
        return Ok(Credential::Secret(secret.clone()));
    }
    if let Some(token) = &args.access_token {
        return Ok(Credential::from_access_token(args.token_url.clone(), token));
    }
    match (&args.client_id, &args.client_secret) {
        (Some(id), Some(secret)) => Ok(Credential::Token {
            client_id: id.clone(),
            client_secret: secret.clone(),
            token_url: args.token_url.clone(),
            access_token: None,
        }),
        _ => bail!("provide --secret, --access-token, or --client-id and --client-secret"),
    }
}

fn print_tagged(tag: &str, value: &Value) {
    let pretty = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    println!("[{}]\n{}\n", tag, pretty);
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut credential = build_credential(&args)?;
    let rest = rest::Client::from_ws_endpoint(&args.addr, None)?;
    credential
        .ensure_token(rest.http())
        .await
        .context("access token request failed")?;

    let config_json = rest
        .fetch_config(&credential)
        .await
        .context("config request failed")?;
    print_tagged("PUSH CONFIG", &config_json);

    let existing = rest
        .list_subscriptions(&credential)
        .await
        .context("subscriptions list request failed")?;
    print_tagged("EXISTING SUBSCRIPTIONS", &existing);

    let mut spec = Subscription::from_channels(args.channels.clone());
    if let Some(name) = &args.subscription_name {
        spec = spec.with_name(name.clone());
    }
    let (subscription_id, already_exists) = rest
        .register_subscription(&credential, &spec)
        .await
        .context("subscription request failed")?;
    if already_exists {
        info!(
            "Subscription name already registered; reusing id {}",
            subscription_id
        );
    } else {
        info!("Registered subscription {}", subscription_id);
    }

    let mut config = SessionConfig::new(args.addr.clone(), SubscriptionIdentity::Id(subscription_id));
    config.reconnect_token = args.reconnect_token;
    // Only delete on exit what this run created.
    config.owns_subscription = !already_exists;

    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
    let done_tx = Mutex::new(Some(done_tx));

    let session = Session::start(
        config,
        credential,
        Arc::new(|event| {
            let pretty = serde_json::to_string_pretty(&event.payload)
                .unwrap_or_else(|_| event.payload.to_string());
            println!("[MSG] channel={} uuid={}\n{}\n", event.channel, event.uuid, pretty);
        }),
        Arc::new(move |reason| {
            error!("Session terminated: {}", reason);
            if let Ok(mut guard) = done_tx.lock() {
                if let Some(tx) = guard.take() {
                    let _ = tx.send(());
                }
            }
        }),
    )?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
        _ = done_rx => {}
    }
    session.stop().await;

    Ok(())
}
