//! Virtual Booth command-line participant.
//!
//! Joins a booth call as a receive-only peer, logs presence, chat and track
//! events, and hangs up on Ctrl-C.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use booth_client::{
    fetch_rtc_config, join_call, signaling_url_for, CallSession, ClientConfig, JoinOptions,
    WebRtcPeerFactory,
};
use booth_common::Role;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "booth-client")]
#[command(about = "Join a Virtual Booth call from the command line")]
struct Args {
    /// Gateway base URL
    #[arg(long, env = "BOOTH_GATEWAY_URL", default_value = "http://127.0.0.1:3000")]
    gateway: Url,

    /// Six-character access code
    #[arg(long)]
    code: String,

    /// Display name shown to other participants
    #[arg(long, default_value = "")]
    name: String,

    /// Join as the agent side
    #[arg(long)]
    agent: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    booth_common::init_tracing_with_default(&args.log_level);

    let (ice_urls, ws_url) = match fetch_rtc_config(&args.gateway).await {
        Ok(rtc) => {
            let ws_url = match rtc.ws_signaling_url.as_deref().map(Url::parse) {
                Some(Ok(url)) => url,
                _ => signaling_url_for(&args.gateway)?,
            };
            (rtc.ice_urls(), ws_url)
        }
        Err(err) => {
            warn!("using default WebRTC config: {:#}", err);
            (Vec::new(), signaling_url_for(&args.gateway)?)
        }
    };
    let config = ClientConfig::default().with_ice_urls(ice_urls);

    let connection = join_call(
        &ws_url,
        JoinOptions {
            access_code: args.code,
            display_name: args.name,
            role: if args.agent { Role::Agent } else { Role::Customer },
            customer_id: None,
            customer_name: None,
        },
    )
    .await
    .context("failed to join call")?;
    info!(
        "joined session {} as {}{}",
        connection.info.session_id,
        connection.info.participant_id,
        if connection.info.is_host { " (host)" } else { "" }
    );

    let factory = Arc::new(WebRtcPeerFactory::new(&config.ice_urls)?);
    let (session, handle) = CallSession::new(config, connection.info, factory, connection.outbound);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("hanging up");
            handle.hang_up();
        }
    });

    let summary = session.run(connection.inbound).await;
    info!(
        "call {} finished: {:?} after {}s",
        summary.session_id,
        summary.reason,
        summary.duration.as_secs()
    );

    // Let the writer task flush END before the runtime shuts down.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}
