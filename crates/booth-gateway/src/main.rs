use std::io::ErrorKind;
use std::net::SocketAddr;

use anyhow::Context;
use booth_gateway::{db, reaper, router, security, AppState, Args, GatewayConfig};
use clap::Parser;
use tokio::net::TcpListener;

fn check_public_bind_allowed(addr: SocketAddr) -> anyhow::Result<()> {
    if addr.ip().is_loopback() {
        return Ok(());
    }
    if security::env_bool("BOOTH_ALLOW_PUBLIC_BIND", false) {
        return Ok(());
    }
    Err(anyhow::anyhow!(
        "refusing non-loopback bind without BOOTH_ALLOW_PUBLIC_BIND=1"
    ))
}

fn ws_signaling_url_for_bound_addr(bound_addr: SocketAddr) -> String {
    let host = if bound_addr.ip().is_unspecified() {
        "127.0.0.1".to_string()
    } else {
        bound_addr.ip().to_string()
    };
    format!("ws://{}:{}/ws", host, bound_addr.port())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    booth_common::init_tracing_with_default("booth_gateway=info,tower_http=info");

    let mut config = GatewayConfig::from(&args);

    let pool = db::connect(&args.database_url, 5)
        .await
        .context("failed to open gateway database")?;
    tracing::info!("connected to gateway database");

    check_public_bind_allowed(args.bind)?;
    let listener = match TcpListener::bind(args.bind).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == ErrorKind::AddrInUse => {
            let fallback_addr = SocketAddr::new(args.bind.ip(), 0);
            tracing::warn!(
                "gateway bind {} is already in use, falling back to {}",
                args.bind,
                fallback_addr
            );
            TcpListener::bind(fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };
    let bound_addr = listener.local_addr()?;
    if config.ws_signaling_url.is_none() {
        config.ws_signaling_url = Some(ws_signaling_url_for_bound_addr(bound_addr));
    }

    let state = AppState::new(pool, config);
    reaper::spawn(state.clone());

    tracing::info!("gateway listening on {}", bound_addr);
    tracing::info!(
        "gateway signaling url {}",
        state.config.ws_signaling_url.as_deref().unwrap_or_default()
    );

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
