use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use booth_common::{access_code, ClientMessage, Role, ServerMessage};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::session::CallInfo;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_CAPACITY: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Deserialize)]
pub struct IceServerEntry {
    pub urls: String,
}

/// Body of `GET /webrtc/config`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcConfig {
    #[serde(default)]
    pub ice_servers: Vec<IceServerEntry>,
    #[serde(default)]
    pub ws_signaling_url: Option<String>,
}

impl RtcConfig {
    pub fn ice_urls(&self) -> Vec<String> {
        self.ice_servers.iter().map(|s| s.urls.clone()).collect()
    }
}

pub async fn fetch_rtc_config(gateway: &Url) -> Result<RtcConfig> {
    let url = gateway.join("/webrtc/config")?;
    let config = reqwest::get(url.clone())
        .await
        .with_context(|| format!("failed to reach {url}"))?
        .error_for_status()?
        .json::<RtcConfig>()
        .await
        .context("invalid WebRTC config response")?;
    Ok(config)
}

/// `http(s)://host/...` to `ws(s)://host/ws`.
pub fn signaling_url_for(gateway: &Url) -> Result<Url> {
    let mut url = gateway.join("/ws")?;
    let scheme = match gateway.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => bail!("unsupported gateway scheme {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot use {scheme} for {gateway}"))?;
    Ok(url)
}

#[derive(Debug, Clone)]
pub struct JoinOptions {
    pub access_code: String,
    pub display_name: String,
    pub role: Role,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
}

/// A joined call: what the gateway assigned plus both message directions.
pub struct SignalingConnection {
    pub info: CallInfo,
    pub outbound: mpsc::Sender<ClientMessage>,
    pub inbound: mpsc::Receiver<ServerMessage>,
}

pub struct SignalingClient {
    ws: WsStream,
}

impl SignalingClient {
    pub async fn connect(url: &Url) -> Result<Self> {
        let (ws, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        info!("connected to signaling gateway: {}", url);
        Ok(Self { ws })
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        let text = serde_json::to_string(msg)?;
        self.ws.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<ServerMessage> {
        while let Some(msg) = self.ws.next().await {
            match msg? {
                WsMessage::Text(text) => return Ok(serde_json::from_str(&text)?),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        Err(anyhow!("signaling connection closed"))
    }

    /// Send `JOIN` and wait for `JOINED`, then hand the socket to reader and
    /// writer tasks.
    pub async fn join(mut self, options: JoinOptions) -> Result<SignalingConnection> {
        let code = access_code::parse(&options.access_code)?;
        self.send(&ClientMessage::Join {
            access_code: code,
            display_name: options.display_name,
            user_agent: format!("booth-client/{}", env!("CARGO_PKG_VERSION")),
            customer_id: options.customer_id,
            customer_name: options.customer_name,
            role: options.role,
        })
        .await?;

        let info = tokio::time::timeout(JOIN_TIMEOUT, async {
            loop {
                match self.recv().await? {
                    ServerMessage::Joined {
                        participant_id,
                        session_id,
                        is_host,
                        host_id,
                        start_time,
                    } => {
                        return Ok::<_, anyhow::Error>(CallInfo {
                            participant_id,
                            session_id,
                            is_host,
                            host_id,
                            start_time,
                        })
                    }
                    ServerMessage::Error { message } => bail!("join rejected: {message}"),
                    other => debug!("ignoring {:?} before JOINED", other),
                }
            }
        })
        .await
        .map_err(|_| anyhow!("timed out waiting for JOINED"))??;

        let (mut write, mut read) = self.ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<ServerMessage>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("failed to encode signaling message: {}", err);
                        continue;
                    }
                };
                if let Err(err) = write.send(WsMessage::Text(text)).await {
                    error!("failed to send signaling message: {}", err);
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if in_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("failed to parse signaling message: {}", err),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Err(err) => {
                        error!("signaling WebSocket error: {}", err);
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(SignalingConnection {
            info,
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Check the code, connect and join in one step. A malformed code fails
/// before any network traffic.
pub async fn join_call(url: &Url, options: JoinOptions) -> Result<SignalingConnection> {
    access_code::parse(&options.access_code)?;
    SignalingClient::connect(url).await?.join(options).await
}
