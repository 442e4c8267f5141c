use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use booth_common::access_code::{self, DEFAULT_DEMO_CODES};
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "booth-gateway")]
#[command(about = "Virtual Booth signaling gateway")]
pub struct Args {
    /// HTTP/WebSocket listen address
    #[arg(long, env = "BOOTH_BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    /// sqlite database for session bookkeeping
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:booth.db?mode=rwc")]
    pub database_url: String,

    /// Rooms idle for longer than this are deleted on the next join or reaper pass
    #[arg(long, env = "BOOTH_ROOM_STALE_SECS", default_value_t = 300)]
    pub room_stale_secs: u64,

    /// Unconsumed mailbox entries older than this are purged
    #[arg(long, env = "BOOTH_MAILBOX_TTL_SECS", default_value_t = 120)]
    pub mailbox_ttl_secs: u64,

    /// Hard cap on a call
    #[arg(long, env = "BOOTH_SESSION_MAX_SECS", default_value_t = 1800)]
    pub session_max_secs: u64,

    #[arg(long, env = "BOOTH_REAPER_INTERVAL_SECS", default_value_t = 60)]
    pub reaper_interval_secs: u64,

    /// Lifetime of a freshly issued access code
    #[arg(long, env = "BOOTH_ACCESS_CODE_TTL_SECS", default_value_t = 1800)]
    pub access_code_ttl_secs: u64,

    /// Comma-separated codes that bypass issuance (empty disables them)
    #[arg(long, env = "BOOTH_DEMO_CODES", default_value = "DEMO01,TEST01,BANK01")]
    pub demo_codes: String,

    /// Comma-separated ICE server URLs handed to clients
    #[arg(long, env = "BOOTH_ICE_URLS", default_value = "stun:stun.l.google.com:19302")]
    pub ice_urls: String,

    /// Public signaling URL advertised by /webrtc/config
    #[arg(long, env = "WS_SIGNALING_URL")]
    pub ws_signaling_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub room_stale: Duration,
    pub mailbox_ttl: Duration,
    pub session_max: Duration,
    pub reaper_interval: Duration,
    pub access_code_ttl: Duration,
    pub demo_codes: HashSet<String>,
    pub ice_urls: Vec<String>,
    pub ws_signaling_url: Option<String>,
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl GatewayConfig {
    pub fn is_demo_code(&self, code: &str) -> bool {
        self.demo_codes.contains(code)
    }
}

impl From<&Args> for GatewayConfig {
    fn from(args: &Args) -> Self {
        let demo_codes = split_list(&args.demo_codes)
            .map(|code| access_code::normalize(&code))
            .filter(|code| access_code::is_valid_format(code))
            .collect();
        Self {
            room_stale: Duration::from_secs(args.room_stale_secs.max(1)),
            mailbox_ttl: Duration::from_secs(args.mailbox_ttl_secs.max(5)),
            session_max: Duration::from_secs(args.session_max_secs.max(60)),
            reaper_interval: Duration::from_secs(args.reaper_interval_secs.max(1)),
            access_code_ttl: Duration::from_secs(args.access_code_ttl_secs.max(60)),
            demo_codes,
            ice_urls: split_list(&args.ice_urls).collect(),
            ws_signaling_url: args.ws_signaling_url.clone(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            room_stale: Duration::from_secs(5 * 60),
            mailbox_ttl: Duration::from_secs(120),
            session_max: Duration::from_secs(30 * 60),
            reaper_interval: Duration::from_secs(60),
            access_code_ttl: Duration::from_secs(30 * 60),
            demo_codes: DEFAULT_DEMO_CODES.iter().map(|c| c.to_string()).collect(),
            ice_urls: vec!["stun:stun.l.google.com:19302".to_string()],
            ws_signaling_url: None,
        }
    }
}
