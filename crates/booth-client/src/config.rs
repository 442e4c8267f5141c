use std::time::Duration;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Timing and ICE settings for one call.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Wait before the initiator sends its offer, so the callee's presence
    /// subscription is in place.
    pub offer_delay: Duration,
    /// Wait before a processed mailbox entry is consumed.
    pub consume_delay: Duration,
    /// Wait before a failed or closed peer is dropped.
    pub failed_peer_delay: Duration,
    /// How long the call survives with nobody else present.
    pub grace_period: Duration,
    pub session_max: Duration,
    pub tick: Duration,
    pub ice_urls: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            offer_delay: Duration::from_secs(1),
            consume_delay: Duration::from_secs(1),
            failed_peer_delay: Duration::from_secs(2),
            grace_period: Duration::from_secs(30),
            session_max: Duration::from_secs(30 * 60),
            tick: Duration::from_secs(60),
            ice_urls: vec![DEFAULT_STUN_URL.to_string()],
        }
    }
}

impl ClientConfig {
    pub fn with_ice_urls(mut self, urls: Vec<String>) -> Self {
        if !urls.is_empty() {
            self.ice_urls = urls;
        }
        self
    }
}
