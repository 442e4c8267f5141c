use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::{Mutex, OnceLock},
    time::{Duration, Instant},
};

use axum::http::{HeaderMap, HeaderValue};
use sha2::{Digest, Sha256};

#[derive(Clone, Copy)]
struct RateEntry {
    count: u32,
    window_start: Instant,
}

pub struct FixedWindowRateLimiter {
    max_requests: u32,
    window: Duration,
    max_keys: usize,
    entries: Mutex<HashMap<String, RateEntry>>,
}

impl FixedWindowRateLimiter {
    pub fn new(max_requests: u32, window: Duration, max_keys: usize) -> Self {
        Self {
            max_requests,
            window,
            max_keys,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut guard = match self.entries.lock() {
            Ok(v) => v,
            Err(_) => return false,
        };

        if guard.len() > self.max_keys {
            guard.retain(|_, entry| now.duration_since(entry.window_start) < self.window);
            if guard.len() > self.max_keys {
                return false;
            }
        }

        let entry = guard.entry(key.to_string()).or_insert(RateEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count = entry.count.saturating_add(1);
        entry.count <= self.max_requests
    }
}

static API_LIMITER: OnceLock<FixedWindowRateLimiter> = OnceLock::new();
static WS_JOIN_LIMITER: OnceLock<FixedWindowRateLimiter> = OnceLock::new();
static ALLOWED_ORIGINS: OnceLock<HashSet<String>> = OnceLock::new();

pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

fn load_allowed_origins() -> HashSet<String> {
    std::env::var("BOOTH_ALLOWED_ORIGINS")
        .unwrap_or_default()
        .split(',')
        .map(normalize_origin)
        .filter(|origin| !origin.is_empty())
        .collect()
}

/// The booth page is embedded on third-party sites, so every origin is
/// accepted unless `BOOTH_CORS_ALLOW_ANY=0`.
pub fn cors_allow_any() -> bool {
    env_bool("BOOTH_CORS_ALLOW_ANY", true)
}

pub fn cors_origin_values() -> Vec<HeaderValue> {
    let set = ALLOWED_ORIGINS.get_or_init(load_allowed_origins);
    set.iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect()
}

pub fn ws_origin_allowed(origin: Option<&str>) -> bool {
    if cors_allow_any() {
        return true;
    }
    let Some(origin) = origin else {
        return env_bool("BOOTH_WS_ALLOW_MISSING_ORIGIN", true);
    };
    let set = ALLOWED_ORIGINS.get_or_init(load_allowed_origins);
    set.contains(&normalize_origin(origin))
}

pub fn allow_global_api_request(key: &str) -> bool {
    API_LIMITER
        .get_or_init(|| {
            FixedWindowRateLimiter::new(
                env_u32("BOOTH_API_RATE_LIMIT", 300),
                Duration::from_secs(env_u32("BOOTH_API_RATE_WINDOW_SECS", 60).max(1) as u64),
                env_usize("BOOTH_API_RATE_MAX_KEYS", 50_000),
            )
        })
        .allow(key)
}

pub fn allow_ws_join_request(key: &str) -> bool {
    WS_JOIN_LIMITER
        .get_or_init(|| {
            FixedWindowRateLimiter::new(
                env_u32("BOOTH_WS_JOIN_RATE_LIMIT", 30),
                Duration::from_secs(env_u32("BOOTH_WS_JOIN_RATE_WINDOW_SECS", 60).max(1) as u64),
                env_usize("BOOTH_WS_JOIN_RATE_MAX_KEYS", 50_000),
            )
        })
        .allow(key)
}

/// Client address, honouring `X-Forwarded-For` only when
/// `BOOTH_TRUST_PROXY_HEADERS` is set.
pub fn effective_client_ip(headers: &HeaderMap, direct: SocketAddr) -> IpAddr {
    if env_bool("BOOTH_TRUST_PROXY_HEADERS", false) {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|value| value.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    direct.ip()
}

pub fn hash_ip(ip: IpAddr) -> String {
    hash_value(&ip.to_string())
}

pub fn hash_value(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Strip control characters and cap the length in chars.
pub fn sanitize_text(value: &str, max_chars: usize) -> String {
    value
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .take(max_chars)
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_window() {
        let limiter = FixedWindowRateLimiter::new(2, Duration::from_secs(60), 100);
        assert!(limiter.allow("a"));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
    }

    #[test]
    fn test_rate_limiter_resets_after_window() {
        let limiter = FixedWindowRateLimiter::new(1, Duration::from_millis(10), 100);
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.allow("a"));
    }

    #[test]
    fn test_hash_is_stable_hex() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(hash_ip(ip), hash_ip(ip));
        assert_eq!(hash_ip(ip).len(), 64);
        assert_ne!(hash_ip(ip), hash_value("10.0.0.2"));
    }

    #[test]
    fn test_direct_ip_without_proxy_trust() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        let direct: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(
            effective_client_ip(&headers, direct),
            "127.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_sanitize_text() {
        assert_eq!(sanitize_text("  hi\u{0007} there ", 100), "hi there");
        assert_eq!(sanitize_text("abcdef", 3), "abc");
        assert_eq!(sanitize_text("héllo", 2), "hé");
    }
}
