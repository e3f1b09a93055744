use std::time::Duration;

use anyhow::{Context, Result};
use url::Url;

/// Runtime configuration for a synchronizer instance, resolved from explicit
/// values and environment overrides. One instance per active session; there
/// are no ambient defaults beyond these.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base URL of the collaborator HTTP API, e.g. `http://host/api/v1`.
    pub api_base: Url,
    /// Base URL of the live transport, e.g. `ws://host/api/v1/ws`. Derived
    /// from `api_base` when not given explicitly.
    pub ws_base: Url,
    /// Public origin used when building invite links.
    pub link_origin: Url,
    /// Interval between discovery list refreshes.
    pub discovery_interval: Duration,
    /// Interval between background notification polls.
    pub notify_interval: Duration,
    /// Optional `limit` passed to history fetches.
    pub history_limit: Option<u32>,
}

impl Config {
    /// Build a configuration from an API base URL, deriving the transport
    /// base (`<api_base>/ws`, scheme swapped to ws/wss) and the link origin.
    pub fn new(api_base: &str) -> Result<Self> {
        let api_base: Url = api_base.parse().context("invalid api base url")?;
        let ws_base = derive_ws_base(&api_base)?;
        let link_origin = origin_of(&api_base)?;
        Ok(Self {
            api_base,
            ws_base,
            link_origin,
            discovery_interval: Duration::from_secs(5),
            notify_interval: Duration::from_secs(10),
            history_limit: None,
        })
    }

    /// Resolve configuration from environment variables. `OPENCHAT_API_BASE`
    /// is required; the rest override derived defaults.
    pub fn from_env() -> Result<Self> {
        let api_base =
            std::env::var("OPENCHAT_API_BASE").context("OPENCHAT_API_BASE not set")?;
        let mut cfg = Self::new(&api_base)?;
        if let Ok(ws) = std::env::var("OPENCHAT_WS_BASE") {
            cfg.ws_base = ws.parse().context("invalid OPENCHAT_WS_BASE")?;
        }
        if let Ok(origin) = std::env::var("OPENCHAT_ORIGIN") {
            cfg.link_origin = origin.parse().context("invalid OPENCHAT_ORIGIN")?;
        }
        if let Ok(secs) = std::env::var("OPENCHAT_DISCOVERY_SECS") {
            let secs: u64 = secs.parse().context("invalid OPENCHAT_DISCOVERY_SECS")?;
            cfg.discovery_interval = Duration::from_secs(secs.max(1));
        }
        if let Ok(secs) = std::env::var("OPENCHAT_NOTIFY_SECS") {
            let secs: u64 = secs.parse().context("invalid OPENCHAT_NOTIFY_SECS")?;
            cfg.notify_interval = Duration::from_secs(secs.max(1));
        }
        Ok(cfg)
    }
}

fn derive_ws_base(api_base: &Url) -> Result<Url> {
    let mut ws = api_base.clone();
    let scheme = match api_base.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    ws.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("cannot derive ws scheme from {}", api_base))?;
    let path = format!("{}/ws", ws.path().trim_end_matches('/'));
    ws.set_path(&path);
    Ok(ws)
}

fn origin_of(api_base: &Url) -> Result<Url> {
    let mut origin = api_base.clone();
    origin.set_path("");
    origin.set_query(None);
    Ok(origin)
}
