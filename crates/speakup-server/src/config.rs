use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use speakup_api::ice::IceConfig;
use speakup_gateway::GatewayConfig;

const DEV_JWT_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub gateway: GatewayConfig,
    pub ice: IceConfig,
}

impl Config {
    /// Read `SPEAKUP_*` variables; `.env` must already be loaded.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = get("SPEAKUP_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse_or(&get, "SPEAKUP_PORT", 3000)?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        let jwt_secret = match get("SPEAKUP_JWT_SECRET") {
            Some(secret) if !secret.is_empty() => secret,
            _ => {
                warn!("SPEAKUP_JWT_SECRET not set, using the development secret");
                DEV_JWT_SECRET.into()
            }
        };

        let gateway = GatewayConfig {
            ring_timeout: Duration::from_secs(parse_or(&get, "SPEAKUP_RING_TIMEOUT_SECS", 30)?),
            connect_timeout: Duration::from_secs(parse_or(
                &get,
                "SPEAKUP_CONNECT_TIMEOUT_SECS",
                30,
            )?),
            presence_stale_after: Duration::from_secs(parse_or(
                &get,
                "SPEAKUP_PRESENCE_STALE_SECS",
                90,
            )?),
            sweep_interval: Duration::from_secs(
                parse_or(&get, "SPEAKUP_SWEEP_INTERVAL_SECS", 5)?.max(1),
            ),
            missed_call_notifications: parse_or(&get, "SPEAKUP_MISSED_CALL_NOTIFICATIONS", true)?,
        };

        let defaults = IceConfig::default();
        let ice = IceConfig {
            stun_urls: get("SPEAKUP_STUN_URLS")
                .map(|raw| split_list(&raw))
                .unwrap_or(defaults.stun_urls),
            turn_urls: get("SPEAKUP_TURN_URLS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            turn_secret: get("SPEAKUP_TURN_SECRET").filter(|s| !s.is_empty()),
            turn_ttl: Duration::from_secs(parse_or(&get, "SPEAKUP_TURN_TTL_SECS", 86400)?),
        };

        Ok(Self {
            addr,
            db_path: PathBuf::from(get("SPEAKUP_DB_PATH").unwrap_or_else(|| "speakup.db".into())),
            jwt_secret,
            gateway,
            ice,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", key, raw)),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
