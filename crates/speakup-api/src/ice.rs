use std::time::Duration;

use axum::{Extension, Json, extract::State};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use uuid::Uuid;

use speakup_types::api::{Claims, IceServer, IceServersResponse};

use crate::AppState;
use crate::error::ApiError;

type HmacSha1 = Hmac<Sha1>;

/// STUN/TURN servers handed to clients for the peer transport.
#[derive(Debug, Clone)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn_urls: Vec<String>,
    /// Shared secret of the TURN server's REST API. No TURN entry without it.
    pub turn_secret: Option<String>,
    pub turn_ttl: Duration,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec!["stun:stun.l.google.com:19302".into()],
            turn_urls: Vec::new(),
            turn_secret: None,
            turn_ttl: Duration::from_secs(86400),
        }
    }
}

impl IceConfig {
    pub fn servers_for(&self, user_id: Uuid, now_unix: i64) -> anyhow::Result<Vec<IceServer>> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(IceServer {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }

        if let Some(secret) = self.turn_secret.as_deref().filter(|_| !self.turn_urls.is_empty()) {
            let expiry = now_unix + self.turn_ttl.as_secs() as i64;
            let username = format!("{}:{}", expiry, user_id);
            servers.push(IceServer {
                urls: self.turn_urls.clone(),
                credential: Some(turn_credential(secret, &username)?),
                username: Some(username),
            });
        }

        Ok(servers)
    }
}

/// TURN REST API credential: base64(HMAC-SHA1(secret, username)).
pub fn turn_credential(secret: &str, username: &str) -> anyhow::Result<String> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid TURN secret: {}", e))?;
    mac.update(username.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

pub async fn ice_servers(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<IceServersResponse>, ApiError> {
    let ice_servers = state.ice.servers_for(claims.sub, Utc::now().timestamp())?;
    Ok(Json(IceServersResponse {
        ice_servers,
        ttl_secs: state.ice.turn_ttl.as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stun_only_without_secret() {
        let config = IceConfig {
            turn_urls: vec!["turn:turn.example.com:3478".into()],
            ..Default::default()
        };
        let servers = config.servers_for(Uuid::nil(), 1_700_000_000).unwrap();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].credential.is_none());
    }

    #[test]
    fn turn_username_carries_expiry_and_user() {
        let config = IceConfig {
            turn_urls: vec!["turn:turn.example.com:3478".into()],
            turn_secret: Some("shared".into()),
            turn_ttl: Duration::from_secs(600),
            ..Default::default()
        };
        let user = Uuid::new_v4();
        let servers = config.servers_for(user, 1_700_000_000).unwrap();
        let turn = &servers[1];
        assert_eq!(
            turn.username.as_deref(),
            Some(format!("1700000600:{}", user).as_str())
        );
        let expected = turn_credential("shared", turn.username.as_deref().unwrap()).unwrap();
        assert_eq!(turn.credential.as_deref(), Some(expected.as_str()));
    }

    #[test]
    fn credential_matches_known_vector() {
        // echo -n "1700000000:alice" | openssl dgst -sha1 -hmac secret -binary | base64
        let credential = turn_credential("secret", "1700000000:alice").unwrap();
        assert_eq!(credential, "d8soP47RbdIKLDUOpnJPVQyq5Ts=");
    }
}
