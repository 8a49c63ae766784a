use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Gateway;

/// Background loop: expires unanswered or stalled calls and ages out
/// presence rows whose connection vanished without a clean close.
pub async fn run_sweeper(gateway: Gateway, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(gateway.config.sweep_interval);
    info!(
        "Sweeper started (every {:?}, stale after {:?})",
        gateway.config.sweep_interval, gateway.config.presence_stale_after
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Sweeper stopped");
                return;
            }
            _ = interval.tick() => {
                sweep_once(&gateway).await;
            }
        }
    }
}

pub async fn sweep_once(gateway: &Gateway) {
    let now = Utc::now();

    let expired = gateway.calls.expire_due(now).await;
    if expired > 0 {
        debug!("Expired {} calls", expired);
    }

    let stale_after = chrono::Duration::from_std(gateway.config.presence_stale_after)
        .unwrap_or_else(|_| chrono::Duration::seconds(90));
    let stale = match gateway.presence.stale_online(now - stale_after).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!("Stale presence scan failed: {}", e);
            return;
        }
    };

    for user_id in stale {
        if gateway.dispatcher.is_connected(user_id).await {
            continue;
        }
        info!("Marking stale user {} offline", user_id);
        if let Err(e) = gateway.presence.mark_offline(user_id).await {
            warn!("Failed to mark {} offline: {}", user_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::GatewayConfig;
    use crate::test_support::gateway_with_users;

    #[tokio::test]
    async fn stale_disconnected_users_go_offline() {
        let config = GatewayConfig {
            presence_stale_after: Duration::ZERO,
            ..Default::default()
        };
        let (gateway, ids) = gateway_with_users(&["alice", "bob"], config);
        gateway.presence.mark_online(ids[0]).await.unwrap();
        gateway.presence.mark_online(ids[1]).await.unwrap();
        let (_conn, _rx) = gateway.dispatcher.register_user_channel(ids[1]).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        sweep_once(&gateway).await;

        assert!(!gateway.presence.get(ids[0]).await.unwrap().unwrap().is_online);
        assert!(gateway.presence.get(ids[1]).await.unwrap().unwrap().is_online);
    }

    #[tokio::test]
    async fn cancelled_sweeper_returns() {
        let (gateway, _) = gateway_with_users(&[], GatewayConfig::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sweeper(gateway, cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
