//! Background pollers. Both loops run until the synchronizer's shutdown
//! token fires and treat every tick failure as transient: log and wait for
//! the next interval.

use crate::sync::ChatSync;

/// Periodically refresh the public room directories. Runs regardless of
/// authentication so the room browser works before login.
pub(crate) fn spawn_discovery(sync: ChatSync) {
    let cancel = sync.shutdown_token();
    let period = sync.config().discovery_interval;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => sync.refresh_discovery().await,
            }
        }
        tracing::debug!("discovery poller stopped");
    });
}

/// Periodically refresh membership and raise notifications for unseen
/// messages in joined rooms. Skips ticks while unauthenticated.
pub(crate) fn spawn_notifications(sync: ChatSync) {
    let cancel = sync.shutdown_token();
    let period = sync.config().notify_interval;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = sync.notification_sweep().await {
                        tracing::debug!(error = %e, "notification sweep failed");
                    }
                }
            }
        }
        tracing::debug!("notification poller stopped");
    });
}
