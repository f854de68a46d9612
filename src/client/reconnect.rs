//! Background tasks: reconnection probes and the idle evictor
//!
//! Both hold only a weak reference to the client, so dropping the last
//! `Client` handle ends them even without `end()`.

use super::Inner;
use crate::cluster::ServerId;
use crate::health::ProbeOutcome;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Probe a dead server until it answers or the attempt ceiling is reached.
/// The first probe runs `retry_ms` after death, later ones every
/// `reconnect_ms`.
pub(super) fn spawn_probe(inner: &Arc<Inner>, id: ServerId) {
    let weak = Arc::downgrade(inner);
    let cancel = inner.cancel.clone();
    let mut delay = inner.config.retry();
    let every = inner.config.reconnect();

    tokio::spawn(async move {
        loop {
            match weak.upgrade() {
                Some(inner) => inner.health.schedule_probe(id, Instant::now() + delay),
                None => return,
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.health.begin_reconnect(id);

            let pool = Arc::clone(&inner.pools[id.0]);
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = pool.probe() => result,
            };

            match result {
                Ok(()) => {
                    // Anything pooled before the outage is stale
                    inner.pools[id.0].drain_idle();
                    inner.health.reconnected(id);
                    if inner.config.remove {
                        inner.topology.include(id);
                    }
                    return;
                }
                Err(e) => match inner.health.reconnect_failed(id, &e) {
                    ProbeOutcome::Retry => {}
                    ProbeOutcome::GiveUp { .. } => return,
                },
            }

            delay = every;
        }
    });
}

/// Close idle connections every `idle_ms`
pub(super) fn spawn_evictor(inner: &Arc<Inner>) {
    let weak = Arc::downgrade(inner);
    let cancel = inner.cancel.clone();
    let period = inner.config.idle();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(inner) = weak.upgrade() else {
                break;
            };
            let evicted: usize = inner.pools.iter().map(|pool| pool.evict_idle()).sum();
            if evicted > 0 {
                debug!(evicted, "Idle sweep");
            }
        }
    });
}
