use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, Duration};

use crate::db::PositionStore;
use crate::engine::Engine;
use crate::exchange::ExchangeClient;

/// Run the escalation loop. Each tick claims live positions, evaluates the
/// trailing stop and escalates orders. The first tick fires immediately.
///
/// An in-flight tick always runs to completion: shutdown is only observed
/// between ticks, so an exchange mutation is never abandoned halfway.
pub async fn run_escalation_loop<S, E>(
    engine: Arc<Engine<S, E>>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) where
    S: PositionStore + 'static,
    E: ExchangeClient + 'static,
{
    let mut ticker = interval(Duration::from_secs(interval_secs));
    tracing::info!(interval_secs, "Escalation loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.tick().await {
                    tracing::error!(error = %e, "Escalation tick failed");
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("Escalation loop shutting down");
                break;
            }
        }
    }
}

/// Run the reconciliation loop on its own, slower cadence.
pub async fn run_reconciliation_loop<S, E>(
    engine: Arc<Engine<S, E>>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) where
    S: PositionStore + 'static,
    E: ExchangeClient + 'static,
{
    let mut ticker = interval(Duration::from_secs(interval_secs));
    tracing::info!(interval_secs, "Reconciliation loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.reconcile().await {
                    tracing::error!(error = %e, "Reconciliation sweep failed");
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("Reconciliation loop shutting down");
                break;
            }
        }
    }
}
