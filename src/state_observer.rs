//! Bridges the switch-state update queue to the syncer's executor.
//! Subscribes to deltas and posts a `sync(new_state)` job per delta without
//! ever holding the state lock across the post — there isn't one to hold,
//! since [`crate::switch_state::UpdateQueue`] already hands out owned
//! snapshots.

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::netlink::NetlinkPort;
use crate::netlink::prober::TapProbe;
use crate::switch_state::UpdateQueue;
use crate::syncer::InterfaceSyncer;
use crate::tap::TapFactory;

pub struct StateObserver;

impl StateObserver {
    /// Runs `E-exec`: owns the syncer exclusively and drains the state
    /// queue's delta broadcast until cancelled. This is the task that
    /// actually calls `InterfaceSyncer::sync`, so the syncer never needs
    /// its own lock around `&mut self`.
    pub async fn run<N, T, P>(
        mut syncer: InterfaceSyncer<N, T, P>,
        state: std::sync::Arc<UpdateQueue>,
        mut manual: mpsc::UnboundedReceiver<()>,
        mut cancel: watch::Receiver<bool>,
    ) where
        N: NetlinkPort,
        T: TapFactory,
        P: TapProbe,
    {
        let mut deltas = state.subscribe();
        // Prime with current state so a syncer that starts after the first
        // delta still converges on startup.
        if let Err(e) = syncer.sync(&state.current()).await {
            warn!("initial sync failed: {e}");
        }

        loop {
            tokio::select! {
                biased;
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        debug!("state observer cancelled");
                        return;
                    }
                }
                delta = deltas.recv() => {
                    match delta {
                        Ok(delta) => {
                            if let Err(e) = syncer.sync(&delta.new).await {
                                warn!("sync failed: {e}");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "state observer lagged; resyncing from current snapshot");
                            if let Err(e) = syncer.sync(&state.current()).await {
                                warn!("resync after lag failed: {e}");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
                Some(()) = manual.recv() => {
                    if let Err(e) = syncer.sync(&state.current()).await {
                        warn!("manual resync failed: {e}");
                    }
                }
            }
        }
    }
}
