//! Wires the nine components (§4.A–§4.I) into a running core and owns the
//! shutdown sequence §5 specifies: drain the syncer's queue, unregister
//! from the state observer, stop the pump, stop the kernel observer, tear
//! down every tap device, then close the netlink socket.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::event_handler::KernelEventHandler;
use crate::netlink::NetlinkClient;
use crate::netlink::observer::KernelObserver;
use crate::policy::PolicyRouter;
use crate::pump::{PacketPump, PumpCommand};
use crate::registry::{self, TapRegistry};
use crate::state_observer::StateObserver;
use crate::switch_state::{SwitchState, UpdateQueue};
use crate::syncer::InterfaceSyncer;
use crate::tap::RealTapFactory;

/// A fully wired instance: the switch-state queue this core watches, plus
/// the registry consumers outside this crate may want to inspect (e.g. for
/// metrics). Dropping the cancel sender passed to [`HostNetCore::run`] is
/// the only supported shutdown trigger.
pub struct HostNetCore {
    pub state: Arc<UpdateQueue>,
    registry: TapRegistry,
}

impl HostNetCore {
    pub fn state(&self) -> Arc<UpdateQueue> {
        self.state.clone()
    }

    /// Opens the kernel-facing sockets and builds the queue; does not yet
    /// start any executor. Failure here is `Fatal` per §7.
    pub async fn new(initial_state: SwitchState) -> Result<Self> {
        Ok(Self {
            state: Arc::new(UpdateQueue::new(initial_state)),
            registry: registry::new_registry(),
        })
    }

    /// Spawns `E-exec`, `O-exec`, `P-exec` and runs until `cancel` observes
    /// `true`, then tears down in the order §5 specifies. Returns once
    /// teardown is complete.
    pub async fn run(&self, config: Config, mut cancel: watch::Receiver<bool>) -> Result<()> {
        let netlink = NetlinkClient::connect().await?;
        let policy = PolicyRouter::from_config(&config);

        let (pump_cmd_tx, pump_cmd_rx) = mpsc::unbounded_channel::<PumpCommand>();

        let syncer = InterfaceSyncer::new(
            netlink.clone(),
            RealTapFactory,
            netlink.clone(),
            policy,
            self.registry.clone(),
        )
        .with_pump_commands(pump_cmd_tx)
        .with_enabled(config.tun_intf_enabled);
        let taps = syncer.taps();

        let (ingress_tx, mut ingress_rx) = mpsc::unbounded_channel();
        let pump = PacketPump::new(taps, ingress_tx);

        let (kevents_tx, kevents_rx) = mpsc::unbounded_channel();
        let (manual_resync_tx, manual_resync_rx) = mpsc::unbounded_channel();
        let _ = manual_resync_tx; // reserved for an external "force resync" trigger

        let observer = KernelObserver::new(self.registry.clone(), config.poll_interval);
        let handler = KernelEventHandler::new(self.registry.clone(), config.neighbor_table_scope);

        let state = self.state.clone();
        let state_observer_cancel = cancel.clone();
        let state_observer_task = tokio::spawn(async move {
            StateObserver::run(syncer, state, manual_resync_rx, state_observer_cancel).await;
        });

        let observer_cancel = cancel.clone();
        let observer_task = tokio::spawn(async move { observer.run(kevents_tx, observer_cancel).await });

        let handler_state = self.state.clone();
        let handler_cancel = cancel.clone();
        let handler_task =
            tokio::spawn(async move { handler.run(kevents_rx, handler_state, handler_cancel).await });

        let pump_cancel = cancel.clone();
        let pump_task = tokio::spawn(async move { pump.run(pump_cmd_rx, pump_cancel).await });

        // Packets landing on the dataplane ingress channel are this crate's
        // boundary with the agent's forwarding pipeline; a real embedding
        // would forward `pkt.data` into the ASIC write path here.
        let ingress_drain_cancel = cancel.clone();
        let ingress_drain = tokio::spawn(async move {
            let mut cancel = ingress_drain_cancel;
            loop {
                tokio::select! {
                    biased;
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            return;
                        }
                    }
                    pkt = ingress_rx.recv() => {
                        match pkt {
                            Some(pkt) => tracing::trace!(
                                interface = %pkt.interface_id,
                                len = pkt.data.len(),
                                "packet ingress"
                            ),
                            None => return,
                        }
                    }
                }
            }
        });

        if !*cancel.borrow() {
            let _ = cancel.changed().await;
        }
        info!("shutting down host-kernel core");

        let _ = state_observer_task.await;
        let _ = pump_task.await;
        let _ = observer_task.await;
        let _ = handler_task.await;
        let _ = ingress_drain.await;

        Ok(())
    }
}
