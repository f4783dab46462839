//! Task wiring: timer, WAL replay, and the protocol, sync and event loops

use super::timer::run_timer;
use super::ConsensusService;
use crate::domain::{ConsStateType, ConsensusError, ConsensusResult};
use crate::events::{ConsensusEvent, ConsensusMsg, ConsensusPayload};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// True once either signal asks the loops to stop.
fn stopping(shutdown: &watch::Receiver<bool>, halt: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || *halt.borrow()
}

impl ConsensusService {
    /// Replay the WAL, spawn the loops and enter the first level.
    ///
    /// Can only be called once. The returned handles finish after
    /// `shutdown` flips to `true` or the service halts.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> ConsensusResult<Vec<JoinHandle<()>>> {
        let receivers = self
            .receivers
            .lock()
            .take()
            .ok_or(ConsensusError::ChannelClosed("service already started"))?;

        let mut handles = Vec::with_capacity(4);
        handles.push(tokio::spawn(run_timer(
            receivers.timer,
            self.event_tx.clone(),
            shutdown.clone(),
        )));

        self.replay_wal().await?;

        handles.push(tokio::spawn(Arc::clone(self).run_protocol_loop(
            receivers.internal,
            receivers.protocol,
            shutdown.clone(),
        )));
        handles.push(tokio::spawn(
            Arc::clone(self).run_sync_loop(receivers.sync, shutdown.clone()),
        ));
        handles.push(tokio::spawn(
            Arc::clone(self).run_event_loop(receivers.events, shutdown),
        ));

        self.kick_off().await?;
        info!("[hotstuff] {} started", self.node_id());
        Ok(handles)
    }

    pub(super) async fn kick_off(&self) -> ConsensusResult<()> {
        let _guard = self.process_lock.lock().await;
        let epoch = self.current_epoch();
        if !self.process_certificates(&epoch, None)? {
            epoch.smr.set_state(ConsStateType::NewHeight);
            self.process_new_height(&epoch)?;
        }
        Ok(())
    }

    async fn run_protocol_loop(
        self: Arc<Self>,
        mut internal: mpsc::UnboundedReceiver<ConsensusMsg>,
        mut protocol: mpsc::Receiver<ConsensusMsg>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut halt = self.halted();
        loop {
            if stopping(&shutdown, &halt) {
                break;
            }
            let msg = tokio::select! {
                biased;
                changed = shutdown.changed() => match changed {
                    Ok(()) => continue,
                    Err(_) => break,
                },
                _ = halt.changed() => continue,
                Some(msg) = internal.recv() => msg,
                Some(msg) = protocol.recv() => msg,
                else => break,
            };
            if let Err(err) = self.handle_protocol_msg(msg).await {
                self.on_error(err);
            }
        }
        debug!("[hotstuff] protocol loop stopped");
    }

    async fn run_sync_loop(
        self: Arc<Self>,
        mut sync: mpsc::Receiver<ConsensusMsg>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut halt = self.halted();
        loop {
            if stopping(&shutdown, &halt) {
                break;
            }
            let msg = tokio::select! {
                changed = shutdown.changed() => match changed {
                    Ok(()) => continue,
                    Err(_) => break,
                },
                _ = halt.changed() => continue,
                msg = sync.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let result = match &msg.payload {
                ConsensusPayload::BlockFetch(_) => self.process_block_fetch(&msg),
                ConsensusPayload::BlockFetchResp(_) => self.process_block_fetch_resp(msg),
                other => Err(ConsensusError::Codec(format!(
                    "{} on the sync mailbox",
                    other.msg_type().as_str()
                ))),
            };
            if let Err(err) = result {
                self.on_error(err);
            }
        }
        debug!("[hotstuff-sync] sync loop stopped");
    }

    async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ConsensusEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut halt = self.halted();
        loop {
            if stopping(&shutdown, &halt) {
                break;
            }
            let event = tokio::select! {
                changed = shutdown.changed() => match changed {
                    Ok(()) => continue,
                    Err(_) => break,
                },
                _ = halt.changed() => continue,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let result = match event {
                ConsensusEvent::ProposedBlock(block) => self.handle_proposed_block(block).await,
                ConsensusEvent::BlockCommitted(block) => self.handle_block_committed(block).await,
                ConsensusEvent::Timeout(timer) => self.handle_timer_event(timer).await,
            };
            if let Err(err) = result {
                self.on_error(err);
            }
        }
        debug!("[hotstuff] event loop stopped");
    }

    /// Drop the offending input, or halt on errors the node cannot run past.
    pub(super) fn on_error(&self, err: ConsensusError) {
        if err.is_fatal() {
            error!("[hotstuff] fatal error, halting: {}", err);
            let _ = self.halt_tx.send(true);
            return;
        }
        debug!("[hotstuff] dropped: {}", err);
        crate::metrics::record_message_dropped(err.label());
    }
}
