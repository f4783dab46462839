//! Timer service
//!
//! One task owns the single pending `TimerEvent`. Arming replaces it,
//! and the fired event is handed to the event loop, which discards it if
//! the protocol has moved on in the meantime.

use crate::domain::TimerEvent;
use crate::events::ConsensusEvent;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tracing::debug;

#[derive(Debug)]
pub(crate) enum TimerCommand {
    Arm(TimerEvent),
    Disarm,
}

#[derive(Clone)]
pub(crate) struct TimerHandle {
    tx: mpsc::UnboundedSender<TimerCommand>,
}

impl TimerHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TimerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn arm(&self, event: TimerEvent) {
        debug!(
            "[hotstuff-timer] arm {:?} at height {} level {} in {:?}",
            event.state, event.height, event.level, event.duration
        );
        if self.tx.send(TimerCommand::Arm(event)).is_err() {
            debug!("[hotstuff-timer] timer task gone, arm ignored");
        }
    }

    pub fn disarm(&self) {
        let _ = self.tx.send(TimerCommand::Disarm);
    }
}

pub(crate) async fn run_timer(
    mut commands: mpsc::UnboundedReceiver<TimerCommand>,
    events: mpsc::Sender<ConsensusEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let deadline = sleep(std::time::Duration::ZERO);
    tokio::pin!(deadline);
    let mut pending: Option<TimerEvent> = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(TimerCommand::Arm(event)) => {
                    deadline.as_mut().reset(Instant::now() + event.duration);
                    pending = Some(event);
                }
                Some(TimerCommand::Disarm) => pending = None,
                None => break,
            },
            () = &mut deadline, if pending.is_some() => {
                if let Some(event) = pending.take() {
                    debug!(
                        "[hotstuff-timer] fired at height {} level {}",
                        event.height, event.level
                    );
                    if events.send(ConsensusEvent::Timeout(event)).await.is_err() {
                        break;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("[hotstuff-timer] stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ConsStateType;
    use std::time::Duration;

    fn event(level: u64, ms: u64) -> TimerEvent {
        TimerEvent {
            state: ConsStateType::PaceMaker,
            height: 1,
            level,
            epoch_id: 0,
            duration: Duration::from_millis(ms),
            level_index: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_pending_event() {
        let (handle, commands) = TimerHandle::channel();
        let (tx, mut rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown) = watch::channel(false);
        tokio::spawn(run_timer(commands, tx, shutdown));

        handle.arm(event(1, 100));
        handle.arm(event(2, 300));

        let fired = rx.recv().await.unwrap();
        match fired {
            ConsensusEvent::Timeout(te) => assert_eq!(te.level, 2),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_cancels() {
        let (handle, commands) = TimerHandle::channel();
        let (tx, mut rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown) = watch::channel(false);
        tokio::spawn(run_timer(commands, tx, shutdown));

        handle.arm(event(1, 100));
        handle.disarm();
        let waited = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_shutdown() {
        let (_handle, commands) = TimerHandle::channel();
        let (tx, _rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(run_timer(commands, tx, shutdown));
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
