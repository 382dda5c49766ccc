//! Async driver for [`LiveController`].
//!
//! The controller never blocks and never spawns; this task gives it a clock
//! tick and a stream of collaborator events, and stops on cancellation.

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::controller::LiveController;
use crate::error::HlsLiveError;
use crate::events::EventReceiver;

/// Run the controller until it is torn down, cancelled, or the bus closes.
/// Returns the controller so callers can inspect its final state.
pub async fn run(mut controller: LiveController, mut events: EventReceiver) -> LiveController {
    let token = controller.cancellation_token();
    let mut ticker = tokio::time::interval(controller.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        tick_ms = controller.tick_interval().as_millis() as u64,
        "Live driver started"
    );

    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => {
                debug!("Cancellation requested");
                break;
            }

            event = events.recv() => match event {
                Some(event) => controller.handle_event(event),
                None => {
                    debug!("Event bus closed");
                    break;
                }
            },

            _ = ticker.tick(), if controller.is_scheduling() => controller.tick(),
        }

        if controller.is_torn_down() {
            break;
        }
    }

    controller.destroy();
    events.close();
    info!("Live driver stopped");
    controller
}

/// Handle to a spawned driver task.
pub struct LiveHandle {
    token: CancellationToken,
    task: JoinHandle<LiveController>,
}

impl LiveHandle {
    /// Ask the driver to tear the controller down.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the driver to stop and get the controller back.
    pub async fn join(self) -> Result<LiveController, HlsLiveError> {
        self.task.await.map_err(|_| HlsLiveError::Cancelled)
    }
}

/// Spawn [`run`] on the current runtime.
pub fn spawn(controller: LiveController, events: EventReceiver) -> LiveHandle {
    let token = controller.cancellation_token();
    let task = tokio::spawn(run(controller, events));
    LiveHandle { token, task }
}
