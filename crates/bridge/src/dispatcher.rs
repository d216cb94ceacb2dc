//! Per-device command dispatch.
//!
//! Every device gets its own unbounded FIFO and at most one worker task
//! draining it, so publishes to one lock never overlap and leave in the
//! order they were queued. Different devices proceed independently.
//!
//! Workers are spawned on demand and exit once their queue is empty; the
//! next enqueue spawns a fresh one. The exit decision is taken under the
//! queue-map lock, so an item is never left behind in a queue with no
//! worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use lockly_core::command::PinCodeCommand;
use lockly_core::types::SlotId;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One command waiting in a device queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    pub slot_id: SlotId,
    pub command: PinCodeCommand,
}

/// Processes one queued command for a device.
///
/// Implementations must not panic on publish failure; the worker moves on
/// to the next item either way.
#[async_trait]
pub trait DispatchHandler: Send + Sync {
    async fn dispatch(&self, device: &str, item: QueuedCommand);
}

struct DeviceQueue {
    tx: mpsc::UnboundedSender<QueuedCommand>,
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Queues {
    devices: HashMap<String, DeviceQueue>,
    next_generation: u64,
}

/// Serializes commands per device.
pub struct Dispatcher {
    handler: Weak<dyn DispatchHandler>,
    queues: Arc<Mutex<Queues>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// `cancel` stops every worker when cancelled.
    pub fn new(handler: Weak<dyn DispatchHandler>, cancel: CancellationToken) -> Self {
        Self {
            handler,
            queues: Arc::new(Mutex::new(Queues::default())),
            cancel,
        }
    }

    /// Append `item` to the queue of `device`, starting a worker if needed.
    pub fn enqueue(&self, device: &str, item: QueuedCommand) {
        if self.cancel.is_cancelled() {
            tracing::debug!(device, slot_id = item.slot_id, "Dispatcher stopped, dropping command");
            return;
        }
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);

        let alive = queues
            .devices
            .get(device)
            .is_some_and(|q| !q.task.is_finished() && !q.tx.is_closed());
        if !alive {
            queues.next_generation += 1;
            let generation = queues.next_generation;
            let (tx, rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(run_device_worker(
                device.to_string(),
                generation,
                rx,
                self.handler.clone(),
                Arc::clone(&self.queues),
                self.cancel.child_token(),
            ));
            queues.devices.insert(
                device.to_string(),
                DeviceQueue {
                    tx,
                    generation,
                    task,
                },
            );
        }

        tracing::debug!(device, slot_id = item.slot_id, "Command queued");
        if let Some(queue) = queues.devices.get(device) {
            if queue.tx.send(item).is_err() {
                tracing::error!(device, "Device queue closed, command dropped");
            }
        }
    }

    /// Devices with a live worker.
    pub fn active_devices(&self) -> Vec<String> {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues
            .devices
            .iter()
            .filter(|(_, q)| !q.task.is_finished())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Cancel all workers and drop queued commands.
    pub fn stop(&self) {
        self.cancel.cancel();
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        for (device, queue) in queues.devices.drain() {
            tracing::debug!(device = %device, "Stopping device worker");
            queue.task.abort();
        }
    }
}

async fn run_device_worker(
    device: String,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<QueuedCommand>,
    handler: Weak<dyn DispatchHandler>,
    queues: Arc<Mutex<Queues>>,
    cancel: CancellationToken,
) {
    tracing::debug!(device = %device, generation, "Device worker started");
    loop {
        let item = match rx.try_recv() {
            Ok(item) => item,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                let mut guard = queues.lock().unwrap_or_else(PoisonError::into_inner);
                // Re-check under the lock: enqueue sends while holding it.
                match rx.try_recv() {
                    Ok(item) => item,
                    Err(_) => {
                        if guard.devices.get(&device).is_some_and(|q| q.generation == generation) {
                            guard.devices.remove(&device);
                        }
                        tracing::debug!(device = %device, generation, "Device queue drained");
                        return;
                    }
                }
            }
        };

        let Some(handler) = handler.upgrade() else {
            return;
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(device = %device, "Device worker cancelled");
                return;
            }
            _ = handler.dispatch(&device, item) => {}
        }
    }
}
