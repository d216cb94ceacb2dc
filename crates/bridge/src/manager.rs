//! Slot apply orchestration.
//!
//! [`SlotManager`] owns one installation's slot table and drives slot
//! changes out to its locks. Operator requests become jobs on a single
//! apply queue; the apply worker fans each job out as one pin-code command
//! per target device into the [`Dispatcher`], then waits until every
//! device has answered or exhausted its retries before taking the next
//! job. Device answers reach the manager through
//! [`handle_action`](SlotManager::handle_action) and
//! [`handle_state`](SlotManager::handle_state).
//!
//! Platform events are broadcast via a [`tokio::sync::broadcast`] channel.
//! Call [`SlotManager::subscribe`] to receive them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use lockly_core::activity::ActivityEvent;
use lockly_core::command::PinCodeCommand;
use lockly_core::error::LocklyError;
use lockly_core::slot::{
    self, redact_pin, Slot, SlotExport, SlotImport, SlotResponse, SlotStatus, SlotUpdate,
};
use lockly_core::types::SlotId;
use lockly_events::ActivityBuffer;
use lockly_store::slots::{load_slots, save_slots};
use lockly_store::BlobStore;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, MutexGuard};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::LocklyConfig;
use crate::correlator::{AnswerChannel, Correlator, RequestKey};
use crate::dispatcher::{DispatchHandler, Dispatcher, QueuedCommand};
use crate::events::LocklyEvent;
use crate::messages::StateSnapshot;
use crate::publisher::{CommandPublisher, COMMAND_QOS};
use crate::resolver::{LockDirectory, LockResolver};

/// Broadcast channel capacity for platform events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How an apply request is carried out.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Clear the slot on the devices regardless of its stored state.
    pub force_clear: bool,
    /// Device handles to target instead of the configured lock set.
    pub targets: Option<Vec<String>>,
    /// Skip device traffic and record a simulated response.
    pub dry_run: bool,
    /// Return only after every device answered or timed out.
    pub wait_for_completion: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            force_clear: false,
            targets: None,
            dry_run: false,
            wait_for_completion: true,
        }
    }
}

/// One queued apply job.
struct SlotJob {
    slot_id: SlotId,
    devices: Vec<String>,
    force_clear: bool,
    dry_run: bool,
    remove_on_complete: bool,
    /// Resolved once the job is fully processed.
    done: oneshot::Sender<()>,
}

/// Fan-in bookkeeping of the job currently applying a slot.
struct FanIn {
    /// Devices that have neither answered nor exhausted their retries.
    pending: HashSet<String>,
    done: Option<oneshot::Sender<()>>,
    remove_on_complete: bool,
    timed_out: bool,
}

#[derive(Default)]
struct ManagerState {
    slots: BTreeMap<SlotId, Slot>,
    correlator: Correlator,
    fan_in: HashMap<SlotId, FanIn>,
    /// Slots whose first publish of the current job has started.
    publish_started: HashSet<SlotId>,
}

impl ManagerState {
    /// Close the fan-in of `slot_id` once no device is outstanding.
    ///
    /// Resets the slot's apply status and returns the finished fan-in.
    fn take_finished(&mut self, slot_id: SlotId) -> Option<FanIn> {
        if !self.fan_in.get(&slot_id)?.pending.is_empty() {
            return None;
        }
        let fan = self.fan_in.remove(&slot_id)?;
        self.publish_started.remove(&slot_id);
        if let Some(slot) = self.slots.get_mut(&slot_id) {
            slot.busy = false;
            slot.status = if fan.timed_out {
                SlotStatus::Timeout
            } else {
                SlotStatus::Idle
            };
        }
        Some(fan)
    }
}

struct ApplyWorker {
    tx: mpsc::UnboundedSender<SlotJob>,
    task: JoinHandle<()>,
}

/// Manages the PIN slots of one installation.
///
/// Created via [`SlotManager::start`]. The returned `Arc` can be cloned
/// into message handlers and operator surfaces.
pub struct SlotManager {
    config: LocklyConfig,
    resolver: LockResolver,
    publisher: Arc<dyn CommandPublisher>,
    store: Arc<dyn BlobStore>,
    activity: ActivityBuffer,
    state: Mutex<ManagerState>,
    /// Serializes slot-table writes.
    save_lock: Mutex<()>,
    dispatcher: Dispatcher,
    apply_worker: StdMutex<Option<ApplyWorker>>,
    event_tx: broadcast::Sender<LocklyEvent>,
    /// Master cancellation token, cancelled by [`SlotManager::stop`].
    cancel: CancellationToken,
    weak_self: Weak<SlotManager>,
}

impl SlotManager {
    /// Load the slot table and activity log, and return a running manager.
    pub async fn start(
        config: LocklyConfig,
        publisher: Arc<dyn CommandPublisher>,
        store: Arc<dyn BlobStore>,
        directory: Arc<dyn LockDirectory>,
    ) -> Result<Arc<Self>, LocklyError> {
        let slots = load_slots(store.as_ref(), &config.slots_key()).await?;

        let activity = ActivityBuffer::persisted(
            config.activity_capacity,
            Arc::clone(&store),
            config.activity_key(),
        );
        if let Err(e) = activity.load().await {
            tracing::error!(error = %e, "Failed to load activity log");
        }

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let slot_count = slots.len();

        let manager = Arc::new_cyclic(|weak: &Weak<SlotManager>| {
            let handler: Weak<dyn DispatchHandler> = weak.clone();
            Self {
                resolver: LockResolver::new(directory),
                publisher,
                store,
                activity,
                state: Mutex::new(ManagerState {
                    slots,
                    ..Default::default()
                }),
                save_lock: Mutex::new(()),
                dispatcher: Dispatcher::new(handler, cancel.child_token()),
                apply_worker: StdMutex::new(None),
                event_tx,
                cancel,
                weak_self: weak.clone(),
                config,
            }
        });

        tracing::info!(
            installation = %manager.config.installation,
            slots = slot_count,
            "Slot manager started",
        );
        Ok(manager)
    }

    /// Subscribe to platform events.
    pub fn subscribe(&self) -> broadcast::Receiver<LocklyEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &LocklyConfig {
        &self.config
    }

    pub fn activity(&self) -> &ActivityBuffer {
        &self.activity
    }

    pub async fn slot(&self, slot_id: SlotId) -> Option<Slot> {
        self.state.lock().await.slots.get(&slot_id).cloned()
    }

    /// All slots, ordered by id.
    pub async fn slots(&self) -> Vec<Slot> {
        self.state.lock().await.slots.values().cloned().collect()
    }

    /// Device names an apply with `targets` would reach.
    pub fn resolve_devices(&self, targets: Option<&[String]>) -> Vec<String> {
        match targets {
            Some(targets) => self.resolver.resolve_targets(targets),
            None => self.resolver.configured(&self.config),
        }
    }

    // ---- operator commands ----

    /// Create a slot at the lowest free id in the configured range.
    pub async fn add_slot(&self) -> Result<SlotId, LocklyError> {
        let slot_id = {
            let mut state = self.state.lock().await;
            let slot_id = slot::next_available_slot(self.config.slot_range(), &state.slots)
                .ok_or(LocklyError::NoAvailableSlots)?;
            state.slots.insert(slot_id, Slot::new(slot_id));
            slot_id
        };
        self.save().await?;
        tracing::info!(slot_id, "Slot added");
        self.emit(LocklyEvent::SlotAdded { slot_id });
        Ok(slot_id)
    }

    /// Clear a slot from its devices, then delete it.
    ///
    /// Returns once every device answered or timed out and the slot is gone.
    pub async fn remove_slot(
        &self,
        slot_id: SlotId,
        targets: Option<Vec<String>>,
        dry_run: bool,
    ) -> Result<(), LocklyError> {
        let options = ApplyOptions {
            force_clear: true,
            targets,
            dry_run,
            wait_for_completion: true,
        };
        let done = self.enqueue_apply(slot_id, &options, true).await?;
        let _ = done.await;
        Ok(())
    }

    /// Push a slot's desired state to its devices.
    pub async fn apply_slot(&self, slot_id: SlotId, options: ApplyOptions) -> Result<(), LocklyError> {
        let done = self.enqueue_apply(slot_id, &options, false).await?;
        if options.wait_for_completion {
            let _ = done.await;
        }
        Ok(())
    }

    /// Same as [`apply_slot`](Self::apply_slot).
    pub async fn push_slot(&self, slot_id: SlotId, options: ApplyOptions) -> Result<(), LocklyError> {
        self.apply_slot(slot_id, options).await
    }

    /// Queue an apply for every enabled slot without waiting.
    pub async fn apply_all(
        &self,
        targets: Option<Vec<String>>,
        dry_run: bool,
    ) -> Result<(), LocklyError> {
        let enabled: Vec<SlotId> = {
            let state = self.state.lock().await;
            state.slots.values().filter(|s| s.enabled).map(|s| s.id).collect()
        };
        let options = ApplyOptions {
            force_clear: false,
            targets,
            dry_run,
            wait_for_completion: false,
        };
        tracing::info!(count = enabled.len(), dry_run, "Applying all enabled slots");
        for slot_id in enabled {
            self.apply_slot(slot_id, options.clone()).await?;
        }
        Ok(())
    }

    /// Change stored slot fields.
    ///
    /// Enabling a slot, or changing the PIN of an enabled slot, requires a
    /// valid PIN. On violation the slot is left disabled, an
    /// [`LocklyEvent::InvalidPin`] is emitted and the call fails.
    pub async fn update_slot(&self, slot_id: SlotId, update: SlotUpdate) -> Result<(), LocklyError> {
        let result = {
            let mut state = self.state.lock().await;
            let slot = state
                .slots
                .get_mut(&slot_id)
                .ok_or(LocklyError::SlotNotFound(slot_id))?;

            if let Some(name) = update.name {
                slot.name = name;
            }
            let pin_changed = update.pin.is_some();
            if let Some(pin) = update.pin {
                slot.pin = pin;
            }
            let wants_enabled = update.enabled.unwrap_or(slot.enabled);
            let must_check = update.enabled == Some(true) || (pin_changed && wants_enabled);

            let result = if wants_enabled && must_check && !slot.has_valid_pin() {
                slot.enabled = false;
                Err(LocklyError::InvalidPin(slot_id))
            } else {
                slot.enabled = wants_enabled;
                Ok(())
            };
            tracing::debug!(
                slot_id,
                name = %slot.name,
                pin = redact_pin(&slot.pin),
                enabled = slot.enabled,
                "Slot updated",
            );
            result
        };

        self.save().await?;
        self.emit(LocklyEvent::SlotUpdated { slot_id });
        if result.is_err() {
            self.notify_invalid_pin(slot_id);
        }
        result
    }

    /// Snapshot of all slots for export. PINs are blanked unless requested.
    pub async fn export_slots(&self, include_pins: bool) -> Vec<SlotExport> {
        let state = self.state.lock().await;
        state
            .slots
            .values()
            .map(|s| SlotExport::from_slot(s, include_pins))
            .collect()
    }

    /// Import slots, replacing the table or merging into it.
    ///
    /// The whole batch is validated before anything changes.
    pub async fn import_slots(&self, items: Vec<SlotImport>, replace: bool) -> Result<(), LocklyError> {
        let fresh = slot::build_imported_slots(&items, self.config.slot_range())?;

        let (added, updated, removed) = {
            let mut state = self.state.lock().await;
            let before: HashSet<SlotId> = state.slots.keys().copied().collect();
            let incoming: HashSet<SlotId> = fresh.iter().map(|s| s.id).collect();

            let removed: Vec<SlotId> = if replace {
                let gone = before.iter().filter(|id| !incoming.contains(id)).copied().collect();
                state.slots.clear();
                gone
            } else {
                Vec::new()
            };

            let mut added = Vec::new();
            let mut updated = Vec::new();
            for slot in fresh {
                if before.contains(&slot.id) {
                    updated.push(slot.id);
                } else {
                    added.push(slot.id);
                }
                state.slots.insert(slot.id, slot);
            }
            (added, updated, removed)
        };

        self.save().await?;
        tracing::info!(
            added = added.len(),
            updated = updated.len(),
            removed = removed.len(),
            replace,
            "Slots imported",
        );
        for slot_id in removed {
            self.emit(LocklyEvent::SlotRemoved { slot_id });
        }
        for slot_id in added {
            self.emit(LocklyEvent::SlotAdded { slot_id });
        }
        for slot_id in updated {
            self.emit(LocklyEvent::SlotUpdated { slot_id });
        }
        Ok(())
    }

    /// Import from a JSON document of the form `{"slots": [...]}`.
    pub async fn import_slots_json(&self, raw: &str, replace: bool) -> Result<(), LocklyError> {
        let items = slot::parse_import_payload(raw)?;
        self.import_slots(items, replace).await
    }

    /// Clear and delete the given slots, or every slot when `ids` is `None`.
    ///
    /// Returns once every targeted slot finished.
    pub async fn wipe_slots(
        &self,
        ids: Option<Vec<SlotId>>,
        targets: Option<Vec<String>>,
        dry_run: bool,
    ) -> Result<(), LocklyError> {
        let ids: Vec<SlotId> = {
            let state = self.state.lock().await;
            match ids {
                Some(ids) => {
                    let mut seen = HashSet::new();
                    let mut wanted = Vec::new();
                    for id in ids {
                        if !state.slots.contains_key(&id) {
                            return Err(LocklyError::SlotNotFound(id));
                        }
                        if seen.insert(id) {
                            wanted.push(id);
                        }
                    }
                    wanted
                }
                None => state.slots.keys().copied().collect(),
            }
        };
        if ids.is_empty() {
            return Ok(());
        }

        let options = ApplyOptions {
            force_clear: true,
            targets,
            dry_run,
            wait_for_completion: true,
        };
        tracing::info!(count = ids.len(), dry_run, "Wiping slots");
        let mut waits = Vec::with_capacity(ids.len());
        for slot_id in ids {
            waits.push(self.enqueue_apply(slot_id, &options, true).await?);
        }
        join_all(waits).await;
        Ok(())
    }

    // ---- inbound device traffic ----

    /// Correlate an action-channel answer.
    ///
    /// With `explicit_slot` the answer completes that slot's request;
    /// otherwise it completes the oldest pending request of `device`.
    /// Returns `true` when a request was completed.
    pub async fn handle_action(&self, device: &str, action: &str, explicit_slot: Option<SlotId>) -> bool {
        let mut state = self.state.lock().await;
        let Some(slot_id) =
            state
                .correlator
                .dequeue(device, action, explicit_slot, AnswerChannel::Action)
        else {
            return false;
        };
        self.complete(state, device, slot_id, action).await;
        true
    }

    /// Correlate a state snapshot against the oldest pending request.
    pub async fn handle_state(&self, device: &str, snapshot: &StateSnapshot) -> bool {
        let mut state = self.state.lock().await;
        let Some((slot_id, action)) = state.correlator.match_state(device, snapshot) else {
            return false;
        };
        tracing::debug!(slot_id, device, action, "State snapshot matched pending slot");
        let Some(slot_id) =
            state
                .correlator
                .dequeue(device, action, Some(slot_id), AnswerChannel::State)
        else {
            return false;
        };
        self.complete(state, device, slot_id, action).await;
        true
    }

    /// Store an activity event and broadcast it.
    pub async fn record_activity(&self, event: ActivityEvent) {
        self.activity.append(event.clone()).await;
        self.emit(LocklyEvent::LockActivity(event));
    }

    /// Display name of a slot's holder, if set.
    pub async fn slot_user_name(&self, slot_id: SlotId) -> Option<String> {
        let state = self.state.lock().await;
        state
            .slots
            .get(&slot_id)
            .map(|s| s.name.clone())
            .filter(|n| !n.is_empty())
    }

    /// Cancel all workers and timers and flush the activity log.
    ///
    /// In-flight publishes are not awaited.
    pub async fn stop(&self) {
        tracing::info!(installation = %self.config.installation, "Stopping slot manager");
        self.cancel.cancel();
        self.dispatcher.stop();
        let worker = self
            .apply_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.task.abort();
        }
        {
            let mut state = self.state.lock().await;
            state.correlator.clear();
            state.fan_in.clear();
            state.publish_started.clear();
        }
        if let Err(e) = self.activity.flush().await {
            tracing::error!(error = %e, "Failed to flush activity log");
        }
        tracing::info!("Slot manager stopped");
    }

    // ---- private helpers ----

    /// Validate an apply request, mark the slot queued and submit its job.
    async fn enqueue_apply(
        &self,
        slot_id: SlotId,
        options: &ApplyOptions,
        remove_on_complete: bool,
    ) -> Result<oneshot::Receiver<()>, LocklyError> {
        let devices = self.resolve_devices(options.targets.as_deref());
        {
            let mut state = self.state.lock().await;
            if self.cancel.is_cancelled() {
                return Err(LocklyError::Stopped);
            }
            let slot = state
                .slots
                .get_mut(&slot_id)
                .ok_or(LocklyError::SlotNotFound(slot_id))?;
            if devices.is_empty() {
                return Err(LocklyError::NoLocksConfigured);
            }
            if !options.force_clear && slot.enabled && !slot.has_valid_pin() {
                self.notify_invalid_pin(slot_id);
                return Err(LocklyError::InvalidPin(slot_id));
            }
            slot.busy = true;
            slot.status = SlotStatus::Queued;
        }
        self.save().await?;
        self.emit(LocklyEvent::SlotUpdated { slot_id });

        tracing::debug!(
            slot_id,
            devices = ?devices,
            force_clear = options.force_clear,
            dry_run = options.dry_run,
            "Apply queued",
        );
        let (done, done_rx) = oneshot::channel();
        self.submit_job(SlotJob {
            slot_id,
            devices,
            force_clear: options.force_clear,
            dry_run: options.dry_run,
            remove_on_complete,
            done,
        });
        Ok(done_rx)
    }

    /// Hand a job to the apply worker, starting one if none is running.
    fn submit_job(&self, job: SlotJob) {
        if self.cancel.is_cancelled() {
            tracing::debug!(slot_id = job.slot_id, "Manager stopped, job dropped");
            return;
        }
        let mut worker = self
            .apply_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let alive = worker
            .as_ref()
            .is_some_and(|w| !w.task.is_finished() && !w.tx.is_closed());
        if !alive {
            let (tx, rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(run_apply_worker(
                self.weak_self.clone(),
                rx,
                self.cancel.child_token(),
            ));
            *worker = Some(ApplyWorker { tx, task });
        }
        if let Some(worker) = worker.as_ref() {
            if let Err(e) = worker.tx.send(job) {
                tracing::error!(slot_id = e.0.slot_id, "Apply queue closed, job dropped");
            }
        }
    }

    /// Start a job: fan the command out and return the fan-in signal.
    ///
    /// `None` means the job already finished (slot gone or dry run).
    async fn process_job(&self, job: &SlotJob) -> Option<oneshot::Receiver<()>> {
        let mut state = self.state.lock().await;
        if !state.slots.contains_key(&job.slot_id) {
            tracing::debug!(slot_id = job.slot_id, "Slot removed before its job ran");
            return None;
        }

        if job.dry_run {
            if let Some(slot) = state.slots.get_mut(&job.slot_id) {
                slot.busy = false;
                slot.status = SlotStatus::Idle;
                slot.record_response(SlotResponse::simulated(), Utc::now());
            }
            drop(state);
            tracing::info!(slot_id = job.slot_id, "Dry run, no commands sent");
            self.persist().await;
            self.emit(LocklyEvent::SlotUpdated { slot_id: job.slot_id });
            self.emit(LocklyEvent::ApplyFinished {
                slot_id: job.slot_id,
                timed_out: false,
            });
            if job.remove_on_complete {
                self.delete_slot(job.slot_id).await;
            }
            return None;
        }

        let command = state
            .slots
            .get(&job.slot_id)
            .map(|slot| PinCodeCommand::for_slot(slot, job.force_clear))?;

        let (fan_tx, fan_rx) = oneshot::channel();
        state.fan_in.insert(
            job.slot_id,
            FanIn {
                pending: job.devices.iter().cloned().collect(),
                done: Some(fan_tx),
                remove_on_complete: job.remove_on_complete,
                timed_out: false,
            },
        );
        state.publish_started.remove(&job.slot_id);
        for device in &job.devices {
            state.correlator.register(job.slot_id, device, command.clone());
        }
        drop(state);

        tracing::info!(
            slot_id = job.slot_id,
            devices = job.devices.len(),
            enable = command.is_enable(),
            "Applying slot",
        );
        for device in &job.devices {
            self.dispatcher.enqueue(
                device,
                QueuedCommand {
                    slot_id: job.slot_id,
                    command: command.clone(),
                },
            );
        }

        if self.config.skip_timeout {
            self.finalize_without_ack(job).await;
        }
        Some(fan_rx)
    }

    /// Close a job right after fan-out when acknowledgements are not awaited.
    async fn finalize_without_ack(&self, job: &SlotJob) {
        let finished = {
            let mut state = self.state.lock().await;
            let st = &mut *state;
            for device in &job.devices {
                st.correlator.take(&RequestKey::new(job.slot_id, device));
                st.correlator.forget_queued(device, job.slot_id);
            }
            if let Some(fan) = st.fan_in.get_mut(&job.slot_id) {
                fan.pending.clear();
            }
            st.take_finished(job.slot_id)
        };
        self.persist().await;
        self.emit(LocklyEvent::SlotUpdated { slot_id: job.slot_id });
        if let Some(fan) = finished {
            self.finish_fan_in(job.slot_id, fan).await;
        }
    }

    /// Record an answer for `(slot_id, device)` and close the fan-in when it
    /// was the last outstanding device.
    async fn complete(
        &self,
        mut state: MutexGuard<'_, ManagerState>,
        device: &str,
        slot_id: SlotId,
        action: &str,
    ) {
        let st = &mut *state;
        st.correlator.take(&RequestKey::new(slot_id, device));
        if let Some(fan) = st.fan_in.get_mut(&slot_id) {
            fan.pending.remove(device);
        }

        let status = slot::response_status_for_action(action);
        tracing::debug!(slot_id, device, action, status, "Lock answered");
        let recorded = match st.slots.get_mut(&slot_id) {
            Some(slot) => {
                slot.record_response(SlotResponse::acknowledged(device, action, status), Utc::now());
                true
            }
            None => {
                tracing::debug!(slot_id, "Ignoring answer for removed slot");
                false
            }
        };
        let finished = st.take_finished(slot_id);
        drop(state);

        if recorded {
            self.persist().await;
            self.emit(LocklyEvent::SlotUpdated { slot_id });
        }
        if let Some(fan) = finished {
            self.finish_fan_in(slot_id, fan).await;
        }
    }

    /// Announce a finished fan-in, perform a deferred deletion and release
    /// the apply worker.
    async fn finish_fan_in(&self, slot_id: SlotId, mut fan: FanIn) {
        tracing::info!(slot_id, timed_out = fan.timed_out, "Slot apply finished");
        self.emit(LocklyEvent::ApplyFinished {
            slot_id,
            timed_out: fan.timed_out,
        });
        if fan.remove_on_complete {
            self.delete_slot(slot_id).await;
        }
        if let Some(done) = fan.done.take() {
            let _ = done.send(());
        }
    }

    async fn delete_slot(&self, slot_id: SlotId) {
        let removed = self.state.lock().await.slots.remove(&slot_id).is_some();
        if removed {
            self.persist().await;
            tracing::info!(slot_id, "Slot removed");
            self.emit(LocklyEvent::SlotRemoved { slot_id });
        }
    }

    /// Spawn the timeout task for one publish attempt.
    fn spawn_timeout(&self, key: RequestKey, timer_id: u64) -> AbortHandle {
        let manager = self.weak_self.clone();
        let timeout = self.config.action_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = manager.upgrade() {
                manager.handle_timeout(key, timer_id).await;
            }
        })
        .abort_handle()
    }

    /// A device did not answer in time: retry, or give up on it.
    async fn handle_timeout(&self, key: RequestKey, timer_id: u64) {
        let mut state = self.state.lock().await;
        let st = &mut *state;
        if !st.correlator.claim_fired_timer(&key, timer_id) {
            return;
        }
        let Some(pending) = st.correlator.pending_mut(&key) else {
            return;
        };

        if pending.attempts < self.config.max_retries {
            pending.attempts += 1;
            let attempt = pending.attempts + 1;
            let command = pending.command.clone();
            drop(state);
            tracing::debug!(
                slot_id = key.slot_id,
                device = %key.device,
                attempt,
                max_attempts = self.config.max_retries + 1,
                "Retrying slot command",
            );
            self.dispatcher.enqueue(
                &key.device,
                QueuedCommand {
                    slot_id: key.slot_id,
                    command,
                },
            );
            return;
        }

        let attempts = pending.attempts + 1;
        st.correlator.take(&key);
        st.correlator.forget_queued(&key.device, key.slot_id);
        if let Some(fan) = st.fan_in.get_mut(&key.slot_id) {
            fan.pending.remove(&key.device);
            fan.timed_out = true;
        }
        let recorded = match st.slots.get_mut(&key.slot_id) {
            Some(slot) => {
                slot.status = SlotStatus::Timeout;
                slot.record_response(SlotResponse::timed_out(&key.device, attempts), Utc::now());
                true
            }
            None => false,
        };
        tracing::warn!(
            slot_id = key.slot_id,
            device = %key.device,
            attempts,
            "No response from lock, giving up",
        );
        let finished = st.take_finished(key.slot_id);
        drop(state);

        if recorded {
            self.persist().await;
            self.emit(LocklyEvent::SlotUpdated { slot_id: key.slot_id });
        }
        if let Some(fan) = finished {
            self.finish_fan_in(key.slot_id, fan).await;
        }
    }

    fn notify_invalid_pin(&self, slot_id: SlotId) {
        let message = LocklyError::InvalidPin(slot_id).to_string();
        tracing::warn!(slot_id, "{message}");
        self.emit(LocklyEvent::InvalidPin { slot_id, message });
    }

    fn emit(&self, event: LocklyEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    /// Write the slot table. The snapshot is taken under the save lock so
    /// concurrent saves land in order.
    async fn save(&self) -> Result<(), LocklyError> {
        let _guard = self.save_lock.lock().await;
        let snapshot: Vec<Slot> = self.state.lock().await.slots.values().cloned().collect();
        save_slots(self.store.as_ref(), &self.config.slots_key(), &snapshot).await?;
        Ok(())
    }

    /// [`save`](Self::save) for background paths, which only log failures.
    async fn persist(&self) {
        if let Err(e) = self.save().await {
            tracing::error!(error = %e, "Failed to persist slot table");
        }
    }
}

#[async_trait]
impl DispatchHandler for SlotManager {
    /// Arm the request timer, mark the slot updating on its first publish
    /// and publish the command.
    async fn dispatch(&self, device: &str, item: QueuedCommand) {
        let key = RequestKey::new(item.slot_id, device);
        let marked = {
            let mut state = self.state.lock().await;
            let st = &mut *state;
            if !self.config.skip_timeout && st.correlator.needs_timer(&key) {
                let timer_id = st.correlator.next_timer_id();
                let attempt = st.correlator.pending(&key).map_or(1, |p| p.attempts + 1);
                let handle = self.spawn_timeout(key.clone(), timer_id);
                st.correlator.set_timer(&key, timer_id, handle);
                tracing::debug!(
                    slot_id = item.slot_id,
                    device,
                    attempt,
                    timeout_secs = self.config.action_timeout.as_secs(),
                    "Action timer started",
                );
            }
            let first_publish =
                st.fan_in.contains_key(&item.slot_id) && st.publish_started.insert(item.slot_id);
            match st.slots.get_mut(&item.slot_id) {
                Some(slot) if first_publish => {
                    slot.status = SlotStatus::Updating;
                    true
                }
                _ => false,
            }
        };
        if marked {
            self.persist().await;
            self.emit(LocklyEvent::SlotUpdated {
                slot_id: item.slot_id,
            });
        }

        let topic = self.config.set_topic(device);
        tracing::debug!(topic = %topic, payload = %item.command.redacted().to_json(), "Publishing");
        match self
            .publisher
            .publish(&topic, &item.command.to_json(), COMMAND_QOS)
            .await
        {
            Ok(()) => tracing::debug!(topic = %topic, "Publish complete"),
            Err(e) => tracing::error!(
                slot_id = item.slot_id,
                device,
                error = %e,
                "Publish failed",
            ),
        }
    }
}

/// Drain apply jobs one at a time, waiting for each job's fan-in.
async fn run_apply_worker(
    manager: Weak<SlotManager>,
    mut rx: mpsc::UnboundedReceiver<SlotJob>,
    cancel: CancellationToken,
) {
    tracing::debug!("Apply worker started");
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let Some(m) = manager.upgrade() else {
            break;
        };
        let fan_in = m.process_job(&job).await;
        drop(m);

        if let Some(fan_in) = fan_in {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = fan_in => {}
            }
        }
        let _ = job.done.send(());
    }
    tracing::debug!("Apply worker exited");
}
