//! Per-conversation session: owns every piece of sync state for one open
//! project view and the timer tasks that drive it.

use std::{
    future::Future,
    sync::{Arc, Weak},
};

use anyhow::Context;
use chrono::Utc;
use shared::{
    domain::{CurrentUser, MessageId, ProjectId, TaskId},
    protocol::{CommentPatch, Message, RealtimeEvent, SubscriptionStatus, TypingBroadcast},
};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        Mutex,
    },
    task::JoinHandle,
    time::{interval, sleep, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::SyncSettings,
    error::SyncError,
    optimistic::{OptimisticTracker, OutgoingDraft, TransitionError},
    polling::{PollDecision, PollScheduler},
    realtime::{Conversation, IngestOutcome, RealtimeIngestion},
    send::{plan_units, upload_all, SendRequest, SendUnit, UploadFailure},
    store::{MergeReport, MessageStore},
    typing::{Typist, TypingPresence, TypingSignal},
    ClientEvent, CommentApi, IdentityProvider, RealtimeChannel,
};

pub struct Collaborators {
    pub api: Arc<dyn CommentApi>,
    pub realtime: Arc<dyn RealtimeChannel>,
    pub identity: Arc<dyn IdentityProvider>,
}

/// Background task aborted when the guard is dropped.
pub struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }

    fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// What happened to each logical unit of a send.
#[derive(Debug, Default)]
pub struct SendReport {
    /// Temporary ids in send order.
    pub temp_ids: Vec<MessageId>,
    /// Units the backend confirmed with an entity.
    pub confirmed: Vec<MessageId>,
    /// Units acknowledged without an entity; the fallback refetch settles them.
    pub acknowledged: Vec<MessageId>,
    /// Units rolled back after the backend rejected them.
    pub failed: Vec<MessageId>,
    pub upload_failures: Vec<UploadFailure>,
}

struct ConversationState {
    store: Option<MessageStore>,
    tracker: OptimisticTracker,
    ingestion: RealtimeIngestion,
    scheduler: PollScheduler,
    typing: TypingPresence,
    /// Bumped on every task switch so late poll results can be told apart.
    generation: u64,
    fallbacks: Vec<TaskGuard>,
}

impl ConversationState {
    fn active_task(&self) -> Option<TaskId> {
        self.store.as_ref().map(|store| store.task_id().clone())
    }

    /// Active task and the store revision a list fetched now reflects.
    fn fetch_point(&self) -> Option<(TaskId, u64)> {
        self.store
            .as_ref()
            .map(|store| (store.task_id().clone(), store.revision()))
    }
}

pub struct ConversationSession {
    api: Arc<dyn CommentApi>,
    realtime: Arc<dyn RealtimeChannel>,
    settings: SyncSettings,
    project_id: ProjectId,
    me: CurrentUser,
    inner: Mutex<ConversationState>,
    events: broadcast::Sender<ClientEvent>,
    tasks: Mutex<Vec<TaskGuard>>,
}

impl ConversationSession {
    /// Resolves the current user, subscribes to the project's realtime feed
    /// and starts the polling and typing timers. No task is active yet.
    pub async fn open(
        collaborators: Collaborators,
        project_id: ProjectId,
        known_tasks: Vec<TaskId>,
        settings: SyncSettings,
    ) -> anyhow::Result<Arc<Self>> {
        let me = collaborators
            .identity
            .current_user()
            .await
            .context("failed to resolve current user")?;
        let (events, _) = broadcast::channel(settings.event_capacity);
        let session = Arc::new(Self {
            api: collaborators.api,
            realtime: collaborators.realtime,
            project_id,
            me,
            inner: Mutex::new(ConversationState {
                store: None,
                tracker: OptimisticTracker::new(settings.match_window),
                ingestion: RealtimeIngestion::new(known_tasks),
                scheduler: PollScheduler::new(&settings),
                typing: TypingPresence::new(&settings),
                generation: 0,
                fallbacks: Vec::new(),
            }),
            settings,
            events,
            tasks: Mutex::new(Vec::new()),
        });
        session.start().await;
        info!(
            project_id = %session.project_id,
            user_id = %session.me.id,
            "session: opened"
        );
        Ok(session)
    }

    async fn start(self: &Arc<Self>) {
        let mut guards = Vec::with_capacity(3);

        match self.realtime.subscribe(&self.project_id).await {
            Ok(receiver) => {
                guards.push(TaskGuard::spawn(run_realtime(Arc::downgrade(self), receiver)));
            }
            Err(err) => {
                warn!(
                    project_id = %self.project_id,
                    error = %err,
                    "session: realtime subscribe failed, polling only"
                );
                self.ingest(RealtimeEvent::Status(SubscriptionStatus::Error))
                    .await;
            }
        }

        let weak = Arc::downgrade(self);
        let period = self.settings.scheduler_tick;
        guards.push(TaskGuard::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.poll_tick().await;
            }
        }));

        let weak = Arc::downgrade(self);
        let period = self.settings.typing_sweep;
        guards.push(TaskGuard::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.typing_tick().await;
            }
        }));

        self.tasks.lock().await.extend(guards);
    }

    /// Stops every timer and listener. Late network responses are dropped.
    pub async fn dispose(&self) {
        let guards = std::mem::take(&mut *self.tasks.lock().await);
        let signal = {
            let mut guard = self.inner.lock().await;
            guard.fallbacks.clear();
            guard.typing.clear_remote();
            let task_id = guard.active_task();
            guard.typing.stop_local().zip(task_id)
        };
        drop(guards);
        if let Some((signal, task_id)) = signal {
            self.broadcast_typing(task_id, signal).await;
        }
        info!(project_id = %self.project_id, "session: disposed");
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn current_user(&self) -> &CurrentUser {
        &self.me
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub async fn active_task(&self) -> Option<TaskId> {
        self.inner.lock().await.active_task()
    }

    pub async fn set_known_tasks(&self, tasks: Vec<TaskId>) {
        let mut guard = self.inner.lock().await;
        if let Some(active) = guard.active_task() {
            if !tasks.contains(&active) {
                warn!(task_id = %active, "session: active task left the known set");
            }
        }
        guard.ingestion.set_known_tasks(tasks);
    }

    /// Switches the conversation. Pending sends of the previous task are
    /// forgotten; in-flight calls are not cancelled.
    pub async fn select_task(&self, task_id: TaskId) -> Result<MergeReport, SyncError> {
        let stop = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let previous = state.active_task();
            if let Some(previous) = &previous {
                let dropped = state.tracker.clear_task(previous);
                if !dropped.is_empty() {
                    info!(
                        task_id = %previous,
                        dropped = dropped.len(),
                        "session: discarded pending sends of previous task"
                    );
                }
            }
            state.ingestion.add_known_task(task_id.clone());
            state.store = Some(MessageStore::new(
                task_id.clone(),
                self.settings.match_window,
            ));
            state.scheduler.reset();
            state.generation += 1;
            state.fallbacks.clear();
            state.typing.stop_local().zip(previous)
        };
        if let Some((signal, previous)) = stop {
            self.broadcast_typing(previous, signal).await;
        }
        info!(task_id = %task_id, "session: task selected");
        self.refresh().await
    }

    /// Full fetch and merge of the active task.
    pub async fn refresh(&self) -> Result<MergeReport, SyncError> {
        let ((task_id, fetched_at), generation) = {
            let guard = self.inner.lock().await;
            (
                guard.fetch_point().ok_or(SyncError::NoActiveTask)?,
                guard.generation,
            )
        };
        let list = self
            .api
            .list_comments(&task_id)
            .await
            .with_context(|| format!("failed to list comments of task {task_id}"))?;

        let mut guard = self.inner.lock().await;
        if guard.generation != generation {
            debug!(task_id = %task_id, "session: dropped refresh of previous task");
            return Ok(MergeReport::default());
        }
        Ok(self.merge_locked(&mut guard, list, fetched_at, false))
    }

    /// One scheduler step; runs a poll when the scheduler asks for one.
    pub async fn poll_tick(&self) {
        let (decision, fetch_point, generation) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let Some(fetch_point) = state.fetch_point() else {
                return;
            };
            let last = state.ingestion.last_event_at();
            (
                state.scheduler.tick(Instant::now(), last),
                fetch_point,
                state.generation,
            )
        };
        if decision == PollDecision::Poll {
            let (task_id, fetched_at) = fetch_point;
            self.run_poll(task_id, fetched_at, generation).await;
        }
    }

    /// Visibility of the view. Coming back with stale realtime polls at once.
    pub async fn set_visible(&self, visible: bool) {
        let (decision, fetch_point, generation) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let last = state.ingestion.last_event_at();
            let decision = state.scheduler.set_visible(visible, Instant::now(), last);
            (decision, state.fetch_point(), state.generation)
        };
        match (decision, fetch_point) {
            (PollDecision::Poll, Some((task_id, fetched_at))) => {
                self.run_poll(task_id, fetched_at, generation).await
            }
            (PollDecision::Poll, None) => {
                self.inner
                    .lock()
                    .await
                    .scheduler
                    .finish(Instant::now(), false);
            }
            _ => {}
        }
    }

    async fn run_poll(&self, task_id: TaskId, fetched_at: u64, generation: u64) {
        debug!(task_id = %task_id, "poll: fetching comments");
        let result = self.api.list_comments(&task_id).await;

        let mut guard = self.inner.lock().await;
        if guard.generation != generation {
            return;
        }
        match result {
            Ok(list) => {
                let report = self.merge_locked(&mut guard, list, fetched_at, true);
                let discovered = !report.discovered.is_empty();
                guard.scheduler.finish(Instant::now(), discovered);
            }
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "poll: fetch failed");
                guard.scheduler.finish(Instant::now(), false);
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("poll of task {task_id} failed: {err:#}")));
            }
        }
    }

    fn merge_locked(
        &self,
        state: &mut ConversationState,
        list: Vec<Message>,
        fetched_at: u64,
        notify: bool,
    ) -> MergeReport {
        let Some(store) = state.store.as_mut() else {
            return MergeReport::default();
        };
        let before = store.snapshot();
        let report = store.merge_fetched(list, fetched_at);
        for (temp_id, confirmed_id) in &report.reconciled {
            match state.tracker.resolve(temp_id) {
                Ok(_) | Err(TransitionError::Unknown(_)) => {}
                Err(err) => warn!(temp_id = %temp_id, error = %err, "merge: resolve failed"),
            }
            debug!(temp_id = %temp_id, message_id = %confirmed_id, "merge: own send confirmed");
        }
        if notify {
            let reconciled: Vec<&MessageId> = report.reconciled.iter().map(|(_, id)| id).collect();
            for id in &report.discovered {
                if reconciled.contains(&id) {
                    continue;
                }
                if let Some(message) = store.get(id) {
                    if !message.is_authored_by(&self.me.id) {
                        let _ = self.events.send(ClientEvent::RemoteMessage(message.clone()));
                    }
                }
            }
        }
        if store.snapshot() != before {
            let _ = self.events.send(ClientEvent::ConversationUpdated {
                task_id: store.task_id().clone(),
            });
        }
        debug!(
            task_id = %store.task_id(),
            discovered = report.discovered.len(),
            reconciled = report.reconciled.len(),
            dropped = report.dropped,
            "merge: applied"
        );
        report
    }

    async fn ingest(&self, event: RealtimeEvent) {
        let now = Instant::now();
        let wall = Utc::now();
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let outcome = match event {
            RealtimeEvent::Insert(row) => state.ingestion.on_insert(
                &row,
                Conversation {
                    store: state.store.as_mut(),
                    tracker: &mut state.tracker,
                    me: &self.me.id,
                },
                now,
                wall,
            ),
            RealtimeEvent::Update(row) => state.ingestion.on_update(
                &row,
                Conversation {
                    store: state.store.as_mut(),
                    tracker: &mut state.tracker,
                    me: &self.me.id,
                },
                now,
                wall,
            ),
            RealtimeEvent::Delete { id, task_id } => {
                state
                    .ingestion
                    .on_delete(&id, task_id.as_ref(), state.store.as_mut(), now)
            }
            RealtimeEvent::Typing(typing) => {
                if state.ingestion.is_known(&typing.task_id) {
                    state.ingestion.touch(now);
                    if state.typing.on_remote(&typing, now, &self.me.id) {
                        self.emit_typists(state);
                    }
                }
                return;
            }
            RealtimeEvent::Status(status) => {
                if state.ingestion.on_status(status, now) {
                    let _ = self.events.send(ClientEvent::RealtimeStatusChanged(status));
                }
                return;
            }
        };
        self.emit_outcome(state, outcome);
    }

    fn emit_outcome(&self, state: &ConversationState, outcome: IngestOutcome) {
        match &outcome {
            IngestOutcome::Activity {
                task_id,
                remote: true,
            } => {
                let _ = self.events.send(ClientEvent::RemoteActivity {
                    task_id: task_id.clone(),
                });
            }
            IngestOutcome::Inserted { id, remote: true } => {
                if let Some(message) = state.store.as_ref().and_then(|store| store.get(id)) {
                    let _ = self.events.send(ClientEvent::RemoteMessage(message.clone()));
                }
            }
            _ => {}
        }
        if outcome.changed_conversation() {
            if let Some(task_id) = state.active_task() {
                let _ = self.events.send(ClientEvent::ConversationUpdated { task_id });
            }
        }
    }

    fn emit_typists(&self, state: &ConversationState) {
        if let Some(task_id) = state.active_task() {
            let typists = state
                .typing
                .typists(&task_id)
                .into_iter()
                .map(|typist| typist.display_name)
                .collect();
            let _ = self.events.send(ClientEvent::TypingChanged { task_id, typists });
        }
    }

    /// Send pipeline: concurrent uploads, optimistic insertion of every
    /// unit, then one create call per unit with a fallback timer each.
    pub async fn send(self: &Arc<Self>, request: SendRequest) -> Result<SendReport, SyncError> {
        if request.is_empty() {
            return Err(SyncError::EmptySend);
        }
        let task_id = {
            let guard = self.inner.lock().await;
            let store = guard.store.as_ref().ok_or(SyncError::NoActiveTask)?;
            if let Some(parent_id) = &request.parent_id {
                let confirmed = store
                    .get(parent_id)
                    .is_some_and(|parent| !parent.is_temporary());
                if !confirmed {
                    return Err(SyncError::InvalidParent(
                        parent_id.clone(),
                        store.task_id().clone(),
                    ));
                }
            }
            store.task_id().clone()
        };

        let mut report = SendReport::default();
        let mut uploaded = Vec::new();
        if !request.attachments.is_empty() {
            let (ok, failures) = upload_all(self.api.as_ref(), &task_id, request.attachments).await;
            for failure in &failures {
                let _ = self.events.send(ClientEvent::UploadFailed {
                    filename: failure.attachment.filename.clone(),
                    reason: failure.reason.clone(),
                });
            }
            uploaded = ok;
            report.upload_failures = failures;
        }
        report.temp_ids = self
            .begin_units(
                &task_id,
                plan_units(&request.text, &uploaded),
                request.parent_id.as_ref(),
            )
            .await;

        for temp_id in &report.temp_ids {
            self.spawn_fallback(temp_id.clone()).await;
        }
        for temp_id in report.temp_ids.clone() {
            match self.create(&task_id, &temp_id).await {
                UnitResult::Confirmed(id) => report.confirmed.push(id),
                UnitResult::Acknowledged => report.acknowledged.push(temp_id),
                UnitResult::Failed => report.failed.push(temp_id),
            }
        }
        Ok(report)
    }

    async fn begin_units(
        &self,
        task_id: &TaskId,
        units: Vec<SendUnit>,
        parent_id: Option<&MessageId>,
    ) -> Vec<MessageId> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let mut temp_ids = Vec::with_capacity(units.len());
        for unit in units {
            let temp_id = state.tracker.begin(
                OutgoingDraft {
                    task_id: task_id.clone(),
                    kind: unit.kind,
                    body: unit.body,
                    attachment_url: unit.attachment_url,
                    parent_id: parent_id.cloned(),
                },
                &self.me,
                Utc::now(),
            );
            if let (Some(record), Some(store)) = (state.tracker.get(&temp_id), state.store.as_mut())
            {
                store.upsert(record.to_message());
            }
            debug!(task_id = %task_id, temp_id = %temp_id, "send: optimistic insert");
            temp_ids.push(temp_id);
        }
        if !temp_ids.is_empty() {
            let _ = self.events.send(ClientEvent::ConversationUpdated {
                task_id: task_id.clone(),
            });
        }
        temp_ids
    }

    async fn create(&self, task_id: &TaskId, temp_id: &MessageId) -> UnitResult {
        let request = {
            let mut guard = self.inner.lock().await;
            let Some(record) = guard.tracker.get(temp_id) else {
                return UnitResult::Failed;
            };
            let request = record.request();
            if let Err(err) = guard.tracker.mark_sending(temp_id) {
                warn!(temp_id = %temp_id, error = %err, "send: not pending anymore");
            }
            request
        };

        let result = self.api.create_comment(task_id, &request).await;

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        match result {
            Ok(Some(confirmed)) => {
                let id = confirmed.id.clone();
                match state.tracker.resolve(temp_id) {
                    Ok(_) | Err(TransitionError::Unknown(_)) => {}
                    Err(err) => warn!(temp_id = %temp_id, error = %err, "send: resolve failed"),
                }
                if let Some(store) = state.store.as_mut() {
                    store.replace_temp(temp_id, confirmed);
                }
                info!(task_id = %task_id, temp_id = %temp_id, message_id = %id, "send: confirmed");
                let _ = self.events.send(ClientEvent::ConversationUpdated {
                    task_id: task_id.clone(),
                });
                UnitResult::Confirmed(id)
            }
            Ok(None) => {
                debug!(temp_id = %temp_id, "send: acknowledged without entity");
                UnitResult::Acknowledged
            }
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(task_id = %task_id, temp_id = %temp_id, error = %reason, "send: create failed");
                // Realtime may already have confirmed it; only roll back a pending send.
                let Ok(record) = state.tracker.fail(temp_id, reason.clone()) else {
                    return UnitResult::Failed;
                };
                if let Some(store) = state.store.as_mut() {
                    store.remove(temp_id);
                }
                let _ = self.events.send(ClientEvent::SendFailed {
                    temp_id: temp_id.clone(),
                    body: record.body,
                    reason,
                });
                let _ = self.events.send(ClientEvent::ConversationUpdated {
                    task_id: task_id.clone(),
                });
                UnitResult::Failed
            }
        }
    }

    async fn spawn_fallback(self: &Arc<Self>, temp_id: MessageId) {
        let weak = Arc::downgrade(self);
        let delay = self.settings.send_fallback;
        let guard = TaskGuard::spawn(async move {
            sleep(delay).await;
            let Some(session) = weak.upgrade() else {
                return;
            };
            session.settle_stale_send(&temp_id).await;
        });
        let mut state = self.inner.lock().await;
        state.fallbacks.retain(|guard| !guard.is_finished());
        state.fallbacks.push(guard);
    }

    /// Last resort for a send nobody confirmed in time: one full refetch, and
    /// if that does not settle it either the optimistic entry stays visible.
    async fn settle_stale_send(&self, temp_id: &MessageId) {
        if !self.inner.lock().await.tracker.is_pending(temp_id) {
            return;
        }
        info!(temp_id = %temp_id, "send: still pending, forcing refetch");
        if let Err(err) = self.refresh().await {
            warn!(temp_id = %temp_id, error = %err, "send: fallback refetch failed");
            let _ = self
                .events
                .send(ClientEvent::Error(format!("refetch after send failed: {err}")));
        }
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if !state.tracker.is_pending(temp_id) {
            return;
        }
        if let Err(err) = state.tracker.resolve(temp_id) {
            warn!(temp_id = %temp_id, error = %err, "send: acknowledge failed");
        }
        let absorbed = state.store.as_mut().and_then(|store| {
            let confirmed_id = store.find_confirmed_match(temp_id)?;
            store
                .absorb_temp(temp_id, &confirmed_id)
                .then_some((store.task_id().clone(), confirmed_id))
        });
        match absorbed {
            Some((task_id, confirmed_id)) => {
                info!(
                    temp_id = %temp_id,
                    message_id = %confirmed_id,
                    "send: matched stored message after refetch"
                );
                let _ = self.events.send(ClientEvent::ConversationUpdated { task_id });
            }
            None => {
                info!(temp_id = %temp_id, "send: unmatched after refetch, keeping optimistic entry");
            }
        }
    }

    pub async fn edit(&self, id: &MessageId, body: &str) -> Result<(), SyncError> {
        let task_id = self.confirmed_target(id).await?;
        let updated = self
            .api
            .update_comment(&task_id, id, &CommentPatch::body(body))
            .await
            .with_context(|| format!("failed to edit comment {id}"))?;

        let mut guard = self.inner.lock().await;
        if let Some(store) = guard.store.as_mut().filter(|store| *store.task_id() == task_id) {
            match updated {
                Some(message) => {
                    store.upsert(message);
                }
                None => {
                    store.update(id, |message| {
                        message.body = body.to_string();
                        message.updated_at = Some(Utc::now());
                    });
                }
            }
            let _ = self.events.send(ClientEvent::ConversationUpdated { task_id });
        }
        Ok(())
    }

    /// Pins or unpins at once, reverting if the backend refuses.
    pub async fn set_pinned(&self, id: &MessageId, pinned: bool) -> Result<(), SyncError> {
        let task_id = self.confirmed_target(id).await?;
        let previous = {
            let mut guard = self.inner.lock().await;
            let mut previous = None;
            if let Some(store) = guard.store.as_mut() {
                store.update(id, |message| {
                    previous = Some(message.pinned);
                    message.pinned = pinned;
                });
            }
            previous
        };
        self.notify_updated(&task_id);

        let result = self
            .api
            .update_comment(&task_id, id, &CommentPatch::pinned(pinned))
            .await;

        let mut guard = self.inner.lock().await;
        let store = guard
            .store
            .as_mut()
            .filter(|store| *store.task_id() == task_id);
        match result {
            Ok(updated) => {
                if let (Some(store), Some(message)) = (store, updated) {
                    store.upsert(message);
                }
                Ok(())
            }
            Err(err) => {
                if let (Some(store), Some(previous)) = (store, previous) {
                    store.update(id, |message| message.pinned = previous);
                }
                drop(guard);
                warn!(message_id = %id, error = %err, "session: pin rejected, reverted");
                self.notify_updated(&task_id);
                Err(SyncError::Api(
                    err.context(format!("failed to update pin of comment {id}")),
                ))
            }
        }
    }

    /// Removes at once and restores the message if the backend refuses. A
    /// temporary message is only dropped locally.
    pub async fn delete(&self, id: &MessageId) -> Result<(), SyncError> {
        let (task_id, removed) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let store = state.store.as_mut().ok_or(SyncError::NoActiveTask)?;
            let task_id = store.task_id().clone();
            let removed = store
                .remove(id)
                .ok_or_else(|| SyncError::UnknownMessage(id.clone()))?;
            if removed.is_temporary() {
                let _ = state.tracker.fail(id, "discarded locally");
                drop(guard);
                self.notify_updated(&task_id);
                return Ok(());
            }
            (task_id, removed)
        };
        self.notify_updated(&task_id);

        if let Err(err) = self.api.delete_comment(&task_id, id).await {
            warn!(message_id = %id, error = %err, "session: delete rejected, restored");
            let mut guard = self.inner.lock().await;
            if let Some(store) = guard
                .store
                .as_mut()
                .filter(|store| *store.task_id() == task_id)
            {
                store.upsert(removed);
            }
            drop(guard);
            self.notify_updated(&task_id);
            return Err(SyncError::Api(
                err.context(format!("failed to delete comment {id}")),
            ));
        }
        info!(task_id = %task_id, message_id = %id, "session: comment deleted");
        Ok(())
    }

    async fn confirmed_target(&self, id: &MessageId) -> Result<TaskId, SyncError> {
        let guard = self.inner.lock().await;
        let store = guard.store.as_ref().ok_or(SyncError::NoActiveTask)?;
        let message = store
            .get(id)
            .ok_or_else(|| SyncError::UnknownMessage(id.clone()))?;
        if message.is_temporary() {
            return Err(SyncError::Unconfirmed(id.clone()));
        }
        Ok(store.task_id().clone())
    }

    fn notify_updated(&self, task_id: &TaskId) {
        let _ = self.events.send(ClientEvent::ConversationUpdated {
            task_id: task_id.clone(),
        });
    }

    /// Local input changed; broadcasts typing state when due.
    pub async fn on_input_changed(&self, text: &str) {
        let signal = {
            let mut guard = self.inner.lock().await;
            let Some(task_id) = guard.active_task() else {
                return;
            };
            guard
                .typing
                .on_input(Instant::now(), text.trim().is_empty())
                .map(|signal| (signal, task_id))
        };
        if let Some((signal, task_id)) = signal {
            self.broadcast_typing(task_id, signal).await;
        }
    }

    async fn typing_tick(&self) {
        let now = Instant::now();
        let stop = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let evicted = state.typing.sweep(now);
            if !evicted.is_empty() {
                debug!(evicted = evicted.len(), "typing: expired remote typists");
                self.emit_typists(state);
            }
            state.typing.poll_idle(now).zip(state.active_task())
        };
        if let Some((signal, task_id)) = stop {
            self.broadcast_typing(task_id, signal).await;
        }
    }

    async fn broadcast_typing(&self, task_id: TaskId, signal: TypingSignal) {
        let typing = TypingBroadcast {
            user_id: self.me.id.clone(),
            display_name: self.me.display_name.clone(),
            task_id,
            is_typing: signal.is_typing(),
        };
        if let Err(err) = self.realtime.broadcast_typing(&self.project_id, &typing).await {
            debug!(error = %err, "typing: broadcast failed");
        }
    }

    pub async fn snapshot(&self) -> Vec<Message> {
        let guard = self.inner.lock().await;
        guard
            .store
            .as_ref()
            .map(MessageStore::snapshot)
            .unwrap_or_default()
    }

    pub async fn replies(&self, parent_id: &MessageId) -> Vec<Message> {
        let guard = self.inner.lock().await;
        guard
            .store
            .as_ref()
            .map(|store| store.replies(parent_id).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn pinned(&self) -> Vec<Message> {
        let guard = self.inner.lock().await;
        guard
            .store
            .as_ref()
            .map(|store| store.pinned().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remote users typing in the active task.
    pub async fn typists(&self) -> Vec<Typist> {
        let guard = self.inner.lock().await;
        match guard.active_task() {
            Some(task_id) => guard.typing.typists(&task_id),
            None => Vec::new(),
        }
    }

    pub async fn pending_sends(&self) -> usize {
        self.inner.lock().await.tracker.pending_count()
    }

    pub async fn poll_interval(&self) -> std::time::Duration {
        self.inner.lock().await.scheduler.interval()
    }

    pub async fn poll_state(&self) -> crate::polling::PollState {
        self.inner.lock().await.scheduler.state()
    }
}

enum UnitResult {
    Confirmed(MessageId),
    Acknowledged,
    Failed,
}

async fn run_realtime(
    weak: Weak<ConversationSession>,
    mut receiver: broadcast::Receiver<RealtimeEvent>,
) {
    loop {
        let event = match receiver.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "realtime: listener lagged, polling covers the gap");
                continue;
            }
            Err(RecvError::Closed) => {
                if let Some(session) = weak.upgrade() {
                    session
                        .ingest(RealtimeEvent::Status(SubscriptionStatus::Closed))
                        .await;
                }
                break;
            }
        };
        let Some(session) = weak.upgrade() else {
            break;
        };
        session.ingest(event).await;
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
