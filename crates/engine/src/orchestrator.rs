//! Coordinator for concurrent upload sessions.
//!
//! All session state lives in one task. Commands from callers and
//! completions from spawned transfers arrive over the same queue, so every
//! mutation is serialized and the rest of the crate never locks anything.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use partway_protocol::{
    CompletedUpload, PartOutcome, UploadEvent, UploadProgress, UploadSession, UploadState,
};
use partway_resume::{SessionStore, StoredSession};
use partway_staging::{SpoolDir, StagedSource, validate_session_id};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::authorizer::PartAuthorizer;
use crate::backend::{PartTransport, SessionBackend};
use crate::config::EngineConfig;
use crate::error::UploadError;
use crate::pump::{pump, PumpContext};
use crate::session::{Phase, SessionRuntime};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Everything that can land on the coordinator queue: caller commands plus
/// completions reported by spawned tasks.
pub(crate) enum Msg {
    Command(Command),
    SourceChecked {
        session_id: String,
        generation: u64,
        result: Result<u64, UploadError>,
    },
    PartDone {
        session_id: String,
        generation: u64,
        part_number: u32,
        result: Result<PartOutcome, UploadError>,
    },
    RetryDue {
        session_id: String,
        generation: u64,
        part_number: u32,
    },
    Reconciled {
        session_id: String,
        generation: u64,
        result: Result<Vec<PartOutcome>, UploadError>,
    },
    Finalized {
        session_id: String,
        generation: u64,
        result: Result<CompletedUpload, UploadError>,
    },
    FinalizeDue {
        session_id: String,
        generation: u64,
    },
}

pub(crate) enum Command {
    Start {
        session: UploadSession,
        source: StagedSource,
    },
    Pause {
        session_id: String,
    },
    Resume {
        session_id: String,
    },
    Cancel {
        session_id: String,
    },
    Rehydrate {
        record: StoredSession,
        source: StagedSource,
    },
    Recover {
        spool: SpoolDir,
        reply: oneshot::Sender<Vec<String>>,
    },
    Subscribe {
        reply: oneshot::Sender<(Vec<UploadProgress>, broadcast::Receiver<UploadEvent>)>,
    },
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Handle to the upload coordinator task.
///
/// Cheap to clone; all methods enqueue a command and return once the
/// coordinator has accepted it. Observers get state through [`subscribe`],
/// not through return values.
///
/// [`subscribe`]: UploadOrchestrator::subscribe
#[derive(Clone)]
pub struct UploadOrchestrator {
    tx: mpsc::Sender<Msg>,
    shutdown: CancellationToken,
}

impl UploadOrchestrator {
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn SessionBackend>,
        transport: Arc<dyn PartTransport>,
        store: Option<Arc<SessionStore>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let (events_tx, _) = broadcast::channel(config.limits.event_capacity);
        let shutdown = CancellationToken::new();

        let coordinator = Coordinator {
            pump_ctx: PumpContext {
                transport,
                msg_tx: tx.clone(),
                parts_per_session: config.limits.parts_per_session,
            },
            config,
            backend,
            store,
            sessions: HashMap::new(),
            waiting: VecDeque::new(),
            msg_tx: tx.clone(),
            events_tx,
            shutdown: shutdown.clone(),
            generations: 0,
        };
        tokio::spawn(coordinator.run(rx));

        Self { tx, shutdown }
    }

    /// Register a session and begin transferring as soon as a slot frees.
    pub async fn start(
        &self,
        session: UploadSession,
        source: StagedSource,
    ) -> Result<(), UploadError> {
        self.send(Command::Start { session, source }).await
    }

    /// Stop dispatching new parts; in-flight parts run to completion and
    /// their outcomes are kept.
    pub async fn pause(&self, session_id: &str) -> Result<(), UploadError> {
        self.send(Command::Pause {
            session_id: session_id.to_string(),
        })
        .await
    }

    /// Continue a paused or errored session.
    pub async fn resume(&self, session_id: &str) -> Result<(), UploadError> {
        self.send(Command::Resume {
            session_id: session_id.to_string(),
        })
        .await
    }

    /// Drop a session and purge its record and staged bytes.
    pub async fn cancel(&self, session_id: &str) -> Result<(), UploadError> {
        self.send(Command::Cancel {
            session_id: session_id.to_string(),
        })
        .await
    }

    /// Re-register a session from its persisted record. It comes back
    /// paused; [`resume`] reconciles with the backend and continues.
    ///
    /// [`resume`]: UploadOrchestrator::resume
    pub async fn rehydrate(
        &self,
        record: StoredSession,
        source: StagedSource,
    ) -> Result<(), UploadError> {
        self.send(Command::Rehydrate { record, source }).await
    }

    /// Scan the session store and rehydrate every record whose staged bytes
    /// survive in `spool`. Returns the ids that came back.
    pub async fn recover(&self, spool: &SpoolDir) -> Result<Vec<String>, UploadError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Recover {
            spool: spool.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| UploadError::Stopped)
    }

    /// Current progress of every registered session plus a live event feed.
    ///
    /// Snapshot and receiver are created together on the coordinator, so no
    /// event falls between them.
    pub async fn subscribe(
        &self,
    ) -> Result<(Vec<UploadProgress>, broadcast::Receiver<UploadEvent>), UploadError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe { reply }).await?;
        rx.await.map_err(|_| UploadError::Stopped)
    }

    /// Stop the coordinator and every pending retry timer.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn send(&self, command: Command) -> Result<(), UploadError> {
        self.tx
            .send(Msg::Command(command))
            .await
            .map_err(|_| UploadError::Stopped)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct Coordinator {
    config: EngineConfig,
    backend: Arc<dyn SessionBackend>,
    store: Option<Arc<SessionStore>>,
    sessions: HashMap<String, SessionRuntime>,
    /// FIFO of sessions that were ready while every slot was taken. Entries
    /// may be stale; phases are re-checked on promotion.
    waiting: VecDeque<String>,
    msg_tx: mpsc::Sender<Msg>,
    events_tx: broadcast::Sender<UploadEvent>,
    pump_ctx: PumpContext,
    shutdown: CancellationToken,
    generations: u64,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::Receiver<Msg>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.handle(msg).await;
                }
            }
        }
        debug!("upload coordinator stopped");
    }

    async fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Command(command) => self.handle_command(command).await,
            Msg::SourceChecked {
                session_id,
                generation,
                result,
            } => self.on_source_checked(session_id, generation, result).await,
            Msg::PartDone {
                session_id,
                generation,
                part_number,
                result,
            } => {
                self.on_part_done(session_id, generation, part_number, result)
                    .await
            }
            Msg::RetryDue {
                session_id,
                generation,
                part_number,
            } => self.on_retry_due(session_id, generation, part_number),
            Msg::Reconciled {
                session_id,
                generation,
                result,
            } => self.on_reconciled(session_id, generation, result).await,
            Msg::Finalized {
                session_id,
                generation,
                result,
            } => self.on_finalized(session_id, generation, result).await,
            Msg::FinalizeDue {
                session_id,
                generation,
            } => self.on_finalize_due(session_id, generation),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { session, source } => self.start_session(session, source).await,
            Command::Pause { session_id } => self.pause_session(&session_id).await,
            Command::Resume { session_id } => self.resume_session(&session_id).await,
            Command::Cancel { session_id } => self.cancel_session(&session_id).await,
            Command::Rehydrate { record, source } => {
                self.rehydrate_session(record, source).await
            }
            Command::Recover { spool, reply } => {
                let restored = self.recover_sessions(&spool).await;
                let _ = reply.send(restored);
            }
            Command::Subscribe { reply } => {
                let snapshot: Vec<UploadProgress> = self
                    .sessions
                    .values()
                    .map(SessionRuntime::progress)
                    .collect();
                let _ = reply.send((snapshot, self.events_tx.subscribe()));
            }
        }
    }

    // -- command handlers ---------------------------------------------------

    async fn start_session(&mut self, session: UploadSession, source: StagedSource) {
        let id = session.id.clone();
        if self.sessions.contains_key(&id) {
            warn!(session = %id, "ignoring start for a session already registered");
            return;
        }
        if let Err(err) = validate_session(&session) {
            warn!(session = %id, error = %err, "rejecting session");
            emit(
                &self.events_tx,
                UploadEvent::Error {
                    session_id: id,
                    error: err.to_string(),
                },
            );
            return;
        }

        let generation = self.next_generation();
        let authorizer = Arc::new(PartAuthorizer::new(
            self.backend.clone(),
            &session,
            self.config.authorizer.clone(),
        ));
        let runtime = SessionRuntime::new(
            session,
            source,
            authorizer,
            self.config.speed.clone(),
            generation,
        );
        info!(
            session = %id,
            size = runtime.session.size,
            parts = runtime.session.total_parts(),
            "session registered"
        );
        emit_progress(&self.events_tx, runtime.progress());
        spawn_source_check(&runtime, self.msg_tx.clone());
        self.sessions.insert(id, runtime);
    }

    async fn pause_session(&mut self, id: &str) {
        let Some(runtime) = self.sessions.get_mut(id) else {
            warn!(session = %id, "pause for unknown session");
            return;
        };
        match runtime.phase {
            Phase::Preparing | Phase::Waiting | Phase::Uploading | Phase::Reconciling => {
                let released = runtime.phase.occupies_slot();
                runtime.phase = Phase::Paused;
                runtime.speed.reset();
                info!(session = %id, "session paused");
                emit_progress(&self.events_tx, runtime.idle_progress(UploadState::Paused));
                persist(&self.store, runtime).await;
                if released {
                    self.promote_waiting().await;
                }
            }
            _ => debug!(session = %id, "pause ignored in current phase"),
        }
    }

    async fn resume_session(&mut self, id: &str) {
        {
            let Some(runtime) = self.sessions.get_mut(id) else {
                warn!(session = %id, "resume for unknown session");
                return;
            };
            match runtime.phase {
                Phase::Paused => {}
                Phase::Error { .. } => {
                    // An explicit resume grants a fresh retry budget.
                    runtime.tracker.clear_retries();
                }
                _ => {
                    debug!(session = %id, "resume ignored in current phase");
                    return;
                }
            }
        }
        info!(session = %id, "session resuming");
        self.admit(id).await;
    }

    async fn cancel_session(&mut self, id: &str) {
        let Some(runtime) = self.sessions.get(id) else {
            warn!(session = %id, "cancel for unknown session");
            return;
        };
        info!(session = %id, "session cancelled");
        emit_progress(
            &self.events_tx,
            runtime.idle_progress(UploadState::Cancelled),
        );
        self.remove_session(id).await;
        self.promote_waiting().await;
    }

    async fn rehydrate_session(&mut self, record: StoredSession, source: StagedSource) {
        let id = record.session.id.clone();
        if self.sessions.contains_key(&id) {
            warn!(session = %id, "ignoring rehydrate for a session already registered");
            return;
        }
        // A record can parse cleanly yet describe an upload no pump can run.
        if let Err(err) = validate_session(&record.session) {
            warn!(session = %id, error = %err, "purging unusable session record");
            if let Some(store) = &self.store {
                if let Err(remove_err) = store.remove(&id).await {
                    warn!(session = %id, error = %remove_err, "failed to remove session record");
                }
            }
            emit(
                &self.events_tx,
                UploadEvent::Error {
                    session_id: id,
                    error: err.to_string(),
                },
            );
            return;
        }
        let generation = self.next_generation();
        let authorizer = Arc::new(PartAuthorizer::new(
            self.backend.clone(),
            &record.session,
            self.config.authorizer.clone(),
        ));
        let runtime = SessionRuntime::rehydrated(
            record,
            source,
            authorizer,
            self.config.speed.clone(),
            generation,
        );
        info!(
            session = %id,
            bytes = runtime.bytes_uploaded,
            total = runtime.session.size,
            "session rehydrated, paused"
        );
        emit_progress(&self.events_tx, runtime.idle_progress(UploadState::Paused));
        self.sessions.insert(id, runtime);
    }

    async fn recover_sessions(&mut self, spool: &SpoolDir) -> Vec<String> {
        let Some(store) = self.store.clone() else {
            return Vec::new();
        };
        let records = match store.scan(spool).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "session store scan failed");
                return Vec::new();
            }
        };

        let mut restored = Vec::new();
        for record in records {
            let id = record.session.id.clone();
            if self.sessions.contains_key(&id) {
                continue;
            }
            let source = match spool.source_for(&id) {
                Ok(source) => source,
                Err(err) => {
                    warn!(session = %id, error = %err, "skipping record with unusable staging");
                    continue;
                }
            };
            self.rehydrate_session(record, source).await;
            if self.sessions.contains_key(&id) {
                restored.push(id);
            }
        }
        if !restored.is_empty() {
            info!(count = restored.len(), "recovered persisted sessions");
        }
        restored
    }

    // -- completion handlers ------------------------------------------------

    async fn on_source_checked(
        &mut self,
        id: String,
        generation: u64,
        result: Result<u64, UploadError>,
    ) {
        let expected = match self.sessions.get(&id) {
            Some(runtime) if runtime.generation == generation => runtime.session.size,
            _ => return,
        };
        match result {
            Ok(len) if len == expected => {
                let preparing = self
                    .sessions
                    .get(&id)
                    .is_some_and(|runtime| runtime.phase == Phase::Preparing);
                if preparing {
                    self.admit(&id).await;
                }
            }
            Ok(len) => {
                let err = UploadError::InvalidSession(format!(
                    "staged source is {len} bytes but the session expects {expected}"
                ));
                self.fail_session(&id, err).await;
            }
            Err(err) => self.fail_session(&id, err).await,
        }
    }

    async fn on_part_done(
        &mut self,
        id: String,
        generation: u64,
        part: u32,
        result: Result<PartOutcome, UploadError>,
    ) {
        let Some(runtime) = self.sessions.get_mut(&id) else {
            debug!(session = %id, part, "dropping completion for a forgotten session");
            return;
        };
        if runtime.generation != generation {
            return;
        }

        match result {
            Ok(outcome) => {
                let size = outcome.size;
                if runtime.tracker.complete(outcome.clone()) {
                    runtime.bytes_uploaded += size;
                    runtime.speed.record(size);
                    runtime.last_part = Some(outcome);
                    debug!(session = %id, part, bytes = runtime.bytes_uploaded, "part confirmed");
                    emit_progress(&self.events_tx, runtime.progress());
                    persist(&self.store, runtime).await;
                }
                if matches!(runtime.phase, Phase::Uploading) {
                    if runtime.tracker.is_complete() {
                        info!(session = %id, "all parts confirmed, finalizing");
                        begin_finalize(runtime, self.backend.clone(), self.msg_tx.clone());
                    } else {
                        pump(runtime, &self.pump_ctx);
                    }
                }
            }
            Err(err) => self.on_part_failed(&id, part, err).await,
        }
    }

    async fn on_part_failed(&mut self, id: &str, part: u32, err: UploadError) {
        let Some(runtime) = self.sessions.get_mut(id) else {
            return;
        };
        runtime.tracker.requeue(part);

        match err {
            UploadError::AuthorizationExpired => {
                debug!(session = %id, part, "authorization rejected, refreshing");
                runtime.authorizer.invalidate(part);
                if matches!(runtime.phase, Phase::Uploading) {
                    pump(runtime, &self.pump_ctx);
                }
            }
            err if err.is_retryable() => {
                let failures = runtime.tracker.record_failure(part);
                if failures <= self.config.retry.max_retries {
                    let delay = self.config.retry.delay_for_attempt(failures - 1);
                    warn!(
                        session = %id,
                        part,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "part failed, retrying"
                    );
                    schedule(
                        self.msg_tx.clone(),
                        self.shutdown.clone(),
                        delay,
                        Msg::RetryDue {
                            session_id: id.to_string(),
                            generation: runtime.generation,
                            part_number: part,
                        },
                    );
                } else {
                    let exhausted = UploadError::RetriesExhausted {
                        part,
                        attempts: failures,
                        message: err.to_string(),
                    };
                    self.fail_session(id, exhausted).await;
                }
            }
            UploadError::SessionNotFound(_) => {
                warn!(session = %id, "backend no longer knows this session, purging");
                self.purge_session(id, err).await;
            }
            err => self.fail_session(id, err).await,
        }
    }

    fn on_retry_due(&mut self, id: String, generation: u64, part: u32) {
        let Some(runtime) = self.sessions.get_mut(&id) else {
            return;
        };
        if runtime.generation != generation {
            return;
        }
        // Paused and errored sessions keep the part queued for their next
        // resume; the elapsed backoff is not owed again.
        if matches!(runtime.phase, Phase::Uploading) {
            debug!(session = %id, part, "retry due");
            pump(runtime, &self.pump_ctx);
        }
    }

    async fn on_reconciled(
        &mut self,
        id: String,
        generation: u64,
        result: Result<Vec<PartOutcome>, UploadError>,
    ) {
        let Some(runtime) = self.sessions.get_mut(&id) else {
            return;
        };
        if runtime.generation != generation {
            return;
        }

        match result {
            Ok(confirmed) => {
                runtime.needs_reconcile = false;
                let merged = runtime.tracker.absorb(confirmed);
                if merged > 0 {
                    runtime.bytes_uploaded += merged;
                    debug!(
                        session = %id,
                        bytes = merged,
                        "backend confirmed parts missing from the local record"
                    );
                }
                if matches!(runtime.phase, Phase::Reconciling) {
                    runtime.phase = Phase::Uploading;
                    emit_progress(&self.events_tx, runtime.progress());
                    persist(&self.store, runtime).await;
                    if runtime.tracker.is_complete() {
                        info!(session = %id, "all parts confirmed, finalizing");
                        begin_finalize(runtime, self.backend.clone(), self.msg_tx.clone());
                    } else {
                        pump(runtime, &self.pump_ctx);
                    }
                } else {
                    // Paused in the meantime; keep the merged state.
                    persist(&self.store, runtime).await;
                }
            }
            Err(err) => match err {
                UploadError::SessionNotFound(_)
                | UploadError::InvalidSession(_)
                | UploadError::Staging(_) => {
                    warn!(session = %id, error = %err, "session cannot be resumed, purging");
                    self.purge_session(&id, err).await;
                }
                err => self.fail_session(&id, err).await,
            },
        }
    }

    async fn on_finalized(
        &mut self,
        id: String,
        generation: u64,
        result: Result<CompletedUpload, UploadError>,
    ) {
        let Some(runtime) = self.sessions.get_mut(&id) else {
            return;
        };
        if runtime.generation != generation {
            return;
        }

        match result {
            Ok(completed) => {
                info!(session = %id, location = %completed.location, "upload completed");
                emit(
                    &self.events_tx,
                    UploadEvent::Complete {
                        progress: runtime.completion_progress(),
                    },
                );
                self.remove_session(&id).await;
                self.promote_waiting().await;
            }
            Err(err) => {
                let attempts = match runtime.phase {
                    Phase::Finalizing { attempts } => attempts + 1,
                    _ => 1,
                };
                match err {
                    UploadError::SessionNotFound(_) => {
                        warn!(session = %id, "backend no longer knows this session, purging");
                        self.purge_session(&id, err).await;
                    }
                    err if err.is_retryable() && attempts <= self.config.retry.max_retries => {
                        runtime.phase = Phase::Finalizing { attempts };
                        let delay = self.config.retry.delay_for_attempt(attempts - 1);
                        warn!(
                            session = %id,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "completion call failed, retrying"
                        );
                        schedule(
                            self.msg_tx.clone(),
                            self.shutdown.clone(),
                            delay,
                            Msg::FinalizeDue {
                                session_id: id.clone(),
                                generation,
                            },
                        );
                    }
                    err => self.fail_session(&id, err).await,
                }
            }
        }
    }

    fn on_finalize_due(&mut self, id: String, generation: u64) {
        let Some(runtime) = self.sessions.get_mut(&id) else {
            return;
        };
        if runtime.generation != generation {
            return;
        }
        if matches!(runtime.phase, Phase::Finalizing { .. }) {
            spawn_complete(runtime, self.backend.clone(), self.msg_tx.clone());
        }
    }

    // -- shared transitions -------------------------------------------------

    /// Grant the session a slot, or queue it when every slot is taken.
    async fn admit(&mut self, id: &str) {
        let used = self
            .sessions
            .values()
            .filter(|runtime| runtime.phase.occupies_slot())
            .count();
        if used >= self.config.limits.max_sessions {
            let Some(runtime) = self.sessions.get_mut(id) else {
                return;
            };
            runtime.phase = Phase::Waiting;
            debug!(session = %id, "waiting for a transfer slot");
            emit_progress(&self.events_tx, runtime.progress());
            self.waiting.push_back(id.to_string());
            return;
        }
        self.activate(id).await;
    }

    /// Move a session into its slot and set it running.
    async fn activate(&mut self, id: &str) {
        let Some(runtime) = self.sessions.get_mut(id) else {
            return;
        };
        if runtime.needs_reconcile {
            runtime.phase = Phase::Reconciling;
            emit_progress(&self.events_tx, runtime.progress());
            spawn_reconcile(runtime, self.backend.clone(), self.msg_tx.clone());
        } else {
            runtime.phase = Phase::Uploading;
            emit_progress(&self.events_tx, runtime.progress());
            persist(&self.store, runtime).await;
            if runtime.tracker.is_complete() {
                info!(session = %id, "all parts confirmed, finalizing");
                begin_finalize(runtime, self.backend.clone(), self.msg_tx.clone());
            } else {
                pump(runtime, &self.pump_ctx);
            }
        }
    }

    /// Hand freed slots to queued sessions in arrival order.
    async fn promote_waiting(&mut self) {
        loop {
            let used = self
                .sessions
                .values()
                .filter(|runtime| runtime.phase.occupies_slot())
                .count();
            if used >= self.config.limits.max_sessions {
                return;
            }
            let Some(next) = self.waiting.pop_front() else {
                return;
            };
            let eligible = self
                .sessions
                .get(&next)
                .is_some_and(|runtime| runtime.phase == Phase::Waiting);
            if eligible {
                debug!(session = %next, "transfer slot freed, promoting");
                self.activate(&next).await;
            }
        }
    }

    /// Park the session in the error state and free its slot.
    async fn fail_session(&mut self, id: &str, err: UploadError) {
        error!(session = %id, error = %err, "session failed");
        let message = err.to_string();
        {
            let Some(runtime) = self.sessions.get_mut(id) else {
                return;
            };
            runtime.phase = Phase::Error {
                message: message.clone(),
            };
            emit_progress(&self.events_tx, runtime.progress());
            emit(
                &self.events_tx,
                UploadEvent::Error {
                    session_id: id.to_string(),
                    error: message,
                },
            );
            persist(&self.store, runtime).await;
        }
        self.promote_waiting().await;
    }

    /// Drop the session entirely; nothing about it can be used again.
    async fn purge_session(&mut self, id: &str, err: UploadError) {
        if let Some(runtime) = self.sessions.get(id) {
            let mut progress = runtime.idle_progress(UploadState::Error);
            progress.error = Some(err.to_string());
            emit_progress(&self.events_tx, progress);
        }
        emit(
            &self.events_tx,
            UploadEvent::Error {
                session_id: id.to_string(),
                error: err.to_string(),
            },
        );
        self.remove_session(id).await;
        self.promote_waiting().await;
    }

    /// Forget the session and clean up its record and staged bytes. Late
    /// completions for it are dropped by the absent map entry.
    async fn remove_session(&mut self, id: &str) {
        let Some(runtime) = self.sessions.remove(id) else {
            return;
        };
        if let Some(store) = &self.store {
            if let Err(err) = store.remove(id).await {
                warn!(session = %id, error = %err, "failed to remove session record");
            }
        }
        if let Err(err) = runtime.source.remove().await {
            warn!(session = %id, error = %err, "failed to remove staged source");
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.generations += 1;
        self.generations
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate_session(session: &UploadSession) -> Result<(), UploadError> {
    validate_session_id(&session.id)
        .map_err(|err| UploadError::InvalidSession(err.to_string()))?;
    if session.part_size == 0 {
        return Err(UploadError::InvalidSession(
            "part size must be non-zero".into(),
        ));
    }
    Ok(())
}

fn emit(events: &broadcast::Sender<UploadEvent>, event: UploadEvent) {
    // Err just means nobody is subscribed right now.
    let _ = events.send(event);
}

fn emit_progress(events: &broadcast::Sender<UploadEvent>, progress: UploadProgress) {
    emit(events, UploadEvent::Progress { progress });
}

async fn persist(store: &Option<Arc<SessionStore>>, runtime: &SessionRuntime) {
    let Some(store) = store else { return };
    let record = StoredSession::new(
        runtime.session.clone(),
        runtime.progress(),
        runtime.tracker.outcomes(),
    );
    if let Err(err) = store.save(&record).await {
        warn!(session = %runtime.session.id, error = %err, "failed to persist session record");
    }
}

fn spawn_source_check(runtime: &SessionRuntime, msg_tx: mpsc::Sender<Msg>) {
    let session_id = runtime.session.id.clone();
    let generation = runtime.generation;
    let source = runtime.source.clone();
    tokio::spawn(async move {
        let result = source.len().await.map_err(UploadError::from);
        let _ = msg_tx
            .send(Msg::SourceChecked {
                session_id,
                generation,
                result,
            })
            .await;
    });
}

fn spawn_reconcile(
    runtime: &SessionRuntime,
    backend: Arc<dyn SessionBackend>,
    msg_tx: mpsc::Sender<Msg>,
) {
    let session_id = runtime.session.id.clone();
    let generation = runtime.generation;
    let expected = runtime.session.size;
    let source = runtime.source.clone();
    tokio::spawn(async move {
        let result = reconcile_with_backend(source, expected, backend, session_id.clone()).await;
        let _ = msg_tx
            .send(Msg::Reconciled {
                session_id,
                generation,
                result,
            })
            .await;
    });
}

/// Verify the staged bytes still match the session, then ask the backend
/// which parts it already holds.
async fn reconcile_with_backend(
    source: StagedSource,
    expected: u64,
    backend: Arc<dyn SessionBackend>,
    session_id: String,
) -> Result<Vec<PartOutcome>, UploadError> {
    let len = source.len().await?;
    if len != expected {
        return Err(UploadError::InvalidSession(format!(
            "staged source is {len} bytes but the session expects {expected}"
        )));
    }
    let status = backend.status(session_id).await?;
    Ok(status
        .parts
        .iter()
        .filter_map(|part| part.to_outcome())
        .collect())
}

fn begin_finalize(
    runtime: &mut SessionRuntime,
    backend: Arc<dyn SessionBackend>,
    msg_tx: mpsc::Sender<Msg>,
) {
    let attempts = match runtime.phase {
        Phase::Finalizing { attempts } => attempts,
        _ => 0,
    };
    runtime.phase = Phase::Finalizing { attempts };
    spawn_complete(runtime, backend, msg_tx);
}

fn spawn_complete(
    runtime: &SessionRuntime,
    backend: Arc<dyn SessionBackend>,
    msg_tx: mpsc::Sender<Msg>,
) {
    let session_id = runtime.session.id.clone();
    let generation = runtime.generation;
    let parts = runtime.tracker.outcomes();
    tokio::spawn(async move {
        let result = backend.complete(session_id.clone(), parts).await;
        let _ = msg_tx
            .send(Msg::Finalized {
                session_id,
                generation,
                result,
            })
            .await;
    });
}

/// Deliver `msg` after `delay`, unless the orchestrator shuts down first.
fn schedule(
    msg_tx: mpsc::Sender<Msg>,
    shutdown: CancellationToken,
    delay: Duration,
    msg: Msg,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                let _ = msg_tx.send(msg).await;
            }
        }
    });
}
