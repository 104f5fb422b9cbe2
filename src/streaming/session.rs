//! Streaming session state machine
//!
//! One `SessionRunner` task per tuner/preview session drives the whole
//! lifecycle: resolve upstream → create fan-out hub → spawn supervisor →
//! wait for first byte → ACTIVE, with the resilience ladder turning
//! classified failures into reconnects, renewals, recreates, or the final
//! ENDED. Exactly one supervisor is attached at any instant; restarts
//! replace it atomically inside this single task.
//!
//! `StreamingEngine` is the facade the HTTP surface talks to: it owns the
//! registry, resolver and supervisor factory, opens sessions, and hands
//! out fan-out subscriptions.

use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::ChannelCatalog;
use crate::config::Config;
use crate::errors::{StreamingError, StreamingResult};
use crate::models::{SessionState, Stream};
use crate::streaming::client_class::Classification;
use crate::streaming::fanout::{FanoutConfig, FanoutHub, JoinPolicy, LagPolicy, Subscription};
use crate::streaming::registry::{
    ActivityKind, ClientIdentity, SessionKind, SessionRecord, SessionRegistry,
};
use crate::streaming::resilience::{RecoveryAction, RecoveryTrigger, ResilienceController};
use crate::streaming::resolver::{QualityPreference, UpstreamResolver};
use crate::streaming::stderr_classifier::StderrErrorKind;
use crate::streaming::supervisor::{SupervisedProcess, Supervisor, SupervisorEvent};
use crate::utils::UrlUtils;

/// Everything a runner needs beyond the shared engine pieces.
#[derive(Clone)]
pub struct SessionParams {
    pub stream: Stream,
    pub template: Vec<String>,
    pub quality: QualityPreference,
    pub resilience_enabled: bool,
    /// Zero-subscriber grace before the session closes itself
    pub idle_grace: Duration,
}

struct RunnerTimeouts {
    startup_deadline: Duration,
    stall_deadline: Duration,
    drain_deadline: Duration,
    stop_grace: Duration,
}

enum PumpOutcome {
    /// A recovery trigger fired; the supervisor has been stopped
    Failed(RecoveryTrigger),
    /// Preemptive renewal timer fired; restart with cache bypass
    Renew,
    /// Close requested (registry, idle timeout, shutdown)
    Drain,
    /// STARTING and the first byte never came
    StartupTimedOut,
}

/// The per-session task. Owns the supervisor, feeds the hub, applies
/// recovery policy.
pub struct SessionRunner {
    record: Arc<SessionRecord>,
    registry: Arc<SessionRegistry>,
    resolver: Arc<UpstreamResolver>,
    supervisor: Supervisor,
    params: SessionParams,
    timeouts: RunnerTimeouts,
    controller: ResilienceController,
    hub: Arc<FanoutHub>,
    ring_capacity: usize,
}

impl SessionRunner {
    /// Spawn the runner task for a freshly opened record.
    pub fn spawn(
        record: Arc<SessionRecord>,
        registry: Arc<SessionRegistry>,
        resolver: Arc<UpstreamResolver>,
        supervisor: Supervisor,
        config: &Config,
        params: SessionParams,
    ) {
        let hub = FanoutHub::new(FanoutConfig {
            capacity_bytes: config.streaming.ring_buffer_bytes,
        });
        let runner = SessionRunner {
            record,
            registry,
            resolver,
            supervisor,
            params,
            timeouts: RunnerTimeouts {
                startup_deadline: config.streaming.startup_deadline,
                stall_deadline: config.streaming.stall_deadline,
                drain_deadline: config.streaming.drain_deadline,
                stop_grace: config.streaming.stop_grace,
            },
            controller: ResilienceController::new(config.resilience.clone()),
            hub,
            ring_capacity: config.streaming.ring_buffer_bytes,
        };
        tokio::spawn(async move {
            runner.run().await;
        });
    }

    async fn run(mut self) {
        self.record.attach_hub(self.hub.clone()).await;

        let mut bypass_cache = false;
        let mut candidate_index = 0usize;
        let mut first_spawn = true;

        let end_reason: String = 'lifecycle: loop {
            if self.record.close_token.is_cancelled() {
                break "closed".to_string();
            }

            // Resolve the current candidate URL (primary or a backup).
            let candidates: Vec<String> = self
                .params
                .stream
                .candidate_urls()
                .map(str::to_string)
                .collect();
            let candidate = &candidates[candidate_index % candidates.len()];
            let resolved = self
                .resolver
                .resolve_url(candidate, &self.params.stream, self.params.quality, bypass_cache)
                .await;

            {
                let mut url = self.record.upstream_url.write().await;
                *url = resolved.url.clone();
            }
            if bypass_cache {
                *self.record.last_upstream_renewal_at.write().await = Some(chrono::Utc::now());
            }

            // Spawn the supervisor. A spawn failure is fatal to this
            // invocation; the ladder decides whether the session survives.
            let process = match self
                .supervisor
                .spawn(&self.params.template, &resolved.url, &[])
                .await
            {
                Ok(process) => process,
                Err(e) => {
                    error!(
                        session_id = %self.record.session_id,
                        error = %e,
                        "supervisor spawn failed"
                    );
                    if self.record.state() == SessionState::Starting {
                        break "spawn_failed".to_string();
                    }
                    match self
                        .next_action(RecoveryTrigger::ProcessExited { code: None })
                        .await
                    {
                        RecoveryStep::Continue {
                            renew,
                            rotate_backup,
                        } => {
                            bypass_cache = renew;
                            if rotate_backup {
                                candidate_index += 1;
                                self.recreate_hub().await;
                            }
                            continue 'lifecycle;
                        }
                        RecoveryStep::GiveUp => break "unrecoverable".to_string(),
                    }
                }
            };

            self.record
                .supervisor_pid
                .store(process.pid(), Ordering::Relaxed);
            *self.record.last_supervisor_start_at.write().await = Some(chrono::Utc::now());
            if !first_spawn {
                self.record.supervisor_restarts.fetch_add(1, Ordering::Relaxed);
            }
            first_spawn = false;

            // Pump until something happens.
            let outcome = self.pump(process).await;
            self.record.supervisor_pid.store(0, Ordering::Relaxed);

            match outcome {
                PumpOutcome::Drain => break self.drain_reason().await,
                PumpOutcome::StartupTimedOut => {
                    warn!(
                        session_id = %self.record.session_id,
                        deadline = ?self.timeouts.startup_deadline,
                        "no first byte within startup deadline"
                    );
                    break "startup_timeout".to_string();
                }
                PumpOutcome::Renew => {
                    self.record.url_renewals.fetch_add(1, Ordering::Relaxed);
                    bypass_cache = true;
                    continue 'lifecycle;
                }
                PumpOutcome::Failed(trigger) => {
                    if !self.params.resilience_enabled {
                        break "upstream_failed".to_string();
                    }
                    if self.record.state() == SessionState::Active {
                        let _ = self.record.set_state(SessionState::Recovering).await;
                        self.controller.note_inactive();
                    }
                    match self.next_action(trigger).await {
                        RecoveryStep::Continue {
                            renew,
                            rotate_backup,
                        } => {
                            bypass_cache = renew;
                            if rotate_backup {
                                candidate_index += 1;
                                self.recreate_hub().await;
                            }
                            continue 'lifecycle;
                        }
                        RecoveryStep::GiveUp => break "unrecoverable".to_string(),
                    }
                }
            }
        };

        self.finish(&end_reason).await;
    }

    /// Run the ladder for one trigger, sleep out its (jittered) delay,
    /// and translate the action into what the lifecycle loop does next.
    /// The session holds no supervisor while the sleep runs.
    async fn next_action(&mut self, trigger: RecoveryTrigger) -> RecoveryStep {
        self.record
            .consecutive_failures
            .fetch_add(1, Ordering::Relaxed);
        let action = self.controller.on_failure(trigger);
        self.record
            .escalated
            .store(self.controller.is_escalated(), Ordering::Relaxed);

        let (delay, step) = match action {
            RecoveryAction::Reconnect { delay } => {
                self.record.inband_reconnects.fetch_add(1, Ordering::Relaxed);
                info!(
                    session_id = %self.record.session_id,
                    ?trigger,
                    ?delay,
                    "recovery: in-band reconnect"
                );
                (
                    delay,
                    RecoveryStep::Continue {
                        renew: false,
                        rotate_backup: false,
                    },
                )
            }
            RecoveryAction::RestartWithRenewal { delay } => {
                self.record.url_renewals.fetch_add(1, Ordering::Relaxed);
                info!(
                    session_id = %self.record.session_id,
                    ?trigger,
                    ?delay,
                    "recovery: restart with URL renewal"
                );
                (
                    delay,
                    RecoveryStep::Continue {
                        renew: true,
                        rotate_backup: false,
                    },
                )
            }
            RecoveryAction::RecreateSession { delay } => {
                info!(
                    session_id = %self.record.session_id,
                    ?trigger,
                    ?delay,
                    "recovery: session recreate (identity preserved)"
                );
                (
                    delay,
                    RecoveryStep::Continue {
                        renew: true,
                        rotate_backup: true,
                    },
                )
            }
            RecoveryAction::Fail => {
                warn!(session_id = %self.record.session_id, ?trigger, "recovery ladder exhausted");
                return RecoveryStep::GiveUp;
            }
        };

        let jitter: f64 = rand::rng().random_range(0.9..1.1);
        tokio::select! {
            _ = tokio::time::sleep(delay.mul_f64(jitter)) => step,
            _ = self.record.close_token.cancelled() => RecoveryStep::GiveUp,
        }
    }

    /// Swap in a fresh fan-out hub for a Layer-3 recreate: existing
    /// subscribers see their stream end and reconnect through the same
    /// session identity, landing on the new hub.
    async fn recreate_hub(&mut self) {
        self.hub.close().await;
        self.hub = FanoutHub::new(FanoutConfig {
            capacity_bytes: self.ring_capacity,
        });
        self.record.attach_hub(self.hub.clone()).await;
    }

    async fn drain_reason(&self) -> String {
        self.record
            .end_reason()
            .await
            .unwrap_or_else(|| "closed".to_string())
    }

    /// The pump loop: forwards stdout chunks into the hub, watches
    /// classified events, and enforces the startup, stall and idle
    /// deadlines.
    async fn pump(&mut self, mut process: SupervisedProcess) -> PumpOutcome {
        let mut last_byte = Instant::now();
        let mut got_first_byte = false;
        let startup_deadline = Instant::now() + self.timeouts.startup_deadline;
        let renewal_at = Instant::now() + self.controller.preemptive_renewal_interval();
        let mut idle_since: Option<Instant> = None;
        let mut idle_ticker = tokio::time::interval(Duration::from_secs(1));
        idle_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let outcome = loop {
            let (bytes_rx, events_rx) = process.split_channels();
            tokio::select! {
                _ = self.record.close_token.cancelled() => {
                    break PumpOutcome::Drain;
                }

                chunk = bytes_rx.recv() => match chunk {
                    Some(chunk) => {
                        last_byte = Instant::now();
                        if !got_first_byte {
                            got_first_byte = true;
                            self.on_first_byte().await;
                        }
                        self.hub.publish(chunk).await;
                    }
                    None => {
                        // Stdout drained; the Exited event carries the verdict.
                        let trigger = self.await_exit(events_rx).await;
                        break PumpOutcome::Failed(trigger);
                    }
                },

                event = events_rx.recv() => match event {
                    Some(SupervisorEvent::ClassifiedError { kind, text }) => {
                        if is_recovery_kind(kind) {
                            debug!(
                                session_id = %self.record.session_id,
                                %kind,
                                "classified error triggers recovery"
                            );
                            break PumpOutcome::Failed(RecoveryTrigger::Classified(kind));
                        } else {
                            debug!(
                                session_id = %self.record.session_id,
                                %kind,
                                text = %text,
                                "classified error (non-recoverable kind), logged only"
                            );
                        }
                    }
                    Some(SupervisorEvent::Exited { code, failed_to_start, .. }) => {
                        if failed_to_start && self.record.state() == SessionState::Starting {
                            break PumpOutcome::StartupTimedOut;
                        }
                        break PumpOutcome::Failed(RecoveryTrigger::ProcessExited { code });
                    }
                    Some(_) => {}
                    None => {
                        // Event channel closed without Exited; treat as death.
                        break PumpOutcome::Failed(RecoveryTrigger::ProcessExited { code: None });
                    }
                },

                _ = tokio::time::sleep_until(startup_deadline), if !got_first_byte => {
                    if self.record.state() == SessionState::Starting {
                        break PumpOutcome::StartupTimedOut;
                    }
                    break PumpOutcome::Failed(RecoveryTrigger::Stall);
                }

                _ = tokio::time::sleep_until(last_byte + self.timeouts.stall_deadline), if got_first_byte => {
                    warn!(
                        session_id = %self.record.session_id,
                        deadline = ?self.timeouts.stall_deadline,
                        "no producer bytes within stall deadline"
                    );
                    break PumpOutcome::Failed(RecoveryTrigger::Stall);
                }

                _ = tokio::time::sleep_until(renewal_at), if got_first_byte => {
                    info!(
                        session_id = %self.record.session_id,
                        "preemptive upstream renewal"
                    );
                    break PumpOutcome::Renew;
                }

                _ = idle_ticker.tick() => {
                    let subscribers = self.hub.subscriber_count().await;
                    if subscribers == 0 {
                        let since = idle_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= self.params.idle_grace {
                            info!(
                                session_id = %self.record.session_id,
                                grace = ?self.params.idle_grace,
                                "no subscribers past idle grace, closing session"
                            );
                            self.record.set_end_reason("idle").await;
                            break PumpOutcome::Drain;
                        }
                    } else {
                        idle_since = None;
                    }
                }
            }
        };

        // Whatever happens next, this invocation's supervisor goes away
        // first: restarts replace it atomically.
        process.stop(self.timeouts.stop_grace).await;
        outcome
    }

    async fn on_first_byte(&mut self) {
        let state = self.record.state();
        if matches!(state, SessionState::Starting | SessionState::Recovering) {
            let _ = self.record.set_state(SessionState::Active).await;
            self.controller.note_active();
            self.record.escalated.store(false, Ordering::Relaxed);
            self.record.consecutive_failures.store(0, Ordering::Relaxed);
            self.record.touch_activity(ActivityKind::BytesForwarded).await;
            info!(session_id = %self.record.session_id, "session active");
        }
    }

    /// Stdout closed; pull events until `Exited` to learn the verdict.
    async fn await_exit(
        &self,
        events_rx: &mut tokio::sync::mpsc::UnboundedReceiver<SupervisorEvent>,
    ) -> RecoveryTrigger {
        let mut classified: Option<StderrErrorKind> = None;
        while let Some(event) = events_rx.recv().await {
            match event {
                SupervisorEvent::ClassifiedError { kind, .. } => {
                    if is_recovery_kind(kind) {
                        classified = Some(kind);
                    }
                }
                SupervisorEvent::Exited { code, .. } => {
                    return match classified {
                        Some(kind) => RecoveryTrigger::Classified(kind),
                        None => RecoveryTrigger::ProcessExited { code },
                    };
                }
                _ => {}
            }
        }
        RecoveryTrigger::ProcessExited { code: None }
    }

    /// DRAINING → ENDED with registry bookkeeping.
    async fn finish(self, reason: &str) {
        let _ = self.record.set_state(SessionState::Draining).await;
        self.record.set_end_reason(reason).await;
        self.hub.close().await;

        // Wait for subscribers to detach, bounded by the force-close
        // deadline.
        let deadline = Instant::now() + self.timeouts.drain_deadline;
        while self.hub.subscriber_count().await > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let _ = self.record.set_state(SessionState::Ended).await;
        self.registry.on_session_ended(&self.record).await;
    }
}

enum RecoveryStep {
    Continue { renew: bool, rotate_backup: bool },
    GiveUp,
}

/// Classified kinds that move ACTIVE → RECOVERING; the rest are logged.
fn is_recovery_kind(kind: StderrErrorKind) -> bool {
    matches!(
        kind,
        StderrErrorKind::NetworkTimeout
            | StderrErrorKind::Http5xx
            | StderrErrorKind::PeerReset
            | StderrErrorKind::Eof
            | StderrErrorKind::Decryption
            | StderrErrorKind::DecoderCorruption
    )
}

/// The facade the HTTP surface uses to open sessions and subscribe.
pub struct StreamingEngine {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub resolver: Arc<UpstreamResolver>,
    pub catalog: Arc<dyn ChannelCatalog>,
    supervisor: Supervisor,
    system: Arc<RwLock<System>>,
}

impl StreamingEngine {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<SessionRegistry>,
        resolver: Arc<UpstreamResolver>,
        catalog: Arc<dyn ChannelCatalog>,
        supervisor: Supervisor,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            config,
            registry,
            resolver,
            catalog,
            supervisor,
            system: Arc::new(RwLock::new(System::new())),
        });
        engine.clone().start_status_report_task();
        engine
    }

    /// Open (or reuse) a session for a tuner/preview request and start
    /// its runner. Reuse: a live session for the same channel/identity
    /// gets the incoming consumer id attached instead of a second
    /// supervisor being spawned.
    pub async fn open_session(
        &self,
        channel_id: Uuid,
        stream: Stream,
        kind: SessionKind,
        identity: ClientIdentity,
        classification: Classification,
        quality: QualityPreference,
        consumer_id: Option<String>,
        idle_grace: Duration,
    ) -> StreamingResult<Arc<SessionRecord>> {
        if let Some(existing) = self.registry.find_live(channel_id, kind, &identity).await {
            if existing
                .is_healthy(self.config.streaming.stall_deadline)
                .await
                || existing.state() == SessionState::Starting
            {
                if let Some(alias) = &consumer_id {
                    let _ = self
                        .registry
                        .attach(&existing.session_id.to_string(), alias)
                        .await;
                }
                existing.touch_activity(ActivityKind::Subscribe).await;
                return Ok(existing);
            }
        }

        let record = self
            .registry
            .open(
                channel_id,
                kind,
                identity,
                classification.class,
                stream.url.clone(),
                consumer_id,
            )
            .await?;

        let template = self
            .config
            .streaming
            .transcode_template
            .get(classification.template)
            .to_vec();

        SessionRunner::spawn(
            record.clone(),
            self.registry.clone(),
            self.resolver.clone(),
            self.supervisor.clone(),
            &self.config,
            SessionParams {
                stream,
                template,
                quality,
                resilience_enabled: classification.resilience,
                idle_grace,
            },
        );

        Ok(record)
    }

    /// Attach a subscriber, waiting out STARTING/RECOVERING bounded by
    /// the startup deadline.
    pub async fn subscribe(
        &self,
        record: &Arc<SessionRecord>,
        join: JoinPolicy,
        lag: LagPolicy,
    ) -> StreamingResult<Subscription> {
        let deadline = self.config.streaming.startup_deadline + Duration::from_secs(1);
        let mut state_rx = record.watch_state();

        let wait = async {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    SessionState::Active | SessionState::Recovering => return Ok(()),
                    SessionState::Ended | SessionState::Draining => {
                        return Err(StreamingError::upstream_unavailable(format!(
                            "session {} ended before streaming began",
                            record.session_id
                        )));
                    }
                    SessionState::Starting => {
                        if state_rx.changed().await.is_err() {
                            return Err(StreamingError::internal("session state channel closed"));
                        }
                    }
                }
            }
        };

        match tokio::time::timeout(deadline, wait).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(StreamingError::upstream_unavailable(format!(
                    "session {} produced no output within the startup deadline",
                    record.session_id
                )));
            }
        }

        let hub = record
            .hub()
            .await
            .ok_or_else(|| StreamingError::internal("session has no fan-out hub"))?;
        record.touch_activity(ActivityKind::Subscribe).await;
        Ok(hub.subscribe(join, lag).await)
    }

    /// Registry snapshot enriched with per-child CPU/RSS readings.
    pub async fn active_snapshot(&self) -> Vec<crate::models::SessionSnapshot> {
        let mut snapshots = self.registry.snapshot().await;
        let pids: Vec<Pid> = snapshots
            .iter()
            .filter_map(|s| s.supervisor_pid)
            .map(|pid| Pid::from_u32(pid))
            .collect();
        if !pids.is_empty() {
            let mut system = self.system.write().await;
            system.refresh_processes(ProcessesToUpdate::Some(&pids), true);
            for snapshot in &mut snapshots {
                if let Some(pid) = snapshot.supervisor_pid {
                    if let Some(process) = system.process(Pid::from_u32(pid)) {
                        snapshot.cpu_usage_percent = Some(process.cpu_usage() as f64);
                        snapshot.memory_usage_mb =
                            Some(process.memory() as f64 / 1024.0 / 1024.0);
                    }
                }
            }
        }
        snapshots
    }

    fn start_status_report_task(self: Arc<Self>) {
        let engine = self;
        let interval = engine.config.streaming.status_report_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let snapshots = engine.registry.snapshot().await;
                let live: Vec<_> = snapshots
                    .iter()
                    .filter(|s| !s.state.is_terminal())
                    .collect();
                if live.is_empty() {
                    continue;
                }
                info!(active_sessions = live.len(), "session status report");
                for snapshot in live {
                    info!(
                        session_id = %snapshot.session_id,
                        channel_id = %snapshot.channel_id,
                        state = %snapshot.state,
                        class = %snapshot.client_class,
                        subscribers = snapshot.subscriber_count,
                        forwarded = %crate::utils::human_format::format_bytes(
                            snapshot.counters.bytes_forwarded as f64
                        ),
                        restarts = snapshot.counters.supervisor_restarts,
                        upstream = %UrlUtils::obfuscate_credentials(&snapshot.upstream_url),
                        "  session"
                    );
                }
            }
        });
    }
}
