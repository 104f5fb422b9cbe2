//! Session registry
//!
//! Process-wide bookkeeping that unifies the several identifiers a media
//! server uses for one logical tuning session. The registry holds the
//! canonical `SessionRecord`; consumer aliases are entries in a map, not
//! sibling records. ENDED records linger for an audit grace period (their
//! audit row is appended at ENDED time) and are then purged.
//!
//! Every public operation takes the registry lock once and is atomic with
//! respect to concurrent HTTP handlers.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::ChannelCatalog;
use crate::errors::{StreamingError, StreamingResult};
use crate::models::{
    ClientClass, SessionAuditRow, SessionCounters, SessionSnapshot, SessionState,
};
use crate::streaming::fanout::FanoutHub;

/// What kind of consumer owns a session; tuner and preview paths have
/// separate capacity pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Tuner,
    Preview,
}

/// The client identity used for session-conflict detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    pub ip: String,
    pub user_agent: Option<String>,
}

/// Activity kinds recorded against `last_activity_at`.
#[derive(Debug, Clone, Copy, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ActivityKind {
    Subscribe,
    KeepAlive,
    BytesForwarded,
    SegmentRequest,
}

/// The canonical per-session record. State transitions are totally
/// ordered through a single watch channel; concurrent readers always see
/// one consistent snapshot.
pub struct SessionRecord {
    pub session_id: Uuid,
    pub channel_id: Uuid,
    pub kind: SessionKind,
    pub client_identity: ClientIdentity,
    pub client_class: ClientClass,
    pub started_at: DateTime<Utc>,

    state_tx: watch::Sender<SessionState>,
    transition_lock: Mutex<()>,

    pub(crate) upstream_url: RwLock<String>,
    last_activity_at: RwLock<DateTime<Utc>>,
    pub(crate) last_supervisor_start_at: RwLock<Option<DateTime<Utc>>>,
    pub(crate) last_upstream_renewal_at: RwLock<Option<DateTime<Utc>>>,

    pub(crate) supervisor_restarts: AtomicU64,
    pub(crate) inband_reconnects: AtomicU64,
    pub(crate) url_renewals: AtomicU64,
    pub(crate) consecutive_failures: AtomicU32,
    pub(crate) escalated: AtomicBool,

    hub: RwLock<Option<Arc<FanoutHub>>>,
    pub(crate) supervisor_pid: AtomicU32,

    /// Cancellation observed by the session task; triggers DRAINING
    pub(crate) close_token: CancellationToken,
    end_reason: RwLock<Option<String>>,
}

impl SessionRecord {
    fn new(
        channel_id: Uuid,
        kind: SessionKind,
        client_identity: ClientIdentity,
        client_class: ClientClass,
        upstream_url: String,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Starting);
        let now = Utc::now();
        Arc::new(Self {
            session_id: Uuid::new_v4(),
            channel_id,
            kind,
            client_identity,
            client_class,
            started_at: now,
            state_tx,
            transition_lock: Mutex::new(()),
            upstream_url: RwLock::new(upstream_url),
            last_activity_at: RwLock::new(now),
            last_supervisor_start_at: RwLock::new(None),
            last_upstream_renewal_at: RwLock::new(None),
            supervisor_restarts: AtomicU64::new(0),
            inband_reconnects: AtomicU64::new(0),
            url_renewals: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            escalated: AtomicBool::new(false),
            hub: RwLock::new(None),
            supervisor_pid: AtomicU32::new(0),
            close_token: CancellationToken::new(),
            end_reason: RwLock::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Apply a state transition. ENDED is terminal: any transition out of
    /// it is refused and logged as an invariant violation.
    pub(crate) async fn set_state(&self, next: SessionState) -> StreamingResult<()> {
        let _guard = self.transition_lock.lock().await;
        let current = self.state();
        if current.is_terminal() {
            if next != SessionState::Ended {
                warn!(
                    session_id = %self.session_id,
                    from = %current,
                    to = %next,
                    "refused transition out of terminal state"
                );
                return Err(StreamingError::internal(format!(
                    "transition {current} -> {next} after session ended"
                )));
            }
            return Ok(());
        }
        debug!(session_id = %self.session_id, from = %current, to = %next, "session transition");
        // send_replace updates the value even with no receivers attached.
        self.state_tx.send_replace(next);
        Ok(())
    }

    /// Record activity; the clock never moves backwards.
    pub async fn touch_activity(&self, kind: ActivityKind) {
        let now = Utc::now();
        let mut last = self.last_activity_at.write().await;
        if now > *last {
            *last = now;
        }
        debug!(session_id = %self.session_id, activity = %kind, "session activity");
    }

    pub async fn last_activity_at(&self) -> DateTime<Utc> {
        *self.last_activity_at.read().await
    }

    pub(crate) async fn attach_hub(&self, hub: Arc<FanoutHub>) {
        *self.hub.write().await = Some(hub);
    }

    pub async fn hub(&self) -> Option<Arc<FanoutHub>> {
        self.hub.read().await.clone()
    }

    pub async fn upstream_url(&self) -> String {
        self.upstream_url.read().await.clone()
    }

    pub async fn end_reason(&self) -> Option<String> {
        self.end_reason.read().await.clone()
    }

    pub(crate) async fn set_end_reason(&self, reason: &str) {
        let mut slot = self.end_reason.write().await;
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
    }

    /// Ask the session task to drain and end.
    pub fn request_close(&self) {
        self.close_token.cancel();
    }

    /// Health probe for the conflict policy: ACTIVE, not escalated, and
    /// producing bytes within the stall window.
    pub async fn is_healthy(&self, stall_deadline: Duration) -> bool {
        if self.state() != SessionState::Active {
            return false;
        }
        if self.escalated.load(Ordering::Relaxed) {
            return false;
        }
        match self.hub().await {
            Some(hub) => hub.wrote_within(stall_deadline),
            None => false,
        }
    }

    pub fn counters(&self) -> SessionCounters {
        SessionCounters {
            supervisor_restarts: self.supervisor_restarts.load(Ordering::Relaxed),
            inband_reconnects: self.inband_reconnects.load(Ordering::Relaxed),
            url_renewals: self.url_renewals.load(Ordering::Relaxed),
            bytes_forwarded: 0, // filled from the hub in snapshots
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }

    async fn snapshot(&self, consumer_ids: Vec<String>) -> SessionSnapshot {
        let hub = self.hub().await;
        let mut counters = self.counters();
        if let Some(hub) = &hub {
            counters.bytes_forwarded = hub.total_bytes_in();
        }
        let subscriber_count = match &hub {
            Some(hub) => hub.subscriber_count().await,
            None => 0,
        };
        let pid = self.supervisor_pid.load(Ordering::Relaxed);
        SessionSnapshot {
            session_id: self.session_id,
            channel_id: self.channel_id,
            consumer_ids,
            state: self.state(),
            client_class: self.client_class,
            upstream_url: crate::utils::UrlUtils::obfuscate_credentials(
                &self.upstream_url().await,
            ),
            started_at: self.started_at,
            last_activity_at: self.last_activity_at().await,
            last_supervisor_start_at: *self.last_supervisor_start_at.read().await,
            last_upstream_renewal_at: *self.last_upstream_renewal_at.read().await,
            counters,
            subscriber_count,
            supervisor_pid: if pid == 0 { None } else { Some(pid) },
            cpu_usage_percent: None,
            memory_usage_mb: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_tuner_sessions: usize,
    pub max_preview_sessions: usize,
    /// How long ENDED records are retained before purge
    pub audit_grace: Duration,
    /// Stall window consulted by the conflict health probe
    pub stall_deadline: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_tuner_sessions: crate::config::defaults::DEFAULT_MAX_CONCURRENT_STREAMS,
            max_preview_sessions: crate::config::defaults::DEFAULT_MAX_CONCURRENT_PREVIEWS,
            audit_grace: Duration::from_secs(60),
            stall_deadline: Duration::from_secs(30),
        }
    }
}

struct RegistryState {
    sessions: HashMap<Uuid, Arc<SessionRecord>>,
    aliases: HashMap<String, Uuid>,
    /// ENDED timestamps awaiting purge
    ended_at: HashMap<Uuid, tokio::time::Instant>,
}

/// Process-wide session registry.
pub struct SessionRegistry {
    config: RegistryConfig,
    state: RwLock<RegistryState>,
    catalog: Arc<dyn ChannelCatalog>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig, catalog: Arc<dyn ChannelCatalog>) -> Arc<Self> {
        let registry = Arc::new(Self {
            config,
            state: RwLock::new(RegistryState {
                sessions: HashMap::new(),
                aliases: HashMap::new(),
                ended_at: HashMap::new(),
            }),
            catalog,
        });
        registry.clone().start_purge_task();
        registry
    }

    /// Create a new session in STARTING, registering any consumer alias
    /// the client supplied.
    ///
    /// Conflict policy: if this client identity already owns a live
    /// session on the same channel, the existing session's health decides
    /// — unhealthy sessions are closed and replaced, healthy ones win and
    /// the new open is rejected.
    pub async fn open(
        &self,
        channel_id: Uuid,
        kind: SessionKind,
        client_identity: ClientIdentity,
        client_class: ClientClass,
        upstream_url: String,
        consumer_id: Option<String>,
    ) -> StreamingResult<Arc<SessionRecord>> {
        // The health probe awaits hub state, so find the conflicting
        // session under the read lock and probe outside it.
        let conflicting = {
            let state = self.state.read().await;
            state
                .sessions
                .values()
                .find(|record| {
                    record.kind == kind
                        && record.channel_id == channel_id
                        && record.client_identity == client_identity
                        && !record.state().is_terminal()
                })
                .cloned()
        };

        if let Some(existing) = conflicting {
            if existing.is_healthy(self.config.stall_deadline).await {
                return Err(StreamingError::conflict(format!(
                    "session {} already streaming channel {} for this client",
                    existing.session_id, channel_id
                )));
            }
            info!(
                session_id = %existing.session_id,
                channel_id = %channel_id,
                "replacing unhealthy session for reconnecting client"
            );
            existing.set_end_reason("replaced_by_reconnect").await;
            existing.request_close();
        }

        let mut state = self.state.write().await;

        let live = state
            .sessions
            .values()
            .filter(|r| r.kind == kind && !r.state().is_terminal())
            .count();
        let cap = match kind {
            SessionKind::Tuner => self.config.max_tuner_sessions,
            SessionKind::Preview => self.config.max_preview_sessions,
        };
        if live >= cap {
            return Err(StreamingError::capacity(format!(
                "{live}/{cap} concurrent {} sessions",
                match kind {
                    SessionKind::Tuner => "tuner",
                    SessionKind::Preview => "preview",
                }
            )));
        }

        let record = SessionRecord::new(
            channel_id,
            kind,
            client_identity,
            client_class,
            upstream_url,
        );
        state.sessions.insert(record.session_id, record.clone());
        if let Some(alias) = consumer_id {
            state.aliases.insert(alias, record.session_id);
        }

        info!(
            session_id = %record.session_id,
            channel_id = %channel_id,
            class = %client_class,
            live = live + 1,
            "opened session"
        );
        Ok(record)
    }

    /// Add a consumer alias. Idempotent: re-attaching the same alias to
    /// the same session is a no-op.
    pub async fn attach(&self, id_or_alias: &str, consumer_id: &str) -> StreamingResult<()> {
        let mut state = self.state.write().await;
        let session_id = Self::resolve_locked(&state, id_or_alias)
            .ok_or_else(|| StreamingError::not_found("session", id_or_alias))?;

        match state.aliases.get(consumer_id).copied() {
            Some(existing) if existing == session_id => Ok(()),
            Some(existing) => {
                // Rebinding is only allowed once the previous owner ended.
                let prior_live = state
                    .sessions
                    .get(&existing)
                    .map(|r| !r.state().is_terminal())
                    .unwrap_or(false);
                if prior_live {
                    return Err(StreamingError::conflict(format!(
                        "consumer id {consumer_id} already bound to a live session"
                    )));
                }
                state.aliases.insert(consumer_id.to_string(), session_id);
                Ok(())
            }
            None => {
                state.aliases.insert(consumer_id.to_string(), session_id);
                debug!(session_id = %session_id, alias = %consumer_id, "attached consumer alias");
                Ok(())
            }
        }
    }

    /// O(1) lookup through the alias map. Accepts either the canonical
    /// session id or any attached consumer alias.
    pub async fn resolve(&self, id_or_alias: &str) -> Option<Uuid> {
        let state = self.state.read().await;
        Self::resolve_locked(&state, id_or_alias)
    }

    fn resolve_locked(state: &RegistryState, id_or_alias: &str) -> Option<Uuid> {
        if let Ok(uuid) = Uuid::parse_str(id_or_alias) {
            if state.sessions.contains_key(&uuid) {
                return Some(uuid);
            }
        }
        state.aliases.get(id_or_alias).copied()
    }

    pub async fn get(&self, session_id: Uuid) -> Option<Arc<SessionRecord>> {
        self.state.read().await.sessions.get(&session_id).cloned()
    }

    /// Find the live session for a channel + identity, if any.
    pub async fn find_live(
        &self,
        channel_id: Uuid,
        kind: SessionKind,
        client_identity: &ClientIdentity,
    ) -> Option<Arc<SessionRecord>> {
        let state = self.state.read().await;
        state
            .sessions
            .values()
            .find(|record| {
                record.kind == kind
                    && record.channel_id == channel_id
                    && &record.client_identity == client_identity
                    && !record.state().is_terminal()
            })
            .cloned()
    }

    pub async fn touch_activity(&self, id_or_alias: &str, kind: ActivityKind) {
        let record = {
            let state = self.state.read().await;
            Self::resolve_locked(&state, id_or_alias)
                .and_then(|id| state.sessions.get(&id).cloned())
        };
        if let Some(record) = record {
            record.touch_activity(kind).await;
        }
    }

    /// Request a session close. The session task performs the DRAINING →
    /// ENDED transition; `on_session_ended` finishes the bookkeeping.
    pub async fn close(&self, session_id: Uuid, reason: &str) {
        if let Some(record) = self.get(session_id).await {
            record.set_end_reason(reason).await;
            record.request_close();
        }
    }

    /// Called by the session task once its record reaches ENDED: appends
    /// the audit row and schedules the purge.
    pub async fn on_session_ended(&self, record: &Arc<SessionRecord>) {
        let reason = record
            .end_reason()
            .await
            .unwrap_or_else(|| "unspecified".to_string());
        let bytes = match record.hub().await {
            Some(hub) => hub.total_bytes_in(),
            None => 0,
        };
        let row = SessionAuditRow {
            session_id: record.session_id,
            channel_id: record.channel_id,
            client_class: record.client_class,
            started_at: record.started_at,
            ended_at: Utc::now(),
            bytes_forwarded: bytes,
            supervisor_restarts: record.supervisor_restarts.load(Ordering::Relaxed),
            end_reason: reason.clone(),
        };
        if let Err(e) = self.catalog.append_session_audit(row).await {
            warn!(session_id = %record.session_id, error = %e, "failed to append session audit row");
        }

        let mut state = self.state.write().await;
        state
            .ended_at
            .insert(record.session_id, tokio::time::Instant::now());
        info!(
            session_id = %record.session_id,
            reason = %reason,
            bytes_forwarded = bytes,
            "session ended"
        );
    }

    /// Read-only view for the observability surface.
    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let records: Vec<(Arc<SessionRecord>, Vec<String>)> = {
            let state = self.state.read().await;
            state
                .sessions
                .values()
                .map(|record| {
                    let aliases = state
                        .aliases
                        .iter()
                        .filter(|(_, sid)| **sid == record.session_id)
                        .map(|(alias, _)| alias.clone())
                        .collect();
                    (record.clone(), aliases)
                })
                .collect()
        };

        let mut snapshots = Vec::with_capacity(records.len());
        for (record, aliases) in records {
            snapshots.push(record.snapshot(aliases).await);
        }
        snapshots
    }

    /// Live session count for a kind (capacity readout).
    pub async fn live_count(&self, kind: SessionKind) -> usize {
        let state = self.state.read().await;
        state
            .sessions
            .values()
            .filter(|r| r.kind == kind && !r.state().is_terminal())
            .count()
    }

    pub fn capacity(&self, kind: SessionKind) -> usize {
        match kind {
            SessionKind::Tuner => self.config.max_tuner_sessions,
            SessionKind::Preview => self.config.max_preview_sessions,
        }
    }

    fn start_purge_task(self: Arc<Self>) {
        let registry = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                registry.purge_expired().await;
            }
        });
    }

    async fn purge_expired(&self) {
        let grace = self.config.audit_grace;
        let mut state = self.state.write().await;
        let expired: Vec<Uuid> = state
            .ended_at
            .iter()
            .filter(|(_, at)| at.elapsed() >= grace)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            state.sessions.remove(&id);
            state.ended_at.remove(&id);
            state.aliases.retain(|_, sid| *sid != id);
            debug!(session_id = %id, "purged ended session record");
        }
    }
}
