//! Resilience controller
//!
//! Turns classified failures into recovery actions via a four-layer
//! ladder: in-band reconnect, process restart with URL renewal, session
//! recreate, fail. Escalation is counted per layer; every counter resets
//! after a sufficiently long healthy dwell in ACTIVE. Errors inside the
//! controller never escape — only a Layer-4 `Fail` is ever surfaced.

use std::time::Duration;
use tokio::time::Instant;

use crate::config::ResilienceConfig;
use crate::streaming::stderr_classifier::StderrErrorKind;

/// What went wrong, as seen by the session pump loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTrigger {
    /// A classified stderr error from the supervisor
    Classified(StderrErrorKind),
    /// The supervisor exited (non-zero, or zero with the stream unfinished)
    ProcessExited { code: Option<i32> },
    /// No producer bytes for the stall deadline
    Stall,
}

impl RecoveryTrigger {
    /// Triggers that jump straight to Layer 2: plain reconnects do not
    /// help corrupted decode state or failed key retrieval.
    fn forces_renewal(self) -> bool {
        matches!(
            self,
            RecoveryTrigger::Classified(kind) if kind.needs_renewal()
        )
    }
}

/// The action the session must take next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Layer 1: wait, re-resolve (cache allowed), restart the supervisor
    Reconnect { delay: Duration },
    /// Layer 2: wait, re-resolve bypassing caches, restart the supervisor
    RestartWithRenewal { delay: Duration },
    /// Layer 3: tear down and re-open the session, keeping its identity
    RecreateSession { delay: Duration },
    /// Layer 4: transition to ENDED with reason `unrecoverable`
    Fail,
}

/// Per-session ladder state.
#[derive(Debug)]
pub struct ResilienceController {
    config: ResilienceConfig,
    layer1_failures: u32,
    layer2_failures: u32,
    layer3_failures: u32,
    /// Total failures since the last reset; exponent for backoff
    attempt: u32,
    active_since: Option<Instant>,
}

impl ResilienceController {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            layer1_failures: 0,
            layer2_failures: 0,
            layer3_failures: 0,
            attempt: 0,
            active_since: None,
        }
    }

    /// The session entered (or re-entered) ACTIVE.
    pub fn note_active(&mut self) {
        self.active_since = Some(Instant::now());
    }

    /// The session left ACTIVE (recovery began or draining started).
    pub fn note_inactive(&mut self) {
        self.active_since = None;
    }

    /// How long the proactive Layer-2 renewal timer waits.
    pub fn preemptive_renewal_interval(&self) -> Duration {
        self.config.preemptive_renewal
    }

    /// Decide the next action for a failure. Counter reset on healthy
    /// dwell is applied first, so a session that streamed fine for a
    /// minute starts the ladder from the top again.
    pub fn on_failure(&mut self, trigger: RecoveryTrigger) -> RecoveryAction {
        if let Some(active_since) = self.active_since {
            if active_since.elapsed() >= self.config.dwell_reset {
                self.reset();
            }
        }
        self.active_since = None;

        self.attempt = self.attempt.saturating_add(1);
        let delay = self.backoff();

        if trigger.forces_renewal() {
            return self.escalate_from_layer2(delay);
        }

        if self.layer1_failures < self.config.n1 {
            self.layer1_failures += 1;
            return RecoveryAction::Reconnect { delay };
        }
        self.escalate_from_layer2(delay)
    }

    fn escalate_from_layer2(&mut self, delay: Duration) -> RecoveryAction {
        if self.layer2_failures < self.config.n2 {
            self.layer2_failures += 1;
            return RecoveryAction::RestartWithRenewal { delay };
        }
        if self.layer3_failures < self.config.n3 {
            self.layer3_failures += 1;
            return RecoveryAction::RecreateSession { delay };
        }
        RecoveryAction::Fail
    }

    /// Exponential backoff: base × factor^attempt, capped.
    pub fn backoff(&self) -> Duration {
        let base = self.config.base_backoff.as_secs_f64();
        let exponent = self.attempt.saturating_sub(1);
        let scaled = base * self.config.backoff_factor.powi(exponent as i32);
        Duration::from_secs_f64(scaled.min(self.config.max_backoff.as_secs_f64()))
    }

    fn reset(&mut self) {
        self.layer1_failures = 0;
        self.layer2_failures = 0;
        self.layer3_failures = 0;
        self.attempt = 0;
    }

    /// Counters exposed for snapshots and tests.
    pub fn failure_counts(&self) -> (u32, u32, u32) {
        (
            self.layer1_failures,
            self.layer2_failures,
            self.layer3_failures,
        )
    }

    /// Health probe used by the registry's conflict policy: a session is
    /// unhealthy once its ladder has escalated past Layer 1.
    pub fn is_escalated(&self) -> bool {
        self.layer2_failures > 0 || self.layer3_failures > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ResilienceConfig {
        ResilienceConfig::default() // n1=3, n2=2, n3=1
    }

    fn transient() -> RecoveryTrigger {
        RecoveryTrigger::Classified(StderrErrorKind::NetworkTimeout)
    }

    #[test]
    fn ladder_escalates_through_all_four_layers() {
        let mut controller = ResilienceController::new(config());

        // N1 = 3 in-band reconnects.
        for i in 0..3 {
            assert!(
                matches!(
                    controller.on_failure(transient()),
                    RecoveryAction::Reconnect { .. }
                ),
                "failure {i} should stay on layer 1"
            );
        }
        // N2 = 2 restarts with renewal.
        for i in 0..2 {
            assert!(
                matches!(
                    controller.on_failure(transient()),
                    RecoveryAction::RestartWithRenewal { .. }
                ),
                "failure {} should be layer 2",
                i + 3
            );
        }
        // N3 = 1 session recreate — exactly at the N2 threshold boundary.
        assert!(matches!(
            controller.on_failure(transient()),
            RecoveryAction::RecreateSession { .. }
        ));
        // Exhausted.
        assert_eq!(controller.on_failure(transient()), RecoveryAction::Fail);
        // Fail is sticky until a dwell reset.
        assert_eq!(controller.on_failure(transient()), RecoveryAction::Fail);
    }

    #[test]
    fn decoder_corruption_skips_layer_one() {
        let mut controller = ResilienceController::new(config());
        let action = controller.on_failure(RecoveryTrigger::Classified(
            StderrErrorKind::DecoderCorruption,
        ));
        assert!(matches!(action, RecoveryAction::RestartWithRenewal { .. }));
        assert_eq!(controller.failure_counts(), (0, 1, 0));
    }

    #[test]
    fn decryption_skips_layer_one() {
        let mut controller = ResilienceController::new(config());
        let action =
            controller.on_failure(RecoveryTrigger::Classified(StderrErrorKind::Decryption));
        assert!(matches!(action, RecoveryAction::RestartWithRenewal { .. }));
    }

    #[test]
    fn stall_and_exit_walk_the_normal_ladder() {
        let mut controller = ResilienceController::new(config());
        assert!(matches!(
            controller.on_failure(RecoveryTrigger::Stall),
            RecoveryAction::Reconnect { .. }
        ));
        assert!(matches!(
            controller.on_failure(RecoveryTrigger::ProcessExited { code: Some(1) }),
            RecoveryAction::Reconnect { .. }
        ));
    }

    #[test]
    fn backoff_grows_geometrically_and_caps() {
        let mut controller = ResilienceController::new(ResilienceConfig {
            base_backoff: Duration::from_secs(1),
            backoff_factor: 1.3,
            max_backoff: Duration::from_secs(30),
            ..config()
        });

        let mut last = Duration::ZERO;
        for _ in 0..10 {
            controller.on_failure(transient());
            let delay = controller.backoff();
            assert!(delay >= last);
            assert!(delay <= Duration::from_secs(30));
            last = delay;
        }
        // First failure gets the bare base.
        let mut fresh = ResilienceController::new(ResilienceConfig {
            base_backoff: Duration::from_secs(1),
            backoff_factor: 1.3,
            max_backoff: Duration::from_secs(30),
            ..config()
        });
        fresh.on_failure(transient());
        assert_eq!(fresh.backoff(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn sixty_second_dwell_resets_the_ladder() {
        let mut controller = ResilienceController::new(config());

        // Burn through layer 1.
        for _ in 0..3 {
            controller.on_failure(transient());
        }
        assert_eq!(controller.failure_counts(), (3, 0, 0));

        // Healthy dwell past the reset threshold.
        controller.note_active();
        tokio::time::sleep(Duration::from_secs(61)).await;

        // Next failure starts over at layer 1.
        assert!(matches!(
            controller.on_failure(transient()),
            RecoveryAction::Reconnect { .. }
        ));
        assert_eq!(controller.failure_counts(), (1, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn short_dwell_does_not_reset() {
        let mut controller = ResilienceController::new(config());
        for _ in 0..3 {
            controller.on_failure(transient());
        }
        controller.note_active();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(matches!(
            controller.on_failure(transient()),
            RecoveryAction::RestartWithRenewal { .. }
        ));
    }

    #[test]
    fn escalation_flag_feeds_the_conflict_probe() {
        let mut controller = ResilienceController::new(config());
        assert!(!controller.is_escalated());
        for _ in 0..4 {
            controller.on_failure(transient());
        }
        assert!(controller.is_escalated());
    }
}
