//! Escalation ladder behaviour against fake ports

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::sandbox_config;
use kiosk_shared::{Config, Decision, DecisionLog, RecoveryState, SupervisorLock};
use kioskd::ports::fake::{FakeOs, FakeServices, ScriptedHealth};
use kioskd::recovery::{
    ActionContext, RecoveryMachine, Remediation, ResetOutcome, TriggerOutcome, TriggerReason,
};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    config: Config,
    services: Arc<FakeServices>,
    os: Arc<FakeOs>,
    health: Arc<ScriptedHealth>,
    machine: RecoveryMachine,
}

impl Harness {
    fn new(health: ScriptedHealth) -> Self {
        let dir = TempDir::new().unwrap();
        let config = sandbox_config(&dir);
        let services = Arc::new(FakeServices::default());
        let os = Arc::new(FakeOs::new());
        let health = Arc::new(health);
        let context = ActionContext::new(&config, services.clone(), os.clone());
        let machine = RecoveryMachine::new(&config, context, health.clone());
        Self {
            _dir: dir,
            config,
            services,
            os,
            health,
            machine,
        }
    }

    fn seed(&self, state: &RecoveryState) {
        state.save(&self.config.paths.state_file()).unwrap();
    }

    fn decisions(&self) -> Vec<Decision> {
        DecisionLog::new(self.config.paths.decision_log(), 1000)
            .read_all()
            .unwrap()
            .into_iter()
            .map(|r| r.decision)
            .collect()
    }
}

fn probe_failed() -> TriggerReason {
    TriggerReason::ProbeFailed {
        failed_checks: vec!["window_visible".to_string()],
    }
}

fn state(level: u8, failure_count: u64, minutes_ago: i64) -> RecoveryState {
    RecoveryState {
        level,
        failure_count,
        last_failure_at: Some(Utc::now() - ChronoDuration::minutes(minutes_ago)),
    }
}

#[tokio::test(start_paused = true)]
async fn test_ladder_climbs_to_reboot() {
    let h = Harness::new(ScriptedHealth::always(false));

    let expected = [
        (Remediation::ServiceRestart, 0, 1),
        (Remediation::CacheClearRestart, 1, 2),
        (Remediation::DisplayServerRestart, 2, 3),
    ];
    for (action, from, to) in expected {
        let outcome = h.machine.trigger(probe_failed()).await.unwrap();
        assert_eq!(
            outcome,
            TriggerOutcome::Escalated {
                action,
                from_level: from,
                to_level: to
            }
        );
        assert_eq!(h.machine.state().level, to);
    }
    assert_eq!(h.os.reboots(), 0);

    let outcome = h.machine.trigger(probe_failed()).await.unwrap();
    assert_eq!(outcome, TriggerOutcome::RebootIssued { failure_count: 4 });
    assert_eq!(h.os.reboots(), 1);

    let persisted = h.machine.state();
    assert_eq!(persisted.level, 4);
    assert_eq!(persisted.failure_count, 4);
    // the terminal rung does not re-probe
    assert_eq!(h.health.checks(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_level_four_reboots_again() {
    let h = Harness::new(ScriptedHealth::always(false));
    h.seed(&state(4, 9, 5));

    let outcome = h.machine.trigger(probe_failed()).await.unwrap();
    assert_eq!(outcome, TriggerOutcome::RebootIssued { failure_count: 10 });
    assert_eq!(h.os.reboots(), 1);
    assert_eq!(h.machine.state().level, 4);
}

#[tokio::test(start_paused = true)]
async fn test_reboot_diagnostics_logged_before_reboot() {
    let h = Harness::new(ScriptedHealth::always(false));
    h.seed(&state(3, 3, 1));

    h.machine.trigger(probe_failed()).await.unwrap();

    let decisions = h.decisions();
    let issued = decisions
        .iter()
        .position(|d| matches!(d, Decision::RebootIssued { .. }))
        .expect("reboot decision logged");
    let finished = decisions
        .iter()
        .position(|d| matches!(d, Decision::ActionFinished { severity: 4, .. }))
        .expect("reboot action logged");
    assert!(issued < finished);

    match &decisions[issued] {
        Decision::RebootIssued {
            failure_count,
            diagnostics,
        } => {
            assert_eq!(*failure_count, 4);
            assert_eq!(diagnostics["state"]["level"], 4);
            assert!(diagnostics["reason"].as_str().unwrap().contains("window_visible"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_healthy_reprobe_resets_to_nominal() {
    let h = Harness::new(ScriptedHealth::always(true));
    h.seed(&state(2, 2, 5));

    let outcome = h.machine.trigger(probe_failed()).await.unwrap();
    assert_eq!(
        outcome,
        TriggerOutcome::Recovered {
            action: Remediation::DisplayServerRestart,
            from_level: 2
        }
    );

    let persisted = h.machine.state();
    assert_eq!(persisted.level, 0);
    assert_eq!(persisted.failure_count, 0);
    assert!(h.decisions().contains(&Decision::Recovered { from_level: 2 }));
}

#[tokio::test(start_paused = true)]
async fn test_quiescence_forgives_old_failures() {
    let h = Harness::new(ScriptedHealth::always(false));
    h.seed(&state(3, 7, 120));

    let outcome = h.machine.trigger(probe_failed()).await.unwrap();
    assert_eq!(
        outcome,
        TriggerOutcome::Escalated {
            action: Remediation::ServiceRestart,
            from_level: 0,
            to_level: 1
        }
    );
    let persisted = h.machine.state();
    assert_eq!(persisted.failure_count, 1);
    assert_eq!(h.os.reboots(), 0);
    assert!(h.decisions().contains(&Decision::QuiescenceReset {
        previous_level: 3,
        previous_failures: 7
    }));
}

#[tokio::test(start_paused = true)]
async fn test_recent_failures_keep_escalating() {
    let h = Harness::new(ScriptedHealth::always(false));
    h.seed(&state(2, 2, 30));

    let outcome = h.machine.trigger(probe_failed()).await.unwrap();
    assert_eq!(
        outcome,
        TriggerOutcome::Escalated {
            action: Remediation::DisplayServerRestart,
            from_level: 2,
            to_level: 3
        }
    );
    assert_eq!(h.machine.state().failure_count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_triggers_run_one_action() {
    let h = Harness::new(ScriptedHealth::always(false));

    let (a, b) = tokio::join!(
        h.machine.trigger(probe_failed()),
        h.machine.trigger(TriggerReason::Operator)
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let contended = outcomes
        .iter()
        .filter(|o| matches!(o, TriggerOutcome::Contended { .. }))
        .count();
    assert_eq!(contended, 1);
    assert_eq!(
        h.services.restarts(),
        vec![h.config.services.application.clone(), h.config.services.renderer.clone()]
    );
    assert_eq!(h.machine.state().failure_count, 1);
    let lock = SupervisorLock::new(h.config.paths.lock_file(), h.config.recovery.lock_stale_after());
    assert!(lock.current_holder().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_trigger_skips_when_lock_held() {
    let h = Harness::new(ScriptedHealth::always(false));
    let lock = SupervisorLock::new(h.config.paths.lock_file(), h.config.recovery.lock_stale_after());
    let _held = lock.try_acquire("sweep").unwrap();

    let outcome = h.machine.trigger(probe_failed()).await.unwrap();
    match outcome {
        TriggerOutcome::Contended { holder, pid } => {
            assert_eq!(holder, "sweep");
            assert_eq!(pid, std::process::id());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(h.services.calls().is_empty());
    assert_eq!(h.machine.state(), RecoveryState::default());
}

#[tokio::test(start_paused = true)]
async fn test_trigger_recovers_when_lock_file_unusable() {
    let dir = TempDir::new().unwrap();
    let mut config = sandbox_config(&dir);
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, b"").unwrap();
    config.paths.state_dir = blocker.join("state");
    let services = Arc::new(FakeServices::default());
    let os = Arc::new(FakeOs::new());
    let context = ActionContext::new(&config, services.clone(), os.clone());
    let machine = RecoveryMachine::new(&config, context, Arc::new(ScriptedHealth::always(true)));

    let outcome = machine.trigger(probe_failed()).await.unwrap();
    assert_eq!(
        outcome,
        TriggerOutcome::Recovered {
            action: Remediation::ServiceRestart,
            from_level: 0
        }
    );
    assert_eq!(
        services.restarts(),
        vec![config.services.application.clone(), config.services.renderer.clone()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_state_starts_nominal() {
    let h = Harness::new(ScriptedHealth::always(true));
    let path = h.config.paths.state_file();
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, "{ not json").unwrap();

    let outcome = h.machine.trigger(probe_failed()).await.unwrap();
    assert_eq!(
        outcome,
        TriggerOutcome::Recovered {
            action: Remediation::ServiceRestart,
            from_level: 0
        }
    );
    assert!(RecoveryState::load(&path).unwrap().is_some());
}

#[tokio::test]
async fn test_reset_is_idempotent() {
    let h = Harness::new(ScriptedHealth::always(true));
    h.seed(&state(3, 5, 1));

    match h.machine.reset().unwrap() {
        ResetOutcome::Applied { previous } => assert_eq!(previous.level, 3),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.machine.state(), RecoveryState::default());

    match h.machine.reset().unwrap() {
        ResetOutcome::Applied { previous } => assert_eq!(previous, RecoveryState::default()),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.machine.state(), RecoveryState::default());
}

#[tokio::test]
async fn test_reset_contended() {
    let h = Harness::new(ScriptedHealth::always(true));
    h.seed(&state(2, 2, 1));
    let lock = SupervisorLock::new(h.config.paths.lock_file(), h.config.recovery.lock_stale_after());
    let _held = lock.try_acquire("probe").unwrap();

    assert!(matches!(
        h.machine.reset().unwrap(),
        ResetOutcome::Contended { .. }
    ));
    assert_eq!(h.machine.state().level, 2);
}

#[tokio::test(start_paused = true)]
async fn test_status_reports_state_and_live_health() {
    let h = Harness::new(ScriptedHealth::new(&[false, false]));
    h.machine.trigger(probe_failed()).await.unwrap();

    let status = h.machine.status().await;
    assert_eq!(status.level, 1);
    assert_eq!(status.level_name, "service-restart");
    assert_eq!(status.failure_count, 1);
    assert!(!status.currently_healthy);
    assert_eq!(status.failed_checks, vec!["window_visible"]);
    assert!(status.lock_holder.is_none());
    // status is read-only
    assert_eq!(h.machine.state().level, 1);
}
