//! Integration tests for dispatch groups: both ingress paths, observers,
//! failure policies and cancellation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use keel_core::{
    async_trait, create_dispatch_group, from_fn, DispatchConfig, DispatchError,
    DispatchGroupBuilder, DispatchHandle, DispatchScope, EngineId, EngineStatus, FailurePolicy,
    Ingress, SharedTransition, Transition, TransitionResult,
};
use keel_testing::counter::{Counter, CounterAction, CounterEffect, CounterTransition};
use keel_testing::{
    assert_quiet, next_within, take_within, wait_for_version, Tracked, DEFAULT_WAIT,
};
use tokio::sync::Notify;

const QUIET: Duration = Duration::from_millis(100);

fn counter_group(
    scope: &DispatchScope,
    config: DispatchConfig,
) -> (
    DispatchHandle<CounterAction, Counter, CounterEffect>,
    keel_core::StateObserver<Counter, CounterEffect>,
) {
    DispatchGroupBuilder::new(Counter::default(), CounterTransition)
        .with_config(config)
        .build(scope)
}

// ---------------------------------------------------------------------------
// Gated transition: `Block` parks inside the engine lock until released
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum GateAction {
    Block,
    Bump,
    /// Tries to await a reply from its own group.
    Nested,
}

struct Gated {
    gate: Arc<Notify>,
    entered: Arc<Notify>,
}

#[async_trait]
impl Transition for Gated {
    type Action = GateAction;
    type State = u32;
    type SideEffect = String;

    async fn transition(
        &self,
        action: GateAction,
        state: Arc<u32>,
        dispatch: &DispatchHandle<GateAction, u32, String>,
    ) -> Result<TransitionResult<u32, String>> {
        match action {
            GateAction::Block => {
                self.entered.notify_one();
                self.gate.notified().await;
                Ok(TransitionResult::no_mutation())
            }
            GateAction::Bump => Ok(TransitionResult::mutation(*state + 1)),
            GateAction::Nested => {
                let outcome = dispatch.submit_and_await(GateAction::Bump).await;
                Ok(TransitionResult::side_effect_only(format!("{outcome:?}")))
            }
        }
    }
}

fn gated_group(
    scope: &DispatchScope,
    config: DispatchConfig,
) -> (
    DispatchHandle<GateAction, u32, String>,
    keel_core::StateObserver<u32, String>,
    Arc<Notify>,
    Arc<Notify>,
) {
    let gate = Arc::new(Notify::new());
    let entered = Arc::new(Notify::new());
    let (dispatch, observer) = DispatchGroupBuilder::new(
        0u32,
        Gated {
            gate: Arc::clone(&gate),
            entered: Arc::clone(&entered),
        },
    )
    .with_config(config)
    .build(scope);
    (dispatch, observer, gate, entered)
}

// ---------------------------------------------------------------------------
// Core scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn increment_then_awaited_decrement() {
    // Fresh groups each round: the two ingress paths race on separate tasks.
    for _ in 0..200 {
        let scope = DispatchScope::new();
        let (dispatch, observer) = counter_group(&scope, DispatchConfig::default());
        let mut states = observer.states();

        dispatch.submit(CounterAction::Increment).unwrap();
        let reply = dispatch
            .submit_and_await(CounterAction::Decrement)
            .await
            .unwrap();
        assert_eq!(reply.action, CounterAction::Decrement);
        assert_eq!(reply.result, TransitionResult::mutation(Counter::new(0)));
        assert_eq!(reply.version, 2);

        let observed: Vec<i64> = take_within(&mut states, 3, DEFAULT_WAIT)
            .await
            .iter()
            .map(|snapshot| snapshot.value().count)
            .collect();
        assert_eq!(observed, vec![0, 1, 0]);

        scope.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_waits_for_earlier_broadcasts_from_its_producer() {
    let scope = DispatchScope::new();
    let (dispatch, _observer) = counter_group(&scope, DispatchConfig::default());

    for round in 1..=50i64 {
        for _ in 0..3 {
            dispatch.submit(CounterAction::Increment).unwrap();
        }
        let reply = dispatch.submit_and_await(CounterAction::Add(0)).await.unwrap();
        assert_eq!(
            reply.result.side_effect(),
            Some(&CounterEffect::Changed {
                from: round * 3,
                to: round * 3
            })
        );
    }

    scope.close().await;
}

#[tokio::test]
async fn log_only_emits_without_touching_state() {
    let scope = DispatchScope::new();
    let (dispatch, observer) = counter_group(&scope, DispatchConfig::default());
    let mut states = observer.states();
    let mut effects = observer.side_effects();
    let before = observer.state();

    let reply = dispatch
        .submit_and_await(CounterAction::LogOnly("x".into()))
        .await
        .unwrap();

    assert!(!reply.result.is_mutation());
    assert_eq!(reply.version, 0);
    assert!(observer.state().same_commit(&before));

    assert_eq!(next_within(&mut states, DEFAULT_WAIT).await.unwrap().version, 0);
    assert_quiet(&mut states, QUIET).await;

    assert_eq!(
        next_within(&mut effects, DEFAULT_WAIT).await,
        Some(CounterEffect::Logged("x".into()))
    );
    assert_quiet(&mut effects, QUIET).await;

    scope.close().await;
}

#[tokio::test]
async fn fresh_subscriber_gets_initial_state() {
    let scope = DispatchScope::new();
    let (_dispatch, observer) = DispatchGroupBuilder::new(Counter::new(41), CounterTransition)
        .build(&scope);

    let first = next_within(&mut observer.states(), DEFAULT_WAIT).await.unwrap();
    assert_eq!(first.version, 0);
    assert_eq!(first.value(), &Counter::new(41));

    scope.close().await;
}

#[tokio::test]
async fn side_effects_are_not_replayed_to_late_subscribers() {
    let scope = DispatchScope::new();
    let (dispatch, observer) = counter_group(&scope, DispatchConfig::default());

    let mut early = observer.side_effects();
    dispatch
        .submit_and_await(CounterAction::LogOnly("first".into()))
        .await
        .unwrap();

    let mut late = observer.side_effects();
    dispatch
        .submit_and_await(CounterAction::LogOnly("second".into()))
        .await
        .unwrap();

    let early_seen = take_within(&mut early, 2, DEFAULT_WAIT).await;
    assert_eq!(
        early_seen,
        vec![
            CounterEffect::Logged("first".into()),
            CounterEffect::Logged("second".into())
        ]
    );
    assert_eq!(
        next_within(&mut late, DEFAULT_WAIT).await,
        Some(CounterEffect::Logged("second".into()))
    );
    assert_quiet(&mut late, QUIET).await;

    scope.close().await;
}

#[tokio::test]
async fn equal_state_still_commits_a_new_version() {
    let scope = DispatchScope::new();
    let (dispatch, observer) = counter_group(&scope, DispatchConfig::default());

    let reply = dispatch.submit_and_await(CounterAction::Touch).await.unwrap();
    assert_eq!(reply.version, 1);
    assert_eq!(observer.state().version, 1);
    assert_eq!(observer.state().value(), &Counter::default());

    scope.close().await;
}

#[tokio::test]
async fn mutation_side_effect_follows_the_commit() {
    let scope = DispatchScope::new();
    let (dispatch, observer) = counter_group(&scope, DispatchConfig::default());
    let mut effects = observer.side_effects();

    dispatch.submit(CounterAction::Add(5)).unwrap();
    assert_eq!(
        next_within(&mut effects, DEFAULT_WAIT).await,
        Some(CounterEffect::Changed { from: 0, to: 5 })
    );
    assert_eq!(observer.state().value().count, 5);

    scope.close().await;
}

#[tokio::test]
async fn transition_can_submit_follow_up_actions() {
    let scope = DispatchScope::new();
    let (dispatch, observer) = counter_group(&scope, DispatchConfig::default());
    let mut states = observer.states();

    let reply = dispatch
        .submit_and_await(CounterAction::Fanout(10))
        .await
        .unwrap();
    assert!(!reply.result.is_mutation());

    let settled = wait_for_version(&mut states, 10).await;
    assert_eq!(settled.value().count, 10);

    scope.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transitions_never_overlap() {
    let scope = DispatchScope::new();
    let (tracked, stats) = Tracked::new(CounterTransition);
    let (dispatch, observer) = DispatchGroupBuilder::new(Counter::default(), tracked).build(&scope);

    let tasks: Vec<_> = (0..50)
        .map(|n| {
            let dispatch = dispatch.clone();
            tokio::spawn(async move {
                if n % 2 == 0 {
                    dispatch.submit(CounterAction::Increment).unwrap();
                } else {
                    dispatch.submit_and_await(CounterAction::Increment).await.unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let settled = wait_for_version(&mut observer.states(), 50).await;
    assert_eq!(settled.value().count, 50);
    assert_eq!(stats.calls(), 50);
    assert_eq!(stats.max_in_flight(), 1);

    scope.close().await;
}

// ---------------------------------------------------------------------------
// Failure policies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn skip_action_reports_and_keeps_going() {
    let scope = DispatchScope::new();
    let (dispatch, observer) = counter_group(&scope, DispatchConfig::default());
    let mut failures = observer.failures();

    let err = dispatch
        .submit_and_await(CounterAction::Fail("nope".into()))
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::TransitionFailed("nope".into()));
    assert_eq!(observer.state().version, 0);

    let failure = next_within(&mut failures, DEFAULT_WAIT).await.unwrap();
    assert_eq!(failure.engine, EngineId(0));
    assert!(matches!(failure.ingress, Ingress::Request(_)));
    assert_eq!(failure.message, "nope");

    let reply = dispatch.submit_and_await(CounterAction::Increment).await.unwrap();
    assert_eq!(reply.version, 1);

    let health = observer.health();
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].status, EngineStatus::Running);
    assert_eq!(health[0].transition, "counter");
    assert_eq!(health[0].failures, 1);
    assert_eq!(health[0].transitions, 1);

    scope.close().await;
}

#[tokio::test]
async fn panics_are_contained_as_failures() {
    let scope = DispatchScope::new();
    let (dispatch, observer) = counter_group(&scope, DispatchConfig::default());

    let err = dispatch
        .submit_and_await(CounterAction::Panic)
        .await
        .unwrap_err();
    match err {
        DispatchError::TransitionFailed(message) => {
            assert!(message.contains("panicked"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The engine survived.
    dispatch.submit_and_await(CounterAction::Increment).await.unwrap();
    assert_eq!(observer.state().value().count, 1);

    scope.close().await;
}

#[tokio::test]
async fn broadcast_failures_are_visible_to_observers() {
    let scope = DispatchScope::new();
    let (dispatch, observer) = counter_group(&scope, DispatchConfig::default());
    let mut failures = observer.failures();

    dispatch.submit(CounterAction::Fail("quiet".into())).unwrap();
    let failure = next_within(&mut failures, DEFAULT_WAIT).await.unwrap();
    assert_eq!(failure.ingress, Ingress::Broadcast);

    let health = observer
        .wait_for_health(EngineId(0), |health| health.failures == 1)
        .await
        .unwrap();
    assert_eq!(health.last_failure.unwrap().message, "quiet");

    scope.close().await;
}

#[tokio::test]
async fn stop_engine_halts_a_single_engine_group() {
    let scope = DispatchScope::new();
    let config = DispatchConfig::default().failure_policy(FailurePolicy::StopEngine);
    let (dispatch, observer) = counter_group(&scope, config);

    let err = dispatch
        .submit_and_await(CounterAction::Fail("fatal".into()))
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::TransitionFailed("fatal".into()));

    observer
        .wait_for_health(EngineId(0), |health| health.status == EngineStatus::Stopped)
        .await
        .unwrap();

    assert_eq!(
        dispatch.submit_and_await(CounterAction::Increment).await.unwrap_err(),
        DispatchError::Halted
    );
    assert_eq!(
        dispatch.submit(CounterAction::Increment).unwrap_err(),
        DispatchError::Halted
    );
    assert!(dispatch.is_closed());
    assert_eq!(observer.state().version, 0);

    scope.close().await;
}

#[tokio::test]
async fn stop_engine_leaves_other_engines_running() {
    let scope = DispatchScope::new();
    let always_fails = from_fn::<_, CounterAction, Counter, CounterEffect>(
        |_action, _state, _dispatch| anyhow::bail!("audit unavailable"),
    )
    .named("audit");

    let (dispatch, observer) = DispatchGroupBuilder::new(Counter::default(), CounterTransition)
        .with_transition(always_fails)
        .with_config(DispatchConfig::default().failure_policy(FailurePolicy::StopEngine))
        .build(&scope);

    dispatch.submit(CounterAction::Increment).unwrap();
    observer
        .wait_for_health(EngineId(1), |health| health.status == EngineStatus::Stopped)
        .await
        .unwrap();

    // The broadcast Increment is applied first, so the request sees 1.
    let reply = dispatch.submit_and_await(CounterAction::Increment).await.unwrap();
    assert_eq!(reply.engine, EngineId(0));
    assert_eq!(reply.result.state().map(|s| s.count), Some(2));

    let health = observer.health();
    assert_eq!(health[0].status, EngineStatus::Running);
    assert_eq!(health[1].status, EngineStatus::Stopped);
    assert_eq!(health[1].transition, "audit");
    assert!(!dispatch.is_closed());

    scope.close().await;
}

// ---------------------------------------------------------------------------
// Multiple engines
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broadcast_reaches_every_engine_and_requests_reach_one() {
    let scope = DispatchScope::new();
    let audit: SharedTransition<CounterAction, Counter, CounterEffect> = Arc::new(
        from_fn(|action: CounterAction, _state: &Counter, _dispatch| {
            Ok(TransitionResult::side_effect_only(CounterEffect::Logged(
                format!("{action:?}"),
            )))
        })
        .named("audit"),
    );

    let (dispatch, observer) =
        create_dispatch_group(&scope, Counter::default(), CounterTransition, vec![audit]);
    let mut effects = observer.side_effects();

    dispatch.submit(CounterAction::Increment).unwrap();
    assert_eq!(
        next_within(&mut effects, DEFAULT_WAIT).await,
        Some(CounterEffect::Logged("Increment".into()))
    );
    let settled = wait_for_version(&mut observer.states(), 1).await;
    assert_eq!(settled.value().count, 1);

    let before: u64 = observer.health().iter().map(|h| h.transitions).sum();
    dispatch
        .submit_and_await(CounterAction::LogOnly("once".into()))
        .await
        .unwrap();
    let after: u64 = observer.health().iter().map(|h| h.transitions).sum();
    assert_eq!(after - before, 1);

    scope.close().await;
}

// ---------------------------------------------------------------------------
// Reentrancy, timeouts and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn nested_await_is_rejected_instead_of_deadlocking() {
    let scope = DispatchScope::new();
    let (dispatch, observer, _gate, _entered) = gated_group(&scope, DispatchConfig::default());

    let reply = tokio::time::timeout(DEFAULT_WAIT, dispatch.submit_and_await(GateAction::Nested))
        .await
        .expect("nested await must not deadlock")
        .unwrap();
    assert_eq!(reply.result.side_effect(), Some(&"Err(Reentrant)".to_string()));
    assert_eq!(observer.state().version, 0);

    scope.close().await;
}

#[tokio::test]
async fn timed_out_waiter_is_withdrawn() {
    let scope = DispatchScope::new();
    let (dispatch, observer, gate, entered) = gated_group(&scope, DispatchConfig::default());

    dispatch.submit(GateAction::Block).unwrap();
    entered.notified().await;

    let err = dispatch
        .submit_and_await_timeout(GateAction::Bump, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::Timeout(Duration::from_millis(50)));
    assert_eq!(dispatch.pending_requests(), 0);

    // The request was still handed off, so it runs once the gate opens.
    gate.notify_one();
    wait_for_version(&mut observer.states(), 1).await;

    scope.close().await;
}

#[tokio::test]
async fn shutdown_cancels_waiting_callers() {
    let scope = DispatchScope::new();
    let (dispatch, _observer, gate, entered) =
        gated_group(&scope, DispatchConfig::default().request_capacity(1));

    let blocked = {
        let dispatch = dispatch.clone();
        tokio::spawn(async move { dispatch.submit_and_await(GateAction::Block).await })
    };
    entered.notified().await;

    // One queued in the handoff, the rest waiting for a slot.
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let dispatch = dispatch.clone();
            tokio::spawn(async move { dispatch.submit_and_await(GateAction::Bump).await })
        })
        .collect();
    tokio::time::sleep(QUIET).await;

    scope.shutdown();
    for waiter in waiters {
        let outcome = tokio::time::timeout(DEFAULT_WAIT, waiter)
            .await
            .expect("waiter must not hang")
            .unwrap();
        assert_eq!(outcome.unwrap_err(), DispatchError::Cancelled);
    }
    let outcome = tokio::time::timeout(DEFAULT_WAIT, blocked)
        .await
        .expect("in-flight caller must not hang")
        .unwrap();
    assert_eq!(outcome.unwrap_err(), DispatchError::Cancelled);

    // Let the in-flight transition finish so the loops can exit.
    gate.notify_one();
    tokio::time::timeout(DEFAULT_WAIT, scope.join())
        .await
        .expect("loops should exit after shutdown");
}

#[tokio::test]
async fn closed_scope_rejects_new_work_and_ends_streams() {
    let scope = DispatchScope::new();
    let (dispatch, observer) = counter_group(&scope, DispatchConfig::default());
    let mut states = observer.states();
    let mut effects = observer.side_effects();

    scope.close().await;

    assert_eq!(
        dispatch.submit(CounterAction::Increment).unwrap_err(),
        DispatchError::Cancelled
    );
    assert_eq!(
        dispatch.submit_and_await(CounterAction::Increment).await.unwrap_err(),
        DispatchError::Cancelled
    );

    assert_eq!(states.next().await.map(|s| s.version), Some(0));
    assert!(states.next().await.is_none());
    assert!(effects.next().await.is_none());
}

#[tokio::test]
async fn dropping_the_scope_stops_the_group() {
    let scope = DispatchScope::new();
    let (dispatch, _observer) = counter_group(&scope, DispatchConfig::default());
    drop(scope);

    assert!(dispatch.is_closed());
    assert_eq!(
        dispatch.submit_and_await(CounterAction::Increment).await.unwrap_err(),
        DispatchError::Cancelled
    );
}
