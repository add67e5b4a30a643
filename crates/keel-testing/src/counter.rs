//! Counter fixture.

use std::sync::Arc;

use anyhow::{bail, Result};
use keel_core::{async_trait, DispatchHandle, Transition, TransitionResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counter {
    pub count: i64,
}

impl Counter {
    pub fn new(count: i64) -> Self {
        Self { count }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterAction {
    Increment,
    Decrement,
    Add(i64),
    /// Emits `Logged` without touching the state.
    LogOnly(String),
    /// Commits a state equal to the current one.
    Touch,
    /// Submits `times` increments from inside the transition.
    Fanout(u32),
    /// Returns an error.
    Fail(String),
    Panic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterEffect {
    Logged(String),
    Changed { from: i64, to: i64 },
}

pub type CounterHandle = DispatchHandle<CounterAction, Counter, CounterEffect>;

/// Reference transition for [`CounterAction`].
///
/// `Add` reports a `Changed` side effect; `Increment`/`Decrement` do not.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterTransition;

#[async_trait]
impl Transition for CounterTransition {
    type Action = CounterAction;
    type State = Counter;
    type SideEffect = CounterEffect;

    async fn transition(
        &self,
        action: CounterAction,
        state: Arc<Counter>,
        dispatch: &CounterHandle,
    ) -> Result<TransitionResult<Counter, CounterEffect>> {
        let count = state.count;
        Ok(match action {
            CounterAction::Increment => TransitionResult::mutation(Counter::new(count + 1)),
            CounterAction::Decrement => TransitionResult::mutation(Counter::new(count - 1)),
            CounterAction::Add(delta) => TransitionResult::mutation_with(
                Counter::new(count + delta),
                CounterEffect::Changed {
                    from: count,
                    to: count + delta,
                },
            ),
            CounterAction::LogOnly(message) => {
                TransitionResult::side_effect_only(CounterEffect::Logged(message))
            }
            CounterAction::Touch => TransitionResult::mutation(Counter::new(count)),
            CounterAction::Fanout(times) => {
                for _ in 0..times {
                    dispatch.submit(CounterAction::Increment)?;
                }
                TransitionResult::no_mutation()
            }
            CounterAction::Fail(reason) => bail!(reason),
            CounterAction::Panic => panic!("counter transition asked to panic"),
        })
    }

    fn name(&self) -> &str {
        "counter"
    }
}
