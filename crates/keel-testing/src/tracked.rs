use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use keel_core::{async_trait, DispatchHandle, Transition, TransitionResult};

/// Counters collected by a [`Tracked`].
#[derive(Debug, Default)]
pub struct CallStats {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl CallStats {
    /// Invocations started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of invocations observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a CallStats);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transparent wrapper that measures how a transition is invoked.
///
/// ```ignore
/// let (tracked, stats) = Tracked::new(CounterTransition);
/// let (dispatch, _observer) =
///     DispatchGroupBuilder::new(Counter::default(), tracked).build(&scope);
/// // ... drive the group ...
/// assert_eq!(stats.max_in_flight(), 1);
/// ```
pub struct Tracked<T> {
    inner: T,
    stats: Arc<CallStats>,
}

impl<T: Transition> Tracked<T> {
    pub fn new(inner: T) -> (Self, Arc<CallStats>) {
        let stats = Arc::new(CallStats::default());
        (
            Self {
                inner,
                stats: Arc::clone(&stats),
            },
            stats,
        )
    }
}

#[async_trait]
impl<T: Transition> Transition for Tracked<T> {
    type Action = T::Action;
    type State = T::State;
    type SideEffect = T::SideEffect;

    async fn transition(
        &self,
        action: T::Action,
        state: Arc<T::State>,
        dispatch: &DispatchHandle<T::Action, T::State, T::SideEffect>,
    ) -> Result<TransitionResult<T::State, T::SideEffect>> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.stats);

        // Give other tasks a chance to run while we are "inside".
        tokio::task::yield_now().await;
        self.inner.transition(action, state, dispatch).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
