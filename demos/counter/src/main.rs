//! # Stock Counter Demo
//!
//! One dispatch group guarding a warehouse stock count. Producers reserve
//! and restock concurrently; the transition refills automatically when the
//! count runs low, and observers log every commit and side effect.
//!
//! Run with `RUST_LOG=keel_core=debug` to see the engine's own spans.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use keel_core::{
    DispatchConfig, DispatchGroupBuilder, DispatchHandle, DispatchScope, FailurePolicy,
    Transition, TransitionResult,
};
use tracing_subscriber::EnvFilter;

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Default)]
struct Stock {
    on_hand: u32,
    reserved: u32,
}

// ============================================================================
// Actions (Intent)
// ============================================================================

#[derive(Debug, Clone)]
enum StockAction {
    Restock(u32),
    Reserve { order: u32, quantity: u32 },
    /// Report the current count without changing it.
    Audit,
}

// ============================================================================
// Side Effects (Notifications)
// ============================================================================

#[derive(Debug, Clone)]
enum StockEvent {
    LowStock { on_hand: u32 },
    Reserved { order: u32, quantity: u32 },
    Audited { on_hand: u32, reserved: u32 },
}

// ============================================================================
// Transition (Decision Logic)
// ============================================================================

const REORDER_LEVEL: u32 = 5;
const REORDER_QUANTITY: u32 = 20;

struct StockTransition;

#[async_trait]
impl Transition for StockTransition {
    type Action = StockAction;
    type State = Stock;
    type SideEffect = StockEvent;

    async fn transition(
        &self,
        action: StockAction,
        stock: Arc<Stock>,
        dispatch: &DispatchHandle<StockAction, Stock, StockEvent>,
    ) -> Result<TransitionResult<Stock, StockEvent>> {
        Ok(match action {
            StockAction::Restock(quantity) => TransitionResult::mutation(Stock {
                on_hand: stock.on_hand + quantity,
                ..*stock
            }),
            StockAction::Reserve { order, quantity } => {
                if quantity > stock.on_hand {
                    bail!("order {order} wants {quantity}, only {} on hand", stock.on_hand);
                }
                let next = Stock {
                    on_hand: stock.on_hand - quantity,
                    reserved: stock.reserved + quantity,
                };
                if next.on_hand < REORDER_LEVEL {
                    // Queued behind this transition; runs once the lock is released.
                    dispatch.submit(StockAction::Restock(REORDER_QUANTITY))?;
                    TransitionResult::mutation_with(
                        next.clone(),
                        StockEvent::LowStock {
                            on_hand: next.on_hand,
                        },
                    )
                } else {
                    TransitionResult::mutation_with(next, StockEvent::Reserved { order, quantity })
                }
            }
            StockAction::Audit => TransitionResult::side_effect_only(StockEvent::Audited {
                on_hand: stock.on_hand,
                reserved: stock.reserved,
            }),
        })
    }

    fn name(&self) -> &str {
        "stock"
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("keel_core=info".parse()?)
                .add_directive("counter_demo=info".parse()?),
        )
        .init();

    let scope = DispatchScope::new();
    let config = DispatchConfig::default()
        .side_effect_buffer(16)
        .failure_policy(FailurePolicy::SkipAction);
    let (dispatch, observer) = DispatchGroupBuilder::new(Stock::default(), StockTransition)
        .with_config(config)
        .build(&scope);

    let mut states = observer.states();
    tokio::spawn(async move {
        while let Some(snapshot) = states.next().await {
            tracing::info!(version = snapshot.version, stock = ?snapshot.value(), "committed");
        }
    });

    let mut events = observer.side_effects();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            tracing::info!(?event, "side effect");
        }
    });

    let mut failures = observer.failures();
    tokio::spawn(async move {
        while let Some(failure) = failures.next().await {
            tracing::warn!(engine = %failure.engine, reason = %failure.message, "order rejected");
        }
    });

    dispatch.submit(StockAction::Restock(10))?;

    // Concurrent producers, each waiting for its own reply.
    let orders = (1..=6).map(|order| {
        let dispatch = dispatch.clone();
        tokio::spawn(async move {
            let quantity = order * 2;
            match dispatch
                .submit_and_await(StockAction::Reserve { order, quantity })
                .await
            {
                Ok(reply) => tracing::info!(order, version = reply.version, "order reserved"),
                Err(err) => tracing::warn!(order, error = %err, "order failed"),
            }
        })
    });
    for order in futures::future::join_all(orders).await {
        order?;
    }

    let audit = dispatch
        .submit_and_await_timeout(StockAction::Audit, Duration::from_secs(1))
        .await?;
    tracing::info!(audit = ?audit.result.side_effect(), "audit complete");

    for health in observer.health() {
        tracing::info!(
            engine = %health.engine,
            transition = %health.transition,
            status = ?health.status,
            transitions = health.transitions,
            failures = health.failures,
            "engine health"
        );
    }

    scope.close().await;
    tracing::info!(stock = ?observer.state().value(), "final stock");
    Ok(())
}
