//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use acero_rs::batch::{sort_rows, ExecBatch, Value};
use acero_rs::plan::nodes::SinkGenerator;
use acero_rs::{ExecPlan, Result};
use futures::executor::block_on;
use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Install a tracing subscriber once per test binary. `RUST_LOG` overrides
/// the default `warn` filter.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

/// Start `plan`, drain `generator` and wait for the plan to finish.
pub async fn start_and_collect_async(
    plan: &ExecPlan,
    mut generator: SinkGenerator,
) -> Result<Vec<ExecBatch>> {
    plan.start_producing()?;
    let mut batches = Vec::new();
    while let Some(batch) = generator.next_batch().await? {
        batches.push(batch);
    }
    plan.finished().wait().await?;
    Ok(batches)
}

pub fn start_and_collect(plan: &ExecPlan, generator: SinkGenerator) -> Result<Vec<ExecBatch>> {
    block_on(start_and_collect_async(plan, generator))
}

/// All rows of `batches`, sorted so that results can be compared
/// regardless of arrival order.
pub fn sorted_rows(batches: &[ExecBatch]) -> Vec<Vec<Value>> {
    sort_rows(batches.iter().flat_map(|b| b.rows()).collect())
}

/// Both execution modes, for tests that should behave the same in each.
pub fn modes() -> [bool; 2] {
    [false, true]
}
