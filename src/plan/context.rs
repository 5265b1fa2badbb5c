//! Per-plan execution context.

use super::backpressure::BackpressureOptions;
use super::scheduler::{Executor, SerialExecutor, ThreadPool};
use crate::config::ExecConfig;
use crate::error::Result;
use std::sync::Arc;

/// Largest batch, in rows, that any node forwards downstream. Larger
/// batches are sliced before delivery.
pub const MAX_BATCH_SIZE: usize = 1 << 15;

/// Default rows per batch produced by a table source.
pub const DEFAULT_TABLE_SOURCE_BATCH_SIZE: usize = 1 << 20;

/// Shared by every node of a plan: where tasks run and the knobs nodes read
/// at construction.
#[derive(Debug, Clone)]
pub struct ExecContext {
    executor: Arc<dyn Executor>,
    table_source_batch_size: usize,
    sink_backpressure: Option<BackpressureOptions>,
}

impl ExecContext {
    /// Everything runs inline on the thread that drives the plan.
    pub fn serial() -> Self {
        Self::with_executor(Arc::new(SerialExecutor))
    }

    /// Tasks are dispatched to the process-wide thread pool.
    pub fn threaded() -> Result<Self> {
        let pool: Arc<dyn Executor> = ThreadPool::global()?;
        Ok(Self::with_executor(pool))
    }

    /// `threaded()` when `use_threads` is set, `serial()` otherwise.
    pub fn for_threads(use_threads: bool) -> Result<Self> {
        if use_threads {
            Self::threaded()
        } else {
            Ok(Self::serial())
        }
    }

    pub fn with_executor(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            table_source_batch_size: DEFAULT_TABLE_SOURCE_BATCH_SIZE,
            sink_backpressure: None,
        }
    }

    pub fn from_config(config: &ExecConfig) -> Result<Self> {
        config.validate()?;
        let mut ctx = match (config.use_threads, config.worker_threads) {
            (false, _) => Self::serial(),
            (true, None) => Self::threaded()?,
            (true, Some(workers)) => {
                let pool: Arc<dyn Executor> = Arc::new(ThreadPool::new(workers)?);
                Self::with_executor(pool)
            }
        };
        ctx.table_source_batch_size = config.table_source_batch_size;
        ctx.sink_backpressure = config.sink_backpressure;
        Ok(ctx)
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn use_threads(&self) -> bool {
        self.executor.is_parallel()
    }

    pub fn table_source_batch_size(&self) -> usize {
        self.table_source_batch_size
    }

    /// Backpressure applied by generator sinks that do not set their own.
    pub fn sink_backpressure(&self) -> Option<BackpressureOptions> {
        self.sink_backpressure
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::serial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_context() {
        let ctx = ExecContext::default();
        assert!(!ctx.use_threads());
        assert_eq!(ctx.table_source_batch_size(), DEFAULT_TABLE_SOURCE_BATCH_SIZE);
    }

    #[test]
    fn test_context_from_config() {
        let config = ExecConfig {
            use_threads: true,
            worker_threads: Some(2),
            table_source_batch_size: 16,
            sink_backpressure: Some(BackpressureOptions::new(1, 2)),
        };
        let ctx = ExecContext::from_config(&config).unwrap();
        assert!(ctx.use_threads());
        assert_eq!(ctx.executor().parallelism(), 2);
        assert_eq!(ctx.table_source_batch_size(), 16);
        assert_eq!(ctx.sink_backpressure(), Some(BackpressureOptions::new(1, 2)));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ExecConfig {
            use_threads: true,
            worker_threads: Some(0),
            ..ExecConfig::default()
        };
        assert!(ExecContext::from_config(&config).is_err());
    }
}
