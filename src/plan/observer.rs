//! Lifecycle observation hooks.
//!
//! A [`PlanObserver`] installed on a plan sees every start and stop call the
//! runtime makes and every node completion. Tests use it to check ordering;
//! applications can use it for tracing or metrics.

use super::node::ExecNode;
use crate::error::Result;
use parking_lot::Mutex;

pub trait PlanObserver: Send + Sync {
    /// `node.start_producing()` returned `result`.
    fn on_start(&self, _node: &dyn ExecNode, _result: &Result<()>) {}

    /// The runtime called `node.stop_producing()`.
    fn on_stop(&self, _node: &dyn ExecNode) {}

    /// `node` resolved its completion with `result`.
    fn on_finished(&self, _node: &dyn ExecNode, _result: &Result<()>) {}
}

/// Observer that records node labels in call order.
#[derive(Debug, Default)]
pub struct LifecycleRecorder {
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
}

impl LifecycleRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Labels of nodes whose start hook succeeded or failed, in call order.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().clone()
    }

    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().clone()
    }
}

impl PlanObserver for LifecycleRecorder {
    fn on_start(&self, node: &dyn ExecNode, _result: &Result<()>) {
        self.started.lock().push(node.label().to_string());
    }

    fn on_stop(&self, node: &dyn ExecNode) {
        self.stopped.lock().push(node.label().to_string());
    }

    fn on_finished(&self, node: &dyn ExecNode, _result: &Result<()>) {
        self.finished.lock().push(node.label().to_string());
    }
}
