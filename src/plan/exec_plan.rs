//! The execution graph and its lifecycle.
//!
//! An [`ExecPlan`] owns its nodes in an arena indexed by [`NodeId`]. Nodes
//! can only be wired to nodes that already exist, so the graph is acyclic
//! by construction and validation only has to check that every declared
//! output is bound.
//!
//! # Lifecycle
//!
//! - `start_producing` starts nodes consumers-first. On the first failure
//!   it stops the nodes that did start, most recently started first, and
//!   returns the error.
//! - `stop_producing` stops nodes producers-first. It is idempotent, and a
//!   request that arrives while the start pass is running is deferred
//!   until the pass completes.
//! - `finished` resolves once every node has finished. Any node failing
//!   stops the whole plan.

use super::completion::Completion;
use super::context::ExecContext;
use super::id::NodeId;
use super::node::{CoreArgs, ExecNode, NodeCore};
use super::observer::PlanObserver;
use super::order::ExecutionOrder;
use crate::batch::SchemaRef;
use crate::error::{ExecError, Result};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;

/// Where a plan is in its lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlanPhase {
    Unvalidated,
    Validated,
    Running,
    Stopping,
    Finished,
}

/// Graph placement of a node about to be added to a plan.
pub struct NodeSpec {
    pub label: Option<String>,
    pub inputs: Vec<Arc<dyn ExecNode>>,
    pub num_outputs: usize,
    pub output_schema: SchemaRef,
}

impl NodeSpec {
    /// A node with one output and an auto-generated label.
    pub fn new(inputs: Vec<Arc<dyn ExecNode>>, output_schema: SchemaRef) -> Self {
        Self {
            label: None,
            inputs,
            num_outputs: 1,
            output_schema,
        }
    }

    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }

    pub fn with_num_outputs(mut self, num_outputs: usize) -> Self {
        self.num_outputs = num_outputs;
        self
    }
}

#[derive(Default)]
struct PlanState {
    validated: bool,
    started: bool,
    starting: bool,
    stop_requested: bool,
    stopped: bool,
    order: Option<ExecutionOrder>,
}

pub(crate) struct PlanInner {
    ctx: ExecContext,
    nodes: RwLock<Vec<Arc<dyn ExecNode>>>,
    state: Mutex<PlanState>,
    observer: RwLock<Option<Arc<dyn PlanObserver>>>,
    start_error: Arc<Mutex<Option<ExecError>>>,
    finished: Completion,
}

/// Cloneable handle to a plan. Dropping the last handle drops every node.
#[derive(Clone)]
pub struct ExecPlan {
    inner: Arc<PlanInner>,
}

impl ExecPlan {
    pub fn make(ctx: ExecContext) -> Self {
        Self {
            inner: Arc::new(PlanInner {
                ctx,
                nodes: RwLock::new(Vec::new()),
                state: Mutex::new(PlanState::default()),
                observer: RwLock::new(None),
                start_error: Arc::new(Mutex::new(None)),
                finished: Completion::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<PlanInner>) -> Self {
        Self { inner }
    }

    /// Install an observer that sees every lifecycle call of this plan.
    pub fn with_observer(self, observer: Arc<dyn PlanObserver>) -> Self {
        *self.inner.observer.write() = Some(observer);
        self
    }

    pub fn ctx(&self) -> &ExecContext {
        &self.inner.ctx
    }

    /// Add a node. `build` receives the node's [`NodeCore`] and must not
    /// call back into this plan.
    pub fn emplace_node<N, F>(&self, spec: NodeSpec, build: F) -> Result<Arc<N>>
    where
        N: ExecNode + 'static,
        F: FnOnce(NodeCore) -> Result<N>,
    {
        if self.inner.state.lock().started {
            return Err(ExecError::invalid(
                "Cannot add nodes to an ExecPlan that has already started",
            ));
        }
        if let Some(foreign) = spec
            .inputs
            .iter()
            .find(|input| !input.core().belongs_to(&self.inner))
        {
            return Err(ExecError::invalid(format!(
                "Input node '{}' belongs to a different ExecPlan",
                foreign.label()
            )));
        }

        let mut nodes = self.inner.nodes.write();
        let id = NodeId::from_index(nodes.len());
        let (label, auto_labeled) = match spec.label {
            Some(label) if !label.is_empty() => (label, false),
            _ => (id.index().to_string(), true),
        };
        let core = NodeCore::new(CoreArgs {
            id,
            label,
            auto_labeled,
            inputs: spec.inputs.clone(),
            num_outputs: spec.num_outputs,
            output_schema: spec.output_schema,
            ctx: self.inner.ctx.clone(),
            plan: Arc::downgrade(&self.inner),
        });

        let node = Arc::new(build(core)?);
        let as_dyn: Arc<dyn ExecNode> = node.clone();
        for input in &spec.inputs {
            input.core().add_output(Arc::downgrade(&as_dyn));
        }
        tracing::debug!(
            node = %as_dyn.label(),
            kind = as_dyn.kind_name(),
            inputs = spec.inputs.len(),
            "Added node to ExecPlan"
        );
        nodes.push(as_dyn);
        drop(nodes);

        self.inner.state.lock().validated = false;
        Ok(node)
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<dyn ExecNode>> {
        self.inner.nodes.read().get(id.index()).cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<dyn ExecNode>> {
        self.inner.nodes.read().clone()
    }

    pub fn num_nodes(&self) -> usize {
        self.inner.nodes.read().len()
    }

    /// Nodes without inputs, in registration order.
    pub fn sources(&self) -> Vec<Arc<dyn ExecNode>> {
        self.nodes()
            .into_iter()
            .filter(|node| node.core().num_inputs() == 0)
            .collect()
    }

    /// Nodes whose output nobody consumes, in registration order.
    pub fn sinks(&self) -> Vec<Arc<dyn ExecNode>> {
        self.nodes()
            .into_iter()
            .filter(|node| node.core().num_bound_outputs() == 0)
            .collect()
    }

    pub fn phase(&self) -> PlanPhase {
        let state = self.inner.state.lock();
        if self.inner.finished.is_finished() {
            PlanPhase::Finished
        } else if state.stopped {
            PlanPhase::Stopping
        } else if state.started {
            PlanPhase::Running
        } else if state.validated {
            PlanPhase::Validated
        } else {
            PlanPhase::Unvalidated
        }
    }

    /// Check that the plan has nodes and that every declared output is
    /// bound. Has no effect on the graph and may be called repeatedly.
    pub fn validate(&self) -> Result<()> {
        validate_nodes(&self.nodes())?;
        self.inner.state.lock().validated = true;
        Ok(())
    }

    /// Start every node, consumers before producers.
    ///
    /// Fails with `Invalid` if the plan was started (or stopped) before.
    pub fn start_producing(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.started {
                return Err(ExecError::invalid(
                    "restarted ExecPlan that has already been started",
                ));
            }
            state.started = true;
            state.starting = true;
        }

        let nodes = self.nodes();
        let order = match validate_nodes(&nodes).and_then(|_| compute_order(&nodes)) {
            Ok(order) => order,
            Err(err) => {
                tracing::warn!(error = %err, "ExecPlan failed validation at start");
                self.abort(&nodes, err.clone());
                return Err(err);
            }
        };
        self.inner.state.lock().order = Some(order.clone());

        self.install_fail_fast(&nodes);
        self.arm_completion(&nodes);
        let observer = self.observer();

        tracing::info!(nodes = nodes.len(), "Starting ExecPlan");
        let mut started: Vec<Arc<dyn ExecNode>> = Vec::with_capacity(nodes.len());
        let mut failure = None;
        for id in order.start_order() {
            let node = &nodes[id.index()];
            tracing::debug!(node = %node.label(), kind = node.kind_name(), "Starting node");
            let result = node.start_producing();
            if let Some(observer) = &observer {
                observer.on_start(node.as_ref(), &result);
            }
            match result {
                Ok(()) => started.push(node.clone()),
                Err(err) => {
                    failure = Some((id, err));
                    break;
                }
            }
        }

        let Some((failed, err)) = failure else {
            let deferred_stop = {
                let mut state = self.inner.state.lock();
                state.starting = false;
                state.stop_requested
            };
            if deferred_stop {
                self.stop_producing();
            }
            return Ok(());
        };

        tracing::warn!(
            node = %nodes[failed.index()].label(),
            error = %err,
            "Node failed to start, stopping started nodes"
        );
        {
            let mut state = self.inner.state.lock();
            state.starting = false;
            state.stopped = true;
        }
        *self.inner.start_error.lock() = Some(err.clone());

        let mut reached = vec![false; nodes.len()];
        for node in &started {
            reached[node.id().index()] = true;
        }
        for node in &nodes {
            if node.id() == failed {
                node.core().mark_finished(Err(err.clone()));
            } else if !reached[node.id().index()] {
                node.core().mark_finished(Ok(()));
            }
        }
        for node in started.iter().rev() {
            self.stop_node(node, &observer);
        }
        Err(err)
    }

    /// Ask every node to wind down, producers before consumers.
    pub fn stop_producing(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return;
            }
            if state.starting {
                state.stop_requested = true;
                return;
            }
            state.stopped = true;
            if !state.started {
                // A plan stopped before it started can never start.
                state.started = true;
                drop(state);
                tracing::debug!("Stopping ExecPlan that never started");
                let nodes = self.nodes();
                self.arm_completion(&nodes);
                let observer = self.observer();
                match compute_order(&nodes) {
                    Ok(order) => {
                        for id in order.stop_order() {
                            self.stop_node(&nodes[id.index()], &observer);
                        }
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "No execution order, stopping in registration order");
                        for node in &nodes {
                            self.stop_node(node, &observer);
                        }
                    }
                }
                // Nodes whose stop hook does not finish them still resolve.
                for node in &nodes {
                    node.core().mark_finished(Ok(()));
                }
                return;
            }
        }

        let nodes = self.nodes();
        let order = self.inner.state.lock().order.clone().unwrap_or_default();
        let observer = self.observer();
        tracing::info!(nodes = nodes.len(), "Stopping ExecPlan");
        for id in order.stop_order() {
            if let Some(node) = nodes.get(id.index()) {
                self.stop_node(node, &observer);
            }
        }
    }

    /// Resolves once every node has finished: ok, or the first error in
    /// node registration order (a start failure takes precedence).
    pub fn finished(&self) -> &Completion {
        &self.inner.finished
    }

    fn observer(&self) -> Option<Arc<dyn PlanObserver>> {
        self.inner.observer.read().clone()
    }

    fn stop_node(&self, node: &Arc<dyn ExecNode>, observer: &Option<Arc<dyn PlanObserver>>) {
        tracing::debug!(node = %node.label(), kind = node.kind_name(), "Stopping node");
        node.stop_producing();
        if let Some(observer) = observer {
            observer.on_stop(node.as_ref());
        }
    }

    /// Finish a plan that will never run: every node resolves ok and the
    /// plan resolves with `err`.
    fn abort(&self, nodes: &[Arc<dyn ExecNode>], err: ExecError) {
        {
            let mut state = self.inner.state.lock();
            state.starting = false;
            state.stopped = true;
        }
        *self.inner.start_error.lock() = Some(err);
        self.arm_completion(nodes);
        for node in nodes {
            node.core().mark_finished(Ok(()));
        }
    }

    /// Stop the plan as soon as any node fails.
    fn install_fail_fast(&self, nodes: &[Arc<dyn ExecNode>]) {
        for node in nodes {
            let plan = Arc::downgrade(&self.inner);
            let label = node.label().to_string();
            node.finished().on_complete(move |result| {
                let Err(err) = result else { return };
                if let Some(inner) = plan.upgrade() {
                    tracing::warn!(node = %label, error = %err, "Node failed, stopping ExecPlan");
                    ExecPlan::from_inner(inner).stop_producing();
                }
            });
        }
    }

    /// Wire the plan's completion to its nodes'.
    fn arm_completion(&self, nodes: &[Arc<dyn ExecNode>]) {
        if let Some(observer) = self.observer() {
            for node in nodes {
                let weak = Arc::downgrade(node);
                let observer = observer.clone();
                node.finished().on_complete(move |result| {
                    if let Some(node) = weak.upgrade() {
                        observer.on_finished(node.as_ref(), result);
                    }
                });
            }
        }

        let completions: Vec<Completion> = nodes.iter().map(|n| n.finished().clone()).collect();
        let start_error = self.inner.start_error.clone();
        let finished = self.inner.finished.clone();
        Completion::all(&completions).on_complete(move |result| {
            let result = match start_error.lock().clone() {
                Some(err) => Err(err),
                None => result.clone(),
            };
            match &result {
                Ok(()) => tracing::info!("ExecPlan finished"),
                Err(err) => tracing::info!(error = %err, "ExecPlan finished with error"),
            }
            finished.mark_finished(result);
        });
    }
}

fn validate_nodes(nodes: &[Arc<dyn ExecNode>]) -> Result<()> {
    if nodes.is_empty() {
        return Err(ExecError::invalid("ExecPlan has no node"));
    }
    for node in nodes {
        let bound = node.core().num_bound_outputs();
        if bound != node.num_outputs() {
            return Err(ExecError::invalid(format!(
                "Node '{}' ({}) declares {} outputs but {} are bound: output not bound",
                node.label(),
                node.kind_name(),
                node.num_outputs(),
                bound
            )));
        }
    }
    Ok(())
}

fn compute_order(nodes: &[Arc<dyn ExecNode>]) -> Result<ExecutionOrder> {
    let inputs: Vec<Vec<NodeId>> = nodes
        .iter()
        .map(|node| node.core().input_ids().to_vec())
        .collect();
    ExecutionOrder::compute(&inputs)
}

fn print_subtree(f: &mut fmt::Formatter<'_>, node: &Arc<dyn ExecNode>, indent: usize) -> fmt::Result {
    writeln!(f, "{}{}", " ".repeat(indent), node.to_string_indented(indent))?;
    for input in node.inputs().iter().rev() {
        print_subtree(f, input, indent + 2)?;
    }
    Ok(())
}

impl fmt::Display for ExecPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ExecPlan with {} nodes:", self.num_nodes())?;
        for sink in self.sinks() {
            print_subtree(f, &sink, 0)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ExecPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecPlan")
            .field("nodes", &self.num_nodes())
            .field("phase", &self.phase())
            .finish()
    }
}

impl Drop for PlanInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.started && !state.stopped && !self.finished.is_finished() {
            tracing::warn!("ExecPlan dropped while running, stopping nodes");
            for node in self.nodes.get_mut().iter() {
                node.stop_producing();
            }
        }
    }
}
