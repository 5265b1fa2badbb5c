//! Lifecycle ordering for a plan's DAG.
//!
//! Start and stop walk the graph in mirrored orders: stop follows a
//! topological order (producers first), start follows its reverse
//! (consumers first). Ties are broken by registration index so that both
//! orders are reproducible.

use super::id::NodeId;
use crate::error::{ExecError, Result};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Pre-computed lifecycle order of a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOrder {
    /// Producers before consumers.
    pub topological: Vec<NodeId>,

    /// Nodes without inputs, in registration order.
    pub sources: Vec<NodeId>,

    /// Nodes without bound outputs, in registration order.
    pub sinks: Vec<NodeId>,
}

impl ExecutionOrder {
    /// Compute the order for a graph given, per node, the ids of its inputs.
    /// An input listed twice counts as two edges.
    pub fn compute(inputs: &[Vec<NodeId>]) -> Result<Self> {
        let n = inputs.len();

        // Build forward adjacency and in-degrees
        let mut fwd_adj = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];
        for (consumer, node_inputs) in inputs.iter().enumerate() {
            for input in node_inputs {
                let producer = input.index();
                if producer >= n {
                    return Err(ExecError::invalid(format!(
                        "Node {} refers to unknown input {:?}",
                        consumer, input
                    )));
                }
                fwd_adj[producer].push(consumer);
                in_degree[consumer] += 1;
            }
        }

        let sources: Vec<NodeId> = (0..n)
            .filter(|&i| inputs[i].is_empty())
            .map(NodeId::from_index)
            .collect();
        let sinks: Vec<NodeId> = (0..n)
            .filter(|&i| fwd_adj[i].is_empty())
            .map(NodeId::from_index)
            .collect();

        // Kahn's algorithm, always taking the lowest ready index
        let mut ready: BinaryHeap<Reverse<usize>> =
            (0..n).filter(|&i| in_degree[i] == 0).map(Reverse).collect();
        let mut topological = Vec::with_capacity(n);
        while let Some(Reverse(node)) = ready.pop() {
            topological.push(NodeId::from_index(node));
            for &next in &fwd_adj[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if topological.len() != n {
            return Err(ExecError::invalid("ExecPlan contains a cycle"));
        }

        Ok(Self {
            topological,
            sources,
            sinks,
        })
    }

    /// Consumers before producers.
    pub fn start_order(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.topological.iter().rev().copied()
    }

    /// Producers before consumers.
    pub fn stop_order(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.topological.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(raw: &[u32]) -> Vec<NodeId> {
        raw.iter().map(|&i| NodeId(i)).collect()
    }

    #[test]
    fn test_diamond_with_shared_inputs() {
        // source1, source2, process1, process2, process3, sink
        let inputs = vec![
            vec![],
            vec![],
            ids(&[0]),
            ids(&[2, 1]),
            ids(&[2, 0, 3]),
            ids(&[4]),
        ];
        let order = ExecutionOrder::compute(&inputs).unwrap();
        assert_eq!(order.topological, ids(&[0, 1, 2, 3, 4, 5]));
        assert_eq!(order.start_order().collect::<Vec<_>>(), ids(&[5, 4, 3, 2, 1, 0]));
        assert_eq!(order.sources, ids(&[0, 1]));
        assert_eq!(order.sinks, ids(&[5]));
    }

    #[test]
    fn test_empty_graph() {
        let order = ExecutionOrder::compute(&[]).unwrap();
        assert!(order.topological.is_empty());
        assert!(order.sinks.is_empty());
    }

    #[test]
    fn test_cycle_is_rejected() {
        let inputs = vec![ids(&[1]), ids(&[0])];
        assert!(ExecutionOrder::compute(&inputs).is_err());
    }

    #[test]
    fn test_unknown_input_is_rejected() {
        let inputs = vec![ids(&[3])];
        assert!(ExecutionOrder::compute(&inputs).is_err());
    }

    fn dag() -> impl Strategy<Value = Vec<Vec<NodeId>>> {
        (1usize..24).prop_flat_map(|n| {
            (0..n)
                .map(|i| {
                    if i == 0 {
                        Just(Vec::new()).boxed()
                    } else {
                        prop::collection::vec(0..i as u32, 0..4)
                            .prop_map(|v| v.into_iter().map(NodeId).collect())
                            .boxed()
                    }
                })
                .collect::<Vec<_>>()
        })
    }

    proptest! {
        #[test]
        fn prop_every_producer_precedes_its_consumers(inputs in dag()) {
            let order = ExecutionOrder::compute(&inputs).unwrap();
            prop_assert_eq!(order.topological.len(), inputs.len());
            let mut position = vec![0usize; inputs.len()];
            for (pos, id) in order.topological.iter().enumerate() {
                position[id.index()] = pos;
            }
            for (consumer, node_inputs) in inputs.iter().enumerate() {
                for input in node_inputs {
                    prop_assert!(position[input.index()] < position[consumer]);
                }
            }
        }

        #[test]
        fn prop_order_is_deterministic(inputs in dag()) {
            let first = ExecutionOrder::compute(&inputs).unwrap();
            let second = ExecutionOrder::compute(&inputs).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
