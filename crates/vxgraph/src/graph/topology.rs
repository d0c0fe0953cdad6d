use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::node::{Node, NodeUid};
use crate::tensor::TensorId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// Two nodes write the same tensor.
    MultipleProducers {
        tensor: TensorId,
        first: NodeUid,
        second: NodeUid,
    },
    /// These nodes wait on each other.
    Cycle { nodes: Vec<NodeUid> },
    /// A node reads a tensor whose producer runs after it.
    Unordered { tensor: TensorId, node: NodeUid },
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyError::MultipleProducers {
                tensor,
                first,
                second,
            } => write!(f, "tensor {tensor} is written by both node {first} and node {second}"),
            TopologyError::Cycle { nodes } => {
                write!(f, "nodes form a cycle:")?;
                for node in nodes {
                    write!(f, " {node}")?;
                }
                Ok(())
            }
            TopologyError::Unordered { tensor, node } => write!(
                f,
                "tensor {tensor} is read by node {node} before it is produced"
            ),
        }
    }
}

impl std::error::Error for TopologyError {}

fn producers(nodes: &[Node]) -> Result<HashMap<TensorId, usize>, TopologyError> {
    let mut producers = HashMap::new();
    for (index, node) in nodes.iter().enumerate() {
        for &tensor in node.outputs().iter().flatten() {
            if let Some(first) = producers.insert(tensor, index) {
                return Err(TopologyError::MultipleProducers {
                    tensor,
                    first: nodes[first].uid(),
                    second: node.uid(),
                });
            }
        }
    }
    Ok(producers)
}

/// Execution order of `nodes` as indices, producers before consumers.
///
/// Ties keep insertion order, so an already ordered graph comes back unchanged. Tensors no
/// node produces are graph inputs or constants and are always available.
pub fn sort_nodes(nodes: &[Node]) -> Result<Vec<usize>, TopologyError> {
    let producers = producers(nodes)?;
    let mut pending = vec![0usize; nodes.len()];
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (index, node) in nodes.iter().enumerate() {
        for tensor in node.inputs().iter().flatten() {
            if let Some(&producer) = producers.get(tensor) {
                pending[index] += 1;
                consumers[producer].push(index);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(index) = ready.pop_first() {
        order.push(index);
        for &consumer in &consumers[index] {
            pending[consumer] -= 1;
            if pending[consumer] == 0 {
                ready.insert(consumer);
            }
        }
    }

    if order.len() != nodes.len() {
        let nodes = (0..nodes.len())
            .filter(|&i| pending[i] > 0)
            .map(|i| nodes[i].uid())
            .collect();
        return Err(TopologyError::Cycle { nodes });
    }
    Ok(order)
}

/// Checks that running `nodes` in `order` never reads a tensor before its producer ran.
pub fn validate_topology(nodes: &[Node], order: &[usize]) -> Result<(), TopologyError> {
    let producers = producers(nodes)?;
    let mut done = vec![false; nodes.len()];
    for &index in order {
        let node = &nodes[index];
        for &tensor in node.inputs().iter().flatten() {
            if let Some(&producer) = producers.get(&tensor) {
                if !done[producer] {
                    return Err(TopologyError::Unordered {
                        tensor,
                        node: node.uid(),
                    });
                }
            }
        }
        done[index] = true;
    }
    Ok(())
}
