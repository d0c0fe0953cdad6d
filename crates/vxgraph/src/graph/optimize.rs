//! Two-pass layout optimization.
//!
//! Every node is visited once forward in topological order, then once backward in reverse
//! order. Operators use the passes to alias tensors into neighbouring buffers (views) so that
//! copies disappear; each visit returns an [`OptimizeDecision`] that is folded into a
//! [`PassResult`] per direction.

use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::graph::GraphContext;
use crate::node::NodeUid;
use crate::tensor::TensorDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptimizeDirection {
    Forward,
    Backward,
}

impl fmt::Display for OptimizeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OptimizeDirection::Forward => "forward",
            OptimizeDirection::Backward => "backward",
        })
    }
}

/// Outcome of one node visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizeDecision {
    /// Nothing to do for this node.
    Skip,
    /// The node acts in the other direction.
    Deferred,
    /// Buffers were created for this many tensors.
    Materialized(usize),
    /// This many tensors now alias a neighbour's buffer.
    Aliased(usize),
}

/// Counters for one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    pub visited: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub materialized: usize,
    pub aliased: usize,
}

impl PassResult {
    pub fn record(&mut self, decision: OptimizeDecision) {
        self.visited += 1;
        match decision {
            OptimizeDecision::Skip => self.skipped += 1,
            OptimizeDecision::Deferred => self.deferred += 1,
            OptimizeDecision::Materialized(count) => self.materialized += count,
            OptimizeDecision::Aliased(count) => self.aliased += count,
        }
    }

    /// Merges two pass results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            visited: self.visited + other.visited,
            skipped: self.skipped + other.skipped,
            deferred: self.deferred + other.deferred,
            materialized: self.materialized + other.materialized,
            aliased: self.aliased + other.aliased,
        }
    }
}

/// One node visit, in the order the pass made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizeVisit {
    pub node: NodeUid,
    pub parent: Option<NodeUid>,
    pub direction: OptimizeDirection,
    pub decision: OptimizeDecision,
}

/// Both passes of one graph build.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OptimizeReport {
    pub forward: PassResult,
    pub backward: PassResult,
    pub visits: Vec<OptimizeVisit>,
}

/// Graph context plus the direction of the pass in progress.
pub struct OptimizeContext<'a> {
    cx: &'a mut GraphContext,
    direction: OptimizeDirection,
    visits: Vec<OptimizeVisit>,
}

impl<'a> OptimizeContext<'a> {
    pub(crate) fn new(cx: &'a mut GraphContext, direction: OptimizeDirection) -> Self {
        OptimizeContext {
            cx,
            direction,
            visits: Vec::new(),
        }
    }

    pub fn direction(&self) -> OptimizeDirection {
        self.direction
    }

    pub(crate) fn record_visit(&mut self, visit: OptimizeVisit) {
        self.visits.push(visit);
    }

    pub(crate) fn into_visits(self) -> Vec<OptimizeVisit> {
        self.visits
    }
}

impl Deref for OptimizeContext<'_> {
    type Target = GraphContext;

    fn deref(&self) -> &GraphContext {
        self.cx
    }
}

impl DerefMut for OptimizeContext<'_> {
    fn deref_mut(&mut self) -> &mut GraphContext {
        self.cx
    }
}

/// Decides whether a node's inputs or outputs can become views of a neighbour's buffer.
pub trait ViewPredicate {
    fn can_alias(&self, inputs: &[&TensorDescriptor], outputs: &[&TensorDescriptor]) -> bool;
}
