//! Structured failure records kept alongside the `tracing` events.

use std::fmt;

use crate::node::NodeUid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Init,
    Check,
    Setup,
    Optimize,
    Compute,
    Execute,
    Deinit,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Init => "init",
            Phase::Check => "check",
            Phase::Setup => "setup",
            Phase::Optimize => "optimize",
            Phase::Compute => "compute",
            Phase::Execute => "execute",
            Phase::Deinit => "deinit",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub phase: Phase,
    pub node: NodeUid,
    /// Set for nodes created by an internal workspace.
    pub parent: Option<NodeUid>,
    pub op: &'static str,
    pub reason: String,
}

/// Most recent diagnostics of one graph, oldest dropped first.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
    capacity: usize,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Diagnostics::with_capacity(64)
    }
}

impl Diagnostics {
    pub fn with_capacity(capacity: usize) -> Self {
        Diagnostics {
            entries: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn emit(&mut self, diagnostic: Diagnostic) {
        tracing::error!(
            phase = %diagnostic.phase,
            node = diagnostic.node.0,
            parent = diagnostic.parent.map(|uid| uid.0),
            op = diagnostic.op,
            reason = %diagnostic.reason,
            "{} node {} ({}) failed",
            diagnostic.phase,
            diagnostic.node,
            diagnostic.op
        );
        if self.entries.len() == self.capacity {
            self.entries.remove(0);
        }
        self.entries.push(diagnostic);
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn last(&self) -> Option<&Diagnostic> {
        self.entries.last()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
