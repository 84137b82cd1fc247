//! Dependency graph of `(module, version)` vertices.
//!
//! The graph stays acyclic: an edge that would close a cycle is rejected
//! with an error naming it, and the graph is left exactly as it was.

use std::collections::HashMap;
use std::fmt;

use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::{RegistryError, Result};

/// A module at one version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Module {
    pub path: String,
    pub version: String,
}

impl Module {
    pub fn new(path: impl Into<String>, version: impl Into<String>) -> Self {
        Module {
            path: path.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_empty() {
            write!(f, "{}", self.path)
        } else {
            write!(f, "{}@{}", self.path, self.version)
        }
    }
}

/// "Parent requires child" edges between modules.
#[derive(Debug, Clone, Default)]
pub struct DepGraph {
    graph: DiGraph<Module, ()>,
    index: HashMap<Module, NodeIndex>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vertex. Adding an existing vertex is a no-op.
    pub fn add_vertex(&mut self, module: Module) -> NodeIndex {
        if let Some(idx) = self.index.get(&module) {
            return *idx;
        }
        let idx = self.graph.add_node(module.clone());
        self.index.insert(module, idx);
        idx
    }

    pub fn contains(&self, module: &Module) -> bool {
        self.index.contains_key(module)
    }

    fn node(&self, module: &Module) -> Result<NodeIndex> {
        self.index
            .get(module)
            .copied()
            .ok_or_else(|| RegistryError::UnknownModule {
                module: module.to_string(),
            })
    }

    /// Add `parent -> child`. Both must be vertices already.
    ///
    /// Fails with [`RegistryError::DependencyCycle`] if `child` already
    /// reaches `parent`. Adding an existing edge again is a no-op.
    pub fn add_edge(&mut self, parent: &Module, child: &Module) -> Result<()> {
        let p = self.node(parent)?;
        let c = self.node(child)?;
        if p == c || has_path_connecting(&self.graph, c, p, None) {
            return Err(RegistryError::DependencyCycle {
                parent: parent.to_string(),
                child: child.to_string(),
            });
        }
        if self.graph.find_edge(p, c).is_none() {
            self.graph.add_edge(p, c, ());
        }
        Ok(())
    }

    /// Direct requirements of `module`, in the order they were added.
    pub fn required(&self, module: &Module) -> Result<Vec<Module>> {
        let idx = self.node(module)?;
        let mut edges: Vec<_> = self.graph.edges(idx).collect();
        edges.sort_by_key(|e| e.id());
        Ok(edges
            .into_iter()
            .map(|e| self.graph[e.target()].clone())
            .collect())
    }

    /// All vertices in insertion order.
    pub fn vertices(&self) -> Vec<Module> {
        self.graph.node_weights().cloned().collect()
    }

    /// All edges in insertion order.
    pub fn edges(&self) -> Vec<(Module, Module)> {
        self.graph
            .edge_references()
            .map(|e| (self.graph[e.source()].clone(), self.graph[e.target()].clone()))
            .collect()
    }

    /// Versions of `path` present in the graph.
    pub fn versions_of(&self, path: &str) -> Vec<&str> {
        self.graph
            .node_weights()
            .filter(|m| m.path == path)
            .map(|m| m.version.as_str())
            .collect()
    }

    pub fn vertex_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}
