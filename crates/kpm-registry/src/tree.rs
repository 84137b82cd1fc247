//! Dependency tree display.
//!
//! Formats a dependency graph as a human-readable ASCII tree:
//! ```text
//! app@0.1.0
//! ├── konfig@0.4.0
//! │   └── k8s@1.28.0
//! │       └── crd@0.1.0
//! └── helloworld@0.1.2
//!     └── k8s@1.28.0 (shared)
//!
//! 5 dependencies (4 unique)
//! ```
//! A module with requirements of its own is marked `(shared)` when it is
//! reached a second time, and is not expanded again. A shared leaf is
//! simply listed again.

use std::collections::HashSet;

use indexmap::IndexMap;

use kpm_core::Dependency;

use crate::error::Result;
use crate::graph::{DepGraph, Module};

/// Format the tree of everything `root` requires.
pub fn format_tree(graph: &DepGraph, root: &Module) -> Result<String> {
    let mut out = format!("{root}\n");
    let mut seen = HashSet::new();
    seen.insert(root.clone());

    let children = graph.required(root)?;
    let count = children.len();
    let mut total = 0;
    for (i, child) in children.iter().enumerate() {
        total += format_dep(&mut out, graph, child, "", i == count - 1, &mut seen)?;
    }

    // Summary line
    out.push_str(&format!(
        "\n{} dependencies ({} unique)\n",
        total,
        seen.len() - 1
    ));
    Ok(out)
}

/// Recursively format one module; returns the number of lines written.
fn format_dep(
    out: &mut String,
    graph: &DepGraph,
    module: &Module,
    prefix: &str,
    is_last: bool,
    seen: &mut HashSet<Module>,
) -> Result<usize> {
    let connector = if is_last { "└── " } else { "├── " };
    let first_visit = seen.insert(module.clone());
    let children = graph.required(module)?;
    let shared_marker = if !first_visit && !children.is_empty() {
        " (shared)"
    } else {
        ""
    };
    out.push_str(&format!("{prefix}{connector}{module}{shared_marker}\n"));
    if !first_visit {
        return Ok(1);
    }

    let child_prefix = if is_last {
        format!("{prefix}    ")
    } else {
        format!("{prefix}│   ")
    };

    let mut lines = 1;
    let child_count = children.len();
    for (i, child) in children.iter().enumerate() {
        lines += format_dep(out, graph, child, &child_prefix, i == child_count - 1, seen)?;
    }
    Ok(lines)
}

/// Format every edge as `parent child`, one per line.
pub fn format_graph(graph: &DepGraph) -> String {
    let mut out = String::new();
    for (parent, child) in graph.edges() {
        out.push_str(&format!("{parent} {child}\n"));
    }
    out
}

/// Format a flat list of locked dependencies (lock file style).
pub fn format_lock(locked: &IndexMap<String, Dependency>) -> String {
    let mut out = String::new();
    for dep in locked.values() {
        let version = if dep.version.is_empty() {
            String::new()
        } else {
            format!(" {}", dep.version)
        };
        let hash = if dep.sum.is_empty() {
            String::new()
        } else {
            format!(" (sha256:{:.12})", dep.sum)
        };
        out.push_str(&format!("{}{version}{hash}\n", dep.name));
    }
    out
}
