//! Dependency resolution between sibling children of one tier.
//!
//! Given the current child records, partitions the PENDING children into
//! those eligible to launch now, those still waiting, and those that must
//! be discarded because a dependency verdict went the wrong way. Also
//! detects dependency cycles at expansion time, before anything launches.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::domain::models::{ChildRecord, ChildResult, ChildState};

/// Outcome of one resolver pass over the PENDING children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub launch_now: Vec<String>,
    pub still_waiting: Vec<String>,
    pub abort: Vec<String>,
}

/// How one dependency edge currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeStanding {
    Satisfied,
    Violated,
    /// The named sibling does not exist, so this edge can never resolve.
    Unsatisfiable,
    Waiting,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Partition the PENDING children. Children are evaluated in ident
    /// order, which breaks ties deterministically.
    pub fn partition(&self, children: &BTreeMap<String, ChildRecord>) -> Partition {
        let mut partition = Partition::default();
        for (ident, record) in children {
            if record.state != ChildState::Pending {
                continue;
            }
            let mut verdict = EdgeStanding::Satisfied;
            let edges = [
                (record.spec.on_done(), EdgeKind::OnDone),
                (record.spec.on_pass(), EdgeKind::OnPass),
                (record.spec.on_fail(), EdgeKind::OnFail),
            ];
            'edges: for (deps, kind) in edges {
                for dep in deps {
                    match standing(children.get(dep), kind) {
                        EdgeStanding::Violated => {
                            verdict = EdgeStanding::Violated;
                            break 'edges;
                        }
                        EdgeStanding::Unsatisfiable => {
                            verdict = EdgeStanding::Unsatisfiable;
                        }
                        EdgeStanding::Waiting if verdict == EdgeStanding::Satisfied => {
                            verdict = EdgeStanding::Waiting;
                        }
                        _ => {}
                    }
                }
            }
            match verdict {
                EdgeStanding::Violated | EdgeStanding::Unsatisfiable => {
                    partition.abort.push(ident.clone());
                }
                EdgeStanding::Satisfied => partition.launch_now.push(ident.clone()),
                EdgeStanding::Waiting => partition.still_waiting.push(ident.clone()),
            }
        }
        partition
    }

    /// Detect a cycle over the union of `on_done`, `on_pass`, and `on_fail`
    /// edges. Returns the idents along one cycle when found.
    pub fn detect_cycle(&self, children: &BTreeMap<String, ChildRecord>) -> Option<Vec<String>> {
        let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
        for (ident, record) in children {
            let deps = graph.entry(ident.as_str()).or_default();
            deps.extend(record.spec.on_done().iter().map(String::as_str));
            deps.extend(record.spec.on_pass().iter().map(String::as_str));
            deps.extend(record.spec.on_fail().iter().map(String::as_str));
        }

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();
        for ident in children.keys() {
            if !visited.contains(ident.as_str())
                && walk(ident, &graph, &mut visited, &mut rec_stack, &mut path)
            {
                return Some(path.into_iter().map(str::to_string).collect());
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy)]
enum EdgeKind {
    OnDone,
    OnPass,
    OnFail,
}

fn standing(sibling: Option<&ChildRecord>, kind: EdgeKind) -> EdgeStanding {
    let Some(sibling) = sibling else {
        // Unknown names are rejected at expansion; a missing record here can
        // never complete.
        return EdgeStanding::Unsatisfiable;
    };
    if sibling.state != ChildState::Complete {
        return EdgeStanding::Waiting;
    }
    match (kind, sibling.result) {
        (EdgeKind::OnDone, _) => EdgeStanding::Satisfied,
        (EdgeKind::OnPass, ChildResult::Success) => EdgeStanding::Satisfied,
        (EdgeKind::OnPass, _) => EdgeStanding::Violated,
        (EdgeKind::OnFail, ChildResult::Success) => EdgeStanding::Violated,
        // Only success violates an on_fail edge; an aborted sibling clears
        // it just like a failed one, and the waiter launches.
        (EdgeKind::OnFail, _) => EdgeStanding::Satisfied,
    }
}

fn walk<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(neighbors) = graph.get(node) {
        for &neighbor in neighbors {
            if !visited.contains(neighbor) {
                if walk(neighbor, graph, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(neighbor) {
                if let Some(start) = path.iter().position(|&ident| ident == neighbor) {
                    path.drain(0..start);
                    return true;
                }
            }
        }
    }

    rec_stack.remove(node);
    path.pop();
    false
}
