//! Graph primitives over one workflow's nodes and edges: adjacency,
//! sources, topological order, cycle detection, reachability. Pure
//! functions of their inputs, no I/O.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use uuid::Uuid;

use common::error::GraphValidationError;
use common::types::{Edge, Node};

/// Outcome of a successful validation pass.
#[derive(Debug, Clone)]
pub struct GraphReport {
    /// Deterministic topological order (ties broken by ascending node id).
    pub order: Vec<Uuid>,
    /// Nodes no source reaches; non-empty only when disconnected graphs are
    /// allowed.
    pub unreachable: Vec<Uuid>,
}

/// Forward and reverse adjacency. Every node appears as a key in both maps,
/// isolated nodes included; neighbor lists are sorted so the result does not
/// depend on input ordering.
pub fn build_adjacency(
    nodes: &[Node],
    edges: &[Edge],
) -> (HashMap<Uuid, Vec<Uuid>>, HashMap<Uuid, Vec<Uuid>>) {
    let mut forward: HashMap<Uuid, Vec<Uuid>> = HashMap::with_capacity(nodes.len());
    let mut reverse: HashMap<Uuid, Vec<Uuid>> = HashMap::with_capacity(nodes.len());

    for node in nodes {
        forward.entry(node.id).or_default();
        reverse.entry(node.id).or_default();
    }
    for edge in edges {
        forward
            .entry(edge.source_node_id)
            .or_default()
            .push(edge.target_node_id);
        reverse
            .entry(edge.target_node_id)
            .or_default()
            .push(edge.source_node_id);
    }
    for neighbors in forward.values_mut() {
        neighbors.sort_unstable();
    }
    for neighbors in reverse.values_mut() {
        neighbors.sort_unstable();
    }
    (forward, reverse)
}

/// Nodes with no incoming edges, ascending. Empty for an empty workflow.
pub fn sources(reverse: &HashMap<Uuid, Vec<Uuid>>) -> Vec<Uuid> {
    let mut sources: Vec<Uuid> = reverse
        .iter()
        .filter(|(_, incoming)| incoming.is_empty())
        .map(|(&id, _)| id)
        .collect();
    sources.sort_unstable();
    sources
}

/// Kahn's algorithm. The ready set is a min-heap keyed on node id, so two
/// runs over the same graph always produce the same order.
pub fn topo_sort(nodes: &[Node], edges: &[Edge]) -> Result<Vec<Uuid>, GraphValidationError> {
    let (forward, reverse) = build_adjacency(nodes, edges);

    let mut in_degree: HashMap<Uuid, usize> = reverse
        .iter()
        .map(|(&id, incoming)| (id, incoming.len()))
        .collect();

    let mut ready: BinaryHeap<Reverse<Uuid>> = in_degree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(&id, _)| Reverse(id))
        .collect();

    let mut sorted = Vec::with_capacity(nodes.len());
    while let Some(Reverse(node_id)) = ready.pop() {
        sorted.push(node_id);
        if let Some(successors) = forward.get(&node_id) {
            for &successor in successors {
                let degree = in_degree
                    .get_mut(&successor)
                    .ok_or(GraphValidationError::Cycle)?;
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(successor));
                }
            }
        }
    }

    if sorted.len() != nodes.len() {
        return Err(GraphValidationError::Cycle);
    }
    Ok(sorted)
}

/// DFS with an explicit recursion stack; true when any back edge exists.
pub fn detect_cycle(nodes: &[Node], edges: &[Edge]) -> bool {
    let (forward, _) = build_adjacency(nodes, edges);
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();

    for node in nodes {
        if !visited.contains(&node.id)
            && has_cycle_dfs(node.id, &forward, &mut visited, &mut rec_stack)
        {
            return true;
        }
    }
    false
}

fn has_cycle_dfs(
    node_id: Uuid,
    forward: &HashMap<Uuid, Vec<Uuid>>,
    visited: &mut HashSet<Uuid>,
    rec_stack: &mut HashSet<Uuid>,
) -> bool {
    visited.insert(node_id);
    rec_stack.insert(node_id);

    if let Some(successors) = forward.get(&node_id) {
        for &successor in successors {
            if !visited.contains(&successor) {
                if has_cycle_dfs(successor, forward, visited, rec_stack) {
                    return true;
                }
            } else if rec_stack.contains(&successor) {
                return true;
            }
        }
    }

    rec_stack.remove(&node_id);
    false
}

/// BFS from every source node.
pub fn reachable(sources: &[Uuid], forward: &HashMap<Uuid, Vec<Uuid>>) -> HashSet<Uuid> {
    let mut reached: HashSet<Uuid> = sources.iter().copied().collect();
    let mut queue: VecDeque<Uuid> = sources.iter().copied().collect();

    while let Some(node_id) = queue.pop_front() {
        if let Some(successors) = forward.get(&node_id) {
            for &successor in successors {
                if reached.insert(successor) {
                    queue.push_back(successor);
                }
            }
        }
    }
    reached
}

/// Full validation pass, in order: at least one source, acyclic, every node
/// reached from some source. With `allow_disconnected` the unreached nodes
/// ride along in the report instead of failing the workflow.
pub fn validate(
    nodes: &[Node],
    edges: &[Edge],
    allow_disconnected: bool,
) -> Result<GraphReport, GraphValidationError> {
    let (forward, reverse) = build_adjacency(nodes, edges);

    let source_ids = sources(&reverse);
    if source_ids.is_empty() {
        return Err(GraphValidationError::NoSource);
    }

    let order = topo_sort(nodes, edges)?;

    let reached = reachable(&source_ids, &forward);
    let mut unreachable: Vec<Uuid> = nodes
        .iter()
        .map(|n| n.id)
        .filter(|id| !reached.contains(id))
        .collect();
    unreachable.sort_unstable();

    if !unreachable.is_empty() && !allow_disconnected {
        return Err(GraphValidationError::Unreachable(unreachable));
    }

    Ok(GraphReport { order, unreachable })
}
