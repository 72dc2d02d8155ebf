// src/plan/validate.rs

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque};

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graphmap::DiGraphMap;

use crate::errors::CompileError;
use crate::graph::{ANY, NOTHING, TypeCompatibility, list_item_type};
use crate::plan::flatten::{FlatGraph, FlatSource};

/// Check every resolved edge against the pluggable compatibility check.
///
/// Plain single-source inputs compare types directly (a per-item consumer of
/// a dynamic output sees the item type). Fan-in and collect inputs receive a
/// list, so the consumer must be `Any`, `Nothing` or `List[T]` with each
/// producer compatible with `T`.
pub(crate) fn check_types(flat: &FlatGraph, types: &dyn TypeCompatibility) -> Result<(), CompileError> {
    let producers: BTreeMap<String, _> = flat
        .nodes
        .iter()
        .map(|n| (n.handle.to_string(), &n.definition))
        .collect();

    for node in &flat.nodes {
        for input in &node.inputs {
            let FlatSource::Upstream(refs) = &input.source else {
                continue;
            };
            let consumer_type = input.def.type_name.as_str();
            let consumer = format!("{}.{} ({consumer_type})", node.handle, input.def.name);
            let as_list = input.def.is_dynamic_collect || refs.len() > 1;

            for r in refs {
                let Some(output) = producers
                    .get(&r.handle.to_string())
                    .and_then(|d| d.output(&r.output))
                else {
                    continue;
                };
                let producer = format!("{}.{} ({})", r.handle, r.output, output.type_name);

                let compatible = if as_list {
                    match consumer_type {
                        ANY | NOTHING => true,
                        other => list_item_type(other)
                            .is_some_and(|item| types.is_compatible(&output.type_name, item)),
                    }
                } else {
                    types.is_compatible(&output.type_name, consumer_type)
                };

                if !compatible {
                    return Err(CompileError::TypeMismatch {
                        producer,
                        consumer: consumer.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Topologically order the flattened nodes, failing with a cycle path if
/// there is one.
///
/// Edge direction: producer -> consumer. Among nodes whose producers are all
/// placed, the one declared first goes next, so independent nodes keep
/// declaration order.
pub(crate) fn topological_order(flat: &FlatGraph) -> Result<Vec<String>, CompileError> {
    let handles: Vec<String> = flat.nodes.iter().map(|n| n.handle.to_string()).collect();
    let index: BTreeMap<&str, usize> = handles
        .iter()
        .enumerate()
        .map(|(i, h)| (h.as_str(), i))
        .collect();

    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for i in 0..handles.len() {
        graph.add_node(i);
    }
    for (consumer, node) in flat.nodes.iter().enumerate() {
        for input in &node.inputs {
            if let FlatSource::Upstream(refs) = &input.source {
                for r in refs {
                    if let Some(&producer) = index.get(r.handle.to_string().as_str()) {
                        graph.add_edge(producer, consumer, ());
                    }
                }
            }
        }
    }

    if let Err(cycle) = toposort(&graph, None) {
        let path = cycle_path(&graph, cycle.node_id())
            .into_iter()
            .map(|i| handles[i].clone())
            .collect();
        return Err(CompileError::DependencyCycle { cycle: path });
    }

    let mut pending: Vec<usize> = (0..handles.len())
        .map(|i| graph.neighbors_directed(i, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<usize>> = pending
        .iter()
        .enumerate()
        .filter(|(_, n)| **n == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(handles.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(handles[i].clone());
        for next in graph.neighbors_directed(i, Direction::Outgoing) {
            pending[next] -= 1;
            if pending[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }
    Ok(order)
}

/// Shortest dependency path around the cycle containing `hit`, starting and
/// ending at the cycle's lowest-indexed node.
fn cycle_path(graph: &DiGraphMap<usize, ()>, hit: usize) -> Vec<usize> {
    let scc: BTreeSet<usize> = tarjan_scc(graph)
        .into_iter()
        .find(|scc| scc.contains(&hit))
        .map(|scc| scc.into_iter().collect())
        .unwrap_or_else(|| BTreeSet::from([hit]));
    let Some(&start) = scc.first() else {
        return vec![hit];
    };

    // Breadth-first search inside the component, back to `start`.
    let mut parent: BTreeMap<usize, usize> = BTreeMap::new();
    let mut queue = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        let mut next: Vec<usize> = graph
            .neighbors_directed(node, Direction::Outgoing)
            .filter(|n| scc.contains(n))
            .collect();
        next.sort_unstable();
        for n in next {
            if n == start {
                let mut path = vec![start];
                let mut cur = node;
                while cur != start {
                    path.push(cur);
                    match parent.get(&cur) {
                        Some(&p) => cur = p,
                        None => break,
                    }
                }
                path[1..].reverse();
                path.push(start);
                return path;
            }
            if !parent.contains_key(&n) {
                parent.insert(n, node);
                queue.push_back(n);
            }
        }
    }
    vec![start, start]
}
