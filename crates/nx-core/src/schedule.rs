use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::graph::Graph;
use crate::layer::LayerId;
use crate::{NxError, Result};

/// Compute a topological order over every layer of `graph`.
///
/// - Producers appear before their consumers.
/// - Among layers with no mutual dependency, insertion order is kept.
/// - Detects cycles (should never happen, since `connect` rejects them).
pub fn topological_order(graph: &Graph) -> Result<Vec<LayerId>> {
    let position: HashMap<LayerId, usize> = graph
        .layer_ids()
        .enumerate()
        .map(|(pos, id)| (id, pos))
        .collect();

    // 1) In-degrees + adjacency (producer -> consumers).
    let mut indeg = vec![0usize; position.len()];
    let mut users: Vec<Vec<usize>> = vec![Vec::new(); position.len()];

    for layer in graph.layers() {
        let pos = position[&layer.id()];
        for slot in layer.input_slots() {
            if let Some(src) = slot.connection() {
                let src_pos = position[&src.layer];
                indeg[pos] += 1;
                users[src_pos].push(pos);
            }
        }
    }

    // 2) Kahn's algorithm, always releasing the earliest-inserted ready layer.
    let mut ready: BinaryHeap<Reverse<usize>> = indeg
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(pos, _)| Reverse(pos))
        .collect();

    let ids: Vec<LayerId> = graph.layer_ids().collect();
    let mut order = Vec::with_capacity(ids.len());
    while let Some(Reverse(pos)) = ready.pop() {
        order.push(ids[pos]);
        for &user in &users[pos] {
            indeg[user] -= 1;
            if indeg[user] == 0 {
                ready.push(Reverse(user));
            }
        }
    }

    if order.len() != ids.len() {
        return Err(NxError::Structural("cycle detected in graph".into()));
    }

    Ok(order)
}

/// Whether `to` can reach `from` by following output connections, i.e.
/// whether an edge `from -> to` would close a cycle.
pub(crate) fn reaches(graph: &Graph, start: LayerId, target: LayerId) -> bool {
    let mut visited: HashSet<LayerId> = HashSet::new();
    let mut stack = vec![start];

    while let Some(id) = stack.pop() {
        if id == target {
            return true;
        }
        if !visited.insert(id) {
            continue;
        }
        if let Some(layer) = graph.layer(id) {
            for slot in layer.output_slots() {
                stack.extend(slot.connections().iter().map(|c| c.layer));
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{ActivationDescriptor, ActivationFunction};
    use crate::layers::LayerKind;

    fn relu() -> LayerKind {
        LayerKind::Activation(ActivationDescriptor::new(ActivationFunction::ReLu))
    }

    #[test]
    fn test_order_respects_edges_over_insertion() {
        let mut g = Graph::new();
        let late_consumer = g.add_layer(LayerKind::Output { binding_id: 0 }, "out");
        let act = g.add_layer(relu(), "act");
        let input = g.add_layer(LayerKind::Input { binding_id: 0 }, "in");
        g.connect(input.output(0), act.input(0)).unwrap();
        g.connect(act.output(0), late_consumer.input(0)).unwrap();

        let order = topological_order(&g).unwrap();
        assert_eq!(order, vec![input, act, late_consumer]);
    }

    #[test]
    fn test_independent_layers_keep_insertion_order() {
        let mut g = Graph::new();
        let a = g.add_layer(LayerKind::Input { binding_id: 0 }, "a");
        let b = g.add_layer(LayerKind::Input { binding_id: 1 }, "b");
        let c = g.add_layer(LayerKind::Input { binding_id: 2 }, "c");
        assert_eq!(topological_order(&g).unwrap(), vec![a, b, c]);
    }

    #[test]
    fn test_reaches() {
        let mut g = Graph::new();
        let a = g.add_layer(LayerKind::Input { binding_id: 0 }, "a");
        let b = g.add_layer(relu(), "b");
        let c = g.add_layer(relu(), "c");
        g.connect(a.output(0), b.input(0)).unwrap();
        g.connect(b.output(0), c.input(0)).unwrap();
        assert!(reaches(&g, a, c));
        assert!(!reaches(&g, c, a));
    }
}
