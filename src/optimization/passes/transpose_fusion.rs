use crate::graph::Graph;
use crate::model::{OpId, Operator, TensorId};
use crate::ops::Transpose;
use crate::optimization::graph_optimizer::RewriteRule;

/// Fuses two adjacent Transpose operators.
///
/// The pair is elided when the permutations cancel out and replaced by one
/// Transpose otherwise. Only fires when the second operator reads the output
/// of the first and nothing else does.
pub struct TransposeFusion {
    name: String,
}

impl TransposeFusion {
    pub fn new() -> Self {
        Self {
            name: "TransposeFusion".to_string(),
        }
    }

    fn elide(
        &self,
        graph: &mut Graph,
        (first, second): (OpId, OpId),
        x: TensorId,
        y: TensorId,
        z: TensorId,
    ) -> bool {
        let consumers = match graph.tensor(z) {
            Some(tensor) => tensor.targets().to_vec(),
            None => return false,
        };
        if consumers.is_empty() {
            // z is a graph output and has to keep a producer
            log::warn!(
                "keeping cancelling transposes {} and {}: {} is a graph output",
                first,
                second,
                z
            );
            return false;
        }

        for consumer in consumers {
            graph.replace_input(consumer, z, x);
        }
        self.remove_pair(graph, first, second, y);
        graph.remove_tensor(z);
        true
    }

    fn remove_pair(&self, graph: &mut Graph, first: OpId, second: OpId, y: TensorId) {
        graph.detach_operator(second);
        graph.detach_operator(first);
        graph.remove_operator(second);
        graph.remove_operator(first);
        graph.remove_tensor(y);
    }
}

impl Default for TransposeFusion {
    fn default() -> Self {
        Self::new()
    }
}

impl RewriteRule for TransposeFusion {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, graph: &mut Graph, position: usize) -> bool {
        let (first, second) = match graph.op_ids().get(position..position + 2) {
            Some(&[first, second]) => (first, second),
            _ => return false,
        };
        let (perm1, x, y) = match transpose_parts(graph, first) {
            Some(parts) => parts,
            None => return false,
        };
        let (perm2, input, z) = match transpose_parts(graph, second) {
            Some(parts) => parts,
            None => return false,
        };

        if input != y || perm1.rank() != perm2.rank() {
            return false;
        }
        if graph.tensor(y).map_or(true, |t| t.targets() != [second]) {
            return false;
        }

        let combined = perm1.then(&perm2);
        if combined.iter().enumerate().all(|(i, &axis)| i == axis) {
            return self.elide(graph, (first, second), x, y, z);
        }

        self.remove_pair(graph, first, second, y);
        let fused = Operator::new(Transpose::new(combined).into(), vec![x], vec![z]);
        graph.insert_operator_at(position, fused);
        true
    }
}

/// Permutation, input and output of `id` if it is a Transpose
fn transpose_parts(graph: &Graph, id: OpId) -> Option<(Transpose, TensorId, TensorId)> {
    let op = graph.operator(id)?;
    let transpose = op.kind().as_transpose()?;
    Some((transpose.clone(), op.input(0), op.output()))
}
