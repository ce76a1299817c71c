use crate::graph::Graph;
use crate::optimization::graph_optimizer::RewriteRule;

/// Folds a Transpose that swaps the last two axes into the transpose flag of
/// the MatMul that consumes it.
///
/// The Transpose is removed once no other operator reads its output.
pub struct MatMulTransposeFusion {
    name: String,
}

impl MatMulTransposeFusion {
    pub fn new() -> Self {
        Self {
            name: "MatMulTransposeFusion".to_string(),
        }
    }
}

impl Default for MatMulTransposeFusion {
    fn default() -> Self {
        Self::new()
    }
}

impl RewriteRule for MatMulTransposeFusion {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, graph: &mut Graph, position: usize) -> bool {
        let id = match graph.op_ids().get(position) {
            Some(&id) => id,
            None => return false,
        };
        let inputs = match graph.operator(id) {
            Some(op) if op.kind().as_matmul().is_some() => op.inputs().to_vec(),
            _ => return false,
        };

        let mut fused = false;
        for (index, &input) in inputs.iter().enumerate() {
            let source = match graph.tensor(input).and_then(|t| t.source()) {
                Some(source) => source,
                None => continue,
            };
            let transpose_input = match graph.operator(source) {
                Some(op) => match op.kind().as_transpose() {
                    Some(transpose) if transpose.swaps_last_two() => op.input(0),
                    _ => continue,
                },
                None => continue,
            };

            if let Some(matmul) = graph.kind_mut(id).as_matmul_mut() {
                if index == 0 {
                    matmul.set_trans_a(!matmul.trans_a());
                } else {
                    matmul.set_trans_b(!matmul.trans_b());
                }
            }
            graph.rewire_input(id, index, transpose_input);
            log::debug!(
                "folded transpose {} into input {} of matmul {}",
                source,
                index,
                id
            );

            if graph.tensor(input).map_or(false, |t| t.targets().is_empty()) {
                graph.detach_operator(source);
                graph.remove_tensor(input);
                graph.remove_operator(source);
            }
            fused = true;
        }

        if fused {
            match graph.refresh_attributes(id) {
                Ok(shapes) => debug_assert_eq!(
                    graph.operator(id).map(|op| op.outputs().len()),
                    Some(shapes.len())
                ),
                Err(e) => log::warn!("matmul {} no longer infers after fusion: {}", id, e),
            }
        }
        fused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::provider::CpuProvider;
    use crate::model::{DataType, TensorId};
    use crate::ops::{MatMul, Transpose, Unary, UnaryOp};

    fn graph() -> Graph {
        Graph::new(CpuProvider::shared())
    }

    fn transposed(g: &mut Graph, shape: Vec<usize>, perm: Vec<usize>) -> (TensorId, TensorId) {
        let x = g.add_tensor(shape, DataType::Float32);
        let t = g.add_op(Transpose::new(perm), &[x]).unwrap();
        (x, g.operator(t).unwrap().output())
    }

    #[test]
    fn test_fold_into_both_inputs() {
        let mut g = graph();
        let (a, at) = transposed(&mut g, vec![3, 2], vec![1, 0]);
        let (b, bt) = transposed(&mut g, vec![4, 3], vec![1, 0]);
        let mm = g.add_op(MatMul::new(false, false), &[at, bt]).unwrap();
        let c = g.operator(mm).unwrap().output();
        assert_eq!(g.tensor(c).unwrap().shape(), &[2, 4]);

        let position = g.op_ids().iter().position(|&o| o == mm).unwrap();
        assert!(MatMulTransposeFusion::new().apply(&mut g, position));

        assert_eq!(g.op_ids(), &[mm]);
        let op = g.operator(mm).unwrap();
        assert_eq!(op.inputs(), &[a, b]);
        let matmul = op.kind().as_matmul().unwrap();
        assert!(matmul.trans_a());
        assert!(matmul.trans_b());
        assert!(op.predecessors().is_empty());
        assert_eq!(op.kind().to_string(), "MatMul([A^T,B^T], mnk=[2,4,3])");

        g.shape_infer().unwrap();
        assert_eq!(g.tensor(c).unwrap().shape(), &[2, 4]);
        g.check_valid();
    }

    #[test]
    fn test_fold_refreshes_cached_dimensions() {
        let mut g = graph();
        let (a, at) = transposed(&mut g, vec![3, 2], vec![1, 0]);
        let b = g.add_tensor(vec![3, 4], DataType::Float32);
        let mm = g.add_op(MatMul::new(false, false), &[at, b]).unwrap();
        assert_eq!(g.operator(mm).unwrap().kind().as_matmul().unwrap().mnk(), (2, 4, 3));

        // a grows without a shape_infer; the fold reads it directly
        g.tensors.get_mut(&a).unwrap().shape = vec![3, 5];
        let position = g.op_ids().iter().position(|&o| o == mm).unwrap();
        assert!(MatMulTransposeFusion::new().apply(&mut g, position));

        let kind = g.operator(mm).unwrap().kind();
        assert_eq!(kind.as_matmul().unwrap().mnk(), (5, 4, 3));
        assert_eq!(kind.to_string(), "MatMul([A^T,B], mnk=[5,4,3])");
    }

    #[test]
    fn test_batched_swap_is_folded() {
        let mut g = graph();
        let a = g.add_tensor(vec![5, 2, 3], DataType::Float32);
        let (_, bt) = transposed(&mut g, vec![5, 4, 3], vec![0, 2, 1]);
        let mm = g.add_op(MatMul::new(false, false), &[a, bt]).unwrap();

        let position = g.op_ids().iter().position(|&o| o == mm).unwrap();
        assert!(MatMulTransposeFusion::new().apply(&mut g, position));
        let matmul = g.operator(mm).unwrap().kind().as_matmul().unwrap().clone();
        assert!(!matmul.trans_a());
        assert!(matmul.trans_b());
        g.shape_infer().unwrap();
        assert_eq!(
            g.tensor(g.operator(mm).unwrap().output()).unwrap().shape(),
            &[5, 2, 4]
        );
    }

    #[test]
    fn test_other_permutations_are_kept() {
        let mut g = graph();
        let a = g.add_tensor(vec![2, 3, 4], DataType::Float32);
        let (_, bt) = transposed(&mut g, vec![4, 2, 5], vec![1, 0, 2]);
        let mm = g.add_op(MatMul::new(false, false), &[a, bt]).unwrap();

        let position = g.op_ids().iter().position(|&o| o == mm).unwrap();
        assert!(!MatMulTransposeFusion::new().apply(&mut g, position));
        assert_eq!(g.op_ids().len(), 2);
    }

    #[test]
    fn test_shared_transpose_survives() {
        let mut g = graph();
        let a = g.add_tensor(vec![2, 3], DataType::Float32);
        let (b, bt) = transposed(&mut g, vec![4, 3], vec![1, 0]);
        let t = g.op_ids()[0];
        let mm = g.add_op(MatMul::new(false, false), &[a, bt]).unwrap();
        let relu = g.add_op(Unary::new(UnaryOp::Relu), &[bt]).unwrap();

        let position = g.op_ids().iter().position(|&o| o == mm).unwrap();
        assert!(MatMulTransposeFusion::new().apply(&mut g, position));

        assert_eq!(g.operator(mm).unwrap().inputs(), &[a, b]);
        assert!(g.operator(t).is_some());
        assert_eq!(g.tensor(bt).unwrap().targets(), &[relu]);
        assert_eq!(g.operator(t).unwrap().successors(), &[relu]);
        g.check_valid();
    }

    #[test]
    fn test_non_matmul_is_ignored() {
        let mut g = graph();
        transposed(&mut g, vec![2, 3], vec![1, 0]);
        assert!(!MatMulTransposeFusion::new().apply(&mut g, 0));
        assert!(!MatMulTransposeFusion::new().apply(&mut g, 7));
    }
}
