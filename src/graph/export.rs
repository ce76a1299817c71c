use std::collections::HashMap;

use petgraph::dot::Dot;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::model::{OpId, TensorId};

use super::Graph;

impl Graph {
    /// Operator DAG as a petgraph graph: one node per operator, one edge per
    /// (producer, consumer) pair labelled with the tensor between them.
    pub fn to_petgraph(&self) -> DiGraph<OpId, TensorId> {
        let mut graph = DiGraph::with_capacity(self.op_order.len(), self.tensor_order.len());
        let nodes: HashMap<OpId, NodeIndex> = self
            .op_order
            .iter()
            .map(|&id| (id, graph.add_node(id)))
            .collect();

        for tensor in self.tensors() {
            let source = match tensor.source.and_then(|s| nodes.get(&s)) {
                Some(&index) => index,
                None => continue,
            };
            for target in &tensor.targets {
                if let Some(&index) = nodes.get(target) {
                    graph.add_edge(source, index, tensor.id);
                }
            }
        }

        graph
    }

    /// Graphviz rendering of [`Graph::to_petgraph`]
    pub fn to_dot(&self) -> String {
        format!("{}", Dot::new(&self.to_petgraph()))
    }
}

#[cfg(test)]
mod tests {
    use crate::memory::provider::CpuProvider;
    use crate::model::DataType;
    use crate::ops::{BinaryOp, ElementWise, Unary, UnaryOp};

    use super::*;

    #[test]
    fn test_to_petgraph() {
        let mut g = Graph::new(CpuProvider::shared());
        let x = g.add_tensor(vec![4], DataType::Float32);
        let a = g.add_op(Unary::new(UnaryOp::Relu), &[x]).unwrap();
        let y = g.operator(a).unwrap().output();
        g.add_op(ElementWise::new(BinaryOp::Mul), &[y, x]).unwrap();

        let pg = g.to_petgraph();
        assert_eq!(pg.node_count(), 2);
        assert_eq!(pg.edge_count(), 1);
        assert!(!petgraph::algo::is_cyclic_directed(&pg));
        assert!(g.to_dot().starts_with("digraph"));
    }
}
