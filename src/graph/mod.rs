//! The operator/tensor graph and its structural primitives.
//!
//! Tensors and operators live in id-keyed arenas owned by [`Graph`]. Edges are
//! stored twice: tensor-level (`source`/`targets`) and operator-level
//! (`predecessors`/`successors`). Every mutation below updates both views in
//! the same call.

mod export;
mod validate;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::memory::allocator::Allocator;
use crate::memory::provider::{same_provider, MemoryProvider};
use crate::model::{DataType, OpId, Operator, Tensor, TensorId};
use crate::ops::{OpKind, Shape, ShapeInference};
use crate::optimization::graph_optimizer::{GraphOptimizer, OptimizationStats};
use crate::options::GraphOptions;

#[derive(Debug)]
pub struct Graph {
    pub(crate) provider: Arc<dyn MemoryProvider>,
    pub(crate) options: GraphOptions,
    pub(crate) allocator: Allocator,
    pub(crate) tensors: HashMap<TensorId, Tensor>,
    /// Registration order of tensors
    pub(crate) tensor_order: Vec<TensorId>,
    pub(crate) ops: HashMap<OpId, Operator>,
    /// Operator order; topological once `sorted` is set
    pub(crate) op_order: Vec<OpId>,
    pub(crate) sorted: bool,
}

impl Graph {
    /// Create an empty graph with default options
    pub fn new(provider: Arc<dyn MemoryProvider>) -> Self {
        Self::with_options(provider, GraphOptions::default())
    }

    pub fn with_options(provider: Arc<dyn MemoryProvider>, options: GraphOptions) -> Self {
        let allocator = Allocator::with_alignment(provider.clone(), options.alignment);
        Self {
            provider,
            options,
            allocator,
            tensors: HashMap::new(),
            tensor_order: Vec::new(),
            ops: HashMap::new(),
            op_order: Vec::new(),
            sorted: false,
        }
    }

    pub fn provider(&self) -> &Arc<dyn MemoryProvider> {
        &self.provider
    }

    pub fn options(&self) -> &GraphOptions {
        &self.options
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn tensor(&self, id: TensorId) -> Option<&Tensor> {
        self.tensors.get(&id)
    }

    pub fn operator(&self, id: OpId) -> Option<&Operator> {
        self.ops.get(&id)
    }

    /// Tensors in registration order
    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> + '_ {
        self.tensor_order.iter().filter_map(move |id| self.tensors.get(id))
    }

    /// Operators in the current order
    pub fn operators(&self) -> impl Iterator<Item = &Operator> + '_ {
        self.op_order.iter().filter_map(move |id| self.ops.get(id))
    }

    pub fn tensor_ids(&self) -> &[TensorId] {
        &self.tensor_order
    }

    pub fn op_ids(&self) -> &[OpId] {
        &self.op_order
    }

    /// Tensors no operator produces
    pub fn inputs(&self) -> Vec<TensorId> {
        self.tensors()
            .filter(|t| t.source.is_none())
            .map(|t| t.id)
            .collect()
    }

    /// Tensors no operator consumes
    pub fn outputs(&self) -> Vec<TensorId> {
        self.tensors()
            .filter(|t| t.targets.is_empty())
            .map(|t| t.id)
            .collect()
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Register a new tensor owned by this graph
    pub fn add_tensor(&mut self, shape: Shape, data_type: DataType) -> TensorId {
        let tensor = Tensor::new(shape, data_type, self.provider.clone());
        let id = tensor.id;
        self.tensors.insert(id, tensor);
        self.tensor_order.push(id);
        id
    }

    /// Register an externally constructed tensor.
    ///
    /// Panics if the tensor was created for another memory provider or its id
    /// is already registered.
    pub fn add_existing_tensor(&mut self, tensor: Tensor) -> TensorId {
        assert!(
            same_provider(&tensor.provider, &self.provider),
            "tensor provider mismatch: cannot add a tensor on {} to a graph on {}",
            tensor.provider.name(),
            self.provider.name()
        );
        assert!(
            !self.tensors.contains_key(&tensor.id),
            "tensor {} is already registered",
            tensor.id
        );
        let id = tensor.id;
        self.tensors.insert(id, tensor);
        self.tensor_order.push(id);
        id
    }

    /// Construct an operator, creating its outputs from the inferred shapes.
    ///
    /// Output tensors take the element type of the first input.
    pub fn add_op(&mut self, kind: impl Into<OpKind>, inputs: &[TensorId]) -> Result<OpId> {
        let mut kind = kind.into();
        let shapes = self.infer_for(&mut kind, inputs)?;
        let data_type = self.tensor_ref(inputs[0]).data_type;

        let outputs = shapes
            .into_iter()
            .map(|shape| self.add_tensor(shape, data_type))
            .collect();
        let op = Operator::new(kind, inputs.to_vec(), outputs);
        Ok(self.add_operator_and_connect(op))
    }

    /// Construct an operator writing into existing tensors.
    ///
    /// The tensors must already carry the shapes the operator infers.
    pub fn add_op_with_outputs(
        &mut self,
        kind: impl Into<OpKind>,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> Result<OpId> {
        let mut kind = kind.into();
        let shapes = self.infer_for(&mut kind, inputs)?;
        if shapes.len() != outputs.len() {
            return Err(Error::InvalidOperator(format!(
                "{} produces {} outputs, {} given",
                kind.op_type(),
                shapes.len(),
                outputs.len()
            )));
        }
        for (shape, &output) in shapes.iter().zip(outputs) {
            let existing = &self.tensor_ref(output).shape;
            if existing != shape {
                return Err(Error::ShapeMismatch(format!(
                    "{} infers output shape {:?} but tensor {} has shape {:?}",
                    kind.op_type(),
                    shape,
                    output,
                    existing
                )));
            }
        }

        let op = Operator::new(kind, inputs.to_vec(), outputs.to_vec());
        Ok(self.add_operator_and_connect(op))
    }

    /// Register `op` and wire it to the producers and consumers of its tensors
    pub fn add_operator_and_connect(&mut self, op: Operator) -> OpId {
        let id = op.id;
        self.op_order.push(id);
        self.ops.insert(id, op);
        self.connect(id);
        id
    }

    /// Like `add_operator_and_connect`, placing the operator at `position` in the order
    pub(crate) fn insert_operator_at(&mut self, position: usize, op: Operator) -> OpId {
        let id = op.id;
        self.op_order.insert(position, id);
        self.ops.insert(id, op);
        self.connect(id);
        id
    }

    /// Drop an operator. Edges referring to it are left for the caller to detach.
    pub fn remove_operator(&mut self, id: OpId) -> Option<Operator> {
        let op = self.ops.remove(&id)?;
        self.op_order.retain(|&o| o != id);
        self.sorted = false;
        Some(op)
    }

    /// Drop a tensor. Edges referring to it are left for the caller to detach.
    pub fn remove_tensor(&mut self, id: TensorId) -> Option<Tensor> {
        let tensor = self.tensors.remove(&id)?;
        self.tensor_order.retain(|&t| t != id);
        self.sorted = false;
        Some(tensor)
    }

    /// Make input `index` of `op` read `tensor` instead
    pub fn rewire_input(&mut self, op: OpId, index: usize, tensor: TensorId) {
        let old = self.op_ref(op).inputs[index];
        if old == tensor {
            return;
        }
        self.op_mut(op).inputs[index] = tensor;

        if !self.op_ref(op).inputs.contains(&old) {
            self.tensor_mut(old).remove_target(op);
        }
        let old_source = self.tensor_ref(old).source;
        if let Some(old_source) = old_source {
            if !self.reads_from(op, old_source) {
                self.unlink(old_source, op);
            }
        }

        let new_tensor = self.tensor_mut(tensor);
        new_tensor.add_target(op);
        let new_source = new_tensor.source;
        if let Some(new_source) = new_source {
            self.link(new_source, op);
        }
        self.sorted = false;
    }

    /// Replace every use of `old` among the inputs of `op` with `new`
    pub fn replace_input(&mut self, op: OpId, old: TensorId, new: TensorId) {
        let positions: Vec<usize> = self
            .op_ref(op)
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, &t)| t == old)
            .map(|(i, _)| i)
            .collect();
        for index in positions {
            self.rewire_input(op, index, new);
        }
    }

    /// Remove every edge that mentions `op`, leaving it registered but isolated
    pub fn detach_operator(&mut self, id: OpId) {
        let (inputs, outputs, predecessors, successors) = {
            let op = self.op_ref(id);
            (
                op.inputs.clone(),
                op.outputs.clone(),
                op.predecessors.clone(),
                op.successors.clone(),
            )
        };

        for input in inputs {
            if let Some(tensor) = self.tensors.get_mut(&input) {
                tensor.remove_target(id);
            }
        }
        for output in outputs {
            if let Some(tensor) = self.tensors.get_mut(&output) {
                if tensor.source == Some(id) {
                    tensor.source = None;
                }
            }
        }
        for pred in predecessors {
            if let Some(op) = self.ops.get_mut(&pred) {
                op.remove_successor(id);
            }
        }
        for succ in successors {
            if let Some(op) = self.ops.get_mut(&succ) {
                op.remove_predecessor(id);
            }
        }

        let op = self.op_mut(id);
        op.predecessors.clear();
        op.successors.clear();
        self.sorted = false;
    }

    /// Reorder operators topologically.
    ///
    /// Returns false and leaves the order untouched when some operator can
    /// never be placed, i.e. the graph has a cycle.
    pub fn topo_sort(&mut self) -> bool {
        if self.sorted {
            return true;
        }

        let mut placed: HashSet<OpId> = HashSet::with_capacity(self.op_order.len());
        let mut order = Vec::with_capacity(self.op_order.len());
        while order.len() < self.op_order.len() {
            let mut modified = false;
            for &id in &self.op_order {
                if placed.contains(&id) {
                    continue;
                }
                let ready = self.ops[&id].inputs.iter().all(|input| {
                    match self.tensors.get(input).and_then(|t| t.source) {
                        None => true,
                        Some(source) => placed.contains(&source),
                    }
                });
                if ready {
                    placed.insert(id);
                    order.push(id);
                    modified = true;
                }
            }
            if !modified {
                return false;
            }
        }

        self.op_order = order;
        self.sorted = true;
        true
    }

    /// Re-run shape inference over the graph in topological order.
    ///
    /// Only outputs whose shape changed are updated.
    pub fn shape_infer(&mut self) -> Result<()> {
        if !self.topo_sort() {
            return Err(Error::CycleDetected(
                "cannot infer shapes of a cyclic graph".to_string(),
            ));
        }

        for id in self.op_order.clone() {
            let inputs = self.op_ref(id).inputs.clone();
            let mut kind = self.op_ref(id).kind.clone();
            let shapes = self.infer_for(&mut kind, &inputs)?;

            let op = self.op_mut(id);
            op.kind = kind;
            let outputs = op.outputs.clone();
            assert_eq!(
                shapes.len(),
                outputs.len(),
                "operator {} inferred {} outputs but owns {}",
                id,
                shapes.len(),
                outputs.len()
            );

            for (output, shape) in outputs.into_iter().zip(shapes) {
                let tensor = self.tensor_mut(output);
                if tensor.shape != shape {
                    log::debug!(
                        "tensor {} shape {:?} -> {:?}",
                        output,
                        tensor.shape,
                        shape
                    );
                    tensor.shape = shape;
                }
            }
        }
        Ok(())
    }

    /// Apply the rewrite rules selected by the graph options until nothing fires
    pub fn optimize(&mut self) -> OptimizationStats {
        GraphOptimizer::for_options(&self.options).run(self)
    }

    pub(crate) fn kind_mut(&mut self, id: OpId) -> &mut OpKind {
        &mut self.op_mut(id).kind
    }

    /// Re-run shape inference for one operator on its current inputs,
    /// refreshing cached attributes such as MatMul's `(m, n, k)`.
    ///
    /// Output tensors are left untouched; the inferred shapes are returned.
    pub(crate) fn refresh_attributes(&mut self, id: OpId) -> Result<Vec<Shape>> {
        let inputs = self.op_ref(id).inputs.clone();
        let mut kind = self.op_ref(id).kind.clone();
        let shapes = self.infer_for(&mut kind, &inputs)?;
        self.op_mut(id).kind = kind;
        Ok(shapes)
    }

    fn infer_for(&self, kind: &mut OpKind, inputs: &[TensorId]) -> Result<Vec<Shape>> {
        let shapes: Vec<&[usize]> = inputs
            .iter()
            .map(|&id| self.tensor_ref(id).shape.as_slice())
            .collect();
        kind.infer_shape(&shapes)
    }

    fn connect(&mut self, id: OpId) {
        let (inputs, outputs) = {
            let op = self.op_ref(id);
            (op.inputs.clone(), op.outputs.clone())
        };

        for input in inputs {
            let tensor = self.tensor_mut(input);
            tensor.add_target(id);
            let source = tensor.source;
            if let Some(pred) = source {
                self.link(pred, id);
            }
        }
        for output in outputs {
            let tensor = self.tensor_mut(output);
            assert!(
                tensor.source.map_or(true, |source| source == id),
                "tensor {} already has producer {}",
                output,
                tensor.source.map_or(0, |s| s.0)
            );
            tensor.source = Some(id);
            let targets = tensor.targets.clone();
            for succ in targets {
                self.link(id, succ);
            }
        }
        self.sorted = false;
    }

    fn link(&mut self, pred: OpId, succ: OpId) {
        self.op_mut(pred).add_successor(succ);
        self.op_mut(succ).add_predecessor(pred);
    }

    fn unlink(&mut self, pred: OpId, succ: OpId) {
        if let Some(op) = self.ops.get_mut(&pred) {
            op.remove_successor(succ);
        }
        if let Some(op) = self.ops.get_mut(&succ) {
            op.remove_predecessor(pred);
        }
    }

    /// Whether any input of `op` is produced by `source`
    fn reads_from(&self, op: OpId, source: OpId) -> bool {
        self.op_ref(op)
            .inputs
            .iter()
            .any(|input| self.tensors.get(input).and_then(|t| t.source) == Some(source))
    }

    fn tensor_ref(&self, id: TensorId) -> &Tensor {
        match self.tensors.get(&id) {
            Some(tensor) => tensor,
            None => panic!("tensor {} is not in the graph", id),
        }
    }

    fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        match self.tensors.get_mut(&id) {
            Some(tensor) => tensor,
            None => panic!("tensor {} is not in the graph", id),
        }
    }

    fn op_ref(&self, id: OpId) -> &Operator {
        match self.ops.get(&id) {
            Some(op) => op,
            None => panic!("operator {} is not in the graph", id),
        }
    }

    fn op_mut(&mut self, id: OpId) -> &mut Operator {
        match self.ops.get_mut(&id) {
            Some(op) => op,
            None => panic!("operator {} is not in the graph", id),
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph Tensors:")?;
        for tensor in self.tensors() {
            writeln!(f, "{}", tensor)?;
        }
        writeln!(f, "Graph operators:")?;
        for op in self.operators() {
            writeln!(f, "{}", op)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::provider::CpuProvider;
    use crate::ops::{BinaryOp, ElementWise, MatMul, Transpose, Unary, UnaryOp};

    fn graph() -> Graph {
        Graph::new(CpuProvider::shared())
    }

    #[test]
    fn test_add_op_connects_edges() {
        let mut g = graph();
        let a = g.add_tensor(vec![2, 3], DataType::Float32);
        let b = g.add_tensor(vec![3, 4], DataType::Float32);
        let mm = g.add_op(MatMul::new(false, false), &[a, b]).unwrap();
        let c = g.operator(mm).unwrap().output();
        let relu = g.add_op(Unary::new(UnaryOp::Relu), &[c]).unwrap();

        assert_eq!(g.tensor(c).unwrap().shape(), &[2, 4]);
        assert_eq!(g.tensor(c).unwrap().source(), Some(mm));
        assert_eq!(g.tensor(c).unwrap().targets(), &[relu]);
        assert_eq!(g.operator(mm).unwrap().successors(), &[relu]);
        assert_eq!(g.operator(relu).unwrap().predecessors(), &[mm]);
        assert_eq!(g.inputs(), vec![a, b]);
        g.check_valid();
    }

    #[test]
    fn test_add_op_reports_shape_failure() {
        let mut g = graph();
        let a = g.add_tensor(vec![3, 4], DataType::Float32);
        let b = g.add_tensor(vec![5, 6], DataType::Float32);
        assert!(matches!(
            g.add_op(MatMul::new(false, false), &[a, b]),
            Err(Error::ShapeMismatch(_))
        ));
        assert!(g.op_ids().is_empty());
    }

    #[test]
    fn test_add_op_with_outputs_links_existing_consumers() {
        let mut g = graph();
        let x = g.add_tensor(vec![4], DataType::Float32);
        let y = g.add_tensor(vec![4], DataType::Float32);
        let consumer = g.add_op(Unary::new(UnaryOp::Abs), &[y]).unwrap();
        let producer = g
            .add_op_with_outputs(Unary::new(UnaryOp::Tanh), &[x], &[y])
            .unwrap();

        assert_eq!(g.operator(consumer).unwrap().predecessors(), &[producer]);
        assert_eq!(g.operator(producer).unwrap().successors(), &[consumer]);
        g.check_valid();
    }

    #[test]
    fn test_add_op_with_outputs_checks_shape() {
        let mut g = graph();
        let x = g.add_tensor(vec![4], DataType::Float32);
        let y = g.add_tensor(vec![5], DataType::Float32);
        assert!(g.add_op_with_outputs(Unary::new(UnaryOp::Tanh), &[x], &[y]).is_err());
    }

    #[test]
    #[should_panic(expected = "provider mismatch")]
    fn test_add_existing_tensor_from_other_provider_panics() {
        let mut g = graph();
        let foreign = Tensor::new(vec![1], DataType::Float32, CpuProvider::shared());
        g.add_existing_tensor(foreign);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_add_existing_tensor_twice_panics() {
        let mut g = graph();
        let tensor = Tensor::new(vec![1], DataType::Float32, g.provider().clone());
        g.add_existing_tensor(tensor.clone());
        g.add_existing_tensor(tensor);
    }

    #[test]
    fn test_rewire_input_updates_both_views() {
        let mut g = graph();
        let x = g.add_tensor(vec![2, 2], DataType::Float32);
        let t = g.add_op(Transpose::new(vec![1, 0]), &[x]).unwrap();
        let y = g.operator(t).unwrap().output();
        let r = g.add_op(Unary::new(UnaryOp::Relu), &[x]).unwrap();
        let z = g.operator(r).unwrap().output();
        let add = g.add_op(ElementWise::new(BinaryOp::Add), &[y, z]).unwrap();

        g.rewire_input(add, 0, z);
        assert_eq!(g.operator(add).unwrap().inputs(), &[z, z]);
        assert_eq!(g.operator(add).unwrap().predecessors(), &[r]);
        assert!(g.operator(t).unwrap().successors().is_empty());
        assert!(g.tensor(y).unwrap().targets().is_empty());
        assert_eq!(g.tensor(z).unwrap().targets(), &[add]);
    }

    #[test]
    fn test_topo_sort_reorders() {
        let mut g = graph();
        let x = g.add_tensor(vec![3], DataType::Float32);
        let y = g.add_tensor(vec![3], DataType::Float32);
        let z = g.add_tensor(vec![3], DataType::Float32);
        let second = g.add_op_with_outputs(Unary::new(UnaryOp::Relu), &[y], &[z]).unwrap();
        let first = g.add_op_with_outputs(Unary::new(UnaryOp::Abs), &[x], &[y]).unwrap();

        assert_eq!(g.op_ids(), &[second, first]);
        assert!(g.topo_sort());
        assert_eq!(g.op_ids(), &[first, second]);
        assert!(g.is_sorted());
    }

    #[test]
    fn test_topo_sort_detects_cycle() {
        let mut g = graph();
        let x = g.add_tensor(vec![3], DataType::Float32);
        let y = g.add_tensor(vec![3], DataType::Float32);
        let a = g.add_op_with_outputs(Unary::new(UnaryOp::Relu), &[x], &[y]).unwrap();
        let b = g.add_op_with_outputs(Unary::new(UnaryOp::Abs), &[y], &[x]).unwrap();

        let before = g.op_ids().to_vec();
        assert!(!g.topo_sort());
        assert_eq!(g.op_ids(), before.as_slice());
        assert_eq!(before, vec![a, b]);
        assert!(matches!(g.shape_infer(), Err(Error::CycleDetected(_))));
    }

    #[test]
    fn test_shape_infer_propagates_new_input_shape() {
        let mut g = graph();
        let a = g.add_tensor(vec![2, 3], DataType::Float32);
        let b = g.add_tensor(vec![3, 4], DataType::Float32);
        let mm = g.add_op(MatMul::new(false, false), &[a, b]).unwrap();
        let c = g.operator(mm).unwrap().output();
        let relu = g.add_op(Unary::new(UnaryOp::Relu), &[c]).unwrap();
        let d = g.operator(relu).unwrap().output();

        g.tensor_mut(a).shape = vec![5, 7, 3];
        g.shape_infer().unwrap();
        assert_eq!(g.tensor(c).unwrap().shape(), &[5, 7, 4]);
        assert_eq!(g.tensor(d).unwrap().shape(), &[5, 7, 4]);
        assert_eq!(
            g.operator(mm).unwrap().kind().as_matmul().unwrap().mnk(),
            (7, 4, 3)
        );

        g.tensor_mut(b).shape = vec![9, 4];
        assert!(matches!(g.shape_infer(), Err(Error::ShapeMismatch(_))));
    }

    #[test]
    fn test_display_lists_everything() {
        let mut g = graph();
        let a = g.add_tensor(vec![2, 3], DataType::Float32);
        let t = g.add_op(Transpose::new(vec![1, 0]), &[a]).unwrap();
        let dump = g.to_string();
        assert!(dump.starts_with("Graph Tensors:\n"));
        assert!(dump.contains("Graph operators:\n"));
        assert!(dump.contains(&format!("OP {}", t)));
        assert!(dump.contains("Transpose(perm=[1, 0])"));
    }
}
