use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::model::OpId;

use super::Graph;

impl Graph {
    /// Panic on the first broken structural invariant.
    ///
    /// Meant for tests and debugging; see [`Graph::validate`] for the
    /// non-panicking form.
    pub fn check_valid(&self) {
        if let Err(e) = self.validate() {
            panic!("{}", e);
        }
    }

    /// Check membership, edge symmetry, uid uniqueness and orphan tensors
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.tensor_order.len());
        for &id in &self.tensor_order {
            if !seen.insert(id) {
                return Err(invalid(format!("tensor uid {} is registered twice", id)));
            }
            if !self.tensors.contains_key(&id) {
                return Err(invalid(format!("tensor {} is ordered but not owned", id)));
            }
        }
        if seen.len() != self.tensors.len() {
            return Err(invalid("owned tensors missing from the tensor order".to_string()));
        }

        let mut seen = HashSet::with_capacity(self.op_order.len());
        for &id in &self.op_order {
            if !seen.insert(id) || !self.ops.contains_key(&id) {
                return Err(invalid(format!("operator {} is duplicated or not owned", id)));
            }
        }
        if seen.len() != self.ops.len() {
            return Err(invalid("owned operators missing from the operator order".to_string()));
        }

        for tensor in self.tensors() {
            if tensor.source.is_none() && tensor.targets.is_empty() {
                return Err(invalid(format!(
                    "tensor {} has neither producer nor consumers",
                    tensor.id
                )));
            }
            if let Some(source) = tensor.source {
                let producer = self.ops.get(&source).ok_or_else(|| {
                    invalid(format!("producer {} of tensor {} is not in the graph", source, tensor.id))
                })?;
                if !producer.outputs.contains(&tensor.id) {
                    return Err(invalid(format!(
                        "operator {} does not list its product {} as an output",
                        source, tensor.id
                    )));
                }
            }
            for &target in &tensor.targets {
                let consumer = self.ops.get(&target).ok_or_else(|| {
                    invalid(format!("consumer {} of tensor {} is not in the graph", target, tensor.id))
                })?;
                if !consumer.inputs.contains(&tensor.id) {
                    return Err(invalid(format!(
                        "operator {} is a consumer of {} but does not read it",
                        target, tensor.id
                    )));
                }
            }
        }

        for op in self.operators() {
            let mut expected_preds: HashSet<OpId> = HashSet::new();
            for &input in &op.inputs {
                let tensor = self.tensors.get(&input).ok_or_else(|| {
                    invalid(format!("input {} of operator {} is not in the graph", input, op.id))
                })?;
                if !tensor.targets.contains(&op.id) {
                    return Err(invalid(format!(
                        "operator {} reads {} but is not among its consumers",
                        op.id, input
                    )));
                }
                expected_preds.extend(tensor.source);
            }

            let mut expected_succs: HashSet<OpId> = HashSet::new();
            for &output in &op.outputs {
                let tensor = self.tensors.get(&output).ok_or_else(|| {
                    invalid(format!("output {} of operator {} is not in the graph", output, op.id))
                })?;
                if tensor.source != Some(op.id) {
                    return Err(invalid(format!(
                        "operator {} writes {} but is not its producer",
                        op.id, output
                    )));
                }
                expected_succs.extend(tensor.targets.iter().copied());
            }

            for &pred in &op.predecessors {
                if !self.ops.contains_key(&pred) {
                    return Err(invalid(format!(
                        "predecessor {} of operator {} is not in the graph",
                        pred, op.id
                    )));
                }
            }
            for &succ in &op.successors {
                if !self.ops.contains_key(&succ) {
                    return Err(invalid(format!(
                        "successor {} of operator {} is not in the graph",
                        succ, op.id
                    )));
                }
            }

            let preds: HashSet<OpId> = op.predecessors.iter().copied().collect();
            if preds != expected_preds {
                return Err(invalid(format!(
                    "operator {} predecessors {:?} disagree with its input producers {:?}",
                    op.id, op.predecessors, expected_preds
                )));
            }
            let succs: HashSet<OpId> = op.successors.iter().copied().collect();
            if succs != expected_succs {
                return Err(invalid(format!(
                    "operator {} successors {:?} disagree with its output consumers {:?}",
                    op.id, op.successors, expected_succs
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: String) -> Error {
    Error::InvalidGraph(message)
}
