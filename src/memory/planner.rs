use std::collections::HashMap;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::model::{Blob, OpId, TensorId};

/// Placement of one tensor inside the planned arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TensorAllocation {
    /// Tensor ID
    pub tensor_id: TensorId,
    /// Offset from the arena base
    pub offset: usize,
    /// Requested size in bytes, before alignment
    pub size_bytes: usize,
}

/// Result of planning a graph's memory
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryPlan {
    /// Allocations in tensor registration order
    pub allocations: Vec<TensorAllocation>,
    /// Operator order the plan was made for
    pub execution_order: Vec<OpId>,
    /// Bytes still live in the allocator after planning
    pub used_bytes: usize,
    /// Size of the materialized arena
    pub peak_bytes: usize,
}

impl MemoryPlan {
    /// Allocation of the given tensor, if it was planned
    pub fn allocation(&self, id: TensorId) -> Option<&TensorAllocation> {
        self.allocations.iter().find(|a| a.tensor_id == id)
    }

    /// Offsets keyed by tensor
    pub fn offsets(&self) -> HashMap<TensorId, usize> {
        self.allocations
            .iter()
            .map(|a| (a.tensor_id, a.offset))
            .collect()
    }

    /// Pretty-printed JSON rendering of the plan
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl Graph {
    /// Plan and bind memory for every tensor.
    ///
    /// Sorts the graph, reserves one aligned slot per tensor in registration
    /// order, materializes a single arena from the provider and points each
    /// tensor at `base + offset`. Planning happens once per graph: the
    /// allocator rejects further reservations after materialization.
    pub fn data_malloc(&mut self) -> Result<MemoryPlan> {
        if !self.topo_sort() {
            return Err(Error::CycleDetected(
                "cannot plan memory for a cyclic graph".to_string(),
            ));
        }

        let sizes = self.planned_sizes()?;
        let mut allocations = Vec::with_capacity(sizes.len());
        for (id, size_bytes) in sizes {
            let offset = self.allocator.alloc(size_bytes);
            log::debug!("tensor {} planned at offset {} ({} bytes)", id, offset, size_bytes);
            allocations.push(TensorAllocation {
                tensor_id: id,
                offset,
                size_bytes,
            });
        }

        let base = self.allocator.materialize()?;
        for allocation in &allocations {
            if let Some(tensor) = self.tensors.get_mut(&allocation.tensor_id) {
                tensor.data = Some(Blob::new(base, allocation.offset));
            }
        }
        self.allocator.info();

        Ok(MemoryPlan {
            allocations,
            execution_order: self.op_order.clone(),
            used_bytes: self.allocator.used(),
            peak_bytes: self.allocator.peak(),
        })
    }

    /// Byte size of every tensor in registration order.
    ///
    /// Fails when a tensor or the arena as a whole would exceed the largest
    /// allocation a provider can serve.
    fn planned_sizes(&self) -> Result<Vec<(TensorId, usize)>> {
        const MAX_ARENA: usize = isize::MAX as usize;

        let mut total: usize = 0;
        let mut sizes = Vec::with_capacity(self.tensor_order.len());
        for &id in &self.tensor_order {
            let tensor = &self.tensors[&id];
            let size_bytes = tensor
                .checked_bytes()
                .filter(|&bytes| bytes <= MAX_ARENA)
                .ok_or_else(|| {
                    Error::AllocationFailed(format!(
                        "tensor {} with shape {:?} of {} is too large to plan",
                        id,
                        tensor.shape(),
                        tensor.data_type()
                    ))
                })?;
            total = total
                .checked_add(self.allocator.aligned_size(size_bytes))
                .filter(|&total| total <= MAX_ARENA)
                .ok_or_else(|| {
                    Error::AllocationFailed(format!(
                        "arena for {} tensors exceeds {} bytes",
                        self.tensor_order.len(),
                        MAX_ARENA
                    ))
                })?;
            sizes.push((id, size_bytes));
        }
        Ok(sizes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::provider::CpuProvider;
    use crate::model::DataType;
    use crate::ops::{MatMul, Unary, UnaryOp};
    use crate::options::GraphOptions;

    #[test]
    fn test_data_malloc_binds_every_tensor() {
        let mut g = Graph::new(CpuProvider::shared());
        let a = g.add_tensor(vec![2, 3], DataType::Float32);
        let b = g.add_tensor(vec![3, 5], DataType::Float32);
        let mm = g.add_op(MatMul::new(false, false), &[a, b]).unwrap();
        let c = g.operator(mm).unwrap().output();

        let plan = g.data_malloc().unwrap();
        assert_eq!(plan.allocations.len(), 3);
        assert_eq!(plan.allocation(a).unwrap().offset, 0);
        assert_eq!(plan.allocation(b).unwrap().offset, 24);
        // 60 bytes round up to 64
        assert_eq!(plan.allocation(c).unwrap().offset, 88);
        assert_eq!(plan.peak_bytes, 128);
        assert_eq!(plan.execution_order, vec![mm]);

        let base = g.tensor(a).unwrap().data().unwrap().base();
        for id in [a, b, c] {
            let blob = g.tensor(id).unwrap().data().unwrap();
            assert_eq!(blob.base(), base);
            assert_eq!(blob.offset(), plan.offsets()[&id]);
        }
        assert!(g.allocator().is_materialized());
    }

    #[test]
    fn test_data_malloc_respects_alignment() {
        let options = GraphOptions::new().set_alignment(64);
        let mut g = Graph::with_options(CpuProvider::shared(), options);
        let x = g.add_tensor(vec![3], DataType::Int8);
        let relu = g.add_op(Unary::new(UnaryOp::Relu), &[x]).unwrap();
        let y = g.operator(relu).unwrap().output();

        let plan = g.data_malloc().unwrap();
        assert_eq!(plan.allocation(x).unwrap().offset, 0);
        assert_eq!(plan.allocation(y).unwrap().offset, 64);
        assert_eq!(plan.allocation(y).unwrap().size_bytes, 3);
        assert_eq!(plan.peak_bytes, 128);
        assert!(plan.to_json().unwrap().contains("\"peak_bytes\": 128"));
    }

    #[test]
    fn test_data_malloc_rejects_cycle() {
        let mut g = Graph::new(CpuProvider::shared());
        let x = g.add_tensor(vec![3], DataType::Float32);
        let y = g.add_tensor(vec![3], DataType::Float32);
        g.add_op_with_outputs(Unary::new(UnaryOp::Relu), &[x], &[y]).unwrap();
        g.add_op_with_outputs(Unary::new(UnaryOp::Abs), &[y], &[x]).unwrap();

        assert!(matches!(g.data_malloc(), Err(Error::CycleDetected(_))));
        assert!(!g.allocator().is_materialized());
    }

    #[test]
    fn test_data_malloc_rejects_oversized_tensors() {
        let mut g = Graph::new(CpuProvider::shared());
        let x = g.add_tensor(vec![usize::MAX / 2, 4], DataType::Float32);
        g.add_op(Unary::new(UnaryOp::Relu), &[x]).unwrap();
        assert!(matches!(g.data_malloc(), Err(Error::AllocationFailed(_))));

        // each tensor fits on its own, the arena does not
        let mut g = Graph::new(CpuProvider::shared());
        let x = g.add_tensor(vec![isize::MAX as usize / 2 + 1], DataType::Int8);
        g.add_op(Unary::new(UnaryOp::Abs), &[x]).unwrap();
        assert!(matches!(g.data_malloc(), Err(Error::AllocationFailed(_))));
        assert_eq!(g.allocator().used(), 0);
        assert!(!g.allocator().is_materialized());
    }
}
