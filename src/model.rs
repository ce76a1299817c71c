use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::memory::provider::MemoryProvider;
use crate::ops::{OpKind, Shape};

static NEXT_TENSOR_ID: AtomicUsize = AtomicUsize::new(1);
static NEXT_OP_ID: AtomicUsize = AtomicUsize::new(1);

/// Unique identifier of a tensor, shared by every clone of it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TensorId(pub usize);

impl TensorId {
    fn next() -> Self {
        TensorId(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of an operator, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId(pub usize);

impl OpId {
    fn next() -> Self {
        OpId(NEXT_OP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Element types a tensor can hold
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
pub enum DataType {
    Float32,
    Float64,
    Float16,
    BFloat16,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Bool,
}

impl DataType {
    /// Width of one element in bytes
    pub fn size_in_bytes(&self) -> usize {
        use std::mem::size_of;
        match self {
            DataType::Float32 => size_of::<f32>(),
            DataType::Float64 => size_of::<f64>(),
            DataType::Float16 => size_of::<half::f16>(),
            DataType::BFloat16 => size_of::<half::bf16>(),
            DataType::Int8 => size_of::<i8>(),
            DataType::Int16 => size_of::<i16>(),
            DataType::Int32 => size_of::<i32>(),
            DataType::Int64 => size_of::<i64>(),
            DataType::UInt8 => size_of::<u8>(),
            DataType::UInt16 => size_of::<u16>(),
            DataType::UInt32 => size_of::<u32>(),
            DataType::UInt64 => size_of::<u64>(),
            DataType::Bool => size_of::<bool>(),
        }
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(
            self,
            DataType::Float32 | DataType::Float64 | DataType::Float16 | DataType::BFloat16
        )
    }
}

/// Memory bound to a tensor by planning: an arena base plus an offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blob {
    base: NonNull<u8>,
    offset: usize,
}

impl Blob {
    pub fn new(base: NonNull<u8>, offset: usize) -> Self {
        Self { base, offset }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Address of the first byte of the tensor
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr().wrapping_add(self.offset)
    }
}

/// A data value in the graph.
///
/// Edges are stored as ids; only the owning graph rewires them.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub(crate) id: TensorId,
    pub(crate) shape: Shape,
    pub(crate) data_type: DataType,
    pub(crate) source: Option<OpId>,
    pub(crate) targets: Vec<OpId>,
    pub(crate) data: Option<Blob>,
    pub(crate) provider: Arc<dyn MemoryProvider>,
}

impl Tensor {
    /// Create a detached tensor for `provider`, to be registered with a graph
    pub fn new(shape: Shape, data_type: DataType, provider: Arc<dyn MemoryProvider>) -> Self {
        Self {
            id: TensorId::next(),
            shape,
            data_type,
            source: None,
            targets: Vec::new(),
            data: None,
            provider,
        }
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Operator writing this tensor, if any
    pub fn source(&self) -> Option<OpId> {
        self.source
    }

    /// Operators reading this tensor
    pub fn targets(&self) -> &[OpId] {
        &self.targets
    }

    pub fn data(&self) -> Option<Blob> {
        self.data
    }

    pub fn provider(&self) -> &Arc<dyn MemoryProvider> {
        &self.provider
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Bytes needed to hold the tensor.
    ///
    /// Panics if the byte count does not fit in `usize`; see [`Tensor::checked_bytes`].
    pub fn bytes(&self) -> usize {
        match self.checked_bytes() {
            Some(bytes) => bytes,
            None => panic!(
                "tensor {} with shape {:?} of {} overflows usize bytes",
                self.id, self.shape, self.data_type
            ),
        }
    }

    /// Bytes needed to hold the tensor, or `None` on overflow
    pub fn checked_bytes(&self) -> Option<usize> {
        if self.shape.contains(&0) {
            return Some(0);
        }
        self.shape
            .iter()
            .try_fold(self.data_type.size_in_bytes(), |acc, &dim| acc.checked_mul(dim))
    }

    pub(crate) fn add_target(&mut self, op: OpId) {
        if !self.targets.contains(&op) {
            self.targets.push(op);
        }
    }

    pub(crate) fn remove_target(&mut self, op: OpId) {
        self.targets.retain(|&t| t != op);
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let targets: Vec<String> = self.targets.iter().map(|t| t.to_string()).collect();
        write!(
            f,
            "Tensor {}, shape {:?}, dtype {}, source {}, targets [{}]",
            self.id,
            self.shape,
            self.data_type,
            self.source.map_or("None".to_string(), |s| s.to_string()),
            targets.join(", ")
        )?;
        if let Some(blob) = self.data {
            write!(f, ", data {:p}", blob.as_ptr())?;
        }
        Ok(())
    }
}

/// A computation in the graph
#[derive(Debug, Clone)]
pub struct Operator {
    pub(crate) id: OpId,
    pub(crate) kind: OpKind,
    pub(crate) inputs: Vec<TensorId>,
    pub(crate) outputs: Vec<TensorId>,
    pub(crate) predecessors: Vec<OpId>,
    pub(crate) successors: Vec<OpId>,
}

impl Operator {
    /// Create an unconnected operator; `Graph::add_operator_and_connect` wires it in
    pub fn new(kind: OpKind, inputs: Vec<TensorId>, outputs: Vec<TensorId>) -> Self {
        Self {
            id: OpId::next(),
            kind,
            inputs,
            outputs,
            predecessors: Vec::new(),
            successors: Vec::new(),
        }
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn input(&self, index: usize) -> TensorId {
        self.inputs[index]
    }

    pub fn output(&self) -> TensorId {
        self.outputs[0]
    }

    pub fn predecessors(&self) -> &[OpId] {
        &self.predecessors
    }

    pub fn successors(&self) -> &[OpId] {
        &self.successors
    }

    pub(crate) fn add_predecessor(&mut self, op: OpId) {
        if !self.predecessors.contains(&op) {
            self.predecessors.push(op);
        }
    }

    pub(crate) fn remove_predecessor(&mut self, op: OpId) {
        self.predecessors.retain(|&p| p != op);
    }

    pub(crate) fn add_successor(&mut self, op: OpId) {
        if !self.successors.contains(&op) {
            self.successors.push(op);
        }
    }

    pub(crate) fn remove_successor(&mut self, op: OpId) {
        self.successors.retain(|&s| s != op);
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = |v: &[OpId]| v.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ");
        let tensors = |v: &[TensorId]| v.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ");
        write!(
            f,
            "OP {}, pred [{}], succ [{}], {}(in=[{}], out=[{}])",
            self.id,
            ids(&self.predecessors),
            ids(&self.successors),
            self.kind,
            tensors(&self.inputs),
            tensors(&self.outputs)
        )
    }
}
