//! Tensor computation graphs with shape inference, local graph rewrites and
//! static memory planning.
//!
//! A [`Graph`] owns its tensors and operators and keeps producer/consumer and
//! predecessor/successor edges consistent through every mutation. The usual
//! driver sequence is [`Graph::optimize`], [`Graph::shape_infer`] and
//! [`Graph::data_malloc`].

pub mod error;
pub mod graph;
pub mod memory;
pub mod model;
pub mod ops;
pub mod optimization;
pub mod options;

// Re-export commonly used types
pub use error::{Error, Result};
pub use graph::Graph;
pub use memory::{Allocator, CpuProvider, MemoryPlan, MemoryProvider, TensorAllocation};
pub use model::{Blob, DataType, OpId, Operator, Tensor, TensorId};
pub use ops::{OpKind, OpType, Shape, ShapeInference};
pub use optimization::{GraphOptimizer, OptimizationStats, RewriteRule};
pub use options::{GraphOptions, OptimizationLevel};
