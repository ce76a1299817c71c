pub mod allocator;
pub mod planner;
pub mod provider;

pub use allocator::Allocator;
pub use planner::{MemoryPlan, TensorAllocation};
pub use provider::{same_provider, CpuProvider, MemoryBlock, MemoryProvider};
