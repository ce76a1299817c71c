pub mod graph_optimizer;

pub mod passes {
    pub mod matmul_fusion;
    pub mod transpose_fusion;
}

pub use graph_optimizer::{GraphOptimizer, OptimizationStats, RewriteRule, RuleResult};
