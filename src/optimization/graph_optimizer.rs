use std::time::{Duration, Instant};

use serde::Serialize;

use crate::graph::Graph;
use crate::options::{GraphOptions, OptimizationLevel};

/// Rewrites applied by a single rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleResult {
    /// Name of the rule
    pub name: String,
    /// Number of times the rule fired
    pub rewrites_applied: usize,
}

/// Statistics from running the optimizer to a fixpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizationStats {
    /// Results from each rule that fired at least once
    pub rule_results: Vec<RuleResult>,
    /// Total number of rewrites applied
    pub total_rewrites: usize,
    /// Number of scans over the operator order, including the final quiet one
    pub scans: usize,
    /// Total time spent optimizing
    pub total_duration: Duration,
}

impl OptimizationStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any rule fired
    pub fn changed(&self) -> bool {
        self.total_rewrites > 0
    }

    /// Count one rewrite by `rule`
    pub fn record(&mut self, rule: &str) {
        self.total_rewrites += 1;
        match self.rule_results.iter_mut().find(|r| r.name == rule) {
            Some(result) => result.rewrites_applied += 1,
            None => self.rule_results.push(RuleResult {
                name: rule.to_string(),
                rewrites_applied: 1,
            }),
        }
    }

    /// Rewrites applied by the rule called `name`
    pub fn rewrites_for(&self, name: &str) -> usize {
        self.rule_results
            .iter()
            .find(|r| r.name == name)
            .map_or(0, |r| r.rewrites_applied)
    }
}

/// A local rewrite anchored at one position of the operator order
pub trait RewriteRule: Send + Sync {
    /// Name of the rule
    fn name(&self) -> &str;

    /// Try to rewrite the graph around the operator at `position`.
    ///
    /// Returns true if the graph changed. A rule that returns false must
    /// leave the graph untouched.
    fn apply(&self, graph: &mut Graph, position: usize) -> bool;
}

/// Applies rewrite rules until a full scan changes nothing
pub struct GraphOptimizer {
    rules: Vec<Box<dyn RewriteRule>>,
    validate_after_rewrite: bool,
}

impl GraphOptimizer {
    /// Create an optimizer with no rules
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            validate_after_rewrite: false,
        }
    }

    /// Optimizer with the rules and checks selected by `options`
    pub fn for_options(options: &GraphOptions) -> Self {
        let mut optimizer = Self::new();
        for rule in Self::create_default_rules(options.optimization_level) {
            optimizer.register_rule(rule);
        }
        optimizer.validate_after_rewrite = options.validate_after_rewrite;
        optimizer
    }

    /// Register a rule; rules are tried in registration order
    pub fn register_rule(&mut self, rule: Box<dyn RewriteRule>) {
        self.rules.push(rule);
    }

    /// Run the full validity check after every rewrite
    pub fn set_validate_after_rewrite(mut self, validate: bool) -> Self {
        self.validate_after_rewrite = validate;
        self
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Rules for the given optimization level
    pub fn create_default_rules(level: OptimizationLevel) -> Vec<Box<dyn RewriteRule>> {
        use crate::optimization::passes::matmul_fusion::MatMulTransposeFusion;
        use crate::optimization::passes::transpose_fusion::TransposeFusion;

        match level {
            OptimizationLevel::None => Vec::new(),
            OptimizationLevel::Basic => {
                vec![Box::new(TransposeFusion::new()) as Box<dyn RewriteRule>]
            }
            OptimizationLevel::Standard => vec![
                Box::new(TransposeFusion::new()) as Box<dyn RewriteRule>,
                Box::new(MatMulTransposeFusion::new()) as Box<dyn RewriteRule>,
            ],
        }
    }

    /// Scan the operator order front to back, restarting after every
    /// rewrite, until one scan fires no rule.
    pub fn run(&self, graph: &mut Graph) -> OptimizationStats {
        let start = Instant::now();
        let mut stats = OptimizationStats::new();
        if self.rules.is_empty() {
            log::warn!("no rewrite rules registered, skipping optimization");
            return stats;
        }

        'fixpoint: loop {
            stats.scans += 1;
            for position in 0..graph.op_ids().len() {
                for rule in &self.rules {
                    if !rule.apply(graph, position) {
                        continue;
                    }
                    stats.record(rule.name());
                    log::debug!(
                        "{} rewrote the graph at position {}, {} operators left",
                        rule.name(),
                        position,
                        graph.op_ids().len()
                    );
                    if self.validate_after_rewrite {
                        graph.check_valid();
                    }
                    continue 'fixpoint;
                }
            }
            break;
        }

        stats.total_duration = start.elapsed();
        log::info!(
            "optimization applied {} rewrites in {} scans ({:?})",
            stats.total_rewrites,
            stats.scans,
            stats.total_duration
        );
        stats
    }
}

impl Default for GraphOptimizer {
    fn default() -> Self {
        Self::for_options(&GraphOptions::default())
    }
}
