use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::Result;

/// Which rewrite rules the optimizer runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum OptimizationLevel {
    /// No rewrites
    None,
    /// Transpose elimination only
    Basic,
    /// Transpose elimination and Transpose/MatMul fusion (default)
    Standard,
}

impl Default for OptimizationLevel {
    fn default() -> Self {
        OptimizationLevel::Standard
    }
}

/// Width of the widest supported element type
pub const DEFAULT_ALIGNMENT: usize = std::mem::size_of::<u64>();

/// Options for building, optimizing and planning a graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphOptions {
    /// Level of optimization to apply in `Graph::optimize`
    pub optimization_level: OptimizationLevel,
    /// Alignment in bytes of every planned tensor buffer
    pub alignment: usize,
    /// Run the full validity check after every rewrite
    pub validate_after_rewrite: bool,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            optimization_level: OptimizationLevel::Standard,
            alignment: DEFAULT_ALIGNMENT,
            validate_after_rewrite: cfg!(debug_assertions),
        }
    }
}

impl GraphOptions {
    /// Create a new options object with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse options from a JSON document; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let options: GraphOptions = serde_json::from_str(json)?;
        if !options.alignment.is_power_of_two() {
            let err = <serde_json::Error as serde::de::Error>::custom(format!(
                "alignment must be a non-zero power of two, got {}",
                options.alignment
            ));
            return Err(err.into());
        }
        Ok(options)
    }

    /// Set the optimization level
    pub fn set_optimization_level(mut self, level: OptimizationLevel) -> Self {
        self.optimization_level = level;
        self
    }

    /// Set the buffer alignment; must be a non-zero power of two
    pub fn set_alignment(mut self, alignment: usize) -> Self {
        assert!(
            alignment.is_power_of_two(),
            "alignment must be a non-zero power of two, got {}",
            alignment
        );
        self.alignment = alignment;
        self
    }

    /// Enable or disable validation after every rewrite
    pub fn validate_after_rewrite(mut self, enable: bool) -> Self {
        self.validate_after_rewrite = enable;
        self
    }
}
