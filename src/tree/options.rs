use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// Configuration knobs for a tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataOptions {
    /// Maximum live records per leaf after a balance pass.
    pub leaf_size: usize,
    /// Maximum children per branch after a balance pass.
    pub branch_size: usize,
    /// Cache heft above which unreferenced pages are purged.
    pub max_heft: usize,
}

impl Default for StrataOptions {
    fn default() -> Self {
        Self {
            leaf_size: 16,
            branch_size: 16,
            max_heft: 4 * 1024 * 1024,
        }
    }
}

impl StrataOptions {
    /// Parses options from TOML; absent fields keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: StrataOptions = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// Rejects sizes the balancer cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.leaf_size < 1 {
            return Err(StrataError::InvalidArgument(
                "leaf_size must be at least 1".into(),
            ));
        }
        if self.branch_size < 2 {
            return Err(StrataError::InvalidArgument(
                "branch_size must be at least 2".into(),
            ));
        }
        Ok(())
    }
}
