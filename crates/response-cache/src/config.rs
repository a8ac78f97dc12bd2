//! Cache TTL policy

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};

/// TTL per category with a default fallback.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub category_ttls: HashMap<String, Duration>,
    /// Fraction of `set()` calls that also sweep expired rows (0.0 to 1.0).
    pub sweep_probability: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            category_ttls: HashMap::new(),
            sweep_probability: 0.01,
        }
    }
}

impl CacheConfig {
    pub fn with_category(mut self, category: impl Into<String>, ttl: Duration) -> Self {
        self.category_ttls.insert(category.into(), ttl);
        self
    }

    pub fn with_sweep_probability(mut self, probability: f64) -> Self {
        self.sweep_probability = probability;
        self
    }

    /// TTL for `category`, falling back to `default_ttl`.
    pub fn ttl_for(&self, category: &str) -> Duration {
        self.category_ttls
            .get(category)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.sweep_probability) {
            return Err(Error::Config(format!(
                "sweep_probability must be within 0.0..=1.0, got {}",
                self.sweep_probability
            )));
        }
        if self.default_ttl.is_zero() {
            return Err(Error::Config("default_ttl must be greater than zero".into()));
        }
        if let Some((category, _)) = self.category_ttls.iter().find(|(_, ttl)| ttl.is_zero()) {
            return Err(Error::Config(format!(
                "ttl for category {category} must be greater than zero"
            )));
        }
        Ok(())
    }
}
