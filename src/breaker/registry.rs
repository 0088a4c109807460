//! Process-wide breaker table
//!
//! Constructed once per process and passed by handle to whatever needs a
//! breaker or wants to inspect them.

use super::{BreakerConfig, BreakerSnapshot, CircuitBreaker, ForcedState};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    overrides: BTreeMap<String, BreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            overrides: BTreeMap::new(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Use `config` for the breaker called `name` instead of the defaults
    pub fn with_override(mut self, name: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    pub fn from_settings(settings: &crate::config::BreakerSettings) -> Self {
        Self {
            defaults: settings.defaults.clone(),
            overrides: settings.overrides.clone(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    fn config_for(&self, name: &str) -> BreakerConfig {
        self.overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// The breaker for `name`, created on first use
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(breaker) = breakers.get(name) {
                return breaker.clone();
            }
        }
        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = name, "Registering circuit breaker");
                Arc::new(CircuitBreaker::new(name, self.config_for(name)))
            })
            .clone()
    }

    /// The breaker for `name`, only if it has been used
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Snapshots of every registered breaker, sorted by name
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn force_open(&self, name: &str) -> BreakerSnapshot {
        let breaker = self.get(name);
        breaker.force(ForcedState::Open);
        breaker.snapshot()
    }

    pub fn force_closed(&self, name: &str) -> BreakerSnapshot {
        let breaker = self.get(name);
        breaker.force(ForcedState::Closed);
        breaker.snapshot()
    }

    /// Drop the override on `name`; `None` if no such breaker exists
    pub fn clear_override(&self, name: &str) -> Option<BreakerSnapshot> {
        let breaker = self.find(name)?;
        breaker.clear_override();
        Some(breaker.snapshot())
    }

    /// Close `name` and clear its statistics; `None` if no such breaker exists
    pub fn reset(&self, name: &str) -> Option<BreakerSnapshot> {
        let breaker = self.find(name)?;
        breaker.reset();
        Some(breaker.snapshot())
    }
}
