//! ---
//! fl_section: "01-core-orchestration"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Chaos driver seam and registry."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{info, warn};

use faultline_types::{ChaosKind, Experiment};

/// Undo action returned by a driver. Exclusively owned by the execution that
/// obtained it and invoked at most once.
pub type UndoFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Pluggable component that knows how to apply and revert one category of
/// fault. Called once per execution.
#[async_trait::async_trait]
pub trait ChaosDriver: Send + Sync {
    /// Apply the fault described by the experiment and return the action that
    /// reverts it.
    async fn inject(&self, experiment: &Experiment) -> Result<UndoFn>;
}

/// Maps each chaos kind to the driver that implements it.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<HashMap<ChaosKind, Arc<dyn ChaosDriver>>>,
}

impl DriverRegistry {
    /// Empty registry; every kind must be registered explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the simulated driver installed for every kind, the
    /// development and demo default.
    pub fn with_simulated_defaults() -> Self {
        let registry = Self::new();
        for kind in ChaosKind::ALL {
            registry.register(kind, Arc::new(SimulatedDriver));
        }
        registry
    }

    /// Install or replace the driver for a kind.
    pub fn register(&self, kind: ChaosKind, driver: Arc<dyn ChaosDriver>) {
        self.drivers.write().insert(kind, driver);
    }

    /// Look up the driver for a kind.
    pub fn resolve(&self, kind: ChaosKind) -> Option<Arc<dyn ChaosDriver>> {
        self.drivers.read().get(&kind).cloned()
    }

    /// Kinds with a driver installed.
    pub fn registered_kinds(&self) -> Vec<ChaosKind> {
        let drivers = self.drivers.read();
        ChaosKind::ALL
            .into_iter()
            .filter(|kind| drivers.contains_key(kind))
            .collect()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("registered", &self.registered_kinds())
            .finish()
    }
}

/// Driver that records injections in the log without touching any real
/// system. Stands in for production drivers in development builds.
#[derive(Debug, Default)]
pub struct SimulatedDriver;

#[async_trait::async_trait]
impl ChaosDriver for SimulatedDriver {
    async fn inject(&self, experiment: &Experiment) -> Result<UndoFn> {
        warn!(
            target: "faultline::drivers",
            kind = experiment.kind.as_str(),
            fault_target = %experiment.target,
            intensity = experiment.parameters.intensity,
            duration_ms = experiment.parameters.duration.as_millis() as u64,
            "fault injected (simulated)",
        );
        let kind = experiment.kind;
        let fault_target = experiment.target.clone();
        Ok(Box::new(move || {
            async move {
                info!(
                    target: "faultline::drivers",
                    kind = kind.as_str(),
                    fault_target = %fault_target,
                    "fault reverted (simulated)",
                );
                Ok(())
            }
            .boxed()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_types::ExperimentDefinition;

    fn experiment() -> Experiment {
        let definition: ExperimentDefinition = serde_json::from_value(serde_json::json!({
            "name": "latency probe",
            "target": "cart-service",
            "type": "network-latency",
            "parameters": {"duration": 500, "intensity": 30},
        }))
        .unwrap();
        Experiment::from_definition(definition)
    }

    #[tokio::test]
    async fn simulated_driver_round_trip() {
        let driver = SimulatedDriver;
        let undo = driver.inject(&experiment()).await.unwrap();
        undo().await.unwrap();
    }

    #[test]
    fn defaults_cover_every_kind() {
        let registry = DriverRegistry::with_simulated_defaults();
        assert_eq!(registry.registered_kinds().len(), ChaosKind::ALL.len());
        for kind in ChaosKind::ALL {
            assert!(registry.resolve(kind).is_some());
        }
    }

    #[test]
    fn empty_registry_resolves_nothing() {
        let registry = DriverRegistry::new();
        assert!(registry.resolve(ChaosKind::CpuStress).is_none());
        assert!(registry.registered_kinds().is_empty());
    }
}
