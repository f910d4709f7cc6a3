//! ---
//! fl_section: "01-core-orchestration"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Metrics gateway seam and simulated readings."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use faultline_types::MetricsSnapshot;

/// Source of live health readings for a target. Implemented by an external
/// metrics provider in production; the engine only ever reads through this
/// seam.
#[async_trait::async_trait]
pub trait MetricsGateway: Send + Sync {
    /// Current value of one named metric for a target.
    async fn get_metric(&self, name: &str, target: &str) -> Result<f64>;
    /// Full point-in-time snapshot for a target.
    async fn snapshot(&self, target: &str) -> Result<MetricsSnapshot>;
}

/// Deterministic pseudo-random gateway for development and demo runs.
/// Understands `cpu_usage`, `memory_usage`, `error_rate`, `response_time`,
/// and `throughput`.
#[derive(Debug)]
pub struct SimulatedGateway {
    rng: Mutex<StdRng>,
}

impl SimulatedGateway {
    /// Build a gateway with the default seed.
    pub fn new() -> Self {
        Self::with_seed(0xFA17_u64)
    }

    /// Seed the internal RNG to guarantee reproducible readings.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn sample(&self, name: &str) -> Result<f64> {
        let mut rng = self.rng.lock();
        let value = match name {
            "cpu_usage" => rng.gen_range(20.0..75.0),
            "memory_usage" => rng.gen_range(30.0..70.0),
            "error_rate" => rng.gen_range(0.0..2.0),
            "response_time" => rng.gen_range(40.0..220.0),
            "throughput" => rng.gen_range(80.0..400.0),
            other => return Err(anyhow!("unknown metric {other}")),
        };
        Ok(value)
    }
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MetricsGateway for SimulatedGateway {
    async fn get_metric(&self, name: &str, _target: &str) -> Result<f64> {
        self.sample(name)
    }

    async fn snapshot(&self, _target: &str) -> Result<MetricsSnapshot> {
        let response_times_ms = (0..5)
            .map(|_| self.sample("response_time"))
            .collect::<Result<Vec<_>>>()?;
        Ok(MetricsSnapshot {
            captured_at: Utc::now(),
            cpu_percent: self.sample("cpu_usage")?,
            memory_percent: self.sample("memory_usage")?,
            response_times_ms,
            error_rate: self.sample("error_rate")?,
            throughput: self.sample("throughput")?,
        })
    }
}
