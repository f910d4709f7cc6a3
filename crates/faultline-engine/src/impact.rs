//! ---
//! fl_section: "01-core-orchestration"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Before/after impact analysis helpers."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::time::Duration;

use faultline_types::{Experiment, ImpactAnalysis, MetricsSnapshot};

/// Relative response-time growth as a percentage of the baseline average.
/// Zero when there is no baseline to compare against.
pub fn performance_degradation_pct(before_avg_ms: f64, after_avg_ms: f64) -> f64 {
    if before_avg_ms == 0.0 {
        return 0.0;
    }
    (after_avg_ms - before_avg_ms) / before_avg_ms * 100.0
}

/// Compare before/after snapshots into an impact analysis.
///
/// `availability_impact` is a deliberately simple proxy derived from the
/// post-run error rate, and `recovery_time` is the wall-clock execution
/// duration standing in for measured recovery.
pub fn analyze(
    before: &MetricsSnapshot,
    after: &MetricsSnapshot,
    recovery_time: Duration,
    blast_radius: Vec<String>,
) -> ImpactAnalysis {
    ImpactAnalysis {
        performance_degradation_pct: performance_degradation_pct(
            before.avg_response_time_ms(),
            after.avg_response_time_ms(),
        ),
        error_rate_increase: after.error_rate - before.error_rate,
        availability_impact: (after.error_rate * 10.0).min(100.0),
        recovery_time,
        blast_radius,
    }
}

/// Components exposed to an experiment's fault. Reads the `targets` metadata
/// annotation (comma-separated) when present, otherwise the experiment
/// target itself. A heuristic; deployments with a dependency map can
/// annotate richer lists.
pub fn derive_blast_radius(experiment: &Experiment) -> Vec<String> {
    if let Some(raw) = experiment.metadata.get("targets") {
        let components: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|component| !component.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        if !components.is_empty() {
            return components;
        }
    }
    vec![experiment.target.clone()]
}

/// Heuristic observations derived from a computed impact analysis.
pub fn lessons_learned(impact: &ImpactAnalysis, rollback_triggered: bool) -> Vec<String> {
    let mut lessons = Vec::new();
    if rollback_triggered {
        lessons.push(
            "safety rollback fired before the configured duration elapsed; \
             review the trigger thresholds against expected steady-state"
                .to_owned(),
        );
    }
    if impact.performance_degradation_pct > 50.0 {
        lessons.push(format!(
            "response times degraded {:.1}% under fault; the target lacks headroom at this intensity",
            impact.performance_degradation_pct
        ));
    } else if impact.performance_degradation_pct > 10.0 {
        lessons.push(format!(
            "moderate response-time degradation ({:.1}%); acceptable but worth tracking",
            impact.performance_degradation_pct
        ));
    }
    if impact.error_rate_increase > 5.0 {
        lessons.push(format!(
            "error rate grew {:.1} points during the fault; downstream retries or fallbacks are not absorbing it",
            impact.error_rate_increase
        ));
    }
    if lessons.is_empty() {
        lessons.push("target absorbed the fault with no measurable degradation".to_owned());
    }
    lessons
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use faultline_types::ExperimentDefinition;

    fn snapshot(response_times_ms: Vec<f64>, error_rate: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            captured_at: Utc::now(),
            cpu_percent: 40.0,
            memory_percent: 50.0,
            response_times_ms,
            error_rate,
            throughput: 100.0,
        }
    }

    #[test]
    fn degradation_is_zero_for_equal_response_times() {
        assert_eq!(performance_degradation_pct(100.0, 100.0), 0.0);
    }

    #[test]
    fn degradation_is_zero_without_baseline() {
        assert_eq!(performance_degradation_pct(0.0, 250.0), 0.0);
    }

    #[test]
    fn degradation_scales_as_percentage_of_baseline() {
        assert_eq!(performance_degradation_pct(100.0, 150.0), 50.0);
        assert!(performance_degradation_pct(100.0, 101.0) > 0.0);
    }

    #[test]
    fn analysis_combines_deltas_and_caps_availability() {
        let before = snapshot(vec![100.0], 1.0);
        let after = snapshot(vec![150.0], 15.0);
        let impact = analyze(
            &before,
            &after,
            Duration::from_secs(3),
            vec!["checkout".into()],
        );
        assert_eq!(impact.performance_degradation_pct, 50.0);
        assert_eq!(impact.error_rate_increase, 14.0);
        assert_eq!(impact.availability_impact, 100.0);
        assert_eq!(impact.recovery_time, Duration::from_secs(3));
    }

    #[test]
    fn blast_radius_prefers_metadata_targets() {
        let definition: ExperimentDefinition = serde_json::from_value(serde_json::json!({
            "name": "exp",
            "target": "checkout-service",
            "type": "dependency-chaos",
            "parameters": {"duration": 1000, "intensity": 20},
            "metadata": {"targets": "checkout-service, payment-service ,inventory-service"},
        }))
        .unwrap();
        let experiment = Experiment::from_definition(definition);
        assert_eq!(
            derive_blast_radius(&experiment),
            vec![
                "checkout-service".to_owned(),
                "payment-service".to_owned(),
                "inventory-service".to_owned()
            ]
        );
    }

    #[test]
    fn blast_radius_falls_back_to_target() {
        let definition: ExperimentDefinition = serde_json::from_value(serde_json::json!({
            "name": "exp",
            "target": "checkout-service",
            "type": "cpu-stress",
            "parameters": {"duration": 1000, "intensity": 20},
        }))
        .unwrap();
        let experiment = Experiment::from_definition(definition);
        assert_eq!(derive_blast_radius(&experiment), vec!["checkout-service".to_owned()]);
    }

    #[test]
    fn lessons_mention_rollback_and_clean_passes() {
        let impact = analyze(
            &snapshot(vec![100.0], 0.5),
            &snapshot(vec![100.0], 0.5),
            Duration::from_secs(1),
            vec![],
        );
        let clean = lessons_learned(&impact, false);
        assert_eq!(clean.len(), 1);
        assert!(clean[0].contains("absorbed"));

        let rolled = lessons_learned(&impact, true);
        assert!(rolled[0].contains("rollback"));
    }
}
