//! Heuristic read of the grip -> delivery -> end-to-end funnel.
//!
//! Everything here is advisory: the orchestrator records the report in the run
//! summary and journal but never branches on it.

use autopilot_core::Metrics;
use serde::{Deserialize, Serialize};

const NEAR_ZERO: f64 = 0.05;
const HIGH_COLLISION: f64 = 0.2;
const LOW_HOVER: f64 = 0.1;
const HEALTHY_END_TO_END: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Ok => "ok",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub code: String,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorReport {
    pub severity: Severity,
    pub insights: Vec<Insight>,
}

impl BehaviorReport {
    pub fn messages(&self) -> Vec<String> {
        self.insights.iter().map(|i| i.message.clone()).collect()
    }
}

type Rule = fn(&Metrics) -> Option<Insight>;

const RULES: &[Rule] = &[
    no_funnel_data,
    approaches_without_grip,
    grip_without_delivery,
    reward_without_success,
    frequent_collisions,
    little_hover_at_pickup,
    healthy_pipeline,
];

pub fn analyze(metrics: &Metrics) -> BehaviorReport {
    let insights: Vec<Insight> = RULES.iter().filter_map(|rule| rule(metrics)).collect();
    let severity = insights
        .iter()
        .map(|i| i.severity)
        .max()
        .unwrap_or(Severity::Ok);
    BehaviorReport { severity, insights }
}

fn insight(code: &str, severity: Severity, message: String) -> Option<Insight> {
    Some(Insight {
        code: code.to_string(),
        severity,
        message,
    })
}

fn no_funnel_data(m: &Metrics) -> Option<Insight> {
    if m.grip_success.is_none() && m.delivery_success.is_none() && m.end_to_end_success.is_none()
    {
        return insight(
            "no_funnel_data",
            Severity::Info,
            "no grip/delivery/end-to-end metrics were reported".to_string(),
        );
    }
    None
}

fn approaches_without_grip(m: &Metrics) -> Option<Insight> {
    let attempts = m.grip_attempts?;
    let grip = m.grip_success?;
    if attempts > 0.0 && grip < NEAR_ZERO {
        return insight(
            "approach_no_grip",
            Severity::Critical,
            format!(
                "agent reaches the pickup ({:.3}) but almost never grips ({:.3})",
                attempts, grip
            ),
        );
    }
    None
}

fn grip_without_delivery(m: &Metrics) -> Option<Insight> {
    let grip = m.grip_success?;
    let delivery = m.delivery_success?;
    if grip >= NEAR_ZERO && delivery < grip * 0.1 {
        return insight(
            "grip_no_delivery",
            Severity::Warning,
            format!(
                "grips succeed ({:.3}) but deliveries stall ({:.3})",
                grip, delivery
            ),
        );
    }
    None
}

fn reward_without_success(m: &Metrics) -> Option<Insight> {
    let reward = m.mean_reward?;
    let e2e = m.end_to_end_success.unwrap_or(0.0);
    if reward > 0.0 && e2e < NEAR_ZERO && m.delivery_success.unwrap_or(0.0) < NEAR_ZERO {
        return insight(
            "reward_without_success",
            Severity::Warning,
            format!(
                "mean reward is positive ({:.3}) without end-to-end success; shaping terms may dominate",
                reward
            ),
        );
    }
    None
}

fn frequent_collisions(m: &Metrics) -> Option<Insight> {
    let rate = m.collision_rate?;
    if rate > HIGH_COLLISION {
        return insight(
            "frequent_collisions",
            Severity::Warning,
            format!("collision rate is high ({:.3})", rate),
        );
    }
    None
}

fn little_hover_at_pickup(m: &Metrics) -> Option<Insight> {
    let hover = m.hover_efficiency?;
    if m.grip_attempts.unwrap_or(0.0) > 0.0 && hover < LOW_HOVER {
        return insight(
            "little_hover",
            Severity::Info,
            format!("little time spent hovering at pickup ({:.3})", hover),
        );
    }
    None
}

fn healthy_pipeline(m: &Metrics) -> Option<Insight> {
    let e2e = m.end_to_end_success?;
    if e2e >= HEALTHY_END_TO_END {
        return insight(
            "healthy_pipeline",
            Severity::Ok,
            format!("end-to-end success at {:.3}", e2e),
        );
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_is_informational() {
        let report = analyze(&Metrics::default());
        assert_eq!(report.severity, Severity::Info);
        assert_eq!(report.insights.len(), 1);
        assert_eq!(report.insights[0].code, "no_funnel_data");
    }

    #[test]
    fn approach_without_grip_is_critical() {
        let m = Metrics {
            grip_attempts: Some(0.8),
            grip_success: Some(0.0),
            delivery_success: Some(0.0),
            ..Metrics::default()
        };
        let report = analyze(&m);
        assert_eq!(report.severity, Severity::Critical);
        assert!(report.insights.iter().any(|i| i.code == "approach_no_grip"));
    }

    #[test]
    fn grip_without_delivery_warns() {
        let m = Metrics {
            grip_success: Some(0.6),
            delivery_success: Some(0.01),
            ..Metrics::default()
        };
        let report = analyze(&m);
        assert_eq!(report.severity, Severity::Warning);
        assert_eq!(report.insights[0].code, "grip_no_delivery");
    }

    #[test]
    fn healthy_run_stays_ok() {
        let m = Metrics {
            grip_success: Some(0.9),
            delivery_success: Some(0.8),
            end_to_end_success: Some(0.7),
            mean_reward: Some(3.0),
            collision_rate: Some(0.01),
            ..Metrics::default()
        };
        let report = analyze(&m);
        assert_eq!(report.severity, Severity::Ok);
        assert_eq!(report.messages(), vec!["end-to-end success at 0.700".to_string()]);
    }

    #[test]
    fn severity_serializes_lowercase() {
        let v = serde_json::to_value(Severity::Warning).expect("ser");
        assert_eq!(v, serde_json::json!("warning"));
        assert_eq!(Severity::Critical.as_str(), "critical");
    }
}
