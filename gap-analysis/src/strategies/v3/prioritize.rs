use serde_json::json;

use super::analyzers::DetectedGap;

/// Feedback hook: tenants dismissing a gap type damp its future score,
/// accepting it boosts it. The default hook is neutral.
pub trait FeedbackHooks: Send + Sync {
    fn weight_for(&self, _gap_type: &str) -> f64 {
        1.0
    }
}

pub struct NeutralFeedback;

impl FeedbackHooks for NeutralFeedback {}

#[derive(Debug)]
pub struct PrioritizedGap {
    pub gap: DetectedGap,
    pub final_score: f64,
    pub breakdown: serde_json::Value,
}

impl PrioritizedGap {
    /// 1..=5 priority from the 0..=1 score.
    pub fn priority(&self) -> i64 {
        ((self.final_score * 5.0).floor() as i64 + 1).clamp(1, 5)
    }
}

/// Category weights: operational knowledge outranks background context.
fn category_factor(category_label: &str) -> f64 {
    match category_label {
        "process" | "technical" => 1.0,
        "rationale" | "decision" => 0.9,
        "relationship" => 0.8,
        "timeline" | "outcome" => 0.7,
        _ => 0.6,
    }
}

/// Multi-factor score: severity carries the most weight, corroborating
/// evidence and category matter, tenant feedback scales the result.
pub fn prioritize(
    gaps: Vec<DetectedGap>,
    feedback: &dyn FeedbackHooks,
    top_n: usize,
) -> Vec<PrioritizedGap> {
    let mut prioritized: Vec<PrioritizedGap> = gaps
        .into_iter()
        .map(|gap| {
            let severity = gap.severity.weight();
            let evidence = (gap.evidence_docs.len() as f64 / 3.0).min(1.0);
            let category = category_factor(gap.category_label);
            let feedback_weight = feedback.weight_for(gap.gap_type).clamp(0.1, 2.0);

            let raw = 0.5 * severity + 0.25 * evidence + 0.25 * category;
            let final_score = (raw * feedback_weight).clamp(0.0, 1.0);

            let breakdown = json!({
                "severity": severity,
                "evidence": evidence,
                "category": category,
                "feedback_weight": feedback_weight,
            });

            PrioritizedGap {
                gap,
                final_score,
                breakdown,
            }
        })
        .collect();

    prioritized.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    prioritized.truncate(top_n);
    prioritized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::v3::analyzers::Severity;

    fn gap(gap_type: &'static str, severity: Severity, docs: usize) -> DetectedGap {
        DetectedGap {
            gap_type,
            severity,
            title: gap_type.to_string(),
            description: String::new(),
            category_label: "process",
            subject: "s".to_string(),
            evidence_docs: (0..docs).map(|i| format!("d{i}")).collect(),
        }
    }

    #[test]
    fn severity_dominates_the_ordering() {
        let gaps = vec![
            gap("low", Severity::Low, 3),
            gap("critical", Severity::Critical, 1),
        ];
        let prioritized = prioritize(gaps, &NeutralFeedback, 10);
        assert_eq!(prioritized[0].gap.gap_type, "critical");
        assert!(prioritized[0].final_score > prioritized[1].final_score);
    }

    #[test]
    fn priorities_land_in_range() {
        let gaps = vec![
            gap("a", Severity::Low, 0),
            gap("b", Severity::Critical, 3),
        ];
        for p in prioritize(gaps, &NeutralFeedback, 10) {
            assert!((1..=5).contains(&p.priority()), "priority {}", p.priority());
        }
    }

    #[test]
    fn feedback_weight_reorders_gap_types() {
        struct DampedBusFactor;
        impl FeedbackHooks for DampedBusFactor {
            fn weight_for(&self, gap_type: &str) -> f64 {
                if gap_type == "bus_factor" {
                    0.2
                } else {
                    1.0
                }
            }
        }

        let gaps = vec![
            gap("bus_factor", Severity::Critical, 3),
            gap("process_completeness", Severity::High, 1),
        ];
        let prioritized = prioritize(gaps, &DampedBusFactor, 10);
        assert_eq!(prioritized[0].gap.gap_type, "process_completeness");
    }

    #[test]
    fn top_n_truncates_after_sorting() {
        let gaps = vec![
            gap("a", Severity::Low, 0),
            gap("b", Severity::Critical, 3),
            gap("c", Severity::Medium, 1),
        ];
        let prioritized = prioritize(gaps, &NeutralFeedback, 2);
        assert_eq!(prioritized.len(), 2);
        assert_eq!(prioritized[0].gap.gap_type, "b");
    }
}
