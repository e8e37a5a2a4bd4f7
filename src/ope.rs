//! C13: off-policy evaluator.
//!
//! Estimates how a candidate policy would have performed on logged
//! experience collected under a different (behavior) policy, without
//! deploying it. Implements importance sampling (IS), weighted importance
//! sampling (WIS), the direct method (DM), and doubly-robust (DR)
//! estimators, each with a bootstrap or Gaussian confidence interval,
//! grounded on the original's `ope_evaluator.py`.

use serde::{Deserialize, Serialize};

use crate::Experience;

/// Clip importance weights at this ratio to bound variance from rare
/// trajectories, per the original's fixed clipping constant.
const IS_WEIGHT_CLIP: f32 = 10.0;
const BOOTSTRAP_RESAMPLES: usize = 1000;
const GAUSSIAN_THRESHOLD: usize = 30;

/// One estimator's point estimate plus a 95% confidence interval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Estimate {
    pub value: f32,
    pub ci_low: f32,
    pub ci_high: f32,
}

/// Combined report across all four estimators plus a consensus value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub importance_sampling: Estimate,
    pub weighted_importance_sampling: Estimate,
    pub direct_method: Estimate,
    pub doubly_robust: Estimate,
    pub consensus: f32,
    /// In `[0.5, 1.0]`: `1 - std/|mean|` across the four estimators,
    /// floored at 0.5 so a wildly disagreeing panel never reports
    /// "zero confidence" (that would be indistinguishable from "no
    /// estimate available" downstream).
    pub confidence: f32,
}

/// A logged transition annotated with the behavior policy's probability
/// of having taken the logged action, and the value-function estimate a
/// trained critic assigns to (state, action) pairs. Produced by the
/// orchestrator from `Experience` plus an auxiliary value model; kept
/// separate from `Experience` itself so OPE has no dependency on how the
/// critic was trained.
#[derive(Debug, Clone)]
pub struct LoggedStep {
    pub experience: Experience,
    pub behavior_prob: f32,
    pub target_prob: f32,
    pub q_estimate: f32,
    pub v_estimate: f32,
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

fn std_dev(values: &[f32], mean_value: f32) -> f32 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance = values
        .iter()
        .map(|v| (v - mean_value).powi(2))
        .sum::<f32>()
        / (values.len() - 1) as f32;
    variance.sqrt()
}

/// Confidence interval via bootstrap resampling for small samples
/// (n < 30), falling back to a Gaussian approximation for larger samples
/// where the bootstrap's extra cost buys little.
fn confidence_interval(values: &[f32]) -> (f32, f32) {
    let point = mean(values);
    if values.is_empty() {
        return (0.0, 0.0);
    }
    if values.len() >= GAUSSIAN_THRESHOLD {
        let se = std_dev(values, point) / (values.len() as f32).sqrt();
        return (point - 1.96 * se, point + 1.96 * se);
    }

    let mut rng = rand::thread_rng();
    let mut resampled_means = Vec::with_capacity(BOOTSTRAP_RESAMPLES);
    for _ in 0..BOOTSTRAP_RESAMPLES {
        let sample: Vec<f32> = (0..values.len())
            .map(|_| values[rand::Rng::gen_range(&mut rng, 0..values.len())])
            .collect();
        resampled_means.push(mean(&sample));
    }
    resampled_means.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let lo_idx = ((resampled_means.len() as f32) * 0.025) as usize;
    let hi_idx = (((resampled_means.len() as f32) * 0.975) as usize).min(resampled_means.len() - 1);
    (resampled_means[lo_idx], resampled_means[hi_idx])
}

fn estimate_from(values: &[f32]) -> Estimate {
    let (lo, hi) = confidence_interval(values);
    Estimate {
        value: mean(values),
        ci_low: lo,
        ci_high: hi,
    }
}

/// Evaluate a candidate policy against logged data collected under a
/// (possibly different) behavior policy.
pub fn evaluate(log: &[LoggedStep]) -> EvaluationReport {
    let is_values: Vec<f32> = log
        .iter()
        .map(|step| {
            let ratio = if step.behavior_prob > 1e-6 {
                step.target_prob / step.behavior_prob
            } else {
                0.0
            };
            ratio.min(IS_WEIGHT_CLIP) * step.experience.reward
        })
        .collect();

    let is_weights: Vec<f32> = log
        .iter()
        .map(|step| {
            if step.behavior_prob > 1e-6 {
                (step.target_prob / step.behavior_prob).min(IS_WEIGHT_CLIP)
            } else {
                0.0
            }
        })
        .collect();
    let weight_sum: f32 = is_weights.iter().sum();
    let wis_values: Vec<f32> = if weight_sum > 1e-6 {
        log.iter()
            .zip(&is_weights)
            .map(|(step, &w)| w * step.experience.reward / weight_sum * log.len() as f32)
            .collect()
    } else {
        vec![0.0; log.len()]
    };

    let dm_values: Vec<f32> = log.iter().map(|step| step.v_estimate).collect();

    let dr_values: Vec<f32> = log
        .iter()
        .zip(&is_weights)
        .map(|(step, &w)| {
            step.v_estimate + w * (step.experience.reward - step.q_estimate)
        })
        .collect();

    let importance_sampling = estimate_from(&is_values);
    let weighted_importance_sampling = estimate_from(&wis_values);
    let direct_method = estimate_from(&dm_values);
    let doubly_robust = estimate_from(&dr_values);

    let point_values = [
        importance_sampling.value,
        weighted_importance_sampling.value,
        direct_method.value,
        doubly_robust.value,
    ];
    let consensus = mean(&point_values);
    let spread = std_dev(&point_values, consensus);
    let confidence = if consensus.abs() > 1e-6 {
        (1.0 - spread / consensus.abs()).max(0.5).min(1.0)
    } else {
        0.5
    };

    EvaluationReport {
        importance_sampling,
        weighted_importance_sampling,
        direct_method,
        doubly_robust,
        consensus,
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Action, AttackKind, ExperienceMeta, RLState};

    fn step(reward: f32, behavior_prob: f32, target_prob: f32) -> LoggedStep {
        LoggedStep {
            experience: Experience {
                state: RLState([0.0; 10]),
                action: Action::Allow,
                reward,
                next_state: RLState([0.0; 10]),
                done: false,
                meta: ExperienceMeta {
                    is_malicious: false,
                    attack_kind: AttackKind::Normal,
                    timestamp: 0.0,
                },
            },
            behavior_prob,
            target_prob,
            q_estimate: reward,
            v_estimate: reward,
        }
    }

    #[test]
    fn identical_policies_produce_is_ratio_near_one() {
        let log: Vec<_> = (0..40).map(|_| step(1.0, 0.5, 0.5)).collect();
        let report = evaluate(&log);
        assert!((report.importance_sampling.value - 1.0).abs() < 0.2);
    }

    #[test]
    fn extreme_probability_ratio_is_clipped() {
        let log = vec![step(1.0, 0.01, 0.99)];
        let report = evaluate(&log);
        assert!(report.importance_sampling.value <= IS_WEIGHT_CLIP + 1e-3);
    }

    #[test]
    fn empty_log_does_not_panic() {
        let report = evaluate(&[]);
        assert_eq!(report.consensus, 0.0);
        assert_eq!(report.confidence, 0.5);
    }

    #[test]
    fn confidence_is_floored_at_half() {
        let log = vec![step(0.001, 0.5, 0.5), step(-0.001, 0.9, 0.1)];
        let report = evaluate(&log);
        assert!(report.confidence >= 0.5);
    }

    #[test]
    fn large_sample_uses_gaussian_ci() {
        let log: Vec<_> = (0..50).map(|_| step(2.0, 0.5, 0.5)).collect();
        let report = evaluate(&log);
        assert!(report.direct_method.ci_low <= report.direct_method.value);
        assert!(report.direct_method.ci_high >= report.direct_method.value);
    }
}
