//! C5: threat-level mapper.
//!
//! Pure function from classifier output to a discrete `ThreatLevel`,
//! thresholds lifted directly from the original's `THREAT_SCORE_*`
//! constants. Monotone in `p_malicious`: raising the probability while
//! holding confidence fixed never lowers the assigned level.

use crate::{ClassifierOutput, ThreatLevel};

/// Minimum confidence required to trust a `p_malicious` reading at all;
/// below this the output is downgraded to `Low` regardless of score,
/// matching the original's treatment of low-confidence model output as
/// unreliable rather than as evidence of an attack.
const MIN_TRUSTED_CONFIDENCE: f32 = 0.3;

const SCORE_CRITICAL: f32 = 0.9;
const SCORE_HIGH: f32 = 0.8;
const SCORE_MEDIUM: f32 = 0.7;
const SCORE_LOW: f32 = 0.6;

/// Map classifier output to a threat level.
pub fn classify(output: &ClassifierOutput) -> ThreatLevel {
    if output.confidence < MIN_TRUSTED_CONFIDENCE {
        return if output.p_malicious >= SCORE_LOW {
            ThreatLevel::Low
        } else {
            ThreatLevel::Safe
        };
    }

    if output.p_malicious >= SCORE_CRITICAL {
        ThreatLevel::Critical
    } else if output.p_malicious >= SCORE_HIGH {
        ThreatLevel::High
    } else if output.p_malicious >= SCORE_MEDIUM {
        ThreatLevel::Medium
    } else if output.p_malicious >= SCORE_LOW {
        ThreatLevel::Low
    } else {
        ThreatLevel::Safe
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AttackKind;

    fn output(p: f32, c: f32) -> ClassifierOutput {
        ClassifierOutput::new(p, c, AttackKind::Ddos)
    }

    #[test]
    fn boundaries_map_to_expected_levels() {
        assert_eq!(classify(&output(0.95, 0.8)), ThreatLevel::Critical);
        assert_eq!(classify(&output(0.85, 0.8)), ThreatLevel::High);
        assert_eq!(classify(&output(0.75, 0.8)), ThreatLevel::Medium);
        assert_eq!(classify(&output(0.65, 0.8)), ThreatLevel::Low);
        assert_eq!(classify(&output(0.1, 0.8)), ThreatLevel::Safe);
    }

    #[test]
    fn low_confidence_never_escalates_past_low() {
        assert_eq!(classify(&output(0.99, 0.1)), ThreatLevel::Low);
        assert_eq!(classify(&output(0.2, 0.1)), ThreatLevel::Safe);
    }

    #[test]
    fn monotone_in_probability_at_fixed_confidence() {
        let mut prev = ThreatLevel::Safe;
        for p in [0.0, 0.61, 0.71, 0.81, 0.91] {
            let level = classify(&output(p, 0.9));
            assert!(level >= prev);
            prev = level;
        }
    }
}
