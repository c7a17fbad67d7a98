//! Prometheus metrics.
//!
//! Registered once against the default registry and exported as text on
//! the dedicated metrics listener.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec, TextEncoder,
};

/// One increment per policy decision, labeled by rule name and action.
pub static POLICY_RESULTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "anubis_policy_results",
        "The results of each policy rule",
        &["rule", "action"]
    )
    .expect("anubis_policy_results registration")
});

/// Client-reported solve time on successful challenge completions.
pub static CHALLENGE_TIME_TAKEN: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "anubis_challenge_time_taken",
        "Seconds clients spent solving challenges",
        &["algorithm"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .expect("anubis_challenge_time_taken registration")
});

/// Submissions with a wrong proof.
pub static FAILED_VALIDATIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "anubis_failed_validations",
        "Challenge submissions with a wrong proof"
    )
    .expect("anubis_failed_validations registration")
});

/// Render every registered metric in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        POLICY_RESULTS.with_label_values(&["test-rule", "DENY"]).inc();
        CHALLENGE_TIME_TAKEN
            .with_label_values(&["fast"])
            .observe(0.42);
        FAILED_VALIDATIONS.inc();

        let text = render();
        assert!(text.contains("anubis_policy_results"));
        assert!(text.contains("anubis_challenge_time_taken"));
        assert!(text.contains("anubis_failed_validations"));
    }
}
