//! Weight thresholds selecting the final action.

use bastion_common::{Action, ChallengeSpec};
use cel_interpreter::Program;

use crate::policy::cel::eval_threshold_expression;

/// A named weight threshold. After rule evaluation ends without a
/// terminal action, thresholds run in declared order; the first whose
/// expression is true selects the final action.
#[derive(Debug)]
pub struct CompiledThreshold {
    pub name: String,
    pub source: String,
    pub program: Program,
    pub action: Action,
    pub challenge: Option<ChallengeSpec>,
    /// Fingerprint bound to cookies issued through this threshold.
    pub hash: String,
}

impl CompiledThreshold {
    pub fn applies(&self, weight: i64) -> bool {
        eval_threshold_expression(&self.program, &self.source, weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::cel::compile_threshold_expression;

    fn threshold(src: &str, action: Action) -> CompiledThreshold {
        CompiledThreshold {
            name: "t".to_string(),
            source: src.to_string(),
            program: compile_threshold_expression(src).unwrap(),
            action,
            challenge: None,
            hash: String::new(),
        }
    }

    #[test]
    fn test_threshold_applies() {
        let t = threshold("weight > 10 && weight <= 20", Action::Challenge);
        assert!(!t.applies(10));
        assert!(t.applies(11));
        assert!(t.applies(20));
        assert!(!t.applies(21));
    }
}
