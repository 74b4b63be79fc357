//! Policy rules for Crystal.
//!
//! Operators describe storage automation with short rules such as
//! `TENANT alice WHEN put_bw > 100 DO SET compress TRANSIENT`. This crate
//! compiles that text into a [`CompiledRule`]: the targets it applies to, an
//! optional metric [`Condition`], the filter actions to run and an optional
//! object predicate. Rules with a condition are dynamic and are handed to the
//! monitor runtime in `crystal-engine`; the rest are installed immediately.

mod action;
mod condition;
mod error;
mod parser;
mod rule;

pub use action::{ActionInfo, ActionKind};
pub use condition::{Comparison, Condition};
pub use error::RuleError;
pub use parser::{DslParser, RuleParser};
pub use rule::{CompiledRule, ObjectFilter, RuleTarget, TargetKind};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn stored_condition_text_evaluates_like_the_rule() {
        let (_, rule) = DslParser::new()
            .parse("CONTAINER alice/photos WHEN put_bw > 100 OR get_ops < 2 DO DELETE compress")
            .expect("rule should parse");

        let stored = rule.condition_text().expect("dynamic rule");
        let reparsed = Condition::parse(&stored).expect("stored text parses");

        let sample: HashMap<String, f64> = [("put_bw".to_string(), 120.0)].into_iter().collect();
        assert_eq!(rule.condition.as_ref().map(|c| c.evaluate(&sample)), Some(true));
        assert!(reparsed.evaluate(&sample));
    }
}
