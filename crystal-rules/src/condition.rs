use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RuleError;

/// Comparison operator between a metric value and a threshold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    Equals,
    NotEquals,
}

impl Comparison {
    pub fn parse(symbol: &str) -> Option<Self> {
        match symbol {
            "<" => Some(Comparison::LessThan),
            "<=" => Some(Comparison::LessOrEqual),
            ">" => Some(Comparison::GreaterThan),
            ">=" => Some(Comparison::GreaterOrEqual),
            "==" | "=" => Some(Comparison::Equals),
            "!=" => Some(Comparison::NotEquals),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::LessThan => "<",
            Comparison::LessOrEqual => "<=",
            Comparison::GreaterThan => ">",
            Comparison::GreaterOrEqual => ">=",
            Comparison::Equals => "==",
            Comparison::NotEquals => "!=",
        }
    }

    pub fn apply(&self, actual: f64, threshold: f64) -> bool {
        match self {
            Comparison::LessThan => actual < threshold,
            Comparison::LessOrEqual => actual <= threshold,
            Comparison::GreaterThan => actual > threshold,
            Comparison::GreaterOrEqual => actual >= threshold,
            Comparison::Equals => (actual - threshold).abs() < f64::EPSILON,
            Comparison::NotEquals => (actual - threshold).abs() >= f64::EPSILON,
        }
    }
}

/// Metric condition of a dynamic rule (the `WHEN` clause).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Compare the latest value of `metric` against `value`.
    Compare {
        metric: String,
        op: Comparison,
        value: f64,
    },
    /// All nested conditions must hold.
    All { conditions: Vec<Condition> },
    /// Any of the nested conditions must hold.
    Any { conditions: Vec<Condition> },
}

impl Condition {
    pub fn compare(metric: impl Into<String>, op: Comparison, value: f64) -> Self {
        Condition::Compare {
            metric: metric.into(),
            op,
            value,
        }
    }

    /// Parses condition text such as `put_bw > 100 AND get_ops<5 OR slowdown >= 2`.
    ///
    /// `AND` binds tighter than `OR`; keywords are case-insensitive.
    pub fn parse(text: &str) -> Result<Self, RuleError> {
        let tokens = lex(text)?;
        if tokens.is_empty() {
            return Err(RuleError::invalid_condition(text, "empty condition"));
        }

        let mut alternatives = Vec::new();
        for group in split_keyword(&tokens, "OR") {
            let mut clauses = Vec::new();
            for clause in split_keyword(group, "AND") {
                clauses.push(parse_comparison(text, clause)?);
            }
            alternatives.push(collapse(clauses, |conditions| Condition::All { conditions }));
        }

        Ok(collapse(alternatives, |conditions| Condition::Any { conditions }))
    }

    /// Metric names referenced anywhere in the condition.
    pub fn metrics(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        self.collect_metrics(&mut names);
        names
    }

    fn collect_metrics<'a>(&'a self, names: &mut BTreeSet<&'a str>) {
        match self {
            Condition::Compare { metric, .. } => {
                names.insert(metric.as_str());
            }
            Condition::All { conditions } | Condition::Any { conditions } => {
                for condition in conditions {
                    condition.collect_metrics(names);
                }
            }
        }
    }

    pub fn references(&self, metric: &str) -> bool {
        self.metrics().contains(metric)
    }

    /// Evaluates against the latest known metric values. Unknown metrics never match.
    pub fn evaluate(&self, values: &HashMap<String, f64>) -> bool {
        match self {
            Condition::Compare { metric, op, value } => values
                .get(metric)
                .map(|actual| op.apply(*actual, *value))
                .unwrap_or(false),
            Condition::All { conditions } => conditions.iter().all(|c| c.evaluate(values)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.evaluate(values)),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Compare { metric, op, value } => {
                write!(f, "{} {} {}", metric, op.symbol(), value)
            }
            Condition::All { conditions } => write_joined(f, conditions, " AND "),
            Condition::Any { conditions } => write_joined(f, conditions, " OR "),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, conditions: &[Condition], separator: &str) -> fmt::Result {
    for (index, condition) in conditions.iter().enumerate() {
        if index > 0 {
            f.write_str(separator)?;
        }
        write!(f, "{}", condition)?;
    }
    Ok(())
}

fn collapse(mut items: Vec<Condition>, wrap: impl FnOnce(Vec<Condition>) -> Condition) -> Condition {
    if items.len() == 1 {
        items.remove(0)
    } else {
        wrap(items)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Operator(String),
}

fn lex(text: &str) -> Result<Vec<Token>, RuleError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
        } else if matches!(ch, '<' | '>' | '=' | '!') {
            let mut symbol = String::new();
            while let Some(&next) = chars.peek() {
                if !matches!(next, '<' | '>' | '=' | '!') {
                    break;
                }
                symbol.push(next);
                chars.next();
            }
            tokens.push(Token::Operator(symbol));
        } else if ch.is_alphanumeric() || matches!(ch, '_' | '.' | '-' | '+') {
            let mut word = String::new();
            while let Some(&next) = chars.peek() {
                if !(next.is_alphanumeric() || matches!(next, '_' | '.' | '-' | '+')) {
                    break;
                }
                word.push(next);
                chars.next();
            }
            tokens.push(Token::Word(word));
        } else {
            return Err(RuleError::invalid_condition(
                text,
                format!("unexpected character `{}`", ch),
            ));
        }
    }

    Ok(tokens)
}

fn is_keyword(token: &Token, keyword: &str) -> bool {
    matches!(token, Token::Word(word) if word.eq_ignore_ascii_case(keyword))
}

fn split_keyword<'a>(tokens: &'a [Token], keyword: &str) -> Vec<&'a [Token]> {
    tokens.split(|token| is_keyword(token, keyword)).collect()
}

fn parse_comparison(text: &str, tokens: &[Token]) -> Result<Condition, RuleError> {
    match tokens {
        [Token::Word(metric), Token::Operator(symbol), Token::Word(raw)] => {
            let op = Comparison::parse(symbol).ok_or_else(|| {
                RuleError::invalid_condition(text, format!("unknown operator `{}`", symbol))
            })?;
            let value: f64 = raw.parse().map_err(|_| {
                RuleError::invalid_condition(text, format!("`{}` is not a number", raw))
            })?;
            Ok(Condition::compare(metric.clone(), op, value))
        }
        [] => Err(RuleError::invalid_condition(text, "dangling connective")),
        _ => Err(RuleError::invalid_condition(
            text,
            "expected `<metric> <operator> <number>`",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn values(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test_case("put_bw > 100", 150.0, true; "greater than holds")]
    #[test_case("put_bw > 100", 100.0, false; "greater than is strict")]
    #[test_case("put_bw>=100", 100.0, true; "compact greater or equal")]
    #[test_case("put_bw < 10.5", 3.0, true; "fractional threshold")]
    #[test_case("put_bw != 4", 4.0, false; "not equals")]
    fn single_comparison(text: &str, observed: f64, expected: bool) {
        let condition = Condition::parse(text).expect("valid condition");
        assert_eq!(condition.evaluate(&values(&[("put_bw", observed)])), expected);
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let condition = Condition::parse("a > 1 AND b > 1 or c > 1").expect("valid condition");
        assert!(matches!(&condition, Condition::Any { conditions } if conditions.len() == 2));
        assert!(condition.evaluate(&values(&[("c", 2.0)])));
        assert!(!condition.evaluate(&values(&[("a", 2.0)])));
        assert!(condition.evaluate(&values(&[("a", 2.0), ("b", 2.0)])));
    }

    #[test]
    fn unknown_metric_never_matches() {
        let condition = Condition::parse("get_ops < 5").expect("valid condition");
        assert!(!condition.evaluate(&HashMap::new()));
    }

    #[test]
    fn display_round_trips_through_parse() {
        let condition = Condition::parse("put_bw > 100 AND get_ops<=3").expect("valid condition");
        assert_eq!(condition.to_string(), "put_bw > 100 AND get_ops <= 3");
        assert_eq!(Condition::parse(&condition.to_string()), Ok(condition));
    }

    #[test_case("put_bw >"; "missing threshold")]
    #[test_case("put_bw > fast"; "non numeric threshold")]
    #[test_case("put_bw => 3"; "unknown operator")]
    #[test_case("put_bw > 3 AND"; "dangling and")]
    #[test_case(""; "empty")]
    fn rejects_invalid_text(text: &str) {
        assert!(matches!(
            Condition::parse(text),
            Err(RuleError::InvalidCondition { .. })
        ));
    }

    #[test]
    fn lists_referenced_metrics() {
        let condition = Condition::parse("b > 1 OR a < 2 AND b < 9").expect("valid condition");
        assert_eq!(condition.metrics().into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(condition.references("a"));
        assert!(!condition.references("c"));
    }
}
