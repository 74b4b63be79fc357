use crystal_protocol::ObjectSize;
use tracing::debug;

use crate::action::{ActionInfo, ActionKind};
use crate::condition::{Comparison, Condition};
use crate::error::RuleError;
use crate::rule::{CompiledRule, ObjectFilter, RuleTarget, TargetKind};

/// Turns rule text into a [`CompiledRule`].
///
/// The returned flag tells whether the rule is dynamic (has a metric condition).
pub trait RuleParser: Send + Sync + 'static {
    fn parse(&self, text: &str) -> Result<(bool, CompiledRule), RuleError>;
}

/// Parser for the policy language:
///
/// ```text
/// [FOR] TENANT alice, CONTAINER bob/photos
///     [WHEN put_bw > 100 AND get_ops < 5]
///     DO SET filter=compress WITH level=3 ON proxy TRANSIENT, DELETE cache
///     [TO OBJECT_TYPE=DOCS, OBJECT_SIZE > 1024]
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct DslParser;

impl DslParser {
    pub fn new() -> Self {
        Self
    }
}

impl RuleParser for DslParser {
    fn parse(&self, text: &str) -> Result<(bool, CompiledRule), RuleError> {
        let words = tokenize(text);
        let sections = Sections::split(text, &words)?;

        let targets = parse_targets(text, sections.targets)?;
        let condition = match sections.condition {
            Some(words) => Some(parse_condition(text, words)?),
            None => None,
        };
        let actions = parse_actions(text, sections.actions)?;
        let object_filter = match sections.object_filter {
            Some(words) => Some(parse_object_filter(text, words)?),
            None => None,
        };

        let rule = CompiledRule {
            targets,
            condition,
            object_filter,
            actions,
        };
        debug!(
            targets = rule.targets.len(),
            actions = rule.actions.len(),
            dynamic = rule.is_dynamic(),
            "compiled rule"
        );
        Ok((rule.is_dynamic(), rule))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Word {
    Text(String),
    Comma,
}

impl Word {
    fn is(&self, keyword: &str) -> bool {
        matches!(self, Word::Text(text) if text.eq_ignore_ascii_case(keyword))
    }
}

fn tokenize(text: &str) -> Vec<Word> {
    let mut words = Vec::new();
    for chunk in text.split_whitespace() {
        let mut pieces = chunk.split(',').peekable();
        while let Some(piece) = pieces.next() {
            if !piece.is_empty() {
                words.push(Word::Text(piece.to_string()));
            }
            if pieces.peek().is_some() {
                words.push(Word::Comma);
            }
        }
    }
    words
}

struct Sections<'a> {
    targets: &'a [Word],
    condition: Option<&'a [Word]>,
    actions: &'a [Word],
    object_filter: Option<&'a [Word]>,
}

impl<'a> Sections<'a> {
    fn split(rule: &str, words: &'a [Word]) -> Result<Self, RuleError> {
        let start = usize::from(words.first().map_or(false, |word| word.is("FOR")));
        let words = &words[start..];

        let do_at = words
            .iter()
            .position(|word| word.is("DO"))
            .ok_or_else(|| RuleError::malformed(rule, "missing DO clause"))?;
        let (head, tail) = (&words[..do_at], &words[do_at + 1..]);

        let (targets, condition) = match head.iter().position(|word| word.is("WHEN")) {
            Some(when_at) => (&head[..when_at], Some(&head[when_at + 1..])),
            None => (head, None),
        };

        let (actions, object_filter) = match tail.iter().position(|word| word.is("TO")) {
            Some(to_at) => (&tail[..to_at], Some(&tail[to_at + 1..])),
            None => (tail, None),
        };

        Ok(Self {
            targets,
            condition,
            actions,
            object_filter,
        })
    }
}

fn parse_targets(rule: &str, words: &[Word]) -> Result<Vec<RuleTarget>, RuleError> {
    let mut targets = Vec::new();

    for group in words.split(|word| *word == Word::Comma) {
        let texts = texts(rule, group)?;
        let (keyword, expr) = match texts.as_slice() {
            [single] => single
                .split_once(':')
                .ok_or_else(|| RuleError::malformed(rule, format!("target `{}` has no value", single)))?,
            [keyword, expr] => (keyword.as_str(), expr.trim_start_matches(':')),
            [] => return Err(RuleError::malformed(rule, "empty target")),
            _ => {
                return Err(RuleError::malformed(
                    rule,
                    format!("unexpected target `{}`", texts.join(" ")),
                ))
            }
        };

        let kind = TargetKind::parse(keyword)
            .ok_or_else(|| RuleError::malformed(rule, format!("unknown target kind `{}`", keyword)))?;
        if expr.is_empty() {
            return Err(RuleError::malformed(rule, "target value is empty"));
        }
        if kind == TargetKind::Container && !expr.contains('/') {
            return Err(RuleError::malformed(
                rule,
                format!("container target `{}` must look like tenant/container", expr),
            ));
        }

        targets.push(RuleTarget {
            kind,
            expr: expr.to_string(),
        });
    }

    Ok(targets)
}

fn parse_condition(rule: &str, words: &[Word]) -> Result<Condition, RuleError> {
    let text = texts(rule, words)?.join(" ");
    Condition::parse(&text)
}

#[derive(Clone, Copy, PartialEq)]
enum ActionSlot {
    Name,
    Params,
    Server,
    Flags,
}

fn parse_actions(rule: &str, words: &[Word]) -> Result<Vec<ActionInfo>, RuleError> {
    let mut actions: Vec<ActionInfo> = Vec::new();
    let mut params: Vec<String> = Vec::new();
    let mut slot = ActionSlot::Flags;

    for word in words {
        let text = match word {
            Word::Comma if slot == ActionSlot::Params => continue,
            Word::Comma => {
                slot = ActionSlot::Flags;
                continue;
            }
            Word::Text(text) => text,
        };

        if let Some(kind) = action_kind(text) {
            finish_action(rule, &mut actions, &mut params, slot)?;
            actions.push(ActionInfo {
                action: kind,
                ..ActionInfo::set(String::new())
            });
            slot = ActionSlot::Name;
            continue;
        }

        let current = actions
            .last_mut()
            .ok_or_else(|| RuleError::malformed(rule, format!("expected SET or DELETE, found `{}`", text)))?;

        if word.is("WITH") {
            slot = ActionSlot::Params;
        } else if word.is("ON") {
            slot = ActionSlot::Server;
        } else if word.is("TRANSIENT") {
            current.transient = true;
            slot = ActionSlot::Flags;
        } else if word.is("CALLABLE") {
            current.callable = true;
            slot = ActionSlot::Flags;
        } else {
            match slot {
                ActionSlot::Name => {
                    current.filter_name = strip_filter_prefix(text).to_string();
                    slot = ActionSlot::Flags;
                }
                ActionSlot::Params if text.contains('=') => params.push(text.clone()),
                ActionSlot::Server => {
                    current.execution_server = Some(text.to_ascii_lowercase());
                    slot = ActionSlot::Flags;
                }
                _ => {
                    return Err(RuleError::malformed(
                        rule,
                        format!("unexpected `{}` in action", text),
                    ))
                }
            }
        }
    }

    finish_action(rule, &mut actions, &mut params, slot)?;
    if actions.is_empty() {
        return Err(RuleError::malformed(rule, "DO clause has no action"));
    }
    Ok(actions)
}

fn finish_action(
    rule: &str,
    actions: &mut [ActionInfo],
    params: &mut Vec<String>,
    slot: ActionSlot,
) -> Result<(), RuleError> {
    let Some(current) = actions.last_mut() else {
        return Ok(());
    };
    if slot == ActionSlot::Name || current.filter_name.is_empty() {
        return Err(RuleError::malformed(rule, "action is missing a filter name"));
    }
    if slot == ActionSlot::Server {
        return Err(RuleError::malformed(rule, "ON requires an execution server"));
    }
    if !params.is_empty() {
        current.params = Some(params.join(","));
        params.clear();
    }
    Ok(())
}

fn action_kind(text: &str) -> Option<ActionKind> {
    if text.eq_ignore_ascii_case("SET") {
        Some(ActionKind::Set)
    } else if text.eq_ignore_ascii_case("DELETE") {
        Some(ActionKind::Delete)
    } else {
        None
    }
}

fn strip_filter_prefix(text: &str) -> &str {
    match text.split_once('=') {
        Some((key, name)) if key.eq_ignore_ascii_case("filter") => name,
        _ => text,
    }
}

fn parse_object_filter(rule: &str, words: &[Word]) -> Result<ObjectFilter, RuleError> {
    let mut filter = ObjectFilter::default();

    for group in words.split(|word| *word == Word::Comma) {
        let clause = texts(rule, group)?.concat();
        let upper = clause.to_ascii_uppercase();

        if upper.starts_with("OBJECT_TYPE") {
            let name = clause["OBJECT_TYPE".len()..]
                .strip_prefix('=')
                .filter(|name| !name.is_empty())
                .ok_or_else(|| RuleError::malformed(rule, "OBJECT_TYPE expects =<name>"))?;
            filter.object_type = Some(name.to_string());
        } else if let Some(rest) = upper.strip_prefix("OBJECT_SIZE") {
            let split = rest
                .find(|c: char| c.is_ascii_digit())
                .ok_or_else(|| RuleError::malformed(rule, "OBJECT_SIZE expects a size"))?;
            let (operand, raw) = rest.split_at(split);
            let op = Comparison::parse(operand).ok_or_else(|| {
                RuleError::malformed(rule, format!("unknown size operand `{}`", operand))
            })?;
            let value = raw
                .parse()
                .map_err(|_| RuleError::malformed(rule, format!("`{}` is not a size", raw)))?;
            filter.object_size = Some(ObjectSize {
                operand: op.symbol().to_string(),
                value,
            });
        } else {
            return Err(RuleError::malformed(
                rule,
                format!("unknown object filter `{}`", clause),
            ));
        }
    }

    Ok(filter)
}

fn texts(rule: &str, words: &[Word]) -> Result<Vec<String>, RuleError> {
    words
        .iter()
        .map(|word| match word {
            Word::Text(text) => Ok(text.clone()),
            Word::Comma => Err(RuleError::malformed(rule, "unexpected comma")),
        })
        .collect()
}
