use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::error;

pub const DEFAULT_THRESHOLD: f64 = 0.6;

/// Label substrings treated as disallowed content unless configured otherwise.
pub const DEFAULT_BLOCKED_LABELS: [&str; 9] = [
    "nsfw",
    "porn",
    "pornography",
    "sexual",
    "explicit",
    "racy",
    "sexy",
    "adult",
    "hentai",
];

const UNKNOWN_LABEL: &str = "unknown";
const MAX_SEARCH_DEPTH: usize = 32;

const NO_MODEL_OUTPUT: &str = "No model output";
const NON_CONCLUSIVE: &str = "Model output non-conclusive";
const UNINTERPRETABLE: &str = "Unable to interpret model response";

/// Decision policy applied to whatever (label, score) pair the classifier output yields.
#[derive(Clone, Debug, PartialEq)]
pub struct ModerationPolicy {
    threshold: f64,
    blocked_labels: Vec<String>,
}

impl ModerationPolicy {
    pub fn new<I, S>(threshold: f64, blocked_labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let blocked_labels = blocked_labels
            .into_iter()
            .map(|label| label.as_ref().trim().to_lowercase())
            .filter(|label| !label.is_empty())
            .collect();
        Self {
            threshold,
            blocked_labels,
        }
    }

    /// Case-insensitive substring match against the blocked token set.
    pub fn is_blocked_label(&self, label: &str) -> bool {
        let label = label.to_lowercase();
        self.blocked_labels
            .iter()
            .any(|token| label.contains(token.as_str()))
    }
}

impl Default for ModerationPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_BLOCKED_LABELS)
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ModerationDecision {
    pub allowed: bool,
    pub reason: String,
    pub score: f64,
    pub label: String,
    pub raw: Value,
}

#[derive(Clone, Debug, PartialEq)]
struct Candidate {
    label: String,
    score: f64,
}

impl Candidate {
    fn new(label: impl Into<String>, score: f64) -> Self {
        let score = if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            label: label.into(),
            score,
        }
    }
}

enum Outcome {
    Candidate(Candidate),
    NoSignal(&'static str),
}

type Matcher = fn(&Value, &ModerationPolicy, usize) -> Option<Candidate>;

// Order matters, the first matcher producing a candidate wins.
const MATCHERS: [Matcher; 4] = [
    match_sequence,
    match_direct_fields,
    match_class_map,
    match_nested,
];

/// Turns an arbitrary classifier payload into a moderation decision.
///
/// Never fails: unrecognized shapes and panics raised while inspecting the
/// payload both end up as an allowing decision with an explanatory reason.
#[tracing::instrument(level = "debug", skip_all)]
pub fn interpret(raw: Value, policy: &ModerationPolicy) -> ModerationDecision {
    let outcome = catch_unwind(AssertUnwindSafe(|| evaluate(&raw, policy, 0)))
        .unwrap_or_else(|_| {
            error!("Interpreting the classifier response panicked");
            Outcome::NoSignal(UNINTERPRETABLE)
        });

    match outcome {
        Outcome::Candidate(candidate) => decide(candidate, policy, raw),
        Outcome::NoSignal(reason) => ModerationDecision {
            allowed: true,
            reason: reason.to_string(),
            score: 0.0,
            label: UNKNOWN_LABEL.to_string(),
            raw,
        },
    }
}

fn decide(candidate: Candidate, policy: &ModerationPolicy, raw: Value) -> ModerationDecision {
    let blocked =
        policy.is_blocked_label(&candidate.label) && candidate.score >= policy.threshold;
    let verb = if blocked { "Blocked" } else { "Allowed" };
    ModerationDecision {
        allowed: !blocked,
        reason: format!(
            "{} by label='{}' score={:.2}",
            verb, candidate.label, candidate.score
        ),
        score: candidate.score,
        label: candidate.label,
        raw,
    }
}

fn evaluate(raw: &Value, policy: &ModerationPolicy, depth: usize) -> Outcome {
    match raw {
        Value::Null => Outcome::NoSignal(NO_MODEL_OUTPUT),
        // Text bodies are sometimes JSON encoded twice.
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::String(_)) | Err(_) => Outcome::NoSignal(NO_MODEL_OUTPUT),
            Ok(decoded) => evaluate(&decoded, policy, depth + 1),
        },
        _ => match first_match(raw, policy, depth) {
            Some(candidate) => Outcome::Candidate(candidate),
            None => Outcome::NoSignal(NON_CONCLUSIVE),
        },
    }
}

fn first_match(value: &Value, policy: &ModerationPolicy, depth: usize) -> Option<Candidate> {
    if depth >= MAX_SEARCH_DEPTH {
        return None;
    }
    MATCHERS
        .iter()
        .find_map(|matcher| matcher(value, policy, depth))
}

/// `[{"label": .., "score": ..}, ..]`, the usual image-classification output.
fn match_sequence(value: &Value, policy: &ModerationPolicy, depth: usize) -> Option<Candidate> {
    match value.as_array()?.as_slice() {
        [] => None,
        [single] => first_match(single, policy, depth + 1),
        entries => {
            let records: Vec<Candidate> = entries
                .iter()
                .filter_map(|entry| entry.as_object().and_then(direct_fields))
                .collect();
            // Strongest blocked entry wins whatever order the provider uses.
            highest(records.iter().filter(|record| policy.is_blocked_label(&record.label)))
                .or_else(|| highest(records.iter()))
                .cloned()
        }
    }
}

fn highest<'a>(records: impl Iterator<Item = &'a Candidate>) -> Option<&'a Candidate> {
    records.reduce(|best, record| if record.score > best.score { record } else { best })
}

/// `{"label": "nsfw", "score": 0.97}` or `{"category": .., "probability": ..}`.
fn match_direct_fields(value: &Value, _: &ModerationPolicy, _: usize) -> Option<Candidate> {
    value.as_object().and_then(direct_fields)
}

/// `{"porn": 0.8, "neutral": 0.1}`, picks the class with the highest score.
fn match_class_map(value: &Value, _: &ModerationPolicy, _: usize) -> Option<Candidate> {
    value
        .as_object()?
        .iter()
        .filter_map(|(class, score)| class_score(score).map(|score| (class, score)))
        .reduce(|best, entry| if entry.1 > best.1 { entry } else { best })
        .map(|(class, score)| Candidate::new(class.as_str(), score))
}

/// Deeper payloads: the first nested record or positive score, in document order.
fn match_nested(value: &Value, policy: &ModerationPolicy, depth: usize) -> Option<Candidate> {
    search_nested(value.as_object()?, policy, depth + 1)
}

fn search_nested(
    map: &Map<String, Value>,
    policy: &ModerationPolicy,
    depth: usize,
) -> Option<Candidate> {
    if depth >= MAX_SEARCH_DEPTH {
        return None;
    }
    map.iter().find_map(|(key, value)| match value {
        Value::Number(number) => number
            .as_f64()
            .filter(|score| *score > 0.0)
            .map(|score| Candidate::new(key.as_str(), score)),
        Value::Object(inner) => {
            direct_fields(inner).or_else(|| search_nested(inner, policy, depth + 1))
        }
        Value::Array(_) => match_sequence(value, policy, depth + 1),
        _ => None,
    })
}

fn direct_fields(map: &Map<String, Value>) -> Option<Candidate> {
    let label = ["label", "category"]
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|label| !label.is_empty())?;
    let score = ["score", "probability"]
        .iter()
        .find_map(|key| map.get(*key).and_then(numeric_score))?;
    Some(Candidate::new(label, score))
}

fn numeric_score(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn class_score(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        _ => None,
    }
}
