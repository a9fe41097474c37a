//! Debate controller — bounded adversarial rounds with convergence
//! detection.
//!
//! A debate runs two or three *perspective* nodes against each other for a
//! bounded number of rounds, with a *judge* node deciding after each round
//! whether the positions have converged. Two instances exist in the
//! standard topology: the research debate (bull vs bear, research manager
//! judging) and the risk debate (risky/safe/neutral, risk manager judging).
//!
//! # Termination protocol
//!
//! Matching a single hard-coded phrase in the judge output has proven
//! brittle, so convergence is detected by *any* of:
//!
//! - a hit from a configurable consensus lexicon (case-insensitive);
//! - an extracted quality score at or above the threshold, once the
//!   minimum round count is reached;
//! - the round bound (`round_count ≤ max_rounds` holds at termination);
//! - a circuit breaker counting entries into the debate loop, which forces
//!   consensus with whatever judge decision is current. This guarantees
//!   termination independent of any model's behavior.
//!
//! A judge that fails or times out twice consecutively also forces
//! consensus, with the decision `"hold (debate inconclusive)"`.
//!
//! # History accumulation
//!
//! Perspectives of one round run concurrently against the round-start
//! snapshot; each completed argument is appended (newline-separated, in
//! completion order) to the perspective's own history and to the shared
//! history. All history fields are strings from run start — the record
//! round-trips through the state's `Object` field on every transition.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::dispatch::dispatch;
use crate::error::Result;
use crate::node::{NodeRuntime, NodeSpec, NodeStatus, RunBudget, RunRecorder};
use crate::state::{AnalysisState, StatePatch, StateSchema};

/// Default consensus indicator phrases, scanned case-insensitively.
pub const DEFAULT_CONSENSUS_LEXICON: [&str; 6] = [
    "consensus reached",
    "agreement found",
    "both perspectives align",
    "converged on",
    "unanimous",
    "agreed",
];

/// Judge decision used when the judge itself keeps failing.
pub const INCONCLUSIVE_DECISION: &str = "hold (debate inconclusive)";

/// Per-perspective slice of a debate record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveRecord {
    /// This perspective's own argument history (newline-separated).
    #[serde(default)]
    pub history: String,
    /// The most recent argument.
    #[serde(default)]
    pub latest: String,
}

/// Full debate record, stored as one `Object` state field.
///
/// Every string member is initialized to `""` — never null, never a list —
/// so downstream concatenation cannot crash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebateRecord {
    /// Shared transcript across all perspectives, in completion order.
    #[serde(default)]
    pub history: String,
    /// Rounds completed. Never exceeds the configured bound.
    #[serde(default)]
    pub round_count: u32,
    /// Last extracted quality score in `[0, 10]`.
    #[serde(default)]
    pub quality_score: f64,
    /// Whether the debate terminated in (possibly forced) consensus.
    #[serde(default)]
    pub consensus: bool,
    /// The judge's current decision text.
    #[serde(default)]
    pub judge_decision: String,
    /// Per-perspective histories, keyed by perspective node name.
    #[serde(default)]
    pub perspectives: BTreeMap<String, PerspectiveRecord>,
}

impl DebateRecord {
    /// Empty record with a slot for each perspective.
    pub fn for_perspectives<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut record = Self::default();
        for name in names {
            record
                .perspectives
                .insert(name.to_string(), PerspectiveRecord::default());
        }
        record
    }

    /// Read the record back out of a state field; an empty object is the
    /// initial record.
    pub fn load(state: &AnalysisState, field: &str) -> Self {
        state
            .get(field)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    fn append_argument(&mut self, perspective: &str, argument: &str) {
        if argument.is_empty() {
            return;
        }
        let entry = format!("{perspective}: {argument}");
        let slot = self.perspectives.entry(perspective.to_string()).or_default();
        if slot.history.is_empty() {
            slot.history = argument.to_string();
        } else {
            slot.history = format!("{}\n{}", slot.history, argument);
        }
        slot.latest = argument.to_string();
        if self.history.is_empty() {
            self.history = entry;
        } else {
            self.history = format!("{}\n{}", self.history, entry);
        }
    }

    fn to_patch(&self, field: &str) -> StatePatch {
        // Serialization of a plain struct with string/number members cannot
        // fail; fall back to an empty object to keep the field typed.
        let value = serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()));
        StatePatch::new().with(field, value)
    }
}

/// Configuration and participants of one debate.
#[derive(Clone)]
pub struct DebateSpec {
    /// Controller name, used in logs and diagnostics.
    pub name: String,
    /// State field the [`DebateRecord`] round-trips through.
    pub state_field: String,
    /// Perspective nodes. Each must write `<node>_argument`.
    pub perspectives: Vec<NodeSpec>,
    /// Judge node. Must write `<node>_verdict`; may write additional
    /// declared fields (e.g. the research manager writes the investment
    /// plan).
    pub judge: NodeSpec,
    /// Hard bound on rounds.
    pub max_rounds: u32,
    /// Rounds required before a quality score alone can close the debate.
    pub min_rounds: u32,
    /// Quality threshold in `[0, 10]` for score-based consensus.
    pub quality_threshold: f64,
    /// Loop-entry count at which the circuit breaker forces consensus.
    pub circuit_breaker_attempts: u32,
    /// Consensus indicator phrases.
    pub consensus_lexicon: Vec<String>,
}

impl DebateSpec {
    /// State field carrying a perspective's argument for the current round.
    pub fn argument_field(perspective: &NodeSpec) -> String {
        format!("{}_argument", perspective.name)
    }

    /// State field carrying the judge's verdict text.
    pub fn verdict_field(judge: &NodeSpec) -> String {
        format!("{}_verdict", judge.name)
    }
}

/// Runs one debate to termination. See the module docs for the protocol.
pub struct DebateController {
    spec: DebateSpec,
}

impl DebateController {
    /// Controller for `spec`.
    pub fn new(spec: DebateSpec) -> Self {
        Self { spec }
    }

    /// Drive the debate loop, merging all node patches and the evolving
    /// record into `state`. Always terminates; returns the updated state.
    pub async fn run(
        &self,
        runtime: &NodeRuntime,
        schema: &StateSchema,
        mut state: AnalysisState,
        budget: &RunBudget,
        recorder: &RunRecorder,
    ) -> Result<AnalysisState> {
        let spec = &self.spec;
        let mut record = {
            let mut loaded = DebateRecord::load(&state, &spec.state_field);
            for p in &spec.perspectives {
                loaded.perspectives.entry(p.name.clone()).or_default();
            }
            loaded
        };

        let mut loop_entries = 0u32;
        let mut consecutive_judge_failures = 0u32;

        loop {
            loop_entries += 1;
            if loop_entries > spec.circuit_breaker_attempts {
                warn!(debate = %spec.name, loop_entries, "debate circuit breaker tripped");
                record.consensus = true;
                break;
            }
            if budget.exhausted() {
                info!(debate = %spec.name, "wall-clock budget exhausted, finalizing debate");
                record.consensus = true;
                break;
            }
            if record.round_count >= spec.max_rounds {
                record.consensus = true;
                break;
            }

            record.round_count += 1;
            debug!(debate = %spec.name, round = record.round_count, "debate round starting");

            // Round: all perspectives argue concurrently against the
            // round-start snapshot; append order is completion order.
            state = schema.apply_batch(&state, vec![record.to_patch(&spec.state_field)])?;
            let outcomes =
                dispatch(runtime, &spec.perspectives, &state, budget, recorder).await?;
            let mut round_patches = Vec::new();
            for outcome in &outcomes {
                if outcome.status == NodeStatus::Success {
                    if let Some(field) = spec
                        .perspectives
                        .iter()
                        .find(|p| p.name == outcome.node)
                        .map(DebateSpec::argument_field)
                    {
                        if let Some(argument) =
                            outcome.patch.get(&field).and_then(Value::as_str)
                        {
                            record.append_argument(&outcome.node, argument);
                        }
                    }
                }
                round_patches.push(outcome.patch.clone());
            }
            round_patches.push(record.to_patch(&spec.state_field));
            state = schema.apply_batch(&state, round_patches)?;

            // Judge.
            let judge_outcome = runtime.run(&spec.judge, state.clone(), budget, recorder).await?;
            state = schema.apply_batch(&state, vec![judge_outcome.patch.clone()])?;

            if judge_outcome.status.is_failure() {
                consecutive_judge_failures += 1;
                warn!(
                    debate = %spec.name,
                    failures = consecutive_judge_failures,
                    "judge did not produce a verdict"
                );
                if consecutive_judge_failures >= 2 {
                    record.judge_decision = INCONCLUSIVE_DECISION.to_string();
                    record.consensus = true;
                    break;
                }
                continue;
            }
            consecutive_judge_failures = 0;

            let verdict_field = DebateSpec::verdict_field(&spec.judge);
            let verdict = judge_outcome
                .patch
                .get(&verdict_field)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            record.judge_decision = verdict.clone();
            if let Some(quality) = extract_quality(&verdict) {
                record.quality_score = quality;
            }

            if lexicon_hit(&verdict, &spec.consensus_lexicon) {
                info!(debate = %spec.name, round = record.round_count, "consensus lexicon hit");
                record.consensus = true;
                break;
            }
            if record.quality_score >= spec.quality_threshold
                && record.round_count >= spec.min_rounds
            {
                info!(
                    debate = %spec.name,
                    quality = record.quality_score,
                    "quality threshold met, declaring consensus"
                );
                record.consensus = true;
                break;
            }
            if record.round_count >= spec.max_rounds {
                info!(debate = %spec.name, "round bound reached, forcing consensus");
                record.consensus = true;
                break;
            }
        }

        state = schema.apply_batch(&state, vec![record.to_patch(&spec.state_field)])?;
        Ok(state)
    }
}

fn lexicon_hit(text: &str, lexicon: &[String]) -> bool {
    let lowered = text.to_lowercase();
    lexicon
        .iter()
        .any(|phrase| lowered.contains(&phrase.to_lowercase()))
}

/// Pull a quality score out of free-form judge text.
///
/// Accepts the shapes models actually produce: `quality: 8`,
/// `quality score 8.5`, `score: 9/10`, a bare `7/10`. Values are clamped
/// to `[0, 10]`.
pub fn extract_quality(text: &str) -> Option<f64> {
    static PATTERNS: OnceLock<Vec<regex::Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        vec![
            regex::Regex::new(r"(?i)quality(?:\s+score)?\s*[:=]?\s*([0-9]+(?:\.[0-9]+)?)")
                .expect("static regex"),
            regex::Regex::new(r"(?i)score\s*[:=]?\s*([0-9]+(?:\.[0-9]+)?)").expect("static regex"),
            regex::Regex::new(r"\b([0-9]+(?:\.[0-9]+)?)\s*/\s*10\b").expect("static regex"),
        ]
    });
    for pattern in patterns {
        if let Some(caps) = pattern.captures(text) {
            if let Ok(value) = caps[1].parse::<f64>() {
                return Some(value.clamp(0.0, 10.0));
            }
        }
    }
    None
}
