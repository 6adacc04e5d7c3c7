//! Answer calculations and the interaction registry
//!
//! A calculation turns the combined answer list of one state into a JSON
//! summary. The registry maps interaction ids to the calculations that run
//! for them.

use crate::config::AnswersConfig;
use crate::error::{Error, Result};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

/// Summary computed over every answer submitted to a state.
pub trait AnswerCalculation: Send + Sync {
    /// Unique identifier (e.g. "AnswerFrequencies")
    fn id(&self) -> &str;

    /// Compute the output for the combined answer list.
    ///
    /// The list may be scanned any number of times; its order carries no
    /// meaning.
    fn compute(&self, answers: &[Value]) -> Result<Value>;
}

// ============================================
// Built-in calculations
// ============================================

/// Answers are stored as submitted; when the player wrapped the value in an
/// object with an `answer` field, that field is what gets counted.
fn answer_value(raw: &Value) -> &Value {
    raw.get("answer").unwrap_or(raw)
}

/// `[{answer, frequency}]`, most frequent first, ties broken by the answer's
/// JSON text.
fn frequency_table<'a>(values: impl Iterator<Item = &'a Value>, limit: Option<usize>) -> Value {
    let mut counts: BTreeMap<String, (&Value, i64)> = BTreeMap::new();
    for value in values {
        counts.entry(value.to_string()).or_insert((value, 0)).1 += 1;
    }

    let mut ranked: Vec<(String, &Value, i64)> = counts
        .into_iter()
        .map(|(text, (value, count))| (text, value, count))
        .collect();
    ranked.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
    if let Some(limit) = limit {
        ranked.truncate(limit);
    }

    Value::Array(
        ranked
            .into_iter()
            .map(|(_, value, count)| json!({ "answer": value, "frequency": count }))
            .collect(),
    )
}

/// Frequency of every distinct answer.
pub struct AnswerFrequencies;

impl AnswerCalculation for AnswerFrequencies {
    fn id(&self) -> &str {
        "AnswerFrequencies"
    }

    fn compute(&self, answers: &[Value]) -> Result<Value> {
        Ok(frequency_table(answers.iter().map(answer_value), None))
    }
}

/// The `n` most frequent answers.
pub struct TopAnswerFrequencies {
    id: String,
    limit: usize,
}

impl TopAnswerFrequencies {
    pub fn new(limit: usize) -> Self {
        Self {
            id: format!("Top{limit}AnswerFrequencies"),
            limit,
        }
    }
}

impl AnswerCalculation for TopAnswerFrequencies {
    fn id(&self) -> &str {
        &self.id
    }

    fn compute(&self, answers: &[Value]) -> Result<Value> {
        Ok(frequency_table(
            answers.iter().map(answer_value),
            Some(self.limit),
        ))
    }
}

/// For set-valued answers: the ten elements that appear most often across
/// all submitted sets.
pub struct FrequencyCommonlySubmittedElements;

impl FrequencyCommonlySubmittedElements {
    const LIMIT: usize = 10;
}

impl AnswerCalculation for FrequencyCommonlySubmittedElements {
    fn id(&self) -> &str {
        "FrequencyCommonlySubmittedElements"
    }

    fn compute(&self, answers: &[Value]) -> Result<Value> {
        let mut elements = Vec::new();
        for raw in answers {
            match answer_value(raw) {
                Value::Array(items) => elements.extend(items.iter()),
                other => {
                    return Err(Error::Calculation {
                        calculation_id: self.id().to_string(),
                        message: format!("expected a list answer, got {}", other),
                    })
                }
            }
        }
        Ok(frequency_table(elements.into_iter(), Some(Self::LIMIT)))
    }
}

// ============================================
// Registry
// ============================================

/// Calculations by id, and the calculations each interaction runs.
#[derive(Default)]
pub struct CalculationRegistry {
    calculations: HashMap<String, Box<dyn AnswerCalculation>>,
    interactions: HashMap<String, Vec<String>>,
}

impl CalculationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_calculation(&mut self, calculation: Box<dyn AnswerCalculation>) {
        tracing::debug!(calculation = calculation.id(), "Registered calculation");
        self.calculations
            .insert(calculation.id().to_string(), calculation);
    }

    /// Set the ordered calculation ids of an interaction.
    pub fn register_interaction(&mut self, interaction_id: &str, calculation_ids: Vec<String>) {
        self.interactions
            .insert(interaction_id.to_string(), calculation_ids);
    }

    pub fn calculation_ids_for_interaction(&self, interaction_id: &str) -> Result<&[String]> {
        self.interactions
            .get(interaction_id)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::Registry(format!("unknown interaction {}", interaction_id)))
    }

    pub fn calculation(&self, calculation_id: &str) -> Result<&dyn AnswerCalculation> {
        self.calculations
            .get(calculation_id)
            .map(|c| c.as_ref())
            .ok_or_else(|| Error::Registry(format!("unknown calculation {}", calculation_id)))
    }

    /// Registered calculation ids, sorted.
    pub fn calculation_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.calculations.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

const DEFAULT_INTERACTIONS: &[(&str, &[&str])] = &[
    ("Continue", &[]),
    ("EndExploration", &[]),
    ("TextInput", &["AnswerFrequencies", "Top10AnswerFrequencies"]),
    ("NumericInput", &["Top10AnswerFrequencies"]),
    ("MultipleChoiceInput", &["AnswerFrequencies"]),
    (
        "ItemSelectionInput",
        &["Top10AnswerFrequencies", "FrequencyCommonlySubmittedElements"],
    ),
    (
        "SetInput",
        &["Top10AnswerFrequencies", "FrequencyCommonlySubmittedElements"],
    ),
    ("CodeRepl", &["Top5AnswerFrequencies"]),
];

/// Registry with the built-in calculations and interactions, minus anything
/// listed in `answers.disabled_calculations`.
pub fn create_default_registry(config: &AnswersConfig) -> CalculationRegistry {
    let enabled = |id: &str| !config.disabled_calculations.iter().any(|d| d == id);

    let mut registry = CalculationRegistry::new();
    let builtins: Vec<Box<dyn AnswerCalculation>> = vec![
        Box::new(AnswerFrequencies),
        Box::new(TopAnswerFrequencies::new(5)),
        Box::new(TopAnswerFrequencies::new(10)),
        Box::new(FrequencyCommonlySubmittedElements),
    ];
    for calculation in builtins {
        if enabled(calculation.id()) {
            registry.register_calculation(calculation);
        } else {
            tracing::info!(calculation = calculation.id(), "Calculation disabled by config");
        }
    }

    for (interaction_id, calculation_ids) in DEFAULT_INTERACTIONS {
        registry.register_interaction(
            interaction_id,
            calculation_ids
                .iter()
                .filter(|id| enabled(**id))
                .map(|id| id.to_string())
                .collect(),
        );
    }

    registry
}
