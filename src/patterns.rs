//! Analysis patterns and stage prompt rendering.
//!
//! A pattern names which stages run and carries one template plus one
//! instruction block per stage. Template wording is configuration; this module
//! only validates patterns and fills placeholders.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Stages
// =============================================================================

/// One round of the pipeline protocol. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Initial,
    Meta,
    Synthesis,
    Reflection,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Initial,
        StageKind::Meta,
        StageKind::Synthesis,
        StageKind::Reflection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Initial => "initial",
            StageKind::Meta => "meta",
            StageKind::Synthesis => "synthesis",
            StageKind::Reflection => "reflection",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PatternError::UnknownStage(s.to_string()))
    }
}

// =============================================================================
// Pattern definitions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("unknown pattern '{0}'")]
    UnknownPattern(String),
    #[error("unknown stage '{0}'")]
    UnknownStage(String),
    #[error("pattern key must be non-empty")]
    EmptyKey,
    #[error("pattern '{0}' is defined more than once")]
    DuplicatePattern(String),
    #[error("pattern '{0}' must start with the initial stage")]
    MissingInitial(String),
    #[error("pattern '{key}' lists stage '{stage}' more than once")]
    DuplicateStage { key: String, stage: StageKind },
    #[error("pattern '{key}' lists stage '{stage}' out of order")]
    OutOfOrder { key: String, stage: StageKind },
    #[error("pattern '{0}' has a reflection stage without synthesis")]
    ReflectionWithoutSynthesis(String),
    #[error("pattern '{key}' has no template for stage '{stage}'")]
    MissingTemplate { key: String, stage: StageKind },
    #[error("pattern '{key}' does not include stage '{stage}'")]
    StageNotInPattern { key: String, stage: StageKind },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternDefinition {
    pub key: String,
    pub stages: Vec<StageKind>,
    #[serde(default)]
    pub templates: BTreeMap<StageKind, String>,
    #[serde(default)]
    pub instructions: BTreeMap<StageKind, String>,
}

impl PatternDefinition {
    pub fn has_stage(&self, stage: StageKind) -> bool {
        self.stages.contains(&stage)
    }

    pub fn validate(&self) -> Result<(), PatternError> {
        if self.key.trim().is_empty() {
            return Err(PatternError::EmptyKey);
        }
        if self.stages.first() != Some(&StageKind::Initial) {
            return Err(PatternError::MissingInitial(self.key.clone()));
        }
        for (idx, stage) in self.stages.iter().enumerate() {
            if self.stages[..idx].contains(stage) {
                return Err(PatternError::DuplicateStage {
                    key: self.key.clone(),
                    stage: *stage,
                });
            }
            if idx > 0 && self.stages[idx - 1] > *stage {
                return Err(PatternError::OutOfOrder {
                    key: self.key.clone(),
                    stage: *stage,
                });
            }
        }
        if self.has_stage(StageKind::Reflection) && !self.has_stage(StageKind::Synthesis) {
            return Err(PatternError::ReflectionWithoutSynthesis(self.key.clone()));
        }
        for stage in self.stages.iter().filter(|s| **s != StageKind::Initial) {
            let present = self
                .templates
                .get(stage)
                .is_some_and(|t| !t.trim().is_empty());
            if !present {
                return Err(PatternError::MissingTemplate {
                    key: self.key.clone(),
                    stage: *stage,
                });
            }
        }
        Ok(())
    }

    /// Stable digest of the pattern's content, for cache fingerprints.
    pub fn content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for stage in &self.stages {
            hasher.update(stage.as_str().as_bytes());
            hasher.update(b"|");
        }
        for (stage, text) in self.templates.iter().chain(self.instructions.iter()) {
            hasher.update(stage.as_str().as_bytes());
            hasher.update(b"=");
            hasher.update(text.as_bytes());
            hasher.update(b"|");
        }
        hasher.finalize().to_hex().to_string()
    }
}

// =============================================================================
// Built-in patterns
// =============================================================================

const META_TEMPLATE: &str = r#"Several assistants answered the same question independently.

<question>
{prompt}
</question>

<responses>
{responses}
</responses>

{instructions}"#;

const META_INSTRUCTIONS: &str = "Critique each response: name factual errors, gaps and strong points. \
Then write an improved answer that keeps everything the responses got right.";

const SYNTHESIS_TEMPLATE: &str = r#"Reviewers have critiqued and improved a set of answers to this question.

<question>
{prompt}
</question>

<reviews>
{responses}
</reviews>

{instructions}"#;

const SYNTHESIS_INSTRUCTIONS: &str = "Combine the reviewed material into one final answer. \
Resolve disagreements explicitly and do not refer to the reviewers.";

const REFLECTION_TEMPLATE: &str = r#"Below is the full record of a multi-round discussion.

<question>
{prompt}
</question>

<transcript>
{transcript}
</transcript>

{instructions}"#;

const REFLECTION_INSTRUCTIONS: &str = "Review the whole discussion. Identify weaknesses that remain \
in the final answer and state concisely what should change, if anything.";

pub const STANDARD_PATTERN: &str = "standard";
pub const REFLECTIVE_PATTERN: &str = "reflective";

pub fn builtin_patterns() -> Vec<PatternDefinition> {
    let mut templates = BTreeMap::new();
    templates.insert(StageKind::Meta, META_TEMPLATE.to_string());
    templates.insert(StageKind::Synthesis, SYNTHESIS_TEMPLATE.to_string());
    let mut instructions = BTreeMap::new();
    instructions.insert(StageKind::Meta, META_INSTRUCTIONS.to_string());
    instructions.insert(StageKind::Synthesis, SYNTHESIS_INSTRUCTIONS.to_string());

    let standard = PatternDefinition {
        key: STANDARD_PATTERN.to_string(),
        stages: vec![StageKind::Initial, StageKind::Meta, StageKind::Synthesis],
        templates: templates.clone(),
        instructions: instructions.clone(),
    };

    templates.insert(StageKind::Reflection, REFLECTION_TEMPLATE.to_string());
    instructions.insert(StageKind::Reflection, REFLECTION_INSTRUCTIONS.to_string());
    let reflective = PatternDefinition {
        key: REFLECTIVE_PATTERN.to_string(),
        stages: StageKind::ALL.to_vec(),
        templates,
        instructions,
    };

    vec![standard, reflective]
}

// =============================================================================
// Template engine
// =============================================================================

/// Borrowed view of one successful response fed into a template.
#[derive(Debug, Clone, Copy)]
pub struct ResponseView<'a> {
    pub model_id: &'a str,
    pub text: &'a str,
}

/// Borrowed view of one completed stage, for `{transcript}`.
#[derive(Debug, Clone)]
pub struct StageView<'a> {
    pub stage: StageKind,
    pub responses: Vec<ResponseView<'a>>,
}

#[derive(Debug, Clone, Default)]
pub struct RenderInput<'a> {
    pub prompt: &'a str,
    pub responses: Vec<ResponseView<'a>>,
    pub transcript: Vec<StageView<'a>>,
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn render_responses(responses: &[ResponseView<'_>]) -> String {
    responses
        .iter()
        .map(|r| {
            format!(
                "<response model=\"{}\">\n{}\n</response>",
                escape_xml_chars(r.model_id),
                escape_xml_chars(r.text.trim())
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_transcript(stages: &[StageView<'_>]) -> String {
    stages
        .iter()
        .map(|s| {
            format!(
                "<stage name=\"{}\">\n{}\n</stage>",
                s.stage,
                render_responses(&s.responses)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Single-pass `{name}` substitution. Unknown placeholders are left as written, and
/// substituted text is never rescanned.
fn fill(template: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if after[..close].chars().all(|c| c.is_ascii_lowercase() || c == '_') => {
                let name = &after[..close];
                match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Owns the validated pattern set and renders stage prompts.
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    patterns: BTreeMap<String, PatternDefinition>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TemplateEngine {
    pub fn new(patterns: Vec<PatternDefinition>) -> Result<Self, PatternError> {
        let mut map = BTreeMap::new();
        for pattern in patterns {
            pattern.validate()?;
            if map.contains_key(&pattern.key) {
                return Err(PatternError::DuplicatePattern(pattern.key));
            }
            map.insert(pattern.key.clone(), pattern);
        }
        Ok(Self { patterns: map })
    }

    pub fn builtin() -> Self {
        let patterns = builtin_patterns()
            .into_iter()
            .map(|p| (p.key.clone(), p))
            .collect();
        Self { patterns }
    }

    pub fn get(&self, key: &str) -> Result<&PatternDefinition, PatternError> {
        self.patterns
            .get(key)
            .ok_or_else(|| PatternError::UnknownPattern(key.to_string()))
    }

    pub fn keys(&self) -> Vec<&str> {
        self.patterns.keys().map(String::as_str).collect()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &PatternDefinition> {
        self.patterns.values()
    }

    /// Render the prompt for `stage` of `pattern`.
    ///
    /// INITIAL falls back to `{prompt}` and receives the raw user prompt; every other
    /// stage gets the prompt and all response text XML-escaped.
    pub fn render(
        &self,
        pattern: &PatternDefinition,
        stage: StageKind,
        input: &RenderInput<'_>,
    ) -> Result<String, PatternError> {
        if !pattern.has_stage(stage) {
            return Err(PatternError::StageNotInPattern {
                key: pattern.key.clone(),
                stage,
            });
        }
        let template = match pattern.templates.get(&stage) {
            Some(t) => t.as_str(),
            None if stage == StageKind::Initial => "{prompt}",
            None => {
                return Err(PatternError::MissingTemplate {
                    key: pattern.key.clone(),
                    stage,
                })
            }
        };
        let instructions = pattern
            .instructions
            .get(&stage)
            .map(String::as_str)
            .unwrap_or("");

        let rendered = fill(template, |name| match name {
            "prompt" if stage == StageKind::Initial => Some(input.prompt.to_string()),
            "prompt" => Some(escape_xml_chars(input.prompt.trim())),
            "responses" => Some(render_responses(&input.responses)),
            "instructions" => Some(instructions.to_string()),
            "transcript" => Some(render_transcript(&input.transcript)),
            _ => None,
        });
        Ok(rendered.trim().to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
