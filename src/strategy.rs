//! Generation strategies and prompt construction.
//!
//! Each strategy owns a fixed prompt template, rendered with handlebars
//! against bindings taken from the input record and the user prompts.
//! This module also owns output post-processing: model text is cleaned
//! (chain-of-thought sentinel, code fences, whitespace) before anything
//! downstream sees it, and `classify_label` output is snapped to the
//! configured label set.

use clap::ValueEnum;
use handlebars::Handlebars;
use regex::Regex;

use crate::{error::DistillError, params::DistillParams, prelude::*};

/// The semantic strategies we can run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize,
)]
#[clap(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Derive new records from the selected fields of each input.
    Expand,
    /// Rewrite the target field in place.
    Enhance,
    /// Paraphrase the target field.
    Paraphrase,
    /// Assign one label from a fixed set.
    ClassifyLabel,
    /// Answer the question field.
    QToA,
    /// Freeform, driven by user templates.
    Custom,
}

impl StrategyKind {
    /// Does `generation_count` apply to this strategy?
    pub fn supports_count(self) -> bool {
        match self {
            StrategyKind::Expand
            | StrategyKind::Paraphrase
            | StrategyKind::QToA
            | StrategyKind::Custom => true,
            StrategyKind::Enhance | StrategyKind::ClassifyLabel => false,
        }
    }

    /// Check the strategy-specific required parameters.
    pub fn validate_params(self, params: &DistillParams) -> Result<()> {
        match self {
            StrategyKind::ClassifyLabel if params.label_set.is_empty() => {
                Err(DistillError::config(
                    "classify_label requires a non-empty label set (--labels)",
                )
                .into())
            }
            StrategyKind::Custom if params.a_prompt.is_none() => {
                Err(DistillError::config(
                    "custom strategy requires an answer template (--a-prompt)",
                )
                .into())
            }
            _ => Ok(()),
        }
    }

    /// Stable name, matching the CLI and serialized forms.
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Expand => "expand",
            StrategyKind::Enhance => "enhance",
            StrategyKind::Paraphrase => "paraphrase",
            StrategyKind::ClassifyLabel => "classify_label",
            StrategyKind::QToA => "q_to_a",
            StrategyKind::Custom => "custom",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const EXPAND_TEMPLATE: &str = "\
Below is a sample record from a training dataset:

{{{sample}}}

Write the content of one new, distinct record in the same style and \
domain, drawing on the fields: {{{fields}}}. Respond with the new \
content only, no commentary.";

const ENHANCE_TEMPLATE: &str = "\
Improve the following text. Keep its meaning and intent, fix any \
grammatical issues, and make it clearer and more complete.

{{{text}}}

Respond with the improved text only.";

const PARAPHRASE_TEMPLATE: &str = "\
Rewrite the following text so that the wording differs but the meaning \
is preserved.

{{{text}}}

Respond with the rewritten text only.";

const CLASSIFY_TEMPLATE: &str = "\
Classify the following text into exactly one of these labels: {{{labels}}}.

Text:
{{{text}}}

Respond with the label only.";

const Q_TO_A_TEMPLATE: &str = "\
{{#if q_prompt}}{{{q_prompt}}}

{{/if}}Question:
{{{question}}}

{{#if a_prompt}}{{{a_prompt}}}

{{/if}}Answer:";

/// A prompt ready to send to the model.
#[derive(Debug, Clone)]
pub struct RenderedPrompt {
    pub prompt: String,
    pub system_prompt: Option<String>,

    /// The question associated with this generation, recorded on the
    /// output for `q_to_a` and `custom`.
    pub question: Option<String>,
}

/// Builds prompts for one run and post-processes model output.
pub struct PromptBuilder {
    strategy: StrategyKind,
    target_field: String,
    q_field_name: String,
    selected_fields: Vec<String>,
    label_set: Vec<String>,
    system_prompt: Option<String>,
    q_prompt: Option<String>,
    a_prompt: Option<String>,
    handlebars: Handlebars<'static>,
    think_block: Regex,
}

impl PromptBuilder {
    /// Create a builder for `params`. Fails with a configuration error
    /// if the strategy's required parameters are missing.
    pub fn new(params: &DistillParams) -> Result<Self> {
        params.strategy.validate_params(params)?;
        let think_block = Regex::new(r"(?s)\A\s*<think>.*?</think>")
            .context("invalid think-block pattern")?;
        Ok(Self {
            strategy: params.strategy,
            target_field: params.target_field.clone(),
            q_field_name: params.q_field_name.clone(),
            selected_fields: params.selected_fields.clone(),
            label_set: params.label_set.clone(),
            system_prompt: params.system_prompt.clone(),
            q_prompt: params.q_prompt.clone(),
            a_prompt: params.a_prompt.clone(),
            handlebars: Handlebars::new(),
            think_block,
        })
    }

    /// Render the prompt for one record.
    ///
    /// Errors here are record-level (a missing field, an unrenderable
    /// template) and are reported as job failures, not task failures.
    pub fn build(&self, record: &JsonObject) -> Result<RenderedPrompt> {
        let rendered = match self.strategy {
            StrategyKind::Expand => {
                let sample = self.sample_of(record)?;
                let fields = self.field_names(record).join(", ");
                let prompt = self.render(
                    EXPAND_TEMPLATE,
                    &json!({ "sample": sample, "fields": fields }),
                )?;
                RenderedPrompt {
                    prompt,
                    system_prompt: self.system_prompt.clone(),
                    question: None,
                }
            }
            StrategyKind::Enhance | StrategyKind::Paraphrase => {
                let text = self.field_text(record, &self.target_field)?;
                let template = if self.strategy == StrategyKind::Enhance {
                    ENHANCE_TEMPLATE
                } else {
                    PARAPHRASE_TEMPLATE
                };
                let prompt = self.render(template, &json!({ "text": text }))?;
                RenderedPrompt {
                    prompt,
                    system_prompt: self.system_prompt.clone(),
                    question: None,
                }
            }
            StrategyKind::ClassifyLabel => {
                let text = self.field_text(record, &self.target_field)?;
                let labels = self.label_set.join(", ");
                let prompt = self.render(
                    CLASSIFY_TEMPLATE,
                    &json!({ "text": text, "labels": labels }),
                )?;
                RenderedPrompt {
                    prompt,
                    system_prompt: self.system_prompt.clone(),
                    question: None,
                }
            }
            StrategyKind::QToA => {
                let question = self.field_text(record, &self.q_field_name)?;
                let prompt = self.render(
                    Q_TO_A_TEMPLATE,
                    &json!({
                        "question": question,
                        "q_prompt": self.q_prompt,
                        "a_prompt": self.a_prompt,
                    }),
                )?;
                RenderedPrompt {
                    prompt,
                    system_prompt: self.system_prompt.clone(),
                    question: Some(question),
                }
            }
            StrategyKind::Custom => {
                // User templates render against the record's own fields.
                let bindings = Value::Object(record.clone());
                let question = match &self.q_prompt {
                    Some(template) => Some(self.render(template, &bindings)?),
                    None => None,
                };
                let a_template = self
                    .a_prompt
                    .as_deref()
                    .expect("custom strategy validated to have a_prompt");
                let mut prompt = self.render(a_template, &bindings)?;
                if let Some(question) = &question {
                    prompt = format!("{question}\n\n{prompt}");
                }
                RenderedPrompt {
                    prompt,
                    system_prompt: self.system_prompt.clone(),
                    question,
                }
            }
        };
        Ok(rendered)
    }

    /// Clean raw model text and apply strategy-specific validation.
    ///
    /// `Err` means the output failed quality validation; the job counts
    /// as a failure and no line is emitted.
    pub fn finalize(&self, raw: &str) -> Result<String, String> {
        let text = self.clean(raw);
        match self.strategy {
            StrategyKind::ClassifyLabel => {
                match snap_label(&text, &self.label_set) {
                    Some(label) => Ok(label),
                    None => Err(format!(
                        "label {text:?} is not in the configured label set"
                    )),
                }
            }
            _ if text.is_empty() => Err("model returned empty output".to_string()),
            _ => Ok(text),
        }
    }

    /// The strategy this builder renders for.
    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    /// The question field name, for placing `question` on outputs.
    pub fn q_field_name(&self) -> &str {
        &self.q_field_name
    }

    /// The target field name.
    pub fn target_field(&self) -> &str {
        &self.target_field
    }

    /// Strip a leading `<think>…</think>` block, then code fences, then
    /// surrounding whitespace.
    fn clean(&self, raw: &str) -> String {
        let without_think = self.think_block.replace(raw, "");
        strip_code_fences(without_think.trim()).trim().to_string()
    }

    fn render(&self, template: &str, bindings: &Value) -> Result<String> {
        self.handlebars
            .render_template(template, bindings)
            .context("failed to render prompt template")
    }

    /// The fields participating in generation for this record.
    fn field_names(&self, record: &JsonObject) -> Vec<String> {
        if self.selected_fields.is_empty() {
            record.keys().cloned().collect()
        } else {
            self.selected_fields.clone()
        }
    }

    /// A pretty-printed JSON object of the participating fields.
    fn sample_of(&self, record: &JsonObject) -> Result<String> {
        let mut sample = JsonObject::new();
        for name in self.field_names(record) {
            if let Some(value) = record.get(&name) {
                sample.insert(name, value.clone());
            }
        }
        if sample.is_empty() {
            return Err(anyhow!("record has none of the selected fields"));
        }
        serde_json::to_string_pretty(&Value::Object(sample))
            .context("failed to serialize sample record")
    }

    /// A record field rendered as text. Strings pass through; other
    /// values are serialized.
    fn field_text(&self, record: &JsonObject, field: &str) -> Result<String> {
        match record.get(field) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(value) => {
                serde_json::to_string(value).context("failed to serialize field")
            }
            None => Err(anyhow!("record is missing field {field:?}")),
        }
    }
}

/// Strip a surrounding markdown code fence, if present.
fn strip_code_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string ("```json") on the opening line.
    let Some(newline) = rest.find('\n') else {
        return text;
    };
    let body = rest[newline + 1..].trim_end();
    match body.strip_suffix("```") {
        Some(inner) => inner,
        None => text,
    }
}

/// Snap model output to the nearest label by case-insensitive exact
/// match. Returns the label as configured, not as the model spelled it.
pub fn snap_label(output: &str, labels: &[String]) -> Option<String> {
    let wanted = output.trim().to_lowercase();
    labels
        .iter()
        .find(|label| label.to_lowercase() == wanted)
        .cloned()
}
