//! Structured agent adapter
//!
//! Every agent in the crate is a prompt template plus an output schema.
//! `StructuredAgent<T>` renders the template, calls the provider and parses
//! the raw text into `T`, returning a typed error instead of a silent null.

use crate::error::{AgentError, ParseError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// One model call. `agent` names the caller so logs (and test doubles) can
/// tell the agents apart.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub agent: &'static str,
    pub system: String,
    pub user: String,
    pub temperature: f32,
}

/// Provider boundary: prompt in, text out.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> crate::Result<String>;
}

/// Named template variables.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    values: BTreeMap<&'static str, String>,
}

impl PromptInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.values.insert(key, value.to_string());
        self
    }

    /// Replace every `{key}` placeholder. Unknown braces are left alone, so
    /// templates can carry literal JSON examples.
    ///
    /// Single pass over the template: substituted values are never scanned
    /// again, so a value containing `{other_key}` stays literal.
    pub fn render(&self, template: &str) -> String {
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let after = &rest[open + 1..];

            let value = after
                .find('}')
                .and_then(|close| self.values.get(&after[..close]).map(|v| (close, v)));

            match value {
                Some((close, value)) => {
                    rendered.push_str(value);
                    rest = &after[close + 1..];
                }
                None => {
                    rendered.push('{');
                    rest = after;
                }
            }
        }

        rendered.push_str(rest);
        rendered
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    pub const fn new(system: &'static str, user: &'static str) -> Self {
        Self { system, user }
    }

    pub fn render(
        &self,
        agent: &'static str,
        temperature: f32,
        inputs: &PromptInputs,
    ) -> CompletionRequest {
        CompletionRequest {
            agent,
            system: inputs.render(self.system),
            user: inputs.render(self.user),
            temperature,
        }
    }
}

/// Output contract of a structured agent.
pub trait OutputSchema: DeserializeOwned + Send {
    /// Field-level checks serde cannot express (enumerated literals, bounds).
    fn validate(&self) -> Result<(), ParseError> {
        Ok(())
    }
}

pub struct StructuredAgent<T> {
    name: &'static str,
    template: PromptTemplate,
    temperature: f32,
    provider: Arc<dyn LlmProvider>,
    _output: PhantomData<fn() -> T>,
}

impl<T: OutputSchema> StructuredAgent<T> {
    pub fn new(name: &'static str, template: PromptTemplate, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            name,
            template,
            temperature: 0.0,
            provider,
            _output: PhantomData,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub async fn invoke(&self, inputs: &PromptInputs) -> Result<T, AgentError> {
        let request = self.template.render(self.name, self.temperature, inputs);
        let raw = self.provider.complete(&request).await?;

        parse_structured::<T>(&raw).map_err(|e| {
            warn!(agent = self.name, error = %e, "Agent output did not match its schema");
            debug!(agent = self.name, raw = %raw, "Unparseable agent output");
            AgentError::Parse(e)
        })
    }
}

/// Free-text agent used for user-facing replies.
pub struct TextAgent {
    name: &'static str,
    template: PromptTemplate,
    temperature: f32,
    provider: Arc<dyn LlmProvider>,
}

impl TextAgent {
    pub fn new(name: &'static str, template: PromptTemplate, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            name,
            template,
            temperature: 0.4,
            provider,
        }
    }

    pub async fn invoke(&self, inputs: &PromptInputs) -> Result<String, AgentError> {
        let request = self.template.render(self.name, self.temperature, inputs);
        let text = self.provider.complete(&request).await?;
        let text = text.trim();

        if text.is_empty() {
            return Err(AgentError::Parse(ParseError::Empty));
        }
        Ok(text.to_string())
    }
}

/// Parse model text into `T`: strip markdown fences, fall back to the
/// outermost `{...}` span, then run the schema checks.
pub fn parse_structured<T: OutputSchema>(raw: &str) -> Result<T, ParseError> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if cleaned.is_empty() {
        return Err(ParseError::Empty);
    }

    let parsed: T = match serde_json::from_str(cleaned) {
        Ok(value) => value,
        Err(first_error) => {
            let span = match (cleaned.find('{'), cleaned.rfind('}')) {
                (Some(start), Some(end)) if end > start => &cleaned[start..=end],
                _ => return Err(ParseError::InvalidJson(first_error.to_string())),
            };
            serde_json::from_str(span).map_err(|e| ParseError::InvalidJson(e.to_string()))?
        }
    };

    parsed.validate()?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLlm;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Verdict {
        valid: bool,
        #[serde(default)]
        reasoning: String,
    }

    impl OutputSchema for Verdict {
        fn validate(&self) -> Result<(), ParseError> {
            if !self.valid && self.reasoning.trim().is_empty() {
                return Err(ParseError::Schema {
                    field: "reasoning",
                    reason: "required when valid is false".into(),
                });
            }
            Ok(())
        }
    }

    const TEMPLATE: PromptTemplate =
        PromptTemplate::new("Check {subject}. Reply as {\"valid\": bool}", "Data: {data}");

    #[test]
    fn test_render_leaves_literal_braces() {
        let inputs = PromptInputs::new().with("subject", "totals").with("data", 42);
        let request = TEMPLATE.render("validator", 0.0, &inputs);

        assert_eq!(request.system, "Check totals. Reply as {\"valid\": bool}");
        assert_eq!(request.user, "Data: 42");
    }

    #[test]
    fn test_render_does_not_expand_substituted_values() {
        let inputs = PromptInputs::new()
            .with("data", r#"[{"note": "{problems}"}]"#)
            .with("problems", "none");

        assert_eq!(
            inputs.render("Data: {data}\nProblems: {problems}"),
            "Data: [{\"note\": \"{problems}\"}]\nProblems: none"
        );
        assert_eq!(inputs.render("{ {data} }"), r#"{ [{"note": "{problems}"}] }"#);
        assert_eq!(inputs.render("open { only"), "open { only");
    }

    #[test]
    fn test_parse_strips_fences() {
        let parsed: Verdict = parse_structured("```json\n{\"valid\": true}\n```").unwrap();
        assert!(parsed.valid);
    }

    #[test]
    fn test_parse_extracts_embedded_object() {
        let parsed: Verdict =
            parse_structured("Sure! {\"valid\": false, \"reasoning\": \"missing 150\"} Done.")
                .unwrap();
        assert_eq!(parsed.reasoning, "missing 150");
    }

    #[test]
    fn test_parse_reports_schema_violation() {
        let err = parse_structured::<Verdict>("{\"valid\": false}").unwrap_err();
        assert!(matches!(err, ParseError::Schema { field: "reasoning", .. }));

        assert_eq!(parse_structured::<Verdict>("   ").unwrap_err(), ParseError::Empty);
        assert!(matches!(
            parse_structured::<Verdict>("not json").unwrap_err(),
            ParseError::InvalidJson(_)
        ));
    }

    #[tokio::test]
    async fn test_invoke_separates_transport_and_parse_failures() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .respond("good", |_| Ok("{\"valid\": true}".into()))
                .respond("garbled", |_| Ok("I think it is fine".into())),
        );

        let inputs = PromptInputs::new().with("subject", "x").with("data", "y");

        let good: StructuredAgent<Verdict> = StructuredAgent::new("good", TEMPLATE, llm.clone());
        assert!(good.invoke(&inputs).await.unwrap().valid);

        let garbled: StructuredAgent<Verdict> =
            StructuredAgent::new("garbled", TEMPLATE, llm.clone());
        assert!(garbled.invoke(&inputs).await.unwrap_err().is_parse());

        let unscripted: StructuredAgent<Verdict> = StructuredAgent::new("missing", TEMPLATE, llm);
        assert!(!unscripted.invoke(&inputs).await.unwrap_err().is_parse());
    }
}
