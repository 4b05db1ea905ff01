// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Natural-language to command-plan translation through an OpenAI-compatible
//! chat-completions endpoint.
//!
//! The model is given the plan JSON schema as the parameters of a single
//! function it is forced to call, so the reply is always a structured
//! [`Plan`] rather than prose.

use anyhow::{bail, Context, Result};
use plan::{plan_parameters_schema, Plan, PLAN_FN_NAME, PLAN_VERSION};
use serde_json::{json, Value};
use tracing::debug;

mod prompts;

use prompts::{few_shots, SYSTEM_PROMPT};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4.1-mini";

/// Connection settings, resolved once at startup. After construction the
/// translator never reads the process environment again.
#[derive(Clone, Debug)]
pub struct TranslatorConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl TranslatorConfig {
    /// Builds a config from `OPENAI_API_KEY`, `OPENAI_BASE_URL` and
    /// `SANDSHELL_OPENAI_MODEL`. Returns None when no API key is set, in
    /// which case the shell runs without natural-language support.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty())?;
        Some(Self {
            api_key,
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            model: std::env::var("SANDSHELL_OPENAI_MODEL")
                .unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
        })
    }
}

pub struct Translator {
    config: TranslatorConfig,
    client: reqwest::blocking::Client,
    /// Notes about past executions, appended to the next request so the
    /// model can refer back to what actually happened.
    execution_context: Vec<String>,
}

impl Translator {
    pub fn new(config: TranslatorConfig) -> Self {
        Self {
            config,
            client: reqwest::blocking::Client::new(),
            execution_context: Vec::new(),
        }
    }

    /// Records the outcome of an executed (or rejected) plan for future
    /// requests.
    pub fn add_execution_context(&mut self, note: impl Into<String>) {
        self.execution_context.push(note.into());
    }

    /// Translates a natural-language request into a validated [`Plan`].
    pub fn to_plan(&self, nl_request: &str) -> Result<Plan> {
        let body = self.request_body(nl_request);
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        debug!("requesting plan from {url}");

        let response: Value = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .context("Failed to reach the translation endpoint")?
            .error_for_status()
            .context("Translation endpoint returned an error")?
            .json()
            .context("Translation endpoint returned malformed JSON")?;

        let plan = extract_plan(&response)?;
        plan.validate()
            .with_context(|| format!("Model produced an invalid v{PLAN_VERSION} plan"))?;
        Ok(plan)
    }

    fn request_body(&self, nl_request: &str) -> Value {
        let mut messages = vec![json!({ "role": "system", "content": SYSTEM_PROMPT })];
        messages.extend(few_shots());
        messages.push(json!({
            "role": "user",
            "content": self.format_user(nl_request),
        }));

        json!({
            "model": self.config.model,
            "messages": messages,
            "tools": [{
                "type": "function",
                "function": {
                    "name": PLAN_FN_NAME,
                    "description":
                        format!("Emit plan JSON v{PLAN_VERSION}. Must adhere to schema."),
                    "parameters": plan_parameters_schema(),
                    "strict": true,
                },
            }],
            "tool_choice": {
                "type": "function",
                "function": { "name": PLAN_FN_NAME },
            },
            "temperature": 0,
        })
    }

    fn format_user(&self, nl_request: &str) -> String {
        if self.execution_context.is_empty() {
            return nl_request.to_string();
        }
        format!(
            "{}\n\n[context]\n{}",
            nl_request,
            self.execution_context.join("\n")
        )
    }
}

/// Finds the forced tool call in a chat-completions response and parses its
/// arguments into a [`Plan`].
fn extract_plan(response: &Value) -> Result<Plan> {
    let choices = response
        .get("choices")
        .and_then(Value::as_array)
        .context("Response carries no choices")?;

    for choice in choices {
        let tool_calls = choice
            .pointer("/message/tool_calls")
            .and_then(Value::as_array);
        for call in tool_calls.into_iter().flatten() {
            if call.pointer("/function/name").and_then(Value::as_str) != Some(PLAN_FN_NAME) {
                continue;
            }
            let args = call
                .pointer("/function/arguments")
                .and_then(Value::as_str)
                .context("Tool call carries no arguments")?;
            return serde_json::from_str(args).context("Tool call arguments are not a plan");
        }
    }

    bail!("No function/tool call with plan arguments found")
}
