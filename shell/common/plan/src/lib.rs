// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The structured command plan exchanged between the translator and the
//! interactive shell.
//!
//! A plan is the only thing a language model is allowed to hand back: a
//! versioned record whose `command` field is the sole authoritative input
//! to the sandbox. Everything else is advisory context for the user.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Plan schema version the shell is compiled against.
pub const PLAN_VERSION: &str = "1.0";

/// Name of the function the model is forced to call to emit a plan.
pub const PLAN_FN_NAME: &str = "emit_plan_v1";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Must equal [`PLAN_VERSION`].
    pub version: String,

    /// Free-form label of what the request is about (e.g. "file_search").
    pub intent: String,

    /// The command to execute, one argv element per entry.
    pub command: Vec<String>,

    /// Directory the model assumed the command runs in.
    pub cwd: String,

    /// Paths the command reads.
    pub inputs: Vec<String>,

    /// Paths the command creates or modifies.
    pub outputs: Vec<String>,

    /// Human-readable explanation shown before execution.
    pub explain: String,

    /// If true, the shell surfaces `question` instead of executing.
    #[serde(default)]
    pub needs_clarification: bool,

    #[serde(default)]
    pub question: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("unsupported plan version {found:?} (expected {PLAN_VERSION:?})")]
    VersionMismatch { found: String },
    #[error("plan contains an empty command")]
    EmptyCommand,
}

impl Plan {
    /// Checks the invariants serde cannot express: the version must match
    /// the compiled-in schema version, and an executable plan must carry a
    /// non-empty command. Plans asking for clarification are never executed,
    /// so their command is allowed to be empty.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.version != PLAN_VERSION {
            return Err(PlanError::VersionMismatch {
                found: self.version.clone(),
            });
        }
        if !self.needs_clarification && self.command.is_empty() {
            return Err(PlanError::EmptyCommand);
        }
        Ok(())
    }
}

/// JSON schema of [`Plan`], handed to the model as the parameters of the
/// forced function call.
pub fn plan_parameters_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "required": [
            "version",
            "intent",
            "command",
            "cwd",
            "inputs",
            "outputs",
            "explain",
            "needs_clarification",
            "question"
        ],
        "properties": {
            "version": { "type": "string", "enum": [PLAN_VERSION] },
            "intent": { "type": "string" },
            "command": {
                "type": "array",
                "items": { "type": "string" }
            },
            "cwd": { "type": "string" },
            "inputs": {
                "type": "array",
                "items": { "type": "string" }
            },
            "outputs": {
                "type": "array",
                "items": { "type": "string" }
            },
            "explain": { "type": "string" },
            "needs_clarification": { "type": "boolean" },
            "question": { "type": "string" }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan_json() -> &'static str {
        r#"{
            "version": "1.0",
            "intent": "file_search",
            "command": ["find", ".", "-name", "*.log"],
            "cwd": ".",
            "inputs": [],
            "outputs": [],
            "explain": "Find log files under the current directory.",
            "needs_clarification": false,
            "question": ""
        }"#
    }

    #[test]
    fn parses_and_validates() {
        let plan: Plan = serde_json::from_str(sample_plan_json()).unwrap();
        assert_eq!(plan.command[0], "find");
        plan.validate().unwrap();
    }

    #[test]
    fn rejects_missing_fields() {
        let result: Result<Plan, _> = serde_json::from_str(r#"{"version": "1.0"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_version_mismatch() {
        let mut plan: Plan = serde_json::from_str(sample_plan_json()).unwrap();
        plan.version = "2.0".to_string();
        assert_eq!(
            plan.validate(),
            Err(PlanError::VersionMismatch {
                found: "2.0".to_string()
            })
        );
    }

    #[test]
    fn rejects_empty_executable_command() {
        let mut plan: Plan = serde_json::from_str(sample_plan_json()).unwrap();
        plan.command.clear();
        assert_eq!(plan.validate(), Err(PlanError::EmptyCommand));

        // A clarification round-trip is allowed to omit the command.
        plan.needs_clarification = true;
        plan.validate().unwrap();
    }

    #[test]
    fn schema_lists_every_field() {
        let schema = plan_parameters_schema();
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        for field in required {
            assert!(
                !schema["properties"][field].is_null(),
                "missing property {field}"
            );
        }
    }
}
