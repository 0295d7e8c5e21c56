use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::clients::functions;
use crate::errors::CallError;

/// The terminal sentinel accepted wherever a transition target appears.
pub const DONE_SENTINEL: &str = "DONE";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid step name `{0}`: lowercase alphanumerics and hyphens only")]
pub struct InvalidStepName(pub String);

/// Validated step identifier (`[a-z0-9][a-z0-9-]*`).
///
/// The uppercase `DONE` sentinel is deliberately unrepresentable here;
/// it only exists as [`TransitionTarget::Done`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StepName(String);

impl StepName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidStepName> {
        let name = name.into();
        let mut chars = name.chars();
        let valid_head =
            matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit());
        let valid_tail = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if valid_head && valid_tail {
            Ok(Self(name))
        } else {
            Err(InvalidStepName(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StepName {
    type Error = InvalidStepName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StepName> for String {
    fn from(value: StepName) -> Self {
        value.0
    }
}

/// Where a step may hand control next.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TransitionTarget {
    Done,
    Step(StepName),
}

impl TransitionTarget {
    pub fn parse(token: &str) -> Result<Self, InvalidStepName> {
        if token == DONE_SENTINEL {
            return Ok(Self::Done);
        }
        StepName::new(token).map(Self::Step)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for TransitionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => f.write_str(DONE_SENTINEL),
            Self::Step(name) => f.write_str(name.as_str()),
        }
    }
}

impl TryFrom<String> for TransitionTarget {
    type Error = InvalidStepName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TransitionTarget> for String {
    fn from(value: TransitionTarget) -> Self {
        value.to_string()
    }
}

/// A function a step may ask the engine to call, with its JSON-schema
/// parameter description and required argument names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: Value,
    #[serde(default)]
    pub required: Vec<String>,
}

impl FunctionSpec {
    /// Required-argument check performed before any dispatch. A failure
    /// here never reaches a backend.
    pub fn validate_arguments(&self, arguments: &Value) -> Result<(), CallError> {
        let object = arguments.as_object().ok_or_else(|| CallError::Validation {
            message: format!("function `{}` expects an object of arguments", self.name),
        })?;
        for field in &self.required {
            let present = object.get(field).map(|value| !value.is_null()).unwrap_or(false);
            if !present {
                return Err(CallError::Validation {
                    message: format!(
                        "function `{}` is missing required argument `{field}`",
                        self.name
                    ),
                });
            }
        }
        Ok(())
    }
}

/// One fully parsed step: what to tell the model, what it may call, and
/// where it may go next.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: StepName,
    pub version: u32,
    pub description: String,
    /// System-prompt body driving the step's conversation.
    pub instructions: String,
    pub functions: Vec<FunctionSpec>,
    /// Legal transition targets; anything else fails the run.
    pub next_steps: Vec<TransitionTarget>,
    /// Context allow-list; the step sees these fields and nothing else.
    pub context_fields: Vec<String>,
}

impl StepDefinition {
    pub fn function(&self, name: &str) -> Option<&FunctionSpec> {
        self.functions.iter().find(|function| function.name == name)
    }

    pub fn declares_function(&self, name: &str) -> bool {
        self.function(name).is_some()
    }

    pub fn allows_transition(&self, target: &TransitionTarget) -> bool {
        self.next_steps.contains(target)
    }

    /// True when this step can send the outbound reply; such steps carry
    /// the delivered-reply obligation checked at DONE.
    pub fn declares_send(&self) -> bool {
        self.declares_function(functions::SEND_REPLY)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::errors::CallError;

    use super::{FunctionSpec, StepDefinition, StepName, TransitionTarget};

    fn spec_with_required(required: &[&str]) -> FunctionSpec {
        FunctionSpec {
            name: "create_ticket".to_owned(),
            description: String::new(),
            parameters: json!({ "type": "object" }),
            required: required.iter().map(|field| (*field).to_owned()).collect(),
        }
    }

    #[test]
    fn step_names_reject_uppercase_and_leading_hyphen() {
        assert!(StepName::new("check-warranty").is_ok());
        assert!(StepName::new("DONE").is_err());
        assert!(StepName::new("-oops").is_err());
        assert!(StepName::new("").is_err());
    }

    #[test]
    fn done_sentinel_parses_to_terminal_target() {
        assert!(TransitionTarget::parse("DONE").expect("parse DONE").is_done());
        let step = TransitionTarget::parse("send-reply").expect("parse step");
        assert_eq!(step.to_string(), "send-reply");
    }

    #[test]
    fn required_argument_missing_is_a_validation_failure() {
        let spec = spec_with_required(&["subject", "summary"]);
        let error = spec
            .validate_arguments(&json!({ "subject": "help" }))
            .expect_err("missing summary should fail");
        assert!(matches!(error, CallError::Validation { .. }));
    }

    #[test]
    fn null_required_argument_counts_as_missing() {
        let spec = spec_with_required(&["subject"]);
        let error = spec
            .validate_arguments(&json!({ "subject": null }))
            .expect_err("null subject should fail");
        assert!(matches!(error, CallError::Validation { .. }));
    }

    #[test]
    fn complete_arguments_validate() {
        let spec = spec_with_required(&["subject"]);
        spec.validate_arguments(&json!({ "subject": "help", "extra": 1 }))
            .expect("complete arguments");
    }

    #[test]
    fn send_declaration_is_detected_by_function_name() {
        let step = StepDefinition {
            name: StepName::new("send-reply").expect("name"),
            version: 1,
            description: String::new(),
            instructions: "compose and send the reply".to_owned(),
            functions: vec![FunctionSpec {
                name: "send_reply".to_owned(),
                description: String::new(),
                parameters: json!({ "type": "object" }),
                required: vec![],
            }],
            next_steps: vec![TransitionTarget::Done],
            context_fields: vec!["sender".to_owned()],
        };

        assert!(step.declares_send());
        assert!(step.allows_transition(&TransitionTarget::Done));
        assert!(!step.allows_transition(&TransitionTarget::parse("create-ticket").expect("parse")));
    }
}
