//! Tool invocations requested by the model.

use crate::error::{ParseStatusError, TransitionError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Execution status of a tool use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
}

impl ToolStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    fn can_transition_to(self, to: ToolStatus) -> bool {
        match self {
            Self::Pending => matches!(to, Self::Running | Self::Error | Self::Cancelled),
            Self::Running => to.is_terminal(),
            _ => false,
        }
    }
}

impl std::str::FromStr for ToolStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(ParseStatusError::new("tool status", s)),
        }
    }
}

/// A single model-initiated tool call and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub message_id: String,
    pub name: String,
    pub parameters: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub status: ToolStatus,
}

impl ToolUse {
    pub fn new(
        id: impl Into<String>,
        message_id: impl Into<String>,
        name: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            id: id.into(),
            message_id: message_id.into(),
            name: name.into(),
            parameters,
            result: None,
            error: None,
            status: ToolStatus::Pending,
        }
    }

    pub fn transition(&mut self, to: ToolStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError::Tool {
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn succeed(&mut self, result: Value) -> Result<(), TransitionError> {
        self.transition(ToolStatus::Success)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(ToolStatus::Error)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Text fed back to the model as the tool result.
    pub fn result_text(&self) -> String {
        match (&self.result, &self.error) {
            (Some(Value::String(s)), _) => s.clone(),
            (Some(value), _) => value.to_string(),
            (None, Some(err)) => format!("error: {}", err),
            (None, None) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_then_succeed() {
        let mut tool = ToolUse::new("tool_1", "msg_1", "calculator", json!({"expression": "2+2"}));
        tool.transition(ToolStatus::Running).unwrap();
        tool.succeed(json!("4")).unwrap();
        assert_eq!(tool.status, ToolStatus::Success);
        assert_eq!(tool.result_text(), "4");
    }

    #[test]
    fn failure_is_reported_as_text() {
        let mut tool = ToolUse::new("tool_1", "msg_1", "calculator", json!({}));
        tool.transition(ToolStatus::Running).unwrap();
        tool.fail("division by zero").unwrap();
        assert_eq!(tool.result_text(), "error: division by zero");
    }

    #[test]
    fn terminal_status_is_final() {
        let mut tool = ToolUse::new("tool_1", "msg_1", "calculator", json!({}));
        tool.transition(ToolStatus::Cancelled).unwrap();
        assert!(tool.transition(ToolStatus::Running).is_err());
        assert!(tool.succeed(json!(1)).is_err());
    }
}
