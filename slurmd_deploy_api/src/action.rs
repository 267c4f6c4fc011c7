// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Aborted,
}

impl ActionStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, ActionStatus::Pending | ActionStatus::Running)
    }
}

impl FromStr for ActionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "running" => Ok(ActionStatus::Running),
            "completed" => Ok(ActionStatus::Completed),
            "failed" => Ok(ActionStatus::Failed),
            "cancelled" => Ok(ActionStatus::Cancelled),
            "aborted" => Ok(ActionStatus::Aborted),
            _ => Err(anyhow::anyhow!("unknown action status '{}'", s)),
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ActionStatus::Pending => "pending",
                ActionStatus::Running => "running",
                ActionStatus::Completed => "completed",
                ActionStatus::Failed => "failed",
                ActionStatus::Cancelled => "cancelled",
                ActionStatus::Aborted => "aborted",
            }
        )
    }
}

/// Outcome of an action run on a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionResult {
    pub unit: String,
    pub action: String,
    pub status: ActionStatus,
    pub results: std::collections::BTreeMap<String, serde_json::Value>,
    pub message: Option<String>,
}

impl ActionResult {
    /// True if `key` is in the results and its value is truthy.
    ///
    /// Strings are compared case-insensitively against a small set of
    /// negative words, so that both "Success" and "sucessfully installed"
    /// count as success while "failed" does not.
    pub fn is_success_field(&self, key: &str) -> bool {
        match self.results.get(key) {
            Some(value) => is_truthy(value),
            None => false,
        }
    }
}

const FALSY_WORDS: [&str; 8] = ["", "false", "no", "0", "fail", "failed", "failure", "error"];

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(val) => *val,
        serde_json::Value::Number(val) => val.as_f64().map(|x| x != 0.0).unwrap_or(false),
        serde_json::Value::String(val) => !FALSY_WORDS.contains(&val.trim().to_lowercase().as_str()),
        serde_json::Value::Array(val) => !val.is_empty(),
        serde_json::Value::Object(val) => !val.is_empty(),
    }
}

impl std::fmt::Display for ActionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "action {} on {}: {}", self.action, self.unit, self.status)?;
        if let Some(message) = &self.message {
            write!(f, " [{}]", message)?;
        }
        Ok(())
    }
}
