// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use slurmd_deploy_api::action::{ActionResult, ActionStatus};
use slurmd_deploy_api::status::{AgentStatus, ServiceStatus, StatusSnapshot, UnitStatus, WorkloadStatus};
use std::str::FromStr;

#[derive(Debug, Default, serde::Deserialize)]
struct StatusInfo {
    #[serde(default)]
    current: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UnitOutput {
    #[serde(default)]
    workload_status: StatusInfo,
    #[serde(default)]
    juju_status: StatusInfo,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ApplicationOutput {
    #[serde(default)]
    application_status: StatusInfo,
    #[serde(default)]
    units: std::collections::BTreeMap<String, UnitOutput>,
}

#[derive(Debug, serde::Deserialize)]
struct StatusOutput {
    #[serde(default)]
    applications: std::collections::BTreeMap<String, ApplicationOutput>,
}

fn workload_status(info: &StatusInfo) -> WorkloadStatus {
    WorkloadStatus::from_str(&info.current).unwrap_or(WorkloadStatus::Unknown)
}

fn agent_status(info: &StatusInfo) -> AgentStatus {
    match info.current.as_str() {
        "allocating" => AgentStatus::Allocating,
        "executing" => AgentStatus::Executing,
        "idle" => AgentStatus::Idle,
        "failed" => AgentStatus::Failed,
        "lost" => AgentStatus::Lost,
        _ => AgentStatus::Unknown,
    }
}

/// Parse the output of `juju status --format=json`.
pub fn parse_status(output: &str) -> anyhow::Result<StatusSnapshot> {
    let parsed: StatusOutput = serde_json::from_str(output)?;
    let mut snapshot = StatusSnapshot::default();
    for (name, application) in parsed.applications {
        let units = application
            .units
            .iter()
            .map(|(unit, status)| {
                (
                    unit.clone(),
                    UnitStatus {
                        workload_status: workload_status(&status.workload_status),
                        workload_message: status.workload_status.message.clone(),
                        agent_status: agent_status(&status.juju_status),
                    },
                )
            })
            .collect();
        snapshot.services.insert(
            name,
            ServiceStatus {
                status: workload_status(&application.application_status),
                message: application.application_status.message,
                units,
            },
        );
    }
    Ok(snapshot)
}

/// Parse the output of `juju run <unit> <action> --format=json`.
///
/// The output maps a key identifying the unit (`slurmd/0`, or `unit-slurmd-0`
/// on older clients) to the outcome of the action.
pub fn parse_action(unit: &str, action: &str, output: &str) -> anyhow::Result<ActionResult> {
    let parsed: serde_json::Map<String, serde_json::Value> = serde_json::from_str(output)?;
    let legacy_key = format!("unit-{}", unit.replace('/', "-"));
    let outcome = match parsed.get(unit).or_else(|| parsed.get(&legacy_key)).or_else(|| parsed.values().next()) {
        Some(val) => val,
        None => anyhow::bail!("no outcome for action {} on {}", action, unit),
    };

    let status = match outcome.get("status").and_then(|x| x.as_str()) {
        Some(val) => ActionStatus::from_str(val)?,
        None => anyhow::bail!("no status for action {} on {}", action, unit),
    };
    let results = match outcome.get("results").and_then(|x| x.as_object()) {
        Some(val) => val.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        None => std::collections::BTreeMap::new(),
    };
    let message = outcome.get("message").and_then(|x| x.as_str()).map(|x| x.to_string());

    Ok(ActionResult {
        unit: unit.to_string(),
        action: action.to_string(),
        status,
        results,
        message,
    })
}

/// Parse a duration in the format used by the model configuration, e.g.,
/// `5m`, `1m30s` or `1.5h`.
pub fn parse_duration(value: &str) -> anyhow::Result<std::time::Duration> {
    let value = value.trim();
    anyhow::ensure!(!value.is_empty(), "empty duration");
    if value == "0" {
        return Ok(std::time::Duration::ZERO);
    }

    let mut total = 0.0_f64;
    let mut rest = value;
    while !rest.is_empty() {
        let number_len = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
        anyhow::ensure!(number_len > 0, "invalid duration '{}'", value);
        let number: f64 = rest[..number_len].parse()?;
        rest = &rest[number_len..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let seconds = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            unit => anyhow::bail!("invalid unit '{}' in duration '{}'", unit, value),
        };
        rest = &rest[unit_len..];
        total += number * seconds;
    }
    std::time::Duration::try_from_secs_f64(total).map_err(|err| anyhow::anyhow!("invalid duration '{}': {}", value, err))
}

pub fn format_duration(duration: std::time::Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
