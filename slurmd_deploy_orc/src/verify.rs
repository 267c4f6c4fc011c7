// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use slurmd_deploy_api::error::DeployError;
use slurmd_deploy_api::platform::PlatformAPI;

fn default_action_timeout_ms() -> u64 {
    300_000
}

/// Check run against a deployed service once it has converged.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckSettings {
    /// The action completes and its results carry `result_key` with a
    /// truthy value.
    Action {
        service: String,
        action: String,
        result_key: String,
        #[serde(default = "default_action_timeout_ms")]
        timeout_ms: u64,
    },
    /// The trimmed output of the command equals `equals` and/or contains
    /// `contains`.
    Command {
        service: String,
        command: String,
        #[serde(default)]
        equals: Option<String>,
        #[serde(default)]
        contains: Option<String>,
    },
    /// The first unit of the service reports exactly this workload status.
    Status {
        service: String,
        status: slurmd_deploy_api::status::WorkloadStatus,
    },
}

impl std::fmt::Display for CheckSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CheckSettings::Action { service, action, .. } => write!(f, "action {} on {}", action, service),
            CheckSettings::Command { service, command, .. } => write!(f, "command '{}' on {}", command, service),
            CheckSettings::Status { service, status } => write!(f, "status {} of {}", status, service),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub check: String,
    pub observed: String,
}

impl std::fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}: {}", self.check, self.observed)
    }
}

fn failed(check: &CheckSettings, observed: String) -> anyhow::Error {
    DeployError::Verification {
        check: check.to_string(),
        observed,
    }
    .into()
}

/// Run a single check, returning what was observed.
pub async fn run_check(platform: &dyn PlatformAPI, check: &CheckSettings, retry: &crate::remote::RetrySettings) -> anyhow::Result<CheckOutcome> {
    log::info!("verifying {}", check);
    let observed = match check {
        CheckSettings::Action {
            service,
            action,
            result_key,
            timeout_ms,
        } => {
            let result = crate::remote::run_remote_action(platform, service, action, std::time::Duration::from_millis(*timeout_ms)).await?;
            if !result.is_success_field(result_key) {
                return Err(failed(
                    check,
                    match result.results.get(result_key) {
                        Some(value) => format!("{} = {}", result_key, value),
                        None => format!("no {} in {:?}", result_key, result.results.keys().collect::<Vec<&String>>()),
                    },
                ));
            }
            format!("{} = {}", result_key, result.results[result_key])
        }
        CheckSettings::Command {
            service,
            command,
            equals,
            contains,
        } => {
            let output = crate::remote::run_remote_command(platform, service, command, retry).await?;
            let equals_ok = equals.as_ref().map(|x| &output == x).unwrap_or(true);
            let contains_ok = contains.as_ref().map(|x| output.contains(x.as_str())).unwrap_or(true);
            if !equals_ok || !contains_ok {
                return Err(failed(check, output));
            }
            output
        }
        CheckSettings::Status { service, status } => {
            let unit = crate::remote::first_unit(platform, service).await.map_err(|err| failed(check, err.to_string()))?;
            let snapshot = platform.status().await?;
            let observed = snapshot.service(service).and_then(|x| x.units.get(&unit)).map(|x| x.workload_status);
            match observed {
                Some(observed) if observed == *status => format!("{} {}", unit, observed),
                Some(observed) => return Err(failed(check, format!("{} {}", unit, observed))),
                None => return Err(failed(check, format!("{} vanished", unit))),
            }
        }
    };
    Ok(CheckOutcome {
        check: check.to_string(),
        observed,
    })
}

/// Run the checks in order, stopping at the first failure.
pub async fn run_checks(platform: &dyn PlatformAPI, checks: &[CheckSettings], retry: &crate::remote::RetrySettings) -> anyhow::Result<Vec<CheckOutcome>> {
    let mut outcomes = vec![];
    for check in checks {
        let outcome = run_check(platform, check, retry).await?;
        log::info!("verified {}", outcome);
        outcomes.push(outcome);
    }
    Ok(outcomes)
}
