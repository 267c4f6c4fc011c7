// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use slurmd_deploy_api::action::{ActionResult, ActionStatus};
use slurmd_deploy_api::error::DeployError;
use slurmd_deploy_api::platform::PlatformAPI;

use backoff::Error as BackoffError;

/// Exponential backoff between attempts of a remote command.
#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: u32,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            multiplier: 2,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetrySettings {
    /// Backoff policy between attempts, without jitter and without limit on
    /// the elapsed time: the number of attempts bounds the retries.
    pub fn policy(&self) -> backoff::ExponentialBackoff {
        let initial_interval = std::time::Duration::from_millis(self.initial_backoff_ms);
        backoff::ExponentialBackoff {
            current_interval: initial_interval,
            initial_interval,
            randomization_factor: 0.0,
            multiplier: self.multiplier as f64,
            max_interval: std::time::Duration::from_millis(self.max_backoff_ms),
            max_elapsed_time: None,
            ..backoff::ExponentialBackoff::default()
        }
    }
}

fn unit_index(unit: &str) -> u32 {
    unit.rsplit_once('/').and_then(|(_, index)| index.parse().ok()).unwrap_or(u32::MAX)
}

/// Lowest-numbered unit of a service, as reported by the platform.
pub async fn first_unit(platform: &dyn PlatformAPI, service: &str) -> anyhow::Result<String> {
    let snapshot = platform.status().await?;
    let status = match snapshot.service(service) {
        Some(status) => status,
        None => anyhow::bail!("service {} not found", service),
    };
    match status.units.keys().min_by_key(|unit| unit_index(unit)) {
        Some(unit) => Ok(unit.clone()),
        None => anyhow::bail!("service {} has no units", service),
    }
}

/// Run an action on the first unit of a service and wait for its completion.
pub async fn run_remote_action(platform: &dyn PlatformAPI, service: &str, action: &str, timeout: std::time::Duration) -> anyhow::Result<ActionResult> {
    let unit = first_unit(platform, service).await.map_err(|err| DeployError::Action {
        unit: format!("{}/?", service),
        action: action.to_string(),
        reason: err.to_string(),
    })?;

    log::info!("running action {} on {}", action, unit);
    let outcome = tokio::time::timeout(timeout, platform.run_action(&unit, action)).await;
    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            return Err(DeployError::Action {
                unit,
                action: action.to_string(),
                reason: err.to_string(),
            }
            .into())
        }
        Err(_) => {
            return Err(DeployError::ActionTimeout {
                unit,
                action: action.to_string(),
                timeout,
            }
            .into())
        }
    };

    if result.status != ActionStatus::Completed {
        return Err(DeployError::Action {
            unit,
            action: action.to_string(),
            reason: format!("status {}{}", result.status, result.message.as_ref().map(|x| format!(": {}", x)).unwrap_or_default()),
        }
        .into());
    }
    log::debug!("{}: {:?}", result, result.results);
    Ok(result)
}

/// Run a shell command on the first unit of a service, returning its
/// output without leading and trailing line breaks.
///
/// Failures are retried according to `retry` and the last one is returned.
pub async fn run_remote_command(platform: &dyn PlatformAPI, service: &str, command: &str, retry: &RetrySettings) -> anyhow::Result<String> {
    let max_attempts = std::cmp::max(retry.max_attempts, 1);
    let attempts = &std::sync::atomic::AtomicU32::new(0);

    let run_command = move || async move {
        let attempt = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        let outcome = match first_unit(platform, service).await {
            Ok(unit) => platform.ssh(&unit, command).await.map_err(|err| DeployError::RemoteExec {
                unit,
                command: command.to_string(),
                reason: err.to_string(),
            }),
            Err(err) => Err(DeployError::RemoteExec {
                unit: format!("{}/?", service),
                command: command.to_string(),
                reason: err.to_string(),
            }),
        };
        match outcome {
            Ok(output) => Ok(slurmd_deploy_api::util::trim_output(&output)),
            Err(err) if attempt >= max_attempts || !err.is_retryable() => {
                log::error!("giving up after {} attempts: {}", attempt, err);
                Err(BackoffError::permanent(err))
            }
            Err(err) => Err(BackoffError::transient(err)),
        }
    };
    let log_failure = |err: DeployError, delay: std::time::Duration| {
        log::warn!(
            "attempt {}/{} failed, retrying in {:?}: {}",
            attempts.load(std::sync::atomic::Ordering::SeqCst),
            max_attempts,
            delay,
            err
        );
    };

    backoff::future::retry_notify(retry.policy(), run_command, log_failure)
        .await
        .map_err(anyhow::Error::from)
}
