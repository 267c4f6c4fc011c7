// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use slurmd_deploy_api::error::{DeployError, UnmetTarget};
use slurmd_deploy_api::status::{ConvergenceTarget, StatusSnapshot, TargetState};

#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    /// Overall budget. Each target's own budget applies if shorter.
    pub timeout: std::time::Duration,
    /// Interval between two status polls.
    pub poll_interval: std::time::Duration,
    /// How long all targets must stay satisfied before returning.
    pub idle_period: std::time::Duration,
}

impl WaitOptions {
    pub fn new(timeout: std::time::Duration, poll_interval: std::time::Duration) -> Self {
        Self {
            timeout,
            poll_interval,
            idle_period: std::time::Duration::ZERO,
        }
    }

    pub fn with_idle_period(mut self, idle_period: std::time::Duration) -> Self {
        self.idle_period = idle_period;
        self
    }
}

fn unmet_targets(snapshot: Option<&StatusSnapshot>, targets: &[ConvergenceTarget]) -> Vec<UnmetTarget> {
    targets
        .iter()
        .filter_map(|target| {
            let state = match snapshot {
                Some(snapshot) => snapshot.evaluate(target),
                None => TargetState::Pending(None),
            };
            match state {
                TargetState::Satisfied => None,
                TargetState::Pending(observed) => Some(UnmetTarget {
                    target: target.clone(),
                    observed,
                }),
                TargetState::Failed(observed) => Some(UnmetTarget {
                    target: target.clone(),
                    observed: Some(observed),
                }),
            }
        })
        .collect()
}

/// Poll the platform until all the targets are satisfied in the same
/// snapshot, which is returned.
///
/// Every target waits for at most its own budget, capped by
/// `options.timeout`. Fails with [`DeployError::ConvergenceTimeout`] listing
/// the targets not satisfied when the budget of an unsatisfied target
/// expires, or as soon as a target service enters a failed status.
pub async fn wait_for_status(
    platform: &dyn slurmd_deploy_api::platform::PlatformAPI,
    targets: &[ConvergenceTarget],
    options: WaitOptions,
) -> anyhow::Result<StatusSnapshot> {
    let started = tokio::time::Instant::now();
    let deadlines: Vec<std::time::Duration> = targets.iter().map(|target| std::cmp::min(target.timeout(), options.timeout)).collect();
    let longest = deadlines.iter().max().cloned().unwrap_or(options.timeout);
    let mut last_snapshot: Option<StatusSnapshot> = None;
    let mut satisfied_since: Option<tokio::time::Instant> = None;
    // Indices of the targets not satisfied by the last snapshot.
    let mut pending: Vec<usize> = (0..targets.len()).collect();

    log::info!(
        "waiting up to {:?} for [{}]",
        longest,
        targets.iter().map(|x| x.to_string()).collect::<Vec<String>>().join(", ")
    );

    loop {
        // Nearest deadline that can still fail the wait.
        let horizon = pending.iter().map(|i| deadlines[*i]).min().unwrap_or(longest);
        let remaining = horizon.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, platform.status()).await {
            Ok(Ok(snapshot)) => last_snapshot = Some(snapshot),
            Ok(Err(err)) => log::warn!("could not retrieve the status: {}", err),
            Err(_) => log::warn!("status request did not complete within {:?}", remaining),
        }

        let snapshot = last_snapshot.as_ref();
        pending.clear();
        for (i, target) in targets.iter().enumerate() {
            match snapshot.map(|x| x.evaluate(target)) {
                Some(TargetState::Satisfied) => {}
                Some(TargetState::Failed(observed)) => {
                    log::error!("{} entered a failed status: {}", target.service, observed);
                    return Err(DeployError::ConvergenceTimeout {
                        timeout: started.elapsed(),
                        unmet: unmet_targets(snapshot, targets),
                    }
                    .into());
                }
                Some(TargetState::Pending(observed)) => {
                    log::debug!(
                        "{} not converged yet: {}",
                        target,
                        observed.map(|x| x.to_string()).unwrap_or_else(|| "not found".to_string())
                    );
                    pending.push(i);
                }
                None => pending.push(i),
            }
        }

        if pending.is_empty() {
            let since = *satisfied_since.get_or_insert_with(tokio::time::Instant::now);
            if since.elapsed() >= options.idle_period {
                log::info!("converged after {:?}", started.elapsed());
                return Ok(last_snapshot.unwrap_or_default());
            }
        } else {
            satisfied_since = None;
        }

        let elapsed = started.elapsed();
        let expired = pending.iter().map(|i| deadlines[*i]).filter(|deadline| elapsed >= *deadline).max();
        if let Some(timeout) = expired.or(if elapsed >= longest { Some(longest) } else { None }) {
            return Err(DeployError::ConvergenceTimeout {
                timeout,
                unmet: unmet_targets(last_snapshot.as_ref(), targets),
            }
            .into());
        }

        let horizon = pending.iter().map(|i| deadlines[*i]).min().unwrap_or(longest);
        tokio::time::sleep(std::cmp::min(options.poll_interval, horizon.saturating_sub(elapsed))).await;
    }
}

/// Run `task` with the platform's update-status interval shortened to
/// `interval`, restoring the previous value afterwards.
///
/// Failing to change the interval only makes convergence slower, hence it
/// is logged and ignored.
pub async fn with_fast_forward<T, F>(platform: &dyn slurmd_deploy_api::platform::PlatformAPI, interval: std::time::Duration, task: F) -> anyhow::Result<T>
where
    F: std::future::Future<Output = anyhow::Result<T>>,
{
    let previous = match platform.update_status_interval().await {
        Ok(previous) => match platform.set_update_status_interval(interval).await {
            Ok(_) => {
                log::debug!("update-status interval changed from {:?} to {:?}", previous, interval);
                Some(previous)
            }
            Err(err) => {
                log::warn!("could not shorten the update-status interval: {}", err);
                None
            }
        },
        Err(err) => {
            log::warn!("could not read the update-status interval: {}", err);
            None
        }
    };

    let ret = task.await;

    if let Some(previous) = previous {
        if let Err(err) = platform.set_update_status_interval(previous).await {
            log::warn!("could not restore the update-status interval to {:?}: {}", previous, err);
        }
    }
    ret
}
