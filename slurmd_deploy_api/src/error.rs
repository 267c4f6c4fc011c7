// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

/// Convergence target that was not reached, with the last status observed.
#[derive(Debug, Clone, PartialEq)]
pub struct UnmetTarget {
    pub target: crate::status::ConvergenceTarget,
    pub observed: Option<crate::status::ObservedStatus>,
}

impl std::fmt::Display for UnmetTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.observed {
            Some(observed) => write!(f, "{} expected {}, last seen {}", self.target.service, self.target.status, observed),
            None => write!(f, "{} expected {}, never seen", self.target.service, self.target.status),
        }
    }
}

/// Failures of the deployment workflow.
///
/// They travel inside `anyhow::Error`: callers that need to tell them apart
/// use `err.downcast_ref::<DeployError>()`.
#[derive(Debug, Clone, PartialEq)]
pub enum DeployError {
    /// An artifact could not be downloaded or written.
    Fetch { url: String, path: String, reason: String },
    /// The content of an artifact does not match the expected hash.
    Integrity { path: String, expected: String, actual: String },
    /// Some targets were not reached before the timeout, or a service
    /// entered a failed status while waiting.
    ConvergenceTimeout { timeout: std::time::Duration, unmet: Vec<UnmetTarget> },
    /// The action completed with a failure status or an unexpected result.
    Action { unit: String, action: String, reason: String },
    /// The action did not complete in time.
    ActionTimeout { unit: String, action: String, timeout: std::time::Duration },
    /// A command on a unit failed or the session could not be established.
    RemoteExec { unit: String, command: String, reason: String },
    /// The topology cannot be scheduled.
    Plan(String),
    /// A verification check observed an unexpected outcome.
    Verification { check: String, observed: String },
}

impl DeployError {
    /// Only remote command failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeployError::RemoteExec { .. })
    }

    /// Names of the services whose targets were not met, if any.
    pub fn unmet_services(&self) -> Vec<String> {
        match self {
            DeployError::ConvergenceTimeout { unmet, .. } => unmet.iter().map(|x| x.target.service.clone()).collect(),
            _ => vec![],
        }
    }
}

impl std::fmt::Display for DeployError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeployError::Fetch { url, path, reason } => write!(f, "could not fetch {} into {}: {}", url, path, reason),
            DeployError::Integrity { path, expected, actual } => {
                write!(f, "hash mismatch for {}: expected {}, found {}", path, expected, actual)
            }
            DeployError::ConvergenceTimeout { timeout, unmet } => write!(
                f,
                "convergence not reached within {:?}: {}",
                timeout,
                unmet.iter().map(|x| x.to_string()).collect::<Vec<String>>().join("; ")
            ),
            DeployError::Action { unit, action, reason } => write!(f, "action {} failed on {}: {}", action, unit, reason),
            DeployError::ActionTimeout { unit, action, timeout } => {
                write!(f, "action {} on {} did not complete within {:?}", action, unit, timeout)
            }
            DeployError::RemoteExec { unit, command, reason } => write!(f, "command '{}' failed on {}: {}", command, unit, reason),
            DeployError::Plan(reason) => write!(f, "invalid deployment plan: {}", reason),
            DeployError::Verification { check, observed } => write!(f, "check '{}' failed, observed: {}", check, observed),
        }
    }
}

impl std::error::Error for DeployError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convergence_timeout_names_unmet() {
        let err = DeployError::ConvergenceTimeout {
            timeout: std::time::Duration::from_secs(1000),
            unmet: vec![UnmetTarget {
                target: crate::status::ConvergenceTarget::new(
                    "slurmd",
                    crate::status::WorkloadStatus::Active,
                    std::time::Duration::from_secs(1000),
                ),
                observed: Some(crate::status::ObservedStatus {
                    status: crate::status::WorkloadStatus::Blocked,
                    message: "Need nhc resource".to_string(),
                }),
            }],
        };
        assert_eq!(vec!["slurmd".to_string()], err.unmet_services());
        assert!(!err.is_retryable());
        let text = err.to_string();
        assert!(text.contains("slurmd expected active, last seen blocked (Need nhc resource)"), "{}", text);

        let any_err: anyhow::Error = err.clone().into();
        assert_eq!(Some(&err), any_err.downcast_ref::<DeployError>());
    }
}
