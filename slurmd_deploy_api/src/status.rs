// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use std::str::FromStr;

/// Workload status reported by a service or one of its units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadStatus {
    Active,
    Blocked,
    Maintenance,
    Waiting,
    Error,
    Terminated,
    Unknown,
}

impl WorkloadStatus {
    /// A stable status does not change without an external trigger.
    pub fn is_stable(&self) -> bool {
        matches!(self, WorkloadStatus::Active | WorkloadStatus::Blocked)
    }

    /// Status from which no convergence can follow.
    pub fn is_failed(&self) -> bool {
        matches!(self, WorkloadStatus::Error | WorkloadStatus::Terminated)
    }
}

impl FromStr for WorkloadStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WorkloadStatus::Active),
            "blocked" => Ok(WorkloadStatus::Blocked),
            "maintenance" => Ok(WorkloadStatus::Maintenance),
            "waiting" => Ok(WorkloadStatus::Waiting),
            "error" => Ok(WorkloadStatus::Error),
            "terminated" => Ok(WorkloadStatus::Terminated),
            "unknown" => Ok(WorkloadStatus::Unknown),
            _ => Err(anyhow::anyhow!("unknown workload status '{}'", s)),
        }
    }
}

impl std::fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                WorkloadStatus::Active => "active",
                WorkloadStatus::Blocked => "blocked",
                WorkloadStatus::Maintenance => "maintenance",
                WorkloadStatus::Waiting => "waiting",
                WorkloadStatus::Error => "error",
                WorkloadStatus::Terminated => "terminated",
                WorkloadStatus::Unknown => "unknown",
            }
        )
    }
}

/// Status of the agent running the hooks of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Allocating,
    Executing,
    Idle,
    Failed,
    Lost,
    Unknown,
}

impl FromStr for AgentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allocating" => Ok(AgentStatus::Allocating),
            "executing" => Ok(AgentStatus::Executing),
            "idle" => Ok(AgentStatus::Idle),
            "failed" => Ok(AgentStatus::Failed),
            "lost" => Ok(AgentStatus::Lost),
            "unknown" => Ok(AgentStatus::Unknown),
            _ => Err(anyhow::anyhow!("unknown agent status '{}'", s)),
        }
    }
}

/// Convergence target: the service must report `status` within `timeout_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
pub struct ConvergenceTarget {
    pub service: String,
    pub status: WorkloadStatus,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    1_000_000
}

impl ConvergenceTarget {
    pub fn new(service: &str, status: WorkloadStatus, timeout: std::time::Duration) -> Self {
        Self {
            service: service.to_string(),
            status,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

impl std::fmt::Display for ConvergenceTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} -> {}", self.service, self.status)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitStatus {
    pub workload_status: WorkloadStatus,
    pub workload_message: String,
    pub agent_status: AgentStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceStatus {
    pub status: WorkloadStatus,
    pub message: String,
    // Key: unit name, e.g., "slurmd/0".
    pub units: std::collections::BTreeMap<String, UnitStatus>,
}

/// What the last poll reported for a service.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedStatus {
    pub status: WorkloadStatus,
    pub message: String,
}

impl std::fmt::Display for ObservedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.status)
        } else {
            write!(f, "{} ({})", self.status, self.message)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TargetState {
    Satisfied,
    /// Not there yet. `None` if the service does not exist (yet).
    Pending(Option<ObservedStatus>),
    /// The service or one of its units is in a failed status.
    Failed(ObservedStatus),
}

/// Status of all the services of the model at a given time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSnapshot {
    pub services: std::collections::BTreeMap<String, ServiceStatus>,
}

impl StatusSnapshot {
    pub fn service(&self, name: &str) -> Option<&ServiceStatus> {
        self.services.get(name)
    }

    /// Observed status of a service: the first unit that does not agree
    /// with the service-level status wins, so that the message shown is the
    /// one that explains why the service is not there yet.
    pub fn observed(&self, name: &str) -> Option<ObservedStatus> {
        let service = self.services.get(name)?;
        for unit in service.units.values() {
            if unit.workload_status != service.status {
                return Some(ObservedStatus {
                    status: unit.workload_status,
                    message: unit.workload_message.clone(),
                });
            }
        }
        Some(ObservedStatus {
            status: service.status,
            message: service.message.clone(),
        })
    }

    /// Evaluate a convergence target against this snapshot.
    ///
    /// The target is satisfied only if the service status and every unit's
    /// workload status match, and every unit agent is idle.
    pub fn evaluate(&self, target: &ConvergenceTarget) -> TargetState {
        let service = match self.services.get(&target.service) {
            Some(service) => service,
            None => return TargetState::Pending(None),
        };

        for unit in service.units.values() {
            if unit.workload_status.is_failed() || unit.agent_status == AgentStatus::Failed {
                return TargetState::Failed(ObservedStatus {
                    status: unit.workload_status,
                    message: unit.workload_message.clone(),
                });
            }
        }

        let converged = service.status == target.status
            && !service.units.is_empty()
            && service
                .units
                .values()
                .all(|unit| unit.workload_status == target.status && unit.agent_status == AgentStatus::Idle);
        if converged {
            TargetState::Satisfied
        } else {
            TargetState::Pending(self.observed(&target.service))
        }
    }
}
