// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

//! In-process platform with scripted services.
//!
//! Each service goes through a transient status for a number of status
//! polls after every event that triggers hooks (deploy, resource attached,
//! relation added) and then settles. A settled service is blocked while a
//! required resource or relation is missing.

use slurmd_deploy_api::action::{ActionResult, ActionStatus};
use slurmd_deploy_api::relation::RelationEdge;
use slurmd_deploy_api::service::ServiceDescriptor;
use slurmd_deploy_api::status::{AgentStatus, ServiceStatus, StatusSnapshot, UnitStatus, WorkloadStatus};

#[derive(Debug, Clone)]
pub struct SimulatedAction {
    pub status: ActionStatus,
    pub results: std::collections::BTreeMap<String, serde_json::Value>,
    pub delay: std::time::Duration,
}

impl SimulatedAction {
    pub fn completed(results: Vec<(&str, serde_json::Value)>) -> Self {
        Self {
            status: ActionStatus::Completed,
            results: results.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            delay: std::time::Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedCommand {
    pub output: String,
    /// Number of invocations failing with a connection error before the
    /// command succeeds.
    pub failures_before_success: u32,
    pub exit_code: i32,
}

impl SimulatedCommand {
    pub fn ok(output: &str) -> Self {
        Self {
            output: output.to_string(),
            failures_before_success: 0,
            exit_code: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceBehaviour {
    pub transient_status: WorkloadStatus,
    pub transient_message: String,
    /// `None` if the service never leaves the transient status.
    pub settled_status: Option<WorkloadStatus>,
    pub settled_message: String,
    /// Status polls needed to settle after each hook-triggering event.
    pub polls_to_settle: u32,
    pub required_resources: Vec<String>,
    pub required_relations: Vec<String>,
    /// If true, a relation added while the peer is not in a stable status
    /// leaves this service waiting forever.
    pub stalls_on_early_relation: bool,
    pub actions: std::collections::BTreeMap<String, SimulatedAction>,
    pub commands: std::collections::BTreeMap<String, SimulatedCommand>,
}

impl ServiceBehaviour {
    pub fn settles_to(status: WorkloadStatus, polls_to_settle: u32) -> Self {
        Self {
            transient_status: WorkloadStatus::Waiting,
            transient_message: "installing".to_string(),
            settled_status: Some(status),
            settled_message: String::default(),
            polls_to_settle,
            required_resources: vec![],
            required_relations: vec![],
            stalls_on_early_relation: false,
            actions: std::collections::BTreeMap::new(),
            commands: std::collections::BTreeMap::new(),
        }
    }

    pub fn transient_forever() -> Self {
        Self {
            settled_status: None,
            ..Self::settles_to(WorkloadStatus::Active, 0)
        }
    }

    pub fn requiring_resource(mut self, resource: &str) -> Self {
        self.required_resources.push(resource.to_string());
        self
    }

    pub fn requiring_relation(mut self, peer: &str) -> Self {
        self.required_relations.push(peer.to_string());
        self
    }

    pub fn stalling_on_early_relation(mut self) -> Self {
        self.stalls_on_early_relation = true;
        self
    }

    pub fn with_action(mut self, name: &str, action: SimulatedAction) -> Self {
        self.actions.insert(name.to_string(), action);
        self
    }

    pub fn with_command(mut self, command: &str, outcome: SimulatedCommand) -> Self {
        self.commands.insert(command.to_string(), outcome);
        self
    }
}

/// Behaviours mimicking the slurm charms: the controller is blocked until a
/// compute node is related, the compute node needs its health-check tarball
/// and hangs if related to a controller that is still setting up.
pub fn slurm_topology() -> Vec<(String, ServiceBehaviour)> {
    vec![
        (
            "slurmctld".to_string(),
            ServiceBehaviour::settles_to(WorkloadStatus::Active, 3)
                .requiring_resource("etcd")
                .requiring_relation("slurmdbd")
                .requiring_relation("slurmd"),
        ),
        (
            "slurmdbd".to_string(),
            ServiceBehaviour::settles_to(WorkloadStatus::Active, 2)
                .requiring_relation("mysql")
                .requiring_relation("slurmctld"),
        ),
        ("mysql".to_string(), ServiceBehaviour::settles_to(WorkloadStatus::Active, 2)),
        (
            "slurmd".to_string(),
            ServiceBehaviour::settles_to(WorkloadStatus::Active, 3)
                .requiring_resource("nhc")
                .requiring_relation("slurmctld")
                .stalling_on_early_relation()
                .with_action(
                    "mpi-install",
                    SimulatedAction::completed(vec![("installation", serde_json::json!("Successfully installed"))]),
                )
                .with_command(
                    "mpirun --version",
                    SimulatedCommand::ok("HYDRA build details:\n    Version:                                 3.3.2\n"),
                )
                .with_command("systemctl is-active slurmd", SimulatedCommand::ok("active\n"))
                .with_command("systemctl is-active munge", SimulatedCommand::ok("active\n")),
        ),
    ]
}

/// Request received by the simulated platform. Status polls are not recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformCall {
    BuildCharm(String),
    Deploy(String),
    AttachResource(String, String),
    /// Relation requested, with the status of both endpoints at that time.
    AddRelation(RelationEdge, std::collections::BTreeMap<String, WorkloadStatus>),
    RemoveRelation(RelationEdge),
    RemoveService(String),
    RunAction(String, String),
    Ssh(String, String),
    SetUpdateStatusInterval(std::time::Duration),
}

struct SimulatedService {
    descriptor: ServiceDescriptor,
    behaviour: ServiceBehaviour,
    resources: std::collections::BTreeSet<String>,
    polls_since_event: u32,
    stalled: bool,
}

struct SimulatedInner {
    behaviours: std::collections::HashMap<String, ServiceBehaviour>,
    services: std::collections::BTreeMap<String, SimulatedService>,
    relations: std::collections::BTreeSet<RelationEdge>,
    command_invocations: std::collections::HashMap<(String, String), u32>,
    calls: Vec<PlatformCall>,
    status_polls: u64,
    update_status_interval: std::time::Duration,
}

impl SimulatedInner {
    fn current_status(&self, name: &str) -> Option<(WorkloadStatus, String)> {
        let service = self.services.get(name)?;
        let behaviour = &service.behaviour;
        let settled = match behaviour.settled_status {
            Some(settled) => settled,
            None => return Some((behaviour.transient_status, behaviour.transient_message.clone())),
        };
        if service.stalled {
            return Some((WorkloadStatus::Waiting, "waiting for the controller to be configured".to_string()));
        }
        if service.polls_since_event < behaviour.polls_to_settle {
            return Some((behaviour.transient_status, behaviour.transient_message.clone()));
        }
        if let Some(resource) = behaviour.required_resources.iter().find(|x| !service.resources.contains(*x)) {
            return Some((WorkloadStatus::Blocked, format!("Missing resource: {}", resource)));
        }
        let missing: Vec<&str> = behaviour
            .required_relations
            .iter()
            .filter(|peer| !self.relations.contains(&RelationEdge::new(name, peer)))
            .map(|x| x.as_str())
            .collect();
        if !missing.is_empty() {
            return Some((WorkloadStatus::Blocked, format!("Need relations: {}", missing.join(", "))));
        }
        Some((settled, behaviour.settled_message.clone()))
    }

    fn snapshot(&self) -> StatusSnapshot {
        let mut snapshot = StatusSnapshot::default();
        for (name, service) in &self.services {
            let (status, message) = match self.current_status(name) {
                Some(val) => val,
                None => continue,
            };
            let agent_status = if status == service.behaviour.transient_status && !status.is_stable() {
                AgentStatus::Executing
            } else {
                AgentStatus::Idle
            };
            let units = (0..service.descriptor.num_units)
                .map(|i| {
                    (
                        format!("{}/{}", name, i),
                        UnitStatus {
                            workload_status: status,
                            workload_message: message.clone(),
                            agent_status,
                        },
                    )
                })
                .collect();
            snapshot.services.insert(name.clone(), ServiceStatus { status, message, units });
        }
        snapshot
    }

    fn unit_service(&self, unit: &str) -> anyhow::Result<&SimulatedService> {
        let (name, index) = match unit.split_once('/') {
            Some(val) => val,
            None => anyhow::bail!("invalid unit name '{}'", unit),
        };
        let service = match self.services.get(name) {
            Some(service) => service,
            None => anyhow::bail!("unit {} not found", unit),
        };
        let index: u32 = index.parse()?;
        anyhow::ensure!(index < service.descriptor.num_units, "unit {} not found", unit);
        Ok(service)
    }

    fn touch(&mut self, name: &str) {
        if let Some(service) = self.services.get_mut(name) {
            service.polls_since_event = 0;
        }
    }
}

/// Scripted platform, cheap to clone: clones share the same model.
#[derive(Clone)]
pub struct SimulatedPlatform {
    inner: std::sync::Arc<tokio::sync::Mutex<SimulatedInner>>,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(tokio::sync::Mutex::new(SimulatedInner {
                behaviours: std::collections::HashMap::new(),
                services: std::collections::BTreeMap::new(),
                relations: std::collections::BTreeSet::new(),
                command_invocations: std::collections::HashMap::new(),
                calls: vec![],
                status_polls: 0,
                update_status_interval: std::time::Duration::from_secs(300),
            })),
        }
    }

    /// Platform with the behaviours of [`slurm_topology`].
    pub async fn with_slurm_topology() -> Self {
        let platform = Self::new();
        for (name, behaviour) in slurm_topology() {
            platform.set_behaviour(&name, behaviour).await;
        }
        platform
    }

    /// Behaviour applied to the service when deployed. Services deployed
    /// without one settle to active after one poll.
    pub async fn set_behaviour(&self, service: &str, behaviour: ServiceBehaviour) {
        self.inner.lock().await.behaviours.insert(service.to_string(), behaviour);
    }

    pub async fn calls(&self) -> Vec<PlatformCall> {
        self.inner.lock().await.calls.clone()
    }

    pub async fn relations(&self) -> Vec<RelationEdge> {
        self.inner.lock().await.relations.iter().cloned().collect()
    }

    pub async fn services(&self) -> Vec<String> {
        self.inner.lock().await.services.keys().cloned().collect()
    }

    pub async fn status_polls(&self) -> u64 {
        self.inner.lock().await.status_polls
    }
}

#[async_trait::async_trait]
impl slurmd_deploy_api::platform::PlatformAPI for SimulatedPlatform {
    async fn build_charm(&self, path: &str) -> anyhow::Result<String> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(PlatformCall::BuildCharm(path.to_string()));
        let name = std::path::Path::new(path)
            .file_name()
            .map(|x| x.to_string_lossy().to_string())
            .unwrap_or_else(|| "charm".to_string());
        Ok(format!("{}/{}_ubuntu-20.04-amd64.charm", path, name))
    }

    async fn deploy(&self, service: &ServiceDescriptor) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(PlatformCall::Deploy(service.name.clone()));
        anyhow::ensure!(
            !inner.services.contains_key(&service.name),
            "cannot add application \"{}\": application already exists",
            service.name
        );
        let behaviour = inner
            .behaviours
            .get(&service.name)
            .cloned()
            .unwrap_or_else(|| ServiceBehaviour::settles_to(WorkloadStatus::Active, 1));
        inner.services.insert(
            service.name.clone(),
            SimulatedService {
                descriptor: service.clone(),
                behaviour,
                resources: service.resources.keys().cloned().collect(),
                polls_since_event: 0,
                stalled: false,
            },
        );
        Ok(())
    }

    async fn attach_resource(&self, service: &str, resource: &str, _path: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(PlatformCall::AttachResource(service.to_string(), resource.to_string()));
        match inner.services.get_mut(service) {
            Some(val) => {
                val.resources.insert(resource.to_string());
            }
            None => anyhow::bail!("application \"{}\" not found", service),
        }
        inner.touch(service);
        Ok(())
    }

    async fn add_relation(&self, edge: &RelationEdge) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let (a, b) = edge.endpoints();
        let statuses: std::collections::BTreeMap<String, WorkloadStatus> = [a, b]
            .iter()
            .filter_map(|name| inner.current_status(name).map(|(status, _)| (name.to_string(), status)))
            .collect();
        inner.calls.push(PlatformCall::AddRelation(edge.clone(), statuses.clone()));
        for name in [a, b] {
            anyhow::ensure!(inner.services.contains_key(name), "application \"{}\" not found", name);
        }
        anyhow::ensure!(!inner.relations.contains(edge), "relation {} already exists", edge);

        for (name, peer) in [(a, b), (b, a)] {
            let peer_stable = statuses.get(peer).map(|x| x.is_stable()).unwrap_or(false);
            if let Some(service) = inner.services.get_mut(name) {
                if service.behaviour.stalls_on_early_relation && !peer_stable {
                    log::warn!("{} related to {} while the latter was not settled", name, peer);
                    service.stalled = true;
                }
            }
        }
        inner.relations.insert(edge.clone());
        inner.touch(a);
        inner.touch(b);
        Ok(())
    }

    async fn remove_relation(&self, edge: &RelationEdge) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(PlatformCall::RemoveRelation(edge.clone()));
        anyhow::ensure!(inner.relations.remove(edge), "relation {} not found", edge);
        let (a, b) = edge.endpoints();
        let (a, b) = (a.to_string(), b.to_string());
        inner.touch(&a);
        inner.touch(&b);
        Ok(())
    }

    async fn remove_service(&self, service: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(PlatformCall::RemoveService(service.to_string()));
        anyhow::ensure!(inner.services.remove(service).is_some(), "application \"{}\" not found", service);
        inner.relations.retain(|x| !x.involves(service));
        Ok(())
    }

    async fn status(&self) -> anyhow::Result<StatusSnapshot> {
        let mut inner = self.inner.lock().await;
        inner.status_polls += 1;
        for service in inner.services.values_mut() {
            service.polls_since_event = service.polls_since_event.saturating_add(1);
        }
        Ok(inner.snapshot())
    }

    async fn run_action(&self, unit: &str, action: &str) -> anyhow::Result<ActionResult> {
        let outcome = {
            let mut inner = self.inner.lock().await;
            inner.calls.push(PlatformCall::RunAction(unit.to_string(), action.to_string()));
            let service = inner.unit_service(unit)?;
            match service.behaviour.actions.get(action) {
                Some(outcome) => outcome.clone(),
                None => anyhow::bail!("action \"{}\" not defined on unit \"{}\"", action, unit),
            }
        };
        if !outcome.delay.is_zero() {
            tokio::time::sleep(outcome.delay).await;
        }
        Ok(ActionResult {
            unit: unit.to_string(),
            action: action.to_string(),
            status: outcome.status,
            results: outcome.results,
            message: None,
        })
    }

    async fn ssh(&self, unit: &str, command: &str) -> anyhow::Result<String> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(PlatformCall::Ssh(unit.to_string(), command.to_string()));
        let outcome = match inner.unit_service(unit)?.behaviour.commands.get(command) {
            Some(outcome) => outcome.clone(),
            None => anyhow::bail!("{}: command not found (exit status 127)", command),
        };
        let invocations = inner.command_invocations.entry((unit.to_string(), command.to_string())).or_insert(0);
        *invocations += 1;
        if *invocations <= outcome.failures_before_success {
            anyhow::bail!("ssh: connect to host {}: connection reset by peer", unit);
        }
        anyhow::ensure!(outcome.exit_code == 0, "{} (exit status {})", outcome.output.trim(), outcome.exit_code);
        Ok(outcome.output)
    }

    async fn update_status_interval(&self) -> anyhow::Result<std::time::Duration> {
        Ok(self.inner.lock().await.update_status_interval)
    }

    async fn set_update_status_interval(&self, interval: std::time::Duration) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(PlatformCall::SetUpdateStatusInterval(interval));
        inner.update_status_interval = interval;
        Ok(())
    }
}
