// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

pub mod artifacts;
pub mod convergence;
pub mod juju_impl;
pub mod manifest;
pub mod orchestrator;
pub mod remote;
pub mod scheduler;
pub mod simulated;
#[cfg(test)]
pub mod test_utils;
pub mod transaction;
pub mod verify;

use slurmd_deploy_api::relation::PlannedRelation;
use slurmd_deploy_api::service::ServiceDescriptor;
use slurmd_deploy_api::status::ConvergenceTarget;

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub enum PlatformType {
    /// Juju controller reached through the `juju` command-line client.
    Juju,
    /// In-process platform mimicking the slurm charms, for dry runs.
    Simulated,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct GeneralSettings {
    pub platform: PlatformType,
    /// Juju model, the current one if empty.
    #[serde(default)]
    pub model: String,
    /// Charm metadata.yaml declaring the resources. Optional.
    #[serde(default)]
    pub manifest: Option<String>,
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ConvergenceSettings {
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub idle_period_ms: u64,
    /// Update-status interval while waiting for convergence, 0 to leave it
    /// unchanged.
    #[serde(default)]
    pub fast_forward_interval_ms: u64,
}

impl Default for ConvergenceSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            idle_period_ms: 15_000,
            fast_forward_interval_ms: 10_000,
        }
    }
}

impl ConvergenceSettings {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.idle_period_ms)
    }

    pub fn fast_forward_interval(&self) -> Option<std::time::Duration> {
        match self.fast_forward_interval_ms {
            0 => None,
            val => Some(std::time::Duration::from_millis(val)),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct SlurmdDeploySettings {
    pub general: GeneralSettings,
    #[serde(default)]
    pub convergence: ConvergenceSettings,
    #[serde(default)]
    pub retry: remote::RetrySettings,
    #[serde(default)]
    pub artifacts: Vec<artifacts::ArtifactSettings>,
    #[serde(default)]
    pub markers: Vec<artifacts::MarkerSettings>,
    pub services: Vec<ServiceDescriptor>,
    #[serde(default)]
    pub relations: Vec<PlannedRelation>,
    #[serde(default)]
    pub targets: Vec<ConvergenceTarget>,
    #[serde(default)]
    pub checks: Vec<verify::CheckSettings>,
}

impl SlurmdDeploySettings {
    /// Local files created by a run: artifacts and markers.
    pub fn local_files(&self) -> Vec<String> {
        self.artifacts
            .iter()
            .map(|x| x.path.clone())
            .filter(|x| !x.is_empty())
            .chain(self.markers.iter().map(|x| x.path.clone()))
            .collect()
    }
}

pub async fn slurmd_deploy_main(settings: SlurmdDeploySettings) -> anyhow::Result<orchestrator::DeploymentReport> {
    log::info!("Starting the slurmd deployment on the {:?} platform", settings.general.platform);
    log::debug!("Settings: {:?}", settings);

    let platform: Box<dyn slurmd_deploy_api::platform::PlatformAPI> = match settings.general.platform {
        PlatformType::Juju => Box::new(juju_impl::JujuPlatform::new(&settings.general.model)),
        PlatformType::Simulated => Box::new(simulated::SimulatedPlatform::with_slurm_topology().await),
    };
    let cache = artifacts::ArtifactCache::new(Box::new(artifacts::HttpArtifactSource::new()));

    let mut orchestrator = orchestrator::Orchestrator::new(settings, platform, cache);
    let report = orchestrator.run().await?;
    log::info!("{}", report);
    Ok(report)
}

pub fn slurmd_deploy_default_conf() -> String {
    String::from(
        r##"[general]
platform = "Juju"
model = ""
rollback_on_failure = true

[convergence]
poll_interval_ms = 2000
idle_period_ms = 15000
fast_forward_interval_ms = 10000

[retry]
max_attempts = 3
initial_backoff_ms = 1000
multiplier = 2
max_backoff_ms = 10000

[[artifacts]]
name = "nhc"
url = "https://github.com/mej/nhc/releases/download/1.4.3/lbnl-nhc-1.4.3.tar.gz"
path = "lbnl-nhc-1.4.3.tar.gz"

[[artifacts]]
name = "etcd"
url = "https://github.com/etcd-io/etcd/releases/download/v3.5.0/etcd-v3.5.0-linux-amd64.tar.gz"
path = "etcd-v3.5.0-linux-amd64.tar.gz"

[[markers]]
path = "version"
content = "v1.0.0"

[[services]]
name = "slurmctld"
charm = "slurmctld"
channel = "edge"
series = "focal"
attach = { etcd = "" }

[[services]]
name = "slurmdbd"
charm = "slurmdbd"
channel = "edge"
series = "focal"

[[services]]
name = "mysql"
charm = "percona-cluster"
channel = "edge"
series = "bionic"

[[services]]
name = "slurmd"
charm = "slurmd"
build_path = "."
series = "focal"
resources = { nhc = "" }
attach = { nhc = "" }
deploy_after = [ { service = "slurmctld", status = "blocked", timeout_ms = 1000000 } ]

[[relations]]
a = "slurmctld"
b = "slurmdbd"

[[relations]]
a = "slurmdbd"
b = "mysql"

[[relations]]
a = "slurmd"
b = "slurmctld"
after = [ { service = "slurmctld", status = "blocked", timeout_ms = 1000000 } ]

[[targets]]
service = "slurmd"
status = "active"
timeout_ms = 1000000

[[checks]]
type = "status"
service = "slurmd"
status = "active"

[[checks]]
type = "action"
service = "slurmd"
action = "mpi-install"
result_key = "installation"

[[checks]]
type = "command"
service = "slurmd"
command = "mpirun --version"
contains = "Version:"

[[checks]]
type = "command"
service = "slurmd"
command = "systemctl is-active slurmd"
equals = "active"

[[checks]]
type = "command"
service = "slurmd"
command = "systemctl is-active munge"
equals = "active"
"##,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_conf_parses() {
        let settings: SlurmdDeploySettings = toml::from_str(&slurmd_deploy_default_conf()).unwrap();

        assert!(matches!(settings.general.platform, PlatformType::Juju));
        assert!(settings.general.rollback_on_failure);
        assert_eq!(4, settings.services.len());
        assert_eq!(3, settings.relations.len());
        assert_eq!(5, settings.checks.len());
        assert_eq!(Some(std::time::Duration::from_secs(10)), settings.convergence.fast_forward_interval());
        assert_eq!(
            vec!["lbnl-nhc-1.4.3.tar.gz".to_string(), "etcd-v3.5.0-linux-amd64.tar.gz".to_string(), "version".to_string()],
            settings.local_files()
        );

        let slurmd = settings.services.iter().find(|x| x.name == "slurmd").unwrap();
        assert_eq!(Some(".".to_string()), slurmd.build_path);
        assert_eq!(1, slurmd.num_units);
        assert_eq!("slurmctld", slurmd.deploy_after[0].service);
        assert_eq!(std::time::Duration::from_secs(1000), settings.targets[0].timeout());

        let plan = scheduler::plan(&settings.services, &settings.relations, &settings.targets).unwrap();
        assert_eq!(6, plan.waves.len());
    }

    #[test]
    fn minimal_conf_uses_defaults() {
        let settings: SlurmdDeploySettings = toml::from_str(
            r##"
[general]
platform = "Simulated"

[[services]]
name = "slurmd"
charm = "slurmd"
series = "focal"
"##,
        )
        .unwrap();
        assert!(settings.general.rollback_on_failure);
        assert_eq!(2000, settings.convergence.poll_interval_ms);
        assert_eq!(3, settings.retry.max_attempts);
        assert!(settings.relations.is_empty());
        assert!(settings.local_files().is_empty());
    }
}
