// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use crate::artifacts::ArtifactCache;
use crate::convergence::WaitOptions;
use crate::scheduler::{DeploymentPlan, Step};
use crate::transaction::TransactionLog;
use crate::verify::CheckOutcome;
use crate::SlurmdDeploySettings;
use slurmd_deploy_api::platform::PlatformAPI;
use slurmd_deploy_api::service::ServiceDescriptor;
use slurmd_deploy_api::status::StatusSnapshot;

#[derive(Debug, Clone)]
pub struct DeploymentReport {
    pub run_id: uuid::Uuid,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub completed: Vec<Step>,
    pub snapshot: StatusSnapshot,
    pub checks: Vec<CheckOutcome>,
}

impl std::fmt::Display for DeploymentReport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(
            f,
            "run {} completed {} steps in {}s",
            self.run_id,
            self.completed.len(),
            (self.finished_at - self.started_at).num_seconds()
        )?;
        for (name, status) in &self.snapshot.services {
            writeln!(f, "  {}: {} {}", name, status.status, status.message)?;
        }
        for check in &self.checks {
            writeln!(f, "  verified {}", check)?;
        }
        Ok(())
    }
}

fn descriptor<'a>(services: &'a std::collections::HashMap<String, ServiceDescriptor>, name: &str) -> anyhow::Result<&'a ServiceDescriptor> {
    match services.get(name) {
        Some(val) => Ok(val),
        None => Err(anyhow::anyhow!("unknown service {}", name)),
    }
}

pub struct Orchestrator {
    settings: SlurmdDeploySettings,
    platform: Box<dyn PlatformAPI>,
    cache: ArtifactCache,
    // Resource name -> local path of the artifacts fetched.
    artifact_paths: std::collections::HashMap<String, String>,
    log: TransactionLog,
}

impl Orchestrator {
    pub fn new(settings: SlurmdDeploySettings, platform: Box<dyn PlatformAPI>, cache: ArtifactCache) -> Self {
        Self {
            settings,
            platform,
            cache,
            artifact_paths: std::collections::HashMap::new(),
            log: TransactionLog::new(),
        }
    }

    pub fn transaction_log(&self) -> &TransactionLog {
        &self.log
    }

    pub fn platform(&self) -> &dyn PlatformAPI {
        self.platform.as_ref()
    }

    /// Fetch all the artifacts and write the marker files.
    pub async fn prepare_artifacts(&mut self) -> anyhow::Result<()> {
        let manifest = match &self.settings.general.manifest {
            Some(path) if !path.is_empty() => Some(crate::manifest::ResourceManifest::from_file(path)?),
            _ => None,
        };

        let mut paths = vec![];
        for artifact in &self.settings.artifacts {
            let path = match &manifest {
                Some(manifest) => manifest.resolve_path(&artifact.name, &artifact.path)?,
                None if artifact.path.is_empty() => anyhow::bail!("no path for artifact {} and no resource manifest", artifact.name),
                None => artifact.path.clone(),
            };
            paths.push(path);
        }

        let fetches = self
            .settings
            .artifacts
            .iter()
            .zip(paths.iter())
            .map(|(artifact, path)| self.cache.fetch_artifact(&artifact.url, path, artifact.sha256.as_deref()));
        for (artifact, res) in self.settings.artifacts.iter().zip(futures::future::join_all(fetches).await) {
            let path = res?;
            log::info!("artifact {} available at {}", artifact.name, path.display());
            self.artifact_paths.insert(artifact.name.clone(), path.to_string_lossy().to_string());
        }

        for marker in &self.settings.markers {
            crate::artifacts::write_marker(marker).await?;
        }
        Ok(())
    }

    /// Service descriptors with empty resource paths replaced by the path of
    /// the artifact with the same name.
    pub fn resolved_services(&self) -> anyhow::Result<Vec<ServiceDescriptor>> {
        let resolve = |service: &str, resources: &mut std::collections::BTreeMap<String, String>| -> anyhow::Result<()> {
            for (name, path) in resources.iter_mut() {
                if path.is_empty() {
                    *path = match self.artifact_paths.get(name) {
                        Some(val) => val.clone(),
                        None => anyhow::bail!("resource {} of {} has no path and no artifact", name, service),
                    };
                }
            }
            Ok(())
        };
        let mut services = self.settings.services.clone();
        for service in &mut services {
            resolve(&service.name, &mut service.resources)?;
            resolve(&service.name, &mut service.attach)?;
        }
        Ok(services)
    }

    pub fn plan(&self) -> anyhow::Result<DeploymentPlan> {
        crate::scheduler::plan(&self.resolved_services()?, &self.settings.relations, &self.settings.targets)
    }

    async fn execute_step(&self, services: &std::collections::HashMap<String, ServiceDescriptor>, step: &Step) -> anyhow::Result<()> {
        match step {
            Step::Deploy(name) => {
                let mut descriptor = descriptor(services, name)?.clone();
                if let Some(path) = &descriptor.build_path {
                    log::info!("building the charm of {} from {}", name, path);
                    descriptor.charm = self.platform.build_charm(path).await?;
                }
                log::info!("deploying {}", descriptor);
                self.platform.deploy(&descriptor).await
            }
            Step::Attach(name, resource) => {
                let path = match descriptor(services, name)?.attach.get(resource) {
                    Some(val) => val.clone(),
                    None => anyhow::bail!("no resource {} to attach to {}", resource, name),
                };
                log::info!("attaching {} ({}) to {}", resource, path, name);
                self.platform.attach_resource(name, resource, &path).await
            }
            Step::Relate(edge) => {
                log::info!("relating {}", edge);
                self.platform.add_relation(edge).await
            }
            Step::Converge(target) => {
                let options = WaitOptions::new(target.timeout(), self.settings.convergence.poll_interval())
                    .with_idle_period(self.settings.convergence.idle_period());
                crate::convergence::wait_for_status(self.platform.as_ref(), std::slice::from_ref(target), options)
                    .await
                    .map(|_| ())
            }
        }
    }

    async fn execute_wave(&self, services: &std::collections::HashMap<String, ServiceDescriptor>, steps: &[&Step]) -> Vec<anyhow::Result<()>> {
        let requests = futures::future::join_all(steps.iter().map(|step| self.execute_step(services, step)));
        let converging = steps.iter().any(|x| matches!(x, Step::Converge(_)));
        match self.settings.convergence.fast_forward_interval() {
            Some(interval) if converging => {
                match crate::convergence::with_fast_forward(self.platform.as_ref(), interval, async { Ok(requests.await) }).await {
                    Ok(results) => results,
                    Err(err) => vec![Err(err)],
                }
            }
            _ => requests.await,
        }
    }

    /// Execute the deployment plan wave by wave.
    ///
    /// If a step fails, the steps completed so far are undone in reverse
    /// order (unless disabled in the settings) and the first error is
    /// returned.
    pub async fn deploy(&mut self) -> anyhow::Result<StatusSnapshot> {
        let plan = self.plan()?;
        log::info!("deployment plan:\n{}", plan);
        let services: std::collections::HashMap<String, ServiceDescriptor> = self.resolved_services()?.into_iter().map(|x| (x.name.clone(), x)).collect();

        for (i, wave) in plan.waves.iter().enumerate() {
            let steps: Vec<&Step> = wave.iter().map(|x| &plan.steps[*x]).collect();
            log::info!("wave {}/{}: {} steps", i + 1, plan.waves.len(), steps.len());

            let results = self.execute_wave(&services, &steps).await;
            let mut first_error = None;
            for (step, res) in steps.iter().zip(results) {
                match res {
                    Ok(_) => self.log.record((*step).clone()),
                    Err(err) => {
                        log::error!("{} failed: {}", step, err);
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }

            if let Some(err) = first_error {
                if self.settings.general.rollback_on_failure {
                    log::warn!("rolling back {} completed steps", self.log.entries().len());
                    let undone = self.log.rollback(self.platform.as_ref()).await;
                    log::info!("rolled back {} steps", undone.len());
                }
                return Err(err);
            }
        }

        self.platform.status().await
    }

    pub async fn verify(&self) -> anyhow::Result<Vec<CheckOutcome>> {
        crate::verify::run_checks(self.platform.as_ref(), &self.settings.checks, &self.settings.retry).await
    }

    /// Fetch the artifacts, deploy the topology and verify it.
    ///
    /// A failed verification leaves the deployment in place.
    pub async fn run(&mut self) -> anyhow::Result<DeploymentReport> {
        let run_id = uuid::Uuid::new_v4();
        let started_at = chrono::Utc::now();
        log::info!("deployment run {} started", run_id);

        self.prepare_artifacts().await?;
        let snapshot = self.deploy().await?;
        let checks = self.verify().await?;

        Ok(DeploymentReport {
            run_id,
            started_at,
            finished_at: chrono::Utc::now(),
            completed: self.log.steps(),
            snapshot,
            checks,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::simulated::{PlatformCall, ServiceBehaviour, SimulatedPlatform};
    use slurmd_deploy_api::error::DeployError;
    use slurmd_deploy_api::relation::RelationEdge;
    use slurmd_deploy_api::status::WorkloadStatus;

    struct StaticSource {}

    #[async_trait::async_trait]
    impl crate::artifacts::ArtifactSource for StaticSource {
        async fn download(&self, url: &str) -> anyhow::Result<Vec<u8>> {
            Ok(format!("content of {}", url).into_bytes())
        }
    }

    fn temp_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("slurmd-deploy-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn settings(dir: &std::path::Path) -> SlurmdDeploySettings {
        let mut settings: SlurmdDeploySettings = toml::from_str(&crate::slurmd_deploy_default_conf()).unwrap();
        settings.general.platform = crate::PlatformType::Simulated;
        settings.convergence = crate::ConvergenceSettings {
            poll_interval_ms: 1,
            idle_period_ms: 0,
            fast_forward_interval_ms: 10_000,
        };
        settings.retry.initial_backoff_ms = 1;
        for artifact in &mut settings.artifacts {
            artifact.path = dir.join(&artifact.path).to_string_lossy().to_string();
        }
        for marker in &mut settings.markers {
            marker.path = dir.join(&marker.path).to_string_lossy().to_string();
        }
        settings
    }

    fn with_gate_timeout(mut settings: SlurmdDeploySettings, timeout_ms: u64) -> SlurmdDeploySettings {
        for service in &mut settings.services {
            for gate in &mut service.deploy_after {
                gate.timeout_ms = timeout_ms;
            }
        }
        for relation in &mut settings.relations {
            for gate in &mut relation.after {
                gate.timeout_ms = timeout_ms;
            }
        }
        settings
    }

    fn orchestrator(settings: SlurmdDeploySettings, platform: &SimulatedPlatform) -> Orchestrator {
        Orchestrator::new(
            settings,
            Box::new(platform.clone()),
            crate::artifacts::ArtifactCache::new(Box::new(StaticSource {})),
        )
    }

    fn compute_relation() -> RelationEdge {
        RelationEdge::new("slurmd", "slurmctld")
    }

    #[tokio::test]
    async fn full_run() {
        crate::test_utils::init_logger();
        let dir = temp_dir();
        let platform = SimulatedPlatform::with_slurm_topology().await;
        let mut orchestrator = orchestrator(settings(&dir), &platform);

        let report = orchestrator.run().await.unwrap();

        assert_eq!(WorkloadStatus::Active, report.snapshot.service("slurmd").unwrap().status);
        assert_eq!(5, report.checks.len());
        assert_eq!(11, report.completed.len());
        assert_eq!("v1.0.0", std::fs::read_to_string(dir.join("version")).unwrap());
        assert!(dir.join("lbnl-nhc-1.4.3.tar.gz").exists());

        let calls = platform.calls().await;
        let relation_requested = calls
            .iter()
            .find_map(|x| match x {
                PlatformCall::AddRelation(edge, statuses) if *edge == compute_relation() => Some(statuses.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(Some(&WorkloadStatus::Blocked), relation_requested.get("slurmctld"));

        // The compute node is deployed only once the controller is blocked.
        let deploy_pos = calls.iter().position(|x| *x == PlatformCall::Deploy("slurmd".to_string())).unwrap();
        let etcd_pos = calls
            .iter()
            .position(|x| *x == PlatformCall::AttachResource("slurmctld".to_string(), "etcd".to_string()))
            .unwrap();
        assert!(etcd_pos < deploy_pos);
        assert!(calls.contains(&PlatformCall::BuildCharm(".".to_string())));

        // Update-status interval shortened and restored.
        assert_eq!(
            Some(&PlatformCall::SetUpdateStatusInterval(std::time::Duration::from_secs(300))),
            calls.iter().filter(|x| matches!(x, PlatformCall::SetUpdateStatusInterval(_))).last()
        );
        assert_eq!(std::time::Duration::from_secs(300), platform.update_status_interval().await.unwrap());

        crate::artifacts::cleanup_artifacts(&orchestrator.settings.local_files());
        assert!(!dir.join("version").exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn transient_controller_never_related() {
        crate::test_utils::init_logger();
        let dir = temp_dir();
        let platform = SimulatedPlatform::with_slurm_topology().await;
        platform.set_behaviour("slurmctld", ServiceBehaviour::transient_forever()).await;
        let mut orchestrator = orchestrator(with_gate_timeout(settings(&dir), 200), &platform);

        let err = orchestrator.run().await.unwrap_err();

        match err.downcast_ref::<DeployError>() {
            Some(err @ DeployError::ConvergenceTimeout { .. }) => assert_eq!(vec!["slurmctld".to_string()], err.unmet_services()),
            _ => panic!("unexpected error: {}", err),
        }
        let calls = platform.calls().await;
        assert!(!calls.iter().any(|x| matches!(x, PlatformCall::AddRelation(edge, _) if *edge == compute_relation())));
        assert!(!calls.contains(&PlatformCall::Deploy("slurmd".to_string())));

        // Everything deployed so far has been removed.
        assert!(platform.services().await.is_empty());
        assert!(platform.relations().await.is_empty());
        assert!(orchestrator.transaction_log().entries().is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn failure_without_rollback() {
        crate::test_utils::init_logger();
        let dir = temp_dir();
        let platform = SimulatedPlatform::with_slurm_topology().await;
        platform.set_behaviour("slurmctld", ServiceBehaviour::transient_forever()).await;
        let mut settings = with_gate_timeout(settings(&dir), 50);
        settings.general.rollback_on_failure = false;
        let mut orchestrator = orchestrator(settings, &platform);

        assert!(orchestrator.run().await.is_err());

        assert_eq!(vec!["mysql", "slurmctld", "slurmdbd"], platform.services().await);
        assert_eq!(2, platform.relations().await.len());
        assert_eq!(6, orchestrator.transaction_log().entries().len());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn rollback_keeps_foreign_services() {
        crate::test_utils::init_logger();
        let dir = temp_dir();
        let platform = SimulatedPlatform::with_slurm_topology().await;
        platform.deploy(&ServiceDescriptor::new("mysql", "mysql-k8s", "jammy")).await.unwrap();
        let mut orchestrator = orchestrator(settings(&dir), &platform);

        let err = orchestrator.run().await.unwrap_err();

        assert!(err.to_string().contains("already exists"));
        assert_eq!(vec!["mysql"], platform.services().await);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn unresolved_resource_rejected() {
        crate::test_utils::init_logger();
        let dir = temp_dir();
        let mut settings = settings(&dir);
        settings.artifacts.retain(|x| x.name != "nhc");
        let mut orchestrator = orchestrator(settings, &SimulatedPlatform::new());

        orchestrator.prepare_artifacts().await.unwrap();
        let err = orchestrator.plan().unwrap_err();
        assert!(err.to_string().contains("nhc"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
