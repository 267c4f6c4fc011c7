// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

#[cfg(test)]
mod tests {
    use slurmd_deploy_api::error::DeployError;
    use slurmd_deploy_api::platform::PlatformAPI;
    use slurmd_deploy_api::status::{ConvergenceTarget, WorkloadStatus};
    use slurmd_deploy_orc::orchestrator::Orchestrator;
    use slurmd_deploy_orc::simulated::{PlatformCall, SimulatedPlatform};
    use slurmd_deploy_orc::SlurmdDeploySettings;

    // Shared by all the scenarios, like the working directory of a test session.
    const CACHE_DIR: &str = "slurmd-deploy-systemtests";

    struct CountingSource {
        downloads: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl slurmd_deploy_orc::artifacts::ArtifactSource for CountingSource {
        async fn download(&self, url: &str) -> anyhow::Result<Vec<u8>> {
            self.downloads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(format!("downloaded from {}", url).into_bytes())
        }
    }

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn cache_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(CACHE_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn settings() -> SlurmdDeploySettings {
        let dir = cache_dir();
        let mut settings: SlurmdDeploySettings = toml::from_str(&slurmd_deploy_orc::slurmd_deploy_default_conf()).unwrap();
        settings.general.platform = slurmd_deploy_orc::PlatformType::Simulated;
        settings.convergence.poll_interval_ms = 1;
        settings.convergence.idle_period_ms = 0;
        settings.retry.initial_backoff_ms = 1;
        for artifact in &mut settings.artifacts {
            artifact.path = dir.join(&artifact.path).to_string_lossy().to_string();
        }
        for marker in &mut settings.markers {
            marker.path = dir.join(&marker.path).to_string_lossy().to_string();
        }
        settings
    }

    async fn setup(settings: SlurmdDeploySettings) -> (Orchestrator, SimulatedPlatform, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
        init_logger();
        let platform = SimulatedPlatform::with_slurm_topology().await;
        let downloads = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let orchestrator = Orchestrator::new(
            settings,
            Box::new(platform.clone()),
            slurmd_deploy_orc::artifacts::ArtifactCache::new(Box::new(CountingSource {
                downloads: downloads.clone(),
            })),
        );
        (orchestrator, platform, downloads)
    }

    fn teardown(settings: &SlurmdDeploySettings) {
        slurmd_deploy_orc::artifacts::cleanup_artifacts(&settings.local_files());
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn controller_subgraph_blocked() {
        let mut settings = settings();
        settings.services.retain(|x| x.name != "slurmd");
        settings.relations.retain(|x| x.a != "slurmd" && x.b != "slurmd");
        settings.targets = vec![ConvergenceTarget::new(
            "slurmctld",
            WorkloadStatus::Blocked,
            std::time::Duration::from_secs(1000),
        )];
        settings.checks.clear();
        let (mut orchestrator, platform, _) = setup(settings.clone()).await;

        let report = orchestrator.run().await.unwrap();

        let controller = report.snapshot.service("slurmctld").unwrap();
        assert_eq!(WorkloadStatus::Blocked, controller.status);
        assert_eq!("Need relations: slurmd", controller.message);
        assert_eq!(vec!["mysql", "slurmctld", "slurmdbd"], platform.services().await);
        assert_eq!(2, platform.relations().await.len());
        assert!(platform
            .calls()
            .await
            .contains(&PlatformCall::AttachResource("slurmctld".to_string(), "etcd".to_string())));

        teardown(&settings);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn compute_node_active() {
        let settings = settings();
        let (mut orchestrator, platform, _) = setup(settings.clone()).await;

        orchestrator.prepare_artifacts().await.unwrap();
        let snapshot = orchestrator.deploy().await.unwrap();

        let compute = snapshot.service("slurmd").unwrap();
        assert_eq!(WorkloadStatus::Active, compute.status);
        assert_eq!(WorkloadStatus::Active, compute.units["slurmd/0"].workload_status);
        assert_eq!(4, platform.services().await.len());
        assert_eq!(3, platform.relations().await.len());

        teardown(&settings);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn compute_node_verified() {
        let settings = settings();
        let (mut orchestrator, platform, _) = setup(settings.clone()).await;

        let report = orchestrator.run().await.unwrap();

        let observed: std::collections::HashMap<String, String> = report.checks.iter().map(|x| (x.check.clone(), x.observed.clone())).collect();
        assert!(observed["action mpi-install on slurmd"].contains("Successfully installed"));
        assert!(observed["command 'mpirun --version' on slurmd"].contains("Version:"));
        assert_eq!("active", observed["command 'systemctl is-active slurmd' on slurmd"]);
        assert_eq!("active", observed["command 'systemctl is-active munge' on slurmd"]);
        assert!(platform
            .calls()
            .await
            .contains(&PlatformCall::RunAction("slurmd/0".to_string(), "mpi-install".to_string())));

        teardown(&settings);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn missing_resource_blocks_compute_node() {
        let mut settings = settings();
        for service in &mut settings.services {
            if service.name == "slurmd" {
                service.resources.clear();
                service.attach.clear();
            }
        }
        settings.targets[0].timeout_ms = 300;
        settings.general.rollback_on_failure = false;
        let (mut orchestrator, platform, _) = setup(settings.clone()).await;

        let err = orchestrator.run().await.unwrap_err();

        let unmet = match err.downcast_ref::<DeployError>() {
            Some(DeployError::ConvergenceTimeout { unmet, .. }) => unmet.clone(),
            _ => panic!("unexpected error: {}", err),
        };
        assert_eq!(1, unmet.len());
        assert_eq!("slurmd", unmet[0].target.service);
        let observed = unmet[0].observed.clone().unwrap();
        assert_eq!(WorkloadStatus::Blocked, observed.status);
        assert_eq!("Missing resource: nhc", observed.message);

        let snapshot = platform.status().await.unwrap();
        assert_eq!(WorkloadStatus::Blocked, snapshot.service("slurmd").unwrap().status);

        teardown(&settings);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn cached_artifacts_not_downloaded_again() {
        let settings = settings();
        teardown(&settings);

        let (mut orchestrator, _, downloads) = setup(settings.clone()).await;
        orchestrator.prepare_artifacts().await.unwrap();
        assert_eq!(2, downloads.load(std::sync::atomic::Ordering::SeqCst));

        let (mut orchestrator, _, downloads) = setup(settings.clone()).await;
        orchestrator.prepare_artifacts().await.unwrap();
        assert_eq!(0, downloads.load(std::sync::atomic::Ordering::SeqCst));

        teardown(&settings);
        for path in settings.local_files() {
            assert!(!std::path::Path::new(&path).exists());
        }
    }

    /// Requires a bootstrapped Juju controller with an empty model named
    /// `test-slurmd` and charmcraft, run from the slurmd charm directory.
    #[tokio::test]
    #[serial_test::serial]
    #[ignore]
    async fn live_juju_deployment() {
        init_logger();
        let mut settings: SlurmdDeploySettings = toml::from_str(&slurmd_deploy_orc::slurmd_deploy_default_conf()).unwrap();
        settings.general.model = "test-slurmd".to_string();

        let report = slurmd_deploy_orc::slurmd_deploy_main(settings.clone()).await.unwrap();
        log::info!("{}", report);
        assert_eq!(WorkloadStatus::Active, report.snapshot.service("slurmd").unwrap().status);

        teardown(&settings);
    }
}
