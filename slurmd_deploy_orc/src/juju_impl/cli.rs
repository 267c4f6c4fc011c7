// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use slurmd_deploy_api::action::ActionResult;
use slurmd_deploy_api::relation::RelationEdge;
use slurmd_deploy_api::service::ServiceDescriptor;
use slurmd_deploy_api::status::StatusSnapshot;

const UPDATE_STATUS_KEY: &str = "update-status-hook-interval";

pub struct JujuPlatform {
    juju: String,
    charmcraft: String,
    model: Option<String>,
}

/// Arguments of `juju deploy` for a service.
pub fn deploy_args(service: &ServiceDescriptor) -> Vec<String> {
    let mut args = vec![
        "deploy".to_string(),
        service.charm.clone(),
        service.name.clone(),
        "--num-units".to_string(),
        service.num_units.to_string(),
        "--series".to_string(),
        service.series.clone(),
    ];
    if let Some(channel) = &service.channel {
        args.push("--channel".to_string());
        args.push(channel.clone());
    }
    for (name, path) in &service.resources {
        args.push("--resource".to_string());
        args.push(format!("{}={}", name, path));
    }
    args
}

impl JujuPlatform {
    /// Client of the given model, or of the current one if empty.
    pub fn new(model: &str) -> Self {
        Self {
            juju: "juju".to_string(),
            charmcraft: "charmcraft".to_string(),
            model: match model {
                "" => None,
                val => Some(val.to_string()),
            },
        }
    }

    /// Use another `juju` executable, e.g., a wrapper or a snap alias.
    pub fn with_juju_binary(mut self, juju: &str) -> Self {
        self.juju = juju.to_string();
        self
    }

    // The child is killed when the request is dropped, e.g., on a timeout.
    fn juju_command(&self, args: &[String]) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.juju);
        cmd.kill_on_drop(true);
        if let Some((subcommand, rest)) = args.split_first() {
            cmd.arg(subcommand);
            if let Some(model) = &self.model {
                cmd.arg("--model").arg(model);
            }
            cmd.args(rest);
        }
        cmd.stdout(std::process::Stdio::piped()).stderr(std::process::Stdio::piped());
        cmd
    }

    async fn juju(&self, args: &[String]) -> anyhow::Result<String> {
        log::debug!("juju {}", args.join(" "));
        run(self.juju_command(args)).await
    }
}

async fn command_output(mut cmd: tokio::process::Command) -> anyhow::Result<std::process::Output> {
    let program = cmd.as_std().get_program().to_string_lossy().to_string();
    cmd.output().await.map_err(|err| anyhow::anyhow!("could not run {}: {}", program, err))
}

async fn run(cmd: tokio::process::Command) -> anyhow::Result<String> {
    let program = cmd.as_std().get_program().to_string_lossy().to_string();
    let output = command_output(cmd).await?;
    if !output.status.success() {
        anyhow::bail!("{} failed ({}): {}", program, output.status, String::from_utf8_lossy(&output.stderr).trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[async_trait::async_trait]
impl slurmd_deploy_api::platform::PlatformAPI for JujuPlatform {
    async fn build_charm(&self, path: &str) -> anyhow::Result<String> {
        let mut cmd = tokio::process::Command::new(&self.charmcraft);
        cmd.arg("pack")
            .current_dir(path)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        run(cmd).await?;

        // charmcraft names the package after the charm and its bases.
        let mut newest: Option<(std::time::SystemTime, std::path::PathBuf)> = None;
        let mut entries = tokio::fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let entry_path = entry.path();
            if entry_path.extension().map(|x| x != "charm").unwrap_or(true) {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            if newest.as_ref().map(|(time, _)| modified > *time).unwrap_or(true) {
                newest = Some((modified, entry_path));
            }
        }
        match newest {
            Some((_, package)) => {
                log::info!("built {}", package.display());
                Ok(package.to_string_lossy().to_string())
            }
            None => anyhow::bail!("no charm package found in {} after packing", path),
        }
    }

    async fn deploy(&self, service: &ServiceDescriptor) -> anyhow::Result<()> {
        self.juju(&deploy_args(service)).await.map(|_| ())
    }

    async fn attach_resource(&self, service: &str, resource: &str, path: &str) -> anyhow::Result<()> {
        self.juju(&["attach-resource".to_string(), service.to_string(), format!("{}={}", resource, path)])
            .await
            .map(|_| ())
    }

    async fn add_relation(&self, edge: &RelationEdge) -> anyhow::Result<()> {
        let (a, b) = edge.endpoints();
        self.juju(&["relate".to_string(), a.to_string(), b.to_string()]).await.map(|_| ())
    }

    async fn remove_relation(&self, edge: &RelationEdge) -> anyhow::Result<()> {
        let (a, b) = edge.endpoints();
        self.juju(&["remove-relation".to_string(), a.to_string(), b.to_string()]).await.map(|_| ())
    }

    async fn remove_service(&self, service: &str) -> anyhow::Result<()> {
        self.juju(&[
            "remove-application".to_string(),
            service.to_string(),
            "--force".to_string(),
            "--no-wait".to_string(),
        ])
        .await
        .map(|_| ())
    }

    async fn status(&self) -> anyhow::Result<StatusSnapshot> {
        let output = self.juju(&["status".to_string(), "--format=json".to_string()]).await?;
        super::parse::parse_status(&output)
    }

    async fn run_action(&self, unit: &str, action: &str) -> anyhow::Result<ActionResult> {
        let args = ["run".to_string(), unit.to_string(), action.to_string(), "--format=json".to_string()];
        log::debug!("juju {}", args.join(" "));
        let output = command_output(self.juju_command(&args)).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        // A failed action also exits with an error, but still reports its outcome.
        match super::parse::parse_action(unit, action, &stdout) {
            Ok(result) => Ok(result),
            Err(_) if !output.status.success() => {
                anyhow::bail!("juju run failed ({}): {}", output.status, String::from_utf8_lossy(&output.stderr).trim())
            }
            Err(err) => Err(err),
        }
    }

    async fn ssh(&self, unit: &str, command: &str) -> anyhow::Result<String> {
        self.juju(&["ssh".to_string(), unit.to_string(), command.to_string()]).await
    }

    async fn update_status_interval(&self) -> anyhow::Result<std::time::Duration> {
        let output = self.juju(&["model-config".to_string(), UPDATE_STATUS_KEY.to_string()]).await?;
        super::parse::parse_duration(&output)
    }

    async fn set_update_status_interval(&self, interval: std::time::Duration) -> anyhow::Result<()> {
        self.juju(&[
            "model-config".to_string(),
            format!("{}={}", UPDATE_STATUS_KEY, super::parse::format_duration(interval)),
        ])
        .await
        .map(|_| ())
    }
}
