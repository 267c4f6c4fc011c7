// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

/// Static description of one service of the topology.
///
/// A descriptor is built once from the configuration and never changes
/// afterwards: the orchestrator only hands out shared references to it.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ServiceDescriptor {
    /// Name of the service (application) within the model.
    pub name: String,

    /// Charm to deploy: a charm name resolved by the platform, or the path
    /// of a package produced by [`crate::platform::PlatformAPI::build_charm`].
    pub charm: String,

    /// Channel from which the charm is fetched, if any.
    #[serde(default)]
    pub channel: Option<String>,

    /// If set, the charm is built from this local directory before
    /// deploying and `charm` is replaced with the package produced.
    #[serde(default)]
    pub build_path: Option<String>,

    /// Series (platform tag) of the machines hosting the units.
    pub series: String,

    #[serde(default = "default_num_units")]
    pub num_units: u32,

    /// Resources bound at deploy time: resource name -> local file path.
    #[serde(default)]
    pub resources: std::collections::BTreeMap<String, String>,

    /// Resources attached once the deployment request has been accepted:
    /// resource name -> local file path.
    #[serde(default)]
    pub attach: std::collections::BTreeMap<String, String>,

    /// Targets that must be converged before this service is deployed.
    #[serde(default)]
    pub deploy_after: Vec<crate::status::ConvergenceTarget>,
}

fn default_num_units() -> u32 {
    1
}

impl ServiceDescriptor {
    pub fn new(name: &str, charm: &str, series: &str) -> Self {
        Self {
            name: name.to_string(),
            charm: charm.to_string(),
            channel: None,
            build_path: None,
            series: series.to_string(),
            num_units: 1,
            resources: std::collections::BTreeMap::new(),
            attach: std::collections::BTreeMap::new(),
            deploy_after: vec![],
        }
    }

    pub fn with_channel(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_string());
        self
    }

    pub fn with_resource(mut self, name: &str, path: &str) -> Self {
        self.resources.insert(name.to_string(), path.to_string());
        self
    }

    pub fn with_attach(mut self, name: &str, path: &str) -> Self {
        self.attach.insert(name.to_string(), path.to_string());
        self
    }

    pub fn with_deploy_after(mut self, target: crate::status::ConvergenceTarget) -> Self {
        self.deploy_after.push(target);
        self
    }

    /// Name of the first unit of this service, e.g., `slurmd/0`.
    pub fn first_unit(&self) -> String {
        format!("{}/0", self.name)
    }
}

impl std::fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "service {} (charm {}", self.name, self.charm)?;
        if let Some(channel) = &self.channel {
            write!(f, ", channel {}", channel)?;
        }
        write!(f, ", series {}, units {})", self.series, self.num_units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_descriptor_from_toml() {
        let descriptor: ServiceDescriptor = toml::from_str(
            r##"name = "slurmctld"
charm = "slurmctld"
channel = "edge"
series = "focal"
attach = { etcd = "etcd-v3.5.0-linux-amd64.tar.gz" }
"##,
        )
        .unwrap();
        assert_eq!("slurmctld", descriptor.name);
        assert_eq!(Some("edge".to_string()), descriptor.channel);
        assert_eq!(1, descriptor.num_units);
        assert!(descriptor.resources.is_empty());
        assert_eq!("etcd-v3.5.0-linux-amd64.tar.gz", descriptor.attach["etcd"]);
        assert!(descriptor.deploy_after.is_empty());
        assert_eq!("slurmctld/0", descriptor.first_unit());
    }

    #[test]
    fn test_service_descriptor_display() {
        let descriptor = ServiceDescriptor::new("mysql", "percona-cluster", "bionic").with_channel("edge");
        assert_eq!(
            "service mysql (charm percona-cluster, channel edge, series bionic, units 1)",
            descriptor.to_string()
        );
    }
}
