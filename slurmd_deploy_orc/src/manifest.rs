// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct ResourceDeclaration {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Resource section of a charm's `metadata.yaml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct ResourceManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub resources: std::collections::BTreeMap<String, ResourceDeclaration>,
}

impl ResourceManifest {
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str::<ResourceManifest>(content)?)
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| anyhow::anyhow!("could not read resource manifest {}: {}", path, err))?;
        Self::from_yaml(&content)
    }

    /// Expected filename of a file resource.
    pub fn filename(&self, resource: &str) -> Option<&str> {
        let declaration = self.resources.get(resource)?;
        if declaration.resource_type != "file" {
            return None;
        }
        declaration.filename.as_deref()
    }

    /// Resolve the local path of an artifact: the configured path if any,
    /// otherwise the filename declared in the manifest.
    pub fn resolve_path(&self, resource: &str, configured: &str) -> anyhow::Result<String> {
        if !configured.is_empty() {
            return Ok(configured.to_string());
        }
        match self.filename(resource) {
            Some(filename) => Ok(filename.to_string()),
            None => anyhow::bail!("no path configured and no file resource '{}' in the manifest", resource),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const METADATA: &str = r##"
name: slurmd
summary: Slurm compute node daemon
series:
  - focal
resources:
  nhc:
    type: file
    filename: lbnl-nhc-1.4.3.tar.gz
    description: Node Health Check tarball
  oci-image:
    type: oci-image
    description: not a file
requires:
  slurmd:
    interface: slurmd
"##;

    #[test]
    fn test_parse_manifest() {
        let manifest = ResourceManifest::from_yaml(METADATA).unwrap();
        assert_eq!(Some("slurmd".to_string()), manifest.name);
        assert_eq!(2, manifest.resources.len());
        assert_eq!(Some("lbnl-nhc-1.4.3.tar.gz"), manifest.filename("nhc"));
        assert_eq!(None, manifest.filename("oci-image"));
        assert_eq!(None, manifest.filename("etcd"));
    }

    #[test]
    fn test_resolve_path() {
        let manifest = ResourceManifest::from_yaml(METADATA).unwrap();
        assert_eq!("lbnl-nhc-1.4.3.tar.gz", manifest.resolve_path("nhc", "").unwrap());
        assert_eq!("/tmp/nhc.tgz", manifest.resolve_path("nhc", "/tmp/nhc.tgz").unwrap());
        assert!(manifest.resolve_path("etcd", "").is_err());

        let empty = ResourceManifest::from_yaml("name: slurmctld\n").unwrap();
        assert!(empty.resources.is_empty());
    }
}
