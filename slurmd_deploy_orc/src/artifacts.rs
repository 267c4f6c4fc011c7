// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use sha2::Digest;
use slurmd_deploy_api::error::DeployError;

const HASH_SUFFIX: &str = "sha256";
const PARTIAL_SUFFIX: &str = "part";

/// Remote artifact to be cached locally.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ArtifactSettings {
    /// Name of the resource in the charm metadata, e.g., `nhc`.
    pub name: String,
    pub url: String,
    /// Local path where the artifact is cached. If empty, the filename
    /// declared in the resource manifest is used.
    #[serde(default)]
    pub path: String,
    /// Expected SHA-256 of the content, hex-encoded.
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Locally generated file with fixed content.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct MarkerSettings {
    pub path: String,
    pub content: String,
}

/// Where artifacts come from.
#[async_trait::async_trait]
pub trait ArtifactSource: Sync + Send {
    async fn download(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

pub struct HttpArtifactSource {
    client: reqwest::Client,
}

impl HttpArtifactSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpArtifactSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ArtifactSource for HttpArtifactSource {
    async fn download(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Content hash of a byte buffer, hex-encoded.
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(sha2::Sha256::digest(content))
}

fn sidecar_path(path: &std::path::Path, suffix: &str) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    std::path::PathBuf::from(name)
}

/// Local cache of the artifacts used as deployment resources.
///
/// The presence of the file is the cache-hit signal. A hash of the content
/// is stored next to it so that a corrupted or replaced file is fetched
/// again.
pub struct ArtifactCache {
    source: Box<dyn ArtifactSource>,
}

impl ArtifactCache {
    pub fn new(source: Box<dyn ArtifactSource>) -> Self {
        Self { source }
    }

    /// Return `local_path`, downloading `url` into it only if needed.
    pub async fn fetch_artifact(&self, url: &str, local_path: &str, expected_sha256: Option<&str>) -> anyhow::Result<std::path::PathBuf> {
        let path = std::path::PathBuf::from(local_path);
        let hash_path = sidecar_path(&path, HASH_SUFFIX);

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let recorded = match expected_sha256 {
                Some(expected) => Some(expected.to_lowercase()),
                None => tokio::fs::read_to_string(&hash_path).await.ok().map(|x| x.trim().to_string()),
            };
            match recorded {
                None => {
                    log::debug!("artifact {} already present", local_path);
                    return Ok(path);
                }
                Some(recorded) => {
                    let content = tokio::fs::read(&path).await?;
                    let actual = content_hash(&content);
                    if actual == recorded {
                        log::debug!("artifact {} already present, hash {}", local_path, actual);
                        return Ok(path);
                    }
                    log::warn!(
                        "artifact {} has hash {} instead of {}, fetching it again from {}",
                        local_path,
                        actual,
                        recorded,
                        url
                    );
                }
            }
        }

        log::info!("fetching artifact {} into {}", url, local_path);
        let fetch_error = |reason: String| DeployError::Fetch {
            url: url.to_string(),
            path: local_path.to_string(),
            reason,
        };

        let content = self.source.download(url).await.map_err(|err| fetch_error(err.to_string()))?;
        let actual = content_hash(&content);
        if let Some(expected) = expected_sha256 {
            if actual != expected.to_lowercase() {
                return Err(DeployError::Integrity {
                    path: local_path.to_string(),
                    expected: expected.to_lowercase(),
                    actual,
                }
                .into());
            }
        }

        // The file appears under its final name only once complete.
        let partial_path = sidecar_path(&path, PARTIAL_SUFFIX);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|err| fetch_error(err.to_string()))?;
            }
        }
        tokio::fs::write(&partial_path, &content).await.map_err(|err| fetch_error(err.to_string()))?;
        tokio::fs::rename(&partial_path, &path).await.map_err(|err| fetch_error(err.to_string()))?;
        tokio::fs::write(&hash_path, &actual).await.map_err(|err| fetch_error(err.to_string()))?;

        log::info!("artifact {} stored ({} bytes, sha256 {})", local_path, content.len(), actual);
        Ok(path)
    }
}

/// Create a file with the given content, unless it already exists.
pub async fn write_marker(marker: &MarkerSettings) -> anyhow::Result<std::path::PathBuf> {
    let path = std::path::PathBuf::from(&marker.path);
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        log::debug!("marker {} already present", marker.path);
        return Ok(path);
    }
    tokio::fs::write(&path, marker.content.as_bytes()).await?;
    log::info!("marker {} created", marker.path);
    Ok(path)
}

/// Remove cached artifacts and their hash files. Missing files are ignored.
pub fn cleanup_artifacts(paths: &[String]) {
    for path in paths {
        let path = std::path::PathBuf::from(path);
        for target in [sidecar_path(&path, HASH_SUFFIX), sidecar_path(&path, PARTIAL_SUFFIX), path] {
            match std::fs::remove_file(&target) {
                Ok(_) => log::info!("removed {}", target.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => log::warn!("could not remove {}: {}", target.display(), err),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct CountingSource {
        content: Vec<u8>,
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl ArtifactSource for CountingSource {
        async fn download(&self, _url: &str) -> anyhow::Result<Vec<u8>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.content.clone())
        }
    }

    struct FailingSource {}

    #[async_trait::async_trait]
    impl ArtifactSource for FailingSource {
        async fn download(&self, url: &str) -> anyhow::Result<Vec<u8>> {
            anyhow::bail!("connection refused: {}", url)
        }
    }

    fn counting_cache(content: &[u8]) -> (ArtifactCache, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        (
            ArtifactCache::new(Box::new(CountingSource {
                content: content.to_vec(),
                calls: calls.clone(),
            })),
            calls,
        )
    }

    fn temp_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("slurmd-deploy-artifacts-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    const URL: &str = "https://github.com/mej/nhc/releases/download/1.4.3/lbnl-nhc-1.4.3.tar.gz";

    #[tokio::test]
    async fn test_fetch_once_then_cache_hit() {
        let dir = temp_dir();
        let path = dir.join("lbnl-nhc-1.4.3.tar.gz").to_str().unwrap().to_string();
        let (cache, calls) = counting_cache(b"nhc tarball");

        let ret = cache.fetch_artifact(URL, &path, None).await.unwrap();
        assert_eq!(std::path::PathBuf::from(&path), ret);
        assert_eq!(1, calls.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(b"nhc tarball".to_vec(), std::fs::read(&path).unwrap());
        assert_eq!(content_hash(b"nhc tarball"), std::fs::read_to_string(format!("{}.sha256", path)).unwrap());

        for _ in 0..3 {
            cache.fetch_artifact(URL, &path, None).await.unwrap();
        }
        assert_eq!(1, calls.load(std::sync::atomic::Ordering::SeqCst));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_existing_file_no_network() {
        let dir = temp_dir();
        let path = dir.join("preexisting.tar.gz").to_str().unwrap().to_string();
        std::fs::write(&path, b"placed by hand").unwrap();
        let (cache, calls) = counting_cache(b"remote");

        cache.fetch_artifact(URL, &path, None).await.unwrap();
        assert_eq!(0, calls.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(b"placed by hand".to_vec(), std::fs::read(&path).unwrap());

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_refetch_on_hash_mismatch() {
        let dir = temp_dir();
        let path = dir.join("nhc.tar.gz").to_str().unwrap().to_string();
        let (cache, calls) = counting_cache(b"good content");

        cache.fetch_artifact(URL, &path, None).await.unwrap();
        std::fs::write(&path, b"corrupted").unwrap();

        cache.fetch_artifact(URL, &path, None).await.unwrap();
        assert_eq!(2, calls.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(b"good content".to_vec(), std::fs::read(&path).unwrap());

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_expected_hash() {
        let dir = temp_dir();
        let path = dir.join("nhc.tar.gz").to_str().unwrap().to_string();
        let (cache, calls) = counting_cache(b"good content");

        let err = cache.fetch_artifact(URL, &path, Some("deadbeef")).await.unwrap_err();
        match err.downcast_ref::<DeployError>() {
            Some(DeployError::Integrity { expected, .. }) => assert_eq!("deadbeef", expected),
            _ => panic!("unexpected error: {}", err),
        }
        assert!(!std::path::Path::new(&path).exists());

        let expected = content_hash(b"good content").to_uppercase();
        cache.fetch_artifact(URL, &path, Some(&expected)).await.unwrap();
        cache.fetch_artifact(URL, &path, Some(&expected)).await.unwrap();
        assert_eq!(2, calls.load(std::sync::atomic::Ordering::SeqCst));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_fetch_error() {
        let dir = temp_dir();
        let path = dir.join("nhc.tar.gz").to_str().unwrap().to_string();
        let cache = ArtifactCache::new(Box::new(FailingSource {}));

        let err = cache.fetch_artifact(URL, &path, None).await.unwrap_err();
        match err.downcast_ref::<DeployError>() {
            Some(DeployError::Fetch { url, reason, .. }) => {
                assert_eq!(URL, url);
                assert!(reason.contains("connection refused"));
            }
            _ => panic!("unexpected error: {}", err),
        }
        assert!(!std::path::Path::new(&path).exists());

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_marker_and_cleanup() {
        let dir = temp_dir();
        let marker = MarkerSettings {
            path: dir.join("version").to_str().unwrap().to_string(),
            content: "v1.0.0".to_string(),
        };
        write_marker(&marker).await.unwrap();
        assert_eq!("v1.0.0", std::fs::read_to_string(&marker.path).unwrap());

        // Not overwritten.
        std::fs::write(&marker.path, "v0.9.0").unwrap();
        write_marker(&marker).await.unwrap();
        assert_eq!("v0.9.0", std::fs::read_to_string(&marker.path).unwrap());

        let artifact = dir.join("nhc.tar.gz").to_str().unwrap().to_string();
        let (cache, _) = counting_cache(b"x");
        cache.fetch_artifact(URL, &artifact, None).await.unwrap();

        let missing = dir.join("missing").to_str().unwrap().to_string();
        cleanup_artifacts(&[marker.path.clone(), artifact.clone(), missing]);
        assert!(!std::path::Path::new(&marker.path).exists());
        assert!(!std::path::Path::new(&artifact).exists());
        assert!(!std::path::Path::new(&format!("{}.sha256", artifact)).exists());

        std::fs::remove_dir_all(dir).unwrap();
    }
}
