use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Remote source of the site directory.
pub const LOCATIONS_URL: &str = "https://www.baipiao.eu.org/cloudflare/locations";
/// Cache file name of the site directory.
pub const LOCATIONS_FILE: &str = "locations.json";

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity of one edge site as published in the locations list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct SiteIdentity {
    pub iata: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lon: f64,
    #[serde(default)]
    pub cca2: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub city: String,
}

/// Read-only lookup of site code to identity.
#[derive(Debug, Clone, Default)]
pub struct SiteDirectory {
    sites: HashMap<String, SiteIdentity>,
}

impl SiteDirectory {
    /// Parse the JSON array published by the locations source.
    pub fn from_json(raw: &str) -> Result<Self> {
        let list: Vec<SiteIdentity> =
            serde_json::from_str(raw).context("invalid locations JSON")?;
        Ok(Self::from_sites(list))
    }

    pub fn from_sites(list: impl IntoIterator<Item = SiteIdentity>) -> Self {
        let sites = list.into_iter().map(|s| (s.iata.clone(), s)).collect();
        Self { sites }
    }

    pub fn get(&self, code: &str) -> Option<&SiteIdentity> {
        self.sites.get(code)
    }

    /// Region and city for `code`; unknown codes map to empty labels.
    pub fn labels(&self, code: &str) -> (String, String) {
        self.get(code)
            .map(|s| (s.region.clone(), s.city.clone()))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// Where a cached document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Cache,
    Remote,
}

/// A named document kept in the data directory and refreshed from a remote
/// source only when the local copy is missing.
#[derive(Debug, Clone)]
pub struct CachedSource {
    pub path: PathBuf,
    pub url: String,
}

impl CachedSource {
    pub fn new(data_dir: impl AsRef<Path>, file_name: &str, url: impl Into<String>) -> Self {
        Self {
            path: data_dir.as_ref().join(file_name),
            url: url.into(),
        }
    }

    /// Read the local copy, or fetch it and store the body verbatim.
    ///
    /// A failed write is logged and otherwise ignored; the fetched body is
    /// still returned.
    pub async fn load(&self) -> Result<(String, Origin)> {
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            info!(path = %self.path.display(), "reading cached source");
            let content = tokio::fs::read_to_string(&self.path)
                .await
                .with_context(|| format!("failed to read {}", self.path.display()))?;
            return Ok((content, Origin::Cache));
        }

        info!(path = %self.path.display(), url = %self.url, "cache missing, downloading");
        let content = fetch_text(&self.url).await?;
        if let Err(e) = save_to_file(&self.path, &content).await {
            warn!(path = %self.path.display(), "failed to save cache: {e:#}");
        }
        Ok((content, Origin::Remote))
    }
}

async fn fetch_text(url: &str) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url} failed"))?
        .error_for_status()
        .with_context(|| format!("GET {url} returned an error status"))?;
    resp.text()
        .await
        .with_context(|| format!("failed to read body of {url}"))
}

async fn save_to_file(path: &Path, content: &str) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

/// Load the site directory from `data_dir`, downloading it on first use.
pub async fn load_site_directory(data_dir: impl AsRef<Path>) -> Result<SiteDirectory> {
    let source = CachedSource::new(data_dir, LOCATIONS_FILE, LOCATIONS_URL);
    let (raw, _) = source.load().await?;
    let dir = SiteDirectory::from_json(&raw)?;
    info!(sites = dir.len(), "site directory loaded");
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {"iata":"HKG","lat":22.3,"lon":113.9,"cca2":"HK","region":"Asia Pacific","city":"Hong Kong"},
        {"iata":"LAX","lat":33.9,"lon":-118.4,"cca2":"US","region":"North America","city":"Los Angeles"}
    ]"#;

    #[test]
    fn directory_resolves_known_and_unknown_codes() {
        let dir = SiteDirectory::from_json(SAMPLE).unwrap();
        assert_eq!(dir.len(), 2);
        assert_eq!(
            dir.labels("LAX"),
            ("North America".to_string(), "Los Angeles".to_string())
        );
        assert_eq!(dir.labels("ZZZ"), (String::new(), String::new()));
    }

    #[test]
    fn directory_rejects_garbage() {
        assert!(SiteDirectory::from_json("not json").is_err());
    }

    #[tokio::test]
    async fn cached_copy_is_preferred() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join(LOCATIONS_FILE), SAMPLE)
            .await
            .unwrap();
        // The URL is never contacted when the cache exists.
        let src = CachedSource::new(tmp.path(), LOCATIONS_FILE, "http://127.0.0.1:9/unused");
        let (body, origin) = src.load().await.unwrap();
        assert_eq!(origin, Origin::Cache);
        assert_eq!(body, SAMPLE);

        let dir = load_site_directory(tmp.path()).await.unwrap();
        assert!(dir.get("HKG").is_some());
    }

    #[tokio::test]
    async fn missing_cache_and_unreachable_source_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let src = CachedSource::new(tmp.path(), "ips-v4.txt", "http://127.0.0.1:9/ips");
        assert!(src.load().await.is_err());
        assert!(!tmp.path().join("ips-v4.txt").exists());
    }

    #[tokio::test]
    async fn fetched_body_is_returned_and_stored_verbatim() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        const LIST: &str = "1.0.0.0/24\r\n\n  104.16.0.0/13 \n# trailing";
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 1024];
            let _ = sock.read(&mut req).await;
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                LIST.len(),
                LIST
            );
            let _ = sock.write_all(resp.as_bytes()).await;
        });

        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join("data");
        let src = CachedSource::new(&data_dir, "ips-v4.txt", format!("http://127.0.0.1:{port}/ips"));
        let (body, origin) = src.load().await.unwrap();
        assert_eq!(origin, Origin::Remote);
        assert_eq!(body, LIST);
        assert_eq!(std::fs::read_to_string(data_dir.join("ips-v4.txt")).unwrap(), LIST);

        // The listener is gone, so a second load must come from the copy.
        let (again, origin) = src.load().await.unwrap();
        assert_eq!(origin, Origin::Cache);
        assert_eq!(again, LIST);
    }
}
