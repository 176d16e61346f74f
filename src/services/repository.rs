use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::errors::{EngineError, Result};
use crate::utils::env_usize;

/// Manifest resolution result: where the chunks live and the raw manifest.
#[derive(Clone, Debug)]
pub struct ResolvedManifest {
    pub base_urls: Vec<String>,
    pub manifest_bytes: Vec<u8>,
}

/// External collaborator boundary. The catalog/auth machinery behind it is
/// not part of this crate; the engine only needs manifest resolution and raw
/// byte fetches.
pub trait ManifestRepository: Send + Sync {
    fn resolve_manifest<'a>(
        &'a self,
        namespace: &'a str,
        catalog_id: &'a str,
        app_name: &'a str,
    ) -> BoxFuture<'a, Result<ResolvedManifest>>;

    fn fetch_bytes<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;
}

/// HTTP-backed repository speaking to a catalog service that returns
/// `{ "base_urls": [...], "manifest_url": "..." }` per app.
#[derive(Clone)]
pub struct HttpRepository {
    client: reqwest::Client,
    catalog_base: String,
}

#[derive(serde::Deserialize)]
struct CatalogManifestResponse {
    base_urls: Vec<String>,
    manifest_url: String,
}

impl HttpRepository {
    pub fn new(catalog_base: &str) -> Result<Self> {
        let timeout = env_usize("CHUNKFORGE_HTTP_TIMEOUT_SECONDS")
            .unwrap_or(600)
            .clamp(60, 7200) as u64;
        let connect_timeout = env_usize("CHUNKFORGE_HTTP_CONNECT_TIMEOUT_SECONDS")
            .unwrap_or(20)
            .clamp(5, 120) as u64;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .connect_timeout(Duration::from_secs(connect_timeout))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            catalog_base: catalog_base.trim_end_matches('/').to_string(),
        })
    }
}

impl ManifestRepository for HttpRepository {
    fn resolve_manifest<'a>(
        &'a self,
        namespace: &'a str,
        catalog_id: &'a str,
        app_name: &'a str,
    ) -> BoxFuture<'a, Result<ResolvedManifest>> {
        Box::pin(async move {
            let url = format!(
                "{}/manifests/{}/{}/{}",
                self.catalog_base, namespace, catalog_id, app_name
            );
            let response = self
                .client
                .get(&url)
                .send()
                .await?
                .error_for_status()
                .map_err(|err| EngineError::Network(format!("manifest resolve failed: {err}")))?;
            let catalog: CatalogManifestResponse = response.json().await?;
            let manifest_bytes = self.fetch_bytes(&catalog.manifest_url).await?;
            Ok(ResolvedManifest {
                base_urls: catalog.base_urls,
                manifest_bytes,
            })
        })
    }

    fn fetch_bytes<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .send()
                .await?
                .error_for_status()
                .map_err(|err| EngineError::Network(format!("fetch failed: {err}")))?;
            Ok(response.bytes().await?.to_vec())
        })
    }
}
