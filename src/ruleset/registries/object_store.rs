//! Rulesets stored as `<base>/<name>/<version>/ruleset.tar.gz` objects
//!
//! Used directly by `s3` and `http` registries, which cannot list versions,
//! and by the HTTPS manifest registry, which can.

use tracing::debug;
use url::Url;

use crate::config::RegistryKind;
use crate::ruleset::error::{ConfigError, RegistryError};
use crate::ruleset::registries::archive;
use crate::ruleset::registries::client::check_response;
use crate::ruleset::registry::{RulesetSource, Versioning, WritePolicy};
use crate::ruleset::types::{RefSnapshot, ResolvedVersion, RulesetFiles};

pub const TARBALL_NAME: &str = "ruleset.tar.gz";

const DEFAULT_S3_REGION: &str = "us-east-1";

/// Downloads and unpacks ruleset tarballs below a base URL
#[derive(Clone)]
pub struct TarballStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl TarballStore {
    pub fn new(client: reqwest::Client, base_url: &str, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn object_url(&self, ruleset: &str, version: &ResolvedVersion) -> String {
        format!("{}/{}/{}/{}", self.base_url, ruleset, version, TARBALL_NAME)
    }

    pub fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub async fn fetch(
        &self,
        ruleset: &str,
        version: &ResolvedVersion,
        patterns: &[String],
    ) -> Result<RulesetFiles, RegistryError> {
        let url = self.object_url(ruleset, version);
        debug!("Downloading {}", url);

        let response = self.get(&url).send().await?;
        let what = format!("{}@{}", ruleset, version);
        let content = check_response(response, &what).await?.bytes().await?.to_vec();

        let patterns = patterns.to_vec();
        tokio::task::spawn_blocking(move || archive::extract_tar_gz(&content, &patterns))
            .await
            .map_err(|e| RegistryError::Archive(format!("Extraction task failed: {}", e)))?
    }
}

/// Translate `s3://bucket/prefix` into a virtual-hosted-style HTTPS URL.
///
/// `endpoint` replaces the AWS host (for MinIO and friends) and switches to
/// path-style addressing.
pub fn s3_base_url(
    registry: &str,
    url: &str,
    region: Option<&str>,
    endpoint: Option<&str>,
) -> Result<String, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidUrl {
        registry: registry.to_string(),
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let parsed = Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
    if parsed.scheme() != "s3" {
        return Err(invalid("expected s3://bucket/prefix"));
    }
    let bucket = parsed
        .host_str()
        .filter(|bucket| !bucket.is_empty())
        .ok_or_else(|| invalid("missing bucket"))?;
    let prefix = parsed.path().trim_matches('/');

    let base = match endpoint {
        Some(endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), bucket),
        None => {
            let region = region.unwrap_or(DEFAULT_S3_REGION);
            format!("https://{}.s3.{}.amazonaws.com", bucket, region)
        }
    };

    if prefix.is_empty() {
        Ok(base)
    } else {
        Ok(format!("{}/{}", base, prefix))
    }
}

/// An `s3` or `http` registry: exact versions only
pub struct ObjectStoreSource {
    kind: RegistryKind,
    url: String,
    store: TarballStore,
}

impl ObjectStoreSource {
    pub fn new(kind: RegistryKind, url: &str, store: TarballStore) -> Self {
        Self {
            kind,
            url: url.to_string(),
            store,
        }
    }
}

#[async_trait::async_trait]
impl RulesetSource for ObjectStoreSource {
    fn kind(&self) -> RegistryKind {
        self.kind
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn versioning(&self) -> Versioning {
        Versioning::ExactOnly
    }

    fn write_policy(&self) -> WritePolicy {
        WritePolicy::Background
    }

    async fn snapshot(&self, _ruleset: &str) -> Result<RefSnapshot, RegistryError> {
        Err(RegistryError::ExactVersionRequired {
            registry: self.url.clone(),
        })
    }

    async fn fetch(
        &self,
        ruleset: &str,
        version: &ResolvedVersion,
        patterns: &[String],
    ) -> Result<RulesetFiles, RegistryError> {
        self.store.fetch(ruleset, version, patterns).await
    }
}
