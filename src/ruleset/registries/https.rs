//! Static HTTPS registry described by a `manifest.json`
//!
//! ```json
//! { "python": ["1.0.0", "1.1.0"], "typescript": ["0.3.0"] }
//! ```
//!
//! Content lives next to it as `<name>/<version>/ruleset.tar.gz`.

use std::collections::BTreeMap;

use crate::config::RegistryKind;
use crate::ruleset::error::RegistryError;
use crate::ruleset::registries::client::{check_response, json};
use crate::ruleset::registries::object_store::TarballStore;
use crate::ruleset::registry::{RulesetSource, Versioning, WritePolicy};
use crate::ruleset::types::{RefSnapshot, ResolvedVersion, RulesetFiles};

const MANIFEST_NAME: &str = "manifest.json";

type Manifest = BTreeMap<String, Vec<String>>;

pub struct ManifestSource {
    url: String,
    store: TarballStore,
}

impl ManifestSource {
    pub fn new(url: &str, store: TarballStore) -> Self {
        Self {
            url: url.to_string(),
            store,
        }
    }

    async fn manifest(&self) -> Result<Manifest, RegistryError> {
        let url = format!("{}/{}", self.store.base_url(), MANIFEST_NAME);
        let response = check_response(self.store.get(&url).send().await?, &url).await?;
        json(response, &url).await
    }
}

#[async_trait::async_trait]
impl RulesetSource for ManifestSource {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Https
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn versioning(&self) -> Versioning {
        Versioning::Packages
    }

    fn write_policy(&self) -> WritePolicy {
        WritePolicy::Background
    }

    async fn snapshot(&self, ruleset: &str) -> Result<RefSnapshot, RegistryError> {
        let mut manifest = self.manifest().await?;
        let versions = manifest
            .remove(ruleset)
            .ok_or_else(|| RegistryError::NotFound(ruleset.to_string()))?;
        Ok(RefSnapshot::from_versions(versions))
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
