//! The crate's single entry point: wires C1–C7 together, the way the
//! teacher's top-level `Garage` struct wires its tables and workers.

use std::sync::Arc;

use crate::config::Config;
use crate::error::Error;
use crate::gc::{GarbageCollector, GcMode, GcOutcome};
use crate::manifest::{ManifestEngine, ManifestParser};
use crate::store::{ListOptions, ObjectStore};
use crate::upload::UploadSession;

/// One page of a repository listing.
pub struct RepositoryPage {
    pub names: Vec<String>,
    pub next_cursor: Option<String>,
}

/// Holds the object store, configuration and manifest parser this
/// registry is built on, and exposes every operation named in spec §6
/// through three borrow-only helper views.
pub struct Registry {
    store: Arc<dyn ObjectStore>,
    config: Config,
    parser: Arc<dyn ManifestParser>,
}

impl Registry {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: Config,
        parser: Arc<dyn ManifestParser>,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Registry { store, config, parser })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn uploads(&self) -> UploadSession<'_> {
        UploadSession::new(self.store.as_ref(), &self.config)
    }

    pub fn manifests(&self) -> ManifestEngine<'_> {
        ManifestEngine::new(self.store.as_ref(), self.parser.as_ref())
    }

    pub fn gc(&self) -> GarbageCollector<'_> {
        GarbageCollector::new(self.store.as_ref())
    }

    pub async fn collect(&self, name: &str, mode: GcMode) -> Result<GcOutcome, Error> {
        self.gc().collect(name, mode, self.parser.as_ref()).await
    }

    /// Lists repository names, derived from the distinct path prefixes
    /// under the `manifests/` namespace rather than raw object keys.
    pub async fn list_repositories(
        &self,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<RepositoryPage, Error> {
        let page = self
            .store
            .list(ListOptions {
                prefix: None,
                cursor,
                limit: 0,
            })
            .await?;

        let mut names: Vec<String> = page
            .keys
            .iter()
            .filter_map(|k| k.split_once("/manifests/").map(|(name, _)| name.to_string()))
            .collect();
        names.sort();
        names.dedup();

        let effective_limit = if limit == 0 { names.len() } else { limit };
        let next_cursor = if names.len() > effective_limit {
            Some(names[effective_limit - 1].clone())
        } else {
            None
        };
        names.truncate(effective_limit);

        Ok(RepositoryPage { names, next_cursor })
    }
}
