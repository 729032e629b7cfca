use crate::{ConfigCache, Error, Project, Result, Tokenizer, TokenizerLoader};
use parking_lot::RwLock;
use serde::Serialize;
use std::{collections::HashMap, path::PathBuf, sync::Arc};

/// File written next to a project's inference artifacts in managed mode.
pub const TOKENIZER_DESCRIPTOR: &str = "tokenizer.json";

#[derive(Serialize)]
struct TokenizerDescriptor<'a> {
    project_id: String,
    config_id: &'a str,
    max_length: usize,
}

/// Resolves tokenizer configuration identifiers to loaded engines.
///
/// Loaded engines are cached for the process lifetime and shared by every
/// caller. Only identifiers on the configured allow-list are ever loaded.
pub struct TokenizerProvider {
    loader: Arc<dyn TokenizerLoader>,
    config: Arc<ConfigCache>,
    cache: RwLock<HashMap<String, Arc<dyn Tokenizer>>>,
    inference_dir: Option<PathBuf>,
}

impl TokenizerProvider {
    pub fn new(loader: Arc<dyn TokenizerLoader>, config: Arc<ConfigCache>) -> Self {
        Self {
            loader,
            config,
            cache: RwLock::default(),
            inference_dir: None,
        }
    }

    /// Directory under which managed deployments get one sub-directory per
    /// project.
    #[must_use]
    pub fn with_inference_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.inference_dir = Some(dir.into());
        self
    }

    pub fn config(&self) -> &ConfigCache {
        &self.config
    }

    /// Returns the engine for `config_id`, loading it on first use.
    ///
    /// # Errors
    ///
    /// - [`Error::TokenizerNotAllowed`] if `config_id` is not allow-listed
    /// - [`Error::TokenizerLoad`] if the loader fails
    /// - [`Error::Config`] if the allow-list cannot be fetched
    pub async fn resolve(&self, config_id: &str) -> Result<Arc<dyn Tokenizer>> {
        let config = self.config.get().await?;
        if !config.allows(config_id) {
            return Err(Error::TokenizerNotAllowed {
                config_id: config_id.to_owned(),
                allowed: config.tokenizer_allow_list,
            });
        }

        if let Some(tokenizer) = self.cache.read().get(config_id) {
            return Ok(Arc::clone(tokenizer));
        }

        tracing::info!(config_id, "Loading tokenizer");
        let loader = Arc::clone(&self.loader);
        let id = config_id.to_owned();
        let tokenizer = tokio::task::spawn_blocking(move || loader.load(&id))
            .await
            .map_err(|e| Error::TokenizerLoad {
                config_id: config_id.to_owned(),
                reason: e.to_string(),
            })??;

        // A concurrent loader may have won; keep whichever landed first.
        let mut cache = self.cache.write();
        let cached = cache.entry(config_id.to_owned()).or_insert(tokenizer);
        Ok(Arc::clone(cached))
    }

    /// Resolves the engine configured on `project`.
    ///
    /// In managed mode the first resolution per project also writes a
    /// descriptor to `<inference_dir>/<project_id>/tokenizer.json`.
    pub async fn resolve_for_project(&self, project: &Project) -> Result<Arc<dyn Tokenizer>> {
        let tokenizer = self.resolve(&project.tokenizer).await?;
        if self.config.get().await?.is_managed {
            self.write_descriptor(project, tokenizer.as_ref()).await?;
        }
        Ok(tokenizer)
    }

    #[cfg(test)]
    fn clear(&self) {
        self.cache.write().clear();
    }

    async fn write_descriptor(&self, project: &Project, tokenizer: &dyn Tokenizer) -> Result<()> {
        let Some(root) = &self.inference_dir else {
            return Ok(());
        };
        let dir = root.join(project.id.to_string());
        let path = dir.join(TOKENIZER_DESCRIPTOR);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }

        let load_err = |reason: String| Error::TokenizerLoad {
            config_id: project.tokenizer.clone(),
            reason,
        };
        let descriptor = TokenizerDescriptor {
            project_id: project.id.to_string(),
            config_id: tokenizer.config_id(),
            max_length: tokenizer.max_length(),
        };
        let payload =
            serde_json::to_vec_pretty(&descriptor).map_err(|e| load_err(e.to_string()))?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| load_err(format!("{}: {e}", dir.display())))?;
        tokio::fs::write(&path, payload)
            .await
            .map_err(|e| load_err(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "Wrote tokenizer descriptor");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProjectStatus, RuleBasedLoader, ServiceConfig, StaticConfigSource};
    use portable_atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct CountingLoader {
        loads: AtomicUsize,
    }

    impl TokenizerLoader for CountingLoader {
        fn load(&self, config_id: &str) -> Result<Arc<dyn Tokenizer>> {
            self.loads.fetch_add(1, Ordering::Relaxed);
            RuleBasedLoader::default().load(config_id)
        }
    }

    fn config(is_managed: bool) -> Arc<ConfigCache> {
        Arc::new(ConfigCache::new(Arc::new(StaticConfigSource::new(
            ServiceConfig {
                tokenizer_allow_list: vec!["en_core_web_sm".to_owned()],
                is_managed,
            },
        ))))
    }

    fn project() -> Project {
        Project {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            name: "reviews".to_owned(),
            tokenizer: "en_core_web_sm".to_owned(),
            status: ProjectStatus::Active,
        }
    }

    #[tokio::test]
    async fn engines_are_loaded_once() {
        let loader = Arc::new(CountingLoader {
            loads: AtomicUsize::new(0),
        });
        let provider = TokenizerProvider::new(loader.clone(), config(false));

        let a = provider.resolve("en_core_web_sm").await.unwrap();
        let b = provider.resolve("en_core_web_sm").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loader.loads.load(Ordering::Relaxed), 1);

        provider.clear();
        provider.resolve("en_core_web_sm").await.unwrap();
        assert_eq!(loader.loads.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn identifiers_outside_allow_list_are_rejected() {
        let provider = TokenizerProvider::new(Arc::new(RuleBasedLoader::default()), config(false));
        let err = provider.resolve("xx_evil").await.err().unwrap();
        match err {
            Error::TokenizerNotAllowed { config_id, allowed } => {
                assert_eq!(config_id, "xx_evil");
                assert_eq!(allowed, ["en_core_web_sm"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn managed_mode_writes_descriptor_once() {
        let dir = std::env::temp_dir().join(format!("doctok-{}", Uuid::new_v4()));
        let provider = TokenizerProvider::new(Arc::new(RuleBasedLoader::default()), config(true))
            .with_inference_dir(&dir);
        let project = project();
        let path = dir.join(project.id.to_string()).join(TOKENIZER_DESCRIPTOR);

        provider.resolve_for_project(&project).await.unwrap();
        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(written.contains("en_core_web_sm"));

        tokio::fs::write(&path, "kept").await.unwrap();
        provider.resolve_for_project(&project).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "kept");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn unmanaged_mode_writes_nothing() {
        let dir = std::env::temp_dir().join(format!("doctok-{}", Uuid::new_v4()));
        let provider = TokenizerProvider::new(Arc::new(RuleBasedLoader::default()), config(false))
            .with_inference_dir(&dir);

        provider.resolve_for_project(&project()).await.unwrap();
        assert!(!dir.exists());
    }
}
