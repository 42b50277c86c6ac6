use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::{
    backend::{BackendError, ModelBackend},
    errors::AppError,
    types::{unix_timestamp, ModelConfig},
};

const WARMUP_CAP: u32 = 10;
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// A capability that produces a loaded backend from a `ModelConfig`; loaders may suspend.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, config: &ModelConfig) -> Result<Arc<dyn ModelBackend>, String>;
}

struct ModelEntry {
    config: ModelConfig,
    backend: Arc<dyn ModelBackend>,
    loaded_at: i64,
    last_used_at: AtomicU64,
    inference_count: AtomicU64,
    total_tokens_generated: AtomicU64,
    health_ok: AtomicBool,
}

/// Strong reference handed to callers of `get_model`; holding it keeps the backend alive (and
/// thus usable) even if the registry later unloads or supersedes this version.
#[derive(Clone)]
pub struct ModelHandle {
    pub name: String,
    pub version: String,
    pub backend: Arc<dyn ModelBackend>,
    entry: Arc<ModelEntry>,
}

impl ModelHandle {
    pub fn record_usage(&self, tokens_generated: u64) {
        self.entry
            .last_used_at
            .store(unix_timestamp().max(0) as u64, Ordering::Relaxed);
        self.entry.inference_count.fetch_add(1, Ordering::Relaxed);
        self.entry
            .total_tokens_generated
            .fetch_add(tokens_generated, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    pub name: String,
    pub version: String,
    pub device: crate::types::Device,
    pub loaded_at: i64,
    pub last_used_at: i64,
    pub inference_count: u64,
    pub total_tokens_generated: u64,
    pub health_ok: bool,
}

/// Versioned load/unload/swap/warm-up lifecycle for models, guarded by one read-write lock:
/// lookups run concurrently, mutating operations (load/unload/swap) run exclusively.
pub struct ModelRegistry {
    loaders: RwLock<HashMap<String, Arc<dyn ModelLoader>>>,
    entries: RwLock<HashMap<(String, String), Arc<ModelEntry>>>,
    active: RwLock<HashMap<String, String>>,
    /// Serializes `load_model` end to end (loader call, warm-up, and storage), matching the
    /// original's `async with self._lock:` around the whole load. Concurrent `load_model` calls
    /// queue behind this rather than interleaving.
    load_lock: Mutex<()>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            loaders: RwLock::new(HashMap::new()),
            entries: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            load_lock: Mutex::new(()),
        }
    }

    pub async fn register_loader(&self, name: impl Into<String>, loader: Arc<dyn ModelLoader>) {
        self.loaders.write().await.insert(name.into(), loader);
    }

    /// Loads `config`, warms it up, and marks it the active version for its name. Warm-up
    /// failures are logged but never fail the load. The entire body runs under `load_lock`.
    pub async fn load_model(&self, config: ModelConfig) -> Result<(), AppError> {
        let _guard = self.load_lock.lock().await;

        let loader = self
            .loaders
            .read()
            .await
            .get(&config.name)
            .cloned()
            .ok_or_else(|| AppError::NoLoader(config.name.clone()))?;

        let backend = loader
            .load(&config)
            .await
            .map_err(|cause| AppError::LoadFailed(config.name.clone(), cause))?;

        let warmup_tokens = config.warmup_tokens.min(WARMUP_CAP);
        if warmup_tokens > 0 {
            if let Err(error) = warm_up(backend.as_ref(), warmup_tokens).await {
                warn!(model = %config.name, version = %config.version, %error, "warm-up failed, continuing");
            }
        }

        let entry = Arc::new(ModelEntry {
            loaded_at: unix_timestamp(),
            last_used_at: AtomicU64::new(unix_timestamp().max(0) as u64),
            inference_count: AtomicU64::new(0),
            total_tokens_generated: AtomicU64::new(0),
            health_ok: AtomicBool::new(true),
            config: config.clone(),
            backend,
        });

        let key = (config.name.clone(), config.version.clone());
        self.entries.write().await.insert(key, entry);
        self.active.write().await.insert(config.name.clone(), config.version.clone());

        info!(model = %config.name, version = %config.version, "model loaded and active");
        Ok(())
    }

    /// Unloads one version, or every version of `name` when `version` is `None`. If the active
    /// version is removed, another remaining version (if any) becomes active.
    pub async fn unload_model(&self, name: &str, version: Option<&str>) {
        let targets: Vec<(String, String)> = {
            let entries = self.entries.read().await;
            entries
                .keys()
                .filter(|(entry_name, entry_version)| {
                    entry_name == name && version.map_or(true, |v| v == entry_version)
                })
                .cloned()
                .collect()
        };

        for key in &targets {
            let entry = self.entries.write().await.remove(key);
            if let Some(entry) = entry {
                match tokio::time::timeout(CLEANUP_TIMEOUT, entry.backend.cleanup()).await {
                    Ok(()) => {}
                    Err(_) => warn!(model = %key.0, version = %key.1, "cleanup timed out"),
                }
            }
        }

        let mut active = self.active.write().await;
        if let Some(current) = active.get(name).cloned() {
            let removed = targets.iter().any(|(_, v)| v == &current);
            if removed {
                active.remove(name);
                drop(active);
                let entries = self.entries.read().await;
                if let Some((_, remaining_version)) = entries.keys().find(|(n, _)| n == name) {
                    let remaining_version = remaining_version.clone();
                    drop(entries);
                    self.active.write().await.insert(name.to_owned(), remaining_version);
                }
            }
        }
    }

    /// Atomic active-version swap. In-flight holders of a `ModelHandle` for the prior version
    /// keep using it via their own `Arc` clone; this only changes what future lookups resolve to.
    pub async fn set_active_version(&self, name: &str, version: &str) -> bool {
        let known = self
            .entries
            .read()
            .await
            .contains_key(&(name.to_owned(), version.to_owned()));
        if !known {
            return false;
        }
        self.active.write().await.insert(name.to_owned(), version.to_owned());
        true
    }

    pub async fn get_model(&self, name: &str, version: Option<&str>) -> Option<ModelHandle> {
        let version = match version {
            Some(v) => v.to_owned(),
            None => self.active.read().await.get(name)?.clone(),
        };
        let entry = self.entries.read().await.get(&(name.to_owned(), version.clone())).cloned()?;
        Some(ModelHandle {
            name: name.to_owned(),
            version,
            backend: entry.backend.clone(),
            entry,
        })
    }

    pub async fn health_check(&self, name: &str) -> Option<bool> {
        let handle = self.get_model(name, None).await?;
        let healthy = handle.backend.health_check().await;
        handle.entry.health_ok.store(healthy, Ordering::Relaxed);
        Some(healthy)
    }

    pub async fn list_models(&self) -> HashMap<String, Vec<String>> {
        let entries = self.entries.read().await;
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for (name, version) in entries.keys() {
            out.entry(name.clone()).or_default().push(version.clone());
        }
        for versions in out.values_mut() {
            versions.sort();
        }
        out
    }

    pub async fn model_stats(&self, name: &str, version: &str) -> Option<ModelStats> {
        let entry = self
            .entries
            .read()
            .await
            .get(&(name.to_owned(), version.to_owned()))
            .cloned()?;
        Some(ModelStats {
            name: name.to_owned(),
            version: version.to_owned(),
            device: entry.config.device,
            loaded_at: entry.loaded_at,
            last_used_at: entry.last_used_at.load(Ordering::Relaxed) as i64,
            inference_count: entry.inference_count.load(Ordering::Relaxed),
            total_tokens_generated: entry.total_tokens_generated.load(Ordering::Relaxed),
            health_ok: entry.health_ok.load(Ordering::Relaxed),
        })
    }

    /// Unloads every model. Subsequent operations are unspecified; callers should discard the
    /// registry afterward.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.entries.read().await.keys().map(|(n, _)| n.clone()).collect();
        let mut seen = std::collections::HashSet::new();
        for name in names {
            if seen.insert(name.clone()) {
                self.unload_model(&name, None).await;
            }
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn warm_up(backend: &dyn ModelBackend, tokens: u32) -> Result<(), BackendError> {
    let mut stream = backend.generate("warm-up", tokens, 0.0).await?;
    while let Some(item) = stream.next().await {
        item?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{mock::MockBackend, GenerateStream};
    use crate::types::Device;

    struct MockLoader;

    #[async_trait]
    impl ModelLoader for MockLoader {
        async fn load(&self, config: &ModelConfig) -> Result<Arc<dyn ModelBackend>, String> {
            Ok(Arc::new(MockBackend::named(format!("{}-{}", config.name, config.version))))
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl ModelBackend for FailingBackend {
        async fn generate(&self, _: &str, _: u32, _: f32) -> Result<GenerateStream, BackendError> {
            Ok(Box::pin(futures_util::stream::once(async {
                Err(BackendError::Unavailable("cannot generate".into()))
            })))
        }
    }

    struct FailingLoader;

    #[async_trait]
    impl ModelLoader for FailingLoader {
        async fn load(&self, _config: &ModelConfig) -> Result<Arc<dyn ModelBackend>, String> {
            Ok(Arc::new(FailingBackend))
        }
    }

    fn config(name: &str, version: &str) -> ModelConfig {
        ModelConfig::new(name, version, Device::Cpu).unwrap()
    }

    #[tokio::test]
    async fn load_without_loader_fails() {
        let registry = ModelRegistry::new();
        let error = registry.load_model(config("gpt2", "1.0")).await.unwrap_err();
        assert!(matches!(error, AppError::NoLoader(name) if name == "gpt2"));
    }

    #[tokio::test]
    async fn hot_swap_keeps_prior_handle_usable() {
        let registry = ModelRegistry::new();
        registry.register_loader("gpt2", Arc::new(MockLoader)).await;

        registry.load_model(config("gpt2", "1.0")).await.unwrap();
        registry.load_model(config("gpt2", "2.0")).await.unwrap();

        let active = registry.get_model("gpt2", None).await.unwrap();
        assert_eq!(active.version, "2.0");

        let captured = registry.get_model("gpt2", Some("2.0")).await.unwrap();
        registry.unload_model("gpt2", Some("2.0")).await;

        let mut stream = captured.backend.generate("still works", 1, 1.0).await.unwrap();
        assert!(stream.next().await.unwrap().is_ok());

        let fallback = registry.get_model("gpt2", None).await.unwrap();
        assert_eq!(fallback.version, "1.0");
    }

    #[tokio::test]
    async fn set_active_version_rejects_unknown_version() {
        let registry = ModelRegistry::new();
        registry.register_loader("gpt2", Arc::new(MockLoader)).await;
        registry.load_model(config("gpt2", "1.0")).await.unwrap();

        assert!(!registry.set_active_version("gpt2", "9.9").await);
        assert!(registry.set_active_version("gpt2", "1.0").await);
    }

    #[tokio::test]
    async fn warmup_failure_does_not_fail_load() {
        let registry = ModelRegistry::new();
        registry.register_loader("broken", Arc::new(FailingLoader)).await;

        let mut cfg = config("broken", "1.0");
        cfg.warmup_tokens = 4;
        registry.load_model(cfg).await.unwrap();

        assert!(registry.get_model("broken", None).await.is_some());
    }

    #[tokio::test]
    async fn shutdown_empties_registry() {
        let registry = ModelRegistry::new();
        registry.register_loader("gpt2", Arc::new(MockLoader)).await;
        registry.load_model(config("gpt2", "1.0")).await.unwrap();

        registry.shutdown().await;
        assert!(registry.list_models().await.is_empty());
    }
}
