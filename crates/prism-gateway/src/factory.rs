//! Builds and owns backend adapter instances.

use crate::backend::{BackendAdapter, BackendDescriptor};
use crate::backends::common::resolve_credential;
use crate::backends::{AnthropicAdapter, OllamaAdapter, OpenAiAdapter};
use crate::error::{GatewayError, Result};
use prism_core::{BackendConfig, BackendId, BackendKind, ConfigError};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default synthesis weights, assigned in declaration order.
pub const DEFAULT_SYNTHESIS_WEIGHTS: [f64; 3] = [0.40, 0.35, 0.25];

/// Registry of adapters keyed by backend id.
#[derive(Default)]
pub struct BackendFactory {
    adapters: BTreeMap<BackendId, Arc<dyn BackendAdapter>>,
    order: Vec<BackendId>,
}

impl std::fmt::Debug for BackendFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendFactory")
            .field("backends", &self.order)
            .finish()
    }
}

impl BackendFactory {
    /// Create an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one adapter per configured backend.
    ///
    /// # Errors
    /// Returns error if a required credential is missing, an HTTP client
    /// cannot be created, a backend id repeats, or a backend is declared
    /// with the `custom` kind (those are registered programmatically).
    pub fn from_config(configs: &[BackendConfig]) -> Result<Self> {
        let mut factory = Self::new();
        for config in configs {
            let descriptor = BackendDescriptor::from_config(config);
            let adapter = build_adapter(descriptor)?;
            factory.register(adapter)?;
        }
        tracing::info!(backends = factory.order.len(), "Backend factory initialized");
        Ok(factory)
    }

    /// Register a programmatic adapter.
    ///
    /// # Errors
    /// Returns `Config` if the id is already registered.
    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) -> Result<()> {
        let id = adapter.id().clone();
        if self.adapters.contains_key(&id) {
            return Err(ConfigError::invalid(format!("backends.{id}"), "duplicate backend id").into());
        }
        tracing::debug!(backend = %id, kind = ?adapter.descriptor().kind, "Registered backend");
        self.order.push(id.clone());
        self.adapters.insert(id, adapter);
        Ok(())
    }

    /// Every adapter, keyed by id.
    #[must_use]
    pub fn all(&self) -> &BTreeMap<BackendId, Arc<dyn BackendAdapter>> {
        &self.adapters
    }

    /// Adapter for `id`.
    ///
    /// # Errors
    /// Returns `BackendNotFound` if `id` is not registered.
    pub fn get(&self, id: &BackendId) -> Result<Arc<dyn BackendAdapter>> {
        self.adapters
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::BackendNotFound {
                backend: id.to_string(),
            })
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &BackendId) -> bool {
        self.adapters.contains_key(id)
    }

    /// Number of registered backends.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether no backend is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.order
            .iter()
            .filter_map(|id| self.adapters.get(id))
            .map(|adapter| adapter.descriptor())
    }

    /// First registered backend that is local and free, if any.
    #[must_use]
    pub fn zero_cost_local(&self) -> Option<Arc<dyn BackendAdapter>> {
        self.order
            .iter()
            .filter_map(|id| self.adapters.get(id))
            .find(|adapter| adapter.descriptor().is_zero_cost_local())
            .cloned()
    }

    /// Synthesis-eligible backends with their effective weights.
    ///
    /// Backends with an explicit weight keep it. The rest receive the
    /// default 0.40 / 0.35 / 0.25 split in registration order, or equal
    /// shares when more than three need defaults.
    #[must_use]
    pub fn synthesis_members(&self) -> Vec<(Arc<dyn BackendAdapter>, f64)> {
        let eligible: Vec<_> = self
            .order
            .iter()
            .filter_map(|id| self.adapters.get(id))
            .filter(|adapter| adapter.descriptor().synthesis_eligible)
            .cloned()
            .collect();

        let unweighted = eligible
            .iter()
            .filter(|adapter| adapter.descriptor().synthesis_weight.is_none())
            .count();

        let mut default_index = 0;
        eligible
            .into_iter()
            .map(|adapter| {
                let weight = adapter.descriptor().synthesis_weight.unwrap_or_else(|| {
                    let weight = default_weight(default_index, unweighted);
                    default_index += 1;
                    weight
                });
                (adapter, weight)
            })
            .collect()
    }
}

#[allow(clippy::cast_precision_loss)]
fn default_weight(index: usize, count: usize) -> f64 {
    if count <= DEFAULT_SYNTHESIS_WEIGHTS.len() {
        DEFAULT_SYNTHESIS_WEIGHTS[index]
    } else {
        1.0 / count as f64
    }
}

fn build_adapter(descriptor: BackendDescriptor) -> Result<Arc<dyn BackendAdapter>> {
    let credential = descriptor
        .credential_env
        .as_deref()
        .map(resolve_credential)
        .transpose()?;

    let adapter: Arc<dyn BackendAdapter> = match descriptor.kind {
        BackendKind::OpenAi => {
            let key = credential.ok_or_else(|| missing_credential(&descriptor))?;
            Arc::new(OpenAiAdapter::new(descriptor, Some(key))?)
        }
        BackendKind::LmStudio => Arc::new(OpenAiAdapter::new(descriptor, credential)?),
        BackendKind::Anthropic => {
            let key = credential.ok_or_else(|| missing_credential(&descriptor))?;
            Arc::new(AnthropicAdapter::new(descriptor, key)?)
        }
        BackendKind::Ollama => Arc::new(OllamaAdapter::new(descriptor)?),
        BackendKind::Custom => {
            return Err(ConfigError::invalid(
                format!("backends.{}", descriptor.id),
                "custom backends must be registered programmatically",
            )
            .into())
        }
    };
    Ok(adapter)
}

fn missing_credential(descriptor: &BackendDescriptor) -> GatewayError {
    ConfigError::invalid(
        format!("backends.{}.credential_env", descriptor.id),
        "cloud backends need a credential",
    )
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendOutput;
    use crate::error::BackendError;
    use crate::request::GenerationParams;
    use async_trait::async_trait;
    use prism_core::Usd;

    struct StaticAdapter {
        descriptor: BackendDescriptor,
    }

    #[async_trait]
    impl BackendAdapter for StaticAdapter {
        fn descriptor(&self) -> &BackendDescriptor {
            &self.descriptor
        }

        async fn call(
            &self,
            _prompt: &str,
            _params: &GenerationParams,
        ) -> std::result::Result<BackendOutput, BackendError> {
            Ok(BackendOutput {
                text: "ok".to_string(),
                token_count: 1,
            })
        }
    }

    fn adapter(descriptor: BackendDescriptor) -> Arc<dyn BackendAdapter> {
        Arc::new(StaticAdapter { descriptor })
    }

    fn descriptor(id: &str) -> BackendDescriptor {
        BackendDescriptor::new(BackendId::new(id).expect("valid id"), BackendKind::Custom)
    }

    #[test]
    fn test_register_and_get() {
        let mut factory = BackendFactory::new();
        factory.register(adapter(descriptor("alpha"))).expect("register");
        let id = BackendId::new("alpha").expect("valid id");

        assert_eq!(factory.len(), 1);
        assert_eq!(factory.get(&id).expect("registered").id(), &id);
        assert!(factory.all().contains_key(&id));
        assert!(matches!(
            factory.get(&BackendId::new("ghost").expect("valid id")),
            Err(GatewayError::BackendNotFound { .. })
        ));
        assert!(factory.register(adapter(descriptor("alpha"))).is_err());
    }

    #[test]
    fn test_default_synthesis_weights() {
        let mut factory = BackendFactory::new();
        for id in ["first", "second", "third"] {
            factory.register(adapter(descriptor(id))).expect("register");
        }
        let weights: Vec<_> = factory
            .synthesis_members()
            .into_iter()
            .map(|(a, w)| (a.id().to_string(), w))
            .collect();
        assert_eq!(
            weights,
            vec![
                ("first".to_string(), 0.40),
                ("second".to_string(), 0.35),
                ("third".to_string(), 0.25),
            ]
        );
    }

    #[test]
    fn test_explicit_weights_and_exclusions() {
        let mut factory = BackendFactory::new();
        factory
            .register(adapter(descriptor("fixed").with_synthesis_weight(0.9)))
            .expect("register");
        factory
            .register(adapter(descriptor("excluded").with_synthesis(false)))
            .expect("register");
        factory.register(adapter(descriptor("auto"))).expect("register");

        let members = factory.synthesis_members();
        assert_eq!(members.len(), 2);
        assert!((members[0].1 - 0.9).abs() < f64::EPSILON);
        assert!((members[1].1 - 0.40).abs() < f64::EPSILON);
    }

    #[test]
    fn test_equal_shares_beyond_three() {
        let mut factory = BackendFactory::new();
        for id in ["aa", "bb", "cc", "dd"] {
            factory.register(adapter(descriptor(id))).expect("register");
        }
        for (_, weight) in factory.synthesis_members() {
            assert!((weight - 0.25).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn test_zero_cost_local() {
        let mut factory = BackendFactory::new();
        factory
            .register(adapter(descriptor("cloud").with_cost_per_1k(Usd::from_mills(10))))
            .expect("register");
        assert!(factory.zero_cost_local().is_none());

        factory
            .register(adapter(descriptor("local").with_local(true)))
            .expect("register");
        let local = factory.zero_cost_local().expect("local backend");
        assert_eq!(local.id().as_str(), "local");
    }

    #[test]
    fn test_from_config_builds_adapters() {
        let configs: Vec<BackendConfig> = toml::from_str::<prism_core::GatewayConfig>(
            r#"
[[backends]]
id = "local"
kind = "ollama"
model = "llama3.1:8b"

[[backends]]
id = "studio"
kind = "lm_studio"
model = "qwen2.5"
"#,
        )
        .expect("parse config")
        .backends;

        let factory = BackendFactory::from_config(&configs).expect("build factory");
        let ids: Vec<_> = factory.descriptors().map(|d| d.id.to_string()).collect();
        assert_eq!(ids, vec!["local", "studio"]);
    }

    #[test]
    fn test_from_config_requires_cloud_credentials() {
        let configs = toml::from_str::<prism_core::GatewayConfig>(
            r#"
[[backends]]
id = "cloud"
kind = "open_ai"
model = "gpt-4o"
credential_env = "PRISM_TEST_FACTORY_KEY_UNSET"
"#,
        )
        .expect("parse config")
        .backends;

        assert!(matches!(
            BackendFactory::from_config(&configs),
            Err(GatewayError::Config(ConfigError::MissingSecret { .. }))
        ));
    }
}
