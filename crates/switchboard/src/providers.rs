//! Model-to-provider resolution.
//!
//! A candidate entry is either a bare model name (`"gpt-4o"`) or a
//! provider-qualified one (`"azure/gpt-4o"`). Bare names consult the
//! model->provider map before defaulting to the implicit upstream provider.

use serde::Serialize;

use crate::config::{AppConfig, ProviderEndpoint};
use crate::error::{RouteError, RouteResult};

/// Reserved id of the default upstream provider.
pub const UPSTREAM_PROVIDER: &str = "upstream";

/// A fully qualified model reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ModelRef {
    pub provider_id: String,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model: model.into(),
        }
    }

    /// Canonical `provider/model` form, used as the stats and log key.
    pub fn canonical(&self) -> String {
        format!("{}/{}", self.provider_id, self.model)
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model)
    }
}

/// Resolve a candidate entry to its provider endpoint.
///
/// An explicit `provider/model` prefix always wins, even over the
/// model->provider map. The config is never mutated.
pub fn resolve<'a>(
    config: &'a AppConfig,
    entry: &str,
) -> RouteResult<(ModelRef, &'a ProviderEndpoint)> {
    let (provider_id, model) = match entry.split_once('/') {
        Some((provider, model)) => (provider.to_string(), model.to_string()),
        None => {
            let provider = config
                .providers
                .map
                .get(entry)
                .cloned()
                .unwrap_or_else(|| UPSTREAM_PROVIDER.to_string());
            (provider, entry.to_string())
        }
    };

    let endpoint = if provider_id == UPSTREAM_PROVIDER {
        &config.providers.upstream
    } else {
        config
            .providers
            .custom
            .get(&provider_id)
            .ok_or_else(|| RouteError::ProviderMissing(entry.to_string()))?
    };

    Ok((ModelRef::new(provider_id, model), endpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, Protocol};

    fn config_with_custom() -> AppConfig {
        let mut config = AppConfig::default();
        config.providers.custom.insert(
            "azure".to_string(),
            ProviderEndpoint {
                base_url: "https://azure.example/v1".to_string(),
                api_key: "azure-key".to_string(),
                protocol: Protocol::OpenAi,
                verify_ssl: true,
            },
        );
        config
            .providers
            .map
            .insert("gpt-4o".to_string(), "azure".to_string());
        config
    }

    #[test]
    fn test_bare_model_defaults_to_upstream() {
        let config = AppConfig::default();
        let (model, endpoint) = resolve(&config, "gpt-4o-mini").unwrap();
        assert_eq!(model.provider_id, UPSTREAM_PROVIDER);
        assert_eq!(model.model, "gpt-4o-mini");
        assert_eq!(endpoint.base_url, config.providers.upstream.base_url);
    }

    #[test]
    fn test_bare_model_honors_provider_map() {
        let config = config_with_custom();
        let (model, endpoint) = resolve(&config, "gpt-4o").unwrap();
        assert_eq!(model.provider_id, "azure");
        assert_eq!(endpoint.base_url, "https://azure.example/v1");
    }

    #[test]
    fn test_explicit_prefix_wins_over_map() {
        let mut config = config_with_custom();
        // map says azure, but the explicit prefix must win
        config
            .providers
            .map
            .insert("azure/gpt-4o".to_string(), "upstream".to_string());
        let (model, endpoint) = resolve(&config, "azure/gpt-4o").unwrap();
        assert_eq!(model.provider_id, "azure");
        assert_eq!(model.model, "gpt-4o");
        assert_eq!(endpoint.base_url, "https://azure.example/v1");
    }

    #[test]
    fn test_upstream_prefix_resolves_to_default() {
        let config = AppConfig::default();
        let (model, _) = resolve(&config, "upstream/some-model").unwrap();
        assert_eq!(model.provider_id, UPSTREAM_PROVIDER);
        assert_eq!(model.model, "some-model");
    }

    #[test]
    fn test_unknown_provider_fails() {
        let config = AppConfig::default();
        let err = resolve(&config, "nowhere/gpt-4o").unwrap_err();
        assert!(matches!(err, RouteError::ProviderMissing(_)));
    }

    #[test]
    fn test_model_with_slash_in_name() {
        let mut config = config_with_custom();
        config.providers.custom.insert(
            "openrouter".to_string(),
            ProviderEndpoint {
                base_url: "https://openrouter.example/v1".to_string(),
                api_key: String::new(),
                protocol: Protocol::OpenAi,
                verify_ssl: true,
            },
        );
        // only the first slash splits; the rest stays in the model name
        let (model, _) = resolve(&config, "openrouter/meta/llama-3").unwrap();
        assert_eq!(model.provider_id, "openrouter");
        assert_eq!(model.model, "meta/llama-3");
    }
}
