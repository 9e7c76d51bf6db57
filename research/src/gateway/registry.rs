//! Role to backend selection
//!
//! Built once at startup from [`Settings`] and handed to the orchestrator.
//! Each role is bound independently to a provider and a provider-specific
//! model id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::http::HttpBackend;
use super::subprocess::SubprocessBackend;
use super::types::GatewayError;
use super::{AgentExecutor, Backend};
use crate::config::{ProviderConfig, Role, Settings};

/// Which backend and model serve a role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleBinding {
    pub provider: String,
    pub model: String,
}

pub struct ProviderRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
    bindings: HashMap<Role, RoleBinding>,
    timeout: Option<Duration>,
}

impl ProviderRegistry {
    /// Empty registry; calls time out after `timeout` when set
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            backends: HashMap::new(),
            bindings: HashMap::new(),
            timeout,
        }
    }

    /// Build backends for every configured provider and bind the roles
    pub fn from_settings(settings: &Settings) -> Self {
        let mut registry = Self::new(settings.agent_timeout());

        for (name, provider) in &settings.providers {
            let backend: Arc<dyn Backend> = match provider {
                ProviderConfig::Subprocess(config) => {
                    Arc::new(SubprocessBackend::new(name.clone(), config.clone()))
                }
                ProviderConfig::Http(config) => Arc::new(HttpBackend::new(name.clone(), config.clone())),
            };
            registry.register(name.clone(), backend);
        }

        for role in Role::ALL {
            let provider = settings.provider_for(role);
            let logical = &settings.role(role).model;
            let model = settings
                .providers
                .get(provider)
                .map(|p| p.map_model(logical))
                .unwrap_or_else(|| logical.clone());
            registry.bind(role, provider, model);
        }

        registry
    }

    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn Backend>) {
        self.backends.insert(name.into(), backend);
    }

    pub fn bind(&mut self, role: Role, provider: impl Into<String>, model: impl Into<String>) {
        self.bindings.insert(
            role,
            RoleBinding {
                provider: provider.into(),
                model: model.into(),
            },
        );
    }

    /// Register `backend` under `name` and bind every role to it
    pub fn with_backend_for_all(mut self, name: &str, backend: Arc<dyn Backend>, model: &str) -> Self {
        self.register(name, backend);
        for role in Role::ALL {
            self.bind(role, name, model);
        }
        self
    }

    pub fn binding(&self, role: Role) -> Option<&RoleBinding> {
        self.bindings.get(&role)
    }

    /// An executor for `role`
    pub fn executor(&self, role: Role) -> Result<AgentExecutor, GatewayError> {
        let binding = self
            .bindings
            .get(&role)
            .ok_or_else(|| GatewayError::Unavailable(format!("no provider bound to role {}", role)))?;
        let backend = self.backends.get(&binding.provider).ok_or_else(|| {
            GatewayError::Unavailable(format!(
                "provider '{}' for role {} is not registered",
                binding.provider, role
            ))
        })?;
        Ok(AgentExecutor::new(
            backend.clone(),
            binding.model.clone(),
            self.timeout,
        ))
    }

    /// Registered provider names, sorted
    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Close every registered backend
    pub async fn close(&self) {
        for (name, backend) in &self.backends {
            tracing::debug!(provider = %name, "Closing backend");
            backend.close().await;
        }
    }
}
