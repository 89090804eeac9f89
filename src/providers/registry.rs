//! Lookup tables from provider identifier to adaptor.
//!
//! Both registries are filled once at startup and then shared read-only behind
//! an `Arc`, so lookups take no locks.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Adaptor, ApiType, ProviderError, UpstreamTarget};

/// Synchronous request/response adaptors, keyed by [`ApiType`].
#[derive(Clone, Default)]
pub struct AdaptorRegistry {
    adaptors: HashMap<ApiType, Arc<dyn Adaptor>>,
}

impl AdaptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every adaptor compiled into this build.
    ///
    /// OpenAI-shaped families share a single [`OpenAiAdaptor`](super::open_ai::OpenAiAdaptor)
    /// instance; they differ only in base URL, which comes from the channel.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "provider-openai")]
        {
            let openai: Arc<dyn Adaptor> = Arc::new(super::open_ai::OpenAiAdaptor::new());
            for api_type in [
                ApiType::OpenAi,
                ApiType::OpenRouter,
                ApiType::DeepSeek,
                ApiType::Xinference,
                ApiType::SiliconFlow,
                ApiType::Mistral,
                ApiType::Moonshot,
            ] {
                registry = registry.with(api_type, Arc::clone(&openai));
            }
        }

        #[cfg(feature = "provider-test")]
        {
            registry = registry.with(ApiType::Test, Arc::new(super::test::TestAdaptor::new()));
        }

        registry
    }

    /// Add or replace the adaptor for an API type.
    pub fn with(mut self, api_type: ApiType, adaptor: Arc<dyn Adaptor>) -> Self {
        self.adaptors.insert(api_type, adaptor);
        self
    }

    pub fn resolve(&self, api_type: ApiType) -> Option<Arc<dyn Adaptor>> {
        self.adaptors.get(&api_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.adaptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adaptors.is_empty()
    }
}

/// Long-running asynchronous job platforms. Only platforms with a registered
/// adaptor are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPlatform {
    Test,
}

/// Upstream state of a submitted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InProgress { progress: u8 },
    Succeeded { result: Value },
    Failed { reason: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded { .. } | TaskStatus::Failed { .. })
    }
}

/// Adaptor for a task platform: submit once, then poll until terminal.
#[async_trait]
pub trait TaskAdaptor: Send + Sync {
    fn platform(&self) -> TaskPlatform;

    /// Reject requests the platform cannot run, before anything is billed.
    fn validate_task(&self, request: &Value) -> Result<(), ProviderError>;

    fn build_task_request(
        &self,
        request: &Value,
        upstream_model: &str,
    ) -> Result<Value, ProviderError>;

    /// Submit a job and return the upstream task id.
    async fn submit(
        &self,
        client: &reqwest::Client,
        target: &UpstreamTarget,
        body: Bytes,
    ) -> Result<String, ProviderError>;

    async fn fetch_status(
        &self,
        client: &reqwest::Client,
        target: &UpstreamTarget,
        task_id: &str,
    ) -> Result<TaskStatus, ProviderError>;
}

/// Task adaptors, keyed by [`TaskPlatform`].
#[derive(Clone, Default)]
pub struct TaskAdaptorRegistry {
    adaptors: HashMap<TaskPlatform, Arc<dyn TaskAdaptor>>,
}

impl TaskAdaptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "provider-test")]
        {
            registry = registry.with(Arc::new(super::test::TestTaskAdaptor::new()));
        }
        registry
    }

    /// Register an adaptor under the platform it reports.
    pub fn with(mut self, adaptor: Arc<dyn TaskAdaptor>) -> Self {
        self.adaptors.insert(adaptor.platform(), adaptor);
        self
    }

    pub fn resolve(&self, platform: TaskPlatform) -> Option<Arc<dyn TaskAdaptor>> {
        self.adaptors.get(&platform).cloned()
    }

    pub fn len(&self) -> usize {
        self.adaptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adaptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test::{TestAdaptor, TestTaskAdaptor};

    #[test]
    fn test_resolve_registered_and_missing() {
        let registry = AdaptorRegistry::new().with(ApiType::Test, Arc::new(TestAdaptor::new()));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve(ApiType::Test).unwrap().name(), "test");
        assert!(registry.resolve(ApiType::Mistral).is_none());
    }

    #[cfg(feature = "provider-openai")]
    #[test]
    fn test_defaults_share_openai_adaptor() {
        let registry = AdaptorRegistry::with_defaults();

        let openai = registry.resolve(ApiType::OpenAi).unwrap();
        let deepseek = registry.resolve(ApiType::DeepSeek).unwrap();
        assert!(Arc::ptr_eq(&openai, &deepseek));
        assert_eq!(openai.name(), "openai");
    }

    #[test]
    fn test_task_registry_keys_by_platform() {
        assert!(TaskAdaptorRegistry::new().resolve(TaskPlatform::Test).is_none());

        let registry = TaskAdaptorRegistry::new().with(Arc::new(TestTaskAdaptor::new()));
        assert!(registry.resolve(TaskPlatform::Test).is_some());
        assert!(serde_json::from_str::<TaskPlatform>("\"suno\"").is_err());
    }

    #[test]
    fn test_task_status_terminal() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::InProgress { progress: 40 }.is_terminal());
        assert!(
            TaskStatus::Failed {
                reason: "nsfw".into()
            }
            .is_terminal()
        );
    }
}
