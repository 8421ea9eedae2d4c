//! Capability registry.
//!
//! Operations are registered by `(capability, operation)` with a typed
//! parameter struct. Arguments are deserialized into that struct at
//! execution time, so no reflection is involved.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use jobmill_protocols::{JobContext, JobError, OperationHandler, RetryPolicy};

/// Per-operation settings.
#[derive(Debug, Clone, Default)]
pub struct OperationOptions {
    pub retry_policy: Option<RetryPolicy>,
    pub queue: Option<String>,
}

impl OperationOptions {
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

/// A resolved operation.
#[derive(Clone)]
pub struct Registration {
    pub capability: String,
    pub operation: String,
    pub handler: Arc<dyn OperationHandler>,
    pub options: OperationOptions,
}

impl Registration {
    pub fn display_name(&self) -> String {
        format!("{}.{}", self.capability, self.operation)
    }
}

/// Adapts a typed async fn to [`OperationHandler`].
struct TypedHandler<P, F> {
    func: F,
    _params: PhantomData<fn(P)>,
}

#[async_trait]
impl<P, F, Fut, R> OperationHandler for TypedHandler<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, JobError>> + Send + 'static,
    R: Serialize + Send + 'static,
{
    async fn invoke(&self, args: Value, ctx: JobContext) -> Result<Value, JobError> {
        let params = parse_params::<P>(args)?;
        let output = (self.func)(params, ctx).await?;
        serde_json::to_value(output)
            .map_err(|e| JobError::Payload(format!("cannot serialize result: {}", e)))
    }
}

/// Missing arguments fall back to an empty object so that parameter structs
/// made of optional fields accept them.
fn parse_params<P: DeserializeOwned>(args: Value) -> Result<P, JobError> {
    let was_null = args.is_null();
    match serde_json::from_value::<P>(args) {
        Ok(params) => Ok(params),
        Err(_) if was_null => serde_json::from_value(Value::Object(Default::default()))
            .map_err(|e| JobError::Deserialization(format!("invalid arguments: {}", e))),
        Err(e) => Err(JobError::Deserialization(format!("invalid arguments: {}", e))),
    }
}

/// Registry of capability operations.
pub struct CapabilityRegistry {
    operations: DashMap<String, Registration>,
}

fn key(capability: &str, operation: &str) -> String {
    format!("{}.{}", capability, operation)
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            operations: DashMap::new(),
        }
    }

    /// Register a typed operation.
    pub fn register<P, F, Fut, R>(
        &self,
        capability: &str,
        operation: &str,
        func: F,
    ) -> Result<(), JobError>
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, JobError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.register_with(capability, operation, OperationOptions::default(), func)
    }

    /// Register a typed operation with a retry policy or default queue.
    pub fn register_with<P, F, Fut, R>(
        &self,
        capability: &str,
        operation: &str,
        options: OperationOptions,
        func: F,
    ) -> Result<(), JobError>
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, JobError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let handler = Arc::new(TypedHandler {
            func,
            _params: PhantomData,
        });
        self.register_handler(capability, operation, options, handler)
    }

    /// Register an untyped handler.
    pub fn register_handler(
        &self,
        capability: &str,
        operation: &str,
        options: OperationOptions,
        handler: Arc<dyn OperationHandler>,
    ) -> Result<(), JobError> {
        let id = key(capability, operation);
        if self.operations.contains_key(&id) {
            return Err(JobError::AlreadyRegistered(id));
        }
        debug!("Registered operation {}", id);
        self.operations.insert(
            id,
            Registration {
                capability: capability.to_string(),
                operation: operation.to_string(),
                handler,
                options,
            },
        );
        Ok(())
    }

    /// Resolve an operation or fail with `UnknownCapability`.
    pub fn resolve(&self, capability: &str, operation: &str) -> Result<Registration, JobError> {
        self.operations
            .get(&key(capability, operation))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| JobError::UnknownCapability {
                capability: capability.to_string(),
                operation: operation.to_string(),
            })
    }

    pub fn contains(&self, capability: &str, operation: &str) -> bool {
        self.operations.contains_key(&key(capability, operation))
    }

    /// Options registered for a `capability.operation` display name.
    pub fn options_for(&self, display_name: &str) -> Option<OperationOptions> {
        self.operations
            .get(display_name)
            .map(|entry| entry.value().options.clone())
    }

    /// Registered display names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
