use super::stream::ValueStream;
use super::BridgeError;
use crate::state::Projection;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type ValueSource = BoxStream<'static, Result<Value, BridgeError>>;

/// A backend service reachable through the bridge.
#[async_trait]
pub trait BridgeService: Send + Sync {
    /// One-shot request. Implementations should stop work once `cancel` fires.
    async fn call(
        &self,
        method: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<Value, BridgeError>;

    /// Opens a value stream. Dropping the returned stream must release every
    /// subscription it holds.
    fn open_stream(&self, method: &str, params: Value) -> Result<ValueSource, BridgeError>;
}

/// Dispatches `"<service>.<method>"` names to registered services.
#[derive(Default, Clone)]
pub struct Router {
    services: HashMap<String, Arc<dyn BridgeService>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: &str, service: Arc<dyn BridgeService>) -> Self {
        self.services.insert(name.to_string(), service);
        self
    }

    fn resolve<'m>(
        &self,
        qualified: &'m str,
    ) -> Result<(Arc<dyn BridgeService>, &'m str), BridgeError> {
        let (service, method) = qualified
            .split_once('.')
            .ok_or_else(|| BridgeError::unknown_method(qualified))?;
        let service = self
            .services
            .get(service)
            .cloned()
            .ok_or_else(|| BridgeError::unknown_method(qualified))?;
        Ok((service, method))
    }

    pub async fn call(
        &self,
        qualified: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<Value, BridgeError> {
        let (service, method) = self.resolve(qualified)?;
        service.call(method, params, cancel).await
    }

    pub fn open_stream(&self, qualified: &str, params: Value) -> Result<ValueSource, BridgeError> {
        let (service, method) = self.resolve(qualified)?;
        service.open_stream(method, params)
    }

    /// In-process stream; the service is only asked to open it on first pull.
    pub fn open_local(&self, qualified: &str, params: Value) -> ValueStream<Value> {
        let router = self.clone();
        let qualified = qualified.to_string();
        ValueStream::lazy(move || router.open_stream(&qualified, params))
    }
}

pub fn decode_params<P: DeserializeOwned>(params: Value) -> Result<P, BridgeError> {
    serde_json::from_value(params).map_err(|err| BridgeError::invalid_params(err.to_string()))
}

pub fn encode_value<R: Serialize>(value: &R) -> Result<Value, BridgeError> {
    serde_json::to_value(value).map_err(|err| {
        BridgeError::new(super::ErrorKind::ProtocolGuard, format!("unserializable result: {err}"))
    })
}

/// Serializes each element of a projection into a bridge value stream.
pub fn projection_source<U>(projection: Projection<U>) -> ValueSource
where
    U: Serialize + Send + 'static,
{
    projection.map(|view| encode_value(&view)).boxed()
}
