//! Call-site types: what to invoke and what came back.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{CallId, WorkerRequest};
use crate::error::{HostError, Result};
use crate::host::Host;

/// An export to invoke in the worker.
///
/// Arguments are spread into the call: `Request::new("m.js").method("add").arg(1).arg(2)`
/// calls `add(1, 2)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    import: String,
    method: Option<String>,
    args: Vec<serde_json::Value>,
}

impl Request {
    /// Call the default export of `import`.
    pub fn new(import: impl Into<String>) -> Self {
        Self {
            import: import.into(),
            method: None,
            args: Vec::new(),
        }
    }

    pub fn method(mut self, name: impl Into<String>) -> Self {
        self.method = Some(name.into());
        self
    }

    pub fn arg(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I>(mut self, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<serde_json::Value>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Append any serializable value as the next argument.
    pub fn try_arg<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        let value = serde_json::to_value(value).map_err(HostError::Encode)?;
        self.args.push(value);
        Ok(self)
    }

    pub fn import_path(&self) -> &str {
        &self.import
    }

    pub(crate) fn into_frame(self, id: CallId) -> WorkerRequest {
        WorkerRequest::call(id.to_string(), self.import, self.method, self.args)
    }
}

/// A worker's return value, still in serialized form.
///
/// Empty when the export returned nothing (`undefined`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload(Option<serde_json::Value>);

impl Payload {
    pub(crate) fn new(value: Option<serde_json::Value>) -> Self {
        Self(value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn value(&self) -> Option<&serde_json::Value> {
        self.0.as_ref()
    }

    pub fn into_value(self) -> Option<serde_json::Value> {
        self.0
    }

    /// Decode into `T`; `None` when the payload is empty.
    pub fn decode<T: DeserializeOwned>(self) -> Result<Option<T>> {
        self.0
            .map(serde_json::from_value)
            .transpose()
            .map_err(HostError::Decode)
    }

    /// Decode into `T`, reading an empty payload as JSON `null`.
    pub fn decode_or_null<T: DeserializeOwned>(self) -> Result<T> {
        serde_json::from_value(self.0.unwrap_or(serde_json::Value::Null)).map_err(HostError::Decode)
    }
}

/// An import/method pair bound to a host with fixed argument and result types.
pub struct Method<A, R> {
    host: Host,
    import: String,
    method: Option<String>,
    _types: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for Method<A, R> {
    fn clone(&self) -> Self {
        Self {
            host: self.host.clone(),
            import: self.import.clone(),
            method: self.method.clone(),
            _types: PhantomData,
        }
    }
}

impl<A, R> Method<A, R>
where
    A: Serialize,
    R: DeserializeOwned,
{
    pub(crate) fn new(host: Host, import: String, method: Option<String>) -> Self {
        Self {
            host,
            import,
            method,
            _types: PhantomData,
        }
    }

    fn request(&self, arg: &A) -> Result<Request> {
        let mut request = Request::new(self.import.clone());
        request.method = self.method.clone();
        request.try_arg(arg)
    }

    pub async fn call(&self, arg: &A, cancel: &CancellationToken) -> Result<R> {
        let request = self.request(arg)?;
        self.host.call_as(request, cancel).await
    }

    pub async fn call_timeout(&self, arg: &A, timeout: std::time::Duration) -> Result<R> {
        let request = self.request(arg)?;
        self.host.call_timeout(request, timeout).await?.decode_or_null()
    }
}
