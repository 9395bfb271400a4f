//! The seam to the HTTP client. Implementations resolve to the response's
//! `data` payload, or fail with a [`TransportError`].

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::TransportError;

pub type TransportFuture = BoxFuture<'static, Result<Value, TransportError>>;

pub trait Transport: Send + Sync {
    fn get(&self, path: &str) -> TransportFuture;

    fn post(&self, path: &str, body: Value) -> TransportFuture;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn get(&self, path: &str) -> TransportFuture {
        (**self).get(path)
    }

    fn post(&self, path: &str, body: Value) -> TransportFuture {
        (**self).post(path, body)
    }
}
