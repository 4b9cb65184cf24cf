//! Replayable request and buffered response values.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::TransportError;

/// Body of an [`ApiRequest`]. Held by value so the request can be replayed.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(serde_json::Value),
    Bytes {
        content_type: String,
        data: Bytes,
    },
    /// Single-file multipart upload.
    File {
        field: String,
        file_name: String,
        data: Bytes,
    },
}

/// An application request against the backend, relative to its base URL.
///
/// Immutable once handed to the pipeline.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<RequestBody>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Some(RequestBody::Json(value));
        self
    }

    pub fn bytes(mut self, content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.body = Some(RequestBody::Bytes {
            content_type: content_type.into(),
            data: data.into(),
        });
        self
    }

    pub fn file(
        mut self,
        field: impl Into<String>,
        file_name: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.body = Some(RequestBody::File {
            field: field.into(),
            file_name: file_name.into(),
            data: data.into(),
        });
        self
    }

    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    #[inline]
    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }
}

/// A fully buffered backend response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl ApiResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Response with a status and empty headers/body.
    pub fn with_status(status: StatusCode) -> Self {
        Self::new(status, HeaderMap::new(), Bytes::new())
    }

    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Carrier of application requests (the backend's authenticated-call capability).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// A re-playable unit of work producing a response.
pub type Invoke =
    Arc<dyn Fn() -> BoxFuture<'static, Result<ApiResponse, TransportError>> + Send + Sync>;

/// Build an [`Invoke`] that issues `request` through `transport` each time it is called.
pub fn invoke_via(transport: Arc<dyn Transport>, request: ApiRequest) -> Invoke {
    let request = Arc::new(request);
    Arc::new(move || {
        let transport = Arc::clone(&transport);
        let request = Arc::clone(&request);
        Box::pin(async move { transport.call(&request).await })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = ApiRequest::post("/api/asset/add")
            .query("name", "Pump 1")
            .query("parentName", "Plant");
        assert_eq!(request.method(), &Method::POST);
        assert_eq!(request.path(), "/api/asset/add");
        assert_eq!(request.query_pairs().len(), 2);
        assert!(request.body().is_none());
    }

    #[test]
    fn test_response_json() {
        let response = ApiResponse::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(br#"{"name":"root","children":[]}"#),
        );
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["name"], "root");
        assert!(response.is_success());
    }
}
