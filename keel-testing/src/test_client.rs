// In-process test client

use keel_core::{Deployment, Dispatcher, Error, HttpMethod, HttpRequest, HttpResponse};
use serde::Serialize;
use std::sync::Arc;

/// Drives a [`Dispatcher`] directly; no socket is opened.
#[derive(Clone)]
pub struct TestClient {
    dispatcher: Arc<Dispatcher>,
}

impl TestClient {
    pub fn new(dispatcher: impl Into<Arc<Dispatcher>>) -> Self {
        Self {
            dispatcher: dispatcher.into(),
        }
    }

    /// Builds the deployment, failing the same way the application would.
    pub fn from_deployment(deployment: Deployment) -> keel_core::Result<Self> {
        Ok(Self::new(deployment.build()?))
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Make a GET request
    pub async fn get(&self, path: &str) -> TestResponse {
        self.send(TestRequestBuilder::new(HttpMethod::GET, path)).await
    }

    /// Make a POST request with a JSON body
    pub async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> TestResponse {
        self.send(TestRequestBuilder::new(HttpMethod::POST, path).json(body))
            .await
    }

    /// Make a DELETE request
    pub async fn delete(&self, path: &str) -> TestResponse {
        self.send(TestRequestBuilder::new(HttpMethod::DELETE, path))
            .await
    }

    pub async fn send(&self, request: TestRequestBuilder) -> TestResponse {
        self.execute(request.build()).await
    }

    pub async fn execute(&self, request: HttpRequest) -> TestResponse {
        TestResponse::new(self.dispatcher.handle(request).await)
    }
}

/// Builder for test requests
///
/// Panics on malformed headers or bodies; it is meant for tests.
pub struct TestRequestBuilder {
    method: HttpMethod,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    query_params: Vec<(String, String)>,
}

impl TestRequestBuilder {
    pub fn new(method: HttpMethod, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
            query_params: Vec::new(),
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new(HttpMethod::GET, path)
    }

    pub fn post(path: &str) -> Self {
        Self::new(HttpMethod::POST, path)
    }

    /// Add a header; repeated names keep every value.
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    pub fn accept(self, value: &str) -> Self {
        self.header("accept", value)
    }

    pub fn content_type(self, value: &str) -> Self {
        self.header("content-type", value)
    }

    /// Set the body
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Set JSON body
    pub fn json<T: Serialize>(mut self, data: &T) -> Self {
        self.body = serde_json::to_vec(data)
            .unwrap_or_else(|e| panic!("test body is not serializable: {e}"));
        self.content_type("application/json")
    }

    /// Set form body
    pub fn form<T: Serialize>(mut self, data: &T) -> Self {
        self.body = serde_urlencoded::to_string(data)
            .unwrap_or_else(|e| panic!("test form is not serializable: {e}"))
            .into_bytes();
        self.content_type("application/x-www-form-urlencoded")
    }

    /// Add a query parameter
    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query_params.push((key.to_string(), value.to_string()));
        self
    }

    /// Build the request
    pub fn build(self) -> HttpRequest {
        let target = if self.query_params.is_empty() {
            self.path
        } else {
            let query = self
                .query_params
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            let separator = if self.path.contains('?') { '&' } else { '?' };
            format!("{}{separator}{query}", self.path)
        };

        let mut request = HttpRequest::new(self.method, &target).with_body(self.body);
        for (name, value) in &self.headers {
            if let Err(err) = request.append_header(name, value) {
                panic!("invalid test header {name}: {err}");
            }
        }
        request
    }
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    response: HttpResponse,
}

impl TestResponse {
    pub fn new(response: HttpResponse) -> Self {
        Self { response }
    }

    pub fn inner(&self) -> &HttpResponse {
        &self.response
    }

    pub fn into_inner(self) -> HttpResponse {
        self.response
    }

    pub fn status(&self) -> u16 {
        self.response.status
    }

    pub fn is_aborted(&self) -> bool {
        self.response.is_aborted()
    }

    /// Get the response body as string
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.response.body()).into_owned()
    }

    /// Get the response body as JSON
    pub fn body_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.response.body()).map_err(Error::from)
    }

    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.response.header(key)
    }

    /// The `error` field of a default error body.
    pub fn error_message(&self) -> Option<String> {
        self.body_json::<serde_json::Value>()
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
    }
}
