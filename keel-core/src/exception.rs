//! Turning pipeline errors into responses.
//!
//! Resolvers are consulted in priority order (higher first); the first one
//! returning a response wins. When none claims the error, the
//! [`DefaultExceptionResolver`] renders `{"error": ..., "status": ...}` with
//! the status the error maps to.
//!
//! ```ignore
//! struct Teapot;
//!
//! #[async_trait]
//! impl ExceptionResolver for Teapot {
//!     async fn resolve(&self, error: &Error, _request: &HttpRequest) -> Option<HttpResponse> {
//!         matches!(error, Error::Forbidden(_)).then(|| HttpResponse::new(418))
//!     }
//! }
//! ```

use crate::{Error, HttpRequest, HttpResponse};
use async_trait::async_trait;
use http::header;
use serde::Serialize;
use std::sync::Arc;

#[async_trait]
pub trait ExceptionResolver: Send + Sync + 'static {
    /// Return `Some` to handle the error, `None` to pass it on.
    async fn resolve(&self, error: &Error, request: &HttpRequest) -> Option<HttpResponse>;

    /// Higher runs earlier.
    fn priority(&self) -> i32 {
        0
    }

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: String,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'a str>,
}

/// Fallback rendering used when no registered resolver claims an error.
#[derive(Debug, Clone, Default)]
pub struct DefaultExceptionResolver {
    include_kind: bool,
}

impl DefaultExceptionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `kind` field naming the error variant.
    pub fn include_kind(mut self, include: bool) -> Self {
        self.include_kind = include;
        self
    }

    pub fn render(&self, error: &Error) -> HttpResponse {
        let status = error.status_code();
        let body = ErrorBody {
            error: error.to_string(),
            status,
            kind: self.include_kind.then(|| error_kind(error)),
        };
        let mut response = match HttpResponse::json(status, &body) {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(error = %err, "Failed to render error body");
                HttpResponse::new(status)
            }
        };

        if let Error::MethodNotAllowed { allowed, .. } = error
            && let Err(err) = response.insert_header(header::ALLOW.as_str(), &allowed.join(", "))
        {
            tracing::warn!(error = %err, "Invalid Allow header");
        }

        response
    }
}

#[async_trait]
impl ExceptionResolver for DefaultExceptionResolver {
    async fn resolve(&self, error: &Error, _request: &HttpRequest) -> Option<HttpResponse> {
        Some(self.render(error))
    }

    fn priority(&self) -> i32 {
        i32::MIN
    }
}

/// Ordered set of exception resolvers with a default fallback.
#[derive(Clone, Default)]
pub struct ExceptionResolvers {
    resolvers: Vec<Arc<dyn ExceptionResolver>>,
    fallback: DefaultExceptionResolver,
}

impl ExceptionResolvers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<R: ExceptionResolver>(&mut self, resolver: R) {
        self.add_arc(Arc::new(resolver));
    }

    pub fn add_arc(&mut self, resolver: Arc<dyn ExceptionResolver>) {
        self.resolvers.push(resolver);
        self.resolvers
            .sort_by_key(|r| std::cmp::Reverse(r.priority()));
    }

    pub fn with_fallback(mut self, fallback: DefaultExceptionResolver) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    pub async fn handle(&self, error: &Error, request: &HttpRequest) -> HttpResponse {
        for resolver in &self.resolvers {
            if let Some(response) = resolver.resolve(error, request).await {
                tracing::debug!(
                    resolver = resolver.name(),
                    error_kind = error_kind(error),
                    status = response.status,
                    "Error resolved"
                );
                return response;
            }
        }
        self.fallback.render(error)
    }
}

/// Variant name of an error, for logs and error bodies.
pub fn error_kind(error: &Error) -> &'static str {
    match error {
        Error::MissingRequiredValue(_) => "MissingRequiredValue",
        Error::Conversion(_) => "Conversion",
        Error::BadRequest(_) => "BadRequest",
        Error::Deserialization(_) => "Deserialization",
        Error::Unauthorized(_) => "Unauthorized",
        Error::Forbidden(_) => "Forbidden",
        Error::RouteNotFound(_) => "RouteNotFound",
        Error::NotFound(_) => "NotFound",
        Error::MethodNotAllowed { .. } => "MethodNotAllowed",
        Error::NotAcceptable { .. } => "NotAcceptable",
        Error::UnsupportedMediaType(_) => "UnsupportedMediaType",
        Error::Conflict(_) => "Conflict",
        Error::TooManyRequests(_) => "TooManyRequests",
        Error::NoSuitableResolver(_) => "NoSuitableResolver",
        Error::HandlerInvocation(_) => "HandlerInvocation",
        Error::SchedulerRejected(_) => "SchedulerRejected",
        Error::FirstByteTimeout(_) => "FirstByteTimeout",
        Error::Serialization(_) => "Serialization",
        Error::ResponseWrite(_) => "ResponseWrite",
        Error::Deployment(_) => "Deployment",
        Error::Internal(_) => "Internal",
        Error::Io(_) => "Io",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HttpMethod;

    struct ForbiddenAsTeapot;

    #[async_trait]
    impl ExceptionResolver for ForbiddenAsTeapot {
        async fn resolve(&self, error: &Error, _request: &HttpRequest) -> Option<HttpResponse> {
            matches!(error, Error::Forbidden(_)).then(|| HttpResponse::new(418))
        }
    }

    fn request() -> HttpRequest {
        HttpRequest::new(HttpMethod::GET, "/x")
    }

    #[test]
    fn test_default_body_and_status() {
        let response = DefaultExceptionResolver::new().render(&Error::MissingRequiredValue("name".into()));
        assert_eq!(response.status, 400);
        let body: serde_json::Value = serde_json::from_slice(&response.body()).unwrap();
        assert_eq!(body["status"], 400);
        assert_eq!(body["error"], "Missing required value: name");
        assert!(body.get("kind").is_none());
    }

    #[test]
    fn test_method_not_allowed_sets_allow() {
        let err = Error::MethodNotAllowed {
            message: "DELETE /a".into(),
            allowed: vec!["GET".into(), "POST".into()],
        };
        let response = DefaultExceptionResolver::new().include_kind(true).render(&err);
        assert_eq!(response.status, 405);
        assert_eq!(response.header("allow"), Some("GET, POST"));
        let body: serde_json::Value = serde_json::from_slice(&response.body()).unwrap();
        assert_eq!(body["kind"], "MethodNotAllowed");
    }

    #[tokio::test]
    async fn test_chain_falls_back() {
        let mut resolvers = ExceptionResolvers::new();
        resolvers.add(ForbiddenAsTeapot);

        let claimed = resolvers.handle(&Error::Forbidden("no".into()), &request()).await;
        assert_eq!(claimed.status, 418);

        let fallback = resolvers
            .handle(&Error::SchedulerRejected("biz".into()), &request())
            .await;
        assert_eq!(fallback.status, 503);
    }
}
