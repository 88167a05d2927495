// Error types for the keel request pipeline

use crate::HttpStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A required named value had no raw value and no default.
    #[error("Missing required value: {0}")]
    MissingRequiredValue(String),

    /// A raw string could not be converted to the parameter type.
    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    /// Carries the methods the path does support, for the `Allow` header.
    #[error("Method not allowed: {message}")]
    MethodNotAllowed { message: String, allowed: Vec<String> },

    /// No producible media type satisfied the request; lists what was tried.
    #[error("Not Acceptable: could not produce any of [{}]", .attempted.join(", "))]
    NotAcceptable { attempted: Vec<String> },

    #[error("Unsupported Media Type: {0}")]
    UnsupportedMediaType(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Too Many Requests: {0}")]
    TooManyRequests(String),

    /// No resolver supports a parameter or entity. Raised while binding routes,
    /// or at request time when the binding deferred the decision.
    #[error("No suitable resolver for {0}")]
    NoSuitableResolver(String),

    /// The handler failed in a way that is not already a pipeline error.
    #[error("Handler invocation failed: {0}")]
    HandlerInvocation(String),

    /// The scheduler refused the task before the handler ran.
    #[error("Scheduler rejected task: {0}")]
    SchedulerRejected(String),

    /// The handler did not produce a response before the first-byte deadline.
    #[error("First byte timeout: {0}")]
    FirstByteTimeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The response sink was used in a way its write mode forbids.
    #[error("Response write error: {0}")]
    ResponseWrite(String),

    /// Route binding failed; deployment is aborted.
    #[error("Deployment error: {0}")]
    Deployment(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        self.http_status().code()
    }

    /// Get the HttpStatus enum for this error
    pub fn http_status(&self) -> HttpStatus {
        match self {
            Error::MissingRequiredValue(_)
            | Error::Conversion(_)
            | Error::BadRequest(_)
            | Error::Deserialization(_) => HttpStatus::BadRequest,
            Error::Unauthorized(_) => HttpStatus::Unauthorized,
            Error::Forbidden(_) => HttpStatus::Forbidden,
            Error::RouteNotFound(_) | Error::NotFound(_) => HttpStatus::NotFound,
            Error::MethodNotAllowed { .. } => HttpStatus::MethodNotAllowed,
            Error::NotAcceptable { .. } => HttpStatus::NotAcceptable,
            Error::UnsupportedMediaType(_) => HttpStatus::UnsupportedMediaType,
            Error::Conflict(_) => HttpStatus::Conflict,
            Error::TooManyRequests(_) => HttpStatus::TooManyRequests,
            Error::SchedulerRejected(_) | Error::FirstByteTimeout(_) => {
                HttpStatus::ServiceUnavailable
            }
            Error::NoSuitableResolver(_)
            | Error::HandlerInvocation(_)
            | Error::Serialization(_)
            | Error::ResponseWrite(_)
            | Error::Deployment(_)
            | Error::Internal(_)
            | Error::Io(_) => HttpStatus::InternalServerError,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.http_status().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.http_status().is_server_error()
    }

    /// Wraps an arbitrary handler failure.
    pub fn handler(err: impl std::fmt::Display) -> Self {
        Error::HandlerInvocation(err.to_string())
    }

    pub fn not_acceptable<I, S>(attempted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Error::NotAcceptable {
            attempted: attempted.into_iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Error::Deserialization(err.to_string())
        } else {
            Error::Serialization(err.to_string())
        }
    }
}
