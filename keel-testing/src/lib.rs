//! Testing utilities for keel.
//!
//! - **TestClient** - drives a `Dispatcher` in-process
//! - **TestRequestBuilder** - method, path, query, headers, JSON or form body
//! - **TestResponse** - status, header and body accessors
//! - **RecordingInterceptor** - records interceptor hooks for ordering checks
//! - **Assertions** - panicking helpers with readable messages
//!
//! ## Quick Start
//!
//! ```no_run
//! use keel_core::{Deployment, HandlerMethod, Mapping, Args, Error};
//! use keel_testing::*;
//!
//! # tokio_test::block_on(async {
//! let client = TestClient::from_deployment(
//!     Deployment::new().route(HandlerMethod::new(
//!         "hello",
//!         Mapping::get("/hello"),
//!         |_args: Args| async { Ok::<_, Error>("Hello!") },
//!     )),
//! )
//! .unwrap();
//!
//! let response = client.get("/hello").await;
//! assert_status(&response, 200);
//! assert_eq!(response.body_string(), "Hello!");
//! # });
//! ```

mod assertions;
mod recording;
mod test_client;

pub use assertions::{
    assert_body_contains, assert_header, assert_http_status, assert_json,
    assert_json_content_type, assert_status, assert_success,
};
pub use recording::{Hook, HookLog, RecordingInterceptor};
pub use test_client::{TestClient, TestRequestBuilder, TestResponse};

// Re-export common testing utilities
pub use tokio::test as tokio_test;
