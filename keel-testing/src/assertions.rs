// Test assertions for HTTP responses

use crate::TestResponse;
use keel_core::HttpStatus;

/// Assert that a response has a specific status code
pub fn assert_status(response: &TestResponse, expected: u16) {
    let actual = response.status();
    assert_eq!(
        actual,
        expected,
        "Expected status {}, got {} (body: {})",
        expected,
        actual,
        response.body_string()
    );
}

/// Assert that a response has a specific HTTP status
pub fn assert_http_status(response: &TestResponse, expected: HttpStatus) {
    assert_status(response, expected.code());
}

/// Assert that a response body contains JSON matching expected value
pub fn assert_json<T>(response: &TestResponse, expected: &T)
where
    T: serde::de::DeserializeOwned + PartialEq + std::fmt::Debug,
{
    let actual: T = response
        .body_json()
        .unwrap_or_else(|e| panic!("Failed to deserialize response body: {e}"));
    assert_eq!(actual, *expected, "JSON bodies do not match");
}

/// Assert that a response has a specific header
pub fn assert_header(response: &TestResponse, key: &str, expected: &str) {
    let actual = response.header(key);
    assert_eq!(
        actual,
        Some(expected),
        "Expected header '{}' to be '{}', got {:?}",
        key,
        expected,
        actual
    );
}

/// Assert that a response body contains a string
pub fn assert_body_contains(response: &TestResponse, expected: &str) {
    let body = response.body_string();
    assert!(
        body.contains(expected),
        "Expected body to contain '{}', but it didn't. Body: {}",
        expected,
        body
    );
}

/// Assert that a response is successful (2xx status)
pub fn assert_success(response: &TestResponse) {
    let status = response.status();
    assert!(
        (200..300).contains(&status),
        "Expected successful status (2xx), got {}",
        status
    );
}

/// Assert that a response has JSON content type
pub fn assert_json_content_type(response: &TestResponse) {
    let content_type = response.header("content-type");
    assert!(
        content_type
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false),
        "Expected JSON content type, got {:?}",
        content_type
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::HttpResponse;

    fn create_test_response(status: u16, body: &str) -> TestResponse {
        let mut response = HttpResponse::new(status);
        response.send_bytes(body.to_string()).unwrap();
        TestResponse::new(response)
    }

    #[test]
    fn test_assert_status() {
        let response = create_test_response(201, "made");
        assert_status(&response, 201);
        assert_http_status(&response, HttpStatus::Created);
        assert_success(&response);
    }

    #[test]
    fn test_assert_body_contains() {
        let response = create_test_response(200, "Hello World");
        assert_body_contains(&response, "Hello");
    }

    #[test]
    #[should_panic(expected = "Expected status 200")]
    fn test_assert_status_mismatch() {
        let response = create_test_response(404, "Not Found");
        assert_status(&response, 200);
    }

    #[test]
    fn test_assert_json_content_type() {
        let response = TestResponse::new(
            HttpResponse::json(200, &serde_json::json!({"ok": true})).unwrap(),
        );
        assert_json_content_type(&response);
        assert_json(&response, &serde_json::json!({"ok": true}));
    }

    #[test]
    fn test_assert_header() {
        let mut response = HttpResponse::ok();
        response.insert_header("x-custom", "value").unwrap();
        assert_header(&TestResponse::new(response), "x-custom", "value");
    }
}
