//! Per-request state threaded through every pipeline stage.

use crate::extensions::Extensions;
use crate::{Error, HttpRequest, HttpResponse, Result};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Matrix variables of one path segment, keyed by matrix name.
pub type MatrixVariables = HashMap<String, Vec<String>>;

/// Identifier assigned to each request on entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Name-keyed values that interceptors and resolvers hand to later stages.
#[derive(Default)]
pub struct Attributes {
    map: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Attributes {
    pub fn insert<T: Send + Sync + 'static>(&mut self, name: impl Into<String>, value: T) {
        self.map.insert(name.into(), Arc::new(value));
    }

    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<&T> {
        self.map.get(name).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_arc<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.map
            .get(name)
            .and_then(|v| v.clone().downcast::<T>().ok())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.map.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.map.keys()).finish()
    }
}

#[derive(Debug, Default)]
struct ResponseMeta {
    status: Option<u16>,
    headers: Vec<(String, String)>,
}

/// Status and header changes requested by a handler.
///
/// Handlers receive owned arguments, so the response itself stays with the
/// pipeline; changes recorded here are applied before the entity is written.
#[derive(Debug, Clone, Default)]
pub struct ResponseHandle {
    inner: Arc<Mutex<ResponseMeta>>,
}

impl ResponseHandle {
    pub fn set_status(&self, status: u16) {
        self.inner.lock().status = Some(status);
    }

    pub fn insert_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.lock().headers.push((name.into(), value.into()));
    }

    pub fn status(&self) -> Option<u16> {
        self.inner.lock().status
    }

    pub(crate) fn apply_to(&self, response: &mut HttpResponse) -> Result<()> {
        let meta = std::mem::take(&mut *self.inner.lock());
        if let Some(status) = meta.status {
            response.status = status;
        }
        for (name, value) in &meta.headers {
            response.insert_header(name, value)?;
        }
        Ok(())
    }
}

/// Owns everything one request touches: the request, the response sink,
/// matched path variables and an attribute bag.
///
/// Never shared between requests.
pub struct RequestContext {
    request: Arc<HttpRequest>,
    response: HttpResponse,
    attributes: Attributes,
    path_variables: HashMap<String, String>,
    raw_path_segments: HashMap<String, String>,
    matrix_variables: OnceCell<HashMap<String, MatrixVariables>>,
    response_handle: ResponseHandle,
    extensions: Arc<Extensions>,
    id: RequestId,
}

impl RequestContext {
    pub fn new(request: HttpRequest) -> Self {
        Self::with_extensions(request, Arc::new(Extensions::new()))
    }

    pub fn with_extensions(request: HttpRequest, extensions: Arc<Extensions>) -> Self {
        Self {
            request: Arc::new(request),
            response: HttpResponse::ok(),
            attributes: Attributes::default(),
            path_variables: HashMap::new(),
            raw_path_segments: HashMap::new(),
            matrix_variables: OnceCell::new(),
            response_handle: ResponseHandle::default(),
            extensions,
            id: RequestId(Uuid::new_v4()),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn request_arc(&self) -> Arc<HttpRequest> {
        self.request.clone()
    }

    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut HttpResponse {
        &mut self.response
    }

    /// Replaces the response unless a body was already committed.
    pub fn reset_response(&mut self, response: HttpResponse) -> Result<()> {
        if self.response.is_committed() {
            return Err(Error::ResponseWrite(
                "cannot replace a committed response".into(),
            ));
        }
        self.response = response;
        Ok(())
    }

    pub fn into_response(self) -> HttpResponse {
        self.response
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    pub fn response_handle(&self) -> &ResponseHandle {
        &self.response_handle
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Records the raw segments bound to each template variable.
    ///
    /// Plain values drop any `;matrix` suffix and are percent-decoded here;
    /// matrix variables are split out on first access.
    pub fn set_path_variables(&mut self, raw: HashMap<String, String>) {
        self.path_variables = raw
            .iter()
            .map(|(name, segment)| {
                let plain = segment.split(';').next().unwrap_or_default();
                (name.clone(), percent_decode(plain))
            })
            .collect();
        self.raw_path_segments = raw;
        self.matrix_variables = OnceCell::new();
    }

    pub fn path_variable(&self, name: &str) -> Option<&str> {
        self.path_variables.get(name).map(String::as_str)
    }

    pub fn path_variables(&self) -> &HashMap<String, String> {
        &self.path_variables
    }

    /// Matrix variables of every path variable, parsed once per request.
    pub fn matrix_variables(&self) -> &HashMap<String, MatrixVariables> {
        self.matrix_variables.get_or_init(|| {
            self.raw_path_segments
                .iter()
                .map(|(name, segment)| (name.clone(), parse_matrix(segment)))
                .collect()
        })
    }

    /// Values of a matrix variable, either on one path variable or on the
    /// first path variable that carries it.
    pub fn matrix_values(&self, name: &str, path_var: Option<&str>) -> Vec<String> {
        let all = self.matrix_variables();
        match path_var {
            Some(var) => all
                .get(var)
                .and_then(|m| m.get(name))
                .cloned()
                .unwrap_or_default(),
            None => {
                let mut vars: Vec<_> = all.keys().collect();
                vars.sort();
                vars.into_iter()
                    .find_map(|var| all[var].get(name).cloned())
                    .unwrap_or_default()
            }
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("method", &self.request.method)
            .field("path", &self.request.path)
            .field("attributes", &self.attributes)
            .finish()
    }
}

fn percent_decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

/// Splits `value;a=1,2;b=3` into `{a: [1, 2], b: [3]}`.
fn parse_matrix(segment: &str) -> MatrixVariables {
    let mut vars = MatrixVariables::new();
    for pair in segment.split(';').skip(1) {
        let Some((key, values)) = pair.split_once('=') else {
            continue;
        };
        let entry = vars.entry(percent_decode(key.trim())).or_default();
        entry.extend(values.split(',').map(|v| percent_decode(v.trim())));
    }
    vars
}
