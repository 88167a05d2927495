//! Declarative route criteria and parent/child combination.
//!
//! A [`Mapping`] is plain data. Expressions are kept as strings so mappings
//! compare and combine cheaply; they are compiled into predicates when the
//! route is bound.

use crate::content_negotiation::MediaType;
use crate::{Error, HttpMethod, HttpRequest, Result};

/// Match criteria for a route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mapping {
    name: Option<String>,
    paths: Vec<String>,
    methods: Vec<HttpMethod>,
    params: Vec<String>,
    headers: Vec<String>,
    consumes: Vec<String>,
    produces: Vec<String>,
}

macro_rules! method_mapping {
    ($($fn_name:ident => $method:ident),* $(,)?) => {
        $(
            pub fn $fn_name(path: impl Into<String>) -> Self {
                Self::new().path(path).method(HttpMethod::$method)
            }
        )*
    };
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    method_mapping!(
        get => GET,
        post => POST,
        put => PUT,
        patch => PATCH,
        delete => DELETE,
    );

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        push_unique(&mut self.paths, path.into());
        self
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        push_unique(&mut self.methods, method);
        self
    }

    /// `name`, `!name`, `name=value` or `name!=value`.
    pub fn param(mut self, expr: impl Into<String>) -> Self {
        push_unique(&mut self.params, expr.into());
        self
    }

    /// Same grammar as [`Mapping::param`]; names are case-insensitive.
    pub fn header(mut self, expr: impl Into<String>) -> Self {
        push_unique(&mut self.headers, expr.into());
        self
    }

    /// A media type, optionally negated with a leading `!`.
    pub fn consumes(mut self, expr: impl Into<String>) -> Self {
        push_unique(&mut self.consumes, expr.into());
        self
    }

    pub fn produces(mut self, expr: impl Into<String>) -> Self {
        push_unique(&mut self.produces, expr.into());
        self
    }

    pub fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn methods(&self) -> &[HttpMethod] {
        &self.methods
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn consumes_exprs(&self) -> &[String] {
        &self.consumes
    }

    pub fn produces_exprs(&self) -> &[String] {
        &self.produces
    }

    /// Combines a parent scope with a child (method-level) mapping.
    ///
    /// Paths form the cartesian product of both sides. Methods, params and
    /// headers are unioned. The child's consumes or produces replace the
    /// parent's only when the child declares a non-blank expression, and then
    /// the parent's `Content-Type` or `Accept` header predicates are dropped.
    pub fn combine(&self, child: &Mapping) -> Mapping {
        let paths = combine_paths(&self.paths, &child.paths);

        let mut methods = self.methods.clone();
        for method in &child.methods {
            push_unique(&mut methods, *method);
        }

        let mut params = self.params.clone();
        for param in &child.params {
            push_unique(&mut params, param.clone());
        }

        let child_consumes = declares_any(&child.consumes);
        let child_produces = declares_any(&child.produces);
        let mut headers: Vec<String> = self
            .headers
            .iter()
            .filter(|expr| {
                let name = expression_name(expr);
                !(child_consumes && name.eq_ignore_ascii_case("content-type")
                    || child_produces && name.eq_ignore_ascii_case("accept"))
            })
            .cloned()
            .collect();
        for header in &child.headers {
            push_unique(&mut headers, header.clone());
        }

        Mapping {
            name: child.name.clone().or_else(|| self.name.clone()),
            paths,
            methods,
            params,
            headers,
            consumes: if child_consumes {
                child.consumes.clone()
            } else {
                self.consumes.clone()
            },
            produces: if child_produces {
                child.produces.clone()
            } else {
                self.produces.clone()
            },
        }
    }
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

fn declares_any(exprs: &[String]) -> bool {
    exprs.iter().any(|e| !e.trim().is_empty())
}

fn combine_paths(parents: &[String], children: &[String]) -> Vec<String> {
    match (parents.is_empty(), children.is_empty()) {
        (true, true) => vec![String::new()],
        (false, true) => parents.to_vec(),
        (true, false) => children.to_vec(),
        (false, false) => {
            let mut paths = Vec::with_capacity(parents.len() * children.len());
            for parent in parents {
                for child in children {
                    paths.push(join_path(parent, child));
                }
            }
            paths
        }
    }
}

/// Joins two pattern fragments with exactly one separating slash.
pub fn join_path(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    match (parent.is_empty(), child.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{child}"),
        (false, true) => parent.to_string(),
        (false, false) => format!("{parent}/{child}"),
    }
}

fn expression_name(expr: &str) -> &str {
    let expr = expr.trim().trim_start_matches('!');
    let end = expr.find(['=', '!']).unwrap_or(expr.len());
    expr[..end].trim()
}

/// A compiled header or query parameter predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameValueExpr {
    Present(String),
    Absent(String),
    Equals(String, String),
    NotEquals(String, String),
}

impl NameValueExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let invalid = || Error::Deployment(format!("invalid expression {expr:?}"));
        if let Some((name, value)) = expr.split_once("!=") {
            let name = name.trim();
            if name.is_empty() {
                return Err(invalid());
            }
            return Ok(NameValueExpr::NotEquals(name.to_string(), value.trim().to_string()));
        }
        if let Some((name, value)) = expr.split_once('=') {
            let name = name.trim();
            if name.is_empty() {
                return Err(invalid());
            }
            return Ok(NameValueExpr::Equals(name.to_string(), value.trim().to_string()));
        }
        match expr.strip_prefix('!') {
            Some(name) if !name.trim().is_empty() => Ok(NameValueExpr::Absent(name.trim().to_string())),
            Some(_) => Err(invalid()),
            None if !expr.is_empty() => Ok(NameValueExpr::Present(expr.to_string())),
            None => Err(invalid()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            NameValueExpr::Present(n)
            | NameValueExpr::Absent(n)
            | NameValueExpr::Equals(n, _)
            | NameValueExpr::NotEquals(n, _) => n,
        }
    }

    fn eval<'a>(&self, mut values: impl Iterator<Item = &'a str>) -> bool {
        match self {
            NameValueExpr::Present(_) => values.next().is_some(),
            NameValueExpr::Absent(_) => values.next().is_none(),
            NameValueExpr::Equals(_, v) => values.any(|x| x == v),
            NameValueExpr::NotEquals(_, v) => values.all(|x| x != v),
        }
    }

    pub fn matches_header(&self, request: &HttpRequest) -> bool {
        self.eval(request.header_values(self.name()).into_iter())
    }

    pub fn matches_param(&self, request: &HttpRequest) -> bool {
        self.eval(request.query_values(self.name()).iter().map(String::as_str))
    }
}

/// A compiled consumes/produces entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaTypeExpr {
    pub media_type: MediaType,
    pub negated: bool,
}

impl MediaTypeExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let (negated, raw) = match expr.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, expr),
        };
        let media_type = MediaType::parse(raw)
            .ok_or_else(|| Error::Deployment(format!("invalid media type expression {expr:?}")))?;
        Ok(Self {
            media_type,
            negated,
        })
    }

    pub fn parse_all(exprs: &[String]) -> Result<Vec<Self>> {
        exprs
            .iter()
            .filter(|e| !e.trim().is_empty())
            .map(|e| Self::parse(e))
            .collect()
    }

    pub fn matches(&self, media_type: &MediaType) -> bool {
        self.media_type.includes(media_type) != self.negated
    }
}
