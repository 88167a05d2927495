// Route matching for bound mappings

use crate::content_negotiation::MediaType;
use crate::handler::HandlerMethod;
use crate::mapping::{Mapping, MediaTypeExpr, NameValueExpr};
use crate::{Error, HttpMethod, HttpRequest, Result};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    /// `{name}` or `{name:regex}`.
    Variable { name: String, pattern: Option<Regex> },
    /// `*`, exactly one segment.
    Wildcard,
    /// `**`, any remaining segments; only valid last.
    CatchAll,
}

/// A compiled path pattern such as `/users/{id:\d+}/cars/{car}`.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        for (i, part) in parts.iter().enumerate() {
            let segment = if *part == "**" {
                if i + 1 != parts.len() {
                    return Err(Error::Deployment(format!(
                        "'**' must be the last segment in {pattern:?}"
                    )));
                }
                Segment::CatchAll
            } else if *part == "*" {
                Segment::Wildcard
            } else if let Some(inner) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                let (name, constraint) = match inner.split_once(':') {
                    Some((name, re)) => {
                        let re = Regex::new(&format!("^(?:{re})$")).map_err(|e| {
                            Error::Deployment(format!("invalid constraint on {{{name}}}: {e}"))
                        })?;
                        (name, Some(re))
                    }
                    None => (inner, None),
                };
                if name.is_empty() {
                    return Err(Error::Deployment(format!(
                        "unnamed variable in {pattern:?}"
                    )));
                }
                Segment::Variable {
                    name: name.to_string(),
                    pattern: constraint,
                }
            } else {
                Segment::Literal(part.to_string())
            };
            segments.push(segment);
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Variables and wildcards; fewer means more specific.
    pub fn variable_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| !matches!(s, Segment::Literal(_)))
            .count()
    }

    /// Matches a request path, returning raw variable segments.
    ///
    /// Matrix parameters (`;k=v`) are ignored when comparing literals and
    /// kept on variable values for later splitting.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut vars = HashMap::new();
        let mut index = 0;
        for segment in &self.segments {
            match segment {
                Segment::CatchAll => return Some(vars),
                Segment::Wildcard => {
                    parts.get(index)?;
                }
                Segment::Literal(literal) => {
                    let part = parts.get(index)?;
                    if strip_matrix(part) != literal {
                        return None;
                    }
                }
                Segment::Variable { name, pattern } => {
                    let part = parts.get(index)?;
                    if let Some(re) = pattern {
                        let plain = urlencoding::decode(strip_matrix(part)).ok()?;
                        if !re.is_match(&plain) {
                            return None;
                        }
                    }
                    vars.insert(name.clone(), (*part).to_string());
                }
            }
            index += 1;
        }
        (index == parts.len()).then_some(vars)
    }
}

fn strip_matrix(segment: &str) -> &str {
    segment.split(';').next().unwrap_or(segment)
}

/// A mapping compiled into predicates.
#[derive(Debug, Clone)]
pub struct RoutePredicate {
    templates: Vec<PathTemplate>,
    methods: Vec<HttpMethod>,
    headers: Vec<NameValueExpr>,
    params: Vec<NameValueExpr>,
    consumes: Vec<MediaTypeExpr>,
    produces: Vec<MediaTypeExpr>,
}

/// How far a route got before being rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchStage {
    Path,
    Method,
    Conditions,
    Consumes,
    Produces,
}

impl RoutePredicate {
    pub fn compile(mapping: &Mapping) -> Result<Self> {
        let templates = mapping
            .paths()
            .iter()
            .map(|p| PathTemplate::parse(p))
            .collect::<Result<Vec<_>>>()?;
        let headers = mapping
            .headers()
            .iter()
            .map(|e| NameValueExpr::parse(e))
            .collect::<Result<Vec<_>>>()?;
        let params = mapping
            .params()
            .iter()
            .map(|e| NameValueExpr::parse(e))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            templates,
            methods: mapping.methods().to_vec(),
            headers,
            params,
            consumes: MediaTypeExpr::parse_all(mapping.consumes_exprs())?,
            produces: MediaTypeExpr::parse_all(mapping.produces_exprs())?,
        })
    }

    pub fn templates(&self) -> &[PathTemplate] {
        &self.templates
    }

    pub fn methods(&self) -> &[HttpMethod] {
        &self.methods
    }

    /// Non-negated produces types, for response negotiation.
    pub fn producible(&self) -> Vec<MediaType> {
        self.produces
            .iter()
            .filter(|e| !e.negated)
            .map(|e| e.media_type.clone())
            .collect()
    }

    pub fn specificity(&self) -> usize {
        self.templates
            .iter()
            .map(PathTemplate::variable_count)
            .min()
            .unwrap_or(0)
    }

    fn match_path(&self, path: &str) -> Option<HashMap<String, String>> {
        self.templates.iter().find_map(|t| t.matches(path))
    }

    /// An empty method list accepts every method; HEAD falls back to GET.
    fn allows(&self, method: HttpMethod) -> bool {
        self.methods.is_empty()
            || self.methods.contains(&method)
            || method == HttpMethod::HEAD && self.methods.contains(&HttpMethod::GET)
    }

    fn conditions_hold(&self, request: &HttpRequest) -> bool {
        self.headers.iter().all(|h| h.matches_header(request))
            && self.params.iter().all(|p| p.matches_param(request))
    }

    fn consumes_ok(&self, request: &HttpRequest) -> bool {
        if self.consumes.is_empty() {
            return true;
        }
        let content_type = request
            .content_type()
            .unwrap_or_else(MediaType::octet_stream);
        let (negated, positive): (Vec<_>, Vec<_>) = self.consumes.iter().partition(|e| e.negated);
        negated.iter().all(|e| e.matches(&content_type))
            && (positive.is_empty() || positive.iter().any(|e| e.matches(&content_type)))
    }

    fn produces_ok(&self, accepted: &[MediaType]) -> bool {
        if self.produces.is_empty() || accepted.is_empty() {
            return true;
        }
        accepted.iter().any(|wanted| {
            self.produces
                .iter()
                .any(|e| e.media_type.is_compatible_with(wanted) != e.negated)
        })
    }

    /// Tests the route against a request, in method, path, conditions,
    /// consumes order. Produces is checked separately.
    pub fn test(
        &self,
        request: &HttpRequest,
    ) -> std::result::Result<HashMap<String, String>, MatchStage> {
        let vars = self.match_path(&request.path).ok_or(MatchStage::Path)?;
        if !self.allows(request.method) {
            return Err(MatchStage::Method);
        }
        if !self.conditions_hold(request) {
            return Err(MatchStage::Conditions);
        }
        if !self.consumes_ok(request) {
            return Err(MatchStage::Consumes);
        }
        Ok(vars)
    }
}

/// A combined mapping bound to its handler and scheduler.
#[derive(Debug, Clone)]
pub struct Route {
    mapping: Mapping,
    handler: HandlerMethod,
    scheduler: String,
}

impl Route {
    pub fn new(mapping: Mapping, handler: HandlerMethod, scheduler: impl Into<String>) -> Self {
        Self {
            mapping,
            handler,
            scheduler: scheduler.into(),
        }
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn handler(&self) -> &HandlerMethod {
        &self.handler
    }

    pub fn scheduler(&self) -> &str {
        &self.scheduler
    }

    pub fn is_intercepted(&self) -> bool {
        self.handler.is_intercepted()
    }

    #[cfg(test)]
    pub(crate) fn for_test(mapping: Mapping) -> Self {
        let handler = HandlerMethod::new(
            "test",
            mapping.clone(),
            |_args: crate::param::Args| async move { Ok::<(), Error>(()) },
        );
        Self::new(mapping, handler, crate::scheduler::BIZ)
    }
}

/// A successful lookup.
#[derive(Debug)]
pub struct RouteMatch {
    pub index: usize,
    /// Raw segments bound to template variables.
    pub path_variables: HashMap<String, String>,
}

/// Ordered route table.
///
/// Routes are kept most specific first (fewest template variables), with
/// registration order breaking ties.
#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<(usize, RoutePredicate)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a predicate for the route with the caller's index.
    pub fn add(&mut self, index: usize, predicate: RoutePredicate) {
        self.routes.push((index, predicate));
        self.routes.sort_by_key(|(_, p)| p.specificity());
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Finds the route for a request.
    ///
    /// Produces is only consulted among routes that pass every other
    /// predicate, so same-path routes can be told apart by `Accept`.
    pub fn find(&self, request: &HttpRequest) -> Result<RouteMatch> {
        let accepted = request.accept();
        let refuses_all = request.accepts_nothing();
        let mut furthest = None;
        let mut allowed = BTreeSet::new();
        let mut producible: Vec<String> = Vec::new();

        for (index, predicate) in &self.routes {
            match predicate.test(request) {
                Ok(vars) => {
                    if !refuses_all && predicate.produces_ok(&accepted) {
                        return Ok(RouteMatch {
                            index: *index,
                            path_variables: vars,
                        });
                    }
                    furthest = furthest.max(Some(MatchStage::Produces));
                    for media_type in predicate.producible() {
                        let media_type = media_type.to_string();
                        if !producible.contains(&media_type) {
                            producible.push(media_type);
                        }
                    }
                }
                Err(stage) => {
                    if stage == MatchStage::Method {
                        allowed.extend(predicate.methods().iter().map(|m| m.as_str().to_string()));
                    }
                    furthest = furthest.max(Some(stage));
                }
            }
        }

        let target = format!("{} {}", request.method, request.path);
        Err(match furthest {
            None | Some(MatchStage::Path) | Some(MatchStage::Conditions) => {
                Error::RouteNotFound(target)
            }
            Some(MatchStage::Method) => Error::MethodNotAllowed {
                message: target,
                allowed: allowed.into_iter().collect(),
            },
            Some(MatchStage::Consumes) => Error::UnsupportedMediaType(
                request
                    .content_type()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "none".into()),
            ),
            Some(MatchStage::Produces) => Error::NotAcceptable {
                attempted: producible,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(mappings: &[Mapping]) -> Router {
        let mut router = Router::new();
        for (i, m) in mappings.iter().enumerate() {
            router.add(i, RoutePredicate::compile(m).unwrap());
        }
        router
    }

    fn get(path: &str) -> HttpRequest {
        HttpRequest::new(HttpMethod::GET, path)
    }

    #[test]
    fn test_template_variables() {
        let t = PathTemplate::parse("/users/{id:\\d+}/cars/{car}").unwrap();
        let vars = t.matches("/users/42/cars/red;color=red").unwrap();
        assert_eq!(vars["id"], "42");
        assert_eq!(vars["car"], "red;color=red");
        assert!(t.matches("/users/abc/cars/x").is_none());
        assert!(t.matches("/users/42/cars").is_none());
        assert_eq!(t.variable_count(), 2);
    }

    #[test]
    fn test_wildcards() {
        let one = PathTemplate::parse("/files/*/meta").unwrap();
        assert!(one.matches("/files/a/meta").is_some());
        assert!(one.matches("/files/a/b/meta").is_none());
        let all = PathTemplate::parse("/static/**").unwrap();
        assert!(all.matches("/static/css/site.css").is_some());
        assert!(PathTemplate::parse("/a/**/b").is_err());
    }

    #[test]
    fn test_literal_ignores_matrix() {
        let t = PathTemplate::parse("/a/b").unwrap();
        assert!(t.matches("/a;x=1/b").is_some());
    }

    #[test]
    fn test_specificity_beats_registration() {
        let r = router(&[Mapping::get("/users/{id}"), Mapping::get("/users/me")]);
        assert_eq!(r.find(&get("/users/me")).unwrap().index, 1);
        assert_eq!(r.find(&get("/users/7")).unwrap().index, 0);
    }

    #[test]
    fn test_not_found_and_method_not_allowed() {
        let r = router(&[Mapping::get("/items"), Mapping::delete("/items")]);
        assert!(matches!(r.find(&get("/nothing")), Err(Error::RouteNotFound(_))));
        match r.find(&HttpRequest::new(HttpMethod::PUT, "/items")) {
            Err(Error::MethodNotAllowed { allowed, .. }) => assert_eq!(allowed, ["DELETE", "GET"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_consumes_and_produces() {
        let r = router(&[
            Mapping::post("/doc").consumes("application/json").produces("application/json"),
            Mapping::post("/doc").consumes("application/json").produces("text/plain"),
        ]);
        let json = HttpRequest::new(HttpMethod::POST, "/doc")
            .with_header("content-type", "application/json")
            .unwrap();
        let text = json.clone().with_header("accept", "text/plain").unwrap();
        assert_eq!(r.find(&text).unwrap().index, 1);
        assert_eq!(r.find(&json).unwrap().index, 0);

        let xml = HttpRequest::new(HttpMethod::POST, "/doc")
            .with_header("content-type", "application/xml")
            .unwrap();
        assert!(matches!(r.find(&xml), Err(Error::UnsupportedMediaType(_))));

        let png = json.clone().with_header("accept", "image/png").unwrap();
        match r.find(&png) {
            Err(Error::NotAcceptable { attempted }) => {
                assert_eq!(attempted, ["application/json", "text/plain"])
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_not_acceptable_lists_each_type_once() {
        let r = router(&[
            Mapping::get("/doc").produces("application/json").produces("text/plain"),
            Mapping::get("/doc").produces("text/plain").produces("application/json"),
        ]);
        let png = get("/doc").with_header("accept", "image/png").unwrap();
        match r.find(&png) {
            Err(Error::NotAcceptable { attempted }) => {
                assert_eq!(attempted, ["application/json", "text/plain"])
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_accept_refusing_everything_is_not_acceptable() {
        let r = router(&[
            Mapping::get("/doc").produces("application/json"),
            Mapping::get("/any"),
        ]);
        let refused = get("/doc").with_header("accept", "application/json;q=0").unwrap();
        assert!(matches!(r.find(&refused), Err(Error::NotAcceptable { .. })));

        let refused_any = get("/any").with_header("accept", "*/*;q=0").unwrap();
        assert!(matches!(r.find(&refused_any), Err(Error::NotAcceptable { .. })));

        let partly = get("/doc")
            .with_header("accept", "text/plain;q=0, application/json")
            .unwrap();
        assert_eq!(r.find(&partly).unwrap().index, 0);
    }

    #[test]
    fn test_header_and_param_conditions() {
        let r = router(&[Mapping::get("/q").param("v=2").header("x-mode")]);
        let ok = get("/q?v=2").with_header("X-Mode", "on").unwrap();
        assert!(r.find(&ok).is_ok());
        assert!(matches!(r.find(&get("/q?v=2")), Err(Error::RouteNotFound(_))));
    }

    #[test]
    fn test_combined_scenario() {
        let parent = Mapping::get("/a").consumes("text/plain");
        let child = Mapping::new().path("/b").consumes("application/json");
        let r = router(&[parent.combine(&child)]);
        let json = get("/a/b").with_header("content-type", "application/json").unwrap();
        assert!(r.find(&json).is_ok());
        let text = get("/a/b").with_header("content-type", "text/plain").unwrap();
        assert!(matches!(r.find(&text), Err(Error::UnsupportedMediaType(_))));
    }
}
