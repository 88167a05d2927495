// Interceptors around handler execution

use crate::context::RequestContext;
use crate::routing::Route;
use crate::{Error, Result};
use async_trait::async_trait;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hooks run around a handler.
///
/// `after_completion` runs once for every interceptor whose `pre_handle`
/// returned `Ok(true)`, whatever happened afterwards.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Returning `false` stops the request; later interceptors and the
    /// handler do not run.
    async fn pre_handle(&self, _ctx: &mut RequestContext) -> Result<bool> {
        Ok(true)
    }

    /// Runs after the handler succeeded, before the response is written.
    async fn post_handle(&self, _ctx: &mut RequestContext) -> Result<()> {
        Ok(())
    }

    async fn after_completion(&self, _ctx: &mut RequestContext, _error: Option<&Error>) {}
}

/// When a registered interceptor attaches to a route.
#[derive(Clone)]
pub enum Attachment {
    /// Every route.
    Always,
    /// Routes whose path patterns pass the filter.
    Paths(PathFilter),
    /// Routes accepted by a predicate.
    Matching(Arc<dyn Fn(&Route) -> bool + Send + Sync>),
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attachment::Always => f.write_str("Always"),
            Attachment::Paths(filter) => f.debug_tuple("Paths").field(filter).finish(),
            Attachment::Matching(_) => f.write_str("Matching"),
        }
    }
}

/// Include/exclude path patterns; `*` matches one segment and `**` any
/// number. Excludes are checked first.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    includes: Vec<String>,
    excludes: Vec<String>,
}

impl PathFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.includes.push(pattern.into());
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    /// Tests one route path pattern, such as `/users/{id}`.
    pub fn matches(&self, path: &str) -> bool {
        if self.excludes.iter().any(|p| glob_match(p, path)) {
            return false;
        }
        self.includes.is_empty() || self.includes.iter().any(|p| glob_match(p, path))
    }
}

fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match_segments(&pattern, &path)
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| match_segments(rest, &path[skip..])),
        Some((head, rest)) => match path.split_first() {
            Some((segment, remaining)) => {
                (*head == "*" || head == segment) && match_segments(rest, remaining)
            }
            None => false,
        },
    }
}

/// An interceptor offered to routes, with its ordering and attachment rule.
#[derive(Clone)]
pub struct InterceptorRegistration {
    interceptor: Arc<dyn Interceptor>,
    order: i32,
    attachment: Attachment,
}

impl InterceptorRegistration {
    pub fn new(interceptor: Arc<dyn Interceptor>) -> Self {
        Self {
            interceptor,
            order: 0,
            attachment: Attachment::Always,
        }
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.attachment = match self.attachment {
            Attachment::Paths(filter) => Attachment::Paths(filter.include(pattern)),
            _ => Attachment::Paths(PathFilter::new().include(pattern)),
        };
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.attachment = match self.attachment {
            Attachment::Paths(filter) => Attachment::Paths(filter.exclude(pattern)),
            _ => Attachment::Paths(PathFilter::new().exclude(pattern)),
        };
        self
    }

    pub fn matching(mut self, predicate: impl Fn(&Route) -> bool + Send + Sync + 'static) -> Self {
        self.attachment = Attachment::Matching(Arc::new(predicate));
        self
    }

    pub fn interceptor(&self) -> &Arc<dyn Interceptor> {
        &self.interceptor
    }

    pub fn get_order(&self) -> i32 {
        self.order
    }

    /// Whether this registration applies to the route.
    pub fn attaches_to(&self, route: &Route) -> bool {
        match &self.attachment {
            Attachment::Always => true,
            Attachment::Paths(filter) => route.mapping().paths().iter().any(|p| filter.matches(p)),
            Attachment::Matching(predicate) => predicate(route),
        }
    }
}

/// Offered every route once at deployment; `None` declines the route.
pub trait InterceptorFactory: Send + Sync {
    fn create(&self, route: &Route) -> Option<InterceptorRegistration>;
}

impl InterceptorFactory for InterceptorRegistration {
    fn create(&self, route: &Route) -> Option<InterceptorRegistration> {
        self.attaches_to(route).then(|| self.clone())
    }
}

/// The interceptors bound to one route, in order.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: SmallVec<[Arc<dyn Interceptor>; 4]>,
}

impl InterceptorChain {
    /// Offers the route to every factory and keeps what attaches, sorted by
    /// order with registration order breaking ties.
    pub fn bind(route: &Route, factories: &[Arc<dyn InterceptorFactory>]) -> Self {
        if !route.is_intercepted() {
            return Self::default();
        }
        let mut bound: Vec<InterceptorRegistration> = factories
            .iter()
            .filter_map(|f| f.create(route))
            .collect();
        bound.sort_by_key(|r| r.order);
        Self {
            interceptors: bound.into_iter().map(|r| r.interceptor).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Starts the per-request run.
    pub fn start(&self) -> InterceptorRun<'_> {
        InterceptorRun {
            chain: self,
            passed: 0,
        }
    }
}

/// Per-request interceptor progress.
///
/// Interceptors run in order and stop at the first rejection, so the ones
/// that passed are always a prefix of the chain.
pub struct InterceptorRun<'a> {
    chain: &'a InterceptorChain,
    passed: usize,
}

impl InterceptorRun<'_> {
    pub fn passed(&self) -> usize {
        self.passed
    }

    /// Runs every `pre_handle`, stopping at the first `false` or error.
    pub async fn pre_handle(&mut self, ctx: &mut RequestContext) -> Result<bool> {
        for interceptor in &self.chain.interceptors {
            if !interceptor.pre_handle(ctx).await? {
                debug!(interceptor = interceptor.name(), "request stopped by pre_handle");
                return Ok(false);
            }
            self.passed += 1;
        }
        Ok(true)
    }

    pub async fn post_handle(&self, ctx: &mut RequestContext) -> Result<()> {
        for interceptor in &self.chain.interceptors[..self.passed] {
            interceptor.post_handle(ctx).await?;
        }
        Ok(())
    }

    /// Consumes the run so completion hooks fire once.
    pub async fn after_completion(self, ctx: &mut RequestContext, error: Option<&Error>) {
        for interceptor in &self.chain.interceptors[..self.passed] {
            interceptor.after_completion(ctx, error).await;
        }
        if let Some(error) = error {
            warn!(passed = self.passed, error = %error, "request completed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HttpMethod;
    use crate::HttpRequest;
    use crate::mapping::Mapping;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        allow: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Interceptor for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn pre_handle(&self, _ctx: &mut RequestContext) -> Result<bool> {
            self.log.lock().push(format!("pre {}", self.name));
            Ok(self.allow)
        }

        async fn post_handle(&self, _ctx: &mut RequestContext) -> Result<()> {
            self.log.lock().push(format!("post {}", self.name));
            Ok(())
        }

        async fn after_completion(&self, _ctx: &mut RequestContext, error: Option<&Error>) {
            self.log
                .lock()
                .push(format!("after {} {}", self.name, error.is_some()));
        }
    }

    fn recorder(name: &'static str, allow: bool, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Interceptor> {
        Arc::new(Recorder {
            name,
            allow,
            log: log.clone(),
        })
    }

    fn route(path: &str) -> Route {
        Route::for_test(Mapping::get(path))
    }

    #[test]
    fn test_glob() {
        assert!(glob_match("/api/**", "/api/users/{id}"));
        assert!(glob_match("/api/**", "/api"));
        assert!(glob_match("/api/*/x", "/api/v1/x"));
        assert!(!glob_match("/api/*", "/api/v1/x"));
        assert!(glob_match("/**/health", "/a/b/health"));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let filter = PathFilter::new().include("/api/**").exclude("/api/internal/**");
        assert!(filter.matches("/api/users"));
        assert!(!filter.matches("/api/internal/stats"));
        assert!(!filter.matches("/public"));
    }

    #[test]
    fn test_bind_sorts_and_filters() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let factories: Vec<Arc<dyn InterceptorFactory>> = vec![
            Arc::new(InterceptorRegistration::new(recorder("late", true, &log)).order(10)),
            Arc::new(InterceptorRegistration::new(recorder("early", true, &log)).order(-5)),
            Arc::new(InterceptorRegistration::new(recorder("api", true, &log)).include("/api/**")),
            Arc::new(
                InterceptorRegistration::new(recorder("never", true, &log))
                    .matching(|r| r.mapping().methods().contains(&HttpMethod::DELETE)),
            ),
        ];
        let chain = InterceptorChain::bind(&route("/api/users"), &factories);
        assert_eq!(chain.names(), ["early", "api", "late"]);
        let chain = InterceptorChain::bind(&route("/web"), &factories);
        assert_eq!(chain.names(), ["early", "late"]);
    }

    /// Attaches its registration to every route, whatever the
    /// registration's own path filter says.
    struct Everywhere(InterceptorRegistration);

    impl InterceptorFactory for Everywhere {
        fn create(&self, _route: &Route) -> Option<InterceptorRegistration> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn test_factory_decision_is_final() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let factories: Vec<Arc<dyn InterceptorFactory>> = vec![Arc::new(Everywhere(
            InterceptorRegistration::new(recorder("audit", true, &log)).include("/admin/**"),
        ))];
        let chain = InterceptorChain::bind(&route("/public"), &factories);
        assert_eq!(chain.names(), ["audit"]);
    }

    #[tokio::test]
    async fn test_after_completion_only_for_passed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let factories: Vec<Arc<dyn InterceptorFactory>> = vec![
            Arc::new(InterceptorRegistration::new(recorder("a", true, &log))),
            Arc::new(InterceptorRegistration::new(recorder("b", false, &log))),
            Arc::new(InterceptorRegistration::new(recorder("c", true, &log))),
        ];
        let chain = InterceptorChain::bind(&route("/"), &factories);
        let mut ctx = RequestContext::new(HttpRequest::new(HttpMethod::GET, "/"));
        let mut run = chain.start();
        assert!(!run.pre_handle(&mut ctx).await.unwrap());
        assert_eq!(run.passed(), 1);
        run.after_completion(&mut ctx, None).await;
        assert_eq!(*log.lock(), ["pre a", "pre b", "after a false"]);
    }

    #[tokio::test]
    async fn test_full_run_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let factories: Vec<Arc<dyn InterceptorFactory>> = vec![
            Arc::new(InterceptorRegistration::new(recorder("a", true, &log))),
            Arc::new(InterceptorRegistration::new(recorder("b", true, &log))),
        ];
        let chain = InterceptorChain::bind(&route("/"), &factories);
        let mut ctx = RequestContext::new(HttpRequest::new(HttpMethod::GET, "/"));
        let mut run = chain.start();
        assert!(run.pre_handle(&mut ctx).await.unwrap());
        run.post_handle(&mut ctx).await.unwrap();
        let error = Error::Internal("x".into());
        run.after_completion(&mut ctx, Some(&error)).await;
        assert_eq!(
            *log.lock(),
            ["pre a", "pre b", "post a", "post b", "after a true", "after b true"]
        );
    }
}
