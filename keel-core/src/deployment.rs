//! Assembling controllers into a ready-to-serve [`Dispatcher`].
//!
//! Everything a request needs is decided here, once: combined mappings,
//! compiled predicates, argument bindings, response bindings, handler
//! advices, interceptor chains and schedulers. Any binding failure aborts
//! [`Deployment::build`].
//!
//! ```ignore
//! let users = Controller::new(Mapping::new().path("/users").produces("application/json"))
//!     .handler(
//!         HandlerMethod::new("users.show", Mapping::get("/{id}"), show)
//!             .param(Param::path::<u64>("id")),
//!     );
//!
//! let dispatcher = Deployment::new().controller(users).build()?;
//! ```

use crate::binding::ResolverRegistry;
use crate::dispatcher::{BoundRoute, Dispatcher};
use crate::entity::{
    RequestEntityResolverAdviceFactory, RequestEntityResolverFactory,
    ResponseEntityResolverAdviceFactory, ResponseEntityResolverFactory,
};
use crate::exception::{ExceptionResolver, ExceptionResolvers};
use crate::extensions::Extensions;
use crate::handler::{HandlerAdviceFactory, HandlerInvoker, HandlerMethod};
use crate::interceptor::{InterceptorChain, InterceptorFactory, InterceptorRegistration};
use crate::mapping::Mapping;
use crate::resolver::{ContextResolverFactory, ParamResolverAdviceFactory, ParamResolverFactory};
use crate::routing::{Route, RoutePredicate, Router};
use crate::scheduler::{Scheduler, Schedulers};
use crate::serializer::{HttpBodySerializer, Serializers};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A group of handlers sharing a parent mapping.
#[derive(Debug, Clone, Default)]
pub struct Controller {
    mapping: Mapping,
    scheduler: Option<String>,
    handlers: Vec<HandlerMethod>,
}

impl Controller {
    pub fn new(mapping: Mapping) -> Self {
        Self {
            mapping,
            scheduler: None,
            handlers: Vec::new(),
        }
    }

    /// Scheduler for handlers that do not name their own.
    pub fn scheduler(mut self, name: impl Into<String>) -> Self {
        self.scheduler = Some(name.into());
        self
    }

    pub fn handler(mut self, handler: HandlerMethod) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn handlers(&self) -> &[HandlerMethod] {
        &self.handlers
    }
}

/// Builder for a [`Dispatcher`].
pub struct Deployment {
    serializers: Serializers,
    resolvers: ResolverRegistry,
    streaming: bool,
    defer_unresolvable: bool,
    interceptors: Vec<Arc<dyn InterceptorFactory>>,
    schedulers: Schedulers,
    scheduler_overrides: HashMap<String, String>,
    controllers: Vec<Controller>,
    extensions: Extensions,
    exceptions: ExceptionResolvers,
}

impl Default for Deployment {
    fn default() -> Self {
        Self::new()
    }
}

impl Deployment {
    pub fn new() -> Self {
        Self {
            serializers: Serializers::with_defaults(),
            resolvers: ResolverRegistry::new(),
            streaming: false,
            defer_unresolvable: false,
            interceptors: Vec::new(),
            schedulers: Schedulers::with_defaults(),
            scheduler_overrides: HashMap::new(),
            controllers: Vec::new(),
            extensions: Extensions::new(),
            exceptions: ExceptionResolvers::new(),
        }
    }

    pub fn serializer(mut self, serializer: Arc<dyn HttpBodySerializer>) -> Self {
        self.serializers.register(serializer);
        self
    }

    /// Replaces the serializer registry, built-ins included.
    pub fn serializers(mut self, serializers: Serializers) -> Self {
        self.serializers = serializers;
        self
    }

    pub fn context_resolver(mut self, factory: Arc<dyn ContextResolverFactory>) -> Self {
        self.resolvers.add_context_resolver(factory);
        self
    }

    pub fn param_resolver(mut self, factory: Arc<dyn ParamResolverFactory>) -> Self {
        self.resolvers.add_param_resolver(factory);
        self
    }

    pub fn param_advice(mut self, factory: Arc<dyn ParamResolverAdviceFactory>) -> Self {
        self.resolvers.add_param_advice(factory);
        self
    }

    pub fn request_entity_resolver(mut self, factory: Arc<dyn RequestEntityResolverFactory>) -> Self {
        self.resolvers.add_request_entity_resolver(factory);
        self
    }

    pub fn request_entity_advice(
        mut self,
        factory: Arc<dyn RequestEntityResolverAdviceFactory>,
    ) -> Self {
        self.resolvers.add_request_entity_advice(factory);
        self
    }

    pub fn response_entity_resolver(
        mut self,
        factory: Arc<dyn ResponseEntityResolverFactory>,
    ) -> Self {
        self.resolvers.add_response_entity_resolver(factory);
        self
    }

    pub fn response_entity_advice(
        mut self,
        factory: Arc<dyn ResponseEntityResolverAdviceFactory>,
    ) -> Self {
        self.resolvers.add_response_entity_advice(factory);
        self
    }

    pub fn handler_advice(mut self, factory: Arc<dyn HandlerAdviceFactory>) -> Self {
        self.resolvers.add_handler_advice(factory);
        self
    }

    pub fn interceptor(mut self, registration: InterceptorRegistration) -> Self {
        self.interceptors.push(Arc::new(registration));
        self
    }

    pub fn interceptor_factory(mut self, factory: Arc<dyn InterceptorFactory>) -> Self {
        self.interceptors.push(factory);
        self
    }

    /// Adds or replaces a scheduler under its own name.
    pub fn scheduler(mut self, scheduler: Scheduler) -> Self {
        self.schedulers.register(scheduler);
        self
    }

    /// Replaces the scheduler registry, built-ins included.
    pub fn schedulers(mut self, schedulers: Schedulers) -> Self {
        self.schedulers = schedulers;
        self
    }

    pub fn default_scheduler(mut self, name: impl Into<String>) -> Self {
        self.schedulers.set_default(name);
        self
    }

    /// Forces a scheduler for one handler, ahead of anything it declares.
    pub fn override_scheduler(
        mut self,
        handler: impl Into<String>,
        scheduler: impl Into<String>,
    ) -> Self {
        self.scheduler_overrides
            .insert(handler.into(), scheduler.into());
        self
    }

    pub fn controller(mut self, controller: Controller) -> Self {
        self.controllers.push(controller);
        self
    }

    /// Registers a handler without a parent mapping.
    pub fn route(self, handler: HandlerMethod) -> Self {
        self.controller(Controller::default().handler(handler))
    }

    /// Shared state available to handlers through `State<T>` parameters.
    pub fn state<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.extensions.insert(value);
        self
    }

    pub fn exception_resolver<R: ExceptionResolver>(mut self, resolver: R) -> Self {
        self.exceptions.add(resolver);
        self
    }

    /// Writes serialized entities through the response output stream.
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Reports unresolvable parameters per request instead of failing here.
    pub fn defer_unresolvable(mut self, defer: bool) -> Self {
        self.defer_unresolvable = defer;
        self
    }

    /// Binds every route.
    pub fn build(self) -> Result<Dispatcher> {
        let mut registry = ResolverRegistry::with_defaults(&self.serializers, self.streaming);
        registry.extend(&self.resolvers);
        registry.set_defer_unresolvable(self.defer_unresolvable);

        let mut router = Router::new();
        let mut routes = Vec::new();

        for controller in &self.controllers {
            for handler in &controller.handlers {
                let mapping = controller.mapping.combine(handler.mapping());
                let predicate = RoutePredicate::compile(&mapping).map_err(|err| {
                    Error::Deployment(format!("handler '{}': {err}", handler.name()))
                })?;

                let scheduler = self.schedulers.resolve(
                    self.scheduler_overrides.get(handler.name()).map(String::as_str),
                    handler.declared_scheduler(),
                    controller.scheduler.as_deref(),
                )?;
                let route = Route::new(mapping, handler.clone(), scheduler.name());

                let arguments = registry.bind_arguments(handler)?;
                let response = registry.bind_response(handler, predicate.producible())?;
                let invoker = Arc::new(HandlerInvoker::new(
                    handler,
                    registry.bind_handler_advices(handler)?,
                ));
                let interceptors = InterceptorChain::bind(&route, &self.interceptors);

                debug!(
                    route = handler.name(),
                    paths = ?route.mapping().paths(),
                    methods = ?route.mapping().methods(),
                    scheduler = scheduler.name(),
                    interceptors = ?interceptors.names(),
                    "route bound"
                );

                let index = routes.len();
                router.add(index, predicate);
                routes.push(BoundRoute {
                    route,
                    arguments,
                    invoker,
                    response,
                    interceptors,
                    scheduler,
                });
            }
        }

        for handler in self.scheduler_overrides.keys() {
            if !routes.iter().any(|r| r.route.handler().name() == handler) {
                warn!(handler = %handler, "scheduler override names no handler");
            }
        }

        info!(
            routes = routes.len(),
            controllers = self.controllers.len(),
            interceptors = self.interceptors.len(),
            schedulers = ?self.schedulers.names().collect::<Vec<_>>(),
            "deployment complete"
        );

        Ok(Dispatcher::new(
            router,
            routes,
            self.exceptions,
            Arc::new(self.extensions),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{Args, Param};
    use crate::scheduler::{BIZ, IO};

    fn hello(_args: Args) -> impl std::future::Future<Output = Result<&'static str>> {
        async { Ok("hello") }
    }

    #[test]
    fn test_build_binds_routes() {
        let dispatcher = Deployment::new()
            .controller(
                Controller::new(Mapping::new().path("/a"))
                    .handler(HandlerMethod::new("a.one", Mapping::get("/one"), hello))
                    .handler(HandlerMethod::new("a.two", Mapping::get("/two"), hello)),
            )
            .build()
            .unwrap();
        assert_eq!(dispatcher.route_count(), 2);
        assert_eq!(dispatcher.route(0).unwrap().mapping().paths(), ["/a/one"]);
    }

    #[test]
    fn test_unresolvable_param_fails_build() {
        struct Opaque;
        let result = Deployment::new()
            .route(
                HandlerMethod::new("opaque", Mapping::get("/x"), hello)
                    .param(Param::opaque::<Opaque>()),
            )
            .build();
        assert!(matches!(result, Err(Error::NoSuitableResolver(_))));
    }

    #[test]
    fn test_malformed_string_default_fails_build() {
        let result = Deployment::new()
            .route(
                HandlerMethod::new("list", Mapping::get("/items"), hello)
                    .param(Param::query::<u32>("limit").default_value("many")),
            )
            .build();
        assert!(matches!(result, Err(Error::Deployment(ref m)) if m.contains("many")));
    }

    #[test]
    fn test_unknown_scheduler_fails_build() {
        let result = Deployment::new()
            .route(HandlerMethod::new("h", Mapping::get("/x"), hello).scheduler("missing"))
            .build();
        assert!(matches!(result, Err(Error::Deployment(_))));
    }

    #[test]
    fn test_scheduler_precedence() {
        let dispatcher = Deployment::new()
            .scheduler(Scheduler::direct("custom"))
            .controller(
                Controller::new(Mapping::new().path("/c"))
                    .scheduler(IO)
                    .handler(HandlerMethod::new("c.default", Mapping::get("/d"), hello))
                    .handler(HandlerMethod::new("c.method", Mapping::get("/m"), hello).scheduler(BIZ))
                    .handler(HandlerMethod::new("c.forced", Mapping::get("/f"), hello).scheduler(BIZ)),
            )
            .route(HandlerMethod::new("root", Mapping::get("/r"), hello))
            .override_scheduler("c.forced", "custom")
            .build()
            .unwrap();

        let scheduler_of = |name: &str| {
            (0..dispatcher.route_count())
                .filter_map(|i| dispatcher.route(i))
                .find(|r| r.handler().name() == name)
                .map(|r| r.scheduler().to_string())
                .unwrap()
        };
        assert_eq!(scheduler_of("c.default"), IO);
        assert_eq!(scheduler_of("c.method"), BIZ);
        assert_eq!(scheduler_of("c.forced"), "custom");
        assert_eq!(scheduler_of("root"), BIZ);
    }

    #[test]
    fn test_bad_path_template_fails_build() {
        let result = Deployment::new()
            .route(HandlerMethod::new("bad", Mapping::get("/{id:(}"), hello))
            .build();
        assert!(matches!(result, Err(Error::Deployment(_))));
    }
}
