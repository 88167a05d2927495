//! Per-request flow over the routes bound by a deployment.
//!
//! For each request: match a route, run `pre_handle`, schedule the handler,
//! resolve its arguments, invoke it on the scheduler's threads, run
//! `post_handle`, write the entity, then run `after_completion` on every
//! interceptor that passed.

use crate::binding::ArgumentBindings;
use crate::context::RequestContext;
use crate::entity::ResponseBinding;
use crate::exception::{ExceptionResolvers, error_kind};
use crate::extensions::Extensions;
use crate::handler::HandlerInvoker;
use crate::interceptor::{InterceptorChain, InterceptorRun};
use crate::routing::{Route, Router};
use crate::scheduler::Scheduler;
use crate::{Error, HttpRequest, HttpResponse, Result};
use std::sync::Arc;
use tracing::{Instrument, debug, info_span, warn};

/// Everything bound for one route.
pub(crate) struct BoundRoute {
    pub(crate) route: Route,
    pub(crate) arguments: ArgumentBindings,
    pub(crate) invoker: Arc<HandlerInvoker>,
    pub(crate) response: ResponseBinding,
    pub(crate) interceptors: InterceptorChain,
    pub(crate) scheduler: Arc<Scheduler>,
}

/// Serves requests against an immutable route table.
///
/// Built by [`Deployment::build`](crate::deployment::Deployment::build);
/// cheap to share behind an `Arc`.
pub struct Dispatcher {
    router: Router,
    routes: Vec<BoundRoute>,
    exceptions: ExceptionResolvers,
    extensions: Arc<Extensions>,
}

impl Dispatcher {
    pub(crate) fn new(
        router: Router,
        routes: Vec<BoundRoute>,
        exceptions: ExceptionResolvers,
        extensions: Arc<Extensions>,
    ) -> Self {
        Self {
            router,
            routes,
            exceptions,
            extensions,
        }
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Routes in registration order.
    pub fn route(&self, index: usize) -> Option<&Route> {
        self.routes.get(index).map(|bound| &bound.route)
    }

    pub fn scheduler_of(&self, index: usize) -> Option<&Arc<Scheduler>> {
        self.routes.get(index).map(|bound| &bound.scheduler)
    }

    pub fn extensions(&self) -> &Arc<Extensions> {
        &self.extensions
    }

    /// Handles one request to completion.
    pub async fn handle(&self, request: HttpRequest) -> HttpResponse {
        let mut ctx = RequestContext::with_extensions(request, self.extensions.clone());
        let span = info_span!(
            "request",
            method = %ctx.request().method,
            path = %ctx.request().path,
            request_id = %ctx.id(),
        );
        self.dispatch(&mut ctx).instrument(span).await;
        ctx.into_response()
    }

    async fn dispatch(&self, ctx: &mut RequestContext) {
        let found = match self.router.find(ctx.request()) {
            Ok(found) => found,
            Err(err) => {
                debug!(error = %err, "no route");
                self.write_error(ctx, &err).await;
                return;
            }
        };
        let Some(bound) = self.routes.get(found.index) else {
            let err = Error::Internal(format!("route index {} out of range", found.index));
            self.write_error(ctx, &err).await;
            return;
        };
        debug!(
            route = bound.route.handler().name(),
            scheduler = bound.scheduler.name(),
            "route matched"
        );
        ctx.set_path_variables(found.path_variables);

        let mut run = bound.interceptors.start();
        let outcome = match run.pre_handle(ctx).await {
            Ok(true) => Self::execute(bound, &run, ctx).await,
            Ok(false) => Ok(()),
            Err(err) => Err(err),
        };

        if let Err(err) = &outcome {
            self.write_error(ctx, err).await;
        }
        run.after_completion(ctx, outcome.as_ref().err()).await;
    }

    /// The scheduled part of the flow, from argument resolution to the
    /// written entity.
    async fn execute(
        bound: &BoundRoute,
        run: &InterceptorRun<'_>,
        ctx: &mut RequestContext,
    ) -> Result<()> {
        bound
            .scheduler
            .schedule(move |ticket| async move {
                let args = bound.arguments.resolve(ctx)?;
                let invoker = bound.invoker.clone();
                let reply = bound
                    .scheduler
                    .offload(async move { invoker.invoke(args).await })
                    .await?;
                ticket.enter_completing()?;
                run.post_handle(ctx).await?;
                let handle = ctx.response_handle().clone();
                handle.apply_to(ctx.response_mut())?;
                bound.response.write(reply, ctx)
            })
            .await
    }

    /// Renders an error, unless bytes may already be on the wire.
    async fn write_error(&self, ctx: &mut RequestContext, err: &Error) {
        if ctx.response().is_committed() {
            warn!(
                error = %err,
                error_kind = error_kind(err),
                streaming = ctx.response().is_streaming(),
                "error after the response was committed; aborting"
            );
            ctx.response_mut().abort();
            return;
        }

        if err.is_server_error() {
            warn!(error = %err, error_kind = error_kind(err), "request failed");
        } else {
            debug!(error = %err, error_kind = error_kind(err), "request rejected");
        }
        let response = self.exceptions.handle(err, ctx.request()).await;
        if let Err(reset) = ctx.reset_response(response) {
            warn!(error = %reset, "could not replace the response; aborting");
            ctx.response_mut().abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HttpMethod;
    use crate::deployment::{Controller, Deployment};
    use crate::handler::HandlerMethod;
    use crate::interceptor::{Interceptor, InterceptorRegistration};
    use crate::mapping::Mapping;
    use crate::param::{Args, Param};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    #[derive(Default)]
    struct Counter {
        pre: Mutex<u32>,
        after: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl Interceptor for Counter {
        async fn pre_handle(&self, _ctx: &mut RequestContext) -> Result<bool> {
            *self.pre.lock() += 1;
            Ok(true)
        }

        async fn after_completion(&self, _ctx: &mut RequestContext, error: Option<&Error>) {
            self.after.lock().push(error.map(|e| e.to_string()));
        }
    }

    fn dispatcher(counter: Arc<Counter>) -> Dispatcher {
        let greet = |mut args: Args| async move {
            let name: String = args.take(0)?;
            Ok::<_, Error>(json!({ "hello": name }))
        };
        let fail = |_args: Args| async move { Err::<(), _>(Error::Conflict("taken".into())) };

        Deployment::new()
            .interceptor(InterceptorRegistration::new(counter))
            .controller(
                Controller::new(Mapping::new().path("/api").produces("application/json"))
                    .handler(
                        HandlerMethod::new("greet", Mapping::get("/greet"), greet)
                            .param(Param::query::<String>("name")),
                    )
                    .handler(HandlerMethod::new("fail", Mapping::post("/fail"), fail)),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_path() {
        let counter = Arc::new(Counter::default());
        let dispatcher = dispatcher(counter.clone());

        let response = dispatcher
            .handle(HttpRequest::new(HttpMethod::GET, "/api/greet?name=ada"))
            .await;

        assert_eq!(response.status, 200);
        assert!(
            response
                .header("content-type")
                .unwrap()
                .starts_with("application/json")
        );
        let body: Value = serde_json::from_slice(&response.body()).unwrap();
        assert_eq!(body, json!({ "hello": "ada" }));
        assert_eq!(*counter.pre.lock(), 1);
        assert_eq!(*counter.after.lock(), vec![None]);
    }

    #[tokio::test]
    async fn test_missing_required_value() {
        let counter = Arc::new(Counter::default());
        let dispatcher = dispatcher(counter.clone());

        let response = dispatcher
            .handle(HttpRequest::new(HttpMethod::GET, "/api/greet"))
            .await;

        assert_eq!(response.status, 400);
        let body: Value = serde_json::from_slice(&response.body()).unwrap();
        assert!(body["error"].as_str().unwrap().contains("name"));
        let after = counter.after.lock();
        assert_eq!(after.len(), 1);
        assert!(after[0].is_some());
    }

    #[tokio::test]
    async fn test_handler_error_mapped() {
        let counter = Arc::new(Counter::default());
        let dispatcher = dispatcher(counter.clone());

        let response = dispatcher
            .handle(HttpRequest::new(HttpMethod::POST, "/api/fail"))
            .await;

        assert_eq!(response.status, 409);
        assert_eq!(counter.after.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_failures() {
        let counter = Arc::new(Counter::default());
        let dispatcher = dispatcher(counter.clone());

        let missing = dispatcher
            .handle(HttpRequest::new(HttpMethod::GET, "/nowhere"))
            .await;
        assert_eq!(missing.status, 404);

        let wrong_method = dispatcher
            .handle(HttpRequest::new(HttpMethod::DELETE, "/api/greet"))
            .await;
        assert_eq!(wrong_method.status, 405);
        assert_eq!(wrong_method.header("allow"), Some("GET"));

        let unacceptable = dispatcher
            .handle(
                HttpRequest::new(HttpMethod::GET, "/api/greet?name=x")
                    .with_header("accept", "text/plain")
                    .unwrap(),
            )
            .await;
        assert_eq!(unacceptable.status, 406);

        assert_eq!(*counter.pre.lock(), 0);
        assert!(counter.after.lock().is_empty());
    }

    #[tokio::test]
    async fn test_default_serializers_fall_through_to_next_accept() {
        let dispatcher = Deployment::new()
            .route(HandlerMethod::new(
                "entity",
                Mapping::get("/entity"),
                |_args: Args| async { Ok::<_, Error>(json!({ "v": 1 })) },
            ))
            .build()
            .unwrap();

        let mixed = dispatcher
            .handle(
                HttpRequest::new(HttpMethod::GET, "/entity")
                    .with_header("accept", "text/plain, application/json")
                    .unwrap(),
            )
            .await;
        assert_eq!(mixed.status, 200);
        assert!(
            mixed
                .header("content-type")
                .unwrap()
                .starts_with("application/json")
        );
        assert_eq!(mixed.body(), bytes::Bytes::from(r#"{"v":1}"#));

        let text_only = dispatcher
            .handle(
                HttpRequest::new(HttpMethod::GET, "/entity")
                    .with_header("accept", "text/plain")
                    .unwrap(),
            )
            .await;
        assert_eq!(text_only.status, 406);
    }
}
