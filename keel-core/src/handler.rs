// Handler methods and their invocation.
//
// Handlers are monomorphized behind the `Handler` trait and type-erased once
// when stored, the same way routes store them. Invocation runs the handler
// through an ordered advice chain and turns panics into handler failures.

use crate::entity::Reply;
use crate::mapping::Mapping;
use crate::param::{Args, Param};
use crate::resolver::{LOWEST_PRECEDENCE, ParamResolver};
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// A handler body taking its resolved arguments.
pub trait Handler: Clone + Send + Sync + 'static {
    type Future: Future<Output = Result<Reply>> + Send + 'static;

    fn call(&self, args: Args) -> Self::Future;
}

/// Conversion of closures and functions into handlers.
///
/// ```ignore
/// let handler = (|mut args: Args| async move {
///     let name: String = args.take(0)?;
///     Ok::<_, Error>(format!("hello {name}"))
/// }).into_handler();
/// ```
pub trait IntoHandler<M>: Clone + Send + Sync + 'static {
    type Handler: Handler;

    fn into_handler(self) -> Self::Handler;
}

/// Wraps `Fn(Args) -> impl Future<Output = Result<R>>` where `R: Into<Reply>`.
#[derive(Clone)]
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut, R> Handler for FnHandler<F>
where
    F: Fn(Args) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: Into<Reply> + 'static,
{
    type Future = BoxFuture<'static, Result<Reply>>;

    #[inline]
    fn call(&self, args: Args) -> Self::Future {
        let fut = (self.f)(args);
        Box::pin(async move { fut.await.map(Into::into) })
    }
}

impl<F, Fut, R> IntoHandler<(Args, R)> for F
where
    F: Fn(Args) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: Into<Reply> + 'static,
{
    type Handler = FnHandler<F>;

    fn into_handler(self) -> Self::Handler {
        FnHandler { f: self }
    }
}

/// Type-erased handler stored on a route.
#[derive(Clone)]
pub struct BoxedHandler {
    inner: Arc<dyn ErasedHandler>,
}

impl BoxedHandler {
    pub fn new<H: Handler>(handler: H) -> Self {
        Self {
            inner: Arc::new(HandlerWrapper { handler }),
        }
    }

    #[inline]
    pub fn call(&self, args: Args) -> BoxFuture<'static, Result<Reply>> {
        self.inner.call(args)
    }
}

trait ErasedHandler: Send + Sync {
    fn call(&self, args: Args) -> BoxFuture<'static, Result<Reply>>;
}

struct HandlerWrapper<H: Handler> {
    handler: H,
}

impl<H: Handler> ErasedHandler for HandlerWrapper<H> {
    #[inline]
    fn call(&self, args: Args) -> BoxFuture<'static, Result<Reply>> {
        Box::pin(self.handler.call(args))
    }
}

/// A handler together with its declared parameters and routing metadata.
#[derive(Clone)]
pub struct HandlerMethod {
    name: Arc<str>,
    mapping: Mapping,
    params: Vec<Param>,
    handler: BoxedHandler,
    scheduler: Option<String>,
    fixed: HashMap<usize, Arc<dyn ParamResolver>>,
    intercepted: bool,
}

impl HandlerMethod {
    pub fn new<M, H>(name: impl Into<String>, mapping: Mapping, handler: H) -> Self
    where
        H: IntoHandler<M>,
    {
        Self {
            name: Arc::from(name.into()),
            mapping,
            params: Vec::new(),
            handler: BoxedHandler::new(handler.into_handler()),
            scheduler: None,
            fixed: HashMap::new(),
            intercepted: true,
        }
    }

    /// Declares the next parameter; its position is the argument index.
    pub fn param(mut self, mut param: Param) -> Self {
        param.bind_to(self.name.clone(), self.params.len());
        self.params.push(param);
        self
    }

    /// Scheduler named on the method itself.
    pub fn scheduler(mut self, name: impl Into<String>) -> Self {
        self.scheduler = Some(name.into());
        self
    }

    /// Supplies the resolver for one position directly, ahead of any
    /// registered factory.
    pub fn fixed_resolver(mut self, index: usize, resolver: Arc<dyn ParamResolver>) -> Self {
        self.fixed.insert(index, resolver);
        self
    }

    /// Routes with interception disabled skip every interceptor.
    pub fn intercepted(mut self, intercepted: bool) -> Self {
        self.intercepted = intercepted;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn declared_scheduler(&self) -> Option<&str> {
        self.scheduler.as_deref()
    }

    pub fn fixed_resolver_for(&self, index: usize) -> Option<&Arc<dyn ParamResolver>> {
        self.fixed.get(&index)
    }

    pub fn is_intercepted(&self) -> bool {
        self.intercepted
    }

    pub fn handler(&self) -> &BoxedHandler {
        &self.handler
    }
}

impl fmt::Debug for HandlerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerMethod")
            .field("name", &self.name)
            .field("mapping", &self.mapping)
            .field("params", &self.params.len())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

/// Wraps the invocation of a handler.
///
/// Implementations await [`InvokeNext::proceed`] at most once, or return
/// their own reply to short-circuit the handler.
#[async_trait]
pub trait HandlerAdvice: Send + Sync {
    async fn invoke(&self, args: Args, next: InvokeNext<'_>) -> Result<Reply>;
}

pub trait HandlerAdviceFactory: Send + Sync {
    fn supports(&self, handler: &HandlerMethod) -> bool;

    fn create(&self, handler: &HandlerMethod) -> Result<Arc<dyn HandlerAdvice>>;

    fn order(&self) -> i32 {
        0
    }
}

/// Remainder of a handler advice chain.
pub struct InvokeNext<'a> {
    advices: &'a [Arc<dyn HandlerAdvice>],
    handler: &'a BoxedHandler,
    name: &'a str,
}

impl<'a> InvokeNext<'a> {
    pub fn handler_name(&self) -> &str {
        self.name
    }

    pub fn proceed(self, args: Args) -> BoxFuture<'a, Result<Reply>> {
        match self.advices.split_first() {
            Some((advice, rest)) => advice.invoke(
                args,
                InvokeNext {
                    advices: rest,
                    handler: self.handler,
                    name: self.name,
                },
            ),
            None => self.handler.call(args),
        }
    }
}

/// Calls a bound handler through its advices.
pub struct HandlerInvoker {
    name: Arc<str>,
    handler: BoxedHandler,
    advices: Vec<Arc<dyn HandlerAdvice>>,
}

impl HandlerInvoker {
    pub fn new(handler: &HandlerMethod, advices: Vec<Arc<dyn HandlerAdvice>>) -> Self {
        Self {
            name: handler.name_arc(),
            handler: handler.handler().clone(),
            advices,
        }
    }

    /// Runs the chain; a panic anywhere inside becomes a handler failure.
    pub async fn invoke(&self, args: Args) -> Result<Reply> {
        let next = InvokeNext {
            advices: &self.advices,
            handler: &self.handler,
            name: &self.name,
        };
        match AssertUnwindSafe(async move { next.proceed(args).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(Error::HandlerInvocation(format!(
                "{} panicked: {}",
                self.name,
                panic_message(panic.as_ref())
            ))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

/// Advice factory registered for every handler, for cross-cutting wrappers
/// given as a plain advice.
pub struct AllHandlers {
    advice: Arc<dyn HandlerAdvice>,
    order: i32,
}

impl AllHandlers {
    pub fn new(advice: Arc<dyn HandlerAdvice>) -> Self {
        Self {
            advice,
            order: LOWEST_PRECEDENCE,
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }
}

impl HandlerAdviceFactory for AllHandlers {
    fn supports(&self, _handler: &HandlerMethod) -> bool {
        true
    }

    fn create(&self, _handler: &HandlerMethod) -> Result<Arc<dyn HandlerAdvice>> {
        Ok(self.advice.clone())
    }

    fn order(&self) -> i32 {
        self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn greet() -> HandlerMethod {
        HandlerMethod::new(
            "greet",
            Mapping::get("/greet"),
            |mut args: Args| async move {
                let name: String = args.take(0)?;
                Ok::<_, Error>(format!("hello {name}"))
            },
        )
        .param(Param::query::<String>("name"))
    }

    fn args_with(name: &str) -> Args {
        Args::new(Arc::from("greet"), vec![Some(Box::new(name.to_string()))])
    }

    struct Tracing {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl HandlerAdvice for Tracing {
        async fn invoke(&self, args: Args, next: InvokeNext<'_>) -> Result<Reply> {
            self.log.lock().push(format!("{} before {}", self.label, next.handler_name()));
            let reply = next.proceed(args).await;
            self.log.lock().push(format!("{} after", self.label));
            reply
        }
    }

    struct Deny;

    #[async_trait]
    impl HandlerAdvice for Deny {
        async fn invoke(&self, _args: Args, _next: InvokeNext<'_>) -> Result<Reply> {
            Ok(Reply::Text("denied".into()))
        }
    }

    #[tokio::test]
    async fn test_invoke_handler() {
        let method = greet();
        assert_eq!(method.params()[0].index(), 0);
        assert_eq!(method.params()[0].method(), "greet");
        let invoker = HandlerInvoker::new(&method, vec![]);
        let reply = invoker.invoke(args_with("ada")).await.unwrap();
        assert_eq!(reply, Reply::Text("hello ada".into()));
    }

    #[tokio::test]
    async fn test_advices_wrap_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let advices: Vec<Arc<dyn HandlerAdvice>> = vec![
            Arc::new(Tracing { label: "outer", log: log.clone() }),
            Arc::new(Tracing { label: "inner", log: log.clone() }),
        ];
        let invoker = HandlerInvoker::new(&greet(), advices);
        invoker.invoke(args_with("x")).await.unwrap();
        assert_eq!(
            *log.lock(),
            ["outer before greet", "inner before greet", "inner after", "outer after"]
        );
    }

    #[tokio::test]
    async fn test_advice_short_circuits() {
        let invoker = HandlerInvoker::new(&greet(), vec![Arc::new(Deny)]);
        let reply = invoker.invoke(Args::new(Arc::from("greet"), vec![None])).await.unwrap();
        assert_eq!(reply, Reply::Text("denied".into()));
    }

    #[tokio::test]
    async fn test_panic_becomes_invocation_failure() {
        let method = HandlerMethod::new("boom", Mapping::get("/"), |_args: Args| async move {
            if true {
                panic!("kaboom");
            }
            Ok::<(), Error>(())
        });
        let err = HandlerInvoker::new(&method, vec![])
            .invoke(Args::new(Arc::from("boom"), vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HandlerInvocation(ref m) if m.contains("kaboom")));
        assert_eq!(err.status_code(), 500);
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let method = HandlerMethod::new("fail", Mapping::get("/"), |_args: Args| async move {
            Err::<(), _>(Error::Conflict("taken".into()))
        });
        let err = HandlerInvoker::new(&method, vec![])
            .invoke(Args::new(Arc::from("fail"), vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
    }
}
