//! Parameter resolver SPI and the built-in resolvers.
//!
//! Factories are asked once per parameter at bind time. Each exposes a
//! `supports` predicate and an `order`; lower orders are consulted first and
//! registration order breaks ties.

use crate::context::{RequestContext, RequestId, ResponseHandle};
use crate::extensions::State;
use crate::name_value::{NamedValueKind, NamedValueResolver, ParamResolverAdapter};
use crate::param::{Arg, FromContext, Param, ParamSource};
use crate::{Error, HttpRequest, Result};
use std::any::type_name;
use std::sync::Arc;

/// Order of built-in factories, so registered ones win.
pub const LOWEST_PRECEDENCE: i32 = i32::MAX;

/// Resolves one handler argument from the request.
pub trait ParamResolver: Send + Sync {
    /// `Ok(None)` means absent; the handler sees an empty slot.
    fn resolve(&self, param: &Param, ctx: &RequestContext) -> Result<Option<Arg>>;
}

pub trait ParamResolverFactory: Send + Sync {
    fn supports(&self, param: &Param) -> bool;

    fn create(&self, param: &Param) -> Result<Arc<dyn ParamResolver>>;

    fn order(&self) -> i32 {
        0
    }
}

/// Supplies framework objects such as the request or the response handle.
pub trait ContextResolver: Send + Sync {
    fn resolve(&self, param: &Param, ctx: &RequestContext) -> Result<Arg>;
}

pub trait ContextResolverFactory: Send + Sync {
    fn supports(&self, param: &Param) -> bool;

    fn create(&self, param: &Param) -> Result<Arc<dyn ContextResolver>>;

    fn order(&self) -> i32 {
        0
    }
}

/// Wraps the resolution of a bound parameter.
///
/// Implementations call [`ParamNext::proceed`] at most once, or return
/// their own value to short-circuit.
pub trait ParamResolverAdvice: Send + Sync {
    fn resolve(
        &self,
        param: &Param,
        ctx: &RequestContext,
        next: ParamNext<'_>,
    ) -> Result<Option<Arg>>;
}

pub trait ParamResolverAdviceFactory: Send + Sync {
    fn supports(&self, param: &Param) -> bool;

    fn create(&self, param: &Param) -> Result<Arc<dyn ParamResolverAdvice>>;

    fn order(&self) -> i32 {
        0
    }
}

/// Remainder of a parameter advice chain.
pub struct ParamNext<'a> {
    advices: &'a [Arc<dyn ParamResolverAdvice>],
    resolver: &'a dyn ParamResolver,
}

impl<'a> ParamNext<'a> {
    pub(crate) fn new(
        advices: &'a [Arc<dyn ParamResolverAdvice>],
        resolver: &'a dyn ParamResolver,
    ) -> Self {
        Self { advices, resolver }
    }

    /// Runs the next advice, or the resolver once the chain is exhausted.
    pub fn proceed(self, param: &Param, ctx: &RequestContext) -> Result<Option<Arg>> {
        match self.advices.split_first() {
            Some((advice, rest)) => advice.resolve(param, ctx, ParamNext::new(rest, self.resolver)),
            None => self.resolver.resolve(param, ctx),
        }
    }
}

/// Sorts factories by order, keeping registration order among equals.
pub(crate) fn sort_by_order<T: ?Sized>(items: &mut [Arc<T>], order: impl Fn(&T) -> i32) {
    items.sort_by_key(|item| order(&**item));
}

/// Query, header, path, cookie and matrix parameters.
///
/// Parameters with no declared source are bound as optional query values.
#[derive(Debug, Default)]
pub struct NamedValueResolverFactory;

impl ParamResolverFactory for NamedValueResolverFactory {
    fn supports(&self, param: &Param) -> bool {
        param.string_converter().is_some() && NamedValueKind::from_source(param.source()).is_some()
    }

    fn create(&self, param: &Param) -> Result<Arc<dyn ParamResolver>> {
        let kind = NamedValueKind::from_source(param.source())
            .ok_or_else(|| Error::NoSuitableResolver(param.to_string()))?;
        let converter = param
            .string_converter()
            .cloned()
            .ok_or_else(|| Error::NoSuitableResolver(param.to_string()))?;
        let required_by_default = *param.source() != ParamSource::Unannotated;
        let resolver = NamedValueResolver::new(kind, converter, required_by_default);
        Ok(Arc::new(ParamResolverAdapter::new(param, Arc::new(resolver))?))
    }

    fn order(&self) -> i32 {
        LOWEST_PRECEDENCE
    }
}

/// Resolves parameters declared with [`Param::context`].
#[derive(Debug, Default)]
pub struct FromContextResolverFactory;

struct FromContextResolver;

impl ContextResolver for FromContextResolver {
    fn resolve(&self, param: &Param, ctx: &RequestContext) -> Result<Arg> {
        let extract = param
            .context_extractor()
            .ok_or_else(|| Error::NoSuitableResolver(param.to_string()))?;
        extract(ctx)
    }
}

impl ContextResolverFactory for FromContextResolverFactory {
    fn supports(&self, param: &Param) -> bool {
        param.context_extractor().is_some()
    }

    fn create(&self, _param: &Param) -> Result<Arc<dyn ContextResolver>> {
        Ok(Arc::new(FromContextResolver))
    }

    fn order(&self) -> i32 {
        LOWEST_PRECEDENCE
    }
}

impl FromContext for Arc<HttpRequest> {
    fn from_context(ctx: &RequestContext) -> Result<Self> {
        Ok(ctx.request_arc())
    }
}

impl FromContext for ResponseHandle {
    fn from_context(ctx: &RequestContext) -> Result<Self> {
        Ok(ctx.response_handle().clone())
    }
}

impl FromContext for RequestId {
    fn from_context(ctx: &RequestContext) -> Result<Self> {
        Ok(ctx.id())
    }
}

impl<T: Send + Sync + 'static> FromContext for State<T> {
    fn from_context(ctx: &RequestContext) -> Result<Self> {
        ctx.extensions()
            .get_arc::<T>()
            .map(State)
            .ok_or_else(|| Error::Internal(format!("no state of type {}", type_name::<T>())))
    }
}
