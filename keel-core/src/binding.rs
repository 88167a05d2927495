//! Bind-time resolver selection.
//!
//! Every handler parameter gets exactly one [`ResolvableBinding`], chosen
//! once when the route is deployed and reused for every request. Selection
//! walks the tiers in order: a fixed resolver supplied by the handler, then
//! context resolvers, then parameter resolvers, then request entity
//! resolvers.

use crate::context::RequestContext;
use crate::entity::{
    RawBodyResolverFactory, RequestEntityBinding, RequestEntityResolverAdviceFactory,
    RequestEntityResolverFactory, ResponseBinding, ResponseEntityResolverAdviceFactory,
    ResponseEntityResolverFactory, SerializerEntityResolverFactory,
    SerializerResponseEntityResolverFactory,
};
use crate::handler::{HandlerAdviceFactory, HandlerMethod};
use crate::param::{Arg, Args, Param};
use crate::resolver::{
    ContextResolver, ContextResolverFactory, FromContextResolverFactory, NamedValueResolverFactory,
    ParamNext, ParamResolver, ParamResolverAdvice, ParamResolverAdviceFactory,
    ParamResolverFactory, sort_by_order,
};
use crate::serializer::Serializers;
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// The resolver chosen for one parameter.
pub enum ResolvableBinding {
    /// Supplied by the handler for this position.
    Fixed(Arc<dyn ParamResolver>),
    Context(Arc<dyn ContextResolver>),
    Param {
        resolver: Arc<dyn ParamResolver>,
        advices: Vec<Arc<dyn ParamResolverAdvice>>,
    },
    Entity(RequestEntityBinding),
    /// Nothing supported the parameter and the deployment chose to report
    /// it per request instead of failing.
    Unresolvable(String),
}

impl ResolvableBinding {
    pub fn resolve(&self, param: &Param, ctx: &RequestContext) -> Result<Option<Arg>> {
        match self {
            ResolvableBinding::Fixed(resolver) => resolver.resolve(param, ctx),
            ResolvableBinding::Context(resolver) => resolver.resolve(param, ctx).map(Some),
            ResolvableBinding::Param { resolver, advices } => {
                ParamNext::new(advices, resolver.as_ref()).proceed(param, ctx)
            }
            ResolvableBinding::Entity(binding) => binding.resolve(param, ctx),
            ResolvableBinding::Unresolvable(describe) => {
                Err(Error::NoSuitableResolver(describe.clone()))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ResolvableBinding::Fixed(_) => "fixed",
            ResolvableBinding::Context(_) => "context",
            ResolvableBinding::Param { .. } => "param",
            ResolvableBinding::Entity(_) => "entity",
            ResolvableBinding::Unresolvable(_) => "unresolvable",
        }
    }
}

impl fmt::Debug for ResolvableBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// All bindings of one handler, in parameter order.
pub struct ArgumentBindings {
    method: Arc<str>,
    params: Vec<Param>,
    bindings: Vec<ResolvableBinding>,
}

impl ArgumentBindings {
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn binding(&self, index: usize) -> Option<&ResolvableBinding> {
        self.bindings.get(index)
    }

    /// Resolves every argument for one request.
    pub fn resolve(&self, ctx: &RequestContext) -> Result<Args> {
        let mut values = Vec::with_capacity(self.bindings.len());
        for (param, binding) in self.params.iter().zip(&self.bindings) {
            trace!(param = %param, binding = binding.kind(), "resolving argument");
            values.push(binding.resolve(param, ctx)?);
        }
        Ok(Args::new(self.method.clone(), values))
    }
}

/// The priority-ordered SPI registries consulted at bind time.
///
/// Registration order breaks ties between equal orders.
#[derive(Clone, Default)]
pub struct ResolverRegistry {
    context: Vec<Arc<dyn ContextResolverFactory>>,
    params: Vec<Arc<dyn ParamResolverFactory>>,
    param_advices: Vec<Arc<dyn ParamResolverAdviceFactory>>,
    request_entities: Vec<Arc<dyn RequestEntityResolverFactory>>,
    request_advices: Vec<Arc<dyn RequestEntityResolverAdviceFactory>>,
    response_entities: Vec<Arc<dyn ResponseEntityResolverFactory>>,
    response_advices: Vec<Arc<dyn ResponseEntityResolverAdviceFactory>>,
    handler_advices: Vec<Arc<dyn HandlerAdviceFactory>>,
    defer_unresolvable: bool,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in resolvers, all at the lowest precedence.
    pub fn with_defaults(serializers: &Serializers, streaming: bool) -> Self {
        let mut registry = Self::new();
        registry.add_context_resolver(Arc::new(FromContextResolverFactory));
        registry.add_param_resolver(Arc::new(NamedValueResolverFactory));
        registry.add_request_entity_resolver(Arc::new(RawBodyResolverFactory));
        registry.add_request_entity_resolver(Arc::new(SerializerEntityResolverFactory::new(
            serializers.clone(),
        )));
        registry.add_response_entity_resolver(Arc::new(
            SerializerResponseEntityResolverFactory::new(serializers.clone()).streaming(streaming),
        ));
        registry
    }

    pub fn add_context_resolver(&mut self, factory: Arc<dyn ContextResolverFactory>) {
        self.context.push(factory);
        sort_by_order(&mut self.context, |f| f.order());
    }

    pub fn add_param_resolver(&mut self, factory: Arc<dyn ParamResolverFactory>) {
        self.params.push(factory);
        sort_by_order(&mut self.params, |f| f.order());
    }

    pub fn add_param_advice(&mut self, factory: Arc<dyn ParamResolverAdviceFactory>) {
        self.param_advices.push(factory);
        sort_by_order(&mut self.param_advices, |f| f.order());
    }

    pub fn add_request_entity_resolver(&mut self, factory: Arc<dyn RequestEntityResolverFactory>) {
        self.request_entities.push(factory);
        sort_by_order(&mut self.request_entities, |f| f.order());
    }

    pub fn add_request_entity_advice(
        &mut self,
        factory: Arc<dyn RequestEntityResolverAdviceFactory>,
    ) {
        self.request_advices.push(factory);
        sort_by_order(&mut self.request_advices, |f| f.order());
    }

    pub fn add_response_entity_resolver(
        &mut self,
        factory: Arc<dyn ResponseEntityResolverFactory>,
    ) {
        self.response_entities.push(factory);
        sort_by_order(&mut self.response_entities, |f| f.order());
    }

    pub fn add_response_entity_advice(
        &mut self,
        factory: Arc<dyn ResponseEntityResolverAdviceFactory>,
    ) {
        self.response_advices.push(factory);
        sort_by_order(&mut self.response_advices, |f| f.order());
    }

    pub fn add_handler_advice(&mut self, factory: Arc<dyn HandlerAdviceFactory>) {
        self.handler_advices.push(factory);
        sort_by_order(&mut self.handler_advices, |f| f.order());
    }

    /// Appends every factory of `other`, keeping each list ordered.
    pub fn extend(&mut self, other: &ResolverRegistry) {
        other.context.iter().for_each(|f| self.add_context_resolver(f.clone()));
        other.params.iter().for_each(|f| self.add_param_resolver(f.clone()));
        other.param_advices.iter().for_each(|f| self.add_param_advice(f.clone()));
        other
            .request_entities
            .iter()
            .for_each(|f| self.add_request_entity_resolver(f.clone()));
        other
            .request_advices
            .iter()
            .for_each(|f| self.add_request_entity_advice(f.clone()));
        other
            .response_entities
            .iter()
            .for_each(|f| self.add_response_entity_resolver(f.clone()));
        other
            .response_advices
            .iter()
            .for_each(|f| self.add_response_entity_advice(f.clone()));
        other.handler_advices.iter().for_each(|f| self.add_handler_advice(f.clone()));
        self.defer_unresolvable |= other.defer_unresolvable;
    }

    /// Binds unsupported parameters to a request-time
    /// [`Error::NoSuitableResolver`] instead of failing the deployment.
    pub fn set_defer_unresolvable(&mut self, defer: bool) {
        self.defer_unresolvable = defer;
    }

    /// Chooses the binding for one parameter.
    pub fn bind_param(&self, handler: &HandlerMethod, param: &Param) -> Result<ResolvableBinding> {
        if let Some(fixed) = handler.fixed_resolver_for(param.index()) {
            return Ok(ResolvableBinding::Fixed(fixed.clone()));
        }
        if param.is_ambiguous() {
            return Err(Error::Deployment(format!(
                "{param} declares more than one source: {:?}",
                param.sources()
            )));
        }

        if let Some(factory) = self.context.iter().find(|f| f.supports(param)) {
            return factory.create(param).map(ResolvableBinding::Context);
        }

        if let Some(factory) = self.params.iter().find(|f| f.supports(param)) {
            let resolver = factory.create(param)?;
            let advices = self
                .param_advices
                .iter()
                .filter(|f| f.supports(param))
                .map(|f| f.create(param))
                .collect::<Result<Vec<_>>>()?;
            return Ok(ResolvableBinding::Param { resolver, advices });
        }

        let resolvers = self
            .request_entities
            .iter()
            .filter(|f| f.supports(param))
            .map(|f| f.create(param))
            .collect::<Result<Vec<_>>>()?;
        if !resolvers.is_empty() {
            let advices = self
                .request_advices
                .iter()
                .filter(|f| f.supports(param))
                .map(|f| f.create(param))
                .collect::<Result<Vec<_>>>()?;
            return Ok(ResolvableBinding::Entity(RequestEntityBinding::new(
                advices, resolvers,
            )));
        }

        if self.defer_unresolvable {
            return Ok(ResolvableBinding::Unresolvable(param.to_string()));
        }
        Err(Error::NoSuitableResolver(param.to_string()))
    }

    pub fn bind_arguments(&self, handler: &HandlerMethod) -> Result<ArgumentBindings> {
        let bindings = handler
            .params()
            .iter()
            .map(|param| self.bind_param(handler, param))
            .collect::<Result<Vec<_>>>()?;
        Ok(ArgumentBindings {
            method: handler.name_arc(),
            params: handler.params().to_vec(),
            bindings,
        })
    }

    /// Response resolvers and advices for a handler with the given produces.
    pub fn bind_response(
        &self,
        handler: &HandlerMethod,
        produces: Vec<crate::content_negotiation::MediaType>,
    ) -> Result<ResponseBinding> {
        let resolvers = self
            .response_entities
            .iter()
            .filter(|f| f.supports(handler))
            .map(|f| f.create(handler))
            .collect::<Result<Vec<_>>>()?;
        let advices = self
            .response_advices
            .iter()
            .filter(|f| f.supports(handler))
            .map(|f| f.create(handler))
            .collect::<Result<Vec<_>>>()?;
        Ok(ResponseBinding::new(
            advices,
            resolvers,
            produces,
            handler.name_arc(),
        ))
    }

    pub fn bind_handler_advices(
        &self,
        handler: &HandlerMethod,
    ) -> Result<Vec<Arc<dyn crate::handler::HandlerAdvice>>> {
        self.handler_advices
            .iter()
            .filter(|f| f.supports(handler))
            .map(|f| f.create(handler))
            .collect()
    }
}
