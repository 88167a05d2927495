// Core library for the keel request pipeline
// Route binding, argument resolution, content negotiation, interceptors and
// scheduling, plus a hyper transport.

pub mod binding;
pub mod content_negotiation;
pub mod context;
pub mod deployment;
pub mod dispatcher;
pub mod entity;
pub mod error;
pub mod exception;
pub mod extensions;
pub mod handler;
pub mod http;
pub mod interceptor;
pub mod logging;
pub mod mapping;
pub mod name_value;
pub mod param;
pub mod resolver;
pub mod routing;
pub mod scheduler;
pub mod serializer;
pub mod server;
pub mod status;

// Re-export commonly used types
pub use binding::{ArgumentBindings, ResolvableBinding, ResolverRegistry};
pub use content_negotiation::MediaType;
pub use context::{RequestContext, RequestId, ResponseHandle};
pub use deployment::{Controller, Deployment};
pub use dispatcher::Dispatcher;
pub use entity::{Handled, Rendered, Reply, Scalar};
pub use error::Error;
pub use exception::{DefaultExceptionResolver, ExceptionResolver, ExceptionResolvers};
pub use extensions::{Extensions, State};
pub use handler::{Handler, HandlerAdvice, HandlerMethod, InvokeNext, IntoHandler};
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use interceptor::{Interceptor, InterceptorRegistration, PathFilter};
pub use logging::LogConfig;
pub use mapping::Mapping;
pub use name_value::{DefaultValue, NameAndValue};
pub use param::{Arg, Args, FromContext, Param, ParamType, RawBody};
pub use routing::{Route, Router};
pub use scheduler::{Scheduler, Schedulers, TimeoutPolicy};
pub use serializer::{HttpBodySerializer, Serializers};
pub use server::Server;
pub use status::HttpStatus;

pub type Result<T> = std::result::Result<T, Error>;
