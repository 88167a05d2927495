// Keel - a declarative HTTP request pipeline for Rust
//
// Routes are registered as handler methods with mappings and parameter
// descriptors; the deployment binds them once and the dispatcher runs every
// request through routing, argument resolution, interceptors, scheduling and
// content negotiation.

// Re-export core functionality
pub use keel_core::*;

// Re-export optional crates
#[cfg(feature = "config")]
pub use keel_config;

#[cfg(feature = "testing")]
pub use keel_testing;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        Args, Controller, Deployment, Dispatcher, Error, HandlerMethod, HttpMethod, HttpRequest,
        HttpResponse, HttpStatus, Interceptor, InterceptorRegistration, LogConfig, Mapping,
        MediaType, Param, Reply, RequestContext, Result, Scheduler, Schedulers, Server,
    };
}
