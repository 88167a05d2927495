//! Named-value resolution: query, header, path, cookie and matrix values.
//!
//! A [`NameAndValueResolver`] only knows how to pull raw values for a name
//! out of the request. [`ParamResolverAdapter`] turns it into a full
//! parameter resolver by finalizing the [`NameAndValue`] at bind time and
//! applying the default and required rules per request.

use crate::context::RequestContext;
use crate::param::{Arg, DeclaredDefault, Param, ParamSource, SharedArg, StringConverter};
use crate::resolver::ParamResolver;
use crate::{Error, Result};
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;

type Thunk = Arc<dyn Fn() -> Result<SharedArg> + Send + Sync>;

/// Default applied when no raw value is present.
#[derive(Clone, Default)]
pub enum DefaultValue {
    #[default]
    NoDefault,
    /// Converted at bind time.
    Eager(SharedArg),
    /// Evaluated on first use, then reused for every request.
    Lazy(LazyDefault),
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::NoDefault => f.write_str("NoDefault"),
            DefaultValue::Eager(_) => f.write_str("Eager(..)"),
            DefaultValue::Lazy(lazy) => write!(f, "Lazy(evaluated: {})", lazy.is_evaluated()),
        }
    }
}

/// Memoized default thunk.
#[derive(Clone)]
pub struct LazyDefault {
    thunk: Thunk,
    cell: Arc<OnceCell<SharedArg>>,
}

impl LazyDefault {
    pub fn new(thunk: impl Fn() -> Result<SharedArg> + Send + Sync + 'static) -> Self {
        Self {
            thunk: Arc::new(thunk),
            cell: Arc::new(OnceCell::new()),
        }
    }

    pub fn get(&self) -> Result<&SharedArg> {
        self.cell.get_or_try_init(|| (self.thunk)())
    }

    pub fn is_evaluated(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl DefaultValue {
    pub fn is_present(&self) -> bool {
        !matches!(self, DefaultValue::NoDefault)
    }

    fn shared(&self) -> Result<Option<&SharedArg>> {
        match self {
            DefaultValue::NoDefault => Ok(None),
            DefaultValue::Eager(value) => Ok(Some(value)),
            DefaultValue::Lazy(lazy) => lazy.get().map(Some),
        }
    }
}

/// Name, required flag and default of a named parameter.
#[derive(Debug, Clone, Default)]
pub struct NameAndValue {
    pub name: String,
    pub required: bool,
    pub default: DefaultValue,
}

impl NameAndValue {
    pub fn new(name: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            required,
            default: DefaultValue::NoDefault,
        }
    }

    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = default;
        self
    }
}

/// Extracts raw values for a name from the request.
pub trait NameAndValueResolver: Send + Sync {
    /// Initial name/required/default derived from the parameter metadata.
    fn create_name_and_value(&self, param: &Param) -> NameAndValue;

    /// Resolves the value, or `None` when the request carries none.
    fn resolve(&self, name: &str, ctx: &RequestContext) -> Result<Option<Arg>>;
}

/// Completes a [`NameAndValue`] at bind time.
///
/// The name falls back to the parameter's declared name; the default is the
/// explicit one when declared, otherwise the type's zero value for
/// parameters that are not required.
pub fn update_named_value(param: &Param, mut nv: NameAndValue) -> Result<NameAndValue> {
    if nv.name.is_empty() {
        nv.name = param
            .declared_name()
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Deployment(format!("{param} has no name and none could be inferred"))
            })?;
    }

    if nv.default.is_present() {
        return Ok(nv);
    }

    let converter = param.string_converter().cloned();
    nv.default = match (param.declared_default(), converter) {
        (Some(DeclaredDefault::Raw(raw)), Some(converter)) => {
            let arg = converter.convert(raw).map_err(|e| {
                Error::Deployment(format!("invalid default {raw:?} for {param}: {e}"))
            })?;
            let shared = converter.share(arg).ok_or_else(|| {
                Error::Deployment(format!("default for {param} could not be cached"))
            })?;
            DefaultValue::Eager(shared)
        }
        (Some(DeclaredDefault::Raw(_)), None) => {
            return Err(Error::Deployment(format!(
                "{param} declares a string default but has no converter"
            )));
        }
        (Some(DeclaredDefault::Supplier(supplier)), _) => {
            let supplier = supplier.clone();
            DefaultValue::Lazy(LazyDefault::new(move || Ok(supplier())))
        }
        (None, Some(converter)) if !nv.required => match converter.zero() {
            Some(zero) => converter
                .share(zero)
                .map(DefaultValue::Eager)
                .unwrap_or_default(),
            None => DefaultValue::NoDefault,
        },
        (None, _) => DefaultValue::NoDefault,
    };
    Ok(nv)
}

/// Adapts a [`NameAndValueResolver`] into a [`ParamResolver`].
pub struct ParamResolverAdapter {
    resolver: Arc<dyn NameAndValueResolver>,
    nv: NameAndValue,
    converter: Option<Arc<dyn StringConverter>>,
    describe: String,
}

impl ParamResolverAdapter {
    pub fn new(param: &Param, resolver: Arc<dyn NameAndValueResolver>) -> Result<Self> {
        let nv = update_named_value(param, resolver.create_name_and_value(param))?;
        Ok(Self {
            resolver,
            nv,
            converter: param.string_converter().cloned(),
            describe: param.to_string(),
        })
    }

    pub fn name_and_value(&self) -> &NameAndValue {
        &self.nv
    }

    fn materialize(&self, shared: &SharedArg) -> Result<Arg> {
        self.converter
            .as_ref()
            .and_then(|c| c.duplicate(shared))
            .ok_or_else(|| {
                Error::Internal(format!("default of {} has the wrong type", self.describe))
            })
    }
}

impl ParamResolver for ParamResolverAdapter {
    fn resolve(&self, _param: &Param, ctx: &RequestContext) -> Result<Option<Arg>> {
        if let Some(value) = self.resolver.resolve(&self.nv.name, ctx)? {
            return Ok(Some(value));
        }
        if let Some(shared) = self.nv.default.shared()? {
            return self.materialize(shared).map(Some);
        }
        if self.nv.required {
            return Err(Error::MissingRequiredValue(self.nv.name.clone()));
        }
        Ok(None)
    }
}

/// Request part a [`NamedValueResolver`] reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamedValueKind {
    Query,
    Header,
    PathVariable,
    Cookie,
    Matrix { path_var: Option<String> },
}

impl NamedValueKind {
    pub fn from_source(source: &ParamSource) -> Option<Self> {
        match source {
            ParamSource::Query | ParamSource::Unannotated => Some(NamedValueKind::Query),
            ParamSource::Header => Some(NamedValueKind::Header),
            ParamSource::PathVariable => Some(NamedValueKind::PathVariable),
            ParamSource::Cookie => Some(NamedValueKind::Cookie),
            ParamSource::Matrix { path_var } => Some(NamedValueKind::Matrix {
                path_var: path_var.clone(),
            }),
            ParamSource::Body | ParamSource::Context => None,
        }
    }

    fn raw_values(&self, name: &str, ctx: &RequestContext) -> Vec<String> {
        let request = ctx.request();
        match self {
            NamedValueKind::Query => request.query_values(name).to_vec(),
            NamedValueKind::Header => request
                .header_values(name)
                .into_iter()
                .map(str::to_string)
                .collect(),
            NamedValueKind::PathVariable => {
                ctx.path_variable(name).map(str::to_string).into_iter().collect()
            }
            NamedValueKind::Cookie => request.cookie_values(name),
            NamedValueKind::Matrix { path_var } => ctx.matrix_values(name, path_var.as_deref()),
        }
    }
}

/// Built-in resolver for every [`NamedValueKind`].
pub struct NamedValueResolver {
    kind: NamedValueKind,
    converter: Arc<dyn StringConverter>,
    /// Whether the source makes the value required when the parameter is
    /// silent about it.
    required_by_default: bool,
}

impl NamedValueResolver {
    pub fn new(
        kind: NamedValueKind,
        converter: Arc<dyn StringConverter>,
        required_by_default: bool,
    ) -> Self {
        Self {
            kind,
            converter,
            required_by_default,
        }
    }
}

impl NameAndValueResolver for NamedValueResolver {
    fn create_name_and_value(&self, param: &Param) -> NameAndValue {
        NameAndValue::new(
            param.declared_name().unwrap_or_default(),
            param.is_required().unwrap_or(self.required_by_default),
        )
    }

    fn resolve(&self, name: &str, ctx: &RequestContext) -> Result<Option<Arg>> {
        let raw = self.kind.raw_values(name, ctx);
        if raw.is_empty() {
            return Ok(None);
        }

        let converted = if raw.len() > 1 {
            self.converter
                .convert_all(&raw)
                .unwrap_or_else(|| self.converter.convert(&raw[0]))
        } else {
            self.converter.convert(&raw[0])
        };
        converted
            .map(Some)
            .map_err(|e| Error::Conversion(format!("{name}: {e}")))
    }
}
