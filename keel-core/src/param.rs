//! Declarative handler parameter metadata.
//!
//! A [`Param`] describes one handler argument: where its value comes from,
//! its type, whether it is required and its default. It is built once when
//! the handler is registered and read by the resolver factories at bind
//! time; nothing here is consulted per request except the converters.

use crate::context::RequestContext;
use crate::{Error, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::sync::Arc;

/// A resolved, type-erased argument value.
pub type Arg = Box<dyn Any + Send>;

/// A converted value cached across requests, such as a default.
pub type SharedArg = Arc<dyn Any + Send + Sync>;

/// Where a parameter's raw value is read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamSource {
    Query,
    Header,
    PathVariable,
    Cookie,
    /// Matrix variable, optionally restricted to one path variable segment.
    Matrix { path_var: Option<String> },
    Body,
    /// Framework object supplied by the request context.
    Context,
    /// No source declared; treated as an optional query parameter.
    Unannotated,
}

impl ParamSource {
    pub fn is_named(&self) -> bool {
        !matches!(self, ParamSource::Body | ParamSource::Context)
    }
}

/// Coarse shape of a parameter type, used by zero-value handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeShape {
    Scalar,
    Optional,
    Sequence,
    Entity,
    Opaque,
}

/// Static type information of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeInfo {
    pub id: TypeId,
    pub name: &'static str,
    pub shape: TypeShape,
}

impl TypeInfo {
    pub fn of<T: 'static>(shape: TypeShape) -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
            shape,
        }
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

/// Converts raw string values to a parameter's type.
pub trait StringConverter: Send + Sync {
    /// Converts a single raw value.
    fn convert(&self, raw: &str) -> std::result::Result<Arg, String>;

    /// Converts every raw value at once; `None` when the type has no
    /// multi-value form.
    fn convert_all(&self, raw: &[String]) -> Option<std::result::Result<Arg, String>>;

    /// Zero or empty value used for absent, non-required parameters.
    fn zero(&self) -> Option<Arg>;

    /// Moves a converted value into shareable form for caching.
    fn share(&self, arg: Arg) -> Option<SharedArg>;

    /// Produces an owned copy of a cached value.
    fn duplicate(&self, shared: &SharedArg) -> Option<Arg>;
}

/// Types a named value can be converted into.
pub trait ParamType: Clone + Send + Sync + Sized + 'static {
    const SHAPE: TypeShape = TypeShape::Scalar;

    fn from_param(raw: &str) -> std::result::Result<Self, String>;

    fn from_params(_raw: &[String]) -> Option<std::result::Result<Self, String>> {
        None
    }

    fn zero() -> Option<Self> {
        None
    }
}

impl ParamType for String {
    fn from_param(raw: &str) -> std::result::Result<Self, String> {
        Ok(raw.to_string())
    }
}

impl ParamType for bool {
    fn from_param(raw: &str) -> std::result::Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            other => Err(format!("{other:?} is not a boolean")),
        }
    }

    fn zero() -> Option<Self> {
        Some(false)
    }
}

impl ParamType for char {
    fn from_param(raw: &str) -> std::result::Result<Self, String> {
        let mut chars = raw.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(format!("{raw:?} is not a single character")),
        }
    }
}

macro_rules! numeric_param_type {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ParamType for $ty {
                fn from_param(raw: &str) -> std::result::Result<Self, String> {
                    raw.trim()
                        .parse::<$ty>()
                        .map_err(|e| format!("{raw:?} is not a valid {}: {e}", stringify!($ty)))
                }

                fn zero() -> Option<Self> {
                    Some(<$ty>::default())
                }
            }
        )*
    };
}

numeric_param_type!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize, f32, f64);

impl<T: ParamType> ParamType for Option<T> {
    const SHAPE: TypeShape = TypeShape::Optional;

    fn from_param(raw: &str) -> std::result::Result<Self, String> {
        T::from_param(raw).map(Some)
    }

    fn from_params(raw: &[String]) -> Option<std::result::Result<Self, String>> {
        T::from_params(raw).map(|r| r.map(Some))
    }

    fn zero() -> Option<Self> {
        Some(None)
    }
}

impl<T: ParamType> ParamType for Vec<T> {
    const SHAPE: TypeShape = TypeShape::Sequence;

    /// A single raw value is treated as a comma separated list.
    fn from_param(raw: &str) -> std::result::Result<Self, String> {
        raw.split(',')
            .filter(|s| !s.is_empty())
            .map(T::from_param)
            .collect()
    }

    fn from_params(raw: &[String]) -> Option<std::result::Result<Self, String>> {
        Some(raw.iter().map(|s| T::from_param(s)).collect())
    }

    fn zero() -> Option<Self> {
        Some(Vec::new())
    }
}

/// [`StringConverter`] backed by a [`ParamType`] implementation.
pub struct TypedConverter<T>(std::marker::PhantomData<fn() -> T>);

impl<T> Default for TypedConverter<T> {
    fn default() -> Self {
        TypedConverter(std::marker::PhantomData)
    }
}

impl<T: ParamType> StringConverter for TypedConverter<T> {
    fn convert(&self, raw: &str) -> std::result::Result<Arg, String> {
        T::from_param(raw).map(|v| Box::new(v) as Arg)
    }

    fn convert_all(&self, raw: &[String]) -> Option<std::result::Result<Arg, String>> {
        T::from_params(raw).map(|r| r.map(|v| Box::new(v) as Arg))
    }

    fn zero(&self) -> Option<Arg> {
        T::zero().map(|v| Box::new(v) as Arg)
    }

    fn share(&self, arg: Arg) -> Option<SharedArg> {
        arg.downcast::<T>().ok().map(|v| Arc::new(*v) as SharedArg)
    }

    fn duplicate(&self, shared: &SharedArg) -> Option<Arg> {
        shared
            .downcast_ref::<T>()
            .map(|v| Box::new(v.clone()) as Arg)
    }
}

/// Raw body types read without a serializer.
pub trait RawBody: Send + Sized + 'static {
    fn from_body(body: Bytes) -> std::result::Result<Self, String>;
}

impl RawBody for Bytes {
    fn from_body(body: Bytes) -> std::result::Result<Self, String> {
        Ok(body)
    }
}

impl RawBody for Vec<u8> {
    fn from_body(body: Bytes) -> std::result::Result<Self, String> {
        Ok(body.to_vec())
    }
}

impl RawBody for String {
    fn from_body(body: Bytes) -> std::result::Result<Self, String> {
        String::from_utf8(body.to_vec()).map_err(|e| e.to_string())
    }
}

type TypedDecoder = Arc<dyn Fn(serde_json::Value) -> Result<Arg> + Send + Sync>;
type RawDecoder = Arc<dyn Fn(Bytes) -> Result<Arg> + Send + Sync>;
pub(crate) type ContextExtractor = Arc<dyn Fn(&RequestContext) -> Result<Arg> + Send + Sync>;

/// How a body parameter turns the request entity into its value.
#[derive(Clone)]
pub enum BodyDecoder {
    /// Deserialized from a negotiated codec payload.
    Typed(TypedDecoder),
    /// Taken straight from the body bytes.
    Raw(RawDecoder),
}

impl BodyDecoder {
    pub fn decode_value(&self, value: serde_json::Value) -> Result<Arg> {
        match self {
            BodyDecoder::Typed(decode) => decode(value),
            BodyDecoder::Raw(_) => Err(Error::Internal(
                "raw body parameter cannot decode a codec payload".into(),
            )),
        }
    }

    pub fn decode_bytes(&self, body: Bytes) -> Result<Arg> {
        match self {
            BodyDecoder::Raw(decode) => decode(body),
            BodyDecoder::Typed(_) => Err(Error::Internal(
                "typed body parameter requires a codec".into(),
            )),
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, BodyDecoder::Raw(_))
    }
}

/// Types a handler can receive straight from the request context.
pub trait FromContext: Send + Sized + 'static {
    fn from_context(ctx: &RequestContext) -> Result<Self>;
}

/// Declared default of a named parameter.
#[derive(Clone)]
pub(crate) enum DeclaredDefault {
    /// Raw string converted through the parameter's converter at bind time.
    Raw(String),
    /// Thunk evaluated on first use.
    Supplier(Arc<dyn Fn() -> SharedArg + Send + Sync>),
}

/// Metadata for one handler parameter.
#[derive(Clone)]
pub struct Param {
    name: Option<String>,
    index: usize,
    method: Arc<str>,
    type_info: TypeInfo,
    sources: Vec<ParamSource>,
    required: Option<bool>,
    default: Option<DeclaredDefault>,
    converter: Option<Arc<dyn StringConverter>>,
    body: Option<BodyDecoder>,
    context: Option<ContextExtractor>,
}

impl Param {
    fn base(type_info: TypeInfo, source: ParamSource) -> Self {
        Self {
            name: None,
            index: 0,
            method: Arc::from(""),
            type_info,
            sources: vec![source],
            required: None,
            default: None,
            converter: None,
            body: None,
            context: None,
        }
    }

    fn named_value<T: ParamType>(name: &str, source: ParamSource) -> Self {
        let mut param = Self::base(TypeInfo::of::<T>(T::SHAPE), source);
        if !name.is_empty() {
            param.name = Some(name.to_string());
        }
        param.converter = Some(Arc::new(TypedConverter::<T>::default()));
        param
    }

    /// Query string parameter, required unless configured otherwise.
    pub fn query<T: ParamType>(name: &str) -> Self {
        Self::named_value::<T>(name, ParamSource::Query)
    }

    pub fn header<T: ParamType>(name: &str) -> Self {
        Self::named_value::<T>(name, ParamSource::Header)
    }

    pub fn path<T: ParamType>(name: &str) -> Self {
        Self::named_value::<T>(name, ParamSource::PathVariable)
    }

    pub fn cookie<T: ParamType>(name: &str) -> Self {
        Self::named_value::<T>(name, ParamSource::Cookie)
    }

    pub fn matrix<T: ParamType>(name: &str) -> Self {
        Self::named_value::<T>(name, ParamSource::Matrix { path_var: None })
    }

    /// Parameter with no declared source, bound as an optional query value.
    pub fn named<T: ParamType>(name: &str) -> Self {
        Self::named_value::<T>(name, ParamSource::Unannotated)
    }

    /// Request body decoded through the negotiated serializer.
    pub fn body<T: DeserializeOwned + Send + 'static>() -> Self {
        let mut param = Self::base(TypeInfo::of::<T>(TypeShape::Entity), ParamSource::Body);
        param.body = Some(BodyDecoder::Typed(Arc::new(|value| {
            serde_json::from_value::<T>(value)
                .map(|v| Box::new(v) as Arg)
                .map_err(|e| Error::Deserialization(e.to_string()))
        })));
        param
    }

    /// Request body as raw bytes or text, bypassing serializers.
    pub fn raw_body<T: RawBody>() -> Self {
        let mut param = Self::base(TypeInfo::of::<T>(TypeShape::Opaque), ParamSource::Body);
        param.body = Some(BodyDecoder::Raw(Arc::new(|bytes| {
            T::from_body(bytes)
                .map(|v| Box::new(v) as Arg)
                .map_err(Error::Deserialization)
        })));
        param
    }

    /// Framework object taken from the request context.
    pub fn context<T: FromContext>() -> Self {
        let mut param = Self::base(TypeInfo::of::<T>(TypeShape::Opaque), ParamSource::Context);
        param.context = Some(Arc::new(|ctx| T::from_context(ctx).map(|v| Box::new(v) as Arg)));
        param
    }

    /// Parameter of any type with no built-in source; only a fixed resolver
    /// or a registered factory can bind it.
    pub fn opaque<T: Send + 'static>() -> Self {
        Self::base(TypeInfo::of::<T>(TypeShape::Opaque), ParamSource::Context)
    }

    /// Restricts a matrix parameter to one path variable segment.
    pub fn path_var(mut self, var: impl Into<String>) -> Self {
        let var = var.into();
        for source in &mut self.sources {
            if let ParamSource::Matrix { path_var } = source {
                *path_var = Some(var.clone());
            }
        }
        self
    }

    /// Declared name, overriding the one given at construction.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = Some(required);
        self
    }

    /// Default given as a raw string, converted once on first use.
    pub fn default_value(mut self, raw: impl Into<String>) -> Self {
        self.default = Some(DeclaredDefault::Raw(raw.into()));
        self
    }

    /// Default computed by a thunk, evaluated once on first use.
    pub fn default_with<T, F>(mut self, supplier: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.default = Some(DeclaredDefault::Supplier(Arc::new(move || {
            Arc::new(supplier()) as SharedArg
        })));
        self
    }

    /// Replaces the string converter.
    pub fn converter(mut self, converter: Arc<dyn StringConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Declares an additional source; more than one makes binding fail.
    pub fn with_source(mut self, source: ParamSource) -> Self {
        self.sources.push(source);
        self
    }

    pub(crate) fn bind_to(&mut self, method: Arc<str>, index: usize) {
        self.method = method;
        self.index = index;
    }

    pub fn declared_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn type_info(&self) -> &TypeInfo {
        &self.type_info
    }

    /// The single declared source.
    pub fn source(&self) -> &ParamSource {
        &self.sources[0]
    }

    pub fn sources(&self) -> &[ParamSource] {
        &self.sources
    }

    pub fn is_ambiguous(&self) -> bool {
        self.sources.len() > 1
    }

    pub fn is_required(&self) -> Option<bool> {
        self.required
    }

    pub(crate) fn declared_default(&self) -> Option<&DeclaredDefault> {
        self.default.as_ref()
    }

    pub fn string_converter(&self) -> Option<&Arc<dyn StringConverter>> {
        self.converter.as_ref()
    }

    pub fn body_decoder(&self) -> Option<&BodyDecoder> {
        self.body.as_ref()
    }

    pub(crate) fn context_extractor(&self) -> Option<&ContextExtractor> {
        self.context.as_ref()
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Param")
            .field("method", &self.method)
            .field("index", &self.index)
            .field("name", &self.name)
            .field("type", &self.type_info.name)
            .field("sources", &self.sources)
            .field("required", &self.required)
            .finish()
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parameter #{} ", self.index)?;
        if let Some(name) = &self.name {
            write!(f, "'{name}' ")?;
        }
        write!(f, "({}) of {}", self.type_info.name, self.method)
    }
}

/// Resolved arguments, handed to the handler by value.
pub struct Args {
    values: Vec<Option<Arg>>,
    method: Arc<str>,
}

impl Args {
    pub fn new(method: Arc<str>, values: Vec<Option<Arg>>) -> Self {
        Self { values, method }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_present(&self, index: usize) -> bool {
        matches!(self.values.get(index), Some(Some(_)))
    }

    /// Takes a present argument, failing if it is absent or of another type.
    pub fn take<T: 'static>(&mut self, index: usize) -> Result<T> {
        self.take_opt(index)?.ok_or_else(|| {
            Error::Internal(format!("argument #{index} of {} is absent", self.method))
        })
    }

    /// Takes an argument that may legitimately be absent.
    pub fn take_opt<T: 'static>(&mut self, index: usize) -> Result<Option<T>> {
        let slot = self.values.get_mut(index).ok_or_else(|| {
            Error::Internal(format!("{} has no argument #{index}", self.method))
        })?;
        match slot.take() {
            None => Ok(None),
            Some(arg) => match arg.downcast::<T>() {
                Ok(value) => Ok(Some(*value)),
                Err(arg) => {
                    *slot = Some(arg);
                    Err(Error::Internal(format!(
                        "argument #{index} of {} is not a {}",
                        self.method,
                        type_name::<T>()
                    )))
                }
            },
        }
    }
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Args")
            .field("method", &self.method)
            .field("len", &self.values.len())
            .finish()
    }
}
