//! Request and response entity resolution.
//!
//! Both directions run an ordered advice chain whose terminal step walks a
//! list of candidate resolvers. Advices receive a continuation that can be
//! consumed once; returning without consuming it short-circuits the chain.

use crate::content_negotiation::{MediaType, is_unconstrained};
use crate::context::RequestContext;
use crate::handler::HandlerMethod;
use crate::param::{Arg, BodyDecoder, Param};
use crate::resolver::LOWEST_PRECEDENCE;
use crate::serializer::Serializers;
use crate::{Error, Result};
use bytes::Bytes;
use http::header;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Outcome of a resolver that may decline.
#[derive(Debug)]
pub enum Handled<T> {
    Succeed(T),
    /// The resolver cannot handle this input; the next one is tried.
    Failed,
}

/// Scalar handler results rendered without a serializer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Char(char),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(v) => v.fmt(f),
            Scalar::Int(v) => v.fmt(f),
            Scalar::UInt(v) => v.fmt(f),
            Scalar::Float(v) => v.fmt(f),
            Scalar::Char(v) => v.fmt(f),
        }
    }
}

/// What a handler returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    Buffer(Bytes),
    Scalar(Scalar),
    /// Structured value written through content negotiation.
    Entity(Value),
}

impl Reply {
    pub fn entity<T: Serialize>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Reply::Entity)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Kinds written directly, bypassing serializer lookup.
    pub fn is_fast_path(&self) -> bool {
        !matches!(self, Reply::Entity(_))
    }
}

impl From<()> for Reply {
    fn from(_: ()) -> Self {
        Reply::Empty
    }
}

impl From<String> for Reply {
    fn from(s: String) -> Self {
        Reply::Text(s)
    }
}

impl From<&'static str> for Reply {
    fn from(s: &'static str) -> Self {
        Reply::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Reply {
    fn from(b: Vec<u8>) -> Self {
        Reply::Bytes(b)
    }
}

impl From<Bytes> for Reply {
    fn from(b: Bytes) -> Self {
        Reply::Buffer(b)
    }
}

impl From<Value> for Reply {
    fn from(v: Value) -> Self {
        Reply::Entity(v)
    }
}

macro_rules! scalar_reply {
    ($($ty:ty => $variant:ident as $target:ty),* $(,)?) => {
        $(
            impl From<$ty> for Reply {
                fn from(v: $ty) -> Self {
                    Reply::Scalar(Scalar::$variant(v as $target))
                }
            }
        )*
    };
}

scalar_reply!(
    i32 => Int as i64,
    i64 => Int as i64,
    u32 => UInt as u64,
    u64 => UInt as u64,
    usize => UInt as u64,
    f64 => Float as f64,
);

impl From<bool> for Reply {
    fn from(v: bool) -> Self {
        Reply::Scalar(Scalar::Bool(v))
    }
}

impl From<char> for Reply {
    fn from(v: char) -> Self {
        Reply::Scalar(Scalar::Char(v))
    }
}

// ---------------------------------------------------------------------------
// Request entities
// ---------------------------------------------------------------------------

/// The request body as seen by request entity resolvers and advices.
pub struct RequestEntity<'a> {
    param: &'a Param,
    content_type: Option<MediaType>,
    body: Bytes,
}

impl<'a> RequestEntity<'a> {
    pub fn new(param: &'a Param, content_type: Option<MediaType>, body: Bytes) -> Self {
        Self {
            param,
            content_type,
            body,
        }
    }

    pub fn param(&self) -> &Param {
        self.param
    }

    pub fn content_type(&self) -> Option<&MediaType> {
        self.content_type.as_ref()
    }

    pub fn set_content_type(&mut self, content_type: Option<MediaType>) {
        self.content_type = content_type;
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Replaces the body seen by later advices and the resolvers.
    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }
}

pub trait RequestEntityResolver: Send + Sync {
    fn read_from(&self, entity: &RequestEntity<'_>, ctx: &RequestContext) -> Result<Handled<Arg>>;
}

pub trait RequestEntityResolverFactory: Send + Sync {
    fn supports(&self, param: &Param) -> bool;

    fn create(&self, param: &Param) -> Result<Arc<dyn RequestEntityResolver>>;

    fn order(&self) -> i32 {
        0
    }
}

pub trait RequestEntityResolverAdvice: Send + Sync {
    fn read_from(
        &self,
        entity: &mut RequestEntity<'_>,
        ctx: &RequestContext,
        next: RequestEntityNext<'_>,
    ) -> Result<Option<Arg>>;
}

pub trait RequestEntityResolverAdviceFactory: Send + Sync {
    fn supports(&self, param: &Param) -> bool;

    fn create(&self, param: &Param) -> Result<Arc<dyn RequestEntityResolverAdvice>>;

    fn order(&self) -> i32 {
        0
    }
}

/// Remainder of a request entity advice chain.
pub struct RequestEntityNext<'a> {
    advices: &'a [Arc<dyn RequestEntityResolverAdvice>],
    resolvers: &'a [Arc<dyn RequestEntityResolver>],
}

impl<'a> RequestEntityNext<'a> {
    pub fn new(
        advices: &'a [Arc<dyn RequestEntityResolverAdvice>],
        resolvers: &'a [Arc<dyn RequestEntityResolver>],
    ) -> Self {
        Self { advices, resolvers }
    }

    pub fn proceed(
        self,
        entity: &mut RequestEntity<'_>,
        ctx: &RequestContext,
    ) -> Result<Option<Arg>> {
        match self.advices.split_first() {
            Some((advice, rest)) => {
                advice.read_from(entity, ctx, RequestEntityNext::new(rest, self.resolvers))
            }
            None => read_with_resolvers(self.resolvers, entity, ctx),
        }
    }
}

/// Terminal step: an empty body is absent, otherwise the first resolver
/// that succeeds wins.
fn read_with_resolvers(
    resolvers: &[Arc<dyn RequestEntityResolver>],
    entity: &RequestEntity<'_>,
    ctx: &RequestContext,
) -> Result<Option<Arg>> {
    if entity.body().is_empty() {
        return Ok(None);
    }
    for resolver in resolvers {
        if let Handled::Succeed(arg) = resolver.read_from(entity, ctx)? {
            return Ok(Some(arg));
        }
    }
    Err(Error::UnsupportedMediaType(
        entity
            .content_type()
            .map(MediaType::to_string)
            .unwrap_or_else(|| "request without content type".into()),
    ))
}

/// Bound entity resolution for one body parameter.
pub struct RequestEntityBinding {
    advices: Vec<Arc<dyn RequestEntityResolverAdvice>>,
    resolvers: Vec<Arc<dyn RequestEntityResolver>>,
}

impl RequestEntityBinding {
    pub fn new(
        advices: Vec<Arc<dyn RequestEntityResolverAdvice>>,
        resolvers: Vec<Arc<dyn RequestEntityResolver>>,
    ) -> Self {
        Self { advices, resolvers }
    }

    pub fn resolve(&self, param: &Param, ctx: &RequestContext) -> Result<Option<Arg>> {
        let request = ctx.request();
        let mut entity = RequestEntity::new(param, request.content_type(), request.body.clone());
        let value = RequestEntityNext::new(&self.advices, &self.resolvers).proceed(&mut entity, ctx)?;
        if value.is_none() && param.is_required().unwrap_or(true) {
            return Err(Error::MissingRequiredValue(
                param
                    .declared_name()
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "request body".into()),
            ));
        }
        Ok(value)
    }
}

/// Bytes, `Vec<u8>` and `String` bodies, read without a codec.
#[derive(Debug, Default)]
pub struct RawBodyResolverFactory;

struct RawBodyResolver;

impl RequestEntityResolver for RawBodyResolver {
    fn read_from(&self, entity: &RequestEntity<'_>, _ctx: &RequestContext) -> Result<Handled<Arg>> {
        match entity.param().body_decoder() {
            Some(decoder @ BodyDecoder::Raw(_)) => {
                decoder.decode_bytes(entity.body().clone()).map(Handled::Succeed)
            }
            _ => Ok(Handled::Failed),
        }
    }
}

impl RequestEntityResolverFactory for RawBodyResolverFactory {
    fn supports(&self, param: &Param) -> bool {
        param.body_decoder().is_some_and(BodyDecoder::is_raw)
    }

    fn create(&self, _param: &Param) -> Result<Arc<dyn RequestEntityResolver>> {
        Ok(Arc::new(RawBodyResolver))
    }

    fn order(&self) -> i32 {
        LOWEST_PRECEDENCE - 1
    }
}

/// Typed bodies read through the serializer matching the content type.
pub struct SerializerEntityResolverFactory {
    serializers: Serializers,
}

impl SerializerEntityResolverFactory {
    pub fn new(serializers: Serializers) -> Self {
        Self { serializers }
    }
}

struct SerializerEntityResolver {
    serializers: Serializers,
}

impl RequestEntityResolver for SerializerEntityResolver {
    fn read_from(&self, entity: &RequestEntity<'_>, _ctx: &RequestContext) -> Result<Handled<Arg>> {
        let Some(decoder) = entity.param().body_decoder() else {
            return Ok(Handled::Failed);
        };
        let Some(serializer) = self.serializers.for_reading(entity.content_type()) else {
            return Ok(Handled::Failed);
        };
        trace!(serializer = serializer.name(), param = %entity.param(), "reading request entity");
        let value = serializer.deserialize(entity.body())?;
        decoder.decode_value(value).map(Handled::Succeed)
    }
}

impl RequestEntityResolverFactory for SerializerEntityResolverFactory {
    fn supports(&self, param: &Param) -> bool {
        matches!(param.body_decoder(), Some(BodyDecoder::Typed(_)))
    }

    fn create(&self, _param: &Param) -> Result<Arc<dyn RequestEntityResolver>> {
        Ok(Arc::new(SerializerEntityResolver {
            serializers: self.serializers.clone(),
        }))
    }

    fn order(&self) -> i32 {
        LOWEST_PRECEDENCE
    }
}

// ---------------------------------------------------------------------------
// Response entities
// ---------------------------------------------------------------------------

/// A handler result on its way to the response.
#[derive(Debug)]
pub struct ResponseEntity {
    reply: Reply,
    produces: Arc<[MediaType]>,
    handler: Arc<str>,
}

impl ResponseEntity {
    pub fn new(reply: Reply, produces: Arc<[MediaType]>, handler: Arc<str>) -> Self {
        Self {
            reply,
            produces,
            handler,
        }
    }

    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    pub fn set_reply(&mut self, reply: Reply) {
        self.reply = reply;
    }

    /// Media types the route declares it produces.
    pub fn produces(&self) -> &[MediaType] {
        &self.produces
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }
}

/// How a response entity ended up on the sink.
#[derive(Debug)]
pub enum Rendered {
    Bytes {
        body: Bytes,
        media_type: Option<MediaType>,
    },
    /// Written straight to the output stream; nothing left to send.
    AlreadyWritten,
}

pub trait ResponseEntityResolver: Send + Sync {
    /// Media types this resolver can produce.
    fn media_types(&self) -> &[MediaType];

    /// Writes the entity as `media_type`, or declines.
    fn write_to(
        &self,
        entity: &ResponseEntity,
        media_type: &MediaType,
        ctx: &mut RequestContext,
    ) -> Result<Handled<Rendered>>;

    fn supports(&self, media_type: &MediaType) -> bool {
        self.media_types()
            .iter()
            .any(|m| m.is_compatible_with(media_type))
    }
}

pub trait ResponseEntityResolverFactory: Send + Sync {
    fn supports(&self, handler: &HandlerMethod) -> bool;

    fn create(&self, handler: &HandlerMethod) -> Result<Arc<dyn ResponseEntityResolver>>;

    fn order(&self) -> i32 {
        0
    }
}

pub trait ResponseEntityResolverAdvice: Send + Sync {
    fn write_to(
        &self,
        entity: &mut ResponseEntity,
        ctx: &mut RequestContext,
        next: ResponseEntityNext<'_>,
    ) -> Result<Rendered>;
}

pub trait ResponseEntityResolverAdviceFactory: Send + Sync {
    fn supports(&self, handler: &HandlerMethod) -> bool;

    fn create(&self, handler: &HandlerMethod) -> Result<Arc<dyn ResponseEntityResolverAdvice>>;

    fn order(&self) -> i32 {
        0
    }
}

/// Remainder of a response entity advice chain.
pub struct ResponseEntityNext<'a> {
    advices: &'a [Arc<dyn ResponseEntityResolverAdvice>],
    resolvers: &'a [Arc<dyn ResponseEntityResolver>],
}

impl<'a> ResponseEntityNext<'a> {
    pub fn new(
        advices: &'a [Arc<dyn ResponseEntityResolverAdvice>],
        resolvers: &'a [Arc<dyn ResponseEntityResolver>],
    ) -> Self {
        Self { advices, resolvers }
    }

    pub fn proceed(self, entity: &mut ResponseEntity, ctx: &mut RequestContext) -> Result<Rendered> {
        match self.advices.split_first() {
            Some((advice, rest)) => {
                advice.write_to(entity, ctx, ResponseEntityNext::new(rest, self.resolvers))
            }
            None => write_with_resolvers(self.resolvers, entity, ctx),
        }
    }
}

/// Media types to try, in order: the route's produces narrowed by the
/// caller's accept list, or the accept list alone. Empty means no
/// preference.
pub fn acceptable_media_types(produces: &[MediaType], accepted: &[MediaType]) -> Result<Vec<MediaType>> {
    if produces.is_empty() {
        return Ok(if is_unconstrained(accepted) {
            Vec::new()
        } else {
            accepted.to_vec()
        });
    }
    if is_unconstrained(accepted) {
        return Ok(produces.to_vec());
    }
    let mut candidates: Vec<MediaType> = Vec::new();
    for wanted in accepted {
        for offered in produces {
            if wanted.is_compatible_with(offered) {
                let chosen = wanted.more_specific(offered).clone().with_quality(1.0);
                if !candidates.contains(&chosen) {
                    candidates.push(chosen);
                }
            }
        }
    }
    if candidates.is_empty() {
        return Err(Error::not_acceptable(accepted));
    }
    Ok(candidates)
}

/// Terminal step of the response chain.
///
/// Fast-path kinds are written directly. Otherwise, with no preference the
/// resolvers are tried in order with their own preferred type; with a
/// preference the accepted types are walked outermost and the resolvers
/// innermost, and the first resolver that matches and succeeds wins.
fn write_with_resolvers(
    resolvers: &[Arc<dyn ResponseEntityResolver>],
    entity: &ResponseEntity,
    ctx: &mut RequestContext,
) -> Result<Rendered> {
    if let Some(rendered) = fast_path(entity) {
        return Ok(rendered);
    }

    let candidates = acceptable_media_types(entity.produces(), &ctx.request().accept())?;
    if entity.produces().len() != 1 {
        ctx.response_mut()
            .set_header(header::VARY, header::HeaderValue::from_static("accept"));
    }

    if candidates.is_empty() {
        for resolver in resolvers {
            let Some(preferred) = resolver.media_types().first() else {
                continue;
            };
            if let Handled::Succeed(rendered) = resolver.write_to(entity, preferred, ctx)? {
                return Ok(rendered);
            }
        }
        return Err(Error::not_acceptable(
            resolvers.iter().filter_map(|r| r.media_types().first()),
        ));
    }

    for wanted in &candidates {
        for resolver in resolvers {
            let Some(offered) = resolver
                .media_types()
                .iter()
                .find(|m| m.is_compatible_with(wanted))
            else {
                continue;
            };
            let media_type = concrete(wanted, offered);
            trace!(handler = entity.handler(), media_type = %media_type, "writing response entity");
            if let Handled::Succeed(rendered) = resolver.write_to(entity, &media_type, ctx)? {
                return Ok(rendered);
            }
        }
    }
    Err(Error::not_acceptable(&candidates))
}

fn concrete(wanted: &MediaType, offered: &MediaType) -> MediaType {
    let chosen = wanted.more_specific(offered);
    if chosen.is_concrete() {
        chosen.clone().with_quality(1.0)
    } else {
        wanted.clone().with_quality(1.0)
    }
}

/// Writes text, bytes, buffers and scalars without a serializer.
fn fast_path(entity: &ResponseEntity) -> Option<Rendered> {
    let declared = match entity.produces() {
        [only] if only.is_concrete() => Some(only.clone()),
        _ => None,
    };
    let (body, media_type) = match entity.reply() {
        Reply::Empty => (Bytes::new(), None),
        Reply::Text(s) => (
            Bytes::from(s.clone()),
            Some(declared.unwrap_or_else(MediaType::plain_text_utf8)),
        ),
        Reply::Bytes(b) => (
            Bytes::from(b.clone()),
            Some(declared.unwrap_or_else(MediaType::octet_stream)),
        ),
        Reply::Buffer(b) => (
            b.clone(),
            Some(declared.unwrap_or_else(MediaType::octet_stream)),
        ),
        Reply::Scalar(s) => (
            Bytes::from(s.to_string()),
            Some(declared.unwrap_or_else(MediaType::plain_text_utf8)),
        ),
        Reply::Entity(_) => return None,
    };
    Some(Rendered::Bytes { body, media_type })
}

/// Bound response resolution for one route.
pub struct ResponseBinding {
    advices: Vec<Arc<dyn ResponseEntityResolverAdvice>>,
    resolvers: Vec<Arc<dyn ResponseEntityResolver>>,
    produces: Arc<[MediaType]>,
    handler: Arc<str>,
}

impl ResponseBinding {
    pub fn new(
        advices: Vec<Arc<dyn ResponseEntityResolverAdvice>>,
        resolvers: Vec<Arc<dyn ResponseEntityResolver>>,
        produces: Vec<MediaType>,
        handler: Arc<str>,
    ) -> Self {
        Self {
            advices,
            resolvers,
            produces: produces.into(),
            handler,
        }
    }

    /// Resolves the reply and commits it to the response sink.
    pub fn write(&self, reply: Reply, ctx: &mut RequestContext) -> Result<()> {
        let mut entity = ResponseEntity::new(reply, self.produces.clone(), self.handler.clone());
        let rendered =
            ResponseEntityNext::new(&self.advices, &self.resolvers).proceed(&mut entity, ctx)?;
        match rendered {
            Rendered::AlreadyWritten => Ok(()),
            Rendered::Bytes { body, media_type } => {
                let response = ctx.response_mut();
                if let Some(media_type) = media_type {
                    response.set_content_type(&media_type)?;
                }
                response.send_bytes(body)
            }
        }
    }
}

/// Writes entities through the serializer registry.
///
/// With `streaming` set, the serializer writes straight into the response
/// output stream and the chain reports [`Rendered::AlreadyWritten`].
pub struct SerializerResponseEntityResolver {
    serializers: Serializers,
    media_types: Vec<MediaType>,
    streaming: bool,
}

impl SerializerResponseEntityResolver {
    pub fn new(serializers: Serializers, streaming: bool) -> Self {
        let mut media_types: Vec<MediaType> = Vec::new();
        for serializer in serializers.iter() {
            for media_type in serializer.media_types() {
                if !media_types.contains(media_type) {
                    media_types.push(media_type.clone());
                }
            }
        }
        Self {
            serializers,
            media_types,
            streaming,
        }
    }
}

impl ResponseEntityResolver for SerializerResponseEntityResolver {
    fn media_types(&self) -> &[MediaType] {
        &self.media_types
    }

    fn write_to(
        &self,
        entity: &ResponseEntity,
        media_type: &MediaType,
        ctx: &mut RequestContext,
    ) -> Result<Handled<Rendered>> {
        let Reply::Entity(value) = entity.reply() else {
            return Ok(Handled::Failed);
        };
        let Some(serializer) = self
            .serializers
            .iter()
            .find(|s| s.supports(media_type) && s.can_write(value))
        else {
            trace!(media_type = %media_type, "no serializer can render this entity");
            return Ok(Handled::Failed);
        };
        let media_type = if media_type.is_concrete() {
            media_type.clone()
        } else {
            serializer.media_types().first().cloned().unwrap_or_else(MediaType::octet_stream)
        };

        if self.streaming {
            let response = ctx.response_mut();
            response.set_content_type(&media_type)?;
            serializer.serialize_to(value, &mut response.output_stream()?)?;
            return Ok(Handled::Succeed(Rendered::AlreadyWritten));
        }
        let body = serializer.serialize(value)?;
        Ok(Handled::Succeed(Rendered::Bytes {
            body,
            media_type: Some(media_type),
        }))
    }
}

/// Registers [`SerializerResponseEntityResolver`] for every handler.
pub struct SerializerResponseEntityResolverFactory {
    serializers: Serializers,
    streaming: bool,
}

impl SerializerResponseEntityResolverFactory {
    pub fn new(serializers: Serializers) -> Self {
        Self {
            serializers,
            streaming: false,
        }
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

impl ResponseEntityResolverFactory for SerializerResponseEntityResolverFactory {
    fn supports(&self, _handler: &HandlerMethod) -> bool {
        true
    }

    fn create(&self, _handler: &HandlerMethod) -> Result<Arc<dyn ResponseEntityResolver>> {
        Ok(Arc::new(SerializerResponseEntityResolver::new(
            self.serializers.clone(),
            self.streaming,
        )))
    }

    fn order(&self) -> i32 {
        LOWEST_PRECEDENCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HttpMethod, HttpRequest};
    use serde_json::json;

    struct Fixed {
        media_types: Vec<MediaType>,
        accepts: fn(&MediaType) -> bool,
        tag: &'static str,
    }

    impl ResponseEntityResolver for Fixed {
        fn media_types(&self) -> &[MediaType] {
            &self.media_types
        }

        fn write_to(
            &self,
            _entity: &ResponseEntity,
            media_type: &MediaType,
            _ctx: &mut RequestContext,
        ) -> Result<Handled<Rendered>> {
            if !(self.accepts)(media_type) {
                return Ok(Handled::Failed);
            }
            Ok(Handled::Succeed(Rendered::Bytes {
                body: Bytes::from(self.tag),
                media_type: Some(media_type.clone()),
            }))
        }
    }

    fn s1_s2() -> Vec<Arc<dyn ResponseEntityResolver>> {
        vec![
            Arc::new(Fixed {
                media_types: vec![MediaType::json()],
                accepts: |_| true,
                tag: "S1",
            }),
            Arc::new(Fixed {
                media_types: vec![MediaType::any()],
                accepts: |m| m.essence() == "application/octet-stream",
                tag: "S2",
            }),
        ]
    }

    fn ctx(accept: Option<&str>) -> RequestContext {
        let mut req = HttpRequest::new(HttpMethod::GET, "/");
        if let Some(accept) = accept {
            req.append_header("accept", accept).unwrap();
        }
        RequestContext::new(req)
    }

    fn entity(reply: Reply, produces: Vec<MediaType>) -> ResponseEntity {
        ResponseEntity::new(reply, produces.into(), Arc::from("test::handler"))
    }

    fn rendered_tag(rendered: Rendered) -> Bytes {
        match rendered {
            Rendered::Bytes { body, .. } => body,
            Rendered::AlreadyWritten => Bytes::new(),
        }
    }

    #[test]
    fn test_negotiation_selects_first_matching_resolver() {
        let resolvers = s1_s2();
        let e = entity(Reply::Entity(json!({})), vec![]);
        let mut c = ctx(Some("application/json"));
        let out = write_with_resolvers(&resolvers, &e, &mut c).unwrap();
        assert_eq!(rendered_tag(out), Bytes::from("S1"));
    }

    #[test]
    fn test_negotiation_not_acceptable_lists_attempted() {
        let resolvers = s1_s2();
        let e = entity(Reply::Entity(json!({})), vec![]);
        let err = write_with_resolvers(&resolvers, &e, &mut ctx(Some("text/plain"))).unwrap_err();
        match err {
            Error::NotAcceptable { attempted } => assert_eq!(attempted, ["text/plain"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_negotiation_is_stable() {
        let resolvers = s1_s2();
        let e = entity(Reply::Entity(json!({})), vec![]);
        for _ in 0..10 {
            let mut c = ctx(Some("application/octet-stream, application/json"));
            let out = write_with_resolvers(&resolvers, &e, &mut c).unwrap();
            assert_eq!(rendered_tag(out), Bytes::from("S2"));
        }
    }

    #[test]
    fn test_no_preference_uses_resolver_order() {
        let resolvers = s1_s2();
        let e = entity(Reply::Entity(json!({})), vec![]);
        let out = write_with_resolvers(&resolvers, &e, &mut ctx(None)).unwrap();
        assert_eq!(rendered_tag(out), Bytes::from("S1"));
    }

    #[test]
    fn test_fast_paths_bypass_resolvers() {
        let e = entity(Reply::Text("hi".into()), vec![]);
        match write_with_resolvers(&[], &e, &mut ctx(Some("application/json"))).unwrap() {
            Rendered::Bytes { body, media_type } => {
                assert_eq!(body, Bytes::from("hi"));
                assert_eq!(media_type.unwrap().essence(), "text/plain");
            }
            Rendered::AlreadyWritten => panic!("fast path must not stream"),
        }
        let e = entity(Reply::from(42u32), vec![]);
        assert!(matches!(
            write_with_resolvers(&[], &e, &mut ctx(None)).unwrap(),
            Rendered::Bytes { ref body, .. } if body == &Bytes::from("42")
        ));
        let e = entity(Reply::Buffer(Bytes::from_static(b"\x00\x01")), vec![]);
        assert!(matches!(
            write_with_resolvers(&[], &e, &mut ctx(None)).unwrap(),
            Rendered::Bytes { media_type: Some(ref m), .. } if *m == MediaType::octet_stream()
        ));
    }

    #[test]
    fn test_acceptable_media_types() {
        let produces = vec![MediaType::json(), MediaType::plain_text()];
        let accepted = crate::content_negotiation::parse_accept(["text/*"]);
        assert_eq!(
            acceptable_media_types(&produces, &accepted).unwrap(),
            [MediaType::plain_text()]
        );
        assert_eq!(acceptable_media_types(&produces, &[]).unwrap(), produces);
        let png = crate::content_negotiation::parse_accept(["image/png"]);
        assert!(acceptable_media_types(&produces, &png).is_err());
        assert!(acceptable_media_types(&[], &[MediaType::any()]).unwrap().is_empty());
    }

    struct Envelope;

    impl ResponseEntityResolverAdvice for Envelope {
        fn write_to(
            &self,
            entity: &mut ResponseEntity,
            ctx: &mut RequestContext,
            next: ResponseEntityNext<'_>,
        ) -> Result<Rendered> {
            if let Reply::Entity(value) = entity.reply() {
                let wrapped = json!({"data": value.clone()});
                entity.set_reply(Reply::Entity(wrapped));
            }
            next.proceed(entity, ctx)
        }
    }

    #[test]
    fn test_binding_runs_advices_and_writes_sink() {
        let serializers = Serializers::with_defaults();
        let binding = ResponseBinding::new(
            vec![Arc::new(Envelope)],
            vec![Arc::new(SerializerResponseEntityResolver::new(serializers, false))],
            vec![],
            Arc::from("test::handler"),
        );
        let mut c = ctx(Some("application/json"));
        binding.write(Reply::Entity(json!({"id": 1})), &mut c).unwrap();
        let response = c.into_response();
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(response.header("vary"), Some("accept"));
        let body: Value = serde_json::from_slice(&response.body()).unwrap();
        assert_eq!(body, json!({"data": {"id": 1}}));
    }

    #[test]
    fn test_default_serializers_skip_codec_that_cannot_render() {
        let resolvers: Vec<Arc<dyn ResponseEntityResolver>> = vec![Arc::new(
            SerializerResponseEntityResolver::new(Serializers::with_defaults(), false),
        )];
        let e = entity(Reply::Entity(json!({"v": 1})), vec![]);

        let mut c = ctx(Some("text/plain, application/json"));
        match write_with_resolvers(&resolvers, &e, &mut c).unwrap() {
            Rendered::Bytes { body, media_type } => {
                assert_eq!(body, Bytes::from(r#"{"v":1}"#));
                assert_eq!(media_type.unwrap().essence(), "application/json");
            }
            Rendered::AlreadyWritten => panic!("expected a buffered body"),
        }

        let err = write_with_resolvers(&resolvers, &e, &mut ctx(Some("text/plain"))).unwrap_err();
        assert!(matches!(err, Error::NotAcceptable { .. }));
    }

    #[test]
    fn test_streaming_resolver_writes_directly() {
        let resolver = SerializerResponseEntityResolver::new(Serializers::with_defaults(), true);
        let binding = ResponseBinding::new(
            vec![],
            vec![Arc::new(resolver)],
            vec![MediaType::json()],
            Arc::from("test::handler"),
        );
        let mut c = ctx(None);
        binding.write(Reply::Entity(json!([1, 2])), &mut c).unwrap();
        assert!(c.response().is_streaming());
        assert_eq!(c.response().body(), Bytes::from("[1,2]"));
    }

    #[test]
    fn test_request_entity_chain() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Greeting {
            text: String,
        }

        struct Upcase;

        impl RequestEntityResolverAdvice for Upcase {
            fn read_from(
                &self,
                entity: &mut RequestEntity<'_>,
                ctx: &RequestContext,
                next: RequestEntityNext<'_>,
            ) -> Result<Option<Arg>> {
                let upper = String::from_utf8_lossy(entity.body()).to_uppercase();
                entity.set_body(Bytes::from(upper.replace("TEXT", "text")));
                next.proceed(entity, ctx)
            }
        }

        let mut param = Param::body::<Greeting>();
        param.bind_to(Arc::from("greet"), 0);
        let factory = SerializerEntityResolverFactory::new(Serializers::with_defaults());
        assert!(factory.supports(&param));
        let binding = RequestEntityBinding::new(
            vec![Arc::new(Upcase)],
            vec![factory.create(&param).unwrap()],
        );

        let req = HttpRequest::new(HttpMethod::POST, "/")
            .with_header("content-type", "application/json")
            .unwrap()
            .with_body(r#"{"text":"hello"}"#);
        let value = binding.resolve(&param, &RequestContext::new(req)).unwrap().unwrap();
        assert_eq!(*value.downcast::<Greeting>().unwrap(), Greeting { text: "HELLO".into() });

        let empty = RequestContext::new(HttpRequest::new(HttpMethod::POST, "/"));
        assert!(matches!(
            binding.resolve(&param, &empty),
            Err(Error::MissingRequiredValue(_))
        ));

        let xml = HttpRequest::new(HttpMethod::POST, "/")
            .with_header("content-type", "application/xml")
            .unwrap()
            .with_body("<text/>");
        assert!(matches!(
            binding.resolve(&param, &RequestContext::new(xml)),
            Err(Error::UnsupportedMediaType(_))
        ));
    }

    #[test]
    fn test_raw_body() {
        let param = Param::raw_body::<String>();
        let binding = RequestEntityBinding::new(
            vec![],
            vec![RawBodyResolverFactory.create(&param).unwrap()],
        );
        let req = HttpRequest::new(HttpMethod::POST, "/").with_body("plain words");
        let value = binding.resolve(&param, &RequestContext::new(req)).unwrap().unwrap();
        assert_eq!(*value.downcast::<String>().unwrap(), "plain words");
    }
}
