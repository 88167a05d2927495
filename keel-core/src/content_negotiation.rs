//! Media types and `Accept` header handling.
//!
//! Negotiation walks the caller's accepted media types in preference order
//! (quality first, header order for ties) and pairs each with the first
//! compatible producible type.
//!
//! ```
//! use keel_core::content_negotiation::{MediaType, parse_accept, negotiate};
//!
//! let accept = parse_accept(["text/html;q=0.5, application/json"]);
//! let available = [MediaType::plain_text(), MediaType::json()];
//! assert_eq!(negotiate(&accept, &available), Some(MediaType::json()));
//! ```

use std::fmt;

/// Quality values are kept in thousandths so media types stay `Eq + Hash`.
const MAX_QUALITY: u16 = 1000;

/// A media type with optional parameters and an `Accept` quality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaType {
    pub type_: String,
    pub subtype: String,
    /// Parameters other than `q`, in declaration order.
    pub params: Vec<(String, String)>,
    quality: u16,
}

impl MediaType {
    pub fn new(type_: impl Into<String>, subtype: impl Into<String>) -> Self {
        Self {
            type_: type_.into().to_ascii_lowercase(),
            subtype: subtype.into().to_ascii_lowercase(),
            params: Vec::new(),
            quality: MAX_QUALITY,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into().to_ascii_lowercase(), value.into()));
        self
    }

    /// Returns a copy carrying the given quality, clamped to `0.0..=1.0`.
    pub fn with_quality(mut self, quality: f32) -> Self {
        self.quality = (quality.clamp(0.0, 1.0) * MAX_QUALITY as f32).round() as u16;
        self
    }

    pub fn quality(&self) -> f32 {
        self.quality as f32 / MAX_QUALITY as f32
    }

    pub fn json() -> Self {
        Self::new("application", "json")
    }

    pub fn plain_text() -> Self {
        Self::new("text", "plain")
    }

    pub fn plain_text_utf8() -> Self {
        Self::plain_text().with_param("charset", "utf-8")
    }

    pub fn form_urlencoded() -> Self {
        Self::new("application", "x-www-form-urlencoded")
    }

    pub fn octet_stream() -> Self {
        Self::new("application", "octet-stream")
    }

    pub fn any() -> Self {
        Self::new("*", "*")
    }

    /// Parses a single media type, including an optional `q` parameter.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split(';');
        let (type_, subtype) = parts.next()?.trim().split_once('/')?;
        let (type_, subtype) = (type_.trim(), subtype.trim());
        if type_.is_empty() || subtype.is_empty() || (type_ == "*" && subtype != "*") {
            return None;
        }

        let mut media_type = MediaType::new(type_, subtype);
        for param in parts {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim().trim_matches('"');
            if key.eq_ignore_ascii_case("q") {
                media_type = media_type.with_quality(value.parse().unwrap_or(1.0));
            } else {
                media_type = media_type.with_param(key, value);
            }
        }
        Some(media_type)
    }

    /// Parses a comma separated list, skipping malformed entries.
    pub fn parse_list(s: &str) -> Vec<Self> {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .filter_map(MediaType::parse)
            .collect()
    }

    pub fn is_wildcard_type(&self) -> bool {
        self.type_ == "*"
    }

    pub fn is_wildcard_subtype(&self) -> bool {
        self.subtype == "*"
    }

    /// Neither type nor subtype is a wildcard.
    pub fn is_concrete(&self) -> bool {
        !self.is_wildcard_type() && !self.is_wildcard_subtype()
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn charset(&self) -> Option<&str> {
        self.param("charset")
    }

    /// `type/subtype` without parameters.
    pub fn essence(&self) -> String {
        format!("{}/{}", self.type_, self.subtype)
    }

    /// Whether `self` covers `other`, so `application/*` includes
    /// `application/json` but not the reverse.
    pub fn includes(&self, other: &MediaType) -> bool {
        if self.is_wildcard_type() {
            return true;
        }
        self.type_ == other.type_ && (self.is_wildcard_subtype() || self.subtype == other.subtype)
    }

    /// Symmetric wildcard match on type and subtype; parameters are ignored.
    pub fn is_compatible_with(&self, other: &MediaType) -> bool {
        self.includes(other) || other.includes(self)
    }

    /// Equality on type, subtype and parameters, ignoring quality.
    pub fn equals_ignoring_quality(&self, other: &MediaType) -> bool {
        self.type_ == other.type_ && self.subtype == other.subtype && self.params == other.params
    }

    /// Of two compatible types, the one to put on the wire.
    pub fn more_specific<'a>(&'a self, other: &'a MediaType) -> &'a MediaType {
        let rank = |m: &MediaType| match (m.is_wildcard_type(), m.is_wildcard_subtype()) {
            (true, _) => 0,
            (false, true) => 1,
            (false, false) => 2 + m.params.len(),
        };
        if rank(other) > rank(self) { other } else { self }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_, self.subtype)?;
        for (key, value) in &self.params {
            write!(f, ";{}={}", key, value)?;
        }
        if self.quality != MAX_QUALITY {
            write!(f, ";q={}", self.quality())?;
        }
        Ok(())
    }
}

/// Parses every `Accept` header occurrence, in order, into one preference
/// list: highest quality first, header order preserved among equals, and
/// `q=0` entries dropped.
pub fn parse_accept<'a, I>(values: I) -> Vec<MediaType>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut accepted: Vec<MediaType> = values
        .into_iter()
        .flat_map(MediaType::parse_list)
        .filter(|m| m.quality > 0)
        .collect();
    accepted.sort_by(|a, b| b.quality.cmp(&a.quality));
    accepted
}

/// True when the `Accept` header lists types and every one of them carries
/// `q=0`; such a caller accepts no representation at all.
pub fn accept_refuses_all<'a, I>(values: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    let mut listed = values.into_iter().flat_map(MediaType::parse_list).peekable();
    listed.peek().is_some() && listed.all(|m| m.quality == 0)
}

/// A preference list that is empty or only `*/*` expresses no preference.
pub fn is_unconstrained(accepted: &[MediaType]) -> bool {
    accepted.iter().all(|m| m.is_wildcard_type())
}

/// Picks the first producible type compatible with the caller's preferences.
///
/// Returns the more specific of each compatible pair so wildcards never
/// reach the `Content-Type` header when a concrete type is available.
pub fn negotiate(accepted: &[MediaType], available: &[MediaType]) -> Option<MediaType> {
    if is_unconstrained(accepted) {
        return available.first().cloned();
    }
    accepted.iter().find_map(|wanted| {
        available
            .iter()
            .find(|offered| wanted.is_compatible_with(offered))
            .map(|offered| strip_quality(wanted.more_specific(offered)))
    })
}

fn strip_quality(media_type: &MediaType) -> MediaType {
    media_type.clone().with_quality(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_params_and_quality() {
        let mt = MediaType::parse("Text/Plain; charset=\"utf-8\"; q=0.4").unwrap();
        assert_eq!(mt.essence(), "text/plain");
        assert_eq!(mt.charset(), Some("utf-8"));
        assert!((mt.quality() - 0.4).abs() < f32::EPSILON);
        assert_eq!(mt.to_string(), "text/plain;charset=utf-8;q=0.4");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(MediaType::parse("json").is_none());
        assert!(MediaType::parse("*/json").is_none());
        assert!(MediaType::parse("/json").is_none());
    }

    #[test]
    fn test_compatibility() {
        let any = MediaType::any();
        let app = MediaType::new("application", "*");
        let json = MediaType::json();
        assert!(app.includes(&json));
        assert!(!json.includes(&app));
        assert!(json.is_compatible_with(&app));
        assert!(any.is_compatible_with(&MediaType::plain_text()));
        assert!(!json.is_compatible_with(&MediaType::plain_text()));
    }

    #[test]
    fn test_accept_concatenates_occurrences_and_sorts_by_quality() {
        let accept = parse_accept(["text/plain;q=0.5, application/xml", "application/json"]);
        let names: Vec<_> = accept.iter().map(|m| m.essence()).collect();
        assert_eq!(names, ["application/xml", "application/json", "text/plain"]);
    }

    #[test]
    fn test_accept_drops_zero_quality() {
        let accept = parse_accept(["application/json;q=0, text/plain"]);
        assert_eq!(accept.len(), 1);
        assert_eq!(accept[0], MediaType::plain_text());
    }

    #[test]
    fn test_accept_refusing_every_type() {
        assert!(accept_refuses_all(["application/json;q=0", "*/*;q=0"]));
        assert!(!accept_refuses_all(["application/json;q=0, text/plain"]));
        assert!(!accept_refuses_all(std::iter::empty()));
        assert!(!accept_refuses_all([""]));
    }

    #[test]
    fn test_negotiate_prefers_specific() {
        let accept = parse_accept(["application/*"]);
        let chosen = negotiate(&accept, &[MediaType::plain_text(), MediaType::json()]);
        assert_eq!(chosen, Some(MediaType::json()));
    }

    #[test]
    fn test_negotiate_without_preference_uses_first_available() {
        let chosen = negotiate(&parse_accept(["*/*"]), &[MediaType::json()]);
        assert_eq!(chosen, Some(MediaType::json()));
        assert_eq!(negotiate(&[], &[]), None);
    }

    #[test]
    fn test_negotiate_incompatible() {
        let accept = parse_accept(["image/png"]);
        assert_eq!(negotiate(&accept, &[MediaType::json()]), None);
    }
}
