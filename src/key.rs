//! Request key helpers.
//!
//! A request key is an opaque string; equal keys are the same logical
//! request. These helpers build keys in one consistent shape so that two
//! call sites asking for the same resource end up sharing a cache entry and
//! an in-flight operation.

use std::fmt::Display;

const SEPARATOR: char = ':';

/// Builder for request keys.
pub struct KeyBuilder;

impl KeyBuilder {
    /// `resource:id`
    pub fn build(resource: &str, id: &dyn Display) -> String {
        format!("{}{}{}", resource, SEPARATOR, id)
    }

    /// Build composite key from multiple parts.
    pub fn build_composite(parts: &[&str]) -> String {
        parts.join(&SEPARATOR.to_string())
    }

    /// `resource?k1=v1&k2=v2` with parameters sorted by name, so parameter
    /// order at the call site does not split one request into two keys.
    ///
    /// Names and values are percent-encoded, so distinct parameter lists
    /// never build the same key.
    pub fn build_with_params(resource: &str, params: &[(&str, &dyn Display)]) -> String {
        if params.is_empty() {
            return resource.to_string();
        }
        let mut pairs: Vec<String> = params
            .iter()
            .map(|(name, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(name),
                    urlencoding::encode(&value.to_string())
                )
            })
            .collect();
        pairs.sort();
        format!("{}?{}", resource, pairs.join("&"))
    }

    /// Split a composite key into parts.
    pub fn parse(key: &str) -> Vec<&str> {
        key.split(SEPARATOR).collect()
    }

    /// Resource part of a key built by this builder.
    pub fn resource(key: &str) -> &str {
        key.split(['?', SEPARATOR]).next().unwrap_or(key)
    }
}
