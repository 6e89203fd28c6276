//! Dot-path access into JSON documents and `{placeholder}` templates
//!
//! Paths use dot notation (`data.issue.id`); numeric segments index arrays.
//! Templates embed paths in braces: `https://login.example.com/{tid}/v2.0`.

use regex::Regex;
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Read the value at a dot-separated path. Any missing segment yields `None`.
#[must_use]
pub fn lookup_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;

    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(arr) => {
                let index: usize = part.parse().ok()?;
                arr.get(index)?
            }
            _ => return None,
        };
    }

    Some(current)
}

/// Write `value` at a dot-separated path.
///
/// Intermediate segments must already exist; they are never created.
///
/// # Errors
///
/// Returns [`Error::InvalidPath`] if the path is empty, an intermediate
/// segment is missing, or the parent of the last segment is not an object
/// (or an array with that index).
pub fn write_path(document: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(Error::InvalidPath(path.to_string()));
    };
    if last.is_empty() {
        return Err(Error::InvalidPath(path.to_string()));
    }

    let mut current = document;
    for part in parents {
        current = match current {
            Value::Object(map) => map.get_mut(*part),
            Value::Array(arr) => part.parse::<usize>().ok().and_then(|i| arr.get_mut(i)),
            _ => None,
        }
        .ok_or_else(|| {
            Error::InvalidPath(format!("{path}: segment '{part}' does not exist"))
        })?;
    }

    match current {
        Value::Object(map) => {
            map.insert((*last).to_string(), value);
            Ok(())
        }
        Value::Array(arr) => {
            let slot = last
                .parse::<usize>()
                .ok()
                .and_then(|i| arr.get_mut(i))
                .ok_or_else(|| Error::InvalidPath(format!("{path}: index '{last}' out of range")))?;
            *slot = value;
            Ok(())
        }
        _ => Err(Error::InvalidPath(format!(
            "{path}: parent of '{last}' is not an object"
        ))),
    }
}

/// Render a JSON value as template text: strings verbatim, everything else as JSON.
#[must_use]
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        v => v.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A string with `{path}` placeholders, parsed once at configuration time.
///
/// Rendering walks the parsed segments, so substituted text is never
/// scanned for further placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
    placeholders: Vec<String>,
}

impl Template {
    /// Parse a template.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a placeholder is empty (`{}`).
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let re = Regex::new(r"\{([^}]*)\}").map_err(|e| Error::Internal(format!("Invalid regex: {e}")))?;

        let mut segments = Vec::new();
        let mut placeholders = Vec::new();
        let mut last = 0;
        for cap in re.captures_iter(&raw) {
            let (Some(whole), Some(inner)) = (cap.get(0), cap.get(1)) else {
                continue;
            };
            let path = inner.as_str().trim();
            if path.is_empty() {
                return Err(Error::Config(format!("Empty placeholder in template '{raw}'")));
            }
            if whole.start() > last {
                segments.push(Segment::Literal(raw[last..whole.start()].to_string()));
            }
            segments.push(Segment::Placeholder(path.to_string()));
            if !placeholders.iter().any(|p| p == path) {
                placeholders.push(path.to_string());
            }
            last = whole.end();
        }
        if last < raw.len() {
            segments.push(Segment::Literal(raw[last..].to_string()));
        }

        Ok(Self {
            raw,
            segments,
            placeholders,
        })
    }

    /// The unrendered template text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the template contains no placeholders
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.placeholders.is_empty()
    }

    /// Placeholder paths in order of first appearance
    #[must_use]
    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    /// Substitute every placeholder from `source` verbatim.
    ///
    /// # Errors
    ///
    /// Returns the first placeholder path that `source` cannot resolve.
    pub fn render(&self, source: &Value) -> std::result::Result<String, String> {
        self.render_with(source, |text| text)
    }

    /// Substitute every placeholder from `source`, percent-encoding each
    /// value so it stays inside the URL component it was placed in.
    ///
    /// # Errors
    ///
    /// Returns the first placeholder path that `source` cannot resolve.
    pub fn render_url(&self, source: &Value) -> std::result::Result<String, String> {
        self.render_with(source, |text| urlencoding::encode(&text).into_owned())
    }

    fn render_with(
        &self,
        source: &Value,
        encode: impl Fn(String) -> String,
    ) -> std::result::Result<String, String> {
        let mut result = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => result.push_str(text),
                Segment::Placeholder(path) => {
                    let value = lookup_path(source, path).ok_or_else(|| path.clone())?;
                    result.push_str(&encode(value_to_text(value)));
                }
            }
        }
        Ok(result)
    }
}

/// Convenience constructor for an empty JSON object
#[must_use]
pub fn empty_object() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let doc = json!({ "data": { "items": [ { "id": "a" } ] }, "n": 3 });
        assert_eq!(lookup_path(&doc, "data.items.0.id"), Some(&json!("a")));
        assert_eq!(lookup_path(&doc, "n"), Some(&json!(3)));
        assert_eq!(lookup_path(&doc, "data.missing.id"), None);
        assert_eq!(lookup_path(&doc, "n.deeper"), None);
    }

    #[test]
    fn write_requires_existing_parents() {
        let mut doc = json!({ "auth": {} });
        write_path(&mut doc, "auth.token", json!("t")).unwrap();
        assert_eq!(doc, json!({ "auth": { "token": "t" } }));

        let err = write_path(&mut doc, "missing.token", json!("t")).unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
    }

    #[test]
    fn write_rejects_scalar_parent() {
        let mut doc = json!({ "auth": "flat" });
        assert!(matches!(
            write_path(&mut doc, "auth.token", json!(1)),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn template_renders_claims() {
        let template = Template::parse("https://login.example.com/{tid}/v2.0/{tid}").unwrap();
        assert_eq!(template.placeholders(), ["tid".to_string()]);
        let rendered = template.render(&json!({ "tid": "t-1" })).unwrap();
        assert_eq!(rendered, "https://login.example.com/t-1/v2.0/t-1");
    }

    #[test]
    fn substituted_text_is_not_rescanned() {
        let template = Template::parse("{a}/{b}").unwrap();
        let rendered = template.render(&json!({ "a": "{b}", "b": "x" })).unwrap();
        assert_eq!(rendered, "{b}/x");
    }

    #[test]
    fn url_render_keeps_claims_inside_their_component() {
        // GIVEN: a host-templated discovery URL and a hostile tenant claim
        let template =
            Template::parse("https://{tid}.login.example/v2.0/.well-known/openid-configuration")
                .unwrap();
        let claims = json!({ "tid": "attacker.example/x?" });

        // WHEN: rendered for a URL
        let rendered = template.render_url(&claims).unwrap();

        // THEN: the claim cannot end the host or start a path or query
        assert_eq!(
            rendered,
            "https://attacker.example%2Fx%3F.login.example/v2.0/.well-known/openid-configuration"
        );
        assert!(
            url::Url::parse(&rendered)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .is_none_or(|host| host.ends_with(".login.example"))
        );

        let plain = Template::parse("https://login.example/{tid}/v2.0").unwrap();
        assert_eq!(
            plain.render_url(&json!({ "tid": "t-1" })).unwrap(),
            "https://login.example/t-1/v2.0"
        );
    }

    #[test]
    fn template_reports_missing_placeholder() {
        let template = Template::parse("https://x/{tenant.id}").unwrap();
        assert_eq!(template.render(&json!({})), Err("tenant.id".to_string()));
    }

    #[test]
    fn template_without_placeholders_is_literal() {
        let template = Template::parse("https://issuer.example.com").unwrap();
        assert!(template.is_literal());
        assert!(Template::parse("https://x/{}").is_err());
    }
}
