//! `{name}` placeholder interpolation over config documents.
//!
//! Resolution order for a placeholder: the handler-local `variables` table,
//! then keys of the workflow input, then prior node outputs addressed as
//! `{nodeName.path.to.field}` (dot-separated; a bare node name yields the
//! whole output). Unresolved placeholders stay as their literal text.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use common::types::Document;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\}").expect("static pattern")
    })
}

/// Name lookup sources for one render pass.
pub struct RenderScope<'a> {
    locals: Option<&'a serde_json::Map<String, Document>>,
    input: &'a Document,
    outputs: &'a HashMap<String, Document>,
}

impl<'a> RenderScope<'a> {
    pub fn new(input: &'a Document, outputs: &'a HashMap<String, Document>) -> Self {
        Self {
            locals: None,
            input,
            outputs,
        }
    }

    pub fn with_locals(mut self, locals: Option<&'a serde_json::Map<String, Document>>) -> Self {
        self.locals = locals;
        self
    }

    fn resolve(&self, name: &str) -> Option<String> {
        let mut segments = name.split('.');
        let head = segments.next()?;
        let rest: Vec<&str> = segments.collect();

        if let Some(locals) = self.locals {
            if let Some(value) = locals.get(head) {
                return walk(value, &rest).map(stringify);
            }
        }
        if let Some(value) = self.input.get(head) {
            return walk(value, &rest).map(stringify);
        }
        if let Some(value) = self.outputs.get(head) {
            return walk(value, &rest).map(stringify);
        }
        None
    }
}

fn walk<'v>(value: &'v Document, path: &[&str]) -> Option<&'v Document> {
    let mut current = value;
    for segment in path {
        current = match current {
            Document::Object(map) => map.get(*segment)?,
            Document::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn stringify(value: &Document) -> String {
    match value {
        Document::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Interpolate every placeholder in one string. Unknown names keep their
/// braces.
pub fn render_str(template: &str, scope: &RenderScope) -> String {
    placeholder_pattern()
        .replace_all(template, |caps: &regex::Captures| {
            scope
                .resolve(&caps[1])
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Walk a document and interpolate every string in it, preserving shape.
pub fn render_document(doc: &Document, scope: &RenderScope) -> Document {
    match doc {
        Document::String(s) => Document::String(render_str(s, scope)),
        Document::Array(items) => {
            Document::Array(items.iter().map(|item| render_document(item, scope)).collect())
        }
        Document::Object(map) => Document::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), render_document(value, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_outputs() -> HashMap<String, Document> {
        HashMap::new()
    }

    #[test]
    fn resolves_input_keys() {
        let input = json!({"topic": "cats", "count": 3});
        let outputs = no_outputs();
        let scope = RenderScope::new(&input, &outputs);

        assert_eq!(render_str("write about {topic}", &scope), "write about cats");
        assert_eq!(render_str("{count} items", &scope), "3 items");
    }

    #[test]
    fn resolves_nested_output_paths_with_dots() {
        let input = json!({});
        let mut outputs = HashMap::new();
        outputs.insert(
            "searchDocs".to_string(),
            json!({"results": [{"text": "python"}], "total_results": 1}),
        );
        let scope = RenderScope::new(&input, &outputs);

        assert_eq!(
            render_str("found {searchDocs.total_results}", &scope),
            "found 1"
        );
        assert_eq!(
            render_str("first: {searchDocs.results.0.text}", &scope),
            "first: python"
        );
        // Bare node name serializes the whole output.
        assert!(render_str("{searchDocs}", &scope).contains("total_results"));
    }

    #[test]
    fn locals_shadow_input_and_outputs() {
        let input = json!({"name": "from-input"});
        let outputs = no_outputs();
        let config = json!({"variables": {"name": "from-locals"}});
        let locals = config["variables"].as_object();
        let scope = RenderScope::new(&input, &outputs).with_locals(locals);

        assert_eq!(render_str("{name}", &scope), "from-locals");
    }

    #[test]
    fn unresolved_placeholders_stay_literal() {
        let input = json!({});
        let outputs = no_outputs();
        let scope = RenderScope::new(&input, &outputs);

        assert_eq!(render_str("hello {missing}", &scope), "hello {missing}");
        assert_eq!(render_str("{a.b.c}", &scope), "{a.b.c}");
    }

    #[test]
    fn non_string_values_render_as_canonical_json() {
        let input = json!({"flag": true, "obj": {"k": 1}, "none": null});
        let outputs = no_outputs();
        let scope = RenderScope::new(&input, &outputs);

        assert_eq!(render_str("{flag}", &scope), "true");
        assert_eq!(render_str("{obj}", &scope), r#"{"k":1}"#);
        assert_eq!(render_str("{none}", &scope), "null");
    }

    #[test]
    fn render_document_preserves_shape() {
        let input = json!({"city": "Oslo"});
        let outputs = no_outputs();
        let scope = RenderScope::new(&input, &outputs);

        let config = json!({
            "url": "https://api.example.com/{city}",
            "headers": {"X-City": "{city}"},
            "tags": ["{city}", 7],
            "timeout": 30
        });
        let rendered = render_document(&config, &scope);
        assert_eq!(rendered["url"], "https://api.example.com/Oslo");
        assert_eq!(rendered["headers"]["X-City"], "Oslo");
        assert_eq!(rendered["tags"][0], "Oslo");
        assert_eq!(rendered["tags"][1], 7);
        assert_eq!(rendered["timeout"], 30);
    }

    #[test]
    fn render_is_idempotent_once_resolved() {
        let input = json!({"a": "x"});
        let outputs = no_outputs();
        let scope = RenderScope::new(&input, &outputs);

        let once = render_str("{a} and {a}", &scope);
        let twice = render_str(&once, &scope);
        assert_eq!(once, twice);
    }
}
