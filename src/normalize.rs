use serde::Serialize;
use serde_json::Value;

/// The unified result shape handed back to MCP clients: the Provider-B
/// "v0100" array of `{title, url, description?}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedResult {
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Coerce any JSON value to a string; non-strings become empty.
fn safe_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

/// First present (non-null) field among the candidates, coerced.
fn first_present(row: &Value, fields: &[&str]) -> Option<String> {
    for field in fields {
        match row.get(field) {
            None | Some(Value::Null) => continue,
            Some(v) => return Some(safe_string(Some(v))),
        }
    }
    None
}

fn result_rows<'a>(body: &'a Value, paths: &[&[&str]]) -> &'a [Value] {
    for path in paths {
        let mut node = body;
        let mut found = true;
        for seg in *path {
            match node.get(seg) {
                Some(next) => node = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            if let Value::Array(rows) = node {
                return rows;
            }
        }
    }
    &[]
}

/// Normalize a Provider-B web search body. Rows carrying neither a title
/// nor a url are dropped.
pub fn normalize_web(body: &Value) -> Vec<NormalizedResult> {
    result_rows(body, &[&["results"], &["web", "results"]])
        .iter()
        .filter_map(|row| {
            let title = safe_string(row.get("title"));
            let url = safe_string(row.get("url"));
            if title.is_empty() && url.is_empty() {
                return None;
            }
            Some(NormalizedResult {
                title,
                url,
                description: first_present(row, &["description", "snippet", "content"]),
            })
        })
        .collect()
}

/// Normalize a Provider-B local search body. Accepts `name` as a title
/// fallback and `website` as a url fallback.
pub fn normalize_local(body: &Value) -> Vec<NormalizedResult> {
    result_rows(
        body,
        &[&["local", "results"], &["results"], &["web", "results"]],
    )
    .iter()
    .filter_map(|row| {
        let title = match row.get("title") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => safe_string(row.get("name")),
        };
        let url = match row.get("url") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => safe_string(row.get("website")),
        };
        if title.is_empty() && url.is_empty() {
            return None;
        }
        Some(NormalizedResult {
            title,
            url,
            description: first_present(row, &["description", "snippet", "content"]),
        })
    })
    .collect()
}

/// Map a Provider-T body onto the Provider-B shape. Same length and order,
/// no filtering; empty content collapses to an omitted description.
pub fn tavily_to_brave(body: &Value) -> Vec<NormalizedResult> {
    result_rows(body, &[&["results"]])
        .iter()
        .map(|row| {
            let content = safe_string(row.get("content"));
            NormalizedResult {
                title: safe_string(row.get("title")),
                url: safe_string(row.get("url")),
                description: (!content.is_empty()).then_some(content),
            }
        })
        .collect()
}

/// Pretty-print for the MCP text content block.
pub fn to_pretty_json(results: &[NormalizedResult]) -> String {
    serde_json::to_string_pretty(results).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_web_results_direct_and_nested() {
        let body = json!({"web": {"results": [
            {"title": "t", "url": "u", "description": "d"}
        ]}});
        assert_eq!(
            normalize_web(&body),
            vec![NormalizedResult {
                title: "t".into(),
                url: "u".into(),
                description: Some("d".into()),
            }]
        );

        let body = json!({"results": [{"title": "only", "url": "x"}]});
        assert_eq!(normalize_web(&body)[0].title, "only");
        assert_eq!(normalize_web(&body)[0].description, None);
    }

    #[test]
    fn test_web_description_fallback_chain() {
        let body = json!({"results": [
            {"title": "a", "url": "u1", "snippet": "s"},
            {"title": "b", "url": "u2", "content": "c"},
            {"title": "c", "url": "u3", "description": null, "snippet": "after-null"}
        ]});
        let rows = normalize_web(&body);
        assert_eq!(rows[0].description, Some("s".into()));
        assert_eq!(rows[1].description, Some("c".into()));
        assert_eq!(rows[2].description, Some("after-null".into()));
    }

    #[test]
    fn test_web_drops_titleless_urlless_rows() {
        let body = json!({"results": [
            {"description": "orphan"},
            {"title": "keep", "url": ""}
        ]});
        let rows = normalize_web(&body);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "keep");
    }

    #[test]
    fn test_web_missing_everything_is_empty() {
        assert!(normalize_web(&json!({})).is_empty());
        assert!(normalize_web(&json!({"web": {}})).is_empty());
        assert!(normalize_web(&json!({"results": "not-an-array"})).is_empty());
    }

    #[test]
    fn test_local_fallbacks() {
        let body = json!({"local": {"results": [
            {"name": "Cafe Neun", "website": "https://neun.example", "description": "coffee"}
        ]}});
        let rows = normalize_local(&body);
        assert_eq!(rows[0].title, "Cafe Neun");
        assert_eq!(rows[0].url, "https://neun.example");

        // Falls back through results paths like web search.
        let body = json!({"results": [{"title": "t", "url": "u"}]});
        assert_eq!(normalize_local(&body).len(), 1);
    }

    #[test]
    fn test_tavily_mapping_preserves_length_and_order() {
        let body = json!({"results": [
            {"title": "t1", "url": "u1", "content": "c1"},
            {"title": "t2", "url": "u2", "content": ""},
            {"title": "", "url": "", "content": "only-content"}
        ]});
        let rows = tavily_to_brave(&body);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].description, Some("c1".into()));
        assert_eq!(rows[1].description, None);
        // No filtering, even for empty title/url.
        assert_eq!(rows[2].description, Some("only-content".into()));
    }

    #[test]
    fn test_safe_string_coerces_non_strings() {
        let body = json!({"results": [{"title": 42, "url": "u"}]});
        let rows = normalize_web(&body);
        assert_eq!(rows[0].title, "");
        assert_eq!(rows[0].url, "u");
    }

    #[test]
    fn test_pretty_json_is_indented() {
        let rows = vec![NormalizedResult {
            title: "t".into(),
            url: "u".into(),
            description: None,
        }];
        let text = to_pretty_json(&rows);
        assert!(text.contains("\n  {"));
        assert!(!text.contains("description"));
    }
}
