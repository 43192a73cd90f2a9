//! A small JSONPath subset: dotted child access and `[*]` wildcard array
//! expansion. Recursive descent (`..`) is not part of the corpus and is not
//! supported. `[:_]` and `[_:]` tokens normalize to `[*]` at parse time.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
    Wildcard,
}

pub fn query<'a>(body: &'a Value, path: &str) -> Vec<&'a Value> {
    let segments = parse(path);
    let mut current: Vec<&Value> = vec![body];
    for seg in segments {
        let mut next = Vec::new();
        for v in current {
            match &seg {
                Segment::Field(name) => {
                    if let Some(child) = v.get(name.as_str()) {
                        next.push(child);
                    }
                }
                Segment::Index(i) => {
                    if let Some(child) = v.get(*i) {
                        next.push(child);
                    }
                }
                Segment::Wildcard => {
                    if let Some(arr) = v.as_array() {
                        next.extend(arr.iter());
                    } else if let Some(obj) = v.as_object() {
                        next.extend(obj.values());
                    }
                }
            }
        }
        current = next;
    }
    current
}

fn parse(path: &str) -> Vec<Segment> {
    let normalized = normalize_wildcard_tokens(path);
    let trimmed = normalized.strip_prefix("$.").or_else(|| normalized.strip_prefix('$')).unwrap_or(&normalized);

    let mut segments = Vec::new();
    let mut field = String::new();

    let mut chars = trimmed.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !field.is_empty() {
                    segments.push(Segment::Field(std::mem::take(&mut field)));
                }
            }
            '[' => {
                if !field.is_empty() {
                    segments.push(Segment::Field(std::mem::take(&mut field)));
                }
                let mut bracket = String::new();
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    bracket.push(inner);
                }
                if bracket == "*" {
                    segments.push(Segment::Wildcard);
                } else if let Ok(idx) = bracket.parse::<usize>() {
                    segments.push(Segment::Index(idx));
                }
            }
            other => field.push(other),
        }
    }
    if !field.is_empty() {
        segments.push(Segment::Field(field));
    }
    segments
}

/// Rewrites the `[:_]` and `[_:]` tokens documented in spec.md §4.6 to `[*]`.
fn normalize_wildcard_tokens(path: &str) -> String {
    path.replace("[:_]", "[*]").replace("[_:]", "[*]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wildcard_expands_array() {
        let body = json!({"data": [{"id": "a"}, {"id": "b"}]});
        let results = query(&body, "$.data[*].id");
        let strs: Vec<_> = results.iter().map(|v| v.as_str().unwrap()).collect();
        assert_eq!(strs, vec!["a", "b"]);
    }

    #[test]
    fn colon_underscore_tokens_behave_like_wildcard() {
        let body = json!({"a": [1, 2, 3]});
        let via_colon = query(&body, "$.a[:_]");
        let via_star = query(&body, "$.a[*]");
        assert_eq!(via_colon, via_star);
    }

    #[test]
    fn index_access() {
        let body = json!({"a": [10, 20, 30]});
        let results = query(&body, "$.a[1]");
        assert_eq!(results, vec![&json!(20)]);
    }

    #[test]
    fn missing_path_yields_empty() {
        let body = json!({"a": 1});
        assert!(query(&body, "$.b.c").is_empty());
    }
}
