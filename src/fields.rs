//! Static multi-value policy for bibliographic fields.
//!
//! Identifier fields pack several ids separated by a space, agent fields pack
//! several people/organisations separated by `"; "`. Every other field holds
//! exactly one value.

use lazy_static::lazy_static;
use std::collections::HashMap;

lazy_static! {
    static ref ITEM_SEPARATORS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("citing_id", " ");
        m.insert("cited_id", " ");
        m.insert("id", " ");
        m.insert("author", "; ");
        m.insert("publisher", "; ");
        m.insert("editor", "; ");
        m
    };
}

/// Join separator for a multi-value field, `None` for single-value fields.
pub fn separator(field: &str) -> Option<&'static str> {
    ITEM_SEPARATORS.get(field).copied()
}

pub fn is_multi_value(field: &str) -> bool {
    ITEM_SEPARATORS.contains_key(field)
}

/// Join a cell's items the way the field is written in CSV.
pub fn join_items(field: &str, items: &[String]) -> String {
    match separator(field) {
        Some(sep) => items.join(sep),
        None => items.first().cloned().unwrap_or_default(),
    }
}

/// Split a raw CSV value into items.
///
/// Space separated fields split on any whitespace run; `"; "` fields split on
/// `;` and trim each part, so `Smith;Jones` and `Smith; Jones` agree. Blank
/// parts are dropped; a blank value yields a single empty item.
pub fn split_value(field: &str, value: &str) -> Vec<String> {
    let items: Vec<String> = match separator(field) {
        Some(sep) if sep.trim().is_empty() => value.split_whitespace().map(str::to_string).collect(),
        Some(sep) => value
            .split(sep.trim())
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        None => vec![value.to_string()],
    };
    if items.is_empty() {
        vec![String::new()]
    } else {
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_static() {
        assert_eq!(separator("author"), Some("; "));
        assert_eq!(separator("id"), Some(" "));
        assert!(is_multi_value("cited_id"));
        assert!(!is_multi_value("title"));
        assert!(!is_multi_value("pub_date"));
    }

    #[test]
    fn join_follows_field_policy() {
        let items = vec!["Smith".to_string(), "Jones".to_string()];
        assert_eq!(join_items("author", &items), "Smith; Jones");
        assert_eq!(join_items("id", &items), "Smith Jones");
        assert_eq!(join_items("title", &items), "Smith");
        assert_eq!(join_items("title", &[]), "");
    }

    #[test]
    fn split_handles_loose_spacing() {
        assert_eq!(split_value("author", "Smith;Jones ;  Lee"), vec!["Smith", "Jones", "Lee"]);
        assert_eq!(split_value("id", "doi:1  pmid:2"), vec!["doi:1", "pmid:2"]);
        assert_eq!(split_value("title", "A; B"), vec!["A; B"]);
        assert_eq!(split_value("author", "  "), vec![""]);
    }
}
