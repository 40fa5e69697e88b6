//! Tool access policy: which tool names a variant may request from its server.
//!
//! The resolved set is computed locally so callers can reason about exactly
//! which tools an agent exposes without inspecting the server's full catalog.

/// Merge base and variant-specific tool names into one ordered set.
///
/// Base names come first in their given order; extra names follow in their
/// given order, skipping any already present. Pure and total: identical
/// inputs always produce identical output.
pub fn resolve_tool_set(base: &[String], extra: &[String]) -> Vec<String> {
    let mut resolved: Vec<String> = Vec::with_capacity(base.len() + extra.len());
    for name in base.iter().chain(extra.iter()) {
        if !resolved.iter().any(|seen| seen == name) {
            resolved.push(name.clone());
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn base_names_come_first_and_duplicates_collapse() {
        let resolved = resolve_tool_set(&names(&["a", "b"]), &names(&["b", "c"]));
        assert_eq!(resolved, names(&["a", "b", "c"]));
    }

    #[test]
    fn resolution_is_idempotent() {
        let base = names(&["get_table_schema", "query_table"]);
        let extra = names(&["query_anomalies", "query_table"]);
        let first = resolve_tool_set(&base, &extra);
        let second = resolve_tool_set(&base, &extra);
        assert_eq!(first, second);
    }

    #[test]
    fn empty_inputs_are_fine() {
        assert!(resolve_tool_set(&[], &[]).is_empty());
        assert_eq!(
            resolve_tool_set(&[], &names(&["query_audit"])),
            names(&["query_audit"])
        );
    }

    #[test]
    fn duplicate_base_entries_keep_first_occurrence() {
        let resolved = resolve_tool_set(&names(&["a", "a", "b"]), &names(&["a"]));
        assert_eq!(resolved, names(&["a", "b"]));
    }
}
