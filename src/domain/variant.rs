//! Agent variant descriptors.
//!
//! A variant is pure data: identity, system prompt, tool-name lists, and the
//! dataset key handed to the shared server launcher. Adding a new domain is a
//! data addition here or in the config file, not a new type.

use super::policy::resolve_tool_set;

/// Tool names shared by every variant: schema introspection, preview, and
/// the generic query entry point.
pub const BASE_TOOLS: [&str; 4] = [
    "describe_table",
    "get_table_schema",
    "read_table_head",
    "query_table",
];

/// Static description of one domain agent.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantDescriptor {
    /// Display name, unique within the running process.
    pub name: String,
    /// System prompt handed to the model engine verbatim.
    pub instructions: String,
    /// Tool names common to all variants, in exposure order.
    pub base_tools: Vec<String>,
    /// Variant-specific tool names (domain helpers, macro-query entry point).
    pub extra_tools: Vec<String>,
    /// Dataset key passed to the shared launcher script; a variant served by
    /// a dedicated launcher may omit it.
    pub launch_key: Option<String>,
}

impl VariantDescriptor {
    /// The ordered, de-duplicated tool set this variant may invoke.
    pub fn resolved_tools(&self) -> Vec<String> {
        resolve_tool_set(&self.base_tools, &self.extra_tools)
    }
}

fn base_tools() -> Vec<String> {
    BASE_TOOLS.iter().map(|t| t.to_string()).collect()
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn provider_variant() -> VariantDescriptor {
    let instructions = "\
You are the Provider Combined Audit agent.
Workflow:
1. Parse each request for provider, site, lookback window, and requested dimensions. Normalise provider/site codes to uppercase strings.
2. Prefer the built-in tools (issue_scope*, top_site_issues*) before writing SQL with query_table().
3. When you must write SQL, rely on macros ({{PCA}}, {{ISSUE_TYPE}}, {{EVENT_TS:alias}}) and always filter on sales_date with a LIMIT clause.
4. Parse JSON tool responses, cite the tool name, and keep answers concise.";
    VariantDescriptor {
        name: "Provider Combined Audit (stdio)".to_string(),
        instructions: instructions.to_string(),
        base_tools: base_tools(),
        extra_tools: strings(&[
            "query_audit",
            "top_site_issues",
            "top_site_issues_flex",
            "issue_scope_combined",
            "issue_scope_combined_all",
            "issue_scope_combined_flex",
        ]),
        launch_key: Some("provider".to_string()),
    }
}

fn anomalies_variant() -> VariantDescriptor {
    let instructions = "\
You are the Market Anomalies agent.
Workflow:
1. Start with describe_table()/get_table_schema() to refresh column context.
2. Prefer built-in tools (get_available_customers, overview_anomalies_today) before issuing custom SQL via query_table().
3. When writing SQL, use provided macros ({{MLA}}) and include sales_date filters with LIMITs.
4. Report insights as concise bullets referencing the tool used.";
    VariantDescriptor {
        name: "Market Anomalies (stdio)".to_string(),
        instructions: instructions.to_string(),
        base_tools: base_tools(),
        extra_tools: strings(&[
            "query_anomalies",
            "get_available_customers",
            "overview_anomalies_today",
        ]),
        launch_key: Some("anomalies".to_string()),
    }
}

fn explorer_variant() -> VariantDescriptor {
    let instructions = "\
You are a database exploration agent.
1. Start with describe_table() and get_table_partitions() to understand key columns and partition metadata.
2. Use get_table_schema() before referencing new columns.
3. Use read_table_head(limit=...) for quick previews.
4. When invoking query_table(), write SELECT/WITH statements only, keep LIMIT clauses, and include partition filters.
Never modify data and cite which tool produced each insight.";
    VariantDescriptor {
        name: "Database Explorer (stdio)".to_string(),
        instructions: instructions.to_string(),
        base_tools: base_tools(),
        extra_tools: Vec::new(),
        launch_key: None,
    }
}

/// The variants compiled into the binary, keyed by their CLI alias.
pub fn builtin_variants() -> Vec<(&'static str, VariantDescriptor)> {
    vec![
        ("provider", provider_variant()),
        ("anomalies", anomalies_variant()),
        ("explorer", explorer_variant()),
    ]
}

/// Look up a built-in variant by CLI alias.
pub fn builtin(alias: &str) -> Option<VariantDescriptor> {
    builtin_variants()
        .into_iter()
        .find(|(key, _)| *key == alias)
        .map(|(_, variant)| variant)
}
