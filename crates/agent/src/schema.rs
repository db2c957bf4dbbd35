//! Schema reference metadata used to ground queries.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use stepwise_core::domain::tool::{ToolArgs, ToolResult, ToolSpec};

use crate::tools::Tool;

pub trait SchemaCatalog: Send + Sync {
    /// Exact column name for an informal one, when a single match exists.
    fn resolve_field(&self, informal: &str) -> Option<String>;

    /// Tables and their columns, for grounding prompts and the schema tool.
    fn describe(&self) -> Value;
}

#[derive(Clone, Debug, Default)]
pub struct StaticSchemaCatalog {
    tables: BTreeMap<String, Vec<String>>,
    aliases: BTreeMap<String, String>,
}

impl StaticSchemaCatalog {
    pub fn with_table<I, S>(mut self, table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables.insert(table.into(), columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_alias(mut self, informal: impl Into<String>, column: impl Into<String>) -> Self {
        self.aliases.insert(normalize(&informal.into()), column.into());
        self
    }

    fn columns(&self) -> impl Iterator<Item = &String> {
        self.tables.values().flatten()
    }
}

impl SchemaCatalog for StaticSchemaCatalog {
    fn resolve_field(&self, informal: &str) -> Option<String> {
        let wanted = normalize(informal.rsplit('.').next().unwrap_or(informal));
        if wanted.is_empty() {
            return None;
        }
        if let Some(column) = self.aliases.get(&wanted) {
            return Some(column.clone());
        }

        let mut exact = self.columns().filter(|column| normalize(column) == wanted);
        if let Some(column) = exact.next() {
            return Some(column.clone());
        }

        let squashed = wanted.replace('_', "");
        let mut loose = self
            .columns()
            .filter(|column| normalize(column).replace('_', "") == squashed)
            .collect::<Vec<_>>();
        loose.dedup();
        match loose.as_slice() {
            [column] => Some((*column).clone()),
            _ => None,
        }
    }

    fn describe(&self) -> Value {
        let tables = self
            .tables
            .iter()
            .map(|(table, columns)| json!({"table": table, "columns": columns}))
            .collect::<Vec<_>>();
        json!({"tables": tables})
    }
}

fn normalize(name: &str) -> String {
    name.trim()
        .trim_matches(|ch| ch == '"' || ch == '`' || ch == '\'' || ch == '[' || ch == ']')
        .chars()
        .map(|ch| if ch == ' ' || ch == '-' { '_' } else { ch.to_ascii_lowercase() })
        .collect()
}

/// Exposes a [`SchemaCatalog`] as a tool so plans can ground themselves in
/// exact table and column names.
pub struct SchemaReferenceTool {
    name: String,
    catalog: Arc<dyn SchemaCatalog>,
}

impl SchemaReferenceTool {
    pub fn new(name: impl Into<String>, catalog: Arc<dyn SchemaCatalog>) -> Self {
        Self { name: name.into(), catalog }
    }
}

#[async_trait]
impl Tool for SchemaReferenceTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: "List the queryable tables and their exact column names.".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    async fn invoke(&self, _args: ToolArgs) -> Result<ToolResult> {
        Ok(ToolResult::success(self.catalog.describe()).with_meta("source", "schema_catalog"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use stepwise_core::domain::tool::ToolResult;

    use super::{SchemaCatalog, SchemaReferenceTool, StaticSchemaCatalog};
    use crate::test_support::args;
    use crate::tools::Tool;

    fn catalog() -> StaticSchemaCatalog {
        StaticSchemaCatalog::default()
            .with_table("daily_prices", ["ticker", "trade_date", "close_price", "volume"])
            .with_alias("close", "close_price")
    }

    #[test]
    fn resolves_aliases_and_spacing_variants() {
        let catalog = catalog();
        assert_eq!(catalog.resolve_field("close").as_deref(), Some("close_price"));
        assert_eq!(catalog.resolve_field("Trade Date").as_deref(), Some("trade_date"));
        assert_eq!(catalog.resolve_field("p.closeprice").as_deref(), Some("close_price"));
        assert_eq!(catalog.resolve_field("dividend"), None);
    }

    #[tokio::test]
    async fn schema_tool_returns_catalog_description() {
        let tool = SchemaReferenceTool::new("schema_reference", Arc::new(catalog()));
        let result = tool.invoke(args(json!({}))).await.expect("schema tool never fails");

        match result {
            ToolResult::Success { data, .. } => {
                assert_eq!(data["tables"][0]["table"], json!("daily_prices"));
            }
            ToolResult::Failure { .. } => panic!("schema tool should succeed"),
        }
    }
}
