//! Configuration type definitions for servers and document mappings.
//!
//! Mapping configurations are externally authored (admin UI) and persisted
//! in a document store; the core only ever mutates the consecutive
//! last-value field, through the generator's guarded update.

use serde::{Deserialize, Serialize};

/// Connection settings for one remote SQL Server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Named instance, if any.
    #[serde(default)]
    pub instance: Option<String>,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(skip_serializing)]
    pub password: String,

    /// Database name.
    pub database: String,

    /// Encrypt the connection (default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Trust the server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,
}

/// Declarative source→target transfer definition for one document family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Unique mapping identifier.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Server key for the source database.
    pub source_server: String,

    /// Server key for the target database.
    pub target_server: String,

    /// Ordered table configurations: one header, zero or more details.
    pub tables: Vec<TableConfig>,

    /// Consecutive (sequence) configuration, if the mapping allocates one.
    #[serde(default)]
    pub consecutive: Option<ConsecutiveConfig>,

    /// Ordered document-type classification rules; first match wins.
    #[serde(default)]
    pub document_type_rules: Vec<DocumentTypeRule>,

    /// Optional marker written back to the source header row on success.
    #[serde(default)]
    pub processed_marker: Option<ProcessedMarker>,
}

impl MappingConfig {
    /// Header table configurations, in declared order.
    pub fn header_tables(&self) -> impl Iterator<Item = &TableConfig> {
        self.tables.iter().filter(|t| !t.is_detail)
    }

    /// Detail tables belonging to the given header table.
    pub fn detail_tables_of<'a>(&'a self, parent: &'a str) -> impl Iterator<Item = &'a TableConfig> {
        self.tables
            .iter()
            .filter(move |t| t.is_detail && t.parent_ref.as_deref() == Some(parent))
    }
}

/// One source→target table pair within a mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Source table name (optionally schema-qualified).
    pub source_table: String,

    /// Target table name (optionally schema-qualified).
    pub target_table: String,

    /// Primary key column on the source table.
    pub primary_key: String,

    /// Primary key column on the target table (defaults to `primary_key`).
    #[serde(default)]
    pub target_primary_key: Option<String>,

    /// Custom read query overriding the generated SELECT. `@{id}` expands
    /// to the document id parameter.
    #[serde(default)]
    pub custom_query: Option<String>,

    /// Whether this is a detail (line-item) table.
    #[serde(default)]
    pub is_detail: bool,

    /// Source table of the parent header this detail belongs to.
    #[serde(default)]
    pub parent_ref: Option<String>,

    /// Extra filter appended to generated reads (dropped if it references a
    /// missing column).
    #[serde(default)]
    pub filter_condition: Option<String>,

    /// ORDER BY clause for detail reads (dropped if it references a missing
    /// column).
    #[serde(default)]
    pub order_by: Option<String>,

    /// Detail-level dedup column: before inserting a detail row, probe the
    /// target for (parent key, this column) and skip rows already present.
    /// This is the repair hook for partially inserted details on re-run.
    #[serde(default)]
    pub detail_dedup_field: Option<String>,

    /// Ordered field mappings applied to every row of this table.
    pub field_mappings: Vec<FieldMapping>,
}

impl TableConfig {
    /// Effective primary key on the target side.
    pub fn target_pk(&self) -> &str {
        self.target_primary_key
            .as_deref()
            .unwrap_or(&self.primary_key)
    }
}

/// A single target-field rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Column written on the target table.
    pub target_field: String,

    /// Column read from the source row.
    #[serde(default)]
    pub source_field: Option<String>,

    /// Fallback when the source value is absent; the literal string "NULL"
    /// produces a real SQL NULL.
    #[serde(default)]
    pub default_value: Option<String>,

    /// SQL expression template with `@{field}` placeholders.
    #[serde(default)]
    pub sql_function: Option<String>,

    /// Evaluate the template as a scalar query before the insert instead of
    /// embedding the expression text inline.
    #[serde(default)]
    pub pre_execute: bool,

    /// Which server evaluates a pre-executed function (default: source).
    #[serde(default)]
    pub function_server: FunctionServer,

    /// Exact-match value translation applied after the value is resolved.
    #[serde(default)]
    pub value_mappings: Vec<ValueMapping>,

    /// Prefix stripped from the source value before anything else.
    #[serde(default)]
    pub strip_prefix: Option<String>,

    /// Fail the document if no value could be produced.
    #[serde(default)]
    pub required: bool,
}

/// Which connection evaluates a pre-executed SQL function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionServer {
    #[default]
    Source,
    Target,
}

/// One exact-match value translation entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueMapping {
    /// Value as read from the source.
    pub from: String,

    /// Value written to the target.
    pub to: String,
}

/// Ordered document-type classification rule; first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentTypeRule {
    /// Header field inspected.
    pub source_field: String,

    /// Values that select this rule.
    pub source_values: Vec<String>,

    /// Resolved type name.
    pub name: String,
}

/// Marker written back to the source header row after a successful transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedMarker {
    /// Column updated on the source header table.
    pub field: String,

    /// Value written.
    pub value: String,
}

/// Consecutive (formatted sequence) configuration for a mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsecutiveConfig {
    /// Last allocated numeric value (local strategy only; mutated through
    /// the generator's guarded update).
    #[serde(default)]
    pub last_value: i64,

    /// Prefix substituted for `{PREFIX}`.
    #[serde(default)]
    pub prefix: String,

    /// Format pattern; empty means prefix + value.
    #[serde(default)]
    pub pattern: String,

    /// Whether this mapping allocates consecutives at all.
    #[serde(default)]
    pub enabled: bool,

    /// Draw values from the centralized allocator instead of the local
    /// counter.
    #[serde(default)]
    pub centralized: bool,

    /// Allocator sequence id for the centralized strategy.
    #[serde(default)]
    pub allocator_id: Option<String>,

    /// Target table receiving the formatted value.
    pub target_table: String,

    /// Target field receiving the formatted value.
    pub target_field: String,
}

fn default_port() -> u16 {
    1433
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_password_not_serialized() {
        let config = ServerConfig {
            host: "localhost".into(),
            port: 1433,
            instance: None,
            user: "sa".into(),
            password: "secret_password".into(),
            database: "docs".into(),
            encrypt: true,
            trust_server_cert: false,
        };

        let json = serde_json::to_string(&config).unwrap();
        assert!(
            !json.contains("secret_password"),
            "Password was serialized: {json}"
        );
    }

    #[test]
    fn test_server_config_defaults() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"host":"db1","user":"sa","password":"x","database":"docs"}"#,
        )
        .unwrap();
        assert_eq!(config.port, 1433);
        assert!(config.encrypt);
        assert!(!config.trust_server_cert);
    }

    #[test]
    fn test_target_pk_defaults_to_primary_key() {
        let table = TableConfig {
            source_table: "Orders".into(),
            target_table: "PED".into(),
            primary_key: "OrderId".into(),
            target_primary_key: None,
            custom_query: None,
            is_detail: false,
            parent_ref: None,
            filter_condition: None,
            order_by: None,
            detail_dedup_field: None,
            field_mappings: vec![],
        };
        assert_eq!(table.target_pk(), "OrderId");
    }
}
