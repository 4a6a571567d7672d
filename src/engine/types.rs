//! Universal data types for the gateway engine layer
//!
//! These types provide a normalized representation of connections, query
//! results and schemas across the document, relational and embedded engines.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::error::{EngineError, EngineResult};

/// Unique identifier for a running query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The four engine families the gateway speaks to.
///
/// The set is closed: adding an engine means adding a variant here, and the
/// compiler then points at every `match` that needs a new arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EngineKind {
    /// MongoDB
    #[serde(rename = "mongodb")]
    Document,
    /// PostgreSQL
    #[serde(rename = "postgres")]
    RelationalA,
    /// MySQL / MariaDB
    #[serde(rename = "mysql")]
    RelationalB,
    /// SQLite
    #[serde(rename = "sqlite")]
    Embedded,
}

impl EngineKind {
    pub const ALL: [EngineKind; 4] = [
        EngineKind::Document,
        EngineKind::RelationalA,
        EngineKind::RelationalB,
        EngineKind::Embedded,
    ];

    /// Short identifier, also used to pick a SQL dialect
    pub fn id(&self) -> &'static str {
        match self {
            EngineKind::Document => "mongodb",
            EngineKind::RelationalA => "postgres",
            EngineKind::RelationalB => "mysql",
            EngineKind::Embedded => "sqlite",
        }
    }

    /// Human-readable engine name, used as the prefix of native errors
    pub fn display_name(&self) -> &'static str {
        match self {
            EngineKind::Document => "MongoDB",
            EngineKind::RelationalA => "PostgreSQL",
            EngineKind::RelationalB => "MySQL",
            EngineKind::Embedded => "SQLite",
        }
    }

    pub fn is_sql(&self) -> bool {
        !matches!(self, EngineKind::Document)
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            EngineKind::Document => Some(27017),
            EngineKind::RelationalA => Some(5432),
            EngineKind::RelationalB => Some(3306),
            EngineKind::Embedded => None,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

/// Configuration for engines reached over the network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub read_only: bool,
    /// MongoDB only: database holding the user's credentials
    #[serde(default)]
    pub auth_source: Option<String>,
}

impl NetworkConfig {
    pub fn new(host: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            username: None,
            password: None,
            database: database.into(),
            ssl: false,
            read_only: false,
            auth_source: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.database.trim().is_empty() {
            return Err(EngineError::missing_field("database"));
        }
        Ok(())
    }
}

/// Configuration for the file-backed engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedConfig {
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub read_only: bool,
}

impl EmbeddedConfig {
    pub fn new(database: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            file_path: file_path.into(),
            read_only: false,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.database.trim().is_empty() {
            return Err(EngineError::missing_field("database"));
        }
        if self.file_path.trim().is_empty() {
            return Err(EngineError::missing_field("file_path"));
        }
        Ok(())
    }
}

/// Engine-specific connection configuration, tagged by engine kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "engine")]
pub enum EngineConfig {
    #[serde(rename = "mongodb")]
    Document(NetworkConfig),
    #[serde(rename = "postgres")]
    RelationalA(NetworkConfig),
    #[serde(rename = "mysql")]
    RelationalB(NetworkConfig),
    #[serde(rename = "sqlite")]
    Embedded(EmbeddedConfig),
}

impl EngineConfig {
    pub fn kind(&self) -> EngineKind {
        match self {
            EngineConfig::Document(_) => EngineKind::Document,
            EngineConfig::RelationalA(_) => EngineKind::RelationalA,
            EngineConfig::RelationalB(_) => EngineKind::RelationalB,
            EngineConfig::Embedded(_) => EngineKind::Embedded,
        }
    }

    pub fn database(&self) -> &str {
        match self {
            EngineConfig::Document(c) | EngineConfig::RelationalA(c) | EngineConfig::RelationalB(c) => {
                &c.database
            }
            EngineConfig::Embedded(c) => &c.database,
        }
    }

    pub fn read_only(&self) -> bool {
        match self {
            EngineConfig::Document(c) | EngineConfig::RelationalA(c) | EngineConfig::RelationalB(c) => {
                c.read_only
            }
            EngineConfig::Embedded(c) => c.read_only,
        }
    }

    /// Checks the required fields. Runs before any native I/O.
    pub fn validate(&self) -> EngineResult<()> {
        match self {
            EngineConfig::Document(c) | EngineConfig::RelationalA(c) | EngineConfig::RelationalB(c) => {
                c.validate()
            }
            EngineConfig::Embedded(c) => c.validate(),
        }
    }

    /// `user@host:port/database`, or `sqlite:<path>` for the embedded engine
    pub fn display_name(&self) -> String {
        match self {
            EngineConfig::Document(c) | EngineConfig::RelationalA(c) | EngineConfig::RelationalB(c) => {
                let port = c.port.or_else(|| self.kind().default_port()).unwrap_or_default();
                match c.username.as_deref() {
                    Some(user) if !user.is_empty() => {
                        format!("{}@{}:{}/{}", user, c.host, port, c.database)
                    }
                    _ => format!("{}:{}/{}", c.host, port, c.database),
                }
            }
            EngineConfig::Embedded(c) => format!("sqlite:{}", c.file_path),
        }
    }
}

/// Lifecycle state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Query cancellation support level for a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelSupport {
    None,
    BestEffort,
    Driver,
}

/// Universal value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
    Array(Vec<Value>),
}

impl Value {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(_) => serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
            Value::Json(j) => j.clone(),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};
    use base64::{Engine, engine::general_purpose::STANDARD};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Column flag bitmask, using the MySQL client/server protocol bit values.
///
/// Relational drivers fold catalog facts into this mask and the column
/// metadata is derived from bit tests only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnFlags(pub u32);

impl ColumnFlags {
    pub const NOT_NULL: u32 = 1;
    pub const PRI_KEY: u32 = 2;
    pub const UNIQUE_KEY: u32 = 4;
    pub const AUTO_INCREMENT: u32 = 512;

    pub fn set(&mut self, bit: u32, on: bool) {
        if on {
            self.0 |= bit;
        }
    }

    pub fn has(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// Column metadata attached to a query result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_increment: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            primary_key: false,
            auto_increment: None,
            length: None,
            charset: None,
        }
    }

    pub fn with_flags(mut self, flags: ColumnFlags) -> Self {
        self.nullable = !flags.has(ColumnFlags::NOT_NULL);
        self.primary_key = flags.has(ColumnFlags::PRI_KEY);
        self.auto_increment = Some(flags.has(ColumnFlags::AUTO_INCREMENT));
        self
    }

    pub fn with_primary_key(mut self, primary_key: bool) -> Self {
        self.primary_key = primary_key;
        if primary_key {
            self.nullable = false;
        }
        self
    }
}

/// A single row of data (indexed by column order)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

/// A query as submitted to a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub connection_id: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Value>,
    /// Structural row limit, honoured by the document store's cursor.
    /// SQL engines receive pagination already rewritten into the text.
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl QueryRequest {
    pub fn new(connection_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            query: query.into(),
            parameters: Vec::new(),
            limit: None,
            offset: None,
            timeout_ms: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Severity of a validation finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub line: usize,
    pub column: usize,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub line: usize,
    pub column: usize,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Outcome of one validation pass. Never stored.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.message.clone()).collect()
    }

    pub fn warning_messages(&self) -> Vec<String> {
        self.warnings.iter().map(|w| w.message.clone()).collect()
    }
}

/// Free-form annotations attached to a result by the query service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    /// The text that was (or would have been) sent to the engine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
}

/// Query execution result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column information
    pub columns: Vec<ColumnInfo>,
    /// Result rows
    pub rows: Vec<Row>,
    /// Number of rows returned
    pub total_rows: u64,
    /// Number of affected rows (for INSERT/UPDATE/DELETE)
    pub affected_rows: Option<u64>,
    /// Execution time in milliseconds
    pub execution_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<QueryMetadata>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            total_rows: 0,
            affected_rows: None,
            execution_time_ms: 0.0,
            error: None,
            warnings: Vec::new(),
            metadata: None,
        }
    }

    pub fn with_rows(columns: Vec<ColumnInfo>, rows: Vec<Row>, time_ms: f64) -> Self {
        Self {
            total_rows: rows.len() as u64,
            columns,
            rows,
            execution_time_ms: time_ms,
            ..Self::empty()
        }
    }

    pub fn with_affected_rows(affected: u64, time_ms: f64) -> Self {
        Self {
            affected_rows: Some(affected),
            execution_time_ms: time_ms,
            ..Self::empty()
        }
    }

    /// A result carrying only an error; rows and columns stay empty.
    pub fn failure(message: impl Into<String>, time_ms: f64) -> Self {
        Self {
            error: Some(message.into()),
            execution_time_ms: time_ms,
            ..Self::empty()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn metadata_mut(&mut self) -> &mut QueryMetadata {
        self.metadata.get_or_insert_with(QueryMetadata::default)
    }
}

/// Kind of relation a table entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Table,
    View,
    Collection,
}

impl TableKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "VIEW" | "SYSTEM VIEW" => TableKind::View,
            "COLLECTION" => TableKind::Collection,
            _ => TableKind::Table,
        }
    }
}

/// Column metadata for table schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    /// Data type (database-specific)
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_increment: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
            primary_key: false,
            auto_increment: None,
            default_value: None,
            length: None,
            precision: None,
            scale: None,
            charset: None,
            collation: None,
            comment: None,
        }
    }

    pub fn with_primary_key(mut self, primary_key: bool) -> Self {
        self.primary_key = primary_key;
        self
    }

    pub fn with_flags(mut self, flags: ColumnFlags) -> Self {
        self.nullable = !flags.has(ColumnFlags::NOT_NULL);
        self.primary_key = flags.has(ColumnFlags::PRI_KEY);
        self.auto_increment = Some(flags.has(ColumnFlags::AUTO_INCREMENT));
        self
    }

    pub fn with_default(mut self, default_value: Option<String>) -> Self {
        self.default_value = default_value;
        self
    }

    pub fn with_comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment.filter(|c| !c.is_empty());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeySchema {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_update: Option<String>,
}

/// Structure of one table, view or collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub kind: TableKind,
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeySchema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, kind: TableKind) -> Self {
        Self {
            name: name.into(),
            kind,
            columns: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            row_count: None,
            comment: None,
        }
    }
}

/// Lightweight table listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSummary {
    pub name: String,
    pub kind: TableKind,
}

/// Full structure of the database a connection points at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub database: String,
    pub engine: EngineKind,
    pub tables: Vec<TableSchema>,
    pub captured_at: DateTime<Utc>,
}

impl DatabaseSchema {
    pub fn new(database: impl Into<String>, engine: EngineKind, tables: Vec<TableSchema>) -> Self {
        Self {
            database: database.into(),
            engine,
            tables,
            captured_at: Utc::now(),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_deserializes_from_tagged_json() {
        let json = r#"{"engine":"sqlite","database":"main","file_path":"/tmp/app.db"}"#;
        let config: EngineConfig = serde_json::from_str(json).expect("should parse");

        assert_eq!(config.kind(), EngineKind::Embedded);
        assert_eq!(config.database(), "main");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_database_fails_validation() {
        let config = EngineConfig::RelationalA(NetworkConfig::new("localhost", "  "));
        let err = config.validate().expect_err("database is required");
        assert!(err.is_configuration());
    }

    #[test]
    fn embedded_requires_file_path() {
        let config = EngineConfig::Embedded(EmbeddedConfig::new("main", ""));
        match config.validate() {
            Err(EngineError::Configuration { field, .. }) => assert_eq!(field, "file_path"),
            other => panic!("unexpected validation outcome: {other:?}"),
        }
    }

    #[test]
    fn password_is_never_serialized() {
        let config = EngineConfig::RelationalB(
            NetworkConfig::new("db.internal", "shop").with_credentials("app", "s3cret"),
        );
        let json = serde_json::to_string(&config).expect("serialize");
        assert!(!json.contains("s3cret"));
        assert!(json.contains("\"engine\":\"mysql\""));
    }

    #[test]
    fn display_name_uses_default_port() {
        let config = EngineConfig::RelationalA(
            NetworkConfig::new("localhost", "app").with_credentials("postgres", "x"),
        );
        assert_eq!(config.display_name(), "postgres@localhost:5432/app");
    }

    #[test]
    fn column_flags_drive_metadata() {
        let mut flags = ColumnFlags::default();
        flags.set(ColumnFlags::NOT_NULL, true);
        flags.set(ColumnFlags::PRI_KEY, true);
        flags.set(ColumnFlags::AUTO_INCREMENT, true);

        let column = ColumnInfo::new("id", "BIGINT").with_flags(flags);
        assert!(!column.nullable);
        assert!(column.primary_key);
        assert_eq!(column.auto_increment, Some(true));

        let plain = ColumnInfo::new("note", "TEXT").with_flags(ColumnFlags::default());
        assert!(plain.nullable);
        assert!(!plain.primary_key);
    }

    #[test]
    fn bytes_round_trip_through_base64() {
        let value = Value::Bytes(vec![0xde, 0xad]);
        let json = serde_json::to_string(&value).expect("serialize");
        assert_eq!(json, "\"3q0=\"");
    }

    #[test]
    fn schema_table_lookup_is_case_insensitive() {
        let schema = DatabaseSchema::new(
            "main",
            EngineKind::Embedded,
            vec![TableSchema::new("Users", TableKind::Table)],
        );
        assert!(schema.has_table("users"));
        assert!(!schema.has_table("orders"));
    }
}
