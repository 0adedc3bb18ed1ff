//! Structured-table schema declarations.
//!
//! # Responsibility
//! - Enumerate tables and typed columns that may produce change records.
//! - Decide which tables take part in column merging.
//!
//! # Invariants
//! - Table names are unique within a registry.
//! - Column names are unique per table and never equal the row sentinel.
//! - `local_only` tables never emit or accept change records.

use crate::config::SyncRules;
use crate::model::change_record::{ColumnValue, ROW_SENTINEL_COLUMN};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Declared column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
}

impl ColumnType {
    /// Whether `value` fits this column. `Null` fits every column.
    pub fn accepts(self, value: &ColumnValue) -> bool {
        matches!(
            (self, value),
            (_, ColumnValue::Null)
                | (Self::Integer, ColumnValue::Integer(_))
                | (Self::Real, ColumnValue::Real(_))
                | (Self::Text, ColumnValue::Text(_))
                | (Self::Blob, ColumnValue::Blob(_))
                | (Self::Boolean, ColumnValue::Boolean(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnType,
}

/// One structured table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Excluded from column merging entirely.
    pub local_only: bool,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            local_only: false,
        }
    }

    pub fn column(mut self, name: impl Into<String>, kind: ColumnType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|column| column.name == name)
            .map(|column| column.kind)
    }
}

/// Schema registration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    EmptyName,
    DuplicateTable(String),
    DuplicateColumn { table: String, column: String },
    ReservedColumn { table: String },
}

impl Display for SchemaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyName => write!(f, "table and column names cannot be empty"),
            Self::DuplicateTable(table) => write!(f, "table already registered: {table}"),
            Self::DuplicateColumn { table, column } => {
                write!(f, "column `{column}` declared twice in table `{table}`")
            }
            Self::ReservedColumn { table } => write!(
                f,
                "table `{table}` declares reserved column name `{ROW_SENTINEL_COLUMN}`"
            ),
        }
    }
}

impl Error for SchemaError {}

/// Set of known structured tables plus the sync inclusion policy.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, TableSchema>,
    rules: SyncRules,
}

impl SchemaRegistry {
    pub fn new(rules: SyncRules) -> Self {
        Self {
            tables: BTreeMap::new(),
            rules,
        }
    }

    /// Registers one table definition.
    pub fn register(&mut self, table: TableSchema) -> Result<(), SchemaError> {
        if table.name.trim().is_empty() {
            return Err(SchemaError::EmptyName);
        }
        if self.tables.contains_key(&table.name) {
            return Err(SchemaError::DuplicateTable(table.name));
        }
        for (index, column) in table.columns.iter().enumerate() {
            if column.name.trim().is_empty() {
                return Err(SchemaError::EmptyName);
            }
            if column.name == ROW_SENTINEL_COLUMN {
                return Err(SchemaError::ReservedColumn { table: table.name });
            }
            if table.columns[..index]
                .iter()
                .any(|other| other.name == column.name)
            {
                return Err(SchemaError::DuplicateColumn {
                    table: table.name.clone(),
                    column: column.name.clone(),
                });
            }
        }
        self.tables.insert(table.name.clone(), table);
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn rules(&self) -> &SyncRules {
        &self.rules
    }

    /// Whether records for `table` are produced and merged.
    pub fn is_replicated(&self, table: &str) -> bool {
        match self.tables.get(table) {
            Some(schema) => !schema.local_only && self.rules.allows(table),
            None => false,
        }
    }

    /// Replicated table names in sorted order.
    pub fn replicated_tables(&self) -> Vec<&str> {
        self.tables
            .keys()
            .map(String::as_str)
            .filter(|name| self.is_replicated(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnType, SchemaError, SchemaRegistry, TableSchema};
    use crate::config::SyncRules;
    use crate::model::change_record::ColumnValue;

    fn registry(rules: SyncRules) -> SchemaRegistry {
        let mut registry = SchemaRegistry::new(rules);
        registry
            .register(
                TableSchema::new("tasks")
                    .column("title", ColumnType::Text)
                    .column("done", ColumnType::Boolean),
            )
            .expect("tasks should register");
        registry
            .register(TableSchema::new("ui_state").column("scroll", ColumnType::Integer).local_only())
            .expect("ui_state should register");
        registry
            .register(TableSchema::new("tags").column("name", ColumnType::Text))
            .expect("tags should register");
        registry
    }

    #[test]
    fn local_only_and_excluded_tables_are_not_replicated() {
        let registry = registry(SyncRules {
            include_tables: vec![],
            exclude_tables: vec!["tags".to_string()],
        });
        assert_eq!(registry.replicated_tables(), vec!["tasks"]);
        assert!(!registry.is_replicated("ui_state"));
        assert!(!registry.is_replicated("unknown"));
    }

    #[test]
    fn include_list_restricts_replication() {
        let registry = registry(SyncRules {
            include_tables: vec!["tags".to_string(), "ui_state".to_string()],
            exclude_tables: vec![],
        });
        assert_eq!(registry.replicated_tables(), vec!["tags"]);
    }

    #[test]
    fn rejects_duplicate_and_reserved_columns() {
        let mut registry = SchemaRegistry::default();
        let duplicate = registry.register(
            TableSchema::new("t")
                .column("a", ColumnType::Text)
                .column("a", ColumnType::Text),
        );
        assert!(matches!(duplicate, Err(SchemaError::DuplicateColumn { .. })));

        let reserved = registry.register(TableSchema::new("u").column("-1", ColumnType::Integer));
        assert!(matches!(reserved, Err(SchemaError::ReservedColumn { .. })));
    }

    #[test]
    fn column_type_accepts_matching_values_and_null() {
        assert!(ColumnType::Text.accepts(&ColumnValue::Text("x".to_string())));
        assert!(ColumnType::Text.accepts(&ColumnValue::Null));
        assert!(!ColumnType::Text.accepts(&ColumnValue::Integer(1)));
    }
}
