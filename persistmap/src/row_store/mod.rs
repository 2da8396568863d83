use crate::error::{BindingError, Result};
use crate::schema::{self, quote_ident, sql_to_json, sql_to_key, TableSchema};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;

/// Table created when the database has nothing usable yet.
pub const DEFAULT_DDL: &str =
    "CREATE TABLE IF NOT EXISTS urls (id TEXT PRIMARY KEY, fulllink TEXT, expiry TEXT)";

#[derive(Debug, Clone)]
pub struct RowStoreOptions {
    /// Table to bind to. `None` picks the first table with a primary key.
    pub table: Option<String>,
    /// Run when the table is missing (or, without a table name, when no table
    /// qualifies). `None` makes a missing table an error.
    pub bootstrap_ddl: Option<String>,
}

impl Default for RowStoreOptions {
    fn default() -> Self {
        RowStoreOptions {
            table: None,
            bootstrap_ddl: Some(DEFAULT_DDL.to_string()),
        }
    }
}

/// SQL text for each operation, built once from the discovered schema.
struct Statements {
    select: String,
    exists: String,
    upsert: String,
    delete: String,
    keys: String,
}

impl Statements {
    fn for_schema(schema: &TableSchema) -> Self {
        let table = quote_ident(&schema.table);
        let pk = quote_ident(&schema.primary_key.name);

        let mut columns = vec![pk.clone()];
        columns.extend(schema.value_columns.iter().map(|c| quote_ident(&c.name)));
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();

        Statements {
            select: format!("SELECT * FROM {table} WHERE {pk} = ?1"),
            exists: format!("SELECT 1 FROM {table} WHERE {pk} = ?1 LIMIT 1"),
            upsert: format!(
                "INSERT OR REPLACE INTO {table} ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            ),
            delete: format!("DELETE FROM {table} WHERE {pk} = ?1"),
            keys: format!("SELECT {pk} FROM {table}"),
        }
    }
}

/// A key-value binding over one SQLite table. Holds no cache: every call is a
/// round-trip to the database.
pub struct RowStore {
    conn: Connection,
    schema: TableSchema,
    sql: Statements,
}

impl RowStore {
    /// Open or create the database at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, RowStoreOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: RowStoreOptions) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn, options)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory(options: RowStoreOptions) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, options)
    }

    /// Bind to an already open connection. The store takes ownership of it.
    pub fn from_connection(conn: Connection, options: RowStoreOptions) -> Result<Self> {
        let table = options.table.as_deref();

        let needs_bootstrap = match table {
            Some(name) => !schema::table_exists(&conn, name)?,
            None => schema::inspect(&conn, None).is_err(),
        };
        if needs_bootstrap {
            if let Some(ddl) = &options.bootstrap_ddl {
                log::info!("No usable table found, running bootstrap DDL");
                conn.execute_batch(ddl)?;
            }
        }

        let schema = schema::inspect(&conn, table)?;
        log::info!(
            "Bound to table {} (primary key {} {}, {} value columns)",
            schema.table,
            schema.primary_key.name,
            schema.primary_key.declared_type,
            schema.value_columns.len()
        );

        let sql = Statements::for_schema(&schema);
        Ok(RowStore { conn, schema, sql })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Fetch the row for `key` as a field map, primary key included.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let pk = self.schema.primary_key.coerce_str(key)?;
        let mut stmt = self.conn.prepare_cached(&self.sql.select)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let row = stmt
            .query_row(params![pk], |row| {
                let mut fields = Map::new();
                for (i, name) in names.iter().enumerate() {
                    let value: SqlValue = row.get(i)?;
                    fields.insert(name.clone(), sql_to_json(value));
                }
                Ok(Value::Object(fields))
            })
            .optional()?;
        Ok(row)
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        let pk = self.schema.primary_key.coerce_str(key)?;
        let mut stmt = self.conn.prepare_cached(&self.sql.exists)?;
        let found = stmt
            .query_row(params![pk], |row| row.get::<_, i64>(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert or replace the row for `key`. Value columns missing from
    /// `value` are stored as NULL; fields that are not columns are ignored.
    pub fn set(&self, key: &str, value: &Value) -> Result<()> {
        let fields = value.as_object().ok_or_else(|| {
            BindingError::Type(format!("value for key {key:?} must be a JSON object"))
        })?;

        let mut row = Vec::with_capacity(self.schema.value_columns.len() + 1);
        row.push(self.schema.primary_key.coerce_str(key)?);
        for column in &self.schema.value_columns {
            row.push(match fields.get(&column.name) {
                Some(v) => column.coerce_json(v)?,
                None => SqlValue::Null,
            });
        }

        let mut stmt = self.conn.prepare_cached(&self.sql.upsert)?;
        stmt.execute(params_from_iter(row.iter()))?;
        Ok(())
    }

    /// Delete the row for `key`. Deleting a missing key is not an error.
    pub fn delete(&self, key: &str) -> Result<()> {
        let pk = self.schema.primary_key.coerce_str(key)?;
        let mut stmt = self.conn.prepare_cached(&self.sql.delete)?;
        let removed = stmt.execute(params![pk])?;
        log::debug!("Deleted {removed} row(s) for key {key:?}");
        Ok(())
    }

    /// Every primary-key value as a string, in the table's scan order.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(&self.sql.keys)?;
        let rows = stmt.query_map([], |row| row.get::<_, SqlValue>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(sql_to_key(row?));
        }
        Ok(keys)
    }
}
