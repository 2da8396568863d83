//! Discovers the table a relational binding works against: its primary key
//! and value columns, with the declared types that drive coercion.

mod types;

pub use types::*;

use crate::error::{BindingError, Result};
use rusqlite::{params, Connection};

/// One row of `pragma_table_info`.
struct ColumnInfo {
    name: String,
    declared_type: String,
    /// 1-based position within the primary key, 0 for non-key columns.
    pk: i64,
}

/// Inspect `table`, or when `None`, the first user table in catalog order
/// that has exactly one primary-key column.
pub fn inspect(conn: &Connection, table: Option<&str>) -> Result<TableSchema> {
    match table {
        Some(name) => {
            let columns = table_columns(conn, name)?;
            build_schema(name, columns).map_err(BindingError::Schema)
        }
        None => {
            for name in user_tables(conn)? {
                let columns = table_columns(conn, &name)?;
                match build_schema(&name, columns) {
                    Ok(schema) => return Ok(schema),
                    Err(reason) => log::debug!("Skipping table {name}: {reason}"),
                }
            }
            Err(BindingError::Schema(
                "No user-defined table with a primary key found".into(),
            ))
        }
    }
}

/// Whether a table called `name` exists.
pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Quote an identifier for interpolation into SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn user_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY rowid",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut names = Vec::new();
    for row in rows {
        names.push(row?);
    }
    Ok(names)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt =
        conn.prepare("SELECT name, type, pk FROM pragma_table_info(?1) ORDER BY cid")?;
    let rows = stmt.query_map(params![table], |row| {
        Ok(ColumnInfo {
            name: row.get(0)?,
            declared_type: row.get(1)?,
            pk: row.get(2)?,
        })
    })?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }
    Ok(columns)
}

fn build_schema(table: &str, columns: Vec<ColumnInfo>) -> std::result::Result<TableSchema, String> {
    if columns.is_empty() {
        return Err(format!("Table {table} has no columns (or does not exist)"));
    }

    let key_count = columns.iter().filter(|c| c.pk > 0).count();
    match key_count {
        0 => return Err(format!("Table {table} must have a primary key")),
        1 => {}
        n => {
            return Err(format!(
                "Table {table} has a {n}-column primary key; exactly one is required"
            ))
        }
    }

    let mut primary_key = None;
    let mut value_columns = Vec::new();
    for info in columns {
        let column = Column::new(info.name, info.declared_type);
        if info.pk > 0 {
            primary_key = Some(column);
        } else {
            value_columns.push(column);
        }
    }

    let primary_key = primary_key.ok_or_else(|| format!("Table {table} must have a primary key"))?;
    Ok(TableSchema {
        table: table.to_string(),
        primary_key,
        value_columns,
    })
}
