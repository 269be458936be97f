//! Column listings for the tables a statement mentions, so an agent can fix
//! a misspelled column or table without a separate lookup.

use crate::models::{ColumnHint, TableHint};
use crate::sql::TableRef;
use sqlx::{PgConnection, Row};
use tracing::debug;

// information_schema uses domain types the driver will not decode as text
const COLUMNS_SQL: &str = r#"
SELECT table_schema::text AS table_schema,
       table_name::text AS table_name,
       column_name::text AS column_name,
       data_type::text AS data_type,
       is_nullable::text = 'YES' AS nullable
FROM information_schema.columns
WHERE table_name = ANY($1) AND table_schema = ANY($2)
ORDER BY table_schema, table_name, ordinal_position
"#;

/// Look up the columns of `tables`. Unqualified names (reported as
/// `public`) are also searched for in `current_schema`.
///
/// Lookup failures are logged and yield no hints.
pub async fn fetch_table_hints(
    conn: &mut PgConnection,
    tables: &[TableRef],
    current_schema: &str,
) -> Vec<TableHint> {
    if tables.is_empty() {
        return Vec::new();
    }
    let mut names: Vec<String> = tables.iter().map(|t| t.table.clone()).collect();
    names.sort();
    names.dedup();
    let mut schemas: Vec<String> = tables.iter().map(|t| t.schema.clone()).collect();
    schemas.push(current_schema.to_string());
    schemas.sort();
    schemas.dedup();

    let rows = match sqlx::query(COLUMNS_SQL)
        .bind(&names)
        .bind(&schemas)
        .fetch_all(&mut *conn)
        .await
    {
        Ok(rows) => rows,
        Err(e) => {
            debug!(error = %e, "Schema hint lookup failed");
            return Vec::new();
        }
    };

    let mut hints: Vec<TableHint> = Vec::new();
    for row in rows {
        let (Ok(schema), Ok(table), Ok(name), Ok(data_type), Ok(nullable)) = (
            row.try_get::<String, _>("table_schema"),
            row.try_get::<String, _>("table_name"),
            row.try_get::<String, _>("column_name"),
            row.try_get::<String, _>("data_type"),
            row.try_get::<bool, _>("nullable"),
        ) else {
            continue;
        };
        if !wanted(tables, &schema, &table, current_schema) {
            continue;
        }
        let column = ColumnHint {
            name,
            data_type,
            nullable,
        };
        match hints.last_mut() {
            Some(last) if last.schema == schema && last.table == table => last.columns.push(column),
            _ => hints.push(TableHint {
                schema,
                table,
                columns: vec![column],
            }),
        }
    }
    hints
}

fn wanted(tables: &[TableRef], schema: &str, table: &str, current_schema: &str) -> bool {
    tables.iter().any(|t| {
        t.table == table && (t.schema == schema || (t.schema == "public" && schema == current_schema))
    })
}

/// One-line summary for error suggestions.
pub fn describe_hints(hints: &[TableHint]) -> String {
    hints
        .iter()
        .map(|h| {
            let columns: Vec<String> = h
                .columns
                .iter()
                .map(|c| format!("{} {}", c.name, c.data_type))
                .collect();
            format!("{}.{}({})", h.schema, h.table, columns.join(", "))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wanted_matches_current_schema_for_unqualified() {
        let tables = vec![TableRef::new("public", "users")];
        assert!(wanted(&tables, "public", "users", "app"));
        assert!(wanted(&tables, "app", "users", "app"));
        assert!(!wanted(&tables, "other", "users", "app"));
        assert!(!wanted(&tables, "public", "orders", "app"));
    }

    #[test]
    fn test_describe_hints() {
        let hints = vec![TableHint {
            schema: "public".into(),
            table: "users".into(),
            columns: vec![
                ColumnHint {
                    name: "id".into(),
                    data_type: "integer".into(),
                    nullable: false,
                },
                ColumnHint {
                    name: "email".into(),
                    data_type: "text".into(),
                    nullable: true,
                },
            ],
        }];
        assert_eq!(describe_hints(&hints), "public.users(id integer, email text)");
        assert_eq!(describe_hints(&[]), "");
    }
}
