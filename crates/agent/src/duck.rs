//! Read-only SQL over a vector layer's cached geopackage, executed by an
//! in-memory DuckDB database on a blocking thread.

use std::path::Path;
use std::time::Duration;

use duckdb::types::Value;
use errors::ErrorMetadata;

pub const DUCKDB_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Floor on the row cap; callers asking for fewer rows still get up to 25.
pub const MIN_ROW_CAP: usize = 25;

#[derive(Debug, Clone)]
pub struct DuckQueryResult {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub row_count: usize,
}

fn render_value(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Boolean(v) => v.to_string(),
        Value::TinyInt(v) => v.to_string(),
        Value::SmallInt(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::BigInt(v) => v.to_string(),
        Value::HugeInt(v) => v.to_string(),
        Value::UTinyInt(v) => v.to_string(),
        Value::USmallInt(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::UBigInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Text(v) => v,
        other => format!("{other:?}"),
    }
}

fn run_query(
    gpkg_path: &Path,
    layer_id: &str,
    sql_query: &str,
    row_cap: usize,
) -> anyhow::Result<DuckQueryResult> {
    let conn = duckdb::Connection::open_in_memory()?;
    conn.execute_batch("INSTALL spatial; LOAD spatial;")?;

    // Alias the layer file to a table named by the layer id, which is how
    // the LLM's query refers to it.
    let path = gpkg_path.to_string_lossy().replace('\'', "''");
    conn.execute_batch(&format!(
        "CREATE OR REPLACE TABLE {layer_id} AS SELECT * FROM ST_Read('{path}');"
    ))?;

    let mut stmt = conn.prepare(sql_query)?;
    let mut rows = stmt.query([])?;
    let (headers, column_count) = {
        let stmt_ref = rows.as_ref().expect("statement alive during iteration");
        let headers: Vec<String> = stmt_ref
            .column_names()
            .iter()
            .map(|name| name.to_string())
            .collect();
        let column_count = headers.len();
        (headers, column_count)
    };

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        if out.len() >= row_cap {
            break;
        }
        let mut rendered = Vec::with_capacity(column_count);
        for i in 0..column_count {
            rendered.push(render_value(row.get::<_, Value>(i)?));
        }
        out.push(rendered);
    }

    let row_count = out.len();
    Ok(DuckQueryResult {
        headers,
        rows: out,
        row_count,
    })
}

/// Runs `sql_query` against the layer's cached file with a hard timeout.
/// The blocking thread cannot be preempted; on timeout it finishes in the
/// background while the caller gets an error.
pub async fn execute_duckdb_query(
    gpkg_path: &Path,
    layer_id: &str,
    sql_query: &str,
    head_n_rows: usize,
) -> anyhow::Result<DuckQueryResult> {
    let row_cap = head_n_rows.max(MIN_ROW_CAP);
    let path = gpkg_path.to_path_buf();
    let layer_id = layer_id.to_string();
    let sql = sql_query.to_string();

    let task = tokio::task::spawn_blocking(move || run_query(&path, &layer_id, &sql, row_cap));
    match tokio::time::timeout(DUCKDB_QUERY_TIMEOUT, task).await {
        Ok(joined) => joined?,
        Err(_) => Err(anyhow::anyhow!(ErrorMetadata::request_timeout(
            "DuckDbQueryTimeout",
            format!(
                "DuckDB query timed out after {} seconds",
                DUCKDB_QUERY_TIMEOUT.as_secs()
            ),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_value_basics() {
        assert_eq!(render_value(Value::Null), "");
        assert_eq!(render_value(Value::Boolean(true)), "true");
        assert_eq!(render_value(Value::BigInt(18)), "18");
        assert_eq!(render_value(Value::Double(2.5)), "2.5");
        assert_eq!(render_value(Value::Text("Starbucks".to_string())), "Starbucks");
    }

    #[tokio::test]
    async fn test_query_over_plain_table() {
        // Exercise the engine without the spatial extension: build a table
        // in-process and query it the way a tool call would.
        let result = tokio::task::spawn_blocking(|| {
            let conn = duckdb::Connection::open_in_memory()?;
            conn.execute_batch(
                "CREATE TABLE cafes (id INTEGER, name TEXT);
                 INSERT INTO cafes VALUES (1, 'Starbucks'), (2, 'Blue Bottle'), (3, 'Starbucks');",
            )?;
            let mut stmt =
                conn.prepare("SELECT COUNT(*) AS count FROM cafes WHERE name = 'Starbucks'")?;
            let mut rows = stmt.query([])?;
            let headers: Vec<String> = rows
                .as_ref()
                .unwrap()
                .column_names()
                .iter()
                .map(|name| name.to_string())
                .collect();
            let row = rows.next()?.unwrap();
            let count = render_value(row.get::<_, Value>(0)?);
            anyhow::Ok((headers, count))
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(result.0, vec!["count".to_string()]);
        assert_eq!(result.1, "2");
    }

    #[test]
    fn test_row_cap_floor() {
        assert_eq!(5usize.max(MIN_ROW_CAP), 25);
        assert_eq!(100usize.max(MIN_ROW_CAP), 100);
    }
}
