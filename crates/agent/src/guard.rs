//! Guards over tool-issued SQL: the read-only plan check, the mandatory
//! LIMIT clause, and the serialized result caps.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value as JsonValue;

/// Upper bound on a `LIMIT` value in `query_postgis_database`.
pub const MAX_POSTGIS_LIMIT: u64 = 1000;
/// Serialized tool results above this become recoverable tool errors.
pub const MAX_TOOL_RESULT_CHARS: usize = 25_000;

static LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bLIMIT\s+(\d+)\b").expect("static regex compiles"));

/// Walks an `EXPLAIN (FORMAT JSON)` plan tree and rejects any `ModifyTable`
/// node. Session read-only characteristics already stop writes; this rejects
/// them before execution with a clearer message.
pub fn check_plan_readonly(plan: &JsonValue) -> Result<(), String> {
    if plan.get("Node Type").and_then(|n| n.as_str()) == Some("ModifyTable") {
        return Err("Write operations not allowed".to_string());
    }
    if let Some(children) = plan.get("Plans").and_then(|p| p.as_array()) {
        for child in children {
            check_plan_readonly(child)?;
        }
    }
    Ok(())
}

/// Syntactic check that a query carries `LIMIT n` with `n <= 1000`.
pub fn validate_limit_clause(sql: &str) -> Result<(), String> {
    match LIMIT_RE.captures(sql) {
        Some(captures) => {
            let value: u64 = captures[1]
                .parse()
                .map_err(|_| "LIMIT value does not parse as a number".to_string())?;
            if value > MAX_POSTGIS_LIMIT {
                return Err(format!(
                    "LIMIT value {value} exceeds maximum allowed limit of {MAX_POSTGIS_LIMIT}"
                ));
            }
            Ok(())
        },
        None => Err(format!(
            "Query must include a LIMIT clause with a value less than {MAX_POSTGIS_LIMIT}"
        )),
    }
}

/// CSV-serializes headers plus rows (RFC-ish quoting: fields containing a
/// comma, quote or newline get quoted, quotes doubled).
pub fn to_csv(headers: &[String], rows: &[Vec<String>]) -> String {
    fn field(s: &str) -> String {
        if s.contains([',', '"', '\n', '\r']) {
            format!("\"{}\"", s.replace('"', "\"\""))
        } else {
            s.to_string()
        }
    }
    let mut out = String::new();
    out.push_str(&headers.iter().map(|h| field(h)).collect::<Vec<_>>().join(","));
    out.push_str("\r\n");
    for row in rows {
        out.push_str(&row.iter().map(|v| field(v)).collect::<Vec<_>>().join(","));
        out.push_str("\r\n");
    }
    out
}

/// TSV-serializes headers plus rows; single-value results collapse to
/// `Query result: {value}`.
pub fn to_tsv(headers: &[String], rows: &[Vec<String>]) -> String {
    if rows.len() == 1 && rows[0].len() == 1 {
        return format!("Query result: {}", rows[0][0]);
    }
    if rows.is_empty() {
        return "No results".to_string();
    }
    let mut lines = vec![headers.join("\t")];
    for row in rows {
        lines.push(row.join("\t"));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_plan_walk_rejects_modify_table_at_any_depth() {
        let select_plan = json!({
            "Node Type": "Seq Scan",
            "Plans": [{"Node Type": "Index Scan"}],
        });
        assert!(check_plan_readonly(&select_plan).is_ok());

        let insert_plan = json!({"Node Type": "ModifyTable"});
        assert!(check_plan_readonly(&insert_plan).is_err());

        let nested = json!({
            "Node Type": "Append",
            "Plans": [
                {"Node Type": "Seq Scan"},
                {"Node Type": "Nested Loop", "Plans": [{"Node Type": "ModifyTable"}]},
            ],
        });
        assert!(check_plan_readonly(&nested).is_err());
    }

    #[test]
    fn test_limit_clause_boundaries() {
        assert!(validate_limit_clause("SELECT * FROM t LIMIT 1000").is_ok());
        assert!(validate_limit_clause("SELECT * FROM t limit 10").is_ok());
        let over = validate_limit_clause("SELECT * FROM t LIMIT 1001").unwrap_err();
        assert!(over.contains("1001"));
        let missing = validate_limit_clause("SELECT * FROM t").unwrap_err();
        assert!(missing.contains("LIMIT clause"));
    }

    #[test]
    fn test_limit_detection_ignores_identifiers() {
        // "limits" as a column name is not a LIMIT clause.
        assert!(validate_limit_clause("SELECT limits FROM t").is_err());
        assert!(validate_limit_clause("SELECT limits FROM t LIMIT 5").is_ok());
    }

    #[test]
    fn test_csv_quoting() {
        let csv = to_csv(
            &["name".to_string(), "note".to_string()],
            &[vec!["a,b".to_string(), "say \"hi\"".to_string()]],
        );
        assert_eq!(csv, "name,note\r\n\"a,b\",\"say \"\"hi\"\"\"\r\n");
    }

    #[test]
    fn test_tsv_single_value_collapse() {
        let tsv = to_tsv(&["count".to_string()], &[vec!["18".to_string()]]);
        assert_eq!(tsv, "Query result: 18");
    }

    #[test]
    fn test_tsv_table_format() {
        let tsv = to_tsv(
            &["id".to_string(), "name".to_string()],
            &[
                vec!["1".to_string(), "a".to_string()],
                vec!["2".to_string(), "b".to_string()],
            ],
        );
        assert_eq!(tsv, "id\tname\n1\ta\n2\tb");
    }

    #[test]
    fn test_tsv_empty() {
        assert_eq!(to_tsv(&["id".to_string()], &[]), "No results");
    }
}
