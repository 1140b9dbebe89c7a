//! SQL rendering for the queries the tree issues.
//!
//! Only the statement shapes the grower needs are rendered here: aggregate
//! selects, bucketed aggregates, filtered copies for child tables, and the
//! leaf-routing projection. Metric expressions, feature names and path
//! fragments are taken verbatim; literals are quoted.

use std::fmt::Write;

/// Predicate that holds for every row (the root path).
pub const TRUE_PREDICATE: &str = "1 = 1";

/// Alias of the bucket column in bucketed aggregate queries.
pub const BUCKET_COLUMN: &str = "__bucket";

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render a numeric literal. Integral values print without a fractional part.
pub fn numeric_literal(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Conjunction of path fragments. An empty path is [`TRUE_PREDICATE`].
pub fn conjunction<S: AsRef<str>>(parts: &[S]) -> String {
    match parts {
        [] => TRUE_PREDICATE.to_string(),
        [only] => only.as_ref().to_string(),
        _ => parts
            .iter()
            .map(|p| format!("({})", p.as_ref()))
            .collect::<Vec<_>>()
            .join(" AND "),
    }
}

/// `SELECT <expr> AS <name>, ... FROM <table>`
pub fn select_aggregates(metrics: &[(String, String)], table: &str) -> String {
    let mut sql = String::from("SELECT\n");
    push_projection(&mut sql, metrics);
    let _ = write!(sql, "\nFROM {}", table);
    sql
}

/// Aggregates grouped by a bucket expression, which is projected as
/// [`BUCKET_COLUMN`].
pub fn select_bucket_aggregates(
    bucket_expr: &str,
    metrics: &[(String, String)],
    table: &str,
) -> String {
    let mut sql = String::from("SELECT\n");
    let _ = writeln!(sql, "  {} AS {},", bucket_expr, BUCKET_COLUMN);
    push_projection(&mut sql, metrics);
    let _ = write!(sql, "\nFROM {}\nGROUP BY {}", table, bucket_expr);
    sql
}

/// `SELECT * FROM <table> WHERE <predicate>`
pub fn select_where(table: &str, predicate: &str) -> String {
    format!("SELECT *\nFROM {}\nWHERE {}", table, predicate)
}

/// `SELECT *, <expr> AS <alias> FROM <table>`
pub fn select_with_column(table: &str, expr: &str, alias: &str) -> String {
    format!("SELECT *,\n  {} AS {}\nFROM {}", expr, alias, table)
}

fn push_projection(sql: &mut String, metrics: &[(String, String)]) {
    let items: Vec<String> = metrics
        .iter()
        .map(|(name, expr)| format!("  {} AS {}", expr, name))
        .collect();
    sql.push_str(&items.join(",\n"));
}
