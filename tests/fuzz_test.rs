//! Randomized and edge-case inputs for the SQL analysis layer.
//!
//! Everything here is pure text processing, so each case must return
//! without panicking, however malformed the input.

use pg_mcp_server::sql::{
    detect_non_rollbackable, detect_statement_type, extract_tables_from_sql,
    find_side_effect_function, is_read_only_sql, mask_sql, parse_mutation_target,
    split_statements, strip_comments,
};
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;

/// Generate random string of given length
fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate various edge-case strings
fn edge_case_strings() -> Vec<String> {
    vec![
        String::new(),
        " ".to_string(),
        "\n\r\t".to_string(),
        "\0".to_string(),
        "🚀".repeat(100),
        "'OR 1=1--".to_string(),
        "'; DROP TABLE users--".to_string(),
        "$$".to_string(),
        "$a$ unterminated".to_string(),
        "$1$2$3".to_string(),
        "/* never closed".to_string(),
        "/* /* nested */ still open? */ SELECT 1".to_string(),
        "E'\\".to_string(),
        "\"".to_string(),
        "'''".to_string(),
        ";;;;".to_string(),
        "((((((((".to_string(),
        "))))))))".to_string(),
        "WITH".to_string(),
        "DELETE".to_string(),
        "DELETE FROM".to_string(),
        "UPDATE SET".to_string(),
        "INSERT INTO".to_string(),
        "SELECT nextval(".to_string(),
        "COPY x TO".to_string(),
        "REINDEX".to_string(),
        "CLUSTER".to_string(),
        "a".repeat(100_000),
        random_string(100),
        random_string(1000),
        "\u{0000}\u{FFFF}".to_string(),
    ]
}

/// Fragments glued together at random to build plausible-looking SQL.
const FRAGMENTS: &[&str] = &[
    "SELECT", "INSERT", "INTO", "UPDATE", "DELETE", "FROM", "WHERE", "WITH", "AS", "SET",
    "VALUES", "RETURNING", "USING", "JOIN", "ON", "(", ")", ";", ",", "'", "''", "\"", "$$",
    "$t$", "--", "\n", "/*", "*/", "E'", "\\", "nextval(", "pg_read_file(", "VACUUM",
    "CONCURRENTLY", "BEGIN", "COMMIT", "COPY", "TO", "STDIN", "users", "public.users", "1",
    "x = 1", " ", "é", "🚀",
];

fn random_sql(parts: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..parts)
        .map(|_| *FRAGMENTS.choose(&mut rng).unwrap_or(&" "))
        .collect::<Vec<_>>()
        .join(" ")
}

fn exercise(sql: &str) {
    let masked = mask_sql(sql);
    assert_eq!(masked.len(), sql.len(), "masking changed length of {sql:?}");

    let statements = split_statements(sql);
    for statement in &statements {
        assert!(!statement.sql.trim().is_empty());
        assert!(statement.line >= 1);
        let _ = detect_statement_type(&statement.sql);
    }
    let _ = detect_non_rollbackable(&statements);
    let _ = strip_comments(sql);
    let _ = extract_tables_from_sql(sql);
    let _ = find_side_effect_function(sql);
    let _ = parse_mutation_target(sql);

    let check = is_read_only_sql(sql);
    if !check.is_read_only {
        assert!(check.reason.is_some(), "rejection without a reason for {sql:?}");
    }
}

#[test]
fn test_edge_case_strings_do_not_panic() {
    for sql in edge_case_strings() {
        exercise(&sql);
    }
}

#[test]
fn test_random_fragment_soup_does_not_panic() {
    let mut rng = rand::thread_rng();
    for _ in 0..2_000 {
        let parts = rng.gen_range(1..40);
        exercise(&random_sql(parts));
    }
}

#[test]
fn test_random_bytes_as_text_do_not_panic() {
    let mut rng = rand::thread_rng();
    for _ in 0..500 {
        let len = rng.gen_range(0..256);
        let bytes: Vec<u8> = (0..len).map(|_| rng.r#gen::<u8>()).collect();
        exercise(&String::from_utf8_lossy(&bytes));
    }
}

#[test]
fn test_line_numbers_never_exceed_input_lines() {
    let mut rng = rand::thread_rng();
    for _ in 0..500 {
        let sql = random_sql(rng.gen_range(1..60));
        let lines = sql.lines().count().max(1);
        for statement in split_statements(&sql) {
            assert!(statement.line <= lines, "line {} of {lines} in {sql:?}", statement.line);
        }
    }
}

#[test]
fn test_writes_hidden_in_soup_are_never_read_only() {
    let mut rng = rand::thread_rng();
    for _ in 0..500 {
        let prefix = random_string(rng.gen_range(0..20));
        let sql = format!("SELECT {prefix};\nDELETE FROM users");
        assert!(!is_read_only_sql(&sql).is_read_only, "{sql:?}");
    }
}
