//! SQL text analysis: statement splitting, classification and the read-only
//! policy. Nothing here talks to a database.

pub mod lexer;
pub mod non_rollbackable;
pub mod parser;
pub mod validator;

pub use lexer::{mask_sql, strip_comments};
pub use non_rollbackable::{
    NonRollbackableKind, NonRollbackableWarning, detect_non_rollbackable, statement_warnings,
};
pub use parser::{
    MutationKind, MutationTarget, ParsedStatement, TableRef, detect_statement_type, excerpt,
    extract_tables_from_sql, is_dml, parse_mutation_target, quote_ident, split_statements,
    validate_identifier,
};
pub use validator::{
    DEFAULT_MAX_SQL_LENGTH, ReadOnlyCheck, find_side_effect_function, is_read_only_sql,
    is_read_only_sql_with_limit,
};
