use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use crate::model::*;

pub const TABLE: &str = "reservations";
pub const MAX_RESOURCE_ID_LEN: usize = 256;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    CreateReservation {
        resource_id: String,
        start: Timestamp,
        end: Timestamp,
    },
    CancelReservation {
        id: String,
    },
    ListReservations {
        resource_id: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != TABLE {
        return Err(SqlError::UnknownTable(table));
    }
    let rows = extract_insert_rows(insert)?;
    if rows.len() > 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let values = &rows[0];

    // Honor an explicit column list; otherwise (resource_id, start, "end").
    let (mut resource_id, mut start, mut end) = (None, None, None);
    if insert.columns.is_empty() {
        if values.len() != 3 {
            return Err(SqlError::WrongArity(TABLE, 3, values.len()));
        }
        resource_id = Some(&values[0]);
        start = Some(&values[1]);
        end = Some(&values[2]);
    } else {
        if insert.columns.len() != values.len() {
            return Err(SqlError::WrongArity(TABLE, insert.columns.len(), values.len()));
        }
        for (col, value) in insert.columns.iter().zip(values) {
            match col.value.to_lowercase().as_str() {
                "resource_id" => resource_id = Some(value),
                "start" => start = Some(value),
                "end" => end = Some(value),
                "id" => return Err(SqlError::Unsupported("reservation ids are assigned by the server".into())),
                other => return Err(SqlError::UnknownColumn(other.to_string())),
            }
        }
    }

    Ok(Command::CreateReservation {
        resource_id: parse_resource_id(resource_id.ok_or(SqlError::MissingColumn("resource_id"))?)?,
        start: parse_timestamp(start.ok_or(SqlError::MissingColumn("start"))?)?,
        end: parse_timestamp(end.ok_or(SqlError::MissingColumn("end"))?)?,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != TABLE {
        return Err(SqlError::UnknownTable(table));
    }
    let selection = delete.selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let id = extract_eq_filter(selection, "id")?.ok_or(SqlError::MissingFilter("id"))?;
    Ok(Command::CancelReservation {
        id: parse_string_expr(id)?,
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    if table != TABLE {
        return Err(SqlError::UnknownTable(table));
    }

    let selection = select
        .selection
        .as_ref()
        .ok_or(SqlError::MissingFilter("resource_id"))?;
    let resource_id = extract_eq_filter(selection, "resource_id")?
        .ok_or(SqlError::MissingFilter("resource_id"))?;
    Ok(Command::ListReservations {
        resource_id: parse_resource_id(resource_id)?,
    })
}

/// Find `column = <value>` in a conjunction of predicates.
fn extract_eq_filter<'a>(expr: &'a Expr, column: &str) -> Result<Option<&'a Expr>, SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                if let Some(found) = extract_eq_filter(left, column)? {
                    return Ok(Some(found));
                }
                extract_eq_filter(right, column)
            }
            ast::BinaryOperator::Eq if expr_column_name(left).as_deref() == Some(column) => {
                Ok(Some(right))
            }
            _ => Ok(None),
        },
        Expr::Nested(inner) => extract_eq_filter(inner, column),
        _ => Ok(None),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_resource_id(expr: &Expr) -> Result<String, SqlError> {
    let id = parse_string_expr(expr)?;
    if id.is_empty() {
        return Err(SqlError::InvalidResourceId("empty".into()));
    }
    if id.len() > MAX_RESOURCE_ID_LEN {
        return Err(SqlError::ResourceIdTooLong(id.len()));
    }
    Ok(id)
}

/// String literal (ISO 8601, offset optional) or integer Unix milliseconds,
/// bare or quoted.
fn parse_timestamp(expr: &Expr) -> Result<Timestamp, SqlError> {
    let value = match extract_value(expr) {
        Some(value) => value,
        None => {
            if let Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr: inner,
            } = expr
                && let Some(Value::Number(n, _)) = extract_value(inner)
            {
                let ms: Ms = n
                    .parse()
                    .map_err(|_| SqlError::BadTimestamp(format!("-{n}")))?;
                return Timestamp::from_unix_ms(-ms).ok_or(SqlError::BadTimestamp(format!("-{n}")));
            }
            return Err(SqlError::Parse(format!("expected timestamp, got {expr:?}")));
        }
    };
    match value {
        Value::SingleQuotedString(s) => s
            .parse::<Timestamp>()
            .ok()
            // Extended-protocol parameters arrive as quoted text, milliseconds included.
            .or_else(|| s.trim().parse::<Ms>().ok().and_then(Timestamp::from_unix_ms))
            .ok_or_else(|| SqlError::BadTimestamp(s.clone())),
        Value::Number(n, _) => n
            .parse::<Ms>()
            .ok()
            .and_then(Timestamp::from_unix_ms)
            .ok_or_else(|| SqlError::BadTimestamp(n.clone())),
        _ => Err(SqlError::Parse(format!("expected timestamp, got {value:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid timestamp: {0}")]
    BadTimestamp(String),
    #[error("invalid resource_id: {0}")]
    InvalidResourceId(String),
    #[error("resource_id too long: {0} bytes (max {MAX_RESOURCE_ID_LEN})")]
    ResourceIdTooLong(usize),
}
