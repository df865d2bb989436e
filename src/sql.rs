use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::DEFAULT_SERVICE_DURATION_MINUTES;
use crate::model::AppointmentStatus;
use crate::schedule::{self, ScheduleError, WeeklySchedule};

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBusiness {
        id: Ulid,
        name: Option<String>,
    },
    DeleteBusiness {
        id: Ulid,
    },
    /// Replaces the business's opening hours; `None` clears them.
    InsertSchedule {
        business_id: Ulid,
        schedule: Option<WeeklySchedule>,
    },
    /// Staff-entered appointment, booked as CONFIRMED.
    InsertAppointment {
        id: Ulid,
        business_id: Ulid,
        start: NaiveDateTime,
        duration_minutes: i64,
        label: Option<String>,
    },
    /// Public self-service booking, booked as PENDING.
    InsertBooking {
        id: Ulid,
        business_id: Ulid,
        date: NaiveDate,
        time: NaiveTime,
        duration_minutes: i64,
        label: Option<String>,
    },
    InsertAppointmentStatus {
        id: Ulid,
        status: AppointmentStatus,
    },
    DeleteAppointment {
        id: Ulid,
    },
    SelectSlots {
        business_id: Ulid,
        date: NaiveDate,
        duration_minutes: i64,
    },
    SelectAppointments {
        business_id: Ulid,
        date: Option<NaiveDate>,
    },
    SelectSchedule {
        business_id: Ulid,
    },
    SelectBusinesses,
    Listen {
        channel: String,
    },
    /// `None` drops every subscription (`UNLISTEN *`).
    Unlisten {
        channel: Option<String>,
    },
}

/// `LISTEN x` / `UNLISTEN x` argument, if `sql` starts with `keyword`.
fn channel_after<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    let rest = &sql[keyword.len()..];
    if !head.eq_ignore_ascii_case(keyword) || !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(rest.trim().trim_end_matches(';').trim())
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if let Some(channel) = channel_after(trimmed, "LISTEN") {
        return Ok(Command::Listen {
            channel: channel.to_string(),
        });
    }
    if let Some(channel) = channel_after(trimmed, "UNLISTEN") {
        let channel = (channel != "*").then(|| channel.to_string());
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let arity = |min: usize| {
        if values.len() < min {
            Err(SqlError::WrongArity(table_label(&table), min, values.len()))
        } else {
            Ok(())
        }
    };

    match table.as_str() {
        "businesses" => {
            arity(1)?;
            Ok(Command::InsertBusiness {
                id: parse_ulid(&values[0])?,
                name: optional(&values, 1, parse_string_or_null)?,
            })
        }
        "schedules" => {
            arity(2)?;
            let schedule = parse_string_or_null(&values[1])?
                .map(|json| WeeklySchedule::from_json(&json))
                .transpose()?;
            Ok(Command::InsertSchedule {
                business_id: parse_ulid(&values[0])?,
                schedule,
            })
        }
        "appointments" => {
            arity(3)?;
            Ok(Command::InsertAppointment {
                id: parse_ulid(&values[0])?,
                business_id: parse_ulid(&values[1])?,
                start: parse_datetime(&values[2])?,
                duration_minutes: duration_at(&values, 3)?,
                label: optional(&values, 4, parse_string_or_null)?,
            })
        }
        "bookings" => {
            arity(4)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                business_id: parse_ulid(&values[1])?,
                date: parse_date(&values[2])?,
                time: parse_time(&values[3])?,
                duration_minutes: duration_at(&values, 4)?,
                label: optional(&values, 5, parse_string_or_null)?,
            })
        }
        "appointment_status" => {
            arity(2)?;
            let status = parse_string(&values[1])?
                .parse::<AppointmentStatus>()
                .map_err(SqlError::Parse)?;
            Ok(Command::InsertAppointmentStatus {
                id: parse_ulid(&values[0])?,
                status,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "businesses" => Ok(Command::DeleteBusiness { id }),
        "appointments" => Ok(Command::DeleteAppointment { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Equality filters collected from a `WHERE a = x AND b = y` clause.
#[derive(Default)]
struct Filters<'a> {
    business_id: Option<&'a Expr>,
    date: Option<&'a Expr>,
    duration: Option<&'a Expr>,
}

impl<'a> Filters<'a> {
    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                self.collect(left)?;
                self.collect(right)
            }
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } => {
                match expr_column_name(left).as_deref() {
                    Some("business_id") => self.business_id = Some(right.as_ref()),
                    Some("date") => self.date = Some(right.as_ref()),
                    Some("duration") => self.duration = Some(right.as_ref()),
                    Some(other) => return Err(SqlError::Unsupported(format!("filter on {other}"))),
                    None => return Err(SqlError::Unsupported(format!("filter {expr}"))),
                }
                Ok(())
            }
            Expr::Nested(inner) => self.collect(inner),
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn business_id(&self) -> Result<Ulid, SqlError> {
        parse_ulid(self.business_id.ok_or(SqlError::MissingFilter("business_id"))?)
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection)?;
    }

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            business_id: filters.business_id()?,
            date: parse_date(filters.date.ok_or(SqlError::MissingFilter("date"))?)?,
            duration_minutes: match filters.duration {
                Some(expr) => parse_duration(expr)?,
                None => DEFAULT_SERVICE_DURATION_MINUTES,
            },
        }),
        "appointments" => Ok(Command::SelectAppointments {
            business_id: filters.business_id()?,
            date: filters.date.map(parse_date).transpose()?,
        }),
        "schedules" => Ok(Command::SelectSchedule {
            business_id: filters.business_id()?,
        }),
        "businesses" => Ok(Command::SelectBusinesses),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn table_label(table: &str) -> &'static str {
    match table {
        "businesses" => "businesses",
        "schedules" => "schedules",
        "appointments" => "appointments",
        "bookings" => "bookings",
        "appointment_status" => "appointment_status",
        _ => "table",
    }
}

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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

/// Single-row VALUES only.
fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
            rows => Err(SqlError::Unsupported(format!("{}-row INSERT", rows.len()))),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
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

/// Parse `values[idx]` if present; trailing columns may be omitted.
fn optional<T>(
    values: &[Expr],
    idx: usize,
    parse: fn(&Expr) -> Result<Option<T>, SqlError>,
) -> Result<Option<T>, SqlError> {
    values.get(idx).map_or(Ok(None), parse)
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string or NULL, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_i64(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse(format!("integer out of range: -{expr}")));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Minutes. NULL means the default service duration. Sign is checked by the engine.
fn parse_duration(expr: &Expr) -> Result<i64, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(DEFAULT_SERVICE_DURATION_MINUTES),
        _ => parse_i64(expr),
    }
}

/// Duration column at `idx`; missing behaves like NULL.
fn duration_at(values: &[Expr], idx: usize) -> Result<i64, SqlError> {
    values
        .get(idx)
        .map_or(Ok(DEFAULT_SERVICE_DURATION_MINUTES), parse_duration)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    Ok(schedule::parse_time(parse_string(expr)?.trim())?)
}

fn parse_datetime(expr: &Expr) -> Result<NaiveDateTime, SqlError> {
    let s = parse_string(expr)?;
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s.trim(), fmt).ok())
        .ok_or_else(|| SqlError::Parse(format!("bad timestamp {s}: expected YYYY-MM-DD HH:MM")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    Schedule(ScheduleError),
}

impl From<ScheduleError> for SqlError {
    fn from(e: ScheduleError) -> Self {
        SqlError::Schedule(e)
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::Schedule(e) => write!(f, "opening hours: {e}"),
        }
    }
}

impl std::error::Error for SqlError {}
