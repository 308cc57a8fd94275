use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Positional column order of `INSERT INTO bookings` when no column list is given.
pub const BOOKING_COLUMNS: [&str; 13] = [
    "full_name",
    "email",
    "mobile_number",
    "address_line",
    "pincode",
    "city",
    "landmark",
    "state",
    "product_id",
    "product_name",
    "product_brand",
    "demo_date",
    "time_slot",
];

/// How an intake names its slot: a full window, or only the start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRef {
    Window(TimeWindow),
    StartingAt(NaiveTime),
}

impl SlotRef {
    fn parse(s: &str) -> Option<Self> {
        if s.contains('-') {
            TimeWindow::parse(s).map(SlotRef::Window)
        } else {
            parse_time_of_day(s.trim()).map(SlotRef::StartingAt)
        }
    }
}

/// Booking intake as written in SQL; the slot is resolved by the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRow {
    pub customer: Customer,
    pub address: Address,
    pub product: Product,
    pub demo_date: NaiveDate,
    pub time_slot: SlotRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAdjustment {
    Reserve,
    Release,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    GenerateSlots {
        start: NaiveDate,
        end: NaiveDate,
        capacity: Option<u32>,
        windows: Option<Vec<TimeWindow>>,
    },
    SelectSlots {
        date: NaiveDate,
    },
    AdjustSlot {
        date: NaiveDate,
        start: NaiveTime,
        end: Option<NaiveTime>,
        adjustment: SlotAdjustment,
        returning: bool,
    },
    InsertBooking {
        booking: BookingRow,
        returning: bool,
    },
    SelectBooking {
        id: BookingId,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    DecideBooking {
        id: BookingId,
        decision: Decision,
        comments: Option<String>,
        processed_by: Option<String>,
        returning: bool,
    },
    SelectStats {
        day: Option<NaiveDate>,
    },
}

/// Which row shape a statement answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultTable {
    Slots,
    Bookings,
    BookingStats,
}

impl ResultTable {
    fn from_name(table: &str) -> Option<Self> {
        match table {
            "slots" => Some(ResultTable::Slots),
            "bookings" => Some(ResultTable::Bookings),
            "booking_stats" => Some(ResultTable::BookingStats),
            _ => None,
        }
    }
}

impl Command {
    /// `None` when the command answers with a bare command tag.
    pub fn result_table(&self) -> Option<ResultTable> {
        match self {
            Command::GenerateSlots { .. } => None,
            Command::SelectSlots { .. } => Some(ResultTable::Slots),
            Command::AdjustSlot { returning, .. } => returning.then_some(ResultTable::Slots),
            Command::InsertBooking { returning, .. } | Command::DecideBooking { returning, .. } => {
                returning.then_some(ResultTable::Bookings)
            }
            Command::SelectBooking { .. } | Command::SelectBookings { .. } => {
                Some(ResultTable::Bookings)
            }
            Command::SelectStats { .. } => Some(ResultTable::BookingStats),
        }
    }
}

/// Result rows of a statement that may still hold unbound `$n` parameters,
/// judged from its target table and `RETURNING` clause alone.
pub fn returned_table(sql: &str) -> Option<ResultTable> {
    let stmt = parse_single(sql).ok()?;
    let table = match &stmt {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok()?,
            _ => return None,
        },
        Statement::Insert(insert) if insert.returning.is_some() => insert_table_name(insert).ok()?,
        Statement::Update {
            table,
            returning: Some(_),
            ..
        } => table_factor_name(&table.relation).ok()?,
        _ => return None,
    };
    ResultTable::from_name(&table)
}

fn parse_single(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts =
        Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    match stmts.len() {
        0 => Err(SqlError::Empty),
        1 => Ok(stmts.remove(0)),
        _ => Err(SqlError::Unsupported("one statement per query".into())),
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    match &parse_single(sql)? {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            returning,
            ..
        } => parse_update(
            &table.relation,
            assignments,
            selection.as_ref(),
            returning.is_some(),
        ),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.to_string().trim_matches('"').to_lowercase())
        .collect();

    match table.as_str() {
        "slots" => {
            let row = NamedRow::new(&columns, &values, &["start_date", "end_date", "capacity", "windows"])?;
            let start = parse_date(row.required("start_date")?)?;
            let end = parse_date(row.required("end_date")?)?;
            let capacity = row.optional("capacity").map(parse_u32).transpose()?;
            let windows = match row.optional("windows").map(parse_text_or_null).transpose()? {
                Some(Some(text)) => Some(parse_windows(&text)?),
                _ => None,
            };
            Ok(Command::GenerateSlots {
                start,
                end,
                capacity,
                windows,
            })
        }
        "bookings" => {
            let row = NamedRow::new(&columns, &values, &BOOKING_COLUMNS)?;
            let text = |col: &'static str| row.required(col).and_then(parse_text);
            let slot_text = text("time_slot")?;
            let booking = BookingRow {
                customer: Customer {
                    full_name: text("full_name")?,
                    email: text("email")?,
                    mobile_number: text("mobile_number")?,
                },
                address: Address {
                    address_line: text("address_line")?,
                    pincode: text("pincode")?,
                    city: text("city")?,
                    landmark: row
                        .optional("landmark")
                        .map(parse_text_or_null)
                        .transpose()?
                        .flatten(),
                    state: text("state")?,
                },
                product: Product {
                    id: text("product_id")?,
                    name: text("product_name")?,
                    brand: text("product_brand")?,
                },
                demo_date: parse_date(row.required("demo_date")?)?,
                time_slot: SlotRef::parse(&slot_text)
                    .ok_or_else(|| SqlError::Parse(format!("bad time_slot: {slot_text}")))?,
            };
            Ok(Command::InsertBooking {
                booking,
                returning: insert.returning.is_some(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One VALUES row addressed by column name. Without a column list the
/// values are taken in `default_order`.
struct NamedRow<'a> {
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> NamedRow<'a> {
    fn new(columns: &[String], values: &'a [Expr], default_order: &[&str]) -> Result<Self, SqlError> {
        let cells = if columns.is_empty() {
            if values.len() > default_order.len() {
                return Err(SqlError::WrongArity("values", default_order.len(), values.len()));
            }
            default_order
                .iter()
                .map(|c| c.to_string())
                .zip(values.iter())
                .collect()
        } else {
            if columns.len() != values.len() {
                return Err(SqlError::WrongArity("values", columns.len(), values.len()));
            }
            if let Some(unknown) = columns.iter().find(|c| !default_order.contains(&c.as_str())) {
                return Err(SqlError::UnknownColumn(unknown.clone()));
            }
            columns.iter().cloned().zip(values.iter()).collect()
        };
        Ok(Self { cells })
    }

    fn optional(&self, column: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| *expr)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.optional(column).ok_or(SqlError::MissingColumn(column))
    }
}

fn parse_windows(text: &str) -> Result<Vec<TimeWindow>, SqlError> {
    text.split(',')
        .map(|w| TimeWindow::parse(w).ok_or_else(|| SqlError::Parse(format!("bad window: {w}"))))
        .collect()
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |name: &str| {
        filters
            .iter()
            .find(|(col, _)| col == name)
            .map(|(_, expr)| *expr)
    };

    match table.as_str() {
        "slots" => {
            let date = filter("slot_date").ok_or(SqlError::MissingFilter("slot_date"))?;
            Ok(Command::SelectSlots {
                date: parse_date(date)?,
            })
        }
        "bookings" => {
            if let Some(id) = filter("id") {
                if let Some((other, _)) = filters.iter().find(|(col, _)| col != "id") {
                    return Err(SqlError::Unsupported(format!(
                        "filter {other} alongside id"
                    )));
                }
                return Ok(Command::SelectBooking { id: parse_u64(id)? });
            }
            let mut f = BookingFilter::default();
            if let Some(e) = filter("status") {
                let s = parse_text(e)?;
                f.status = Some(BookingStatus::parse(&s).ok_or(SqlError::Parse(format!("bad status: {s}")))?);
            }
            if let Some(e) = filter("search") {
                f.search_term = Some(parse_text(e)?);
            }
            if let Some(e) = filter("page") {
                f.page = parse_usize(e)?;
            }
            if let Some(e) = filter("size") {
                f.size = parse_usize(e)?;
            }
            if let Some(e) = filter("sort_by") {
                let s = parse_text(e)?;
                f.sort_by = SortField::parse(&s).ok_or(SqlError::Parse(format!("bad sort_by: {s}")))?;
            }
            if let Some(e) = filter("sort_direction") {
                let s = parse_text(e)?;
                f.sort_direction =
                    SortDirection::parse(&s).ok_or(SqlError::Parse(format!("bad sort_direction: {s}")))?;
            }
            Ok(Command::SelectBookings { filter: f })
        }
        "booking_stats" => Ok(Command::SelectStats {
            day: filter("demo_date").map(parse_date).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y ...` into (column, value) pairs.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref()));
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op} in WHERE"))),
        },
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        _ => Err(SqlError::Unsupported(format!("WHERE {expr}"))),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
    returning: bool,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let mut filters = Vec::new();
    if let Some(selection) = selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |name: &str| {
        filters
            .iter()
            .find(|(col, _)| col == name)
            .map(|(_, expr)| *expr)
    };

    let mut sets = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        sets.push((col, &a.value));
    }
    let set = |name: &str| {
        sets.iter()
            .find(|(col, _)| col == name)
            .map(|(_, expr)| *expr)
    };

    match table.as_str() {
        "slots" => {
            let value = set("reserved_count").ok_or(SqlError::MissingColumn("reserved_count"))?;
            let adjustment = parse_adjustment(value)?;
            let date = filter("slot_date").ok_or(SqlError::MissingFilter("slot_date"))?;
            let start = filter("start_time").ok_or(SqlError::MissingFilter("start_time"))?;
            Ok(Command::AdjustSlot {
                date: parse_date(date)?,
                start: parse_time(start)?,
                end: filter("end_time").map(parse_time).transpose()?,
                adjustment,
                returning,
            })
        }
        "bookings" => {
            let id = filter("id").ok_or(SqlError::MissingFilter("id"))?;
            let status = parse_text(set("status").ok_or(SqlError::MissingColumn("status"))?)?;
            let decision = Decision::parse(&status)
                .ok_or_else(|| SqlError::Parse(format!("status must be APPROVED or REJECTED, got {status}")))?;
            if let Some((col, _)) = sets
                .iter()
                .find(|(col, _)| !["status", "admin_comments", "processed_by"].contains(&col.as_str()))
            {
                return Err(SqlError::UnknownColumn(col.clone()));
            }
            Ok(Command::DecideBooking {
                id: parse_u64(id)?,
                decision,
                comments: set("admin_comments").map(parse_text_or_null).transpose()?.flatten(),
                processed_by: set("processed_by").map(parse_text_or_null).transpose()?.flatten(),
                returning,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `reserved_count + 1` reserves, `reserved_count - 1` releases.
fn parse_adjustment(expr: &Expr) -> Result<SlotAdjustment, SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr
        && expr_column_name(left).as_deref() == Some("reserved_count")
        && parse_i64_expr(right)? == 1
    {
        match op {
            ast::BinaryOperator::Plus => return Ok(SlotAdjustment::Reserve),
            ast::BinaryOperator::Minus => return Ok(SlotAdjustment::Release),
            _ => {}
        }
    }
    Err(SqlError::Unsupported(format!(
        "reserved_count may only move by one, got {expr}"
    )))
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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
        },
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

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_text(expr).map(Some),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_text(expr)?;
    parse_time_of_day(s.trim()).ok_or_else(|| SqlError::Parse(format!("bad time: {s}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64_expr(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u64 range")))
}

fn parse_usize(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64_expr(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} must not be negative")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
