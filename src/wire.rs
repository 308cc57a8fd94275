use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveTime};
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotdeskAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, ResultTable, SlotAdjustment, SlotRef};

/// What a command produced, before it is encoded for the client.
enum Outcome {
    Generated(usize),
    Slots(Vec<TimeSlot>),
    SlotAdjusted(TimeSlot, bool),
    BookingCreated(Booking, bool),
    BookingDecided(Booking, bool),
    Bookings(BookingPage),
    Stats(NaiveDate, BookingStats),
}

pub struct SlotdeskHandler {
    engine: Arc<Engine>,
    default_capacity: u32,
    query_parser: Arc<SlotdeskQueryParser>,
}

impl SlotdeskHandler {
    pub fn new(engine: Arc<Engine>, default_capacity: u32) -> Self {
        Self {
            engine,
            default_capacity,
            query_parser: Arc::new(SlotdeskQueryParser),
        }
    }

    /// Parse and run one statement. The engine is synchronous and fsyncs, so
    /// it runs on the blocking pool.
    async fn execute_sql<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let login = client.metadata().get("user").cloned();
        let engine = self.engine.clone();
        let default_capacity = self.default_capacity;

        let started = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || {
            run_command(&engine, default_capacity, login, cmd)
        })
        .await
        .map_err(|e| internal_err(format!("command task failed: {e}")))
        .and_then(|r| r);

        let status = if outcome.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        encode_outcome(outcome?)
    }
}

fn run_command(
    engine: &Engine,
    default_capacity: u32,
    login: Option<String>,
    cmd: Command,
) -> PgWireResult<Outcome> {
    match cmd {
        Command::GenerateSlots {
            start,
            end,
            capacity,
            windows,
        } => {
            let windows = windows.unwrap_or_else(default_windows);
            let created = engine
                .generate_slots(start, end, &windows, capacity.unwrap_or(default_capacity))
                .map_err(engine_err)?;
            Ok(Outcome::Generated(created))
        }
        Command::SelectSlots { date } => Ok(Outcome::Slots(engine.list_slots(date))),
        Command::AdjustSlot {
            date,
            start,
            end,
            adjustment,
            returning,
        } => {
            let key = match end {
                Some(end) => SlotKey::new(date, TimeWindow { start, end }),
                None => resolve_slot(engine, date, start)?,
            };
            let slot = match adjustment {
                SlotAdjustment::Reserve => engine.reserve_slot(key),
                SlotAdjustment::Release => engine.release_slot(key),
            }
            .map_err(engine_err)?;
            Ok(Outcome::SlotAdjusted(slot, returning))
        }
        Command::InsertBooking { booking, returning } => {
            let time_slot = match booking.time_slot {
                SlotRef::Window(window) => window,
                SlotRef::StartingAt(start) => resolve_slot(engine, booking.demo_date, start)?.window,
            };
            let intake = NewBooking {
                customer: booking.customer,
                address: booking.address,
                product: booking.product,
                demo_date: booking.demo_date,
                time_slot,
            };
            let created = engine.create_booking(intake).map_err(engine_err)?;
            Ok(Outcome::BookingCreated(created, returning))
        }
        Command::SelectBooking { id } => {
            let booking = engine.get_booking(id).map_err(engine_err)?;
            Ok(Outcome::Bookings(single_page(booking)))
        }
        Command::SelectBookings { filter } => {
            let page = engine.list_bookings(&filter).map_err(engine_err)?;
            Ok(Outcome::Bookings(page))
        }
        Command::DecideBooking {
            id,
            decision,
            comments,
            processed_by,
            returning,
        } => {
            let actor = processed_by
                .or(login)
                .map(Actor::new)
                .ok_or_else(|| internal_err("no actor for decision: set processed_by".into()))?;
            let booking = engine
                .decide_booking(id, decision, &actor, comments)
                .map_err(engine_err)?;
            Ok(Outcome::BookingDecided(booking, returning))
        }
        Command::SelectStats { day } => {
            let day = day.unwrap_or_else(|| Local::now().date_naive());
            Ok(Outcome::Stats(day, engine.booking_stats(day)))
        }
    }
}

fn resolve_slot(engine: &Engine, date: NaiveDate, start: NaiveTime) -> PgWireResult<SlotKey> {
    engine.resolve_slot(date, start).ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "P0002".into(),
            format!("time slot not found: {date} starting {}", start.format("%H:%M")),
        )))
    })
}

fn single_page(booking: Booking) -> BookingPage {
    BookingPage {
        content: vec![booking],
        total_elements: 1,
        total_pages: 1,
        size: 1,
        number: 0,
        first: true,
        last: true,
    }
}

fn encode_outcome(outcome: Outcome) -> PgWireResult<Response> {
    match outcome {
        Outcome::Generated(created) => Ok(Response::Execution(Tag::new("INSERT").with_rows(created))),
        Outcome::Slots(slots) => slot_rows(slots),
        Outcome::SlotAdjusted(slot, true) => slot_rows(vec![slot]),
        Outcome::SlotAdjusted(_, false) => Ok(Response::Execution(Tag::new("UPDATE").with_rows(1))),
        Outcome::BookingCreated(booking, true) => booking_rows(single_page(booking)),
        Outcome::BookingCreated(_, false) => Ok(Response::Execution(Tag::new("INSERT").with_rows(1))),
        Outcome::BookingDecided(booking, true) => booking_rows(single_page(booking)),
        Outcome::BookingDecided(_, false) => Ok(Response::Execution(Tag::new("UPDATE").with_rows(1))),
        Outcome::Bookings(page) => booking_rows(page),
        Outcome::Stats(day, stats) => stats_rows(day, stats),
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text_field("slot_date"),
        text_field("start_time"),
        text_field("end_time"),
        typed_field("total_capacity", Type::INT4),
        typed_field("reserved_count", Type::INT4),
        typed_field("remaining", Type::INT4),
        typed_field("available", Type::BOOL),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    let mut fields = vec![typed_field("id", Type::INT8)];
    fields.extend(sql::BOOKING_COLUMNS.iter().map(|c| text_field(c)));
    fields.extend([
        text_field("status"),
        text_field("admin_comments"),
        text_field("processed_by"),
        typed_field("created_on", Type::INT8),
        typed_field("updated_on", Type::INT8),
        typed_field("approved_on", Type::INT8),
        typed_field("rejected_on", Type::INT8),
        typed_field("total_elements", Type::INT8),
        typed_field("total_pages", Type::INT8),
    ]);
    fields
}

fn stats_schema() -> Vec<FieldInfo> {
    vec![
        text_field("demo_date"),
        typed_field("total", Type::INT8),
        typed_field("pending", Type::INT8),
        typed_field("approved", Type::INT8),
        typed_field("rejected", Type::INT8),
        typed_field("cancelled", Type::INT8),
        typed_field("completed", Type::INT8),
        typed_field("scheduled_on_day", Type::INT8),
    ]
}

/// Result columns for a statement. Parameters may still be unbound, in
/// which case only the target table and `RETURNING` clause are consulted.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let table = match sql::parse_sql(sql) {
        Ok(cmd) => cmd.result_table(),
        Err(_) => sql::returned_table(sql),
    };
    match table {
        Some(ResultTable::Slots) => slot_schema(),
        Some(ResultTable::Bookings) => booking_schema(),
        Some(ResultTable::BookingStats) => stats_schema(),
        None => vec![],
    }
}

fn query_response(
    schema: Arc<Vec<FieldInfo>>,
    rows: Vec<PgWireResult<DataRow>>,
) -> PgWireResult<Response> {
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn slot_rows(slots: Vec<TimeSlot>) -> PgWireResult<Response> {
    let schema = Arc::new(slot_schema());
    let rows = slots
        .into_iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&slot.date().to_string())?;
            encoder.encode_field(&slot.start_time().format("%H:%M").to_string())?;
            encoder.encode_field(&slot.end_time().format("%H:%M").to_string())?;
            encoder.encode_field(&(slot.total_capacity as i32))?;
            encoder.encode_field(&(slot.reserved_count as i32))?;
            encoder.encode_field(&(slot.remaining() as i32))?;
            encoder.encode_field(&slot.available())?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn booking_rows(page: BookingPage) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let total_elements = page.total_elements as i64;
    let total_pages = page.total_pages as i64;
    let rows = page
        .content
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&(b.id as i64))?;
            encoder.encode_field(&b.customer.full_name)?;
            encoder.encode_field(&b.customer.email)?;
            encoder.encode_field(&b.customer.mobile_number)?;
            encoder.encode_field(&b.address.address_line)?;
            encoder.encode_field(&b.address.pincode)?;
            encoder.encode_field(&b.address.city)?;
            encoder.encode_field(&b.address.landmark)?;
            encoder.encode_field(&b.address.state)?;
            encoder.encode_field(&b.product.id)?;
            encoder.encode_field(&b.product.name)?;
            encoder.encode_field(&b.product.brand)?;
            encoder.encode_field(&b.demo_date.to_string())?;
            encoder.encode_field(&b.time_slot.to_string())?;
            encoder.encode_field(&b.status.to_string())?;
            encoder.encode_field(&b.admin_comments)?;
            encoder.encode_field(&b.processed_by.as_ref().map(|a| a.as_str().to_string()))?;
            encoder.encode_field(&b.created_on)?;
            encoder.encode_field(&b.updated_on)?;
            encoder.encode_field(&b.approved_on)?;
            encoder.encode_field(&b.rejected_on)?;
            encoder.encode_field(&total_elements)?;
            encoder.encode_field(&total_pages)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn stats_rows(day: NaiveDate, stats: BookingStats) -> PgWireResult<Response> {
    let schema = Arc::new(stats_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&day.to_string())?;
    for count in [
        stats.total,
        stats.pending,
        stats.approved,
        stats.rejected,
        stats.cancelled,
        stats.completed,
        stats.scheduled_on_day,
    ] {
        encoder.encode_field(&(count as i64))?;
    }
    query_response(schema, vec![Ok(encoder.take_row())])
}

#[async_trait]
impl SimpleQueryHandler for SlotdeskHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.execute_sql(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdeskQueryParser;

#[async_trait]
impl QueryParser for SlotdeskQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotdeskHandler {
    type Statement = String;
    type QueryParser = SlotdeskQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = bind_params(&portal.statement.statement, &portal.parameters);
        self.execute_sql(client, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Replace `$1`, `$2`, ... with the bound values as quoted text literals.
/// The statement is scanned once, so a value that itself contains `$n` is
/// never substituted into. Placeholders with no bound value are left as is.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let bound = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match bound {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
                rest = &after[digits..];
            }
            Some(None) => {
                out.push_str("NULL");
                rest = &after[digits..];
            }
            None => {
                out.push('$');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotdeskFactory {
    handler: Arc<SlotdeskHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotdeskAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotdeskFactory {
    pub fn new(engine: Arc<Engine>, password: String, default_capacity: u32) -> Self {
        let auth_source = SlotdeskAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotdeskHandler::new(engine, default_capacity)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdeskFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    default_capacity: u32,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotdeskFactory::new(engine, password, default_capacity);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::BookingNotFound(_) | EngineError::SlotNotFound(_) => "P0002",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::SlotFull(_) => "53400",
        EngineError::InvalidRange(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

fn internal_err(msg: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "XX000".into(),
        msg,
    )))
}
