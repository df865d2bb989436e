use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::{Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::PetbookAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::{AppointmentInfo, AppointmentStatus};
use crate::notify::Invalidation;
use crate::observability;
use crate::schedule::{day_key, WeeklySchedule};
use crate::sql::{self, Command, SqlError};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";
const TIME_FORMAT: &str = "%H:%M";

/// One `LISTEN business_{id}` of a connection.
struct Subscription {
    channel: String,
    rx: broadcast::Receiver<Invalidation>,
}

/// Query handler for a single connection. Holds that connection's LISTEN state.
pub struct PetbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<PetbookQueryParser>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl PetbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(PetbookQueryParser),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Send pending invalidations to the client as NotificationResponse
    /// messages. Runs after every statement, so a listener sees them on its
    /// next round trip.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let pending = {
            let mut subscriptions = self.subscriptions.lock().await;
            let mut pending = Vec::new();
            for sub in subscriptions.iter_mut() {
                loop {
                    match sub.rx.try_recv() {
                        Ok(invalidation) => pending.push((sub.channel.clone(), invalidation)),
                        Err(TryRecvError::Lagged(n)) => {
                            warn!("{}: dropped {n} notifications", sub.channel);
                        }
                        Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                    }
                }
            }
            pending
        };

        for (channel, invalidation) in pending {
            let payload = serde_json::to_string(&invalidation)
                .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            client
                .send(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(0, channel, payload),
                ))
                .await?;
        }
        Ok(())
    }

    /// Parse, execute, and record query metrics.
    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        debug!("query: {query}");
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertBusiness { id, name } => {
                engine.create_business(id, name).await.map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteBusiness { id } => {
                engine.delete_business(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::InsertSchedule { business_id, schedule } => {
                engine
                    .set_schedule(business_id, schedule)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::InsertAppointment {
                id,
                business_id,
                start,
                duration_minutes,
                label,
            } => {
                engine
                    .book_appointment(
                        id,
                        business_id,
                        start,
                        duration_minutes,
                        AppointmentStatus::Confirmed,
                        label,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::InsertBooking {
                id,
                business_id,
                date,
                time,
                duration_minutes,
                label,
            } => {
                engine
                    .book_public(id, business_id, date, time, duration_minutes, label)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::InsertAppointmentStatus { id, status } => {
                engine.update_status(id, status).await.map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteAppointment { id } => {
                engine.delete_appointment(id).await.map_err(engine_err)?;
                Ok(vec![deleted()])
            }
            Command::SelectSlots {
                business_id,
                date,
                duration_minutes,
            } => {
                let slots = engine
                    .compute_available_slots(business_id, date, duration_minutes)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(slots_schema());
                let bid = business_id.to_string();
                let day = date.to_string();
                let rows = slots
                    .iter()
                    .map(|start| -> PgWireResult<DataRow> {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&bid)?;
                        encoder.encode_field(&day)?;
                        encoder.encode_field(start)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectAppointments { business_id, date } => {
                let appointments = engine
                    .get_appointments(business_id, date)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(appointments_schema());
                let rows = appointments
                    .iter()
                    .map(|a| encode_appointment(&schema, a))
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectSchedule { business_id } => {
                let schedule = engine.get_schedule(business_id).await.map_err(engine_err)?;
                let schema = Arc::new(schedules_schema());
                let rows = match schedule {
                    Some(s) => encode_schedule(&schema, business_id, &s),
                    None => Vec::new(),
                };
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectBusinesses => {
                let now = chrono::Local::now().naive_local();
                let businesses = engine.list_businesses(now).await;
                let schema = Arc::new(businesses_schema());
                let rows = businesses
                    .iter()
                    .map(|b| -> PgWireResult<DataRow> {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.name)?;
                        encoder.encode_field(&b.configured)?;
                        encoder.encode_field(&b.open_now)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::Listen { channel } => {
                let business_id = channel_business(&channel)?;
                let mut subscriptions = self.subscriptions.lock().await;
                if !subscriptions.iter().any(|s| s.channel == channel) {
                    let rx = engine.notify.subscribe(business_id);
                    subscriptions.push(Subscription { channel, rx });
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                let mut subscriptions = self.subscriptions.lock().await;
                match channel {
                    Some(channel) => subscriptions.retain(|s| s.channel != channel),
                    None => subscriptions.clear(),
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

/// Business id named by a `business_{id}` channel.
fn channel_business(channel: &str) -> PgWireResult<Ulid> {
    let id = channel.strip_prefix("business_").ok_or_else(|| {
        user_error("42000", format!("invalid channel: {channel} (expected business_{{id}})"))
    })?;
    Ulid::from_string(id).map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_appointment(schema: &Arc<Vec<FieldInfo>>, a: &AppointmentInfo) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&a.id.to_string())?;
    encoder.encode_field(&a.business_id.to_string())?;
    encoder.encode_field(&a.start.format(TIMESTAMP_FORMAT).to_string())?;
    encoder.encode_field(&a.end.format(TIMESTAMP_FORMAT).to_string())?;
    encoder.encode_field(&a.status.as_str())?;
    encoder.encode_field(&a.label)?;
    Ok(encoder.take_row())
}

/// One row per weekday, Monday first. Closed days have NULL hours.
fn encode_schedule(
    schema: &Arc<Vec<FieldInfo>>,
    business_id: Ulid,
    schedule: &WeeklySchedule,
) -> Vec<PgWireResult<DataRow>> {
    let bid = business_id.to_string();
    schedule
        .iter()
        .map(|(day, window)| -> PgWireResult<DataRow> {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&bid)?;
            encoder.encode_field(&day_key(day))?;
            encoder.encode_field(&window.map(|w| w.open.format(TIME_FORMAT).to_string()))?;
            encoder.encode_field(&window.map(|w| w.close.format(TIME_FORMAT).to_string()))?;
            Ok(encoder.take_row())
        })
        .collect()
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![text_field("business_id"), text_field("date"), text_field("start")]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("business_id"),
        text_field("start"),
        text_field("end"),
        text_field("status"),
        text_field("label"),
    ]
}

fn schedules_schema() -> Vec<FieldInfo> {
    vec![
        text_field("business_id"),
        text_field("day"),
        text_field("open"),
        text_field("close"),
    ]
}

fn businesses_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        FieldInfo::new("configured".into(), None, None, Type::BOOL, FieldFormat::Text),
        FieldInfo::new("open_now".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

/// Result columns for a statement, judged from its text alone so it works
/// before parameters are bound.
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    let mut words = upper.split_whitespace();
    if words.next() != Some("SELECT") {
        return vec![];
    }
    let table = words
        .skip_while(|w| *w != "FROM")
        .nth(1)
        .map(|t| t.trim_end_matches(';').to_lowercase());
    match table.as_deref() {
        Some("slots") => slots_schema(),
        Some("appointments") => appointments_schema(),
        Some("schedules") => schedules_schema(),
        Some("businesses") => businesses_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for PetbookHandler {
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
        let result = self.run(query).await;
        self.deliver_notifications(client).await?;
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct PetbookQueryParser;

#[async_trait]
impl QueryParser for PetbookQueryParser {
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
impl ExtendedQueryHandler for PetbookHandler {
    type Statement = String;
    type QueryParser = PetbookQueryParser;

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
        let sql = substitute_params(portal);
        let result = self.run(&sql).await;
        self.deliver_notifications(client).await?;
        let mut responses = result?;
        responses
            .pop()
            .ok_or_else(|| user_error("XX000", "statement produced no response".into()))
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

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if let Ok(n) = sql[start..end].parse::<usize>() {
            max = max.max(n);
        }
        i = end.max(start);
    }
    max
}

/// Inline bound text parameters as quoted literals. Highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

/// Built per connection, so each connection gets its own handler.
pub struct PetbookFactory {
    handler: Arc<PetbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<PetbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl PetbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(PetbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                PetbookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for PetbookFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = PetbookFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error("P0001", e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
