use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::SecondsFormat;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::StartupHandler;
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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::error::{BookingError, DomainError, StoreError};
use crate::model::Reservation;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::service::BookingService;
use crate::sql::{self, Command, SqlError};

pub struct BookingHandler {
    service: Arc<BookingService>,
    query_parser: Arc<BookingQueryParser>,
}

impl BookingHandler {
    pub fn new(service: Arc<BookingService>) -> Self {
        Self {
            service,
            query_parser: Arc::new(BookingQueryParser),
        }
    }

    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(booking_err)
    }

    async fn execute_command(&self, cmd: Command) -> Result<Response, BookingError> {
        match cmd {
            Command::CreateReservation {
                resource_id,
                start,
                end,
            } => {
                let reservation = self.service.create(&resource_id, start, end).await?;
                Ok(reservation_rows(vec![reservation]))
            }
            Command::CancelReservation { id } => {
                self.service.cancel(&id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::ListReservations { resource_id } => {
                let reservations = self.service.list(&resource_id).await?;
                Ok(reservation_rows(reservations))
            }
        }
    }
}

fn reservation_schema() -> Vec<FieldInfo> {
    ["id", "resource_id", "start", "end"]
        .into_iter()
        .map(|name| FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text))
        .collect()
}

fn reservation_rows(reservations: Vec<Reservation>) -> Response {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.resource_id)?;
            encoder.encode_field(&r.start().to_rfc3339_opts(SecondsFormat::Millis, true))?;
            encoder.encode_field(&r.end().to_rfc3339_opts(SecondsFormat::Millis, true))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// INSERT and SELECT both answer with reservation rows; DELETE only with a tag.
fn returns_rows(sql: &str) -> bool {
    let head = sql.trim_start().to_uppercase();
    head.starts_with("INSERT") || head.starts_with("SELECT")
}

fn result_schema(sql: &str) -> Vec<FieldInfo> {
    if returns_rows(sql) {
        reservation_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for BookingHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BookingQueryParser;

#[async_trait]
impl QueryParser for BookingQueryParser {
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
impl ExtendedQueryHandler for BookingHandler {
    type Statement = String;
    type QueryParser = BookingQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
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
        self.run(&sql).await
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

/// Walk `sql` once, handing each `$N` placeholder outside a quoted literal
/// to `on_param`. Returns the text with every placeholder replaced by
/// whatever `on_param` yields, or kept verbatim on `None`.
fn scan_placeholders(sql: &str, mut on_param: impl FnMut(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '$') => {
                let mut end = i + 1;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                let replaced = sql[i + 1..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(&mut on_param);
                out.push_str(replaced.as_deref().unwrap_or(&sql[i..end]));
                continue;
            }
            _ => {}
        }
        out.push(c);
    }
    out
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    scan_placeholders(sql, |n| {
        max = max.max(n);
        None
    });
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute_text_params(&portal.statement.statement, &params)
}

/// Single pass, so a bound value that itself contains `$N` is never rescanned.
fn substitute_text_params(sql: &str, params: &[Option<String>]) -> String {
    scan_placeholders(sql, |n| {
        let param = params.get(n.checked_sub(1)?)?;
        Some(match param {
            Some(text) => format!("'{}'", text.replace('\'', "''")),
            None => "NULL".to_string(),
        })
    })
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BookingFactory {
    handler: Arc<BookingHandler>,
    noop: Arc<NoopHandler>,
}

impl BookingFactory {
    pub fn new(service: Arc<BookingService>) -> Self {
        Self {
            handler: Arc::new(BookingHandler::new(service)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BookingFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    service: Arc<BookingService>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, BookingFactory::new(service)).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for a booking failure.
pub fn sqlstate(e: &BookingError) -> &'static str {
    match e {
        BookingError::Domain(d) => match d {
            DomainError::AmbiguousTime { .. } => "22007",
            DomainError::InvalidRange { .. } => "22023",
            DomainError::PastReservation { .. } => "22008",
            DomainError::Conflict { .. } => "23P01",
            DomainError::NotFound(_) => "P0002",
        },
        BookingError::Store(StoreError::Wal(_)) => "58030",
    }
}

/// SQLSTATE for a statement that could not be decoded.
pub fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::BadTimestamp(_) => "22007",
        SqlError::ResourceIdTooLong(_) => "22001",
        SqlError::InvalidResourceId(_) => "22023",
        SqlError::Parse(_)
        | SqlError::Empty
        | SqlError::Unsupported(_)
        | SqlError::UnknownTable(_)
        | SqlError::UnknownColumn(_)
        | SqlError::WrongArity(..)
        | SqlError::MissingColumn(_)
        | SqlError::MissingFilter(_) => "42601",
    }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn booking_err(e: BookingError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;
    use ulid::Ulid;

    #[test]
    fn domain_errors_have_distinct_sqlstates() {
        let t = Timestamp::from_unix_ms(0).unwrap();
        let errors = [
            DomainError::AmbiguousTime {
                field: "start",
                value: t,
            },
            DomainError::InvalidRange {
                start: t,
                end: t,
            },
            DomainError::PastReservation { start: t },
            DomainError::Conflict {
                resource_id: "RoomA".into(),
                existing: Ulid::new(),
            },
            DomainError::NotFound("x".into()),
        ];
        let codes: Vec<&str> = errors
            .into_iter()
            .map(|e| sqlstate(&BookingError::Domain(e)))
            .collect();
        assert_eq!(codes, vec!["22007", "22023", "22008", "23P01", "P0002"]);
    }

    #[test]
    fn store_errors_are_system_errors() {
        let e = BookingError::Store(StoreError::Wal("disk full".into()));
        assert_eq!(sqlstate(&e), "58030");
    }

    #[test]
    fn sql_errors_map_to_syntax_or_data_codes() {
        assert_eq!(sql_sqlstate(&SqlError::Empty), "42601");
        assert_eq!(sql_sqlstate(&SqlError::BadTimestamp("soon".into())), "22007");
        assert_eq!(sql_sqlstate(&SqlError::ResourceIdTooLong(300)), "22001");
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM reservations"), 0);
        assert_eq!(count_params("VALUES ($1, $3, $2)"), 3);
        assert_eq!(count_params("VALUES ($10)"), 10);
    }

    #[test]
    fn substitute_quotes_and_escapes() {
        let sql = "INSERT INTO reservations (resource_id, start, \"end\") VALUES ($1, $2, $3)";
        let out = substitute_text_params(
            sql,
            &[
                Some("O'Hare".into()),
                Some("2099-01-01T10:00:00Z".into()),
                None,
            ],
        );
        assert_eq!(
            out,
            "INSERT INTO reservations (resource_id, start, \"end\") VALUES ('O''Hare', '2099-01-01T10:00:00Z', NULL)"
        );
    }

    #[test]
    fn count_params_ignores_quoted_dollars() {
        assert_eq!(count_params("SELECT * FROM reservations WHERE resource_id = '$9'"), 0);
        assert_eq!(count_params("VALUES ('a$5b', $2)"), 2);
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let sql = "INSERT INTO reservations VALUES ($1, $2, $3)";
        let out = substitute_text_params(
            sql,
            &[Some("x".into()), Some("$1".into()), Some("$3$10".into())],
        );
        assert_eq!(out, "INSERT INTO reservations VALUES ('x', '$1', '$3$10')");
    }

    #[test]
    fn unbound_placeholders_stay_verbatim() {
        let out = substitute_text_params("VALUES ($1, $2, $10)", &[Some("a".into())]);
        assert_eq!(out, "VALUES ('a', $2, $10)");
    }

    #[test]
    fn bound_milliseconds_reach_the_parser() {
        let sql = "INSERT INTO reservations (resource_id, start, \"end\") VALUES ($1, $2, $3)";
        let out = substitute_text_params(
            sql,
            &[
                Some("RoomA".into()),
                Some("4102444800000".into()),
                Some("4102448400000".into()),
            ],
        );
        match sql::parse_sql(&out).unwrap() {
            Command::CreateReservation { start, end, .. } => {
                assert_eq!(start.unix_ms(), Some(4_102_444_800_000));
                assert_eq!(end.unix_ms(), Some(4_102_448_400_000));
            }
            cmd => panic!("expected CreateReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn schema_follows_statement_kind() {
        assert_eq!(result_schema("  insert into reservations values ('a', 1, 2)").len(), 4);
        assert_eq!(result_schema("SELECT * FROM reservations WHERE resource_id = 'a'").len(), 4);
        assert!(result_schema("DELETE FROM reservations WHERE id = 'x'").is_empty());
    }
}
