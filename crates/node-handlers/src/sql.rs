use std::str::FromStr;
use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, QueryBuilder};

use common::types::{Document, NodeType};

use crate::error::HandlerError;
use crate::registry::{HandlerContext, NodeHandler};

const TAG: &str = "db_write";

type Map = serde_json::Map<String, Document>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlOp {
    Insert,
    Update,
    Delete,
    Select,
}

impl SqlOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlOp::Insert => "INSERT",
            SqlOp::Update => "UPDATE",
            SqlOp::Delete => "DELETE",
            SqlOp::Select => "SELECT",
        }
    }
}

impl FromStr for SqlOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "INSERT" => Ok(SqlOp::Insert),
            "UPDATE" => Ok(SqlOp::Update),
            "DELETE" => Ok(SqlOp::Delete),
            "SELECT" => Ok(SqlOp::Select),
            other => Err(format!("unsupported operation: {}", other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("invalid statement: {0}")]
    InvalidStatement(String),

    #[error("missing parameter '{0}'")]
    MissingParameter(String),

    #[error("execution failed: {0}")]
    Execution(String),
}

/// One structured statement; column/table names are identifiers, every
/// value is bound.
#[derive(Debug, Clone)]
pub struct StructuredSql {
    pub op: SqlOp,
    pub table: String,
    pub values: Map,
    pub where_: Map,
    pub returning: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SqlOutcome {
    pub rows_affected: u64,
    pub rows: Vec<Document>,
}

/// SQL boundary the db_write handler depends on. One transaction per call;
/// a failed call leaves no partial writes behind.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute_structured(&self, request: &StructuredSql) -> Result<SqlOutcome, SqlError>;

    async fn execute_raw(&self, sql: &str, params: &Map) -> Result<SqlOutcome, SqlError>;
}

fn ident_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static pattern"))
}

fn check_ident(name: &str) -> Result<(), SqlError> {
    if ident_pattern().is_match(name) {
        Ok(())
    } else {
        Err(SqlError::InvalidIdentifier(name.to_string()))
    }
}

fn push_value(qb: &mut QueryBuilder<'_, Postgres>, value: &Document) {
    match value {
        Document::Null => {
            qb.push("NULL");
        }
        Document::Bool(b) => {
            qb.push_bind(*b);
        }
        Document::Number(n) => {
            if let Some(i) = n.as_i64() {
                qb.push_bind(i);
            } else {
                qb.push_bind(n.as_f64().unwrap_or(0.0));
            }
        }
        Document::String(s) => {
            qb.push_bind(s.clone());
        }
        // Arrays and objects go over as jsonb.
        other => {
            qb.push_bind(other.clone());
        }
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Document,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Document::Null => query.bind(None::<serde_json::Value>),
        Document::Bool(b) => query.bind(*b),
        Document::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Document::String(s) => query.bind(s.clone()),
        other => query.bind(other.clone()),
    }
}

fn push_where(qb: &mut QueryBuilder<'_, Postgres>, where_: &Map) -> Result<(), SqlError> {
    qb.push(" WHERE ");
    for (i, (column, value)) in where_.iter().enumerate() {
        check_ident(column)?;
        if i > 0 {
            qb.push(" AND ");
        }
        qb.push(column.as_str());
        if value.is_null() {
            qb.push(" IS NULL");
        } else {
            qb.push(" = ");
            push_value(qb, value);
        }
    }
    Ok(())
}

fn push_returning(qb: &mut QueryBuilder<'_, Postgres>, returning: &[String]) -> Result<(), SqlError> {
    qb.push(" RETURNING jsonb_build_object(");
    for (i, column) in returning.iter().enumerate() {
        check_ident(column)?;
        if i > 0 {
            qb.push(", ");
        }
        qb.push(format!("'{}', {}", column, column));
    }
    qb.push(")");
    Ok(())
}

/// Rewrite `:name` placeholders to positional `$n` binds, collecting the
/// bound values in placeholder order. `::` casts are left alone. Each
/// distinct name binds once and is reused on repeats.
pub(crate) fn rewrite_named_params(sql: &str, params: &Map) -> Result<(String, Vec<Document>), SqlError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"(^|[^:]):([A-Za-z_][A-Za-z0-9_]*)").expect("static pattern"));

    let mut rewritten = String::with_capacity(sql.len());
    let mut values: Vec<Document> = Vec::new();
    let mut indices: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let mut last_end = 0;

    for caps in pattern.captures_iter(sql) {
        let whole = caps.get(0).expect("match");
        let name = &caps[2];
        let value = params
            .get(name)
            .ok_or_else(|| SqlError::MissingParameter(name.to_string()))?;

        let index = *indices.entry(name.to_string()).or_insert_with(|| {
            values.push(value.clone());
            values.len()
        });

        rewritten.push_str(&sql[last_end..whole.start()]);
        rewritten.push_str(&caps[1]);
        rewritten.push_str(&format!("${}", index));
        last_end = whole.end();
    }
    rewritten.push_str(&sql[last_end..]);

    Ok((rewritten, values))
}

fn returns_rows(sql: &str) -> bool {
    let head = sql.trim_start().to_lowercase();
    head.starts_with("select") || head.starts_with("with")
}

/// sqlx/Postgres implementation. Every call runs in its own transaction;
/// dropping the transaction on error rolls it back.
pub struct PostgresSqlExecutor {
    pool: PgPool,
}

impl PostgresSqlExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn build_structured(request: &StructuredSql) -> Result<QueryBuilder<'static, Postgres>, SqlError> {
        check_ident(&request.table)?;
        let mut qb: QueryBuilder<'static, Postgres> = QueryBuilder::new("");

        match request.op {
            SqlOp::Insert => {
                if request.values.is_empty() {
                    return Err(SqlError::InvalidStatement("INSERT requires values".into()));
                }
                qb.push("INSERT INTO ");
                qb.push(request.table.as_str());
                qb.push(" (");
                for (i, column) in request.values.keys().enumerate() {
                    check_ident(column)?;
                    if i > 0 {
                        qb.push(", ");
                    }
                    qb.push(column.as_str());
                }
                qb.push(") VALUES (");
                for (i, value) in request.values.values().enumerate() {
                    if i > 0 {
                        qb.push(", ");
                    }
                    push_value(&mut qb, value);
                }
                qb.push(")");
                if !request.returning.is_empty() {
                    push_returning(&mut qb, &request.returning)?;
                }
            }
            SqlOp::Update => {
                if request.values.is_empty() {
                    return Err(SqlError::InvalidStatement("UPDATE requires values".into()));
                }
                if request.where_.is_empty() {
                    return Err(SqlError::InvalidStatement(
                        "UPDATE requires a where clause".into(),
                    ));
                }
                qb.push("UPDATE ");
                qb.push(request.table.as_str());
                qb.push(" SET ");
                for (i, (column, value)) in request.values.iter().enumerate() {
                    check_ident(column)?;
                    if i > 0 {
                        qb.push(", ");
                    }
                    qb.push(column.as_str());
                    qb.push(" = ");
                    push_value(&mut qb, value);
                }
                push_where(&mut qb, &request.where_)?;
                if !request.returning.is_empty() {
                    push_returning(&mut qb, &request.returning)?;
                }
            }
            SqlOp::Delete => {
                if request.where_.is_empty() {
                    return Err(SqlError::InvalidStatement(
                        "DELETE requires a where clause".into(),
                    ));
                }
                qb.push("DELETE FROM ");
                qb.push(request.table.as_str());
                push_where(&mut qb, &request.where_)?;
                if !request.returning.is_empty() {
                    push_returning(&mut qb, &request.returning)?;
                }
            }
            SqlOp::Select => {
                qb.push("SELECT to_jsonb(q) FROM (SELECT ");
                if request.returning.is_empty() {
                    qb.push("*");
                } else {
                    for (i, column) in request.returning.iter().enumerate() {
                        check_ident(column)?;
                        if i > 0 {
                            qb.push(", ");
                        }
                        qb.push(column.as_str());
                    }
                }
                qb.push(" FROM ");
                qb.push(request.table.as_str());
                if !request.where_.is_empty() {
                    push_where(&mut qb, &request.where_)?;
                }
                qb.push(") q");
            }
        }
        Ok(qb)
    }
}

#[async_trait]
impl SqlExecutor for PostgresSqlExecutor {
    async fn execute_structured(&self, request: &StructuredSql) -> Result<SqlOutcome, SqlError> {
        let mut qb = Self::build_structured(request)?;
        let wants_rows = request.op == SqlOp::Select || !request.returning.is_empty();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SqlError::Execution(e.to_string()))?;

        let outcome = if wants_rows {
            let rows: Vec<Document> = qb
                .build_query_scalar()
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| SqlError::Execution(e.to_string()))?;
            SqlOutcome {
                rows_affected: rows.len() as u64,
                rows,
            }
        } else {
            let result = qb
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| SqlError::Execution(e.to_string()))?;
            SqlOutcome {
                rows_affected: result.rows_affected(),
                rows: Vec::new(),
            }
        };

        tx.commit()
            .await
            .map_err(|e| SqlError::Execution(e.to_string()))?;
        Ok(outcome)
    }

    async fn execute_raw(&self, sql: &str, params: &Map) -> Result<SqlOutcome, SqlError> {
        let (rewritten, values) = rewrite_named_params(sql, params)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SqlError::Execution(e.to_string()))?;

        let outcome = if returns_rows(&rewritten) {
            let wrapped = format!("SELECT to_jsonb(q) FROM ({}) q", rewritten);
            let mut query = sqlx::query_scalar::<Postgres, Document>(&wrapped);
            for value in &values {
                query = match value {
                    Document::Null => query.bind(None::<serde_json::Value>),
                    Document::Bool(b) => query.bind(*b),
                    Document::Number(n) => {
                        if let Some(i) = n.as_i64() {
                            query.bind(i)
                        } else {
                            query.bind(n.as_f64().unwrap_or(0.0))
                        }
                    }
                    Document::String(s) => query.bind(s.clone()),
                    other => query.bind(other.clone()),
                };
            }
            let rows = query
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| SqlError::Execution(e.to_string()))?;
            SqlOutcome {
                rows_affected: rows.len() as u64,
                rows,
            }
        } else {
            let mut query = sqlx::query(&rewritten);
            for value in &values {
                query = bind_value(query, value);
            }
            let result = query
                .execute(&mut *tx)
                .await
                .map_err(|e| SqlError::Execution(e.to_string()))?;
            SqlOutcome {
                rows_affected: result.rows_affected(),
                rows: Vec::new(),
            }
        };

        tx.commit()
            .await
            .map_err(|e| SqlError::Execution(e.to_string()))?;
        Ok(outcome)
    }
}

#[derive(Debug, Deserialize)]
struct DbWriteConfig {
    operation: Option<String>,
    table: Option<String>,
    values: Option<Map>,
    #[serde(rename = "where")]
    where_: Option<Map>,
    returning: Option<Vec<String>>,
    raw_sql: Option<String>,
    params: Option<Map>,
}

enum ParsedStatement {
    Structured(StructuredSql),
    Raw { sql: String, params: Map },
}

/// Runs one structured or raw SQL statement through the injected executor.
pub struct DbWriteHandler {
    executor: Arc<dyn SqlExecutor>,
}

impl DbWriteHandler {
    pub fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        Self { executor }
    }

    fn parse(&self, config: &Document) -> Result<ParsedStatement, HandlerError> {
        let parsed: DbWriteConfig = serde_json::from_value(config.clone())
            .map_err(|e| HandlerError::invalid_config(TAG, e.to_string()))?;

        if let Some(raw_sql) = parsed.raw_sql {
            if raw_sql.trim().is_empty() {
                return Err(HandlerError::invalid_config(TAG, "raw_sql must be non-empty"));
            }
            return Ok(ParsedStatement::Raw {
                sql: raw_sql,
                params: parsed.params.unwrap_or_default(),
            });
        }

        let operation = parsed
            .operation
            .ok_or_else(|| HandlerError::invalid_config(TAG, "operation or raw_sql is required"))?;
        let op = operation
            .parse::<SqlOp>()
            .map_err(|e| HandlerError::invalid_config(TAG, e))?;
        let table = parsed
            .table
            .ok_or_else(|| HandlerError::invalid_config(TAG, "table is required"))?;
        check_ident(&table).map_err(|e| HandlerError::invalid_config(TAG, e.to_string()))?;

        let values = parsed.values.unwrap_or_default();
        let where_ = parsed.where_.unwrap_or_default();
        match op {
            SqlOp::Insert if values.is_empty() => {
                return Err(HandlerError::invalid_config(TAG, "INSERT requires values"));
            }
            SqlOp::Update if values.is_empty() || where_.is_empty() => {
                return Err(HandlerError::invalid_config(
                    TAG,
                    "UPDATE requires values and a where clause",
                ));
            }
            SqlOp::Delete if where_.is_empty() => {
                return Err(HandlerError::invalid_config(TAG, "DELETE requires a where clause"));
            }
            _ => {}
        }

        Ok(ParsedStatement::Structured(StructuredSql {
            op,
            table,
            values,
            where_,
            returning: parsed.returning.unwrap_or_default(),
        }))
    }
}

#[async_trait]
impl NodeHandler for DbWriteHandler {
    fn type_tag(&self) -> NodeType {
        NodeType::DbWrite
    }

    fn validate_config(&self, config: &Document) -> Result<(), HandlerError> {
        self.parse(config).map(|_| ())
    }

    async fn execute(
        &self,
        _ctx: &HandlerContext,
        config: &Document,
        _input: &Document,
    ) -> Result<Document, HandlerError> {
        match self.parse(config)? {
            ParsedStatement::Structured(request) => {
                let outcome = self
                    .executor
                    .execute_structured(&request)
                    .await
                    .map_err(|e| HandlerError::execution(TAG, e))?;

                let returned = match request.op {
                    SqlOp::Select => Some(Document::Array(outcome.rows)),
                    _ => outcome.rows.into_iter().next(),
                };

                let mut output = json!({
                    "operation": request.op.as_str(),
                    "table": request.table,
                    "rows_affected": outcome.rows_affected,
                    "status": "success",
                });
                if let Some(returned) = returned {
                    output["returned"] = returned;
                }
                Ok(output)
            }
            ParsedStatement::Raw { sql, params } => {
                let outcome = self
                    .executor
                    .execute_raw(&sql, &params)
                    .await
                    .map_err(|e| HandlerError::execution(TAG, e))?;

                let mut output = json!({
                    "operation": "raw_sql",
                    "table": Document::Null,
                    "rows_affected": outcome.rows_affected,
                    "status": "success",
                });
                if !outcome.rows.is_empty() {
                    output["returned"] = Document::Array(outcome.rows);
                }
                Ok(output)
            }
        }
    }
}
