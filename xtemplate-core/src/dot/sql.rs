//! `sql` dot provider: a lazy, per-request transaction over a shared `sqlx`
//! pool. Feature-gated (`sql`) as an optional crate split, recorded in
//! DESIGN.md.
//!
//! `minijinja::value::Object::call_method` is synchronous, so every method
//! here bridges into the `sqlx` async API via `Handle::block_on`. That is
//! only sound because the streaming/buffered handlers execute templates
//! inside `tokio::task::spawn_blocking` (see `handlers.rs`), never on a
//! runtime worker thread.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use minijinja::value::{Object, Value};
use minijinja::{Error, ErrorKind, State};
use sqlx::sqlite::SqlitePool;
use sqlx::{Column, Row, TypeInfo};
use tokio::sync::Mutex as AsyncMutex;

use super::{DotProvider, ProviderContext, ProviderError};
use crate::config::ConfigMap;

pub struct SqlProviderFactory;

pub struct SqlProvider {
    pool: SqlitePool,
}

impl SqlProvider {
    /// Builds the provider from a `url` setting; the connection pool itself
    /// connects lazily, and transactions begin on first statement.
    pub fn from_settings(field: &str, settings: &ConfigMap) -> Result<Self, crate::error::ConfigError> {
        let url = settings.require_str(field, "url")?;
        let pool = SqlitePool::connect_lazy(&url)
            .map_err(|_| crate::error::ConfigError::MissingSetting { field: field.to_string(), key: "url".to_string() })?;
        Ok(Self { pool })
    }
}

impl DotProvider for SqlProvider {
    fn value<'a>(&'a self, _ctx: &'a ProviderContext<'a>) -> BoxFuture<'a, Result<Value, ProviderError>> {
        let pool = self.pool.clone();
        Box::pin(async move { Ok(Value::from_object(SqlSession::new(pool))) })
    }

    fn needs_cleanup(&self) -> bool {
        true
    }

    fn cleanup<'a>(
        &'a self,
        value: Value,
        error: Option<super::ExecError>,
    ) -> BoxFuture<'a, Option<super::ExecError>> {
        Box::pin(async move {
            let Some(session) = value.downcast_object::<SqlSession>() else { return error };
            let outcome = if error.is_none() { session.commit().await } else { session.rollback().await };
            if let Err(e) = outcome {
                return Some(error.unwrap_or_else(|| super::ExecError(e.to_string())));
            }
            error
        })
    }
}

/// Per-request transaction handle. Begins on first statement (`Exec`,
/// `QueryRows`, `QueryRow`, `QueryVal`); `Commit`/`Rollback` are also exposed
/// directly for manual control.
#[derive(Debug)]
struct SqlSession {
    pool: SqlitePool,
    tx: AsyncMutex<Option<sqlx::Transaction<'static, sqlx::Sqlite>>>,
}

impl SqlSession {
    fn new(pool: SqlitePool) -> Self {
        Self { pool, tx: AsyncMutex::new(None) }
    }

    async fn ensure_begun(&self) -> Result<(), sqlx::Error> {
        let mut guard = self.tx.lock().await;
        if guard.is_none() {
            *guard = Some(self.pool.begin().await?);
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), sqlx::Error> {
        if let Some(tx) = self.tx.lock().await.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), sqlx::Error> {
        if let Some(tx) = self.tx.lock().await.take() {
            tx.rollback().await?;
        }
        Ok(())
    }

    async fn exec(&self, sql: &str, args: &[Value]) -> Result<u64, sqlx::Error> {
        self.ensure_begun().await?;
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().unwrap();
        let mut query = sqlx::query(sql);
        for arg in args {
            query = bind_value(query, arg);
        }
        let result = query.execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }

    async fn query_rows(&self, sql: &str, args: &[Value]) -> Result<Vec<BTreeMap<String, Value>>, sqlx::Error> {
        self.ensure_begun().await?;
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().unwrap();
        let mut query = sqlx::query(sql);
        for arg in args {
            query = bind_value(query, arg);
        }
        let rows = query.fetch_all(&mut **tx).await?;
        Ok(rows.iter().map(row_to_map).collect())
    }
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &Value,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    if let Ok(i) = i64::try_from(value.clone()) {
        query.bind(i)
    } else if let Some(s) = value.as_str() {
        query.bind(s.to_string())
    } else if let Ok(f) = f64::try_from(value.clone()) {
        query.bind(f)
    } else {
        query.bind(value.to_string())
    }
}

fn row_to_map(row: &sqlx::sqlite::SqliteRow) -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "INTEGER" | "BIGINT" => row.try_get::<i64, _>(idx).map(Value::from).unwrap_or(Value::UNDEFINED),
            "REAL" | "FLOAT" | "DOUBLE" => row.try_get::<f64, _>(idx).map(Value::from).unwrap_or(Value::UNDEFINED),
            _ => row.try_get::<String, _>(idx).map(Value::from).unwrap_or(Value::UNDEFINED),
        };
        map.insert(column.name().to_string(), value);
    }
    map
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(fut))
}

fn sql_error(err: sqlx::Error) -> Error {
    Error::new(ErrorKind::InvalidOperation, err.to_string())
}

impl Object for SqlSession {
    fn call_method(
        self: &Arc<Self>,
        _state: &State,
        method: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        let sql = args
            .first()
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_default();
        let rest: Vec<Value> = args.iter().skip(1).cloned().collect();
        match method {
            "Exec" => {
                let affected = block_on(self.exec(&sql, &rest)).map_err(sql_error)?;
                Ok(Value::from(affected))
            }
            "QueryRows" => {
                let rows = block_on(self.query_rows(&sql, &rest)).map_err(sql_error)?;
                let values: Vec<Value> = rows.iter().map(Value::from_serialize).collect();
                Ok(Value::from(values))
            }
            "QueryRow" => {
                let mut rows = block_on(self.query_rows(&sql, &rest)).map_err(sql_error)?;
                if rows.len() != 1 {
                    return Err(Error::new(ErrorKind::InvalidOperation, format!("QueryRow: expected 1 row, got {}", rows.len())));
                }
                Ok(Value::from_serialize(&rows.remove(0)))
            }
            "QueryVal" => {
                let mut rows = block_on(self.query_rows(&sql, &rest)).map_err(sql_error)?;
                if rows.len() != 1 {
                    return Err(Error::new(ErrorKind::InvalidOperation, format!("QueryVal: expected 1 row, got {}", rows.len())));
                }
                let row = rows.remove(0);
                if row.len() != 1 {
                    return Err(Error::new(ErrorKind::InvalidOperation, format!("QueryVal: expected 1 column, got {}", row.len())));
                }
                Ok(row.into_values().next().unwrap())
            }
            "Commit" => {
                block_on(self.commit()).map_err(sql_error)?;
                Ok(Value::from(()))
            }
            "Rollback" => {
                block_on(self.rollback()).map_err(sql_error)?;
                Ok(Value::from(()))
            }
            other => Err(Error::new(ErrorKind::UnknownMethod, format!("sql has no method {other:?}"))),
        }
    }
}

impl crate::dot::DotProviderFactory for SqlProviderFactory {
    fn build(&self, field_name: &str, settings: &ConfigMap) -> Result<Arc<dyn DotProvider>, crate::error::BuildError> {
        Ok(Arc::new(SqlProvider::from_settings(field_name, settings)?))
    }
}
