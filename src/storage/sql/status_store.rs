//! Unified SQL StatusStore implementation.
//!
//! Uses a macro to generate implementations for each SQL backend,
//! eliminating code duplication while maintaining type safety.

use std::marker::PhantomData;

use chrono::{DateTime, SecondsFormat, Utc};
use sea_query::{
    Expr, InsertStatement, OnConflict, Order, Query, SelectStatement, UpdateStatement,
};
use sqlx::types::Json;
use sqlx::{ColumnIndex, Decode, Row, Type};

use super::SqlDatabase;
use crate::storage::schema::{MessageHistory as History, Messages};
use crate::storage::{Message, MessageHistory, MessageStatus, Result};

/// SQL-based implementation of StatusStore.
///
/// This generic implementation works with any SQL database that implements
/// the `SqlDatabase` trait (PostgreSQL, SQLite).
pub struct SqlStatusStore<DB: SqlDatabase> {
    pool: DB::Pool,
    _marker: PhantomData<DB>,
}

impl<DB: SqlDatabase> SqlStatusStore<DB> {
    /// Create a new SQL status store with the given pool.
    pub fn new(pool: DB::Pool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &DB::Pool {
        &self.pool
    }
}

#[cfg(feature = "postgres")]
impl SqlStatusStore<super::postgres::Postgres> {
    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
impl SqlStatusStore<super::sqlite::Sqlite> {
    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite").run(&self.pool).await?;
        Ok(())
    }
}

/// Row timestamps: RFC3339 UTC with microseconds, so text columns sort correctly.
fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn select_message(idempotency_id: &str) -> SelectStatement {
    Query::select()
        .columns([
            Messages::IdempotencyId,
            Messages::CorrelationId,
            Messages::Status,
            Messages::Payload,
            Messages::CreatedAt,
            Messages::UpdatedAt,
        ])
        .from(Messages::Table)
        .and_where(Expr::col(Messages::IdempotencyId).eq(idempotency_id))
        .to_owned()
}

fn select_history(idempotency_id: &str) -> SelectStatement {
    Query::select()
        .columns([
            History::Id,
            History::IdempotencyId,
            History::CorrelationId,
            History::Status,
            History::ServiceName,
            History::EventId,
            History::ErrorMessage,
            History::CreatedAt,
        ])
        .from(History::Table)
        .and_where(Expr::col(History::IdempotencyId).eq(idempotency_id))
        .order_by(History::CreatedAt, Order::Asc)
        .order_by(History::Id, Order::Asc)
        .to_owned()
}

fn insert_message(
    idempotency_id: &str,
    correlation_id: &str,
    payload_json: String,
    now: &str,
) -> InsertStatement {
    Query::insert()
        .into_table(Messages::Table)
        .columns([
            Messages::IdempotencyId,
            Messages::CorrelationId,
            Messages::Status,
            Messages::Payload,
            Messages::CreatedAt,
            Messages::UpdatedAt,
        ])
        .values_panic([
            idempotency_id.into(),
            correlation_id.into(),
            MessageStatus::Pending.as_str().into(),
            payload_json.into(),
            now.into(),
            now.into(),
        ])
        .on_conflict(
            OnConflict::column(Messages::IdempotencyId)
                .do_nothing()
                .to_owned(),
        )
        .to_owned()
}

fn touch_message(idempotency_id: &str, now: &str) -> UpdateStatement {
    Query::update()
        .table(Messages::Table)
        .value(Messages::UpdatedAt, now)
        .and_where(Expr::col(Messages::IdempotencyId).eq(idempotency_id))
        .to_owned()
}

fn set_status(idempotency_id: &str, status: MessageStatus, now: &str) -> UpdateStatement {
    Query::update()
        .table(Messages::Table)
        .values([
            (Messages::Status, status.as_str().into()),
            (Messages::UpdatedAt, now.into()),
        ])
        .and_where(Expr::col(Messages::IdempotencyId).eq(idempotency_id))
        .to_owned()
}

#[allow(clippy::too_many_arguments)]
fn insert_history(
    idempotency_id: &str,
    correlation_id: &str,
    status: MessageStatus,
    service_name: &str,
    event_id: &str,
    error_message: Option<&str>,
    now: &str,
) -> InsertStatement {
    Query::insert()
        .into_table(History::Table)
        .columns([
            History::IdempotencyId,
            History::CorrelationId,
            History::Status,
            History::ServiceName,
            History::EventId,
            History::ErrorMessage,
            History::CreatedAt,
        ])
        .values_panic([
            idempotency_id.into(),
            correlation_id.into(),
            status.as_str().into(),
            service_name.into(),
            event_id.into(),
            error_message.map(str::to_string).into(),
            now.into(),
        ])
        .to_owned()
}

fn message_from_row<'r, R>(row: &'r R) -> Result<Message>
where
    R: Row,
    &'static str: ColumnIndex<R>,
    String: Decode<'r, R::Database> + Type<R::Database>,
    Json<serde_json::Value>: Decode<'r, R::Database> + Type<R::Database>,
    DateTime<Utc>: Decode<'r, R::Database> + Type<R::Database>,
{
    let status: String = row.try_get("status")?;
    let payload: Json<serde_json::Value> = row.try_get("payload")?;

    Ok(Message {
        idempotency_id: row.try_get("idempotency_id")?,
        correlation_id: row.try_get("correlation_id")?,
        status: status.parse()?,
        payload: payload.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn history_from_row<'r, R>(row: &'r R) -> Result<MessageHistory>
where
    R: Row,
    &'static str: ColumnIndex<R>,
    i64: Decode<'r, R::Database> + Type<R::Database>,
    String: Decode<'r, R::Database> + Type<R::Database>,
    Option<String>: Decode<'r, R::Database> + Type<R::Database>,
    DateTime<Utc>: Decode<'r, R::Database> + Type<R::Database>,
{
    let status: String = row.try_get("status")?;

    Ok(MessageHistory {
        id: row.try_get("id")?,
        idempotency_id: row.try_get("idempotency_id")?,
        correlation_id: row.try_get("correlation_id")?,
        status: status.parse()?,
        service_name: row.try_get("service_name")?,
        event_id: row.try_get("event_id")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Macro to implement StatusStore for a specific SQL backend.
macro_rules! impl_status_store {
    ($db_type:ty, $feature:literal) => {
        #[cfg(feature = $feature)]
        #[async_trait::async_trait]
        impl crate::storage::StatusStore for SqlStatusStore<$db_type> {
            async fn create_or_get(
                &self,
                idempotency_id: &str,
                correlation_id: &str,
                payload: &crate::contract::Payload,
            ) -> Result<crate::storage::CreateOrGet> {
                let payload_json = serde_json::to_string(payload)?;
                let now = timestamp_now();

                // sea-query statements are not Send; render them before awaiting.
                let insert_sql = <$db_type>::build_insert(insert_message(
                    idempotency_id,
                    correlation_id,
                    payload_json,
                    &now,
                ));
                let touch_sql = <$db_type>::build_update(touch_message(idempotency_id, &now));
                let select_sql = <$db_type>::build_select(select_message(idempotency_id));

                let mut tx = self.pool.begin().await?;

                let inserted = sqlx::query(&insert_sql)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
                    == 1;

                if !inserted {
                    sqlx::query(&touch_sql).execute(&mut *tx).await?;
                }

                let row = sqlx::query(&select_sql).fetch_one(&mut *tx).await?;
                let message = message_from_row(&row)?;

                tx.commit().await?;

                Ok(crate::storage::CreateOrGet {
                    message,
                    existed: !inserted,
                })
            }

            async fn update_status(
                &self,
                idempotency_id: &str,
                correlation_id: &str,
                status: crate::storage::MessageStatus,
                service_name: &str,
                event_id: &str,
                error_message: Option<&str>,
            ) -> Result<()> {
                use crate::storage::StorageError;

                let now = timestamp_now();
                let update_sql = <$db_type>::build_update(set_status(idempotency_id, status, &now));
                let history_sql = <$db_type>::build_insert(insert_history(
                    idempotency_id,
                    correlation_id,
                    status,
                    service_name,
                    event_id,
                    error_message,
                    &now,
                ));

                let mut tx = self.pool.begin().await?;

                let updated = sqlx::query(&update_sql)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                if updated == 0 {
                    // Dropping the transaction rolls it back.
                    return Err(StorageError::NotFound(idempotency_id.to_string()));
                }

                sqlx::query(&history_sql)
                    .execute(&mut *tx)
                    .await?;

                tx.commit().await?;
                Ok(())
            }

            async fn get_message(&self, idempotency_id: &str) -> Result<Option<Message>> {
                let sql = <$db_type>::build_select(select_message(idempotency_id));
                let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;

                row.as_ref().map(message_from_row).transpose()
            }

            async fn get_history(&self, idempotency_id: &str) -> Result<Vec<MessageHistory>> {
                let sql = <$db_type>::build_select(select_history(idempotency_id));
                let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

                rows.iter().map(history_from_row).collect()
            }
        }
    };
}

#[cfg(feature = "postgres")]
impl_status_store!(super::postgres::Postgres, "postgres");

#[cfg(feature = "sqlite")]
impl_status_store!(super::sqlite::Sqlite, "sqlite");
