//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.
//! The tables themselves are created by the migrations under `migrations/`.

use sea_query::Iden;

/// Messages table schema: one row per idempotency key.
#[derive(Iden)]
pub enum Messages {
    Table,
    #[iden = "idempotency_id"]
    IdempotencyId,
    #[iden = "correlation_id"]
    CorrelationId,
    #[iden = "status"]
    Status,
    #[iden = "payload"]
    Payload,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Append-only status transition log.
#[derive(Iden)]
pub enum MessageHistory {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "idempotency_id"]
    IdempotencyId,
    #[iden = "correlation_id"]
    CorrelationId,
    #[iden = "status"]
    Status,
    #[iden = "service_name"]
    ServiceName,
    #[iden = "event_id"]
    EventId,
    #[iden = "error_message"]
    ErrorMessage,
    #[iden = "created_at"]
    CreatedAt,
}
