// src/engine/mod.rs
//
// Scheduling + billing reconciliation engine. Everything in here is
// transport-agnostic: routes translate `EngineError` into HTTP responses.

pub mod calendar;
pub mod conflict;
pub mod invoicing;
pub mod ledger;
pub mod lifecycle;
pub mod slots;
pub mod totals;
pub mod visits;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("doctor {doctor_id} is already booked at {start} (appointment {conflicting_id})")]
    SchedulingConflict {
        doctor_id: Uuid,
        conflicting_id: Uuid,
        start: DateTime<Utc>,
    },

    #[error("cannot {action} a {entity} in state {from}")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        action: &'static str,
    },

    #[error("visit {visit_id} already has invoice {invoice_id}")]
    AlreadyInvoiced { visit_id: Uuid, invoice_id: Uuid },

    /// The visit was edited between reading its procedures and persisting the invoice.
    #[error("visit {visit_id} changed while its invoice was being built")]
    VisitChanged { visit_id: Uuid },

    #[error("{entity} {id} not found")]
    MissingReference { entity: &'static str, id: Uuid },

    #[error("payment of {attempted} exceeds remaining balance {remaining} on invoice {invoice_id}")]
    OverPayment {
        invoice_id: Uuid,
        attempted: Decimal,
        remaining: Decimal,
    },

    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("{field}: {message}")]
    Validation { field: &'static str, message: String },

    /// Raised by stores when an invoice number is taken; the generator retries.
    #[error("invoice number {0} is already taken")]
    DuplicateInvoiceNumber(String),

    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn missing(entity: &'static str, id: Uuid) -> Self {
        EngineError::MissingReference { entity, id }
    }

    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::SchedulingConflict { .. } => "SCHEDULING_CONFLICT",
            EngineError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            EngineError::AlreadyInvoiced { .. } => "ALREADY_INVOICED",
            EngineError::VisitChanged { .. } => "VISIT_CHANGED",
            EngineError::MissingReference { .. } => "NOT_FOUND",
            EngineError::OverPayment { .. } => "OVER_PAYMENT",
            EngineError::DataIntegrity(_) => "DATA_INTEGRITY",
            EngineError::Validation { .. } => "VALIDATION_ERROR",
            EngineError::DuplicateInvoiceNumber(_) | EngineError::Store(_) => "INTERNAL",
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Store(format!("db error: {e}"))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
