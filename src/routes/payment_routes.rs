// src/routes/payment_routes.rs

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use axum_extra::extract::WithRejection;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use super::invoice_routes::PaymentData;
use super::{FRONT_DESK, deserialize_double_option};
use crate::{
    engine::ledger::{self, PaymentChanges},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, Payment, PaymentMethod},
};

pub fn router() -> Router<AppState> {
    Router::new().route("/{id}", get(get_payment).patch(patch_payment).delete(delete_payment))
}

pub async fn get_payment(
    State(state): State<AppState>,
    _auth: AuthContext,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<ApiOk<Payment>>, ApiError> {
    let payment = state
        .store
        .get_payment(payment_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("NOT_FOUND", "Payment not found".into()))?;
    Ok(Json(ApiOk { data: payment }))
}

#[derive(Debug, Deserialize)]
pub struct PatchPaymentRequest {
    pub amount: Option<Decimal>,
    pub method: Option<PaymentMethod>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub transaction_ref: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub notes: Option<Option<String>>,
}

pub async fn patch_payment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(payment_id): Path<Uuid>,
    WithRejection(Json(req), _): WithRejection<Json<PatchPaymentRequest>, ApiError>,
) -> Result<Json<ApiOk<PaymentData>>, ApiError> {
    auth.require(FRONT_DESK, "correct payments")?;

    let (payment, invoice) = ledger::update_payment(
        state.store.as_ref(),
        payment_id,
        PaymentChanges {
            amount: req.amount,
            method: req.method,
            transaction_ref: req.transaction_ref,
            notes: req.notes,
        },
        Utc::now(),
    )
    .await?;

    Ok(Json(ApiOk {
        data: PaymentData { payment, invoice },
    }))
}

pub async fn delete_payment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<ApiOk<PaymentData>>, ApiError> {
    auth.require(FRONT_DESK, "delete payments")?;
    let (payment, invoice) =
        ledger::delete_payment(state.store.as_ref(), payment_id, Utc::now()).await?;
    Ok(Json(ApiOk {
        data: PaymentData { payment, invoice },
    }))
}
