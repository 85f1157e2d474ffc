use crate::middleware::auth_context::Role;
use crate::models::AppState;
use axum::Router;
use serde::{Deserialize, Deserializer};

pub mod appointment_routes;
pub mod clinic_routes;
pub mod invoice_routes;
pub mod payment_routes;
pub mod service_routes;
pub mod visit_routes;

/// Reception work: booking, billing, taking payments.
pub const FRONT_DESK: &[Role] = &[Role::Admin, Role::Manager, Role::Receptionist];
/// Chairside work: completing appointments, editing visits.
pub const CLINICAL: &[Role] = &[Role::Admin, Role::Manager, Role::Doctor];
pub const SUPERVISORS: &[Role] = &[Role::Admin, Role::Manager];

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/appointments", appointment_routes::router())
        .nest("/api/v1/visits", visit_routes::router())
        .nest("/api/v1/invoices", invoice_routes::router())
        .nest("/api/v1/payments", payment_routes::router())
        .nest("/api/v1/services", service_routes::router())
        .nest("/api/v1", clinic_routes::router())
        .with_state(state)
}

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
pub(crate) fn deserialize_double_option<'de, D, T>(
    deserializer: D,
) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let inner = Option::<T>::deserialize(deserializer)?;
    Ok(Some(inner))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use chrono::{FixedOffset, NaiveTime, Weekday};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::*;
    use crate::engine::calendar::CalendarPolicy;
    use crate::store::MemoryStore;

    fn app() -> Router {
        let policy = CalendarPolicy::new(
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            30,
            Some(Weekday::Fri),
            FixedOffset::east_opt(0).unwrap(),
        )
        .unwrap();
        router(AppState {
            store: Arc::new(MemoryStore::new()),
            policy,
            invoice_number_attempts: 5,
        })
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        role: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(role) = role {
            req = req
                .header("x-staff-id", Uuid::new_v4().to_string())
                .header("x-staff-role", role);
        }
        let req = match body {
            Some(b) => req
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn booking(doctor: Uuid, start_at: &str) -> Value {
        json!({
            "patient_id": Uuid::new_v4(),
            "doctor_id": doctor,
            "start_at": start_at,
            "duration_min": 30,
        })
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/api/v1/clinic", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn unknown_role_is_rejected() {
        let app = app();
        let (status, _) = call(&app, Method::GET, "/api/v1/clinic", Some("janitor"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn clinic_exposes_calendar_policy() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/api/v1/clinic", Some("doctor"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["open"], "09:00");
        assert_eq!(body["data"]["slot_minutes"], 30);
    }

    #[tokio::test]
    async fn double_booking_returns_conflict() {
        let app = app();
        let doctor = Uuid::new_v4();

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/appointments",
            Some("receptionist"),
            Some(booking(doctor, "2026-10-12T10:00:00Z")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let first = body["data"]["appointment_id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/appointments",
            Some("receptionist"),
            Some(booking(doctor, "2026-10-12T10:15:00Z")),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "SCHEDULING_CONFLICT");
        assert_eq!(body["error"]["details"]["conflicting_appointment_id"], first);

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/v1/appointments",
            Some("receptionist"),
            Some(booking(doctor, "2026-10-12T10:30:00Z")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn doctors_cannot_book() {
        let app = app();
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/appointments",
            Some("doctor"),
            Some(booking(Uuid::new_v4(), "2026-10-12T10:00:00Z")),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn slots_skip_booked_time() {
        let app = app();
        let doctor = Uuid::new_v4();
        call(
            &app,
            Method::POST,
            "/api/v1/appointments",
            Some("admin"),
            Some(booking(doctor, "2026-10-12T09:00:00Z")),
        )
        .await;

        let uri = format!("/api/v1/appointments/slots?date=2026-10-12&doctor_id={doctor}");
        let (status, body) = call(&app, Method::GET, &uri, Some("receptionist"), None).await;
        assert_eq!(status, StatusCode::OK);
        let slots = body["data"]["slots"].as_array().unwrap();
        assert_eq!(slots.len(), 15);
        assert!(!slots.iter().any(|s| s.as_str().unwrap().starts_with("2026-10-12T09:00")));
    }

    #[tokio::test]
    async fn invalid_transition_is_conflict() {
        let app = app();
        let (_, body) = call(
            &app,
            Method::POST,
            "/api/v1/appointments",
            Some("receptionist"),
            Some(booking(Uuid::new_v4(), "2026-10-12T11:00:00Z")),
        )
        .await;
        let id = body["data"]["appointment_id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/api/v1/appointments/{id}/cancel"),
            Some("receptionist"),
            Some(json!({ "reason": "patient called" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "CANCELLED");
        assert_eq!(body["data"]["notes"], "[Cancelled] patient called");

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/api/v1/appointments/{id}/confirm"),
            Some("receptionist"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "INVALID_STATE_TRANSITION");
    }

    #[tokio::test]
    async fn visit_to_invoice_to_payment_flow() {
        let app = app();

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/services",
            Some("manager"),
            Some(json!({ "name": "Scaling", "price": "10.000", "default_duration_min": 30 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let service_id = body["data"]["service_id"].as_str().unwrap().to_string();

        let (_, body) = call(
            &app,
            Method::POST,
            "/api/v1/appointments",
            Some("receptionist"),
            Some(json!({
                "patient_id": Uuid::new_v4(),
                "doctor_id": Uuid::new_v4(),
                "service_id": service_id,
                "start_at": "2026-10-12T13:00:00Z",
            })),
        )
        .await;
        assert_eq!(body["data"]["duration_min"], 30);
        let appointment_id = body["data"]["appointment_id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/api/v1/appointments/{appointment_id}/complete"),
            Some("doctor"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["appointment"]["status"], "COMPLETED");
        let visit_id = body["data"]["visit"]["visit_id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            Method::PATCH,
            &format!("/api/v1/visits/{visit_id}"),
            Some("doctor"),
            Some(json!({
                "diagnosis": "calculus",
                "procedures": [
                    { "service_id": service_id },
                    { "service_id": service_id, "tooth": "36" },
                ],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total_amount"], "20.000");

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/api/v1/visits/{visit_id}/complete"),
            Some("doctor"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/api/v1/visits/{visit_id}/invoice"),
            Some("receptionist"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["total_amount"], "20.000");
        assert_eq!(body["data"]["payment_status"], "PENDING");
        let invoice_id = body["data"]["invoice_id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/api/v1/visits/{visit_id}/invoice"),
            Some("receptionist"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "ALREADY_INVOICED");
        assert_eq!(body["error"]["details"]["invoice_id"], invoice_id);

        let payments = format!("/api/v1/invoices/{invoice_id}/payments");
        let (status, body) = call(
            &app,
            Method::POST,
            &payments,
            Some("receptionist"),
            Some(json!({ "amount": "15.000", "method": "CASH" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["invoice"]["payment_status"], "PARTIAL");

        let (status, body) = call(
            &app,
            Method::POST,
            &payments,
            Some("receptionist"),
            Some(json!({ "amount": "6.000", "method": "KNET" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "OVER_PAYMENT");
        assert_eq!(body["error"]["details"]["remaining_balance"], "5.000");

        let (status, body) = call(
            &app,
            Method::POST,
            &payments,
            Some("receptionist"),
            Some(json!({ "amount": "5.000", "method": "KNET" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["invoice"]["payment_status"], "PAID");

        let (status, body) = call(&app, Method::GET, &payments, Some("manager"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["payments"].as_array().unwrap().len(), 2);

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/api/v1/invoices/{invoice_id}/refund"),
            Some("receptionist"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/api/v1/invoices/{invoice_id}/refund"),
            Some("admin"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["payment_status"], "REFUNDED");
    }

    #[tokio::test]
    async fn payment_delete_reopens_balance() {
        let app = app();
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/invoices",
            Some("receptionist"),
            Some(json!({
                "patient_id": Uuid::new_v4(),
                "items": [{ "description": "Consultation", "quantity": 1, "unit_price": "12.500" }],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let invoice_id = body["data"]["invoice_id"].as_str().unwrap().to_string();

        let (_, body) = call(
            &app,
            Method::POST,
            &format!("/api/v1/invoices/{invoice_id}/payments"),
            Some("receptionist"),
            Some(json!({ "amount": "12.500", "method": "CARD" })),
        )
        .await;
        let payment_id = body["data"]["payment"]["payment_id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            Method::DELETE,
            &format!("/api/v1/payments/{payment_id}"),
            Some("receptionist"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["invoice"]["paid_amount"], "0.000");
        assert_eq!(body["data"]["invoice"]["payment_status"], "PENDING");

        let (status, _) = call(
            &app,
            Method::GET,
            &format!("/api/v1/payments/{payment_id}"),
            Some("receptionist"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let app = app();
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/appointments",
            Some("receptionist"),
            Some(json!({ "patient_id": "nope" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }
}
