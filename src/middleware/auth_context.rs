// Caller identity. Authentication happens upstream; the gateway forwards
// the staff id and role as headers and this extractor only validates them.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue};
use axum_extra::TypedHeader;
use headers::Header;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::AppState;

static X_STAFF_ID: HeaderName = HeaderName::from_static("x-staff-id");
static X_STAFF_ROLE: HeaderName = HeaderName::from_static("x-staff-role");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Manager,
    Doctor,
    Receptionist,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "manager" => Some(Role::Manager),
            "doctor" => Some(Role::Doctor),
            "receptionist" => Some(Role::Receptionist),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Doctor => "doctor",
            Role::Receptionist => "receptionist",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StaffId(pub Uuid);

impl Header for StaffId {
    fn name() -> &'static HeaderName {
        &X_STAFF_ID
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let raw = values
            .next()
            .and_then(|v| v.to_str().ok())
            .ok_or_else(headers::Error::invalid)?;
        Uuid::parse_str(raw.trim())
            .map(StaffId)
            .map_err(|_| headers::Error::invalid())
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(v) = HeaderValue::from_str(&self.0.to_string()) {
            values.extend(std::iter::once(v));
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StaffRole(pub Role);

impl Header for StaffRole {
    fn name() -> &'static HeaderName {
        &X_STAFF_ROLE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        values
            .next()
            .and_then(|v| v.to_str().ok())
            .and_then(Role::parse)
            .map(StaffRole)
            .ok_or_else(headers::Error::invalid)
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        values.extend(std::iter::once(HeaderValue::from_static(self.0.as_str())));
    }
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub staff_id: Uuid,
    pub role: Role,
}

impl AuthContext {
    pub fn has_role(&self, allowed: &[Role]) -> bool {
        allowed.contains(&self.role)
    }

    pub fn require(&self, allowed: &[Role], what: &str) -> Result<(), ApiError> {
        if self.has_role(allowed) {
            return Ok(());
        }
        let names: Vec<&str> = allowed.iter().map(|r| r.as_str()).collect();
        tracing::warn!(staff_id = %self.staff_id, role = self.role.as_str(), what, "forbidden");
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            format!("Only {} can {what}", names.join("/")),
        ))
    }
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            let TypedHeader(StaffId(staff_id)) =
                TypedHeader::<StaffId>::from_request_parts(parts, state)
                    .await
                    .map_err(|e| {
                        if e.is_missing() {
                            ApiError::missing_identity()
                        } else {
                            ApiError::Unauthorized(
                                "INVALID_IDENTITY",
                                "X-Staff-Id must be a UUID".into(),
                            )
                        }
                    })?;

            let TypedHeader(StaffRole(role)) =
                TypedHeader::<StaffRole>::from_request_parts(parts, state)
                    .await
                    .map_err(|e| {
                        if e.is_missing() {
                            ApiError::missing_identity()
                        } else {
                            ApiError::Unauthorized(
                                "INVALID_IDENTITY",
                                "X-Staff-Role must be admin, manager, doctor or receptionist".into(),
                            )
                        }
                    })?;

            Ok(AuthContext { staff_id, role })
        }
    }
}
