//! Session validation for the external auth service.
//!
//! Login, refresh, and session issuance live in a separate service. This
//! module only verifies the signed session token it mints (carried in the
//! `session` cookie or an `Authorization: Bearer` header) and exposes the
//! caller's identity to handlers.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::extract::CookieJar;
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AppError, AppResult},
    state::AppState,
};

pub const SESSION_COOKIE: &str = "session";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: i64,
    pub org_id: i64,
    pub role: String,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: i64,
    pub org_id: i64,
    pub role: String,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }

    /// Rejects requests addressing a tenant other than the caller's own.
    pub fn require_org(&self, org_id: i64) -> AppResult<()> {
        if self.org_id == org_id {
            Ok(())
        } else {
            Err(AppError::forbidden())
        }
    }
}

pub fn verify_session(secret: &str, token: &str) -> AppResult<Identity> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|_| AppError::unauthorized())?;

    Ok(Identity {
        user_id: data.claims.sub,
        org_id: data.claims.org_id,
        role: data.claims.role,
    })
}

#[async_trait]
impl FromRequestParts<AppState> for Identity {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_request_parts(parts, state)
            .await
            .map_err(|_| AppError::unauthorized())?;

        if let Some(cookie) = jar.get(SESSION_COOKIE) {
            return verify_session(&state.config.session_secret, cookie.value());
        }

        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthorized())?;

        verify_session(&state.config.session_secret, bearer.token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn mint(secret: &str, claims: &SessionClaims) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn accepts_valid_session() {
        let claims = SessionClaims {
            sub: 12,
            org_id: 7,
            role: "member".into(),
            exp: chrono::Utc::now().timestamp() + 600,
        };
        let token = mint("secret", &claims);
        let identity = verify_session("secret", &token).unwrap();
        assert_eq!(identity.user_id, 12);
        assert_eq!(identity.org_id, 7);
    }

    #[test]
    fn rejects_wrong_secret() {
        let claims = SessionClaims {
            sub: 12,
            org_id: 7,
            role: "member".into(),
            exp: chrono::Utc::now().timestamp() + 600,
        };
        let token = mint("secret", &claims);
        assert!(verify_session("other", &token).is_err());
    }

    #[test]
    fn cross_tenant_check_is_forbidden() {
        let identity = Identity {
            user_id: 1,
            org_id: 7,
            role: "member".into(),
        };
        assert!(identity.require_org(7).is_ok());
        let err = identity.require_org(8).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::FORBIDDEN);
    }
}
