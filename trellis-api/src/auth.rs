//! Authentication
//!
//! Two ways into a tenant context:
//! 1. JWT bearer token (issued by `/auth/login`, rotated by `/auth/refresh`)
//! 2. The `X-Tenant-Id` + `X-Actor-Id` header pair (trusted-proxy setups)
//!
//! Token time validation runs against an injected clock so tests are
//! deterministic and broken CI clocks cannot panic the decode path.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use trellis_core::{ActorId, TenantId};

// ============================================================================
// CLOCK ABSTRACTION
// ============================================================================

/// Clock used for token time validation; injected so tests can pin time.
pub trait JwtClock: Send + Sync {
    /// Current time as Unix epoch seconds.
    fn now_epoch_secs(&self) -> i64;
}

/// Production clock using system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl JwtClock for SystemClock {
    fn now_epoch_secs(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Fixed clock for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl JwtClock for FixedClock {
    fn now_epoch_secs(&self) -> i64 {
        self.0
    }
}

// ============================================================================
// JWT SECRET
// ============================================================================

/// Type-safe JWT secret that cannot be logged by accident.
#[derive(Clone)]
pub struct JwtSecret(SecretString);

impl JwtSecret {
    pub fn new(secret: String) -> ApiResult<Self> {
        if secret.is_empty() {
            return Err(ApiError::internal("JWT secret must not be empty"));
        }
        Ok(Self(SecretString::new(secret.into())))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for JwtSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JwtSecret([REDACTED, {} chars])", self.0.expose_secret().len())
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

const INSECURE_DEFAULT_SECRET: &str = "INSECURE_DEFAULT_SECRET_CHANGE_IN_PRODUCTION";

/// Authentication configuration.
#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: JwtSecret,
    pub jwt_algorithm: Algorithm,
    /// Access token lifetime in seconds.
    pub access_expiration_secs: i64,
    /// Refresh token lifetime in seconds.
    pub refresh_expiration_secs: i64,
    /// Tolerance for clock drift between issuer and validator.
    pub clock_skew_secs: i64,
    pub clock: Arc<dyn JwtClock>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &self.jwt_secret)
            .field("jwt_algorithm", &self.jwt_algorithm)
            .field("access_expiration_secs", &self.access_expiration_secs)
            .field("refresh_expiration_secs", &self.refresh_expiration_secs)
            .field("clock_skew_secs", &self.clock_skew_secs)
            .field("clock", &"<JwtClock>")
            .finish()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        let secret = std::env::var("TRELLIS_JWT_SECRET")
            .unwrap_or_else(|_| INSECURE_DEFAULT_SECRET.to_string());
        Self {
            jwt_secret: JwtSecret(SecretString::new(secret.into())),
            jwt_algorithm: Algorithm::HS256,
            access_expiration_secs: 3600,
            refresh_expiration_secs: 7 * 24 * 3600,
            clock_skew_secs: 60,
            clock: Arc::new(SystemClock),
        }
    }
}

impl AuthConfig {
    /// Read from the environment.
    ///
    /// # Environment Variables
    /// - `TRELLIS_JWT_SECRET`: signing secret
    /// - `TRELLIS_JWT_EXPIRATION_SECS`: access lifetime (default: 3600)
    /// - `TRELLIS_JWT_REFRESH_EXPIRATION_SECS`: refresh lifetime (default: 604800)
    /// - `TRELLIS_JWT_CLOCK_SKEW_SECS`: skew tolerance (default: 60)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            access_expiration_secs: std::env::var("TRELLIS_JWT_EXPIRATION_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.access_expiration_secs),
            refresh_expiration_secs: std::env::var("TRELLIS_JWT_REFRESH_EXPIRATION_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.refresh_expiration_secs),
            clock_skew_secs: std::env::var("TRELLIS_JWT_CLOCK_SKEW_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.clock_skew_secs),
            ..defaults
        }
    }
}

// ============================================================================
// CLAIMS & TOKENS
// ============================================================================

/// Token kind discriminator in the `typ` claim.
pub const TOKEN_TYPE_ACCESS: &str = "access";
pub const TOKEN_TYPE_REFRESH: &str = "refresh";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Actor id.
    pub sub: String,
    /// Tenant id.
    pub tid: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub perms: Vec<String>,
    /// "access" or "refresh".
    pub typ: String,
    pub iat: i64,
    pub exp: i64,
}

/// The `/auth/login` and `/auth/refresh` response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

/// Issue an access/refresh pair for a principal.
pub fn issue_token_pair(
    config: &AuthConfig,
    tenant_id: TenantId,
    actor_id: ActorId,
    roles: Vec<String>,
    perms: Vec<String>,
) -> ApiResult<TokenPair> {
    let now = config.clock.now_epoch_secs();
    let encode_one = |typ: &str, lifetime: i64| -> ApiResult<String> {
        let claims = Claims {
            sub: actor_id.to_string(),
            tid: tenant_id.to_string(),
            roles: roles.clone(),
            perms: perms.clone(),
            typ: typ.to_string(),
            iat: now,
            exp: now + lifetime,
        };
        encode(
            &Header::new(config.jwt_algorithm),
            &claims,
            &EncodingKey::from_secret(config.jwt_secret.expose().as_bytes()),
        )
        .map_err(|e| ApiError::internal(format!("token encoding failed: {}", e)))
    };

    Ok(TokenPair {
        access_token: encode_one(TOKEN_TYPE_ACCESS, config.access_expiration_secs)?,
        refresh_token: encode_one(TOKEN_TYPE_REFRESH, config.refresh_expiration_secs)?,
        token_type: "Bearer".to_string(),
        expires_in: config.access_expiration_secs,
    })
}

/// Decode and validate a token. Signature is checked by `jsonwebtoken`;
/// time validation is ours, against the injected clock.
pub fn decode_token(config: &AuthConfig, token: &str) -> ApiResult<Claims> {
    let mut validation = Validation::new(config.jwt_algorithm);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.required_spec_claims.clear();

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.expose().as_bytes()),
        &validation,
    )
    .map_err(|e| ApiError::invalid_token(format!("token rejected: {}", e)))?;

    let now = config.clock.now_epoch_secs();
    if data.claims.exp + config.clock_skew_secs < now {
        return Err(ApiError::invalid_token("token expired"));
    }
    if data.claims.iat - config.clock_skew_secs > now {
        return Err(ApiError::invalid_token("token issued in the future"));
    }
    Ok(data.claims)
}

// ============================================================================
// REQUEST EXTRACTOR
// ============================================================================

/// Authenticated tenant/actor context, extracted from the request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub tenant_id: TenantId,
    pub actor_id: ActorId,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        // Bearer token first
        if let Some(value) = parts.headers.get(axum::http::header::AUTHORIZATION) {
            let value = value
                .to_str()
                .map_err(|_| ApiError::invalid_token("malformed Authorization header"))?;
            let token = value
                .strip_prefix("Bearer ")
                .ok_or_else(|| ApiError::invalid_token("expected a Bearer token"))?;
            let claims = decode_token(&state.auth, token)?;
            if claims.typ != TOKEN_TYPE_ACCESS {
                return Err(ApiError::invalid_token(
                    "refresh tokens cannot authenticate requests",
                ));
            }
            let tenant_id: TenantId = claims
                .tid
                .parse()
                .map_err(|_| ApiError::invalid_token("token carries an invalid tenant id"))?;
            let actor_id: ActorId = claims
                .sub
                .parse()
                .map_err(|_| ApiError::invalid_token("token carries an invalid actor id"))?;
            return Ok(AuthContext {
                tenant_id,
                actor_id,
                roles: claims.roles,
                permissions: claims.perms,
            });
        }

        // Header-pair fallback
        let tenant = parts
            .headers
            .get("x-tenant-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<TenantId>().ok());
        let actor = parts
            .headers
            .get("x-actor-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<ActorId>().ok());
        match (tenant, actor) {
            (Some(tenant_id), Some(actor_id)) => Ok(AuthContext {
                tenant_id,
                actor_id,
                roles: Vec::new(),
                permissions: Vec::new(),
            }),
            _ => Err(ApiError::auth_required(
                "provide a Bearer token or the X-Tenant-Id and X-Actor-Id headers",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use trellis_core::RecordIdType;

    fn test_config(clock: FixedClock) -> AuthConfig {
        AuthConfig {
            jwt_secret: JwtSecret::new("test-secret".to_string()).expect("secret"),
            clock: Arc::new(clock),
            ..AuthConfig::default()
        }
    }

    // 2024-01-01 00:00:00 UTC
    const T0: i64 = 1_704_067_200;

    #[test]
    fn test_token_round_trip() {
        let config = test_config(FixedClock(T0));
        let tenant = TenantId::now_v7();
        let actor = ActorId::now_v7();
        let pair = issue_token_pair(
            &config,
            tenant,
            actor,
            vec!["admin".to_string()],
            vec!["entities:write".to_string()],
        )
        .expect("issue");
        assert_eq!(pair.token_type, "Bearer");

        let claims = decode_token(&config, &pair.access_token).expect("decode");
        assert_eq!(claims.tid, tenant.to_string());
        assert_eq!(claims.sub, actor.to_string());
        assert_eq!(claims.typ, TOKEN_TYPE_ACCESS);
        assert_eq!(claims.roles, vec!["admin"]);

        let refresh = decode_token(&config, &pair.refresh_token).expect("decode refresh");
        assert_eq!(refresh.typ, TOKEN_TYPE_REFRESH);
        assert!(refresh.exp > claims.exp);
    }

    #[test]
    fn test_expired_token_rejected() {
        let issue_config = test_config(FixedClock(T0));
        let pair = issue_token_pair(
            &issue_config,
            TenantId::now_v7(),
            ActorId::now_v7(),
            vec![],
            vec![],
        )
        .expect("issue");

        // Validate two hours later: past the 1h lifetime plus skew.
        let late_config = test_config(FixedClock(T0 + 7200));
        let err = decode_token(&late_config, &pair.access_token).expect_err("should expire");
        assert_eq!(err.code, ErrorCode::InvalidToken);
    }

    #[test]
    fn test_clock_skew_tolerated() {
        let issue_config = test_config(FixedClock(T0));
        let pair = issue_token_pair(
            &issue_config,
            TenantId::now_v7(),
            ActorId::now_v7(),
            vec![],
            vec![],
        )
        .expect("issue");

        // Validator runs 30s behind the issuer; inside the 60s skew.
        let behind = test_config(FixedClock(T0 - 30));
        decode_token(&behind, &pair.access_token).expect("skew tolerated");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let config = test_config(FixedClock(T0));
        let pair = issue_token_pair(
            &config,
            TenantId::now_v7(),
            ActorId::now_v7(),
            vec![],
            vec![],
        )
        .expect("issue");

        let other = AuthConfig {
            jwt_secret: JwtSecret::new("different-secret".to_string()).expect("secret"),
            clock: Arc::new(FixedClock(T0)),
            ..AuthConfig::default()
        };
        assert!(decode_token(&other, &pair.access_token).is_err());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = JwtSecret::new("super-secret-value".to_string()).expect("secret");
        let rendered = format!("{:?}", secret);
        assert!(!rendered.contains("super-secret-value"));
        assert!(rendered.contains("REDACTED"));
    }
}
