use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::JwtConfig;

const ACCESS_TOKEN_TYPE: &str = "access";
const REFRESH_TOKEN_TYPE: &str = "refresh";

/// JWT service for token generation and validation
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_token_expiry_minutes: i64,
    refresh_token_expiry_days: i64,
}

/// Claims for access tokens (short-lived)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Subject (user ID)
    pub sub: String,
    pub role_id: String,
    /// Level of `role_id` at issuance
    pub role_level: i32,
    /// Organization context, absent for sessions without one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    /// Refresh session this token was minted from
    pub sid: String,
    pub typ: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// JWT ID
    pub jti: String,
}

/// Claims for refresh tokens (long-lived)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenClaims {
    /// Subject (user ID)
    pub sub: String,
    /// Session ID (matches database record)
    pub jti: String,
    pub typ: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
}

/// What an access token is issued for.
#[derive(Debug, Clone, Copy)]
pub struct AccessGrant {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub role_level: i32,
    pub org_id: Option<Uuid>,
    pub session_id: Uuid,
}

impl JwtService {
    /// Build an HS256 signer from the configured secret.
    pub fn new(config: &JwtConfig) -> Self {
        let secret = config.secret.expose_secret().as_bytes();
        tracing::info!("JWT service initialized with HS256 key");

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            access_token_expiry_minutes: config.access_token_expiry_minutes,
            refresh_token_expiry_days: config.refresh_token_expiry_days,
        }
    }

    pub fn from_secret(secret: &SecretString, access_minutes: i64, refresh_days: i64) -> Self {
        Self::new(&JwtConfig {
            secret: secret.clone(),
            access_token_expiry_minutes: access_minutes,
            refresh_token_expiry_days: refresh_days,
        })
    }

    /// Generate an access token for a grant
    pub fn generate_access_token(&self, grant: &AccessGrant) -> Result<String, anyhow::Error> {
        let now = Utc::now();
        let exp = now + Duration::minutes(self.access_token_expiry_minutes);

        let claims = AccessTokenClaims {
            sub: grant.user_id.to_string(),
            role_id: grant.role_id.to_string(),
            role_level: grant.role_level,
            org_id: grant.org_id.map(|id| id.to_string()),
            sid: grant.session_id.to_string(),
            typ: ACCESS_TOKEN_TYPE.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode access token: {}", e))
    }

    /// Generate a refresh token bound to a session id
    pub fn generate_refresh_token(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> Result<String, anyhow::Error> {
        let now = Utc::now();
        let exp = now + Duration::days(self.refresh_token_expiry_days);

        let claims = RefreshTokenClaims {
            sub: user_id.to_string(),
            jti: session_id.to_string(),
            typ: REFRESH_TOKEN_TYPE.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode refresh token: {}", e))
    }

    /// Validate and decode an access token
    pub fn validate_access_token(&self, token: &str) -> Result<AccessTokenClaims, anyhow::Error> {
        let token_data = decode::<AccessTokenClaims>(token, &self.decoding_key, &validation())
            .map_err(|e| anyhow::anyhow!("Invalid access token: {}", e))?;

        if token_data.claims.typ != ACCESS_TOKEN_TYPE {
            anyhow::bail!("Invalid access token: wrong token type");
        }
        Ok(token_data.claims)
    }

    /// Validate and decode a refresh token
    pub fn validate_refresh_token(
        &self,
        token: &str,
    ) -> Result<RefreshTokenClaims, anyhow::Error> {
        let token_data = decode::<RefreshTokenClaims>(token, &self.decoding_key, &validation())
            .map_err(|e| anyhow::anyhow!("Invalid refresh token: {}", e))?;

        if token_data.claims.typ != REFRESH_TOKEN_TYPE {
            anyhow::bail!("Invalid refresh token: wrong token type");
        }
        Ok(token_data.claims)
    }

    /// Get access token expiry in seconds (for client info)
    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }

    pub fn refresh_token_expiry_days(&self) -> i64 {
        self.refresh_token_expiry_days
    }
}

fn validation() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.leeway = 0;
    validation
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> JwtService {
        JwtService::from_secret(
            &SecretString::new("test-secret-that-is-at-least-32-bytes-long".to_string()),
            15,
            7,
        )
    }

    fn grant() -> AccessGrant {
        AccessGrant {
            user_id: Uuid::new_v4(),
            role_id: Uuid::new_v4(),
            role_level: 40,
            org_id: Some(Uuid::new_v4()),
            session_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_access_token_generation_and_validation() -> Result<(), anyhow::Error> {
        let service = service();
        let grant = grant();

        let token = service.generate_access_token(&grant)?;
        let claims = service.validate_access_token(&token)?;

        assert_eq!(claims.sub, grant.user_id.to_string());
        assert_eq!(claims.role_id, grant.role_id.to_string());
        assert_eq!(claims.role_level, 40);
        assert_eq!(claims.org_id, grant.org_id.map(|id| id.to_string()));
        assert_eq!(claims.sid, grant.session_id.to_string());
        assert_eq!(claims.exp - claims.iat, 15 * 60);
        Ok(())
    }

    #[test]
    fn test_refresh_token_generation_and_validation() -> Result<(), anyhow::Error> {
        let service = service();
        let user_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();

        let token = service.generate_refresh_token(user_id, session_id)?;
        let claims = service.validate_refresh_token(&token)?;

        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.jti, session_id.to_string());
        Ok(())
    }

    #[test]
    fn test_token_types_are_not_interchangeable() -> Result<(), anyhow::Error> {
        let service = service();
        let access = service.generate_access_token(&grant())?;
        let refresh = service.generate_refresh_token(Uuid::new_v4(), Uuid::new_v4())?;

        assert!(service.validate_refresh_token(&access).is_err());
        assert!(service.validate_access_token(&refresh).is_err());
        Ok(())
    }

    #[test]
    fn test_foreign_signature_is_rejected() -> Result<(), anyhow::Error> {
        let other = JwtService::from_secret(
            &SecretString::new("another-secret-that-is-at-least-32-bytes".to_string()),
            15,
            7,
        );
        let token = other.generate_access_token(&grant())?;
        assert!(service().validate_access_token(&token).is_err());
        Ok(())
    }

    #[test]
    fn test_expired_token_is_rejected() -> Result<(), anyhow::Error> {
        let expired = JwtService::from_secret(
            &SecretString::new("test-secret-that-is-at-least-32-bytes-long".to_string()),
            -5,
            7,
        );
        let token = expired.generate_access_token(&grant())?;
        assert!(service().validate_access_token(&token).is_err());
        Ok(())
    }
}
