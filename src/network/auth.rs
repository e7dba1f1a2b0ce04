//! JWT Authentication
//!
//! Players arrive with an HS256 token signed by the account service. The
//! server never issues tokens. `sub` names the account; a `role` of `admin`
//! unlocks the privileged audience.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::network::protocol::ErrorCode;
use crate::store::AccountId;

/// Role claim value that grants privileged access.
pub const ADMIN_ROLE: &str = "admin";

/// Domain separator for account id derivation.
const ACCOUNT_DOMAIN: &[u8] = b"crash-round-account:";

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Shared signing secret.
    pub secret: Option<String>,
    /// Required `iss`, if any.
    pub issuer: Option<String>,
}

impl AuthConfig {
    /// Read `AUTH_SECRET` (or `JWT_SECRET`) and `AUTH_ISSUER`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            secret: lookup("AUTH_SECRET").or_else(|| lookup("JWT_SECRET")),
            issuer: lookup("AUTH_ISSUER"),
        }
    }

    /// True once a secret is set.
    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        validation
    }
}

/// Claims the server reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Account subject.
    pub sub: String,
    /// Expiry (Unix seconds).
    pub exp: u64,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// `admin` for privileged observers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl TokenClaims {
    /// Stable account id: the first 16 bytes of SHA-256 over the subject.
    pub fn account_id(&self) -> AccountId {
        let digest = Sha256::new()
            .chain_update(ACCOUNT_DOMAIN)
            .chain_update(self.sub.as_bytes())
            .finalize();

        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        AccountId::new(id)
    }

    /// True if the token grants privileged access.
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some(ADMIN_ROLE)
    }
}

/// Authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Server has no secret.
    #[error("authentication not configured")]
    NotConfigured,
    /// Past `exp`.
    #[error("token expired")]
    Expired,
    /// Empty `sub`.
    #[error("token has no subject")]
    MissingSubject,
    /// Bad signature, issuer or encoding.
    #[error("invalid token: {0}")]
    Invalid(String),
}

impl AuthError {
    /// Wire error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::NotConfigured => ErrorCode::AuthFailed,
            AuthError::Expired => ErrorCode::TokenExpired,
            AuthError::MissingSubject | AuthError::Invalid(_) => ErrorCode::InvalidToken,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Invalid(err.to_string()),
        }
    }
}

/// Who a connection is, once its token checks out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// Account the connection bets with.
    pub account: AccountId,
    /// May join the privileged audience.
    pub privileged: bool,
}

/// Verify a token and resolve the connection's identity.
pub fn authenticate(token: &str, config: &AuthConfig) -> Result<Identity, AuthError> {
    let secret = config.secret.as_ref().ok_or(AuthError::NotConfigured)?;
    let key = DecodingKey::from_secret(secret.as_bytes());
    let claims = decode::<TokenClaims>(token, &key, &config.validation())?.claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingSubject);
    }

    Ok(Identity {
        account: claims.account_id(),
        privileged: claims.is_admin(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "round-secret";

    fn config() -> AuthConfig {
        AuthConfig {
            secret: Some(SECRET.into()),
            issuer: None,
        }
    }

    fn claims(sub: &str, role: Option<&str>) -> TokenClaims {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        TokenClaims {
            sub: sub.into(),
            exp: now + 600,
            iss: Some("accounts".into()),
            role: role.map(Into::into),
        }
    }

    fn sign(claims: &TokenClaims, secret: &str) -> String {
        encode(&Header::default(), claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn test_player_and_admin_identity() {
        let player = claims("player-7", None);
        let identity = authenticate(&sign(&player, SECRET), &config()).unwrap();
        assert_eq!(identity.account, player.account_id());
        assert!(!identity.privileged);

        let admin = claims("ops", Some(ADMIN_ROLE));
        assert!(authenticate(&sign(&admin, SECRET), &config()).unwrap().privileged);

        // Any other role is an ordinary player
        let other = claims("ops", Some("moderator"));
        assert!(!authenticate(&sign(&other, SECRET), &config()).unwrap().privileged);
    }

    #[test]
    fn test_rejections_map_to_wire_codes() {
        let mut stale = claims("player-7", None);
        stale.exp = 1;
        let err = authenticate(&sign(&stale, SECRET), &config()).unwrap_err();
        assert_eq!(err, AuthError::Expired);
        assert_eq!(err.code(), ErrorCode::TokenExpired);

        let forged = sign(&claims("player-7", None), "other-secret");
        let err = authenticate(&forged, &config()).unwrap_err();
        assert!(matches!(err, AuthError::Invalid(_)));
        assert_eq!(err.code(), ErrorCode::InvalidToken);

        let err = authenticate(&sign(&claims("", None), SECRET), &config()).unwrap_err();
        assert_eq!(err, AuthError::MissingSubject);

        let err = authenticate("not-a-jwt", &config()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidToken);

        let err = authenticate("not-a-jwt", &AuthConfig::default()).unwrap_err();
        assert_eq!(err, AuthError::NotConfigured);
        assert_eq!(err.code(), ErrorCode::AuthFailed);
    }

    #[test]
    fn test_issuer_enforced_when_configured() {
        let token = sign(&claims("player-7", None), SECRET);

        let strict = AuthConfig {
            issuer: Some("accounts".into()),
            ..config()
        };
        assert!(authenticate(&token, &strict).is_ok());

        let elsewhere = AuthConfig {
            issuer: Some("someone-else".into()),
            ..config()
        };
        assert!(matches!(authenticate(&token, &elsewhere), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn test_account_id_is_stable_per_subject() {
        let a = claims("player-7", None);
        let b = claims("player-7", Some(ADMIN_ROLE));
        let c = claims("player-8", None);

        assert_eq!(a.account_id(), b.account_id());
        assert_ne!(a.account_id(), c.account_id());
    }

    #[test]
    fn test_role_optional_on_wire() {
        let claims: TokenClaims = serde_json::from_str(r#"{"sub":"abc","exp":1}"#).unwrap();
        assert_eq!(claims.role, None);
        assert!(!claims.is_admin());
    }

    #[test]
    fn test_config_from_lookup_prefers_auth_secret() {
        let config = AuthConfig::from_lookup(|key| match key {
            "AUTH_SECRET" => Some("primary".into()),
            "JWT_SECRET" => Some("legacy".into()),
            _ => None,
        });
        assert_eq!(config.secret.as_deref(), Some("primary"));

        let legacy = AuthConfig::from_lookup(|key| (key == "JWT_SECRET").then(|| "legacy".to_string()));
        assert_eq!(legacy.secret.as_deref(), Some("legacy"));
        assert!(legacy.is_configured());
        assert!(!AuthConfig::default().is_configured());
    }
}
