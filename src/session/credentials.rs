use anyhow::{Context, Result};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Token validity for join credentials
const TOKEN_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Display name the relay joins under
const DISPLAY_NAME: &str = "Noise Enhancement Relay";

/// Permissions requested when joining a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrants {
    pub room_join: bool,
    pub room: String,
    pub can_publish: bool,
    pub can_subscribe: bool,
    /// Keep the relay out of participant lists
    pub hidden: bool,
}

impl SessionGrants {
    /// Grants the relay needs: join, subscribe, publish, hidden
    pub fn relay(session: &str) -> Self {
        Self {
            room_join: true,
            room: session.to_string(),
            can_publish: true,
            can_subscribe: true,
            hidden: true,
        }
    }
}

/// Opaque join credential
#[derive(Clone)]
pub struct Credential {
    pub identity: String,
    pub token: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("token", &"<redacted>")
            .finish()
    }
}

pub trait CredentialIssuer: Send + Sync {
    fn issue(&self, identity: &str, session: &str, grants: &SessionGrants) -> Result<Credential>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinClaims {
    pub iss: String,
    pub sub: String,
    pub name: String,
    pub nbf: i64,
    pub exp: i64,
    pub video: SessionGrants,
}

/// Issues HS256 access tokens signed with the API secret
pub struct JwtIssuer {
    api_key: String,
    encoding_key: EncodingKey,
}

impl JwtIssuer {
    pub fn new(api_key: &str, api_secret: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            encoding_key: EncodingKey::from_secret(api_secret.as_bytes()),
        }
    }
}

impl CredentialIssuer for JwtIssuer {
    fn issue(&self, identity: &str, session: &str, grants: &SessionGrants) -> Result<Credential> {
        let now = chrono::Utc::now().timestamp();
        let claims = JoinClaims {
            iss: self.api_key.clone(),
            sub: identity.to_string(),
            name: DISPLAY_NAME.to_string(),
            nbf: now,
            exp: now + TOKEN_TTL.as_secs() as i64,
            video: grants.clone(),
        };

        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .with_context(|| format!("Failed to sign join token for session {}", session))?;

        Ok(Credential {
            identity: identity.to_string(),
            token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};

    #[test]
    fn test_token_carries_relay_grants() {
        let issuer = JwtIssuer::new("api-key", "api-secret");
        let grants = SessionGrants::relay("r1");

        let credential = issuer.issue("deepfilter-agent-r1", "r1", &grants).unwrap();
        assert_eq!(credential.identity, "deepfilter-agent-r1");

        let decoded = jsonwebtoken::decode::<JoinClaims>(
            &credential.token,
            &DecodingKey::from_secret(b"api-secret"),
            &Validation::new(Algorithm::HS256),
        )
        .unwrap();

        assert_eq!(decoded.claims.iss, "api-key");
        assert_eq!(decoded.claims.sub, "deepfilter-agent-r1");
        assert_eq!(decoded.claims.video, grants);
        assert!(decoded.claims.video.hidden);
    }

    #[test]
    fn test_wrong_secret_fails_validation() {
        let issuer = JwtIssuer::new("api-key", "api-secret");
        let credential = issuer
            .issue("agent", "r1", &SessionGrants::relay("r1"))
            .unwrap();

        let result = jsonwebtoken::decode::<JoinClaims>(
            &credential.token,
            &DecodingKey::from_secret(b"other"),
            &Validation::new(Algorithm::HS256),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let credential = Credential {
            identity: "agent".to_string(),
            token: "secret-token".to_string(),
        };
        assert!(!format!("{:?}", credential).contains("secret-token"));
    }
}
