use crate::config::JwtConfig;
use crate::error::{AppError, AppResult};
use actix_web::http::header::AUTHORIZATION;
use actix_web::HttpRequest;
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity bound to a connection or request once its token is verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthenticatedUser {
    pub id: Uuid,
    pub display_name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, token: &str) -> AppResult<AuthenticatedUser>;
}

/// HS256 bearer tokens signed with the shared secret.
pub struct JwtIdentityProvider {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityProvider {
    pub fn new(cfg: &JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = &cfg.issuer {
            validation.set_issuer(&[issuer]);
        }
        Self {
            key: DecodingKey::from_secret(cfg.secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn authenticate(&self, token: &str) -> AppResult<AuthenticatedUser> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "token rejected");
            AppError::Unauthorized
        })?;
        let claims = data.claims;
        let id = Uuid::parse_str(&claims.sub).map_err(|_| AppError::Unauthorized)?;

        Ok(AuthenticatedUser {
            id,
            display_name: claims.name.unwrap_or_else(|| id.to_string()),
            email: claims.email,
        })
    }
}

/// Bearer token from the `token` query parameter or the Authorization header.
pub fn extract_token(req: &HttpRequest, query_token: Option<&str>) -> Option<String> {
    query_token
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .or_else(|| {
            req.headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
                .map(|s| s.trim().to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, sub: &str, exp_offset: i64, iss: Option<&str>) -> String {
        let claims = Claims {
            sub: sub.into(),
            name: Some("Alice".into()),
            email: Some("alice@example.com".into()),
            exp: chrono::Utc::now().timestamp() + exp_offset,
            iss: iss.map(str::to_string),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn provider(issuer: Option<&str>) -> JwtIdentityProvider {
        JwtIdentityProvider::new(&JwtConfig {
            secret: "s3cret".into(),
            issuer: issuer.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn valid_token_yields_identity() {
        let id = Uuid::new_v4();
        let user = provider(None)
            .authenticate(&token("s3cret", &id.to_string(), 600, None))
            .await
            .unwrap();
        assert_eq!(user.id, id);
        assert_eq!(user.display_name, "Alice");
        assert_eq!(user.email.as_deref(), Some("alice@example.com"));
    }

    #[tokio::test]
    async fn wrong_secret_expired_or_bad_subject_is_unauthorized() {
        let id = Uuid::new_v4().to_string();
        let p = provider(None);
        for t in [
            token("other", &id, 600, None),
            token("s3cret", &id, -600, None),
            token("s3cret", "not-a-uuid", 600, None),
        ] {
            assert_eq!(p.authenticate(&t).await.unwrap_err(), AppError::Unauthorized);
        }
    }

    #[tokio::test]
    async fn issuer_is_enforced_when_configured() {
        let id = Uuid::new_v4().to_string();
        let p = provider(Some("messaging"));
        assert!(p.authenticate(&token("s3cret", &id, 600, Some("messaging"))).await.is_ok());
        assert!(p.authenticate(&token("s3cret", &id, 600, Some("evil"))).await.is_err());
    }

    #[test]
    fn token_prefers_query_then_header() {
        let req = TestRequest::default()
            .insert_header((AUTHORIZATION, "Bearer from-header"))
            .to_http_request();
        assert_eq!(extract_token(&req, Some("from-query")).as_deref(), Some("from-query"));
        assert_eq!(extract_token(&req, None).as_deref(), Some("from-header"));

        let bare = TestRequest::default().to_http_request();
        assert!(extract_token(&bare, None).is_none());
    }
}
