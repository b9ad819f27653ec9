use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;

use crate::ProxyError;

/// 身份服务返回的调用者信息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
    pub email: Option<String>,
}

/// Exchanges a session token for the identity behind it.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<UserIdentity, ProxyError>;
}

#[derive(Debug, Deserialize)]
struct RawUser {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

/// Identity provider reached over HTTP at `{auth_url}/user`.
#[derive(Debug, Clone)]
pub struct HttpIdentityProvider {
    client: Client,
    user_endpoint: Url,
    api_key: Option<String>,
}

impl HttpIdentityProvider {
    pub fn new(auth_url: &str, api_key: Option<String>) -> Result<Self, ProxyError> {
        let mut user_endpoint =
            Url::parse(auth_url).map_err(|source| ProxyError::InvalidEndpoint {
                endpoint: auth_url.to_owned(),
                source,
            })?;

        // Url::join would drop the last path segment without the trailing slash.
        let base_path = user_endpoint.path().trim_end_matches('/').to_owned();
        user_endpoint.set_path(&format!("{base_path}/user"));

        Ok(Self {
            client: Client::new(),
            user_endpoint,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn user_endpoint(&self) -> &Url {
        &self.user_endpoint
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn resolve(&self, token: &str) -> Result<UserIdentity, ProxyError> {
        let mut builder = self
            .client
            .get(self.user_endpoint.clone())
            .bearer_auth(token);
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.header("apikey", key);
        }

        let response = builder.send().await.map_err(ProxyError::Http)?;
        let status = response.status();

        if status.is_client_error() {
            tracing::debug!(%status, "identity provider rejected session token");
            return Err(ProxyError::Unauthorized);
        }
        if !status.is_success() {
            return Err(ProxyError::IdentityProvider { status });
        }

        let raw: RawUser = response.json().await.map_err(ProxyError::Http)?;
        match raw.id {
            Some(id) if !id.is_empty() => Ok(UserIdentity {
                id,
                email: raw.email,
            }),
            _ => Err(ProxyError::Unauthorized),
        }
    }
}

/// Pulls the token out of an `Authorization: Bearer <token>` header value.
///
/// An absent or blank header is reported as missing; anything else that is not
/// a bearer credential is treated like a bad token.
pub fn bearer_token(header: Option<&str>) -> Result<&str, ProxyError> {
    let raw = header
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ProxyError::MissingAuthorization)?;
    let (scheme, token) = raw.split_once(' ').ok_or(ProxyError::Unauthorized)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(ProxyError::Unauthorized);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(ProxyError::Unauthorized);
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn bearer_token_requires_scheme_and_value() {
        assert_eq!(bearer_token(Some("Bearer abc")).unwrap(), "abc");
        assert_eq!(bearer_token(Some("bearer   abc  ")).unwrap(), "abc");
        assert!(matches!(
            bearer_token(None),
            Err(ProxyError::MissingAuthorization)
        ));
        assert!(matches!(
            bearer_token(Some("   ")),
            Err(ProxyError::MissingAuthorization)
        ));
        assert!(matches!(
            bearer_token(Some("Bearer ")),
            Err(ProxyError::Unauthorized)
        ));
        assert!(matches!(
            bearer_token(Some("Basic dXNlcjpwYXNz")),
            Err(ProxyError::Unauthorized)
        ));
        assert!(matches!(
            bearer_token(Some("abc")),
            Err(ProxyError::Unauthorized)
        ));
    }

    #[test]
    fn user_endpoint_appends_segment() {
        let provider = HttpIdentityProvider::new("https://auth.example.com/auth/v1/", None).unwrap();
        assert_eq!(
            provider.user_endpoint().as_str(),
            "https://auth.example.com/auth/v1/user"
        );
        let provider = HttpIdentityProvider::new("https://auth.example.com/auth/v1", None).unwrap();
        assert_eq!(
            provider.user_endpoint().as_str(),
            "https://auth.example.com/auth/v1/user"
        );
    }

    #[tokio::test]
    async fn resolve_returns_identity_for_valid_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .and(header("authorization", "Bearer good-token"))
            .and(header("apikey", "anon"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "user-1",
                "email": "owner@example.com"
            })))
            .mount(&server)
            .await;

        let provider = HttpIdentityProvider::new(
            &format!("{}/auth/v1", server.uri()),
            Some("anon".to_string()),
        )
        .unwrap();
        let identity = provider.resolve("good-token").await.unwrap();
        assert_eq!(identity.id, "user-1");
        assert_eq!(identity.email.as_deref(), Some("owner@example.com"));
    }

    #[tokio::test]
    async fn resolve_maps_client_errors_to_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "msg": "invalid JWT"
            })))
            .mount(&server)
            .await;

        let provider =
            HttpIdentityProvider::new(&format!("{}/auth/v1", server.uri()), None).unwrap();
        let err = provider.resolve("expired").await.unwrap_err();
        assert!(matches!(err, ProxyError::Unauthorized));
    }

    #[tokio::test]
    async fn resolve_reports_provider_outage_separately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider =
            HttpIdentityProvider::new(&format!("{}/auth/v1", server.uri()), None).unwrap();
        let err = provider.resolve("token").await.unwrap_err();
        assert!(matches!(err, ProxyError::IdentityProvider { .. }));
    }

    #[tokio::test]
    async fn resolve_rejects_body_without_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let provider =
            HttpIdentityProvider::new(&format!("{}/auth/v1", server.uri()), None).unwrap();
        let err = provider.resolve("token").await.unwrap_err();
        assert!(matches!(err, ProxyError::Unauthorized));
    }
}
