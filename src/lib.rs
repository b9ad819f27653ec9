use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;

pub mod auth;
pub mod server;
pub mod upstream;
pub mod usage;
pub mod validation;

pub use auth::{HttpIdentityProvider, IdentityProvider, UserIdentity, bearer_token};
pub use upstream::{
    ByteStream, ConsultReply, DEFAULT_AI_API_URL, DEFAULT_AI_MODEL, Dispatcher, Persona,
    UpstreamConfig,
};
pub use usage::{UsageRecord, UsageStore};
pub use validation::{ChatMessage, ConsultRequest, Role, ScriptChatRequest};

pub const DEFAULT_CONSULTANT_MAX_USAGE: i64 = 2;
pub const DEFAULT_SCRIPT_CHAT_MAX_USAGE: i64 = 100;

/// 两个对外接口。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    BrandConsultant,
    VideoScriptChat,
}

impl Endpoint {
    pub fn name(self) -> &'static str {
        match self {
            Self::BrandConsultant => "brand-consultant",
            Self::VideoScriptChat => "video-script-chat",
        }
    }
}

/// Per-endpoint ceilings on successful calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageLimits {
    pub brand_consultant: i64,
    pub video_script_chat: i64,
}

impl UsageLimits {
    pub fn for_endpoint(&self, endpoint: Endpoint) -> i64 {
        match endpoint {
            Endpoint::BrandConsultant => self.brand_consultant,
            Endpoint::VideoScriptChat => self.video_script_chat,
        }
    }
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            brand_consultant: DEFAULT_CONSULTANT_MAX_USAGE,
            video_script_chat: DEFAULT_SCRIPT_CHAT_MAX_USAGE,
        }
    }
}

/// 鉴权、限额、校验、转发并记录用量的代理核心。
#[derive(Clone)]
pub struct ChatProxy {
    identity: Arc<dyn IdentityProvider>,
    usage: UsageStore,
    dispatcher: Arc<Dispatcher>,
    limits: UsageLimits,
}

impl ChatProxy {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        usage: UsageStore,
        dispatcher: Dispatcher,
        limits: UsageLimits,
    ) -> Self {
        Self {
            identity,
            usage,
            dispatcher: Arc::new(dispatcher),
            limits,
        }
    }

    pub fn usage_store(&self) -> &UsageStore {
        &self.usage
    }

    pub fn limits(&self) -> UsageLimits {
        self.limits
    }

    /// Brand consultant round trip. `authorization` is the raw header value.
    pub async fn consult(
        &self,
        authorization: Option<&str>,
        body: &[u8],
    ) -> Result<ConsultReply, ProxyError> {
        let user = self
            .admit(authorization, Endpoint::BrandConsultant)
            .await?;
        let request = validation::parse_consult_request(body)?;

        let reply = self.dispatcher.consult(&request, &user.id).await?;
        self.record(&user, Endpoint::BrandConsultant).await;
        Ok(reply)
    }

    /// Video script chat. Usage is recorded once the upstream stream is open,
    /// not when it finishes.
    pub async fn stream_script_chat(
        &self,
        authorization: Option<&str>,
        body: &[u8],
    ) -> Result<ByteStream, ProxyError> {
        let user = self
            .admit(authorization, Endpoint::VideoScriptChat)
            .await?;
        let request = validation::parse_script_chat_request(body)?;

        let stream = self
            .dispatcher
            .stream_chat(Persona::VideoScriptWriter, &request.messages, &user.id)
            .await?;
        self.record(&user, Endpoint::VideoScriptChat).await;
        Ok(stream)
    }

    /// Auth gate followed by the usage limiter, in that order.
    async fn admit(
        &self,
        authorization: Option<&str>,
        endpoint: Endpoint,
    ) -> Result<UserIdentity, ProxyError> {
        let token = bearer_token(authorization)?;
        let user = self.identity.resolve(token).await?;

        let used = self.usage.usage_count(&user.id).await?;
        let limit = self.limits.for_endpoint(endpoint);
        if used >= limit {
            tracing::info!(
                endpoint = endpoint.name(),
                user_id = %user.id,
                used,
                limit,
                "usage limit reached"
            );
            return Err(ProxyError::QuotaExceeded { used, limit });
        }

        Ok(user)
    }

    async fn record(&self, user: &UserIdentity, endpoint: Endpoint) {
        match self.usage.record_usage(&user.id).await {
            Ok(record) => tracing::info!(
                endpoint = endpoint.name(),
                user_id = %user.id,
                usage_count = record.usage_count,
                provider = self.dispatcher.kind(),
                "request served"
            ),
            // The upstream already answered; the reply still goes out.
            Err(err) => tracing::error!(
                endpoint = endpoint.name(),
                user_id = %user.id,
                error = %err,
                "failed to record usage"
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("missing authorization header")]
    MissingAuthorization,
    #[error("unauthorized")]
    Unauthorized,
    #[error("usage limit exceeded ({used}/{limit})")]
    QuotaExceeded { used: i64, limit: i64 },
    #[error("{0}")]
    Validation(String),
    #[error("upstream rate limited")]
    UpstreamRateLimited,
    #[error("upstream requires payment")]
    UpstreamPaymentRequired,
    #[error("upstream returned {status}")]
    UpstreamGateway { status: StatusCode },
    #[error("upstream response has no completion text")]
    MissingCompletion,
    #[error("configured provider cannot stream")]
    StreamingUnavailable,
    #[error("no AI provider configured: set an API key or a fallback webhook URL")]
    NoProviderConfigured,
    #[error("identity provider returned {status}")]
    IdentityProvider { status: StatusCode },
    #[error("invalid endpoint '{endpoint}': {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("http error: {0}")]
    Http(reqwest::Error),
    #[error("serialization error: {0}")]
    Serialization(serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticIdentity;

    #[async_trait]
    impl IdentityProvider for StaticIdentity {
        async fn resolve(&self, token: &str) -> Result<UserIdentity, ProxyError> {
            match token {
                "token-a" => Ok(UserIdentity {
                    id: "user-a".to_string(),
                    email: None,
                }),
                _ => Err(ProxyError::Unauthorized),
            }
        }
    }

    async fn proxy_with(
        upstream: &MockServer,
        limits: UsageLimits,
    ) -> (tempfile::TempDir, ChatProxy) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("usage.db");
        let store = UsageStore::open(db.to_str().unwrap()).await.unwrap();
        let dispatcher = Dispatcher::from_config(&UpstreamConfig {
            ai_api_url: upstream.uri(),
            ai_api_key: Some("sk".to_string()),
            ai_model: "m".to_string(),
            ..UpstreamConfig::default()
        })
        .unwrap();
        let proxy = ChatProxy::new(Arc::new(StaticIdentity), store, dispatcher, limits);
        (dir, proxy)
    }

    fn completion(text: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "message": { "content": text } }]
        }))
    }

    #[test]
    fn limits_are_per_endpoint() {
        let limits = UsageLimits::default();
        assert_eq!(limits.for_endpoint(Endpoint::BrandConsultant), 2);
        assert_eq!(limits.for_endpoint(Endpoint::VideoScriptChat), 100);
    }

    #[tokio::test]
    async fn quota_is_checked_before_validation() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(completion("ok"))
            .mount(&upstream)
            .await;
        let limits = UsageLimits {
            brand_consultant: 1,
            video_script_chat: 1,
        };
        let (_dir, proxy) = proxy_with(&upstream, limits).await;

        proxy
            .consult(Some("Bearer token-a"), br#"{"message":"Halo"}"#)
            .await
            .unwrap();

        let err = proxy
            .consult(Some("Bearer token-a"), br#"{"message":""}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::QuotaExceeded { used: 1, limit: 1 }));
        assert_eq!(proxy.usage_store().usage_count("user-a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn auth_is_checked_before_everything() {
        let upstream = MockServer::start().await;
        let (_dir, proxy) = proxy_with(&upstream, UsageLimits::default()).await;

        let err = proxy.consult(None, b"garbage").await.unwrap_err();
        assert!(matches!(err, ProxyError::MissingAuthorization));
        let err = proxy
            .consult(Some("Bearer other"), b"garbage")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Unauthorized));
        assert!(upstream.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_upstream_does_not_consume_quota() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&upstream)
            .await;
        let (_dir, proxy) = proxy_with(&upstream, UsageLimits::default()).await;

        let err = proxy
            .consult(Some("Bearer token-a"), br#"{"message":"Halo"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamGateway { .. }));
        assert_eq!(proxy.usage_store().usage_count("user-a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stream_records_usage_once_opened() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("data: [DONE]\n\n"),
            )
            .mount(&upstream)
            .await;
        let (_dir, proxy) = proxy_with(&upstream, UsageLimits::default()).await;

        let body = br#"{"messages":[{"role":"user","content":"Skrip"}]}"#;
        let stream = proxy
            .stream_script_chat(Some("Bearer token-a"), body)
            .await
            .unwrap();
        // Counted before a single chunk is read.
        assert_eq!(proxy.usage_store().usage_count("user-a").await.unwrap(), 1);

        let chunks: Vec<_> = stream.collect().await;
        assert!(chunks.iter().all(Result::is_ok));
    }
}
