use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProxyError;
use crate::validation::{ChatMessage, ConsultRequest, Role};

/// OpenAI 兼容的默认补全端点。
pub const DEFAULT_AI_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_AI_MODEL: &str = "google/gemini-2.5-flash";

const ERROR_BODY_PREVIEW: usize = 512;

/// Upstream body handed to the client chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Provider settings, resolved once at startup.
#[derive(Debug, Clone, Default)]
pub struct UpstreamConfig {
    pub ai_api_url: String,
    pub ai_api_key: Option<String>,
    pub ai_model: String,
    pub http_referer: Option<String>,
    pub title: Option<String>,
    pub fallback_webhook_url: Option<String>,
}

/// The two personas the proxy speaks with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persona {
    BrandConsultant,
    VideoScriptWriter,
}

impl Persona {
    pub fn system_prompt(self) -> &'static str {
        match self {
            Self::BrandConsultant => concat!(
                "You are a senior brand consultant at a digital marketing agency. ",
                "Give practical, specific advice on brand positioning, messaging, visual identity ",
                "and social media strategy for small and growing businesses. ",
                "Keep answers structured and actionable, and reply in the language the client writes in."
            ),
            Self::VideoScriptWriter => concat!(
                "You are a creative video script writer for short-form social media content ",
                "(TikTok, Instagram Reels, YouTube Shorts). Write scripts with a strong hook in the ",
                "first three seconds, clear scene directions, on-screen text and a call to action. ",
                "Reply in the language the client writes in."
            ),
        }
    }
}

/// Successful synchronous reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsultReply {
    /// Completion text from the direct provider.
    Completion(String),
    /// Legacy webhook JSON, passed on untouched.
    Relayed(Value),
}

impl ConsultReply {
    /// Body sent to the client; completion text is duplicated under both keys
    /// because older clients read `output` and newer ones read `response`.
    pub fn into_body(self) -> Value {
        match self {
            Self::Completion(text) => serde_json::json!({
                "output": text,
                "response": text,
            }),
            Self::Relayed(value) => value,
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    user: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: Option<CompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

/// Chat-completion API reached with a bearer key.
#[derive(Debug, Clone)]
pub struct DirectProvider {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    http_referer: Option<String>,
    title: Option<String>,
}

/// Older integration: a GET webhook taking the message as query parameters.
#[derive(Debug, Clone)]
pub struct WebhookProvider {
    client: Client,
    endpoint: Url,
}

/// Provider strategy picked from the configuration at startup.
#[derive(Debug, Clone)]
pub enum Dispatcher {
    Direct(DirectProvider),
    LegacyWebhook(WebhookProvider),
}

impl Dispatcher {
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, ProxyError> {
        let client = Client::new();

        if let Some(api_key) = non_empty(config.ai_api_key.as_deref()) {
            let endpoint = parse_endpoint(&config.ai_api_url)?;
            let model = non_empty(Some(config.ai_model.as_str()))
                .unwrap_or(DEFAULT_AI_MODEL)
                .to_owned();
            return Ok(Self::Direct(DirectProvider {
                client,
                endpoint,
                api_key: api_key.to_owned(),
                model,
                http_referer: non_empty(config.http_referer.as_deref()).map(str::to_owned),
                title: non_empty(config.title.as_deref()).map(str::to_owned),
            }));
        }

        if let Some(webhook) = non_empty(config.fallback_webhook_url.as_deref()) {
            let endpoint = parse_endpoint(webhook)?;
            return Ok(Self::LegacyWebhook(WebhookProvider { client, endpoint }));
        }

        Err(ProxyError::NoProviderConfigured)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::LegacyWebhook(_) => "legacy_webhook",
        }
    }

    /// One synchronous consultation round trip.
    pub async fn consult(
        &self,
        request: &ConsultRequest,
        user_id: &str,
    ) -> Result<ConsultReply, ProxyError> {
        match self {
            Self::Direct(provider) => provider.consult(request, user_id).await,
            Self::LegacyWebhook(provider) => provider.consult(request).await,
        }
    }

    /// Opens a streaming completion; the caller receives the raw upstream body.
    pub async fn stream_chat(
        &self,
        persona: Persona,
        conversation: &[ChatMessage],
        user_id: &str,
    ) -> Result<ByteStream, ProxyError> {
        match self {
            Self::Direct(provider) => provider.stream_chat(persona, conversation, user_id).await,
            Self::LegacyWebhook(_) => Err(ProxyError::StreamingUnavailable),
        }
    }
}

impl DirectProvider {
    async fn consult(
        &self,
        request: &ConsultRequest,
        user_id: &str,
    ) -> Result<ConsultReply, ProxyError> {
        let mut system_prompt = Persona::BrandConsultant.system_prompt().to_owned();
        if let Some(tool) = request.tool.as_deref() {
            system_prompt.push_str("\nFocus area: ");
            system_prompt.push_str(tool);
        }

        let messages = vec![
            ChatMessage::new(Role::System, system_prompt),
            ChatMessage::new(Role::User, request.message.clone()),
        ];

        let response = self.send(messages, false, user_id).await?;
        let body = response.bytes().await.map_err(ProxyError::Http)?;
        let parsed: CompletionResponse =
            serde_json::from_slice(&body).map_err(ProxyError::Serialization)?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .ok_or(ProxyError::MissingCompletion)?;

        Ok(ConsultReply::Completion(text))
    }

    async fn stream_chat(
        &self,
        persona: Persona,
        conversation: &[ChatMessage],
        user_id: &str,
    ) -> Result<ByteStream, ProxyError> {
        let mut messages = Vec::with_capacity(conversation.len() + 1);
        messages.push(ChatMessage::new(Role::System, persona.system_prompt()));
        messages.extend_from_slice(conversation);

        let response = self.send(messages, true, user_id).await?;
        let stream = response
            .bytes_stream()
            .map_err(std::io::Error::other);
        Ok(Box::pin(stream))
    }

    async fn send(
        &self,
        messages: Vec<ChatMessage>,
        stream: bool,
        user_id: &str,
    ) -> Result<reqwest::Response, ProxyError> {
        let payload = CompletionRequest {
            model: &self.model,
            messages,
            stream,
            user: user_id,
        };

        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&payload);
        if let Some(referer) = self.http_referer.as_deref() {
            builder = builder.header("HTTP-Referer", referer);
        }
        if let Some(title) = self.title.as_deref() {
            builder = builder.header("X-Title", title);
        }

        let response = builder.send().await.map_err(ProxyError::Http)?;
        ensure_success(response, "completion").await
    }
}

impl WebhookProvider {
    async fn consult(&self, request: &ConsultRequest) -> Result<ConsultReply, ProxyError> {
        let mut url = self.endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("message", &request.message);
            if let Some(tool) = request.tool.as_deref() {
                pairs.append_pair("tool", tool);
            }
        }

        let response = self.client.get(url).send().await.map_err(ProxyError::Http)?;
        let response = ensure_success(response, "webhook").await?;
        let body = response.bytes().await.map_err(ProxyError::Http)?;
        let value: Value = serde_json::from_slice(&body).map_err(ProxyError::Serialization)?;
        Ok(ConsultReply::Relayed(value))
    }
}

/// Maps a non-2xx upstream answer onto the error taxonomy. The body is only logged.
async fn ensure_success(
    response: reqwest::Response,
    upstream: &'static str,
) -> Result<reqwest::Response, ProxyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::warn!(
        upstream,
        %status,
        body = %preview_body(&body),
        "upstream returned an error status"
    );
    Err(classify_upstream_status(status))
}

pub fn classify_upstream_status(status: StatusCode) -> ProxyError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProxyError::UpstreamRateLimited,
        StatusCode::PAYMENT_REQUIRED => ProxyError::UpstreamPaymentRequired,
        other => ProxyError::UpstreamGateway { status: other },
    }
}

fn preview_body(body: &str) -> &str {
    match body.char_indices().nth(ERROR_BODY_PREVIEW) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, ProxyError> {
    Url::parse(raw).map_err(|source| ProxyError::InvalidEndpoint {
        endpoint: raw.to_owned(),
        source,
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
