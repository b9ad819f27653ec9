use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProxyError;

pub const MAX_MESSAGE_CHARS: usize = 4000;
pub const MAX_TOOL_CHARS: usize = 100;
pub const MAX_CONVERSATION_MESSAGES: usize = 50;

/// 品牌顾问接口的请求体。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsultRequest {
    pub message: String,
    pub tool: Option<String>,
}

/// 视频脚本对话接口的请求体。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptChatRequest {
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

// Loose shapes so that a wrong type or unknown role surfaces as our own message
// instead of a serde error string.
#[derive(Debug, Deserialize)]
struct RawConsult {
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    tool: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawScriptChat {
    #[serde(default)]
    messages: Option<Value>,
}

pub fn parse_consult_request(body: &[u8]) -> Result<ConsultRequest, ProxyError> {
    let raw: RawConsult = parse_object(body)?;

    let message = match raw.message {
        Some(Value::String(message)) => message,
        Some(Value::Null) | None => return Err(invalid("Message is required")),
        Some(_) => return Err(invalid("Message must be a string")),
    };
    check_length("Message", &message, MAX_MESSAGE_CHARS)?;

    let tool = match raw.tool {
        Some(Value::String(tool)) => Some(tool),
        Some(Value::Null) | None => None,
        Some(_) => return Err(invalid("Tool must be a string")),
    };
    if let Some(tool) = tool.as_deref()
        && tool.chars().count() > MAX_TOOL_CHARS
    {
        return Err(invalid(format!(
            "Tool must be at most {MAX_TOOL_CHARS} characters"
        )));
    }

    Ok(ConsultRequest { message, tool })
}

pub fn parse_script_chat_request(body: &[u8]) -> Result<ScriptChatRequest, ProxyError> {
    let raw: RawScriptChat = parse_object(body)?;

    let items = match raw.messages {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => return Err(invalid("Messages are required")),
        Some(_) => return Err(invalid("Messages must be an array")),
    };
    if items.is_empty() {
        return Err(invalid("At least one message is required"));
    }
    if items.len() > MAX_CONVERSATION_MESSAGES {
        return Err(invalid(format!(
            "Too many messages (max {MAX_CONVERSATION_MESSAGES})"
        )));
    }

    let mut messages = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        messages.push(parse_chat_message(index, item)?);
    }

    Ok(ScriptChatRequest { messages })
}

fn parse_chat_message(index: usize, item: Value) -> Result<ChatMessage, ProxyError> {
    let Value::Object(mut fields) = item else {
        return Err(invalid(format!("messages[{index}] must be an object")));
    };

    let role = fields
        .get("role")
        .and_then(Value::as_str)
        .and_then(Role::parse)
        .ok_or_else(|| {
            invalid(format!(
                "messages[{index}].role must be one of user, assistant, system"
            ))
        })?;

    let content = match fields.remove("content") {
        Some(Value::String(content)) => content,
        _ => return Err(invalid(format!("messages[{index}].content must be a string"))),
    };
    check_length(&format!("messages[{index}].content"), &content, MAX_MESSAGE_CHARS)?;

    Ok(ChatMessage { role, content })
}

fn parse_object<T>(body: &[u8]) -> Result<T, ProxyError>
where
    T: for<'de> Deserialize<'de>,
{
    let value: Value =
        serde_json::from_slice(body).map_err(|_| invalid("Request body must be valid JSON"))?;
    if !value.is_object() {
        return Err(invalid("Request body must be a JSON object"));
    }
    serde_json::from_value(value).map_err(|_| invalid("Request body has an unexpected shape"))
}

fn check_length(field: &str, value: &str, max: usize) -> Result<(), ProxyError> {
    let chars = value.chars().count();
    if chars == 0 {
        return Err(invalid(format!("{field} cannot be empty")));
    }
    if chars > max {
        return Err(invalid(format!("{field} must be at most {max} characters")));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> ProxyError {
    ProxyError::Validation(message.into())
}
