use std::{collections::HashMap, convert::Infallible, net::SocketAddr, time::Duration};

use async_stream::stream;
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::Query,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

const MOCK_TOKEN_PREFIX: &str = "mock-";

#[derive(Deserialize)]
struct CompletionBody {
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    messages: Vec<Value>,
}

// `mock-<user id>` is accepted; anything else is an expired session.
async fn auth_user(headers: HeaderMap) -> Response {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();

    match token.strip_prefix(MOCK_TOKEN_PREFIX) {
        Some(id) if !id.is_empty() => Json(json!({
            "id": id,
            "email": format!("{id}@mock.local"),
        }))
        .into_response(),
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "msg": "invalid JWT" })),
        )
            .into_response(),
    }
}

// `?status=<code>` forces an error reply, mirroring provider failures.
async fn completions(Query(q): Query<HashMap<String, String>>, body: Bytes) -> Response {
    if let Some(status) = q
        .get("status")
        .and_then(|v| v.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .filter(|code| !code.is_success())
    {
        return (status, Json(json!({ "error": { "message": "forced by mock" } }))).into_response();
    }

    let Ok(request) = serde_json::from_slice::<CompletionBody>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let last = request
        .messages
        .iter()
        .rev()
        .find_map(|m| m.get("content").and_then(Value::as_str))
        .unwrap_or_default()
        .to_owned();
    let reply = format!("Mock reply to: {last}");

    if !request.stream {
        return Json(json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": reply },
                "finish_reason": "stop"
            }]
        }))
        .into_response();
    }

    let words: Vec<String> = reply.split_whitespace().map(str::to_owned).collect();
    let events = stream! {
        for word in words {
            let chunk = json!({ "choices": [{ "delta": { "content": format!("{word} ") } }] });
            yield Ok::<_, Infallible>(Bytes::from(format!("data: {chunk}\n\n")));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
    };

    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(events),
    )
        .into_response()
}

async fn legacy_webhook(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    let message = q.get("message").cloned().unwrap_or_default();
    let text = match q.get("tool") {
        Some(tool) => format!("[webhook:{tool}] {message}"),
        None => format!("[webhook] {message}"),
    };
    Json(json!({ "output": text, "response": text }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let app = Router::new()
        .route("/auth/v1/user", get(auth_user))
        .route("/v1/chat/completions", post(completions))
        .route("/webhook", get(legacy_webhook));

    let bind_addr =
        std::env::var("MOCK_UPSTREAM_ADDR").unwrap_or_else(|_| "127.0.0.1:58088".to_string());
    let addr: SocketAddr = bind_addr.parse()?;
    println!("Mock upstream on http://{addr}");
    println!("  AUTH_URL=http://{addr}/auth/v1  (tokens: {MOCK_TOKEN_PREFIX}<user id>)");
    println!("  AI_API_URL=http://{addr}/v1/chat/completions");
    println!("  FALLBACK_WEBHOOK_URL=http://{addr}/webhook");

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
