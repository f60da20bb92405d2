//! HTTP Server
//!
//! Minimal HTTP/1.1 front end over tokio: one task per connection, JSON in and out.

use crate::error::Result;
use crate::orchestrator::{parse_execute_request, Orchestrator};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REQUEST_BYTES: usize = 1_000_000;

/// Accept connections on `bind_addr` until the listener fails.
pub async fn serve(orchestrator: Orchestrator, bind_addr: &str) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!("Server listening on {}", bind_addr);

    let orchestrator = Arc::new(orchestrator);
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("New connection from: {}", addr);
        tokio::spawn(handle_connection(stream, orchestrator.clone()));
    }
}

async fn handle_connection(mut stream: TcpStream, orchestrator: Arc<Orchestrator>) {
    let mut buffer = Vec::new();
    let mut temp_buf = [0; 8192];

    let read_result = timeout(READ_TIMEOUT, async {
        loop {
            let n = stream.read(&mut temp_buf).await?;
            if n == 0 {
                break;
            }
            buffer.extend_from_slice(&temp_buf[..n]);
            if is_complete(&buffer) || buffer.len() > MAX_REQUEST_BYTES {
                break;
            }
        }
        Ok::<_, std::io::Error>(())
    })
    .await;

    match read_result {
        Err(_) => {
            warn!("Request read timeout");
            return;
        }
        Ok(Err(e)) => {
            warn!("Failed to read from stream: {}", e);
            return;
        }
        Ok(Ok(())) => {}
    }
    if buffer.is_empty() {
        return;
    }

    let request = match String::from_utf8(buffer) {
        Ok(request) => request,
        Err(e) => {
            warn!("Failed to parse request as UTF-8: {}", e);
            let response = create_response(400, &json!({ "error": "Request is not valid UTF-8" }));
            let _ = stream.write_all(response.as_bytes()).await;
            return;
        }
    };

    let (mut reader, mut writer) = stream.split();
    // The client closing its side abandons the in-flight conversion.
    let disconnected = async move {
        let mut scratch = [0u8; 64];
        loop {
            match reader.read(&mut scratch).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    };

    let response = handle_request_until(&orchestrator, &request, disconnected).await;
    if let Err(e) = writer.write_all(response.as_bytes()).await {
        error!("Failed to write response: {}", e);
    }
}

/// Headers received and, when a `Content-Length` is present, the whole body too.
fn is_complete(buffer: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(buffer) else {
        return false;
    };
    let Some(headers_end) = text.find("\r\n\r\n").map(|i| i + 4) else {
        return false;
    };
    match extract_content_length(text) {
        Some(length) => buffer.len() >= headers_end + length,
        None => true,
    }
}

pub fn extract_content_length(request: &str) -> Option<usize> {
    request
        .lines()
        .take_while(|line| !line.is_empty())
        .find(|line| line.to_lowercase().starts_with("content-length:"))
        .and_then(|line| line.split(':').nth(1))
        .and_then(|value| value.trim().parse().ok())
}

pub async fn handle_request(orchestrator: &Orchestrator, request: &str) -> String {
    handle_request_until(orchestrator, request, std::future::pending()).await
}

/// Route one raw HTTP request. `cancel` aborts a conversion in flight.
pub async fn handle_request_until<F>(orchestrator: &Orchestrator, request: &str, cancel: F) -> String
where
    F: Future<Output = ()>,
{
    let Some(request_line) = request.lines().next() else {
        return create_response(400, &json!({ "error": "Bad Request" }));
    };
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return create_response(400, &json!({ "error": "Bad Request" }));
    }

    let method = parts[0];
    let path = parts[1].split('?').next().unwrap_or("/");
    let path = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    debug!("Request: {} {}", method, path);

    let body = request.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("");

    match (method, path) {
        ("OPTIONS", _) => create_response(200, &json!({})),
        ("GET", "/health") | ("GET", "/api/health") => {
            create_response(200, &json!({ "status": "ok", "service": "sqlly" }))
        }
        ("POST", "/api/convert") | ("POST", "/api/mastra/chat") => {
            let body = match parse_body(body) {
                Ok(body) => body,
                Err(response) => return response,
            };
            match orchestrator.handle_until(&body, cancel).await {
                Ok(result) => json_response(200, &result),
                Err(e) => create_response(e.status_code(), &e.to_json()),
            }
        }
        ("POST", "/api/execute") => {
            let body = match parse_body(body) {
                Ok(body) => body,
                Err(response) => return response,
            };
            let request = match parse_execute_request(&body) {
                Ok(request) => request,
                Err(e) => return create_response(e.status_code(), &e.to_json()),
            };
            match orchestrator.execute(&request).await {
                Ok(result) => json_response(200, &result),
                Err(e) => create_response(e.status_code(), &e.to_json()),
            }
        }
        _ => create_response(404, &json!({ "error": format!("Not found: {} {}", method, path) })),
    }
}

fn parse_body(body: &str) -> std::result::Result<Value, String> {
    serde_json::from_str(body).map_err(|e| {
        create_response(400, &json!({ "error": format!("Invalid JSON body: {}", e) }))
    })
}

fn json_response<T: serde::Serialize>(status: u16, value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(body) => create_response(status, &body),
        Err(e) => create_response(500, &json!({ "error": format!("Failed to serialize response: {}", e) })),
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        499 => "Client Closed Request",
        _ => "Internal Server Error",
    }
}

pub fn create_response(status: u16, body: &Value) -> String {
    let body = body.to_string();
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        status,
        status_text(status),
        body.len(),
        body
    )
}
