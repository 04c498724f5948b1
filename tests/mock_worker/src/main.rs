//! Mock worker for integration testing
//!
//! Environment variables:
//! - PORT: Port to listen on (required, set by the supervisor)
//! - WORKER_ID: Slot id, echoed in responses (set by the supervisor)
//! - STARTUP_DELAY_MS: Delay before accepting connections (default: 0)
//! - SLOW_MS: How long `/slow` waits before answering (default: 2000)
//!
//! Routes:
//! - `/health`: 200 "ok"
//! - `/echo`: 200 with the request body, or "echo response" when empty
//! - `/headers`: request headers as a JSON object
//! - `/crash`: exits the process without answering
//! - `/slow`: answers after SLOW_MS
//! - `/error`: 500
//! - anything else: "Hello from worker N"

use std::env;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::main]
async fn main() {
    let port: u16 = env::var("PORT")
        .expect("PORT environment variable required")
        .parse()
        .expect("PORT must be a valid port number");

    let worker_id = env::var("WORKER_ID").unwrap_or_else(|_| "0".to_string());

    let startup_delay: u64 = env::var("STARTUP_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let slow_ms: u64 = env::var("SLOW_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2000);

    if startup_delay > 0 {
        eprintln!("Mock worker {}: sleeping for {}ms before starting", worker_id, startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind");

    eprintln!("Mock worker {}: listening on port {}", worker_id, port);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let worker_id = worker_id.clone();
                tokio::spawn(async move {
                    handle_connection(stream, &worker_id, slow_ms).await;
                });
            }
            Err(e) => {
                eprintln!("Mock worker {}: accept error: {}", worker_id, e);
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, worker_id: &str, slow_ms: u64) {
    let mut buf = Vec::new();
    let mut temp = [0u8; 4096];

    // Read HTTP request headers
    let header_end = loop {
        let n = match stream.read(&mut temp).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => return,
        };
        buf.extend_from_slice(&temp[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 16384 {
            return;
        }
    };

    let head = match std::str::from_utf8(&buf[..header_end]) {
        Ok(s) => s.to_string(),
        Err(_) => return,
    };

    let mut lines = head.lines();
    let request_line = match lines.next() {
        Some(l) => l,
        None => return,
    };

    let parts: Vec<&str> = request_line.split(' ').collect();
    let (method, target) = if parts.len() >= 2 {
        (parts[0], parts[1])
    } else {
        ("GET", "/")
    };
    let path = target.split('?').next().unwrap_or("/");

    eprintln!("Mock worker {}: {} {}", worker_id, method, target);

    let headers: Vec<(String, String)> = lines
        .take_while(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(name, value)| (name.trim().to_lowercase(), value.trim().to_string()))
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = match stream.read(&mut temp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        body.extend_from_slice(&temp[..n]);
    }

    let (status, content_type, response_body) = match path {
        "/health" => ("200 OK", "text/plain", "ok".to_string()),
        "/echo" => {
            let text = if body.is_empty() {
                "echo response".to_string()
            } else {
                String::from_utf8_lossy(&body).into_owned()
            };
            ("200 OK", "text/plain", text)
        }
        "/headers" => {
            let fields: Vec<String> = headers
                .iter()
                .map(|(name, value)| format!("\"{}\":\"{}\"", name, value.replace('"', "\\\"")))
                .collect();
            ("200 OK", "application/json", format!("{{{}}}", fields.join(",")))
        }
        "/crash" => {
            eprintln!("Mock worker {}: crashing on request", worker_id);
            std::process::exit(1);
        }
        "/slow" => {
            tokio::time::sleep(Duration::from_millis(slow_ms)).await;
            ("200 OK", "text/plain", "slow response".to_string())
        }
        "/error" => ("500 Internal Server Error", "text/plain", "error".to_string()),
        _ => ("200 OK", "text/plain", format!("Hello from worker {}", worker_id)),
    };

    let response = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         X-Worker-Id: {}\r\n\
         \r\n\
         {}",
        status,
        content_type,
        response_body.len(),
        worker_id,
        response_body
    );

    let _ = stream.write_all(response.as_bytes()).await;
}
