//! Stand-in for `php -S` in integration tests
//!
//! Accepts the same arguments as the PHP built-in server:
//! `mock-sandbox -S 0.0.0.0:<port> -t <root> [--serial]`
//!
//! A request for an existing file in the root answers with the file content
//! (minus the `<?php` line) followed by the request body. Request metadata is
//! echoed back in `X-Mock-*` headers. `X-Mock-Status` selects the status code.
//! A script whose first line is `sleep:<ms>` is answered after that delay.
//!
//! With `--serial` connections are served one at a time, as `php -S` does
//! without `PHP_CLI_SERVER_WORKERS`.

use std::env;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    let listen = arg_value(&args, "-S").expect("-S <addr:port> required");
    let root = PathBuf::from(arg_value(&args, "-t").expect("-t <root> required"));
    let serial = args.iter().any(|a| a == "--serial");

    let listener = TcpListener::bind(&listen).await.expect("Failed to bind");
    eprintln!("Mock sandbox: listening on {} serving {} (serial: {})", listen, root.display(), serial);

    loop {
        match listener.accept().await {
            Ok((stream, _)) if serial => {
                handle_connection(stream, &root).await;
            }
            Ok((stream, _)) => {
                let root = root.clone();
                tokio::spawn(async move {
                    handle_connection(stream, &root).await;
                });
            }
            Err(e) => {
                eprintln!("Mock sandbox: accept error: {}", e);
            }
        }
    }
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

async fn handle_connection(mut stream: TcpStream, root: &Path) {
    let mut buf = Vec::new();
    let mut temp = [0u8; 1024];

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
        if buf.len() > 64 * 1024 {
            return;
        }
    };

    let head = match std::str::from_utf8(&buf[..header_end]) {
        Ok(s) => s.to_string(),
        Err(_) => return,
    };

    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or("GET").to_string();
    let target = parts.next().unwrap_or("/").to_string();

    let headers: Vec<(String, String)> = lines
        .take_while(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
        .collect();
    let header = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };

    let content_length: usize = header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = match stream.read(&mut temp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        body.extend_from_slice(&temp[..n]);
    }

    let (path, query) = target.split_once('?').unwrap_or((target.as_str(), ""));
    let file_name = path.trim_start_matches('/');

    let script = if file_name.is_empty() || file_name.contains("..") {
        None
    } else {
        tokio::fs::read_to_string(root.join(file_name)).await.ok()
    };

    let response = match script {
        Some(source) => {
            let status = header("x-mock-status").unwrap_or_else(|| "200".to_string());
            let mut script = source.strip_prefix("<?php").unwrap_or(&source).trim();

            if let Some(rest) = script.strip_prefix("sleep:") {
                let (delay, remainder) = rest.split_once('\n').unwrap_or((rest, ""));
                let delay_ms: u64 = delay.trim().parse().unwrap_or(0);
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                script = remainder.trim();
            }

            let mut payload = script.as_bytes().to_vec();
            payload.extend_from_slice(&body);

            let mut head = format!(
                "HTTP/1.1 {} Mock\r\n\
                 Content-Type: text/plain\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\
                 X-Mock-Method: {}\r\n\
                 X-Mock-Query: {}\r\n\
                 X-Mock-Host: {}\r\n",
                status,
                payload.len(),
                method,
                query,
                header("host").unwrap_or_default(),
            );
            if status.starts_with('3') {
                head.push_str("Location: /elsewhere\r\n");
            }
            head.push_str("\r\n");

            let mut out = head.into_bytes();
            out.extend_from_slice(&payload);
            out
        }
        None => b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\nConnection: close\r\n\r\nNot Found"
            .to_vec(),
    };

    let _ = stream.write_all(&response).await;
}
