//! Minimal demonstration server
//!
//! Thin glue around the runtime: a TCP accept loop feeding the worker pool,
//! and a handler that splits the request line, fills the context, and emits
//! a small page. Real deployments replace this file wholesale; the runtime
//! crates are the product.

use std::io::Read;
use std::net::TcpListener;
use std::process::ExitCode;

use quay::{Abort, Context, FailureKind, RequestResult, WorkerPool};
use tracing::{debug, error, info};

const DEFAULT_PORT: u16 = 8080;
const MAX_HEAD_BYTES: usize = 8192;

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let workers: usize = match args.next().map(|a| a.parse()) {
        Some(Ok(n)) if n > 0 => n,
        Some(_) => {
            error!("invalid thread count");
            return ExitCode::FAILURE;
        }
        None => std::thread::available_parallelism().map_or(4, |n| n.get()),
    };
    let port: u16 = match args.next().map(|a| a.parse()) {
        Some(Ok(p)) => p,
        Some(_) => {
            error!("invalid port");
            return ExitCode::FAILURE;
        }
        None => DEFAULT_PORT,
    };

    let listener = match TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => l,
        Err(e) => {
            error!("listener bind failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(port, workers, "listening");

    let pool = WorkerPool::new(workers, handle_connection);

    for stream in listener.incoming() {
        match stream {
            Ok(conn) => {
                pool.dispatch(conn);
            }
            Err(e) => {
                error!("accept failed: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}

/// Parse one request off the wire and render the demo page.
fn handle_connection(ctx: &mut Context, conn: &mut std::net::TcpStream) -> RequestResult<()> {
    let head = read_request_head(conn)?;
    let (path, headers) = parse_request_head(&head)?;

    ctx.begin(&path)?;
    ctx.set_request_headers(headers);
    ctx.activate()?;

    ctx.set_header("Content-Type", "text/html");
    ctx.write("<html><body>");
    ctx.write(&format!("<h1>quay</h1><p>serving {}</p>", ctx.path().unwrap_or("/")));
    ctx.write("</body></html>");

    let stats = ctx.memstats();
    debug!(pages = stats.pages, live_bytes = stats.live_bytes, "request memory");
    Ok(())
}

/// Read until the blank line ending the request head.
fn read_request_head(conn: &mut std::net::TcpStream) -> RequestResult<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = conn.read(&mut chunk)?;
        if n == 0 {
            return Err(Abort::Disconnect);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(Abort::Client("request head too large".to_string()));
        }
    }
    String::from_utf8(buf).map_err(|_| Abort::Client("request head is not UTF-8".to_string()))
}

/// Split the GET line and the header block.
fn parse_request_head(head: &str) -> RequestResult<(String, Vec<(String, String)>)> {
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| Abort::Client("empty request".to_string()))?;

    let mut parts = request_line.split(' ');
    let method = parts
        .next()
        .ok_or_else(|| Abort::Client("no method in request line".to_string()))?;
    if method != "GET" {
        return Err(Abort::with_kind(
            FailureKind::Client,
            format!("unsupported method {}", method),
        ));
    }
    let path = parts
        .next()
        .ok_or_else(|| Abort::Client("no path in request line".to_string()))?
        .to_string();

    let headers = lines
        .take_while(|l| !l.is_empty())
        .filter_map(|l| {
            let (name, value) = l.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();
    Ok((path, headers))
}
