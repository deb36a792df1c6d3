//! Minimal HTTP/1.1 server: one request per connection, JSON responses, `Connection: close`.

use std::future::Future;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;
const MAX_HEADERS: usize = 32;

/// A parsed request. Path has any query string stripped.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: value.to_string().into_bytes(),
        }
    }

    /// Response with no body (CORS preflight).
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Serialize status line, headers and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason(self.status));
        for (k, v) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", k, v));
        }
        head.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n",
            self.body.len()
        ));
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Error reading a request off the wire.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed request: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("connection closed mid-request")]
    Incomplete,
    #[error("request too large")]
    TooLarge,
    #[error("invalid Content-Length")]
    BadLength,
}

/// Read one request. Ok(None) if the peer closed before sending anything.
pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Request>, HttpError> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let (mut req, header_len, content_length) = loop {
        let n = r.read(&mut chunk).await?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(HttpError::Incomplete)
            };
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(parsed) = parse_head(&buf)? {
            break parsed;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(HttpError::TooLarge);
        }
    };
    if content_length > MAX_BODY_BYTES {
        return Err(HttpError::TooLarge);
    }
    let mut body = buf.split_off(header_len);
    while body.len() < content_length {
        let n = r.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::Incomplete);
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    req.body = body;
    Ok(Some(req))
}

/// Parse the head if complete: (request without body, head length, Content-Length).
fn parse_head(buf: &[u8]) -> Result<Option<(Request, usize, usize)>, HttpError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let header_len = match req.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };
    let method = req.method.unwrap_or("").to_string();
    let raw_path = req.path.unwrap_or("/");
    let path = raw_path.split('?').next().unwrap_or("/").to_string();
    let headers: Vec<(String, String)> = req
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect();
    let content_length = match headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
    {
        Some((_, v)) => v.parse::<usize>().map_err(|_| HttpError::BadLength)?,
        None => 0,
    };
    Ok(Some((
        Request {
            method,
            path,
            headers,
            body: Vec::new(),
        },
        header_len,
        content_length,
    )))
}

/// Accept connections forever, handling each on its own task.
pub async fn serve<H, Fut>(listener: TcpListener, handler: H) -> std::io::Result<()>
where
    H: Fn(Request) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    loop {
        let (stream, addr) = listener.accept().await?;
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, handler).await {
                tracing::debug!(%addr, "http connection error: {}", e);
            }
        });
    }
}

async fn handle_connection<H, Fut>(
    mut stream: TcpStream,
    addr: SocketAddr,
    handler: H,
) -> std::io::Result<()>
where
    H: Fn(Request) -> Fut,
    Fut: Future<Output = Response>,
{
    let response = match read_request(&mut stream).await {
        Ok(Some(req)) => {
            tracing::debug!(%addr, method = %req.method, path = %req.path, "http request");
            handler(req).await
        }
        Ok(None) => return Ok(()),
        Err(HttpError::Io(e)) => return Err(e),
        Err(e) => {
            tracing::warn!(%addr, "bad http request: {}", e);
            let status = if matches!(e, HttpError::TooLarge) { 413 } else { 400 };
            Response::json(status, &chirp_core::protocol::error_envelope(&e.to_string()))
        }
    };
    stream.write_all(&response.to_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}
