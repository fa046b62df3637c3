//! In-process HTTP(S) client.
//!
//! Assembles its own TCP + optional TLS + HTTP/1.1 exchange instead of
//! using a high-level client so every phase can be timed separately:
//! resolve, connect, handshake, first byte, download. Bodies are capped at
//! [`DOWNLOAD_LIMIT`] decoded bytes and decompressed according to
//! Content-Encoding on the fly.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_rustls::TlsConnector;

use rustls::pki_types::ServerName;

use common::{HttpProtocol, HttpResult, HttpTimings, IpVersion, ResultStatus, TlsDetail};

use crate::net::resolver::{resolve_target, ResolveError};
use crate::net::tls_detail;
use crate::safety::PRIVATE_IP_ERROR;

/// Whole-request wall clock budget.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Decoded body cap in bytes.
pub const DOWNLOAD_LIMIT: usize = 10_000;

const USER_AGENT: &str = concat!("netpulse-probe/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub target: String,
    pub protocol: HttpProtocol,
    pub port: u16,
    pub method: String,
    pub path: String,
    pub query: String,
    pub host_header: Option<String>,
    pub user_headers: Vec<(String, String)>,
    pub resolver: Option<String>,
    pub ip_version: IpVersion,
}

/// One progress emission: headers appear only on the first chunk, later
/// chunks carry body fragments verbatim (append-mode semantics).
#[derive(Debug, Clone)]
pub struct HttpProgressChunk {
    pub raw_headers: String,
    pub raw_body: String,
    pub raw_output: String,
}

#[derive(Debug)]
enum Fail {
    Timeout,
    Msg(String),
}

impl From<ResolveError> for Fail {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::PrivateOnly => Fail::Msg(PRIVATE_IP_ERROR.to_string()),
            other => Fail::Msg(other.to_string()),
        }
    }
}

trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ReadWrite for T {}

/// Execute one request. Never returns an error: every failure mode becomes
/// a failed [`HttpResult`].
pub async fn execute<F>(config: &HttpClientConfig, on_progress: &mut F) -> HttpResult
where
    F: FnMut(HttpProgressChunk),
{
    let started = Instant::now();
    let deadline = started + REQUEST_TIMEOUT;
    match pipeline(config, started, deadline, on_progress).await {
        Ok(result) => result,
        Err(Fail::Timeout) => HttpResult::failed("Request timeout."),
        Err(Fail::Msg(message)) => HttpResult::failed(message),
    }
}

async fn pipeline<F>(
    config: &HttpClientConfig,
    started: Instant,
    deadline: Instant,
    on_progress: &mut F,
) -> Result<HttpResult, Fail>
where
    F: FnMut(HttpProgressChunk),
{
    // Phase 1: resolve
    let resolved = timeout_at(
        deadline,
        resolve_target(
            &config.target,
            config.ip_version,
            config.resolver.as_deref(),
        ),
    )
    .await
    .map_err(|_| Fail::Timeout)??;
    let address = resolved.address;
    let dns_ms = started.elapsed().as_millis() as u64;

    // Phase 2: TCP connect, family pinned by the resolved address
    let tcp_started = Instant::now();
    let tcp = timeout_at(
        deadline,
        TcpStream::connect(SocketAddr::new(address, config.port)),
    )
    .await
    .map_err(|_| Fail::Timeout)?
    .map_err(|e| Fail::Msg(format!("Connection error: {}", e)))?;
    let tcp_ms = tcp_started.elapsed().as_millis() as u64;

    // Phase 3: optional TLS
    let tls_started = Instant::now();
    let (mut stream, tls_ms, tls): (Box<dyn ReadWrite>, Option<u64>, Option<TlsDetail>) =
        match config.protocol {
            HttpProtocol::Http => (Box::new(tcp), None, None),
            HttpProtocol::Https | HttpProtocol::Http2 => {
                let alpn = match config.protocol {
                    HttpProtocol::Http2 => vec![b"h2".to_vec()],
                    _ => vec![b"http/1.1".to_vec()],
                };
                let tls_config = tls_detail::permissive_client_config(alpn);
                let connector = TlsConnector::from(Arc::new(tls_config));
                let server_name = ServerName::try_from(config.target.clone())
                    .map_err(|e| Fail::Msg(format!("Invalid server name: {}", e)))?;
                let tls_stream = timeout_at(
                    deadline,
                    connector.connect(server_name.clone(), tcp),
                )
                .await
                .map_err(|_| Fail::Timeout)?
                .map_err(|e| Fail::Msg(format!("TLS error: {}", e)))?;
                let tls_ms = tls_started.elapsed().as_millis() as u64;

                let (_, conn) = tls_stream.get_ref();
                if config.protocol == HttpProtocol::Http2
                    && conn.alpn_protocol() != Some(b"h2".as_slice())
                {
                    return Err(Fail::Msg(
                        "HTTP/2 is not supported by the server.".to_string(),
                    ));
                }
                let certs = conn.peer_certificates().unwrap_or_default();
                let authorized = tls_detail::chain_is_authorized(certs, &server_name);
                let detail = certs.first().and_then(|leaf| {
                    tls_detail::extract_detail(
                        leaf.as_ref(),
                        authorized,
                        tls_detail::protocol_name(conn.protocol_version()),
                        tls_detail::cipher_name(conn.negotiated_cipher_suite()),
                    )
                });
                (Box::new(tls_stream), Some(tls_ms), detail)
            }
        };

    // Phase 4: request. firstByte counts from here, so the write itself is
    // part of the first-byte wait.
    let pre_request = Instant::now();
    let request = build_request(config);
    timeout_at(deadline, stream.write_all(request.as_bytes()))
        .await
        .map_err(|_| Fail::Timeout)?
        .map_err(|e| Fail::Msg(format!("Write error: {}", e)))?;

    // Phase 5-8: response
    let mut buf = [0u8; 8 * 1024];
    let mut head_buf: Vec<u8> = Vec::new();
    let mut head: Option<ResponseHead> = None;
    let mut first_byte_at: Option<Instant> = None;
    let mut chunked: Option<ChunkedDecoder> = None;
    let mut decompressor = Decompressor::Identity;
    let mut body: Vec<u8> = Vec::new();
    let mut truncated = false;

    loop {
        let n = timeout_at(deadline, stream.read(&mut buf))
            .await
            .map_err(|_| Fail::Timeout)?
            .map_err(|e| Fail::Msg(format!("Read error: {}", e)))?;
        if n == 0 {
            break;
        }
        if first_byte_at.is_none() {
            first_byte_at = Some(Instant::now());
        }
        let data = &buf[..n];

        if head.is_none() {
            head_buf.extend_from_slice(data);
            let Some(end) = find_subslice(&head_buf, b"\r\n\r\n") else {
                continue;
            };
            let parsed = parse_head(&head_buf[..end + 4])?;
            let leftover = head_buf[end + 4..].to_vec();
            chunked = parsed
                .headers
                .get("transfer-encoding")
                .filter(|v| v.to_ascii_lowercase().contains("chunked"))
                .map(|_| ChunkedDecoder::new());
            decompressor =
                Decompressor::for_encoding(parsed.headers.get("content-encoding").map(|s| s.as_str()));

            let decoded = decode_body(&leftover, &mut chunked, &mut decompressor);
            let appended = append_capped(&mut body, &decoded, &mut truncated);
            let chunk_text = String::from_utf8_lossy(&appended).to_string();
            on_progress(HttpProgressChunk {
                raw_headers: parsed.raw_headers.clone(),
                raw_body: chunk_text.clone(),
                raw_output: format!(
                    "HTTP/{} {}\n{}\n\n{}",
                    parsed.version, parsed.status_code, parsed.raw_headers, chunk_text
                ),
            });
            head = Some(parsed);
            if truncated {
                break;
            }
            continue;
        }

        let decoded = decode_body(data, &mut chunked, &mut decompressor);
        let appended = append_capped(&mut body, &decoded, &mut truncated);
        if !appended.is_empty() {
            let chunk_text = String::from_utf8_lossy(&appended).to_string();
            on_progress(HttpProgressChunk {
                raw_headers: String::new(),
                raw_body: chunk_text.clone(),
                raw_output: chunk_text,
            });
        }
        if truncated {
            break;
        }
    }

    let Some(head) = head else {
        return Err(Fail::Msg("No response received.".to_string()));
    };

    let finished = Instant::now();
    let first_byte_ms = first_byte_at
        .map(|t| t.duration_since(pre_request).as_millis() as u64)
        .unwrap_or(0);
    let download_ms = first_byte_at
        .map(|t| finished.duration_since(t).as_millis() as u64)
        .unwrap_or(0);
    let total_ms = finished.duration_since(started).as_millis() as u64;

    let raw_body = String::from_utf8_lossy(&body).to_string();
    let raw_output = format!(
        "HTTP/{} {}\n{}\n\n{}",
        head.version, head.status_code, head.raw_headers, raw_body
    );

    Ok(HttpResult {
        status: ResultStatus::Finished,
        resolved_address: Some(address.to_string()),
        headers: head.headers,
        raw_headers: head.raw_headers,
        raw_body,
        raw_output,
        truncated,
        status_code: Some(head.status_code),
        status_code_name: Some(head.reason),
        timings: HttpTimings {
            total: Some(total_ms),
            dns: Some(dns_ms),
            tcp: Some(tcp_ms),
            tls: tls_ms,
            first_byte: Some(first_byte_ms),
            download: Some(download_ms),
        },
        tls,
    })
}

struct ResponseHead {
    version: String,
    status_code: u16,
    reason: String,
    headers: BTreeMap<String, String>,
    raw_headers: String,
}

fn parse_head(bytes: &[u8]) -> Result<ResponseHead, Fail> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut header_storage);
    match response.parse(bytes) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(Fail::Msg("Malformed response header.".to_string())),
    }

    let mut headers = BTreeMap::new();
    let mut raw_lines = Vec::new();
    for header in response.headers.iter() {
        let value = String::from_utf8_lossy(header.value).to_string();
        raw_lines.push(format!("{}: {}", header.name, value));
        headers
            .entry(header.name.to_ascii_lowercase())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    Ok(ResponseHead {
        version: format!("1.{}", response.version.unwrap_or(1)),
        status_code: response.code.unwrap_or(0),
        reason: response.reason.unwrap_or("").to_string(),
        headers,
        raw_headers: raw_lines.join("\n"),
    })
}

fn build_request(config: &HttpClientConfig) -> String {
    let mut path = if config.path.starts_with('/') {
        config.path.clone()
    } else {
        format!("/{}", config.path)
    };
    let query = config.query.trim_start_matches('?');
    if !query.is_empty() {
        path.push('?');
        path.push_str(query);
    }

    let default_port = match config.protocol {
        HttpProtocol::Http => 80,
        _ => 443,
    };
    let host = match &config.host_header {
        Some(host) => host.clone(),
        None if config.port == default_port => config.target.clone(),
        None => format!("{}:{}", config.target, config.port),
    };

    // Header order is fixed: user headers, then Accept-Encoding, Host,
    // User-Agent, Connection.
    let mut request = format!("{} {} HTTP/1.1\r\n", config.method, path);
    for (name, value) in &config.user_headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("Accept-Encoding: gzip, deflate, br, zstd\r\n");
    request.push_str(&format!("Host: {}\r\n", host));
    request.push_str(&format!("User-Agent: {}\r\n", USER_AGENT));
    request.push_str("Connection: close\r\n\r\n");
    request
}

fn decode_body(
    input: &[u8],
    chunked: &mut Option<ChunkedDecoder>,
    decompressor: &mut Decompressor,
) -> Vec<u8> {
    let entity = match chunked {
        Some(decoder) => decoder.feed(input),
        None => input.to_vec(),
    };
    if entity.is_empty() {
        return Vec::new();
    }
    decompressor.write(&entity)
}

/// Append decoded bytes up to the download cap; returns what was actually
/// appended and flips `truncated` when bytes had to be dropped.
fn append_capped(body: &mut Vec<u8>, decoded: &[u8], truncated: &mut bool) -> Vec<u8> {
    if decoded.is_empty() || *truncated {
        return Vec::new();
    }
    let room = DOWNLOAD_LIMIT.saturating_sub(body.len());
    let take = decoded.len().min(room);
    body.extend_from_slice(&decoded[..take]);
    if take < decoded.len() {
        *truncated = true;
    }
    decoded[..take].to_vec()
}

// ============ chunked transfer decoding ============

enum ChunkState {
    Size,
    Data,
    DataCrlf(usize),
    Done,
}

struct ChunkedDecoder {
    state: ChunkState,
    size_line: Vec<u8>,
    remaining: usize,
}

impl ChunkedDecoder {
    fn new() -> Self {
        Self {
            state: ChunkState::Size,
            size_line: Vec::new(),
            remaining: 0,
        }
    }

    fn feed(&mut self, mut input: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        while !input.is_empty() {
            match self.state {
                ChunkState::Size => {
                    // accumulate until LF, then parse the hex size
                    if let Some(pos) = input.iter().position(|b| *b == b'\n') {
                        self.size_line.extend_from_slice(&input[..pos]);
                        input = &input[pos + 1..];
                        let line = String::from_utf8_lossy(&self.size_line).into_owned();
                        let hex = line.trim().split(';').next().unwrap_or("").trim();
                        self.size_line.clear();
                        match usize::from_str_radix(hex, 16) {
                            Ok(0) => self.state = ChunkState::Done,
                            Ok(size) => {
                                self.remaining = size;
                                self.state = ChunkState::Data;
                            }
                            Err(_) => self.state = ChunkState::Done,
                        }
                    } else {
                        self.size_line.extend_from_slice(input);
                        input = &[];
                    }
                }
                ChunkState::Data => {
                    let take = self.remaining.min(input.len());
                    out.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    self.remaining -= take;
                    if self.remaining == 0 {
                        self.state = ChunkState::DataCrlf(2);
                    }
                }
                ChunkState::DataCrlf(ref mut skip) => {
                    let take = (*skip).min(input.len());
                    input = &input[take..];
                    *skip -= take;
                    if *skip == 0 {
                        self.state = ChunkState::Size;
                    }
                }
                ChunkState::Done => {
                    // trailers and anything after the last chunk are ignored
                    input = &[];
                }
            }
        }
        out
    }
}

// ============ content decompression ============

/// Write sink the decoders drain into; a second handle reads the decoded
/// bytes back out without needing access to the decoder's inner writer.
#[derive(Clone, Default)]
struct SharedBuf(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl SharedBuf {
    fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl std::io::Write for SharedBuf {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

enum Decompressor {
    Identity,
    Gzip(flate2::write::GzDecoder<SharedBuf>, SharedBuf),
    Deflate(flate2::write::ZlibDecoder<SharedBuf>, SharedBuf),
    Brotli(Box<brotli::DecompressorWriter<SharedBuf>>, SharedBuf),
    Zstd(zstd::stream::write::Decoder<'static, SharedBuf>, SharedBuf),
}

impl Decompressor {
    /// Unknown encodings pass through untouched.
    fn for_encoding(encoding: Option<&str>) -> Self {
        let out = SharedBuf::default();
        match encoding.map(|e| e.trim().to_ascii_lowercase()).as_deref() {
            Some("gzip") | Some("x-gzip") => {
                Decompressor::Gzip(flate2::write::GzDecoder::new(out.clone()), out)
            }
            Some("deflate") => {
                Decompressor::Deflate(flate2::write::ZlibDecoder::new(out.clone()), out)
            }
            Some("br") => Decompressor::Brotli(
                Box::new(brotli::DecompressorWriter::new(out.clone(), 4096)),
                out,
            ),
            Some("zstd") => match zstd::stream::write::Decoder::new(out.clone()) {
                Ok(decoder) => Decompressor::Zstd(decoder, out),
                Err(_) => Decompressor::Identity,
            },
            _ => Decompressor::Identity,
        }
    }

    /// Push compressed bytes through, returning whatever decoded bytes came
    /// out. A corrupt stream degrades to passthrough of the raw bytes.
    fn write(&mut self, data: &[u8]) -> Vec<u8> {
        let (ok, out) = match self {
            Decompressor::Identity => return data.to_vec(),
            Decompressor::Gzip(decoder, out) => (
                decoder.write_all(data).and_then(|_| decoder.flush()).is_ok(),
                out,
            ),
            Decompressor::Deflate(decoder, out) => (
                decoder.write_all(data).and_then(|_| decoder.flush()).is_ok(),
                out,
            ),
            Decompressor::Brotli(decoder, out) => (
                decoder.write_all(data).and_then(|_| decoder.flush()).is_ok(),
                out,
            ),
            Decompressor::Zstd(decoder, out) => (
                decoder.write_all(data).and_then(|_| decoder.flush()).is_ok(),
                out,
            ),
        };
        if ok {
            out.drain()
        } else {
            data.to_vec()
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
