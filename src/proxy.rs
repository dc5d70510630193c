use std::{
    convert::Infallible,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    HeaderMap, Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderName},
    service::service_fn,
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::{net::TcpListener, sync::oneshot};
use tracing::Instrument as _;

use crate::{
    config::{Config, SerializeScope},
    measure::{MeasurementSlot, StateDiffCommand},
    run_log::{ExchangeRecord, RunLogger},
};

type HttpClient = Client<HttpConnector, Full<Bytes>>;

const BACKEND_UNREACHABLE_MESSAGE: &str = "Proxy could not connect to the backend service.";
/// Response headers the outer transport recomputes.
const RESPONSE_FRAMING_HEADERS: [HeaderName; 4] = [
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONTENT_ENCODING,
    header::CONNECTION,
];

#[derive(Debug)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

pub async fn serve(config: &Config) -> anyhow::Result<ProxyHandle> {
    let state = Arc::new(ProxyState::from_config(config)?);

    let listener = TcpListener::bind(config.proxy.listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", config.proxy.listen))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| proxy_handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ProxyHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

#[derive(Debug)]
struct ProxyState {
    backend: Uri,
    client: HttpClient,
    measurement_slot: MeasurementSlot,
    run_log: RunLogger,
    log_header: HeaderName,
    serialize: SerializeScope,
    max_body_bytes: usize,
}

impl ProxyState {
    fn from_config(config: &Config) -> anyhow::Result<Self> {
        let backend = config.backend_uri()?;
        let command = StateDiffCommand::from_config(&config.measure)?;
        let run_log = RunLogger::from_config(&config.run_log)?;
        let log_header = HeaderName::from_bytes(config.run_log.header.as_bytes())
            .with_context(|| format!("invalid `run_log.header` `{}`", config.run_log.header))?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(10)));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            backend,
            client,
            measurement_slot: MeasurementSlot::new(command),
            run_log,
            log_header,
            serialize: config.proxy.serialize,
            max_body_bytes: config.proxy.max_body_bytes,
        })
    }
}

/// A fully buffered inbound request.
#[derive(Debug)]
struct InboundExchange {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    log_target: PathBuf,
}

#[derive(Debug)]
struct BackendReply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

#[derive(Debug)]
enum BodyReadOutcome {
    Buffered(Bytes),
    TooLarge { limit_bytes: usize },
}

async fn read_body_with_limit(
    mut body: Incoming,
    max_body_bytes: usize,
) -> Result<BodyReadOutcome, hyper::Error> {
    let mut buffered = Vec::new();
    while let Some(frame_result) = body.frame().await {
        let frame = frame_result?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        if buffered.len().saturating_add(data.len()) > max_body_bytes {
            return Ok(BodyReadOutcome::TooLarge {
                limit_bytes: max_body_bytes,
            });
        }
        buffered.extend_from_slice(&data);
    }

    Ok(BodyReadOutcome::Buffered(Bytes::from(buffered)))
}

fn parse_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
}

async fn proxy_handler(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let exchange_span = tracing::info_span!(
        "proxy.exchange",
        method = %parts.method,
        path = %parts.uri.path(),
    );

    let limit_bytes = state.max_body_bytes;
    if parse_content_length(&parts.headers)
        .is_some_and(|length| length > u64::try_from(limit_bytes).unwrap_or(u64::MAX))
    {
        return Ok(body_too_large_response(limit_bytes));
    }
    let body = match read_body_with_limit(body, limit_bytes).await {
        Ok(BodyReadOutcome::Buffered(body)) => body,
        Ok(BodyReadOutcome::TooLarge { limit_bytes }) => {
            return Ok(body_too_large_response(limit_bytes));
        }
        Err(err) => {
            exchange_span.in_scope(|| tracing::debug!("failed to read request body: {err}"));
            return Ok(simple_response(
                StatusCode::BAD_REQUEST,
                "failed to read request body",
            ));
        }
    };

    let requested_log = parts
        .headers
        .get(&state.log_header)
        .map(|value| value.to_str().unwrap_or(""));
    let log_target = exchange_span.in_scope(|| state.run_log.resolve_target(requested_log));
    let exchange = InboundExchange {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
        log_target,
    };

    // Run the exchange on its own task: once the backend call has started,
    // measurement and logging complete even if the client disconnects.
    let task = tokio::spawn(run_exchange(Arc::clone(&state), exchange).instrument(exchange_span));
    match task.await {
        Ok(response) => Ok(response),
        Err(err) => {
            tracing::error!("exchange task failed: {err}");
            Ok(simple_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "exchange task failed",
            ))
        }
    }
}

async fn run_exchange(state: Arc<ProxyState>, exchange: InboundExchange) -> Response<Full<Bytes>> {
    let early_permit = match state.serialize {
        SerializeScope::Exchange => Some(state.measurement_slot.acquire().await),
        SerializeScope::Measurement => None,
    };

    let backend_req = match build_backend_request(&state.backend, &exchange, &state.log_header) {
        Ok(req) => req,
        Err(err) => {
            tracing::warn!("failed to build backend request: {err}");
            return simple_response(StatusCode::BAD_GATEWAY, BACKEND_UNREACHABLE_MESSAGE);
        }
    };

    let backend_started_at = Instant::now();
    let reply = match send_backend_request(&state.client, backend_req).await {
        Ok(reply) => reply,
        Err(err) => {
            tracing::warn!(backend = %state.backend, "could not reach backend: {err:#}");
            return simple_response(StatusCode::BAD_GATEWAY, BACKEND_UNREACHABLE_MESSAGE);
        }
    };
    let backend_latency_ms = u64::try_from(backend_started_at.elapsed().as_millis()).unwrap_or(u64::MAX);

    let mut permit = match early_permit {
        Some(permit) => permit,
        None => state.measurement_slot.acquire().await,
    };
    let measurement = permit.measure().await;

    let record = ExchangeRecord::new(
        exchange.method.as_str(),
        request_path_for_log(&exchange.uri),
        &exchange.body,
        reply.status.as_u16(),
        measurement.statediff_size(),
    );
    let statediff_size = record.statediff_size;
    match state
        .run_log
        .append(exchange.log_target.clone(), record)
        .await
    {
        Ok(()) => tracing::info!(
            status = reply.status.as_u16(),
            statediff_size,
            measured = measurement.is_measured(),
            backend_latency_ms,
            log = %exchange.log_target.display(),
            "exchange recorded"
        ),
        Err(err) => tracing::error!(
            log = %exchange.log_target.display(),
            "failed to append run log row: {err:#}"
        ),
    }
    drop(permit);

    relay_response(reply)
}

fn build_backend_request(
    backend: &Uri,
    exchange: &InboundExchange,
    log_header: &HeaderName,
) -> anyhow::Result<Request<Full<Bytes>>> {
    let uri = build_backend_uri(backend, &exchange.uri)?;
    let mut headers = exchange.headers.clone();
    strip_forwarded_request_headers(&mut headers, log_header);

    let mut req = Request::builder()
        .method(exchange.method.clone())
        .uri(uri)
        .body(Full::new(exchange.body.clone()))
        .map_err(|err| anyhow::anyhow!("build backend request: {err}"))?;
    *req.headers_mut() = headers;
    Ok(req)
}

fn build_backend_uri(backend: &Uri, original: &Uri) -> anyhow::Result<Uri> {
    let mut parts = original.clone().into_parts();
    parts.scheme = backend.scheme().cloned();
    parts.authority = backend.authority().cloned();
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(hyper::http::uri::PathAndQuery::from_static("/"));
    }
    Uri::from_parts(parts).map_err(|err| anyhow::anyhow!("construct backend uri: {err}"))
}

async fn send_backend_request(
    client: &HttpClient,
    req: Request<Full<Bytes>>,
) -> anyhow::Result<BackendReply> {
    let response = client
        .request(req)
        .await
        .context("send request to backend")?;
    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .context("read backend response body")?
        .to_bytes();
    Ok(BackendReply {
        status: parts.status,
        headers: parts.headers,
        body,
    })
}

/// The `path` column holds the bare path. Query strings are forwarded but
/// not logged.
fn request_path_for_log(uri: &Uri) -> String {
    uri.path().to_owned()
}

/// Drops headers that describe the client-to-proxy hop rather than the
/// request itself.
fn strip_forwarded_request_headers(headers: &mut HeaderMap, log_header: &HeaderName) {
    strip_hop_by_hop_headers(headers);
    headers.remove(header::HOST);
    headers.remove(log_header);
    // Response bodies are relayed raw with Content-Encoding removed, so the
    // backend must answer uncompressed.
    headers.remove(header::ACCEPT_ENCODING);
}

fn relay_response(reply: BackendReply) -> Response<Full<Bytes>> {
    let mut headers = reply.headers;
    strip_hop_by_hop_headers(&mut headers);
    for header_name in RESPONSE_FRAMING_HEADERS {
        headers.remove(header_name);
    }

    let mut response = Response::new(Full::new(reply.body));
    *response.status_mut() = reply.status;
    *response.headers_mut() = headers;
    response
}

fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let mut to_remove = Vec::new();
    for value in headers.get_all(header::CONNECTION).iter() {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            to_remove.push(header_name);
        }
    }

    for header_name in to_remove {
        headers.remove(header_name);
    }

    const STANDARD: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    for header_name in STANDARD {
        headers.remove(*header_name);
    }
    headers.remove("proxy-connection");
}

fn simple_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = Full::new(Bytes::from(message.to_owned()));
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

fn body_too_large_response(limit_bytes: usize) -> Response<Full<Bytes>> {
    simple_response(
        StatusCode::PAYLOAD_TOO_LARGE,
        &format!("request body exceeds {limit_bytes} bytes"),
    )
}
