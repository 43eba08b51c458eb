use std::io::{Error, ErrorKind, Result};
use std::iter;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::BytesMut;
use futures_util::future::{select, Either};
use futures_util::{pin_mut, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use worker::{console_log, Env, Socket, WebSocket};

use crate::protocol::{self, Network, ProtocolError, RouteInfo};
use crate::websocket::WebSocketStream;

const DEFAULT_DNS_ADDRESS: &str = "8.8.8.8";
const DEFAULT_DNS_PORT: u16 = 53;

pub struct TunnelConfig {
    pub upstream: UpstreamHint,
    pub dns_address: String,
    pub dns_port: u16,
}

impl TunnelConfig {
    pub fn new(env: &Env, upstream: UpstreamHint) -> Self {
        let dns_address = env
            .var("DNS_SERVER_ADDRESS")
            .map(|v| v.to_string())
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_DNS_ADDRESS.to_string());
        let dns_port = env
            .var("DNS_SERVER_PORT")
            .ok()
            .and_then(|v| v.to_string().parse().ok())
            .unwrap_or(DEFAULT_DNS_PORT);
        Self {
            upstream,
            dns_address,
            dns_port,
        }
    }
}

/// Alternate target taken from the request path, tried once when the direct
/// remote yields no data. Either field may be missing; the parsed header
/// supplies the fallback at retry time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpstreamHint {
    host: Option<String>,
    port: Option<u16>,
}

impl UpstreamHint {
    /// Splits `host?[:=-]port?` on the first delimiter occurrences; surplus
    /// fields are ignored and a non-numeric port is treated as absent.
    pub fn parse(raw: &str) -> Self {
        let mut fields = raw.split([':', '=', '-']);
        let host = fields
            .next()
            .filter(|h| !h.is_empty())
            .map(str::to_string);
        let port = fields.next().and_then(|p| p.parse().ok());
        Self { host, port }
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_none() && self.port.is_none()
    }

    /// Resolves the retry target against the tunnel's parsed destination.
    pub fn target(&self, host: &str, port: u16) -> (String, u16) {
        (
            self.host.clone().unwrap_or_else(|| host.to_string()),
            self.port.unwrap_or(port),
        )
    }
}

/// Decodes the `sec-websocket-protocol` early-data header: base64-url with
/// optional padding, the standard alphabet tolerated via normalization.
pub fn parse_early_data(data: Option<String>) -> Result<Option<Vec<u8>>> {
    if let Some(data) = data {
        if !data.is_empty() {
            let s = data.replace('+', "-").replace('/', "_").replace('=', "");
            return URL_SAFE_NO_PAD
                .decode(s)
                .map(Some)
                .map_err(|e| Error::new(ErrorKind::InvalidData, format!("invalid early data: {e}")));
        }
    }
    Ok(None)
}

/// Drives one tunnel: decode the first non-empty chunk into a route, open
/// the remote, then relay both directions until either side closes.
pub async fn run_tunnel(mut client: WebSocketStream<'_>, config: Arc<TunnelConfig>) -> Result<()> {
    let first = loop {
        match client.next().await {
            Some(Ok(chunk)) if !chunk.is_empty() => break chunk,
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err),
            // closed before sending anything
            None => return Ok(()),
        }
    };

    let route = protocol::parse(first)?;
    console_log!(
        "{} request for {}:{} ({} residual bytes)",
        route.protocol,
        route.host(),
        route.port,
        route.residual.len()
    );

    match route.network {
        Network::Tcp => process_tcp_outbound(&mut client, &config, &route).await?,
        Network::Udp => process_udp_outbound(&mut client, &config, &route).await?,
    }

    client.close();
    Ok(())
}

/// TCP outbound with the one-shot fallback: the parsed destination first,
/// then the upstream hint — but only when the first connection finished
/// without delivering a single byte.
async fn process_tcp_outbound(
    client: &mut WebSocketStream<'_>,
    config: &TunnelConfig,
    route: &RouteInfo,
) -> Result<()> {
    let host = route.host();
    let mut prelude = route.prelude.map(|p| p.to_vec());

    let targets = iter::once((host.clone(), route.port)).chain(
        (!config.upstream.is_empty()).then(|| config.upstream.target(&host, route.port)),
    );
    let mut targets = targets.peekable();

    while let Some((host, port)) = targets.next() {
        let socket = connect_remote(&host, port)?;
        let end = relay(client, socket, &route.residual, &mut prelude).await?;
        let has_fallback = targets.peek().is_some();
        match end {
            RelayEnd::Client => return Ok(()),
            RelayEnd::Remote { received: 0, result } if has_fallback => match result {
                Ok(()) => console_log!("no data from {}:{}, trying upstream", host, port),
                Err(err) => console_log!("no data from {}:{} ({}), trying upstream", host, port, err),
            },
            RelayEnd::Remote { result, .. } => return result,
        }
    }
    Ok(())
}

/// DNS-over-TCP outbound for UDP:53 requests: every client chunk is assumed
/// to be a length-framed query and is forwarded verbatim to the configured
/// resolver; replies stream back through the normal bridge.
async fn process_udp_outbound(
    client: &mut WebSocketStream<'_>,
    config: &TunnelConfig,
    route: &RouteInfo,
) -> Result<()> {
    // udp is honored for dns queries only
    if route.port != 53 {
        return Err(ProtocolError::UdpNotAllowed(route.port).into());
    }

    console_log!(
        "forwarding dns query to {}:{}",
        config.dns_address,
        config.dns_port
    );
    let socket = connect_remote(&config.dns_address, config.dns_port)?;
    let mut prelude = route.prelude.map(|p| p.to_vec());
    match relay(client, socket, &route.residual, &mut prelude).await? {
        RelayEnd::Client => Ok(()),
        RelayEnd::Remote { result, .. } => result,
    }
}

fn connect_remote(host: &str, port: u16) -> Result<Socket> {
    Socket::builder()
        .connect(host, port)
        .map_err(|e| Error::new(ErrorKind::ConnectionRefused, format!("connect {host}:{port}: {e}")))
}

/// How a relay finished: the client side went away, or the remote side
/// drained (cleanly or not) after delivering `received` bytes.
enum RelayEnd {
    Client,
    Remote { received: u64, result: Result<()> },
}

/// Runs the two per-connection pipelines until either direction finishes.
/// The residual of the first frame is written before any further client
/// chunk; the prelude, when present, is consumed by the first remote frame.
async fn relay(
    client: &mut WebSocketStream<'_>,
    mut remote: Socket,
    residual: &[u8],
    prelude: &mut Option<Vec<u8>>,
) -> Result<RelayEnd> {
    if !residual.is_empty() {
        remote.write_all(residual).await.map_err(write_context)?;
        remote.flush().await.map_err(write_context)?;
    }

    let ws = client.websocket();
    let (remote_read, mut remote_write) = tokio::io::split(remote);

    let uplink = copy_ws_to_remote(client, &mut remote_write);
    let downlink = copy_remote_to_ws(remote_read, ws, prelude);
    pin_mut!(uplink);
    pin_mut!(downlink);

    match select(uplink, downlink).await {
        Either::Left((result, _)) => {
            result?;
            Ok(RelayEnd::Client)
        }
        Either::Right(((received, result), _)) => Ok(RelayEnd::Remote { received, result }),
    }
}

/// Client→remote pipeline: chunks are written in arrival order, each one
/// flushed before the next is pulled.
async fn copy_ws_to_remote<W>(client: &mut WebSocketStream<'_>, remote: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = client.next().await {
        let chunk = chunk?;
        remote.write_all(&chunk).await.map_err(write_context)?;
        remote.flush().await.map_err(write_context)?;
    }
    Ok(())
}

/// Remote→client pipeline: one WebSocket frame per read, with the response
/// prelude prefixed onto the first frame only. Returns the payload byte
/// count alongside the terminal result so the caller can decide on retry.
async fn copy_remote_to_ws<R>(
    mut remote: R,
    ws: &WebSocket,
    prelude: &mut Option<Vec<u8>>,
) -> (u64, Result<()>)
where
    R: AsyncRead + Unpin,
{
    let mut received = 0u64;
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        buf.clear();
        let n = match remote.read_buf(&mut buf).await {
            Ok(0) => return (received, Ok(())),
            Ok(n) => n,
            Err(err) => {
                return (
                    received,
                    Err(Error::new(err.kind(), format!("remote read: {err}"))),
                )
            }
        };
        received += n as u64;

        let sent = match prelude.take() {
            Some(mut head) => {
                head.extend_from_slice(&buf);
                ws.send_with_bytes(&head)
            }
            None => ws.send_with_bytes(&buf),
        };
        if let Err(err) = sent {
            return (
                received,
                Err(Error::new(
                    ErrorKind::BrokenPipe,
                    format!("websocket send: {err}"),
                )),
            );
        }
    }
}

fn write_context(err: Error) -> Error {
    Error::new(err.kind(), format!("remote write: {err}"))
}
