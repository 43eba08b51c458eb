mod ext;
mod protocol;
mod proxy;
mod websocket;

use std::sync::Arc;

use worker::*;

use crate::proxy::{parse_early_data, run_tunnel, TunnelConfig, UpstreamHint};
use crate::websocket::WebSocketStream;

/// Tunnel route prefix; the trailing path segment is the upstream hint.
const TUNNEL_PATH_PREFIX: &str = "/Free-VPN-Geo-Project/";

#[event(fetch)]
async fn main(req: Request, env: Env, _: Context) -> Result<Response> {
    let is_websocket = req
        .headers()
        .get("Upgrade")?
        .map(|up| up.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !is_websocket {
        return Response::error("Expected WebSocket upgrade", 426);
    }

    let path = req.path();
    let Some(hint) = extract_upstream_hint(&path) else {
        return Response::error("Not found", 404);
    };
    let config = Arc::new(TunnelConfig::new(&env, UpstreamHint::parse(hint)));

    // decoded into the stream rather than checked here, so a malformed
    // header fails the tunnel instead of the handshake
    let early_data = parse_early_data(req.headers().get("sec-websocket-protocol")?);

    let WebSocketPair { client, server } = WebSocketPair::new()?;
    server.accept()?;

    wasm_bindgen_futures::spawn_local(async move {
        let events = match server.events() {
            Ok(events) => events,
            Err(err) => {
                console_error!("websocket event stream failed: {}", err);
                return;
            }
        };

        let socket = WebSocketStream::new(&server, events, early_data);
        if let Err(err) = run_tunnel(socket, Arc::clone(&config)).await {
            console_error!("tunnel error: {}", err);
            let _ = server.close(Some(1003), Some("invalid request"));
        }
    });

    Response::from_websocket(client)
}

/// Accepts only `/Free-VPN-Geo-Project/<hint>` where `<hint>` ends in a
/// delimiter-separated numeric port (the `(.+[:=\-]\d+)` route shape).
fn extract_upstream_hint(path: &str) -> Option<&str> {
    let hint = path.strip_prefix(TUNNEL_PATH_PREFIX)?;
    let (head, digits) = hint.rsplit_once([':', '=', '-'])?;
    if head.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(hint)
}

#[cfg(test)]
mod tests {
    use super::extract_upstream_hint;

    #[test]
    fn matches_tunnel_paths() {
        assert_eq!(
            extract_upstream_hint("/Free-VPN-Geo-Project/example.org-8443"),
            Some("example.org-8443")
        );
        assert_eq!(
            extract_upstream_hint("/Free-VPN-Geo-Project/10.0.0.1:443"),
            Some("10.0.0.1:443")
        );
        assert_eq!(
            extract_upstream_hint("/Free-VPN-Geo-Project/a:1:2"),
            Some("a:1:2")
        );
    }

    #[test]
    fn rejects_other_paths() {
        assert_eq!(extract_upstream_hint("/"), None);
        assert_eq!(extract_upstream_hint("/ws"), None);
        assert_eq!(extract_upstream_hint("/Free-VPN-Geo-Project/"), None);
        // no delimiter-separated port
        assert_eq!(extract_upstream_hint("/Free-VPN-Geo-Project/hostonly"), None);
        // port is not numeric
        assert_eq!(extract_upstream_hint("/Free-VPN-Geo-Project/a:12x"), None);
        // nothing before the delimiter
        assert_eq!(extract_upstream_hint("/Free-VPN-Geo-Project/:443"), None);
    }
}
