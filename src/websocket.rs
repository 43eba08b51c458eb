use std::io::{Error, ErrorKind, Result};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use pin_project::{pin_project, pinned_drop};
use worker::{EventStream, WebSocket, WebsocketEvent};

/// Inbound half of an accepted tunnel WebSocket, presented as an ordered
/// stream of payload chunks. Early data from the handshake header (or its
/// decode failure) is surfaced before any message event.
#[pin_project(PinnedDrop)]
pub struct WebSocketStream<'a> {
    ws: &'a WebSocket,
    #[pin]
    stream: EventStream<'a>,
    pending: Option<Result<Bytes>>,
    closed: bool,
}

impl<'a> WebSocketStream<'a> {
    pub fn new(
        ws: &'a WebSocket,
        stream: EventStream<'a>,
        early_data: Result<Option<Vec<u8>>>,
    ) -> Self {
        let pending = match early_data {
            Ok(Some(data)) if !data.is_empty() => Some(Ok(Bytes::from(data))),
            Ok(_) => None,
            Err(err) => Some(Err(err)),
        };
        Self {
            ws,
            stream,
            pending,
            closed: false,
        }
    }

    /// Send-side handle. Carries the socket's own lifetime rather than the
    /// stream borrow, so the two relay directions can run concurrently.
    pub fn websocket(&self) -> &'a WebSocket {
        self.ws
    }

    /// Closes the socket; a no-op once it is closed or was closed remotely.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.ws.close(Some(1000), Some("tunnel finished"));
        }
    }
}

impl Stream for WebSocketStream<'_> {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if let Some(item) = this.pending.take() {
            return Poll::Ready(Some(item));
        }
        if *this.closed {
            return Poll::Ready(None);
        }

        loop {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(WebsocketEvent::Message(msg)))) => {
                    if let Some(data) = msg.bytes() {
                        return Poll::Ready(Some(Ok(Bytes::from(data))));
                    }
                    // non-binary frame; keep polling
                }
                Poll::Ready(Some(Ok(WebsocketEvent::Close(_)))) | Poll::Ready(None) => {
                    *this.closed = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Err(err))) => {
                    *this.closed = true;
                    return Poll::Ready(Some(Err(Error::new(
                        ErrorKind::Other,
                        err.to_string(),
                    ))));
                }
            }
        }
    }
}

// Dropping the stream mid-tunnel must still shut the socket, exactly once.
#[pinned_drop]
impl PinnedDrop for WebSocketStream<'_> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if !*this.closed {
            *this.closed = true;
            let _ = this.ws.close(None, None::<&str>);
        }
    }
}
