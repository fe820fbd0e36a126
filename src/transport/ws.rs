//! Byte-stream view of a WebSocket connection.
//!
//! MQTT over WebSocket carries the ordinary MQTT byte stream in binary
//! frames, and frames need not line up with packets. `WsStream` exposes the
//! frame payloads as `AsyncRead`/`AsyncWrite` so the same `MqttCodec` and
//! connection loop serve both listeners.

use std::io::{self, ErrorKind};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Sink, Stream, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use tungstenite::{Error as WsError, Message};

pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    pending: Option<Bytes>,
}

impl<S> WsStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: None,
        }
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if let Some(mut data) = self.pending.take() {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data.split_to(n));
                if !data.is_empty() {
                    self.pending = Some(data);
                }
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    if !data.is_empty() {
                        self.pending = Some(data);
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                // ping/pong are answered by tungstenite; text is not MQTT
                Some(Ok(other)) => debug!("Ignoring non-binary websocket frame: {:?}", other),
                Some(Err(e)) => return Poll::Ready(Err(to_error(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        if let Err(e) = ready!(Pin::new(&mut self.inner).poll_ready(cx)) {
            return Poll::Ready(Err(to_error(e)));
        }
        if let Err(e) = Pin::new(&mut self.inner).start_send(Message::Binary(Bytes::copy_from_slice(buf))) {
            return Poll::Ready(Err(to_error(e)));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        ready!(Pin::new(&mut self.inner).poll_flush(cx)).map_err(to_error)?;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        ready!(Pin::new(&mut self.inner).poll_close(cx)).map_err(to_error)?;
        Poll::Ready(Ok(()))
    }
}

fn to_error(e: WsError) -> io::Error {
    match e {
        WsError::ConnectionClosed => io::Error::from(ErrorKind::ConnectionAborted),
        WsError::AlreadyClosed => io::Error::from(ErrorKind::NotConnected),
        WsError::Io(e) => e,
        other => io::Error::other(other.to_string()),
    }
}
