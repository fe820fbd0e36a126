//! Listeners and the per-connection task.
//!
//! Each accepted connection runs in its own task: a read loop that feeds
//! packets to the broker, and a writer task that drains the session's
//! bounded outbound queue onto the socket. The broker lock is only taken
//! for the synchronous broker call, never across I/O.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::HeaderValue;

use crate::broker::{self, DisconnectReason, Origin, SharedBroker};
use crate::client::SessionHandle;
use crate::config::ServerSettings;
use crate::transport::codec::MqttCodec;
use crate::transport::packet::{ConnectReturnCode, Packet, SubscribeReturnCode};
use crate::transport::ws::WsStream;
use crate::utils::error::{AuthError, DecodeError, StartupError, TransportError};

/// Time a new connection has to send CONNECT (and finish TLS/WS handshakes).
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Time the writer gets to flush queued packets after the session ends.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const WS_PROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// Build the TLS acceptor when a certificate and key are configured.
pub fn tls_acceptor(settings: &ServerSettings) -> Result<Option<TlsAcceptor>, StartupError> {
    let (Some(cert_file), Some(key_file)) = (&settings.tls_cert, &settings.tls_key) else {
        return Ok(None);
    };

    let cert_chain = CertificateDer::pem_file_iter(cert_file)
        .map_err(|e| StartupError::Tls(format!("{cert_file}: {e}")))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StartupError::Tls(format!("{cert_file}: {e}")))?;
    if cert_chain.is_empty() {
        return Err(StartupError::Tls(format!("{cert_file}: no certificates found")));
    }
    let key = PrivateKeyDer::from_pem_file(key_file)
        .map_err(|e| StartupError::Tls(format!("{key_file}: {e}")))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| StartupError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| StartupError::Tls(format!("bad certs/private key, {e}")))?;

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

pub async fn bind(addr: &str) -> Result<TcpListener, StartupError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Bind the MQTT listener on `port` and, when enabled, the WebSocket
/// listener on `port + 1`, then serve until an accept loop ends.
pub async fn run(settings: ServerSettings, broker: SharedBroker) -> Result<(), StartupError> {
    let acceptor = tls_acceptor(&settings)?;
    let addr = format!("{}:{}", settings.host, settings.port);
    let mqtt = bind(&addr).await?;
    let scheme = if acceptor.is_some() { "mqtts" } else { "mqtt" };
    info!("MQTT server listening on {}://{}", scheme, addr);

    if !settings.websocket {
        start_mqtt_server(mqtt, broker, acceptor, settings.max_packet_size).await;
        return Ok(());
    }

    let ws_port = settings.port.checked_add(1).ok_or_else(|| StartupError::Bind {
        addr: format!("{}:{}", settings.host, settings.port),
        source: std::io::Error::other("no port above the MQTT port for WebSocket"),
    })?;
    let ws_addr = format!("{}:{}", settings.host, ws_port);
    let ws = bind(&ws_addr).await?;
    let scheme = if acceptor.is_some() { "wss" } else { "ws" };
    info!("WebSocket server listening on {}://{}", scheme, ws_addr);

    tokio::select! {
        _ = start_mqtt_server(mqtt, broker.clone(), acceptor.clone(), settings.max_packet_size) => {}
        _ = start_websocket_server(ws, broker, acceptor, settings.max_packet_size) => {}
    }
    Ok(())
}

pub async fn start_mqtt_server(
    listener: TcpListener,
    broker: SharedBroker,
    acceptor: Option<TlsAcceptor>,
    max_packet_size: u32,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };
        let broker = broker.clone();
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            let result = match acceptor {
                Some(acceptor) => match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => handle_connection(tls, broker, max_packet_size).await,
                    Ok(Err(e)) => Err(TransportError::Io(e)),
                    Err(_) => Err(TransportError::Protocol("tls handshake timed out")),
                },
                None => handle_connection(stream, broker, max_packet_size).await,
            };
            if let Err(e) = result {
                debug!("Connection from {} ended: {}", peer, e);
            }
        });
    }
}

pub async fn start_websocket_server(
    listener: TcpListener,
    broker: SharedBroker,
    acceptor: Option<TlsAcceptor>,
    max_packet_size: u32,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("WebSocket accept failed: {}", e);
                continue;
            }
        };
        let broker = broker.clone();
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            let result = match acceptor {
                Some(acceptor) => match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => serve_websocket(tls, broker, max_packet_size).await,
                    Ok(Err(e)) => Err(TransportError::Io(e)),
                    Err(_) => Err(TransportError::Protocol("tls handshake timed out")),
                },
                None => serve_websocket(stream, broker, max_packet_size).await,
            };
            if let Err(e) = result {
                debug!("WebSocket connection from {} ended: {}", peer, e);
            }
        });
    }
}

/// Echo the `mqtt` subprotocol when the client offers it.
fn negotiate_subprotocol(req: &Request, mut resp: Response) -> Result<Response, ErrorResponse> {
    let offers_mqtt = req
        .headers()
        .get(WS_PROTOCOL_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|p| p.trim() == "mqtt"));
    if offers_mqtt {
        resp.headers_mut()
            .insert(WS_PROTOCOL_HEADER, HeaderValue::from_static("mqtt"));
    }
    Ok(resp)
}

async fn serve_websocket<S>(
    stream: S,
    broker: SharedBroker,
    max_packet_size: u32,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = match timeout(HANDSHAKE_TIMEOUT, accept_hdr_async(stream, negotiate_subprotocol)).await {
        Ok(ws) => ws?,
        Err(_) => return Err(TransportError::Protocol("websocket handshake timed out")),
    };
    handle_connection(WsStream::new(ws), broker, max_packet_size).await
}

fn refusal_code(err: &AuthError) -> ConnectReturnCode {
    match err {
        AuthError::BadCredentials => ConnectReturnCode::BadUserNameOrPassword,
        AuthError::InvalidClientId => ConnectReturnCode::IdentifierRejected,
        AuthError::ServerFull(_) => ConnectReturnCode::ServiceUnavailable,
    }
}

/// Run one MQTT connection to completion.
pub async fn handle_connection<S>(
    stream: S,
    broker: SharedBroker,
    max_packet_size: u32,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = Framed::new(stream, MqttCodec::new(max_packet_size)).split();

    let connect = match timeout(HANDSHAKE_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(Packet::Connect(connect)))) => *connect,
        Ok(Some(Ok(_))) => return Err(TransportError::Protocol("first packet must be CONNECT")),
        Ok(Some(Err(DecodeError::UnsupportedProtocolLevel))) => {
            sink.send(Packet::ConnectAck {
                session_present: false,
                return_code: ConnectReturnCode::UnacceptableProtocolVersion,
            })
            .await?;
            return Err(DecodeError::UnsupportedProtocolLevel.into());
        }
        Ok(Some(Err(e))) => return Err(e.into()),
        Ok(None) => return Ok(()),
        Err(_) => return Err(TransportError::Protocol("no CONNECT within handshake timeout")),
    };

    let queue = broker::lock(&broker).settings().outbound_queue.max(1);
    let (tx, mut rx) = mpsc::channel(queue);
    let accepted = broker::lock(&broker).connect(&connect, tx);
    let (handle, shutdown) = match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!("Refusing client '{}': {}", connect.client_id, e);
            sink.send(Packet::ConnectAck {
                session_present: false,
                return_code: refusal_code(&e),
            })
            .await?;
            return Ok(());
        }
    };
    sink.send(Packet::ConnectAck {
        session_present: false,
        return_code: ConnectReturnCode::Accepted,
    })
    .await?;

    let client_id = handle.client_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if let Err(e) = sink.send(packet).await {
                debug!("Send loop for {} failed: {}", client_id, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    // 1.5 x keep-alive, per MQTT 3.1.1; zero disables the check
    let idle_limit = (connect.keep_alive > 0)
        .then(|| Duration::from_millis(u64::from(connect.keep_alive) * 1500));

    let outcome: Result<Option<DisconnectReason>, TransportError> = loop {
        let next_packet = async {
            match idle_limit {
                Some(limit) => timeout(limit, stream.next())
                    .await
                    .map_err(|_| TransportError::KeepAlive),
                None => Ok(stream.next().await),
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break Ok(None),
            next = next_packet => match next {
                Err(e) => break Err(e),
                Ok(None) => break Err(TransportError::Protocol("connection closed without DISCONNECT")),
                Ok(Some(Err(e))) => break Err(e.into()),
                Ok(Some(Ok(packet))) => match handle_packet(&broker, &handle, packet) {
                    Ok(true) => {}
                    Ok(false) => break Ok(Some(DisconnectReason::Client)),
                    Err(e) => break Err(e),
                },
            },
        }
    };

    let reason = match &outcome {
        Ok(reason) => *reason,
        Err(_) => Some(DisconnectReason::Transport),
    };
    if let Some(reason) = reason {
        broker::lock(&broker).disconnect(&handle, reason);
    }

    // the session's sender is gone now, so the writer drains and stops
    if timeout(DRAIN_TIMEOUT, writer).await.is_err() {
        error!("Writer for {} did not finish in time", handle.client_id);
    }

    outcome.map(|_| ())
}

/// Returns `Ok(false)` when the client asked to disconnect.
fn handle_packet(
    broker: &SharedBroker,
    handle: &SessionHandle,
    packet: Packet,
) -> Result<bool, TransportError> {
    let mut broker = broker::lock(broker);
    match packet {
        Packet::Publish(publish) => broker.publish(publish, Origin::Client(handle.clone())),
        Packet::PublishAck { packet_id } | Packet::PublishComplete { packet_id } => {
            broker.handle_ack(handle, packet_id);
        }
        Packet::PublishReceived { packet_id } => broker.handle_received(handle, packet_id),
        Packet::PublishRelease { packet_id } => {
            broker.send_to(handle, Packet::PublishComplete { packet_id });
        }
        Packet::Subscribe {
            packet_id,
            topic_filters,
        } => {
            let status: Vec<SubscribeReturnCode> = topic_filters
                .iter()
                .map(|(pattern, qos)| broker.subscribe(handle, pattern, *qos))
                .collect();
            broker.send_to(handle, Packet::SubscribeAck { packet_id, status });
        }
        Packet::Unsubscribe {
            packet_id,
            topic_filters,
        } => {
            for pattern in &topic_filters {
                broker.unsubscribe(handle, pattern);
            }
            broker.send_to(handle, Packet::UnsubscribeAck { packet_id });
        }
        Packet::PingRequest => {
            broker.send_to(handle, Packet::PingResponse);
        }
        Packet::Disconnect => return Ok(false),
        Packet::Connect(_) => return Err(TransportError::Protocol("second CONNECT")),
        Packet::ConnectAck { .. }
        | Packet::SubscribeAck { .. }
        | Packet::UnsubscribeAck { .. }
        | Packet::PingResponse => {
            return Err(TransportError::Protocol("server-bound packet type expected"));
        }
    }
    Ok(true)
}
