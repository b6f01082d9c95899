//! Blocking WebSocket client helpers with bounded connect and I/O timeouts.

use std::{
    io,
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use tokio_tungstenite::tungstenite::{
    self, Message, WebSocket,
    client::IntoClientRequest,
    error::{Error as WsError, ProtocolError as WsProtocolError},
};
use tracing::debug;

use crate::error::LinkError;

pub type WsStream = WebSocket<TcpStream>;

/// Open a plain `ws://` connection to `url`.
///
/// `timeout` bounds the TCP connect and is kept as the socket read/write timeout,
/// so a later blocking read returns `WouldBlock`/`TimedOut` instead of hanging.
pub fn connect(url: &str, timeout: Duration) -> Result<WsStream, LinkError> {
    let request = url
        .into_client_request()
        .map_err(|err| LinkError::invalid_url(url, err))?;

    let uri = request.uri();
    match uri.scheme_str() {
        Some("ws") => {}
        Some(other) => return Err(LinkError::invalid_url(url, format!("unsupported scheme {other}"))),
        None => return Err(LinkError::invalid_url(url, "missing scheme")),
    }
    let host = uri
        .host()
        .ok_or_else(|| LinkError::invalid_url(url, "missing host"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_owned();
    let port = uri.port_u16().unwrap_or(80);

    let addr = (host.as_str(), port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| LinkError::invalid_url(url, "host did not resolve"))?;

    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let (socket, response) = tungstenite::client(request, stream).map_err(|err| LinkError::Handshake {
        url: url.to_owned(),
        reason: err.to_string(),
    })?;
    debug!("connected to {url} ({})", response.status());
    Ok(socket)
}

/// True for read errors that only mean "nothing arrived before the timeout".
pub fn is_idle(err: &WsError) -> bool {
    matches!(
        err,
        WsError::Io(io) if matches!(io.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
    )
}

/// True once the peer has gone away and the socket cannot be used again.
pub fn is_closed(err: &WsError) -> bool {
    matches!(
        err,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake)
    )
}

pub fn send_text(socket: &mut WsStream, text: &str) -> Result<(), LinkError> {
    socket.send(Message::Text(text.to_owned()))?;
    Ok(())
}

/// Best-effort close handshake.
pub fn close(socket: &mut WsStream) {
    if socket.close(None).is_ok() {
        let _ = socket.flush();
    }
}
