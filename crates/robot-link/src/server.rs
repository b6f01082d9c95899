//! WebSocket front end for [`RelayBroker`].
//!
//! Each accepted socket gets a writer task draining its outbound slot and a
//! read loop that feeds text frames to the broker. The role is decided by the
//! request path during the handshake; unknown paths are refused with 404.

use std::{io, net::SocketAddr};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        Message,
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
    },
};
use tracing::{debug, info, warn};

use crate::broker::{self, Dispatch, RelayBroker, Role, SharedBroker};

pub struct RelayServer {
    listener: TcpListener,
    broker: SharedBroker,
}

impl RelayServer {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Self::bind_with(addr, RelayBroker::shared()).await
    }

    /// Bind using an existing broker, e.g. one the status server also reads.
    pub async fn bind_with<A: ToSocketAddrs>(addr: A, broker: SharedBroker) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, broker })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn broker(&self) -> SharedBroker {
        self.broker.clone()
    }

    /// Accept connections until the task is dropped.
    pub async fn serve(self) -> io::Result<()> {
        let local = self.listener.local_addr()?;
        info!(
            "relay listening on ws://{local}{} and ws://{local}{}",
            Role::Controller.path(),
            Role::Robot.path()
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let broker = self.broker.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, addr, broker).await {
                            debug!("connection from {addr} ended: {err}");
                        }
                    });
                }
                Err(err) => warn!("failed to accept connection: {err}"),
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, broker: SharedBroker) -> io::Result<()> {
    let mut role = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let path = request.uri().path();
        match Role::from_path(path) {
            Some(found) => {
                role = Some(found);
                Ok(response)
            }
            None => {
                let mut refusal = ErrorResponse::new(Some(format!("no endpoint at {path}")));
                *refusal.status_mut() = StatusCode::NOT_FOUND;
                Err(refusal)
            }
        }
    };

    let socket = accept_hdr_async(stream, callback)
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let Some(role) = role else {
        return Ok(());
    };

    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = broker::outbound();
    let id = broker::lock(&broker).add(role, tx);
    debug!("{} {id} from {addr}", role.label());

    let writer = tokio::spawn(async move {
        while let Some(text) = broker::next_outbound(&mut rx).await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                debug!("{} {id} sent a binary frame, ignoring", role.label());
                continue;
            }
            Ok(_) => continue,
            Err(err) => {
                debug!("{} {id} read error: {err}", role.label());
                break;
            }
        };

        let dispatch = broker::lock(&broker).handle_message(id, &text);
        if let Dispatch::Broadcast { delivered: 0, .. } = dispatch {
            debug!("command from controller {id} had no recipients");
        }
    }

    broker::lock(&broker).remove(id);
    writer.abort();
    Ok(())
}
