//! Client stub (C5): a short-lived connection to the current primary.
//! Grounded in `examples/original_source/main.py`'s `Client.send_order`
//! and the wire shape of `examples/nymtech-ephemera/broadcast-client`.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::RwLock;

use crate::error::ClientError;
use crate::wire::{majority, Frame, Order, PeerId};

/// Tracks `(primary_id, primary_addr)`, updated externally whenever the
/// primary changes.
pub struct ClientStub {
    primary: RwLock<(PeerId, SocketAddr)>,
}

impl ClientStub {
    pub fn new(primary_id: PeerId, primary_addr: SocketAddr) -> ClientStub {
        ClientStub {
            primary: RwLock::new((primary_id, primary_addr)),
        }
    }

    pub async fn set_primary(&self, primary_id: PeerId, primary_addr: SocketAddr) {
        *self.primary.write().await = (primary_id, primary_addr);
    }

    pub async fn primary(&self) -> (PeerId, SocketAddr) {
        self.primary.read().await.clone()
    }

    /// Open a one-shot connection to the primary, send `client_order`,
    /// await the `response`, and compute the client-visible decision.
    pub async fn send_order(&self, value: Order) -> Result<(Order, BTreeMap<PeerId, Order>), ClientError> {
        if value == Order::Undecided {
            return Err(ClientError::InvalidOrder);
        }

        let (_, addr) = self.primary().await;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect { addr, source })?;
        let (rd, mut wr) = stream.into_split();

        let frame = Frame::client_order(PeerId::client(), value);
        let line = frame.serialize()?;
        wr.write_all(line.as_bytes()).await?;

        let mut reader = BufReader::new(rd);
        let mut buf = String::new();
        let read = reader.read_line(&mut buf).await?;
        if read == 0 {
            return Err(ClientError::NoResponse);
        }

        let reply = Frame::deserialize(&buf)?;
        let votes = reply.decode_votes()?;
        let decision = majority(votes.values().copied());
        Ok((decision, votes))
    }
}
