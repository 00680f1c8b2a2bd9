//! Peer transport (C2): one TCP listener per peer, one outbound channel per
//! known peer id. Grounded in
//! `examples/nymtech-ephemera/broadcast/src/network/basic/{listener,connection_handler}.rs`
//! — the accept-loop-spawns-a-task-per-connection shape is kept; the
//! protobuf `ProtoCodec` is swapped for `tokio_util::codec::LinesCodec`
//! since frames here are newline-delimited JSON text, not length-delimited
//! protobuf.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::engine::Engine;
use crate::error::TransportError;
use crate::wire::{Frame, PeerId};

struct OutboundChannel {
    peer: PeerId,
    addr: SocketAddr,
    stream: Mutex<Option<FramedWrite<tokio::net::tcp::OwnedWriteHalf, LinesCodec>>>,
}

impl OutboundChannel {
    fn new(peer: PeerId, addr: SocketAddr) -> Self {
        Self {
            peer,
            addr,
            stream: Mutex::new(None),
        }
    }

    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        use futures::SinkExt;

        let line = frame
            .serialize()
            .map_err(TransportError::Wire)?
            .trim_end_matches('\n')
            .to_string();

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let stream =
                TcpStream::connect(self.addr)
                    .await
                    .map_err(|source| TransportError::Connect {
                        peer: self.peer.clone(),
                        addr: self.addr,
                        source,
                    })?;
            let (_rd, wr) = stream.into_split();
            *guard = Some(FramedWrite::new(wr, LinesCodec::new()));
        }

        let writer = guard.as_mut().expect("just populated above");
        if let Err(err) = writer.send(line).await {
            *guard = None;
            return Err(TransportError::Write {
                peer: self.peer.clone(),
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, err),
            });
        }
        Ok(())
    }
}

/// Every outbound `send` on a broken channel drops the cached connection and
/// reports the error to the caller; it is never retried automatically here.
pub struct Transport {
    listen_addr: SocketAddr,
    outbound: RwLock<HashMap<PeerId, Arc<OutboundChannel>>>,
}

impl Transport {
    pub fn new(listen_addr: SocketAddr) -> Arc<Transport> {
        Arc::new(Transport {
            listen_addr,
            outbound: RwLock::new(HashMap::new()),
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// C4's `add_node`: register a fresh outbound channel. The connection
    /// itself is established lazily on first send.
    pub async fn connect_peer(&self, peer: PeerId, addr: SocketAddr) {
        self.outbound
            .write()
            .await
            .insert(peer.clone(), Arc::new(OutboundChannel::new(peer, addr)));
    }

    /// C4's `remove_node`: drop the channel, closing the socket.
    pub async fn disconnect_peer(&self, peer: &PeerId) {
        self.outbound.write().await.remove(peer);
    }

    pub async fn send(&self, peer: &PeerId, frame: Frame) -> Result<(), TransportError> {
        let channel = {
            let map = self.outbound.read().await;
            map.get(peer)
                .cloned()
                .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?
        };
        channel.send(&frame).await
    }

    /// Accept loop: one spawned task per inbound connection, each reading
    /// frames in a loop and writing back at most one reply per frame.
    pub fn serve(self: Arc<Self>, engine: Arc<Engine>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let listener = match TcpListener::bind(self.listen_addr).await {
                Ok(l) => l,
                Err(err) => {
                    log::error!("{} failed to bind {}: {}", engine.id(), self.listen_addr, err);
                    return;
                }
            };
            log::info!("{} accepting connections at {}", engine.id(), self.listen_addr);

            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        log::debug!("{} accepted connection from {}", engine.id(), addr);
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, engine).await;
                        });
                    }
                    Err(err) => log::error!("accept failed: {}", err),
                }
            }
        })
    }
}

async fn handle_connection(stream: TcpStream, engine: Arc<Engine>) {
    let (rd, wr) = stream.into_split();
    let mut reader = FramedRead::new(rd, LinesCodec::new());
    let mut writer = FramedWrite::new(wr, LinesCodec::new());
    use futures::SinkExt;

    loop {
        match reader.next().await {
            Some(Ok(line)) => {
                // Block until the engine has finished (re)dialing its peer
                // set so frames arriving mid-reconfiguration observe the
                // new membership.
                while !engine.is_ready() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }

                let frame = match Frame::deserialize(&line) {
                    Ok(f) => f,
                    Err(err) => {
                        log::warn!("{} dropping malformed frame: {}", engine.id(), err);
                        continue;
                    }
                };

                if let Some(reply) = engine.handle_frame(frame).await {
                    match reply.serialize() {
                        Ok(line) => {
                            let line = line.trim_end_matches('\n').to_string();
                            if let Err(err) = writer.send(line).await {
                                log::error!("{} failed to write reply: {}", engine.id(), err);
                                break;
                            }
                        }
                        Err(err) => log::error!("{} failed to encode reply: {}", engine.id(), err),
                    }
                }
            }
            Some(Err(err)) => {
                log::error!("{} read error: {}", engine.id(), err);
                break;
            }
            None => {
                log::debug!("{} connection closed by peer", engine.id());
                break;
            }
        }
    }
}
