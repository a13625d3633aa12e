use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::protocol::Transport;
use crate::types::Address;

/// Raw inbound frames, shared between the listener tasks and the owner of
/// the node loop, which drains it into `ReplicaNode::deliver` every tick.
#[derive(Clone, Default)]
pub struct InboundQueue {
    frames: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, payload: Vec<u8>) {
        self.frames.lock().unwrap().push_back(payload);
    }

    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().unwrap().is_empty()
    }
}

/// Accepts peer connections and appends one frame per connection to the
/// inbound queue. The sender closes its write half to delimit the frame.
pub struct NetworkServer {
    queue: InboundQueue,
    listener: TcpListener,
}

impl NetworkServer {
    /// Binds the listening socket up front; the bound address is then
    /// available before `start` runs (binding port 0 picks a free port).
    pub async fn bind(queue: InboundQueue, address: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { queue, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn start(&self) -> std::io::Result<()> {
        debug!("listening on {}", self.local_addr()?);

        loop {
            let (socket, peer_addr) = self.listener.accept().await?;
            let queue = self.queue.clone();
            tokio::spawn(async move {
                if let Err(e) = read_frame(socket, queue).await {
                    warn!("error reading frame from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn read_frame(mut socket: TcpStream, queue: InboundQueue) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(1024);
    socket.read_to_end(&mut buf).await?;
    if !buf.is_empty() {
        queue.push(buf);
    }
    Ok(())
}

/// Fire-and-forget TCP sender: one connection per frame, delivery is
/// best-effort and failures are only logged. Must be constructed inside a
/// tokio runtime.
pub struct TcpTransport {
    handle: tokio::runtime::Handle,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, from: &Address, to: &Address, payload: Vec<u8>) -> bool {
        let to_addr: SocketAddr = match to.as_str().parse() {
            Ok(a) => a,
            Err(e) => {
                warn!("{}: unroutable peer address {}: {}", from, to, e);
                return false;
            }
        };
        self.handle.spawn(async move {
            match TcpStream::connect(to_addr).await {
                Ok(mut stream) => {
                    if let Err(e) = stream.write_all(&payload).await {
                        debug!("write to {} failed: {}", to_addr, e);
                        return;
                    }
                    let _ = stream.shutdown().await;
                }
                Err(e) => debug!("connect to {} failed: {}", to_addr, e),
            }
        });
        true
    }
}
