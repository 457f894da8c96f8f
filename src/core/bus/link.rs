// src/core/bus/link.rs

//! Per-peer bus links: refcounted outgoing message blocks, FIFO send queues
//! with a byte budget, and the reader/writer tasks serving one TCP stream.

use crate::core::gossip::{self, now_ms};
use crate::core::protocol::codec::{BusCodec, RCVBUF_INIT_LEN};
use crate::core::protocol::message::MsgType;
use crate::core::state::Cluster;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Notify, mpsc};
use tokio_util::codec::FramedRead;
use tracing::debug;

/// Upper bound on bytes written per writer wake-up, so one fat queue cannot
/// monopolize the task.
pub const MAX_WRITES_PER_EVENT: usize = 64 * 1024;

/// Timeout for outbound bus connection attempts.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A reference-counted, immutable, already-encoded bus packet. Broadcasts
/// enqueue the same block on many links; each queue holds one `Arc` clone
/// and the block is dropped once the last queue releases it.
#[derive(Debug)]
pub struct MsgBlock {
    pub mtype: MsgType,
    pub data: Bytes,
}

impl MsgBlock {
    pub fn new(mtype: MsgType, data: Bytes) -> Self {
        MsgBlock { mtype, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The shared handle of one half-duplex link. The socket itself lives in the
/// reader/writer tasks; the handle is what the node table owns.
#[derive(Debug)]
pub struct LinkHandle {
    pub id: u64,
    pub inbound: bool,
    /// Creation timestamp, unix ms.
    pub ctime: u64,
    /// Owning node, unset for a just-accepted inbound link.
    pub node: Option<crate::core::node::NodeId>,
    /// The peer socket IP, used when the sender announces no address.
    pub peer_ip: String,
    tx: mpsc::UnboundedSender<Arc<MsgBlock>>,
    queue_mem: Arc<AtomicUsize>,
    closer: Arc<Notify>,
}

impl LinkHandle {
    /// Appends a block to the send queue. Never blocks; the writer task
    /// drains in FIFO order.
    pub fn enqueue(&self, block: Arc<MsgBlock>) {
        self.queue_mem.fetch_add(block.len(), Ordering::Relaxed);
        // A send failure means the writer already exited; the cron will
        // notice the dead link and reconnect.
        let _ = self.tx.send(block);
    }

    /// Bytes currently queued toward the peer.
    pub fn send_queue_mem(&self) -> usize {
        self.queue_mem.load(Ordering::Relaxed)
    }

    /// Stops both tasks of the link. Queued blocks are released unsent.
    pub fn close(&self) {
        self.closer.notify_waiters();
    }
}

/// Wraps a connected socket into a registered link with its reader and
/// writer tasks. Returns the new link id.
pub fn establish_link(
    cluster: &Arc<Cluster>,
    stream: TcpStream,
    node: Option<crate::core::node::NodeId>,
    inbound: bool,
) -> u64 {
    let _ = stream.set_nodelay(true);
    let peer_ip = stream
        .peer_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_default();
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let queue_mem = Arc::new(AtomicUsize::new(0));
    let closer = Arc::new(Notify::new());

    let link_id = {
        let mut meta = cluster.lock();
        let id = meta.alloc_link_id();
        meta.register_link(LinkHandle {
            id,
            inbound,
            ctime: now_ms(),
            node,
            peer_ip,
            tx,
            queue_mem: Arc::clone(&queue_mem),
            closer: Arc::clone(&closer),
        });
        if let Some(node_id) = node {
            match meta.nodes.get_mut(&node_id) {
                Some(n) => n.connecting = false,
                // The node was forgotten while we were connecting.
                None => {
                    meta.free_link(id);
                    return id;
                }
            }
        }
        id
    };

    tokio::spawn(reader_task(
        Arc::clone(cluster),
        link_id,
        read_half,
        Arc::clone(&closer),
    ));
    tokio::spawn(writer_task(
        Arc::clone(cluster),
        link_id,
        write_half,
        rx,
        queue_mem,
        closer,
    ));
    link_id
}

/// Connects to a peer's bus port and, on success, sends the initial PING or
/// MEET. Spawned by the cron for every node lacking an outbound link.
pub async fn connect_to_node(
    cluster: Arc<Cluster>,
    node_id: crate::core::node::NodeId,
    ip: String,
    bus_port: u16,
) {
    let addr = format!("{ip}:{bus_port}");
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            let link_id = establish_link(&cluster, stream, Some(node_id), false);
            gossip::on_link_connected(&cluster, node_id, link_id);
            crate::core::cron::before_sleep(&cluster);
        }
        other => {
            if let Ok(Err(e)) = other {
                debug!("Connecting to {addr} failed: {e}");
            } else {
                debug!("Connecting to {addr} timed out");
            }
            let mut meta = cluster.lock();
            if let Some(node) = meta.nodes.get_mut(&node_id) {
                node.connecting = false;
            }
        }
    }
}

async fn reader_task(
    cluster: Arc<Cluster>,
    link_id: u64,
    read_half: tokio::net::tcp::OwnedReadHalf,
    closer: Arc<Notify>,
) {
    let mut framed = FramedRead::with_capacity(read_half, BusCodec::new(), RCVBUF_INIT_LEN);
    loop {
        tokio::select! {
            _ = closer.notified() => return,
            item = framed.next() => match item {
                Some(Ok(msg)) => {
                    gossip::process_packet(&cluster, link_id, msg);
                    crate::core::cron::before_sleep(&cluster);
                }
                Some(Err(e)) => {
                    debug!("Resetting bus link {link_id}: {e}");
                    break;
                }
                None => {
                    debug!("Bus link {link_id} closed by peer");
                    break;
                }
            }
        }
    }
    cluster.lock().free_link(link_id);
}

async fn writer_task(
    cluster: Arc<Cluster>,
    link_id: u64,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Arc<MsgBlock>>,
    queue_mem: Arc<AtomicUsize>,
    closer: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = closer.notified() => return,
            block = rx.recv() => {
                let Some(block) = block else { return };
                let result = write_block(&mut write_half, &block).await;
                queue_mem.fetch_sub(block.len(), Ordering::Relaxed);
                if let Err(e) = result {
                    debug!("Write on bus link {link_id} failed: {e}");
                    cluster.lock().free_link(link_id);
                    return;
                }
            }
        }
    }
}

/// Writes one block, capped at `MAX_WRITES_PER_EVENT` bytes per burst so a
/// large packet yields between chunks.
async fn write_block(write_half: &mut OwnedWriteHalf, block: &MsgBlock) -> std::io::Result<()> {
    let data = &block.data;
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + MAX_WRITES_PER_EVENT).min(data.len());
        write_half.write_all(&data[offset..end]).await?;
        offset = end;
        if offset < data.len() {
            tokio::task::yield_now().await;
        }
    }
    Ok(())
}
