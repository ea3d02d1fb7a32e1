//! UDP convergence layer: one encoded bundle per datagram.
//!
//! The rx thread decodes datagrams into pool blocks and pushes them at the
//! storage flow's ingress; the tx thread pulls queued refs off the interface
//! flow's egress, emits their wire form, and transmits. The interface flow's
//! up/down state follows the socket lifecycle through `flow_modify_flags`.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};
use waypost_cache::{
    export_bundle, import_bundle, BlockId, FlowDir, Pool, FLOW_FLAG_ADMIN_UP, FLOW_FLAG_OPER_UP,
};
use waypost_cbor::{decode_bundle, MAX_BUNDLE_SIZE};

use crate::config::ClaConfig;
use crate::NodeError;

/// Patience for parking ingress pushes when the storage flow is saturated.
const INGRESS_PUSH_PATIENCE_MS: u64 = 1_000;

/// Socket poll granularity; bounds shutdown latency.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct UdpCla {
    running: Arc<AtomicBool>,
    rx_thread: Option<JoinHandle<()>>,
    tx_thread: Option<JoinHandle<()>>,
    pool: Arc<Pool>,
    flow: BlockId,
}

impl UdpCla {
    /// Bind the socket, mark the interface flow up, and spawn both sides.
    pub fn spawn(
        pool: Arc<Pool>,
        flow: BlockId,
        storage_flow: BlockId,
        config: &ClaConfig,
    ) -> Result<UdpCla, NodeError> {
        let socket = UdpSocket::bind(config.bind)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let tx_socket = socket.try_clone()?;
        let peer = config.peer;
        info!(bind = %config.bind, %peer, "udp convergence layer up");

        pool.flow_modify_flags(flow, FLOW_FLAG_ADMIN_UP | FLOW_FLAG_OPER_UP, 0);

        let running = Arc::new(AtomicBool::new(true));

        let rx_running = running.clone();
        let rx_pool = pool.clone();
        let rx_thread = std::thread::spawn(move || {
            let mut buf = vec![0u8; MAX_BUNDLE_SIZE + 1];
            while rx_running.load(Ordering::Relaxed) {
                let (len, from) = match socket.recv_from(&mut buf) {
                    Ok(got) => got,
                    Err(err)
                        if err.kind() == std::io::ErrorKind::WouldBlock
                            || err.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(err) => {
                        warn!(%err, "udp receive failed");
                        continue;
                    }
                };
                let decoded = match decode_bundle(&buf[..len]) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        debug!(%err, %from, "dropping malformed datagram");
                        continue;
                    }
                };
                let block = rx_pool.with_lock(|inner| import_bundle(inner, &decoded));
                let Some(block) = block else {
                    warn!("pool exhausted, dropping inbound bundle");
                    continue;
                };
                let deadline = rx_pool.now().offset(INGRESS_PUSH_PATIENCE_MS);
                if !rx_pool.flow_try_push(storage_flow, FlowDir::Ingress, block, deadline) {
                    warn!("storage ingress saturated, dropping inbound bundle");
                    rx_pool.with_lock(|inner| inner.recycle_block(block));
                }
            }
        });

        let tx_running = running.clone();
        let tx_pool = pool.clone();
        let tx_thread = std::thread::spawn(move || {
            while tx_running.load(Ordering::Relaxed) {
                let deadline = tx_pool.now().offset(POLL_INTERVAL.as_millis() as u64);
                let Some(rblk) = tx_pool.flow_try_pull(flow, FlowDir::Egress, deadline) else {
                    continue;
                };
                let wire = tx_pool.with_lock(|inner| export_bundle(inner, rblk));
                match wire {
                    Some(wire) => {
                        if let Err(err) = tx_socket.send_to(&wire, peer) {
                            warn!(%err, "udp transmit failed");
                        }
                    }
                    None => warn!("failed to emit queued bundle"),
                }
                // Consuming the ref tells the cache the attempt happened.
                tx_pool.with_lock(|inner| {
                    inner.recycle_block(rblk);
                    inner.collect();
                });
            }
        });

        Ok(UdpCla {
            running,
            rx_thread: Some(rx_thread),
            tx_thread: Some(tx_thread),
            pool,
            flow,
        })
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.pool
            .flow_modify_flags(self.flow, 0, FLOW_FLAG_OPER_UP);
        self.pool.flow_disable(self.flow);
        for handle in [self.rx_thread.take(), self.tx_thread.take()]
            .into_iter()
            .flatten()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for UdpCla {
    fn drop(&mut self) {
        if self.running.load(Ordering::Relaxed) {
            self.shutdown();
        }
    }
}


