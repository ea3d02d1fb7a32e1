//! Node runtime: wires the pool, cache, convergence layer, and offload
//! together, and drives the scheduler.
//!
//! Threading mirrors the storage core's model: CLA threads only touch flow
//! subqs and state flags; one scheduler thread owns the cache and runs every
//! job (flow state folds, ingress drains, FSM passes) to completion under
//! short critical sections.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver};
use tracing::{debug, info};
use waypost_cache::bblock::primary_locate_canonical;
use waypost_cache::{
    import_bundle, BlockId, Cache, CacheConfig, DeliveryPolicy, FlowDir, Pool, PoolStats,
};
use waypost_cbor::{decode_bundle, encode_bundle};
use waypost_common::block::CanonicalData;
use waypost_common::{
    BlockType, CanonicalHeader, Clock, CreationTimestamp, CrcType, IpnAddr, PrimaryFields,
    SystemClock,
};

use crate::cla::UdpCla;
use crate::config::Config;
use crate::offload_fs::FsOffload;
use crate::NodeError;

/// Scheduler pass interval when no job wakes it earlier.
const SCHED_TICK_MS: u64 = 200;

/// Lifetime stamped on locally submitted bundles.
const LOCAL_LIFETIME_MS: u64 = 86_400_000;

/// Patience for ingress pushes from the local application.
const SUBMIT_PATIENCE_MS: u64 = 1_000;

/// A bundle payload that reached this node as its final destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub source: IpnAddr,
    pub payload: Vec<u8>,
}

/// Running node; dropping it shuts everything down.
pub struct NodeHandle {
    pool: Arc<Pool>,
    storage_flow: BlockId,
    self_eid: IpnAddr,
    next_seq: AtomicU64,
    running: Arc<AtomicBool>,
    scheduler: Option<JoinHandle<()>>,
    delivery: Option<JoinHandle<()>>,
    cla: Option<UdpCla>,
    delivered: Receiver<Delivered>,
}

/// Bring a node up from configuration.
pub fn start(config: Config) -> Result<NodeHandle, NodeError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pool = Arc::new(Pool::new(config.pool_bytes, clock));

    let mut cache = Cache::new(
        pool.clone(),
        CacheConfig {
            self_addr: config.self_eid,
            ingress_limit: config.ingress_limit,
            delivery_policy: DeliveryPolicy::CustodyTracking,
            local_retx_interval: config.retx_interval_ms,
        },
    )?;
    if let Some(dir) = &config.offload_dir {
        cache.set_offload(Box::new(FsOffload::open(dir.clone())?));
        info!(dir = %dir.display(), "offload backend attached");
    }

    let queue_depth = config.cla.as_ref().map(|c| c.queue_depth).unwrap_or(64);
    let (cla_flow, delivery_flow) = pool.with_lock(|inner| {
        (
            inner.alloc_flow(queue_depth, queue_depth),
            inner.alloc_flow(0, queue_depth),
        )
    });
    let cla_flow = cla_flow.ok_or(NodeError::PoolExhausted)?;
    let delivery_flow = delivery_flow.ok_or(NodeError::PoolExhausted)?;
    cache.set_egress_flow(cla_flow);
    cache.set_delivery_flow(delivery_flow);
    let storage_flow = cache.flow_id();

    let cla = match &config.cla {
        Some(cla_config) => Some(UdpCla::spawn(
            pool.clone(),
            cla_flow,
            storage_flow,
            cla_config,
        )?),
        None => None,
    };

    let running = Arc::new(AtomicBool::new(true));
    let (deliver_tx, delivered) = bounded(64);

    let delivery = {
        let running = running.clone();
        let pool = pool.clone();
        std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                let deadline = pool.now().offset(SCHED_TICK_MS);
                let Some(rblk) = pool.flow_try_pull(delivery_flow, FlowDir::Egress, deadline)
                else {
                    continue;
                };
                let delivered = pool.with_lock(|inner| {
                    let source = inner.primary(rblk)?.fields.source;
                    let payload_blk = primary_locate_canonical(inner, rblk, BlockType::Payload)?;
                    match &inner.canonical(payload_blk)?.data {
                        CanonicalData::Payload(bytes) => Some(Delivered {
                            source,
                            payload: bytes.to_vec(),
                        }),
                        _ => None,
                    }
                });
                if let Some(item) = delivered {
                    debug!(source = %item.source, len = item.payload.len(), "delivered");
                    // If the application is not reading, newer traffic wins.
                    let _ = deliver_tx.try_send(item);
                }
                pool.with_lock(|inner| {
                    inner.recycle_block(rblk);
                    inner.collect();
                });
            }
        })
    };

    let scheduler = {
        let running = running.clone();
        let pool = pool.clone();
        std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                let deadline = pool.now().offset(SCHED_TICK_MS);
                pool.wait_for_work(deadline);
                for job in pool.take_active_jobs() {
                    for event in pool.flow_fold_state(job) {
                        cache.handle_flow_event(job, event);
                    }
                }
                cache.process_pending();
                pool.maintain();
            }
        })
    };

    info!(self_eid = %config.self_eid, "waypost node started");
    Ok(NodeHandle {
        pool,
        storage_flow,
        self_eid: config.self_eid,
        next_seq: AtomicU64::new(0),
        running,
        scheduler: Some(scheduler),
        delivery: Some(delivery),
        cla,
        delivered,
    })
}

impl NodeHandle {
    /// Submit an application payload for transfer to `destination`.
    ///
    /// Locally sourced bundles take the same admission path as received
    /// ones, so custody bookkeeping and retransmission apply uniformly.
    pub fn submit(&self, destination: IpnAddr, payload: &[u8]) -> Result<(), NodeError> {
        let sequence = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let now = self.pool.now();
        let primary = PrimaryFields {
            flags: 0,
            crc_type: CrcType::Crc16,
            destination,
            source: self.self_eid,
            report_to: self.self_eid,
            timestamp: CreationTimestamp {
                time: now.ms(),
                sequence,
            },
            lifetime: LOCAL_LIFETIME_MS,
        };
        let blocks = [(
            CanonicalHeader {
                block_type: BlockType::Payload,
                block_num: 1,
                flags: 0,
                crc_type: CrcType::Crc16,
            },
            CanonicalData::Payload(Bytes::copy_from_slice(payload)),
        )];
        let wire = encode_bundle(&primary, &blocks);
        self.ingest_wire(&wire)
    }

    /// Feed an already-encoded bundle into storage, as a CLA would.
    pub fn ingest_wire(&self, wire: &[u8]) -> Result<(), NodeError> {
        let decoded = decode_bundle(wire)?;
        let block = self
            .pool
            .with_lock(|inner| import_bundle(inner, &decoded))
            .ok_or(NodeError::PoolExhausted)?;
        let deadline = self.pool.now().offset(SUBMIT_PATIENCE_MS);
        if !self
            .pool
            .flow_try_push(self.storage_flow, FlowDir::Ingress, block, deadline)
        {
            self.pool.with_lock(|inner| inner.recycle_block(block));
            return Err(NodeError::Backpressure);
        }
        Ok(())
    }

    /// Receive the next bundle delivered to this node, if one arrives in
    /// time.
    pub fn recv_delivered(&self, timeout: Duration) -> Option<Delivered> {
        self.delivered.recv_timeout(timeout).ok()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn self_eid(&self) -> IpnAddr {
        self.self_eid
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        if let Some(mut cla) = self.cla.take() {
            cla.shutdown();
        }
        for handle in [self.scheduler.take(), self.delivery.take()]
            .into_iter()
            .flatten()
        {
            let _ = handle.join();
        }
        info!("waypost node stopped");
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.stop();
    }
}


