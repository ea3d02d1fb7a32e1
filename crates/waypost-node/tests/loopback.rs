//! End-to-end smoke test: two in-process nodes bridged by the UDP
//! convergence layer over loopback.

use std::time::Duration;

use waypost_common::IpnAddr;
use waypost_node::{start, ClaConfig, Config};

fn node_config(self_eid: IpnAddr, bind_port: u16, peer_port: u16) -> Config {
    Config {
        self_eid,
        pool_bytes: 1024 * 1024,
        cla: Some(ClaConfig {
            bind: ([127, 0, 0, 1], bind_port).into(),
            peer: ([127, 0, 0, 1], peer_port).into(),
            queue_depth: 32,
        }),
        ..Config::default()
    }
}

#[test]
fn bundle_crosses_one_udp_hop_and_is_delivered() {
    let sender = start(node_config(IpnAddr::new(10, 1), 47831, 47832)).unwrap();
    let receiver = start(node_config(IpnAddr::new(20, 1), 47832, 47831)).unwrap();

    sender
        .submit(IpnAddr::new(20, 1), b"over the gap")
        .unwrap();

    let delivered = receiver
        .recv_delivered(Duration::from_secs(5))
        .expect("bundle should arrive within the window");
    assert_eq!(delivered.payload, b"over the gap");
    assert_eq!(delivered.source, IpnAddr::new(10, 1));

    receiver.shutdown();
    sender.shutdown();
}

#[test]
fn submit_without_cla_parks_the_bundle_in_storage() {
    let node = start(Config {
        self_eid: IpnAddr::new(3, 1),
        pool_bytes: 256 * 1024,
        ..Config::default()
    })
    .unwrap();
    let before = node.pool_stats();

    node.submit(IpnAddr::new(9, 1), b"held until an egress appears")
        .unwrap();

    // Give the scheduler a pass to admit the bundle.
    std::thread::sleep(Duration::from_millis(600));
    let after = node.pool_stats();
    assert!(
        after.in_use > before.in_use,
        "entry and bundle blocks retained in the pool"
    );
    node.shutdown();
}

