//! Repeated start/stop cycles must not leak descriptors in the controller

use std::net::TcpListener;
use std::time::Duration;

use sighttpd::{Daemon, DaemonConfig, ServeMode, WorkerExit};

const CYCLES: usize = 100;

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn cycle(port: u16) {
    let mut daemon = Daemon::new(DaemonConfig {
        address: "127.0.0.1".to_string(),
        port,
        mode: ServeMode::Concurrent,
        ..DaemonConfig::new(env!("CARGO_BIN_EXE_sighttpd"))
    });

    let started = daemon.start().await.unwrap();
    assert!(started.readiness.is_ready());

    let report = daemon.stop().await;
    assert_eq!(report.exit, WorkerExit::Exited(0));
    assert!(!report.forced);
}

#[tokio::test]
async fn test_no_descriptor_leak() {
    let port = free_port();

    // Runtime and process driver descriptors are created lazily
    cycle(port).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let baseline = open_fds();

    for _ in 0..CYCLES {
        cycle(port).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = open_fds();

    // A per-cycle leak would show up as at least CYCLES extra descriptors
    assert!(
        after <= baseline + 2,
        "descriptors grew from {} to {}",
        baseline,
        after
    );

    let rebound = TcpListener::bind(("127.0.0.1", port));
    assert!(rebound.is_ok(), "port {} not re-bindable: {:?}", port, rebound.err());
}
