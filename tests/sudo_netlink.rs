//! Privileged integration tests (CAP_NET_ADMIN required).
//!
//! Run with `cargo test --features sudo-tests` under sudo; without the
//! feature this file compiles to nothing.
#![cfg(feature = "sudo-tests")]

use portod::config::{DeviceGroups, NetworkConfig};
use portod::netns::NetRegistry;
use portod::tc::ClassRequest;

#[tokio::test(flavor = "multi_thread")]
async fn test_host_init_prepares_managed_devices() {
    let cfg = NetworkConfig::default();
    let groups = DeviceGroups::default();

    let registry = NetRegistry::new();
    let host = registry.init_host(&cfg).expect("host namespace");
    host.refresh_devices(&cfg, &groups)
        .await
        .expect("device refresh");

    // Same inode resolves to the same shared instance.
    let again = registry.init_host(&cfg).expect("host singleton");
    assert_eq!(host.inode(), again.inode());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_container_classes_round_trip() {
    let cfg = NetworkConfig::default();
    let groups = DeviceGroups::default();

    let registry = NetRegistry::new();
    let host = registry.init_host(&cfg).expect("host namespace");
    host.refresh_devices(&cfg, &groups)
        .await
        .expect("device refresh");

    if host.managed_device_names().await.is_empty() {
        eprintln!("no managed devices, skipping");
        return;
    }

    host.create_container_classes(
        &cfg,
        4,
        Some(ClassRequest {
            rate: 1_000_000,
            ceil: 0,
            prio: 3,
        }),
    )
    .await
    .expect("class creation");

    host.destroy_container_classes(&cfg, 4)
        .await
        .expect("class teardown");
}
