//! Userspace backend against a stand-in wireguard-go executable

use meshlink_common::{Error, UserspaceConfig};
use meshlink_net::link::{Manager, Platform, SystemRunner, UserspaceManager, WgControl};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Shell script that behaves like a daemonising driver: publishes `real`
/// as the interface name, creates the control socket placeholder and exits.
fn write_driver(dir: &Path, file: &str, real: &str) -> PathBuf {
    let path = dir.join(file);
    let script = format!(
        "#!/bin/sh\nset -e\ndir=$(dirname \"$WG_TUN_NAME_FILE\")\n: > \"$dir/{real}.sock\"\nprintf '{real}\\n' > \"$WG_TUN_NAME_FILE\"\n"
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn manager(run_dir: &Path, driver: &Path) -> UserspaceManager {
    let config = UserspaceConfig {
        run_dir: run_dir.to_path_buf(),
        driver_path: driver.to_string_lossy().to_string(),
        driver_publishes_name: true,
        exit_timeout_secs: 1,
        descriptor_poll_attempts: 20,
        descriptor_poll_interval_ms: 10,
    };
    UserspaceManager::new(
        config,
        Platform::current(),
        Arc::new(SystemRunner),
        Arc::new(WgControl::userspace()),
    )
    .unwrap()
}

// Both scenarios share one test so no other thread forks while a script is
// being written.
#[tokio::test]
async fn test_driver_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path().join("run");
    let loopback = if cfg!(target_os = "macos") { "lo0" } else { "lo" };

    let gone = write_driver(dir.path(), "driver-gone.sh", "utun42");
    let stuck = write_driver(dir.path(), "driver-stuck.sh", loopback);

    // the driver publishes utun42, which never exists on the host, so
    // teardown completes as soon as the files are gone
    let mgr = manager(&run_dir, &gone);
    let link = mgr.create_link("mesh-test").await.unwrap();
    assert_eq!(link.name(), "mesh-test");
    assert_eq!(link.interface(), "utun42");
    assert!(run_dir.join("utun42.sock").exists());

    assert!(mgr
        .create_link("mesh-test")
        .await
        .err()
        .unwrap()
        .is_already_exists());
    assert_eq!(
        mgr.get_link("mesh-test").await.unwrap().interface(),
        "utun42"
    );
    assert_eq!(mgr.links().await.unwrap().len(), 1);

    mgr.del_link("mesh-test").await.unwrap();
    assert!(!run_dir.join("utun42.sock").exists());
    assert!(mgr.get_link("mesh-test").await.err().unwrap().is_not_found());
    assert!(mgr.del_link("mesh-test").await.unwrap_err().is_not_found());

    // an interface that never goes away must surface as a failed teardown
    let mgr = manager(&run_dir, &stuck);
    mgr.create_link("mesh-stuck").await.unwrap();
    let err = mgr.del_link("mesh-stuck").await.unwrap_err();
    assert!(matches!(err, Error::Fatal(_)), "unexpected error: {err}");
    assert!(mgr.get_link("mesh-stuck").await.err().unwrap().is_not_found());
}
