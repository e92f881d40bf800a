//! SIGTERM handling. Kept in its own test binary because it signals the
//! whole test process.

#![cfg(unix)]

use std::time::Duration;
use runrelay::shutdown::on_termination_signal;

#[tokio::test]
async fn sigterm_cancels_the_shutdown_token() {
    let token = on_termination_signal().unwrap();
    assert!(!token.is_cancelled());

    let status = std::process::Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    tokio::time::timeout(Duration::from_secs(5), token.cancelled())
        .await
        .expect("SIGTERM did not cancel the token");
}
