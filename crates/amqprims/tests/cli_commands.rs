#![cfg(feature = "cli")]

use std::process::Command;

fn amqprims() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_amqprims"));
    cmd.env_remove("AMQP_HOST")
        .env_remove("AMQP_PORT")
        .arg("--log-level")
        .arg("error");
    cmd
}

#[test]
fn version_prints_package_version() {
    let output = amqprims()
        .arg("version")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        format!("amqprims {}", env!("CARGO_PKG_VERSION"))
    );
}

#[test]
fn refused_connection_exits_with_transport_code() {
    let output = amqprims()
        .args(["info", "--host", "127.0.0.1", "--port", "1", "--timeout", "2s"])
        .output()
        .expect("info should run");

    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("connect failed"));
}

#[test]
fn invalid_timeout_is_a_usage_error() {
    let output = amqprims()
        .args(["info", "--timeout", "0s"])
        .output()
        .expect("info should run");

    assert_eq!(output.status.code(), Some(64));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("duration must be greater than zero"));
}

#[test]
fn missing_subcommand_is_rejected_by_clap() {
    let output = amqprims().output().expect("binary should run");
    assert_eq!(output.status.code(), Some(2));
}
