#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/plcli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn pipelink(dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_pipelink"));
    cmd.arg("--log-level").arg("error").arg("--dir").arg(dir);
    cmd
}

fn spawn_server(dir: &Path, name: &str, extra: &[&str]) -> Child {
    let child = pipelink(dir)
        .arg("--format")
        .arg("json")
        .arg("serve")
        .arg(name)
        .args(extra)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("serve command should start");

    let rendezvous = dir.join(format!("{name}.sock"));
    let deadline = Instant::now() + Duration::from_secs(5);
    while !rendezvous.exists() {
        assert!(Instant::now() < deadline, "server never bound {rendezvous:?}");
        thread::sleep(Duration::from_millis(25));
    }
    child
}

fn wait_with_timeout(mut child: Child, timeout: Duration) -> Output {
    let deadline = Instant::now() + timeout;
    loop {
        if child.try_wait().expect("child status").is_some() {
            return child.wait_with_output().expect("child output");
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("child did not exit in time");
        }
        thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn send_wait_receives_echo() {
    let dir = unique_temp_dir("echo");
    let server = spawn_server(&dir, "fanctl", &["--echo", "--count", "1"]);

    let output = pipelink(&dir)
        .arg("--format")
        .arg("json")
        .arg("send")
        .arg("fanctl")
        .arg("--json")
        .arg(r#"{"fan":2,"percent":70}"#)
        .arg("--wait")
        .arg("--timeout")
        .arg("5s")
        .output()
        .expect("send should run");
    assert!(
        output.status.success(),
        "send failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let line = String::from_utf8(output.stdout).expect("utf8 stdout");
    let reply: serde_json::Value =
        serde_json::from_str(line.trim()).expect("send should print one JSON line");
    assert_eq!(reply["message"]["fan"], 2);
    assert_eq!(reply["message"]["percent"], 70);

    let server_output = wait_with_timeout(server, Duration::from_secs(5));
    assert!(server_output.status.success());
    let printed = String::from_utf8(server_output.stdout).expect("utf8 stdout");
    let received: serde_json::Value =
        serde_json::from_str(printed.trim()).expect("serve should print one JSON line");
    assert_eq!(received["pipe"], "fanctl_1");
    assert_eq!(received["message"]["percent"], 70);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn send_without_server_times_out() {
    let dir = unique_temp_dir("absent");

    let output = pipelink(&dir)
        .arg("send")
        .arg("nobody")
        .arg("--json")
        .arg("1")
        .arg("--timeout")
        .arg("300ms")
        .output()
        .expect("send should run");

    assert_eq!(output.status.code(), Some(124));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("nobody"), "stderr: {stderr}");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn send_rejects_invalid_json() {
    let dir = unique_temp_dir("badjson");

    let output = pipelink(&dir)
        .arg("send")
        .arg("fanctl")
        .arg("--json")
        .arg("{not json")
        .output()
        .expect("send should run");

    assert_eq!(output.status.code(), Some(64));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn version_prints_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_pipelink"))
        .arg("version")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).expect("utf8 stdout");
    assert_eq!(
        stdout.trim(),
        format!("pipelink {}", env!("CARGO_PKG_VERSION"))
    );
}
