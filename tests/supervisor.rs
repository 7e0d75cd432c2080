// Supervisor scenarios driven by shell scripts standing in for the stack binary.
#![cfg(unix)]

use gpio_bacnet_bridge::config::{DeviceSettings, NetworkSettings, StackOptions, StackSettings};
use gpio_bacnet_bridge::supervisor::{
    DeviceIdentity, NetworkParams, ProcessState, ProcessSupervisor, StartOutcome, SupervisorError,
};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Instant;
use tempfile::tempdir;
use tokio::sync::Mutex;

// Writing an executable while another test forks can fail with ETXTBSY.
static SERIAL: Mutex<()> = Mutex::const_new(());

fn write_stack(dir: &Path, body: &str) {
    let path = dir.join("stack");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut permissions = std::fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).unwrap();
}

fn settings(dir: &Path) -> StackSettings {
    StackSettings {
        dir: dir.to_path_buf(),
        binary: "stack".to_string(),
        clean_command: vec!["true".to_string()],
        build_timeout_secs: 10,
        startup_grace_secs: 2,
        stop_grace_secs: 1,
        ..StackSettings::default()
    }
}

fn identity() -> DeviceIdentity {
    DeviceIdentity::from(&DeviceSettings::default())
}

fn network() -> NetworkParams {
    NetworkParams::from(&NetworkSettings::default())
}

#[tokio::test]
async fn test_failed_build_never_spawns() {
    let _serial = SERIAL.lock().await;
    let dir = tempdir().unwrap();
    let mut supervisor = ProcessSupervisor::new(StackSettings {
        build_command: vec!["/nonexistent/toolchain/make".to_string()],
        ..settings(dir.path())
    });

    let result = supervisor.start(&identity(), &network(), &StackOptions::default()).await;
    assert!(matches!(result, Err(SupervisorError::BuildFailed(_))));

    let status = supervisor.status();
    assert_eq!(status.state, ProcessState::Failed);
    assert!(!status.running);
    assert!(status.pid.is_none());
}

#[tokio::test]
async fn test_build_on_demand_then_start() {
    let _serial = SERIAL.lock().await;
    let dir = tempdir().unwrap();
    let script = "printf '#!/bin/sh\\necho \"CC=%s\"\\necho Ready to go\\nexec sleep 30\\n' \"$CC\" > stack && chmod +x stack";
    let mut supervisor = ProcessSupervisor::new(StackSettings {
        build_command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        ..settings(dir.path())
    });
    assert_eq!(supervisor.status().state, ProcessState::NotBuilt);

    let outcome = supervisor.start(&identity(), &network(), &StackOptions::default()).await;
    assert_eq!(outcome.unwrap(), StartOutcome::Confirmed);
    assert!(supervisor.status().running);

    supervisor.stop().await;
    assert_eq!(supervisor.status().state, ProcessState::Stopped);
}

#[tokio::test]
async fn test_exit_during_startup_reports_code() {
    let _serial = SERIAL.lock().await;
    let dir = tempdir().unwrap();
    write_stack(dir.path(), "echo \"error: cannot bind to port\"\nexit 3");
    let mut supervisor = ProcessSupervisor::new(settings(dir.path()));

    let result = supervisor.start(&identity(), &network(), &StackOptions::default()).await;
    match result {
        Err(SupervisorError::ProcessExitedDuringStartup { code, diagnostics }) => {
            assert_eq!(code, Some(3));
            assert_eq!(diagnostics, vec!["error: cannot bind to port".to_string()]);
        }
        other => panic!("unexpected start result {:?}", other),
    }

    let status = supervisor.status();
    assert!(!status.running);
    assert_eq!(status.state, ProcessState::Failed);
    assert_eq!(status.exit_code, Some(3));
}

#[tokio::test]
async fn test_confirmed_start_and_stop() {
    let _serial = SERIAL.lock().await;
    let dir = tempdir().unwrap();
    write_stack(dir.path(), "echo \"LocalIP=127.0.0.1\"\nexec sleep 30");
    let mut supervisor = ProcessSupervisor::new(settings(dir.path()));

    let outcome = supervisor.start(&identity(), &network(), &StackOptions::default()).await;
    assert_eq!(outcome.unwrap(), StartOutcome::Confirmed);

    let status = supervisor.status();
    assert_eq!(status.state, ProcessState::Running);
    assert!(status.running);
    assert!(status.pid.is_some());
    assert!(status.confirmed);
    assert_eq!(status.identity.unwrap().device_id, 25411);

    let second = supervisor.start(&identity(), &network(), &StackOptions::default()).await;
    assert!(matches!(second, Err(SupervisorError::AlreadyRunning(_))));

    supervisor.stop().await;
    let status = supervisor.status();
    assert_eq!(status.state, ProcessState::Stopped);
    assert!(!status.running);
    assert!(status.pid.is_none());

    // A second stop has nothing to do.
    supervisor.stop().await;
    assert_eq!(supervisor.status().state, ProcessState::Stopped);
}

#[tokio::test]
async fn test_invalid_utf8_output_does_not_hide_marker() {
    let _serial = SERIAL.lock().await;
    let dir = tempdir().unwrap();
    write_stack(dir.path(), "printf 'name=\\377\\n'\necho \"Ready to go\"\nexec sleep 30");
    let mut supervisor = ProcessSupervisor::new(settings(dir.path()));

    let outcome = supervisor.start(&identity(), &network(), &StackOptions::default()).await;
    assert_eq!(outcome.unwrap(), StartOutcome::Confirmed);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_large_output_after_invalid_utf8_keeps_draining() {
    let _serial = SERIAL.lock().await;
    let dir = tempdir().unwrap();
    // Far more than a pipe buffer, so the child blocks unless the reader keeps up.
    write_stack(
        dir.path(),
        "printf '\\377\\n'\ni=0\nwhile [ $i -lt 4000 ]; do\n  echo \"filler line $i with padding padding padding\"\n  i=$((i+1))\ndone\necho \"error: giving up\" >&2\nexit 7",
    );
    let mut supervisor = ProcessSupervisor::new(StackSettings {
        startup_grace_secs: 5,
        ..settings(dir.path())
    });

    let result = supervisor.start(&identity(), &network(), &StackOptions::default()).await;
    match result {
        Err(SupervisorError::ProcessExitedDuringStartup { code, diagnostics }) => {
            assert_eq!(code, Some(7));
            assert_eq!(diagnostics, vec!["error: giving up".to_string()]);
        }
        other => panic!("unexpected start result {:?}", other),
    }
    assert!(!supervisor.status().running);
}

#[tokio::test]
async fn test_unconfirmed_start_is_soft_success() {
    let _serial = SERIAL.lock().await;
    let dir = tempdir().unwrap();
    write_stack(dir.path(), "echo \"waiting for network\"\nexec sleep 30");
    let mut supervisor = ProcessSupervisor::new(StackSettings {
        startup_grace_secs: 1,
        ..settings(dir.path())
    });

    let outcome = supervisor.start(&identity(), &network(), &StackOptions::default()).await;
    assert_eq!(outcome.unwrap(), StartOutcome::Unconfirmed);
    let status = supervisor.status();
    assert!(status.running);
    assert!(!status.confirmed);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_stop_escalates_when_term_is_ignored() {
    let _serial = SERIAL.lock().await;
    let dir = tempdir().unwrap();
    write_stack(dir.path(), "trap '' TERM\necho \"Ready to go\"\nexec sleep 30");
    let mut supervisor = ProcessSupervisor::new(settings(dir.path()));

    let outcome = supervisor.start(&identity(), &network(), &StackOptions::default()).await;
    assert_eq!(outcome.unwrap(), StartOutcome::Confirmed);

    let started = Instant::now();
    supervisor.stop().await;
    assert!(started.elapsed().as_secs() < 10);

    let status = supervisor.status();
    assert_eq!(status.state, ProcessState::Stopped);
    assert!(!status.running);
}

#[tokio::test]
async fn test_command_line_reaches_binary() {
    let _serial = SERIAL.lock().await;
    let dir = tempdir().unwrap();
    write_stack(dir.path(), "echo \"error-check $*\"\necho \"Ready to go\"\nexec sleep 30");
    let mut supervisor = ProcessSupervisor::new(settings(dir.path()));

    let identity = DeviceIdentity {
        device_id: 4321,
        vendor_id: 7,
        name: "Bench".to_string(),
    };
    let network = NetworkParams {
        ip: None,
        port: 47900,
        interface: "eth9".to_string(),
    };
    let options = StackOptions {
        ethernet_enable: false,
        apdu_timeout: 3,
        debug_level: 1,
        initial_query: true,
        http_server: false,
    };
    supervisor.start(&identity, &network, &options).await.unwrap();

    let line = supervisor
        .diagnostics()
        .into_iter()
        .find(|l| l.starts_with("error-check"))
        .unwrap();
    assert!(line.starts_with("error-check -d4321 -v7 -p47900 -i"));
    assert!(line.ends_with("-e0 -t3 -D1 -q1 -h0"));

    supervisor.stop().await;
}
