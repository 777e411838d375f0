use std::{
    fs,
    process::{Command, Output},
};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn spmd_run(args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_spmd-run"));
    for key in [
        "SPMD_WORKER",
        "SPMD_DEVICE",
        "SPMD_NUM_PROCESSES",
        "SPMD_ISOLATION",
        "SPMD_ASYNC_CLIENT",
        "CPU_NUM_DEVICES",
        "SPMD_WRITE_LOG",
        "RUST_LOG",
        "WRITE_RUST_LOG",
    ] {
        command.env_remove(key);
    }
    command
        .arg("run")
        .args(["--logs", "none", "--job-timeout", "60"])
        .args(args)
        .output()
        .expect("failed to run spmd-run")
}

fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "spmd-run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is not json")
}

#[test]
fn test_global_ordinals_across_processes() {
    let output = spmd_run(&[
        "--task",
        "global-ordinal",
        "--num-processes",
        "2",
        "--devices-per-process",
        "2",
    ]);
    assert_eq!(
        stdout_json(&output),
        json!({"0": {"0": 0, "1": 1}, "1": {"2": 2, "3": 3}})
    );
}

#[test]
fn test_devices_follow_local_ordinals() {
    let output = spmd_run(&[
        "--task",
        "device",
        "--num-processes",
        "2",
        "--devices-per-process",
        "2",
    ]);
    assert_eq!(
        stdout_json(&output),
        json!({
            "0": {"0": "cpu:0", "1": "cpu:1"},
            "1": {"2": "cpu:0", "3": "cpu:1"}
        })
    );
}

#[test]
fn test_broadcast_agrees_across_processes() {
    let output = spmd_run(&[
        "--task",
        "broadcast",
        "--num-processes",
        "3",
        "--devices-per-process",
        "1",
    ]);
    let result = stdout_json(&output);
    let values: Vec<&Value> = (0..3)
        .map(|ordinal| &result[ordinal.to_string()][ordinal.to_string()])
        .collect();
    assert!(values[0].is_u64(), "{result}");
    assert!(values.iter().all(|value| *value == values[0]), "{result}");
}

#[test]
fn test_all_reduce_in_threads() {
    let output = spmd_run(&[
        "--task",
        "all-reduce",
        "--isolation",
        "threads",
        "--num-processes",
        "1",
        "--devices-per-process",
        "4",
    ]);
    let expected = json!([1.0, 1.5]);
    assert_eq!(
        stdout_json(&output),
        json!({"0": {"0": expected, "1": expected, "2": expected, "3": expected}})
    );
}

#[test]
fn test_injected_failure_is_attributed() {
    let output = spmd_run(&[
        "--task",
        "mesh-reduce",
        "--num-processes",
        "2",
        "--devices-per-process",
        "2",
        "--fail-on-ordinal",
        "2",
        "--collective-timeout",
        "30",
    ]);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("user_error on process 1 ordinal 2"),
        "{stderr}"
    );
    assert!(stderr.contains("injected failure on ordinal 2"), "{stderr}");
}

#[test]
fn test_worker_process_exit_fails_the_job() {
    let output = spmd_run(&[
        "--task",
        "mesh-reduce",
        "--num-processes",
        "2",
        "--devices-per-process",
        "2",
        "--exit-on-ordinal",
        "2",
        "--collective-timeout",
        "30",
    ]);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    // the exit monitor and the dropped connection race to report it first
    assert!(
        stderr.contains("crashed on process 1") || stderr.contains("disconnected on process 1"),
        "{stderr}"
    );
}

#[test]
fn test_write_log_appends_detailed_logs() {
    let path = std::env::temp_dir().join(format!("spmd-run-{}.log", std::process::id()));
    let _ = fs::remove_file(&path);

    let output = spmd_run(&[
        "--task",
        "global-ordinal",
        "--isolation",
        "threads",
        "--devices-per-process",
        "2",
        "--write-log",
        path.to_str().unwrap(),
    ]);
    stdout_json(&output);

    let logs = fs::read_to_string(&path).unwrap();
    let _ = fs::remove_file(&path);
    assert!(logs.contains("launching job"), "{logs}");
    assert!(logs.contains("spmd-run/global-ordinal"), "{logs}");
}

#[test]
fn test_invalid_device_count_fails_before_launch() {
    let output = spmd_run(&["--task", "global-ordinal", "--devices-per-process", "0"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("device count must be positive, got 0"),
        "{stderr}"
    );
}
