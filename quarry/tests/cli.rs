use assert_cmd::Command;

fn quarry() -> Command {
    let mut cmd = Command::cargo_bin("quarry").unwrap();
    cmd.env("LOG_FILTER", "warn")
        .env_remove("QUARRY_WORKFLOW_DSN")
        .env_remove("QUARRY_CATALOG_DSN")
        .env_remove("QUARRY_DESTINATION_BUCKET");
    cmd
}

fn message_line(message_id: &str, key: &str) -> String {
    let body = serde_json::json!({
        "Records": [{
            "eventName": "ObjectCreated:Put",
            "awsRegion": "us-east-1",
            "s3": {"bucket": {"name": "raw"}, "object": {"key": key}},
        }]
    });
    serde_json::json!({"message_id": message_id, "body": body.to_string()}).to_string()
}

#[test]
fn help() {
    let output = quarry().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    for command in ["catalog", "worker", "dispatch", "workflow"] {
        assert!(stdout.contains(command), "{command} missing from:\n{stdout}");
    }
}

#[test]
fn dispatch_deduplicates_redelivery() {
    let line = message_line("m1", "tenant_id=acme/table=web_requests/part-001.json");
    let output = quarry()
        .args([
            "dispatch",
            "--workflow-dsn",
            "memory",
            "--destination-bucket",
            "lake",
        ])
        .write_stdin(format!("{line}\n{line}\n"))
        .output()
        .unwrap();

    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(
        String::from_utf8(output.stdout).unwrap().trim(),
        "started=1 deduplicated=1 skipped=0"
    );
}

#[test]
fn dispatch_fails_on_malformed_key() {
    let good = message_line("m1", "tenant_id=acme/table=web_requests/part-001.json");
    let bad = message_line("m2", "unpartitioned/part-002.json");
    let output = quarry()
        .args([
            "dispatch",
            "--workflow-dsn",
            "memory",
            "--destination-bucket",
            "lake",
        ])
        .write_stdin(format!("{bad}\n{good}\n"))
        .output()
        .unwrap();

    assert!(!output.status.success());
    // the remaining messages are still dispatched
    assert_eq!(
        String::from_utf8(output.stdout).unwrap().trim(),
        "started=1 deduplicated=0 skipped=0"
    );
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("1 message(s) could not be dispatched"), "{stderr}");
}

#[test]
fn dispatch_reads_input_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("messages.jsonl");
    std::fs::write(
        &input,
        message_line("m1", "tenant_id=acme/table=web_requests/part-001.json"),
    )
    .unwrap();

    let output = quarry()
        .args([
            "dispatch",
            "--workflow-dsn",
            "memory",
            "--destination-bucket",
            "lake",
            "--input",
        ])
        .arg(&input)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(
        String::from_utf8(output.stdout).unwrap().trim(),
        "started=1 deduplicated=0 skipped=0"
    );
}

#[test]
fn describe_unknown_workflow_fails() {
    let output = quarry()
        .args([
            "workflow",
            "--workflow-dsn",
            "memory",
            "describe",
            "ingest/acme/web_requests/part-001.json",
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(
        stderr.contains("cannot describe ingest/acme/web_requests/part-001.json"),
        "{stderr}"
    );
}

#[test]
fn unknown_dsn_is_rejected() {
    let output = quarry()
        .args(["catalog", "migrate", "--catalog-dsn", "mysql://localhost"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("Unknown Catalog DSN"), "{stderr}");
}

#[test]
fn migrate_memory_backends() {
    let output = quarry()
        .args([
            "catalog",
            "migrate",
            "--catalog-dsn",
            "memory",
            "--workflow-dsn",
            "memory",
        ])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
}
