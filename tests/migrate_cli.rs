use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;
use serde_json::{json, Value};
use tempfile::tempdir;

fn modmail(root: &Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin("modmail")?;
    cmd.current_dir(root).env("MODMAIL_LOG", "off");
    for key in [
        "MODMAIL_CONFIG",
        "MODMAIL_DATA_DIR",
        "MODMAIL_LOG_DIR",
        "MODMAIL_DB_PATH",
        "MODMAIL_LEGACY_DB",
        "MODMAIL_MIGRATION_CONCURRENCY",
    ] {
        cmd.env_remove(key);
    }
    Ok(cmd)
}

fn write_legacy(root: &Path, doc: &Value) -> Result<()> {
    std::fs::create_dir_all(root.join("db"))?;
    std::fs::write(root.join("db/data.json"), doc.to_string())?;
    Ok(())
}

#[test]
fn status_then_migrate_then_status() -> Result<()> {
    let tmp = tempdir()?;
    write_legacy(
        tmp.path(),
        &json!({ "threads": [{ "channelId": "c1", "userId": "u1", "username": "Bob" }] }),
    )?;
    std::fs::create_dir_all(tmp.path().join("logs"))?;
    std::fs::write(tmp.path().join("logs/2020-01-01T00-00-00__u3__t1.txt"), "hi")?;

    let output = modmail(tmp.path())?.arg("status").output()?;
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("pending"));
    assert!(!tmp.path().join("db/data.sqlite").exists());

    let output = modmail(tmp.path())?.args(["migrate", "--json"]).output()?;
    assert!(
        output.status.success(),
        "stdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let summary: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(summary["categories"][0]["category"], "open_threads");
    assert_eq!(summary["categories"][0]["inserted"], 1);
    assert_eq!(summary["categories"][1]["inserted"], 1);
    assert!(tmp.path().join("db/.migrated_legacy").exists());
    assert!(tmp.path().join("db/data.sqlite").exists());

    let output = modmail(tmp.path())?.arg("status").output()?;
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("not needed"));
    Ok(())
}

#[test]
fn bare_invocation_migrates() -> Result<()> {
    let tmp = tempdir()?;
    write_legacy(tmp.path(), &json!({ "blocked": ["u2"] }))?;

    let output = modmail(tmp.path())?.output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("blocked_users"));
    assert!(stdout.contains("Marker written"));

    let output = modmail(tmp.path())?.arg("migrate").output()?;
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("not needed"));
    Ok(())
}

#[test]
fn config_file_moves_the_data_dir() -> Result<()> {
    let tmp = tempdir()?;
    let state = tmp.path().join("state");
    std::fs::create_dir_all(&state)?;
    std::fs::write(state.join("data.json"), json!({ "blocked": ["u2"] }).to_string())?;
    let config = tmp.path().join("modmail.json");
    std::fs::write(&config, json!({ "dataDir": "state" }).to_string())?;

    let output = modmail(tmp.path())?
        .arg("--config")
        .arg(&config)
        .arg("migrate")
        .output()?;
    assert!(output.status.success());
    assert!(state.join(".migrated_legacy").exists());
    assert!(!tmp.path().join("db").exists());
    Ok(())
}

#[test]
fn unreadable_legacy_document_fails_without_marker() -> Result<()> {
    let tmp = tempdir()?;
    std::fs::create_dir_all(tmp.path().join("db"))?;
    std::fs::write(tmp.path().join("db/data.json"), "{ not json")?;

    let output = modmail(tmp.path())?.arg("migrate").output()?;
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("LEGACY/STORE_PARSE"), "stderr: {stderr}");
    assert!(!tmp.path().join("db/.migrated_legacy").exists());
    Ok(())
}
