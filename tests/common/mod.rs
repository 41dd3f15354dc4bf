#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use copr::testkit::DummyCommand;
use copr::unit::{UnitConfig, UNIT_FILE};

pub fn dummy_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_copr-dummy"))
}

pub fn dummy_args(port: u16) -> Vec<String> {
    vec![format!("--bind=127.0.0.1:{port}")]
}

/// Lays out a unit directory: the dummy binary plus its unit file.
pub fn bootstrap_unit(
    dir: &Path,
    port: u16,
    env: Vec<String>,
    enabled: bool,
) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(dir).with_context(|| format!("mkdir {}", dir.display()))?;
    let prg = dir.join("copr-dummy");
    std::fs::copy(dummy_bin(), &prg)
        .with_context(|| format!("copy dummy to {}", prg.display()))?;
    std::fs::set_permissions(&prg, std::fs::Permissions::from_mode(0o755))?;

    let config = UnitConfig {
        enabled,
        program: "copr-dummy".to_string(),
        args: dummy_args(port),
        env,
        restart_after_sec: 1,
    };
    let mut text = serde_json::to_string_pretty(&config)?;
    text.push('\n');
    std::fs::write(dir.join(UNIT_FILE), text)
        .with_context(|| format!("write unit file in {}", dir.display()))?;
    Ok(())
}

pub async fn send_dummy(port: u16, cmd: &DummyCommand) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(500))
        .build()?;
    let resp = client
        .post(format!("http://127.0.0.1:{port}/"))
        .json(cmd)
        .send()
        .await?;
    anyhow::ensure!(resp.status().is_success(), "status {}", resp.status());
    Ok(resp.text().await?)
}

pub async fn probe_ok(port: u16) -> bool {
    send_dummy(port, &DummyCommand::probe()).await.is_ok()
}

/// Polls the unit's probe endpoint until it answers.
pub async fn wait_running(port: u16, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe_ok(port).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Polls until the unit's probe endpoint stops answering.
pub async fn wait_stopped(port: u16, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !probe_ok(port).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Names the `.bak.zip` archives for one unit.
pub fn archived_versions(workspace: &Path, unit: &str) -> Vec<String> {
    let archive_dir = workspace.join(".archive");
    if !archive_dir.exists() {
        return Vec::new();
    }
    let mut names: Vec<String> = std::fs::read_dir(&archive_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with(&format!("{unit}_")) && n.ends_with(".bak.zip"))
        .collect();
    names.sort();
    names
}
