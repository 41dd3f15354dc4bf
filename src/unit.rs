use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::archive;
use crate::secrets::Secrets;

/// Per-unit configuration file inside the unit directory.
pub const UNIT_FILE: &str = "copr.unit.json";
/// Previous unit versions end up here as zip bundles.
pub const ARCHIVE_DIR: &str = ".archive";

/// One managed program, considered to reside in one directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConfig {
    pub enabled: bool,
    /// Executable path relative to the unit directory.
    pub program: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// "KEY=VALUE" entries; may contain `{name}` secret placeholders.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(rename = "restart-after-sec")]
    pub restart_after_sec: u64,
}

#[derive(Debug, Clone)]
pub struct Unit {
    pub name: String,
    pub dir: PathBuf,
    pub config: UnitConfig,
}

impl Unit {
    /// Absolute path of the unit's executable.
    pub fn program_path(&self) -> PathBuf {
        self.dir.join(&self.config.program)
    }
}

/// Filesystem facade for the workspace: every immediate sub-directory (except
/// `.archive`) containing a unit file is a unit, named after the directory.
/// The controller owns the authoritative in-memory unit list; the store only
/// performs IO.
pub struct UnitStore {
    dir: PathBuf,
    secrets: Arc<Secrets>,
}

impl UnitStore {
    pub fn new(dir: impl AsRef<Path>, secrets: Arc<Secrets>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let dir = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            std::env::current_dir()
                .with_context(|| "determine working directory")?
                .join(dir)
        };
        std::fs::create_dir_all(dir.join(ARCHIVE_DIR))
            .with_context(|| format!("create archive dir in {}", dir.display()))?;
        Ok(Self { dir, secrets })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.dir.join(ARCHIVE_DIR)
    }

    /// Scans the workspace. A unit file that fails to parse aborts the load.
    pub fn load_all(&self) -> anyhow::Result<Vec<Unit>> {
        let mut units = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("read dir {}", self.dir.display()))?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name == ARCHIVE_DIR {
                continue;
            }
            if !entry.path().join(UNIT_FILE).exists() {
                continue;
            }
            units.push(self.load_unit(&name)?);
        }
        units.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(units)
    }

    /// Reads a single unit, expanding secret placeholders on the raw text
    /// before parsing.
    pub fn load_unit(&self, name: &str) -> anyhow::Result<Unit> {
        let unit_dir = self.dir.join(name);
        let unit_file = unit_dir.join(UNIT_FILE);
        let raw = std::fs::read_to_string(&unit_file)
            .with_context(|| format!("read unit file {}", unit_file.display()))?;
        let expanded = self.secrets.expanded(&raw);
        let config: UnitConfig = serde_json::from_str(&expanded)
            .with_context(|| format!("decode unit file {}", unit_file.display()))?;
        Ok(Unit {
            name: name.to_string(),
            dir: unit_dir,
            config,
        })
    }

    /// Serializes the unit's config back to its unit file (2-space indent).
    pub fn save_unit(&self, unit: &Unit) -> anyhow::Result<()> {
        let unit_file = unit.dir.join(UNIT_FILE);
        let mut text = serde_json::to_string_pretty(&unit.config)
            .with_context(|| format!("encode unit file {}", unit_file.display()))?;
        text.push('\n');
        std::fs::write(&unit_file, text)
            .with_context(|| format!("write unit file {}", unit_file.display()))
    }

    /// Moves a staged directory into the workspace as a new unit.
    pub fn create(&self, name: &str, staging_dir: &Path) -> anyhow::Result<Unit> {
        let unit_dir = self.dir.join(name);
        if unit_dir.exists() {
            bail!("unit dir {} already exists", unit_dir.display());
        }
        std::fs::rename(staging_dir, &unit_dir).with_context(|| {
            format!("move {} -> {}", staging_dir.display(), unit_dir.display())
        })?;
        let unit = self.load_unit(name)?;
        chmod_program(&unit)?;
        Ok(unit)
    }

    /// Replaces an existing unit directory with a staged one. The prior
    /// directory is archived first, so a failure mid-update never loses the
    /// previous state.
    pub fn update(&self, name: &str, staging_dir: &Path) -> anyhow::Result<Unit> {
        let unit_dir = self.dir.join(name);
        let archive_file = self.archive_dir().join(format!(
            "{}_{}_{:03}.bak.zip",
            name,
            Utc::now().format("%Y%m%d%H%M%S"),
            rand::thread_rng().gen_range(0..1000),
        ));

        let f = std::fs::File::create(&archive_file)
            .with_context(|| format!("create archive {}", archive_file.display()))?;
        archive::zip_dir(f, &unit_dir)
            .with_context(|| format!("archive {}", unit_dir.display()))?;

        std::fs::remove_dir_all(&unit_dir)
            .with_context(|| format!("remove old unit dir {}", unit_dir.display()))?;
        std::fs::rename(staging_dir, &unit_dir).with_context(|| {
            format!("move {} -> {}", staging_dir.display(), unit_dir.display())
        })?;

        let unit = self.load_unit(name)?;
        chmod_program(&unit)?;
        Ok(unit)
    }
}

fn chmod_program(unit: &Unit) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let program = unit.program_path();
    std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod 0755 {}", program.display()))
}

/// Checks that `dir` looks like a deployable unit: the unit file exists and
/// parses. No side effects.
pub fn validate_unit_dir(dir: &Path) -> anyhow::Result<()> {
    let unit_file = dir.join(UNIT_FILE);
    let raw = std::fs::read_to_string(&unit_file)
        .with_context(|| format!("no unit file {}", unit_file.display()))?;
    let _: UnitConfig = serde_json::from_str(&raw)
        .with_context(|| format!("decode unit file {}", unit_file.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_secrets(dir: &Path) -> Arc<Secrets> {
        Arc::new(Secrets::load(dir.join("copr.secrets"), "test-pwd").unwrap())
    }

    fn write_unit(dir: &Path, name: &str, config: &str) {
        let unit_dir = dir.join(name);
        std::fs::create_dir_all(&unit_dir).unwrap();
        std::fs::write(unit_dir.join(UNIT_FILE), config).unwrap();
        std::fs::write(unit_dir.join("run"), b"#!/bin/sh\n").unwrap();
    }

    const BASIC: &str = r#"{"enabled": true, "program": "run", "restart-after-sec": 1}"#;

    #[test]
    fn load_all_skips_archive_and_plain_dirs() {
        let ws = tempfile::tempdir().unwrap();
        write_unit(ws.path(), "unit_01", BASIC);
        write_unit(ws.path(), "unit_02", BASIC);
        std::fs::create_dir_all(ws.path().join(".archive")).unwrap();
        std::fs::create_dir_all(ws.path().join("no_unit_here")).unwrap();
        std::fs::write(ws.path().join("stray.txt"), b"x").unwrap();

        let store = UnitStore::new(ws.path(), empty_secrets(ws.path())).unwrap();
        let units = store.load_all().unwrap();
        let names: Vec<_> = units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["unit_01", "unit_02"]);
        assert!(units[0].dir.is_absolute());
    }

    #[test]
    fn load_expands_secret_placeholders() {
        let ws = tempfile::tempdir().unwrap();
        let mut secs = Secrets::load(ws.path().join("copr.secrets"), "pwd").unwrap();
        secs.set("bazsec", "correct battery horse staple");

        write_unit(
            ws.path(),
            "unit_01",
            r#"{"enabled": true, "program": "run", "env": ["bazsec={bazsec}"], "restart-after-sec": 1}"#,
        );

        let store = UnitStore::new(ws.path(), Arc::new(secs)).unwrap();
        let unit = store.load_unit("unit_01").unwrap();
        assert_eq!(unit.config.env, vec!["bazsec=correct battery horse staple"]);
    }

    #[test]
    fn malformed_unit_file_aborts_load() {
        let ws = tempfile::tempdir().unwrap();
        write_unit(ws.path(), "unit_01", "{not json");
        let store = UnitStore::new(ws.path(), empty_secrets(ws.path())).unwrap();
        assert!(store.load_all().is_err());
    }

    #[test]
    fn save_unit_writes_indented_json() {
        let ws = tempfile::tempdir().unwrap();
        write_unit(ws.path(), "unit_01", BASIC);
        let store = UnitStore::new(ws.path(), empty_secrets(ws.path())).unwrap();

        let mut unit = store.load_unit("unit_01").unwrap();
        unit.config.enabled = false;
        store.save_unit(&unit).unwrap();

        let raw = std::fs::read_to_string(unit.dir.join(UNIT_FILE)).unwrap();
        assert!(raw.contains("  \"enabled\": false"));

        let reloaded = store.load_unit("unit_01").unwrap();
        assert!(!reloaded.config.enabled);
    }

    #[test]
    fn create_moves_staging_and_marks_program_executable() {
        use std::os::unix::fs::PermissionsExt;

        let ws = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let staged = staging.path().join("stage");
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::write(staged.join(UNIT_FILE), BASIC).unwrap();
        std::fs::write(staged.join("run"), b"#!/bin/sh\n").unwrap();

        let store = UnitStore::new(ws.path(), empty_secrets(ws.path())).unwrap();
        let unit = store.create("unit_03", &staged).unwrap();

        assert!(!staged.exists());
        assert!(unit.dir.ends_with("unit_03"));
        let mode = std::fs::metadata(unit.program_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn update_archives_prior_directory() {
        let ws = tempfile::tempdir().unwrap();
        write_unit(ws.path(), "unit_01", BASIC);

        let staging = tempfile::tempdir().unwrap();
        let staged = staging.path().join("stage");
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::write(
            staged.join(UNIT_FILE),
            r#"{"enabled": false, "program": "run", "restart-after-sec": 2}"#,
        )
        .unwrap();
        std::fs::write(staged.join("run"), b"#!/bin/sh\n# v2\n").unwrap();

        let store = UnitStore::new(ws.path(), empty_secrets(ws.path())).unwrap();
        let unit = store.update("unit_01", &staged).unwrap();
        assert!(!unit.config.enabled);
        assert_eq!(unit.config.restart_after_sec, 2);

        let archived: Vec<_> = std::fs::read_dir(store.archive_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("unit_01_") && n.ends_with(".bak.zip"))
            .collect();
        assert_eq!(archived.len(), 1);
    }

    #[test]
    fn validate_unit_dir_checks_presence_and_shape() {
        let ws = tempfile::tempdir().unwrap();
        assert!(validate_unit_dir(ws.path()).is_err());

        std::fs::write(ws.path().join(UNIT_FILE), "{broken").unwrap();
        assert!(validate_unit_dir(ws.path()).is_err());

        std::fs::write(ws.path().join(UNIT_FILE), BASIC).unwrap();
        validate_unit_dir(ws.path()).unwrap();
    }
}
