use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{bail, Context};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Encrypted secrets blob at the workspace root.
pub const SECRET_FILE: &str = "copr.secrets";
/// TOML map of environment entries shared by every unit.
pub const GLOBAL_ENV_FILE: &str = "copr.global.env";

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

fn derive_key(pwd: &str) -> [u8; 32] {
    Sha256::digest(pwd.as_bytes()).into()
}

/// Seals `data` as `nonce || ciphertext || tag` with a fresh random nonce.
fn encrypt(data: &[u8], pwd: &str) -> anyhow::Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(&derive_key(pwd))
        .map_err(|e| anyhow::anyhow!("new cipher: {e}"))?;
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, data)
        .map_err(|e| anyhow::anyhow!("seal: {e}"))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt(sealed: &[u8], pwd: &str) -> anyhow::Result<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        bail!("sealed data is shorter than nonce + tag");
    }
    let cipher = Aes256Gcm::new_from_slice(&derive_key(pwd))
        .map_err(|e| anyhow::anyhow!("new cipher: {e}"))?;
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow::anyhow!("open sealed data (wrong password?)"))
}

/// The on-disk sealed file. A missing file yields an empty store, so a fresh
/// workspace works without a bootstrap step.
struct SecretsFile {
    path: PathBuf,
    pwd: String,
    data: Vec<u8>,
}

impl SecretsFile {
    fn load(path: &Path, pwd: &str) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                pwd: pwd.to_string(),
                data: Vec::new(),
            });
        }
        let sealed =
            std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let data = decrypt(&sealed, pwd)
            .with_context(|| format!("decrypt {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            pwd: pwd.to_string(),
            data,
        })
    }

    fn save(&self) -> anyhow::Result<()> {
        let sealed = encrypt(&self.data, &self.pwd)?;
        std::fs::write(&self.path, sealed)
            .with_context(|| format!("write {}", self.path.display()))
    }
}

/// Password-protected key/value store with `{key}` placeholder expansion.
/// Plaintext is a TOML `key = "value"` map.
pub struct Secrets {
    file: SecretsFile,
    values: BTreeMap<String, String>,
}

impl Secrets {
    pub fn load(path: impl AsRef<Path>, pwd: &str) -> anyhow::Result<Self> {
        let file = SecretsFile::load(path.as_ref(), pwd)?;
        let text = String::from_utf8(file.data.clone())
            .with_context(|| format!("{} is not UTF-8", path.as_ref().display()))?;
        let values: BTreeMap<String, String> =
            toml::from_str(&text).with_context(|| "parse secrets TOML")?;
        Ok(Self { file, values })
    }

    pub fn find(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn delete(&mut self, key: &str) {
        self.values.remove(key);
    }

    pub fn save(&mut self) -> anyhow::Result<()> {
        let text = toml::to_string(&self.values).with_context(|| "encode secrets TOML")?;
        self.file.data = text.into_bytes();
        self.file.save()
    }

    /// Substitutes every `{key}` occurrence with the stored value.
    pub fn expanded(&self, s: &str) -> String {
        let mut out = s.to_string();
        for (k, v) in &self.values {
            out = out.replace(&format!("{{{k}}}"), v);
        }
        out
    }
}

/// Loads `copr.global.env` (TOML map), expanding secret placeholders in the
/// values. A missing file is an empty environment.
pub fn load_global_env(
    path: impl AsRef<Path>,
    secrets: &Secrets,
) -> anyhow::Result<BTreeMap<String, String>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    let mut env: BTreeMap<String, String> =
        toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    for v in env.values_mut() {
        *v = secrets.expanded(v);
    }
    Ok(env)
}
