//! Secrets vault with file-based storage.
//!
//! Uses `age` for encryption when the tool is installed; otherwise falls
//! back to base64 obfuscation and relies on owner-only file permissions.

use base64::Engine;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::RwLock;

use crate::Result;

pub struct Vault {
    secrets_path: PathBuf,
    key_path: PathBuf,
    use_age: bool,
    secrets: RwLock<HashMap<String, String>>,
}

impl Vault {
    pub fn open(home: &Path) -> Result<Self> {
        let vault = Self {
            secrets_path: home.join("secrets.json"),
            key_path: home.join(".age-key"),
            use_age: has_age(),
            secrets: RwLock::new(HashMap::new()),
        };
        vault.load()?;
        Ok(vault)
    }

    fn load(&self) -> Result<()> {
        if !self.secrets_path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&self.secrets_path)?;

        if self.use_age && self.key_path.exists() {
            if let Some(decrypted) = age_decrypt(&self.key_path, &content) {
                if let Ok(map) = serde_json::from_str(&decrypted) {
                    *self.secrets.write().unwrap() = map;
                    return Ok(());
                }
            }
        }

        // Fallback: base64 obfuscation, then plain JSON.
        let map = base64::engine::general_purpose::STANDARD
            .decode(content.trim())
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .or_else(|| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        *self.secrets.write().unwrap() = map;
        Ok(())
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.secrets_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(&*self.secrets.read().unwrap())?;

        if self.use_age {
            if let Some(encrypted) = age_encrypt(&self.key_path, &data) {
                std::fs::write(&self.secrets_path, encrypted)?;
                set_owner_only(&self.secrets_path)?;
                return Ok(());
            }
        }

        let encoded = base64::engine::general_purpose::STANDARD.encode(data.as_bytes());
        std::fs::write(&self.secrets_path, encoded)?;
        set_owner_only(&self.secrets_path)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.secrets.read().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.secrets
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        self.save()
    }

    /// Delete a secret. Returns true if it existed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.secrets.write().unwrap().remove(key).is_some();
        if existed {
            self.save()?;
        }
        Ok(existed)
    }

    pub fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.secrets.read().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn values(&self) -> Vec<String> {
        self.secrets.read().unwrap().values().cloned().collect()
    }

    /// Resolve a `${NAME}` reference: vault first, then the environment.
    /// Non-reference strings pass through untouched.
    pub fn resolve_ref(&self, value: &str) -> String {
        let Some(key) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) else {
            return value.to_string();
        };
        if let Some(secret) = self.get(key) {
            return secret;
        }
        std::env::var(key).unwrap_or_default()
    }
}

fn has_age() -> bool {
    Command::new("age")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn age_decrypt(key_path: &Path, content: &str) -> Option<String> {
    use std::io::Write;
    let mut child = Command::new("age")
        .args(["-d", "-i"])
        .arg(key_path)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .ok()?;
    child
        .stdin
        .take()?
        .write_all(content.as_bytes())
        .ok()?;
    let output = child.wait_with_output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()
}

fn age_encrypt(key_path: &Path, data: &str) -> Option<String> {
    use std::io::Write;
    let public_key = ensure_age_key(key_path)?;
    let mut child = Command::new("age")
        .args(["-a", "-r", &public_key])
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .ok()?;
    child.stdin.take()?.write_all(data.as_bytes()).ok()?;
    let output = child.wait_with_output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()
}

/// Generate the age identity if missing and return its public key.
fn ensure_age_key(key_path: &Path) -> Option<String> {
    if !key_path.exists() {
        let output = Command::new("age-keygen")
            .arg("-o")
            .arg(key_path)
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        set_owner_only(key_path).ok()?;
    }
    let content = std::fs::read_to_string(key_path).ok()?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("# public key: "))
        .map(|k| k.trim().to_string())
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
