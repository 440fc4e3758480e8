//! Decryption of sensitive property values.
//!
//! An encrypted value is stored as `{cipher}` followed by an ASCII-armored
//! age payload. Anything else is plaintext and passes through unchanged.

use std::path::{Path, PathBuf};

use crate::error::{FeedMgrError, Result};
use crate::types::Property;

pub const CIPHER_PREFIX: &str = "{cipher}";

pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(CIPHER_PREFIX)
}

pub trait SensitiveValueDecryptor {
    /// Decrypt the payload following [`CIPHER_PREFIX`].
    fn decrypt(&self, payload: &str) -> Result<String>;
}

/// Decrypt every encrypted value among the sensitive properties in place.
/// Returns how many values were decrypted.
pub fn decrypt_sensitive(
    properties: &mut [Property],
    decryptor: &dyn SensitiveValueDecryptor,
) -> Result<usize> {
    let mut count = 0;
    for prop in properties.iter_mut().filter(|p| p.sensitive) {
        let Some(payload) = prop
            .value
            .as_deref()
            .and_then(|v| v.strip_prefix(CIPHER_PREFIX))
        else {
            continue;
        };
        let plain = decryptor
            .decrypt(payload)
            .map_err(|e| FeedMgrError::Decrypt(format!("{}: {e}", prop.name)))?;
        prop.value = Some(plain);
        count += 1;
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// AgeDecryptor
// ---------------------------------------------------------------------------

fn age_bin() -> Result<PathBuf> {
    which::which("age").map_err(|_| FeedMgrError::AgeNotInstalled)
}

/// Resolve the default identity path (private key for decryption).
/// Tries `~/.ssh/id_ed25519`, then `~/.ssh/id_rsa`.
pub fn default_identity() -> Option<PathBuf> {
    let home = home::home_dir()?;
    let candidates = [
        home.join(".ssh").join("id_ed25519"),
        home.join(".ssh").join("id_rsa"),
    ];
    candidates.into_iter().find(|p| p.exists())
}

/// Decrypts through the `age` binary with a fixed identity file.
pub struct AgeDecryptor {
    identity: PathBuf,
}

impl AgeDecryptor {
    pub fn new(identity: &Path) -> Self {
        Self {
            identity: identity.to_path_buf(),
        }
    }
}

impl SensitiveValueDecryptor for AgeDecryptor {
    fn decrypt(&self, payload: &str) -> Result<String> {
        let age_bin = age_bin()?;
        let mut cmd = std::process::Command::new(&age_bin);
        cmd.args(["--decrypt", "--identity"]).arg(&self.identity);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| FeedMgrError::Decrypt(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            use std::io::Write as _;
            stdin
                .write_all(payload.as_bytes())
                .map_err(|e| FeedMgrError::Decrypt(e.to_string()))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| FeedMgrError::Decrypt(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FeedMgrError::Decrypt(stderr.trim().to_string()));
        }
        String::from_utf8(output.stdout).map_err(|e| FeedMgrError::Decrypt(e.to_string()))
    }
}

/// Used when no identity is configured: any encrypted value is an error.
pub struct NoDecryptor;

impl SensitiveValueDecryptor for NoDecryptor {
    fn decrypt(&self, _payload: &str) -> Result<String> {
        Err(FeedMgrError::Decrypt(
            "no age identity configured; set secrets.identity in config.yaml".into(),
        ))
    }
}
