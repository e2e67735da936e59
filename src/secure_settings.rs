//! Key/value settings with selected values encrypted at rest.
//!
//! Encrypted values are written as `enc:<iv-hex>:<ciphertext-base64>` using
//! AES-256-CBC. The key is a SHA-256 digest of stable machine attributes, so
//! the file only decrypts on the machine that wrote it. This keeps secrets out
//! of casual view; it is not a defense against a local attacker.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{FleetError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const ENCRYPTED_TAG: &str = "enc:";
const IV_LEN: usize = 16;

pub const SERVER_ADDRESS: &str = "serverAddress";
pub const SERVER_PORT: &str = "serverPort";
pub const GAME_VERSION: &str = "gameVersion";
pub const COMMAND_PASSWORD: &str = "commandPassword";
pub const NOTIFICATION_ENDPOINT: &str = "notificationEndpoint";
pub const NOTIFICATIONS_ENABLED: &str = "notificationsEnabled";

pub const DEFAULT_PORT: &str = "25565";
pub const DEFAULT_VERSION: &str = "1.20.1";

pub struct SecureSettings {
    path: PathBuf,
    key: [u8; 32],
    values: Mutex<BTreeMap<String, Value>>,
}

impl std::fmt::Debug for SecureSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSettings")
            .field("path", &self.path)
            .field("keys", &self.values.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SecureSettings {
    /// Open the store at `path` keyed to this machine.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_key(path, machine_key())
    }

    pub fn with_key(path: impl Into<PathBuf>, key: [u8; 32]) -> Self {
        let path = path.into();
        let values = load_values(&path);
        Self {
            path,
            key,
            values: Mutex::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.lock().contains_key(key)
    }

    /// String value for `key`, decrypting if needed. Missing keys and values
    /// that fail to decrypt yield `default`.
    pub fn get(&self, key: &str, default: &str) -> String {
        self.get_opt(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_opt(&self, key: &str) -> Option<String> {
        let value = self.values.lock().get(key).cloned()?;
        match value {
            Value::String(raw) => match raw.strip_prefix(ENCRYPTED_TAG) {
                Some(sealed) => match self.decrypt(sealed) {
                    Ok(plain) => Some(plain),
                    Err(error) => {
                        tracing::warn!(
                            target = "agent_fleet::settings",
                            key,
                            error = %error,
                            "failed to decrypt setting, using default"
                        );
                        None
                    }
                },
                None => Some(raw),
            },
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.lock().get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Store `value`, encrypting it with a fresh IV when `encrypt` is set.
    pub fn set(&self, key: &str, value: &str, encrypt: bool) -> Result<()> {
        let stored = if encrypt {
            format!("{ENCRYPTED_TAG}{}", self.encrypt(value)?)
        } else {
            value.to_string()
        };
        self.set_value(key, Value::String(stored))
    }

    pub fn set_value(&self, key: &str, value: Value) -> Result<()> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value);
        self.persist(&values)
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut values = self.values.lock();
        if values.remove(key).is_none() {
            return Ok(false);
        }
        self.persist(&values)?;
        Ok(true)
    }

    /// Prompt for every setting that is not already present.
    pub fn run_setup_wizard<R: BufRead, W: Write>(&self, mut input: R, mut output: W) -> Result<()> {
        writeln!(output, "\n=== Fleet Setup ===\n")?;

        if !self.has(SERVER_ADDRESS) {
            let address = prompt(&mut input, &mut output, "Server address: ")?;
            self.set(SERVER_ADDRESS, &address, false)?;
        }
        if !self.has(SERVER_PORT) {
            let port = prompt(&mut input, &mut output, "Server port (default: 25565): ")?;
            self.set(SERVER_PORT, or_default(&port, DEFAULT_PORT), false)?;
        }
        if !self.has(GAME_VERSION) {
            let version = prompt(&mut input, &mut output, "Game version (default: 1.20.1): ")?;
            self.set(GAME_VERSION, or_default(&version, DEFAULT_VERSION), false)?;
        }
        if !self.has(COMMAND_PASSWORD) {
            let password = prompt(&mut input, &mut output, "Command password: ")?;
            self.set(COMMAND_PASSWORD, &password, true)?;
        }
        if !self.has(NOTIFICATION_ENDPOINT) && !self.has(NOTIFICATIONS_ENABLED) {
            let answer = prompt(&mut input, &mut output, "Set up webhook notifications? (y/n): ")?;
            if answer.eq_ignore_ascii_case("y") {
                let url = prompt(&mut input, &mut output, "Webhook URL: ")?;
                self.set(NOTIFICATION_ENDPOINT, &url, true)?;
                self.set_value(NOTIFICATIONS_ENABLED, Value::Bool(true))?;
            } else {
                self.set_value(NOTIFICATIONS_ENABLED, Value::Bool(false))?;
            }
        }

        writeln!(output, "\nSettings saved to {}", self.path.display())?;
        Ok(())
    }

    fn encrypt(&self, plain: &str) -> Result<String> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &iv)
            .map_err(|e| FleetError::Crypto(e.to_string()))?;
        let sealed = cipher.encrypt_padded_vec_mut::<Pkcs7>(plain.as_bytes());
        Ok(format!("{}:{}", hex::encode(iv), STANDARD.encode(sealed)))
    }

    fn decrypt(&self, sealed: &str) -> Result<String> {
        let (iv_hex, body) = sealed
            .split_once(':')
            .ok_or_else(|| FleetError::Crypto("missing IV separator".into()))?;
        let iv = hex::decode(iv_hex).map_err(|e| FleetError::Crypto(format!("bad IV: {e}")))?;
        let body = STANDARD
            .decode(body)
            .map_err(|e| FleetError::Crypto(format!("bad ciphertext: {e}")))?;
        let cipher = Aes256CbcDec::new_from_slices(&self.key, &iv)
            .map_err(|e| FleetError::Crypto(e.to_string()))?;
        let plain = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&body)
            .map_err(|e| FleetError::Crypto(e.to_string()))?;
        String::from_utf8(plain).map_err(|e| FleetError::Crypto(e.to_string()))
    }

    fn persist(&self, values: &BTreeMap<String, Value>) -> Result<()> {
        let data = serde_json::to_vec_pretty(values)?;
        fs::write(&self.path, data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            let _ = fs::set_permissions(&self.path, perms);
        }
        Ok(())
    }
}

/// SHA-256 over hostname, user, OS and architecture.
pub fn machine_key() -> [u8; 32] {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(user.as_bytes());
    hasher.update(std::env::consts::OS.as_bytes());
    hasher.update(std::env::consts::ARCH.as_bytes());
    hasher.finalize().into()
}

fn load_values(path: &Path) -> BTreeMap<String, Value> {
    let Ok(data) = fs::read(path) else {
        return BTreeMap::new();
    };
    serde_json::from_slice(&data).unwrap_or_else(|error| {
        tracing::warn!(
            target = "agent_fleet::settings",
            path = %path.display(),
            error = %error,
            "settings file unreadable, starting empty"
        );
        BTreeMap::new()
    })
}

fn prompt<R: BufRead, W: Write>(input: &mut R, output: &mut W, question: &str) -> Result<String> {
    write!(output, "{question}")?;
    output.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn or_default<'a>(answer: &'a str, default: &'a str) -> &'a str {
    if answer.is_empty() {
        default
    } else {
        answer
    }
}
