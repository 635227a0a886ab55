use std::borrow::Cow;
use std::fmt;
use std::path::Path;

use base64::engine::general_purpose::URL_SAFE;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use config::ConfigError;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::Pkcs1v15Encrypt;
use rsa::RsaPrivateKey;
use rsa::RsaPublicKey;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;

use crate::CryptoConfig;
use crate::Error;
use crate::KvMessage;
use crate::Result;
use crate::CRYPTO_MARKER;
use crate::ENCRYPTED_FIELD;

/// Decrypts with any of several private keys, encrypts with one public key.
#[derive(Clone)]
pub struct FieldCrypto {
    private_keys: Vec<RsaPrivateKey>,
    public_key: Option<RsaPublicKey>,
}

impl fmt::Debug for FieldCrypto {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("FieldCrypto")
            .field("private_keys", &self.private_keys.len())
            .field("public_key", &self.public_key.is_some())
            .finish()
    }
}

impl FieldCrypto {
    pub fn new(
        private_keys: Vec<RsaPrivateKey>,
        public_key: Option<RsaPublicKey>,
    ) -> Self {
        Self {
            private_keys,
            public_key,
        }
    }

    /// Keys from PEM text; PKCS#1 first, then PKCS#8.
    pub fn from_pem(
        private_pems: &[String],
        public_pem: Option<&str>,
    ) -> Result<Self> {
        let private_keys = private_pems
            .iter()
            .map(|pem| parse_private_key(pem))
            .collect::<Result<Vec<_>>>()?;
        let public_key = public_pem.map(parse_public_key).transpose()?;
        Ok(Self::new(private_keys, public_key))
    }

    /// Loads the configured key files, `None` when crypto is not configured.
    pub fn from_config(config: &CryptoConfig) -> Result<Option<Self>> {
        if !config.enabled() {
            return Ok(None);
        }
        let private_pems = config
            .private_key_files
            .iter()
            .map(|path| read_key_file(path))
            .collect::<Result<Vec<_>>>()?;
        let public_pem = config.public_key_file.as_deref().map(read_key_file).transpose()?;
        let crypto = Self::from_pem(&private_pems, public_pem.as_deref())?;
        debug!(
            "loaded {} private keys, public key: {}",
            crypto.private_keys.len(),
            crypto.public_key.is_some()
        );
        Ok(Some(crypto))
    }

    pub fn public_key(&self) -> Option<&RsaPublicKey> {
        self.public_key.as_ref()
    }

    pub fn encrypt(
        &self,
        plain: &[u8],
        public_key: &RsaPublicKey,
    ) -> Result<Vec<u8>> {
        public_key
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, plain)
            .map_err(|e| Error::invalid(format!("encryption failed: {e}")))
    }

    /// Tries every private key in order.
    pub fn decrypt(
        &self,
        cipher: &[u8],
    ) -> Result<Vec<u8>> {
        let mut last = None;
        for key in &self.private_keys {
            match key.decrypt(Pkcs1v15Encrypt, cipher) {
                Ok(plain) => return Ok(plain),
                Err(e) => last = Some(e),
            }
        }
        Err(Error::DecryptFailed(last))
    }

    /// `$crypto$<base64url(cipher)>` of `plain` under the configured public key
    pub fn encrypt_value(
        &self,
        plain: &str,
    ) -> Result<String> {
        if plain.starts_with(CRYPTO_MARKER) {
            return Err(Error::invalid("value already carries the crypto marker"));
        }
        let public_key = self
            .public_key
            .as_ref()
            .ok_or_else(|| Error::invalid("no public key configured for encryption"))?;
        let cipher = self.encrypt(plain.as_bytes(), public_key)?;
        Ok(format!("{CRYPTO_MARKER}{}", URL_SAFE.encode(cipher)))
    }

    /// Plain text of a marked value; unmarked values come back unchanged.
    pub fn decrypt_value(
        &self,
        value: &str,
    ) -> Result<String> {
        let Some(encoded) = value.strip_prefix(CRYPTO_MARKER) else {
            return Ok(value.to_string());
        };
        let cipher = URL_SAFE
            .decode(encoded)
            .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))?;
        let plain = self.decrypt(&cipher)?;
        String::from_utf8(plain).map_err(|_| Error::invalid("decrypted value is not utf-8"))
    }

    /// Decrypts the marked top-level string fields of a flagged JSON object.
    /// Anything else is returned untouched.
    pub fn wrap_json<'a>(
        &self,
        raw: &'a [u8],
    ) -> Result<Cow<'a, [u8]>> {
        if !contains(raw, CRYPTO_MARKER.as_bytes()) {
            return Ok(Cow::Borrowed(raw));
        }
        let Ok(Value::Object(mut object)) = serde_json::from_slice::<Value>(raw) else {
            return Ok(Cow::Borrowed(raw));
        };
        if !is_flagged(&object) {
            return Ok(Cow::Borrowed(raw));
        }

        let mut changed = false;
        for (_, value) in object.iter_mut() {
            if let Value::String(text) = value {
                if text.starts_with(CRYPTO_MARKER) {
                    *text = self.decrypt_value(text)?;
                    changed = true;
                }
            }
        }
        if !changed {
            return Ok(Cow::Borrowed(raw));
        }
        Ok(Cow::Owned(serde_json::to_vec(&object)?))
    }

    /// Encrypts the named top-level string fields and flags the object.
    pub fn encrypt_json(
        &self,
        raw: &[u8],
        fields: &[&str],
    ) -> Result<Vec<u8>> {
        let Value::Object(mut object) = serde_json::from_slice::<Value>(raw)? else {
            return Err(Error::invalid("only JSON objects can carry encrypted fields"));
        };
        for field in fields {
            match object.get_mut(*field) {
                Some(Value::String(text)) => *text = self.encrypt_value(text)?,
                Some(Value::Null) | None => {}
                Some(_) => return Err(Error::invalid(format!("field {field} is not a string"))),
            }
        }
        object.insert(ENCRYPTED_FIELD.to_string(), Value::String("true".to_string()));
        Ok(serde_json::to_vec(&object)?)
    }

    /// Decrypts the marked string fields at `paths` (dotted serde names).
    pub fn wrap_message<M: KvMessage>(
        &self,
        msg: &mut M,
        paths: &[String],
    ) -> Result<()> {
        self.rewrite_message(msg, paths, |text| {
            if text.starts_with(CRYPTO_MARKER) {
                self.decrypt_value(text).map(Some)
            } else {
                Ok(None)
            }
        })
    }

    /// Encrypts the string fields at `paths`; empty strings stay empty.
    pub fn encrypt_message<M: KvMessage>(
        &self,
        msg: &mut M,
        paths: &[String],
    ) -> Result<()> {
        self.rewrite_message(msg, paths, |text| {
            if text.is_empty() {
                Ok(None)
            } else {
                self.encrypt_value(text).map(Some)
            }
        })
    }

    /// Projects `msg` to a JSON tree, rewrites the leaves and reads it back
    /// when anything changed.
    fn rewrite_message<M: KvMessage>(
        &self,
        msg: &mut M,
        paths: &[String],
        rewrite: impl Fn(&str) -> Result<Option<String>>,
    ) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut tree = serde_json::to_value(&*msg)?;
        let mut changed = false;
        for path in paths {
            let Some(leaf) = resolve_path(&mut tree, path)? else {
                continue;
            };
            match leaf {
                Value::String(text) => {
                    if let Some(replaced) = rewrite(text.as_str())? {
                        *text = replaced;
                        changed = true;
                    }
                }
                Value::Null => {}
                _ => return Err(Error::invalid(format!("field {path} of {} is not a string", M::label()))),
            }
        }
        if changed {
            *msg = serde_json::from_value(tree)?;
        }
        Ok(())
    }
}

/// Walks `path` through nested records. `None` when an intermediate record
/// is unset.
fn resolve_path<'a>(
    tree: &'a mut Value,
    path: &str,
) -> Result<Option<&'a mut Value>> {
    let mut current = tree;
    for segment in path.split('.') {
        let node = current;
        current = match node {
            Value::Object(fields) => match fields.get_mut(segment) {
                Some(next) => next,
                None => return Err(Error::invalid(format!("unknown field {segment} in path {path}"))),
            },
            Value::Null => return Ok(None),
            Value::Array(_) => {
                return Err(Error::invalid(format!(
                    "path {path} crosses a repeated field, which is not supported"
                )))
            }
            _ => return Err(Error::invalid(format!("path {path} descends into a scalar"))),
        };
    }
    if current.is_array() || current.is_object() {
        return Err(Error::invalid(format!("path {path} does not end at a string field")));
    }
    Ok(Some(current))
}

fn is_flagged(object: &Map<String, Value>) -> bool {
    match object.get(ENCRYPTED_FIELD) {
        Some(Value::String(flag)) => flag.eq_ignore_ascii_case("true"),
        Some(Value::Bool(flag)) => *flag,
        _ => false,
    }
}

fn contains(
    haystack: &[u8],
    needle: &[u8],
) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn parse_private_key(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|e| Error::Config(ConfigError::Message(format!("invalid RSA private key: {e}"))))
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPublicKey::from_public_key_pem(pem))
        .map_err(|e| Error::Config(ConfigError::Message(format!("invalid RSA public key: {e}"))))
}

fn read_key_file(path: &str) -> Result<String> {
    std::fs::read_to_string(Path::new(path))
        .map_err(|e| Error::Config(ConfigError::Message(format!("can not read key file {path}: {e}"))))
}
