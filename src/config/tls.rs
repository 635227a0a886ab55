use std::fs;
use std::path::Path;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Transport security shared by the networked backends
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct TlsConfig {
    /// Plain-text transport, TLS materials are ignored
    /// Default: false
    #[serde(default)]
    pub insecure_transport: bool,

    /// Accept any server certificate
    /// Default: false
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,

    /// Client certificate chain in PEM format (mutual TLS)
    #[serde(default)]
    pub cert_file: Option<String>,

    /// Client private key in PEM format (mutual TLS)
    #[serde(default)]
    pub key_file: Option<String>,

    /// Certificate Authority root certificate in PEM format
    #[serde(default)]
    pub ca_file: Option<String>,
}

impl TlsConfig {
    /// True when any TLS material is configured and transport is not forced insecure
    pub fn enabled(&self) -> bool {
        !self.insecure_transport
            && (self.cert_file.is_some() || self.key_file.is_some() || self.ca_file.is_some())
    }

    pub fn validate(&self) -> Result<()> {
        if self.insecure_transport {
            return Ok(());
        }

        match (&self.cert_file, &self.key_file) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(Error::Config(ConfigError::Message(
                    "cert-file and key-file must be configured together".into(),
                )));
            }
            (Some(cert), Some(key)) => {
                validate_pem_file(cert, "client certificate")?;
                validate_pem_file(key, "client private key")?;
            }
            (None, None) => {}
        }

        if let Some(ca) = &self.ca_file {
            validate_pem_file(ca, "CA certificate")?;
        }

        Ok(())
    }
}

fn validate_pem_file(
    path: &str,
    name: &str,
) -> Result<()> {
    let path = Path::new(path);
    fs::File::open(path).map_err(|e| {
        Error::Config(ConfigError::Message(format!(
            "{} file {} is unreadable: {}",
            name,
            path.display(),
            e
        )))
    })?;
    Ok(())
}
