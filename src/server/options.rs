//! Server Configuration
//!
//! All server options live in one struct with the documented defaults.
//! Validation happens once, at server construction: subprotocol versions
//! must parse, the control mask must be a CIDR, and a configured backend
//! requires a control secret. Invalid options are always fatal.
//!
//! # Configuration Sources
//!
//! The library takes a fully built [`ServerOptions`]; the binary fills it
//! from environment variables with sensible defaults for local development
//! (`SERVER_PORT`, `SERVER_HOST`, `SERVER_ENV`, `BACKEND_URL`,
//! `CONTROL_SECRET`).

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use semver::{Version, VersionReq};
use thiserror::Error;

use crate::log::{Store, TimeSource};

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Env {
    /// Quiet, no debug frames to clients
    Production,
    /// Verbose, debug frames enabled
    Development,
}

impl Env {
    /// Read the environment from `SERVER_ENV`, defaulting to development
    pub fn from_env() -> Self {
        match std::env::var("SERVER_ENV").as_deref() {
            Ok("production") => Self::Production,
            _ => Self::Development,
        }
    }
}

/// A TLS key or certificate: a PEM literal or a path resolved against `root`
#[derive(Debug, Clone)]
pub enum CertInput {
    /// PEM contents, verbatim
    Pem(String),
    /// Path to a PEM file
    Path(PathBuf),
}

impl CertInput {
    /// Resolve to PEM contents, reading path inputs relative to `root`
    pub fn resolve(&self, root: &Path) -> std::io::Result<String> {
        match self {
            Self::Pem(pem) => Ok(pem.clone()),
            Self::Path(path) => {
                let full = if path.is_absolute() {
                    path.clone()
                } else {
                    root.join(path)
                };
                std::fs::read_to_string(full)
            }
        }
    }
}

/// Invalid configuration found at construction. Always fatal.
#[derive(Debug, Error)]
pub enum OptionsError {
    /// `subprotocol` is required unless a backend is configured
    #[error("Server option `subprotocol` is required when no backend is set")]
    MissingSubprotocol,

    /// `supports` is required unless a backend is configured
    #[error("Server option `supports` is required when no backend is set")]
    MissingSupports,

    /// `subprotocol` must be a SemVer version
    #[error("Server option `subprotocol` is not a SemVer version: {value}")]
    BadSubprotocol {
        /// The rejected value
        value: String,
    },

    /// `supports` must be a SemVer range
    #[error("Server option `supports` is not a SemVer range: {value}")]
    BadSupports {
        /// The rejected value
        value: String,
    },

    /// A backend needs a shared secret for its callbacks
    #[error("`control_secret` is required when a backend is set (LOGUX_NO_CONTROL_SECRET)")]
    NoControlSecret,

    /// `control_mask` must be CIDR notation
    #[error("Server option `control_mask` is not a CIDR mask: {value}")]
    BadControlMask {
        /// The rejected value
        value: String,
    },

    /// A channel pattern failed to parse
    #[error("Channel pattern is invalid: {pattern}")]
    BadChannelPattern {
        /// The rejected pattern
        pattern: String,
    },

    /// TLS needs both halves
    #[error("Server options `key` and `cert` must be set together")]
    IncompleteTls,

    /// A TLS input could not be read
    #[error("Could not read TLS material: {message}")]
    BadTls {
        /// IO error detail
        message: String,
    },
}

impl OptionsError {
    /// Stable kind string for fatal reporting
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoControlSecret => "LOGUX_NO_CONTROL_SECRET",
            _ => "LOGUX_UNKNOWN_OPTION",
        }
    }
}

/// Server options with protocol defaults
pub struct ServerOptions {
    /// Application subprotocol version (SemVer). Required unless `backend`
    /// is set.
    pub subprotocol: Option<String>,

    /// Accepted client subprotocol range (SemVer). Required unless
    /// `backend` is set.
    pub supports: Option<String>,

    /// Base path for certificate files
    pub root: PathBuf,

    /// Connection silence timeout
    pub timeout: Duration,

    /// Ping interval
    pub ping: Duration,

    /// Backend URL for proxied auth/access/process
    pub backend: Option<String>,

    /// Shared secret between server and backend
    pub control_secret: Option<String>,

    /// CIDR mask of addresses allowed to use the control endpoint
    pub control_mask: String,

    /// Control endpoint bind host
    pub control_host: String,

    /// Control endpoint bind port
    pub control_port: u16,

    /// Log store; in-memory when absent
    pub store: Option<Box<dyn Store>>,

    /// Logical time source; wall clock when absent
    pub time: Option<Box<dyn TimeSource>>,

    /// Override for the random suffix of the server node id
    pub id: Option<String>,

    /// Runtime environment; read from `SERVER_ENV` when absent
    pub env: Option<Env>,

    /// Main listener bind host
    pub host: String,

    /// Main listener bind port
    pub port: u16,

    /// Pre-bound main listener, instead of `host`/`port`
    pub listener: Option<TcpListener>,

    /// TLS private key
    pub key: Option<CertInput>,

    /// TLS certificate
    pub cert: Option<CertInput>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            subprotocol: None,
            supports: None,
            root: PathBuf::from("."),
            timeout: Duration::from_millis(20_000),
            ping: Duration::from_millis(10_000),
            backend: None,
            control_secret: None,
            control_mask: "127.0.0.1/8".into(),
            control_host: "127.0.0.1".into(),
            control_port: 31_338,
            store: None,
            time: None,
            id: None,
            env: None,
            host: "127.0.0.1".into(),
            port: 31_337,
            listener: None,
            key: None,
            cert: None,
        }
    }
}

impl ServerOptions {
    /// Options for an application server with its own business logic
    pub fn new(subprotocol: impl Into<String>, supports: impl Into<String>) -> Self {
        Self {
            subprotocol: Some(subprotocol.into()),
            supports: Some(supports.into()),
            ..Self::default()
        }
    }

    /// Fill unset fields from environment variables, the way the binary
    /// boots
    pub fn load_env(mut self) -> Self {
        if let Ok(port) = std::env::var("SERVER_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(host) = std::env::var("SERVER_HOST") {
            self.host = host;
        }
        if self.backend.is_none() {
            self.backend = std::env::var("BACKEND_URL").ok();
        }
        if self.control_secret.is_none() {
            self.control_secret = std::env::var("CONTROL_SECRET").ok();
        }
        if self.env.is_none() {
            self.env = Some(Env::from_env());
        }
        self
    }

    /// Validate and parse the option set
    pub(crate) fn validate(&self) -> Result<ValidatedOptions, OptionsError> {
        let subprotocol = match &self.subprotocol {
            Some(raw) => Some(Version::parse(raw).map_err(|_| OptionsError::BadSubprotocol {
                value: raw.clone(),
            })?),
            None if self.backend.is_none() => return Err(OptionsError::MissingSubprotocol),
            None => None,
        };
        let supports = match &self.supports {
            Some(raw) => Some(VersionReq::parse(raw).map_err(|_| OptionsError::BadSupports {
                value: raw.clone(),
            })?),
            None if self.backend.is_none() => return Err(OptionsError::MissingSupports),
            None => None,
        };
        if self.backend.is_some() && self.control_secret.is_none() {
            return Err(OptionsError::NoControlSecret);
        }
        let control_mask: IpNet =
            self.control_mask
                .parse()
                .map_err(|_| OptionsError::BadControlMask {
                    value: self.control_mask.clone(),
                })?;
        if self.key.is_some() != self.cert.is_some() {
            return Err(OptionsError::IncompleteTls);
        }
        let tls = match (&self.key, &self.cert) {
            (Some(key), Some(cert)) => {
                let key = key
                    .resolve(&self.root)
                    .map_err(|e| OptionsError::BadTls {
                        message: e.to_string(),
                    })?;
                let cert = cert
                    .resolve(&self.root)
                    .map_err(|e| OptionsError::BadTls {
                        message: e.to_string(),
                    })?;
                Some(TlsMaterial { key, cert })
            }
            _ => None,
        };
        Ok(ValidatedOptions {
            subprotocol,
            supports,
            control_mask,
            tls,
        })
    }
}

/// Resolved TLS material
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    /// Private key PEM
    pub key: String,
    /// Certificate PEM
    pub cert: String,
}

/// Parsed products of option validation
#[derive(Debug)]
pub(crate) struct ValidatedOptions {
    pub subprotocol: Option<Version>,
    pub supports: Option<VersionReq>,
    pub control_mask: IpNet,
    pub tls: Option<TlsMaterial>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ServerOptions::default();
        assert_eq!(options.timeout, Duration::from_millis(20_000));
        assert_eq!(options.ping, Duration::from_millis(10_000));
        assert_eq!(options.port, 31_337);
        assert_eq!(options.control_port, 31_338);
        assert_eq!(options.control_mask, "127.0.0.1/8");
    }

    #[test]
    fn test_subprotocol_required_without_backend() {
        let options = ServerOptions::default();
        assert!(matches!(
            options.validate(),
            Err(OptionsError::MissingSubprotocol)
        ));
    }

    #[test]
    fn test_backend_requires_control_secret() {
        let options = ServerOptions {
            backend: Some("http://127.0.0.1:4000".into()),
            ..ServerOptions::default()
        };
        let error = options.validate().unwrap_err();
        assert!(matches!(error, OptionsError::NoControlSecret));
        assert_eq!(error.kind(), "LOGUX_NO_CONTROL_SECRET");
    }

    #[test]
    fn test_bad_semver_rejected() {
        let options = ServerOptions::new("not-a-version", "1.x");
        assert!(matches!(
            options.validate(),
            Err(OptionsError::BadSubprotocol { .. })
        ));

        let options = ServerOptions::new("1.0.0", "not a range !");
        assert!(matches!(
            options.validate(),
            Err(OptionsError::BadSupports { .. })
        ));
    }

    #[test]
    fn test_valid_options_parse() {
        let options = ServerOptions::new("1.2.0", "^1.0.0");
        let validated = options.validate().unwrap();
        assert!(validated
            .supports
            .as_ref()
            .unwrap()
            .matches(&Version::parse("1.2.0").unwrap()));
    }

    #[test]
    fn test_tls_must_be_complete() {
        let options = ServerOptions {
            key: Some(CertInput::Pem("key".into())),
            ..ServerOptions::new("1.0.0", "^1.0.0")
        };
        assert!(matches!(
            options.validate(),
            Err(OptionsError::IncompleteTls)
        ));
    }
}
