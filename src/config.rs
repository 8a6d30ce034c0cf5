//! Registry connection settings.
//!
//! A [`RegistryConfig`] is built once (usually from command line flags) and handed to
//! [`Registry::connect`](crate::registry::Registry::connect).  Nothing in the engine reads
//! credentials or URLs from anywhere else.

use crate::error::{Error, Result};

/// How to authenticate against a registry.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Auth {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
}

impl Auth {
    /// Basic auth if a username is given, anonymous otherwise.
    pub fn from_credentials(username: Option<String>, password: Option<String>) -> Self {
        match username {
            Some(username) if !username.is_empty() => Auth::Basic {
                username,
                password: password.unwrap_or_default(),
            },
            _ => Auth::Anonymous,
        }
    }
}

// Keep passwords out of logs.
impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::Anonymous => write!(f, "Anonymous"),
            Auth::Basic { username, .. } => write!(f, "Basic({username}, <redacted>)"),
        }
    }
}

/// Transport options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transport {
    /// Talk plain HTTP instead of HTTPS.
    pub insecure: bool,
    /// Accept any TLS certificate.
    pub skip_tls_verify: bool,
}

/// Everything needed to reach one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// `[scheme://]host[:port][/root/path]`
    pub url: String,
    pub auth: Auth,
    pub transport: Transport,
}

impl RegistryConfig {
    pub fn new(url: impl Into<String>) -> Self {
        RegistryConfig {
            url: url.into(),
            auth: Auth::Anonymous,
            transport: Transport::default(),
        }
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Splits the URL into registry host and root repository path.
    ///
    /// An `http://` scheme forces plain HTTP transport; the returned [`Transport`] reflects that.
    pub fn endpoint(&self) -> Result<(String, String, Transport)> {
        let mut transport = self.transport;
        let url = self.url.trim().trim_end_matches('/');
        let url = if let Some(rest) = url.strip_prefix("http://") {
            transport.insecure = true;
            rest
        } else {
            url.strip_prefix("https://").unwrap_or(url)
        };

        let (host, root) = url.split_once('/').unwrap_or((url, ""));
        if host.is_empty() {
            return Err(Error::InvalidReference {
                reference: self.url.clone(),
                reason: "missing registry host".to_string(),
            });
        }
        Ok((host.to_string(), root.to_string(), transport))
    }
}
