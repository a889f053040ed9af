//! Authentication challenge handling
//!
//! Answers a 401/407 by picking the first advertised scheme the configured
//! credentials can satisfy. Supported schemes: `Basic`, `Bearer`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use changes_core::CredentialsConfig;
use std::fmt;
use thiserror::Error;

/// No configured credential matches any advertised scheme
#[derive(Debug, Error)]
#[error("no credentials for {} authentication scheme(s) [{schemes}]", origin(.proxy))]
pub struct NoCredentials {
    pub schemes: String,
    pub proxy: bool,
}

fn origin(proxy: &bool) -> &'static str {
    if *proxy {
        "proxy"
    } else {
        "server"
    }
}

/// Parsed challenge from a 401/407 response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Advertised schemes in header order, lowercase
    pub schemes: Vec<String>,
    /// 407 from a proxy rather than 401 from the origin
    pub proxy: bool,
}

impl Challenge {
    /// Parse the `WWW-Authenticate` / `Proxy-Authenticate` value
    ///
    /// A missing or empty header is read as `Basic`; CouchDB answers JSON
    /// requests with a bare 401.
    pub fn parse(status: u16, header: Option<&str>) -> Self {
        let mut schemes: Vec<String> = header
            .unwrap_or_default()
            .split(',')
            .filter_map(|part| part.split_whitespace().next())
            .filter(|token| {
                !token.contains('=')
                    && token
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            })
            .map(str::to_ascii_lowercase)
            .collect();
        schemes.dedup();
        if schemes.is_empty() {
            schemes.push("basic".to_string());
        }

        Self {
            schemes,
            proxy: status == 407,
        }
    }

    /// Header that carries the answer
    pub fn response_header_name(&self) -> &'static str {
        if self.proxy {
            "Proxy-Authorization"
        } else {
            "Authorization"
        }
    }
}

/// Header to attach to the retried request
#[derive(Clone, PartialEq, Eq)]
pub struct AuthHeader {
    pub name: &'static str,
    pub value: String,
    pub scheme: &'static str,
}

impl fmt::Debug for AuthHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthHeader")
            .field("name", &self.name)
            .field("scheme", &self.scheme)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Derives credentials for challenges from static configuration
#[derive(Debug, Clone)]
pub struct ChallengeHandler {
    credentials: CredentialsConfig,
}

impl ChallengeHandler {
    pub fn new(credentials: CredentialsConfig) -> Self {
        Self { credentials }
    }

    /// Produce the header answering `challenge`
    pub fn respond(&self, challenge: &Challenge) -> Result<AuthHeader, NoCredentials> {
        let name = challenge.response_header_name();
        for scheme in &challenge.schemes {
            match scheme.as_str() {
                "basic" => {
                    if let (Some(user), Some(pass)) =
                        (&self.credentials.username, &self.credentials.password)
                    {
                        let encoded = STANDARD.encode(format!("{}:{}", user, pass));
                        return Ok(AuthHeader {
                            name,
                            value: format!("Basic {}", encoded),
                            scheme: "basic",
                        });
                    }
                }
                "bearer" => {
                    if let Some(token) = &self.credentials.token {
                        return Ok(AuthHeader {
                            name,
                            value: format!("Bearer {}", token),
                            scheme: "bearer",
                        });
                    }
                }
                _ => {}
            }
        }

        Err(NoCredentials {
            schemes: challenge.schemes.join(", "),
            proxy: challenge.proxy,
        })
    }
}
