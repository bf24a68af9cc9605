//! Capability policy for a single script invocation.
//!
//! Every invocation gets its own [`CapabilityConfig`]: which hosts `fetch`
//! may contact, the wall-clock budget, whether the `cron` bundle is exposed
//! and the inbound request descriptor (if any).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{ExecutionError, ExecutionResult};

/// Default wall-clock budget per invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound network policy for the `fetch` capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkCapability {
    /// Only these `host[:port]` values may be contacted.
    AllowList(Vec<String>),

    /// Any host may be contacted.
    #[default]
    AllowAll,
}

impl NetworkCapability {
    /// Build a policy from configured entries. Entries are trimmed and empty
    /// ones dropped; nothing left means every host is allowed.
    pub fn from_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts: Vec<String> = hosts
            .into_iter()
            .map(|host| host.as_ref().trim().to_string())
            .filter(|host| !host.is_empty())
            .collect();
        if hosts.is_empty() {
            Self::AllowAll
        } else {
            Self::AllowList(hosts)
        }
    }

    /// Parse a comma-separated allow-list.
    pub fn parse(csv: &str) -> Self {
        Self::from_hosts(csv.split(','))
    }

    /// Check whether `host` may be contacted.
    pub fn check(&self, host: &str) -> ExecutionResult<()> {
        match self {
            Self::AllowAll => Ok(()),
            Self::AllowList(list) => {
                if list.iter().any(|allowed| allowed == host) {
                    Ok(())
                } else {
                    Err(ExecutionError::HostCapability(format!(
                        "host not allowed: {host}"
                    )))
                }
            }
        }
    }
}

/// Inbound HTTP request as seen by a script through `request`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub uri: String,
    pub method: String,
    pub proto: String,
    pub host: String,
    /// Peer `ip:port`, empty when the transport does not report one.
    pub remote_addr: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON when the content type says so, text otherwise.
    pub body: Value,
}

impl RequestContext {
    /// Decode a request body according to its content type.
    pub fn decode_body(content_type: Option<&str>, body: &[u8]) -> Value {
        if body.is_empty() {
            return Value::Null;
        }
        let is_json = content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
        if is_json {
            if let Ok(value) = serde_json::from_slice(body) {
                return value;
            }
        }
        Value::String(String::from_utf8_lossy(body).into_owned())
    }
}

/// Capabilities granted to one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    /// Hosts reachable through `fetch`.
    pub net: NetworkCapability,

    /// Wall-clock budget; the script is interrupted once it elapses.
    pub timeout: Duration,

    /// Expose the `cron` bundle.
    pub allow_cron: bool,

    /// Inbound request, absent for cron ticks.
    pub request: Option<RequestContext>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            net: NetworkCapability::AllowAll,
            timeout: DEFAULT_TIMEOUT,
            allow_cron: false,
            request: None,
        }
    }
}

impl CapabilityConfig {
    pub fn new(net: NetworkCapability, timeout: Duration) -> Self {
        Self {
            net,
            timeout,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_cron(mut self, allow: bool) -> Self {
        self.allow_cron = allow;
        self
    }

    #[must_use]
    pub fn with_request(mut self, request: RequestContext) -> Self {
        self.request = Some(request);
        self
    }

    /// Validate that the config is sane.
    pub fn validate(&self) -> ExecutionResult<()> {
        if self.timeout.is_zero() {
            return Err(ExecutionError::Panic("timeout must be > 0".into()));
        }
        Ok(())
    }

    /// Budget in whole seconds, as reported in timeout messages.
    pub fn budget_secs(&self) -> u64 {
        self.timeout.as_secs().max(1)
    }
}
