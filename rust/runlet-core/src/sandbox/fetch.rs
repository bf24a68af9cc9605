//! Outbound HTTP capability.
//!
//! Failures never raise inside the script: they come back as a response map
//! whose `error` field is set, so scripts branch on it instead of catching.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use url::Url;

use super::error::{ExecutionError, ExecutionResult};
use super::policy::NetworkCapability;

/// Redirects followed when the script does not say otherwise.
pub const DEFAULT_REDIRECTS: usize = 5;

/// Options accepted by `fetch`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    pub url: Option<String>,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub proxy: Option<String>,
    pub redirects: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            url: None,
            method: "GET".into(),
            headers: BTreeMap::new(),
            body: Value::Null,
            proxy: None,
            redirects: DEFAULT_REDIRECTS,
        }
    }
}

impl FetchOptions {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }
}

/// Response map handed back to the script.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub size: usize,
    pub body: Value,
    pub error: Option<String>,
}

impl FetchResponse {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Per-invocation fetch client bound to the allow-list and the deadline.
#[derive(Debug, Clone)]
pub(crate) struct Fetcher {
    net: NetworkCapability,
    deadline: Instant,
    handle: Handle,
}

impl Fetcher {
    pub(crate) fn new(net: NetworkCapability, deadline: Instant, handle: Handle) -> Self {
        Self {
            net,
            deadline,
            handle,
        }
    }

    /// Perform the request. Must be called off the async runtime.
    pub(crate) fn fetch(&self, options: FetchOptions) -> FetchResponse {
        match self.try_fetch(options) {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(error = %err, "Script fetch failed");
                FetchResponse::failed(err.to_string())
            }
        }
    }

    fn try_fetch(&self, options: FetchOptions) -> ExecutionResult<FetchResponse> {
        let url = resolve_url(&self.net, options.url.as_deref())?;

        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(capability("execution deadline reached before fetch"));
        }

        let client = build_client(
            &self.net,
            options.redirects,
            options.proxy.as_deref(),
            remaining,
        )?;
        let method = reqwest::Method::from_bytes(options.method.to_ascii_uppercase().as_bytes())
            .map_err(|err| capability(format!("invalid method '{}': {err}", options.method)))?;

        let mut request = client.request(method, url.clone());
        for (name, value) in &options.headers {
            request = request.header(name, value);
        }
        request = match options.body {
            Value::Null => request,
            Value::String(text) => request.body(text),
            other => request.json(&other),
        };

        tracing::debug!(url = %url, "Script fetch");
        self.handle.block_on(async move {
            let response = request
                .send()
                .await
                .map_err(|err| capability(error_chain(&err)))?;
            let status_code = response.status().as_u16();
            let mut headers: BTreeMap<String, String> = BTreeMap::new();
            for (name, value) in response.headers() {
                let value = String::from_utf8_lossy(value.as_bytes());
                headers
                    .entry(name.as_str().to_string())
                    .and_modify(|joined| {
                        joined.push_str(", ");
                        joined.push_str(&value);
                    })
                    .or_insert_with(|| value.to_string());
            }
            let content_type = headers
                .get(CONTENT_TYPE.as_str())
                .cloned()
                .unwrap_or_default();
            let bytes = response.bytes().await.map_err(capability)?;

            Ok(FetchResponse {
                status_code,
                headers,
                size: bytes.len(),
                body: decode_body(&content_type, &bytes),
                error: None,
            })
        })
    }
}

fn capability(err: impl ToString) -> ExecutionError {
    ExecutionError::HostCapability(err.to_string())
}

/// Render an error with its sources; reqwest keeps the cause out of `Display`.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Parse the target and check it against the allow-list.
fn resolve_url(net: &NetworkCapability, raw: Option<&str>) -> ExecutionResult<Url> {
    let raw = raw
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| capability("fetch requires a url"))?;
    let url = Url::parse(raw).map_err(|err| capability(format!("invalid url '{raw}': {err}")))?;
    let host = host_key(&url, has_explicit_port(raw))
        .ok_or_else(|| capability(format!("url has no host: {raw}")))?;
    net.check(&host)?;
    Ok(url)
}

/// `host[:port]` as matched against the allow-list. The port is included
/// whenever the url spells one out, default ports too.
fn host_key(url: &Url, explicit_port: bool) -> Option<String> {
    let host = url.host_str()?;
    let port = if explicit_port {
        url.port_or_known_default()
    } else {
        url.port()
    };
    Some(match port {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Whether the authority of `raw` carries a `:port` suffix.
fn has_explicit_port(raw: &str) -> bool {
    let Some((_, rest)) = raw.split_once("://") else {
        return false;
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    if authority.ends_with(']') {
        return false;
    }
    authority
        .rsplit_once(':')
        .is_some_and(|(_, port)| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
}

/// Follow at most `limit` redirects, each target checked against the allow-list.
fn redirect_policy(net: NetworkCapability, limit: usize) -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() > limit {
            return attempt.error(format!("stopped after {limit} redirects"));
        }
        let Some(host) = host_key(attempt.url(), false) else {
            return attempt.error("redirect target has no host");
        };
        match net.check(&host) {
            Ok(()) => attempt.follow(),
            Err(err) => attempt.error(format!("redirect blocked: {err}")),
        }
    })
}

fn build_client(
    net: &NetworkCapability,
    redirects: usize,
    proxy: Option<&str>,
    timeout: Duration,
) -> ExecutionResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .redirect(redirect_policy(net.clone(), redirects))
        .timeout(timeout);
    if let Some(proxy) = proxy.map(str::trim).filter(|p| !p.is_empty()) {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|err| capability(format!("invalid proxy '{proxy}': {err}")))?;
        builder = builder.proxy(proxy);
    }
    builder.build().map_err(capability)
}

/// Decode a response body: JSON when declared, XML when well-formed,
/// raw text otherwise.
pub(crate) fn decode_body(content_type: &str, bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::String(String::new());
    }
    let text = String::from_utf8_lossy(bytes);
    if content_type.to_ascii_lowercase().contains("json") {
        if let Ok(value) = serde_json::from_slice(bytes) {
            return value;
        }
    } else if text.trim_start().starts_with('<') {
        if let Ok(doc) = roxmltree::Document::parse(&text) {
            let root = doc.root_element();
            let mut wrapped = Map::new();
            wrapped.insert(root.tag_name().name().to_string(), element_to_json(&root));
            return Value::Object(wrapped);
        }
    }
    Value::String(text.into_owned())
}

fn element_to_json(node: &roxmltree::Node<'_, '_>) -> Value {
    let mut obj = Map::new();

    let attrs: Map<String, Value> = node
        .attributes()
        .map(|attr| (attr.name().to_string(), Value::String(attr.value().to_string())))
        .collect();
    if !attrs.is_empty() {
        obj.insert("@attributes".into(), Value::Object(attrs));
    }

    let mut text = String::new();
    let mut order = Vec::new();
    let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
    for child in node.children() {
        if child.is_element() {
            let tag = child.tag_name().name().to_string();
            if !grouped.contains_key(&tag) {
                order.push(tag.clone());
            }
            grouped.entry(tag).or_default().push(element_to_json(&child));
        } else if let Some(chunk) = child.text().map(str::trim).filter(|t| !t.is_empty()) {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(chunk);
        }
    }

    if obj.is_empty() && order.is_empty() {
        return Value::String(text);
    }
    if !text.is_empty() {
        obj.insert("@text".into(), Value::String(text));
    }
    for tag in order {
        let mut values = grouped.remove(&tag).unwrap_or_default();
        let value = if values.len() == 1 {
            values.remove(0)
        } else {
            Value::Array(values)
        };
        obj.insert(tag, value);
    }
    Value::Object(obj)
}
