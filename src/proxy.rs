use http::Uri;
use std::env;
use tracing::{debug, warn};

/// HTTP CONNECT proxy used to reach a websocket broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAgent {
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
    /// The tunnelled endpoint speaks TLS (`wss`).
    pub secure_endpoint: bool,
}

impl ProxyAgent {
    /// Picks the proxy for `broker_url`. Only websocket brokers are proxied, and any
    /// `no_proxy` entry contained in the broker URL disables proxying for it.
    pub fn for_broker(broker_url: &str, proxy_url: Option<&str>, no_proxy: &[String]) -> Option<Self> {
        let proxy_url = proxy_url?;
        let secure_endpoint = if broker_url.starts_with("wss://") {
            true
        } else if broker_url.starts_with("ws://") {
            false
        } else {
            return None;
        };

        if no_proxy
            .iter()
            .map(|entry| entry.trim())
            .any(|entry| !entry.is_empty() && broker_url.contains(entry))
        {
            debug!("Broker {} is excluded from proxying.", broker_url);
            return None;
        }

        let uri: Uri = match proxy_url.parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!("Ignoring invalid proxy URL '{}': {}", proxy_url, e);
                return None;
            }
        };
        let authority = uri.authority()?;
        let port = authority
            .port_u16()
            .unwrap_or(if uri.scheme_str() == Some("https") { 443 } else { 80 });
        let credentials = authority
            .as_str()
            .rsplit_once('@')
            .and_then(|(userinfo, _)| userinfo.split_once(':'))
            .map(|(user, pass)| (user.to_string(), pass.to_string()));

        Some(Self {
            host: authority.host().to_string(),
            port,
            credentials,
            secure_endpoint,
        })
    }

    /// Reads `http_proxy`/`HTTP_PROXY` and `no_proxy`/`NO_PROXY`; the upper case
    /// variables take precedence.
    pub fn from_env(broker_url: &str) -> Option<Self> {
        let proxy = env::var("HTTP_PROXY").or_else(|_| env::var("http_proxy")).ok();
        let no_proxy: Vec<String> = env::var("NO_PROXY")
            .or_else(|_| env::var("no_proxy"))
            .map(|list| list.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        Self::for_broker(broker_url, proxy.as_deref(), &no_proxy)
    }
}
