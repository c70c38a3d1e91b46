//! Persisted webhook registrations.
//!
//! Stored values use a slash-delimited encoding with optional flag segments in a fixed order:
//!
//! ```text
//! [cert/][#maxc<N>/][#ip<addr>/][#fix_ip/][#secret<token>/][#allow<csv>/]<url>
//! ```
//!
//! A missing flag segment means "unset", not "false".

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRegistration {
    pub url: String,
    pub has_certificate: bool,
    pub max_connections: Option<u32>,
    pub ip_address: Option<String>,
    pub fix_ip_address: bool,
    pub secret_token: Option<String>,
    /// Comma-separated update types, kept verbatim.
    pub allowed_updates: Option<String>,
}

fn read_segment(input: &str) -> (&str, &str) {
    input.split_once('/').unwrap_or((input, ""))
}

impl WebhookRegistration {
    /// Decodes a stored value. Returns `None` for values that do not describe a usable webhook.
    pub fn parse(value: &str) -> Option<Self> {
        let mut registration = WebhookRegistration::default();
        let mut rest = value;

        if let Some(tail) = rest.strip_prefix("cert/") {
            registration.has_certificate = true;
            rest = tail;
        }
        if let Some(tail) = rest.strip_prefix("#maxc") {
            let (max_connections, tail) = read_segment(tail);
            registration.max_connections = Some(max_connections.parse().ok()?);
            rest = tail;
        }
        if let Some(tail) = rest.strip_prefix("#ip") {
            let (ip_address, tail) = read_segment(tail);
            registration.ip_address = Some(ip_address.to_owned());
            rest = tail;
        }
        if let Some(tail) = rest.strip_prefix("#fix_ip") {
            registration.fix_ip_address = true;
            rest = tail.strip_prefix('/').unwrap_or(tail);
        }
        if let Some(tail) = rest.strip_prefix("#secret") {
            let (secret_token, tail) = read_segment(tail);
            registration.secret_token = Some(secret_token.to_owned());
            rest = tail;
        }
        if let Some(tail) = rest.strip_prefix("#allow") {
            let (allowed_updates, tail) = read_segment(tail);
            registration.allowed_updates = Some(allowed_updates.to_owned());
            rest = tail;
        }

        if rest.is_empty() {
            return None;
        }
        registration.url = rest.to_owned();
        Some(registration)
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        if self.has_certificate {
            out.push_str("cert/");
        }
        if let Some(max_connections) = self.max_connections {
            out.push_str(&format!("#maxc{max_connections}/"));
        }
        if let Some(ip_address) = &self.ip_address {
            out.push_str(&format!("#ip{ip_address}/"));
        }
        if self.fix_ip_address {
            out.push_str("#fix_ip/");
        }
        if let Some(secret_token) = &self.secret_token {
            out.push_str(&format!("#secret{secret_token}/"));
        }
        if let Some(allowed_updates) = &self.allowed_updates {
            out.push_str(&format!("#allow{allowed_updates}/"));
        }
        out.push_str(&self.url);
        out
    }

    /// Arguments of the `setwebhook` request that re-registers this webhook.
    pub fn restore_args(&self) -> Vec<(String, String)> {
        let mut args = Vec::new();
        if self.has_certificate {
            args.push(("certificate".to_owned(), "previous".to_owned()));
        }
        if let Some(max_connections) = self.max_connections {
            args.push(("max_connections".to_owned(), max_connections.to_string()));
        }
        if let Some(ip_address) = &self.ip_address {
            args.push(("ip_address".to_owned(), ip_address.clone()));
        }
        if self.fix_ip_address {
            args.push(("fix_ip_address".to_owned(), "1".to_owned()));
        }
        if let Some(secret_token) = &self.secret_token {
            args.push(("secret_token".to_owned(), secret_token.clone()));
        }
        if let Some(allowed_updates) = &self.allowed_updates {
            args.push(("allowed_updates".to_owned(), allowed_updates.clone()));
        }
        args.push(("url".to_owned(), self.url.clone()));
        args
    }

    pub fn summary(&self) -> WebhookSummary {
        WebhookSummary {
            url: self.url.clone(),
            has_certificate: self.has_certificate,
            max_connections: self.max_connections,
        }
    }
}

/// What statistics expose about a tenant's webhook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSummary {
    pub url: String,
    pub has_certificate: bool,
    pub max_connections: Option<u32>,
}
