//! Bot token rules: validation, shard assignment and the keys derived from a token.

use serde::{Deserialize, Serialize};

/// Tokens longer than this are rejected outright.
pub const MAX_TOKEN_LEN: usize = 80;

/// Tenant ids must fit in this many bits; the bit above them marks the test environment in a
/// [`ShardKey`].
pub const TENANT_ID_BITS: u32 = 54;

const TEST_LOOKUP_SUFFIX: &str = "/test";
const TEST_WEBHOOK_SUFFIX: &str = ":T";

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid token")]
    Malformed,

    #[error("token is not served by this router")]
    Misdirected,
}

/// The slice of tenant ids served by one router: `tenant_id % modulus == rem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRange {
    pub rem: u64,
    #[serde(rename = "mod")]
    pub modulus: u64,
}

impl TokenRange {
    /// Serves every tenant.
    pub const ALL: TokenRange = TokenRange { rem: 0, modulus: 1 };

    pub fn contains(&self, tenant_id: u64) -> bool {
        // A zero modulus is rejected by config validation; treat it as "serve nothing".
        self.modulus != 0 && tenant_id % self.modulus == self.rem
    }
}

impl Default for TokenRange {
    fn default() -> Self {
        Self::ALL
    }
}

/// Partition key of the update log: tenant id with the test-environment flag folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey(u64);

impl ShardKey {
    pub fn new(tenant_id: u64, is_test_dc: bool) -> Self {
        Self(tenant_id + (u64::from(is_test_dc) << TENANT_ID_BITS))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Validates `token` and returns its tenant id.
///
/// The tenant id is the decimal prefix up to the first `:`.
pub fn validate(token: &str, range: TokenRange) -> Result<u64, TokenError> {
    if token.is_empty()
        || token.len() > MAX_TOKEN_LEN
        || token.starts_with('0')
        || token.contains('/')
    {
        return Err(TokenError::Malformed);
    }
    let Some((id, _secret)) = token.split_once(':') else {
        return Err(TokenError::Malformed);
    };
    let tenant_id = parse_tenant_id(id).ok_or(TokenError::Malformed)?;
    if !range.contains(tenant_id) {
        return Err(TokenError::Misdirected);
    }
    Ok(tenant_id)
}

fn parse_tenant_id(id: &str) -> Option<u64> {
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let tenant_id = id.parse::<u64>().ok()?;
    (tenant_id > 0 && tenant_id < (1 << TENANT_ID_BITS)).then_some(tenant_id)
}

/// Key under which a worker is registered. Test and production tenants never share a worker.
pub fn lookup_key(token: &str, is_test_dc: bool) -> String {
    if is_test_dc {
        format!("{token}{TEST_LOOKUP_SUFFIX}")
    } else {
        token.to_owned()
    }
}

/// Key under which a tenant's webhook registration is persisted.
pub fn webhook_key(token: &str, is_test_dc: bool) -> String {
    if is_test_dc {
        format!("{token}{TEST_WEBHOOK_SUFFIX}")
    } else {
        token.to_owned()
    }
}

/// A webhook-store key split back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookKey<'a> {
    pub token: &'a str,
    pub is_test_dc: bool,
    pub tenant_id: u64,
}

pub fn parse_webhook_key(key: &str) -> Option<WebhookKey<'_>> {
    let (token, is_test_dc) = match key.strip_suffix(TEST_WEBHOOK_SUFFIX) {
        Some(token) => (token, true),
        None => (key, false),
    };
    let (id, _) = token.split_once(':')?;
    Some(WebhookKey {
        token,
        is_test_dc,
        tenant_id: parse_tenant_id(id)?,
    })
}

/// Redacts the secret part of a token for logs and statistics.
pub fn mask_token(token: &str) -> String {
    const KEEP: usize = 3;

    let Some((id, secret)) = token.split_once(':') else {
        return "***".to_owned();
    };
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() < 4 * KEEP {
        return format!("{id}:***");
    }
    let head: String = chars[..KEEP].iter().collect();
    let tail: String = chars[chars.len() - KEEP..].iter().collect();
    format!("{id}:{head}...{tail}")
}
