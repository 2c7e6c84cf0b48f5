// =============================================================================
// KuCoin REST client — HMAC-SHA256 signed requests for LIVE-mode reconcile
// =============================================================================
//
// SECURITY: the secret and passphrase never appear in logs or serialized
// state. Signing follows the KC-API-SIGN scheme: base64(HMAC-SHA256(secret,
// timestamp + method + path + body)), with the passphrase itself signed the
// same way under API key version 2.
//
// Paper mode never constructs this client; it exists so LIVE mode can
// validate credentials at startup and reconcile balances periodically.
// =============================================================================

use anyhow::{Context, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, instrument};

use crate::config::VenueCredentials;

type HmacSha256 = Hmac<Sha256>;

/// Outbound request timeout, shared with the rest of the engine.
const REQUEST_TIMEOUT_SECS: u64 = 12;

/// One asset balance as reported by the venue.
#[derive(Debug, Clone)]
pub struct AccountBalance {
    pub currency: String,
    pub available: f64,
    pub holds: f64,
}

/// Signed KuCoin REST client.
#[derive(Clone)]
pub struct KucoinClient {
    credentials: VenueCredentials,
    base_url: String,
    client: reqwest::Client,
}

impl KucoinClient {
    pub fn new(credentials: VenueCredentials) -> Self {
        Self::with_base_url(credentials, "https://api.kucoin.com")
    }

    pub fn with_base_url(credentials: VenueCredentials, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");
        Self {
            credentials,
            base_url: base_url.into(),
            client,
        }
    }

    /// base64(HMAC-SHA256(secret, payload))
    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// GET /api/v1/accounts (signed) — spot account balances.
    #[instrument(skip(self), name = "kucoin::get_accounts")]
    pub async fn get_accounts(&self) -> Result<Vec<AccountBalance>> {
        let path = "/api/v1/accounts";
        let ts = Self::timestamp_ms();
        let signature = self.sign(&format!("{ts}GET{path}"));
        let passphrase = self.sign(&self.credentials.api_passphrase);

        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("KC-API-KEY", &self.credentials.api_key)
            .header("KC-API-SIGN", signature)
            .header("KC-API-TIMESTAMP", ts.to_string())
            .header("KC-API-PASSPHRASE", passphrase)
            .header("KC-API-KEY-VERSION", "2")
            .send()
            .await
            .context("GET /api/v1/accounts request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse accounts response")?;
        if !status.is_success() {
            anyhow::bail!("KuCoin GET {path} returned {status}: {body}");
        }

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .context("accounts response missing data array")?;

        let balances = rows
            .iter()
            .filter_map(|row| {
                let currency = row.get("currency")?.as_str()?.to_string();
                let available = row.get("available")?.as_str()?.parse().ok()?;
                let holds = row.get("holds")?.as_str()?.parse().ok()?;
                Some(AccountBalance {
                    currency,
                    available,
                    holds,
                })
            })
            .collect::<Vec<_>>();

        debug!(count = balances.len(), "account balances retrieved");
        Ok(balances)
    }

    /// Cheap credential check at startup: any authenticated call succeeding
    /// proves the key set works.
    pub async fn validate_credentials(&self) -> Result<()> {
        self.get_accounts().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> KucoinClient {
        KucoinClient::new(VenueCredentials {
            api_key: "key".into(),
            api_secret: "secret".into(),
            api_passphrase: "phrase".into(),
        })
    }

    #[test]
    fn signature_is_valid_base64() {
        let sig = client().sign("1700000000000GET/api/v1/accounts");
        // HMAC-SHA256 digests are 32 bytes -> 44 base64 characters.
        assert_eq!(sig.len(), 44);
        assert!(base64::engine::general_purpose::STANDARD
            .decode(&sig)
            .is_ok());
    }

    #[test]
    fn signature_is_deterministic_and_key_dependent() {
        let c = client();
        let a = c.sign("1700000000000GET/api/v1/accounts");
        let b = c.sign("1700000000000GET/api/v1/accounts");
        assert_eq!(a, b);

        let other = KucoinClient::new(VenueCredentials {
            api_key: "key".into(),
            api_secret: "different".into(),
            api_passphrase: "phrase".into(),
        });
        assert_ne!(a, other.sign("1700000000000GET/api/v1/accounts"));
    }

    #[test]
    fn passphrase_signing_differs_from_raw() {
        let c = client();
        assert_ne!(c.sign("phrase"), "phrase");
    }
}
