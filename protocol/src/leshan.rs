//! Thin HTTP client for the Leshan LwM2M server.
//!
//! A struct wrapping `reqwest::Client` with plain `async fn` operations,
//! rather than behind a generic trait, since there is exactly one backend
//! here.

use serde::Deserialize;
use serde_json::Value;

use crate::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSummary {
    pub endpoint: String,
    #[serde(default)]
    pub registration_id: Option<String>,
}

pub struct LeshanClient {
    http: reqwest::Client,
    base_url: String,
}

impl LeshanClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        LeshanClient {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// `GET /api/clients`.
    pub async fn list_clients(&self) -> Result<Vec<ClientSummary>> {
        let url = format!("{}/api/clients", self.base_url);
        let clients = self.http.get(url).send().await?.json().await?;
        Ok(clients)
    }

    /// `GET /api/clients/{endpoint}/{obj}/{ins}/{res}`, unwrapping the
    /// `{"content":{"value":...}}` envelope.
    pub async fn get_resource(
        &self,
        endpoint: &str,
        obj: u32,
        ins: u32,
        res: u32,
    ) -> Result<Value> {
        let url = format!(
            "{}/api/clients/{endpoint}/{obj}/{ins}/{res}",
            self.base_url
        );
        let body: Value = self.http.get(url).send().await?.json().await?;
        Ok(body
            .get("content")
            .and_then(|c| c.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// `PUT /api/security/clients/` with
    /// `{"endpoint","tls":{"mode":"psk","details":{"identity","key"}}}`.
    pub async fn push_psk(&self, endpoint: &str, identity: &str, key: &str) -> Result<()> {
        let url = format!("{}/api/security/clients/", self.base_url);
        let payload = serde_json::json!({
            "endpoint": endpoint,
            "tls": {
                "mode": "psk",
                "details": { "identity": identity, "key": key }
            }
        });
        self.http.put(url).json(&payload).send().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_summary_parses_minimal_json() {
        let json = r#"[{"endpoint":"urn:imei:123"}]"#;
        let clients: Vec<ClientSummary> = serde_json::from_str(json).unwrap();
        assert_eq!(clients[0].endpoint, "urn:imei:123");
        assert_eq!(clients[0].registration_id, None);
    }
}
