use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::StatusCode;
use serde::Deserialize;

use super::{AttestationSource, FetchRequest, SourceError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedVaaResponse {
    vaa_bytes: String,
}

/// Guardian REST endpoint serving signed attestations.
///
/// `GET {base}/v1/signed_vaa/{chain}/{emitter}/{sequence}` returns
/// `{"vaaBytes": "<base64>"}`, or 404 while the attestation is not signed.
pub struct HttpAttestationSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAttestationSource {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, request: &FetchRequest) -> String {
        format!(
            "{}/v1/signed_vaa/{}/{}/{}",
            self.base_url,
            request.emitter_chain.wire_id(),
            request.emitter_address.to_hex(),
            request.sequence
        )
    }
}

#[async_trait]
impl AttestationSource for HttpAttestationSource {
    fn name(&self) -> String {
        self.base_url.clone()
    }

    async fn fetch_signed(&self, request: &FetchRequest) -> Result<Option<Vec<u8>>, SourceError> {
        let response = self
            .client
            .get(self.url(request))
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SourceError::Response(format!("HTTP {}", response.status())));
        }

        let body: SignedVaaResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Response(e.to_string()))?;
        let bytes = STANDARD
            .decode(body.vaa_bytes)
            .map_err(|e| SourceError::Response(format!("Invalid base64: {}", e)))?;
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EMITTER;
    use crate::types::ChainId;

    fn request() -> FetchRequest {
        FetchRequest {
            emitter_chain: ChainId::Ethereum,
            emitter_address: EMITTER,
            sequence: 12,
            payload_hash: [0; 32],
        }
    }

    #[tokio::test]
    async fn test_fetch_signed_decodes_base64() {
        let mut server = mockito::Server::new_async().await;
        let path = format!("/v1/signed_vaa/2/{}/12", EMITTER.to_hex());
        let mock = server
            .mock("GET", path.as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(r#"{{"vaaBytes":"{}"}}"#, STANDARD.encode([1u8, 2, 3])))
            .create_async()
            .await;

        let source = HttpAttestationSource::new(&format!("{}/", server.url()));
        let bytes = source.fetch_signed(&request()).await.unwrap();
        assert_eq!(bytes, Some(vec![1, 2, 3]));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_not_found_means_not_signed_yet() {
        let mut server = mockito::Server::new_async().await;
        let path = format!("/v1/signed_vaa/2/{}/12", EMITTER.to_hex());
        let _mock = server
            .mock("GET", path.as_str())
            .with_status(404)
            .create_async()
            .await;

        let source = HttpAttestationSource::new(&server.url());
        assert_eq!(source.fetch_signed(&request()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_server_error_and_bad_payload() {
        let mut server = mockito::Server::new_async().await;
        let path = format!("/v1/signed_vaa/2/{}/12", EMITTER.to_hex());
        let _failing = server
            .mock("GET", path.as_str())
            .with_status(503)
            .create_async()
            .await;

        let source = HttpAttestationSource::new(&server.url());
        assert!(matches!(
            source.fetch_signed(&request()).await,
            Err(SourceError::Response(_))
        ));

        let mut garbage_server = mockito::Server::new_async().await;
        let _garbage = garbage_server
            .mock("GET", path.as_str())
            .with_status(200)
            .with_body(r#"{"vaaBytes":"!!!not base64"}"#)
            .create_async()
            .await;
        let source = HttpAttestationSource::new(&garbage_server.url());
        assert!(matches!(
            source.fetch_signed(&request()).await,
            Err(SourceError::Response(_))
        ));
    }
}
