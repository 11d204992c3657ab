//! reqwest implementation of [`ProviderClient`].

use super::{
    ApiRequest, Enrichment, ProviderClient, ProviderDescriptor, ProviderKind, TokenResponse,
    UpstreamResponse, XERO_TENANT_HEADER,
};
use crate::credentials::{CompanyInfo, TenantDescriptor};
use crate::error::BrokerError;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// QuickBooks `companyinfo` response envelope
#[derive(Deserialize)]
struct CompanyInfoEnvelope {
    #[serde(rename = "CompanyInfo")]
    company_info: QbCompanyInfo,
}

#[derive(Deserialize)]
struct QbCompanyInfo {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "CompanyName", default)]
    company_name: Option<String>,
    #[serde(rename = "Country", default)]
    country: Option<String>,
}

/// Talks to a provider over HTTPS using the endpoints in its descriptor.
pub struct HttpProviderClient {
    descriptor: ProviderDescriptor,
    http: reqwest::Client,
}

impl HttpProviderClient {
    /// Creates a client whose every upstream call is bounded by `timeout`.
    pub fn new(descriptor: ProviderDescriptor, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { descriptor, http })
    }

    async fn token_request(
        &self,
        form: &[(&str, &str)],
        operation: &str,
    ) -> Result<TokenResponse, BrokerError> {
        debug!(
            provider = %self.descriptor.kind,
            url = %self.descriptor.token_url,
            operation,
            "Calling token endpoint"
        );

        let response = self
            .http
            .post(&self.descriptor.token_url)
            .basic_auth(&self.descriptor.client_id, Some(&self.descriptor.client_secret))
            .header(ACCEPT, "application/json")
            .form(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(BrokerError::UpstreamAuth {
                message: format!("{} failed with status {}: {}", operation, status, body),
            });
        }

        let token_response: TokenResponse =
            response.json().await.map_err(|e| BrokerError::UpstreamAuth {
                message: format!("Failed to parse {} response: {}", operation, e),
            })?;

        debug!(
            provider = %self.descriptor.kind,
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "{} successful",
            operation
        );

        Ok(token_response)
    }

    async fn get_json(&self, url: &str, access_token: &str) -> Result<reqwest::Response, BrokerError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::UpstreamApi { status, body });
        }

        Ok(response)
    }

    /// Upstream URL for a decoded API path. Each segment is percent-encoded
    /// again, so `?` or `#` inside a segment stays part of the path.
    fn api_url(&self, scope_id: &str, path: &str) -> String {
        let base = self.descriptor.api_base_url.trim_end_matches('/');
        let path = path
            .trim_start_matches('/')
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        match self.descriptor.kind {
            ProviderKind::Xero => format!("{}/{}", base, path),
            ProviderKind::QuickBooks => {
                format!("{}/{}/{}", base, urlencoding::encode(scope_id), path)
            }
        }
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, BrokerError> {
        self.token_request(
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", &self.descriptor.redirect_uri),
            ],
            "Token exchange",
        )
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, BrokerError> {
        self.token_request(
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
            "Token refresh",
        )
        .await
    }

    async fn revoke(&self, token: &str) -> bool {
        let request = self
            .http
            .post(&self.descriptor.revoke_url)
            .basic_auth(&self.descriptor.client_id, Some(&self.descriptor.client_secret))
            .header(ACCEPT, "application/json");

        let request = match self.descriptor.kind {
            ProviderKind::Xero => request.form(&[("token", token)]),
            ProviderKind::QuickBooks => request.json(&serde_json::json!({ "token": token })),
        };

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(provider = %self.descriptor.kind, "Token revoked");
                true
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(
                    provider = %self.descriptor.kind,
                    status = %status,
                    body = %body,
                    "Token revocation failed"
                );
                false
            }
            Err(e) => {
                warn!(provider = %self.descriptor.kind, error = %e, "Token revocation request failed");
                false
            }
        }
    }

    async fn enrich(&self, access_token: &str, scope_id: &str) -> Result<Enrichment, BrokerError> {
        match self.descriptor.kind {
            ProviderKind::Xero => {
                let tenants: Vec<TenantDescriptor> = self
                    .get_json(&self.descriptor.enrichment_url, access_token)
                    .await?
                    .json()
                    .await
                    .map_err(|e| BrokerError::Transport(format!("Invalid connections response: {}", e)))?;

                debug!(provider = %self.descriptor.kind, tenants = tenants.len(), "Connections fetched");
                Ok(Enrichment::Tenants(tenants))
            }
            ProviderKind::QuickBooks => {
                let url = self.api_url(
                    scope_id,
                    &format!("companyinfo/{}", scope_id),
                );
                let envelope: CompanyInfoEnvelope = self
                    .get_json(&url, access_token)
                    .await?
                    .json()
                    .await
                    .map_err(|e| BrokerError::Transport(format!("Invalid company info response: {}", e)))?;

                let info = envelope.company_info;
                Ok(Enrichment::Company(CompanyInfo {
                    id: info.id,
                    name: info.company_name,
                    country: info.country,
                }))
            }
        }
    }

    async fn call_api(
        &self,
        access_token: &str,
        scope_id: &str,
        request: &ApiRequest,
    ) -> Result<UpstreamResponse, BrokerError> {
        let url = self.api_url(scope_id, &request.path);

        debug!(
            provider = %self.descriptor.kind,
            method = %request.method,
            url = %url,
            "Forwarding API request"
        );

        let mut builder = self
            .http
            .request(request.method.clone(), &url)
            .bearer_auth(access_token)
            .header(ACCEPT, "application/json");

        if self.descriptor.kind == ProviderKind::Xero {
            builder = builder.header(XERO_TENANT_HEADER, scope_id);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response.bytes().await?.to_vec();

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    // base64("client-id:client-secret")
    const BASIC_AUTH: &str = "Basic Y2xpZW50LWlkOmNsaWVudC1zZWNyZXQ=";

    fn client(kind: ProviderKind, server_url: &str) -> HttpProviderClient {
        let descriptor = ProviderDescriptor {
            kind,
            auth_url: format!("{}/authorize", server_url),
            token_url: format!("{}/token", server_url),
            revoke_url: format!("{}/revoke", server_url),
            enrichment_url: format!("{}/connections", server_url),
            api_base_url: format!("{}/api", server_url),
            scopes: vec!["openid".to_string()],
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            redirect_uri: "http://localhost:3000/auth/callback".to_string(),
        };
        HttpProviderClient::new(descriptor, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_exchange_code_uses_basic_auth() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_header("authorization", BASIC_AUTH)
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "auth-code".into()),
                Matcher::UrlEncoded(
                    "redirect_uri".into(),
                    "http://localhost:3000/auth/callback".into(),
                ),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"access_token":"at","refresh_token":"rt","expires_in":1800,"token_type":"Bearer","id_token":"idt"}"#,
            )
            .create_async()
            .await;

        let response = client(ProviderKind::Xero, &server.url())
            .exchange_code("auth-code")
            .await
            .unwrap();

        assert_eq!(response.access_token, "at");
        assert_eq!(response.refresh_token.as_deref(), Some("rt"));
        assert_eq!(response.expires_in, Some(1800));
        assert_eq!(response.id_token.as_deref(), Some("idt"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_failure_carries_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded(
                "grant_type".into(),
                "refresh_token".into(),
            ))
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let err = client(ProviderKind::QuickBooks, &server.url())
            .refresh("stale")
            .await
            .unwrap_err();

        match err {
            BrokerError::UpstreamAuth { message } => {
                assert!(message.contains("invalid_grant"), "{}", message);
                assert!(message.contains("400"), "{}", message);
            }
            other => panic!("Expected UpstreamAuth, got {:?}", other),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_revoke_quickbooks_sends_json() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/revoke")
            .match_header("authorization", BASIC_AUTH)
            .match_body(Matcher::Json(serde_json::json!({ "token": "rt" })))
            .with_status(200)
            .create_async()
            .await;

        assert!(client(ProviderKind::QuickBooks, &server.url()).revoke("rt").await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_revoke_xero_sends_form() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/revoke")
            .match_body(Matcher::UrlEncoded("token".into(), "rt".into()))
            .with_status(200)
            .create_async()
            .await;

        assert!(client(ProviderKind::Xero, &server.url()).revoke("rt").await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_revoke_failure_is_swallowed() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/revoke")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        assert!(!client(ProviderKind::QuickBooks, &server.url()).revoke("rt").await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_revoke_unreachable_is_swallowed() {
        let client = client(ProviderKind::Xero, "http://127.0.0.1:9");
        assert!(!client.revoke("rt").await);
    }

    #[tokio::test]
    async fn test_enrich_xero_connections() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/connections")
            .match_header("authorization", "Bearer at")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"id":"c1","tenantId":"t1","tenantType":"ORGANISATION","tenantName":"Demo Company (UK)"}]"#,
            )
            .create_async()
            .await;

        let enrichment = client(ProviderKind::Xero, &server.url())
            .enrich("at", "default")
            .await
            .unwrap();

        assert_eq!(
            enrichment,
            Enrichment::Tenants(vec![TenantDescriptor {
                id: "t1".to_string(),
                name: "Demo Company (UK)".to_string(),
            }])
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_enrich_quickbooks_company() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/9130/companyinfo/9130")
            .match_header("authorization", "Bearer at")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"CompanyInfo":{"Id":"1","CompanyName":"Sandbox Company_US_1","Country":"US"},"time":"2026-01-01"}"#,
            )
            .create_async()
            .await;

        let enrichment = client(ProviderKind::QuickBooks, &server.url())
            .enrich("at", "9130")
            .await
            .unwrap();

        assert_eq!(
            enrichment,
            Enrichment::Company(CompanyInfo {
                id: "1".to_string(),
                name: Some("Sandbox Company_US_1".to_string()),
                country: Some("US".to_string()),
            })
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_enrich_failure_is_upstream_api_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/connections")
            .with_status(403)
            .with_body(r#"{"Title":"Forbidden"}"#)
            .create_async()
            .await;

        let err = client(ProviderKind::Xero, &server.url())
            .enrich("at", "default")
            .await
            .unwrap_err();

        match err {
            BrokerError::UpstreamApi { status, body } => {
                assert_eq!(status, 403);
                assert_eq!(body, r#"{"Title":"Forbidden"}"#);
            }
            other => panic!("Expected UpstreamApi, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_api_xero_sets_tenant_header() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/Invoices")
            .match_header("authorization", "Bearer at")
            .match_header("xero-tenant-id", "tenant-1")
            .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"Invoices":[]}"#)
            .create_async()
            .await;

        let request = ApiRequest {
            method: reqwest::Method::GET,
            path: "/Invoices".to_string(),
            query: vec![("page".to_string(), "2".to_string())],
        };
        let response = client(ProviderKind::Xero, &server.url())
            .call_api("at", "tenant-1", &request)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, br#"{"Invoices":[]}"#.to_vec());
        assert_eq!(response.content_type.as_deref(), Some("application/json"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_call_api_quickbooks_uses_realm_segment() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/9130/customer/1")
            .with_status(404)
            .with_body(r#"{"Fault":"x"}"#)
            .create_async()
            .await;

        let request = ApiRequest {
            method: reqwest::Method::GET,
            path: "customer/1".to_string(),
            query: Vec::new(),
        };
        let response = client(ProviderKind::QuickBooks, &server.url())
            .call_api("at", "9130", &request)
            .await
            .unwrap();

        assert_eq!(response.status, 404);
        assert!(!response.is_success());
        assert_eq!(response.body, br#"{"Fault":"x"}"#.to_vec());
        mock.assert_async().await;
    }

    #[test]
    fn test_api_url_reencodes_path_segments() {
        let xero = client(ProviderKind::Xero, "http://upstream.test");
        assert_eq!(
            xero.api_url("tenant-1", "/Contacts/a?b#c/Attachments/My File.pdf"),
            "http://upstream.test/api/Contacts/a%3Fb%23c/Attachments/My%20File.pdf"
        );

        let quickbooks = client(ProviderKind::QuickBooks, "http://upstream.test");
        assert_eq!(
            quickbooks.api_url("9130", "invoice/12?3"),
            "http://upstream.test/api/9130/invoice/12%3F3"
        );
    }
}
