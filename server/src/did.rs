use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} responded with HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("unsupported DID method: {0}")]
    UnsupportedDid(String),
    #[error("DID document for {0} has no #atproto_pds service")]
    MissingPds(String),
    #[error("protected resource {0} lists no authorization servers")]
    NoAuthorizationServer(String),
    #[error("authorization server metadata issuer {found} does not match {expected}")]
    IssuerMismatch { expected: String, found: String },
}

/// Where to find the public identity services.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub handle_resolver_url: String,
    pub plc_directory_url: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            handle_resolver_url: "https://public.api.bsky.app".to_string(),
            plc_directory_url: "https://plc.directory".to_string(),
        }
    }
}

/// Resolves handles to DIDs and DIDs to the PDS that hosts them.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_subject_id(&self, handle: &str) -> Result<String, IdentityError>;

    async fn resolve_resource_server_url(&self, did: &str) -> Result<String, IdentityError>;
}

#[derive(Debug, Deserialize)]
struct ResolveHandleResponse {
    did: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    pub id: String,
    #[serde(default)]
    pub also_known_as: Vec<String>,
    #[serde(default)]
    pub service: Vec<DidService>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidService {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub service_endpoint: String,
}

impl DidDocument {
    pub fn pds_endpoint(&self) -> Option<&str> {
        self.service
            .iter()
            .find(|s| s.id == "#atproto_pds" || s.id == format!("{}#atproto_pds", self.id))
            .map(|s| s.service_endpoint.trim_end_matches('/'))
    }
}

#[derive(Clone)]
pub struct HttpIdentityResolver {
    http: reqwest::Client,
    config: IdentityConfig,
}

impl HttpIdentityResolver {
    pub fn new(http: reqwest::Client, config: IdentityConfig) -> Self {
        Self { http, config }
    }

    /// URL of the DID document for `did:plc` and `did:web` identifiers.
    pub fn did_document_url(&self, did: &str) -> Result<String, IdentityError> {
        if did.starts_with("did:plc:") {
            Ok(format!(
                "{}/{}",
                self.config.plc_directory_url.trim_end_matches('/'),
                did
            ))
        } else if let Some(host) = did.strip_prefix("did:web:") {
            let host = host.replace("%3A", ":");
            Ok(format!("https://{host}/.well-known/did.json"))
        } else {
            Err(IdentityError::UnsupportedDid(did.to_string()))
        }
    }

    pub async fn resolve_did_document(&self, did: &str) -> Result<DidDocument, IdentityError> {
        let url = self.did_document_url(did)?;
        info!(did, url = %url, "resolving DID document");
        get_json(&self.http, &url).await
    }
}

#[async_trait]
impl IdentityResolver for HttpIdentityResolver {
    async fn resolve_subject_id(&self, handle: &str) -> Result<String, IdentityError> {
        if handle.starts_with("did:") {
            return Ok(handle.to_string());
        }

        let url = format!(
            "{}/xrpc/com.atproto.identity.resolveHandle?handle={}",
            self.config.handle_resolver_url.trim_end_matches('/'),
            urlencoding::encode(handle.trim_start_matches('@'))
        );
        let resolved: ResolveHandleResponse = get_json(&self.http, &url).await?;
        info!(handle, did = %resolved.did, "resolved handle");

        Ok(resolved.did)
    }

    async fn resolve_resource_server_url(&self, did: &str) -> Result<String, IdentityError> {
        let document = self.resolve_did_document(did).await?;
        document
            .pds_endpoint()
            .map(str::to_owned)
            .ok_or_else(|| IdentityError::MissingPds(did.to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct ProtectedResourceMetadata {
    pub authorization_servers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthServerMetadata {
    pub issuer: String,
    pub pushed_authorization_request_endpoint: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub dpop_signing_alg_values_supported: Vec<String>,
}

/// Follow a PDS to the metadata of the authorization server that protects it.
pub async fn fetch_authorization_server(
    http: &reqwest::Client,
    pds_url: &str,
) -> Result<AuthServerMetadata, IdentityError> {
    let pds_metadata_url = format!(
        "{}/.well-known/oauth-protected-resource",
        pds_url.trim_end_matches('/')
    );
    info!("Fetching PDS metadata from URL: {}", pds_metadata_url);
    let pds_metadata: ProtectedResourceMetadata = get_json(http, &pds_metadata_url).await?;

    let auth_server_url = pds_metadata
        .authorization_servers
        .first()
        .map(|s| s.trim_end_matches('/').to_string())
        .ok_or_else(|| IdentityError::NoAuthorizationServer(pds_url.to_string()))?;

    let auth_server_metadata_url =
        format!("{}/.well-known/oauth-authorization-server", auth_server_url);
    info!(
        "Fetching auth server metadata from URL: {}",
        auth_server_metadata_url
    );
    let metadata: AuthServerMetadata = get_json(http, &auth_server_metadata_url).await?;

    if metadata.issuer.trim_end_matches('/') != auth_server_url {
        error!(
            expected = %auth_server_url,
            found = %metadata.issuer,
            "authorization server metadata has unexpected issuer"
        );
        return Err(IdentityError::IssuerMismatch {
            expected: auth_server_url,
            found: metadata.issuer,
        });
    }

    Ok(metadata)
}

async fn get_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
) -> Result<T, IdentityError> {
    let http_err = |source| IdentityError::Http {
        url: url.to_string(),
        source,
    };

    let response = http.get(url).send().await.map_err(http_err)?;
    if !response.status().is_success() {
        error!("GET {} failed: HTTP {}", url, response.status());
        return Err(IdentityError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    response.json::<T>().await.map_err(http_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> HttpIdentityResolver {
        HttpIdentityResolver::new(
            reqwest::Client::new(),
            IdentityConfig {
                handle_resolver_url: "http://resolver.test".into(),
                plc_directory_url: "http://plc.test/".into(),
            },
        )
    }

    #[test]
    fn plc_and_web_dids_map_to_document_urls() {
        let resolver = resolver();
        assert_eq!(
            resolver.did_document_url("did:plc:abc123").unwrap(),
            "http://plc.test/did:plc:abc123"
        );
        assert_eq!(
            resolver.did_document_url("did:web:example.com").unwrap(),
            "https://example.com/.well-known/did.json"
        );
        assert!(matches!(
            resolver.did_document_url("did:key:zQ3"),
            Err(IdentityError::UnsupportedDid(_))
        ));
    }

    #[tokio::test]
    async fn dids_pass_through_without_a_lookup() {
        // resolver.test never resolves, so this only passes without a request
        let did = resolver().resolve_subject_id("did:plc:abc123").await.unwrap();
        assert_eq!(did, "did:plc:abc123");
    }

    #[test]
    fn pds_endpoint_accepts_both_service_id_forms() {
        let doc: DidDocument = serde_json::from_value(serde_json::json!({
            "id": "did:plc:abc123",
            "alsoKnownAs": ["at://alice.test"],
            "service": [{
                "id": "did:plc:abc123#atproto_pds",
                "type": "AtprotoPersonalDataServer",
                "serviceEndpoint": "https://pds.example/"
            }]
        }))
        .unwrap();

        assert_eq!(doc.pds_endpoint(), Some("https://pds.example"));
    }
}
