//! Credential sourcing for control-plane requests.
//!
//! Two sources implement the [`CredentialSource`] capability: a fixed
//! key pair, and an auto-refreshing source backed by the container
//! metadata endpoint that temporary-role deployments expose.

use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::pin::Pin;

use serde::Deserialize;
use thiserror::Error;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::sync::Mutex;
use tracing::debug;

/// Link-local base address of the container metadata endpoint.
const METADATA_ENDPOINT: &str = "http://169.254.170.2";

/// Environment variable naming the metadata path for the running container.
pub const CREDENTIALS_URI_ENV: &str = "AWS_CONTAINER_CREDENTIALS_RELATIVE_URI";

const EXPIRATION_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");

/// Credentials used to sign one request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Credentials {
    /// Access key identifier placed in the credential scope.
    pub access_key_id: String,
    /// Secret key seeding the signing-key derivation.
    pub secret_access_key: String,
    /// Extra headers that must be included in the signature, such as a
    /// session token.
    pub pre_auth_headers: BTreeMap<String, String>,
    /// Expiry of temporary credentials; `None` for long-lived keys.
    pub expires_at: Option<OffsetDateTime>,
}

/// Errors raised while obtaining credentials.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum CredentialError {
    /// Raised when the metadata endpoint cannot be reached.
    #[error("credential endpoint request failed: {message}")]
    Transport {
        /// Human-readable transport failure description.
        message: String,
    },
    /// Raised when the metadata endpoint answers with a non-success status.
    #[error("credential endpoint returned status {status}")]
    Status {
        /// HTTP status code of the response.
        status: u16,
    },
    /// Raised when the metadata response cannot be parsed.
    #[error("invalid credential response: {message}")]
    Parse {
        /// Human-readable parse failure description.
        message: String,
    },
    /// Raised when the metadata path environment variable is missing.
    #[error("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI is not set")]
    MissingUri,
}

/// Future returned by credential sources.
pub type CredentialFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Credentials, CredentialError>> + Send + 'a>>;

/// Capability for obtaining the credentials that sign the next request.
pub trait CredentialSource: Send + Sync {
    /// Returns credentials valid for a request issued now.
    fn credentials(&self) -> CredentialFuture<'_>;
}

/// Source returning a fixed set of credentials.
#[derive(Clone, Debug)]
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    /// Wraps a fixed credential value.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    /// Convenience constructor for a plain key pair with no extra headers.
    #[must_use]
    pub fn from_key_pair(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        Self::new(Credentials {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            pre_auth_headers: BTreeMap::new(),
            expires_at: None,
        })
    }
}

impl CredentialSource for StaticCredentials {
    fn credentials(&self) -> CredentialFuture<'_> {
        let credentials = self.credentials.clone();
        Box::pin(async move { Ok(credentials) })
    }
}

/// Shape of the metadata endpoint's JSON body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MetadataResponse {
    access_key_id: String,
    secret_access_key: String,
    token: String,
    expiration: String,
}

/// Auto-refreshing source backed by the container metadata endpoint.
///
/// The cache starts out expired, so the first call always fetches. The
/// check-expiry/fetch/replace sequence holds a mutex: concurrent callers
/// during a refresh wait for the writer and then read the fresh value, so
/// no caller can observe a half-written cache.
#[derive(Debug)]
pub struct ContainerCredentials {
    http: reqwest::Client,
    url: String,
    cache: Mutex<Option<Credentials>>,
}

impl ContainerCredentials {
    /// Creates a source fetching from the standard metadata endpoint with
    /// the given relative URI (leading `/` included).
    #[must_use]
    pub fn new(relative_uri: &str) -> Self {
        Self::with_endpoint(METADATA_ENDPOINT, relative_uri)
    }

    /// Creates a source against an explicit endpoint. Tests use this to
    /// point at a local server.
    #[must_use]
    pub fn with_endpoint(endpoint: &str, relative_uri: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!("{endpoint}{relative_uri}"),
            cache: Mutex::new(None),
        }
    }

    /// Reads the relative URI from `AWS_CONTAINER_CREDENTIALS_RELATIVE_URI`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::MissingUri`] when the variable is unset.
    pub fn from_env() -> Result<Self, CredentialError> {
        env::var(CREDENTIALS_URI_ENV)
            .map(|uri| Self::new(&uri))
            .map_err(|_| CredentialError::MissingUri)
    }

    async fn fetch(&self) -> Result<Credentials, CredentialError> {
        debug!(url = %self.url, "refreshing container credentials");
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|err| CredentialError::Transport {
                message: err.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(CredentialError::Status {
                status: status.as_u16(),
            });
        }
        let body: MetadataResponse =
            response
                .json()
                .await
                .map_err(|err| CredentialError::Parse {
                    message: err.to_string(),
                })?;

        let expires_at = PrimitiveDateTime::parse(&body.expiration, EXPIRATION_FORMAT)
            .map_err(|err| CredentialError::Parse {
                message: format!("bad Expiration {:?}: {err}", body.expiration),
            })?
            .assume_utc();
        let mut pre_auth_headers = BTreeMap::new();
        pre_auth_headers.insert(String::from("x-amz-security-token"), body.token);
        Ok(Credentials {
            access_key_id: body.access_key_id,
            secret_access_key: body.secret_access_key,
            pre_auth_headers,
            expires_at: Some(expires_at),
        })
    }
}

impl CredentialSource for ContainerCredentials {
    fn credentials(&self) -> CredentialFuture<'_> {
        Box::pin(async move {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.as_ref()
                && cached
                    .expires_at
                    .is_none_or(|expiry| OffsetDateTime::now_utc() <= expiry)
            {
                return Ok(cached.clone());
            }
            let fresh = self.fetch().await?;
            *cache = Some(fresh.clone());
            Ok(fresh)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use time::macros::datetime;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Serves the same HTTP response to every connection, counting hits.
    async fn serve(status_line: &'static str, body: String) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("bind listener: {err}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("listener addr: {err}"));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _peer)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut request = Vec::<u8>::new();
                let mut chunk = [0_u8; 1024];
                while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => request.extend(chunk.iter().take(read)),
                    }
                }
                let response = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                if stream.write_all(response.as_bytes()).await.is_ok() {
                    let _shutdown = stream.shutdown().await;
                }
            }
        });

        (addr, hits)
    }

    fn metadata_body(expiration: &str) -> String {
        format!(
            r#"{{"AccessKeyId":"AKIDTEST","SecretAccessKey":"secretkey","Token":"tok123","Expiration":"{expiration}"}}"#
        )
    }

    #[tokio::test]
    async fn first_call_fetches_and_parses_the_metadata_body() {
        let (addr, hits) = serve("200 OK", metadata_body("2099-01-01T00:00:00Z")).await;
        let source = ContainerCredentials::with_endpoint(&format!("http://{addr}"), "/creds");

        let credentials = source
            .credentials()
            .await
            .unwrap_or_else(|err| panic!("credentials: {err}"));

        assert_eq!(credentials.access_key_id, "AKIDTEST");
        assert_eq!(credentials.secret_access_key, "secretkey");
        assert_eq!(
            credentials.pre_auth_headers.get("x-amz-security-token"),
            Some(&String::from("tok123"))
        );
        assert_eq!(
            credentials.expires_at,
            Some(datetime!(2099-01-01 00:00:00 UTC))
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unexpired_cache_is_returned_without_a_fetch() {
        let (addr, hits) = serve("200 OK", metadata_body("2099-01-01T00:00:00Z")).await;
        let source = ContainerCredentials::with_endpoint(&format!("http://{addr}"), "/creds");

        let first = source
            .credentials()
            .await
            .unwrap_or_else(|err| panic!("first call: {err}"));
        let second = source
            .credentials()
            .await
            .unwrap_or_else(|err| panic!("second call: {err}"));

        assert_eq!(first, second);
        assert_eq!(hits.load(Ordering::SeqCst), 1, "second call must hit cache");
    }

    #[tokio::test]
    async fn expired_cache_triggers_a_refresh() {
        let (addr, hits) = serve("200 OK", metadata_body("2000-01-01T00:00:00Z")).await;
        let source = ContainerCredentials::with_endpoint(&format!("http://{addr}"), "/creds");

        let _first = source
            .credentials()
            .await
            .unwrap_or_else(|err| panic!("first call: {err}"));
        let _second = source
            .credentials()
            .await
            .unwrap_or_else(|err| panic!("second call: {err}"));

        assert_eq!(hits.load(Ordering::SeqCst), 2, "stale cache must refetch");
    }

    #[tokio::test]
    async fn non_success_status_is_surfaced() {
        let (addr, _hits) = serve("404 Not Found", String::from("{}")).await;
        let source = ContainerCredentials::with_endpoint(&format!("http://{addr}"), "/creds");

        let err = match source.credentials().await {
            Ok(_) => panic!("expected a status error"),
            Err(err) => err,
        };
        assert_eq!(err, CredentialError::Status { status: 404 });
    }

    #[tokio::test]
    async fn malformed_expiration_is_a_parse_error() {
        let (addr, _hits) = serve("200 OK", metadata_body("yesterday")).await;
        let source = ContainerCredentials::with_endpoint(&format!("http://{addr}"), "/creds");

        let err = match source.credentials().await {
            Ok(_) => panic!("expected a parse error"),
            Err(err) => err,
        };
        assert!(
            matches!(err, CredentialError::Parse { .. }),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn static_source_returns_the_fixed_value() {
        let source = StaticCredentials::from_key_pair("AKIDSTATIC", "secret");
        let credentials = source
            .credentials()
            .await
            .unwrap_or_else(|err| panic!("credentials: {err}"));
        assert_eq!(credentials.access_key_id, "AKIDSTATIC");
        assert_eq!(credentials.expires_at, None);
    }
}
