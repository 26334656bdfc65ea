//! Registry authentication.
//!
//! Requests go out with whatever authorization is cached for their host and
//! scope. A `401` answer is parsed for its `WWW-Authenticate` challenge, a
//! fresh authorization is negotiated, and the request is retried once.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http_auth::{ChallengeRef, parser::ChallengeParser};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderValue, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, trace};
use url::Url;

use crate::credentials::{CacheKey, Credential, CredentialResolver, TokenCache};
use crate::transport::Transport;
use crate::{Error, Result};

/// OAuth2 client id sent with refresh token grants.
const CLIENT_ID: &str = "seeder-oras";

/// A registry response together with its connection slot.
///
/// The slot is held until the body has been consumed and the response is
/// dropped.
#[derive(Debug)]
pub(crate) struct RegistryResponse {
    response: Response,
    _permit: OwnedSemaphorePermit,
}

impl RegistryResponse {
    pub(crate) fn status(&self) -> StatusCode {
        self.response.status()
    }

    pub(crate) fn headers(&self) -> &reqwest::header::HeaderMap {
        self.response.headers()
    }

    /// Body length announced by the registry, if any.
    pub(crate) fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    /// Read the next chunk of the body, `None` at the end.
    pub(crate) async fn chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.response.chunk().await?)
    }
}

/// An authentication challenge from `WWW-Authenticate`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    /// The first supported challenge in the header.
    fn parse(value: &HeaderValue) -> Option<Self> {
        let value = value.to_str().ok()?;
        ChallengeParser::new(value)
            .filter_map(std::result::Result::ok)
            .find_map(|challenge| Self::from_ref(&challenge))
    }

    fn from_ref(challenge: &ChallengeRef<'_>) -> Option<Self> {
        if challenge.scheme.eq_ignore_ascii_case("basic") {
            return Some(Self::Basic);
        }
        if !challenge.scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (key, value) in &challenge.params {
            if key.eq_ignore_ascii_case("realm") {
                realm = Some(value.to_unescaped());
            } else if key.eq_ignore_ascii_case("service") {
                service = Some(value.to_unescaped());
            } else if key.eq_ignore_ascii_case("scope") {
                scope = Some(value.to_unescaped());
            }
        }

        Some(Self::Bearer {
            realm: realm?,
            service,
            scope,
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Sends registry requests and negotiates authorization on demand.
#[derive(Debug)]
pub(crate) struct AuthClient {
    transport: Arc<Transport>,
    credentials: Arc<CredentialResolver>,
    tokens: Arc<TokenCache>,
}

impl AuthClient {
    pub(crate) fn new(
        transport: Arc<Transport>,
        credentials: Arc<CredentialResolver>,
        tokens: Arc<TokenCache>,
    ) -> Self {
        Self {
            transport,
            credentials,
            tokens,
        }
    }

    /// `GET url` on `host`, authorized for `scope`.
    pub(crate) async fn get(
        &self,
        host: &str,
        url: &Url,
        accept: Option<&str>,
        scope: &str,
    ) -> Result<RegistryResponse> {
        let key = CacheKey::new(host, scope);
        let cached = self.tokens.get(&key).await;

        let permit = self.transport.acquire(host).await?;
        let response = self.request(url, accept, cached.as_ref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(RegistryResponse {
                response,
                _permit: permit,
            });
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(Challenge::parse);
        drop(response);
        // The token realm may live on the same host.
        drop(permit);

        if cached.is_some() {
            debug!(host, scope, "Cached registry authorization rejected");
            self.tokens.remove(&key).await;
        }
        let Some(challenge) = challenge else {
            return Err(Error::authentication_failed(
                host,
                "registry answered 401 without a supported challenge",
            ));
        };

        let authorization = self.negotiate(host, &challenge, scope).await?;
        self.tokens.insert(key, authorization.clone()).await;

        let permit = self.transport.acquire(host).await?;
        let response = self.request(url, accept, Some(&authorization)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::authentication_failed(
                host,
                "registry rejected the negotiated authorization",
            ));
        }
        Ok(RegistryResponse {
            response,
            _permit: permit,
        })
    }

    async fn request(
        &self,
        url: &Url,
        accept: Option<&str>,
        authorization: Option<&HeaderValue>,
    ) -> Result<Response> {
        let mut request = self.transport.client().get(url.clone());
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        if let Some(authorization) = authorization {
            request = request.header(AUTHORIZATION, authorization.clone());
        }
        trace!(%url, authorized = authorization.is_some(), "Sending registry request");
        Ok(request.send().await?)
    }

    /// Produce an `Authorization` value answering `challenge`.
    async fn negotiate(&self, host: &str, challenge: &Challenge, scope: &str) -> Result<HeaderValue> {
        let credential = self.credentials.resolve(host);
        match challenge {
            Challenge::Basic => {
                let (username, password) = credential.basic().ok_or_else(|| {
                    Error::authentication_failed(
                        host,
                        "registry requires basic auth but no username and password are configured",
                    )
                })?;
                debug!(host, "Using basic auth for registry");
                basic_authorization(host, username, password)
            }
            Challenge::Bearer {
                realm,
                service,
                scope: challenged,
            } => {
                if let Some(token) = &credential.access_token {
                    debug!(host, "Using configured access token for registry");
                    return bearer_authorization(host, token.expose_secret());
                }
                let scope = challenged.as_deref().unwrap_or(scope);
                let token = self
                    .fetch_token(host, credential, realm, service.as_deref(), scope)
                    .await?;
                bearer_authorization(host, &token)
            }
        }
    }

    /// Obtain a bearer token from the challenge realm.
    async fn fetch_token(
        &self,
        host: &str,
        credential: &Credential,
        realm: &str,
        service: Option<&str>,
        scope: &str,
    ) -> Result<String> {
        let realm_url = Url::parse(realm).map_err(|e| {
            Error::authentication_failed(host, format!("invalid token realm '{realm}': {e}"))
        })?;
        let realm_host = authority(&realm_url)?;
        let _permit = self.transport.acquire(&realm_host).await?;
        let client = self.transport.client();

        let request = if let Some(refresh_token) = &credential.refresh_token {
            debug!(host, %realm_url, scope, "Exchanging refresh token");
            let mut form = vec![
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.expose_secret()),
                ("client_id", CLIENT_ID),
                ("scope", scope),
            ];
            if let Some(service) = service {
                form.push(("service", service));
            }
            client.post(realm_url).form(&form)
        } else {
            debug!(host, %realm_url, scope, "Requesting registry token");
            let mut query = vec![("scope", scope)];
            if let Some(service) = service {
                query.push(("service", service));
            }
            let request = client.get(realm_url).query(&query);
            match credential.basic() {
                Some((username, password)) => {
                    request.basic_auth(username, Some(password.expose_secret()))
                }
                None => request,
            }
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::authentication_failed(
                host,
                format!("token request returned HTTP {}", status.as_u16()),
            ));
        }

        let body: TokenResponse = serde_json::from_slice(&response.bytes().await?)?;
        body.token
            .or(body.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Error::authentication_failed(host, "token response carries no token"))
    }
}

/// `host[:port]` of a URL, the identity credentials are bound to.
pub(crate) fn authority(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::invalid_registry_url(url.as_str(), "missing host"))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn basic_authorization(host: &str, username: &str, password: &SecretString) -> Result<HeaderValue> {
    let encoded = STANDARD.encode(format!("{username}:{}", password.expose_secret()));
    sensitive_header(host, &format!("Basic {encoded}"))
}

fn bearer_authorization(host: &str, token: &str) -> Result<HeaderValue> {
    sensitive_header(host, &format!("Bearer {token}"))
}

fn sensitive_header(host: &str, value: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(value)
        .map_err(|_| Error::authentication_failed(host, "credential is not a valid header value"))?;
    value.set_sensitive(true);
    Ok(value)
}
