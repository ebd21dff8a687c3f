//! Client for the `/auth` endpoints of the REST API.
//!
//! [`Authenticator`] is the seam the refresher depends on; [`AuthClient`] is
//! its HTTP implementation. Failures come back as errors here; turning them
//! into "renewal failed" is up to the caller.

use std::{fmt::Debug, future::Future};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    config::Config,
    error::{Error, Result},
    http::Client as HttpClient,
    protocol::{
        self,
        auth::{LoginRequest, RefreshRequest, Response, Tokens},
    },
};

/// Exchanges a refresh token for new tokens.
pub trait Authenticator: Send + Sync + 'static {
    /// # Errors
    ///
    /// Will return `Err` on network failure, a non-2xx status, or a response
    /// body that does not carry an access token.
    fn refresh(&self, refresh_token: &str) -> impl Future<Output = Result<Tokens>> + Send;
}

pub struct AuthClient {
    http_client: HttpClient,
    refresh_url: Url,
    login_url: Url,
}

impl AuthClient {
    const REFRESH_PATH: &'static str = "auth/refresh";
    const LOGIN_PATH: &'static str = "auth/login";

    /// # Errors
    ///
    /// Will return `Err` if the HTTP client cannot be built or the endpoint
    /// URLs cannot be derived from the configured API URL.
    pub fn new(config: &Config) -> Result<Self> {
        let refresh_url = config.api_url.join(Self::REFRESH_PATH)?;
        let login_url = config.api_url.join(Self::LOGIN_PATH)?;
        debug!("refresh endpoint: {refresh_url}");

        Ok(Self {
            http_client: HttpClient::new(config)?,
            refresh_url,
            login_url,
        })
    }

    /// Signs in with email and password.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the credentials are rejected or the request
    /// fails.
    pub async fn login(&self, email: &str, password: &str) -> Result<Tokens> {
        let body = LoginRequest {
            email: email.to_owned(),
            password: password.to_owned(),
        };

        self.call(&self.login_url, &body, Self::LOGIN_PATH).await
    }

    async fn call<B, T>(&self, url: &Url, body: &B, origin: &str) -> Result<T>
    where
        B: Serialize + Debug,
        T: for<'de> Deserialize<'de> + Debug + Validate,
    {
        let body = serde_json::to_string(body)?;
        let request = self.http_client.post(url.clone(), body);

        let response = self.http_client.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::from_status(status, origin));
        }

        let text = response.text().await?;
        let envelope = protocol::json::<Response<T>>(&text, origin)?;
        let message = envelope.message.clone();
        let data = envelope.into_data().ok_or_else(|| {
            Error::unauthenticated(format!(
                "{origin}: {}",
                message.unwrap_or_else(|| "request was not successful".to_owned())
            ))
        })?;

        data.validate(origin)?;
        Ok(data)
    }
}

impl Authenticator for AuthClient {
    async fn refresh(&self, refresh_token: &str) -> Result<Tokens> {
        let body = RefreshRequest {
            refresh_token: refresh_token.to_owned(),
        };

        self.call(&self.refresh_url, &body, Self::REFRESH_PATH)
            .await
    }
}

/// Sanity checks on payloads that deserialized fine.
trait Validate {
    fn validate(&self, origin: &str) -> Result<()>;
}

impl Validate for Tokens {
    fn validate(&self, origin: &str) -> Result<()> {
        if self.access_token.is_empty() {
            return Err(Error::invalid_argument(format!(
                "{origin}: empty access token"
            )));
        }

        if self.refresh_token.as_deref().is_some_and(str::is_empty) {
            return Err(Error::invalid_argument(format!(
                "{origin}: empty refresh token"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> AuthClient {
        let mut config = Config::default();
        config.set_api_url(format!("{}/api", server.uri()).parse().unwrap());
        AuthClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn refresh_posts_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({ "refreshToken": "r1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "accessToken": "a2", "refreshToken": "r2" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = client_for(&server).refresh("r1").await.unwrap();
        assert_eq!(tokens.access_token, "a2");
        assert_eq!(tokens.refresh_token.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client_for(&server).refresh("r1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthenticated);
    }

    #[tokio::test]
    async fn unsuccessful_envelope_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "message": "refresh token revoked"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).refresh("r1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthenticated);
        assert!(err.to_string().contains("refresh token revoked"));
    }

    #[tokio::test]
    async fn empty_access_token_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "accessToken": "" }
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).refresh("r1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn login_returns_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .and(body_json(json!({ "email": "ops@example.com", "password": "hunter2" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "accessToken": "a1", "refreshToken": "r1" }
            })))
            .mount(&server)
            .await;

        let tokens = client_for(&server)
            .login("ops@example.com", "hunter2")
            .await
            .unwrap();
        assert_eq!(tokens.access_token, "a1");
    }
}
