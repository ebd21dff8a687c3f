//! Authorized requests against the REST API.
//!
//! [`AuthorizedClient`] attaches the stored access token as a bearer token.
//! When the API answers 401 the token is renewed through the coordinator's
//! shared refresher and the request is retried once. A renewal that fails
//! ends the session; the coordinator reports it to the logout sink.

use std::fmt::Debug;

use http::{header::AUTHORIZATION, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    config::Config,
    coordinator::Handle,
    credentials::ACCESS_TOKEN,
    error::{Error, Result},
    http::Client as HttpClient,
    protocol,
};

pub struct AuthorizedClient {
    http_client: HttpClient,
    base_url: Url,
    session: Handle,
}

impl AuthorizedClient {
    /// # Errors
    ///
    /// Will return `Err` if the HTTP client cannot be built.
    pub fn new(config: &Config, session: Handle) -> Result<Self> {
        Ok(Self {
            http_client: HttpClient::new(config)?,
            base_url: config.api_url.clone(),
            session,
        })
    }

    /// `GET`s `path`, relative to the API URL.
    ///
    /// # Errors
    ///
    /// Will return `Err` if no access token is stored, the session could not
    /// be renewed after a 401, the API answers with another error status, or
    /// the body does not parse as `T`.
    pub async fn get<T>(&self, path: &str) -> Result<T>
    where
        T: for<'de> Deserialize<'de> + Debug,
    {
        let body = self.send(Method::GET, path, None).await?;
        protocol::json(&body, path)
    }

    /// `POST`s `body` as JSON to `path`, relative to the API URL.
    ///
    /// # Errors
    ///
    /// As for [`get`](Self::get), or if `body` fails to serialize.
    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize,
        T: for<'de> Deserialize<'de> + Debug,
    {
        let body = serde_json::to_string(body)?;
        let body = self.send(Method::POST, path, Some(body)).await?;
        protocol::json(&body, path)
    }

    async fn send(&self, method: Method, path: &str, body: Option<String>) -> Result<String> {
        let url = self.base_url.join(path)?;

        let access_token = self
            .session
            .refresher()
            .store()
            .get(ACCESS_TOKEN)
            .ok_or_else(|| Error::unauthenticated(format!("{path}: not signed in")))?;

        let mut response = self
            .execute(&method, &url, body.clone(), &access_token)
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            debug!("{path}: access token rejected, renewing");
            let Some(renewed) = self.session.refresh().await else {
                return Err(Error::unauthenticated(format!(
                    "{path}: session renewal failed"
                )));
            };

            response = self
                .execute(&method, &url, body, renewed.as_str())
                .await?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(Error::from_status(status, path));
        }

        Ok(response.text().await?)
    }

    async fn execute(
        &self,
        method: &Method,
        url: &Url,
        body: Option<String>,
        access_token: &str,
    ) -> Result<reqwest::Response> {
        let mut request = match body {
            Some(body) => self.http_client.post(url.clone(), body),
            None => self.http_client.get(url.clone()),
        };
        *request.method_mut() = method.clone();

        let mut bearer = HeaderValue::from_str(&format!("Bearer {access_token}"))?;
        bearer.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, bearer);

        self.http_client.execute(request).await
    }
}
