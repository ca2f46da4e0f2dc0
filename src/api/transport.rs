use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::api_types::ApiErrorBody;
use crate::error::{Error, TransportError};

/// Typed HTTP access to the job service.
///
/// Every non-success response becomes a [`TransportError`]. There are no
/// retries at this layer.
#[derive(Clone)]
pub struct Transport {
  client: Client,
  base_url: String,
  token: Option<String>,
}

impl Transport {
  pub fn new(base_url: &str, timeout: Duration, token: Option<String>) -> Result<Self, Error> {
    Url::parse(base_url)
      .map_err(|e| Error::Config(format!("invalid base url {}: {}", base_url, e)))?;

    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url: base_url.trim_end_matches('/').to_string(),
      token,
    })
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  /// Build an absolute URL for `path`, appending the query pairs.
  fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, TransportError> {
    let mut url = Url::parse(&format!("{}{}", self.base_url, path))
      .map_err(|e| TransportError::network(format!("invalid request path {}: {}", path, e)))?;
    if !query.is_empty() {
      url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
  }

  /// Send a request and decode the JSON body. An empty success body decodes as `null`.
  pub async fn send<B>(
    &self,
    method: Method,
    path: &str,
    query: &[(&str, &str)],
    body: Option<&B>,
  ) -> Result<Value, TransportError>
  where
    B: Serialize + ?Sized,
  {
    let response = self.dispatch(method, path, query, body).await?;
    let bytes = response
      .bytes()
      .await
      .map_err(|e| log_failure(path, TransportError::network(e.to_string())))?;

    if bytes.is_empty() {
      return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| {
      log_failure(
        path,
        TransportError::decode(format!("Invalid response body: {}", e)),
      )
    })
  }

  /// Send a request and return the raw body (for file downloads).
  pub async fn send_bytes(&self, method: Method, path: &str) -> Result<Vec<u8>, TransportError> {
    let response = self.dispatch::<()>(method, path, &[], None).await?;
    let bytes = response
      .bytes()
      .await
      .map_err(|e| log_failure(path, TransportError::network(e.to_string())))?;
    Ok(bytes.to_vec())
  }

  pub async fn get<T: DeserializeOwned>(
    &self,
    path: &str,
    query: &[(&str, &str)],
  ) -> Result<T, TransportError> {
    let value = self.send::<()>(Method::GET, path, query, None).await?;
    decode(path, value)
  }

  pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, TransportError>
  where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
  {
    let value = self.send(Method::POST, path, &[], Some(body)).await?;
    decode(path, value)
  }

  pub async fn patch<B, T>(&self, path: &str, body: &B) -> Result<T, TransportError>
  where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
  {
    let value = self.send(Method::PATCH, path, &[], Some(body)).await?;
    decode(path, value)
  }

  /// Send a request whose success body is ignored.
  pub async fn send_empty(&self, method: Method, path: &str) -> Result<(), TransportError> {
    self.send::<()>(method, path, &[], None).await?;
    Ok(())
  }

  async fn dispatch<B>(
    &self,
    method: Method,
    path: &str,
    query: &[(&str, &str)],
    body: Option<&B>,
  ) -> Result<Response, TransportError>
  where
    B: Serialize + ?Sized,
  {
    let url = self.url(path, query)?;
    debug!(%method, %url, "sending request");

    let mut request = self
      .client
      .request(method, url)
      .header(ACCEPT, "application/json");
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    if let Some(body) = body {
      // Sets Content-Type: application/json
      request = request.json(body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| log_failure(path, TransportError::network(e.to_string())))?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.bytes().await.unwrap_or_default();
    Err(log_failure(
      path,
      error_from_body(status.as_u16(), &body),
    ))
  }
}

/// Build the error for a non-success response. A missing or malformed body
/// gets a generic message instead of a parse error.
fn error_from_body(status: u16, body: &[u8]) -> TransportError {
  match serde_json::from_slice::<ApiErrorBody>(body) {
    Ok(parsed) if !parsed.message.trim().is_empty() => {
      TransportError::status(status, parsed.code, parsed.message)
    }
    _ => TransportError::status(status, None, format!("Request failed with status {}", status)),
  }
}

fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<T, TransportError> {
  serde_json::from_value(value).map_err(|e| {
    log_failure(
      path,
      TransportError::decode(format!("Unexpected response shape: {}", e)),
    )
  })
}

fn log_failure(path: &str, error: TransportError) -> TransportError {
  warn!(
    path,
    reason = %error.reason,
    code = ?error.code,
    error = %error.message,
    "request failed"
  );
  error
}
