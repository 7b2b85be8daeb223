use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use thiserror::Error;

use super::types::{Request, Response};

#[derive(Error, Debug)]
pub enum NetworkError {
  /// The origin could not be reached (DNS, connect, timeout, reset).
  #[error("Network unreachable: {0}")]
  Unreachable(String),

  #[error("Invalid request: {0}")]
  InvalidRequest(String),
}

/// The HTTP origin behind the engine.
///
/// A non-success status is still `Ok`; only transport failures are errors.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// reqwest-backed origin client
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_builder() {
        NetworkError::InvalidRequest(e.to_string())
      } else {
        NetworkError::Unreachable(e.to_string())
      }
    })?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| NetworkError::Unreachable(e.to_string()))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}
