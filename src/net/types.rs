use reqwest::Method;
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use url::Url;

/// What the page intends to do with a response (mirrors `Request.destination`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Document,
  Image,
  Font,
  Script,
  Style,
  Manifest,
  #[default]
  #[serde(other)]
  Empty,
}

/// An intercepted page request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url, destination: Destination) -> Self {
    Self {
      method,
      url,
      destination,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url, destination: Destination) -> Self {
    Self::new(Method::GET, url, destination)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  /// Stable cache identity for this request.
  pub fn cache_key(&self) -> String {
    cache_key(&self.method, &self.url)
  }
}

/// SHA-256 over `METHOD url` (fragment stripped) for fixed-length keys.
pub fn cache_key(method: &Method, url: &Url) -> String {
  let mut canonical = url.clone();
  canonical.set_fragment(None);

  let mut hasher = Sha256::new();
  hasher.update(method.as_str().as_bytes());
  hasher.update(b" ");
  hasher.update(canonical.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

/// A response from the origin, the cache, or an offline fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  #[serde(serialize_with = "serialize_body")]
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// Plain-text response.
  pub fn text(status: u16, body: &str) -> Self {
    Self::new(status, body).with_header("Content-Type", "text/plain; charset=utf-8")
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn body_text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }
}

fn serialize_body<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_str(&String::from_utf8_lossy(body))
}
