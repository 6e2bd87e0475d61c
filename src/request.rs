//! Buffered view of an inbound request
//!
//! Dynamic routes need the request body twice (once for the access log and once
//! for the sandbox), so the body is collected up front with a size limit.

use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::{HeaderMap, Method, Request, Uri, Version};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("failed to read request body: {0}")]
    Read(String),
}

#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_addr: SocketAddr,
}

impl InboundRequest {
    /// Collect the request body, failing once it grows past `max_body_bytes`
    pub async fn read<B>(
        req: Request<B>,
        client_addr: SocketAddr,
        max_body_bytes: usize,
    ) -> Result<Self, BodyError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return Err(BodyError::TooLarge { limit: max_body_bytes });
            }
            Err(e) => return Err(BodyError::Read(e.to_string())),
        };

        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
            client_addr,
        })
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Raw query string, `None` when absent or empty
    pub fn query(&self) -> Option<&str> {
        self.uri.query().filter(|q| !q.is_empty())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn client_ip(&self) -> String {
        self.client_addr.ip().to_string()
    }

    pub fn http_version(&self) -> &'static str {
        match self.version {
            Version::HTTP_09 => "0.9",
            Version::HTTP_10 => "1.0",
            Version::HTTP_2 => "2.0",
            Version::HTTP_3 => "3.0",
            _ => "1.1",
        }
    }
}

/// Decode an `application/x-www-form-urlencoded` query string into pairs
pub fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

/// Query parameters as a JSON object; repeated keys collect into an array
pub fn query_to_json(raw: Option<&str>) -> Value {
    let mut map = Map::new();
    for (key, value) in raw.map(parse_query).unwrap_or_default() {
        match map.get_mut(&key) {
            Some(Value::Array(values)) => values.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => {
                map.insert(key, Value::String(value));
            }
        }
    }
    Value::Object(map)
}

/// Headers as a JSON object keyed by lowercase name; repeats are joined with ", "
pub fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        map.insert(name.as_str().to_string(), Value::String(joined));
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;

    fn addr() -> SocketAddr {
        "10.1.2.3:55000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_read_buffers_body() {
        let req = Request::builder()
            .method("POST")
            .uri("/hook?a=1")
            .header("User-Agent", "curl/8.0")
            .body(Full::new(Bytes::from("payload")))
            .unwrap();

        let inbound = InboundRequest::read(req, addr(), 1024).await.unwrap();
        assert_eq!(inbound.method, Method::POST);
        assert_eq!(inbound.path(), "/hook");
        assert_eq!(inbound.query(), Some("a=1"));
        assert_eq!(inbound.header("user-agent"), Some("curl/8.0"));
        assert_eq!(&inbound.body[..], b"payload");
        assert_eq!(inbound.client_ip(), "10.1.2.3");
        assert_eq!(inbound.http_version(), "1.1");
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_body() {
        let req = Request::builder()
            .method("POST")
            .uri("/")
            .body(Full::new(Bytes::from(vec![b'x'; 64])))
            .unwrap();

        let err = InboundRequest::read(req, addr(), 16).await.unwrap_err();
        assert!(matches!(err, BodyError::TooLarge { limit: 16 }));
    }

    #[tokio::test]
    async fn test_empty_query_is_none() {
        let req = Request::builder()
            .uri("/page?")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let inbound = InboundRequest::read(req, addr(), 16).await.unwrap();
        assert_eq!(inbound.query(), None);
    }

    #[test]
    fn test_parse_query_decodes() {
        let pairs = parse_query("name=J%C3%BCrgen&msg=hello+world&flag");
        assert_eq!(
            pairs,
            vec![
                ("name".to_string(), "Jürgen".to_string()),
                ("msg".to_string(), "hello world".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_query_to_json_collects_repeats() {
        let value = query_to_json(Some("tag=a&tag=b&tag=c&x=1"));
        assert_eq!(value["tag"], serde_json::json!(["a", "b", "c"]));
        assert_eq!(value["x"], "1");
        assert_eq!(query_to_json(None), serde_json::json!({}));
    }

    #[test]
    fn test_headers_to_json() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Token", "abc".parse().unwrap());
        headers.append("accept", "text/html".parse().unwrap());
        headers.append("accept", "application/json".parse().unwrap());

        let value = headers_to_json(&headers);
        assert_eq!(value["x-token"], "abc");
        assert_eq!(value["accept"], "text/html, application/json");
    }
}
