use crate::error::{json_error_response, ErrorCode};
use crate::response::HttpResponse;
use hyper::HeaderMap;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No X-API-Key header
    Missing,
    /// Header present but not one of the configured keys
    Invalid,
}

impl AuthFailure {
    pub fn into_response(self) -> HttpResponse {
        match self {
            AuthFailure::Missing => json_error_response(ErrorCode::MissingApiKey, "API key is missing"),
            AuthFailure::Invalid => json_error_response(ErrorCode::InvalidApiKey, "Invalid API key"),
        }
    }
}

/// The set of keys accepted by the management API
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    keys: Vec<String>,
}

impl ApiKeys {
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            keys: keys
                .into_iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Parse a comma-separated key list
    pub fn parse_list(list: &str) -> Self {
        Self::new(list.split(',').map(str::to_string))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn contains(&self, candidate: &str) -> bool {
        // Every key is compared, matched or not
        self.keys
            .iter()
            .fold(false, |found, key| constant_time_compare(key, candidate) | found)
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<(), AuthFailure> {
        let provided = match headers.get(API_KEY_HEADER) {
            Some(value) => value.to_str().map_err(|_| AuthFailure::Invalid)?,
            None => return Err(AuthFailure::Missing),
        };

        if provided.is_empty() {
            return Err(AuthFailure::Missing);
        }

        if self.contains(provided) {
            Ok(())
        } else {
            Err(AuthFailure::Invalid)
        }
    }
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;

    fn headers_with_key(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, key.parse().unwrap());
        headers
    }

    #[test]
    fn test_parse_list() {
        let keys = ApiKeys::parse_list(" first ,second,, ");
        assert_eq!(keys.len(), 2);
        assert!(keys.contains("first"));
        assert!(keys.contains("second"));
        assert!(!keys.contains(""));
    }

    #[test]
    fn test_check_accepts_any_configured_key() {
        let keys = ApiKeys::parse_list("alpha,beta");
        assert_eq!(keys.check(&headers_with_key("alpha")), Ok(()));
        assert_eq!(keys.check(&headers_with_key("beta")), Ok(()));
    }

    #[test]
    fn test_check_missing_and_invalid() {
        let keys = ApiKeys::parse_list("alpha");
        assert_eq!(keys.check(&HeaderMap::new()), Err(AuthFailure::Missing));
        assert_eq!(keys.check(&headers_with_key("alph")), Err(AuthFailure::Invalid));
        assert_eq!(keys.check(&headers_with_key("alphax")), Err(AuthFailure::Invalid));
    }

    #[test]
    fn test_no_keys_rejects_everything() {
        let keys = ApiKeys::default();
        assert!(keys.is_empty());
        assert_eq!(keys.check(&headers_with_key("anything")), Err(AuthFailure::Invalid));
    }

    #[test]
    fn test_failure_responses() {
        assert_eq!(
            AuthFailure::Missing.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthFailure::Invalid.into_response().status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "ab"));
    }
}
