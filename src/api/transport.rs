//! Reusable HTTP executor for prepared provider calls.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::{ApiError, ErrorKind};

const USER_AGENT: &str = concat!("anisync/", env!("CARGO_PKG_VERSION"));

/// A fully prepared request: the backend builds it, the transport runs it.
#[derive(Debug, Clone)]
pub struct HttpCall {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpCall {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: Url, body: Value) -> Self {
        Self {
            method: Method::POST,
            url,
            headers: Vec::new(),
            body: Some(body),
        }
    }

    /// GraphQL POST with `{query, variables}`.
    pub fn graphql(url: Url, query: &str, variables: Value) -> Self {
        Self::post(url, serde_json::json!({ "query": query, "variables": variables }))
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    pub fn query(mut self, name: &str, value: &str) -> Self {
        self.url.query_pairs_mut().append_pair(name, value);
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ApiError::invalid_config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Runs `call` and returns the JSON body, mapping every failure into the
    /// error taxonomy.
    pub async fn execute(&self, call: HttpCall) -> Result<Value, ApiError> {
        let host = call.url.host_str().unwrap_or_default().to_string();
        let mut request = self
            .client
            .request(call.method.clone(), call.url.clone())
            .headers(build_headers(&call.headers)?);
        if let Some(body) = &call.body {
            request = request.json(body);
        }

        debug!(method = %call.method, host = %host, "🌐 HTTP request");
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.map_err(map_transport_error)?;

        if let Some(mut err) = ApiError::from_status(status.as_u16(), &body) {
            if let Some(after) = retry_after {
                err = err.with_retry_after(after);
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!(host = %host, ?retry_after, "🚦 Provider rate limit hit");
            }
            return Err(err);
        }

        let value: Value = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body)?
        };
        check_graphql_errors(&value)?;
        Ok(value)
    }
}

fn build_headers(pairs: &[(String, String)]) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ApiError::invalid_config(format!("invalid header name '{name}'")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ApiError::invalid_config(format!("invalid value for header '{name}'")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn map_transport_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::new(ErrorKind::Timeout, format!("request timed out: {err}"))
    } else if err.is_connect() || err.is_request() {
        ApiError::network(format!("connection failed: {err}"))
    } else if let Some(status) = err.status() {
        ApiError::from_status(status.as_u16(), "").unwrap_or_else(|| ApiError::unknown(err.to_string()))
    } else {
        ApiError::network(err.to_string())
    }
}

/// `Retry-After` in seconds; HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// GraphQL reports failures in-band with a 200; the first message decides.
fn check_graphql_errors(value: &Value) -> Result<(), ApiError> {
    let Some(errors) = value.get("errors").and_then(Value::as_array) else {
        return Ok(());
    };
    let Some(first) = errors.first() else {
        return Ok(());
    };
    let message = first
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("GraphQL error")
        .to_string();
    let status = first
        .get("status")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok());

    let err = match status.and_then(|s| ApiError::from_status(s, &message)) {
        Some(err) => err,
        None => ApiError::from_message(message),
    };
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn graphql_errors_are_classified() {
        let private = json!({"errors": [{"message": "Private User", "status": 404}], "data": null});
        assert_eq!(check_graphql_errors(&private).unwrap_err().kind, ErrorKind::PrivateList);

        let limited = json!({"errors": [{"message": "Too Many Requests.", "status": 429}]});
        assert_eq!(check_graphql_errors(&limited).unwrap_err().kind, ErrorKind::RateLimited);

        let vague = json!({"errors": [{"message": "Invalid token"}]});
        assert_eq!(check_graphql_errors(&vague).unwrap_err().kind, ErrorKind::AuthError);

        assert!(check_graphql_errors(&json!({"data": {"Media": {}}})).is_ok());
    }

    #[test]
    fn retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("30"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(30)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn call_builder() {
        let url = Url::parse("https://api.myanimelist.net/v2/anime/1").unwrap();
        let call = HttpCall::get(url).query("fields", "title").bearer("t");
        assert_eq!(call.url.as_str(), "https://api.myanimelist.net/v2/anime/1?fields=title");
        assert_eq!(call.headers[0], ("Authorization".to_string(), "Bearer t".to_string()));
        assert!(build_headers(&call.headers).is_ok());
        assert!(build_headers(&[("bad header".into(), "x".into())]).is_err());
    }

    #[tokio::test]
    async fn unreachable_host_is_network_error() {
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
        let url = Url::parse("http://127.0.0.1:9/graphql").unwrap();
        let err = transport.execute(HttpCall::get(url)).await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::NetworkError | ErrorKind::Timeout));
    }
}
