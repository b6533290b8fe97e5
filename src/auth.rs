use crate::retry::{classify_response, with_retry, BackoffPolicy, CallError, ExponentialBackoff};
use log::{info, warn};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

pub const YAHOO_TOKEN_URL: &str = "https://biz-oauth.yahoo.co.jp/oauth/v1/token";
pub const MICROSOFT_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
pub const MICROSOFT_SCOPE: &str = "https://ads.microsoft.com/msads.manage offline_access";

/// Extra attempts after the first, three token requests in total.
const TOKEN_RETRIES: u32 = 2;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token endpoint {url} refused the refresh token: {source}")]
    Exchange {
        url: String,
        #[source]
        source: CallError,
    },
}

/// OAuth client credentials plus the long-lived refresh token.
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// Exchanges a refresh token for a bearer token, once per run.
pub struct TokenProvider {
    client: Client,
    token_url: String,
    scope: Option<String>,
    user_agent: String,
    backoff: Box<dyn BackoffPolicy>,
}

impl TokenProvider {
    pub fn new(client: Client, token_url: &str, scope: Option<&str>, user_agent: &str) -> Self {
        TokenProvider {
            client,
            token_url: token_url.to_string(),
            scope: scope.map(str::to_string),
            user_agent: user_agent.to_string(),
            backoff: Box::new(ExponentialBackoff::default()),
        }
    }

    pub fn yahoo(client: Client, user_agent: &str) -> Self {
        Self::new(client, YAHOO_TOKEN_URL, None, user_agent)
    }

    pub fn microsoft(client: Client, user_agent: &str) -> Self {
        Self::new(client, MICROSOFT_TOKEN_URL, Some(MICROSOFT_SCOPE), user_agent)
    }

    pub fn with_backoff(mut self, backoff: Box<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Tries a form-encoded exchange first and falls back to HTTP basic auth.
    pub async fn get_access_token(&self, credentials: &Credentials) -> Result<String, AuthError> {
        info!("Requesting access token from {}", self.token_url);
        let outcome = with_retry(self.backoff.as_ref(), TOKEN_RETRIES, "token exchange", || {
            self.exchange(credentials)
        })
        .await;

        match outcome.result {
            Ok(token) => {
                info!("Obtained access token after {} attempt(s)", outcome.attempts);
                Ok(token)
            }
            Err(source) => Err(AuthError::Exchange {
                url: self.token_url.clone(),
                source,
            }),
        }
    }

    async fn exchange(&self, credentials: &Credentials) -> Result<String, CallError> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("refresh_token", credentials.refresh_token.as_str()),
        ];
        if let Some(scope) = &self.scope {
            form.push(("scope", scope.as_str()));
        }

        let resp = self
            .client
            .post(&self.token_url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(USER_AGENT, &self.user_agent)
            .form(&form)
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::OK {
            return extract_token(&resp.text().await?);
        }
        warn!("Token request (form) failed with {}; trying basic auth", status);

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", credentials.refresh_token.as_str()),
        ];
        if let Some(scope) = &self.scope {
            form.push(("scope", scope.as_str()));
        }

        let resp = self
            .client
            .post(&self.token_url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(USER_AGENT, &self.user_agent)
            .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
            .form(&form)
            .send()
            .await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.text().await?;
        if status == StatusCode::OK {
            return extract_token(&body);
        }

        warn!("Token request (basic) failed with {}", status);
        Err(classify_response(status, &headers, &body, &[])
            .unwrap_or_else(|| CallError::fatal(format!("unexpected status {}", status))))
    }
}

/// A 200 without a usable `access_token` is a hard failure.
fn extract_token(body: &str) -> Result<String, CallError> {
    let parsed: TokenResponse = serde_json::from_str(body)
        .map_err(|e| CallError::fatal(format!("invalid token response: {}", e)))?;
    match parsed.access_token {
        Some(token) if !token.trim().is_empty() => Ok(token),
        _ => Err(CallError::fatal("response does not contain 'access_token'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Answers every request with 503 and counts them.
    fn serve_unavailable() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/token", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                read_request(&mut stream);
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = stream.write_all(
                    b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                );
            }
        });
        (url, hits)
    }

    fn read_request(stream: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(
            extract_token(r#"{"access_token":"abc","expires_in":3600}"#).unwrap(),
            "abc"
        );
    }

    #[test]
    fn test_missing_or_empty_token_is_fatal() {
        for body in [r#"{"expires_in":3600}"#, r#"{"access_token":""}"#, "not json"] {
            let err = extract_token(body).unwrap_err();
            assert!(!err.is_retryable(), "{}", body);
        }
    }

    #[test]
    fn test_constructors_pick_endpoints() {
        let yahoo = TokenProvider::yahoo(Client::new(), "ua");
        assert_eq!(yahoo.token_url, YAHOO_TOKEN_URL);
        assert!(yahoo.scope.is_none());

        let microsoft = TokenProvider::microsoft(Client::new(), "ua");
        assert_eq!(microsoft.scope.as_deref(), Some(MICROSOFT_SCOPE));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let creds = Credentials {
            client_id: "id".to_string(),
            client_secret: "s3cret".to_string(),
            refresh_token: "r3fresh".to_string(),
        };
        let shown = format!("{:?}", creds);
        assert!(!shown.contains("s3cret"));
        assert!(!shown.contains("r3fresh"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_auth_error() {
        let provider = TokenProvider::new(Client::new(), "http://127.0.0.1:9/token", None, "ua")
            .with_backoff(Box::new(ExponentialBackoff::immediate()));
        let creds = Credentials {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            refresh_token: "refresh".to_string(),
        };
        let err = provider.get_access_token(&creds).await.unwrap_err();
        assert!(matches!(err, AuthError::Exchange { .. }));
    }

    #[tokio::test]
    async fn test_token_exchange_makes_three_attempts() {
        let (url, hits) = serve_unavailable();
        let provider = TokenProvider::new(Client::new(), &url, None, "ua")
            .with_backoff(Box::new(ExponentialBackoff::immediate()));
        let creds = Credentials {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            refresh_token: "refresh".to_string(),
        };

        match provider.get_access_token(&creds).await {
            Err(AuthError::Exchange { source, .. }) => assert_eq!(source.status(), Some(503)),
            other => panic!("unexpected result: {:?}", other),
        }
        // Each attempt tries the form body and then basic auth.
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }
}
