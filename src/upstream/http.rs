use async_trait::async_trait;
use log::debug;
use reqwest::header::ACCEPT;
use reqwest::Client;

use super::{Transport, TransportError, TransportResponse, UpstreamRequest};
use crate::config::UpstreamConfig;
use crate::error::{ConnectorError, Result};

#[derive(Clone, PartialEq)]
pub enum Auth {
    None,
    Basic { username: String, password: String },
    /// Personal access token.
    Bearer(String),
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Auth::None => write!(f, "None"),
            Auth::Basic { username, .. } => write!(f, "Basic({})", username),
            Auth::Bearer(_) => write!(f, "Bearer(..)"),
        }
    }
}

/// [`Transport`] over HTTPS using `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    auth: Auth,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, auth: Auth) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| ConnectorError::Configuration(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            auth,
        })
    }

    /// A token wins over username and password when both are configured.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let auth = match (&config.token, &config.username, &config.password) {
            (Some(token), _, _) => Auth::Bearer(token.clone()),
            (None, Some(username), Some(password)) => Auth::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            (None, Some(_), None) => {
                return Err(ConnectorError::Configuration(
                    "DHIS2_USERNAME is set but DHIS2_PASSWORD is not".to_string(),
                ))
            }
            _ => Auth::None,
        };
        Self::new(config.base_url.clone(), auth)
    }

    pub fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/api/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &UpstreamRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let url = self.url(&request.endpoint);
        debug!("GET {} with {} params", url, request.params.len());

        let mut builder = self
            .client
            .get(&url)
            .query(&request.params)
            .timeout(request.timeout)
            .header(ACCEPT, "application/json");
        builder = match &self.auth {
            Auth::None => builder,
            Auth::Basic { username, password } => builder.basic_auth(username, Some(password)),
            Auth::Bearer(token) => builder.bearer_auth(token),
        };

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport_error)?;
        Ok(TransportResponse { status, body })
    }
}

fn transport_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connect(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config(token: Option<&str>, username: Option<&str>, password: Option<&str>) -> UpstreamConfig {
        UpstreamConfig {
            base_url: "https://play.dhis2.org/40/".to_string(),
            username: username.map(str::to_string),
            password: password.map(str::to_string),
            token: token.map(str::to_string),
            catalog_path: "virtual_tables.json".to_string(),
        }
    }

    #[test]
    fn test_url_joins_api_path() {
        let transport = HttpTransport::from_config(&config(None, None, None)).unwrap();
        assert_eq!(
            transport.url("/analytics"),
            "https://play.dhis2.org/40/api/analytics"
        );
        assert_eq!(
            transport.url("tracker/events"),
            "https://play.dhis2.org/40/api/tracker/events"
        );
    }

    #[rstest]
    #[case::token_wins(Some("d2pat_x"), Some("admin"), Some("district"), Auth::Bearer("d2pat_x".to_string()))]
    #[case::basic(None, Some("admin"), Some("district"), Auth::Basic { username: "admin".to_string(), password: "district".to_string() })]
    #[case::anonymous(None, None, None, Auth::None)]
    fn test_auth_from_config(
        #[case] token: Option<&str>,
        #[case] username: Option<&str>,
        #[case] password: Option<&str>,
        #[case] expected: Auth,
    ) {
        let transport = HttpTransport::from_config(&config(token, username, password)).unwrap();
        assert_eq!(transport.auth, expected);
    }

    #[test]
    fn test_username_without_password_is_rejected() {
        assert!(matches!(
            HttpTransport::from_config(&config(None, Some("admin"), None)),
            Err(ConnectorError::Configuration(_))
        ));
    }
}
