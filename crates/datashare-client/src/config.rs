//! Client configuration.

use datashare_proto::{URI_MAX_COUNT, URI_MAX_SIZE};

use crate::error::Error;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bundle name of the calling application.
    pub bundle_name: String,

    /// Client identifier for provider-side tracking.
    pub client_id: String,

    /// Maximum number of URIs accepted in one subscribe/unsubscribe call.
    pub max_uris_per_call: usize,

    /// Maximum length of a single URI.
    pub max_uri_len: usize,
}

impl ClientConfig {
    /// Create a configuration for the given calling bundle.
    pub fn new(bundle_name: impl Into<String>) -> Self {
        Self {
            bundle_name: bundle_name.into(),
            client_id: generate_client_id(),
            max_uris_per_call: URI_MAX_COUNT,
            max_uri_len: URI_MAX_SIZE,
        }
    }

    /// Set the client identifier.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Set the maximum number of URIs per call.
    pub fn with_max_uris_per_call(mut self, max: usize) -> Self {
        self.max_uris_per_call = max;
        self
    }

    /// Set the maximum URI length.
    pub fn with_max_uri_len(mut self, max: usize) -> Self {
        self.max_uri_len = max;
        self
    }

    /// Check a URI batch against the configured limits.
    pub fn validate_uris(&self, uris: &[String]) -> Result<(), Error> {
        if uris.len() > self.max_uris_per_call {
            return Err(Error::InvalidArgument(format!(
                "{} uris exceed the limit of {} per call",
                uris.len(),
                self.max_uris_per_call
            )));
        }
        for uri in uris {
            if uri.is_empty() {
                return Err(Error::InvalidArgument("uri is empty".to_string()));
            }
            if uri.len() > self.max_uri_len {
                return Err(Error::InvalidArgument(format!(
                    "uri length {} exceeds maximum {}",
                    uri.len(),
                    self.max_uri_len
                )));
            }
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(String::new())
    }
}

/// Generate a unique client identifier.
fn generate_client_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    format!("client-{:x}", timestamp)
}
