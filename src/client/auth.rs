//! Request authentication.

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use http::HeaderValue;
use http::header::AUTHORIZATION;
use serde::Deserialize;

use super::error::Error;
use super::request::Request;

/// Custom authentication applied to a request before it is sent.
pub trait Authenticate: fmt::Debug + Send + Sync + 'static {
    /// Add credentials to `request`.
    fn apply(&self, request: &mut Request) -> Result<(), Error>;
}

/// Credentials for a request or a session.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Auth {
    /// HTTP basic authentication.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },

    /// A bearer token.
    Bearer(String),

    /// A caller-supplied scheme.
    #[serde(skip)]
    Custom(Arc<dyn Authenticate>),
}

impl Auth {
    /// Basic authentication with `username` and `password`.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Auth::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Bearer authentication with `token`.
    pub fn bearer(token: impl Into<String>) -> Self {
        Auth::Bearer(token.into())
    }

    /// A custom scheme.
    pub fn custom(auth: impl Authenticate) -> Self {
        Auth::Custom(Arc::new(auth))
    }

    pub(crate) fn apply(&self, request: &mut Request) -> Result<(), Error> {
        let value = match self {
            Auth::Basic { username, password } => {
                let encoded = STANDARD.encode(format!("{username}:{password}"));
                format!("Basic {encoded}")
            }
            Auth::Bearer(token) => format!("Bearer {token}"),
            Auth::Custom(auth) => return auth.apply(request),
        };

        let mut value = HeaderValue::try_from(value)
            .map_err(|_| Error::InvalidRequest("credentials are not a valid header".into()))?;
        value.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Auth::Bearer(_) => f.debug_tuple("Bearer").field(&"<redacted>").finish(),
            Auth::Custom(auth) => f.debug_tuple("Custom").field(auth).finish(),
        }
    }
}
