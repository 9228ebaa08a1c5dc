use crate::{env_optional, ConfigError, FromEnv};

/// Shared Redis store backing message deduplication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DedupStoreConfig {
    /// `host:port` or a full `redis://` URL
    pub url: String,
    pub password: Option<String>,
}

impl DedupStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// URL accepted by `redis::Client::open`, with the password folded in.
    pub fn connection_url(&self) -> String {
        let (scheme, rest) = match self.url.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("redis", self.url.as_str()),
        };
        match &self.password {
            Some(password) if !rest.contains('@') => format!(
                "{}://:{}@{}",
                scheme,
                urlencoding::encode(password),
                rest
            ),
            _ => format!("{}://{}", scheme, rest),
        }
    }
}

impl FromEnv for DedupStoreConfig {
    /// REDIS_URL (required) and REDIS_PASSWORD (optional).
    /// CPLIVE_REDIS_URL / CPLIVE_REDIS_PASSWORD are read when the former are unset.
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_optional("REDIS_URL")
            .or_else(|| env_optional("CPLIVE_REDIS_URL"))
            .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?;
        let password =
            env_optional("REDIS_PASSWORD").or_else(|| env_optional("CPLIVE_REDIS_PASSWORD"));
        Ok(Self { url, password })
    }
}
