use anyhow::{bail, Context, Result};

/// Supplies the bearer credential that authorizes opening a transport.
///
/// A fetch failure is reported to the user as a permission problem, not as a
/// transport failure.
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String>;
}

/// A fixed token
#[derive(Debug, Clone)]
pub struct StaticCredential {
    token: String,
}

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait::async_trait]
impl CredentialProvider for StaticCredential {
    async fn bearer_token(&self) -> Result<String> {
        if self.token.is_empty() {
            bail!("No session token configured");
        }
        Ok(self.token.clone())
    }
}

/// Reads the token from an environment variable on every fetch
#[derive(Debug, Clone)]
pub struct EnvCredential {
    var: String,
}

impl EnvCredential {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait::async_trait]
impl CredentialProvider for EnvCredential {
    async fn bearer_token(&self) -> Result<String> {
        let token = std::env::var(&self.var)
            .with_context(|| format!("Environment variable {} is not set", self.var))?;
        if token.trim().is_empty() {
            bail!("Environment variable {} is empty", self.var);
        }
        Ok(token.trim().to_string())
    }
}
