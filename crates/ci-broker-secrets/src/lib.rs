//! Loading of sensitive values (the webhook HMAC secret, messaging
//! credentials) from one of a few sources, without hardcoding them into
//! CLI flags or config files.
//!
//! Modelled on `data-loader::KeySource`, trimmed of its Vault backend:
//! this system has no deployment that needs HashiCorp Vault-backed
//! secrets.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Hash, PartialEq, Eq)]
#[serde(untagged)]
pub enum KeySource {
    /// Read the secret from the contents of a file.
    File(String),
    /// The secret is given verbatim.
    Data { key_data: String },
    /// Read the secret from an environment variable.
    Env { env_var: String },
}

impl KeySource {
    pub async fn get(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            Self::File(path) => tokio::fs::read(path)
                .await
                .with_context(|| format!("reading secret from file {path}")),
            Self::Data { key_data } => Ok(key_data.as_bytes().to_vec()),
            Self::Env { env_var } => std::env::var(env_var)
                .map(|v| v.into_bytes())
                .map_err(|_| anyhow!("environment variable {env_var} is not set/usable")),
        }
    }

    pub async fn get_string(&self) -> anyhow::Result<String> {
        let bytes = self.get().await?;
        String::from_utf8(bytes).context("secret is not valid utf-8")
    }
}

impl std::str::FromStr for KeySource {
    type Err = std::convert::Infallible;

    /// CLI-flag friendly parsing: a bare value is taken as inline data
    /// unless it starts with `file:` or `env:`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("file:") {
            Ok(Self::File(path.to_string()))
        } else if let Some(var) = s.strip_prefix("env:") {
            Ok(Self::Env {
                env_var: var.to_string(),
            })
        } else {
            Ok(Self::Data {
                key_data: s.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn inline_data() {
        let source = KeySource::from_str("super-secret").unwrap();
        assert_eq!(source.get_string().await.unwrap(), "super-secret");
    }

    #[tokio::test]
    async fn from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.txt");
        tokio::fs::write(&path, b"file-secret").await.unwrap();
        let source = KeySource::from_str(&format!("file:{}", path.display())).unwrap();
        assert_eq!(source.get_string().await.unwrap(), "file-secret");
    }

    #[tokio::test]
    async fn from_env() {
        std::env::set_var("CI_BROKER_TEST_SECRET", "env-secret");
        let source = KeySource::from_str("env:CI_BROKER_TEST_SECRET").unwrap();
        assert_eq!(source.get_string().await.unwrap(), "env-secret");
        std::env::remove_var("CI_BROKER_TEST_SECRET");
    }
}
