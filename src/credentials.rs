//! API token discovery.
//!
//! A protocol child process cannot prompt (stdin belongs to the host), so
//! the token must arrive through one of three channels, tried in order:
//! a `.env` file at the repository root (located via GETGITDIR), the
//! `DATAVERSE_API_TOKEN` environment variable, or the annex credential
//! store under the setting named by the `credential` remote config.
//! Tokens from the first two channels are written back to the store after
//! they survive the liveness check, so the next process start finds them
//! without the environment.

use std::path::Path;

use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::protocol::AnnexIo;

pub const TOKEN_ENV_VAR: &str = "DATAVERSE_API_TOKEN";
const DEFAULT_CREDS_SETTING: &str = "dataverse";

#[derive(Debug)]
pub struct Credential {
    pub token: String,
    /// Credential-store setting this token lives under (or should).
    pub setting: String,
    /// Already in the store; no write-back needed.
    pub from_store: bool,
}

/// Locate a token. Does not validate it; the caller runs the cheap
/// `info_version` probe and then persists via [`persist`].
pub async fn obtain<R, W>(
    annex: &mut AnnexIo<R, W>,
    config: &RemoteConfig,
) -> Result<Credential, RemoteError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // A repo-local .env can carry the token for this remote alone.
    if let Ok(git_dir) = annex.get_git_dir().await
        && let Some(worktree) = Path::new(&git_dir).parent()
    {
        dotenvy::from_path(worktree.join(".env")).ok();
    }
    let env_token = std::env::var(TOKEN_ENV_VAR).ok().filter(|t| !t.is_empty());
    obtain_with_env(annex, config, env_token).await
}

async fn obtain_with_env<R, W>(
    annex: &mut AnnexIo<R, W>,
    config: &RemoteConfig,
    env_token: Option<String>,
) -> Result<Credential, RemoteError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let setting = config
        .credential
        .clone()
        .unwrap_or_else(|| DEFAULT_CREDS_SETTING.to_string());

    if let Some(token) = env_token {
        tracing::debug!("using API token from {TOKEN_ENV_VAR}");
        return Ok(Credential {
            token,
            setting,
            from_store: false,
        });
    }

    if let Some(token) = annex.get_creds(&setting).await? {
        tracing::debug!(%setting, "using API token from the annex credential store");
        return Ok(Credential {
            token,
            setting,
            from_store: true,
        });
    }

    Err(RemoteError::Validation(format!(
        "no Dataverse API token found: set {TOKEN_ENV_VAR}, or store one with \
         `git annex enableremote <name>` after exporting it, under credential \
         setting {setting:?}"
    )))
}

/// Write a freshly validated token back to the credential store.
pub async fn persist<R, W>(
    annex: &mut AnnexIo<R, W>,
    credential: &Credential,
) -> Result<(), RemoteError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if credential.from_store {
        return Ok(());
    }
    annex
        .set_creds(&credential.setting, &credential.token)
        .await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn annex_with(input: &str) -> AnnexIo<BufReader<&[u8]>, Vec<u8>> {
        AnnexIo::new(BufReader::new(input.as_bytes()), Vec::new())
    }

    fn config(credential: Option<&str>) -> RemoteConfig {
        RemoteConfig {
            url: "https://demo.dataverse.org".into(),
            doi: "doi:10.5072/FK2/X".into(),
            root_path: None,
            credential: credential.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn env_token_wins_without_touching_the_store() {
        let mut annex = annex_with("");
        let cred = obtain_with_env(&mut annex, &config(None), Some("tok-123".into()))
            .await
            .unwrap();
        assert_eq!(cred.token, "tok-123");
        assert!(!cred.from_store);
        let (_, out) = annex.into_parts();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn store_token_is_used_when_env_is_absent() {
        let mut annex = annex_with("CREDS stored-tok \n");
        let cred = obtain_with_env(&mut annex, &config(None), None).await.unwrap();
        assert_eq!(cred.token, "stored-tok");
        assert!(cred.from_store);
        let (_, out) = annex.into_parts();
        assert_eq!(out, b"GETCREDS dataverse\n");
    }

    #[tokio::test]
    async fn named_credential_selects_the_setting() {
        let mut annex = annex_with("CREDS other-tok \n");
        let cred = obtain_with_env(&mut annex, &config(Some("mytoken")), None)
            .await
            .unwrap();
        assert_eq!(cred.setting, "mytoken");
        assert!(cred.from_store);
        let (_, out) = annex.into_parts();
        assert_eq!(out, b"GETCREDS mytoken\n");
    }

    #[tokio::test]
    async fn missing_token_is_a_validation_error() {
        let mut annex = annex_with("CREDS\n");
        let err = obtain_with_env(&mut annex, &config(None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Validation(_)));
    }

    #[tokio::test]
    async fn persist_writes_back_only_fresh_tokens() {
        let mut annex = annex_with("");
        let fresh = Credential {
            token: "t".into(),
            setting: "dataverse".into(),
            from_store: false,
        };
        persist(&mut annex, &fresh).await.unwrap();
        let (_, out) = annex.into_parts();
        assert_eq!(out, b"SETCREDS dataverse t \n");

        let mut annex = annex_with("");
        let stored = Credential {
            from_store: true,
            ..fresh
        };
        persist(&mut annex, &stored).await.unwrap();
        let (_, out) = annex.into_parts();
        assert!(out.is_empty());
    }
}
