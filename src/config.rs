use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::error::RemoteError;
use crate::protocol::AnnexIo;

/// Remote configuration as set via `git annex initremote`/`enableremote`.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL of the Dataverse instance, trailing slashes stripped.
    pub url: String,
    /// Target dataset DOI in canonical `doi:` form.
    pub doi: String,
    /// Optional POSIX prefix applied inside the Dataverse dataset.
    pub root_path: Option<String>,
    /// Optional name of a credential entry in the annex credential store.
    pub credential: Option<String>,
}

/// The recognized config keys with the descriptions LISTCONFIGS reports.
pub const CONFIG_DESCRIPTIONS: &[(&str, &str)] = &[
    ("url", "The Dataverse URL for the remote"),
    ("doi", "DOI to the dataset"),
    ("rootpath", "Path prefix inside the Dataverse dataset"),
    (
        "credential",
        "Identifier used to retrieve an API token from the credential store",
    ),
];

impl RemoteConfig {
    /// Read and validate the remote's configuration from the host.
    pub async fn load<R, W>(annex: &mut AnnexIo<R, W>) -> Result<Self, RemoteError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let url = annex.get_config("url").await?;
        let url = url.trim_end_matches('/').to_string();
        if url.is_empty() {
            return Err(RemoteError::Validation("url must be specified".into()));
        }

        let doi = annex.get_config("doi").await?;
        if doi.is_empty() {
            return Err(RemoteError::Validation("doi must be specified".into()));
        }
        let doi = format_doi(&doi)?;

        let root_path = annex.get_config("rootpath").await?;
        let root_path = {
            let trimmed = root_path.trim_matches('/');
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        };

        let credential = annex.get_config("credential").await?;
        let credential = if credential.is_empty() {
            None
        } else {
            Some(credential)
        };

        Ok(Self {
            url,
            doi,
            root_path,
            credential,
        })
    }
}

/// Convert a user-supplied DOI to the canonical `doi:` form the Dataverse
/// API expects. Accepts `doi:X`, `http(s)://doi.org/X`, or bare `X`.
pub fn format_doi(doi: &str) -> Result<String, RemoteError> {
    if doi.is_empty() {
        return Err(RemoteError::Validation("DOI cannot be empty".into()));
    }
    if doi.starts_with("doi:") {
        return Ok(doi.to_string());
    }
    let url_form = Regex::new(r"^https?://doi\.org/").expect("static regex");
    if let Some(m) = url_form.find(doi) {
        return Ok(format!("doi:{}", &doi[m.end()..]));
    }
    Ok(format!("doi:{doi}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
