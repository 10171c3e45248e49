//! The git-annex external special remote protocol (VERSION 1).
//!
//! A line-oriented request/response stream: git-annex writes one request to
//! our stdin, we answer on stdout, and in between we may issue queries of
//! our own (`GETCONFIG`, `GETSTATE`, ...) that the host answers with `VALUE`
//! lines. Strictly serial: one outstanding exchange at a time.
//!
//! [`AnnexIo`] is generic over the byte streams so tests can drive the
//! remote with in-memory buffers instead of real stdio.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RemoteError;

pub struct AnnexIo<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> AnnexIo<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Dismantle into the underlying streams (lets tests inspect output).
    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }

    /// Write one protocol line. The payload must not contain newlines.
    pub async fn send(&mut self, line: &str) -> Result<(), RemoteError> {
        debug_assert!(!line.contains('\n'));
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read the next line from the host. `None` on EOF (host closed the
    /// pipe, which is how git-annex shuts the remote down).
    pub async fn recv(&mut self) -> Result<Option<String>, RemoteError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Send a query and expect a `VALUE` reply.
    async fn query_value(&mut self, request: &str) -> Result<String, RemoteError> {
        self.send(request).await?;
        let reply = self
            .recv()
            .await?
            .ok_or_else(|| RemoteError::Protocol("host closed pipe mid-query".into()))?;
        if reply == "VALUE" {
            return Ok(String::new());
        }
        match reply.strip_prefix("VALUE ") {
            Some(rest) => Ok(rest.to_string()),
            None => Err(RemoteError::Protocol(format!(
                "expected VALUE reply to {request}, got {reply:?}"
            ))),
        }
    }

    pub async fn get_config(&mut self, key: &str) -> Result<String, RemoteError> {
        self.query_value(&format!("GETCONFIG {key}")).await
    }

    pub async fn set_config(&mut self, key: &str, value: &str) -> Result<(), RemoteError> {
        self.send(&format!("SETCONFIG {key} {value}")).await
    }

    /// Per-key persistent state from the git-annex branch.
    pub async fn get_state(&mut self, key: &str) -> Result<String, RemoteError> {
        self.query_value(&format!("GETSTATE {key}")).await
    }

    pub async fn set_state(&mut self, key: &str, value: &str) -> Result<(), RemoteError> {
        self.send(&format!("SETSTATE {key} {value}")).await
    }

    pub async fn get_git_dir(&mut self) -> Result<String, RemoteError> {
        self.query_value("GETGITDIR").await
    }

    /// Two-level lower-case hash directory for a key, e.g. `f87/4d5/`.
    pub async fn dirhash_lower(&mut self, key: &str) -> Result<String, RemoteError> {
        self.query_value(&format!("DIRHASH-LOWER {key}")).await
    }

    /// Stored credentials for a setting name. `None` when nothing is stored.
    pub async fn get_creds(&mut self, setting: &str) -> Result<Option<String>, RemoteError> {
        self.send(&format!("GETCREDS {setting}")).await?;
        let reply = self
            .recv()
            .await?
            .ok_or_else(|| RemoteError::Protocol("host closed pipe mid-query".into()))?;
        let rest = match reply.strip_prefix("CREDS") {
            Some(rest) if rest.is_empty() || rest.starts_with(' ') => rest,
            _ => {
                return Err(RemoteError::Protocol(format!(
                    "expected CREDS reply, got {reply:?}"
                )));
            }
        };
        let login = rest.trim().split(' ').next().unwrap_or("");
        if login.is_empty() {
            Ok(None)
        } else {
            Ok(Some(login.to_string()))
        }
    }

    /// Store credentials under a setting name. The token travels as the
    /// login with an empty password.
    pub async fn set_creds(&mut self, setting: &str, login: &str) -> Result<(), RemoteError> {
        self.send(&format!("SETCREDS {setting} {login} ")).await
    }

    /// Diagnostic visible with `git annex --debug`.
    pub async fn debug(&mut self, msg: &str) -> Result<(), RemoteError> {
        self.send(&format!("DEBUG {msg}")).await
    }

    /// Message shown to the user.
    pub async fn info(&mut self, msg: &str) -> Result<(), RemoteError> {
        self.send(&format!("INFO {msg}")).await
    }
}

/// A request line from the host, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    InitRemote,
    Prepare,
    CheckPresent { key: String },
    TransferStore { key: String, file: String },
    TransferRetrieve { key: String, file: String },
    Remove { key: String },
    ExportSupported,
    Export { name: String },
    CheckPresentExport { key: String },
    TransferExportStore { key: String, file: String },
    TransferExportRetrieve { key: String, file: String },
    RemoveExport { key: String },
    RenameExport { key: String, new_name: String },
    ListConfigs,
    Extensions,
    Unknown(String),
}

impl Request {
    pub fn parse(line: &str) -> Self {
        let mut words = line.splitn(2, ' ');
        let verb = words.next().unwrap_or("");
        let rest = words.next().unwrap_or("");
        match verb {
            "INITREMOTE" => Self::InitRemote,
            "PREPARE" => Self::Prepare,
            "CHECKPRESENT" => Self::CheckPresent {
                key: rest.to_string(),
            },
            "REMOVE" => Self::Remove {
                key: rest.to_string(),
            },
            "TRANSFER" => match parse_transfer(rest) {
                Some(("STORE", key, file)) => Self::TransferStore { key, file },
                Some(("RETRIEVE", key, file)) => Self::TransferRetrieve { key, file },
                _ => Self::Unknown(line.to_string()),
            },
            "EXPORTSUPPORTED" => Self::ExportSupported,
            "EXPORT" => Self::Export {
                name: rest.to_string(),
            },
            "CHECKPRESENTEXPORT" => Self::CheckPresentExport {
                key: rest.to_string(),
            },
            "TRANSFEREXPORT" => match parse_transfer(rest) {
                Some(("STORE", key, file)) => Self::TransferExportStore { key, file },
                Some(("RETRIEVE", key, file)) => Self::TransferExportRetrieve { key, file },
                _ => Self::Unknown(line.to_string()),
            },
            "REMOVEEXPORT" => Self::RemoveExport {
                key: rest.to_string(),
            },
            "RENAMEEXPORT" => {
                let mut parts = rest.splitn(2, ' ');
                match (parts.next(), parts.next()) {
                    (Some(key), Some(new_name)) if !key.is_empty() => Self::RenameExport {
                        key: key.to_string(),
                        new_name: new_name.to_string(),
                    },
                    _ => Self::Unknown(line.to_string()),
                }
            }
            "LISTCONFIGS" => Self::ListConfigs,
            "EXTENSIONS" => Self::Extensions,
            _ => Self::Unknown(line.to_string()),
        }
    }
}

/// Split `STORE|RETRIEVE <key> <file>`. Keys never contain spaces; the
/// file name is everything after the key and may.
fn parse_transfer(rest: &str) -> Option<(&str, String, String)> {
    let mut parts = rest.splitn(3, ' ');
    let direction = parts.next()?;
    let key = parts.next()?;
    let file = parts.next()?;
    if key.is_empty() || file.is_empty() {
        return None;
    }
    Some((direction, key.to_string(), file.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
