//! The special-remote state machine: reacts to host verbs, consults the
//! key↔fileid bindings, and drives the dataset model.
//!
//! Regular mode stores keys under the derived path
//! `annex/<dirhash>/<key>`; export mode operates on paths the host names
//! explicitly. The two differ only in where the remote path comes from and
//! which versions a lookup may search, so both feed the same
//! store/retrieve/remove kernel.

use std::path::Path;

use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::api::DataverseClient;
use crate::bindings;
use crate::config::{CONFIG_DESCRIPTIONS, RemoteConfig};
use crate::credentials;
use crate::dataset::OnlineDataverseDataset;
use crate::error::RemoteError;
use crate::protocol::{AnnexIo, Request};

pub struct DataverseRemote<R, W> {
    annex: AnnexIo<R, W>,
    dvds: Option<OnlineDataverseDataset>,
    /// Path announced by the last EXPORT request; the following `*EXPORT`
    /// verb operates on it.
    export_path: Option<String>,
}

/// Where the remote path of a transfer comes from.
enum PathSource {
    /// Derived from the key; lookups may search all versions.
    Key,
    /// Supplied by the host via EXPORT; lookups stay in the latest version.
    Export(String),
}

impl<R, W> DataverseRemote<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(annex: AnnexIo<R, W>) -> Self {
        Self {
            annex,
            dvds: None,
            export_path: None,
        }
    }

    /// Dismantle into the protocol handle (lets tests inspect output).
    pub fn into_annex(self) -> AnnexIo<R, W> {
        self.annex
    }

    /// Announce the protocol version, then answer requests until the host
    /// closes the pipe. Fatal PREPARE failures propagate out after the
    /// failure reply so the process can exit with a diagnostic.
    pub async fn serve(&mut self) -> Result<(), RemoteError> {
        self.annex.send("VERSION 1").await?;
        while let Some(line) = self.annex.recv().await? {
            if line.is_empty() {
                continue;
            }
            self.handle(Request::parse(&line)).await?;
        }
        Ok(())
    }

    async fn handle(&mut self, request: Request) -> Result<(), RemoteError> {
        match request {
            Request::InitRemote => self.handle_prepare("INITREMOTE").await,
            Request::Prepare => self.handle_prepare("PREPARE").await,
            Request::CheckPresent { key } => {
                let reply = match self.check_present(&key).await {
                    Ok(true) => format!("CHECKPRESENT-SUCCESS {key}"),
                    Ok(false) => format!("CHECKPRESENT-FAILURE {key}"),
                    Err(e) => format!("CHECKPRESENT-UNKNOWN {key} {}", e.protocol_message()),
                };
                self.annex.send(&reply).await
            }
            Request::TransferStore { key, file } => {
                let result = self.store(&key, &file, PathSource::Key).await;
                self.reply_transfer("STORE", &key, result).await
            }
            Request::TransferRetrieve { key, file } => {
                let result = self.retrieve(&key, &file, PathSource::Key).await;
                self.reply_transfer("RETRIEVE", &key, result).await
            }
            Request::Remove { key } => {
                let reply = match self.remove(&key).await {
                    Ok(()) => format!("REMOVE-SUCCESS {key}"),
                    Err(e) => format!("REMOVE-FAILURE {key} {}", e.protocol_message()),
                };
                self.annex.send(&reply).await
            }
            Request::ExportSupported => self.annex.send("EXPORTSUPPORTED-SUCCESS").await,
            Request::Export { name } => {
                self.export_path = Some(name);
                Ok(())
            }
            Request::CheckPresentExport { key } => {
                let reply = match self.check_present_export(&key).await {
                    Ok(true) => format!("CHECKPRESENT-SUCCESS {key}"),
                    Ok(false) => format!("CHECKPRESENT-FAILURE {key}"),
                    Err(e) => format!("CHECKPRESENT-UNKNOWN {key} {}", e.protocol_message()),
                };
                self.annex.send(&reply).await
            }
            Request::TransferExportStore { key, file } => {
                let result = match self.export_path() {
                    Ok(rpath) => self.store(&key, &file, PathSource::Export(rpath)).await,
                    Err(e) => Err(e),
                };
                self.reply_transfer("STORE", &key, result).await
            }
            Request::TransferExportRetrieve { key, file } => {
                let result = match self.export_path() {
                    Ok(rpath) => self.retrieve(&key, &file, PathSource::Export(rpath)).await,
                    Err(e) => Err(e),
                };
                self.reply_transfer("RETRIEVE", &key, result).await
            }
            Request::RemoveExport { key } => {
                let reply = match self.remove_export(&key).await {
                    Ok(()) => format!("REMOVE-SUCCESS {key}"),
                    Err(e) => format!("REMOVE-FAILURE {key} {}", e.protocol_message()),
                };
                self.annex.send(&reply).await
            }
            Request::RenameExport { key, new_name } => {
                match self.rename_export(&new_name).await {
                    Ok(()) => self.annex.send(&format!("RENAMEEXPORT-SUCCESS {key}")).await,
                    Err(RemoteError::NotRenameable(_)) => {
                        // No way to rename across released versions; let the
                        // host fall back to remove+store.
                        self.annex.send("UNSUPPORTED-REQUEST").await
                    }
                    Err(e) => {
                        self.annex
                            .send(&format!(
                                "RENAMEEXPORT-FAILURE {key} {}",
                                e.protocol_message()
                            ))
                            .await
                    }
                }
            }
            Request::ListConfigs => {
                for (name, description) in CONFIG_DESCRIPTIONS {
                    self.annex.send(&format!("CONFIG {name} {description}")).await?;
                }
                self.annex.send("CONFIGEND").await
            }
            Request::Extensions => self.annex.send("EXTENSIONS").await,
            Request::Unknown(line) => {
                tracing::debug!(%line, "unsupported request");
                self.annex.send("UNSUPPORTED-REQUEST").await
            }
        }
    }

    async fn handle_prepare(&mut self, verb: &str) -> Result<(), RemoteError> {
        match self.prepare().await {
            Ok(()) => self.annex.send(&format!("{verb}-SUCCESS")).await,
            Err(e) => {
                self.annex
                    .send(&format!("{verb}-FAILURE {}", e.protocol_message()))
                    .await?;
                if e.is_fatal() {
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Read config, obtain and validate a token, resolve the dataset.
    async fn prepare(&mut self) -> Result<(), RemoteError> {
        let config = RemoteConfig::load(&mut self.annex).await?;
        let credential = credentials::obtain(&mut self.annex, &config).await?;
        let client = DataverseClient::new(&config.url, &credential.token)?;
        // `open` runs the cheap info_version probe; only a token that
        // passed it is persisted.
        let dvds =
            OnlineDataverseDataset::open(client, &config.doi, config.root_path.clone()).await?;
        credentials::persist(&mut self.annex, &credential).await?;
        self.dvds = Some(dvds);
        tracing::info!(url = %config.url, doi = %config.doi, "dataverse remote ready");
        Ok(())
    }

    /// Split borrows for handlers that drive the dataset and the host
    /// channel at the same time.
    fn parts(
        &mut self,
    ) -> Result<(&mut AnnexIo<R, W>, &mut OnlineDataverseDataset), RemoteError> {
        match self.dvds.as_mut() {
            Some(dvds) => Ok((&mut self.annex, dvds)),
            None => Err(RemoteError::Protocol(
                "verb received before PREPARE".into(),
            )),
        }
    }

    fn export_path(&self) -> Result<String, RemoteError> {
        self.export_path.clone().ok_or_else(|| {
            RemoteError::Protocol("export verb received without a prior EXPORT".into())
        })
    }

    async fn reply_transfer(
        &mut self,
        direction: &str,
        key: &str,
        result: Result<(), RemoteError>,
    ) -> Result<(), RemoteError> {
        let reply = match result {
            Ok(()) => format!("TRANSFER-SUCCESS {direction} {key}"),
            Err(e) => format!(
                "TRANSFER-FAILURE {direction} {key} {}",
                e.protocol_message()
            ),
        };
        self.annex.send(&reply).await
    }

    // -----------------------------------------------------------------------
    // Verb logic
    // -----------------------------------------------------------------------

    async fn check_present(&mut self, key: &str) -> Result<bool, RemoteError> {
        let (annex, dvds) = self.parts()?;
        let bound = bindings::get(annex, key).await?;
        if !bound.is_empty() {
            for fid in &bound {
                if dvds.has_fileid(*fid).await? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        // No id on record. Fall back to path matching, so content is
        // recoverable even when the id record was lost or never pushed.
        let path = key_remote_path(annex, key).await?;
        match dvds.get_fileid_from_path(&path, false).await? {
            Some(fid) => {
                bindings::add(annex, key, fid).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn check_present_export(&mut self, key: &str) -> Result<bool, RemoteError> {
        let rpath = self.export_path()?;
        let (annex, dvds) = self.parts()?;
        let bound = bindings::get(annex, key).await?;
        if !bound.is_empty() {
            return Ok(match dvds.get_fileid_from_path(&rpath, true).await? {
                Some(fid) => bound.contains(&fid),
                None => false,
            });
        }
        dvds.has_path_in_latest_version(&rpath).await
    }

    /// Shared store kernel. An occupied path in the latest version must be
    /// replaced rather than uploaded, or Dataverse renames the new file on
    /// its end.
    async fn store(
        &mut self,
        key: &str,
        local_file: &str,
        source: PathSource,
    ) -> Result<(), RemoteError> {
        let (annex, dvds) = self.parts()?;
        let remote_path = match source {
            PathSource::Key => key_remote_path(annex, key).await?,
            PathSource::Export(rpath) => rpath,
        };
        let replace_id = dvds.get_fileid_from_path(&remote_path, true).await?;
        match replace_id {
            Some(fid) => annex.debug(&format!("replacing fileid {fid} ...")).await?,
            None => annex.debug(&format!("uploading key {key} ...")).await?,
        }

        match dvds
            .upload_file(Path::new(local_file), &remote_path, replace_id)
            .await
        {
            Ok(new_id) => {
                if let Some(old) = replace_id {
                    // A replaced draft-only id is gone for good; one that
                    // was released stays retrievable and stays bound.
                    if !dvds.is_released_file(old).await? {
                        bindings::remove(annex, key, old).await?;
                    }
                }
                bindings::add(annex, key, new_id).await?;
                Ok(())
            }
            Err(RemoteError::DuplicateContent(msg)) => {
                // Dataverse refuses to store content it already holds.
                // The key-level outcome is what the host asked for, so
                // report success and leave the bindings alone.
                annex
                    .debug(&format!(
                        "store of {key} rejected as duplicate content, treating as no-op: {msg}"
                    ))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Shared retrieve kernel: prefer a bound id, fall back to path
    /// matching.
    async fn retrieve(
        &mut self,
        key: &str,
        local_file: &str,
        source: PathSource,
    ) -> Result<(), RemoteError> {
        let (annex, dvds) = self.parts()?;
        let bound = bindings::get(annex, key).await?;
        let fid = match bound.iter().next() {
            Some(fid) => Some(*fid),
            None => {
                let (path, latest_only) = match source {
                    PathSource::Key => (key_remote_path(annex, key).await?, false),
                    PathSource::Export(rpath) => (rpath, true),
                };
                dvds.get_fileid_from_path(&path, latest_only).await?
            }
        };
        let fid = fid.ok_or_else(|| RemoteError::Unavailable(key.to_string()))?;
        dvds.download_file(fid, Path::new(local_file)).await
    }

    async fn remove(&mut self, key: &str) -> Result<(), RemoteError> {
        let (annex, dvds) = self.parts()?;
        let mut targets = bindings::get(annex, key).await?;
        let path = key_remote_path(annex, key).await?;
        if let Some(fid) = dvds.get_fileid_from_path(&path, true).await? {
            targets.insert(fid);
        }
        for fid in targets {
            remove_fileid(annex, dvds, key, fid).await?;
        }
        Ok(())
    }

    async fn remove_export(&mut self, key: &str) -> Result<(), RemoteError> {
        let rpath = self.export_path()?;
        let (annex, dvds) = self.parts()?;
        match dvds.get_fileid_from_path(&rpath, true).await? {
            Some(fid) => remove_fileid(annex, dvds, key, fid).await,
            // Nothing at that path; the protocol counts that as removed.
            None => Ok(()),
        }
    }

    async fn rename_export(&mut self, new_name: &str) -> Result<(), RemoteError> {
        let old_rpath = self.export_path()?;
        let (_, dvds) = self.parts()?;
        dvds.rename_file(new_name, None, Some(&old_rpath)).await
    }
}

/// The canonical remote path of a key in regular mode:
/// `annex/<dirhash>/<key>`, with the hash directory supplied by the host.
async fn key_remote_path<R, W>(
    annex: &mut AnnexIo<R, W>,
    key: &str,
) -> Result<String, RemoteError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let dirhash = annex.dirhash_lower(key).await?;
    let dirhash = dirhash.trim_matches('/');
    Ok(format!("annex/{dirhash}/{key}"))
}

/// Remove one id for a key. Ids outside the latest version are a silent
/// success: the draft cannot be edited into released history, and the host
/// considers the removal done.
async fn remove_fileid<R, W>(
    annex: &mut AnnexIo<R, W>,
    dvds: &mut OnlineDataverseDataset,
    key: &str,
    fid: i64,
) -> Result<(), RemoteError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !dvds.has_fileid_in_latest_version(fid).await? {
        return Ok(());
    }
    dvds.remove_file(fid).await?;
    if !dvds.is_released_file(fid).await? {
        annex
            .debug(&format!("unset stored fileid {fid} for {key}"))
            .await?;
        bindings::remove(annex, key, fid).await?;
    } else {
        // The id survives in a released version. The host still records a
        // successful removal and will not re-check this key in export
        // mode; nothing more we can do about that here.
        annex
            .debug(&format!(
                "fileid {fid} stays in a released version, keeping it bound to {key}"
            ))
            .await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
