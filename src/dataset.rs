//! Cached view of one Dataverse dataset across its versions.
//!
//! Files on Dataverse carry a persistent integer id; their "path" is
//! metadata (`directoryLabel` + `label`). A released version cannot be
//! modified, so an id that was ever published stays resolvable even after
//! the file is replaced or removed from the draft. The cache tracks, per
//! id, the mangled path plus two flags: whether the id sits in the latest
//! (possibly draft) version, and whether that version is released.
//!
//! Population is lazy and at most two requests deep: the latest-version
//! listing on first touch, and a full all-versions listing the first time a
//! lookup misses the latest view. Local mutations (upload/replace/remove/
//! rename) update the cache in place after the server confirms them, so no
//! re-listing is needed within a process lifetime.

use std::collections::HashSet;
use std::path::Path;

use futures_util::StreamExt;
use indexmap::IndexMap;
use tokio::io::AsyncWriteExt;

use crate::api::{DatasetVersion, DataverseClient};
use crate::error::RemoteError;
use crate::mangle::{mangle_path, split_label};

#[derive(Debug, Clone)]
struct FileRecord {
    /// Mangled POSIX path within the dataset.
    path: String,
    is_released: bool,
    is_latest_version: bool,
}

#[derive(Debug)]
pub struct OnlineDataverseDataset {
    client: DataverseClient,
    dsid: String,
    root_path: Option<String>,
    records: IndexMap<i64, FileRecord>,
    /// Ids observed in non-latest versions during expansion. A record
    /// overwritten by the latest (draft) view loses its released flag;
    /// membership here is what still proves the id survives in history.
    old_version_ids: HashSet<i64>,
    latest_loaded: bool,
    expanded: bool,
}

impl OnlineDataverseDataset {
    /// Connect to a dataset. Checks instance liveness (which also settles
    /// whether the token works) and dataset existence; does not populate
    /// the file cache.
    pub async fn open(
        client: DataverseClient,
        dsid: &str,
        root_path: Option<String>,
    ) -> Result<Self, RemoteError> {
        client.info_version().await?;
        client.get_dataset_latest(dsid).await?;
        Ok(Self {
            client,
            dsid: dsid.to_string(),
            root_path,
            records: IndexMap::new(),
            old_version_ids: HashSet::new(),
            latest_loaded: false,
            expanded: false,
        })
    }

    /// Root-prefix and mangle a caller-supplied POSIX path.
    fn mangled(&self, path: &str) -> String {
        match &self.root_path {
            Some(root) => mangle_path(&format!("{root}/{path}")),
            None => mangle_path(path),
        }
    }

    // -----------------------------------------------------------------------
    // Cache population
    // -----------------------------------------------------------------------

    async fn ensure_latest(&mut self) -> Result<(), RemoteError> {
        if self.latest_loaded {
            return Ok(());
        }
        let latest = self.client.get_dataset_latest(&self.dsid).await?;
        let released = latest.is_released();
        for f in &latest.files {
            self.records.insert(
                f.data_file.id,
                FileRecord {
                    path: f.path(),
                    is_released: released,
                    is_latest_version: true,
                },
            );
        }
        self.latest_loaded = true;
        Ok(())
    }

    /// Expand the cache to every known version. One-shot per process; a
    /// failed fetch leaves the flag unset so a later miss can retry.
    async fn ensure_expanded(&mut self) -> Result<(), RemoteError> {
        if self.expanded {
            return Ok(());
        }
        self.ensure_latest().await?;
        let mut versions = self.client.get_dataset_versions(&self.dsid).await?;
        sort_versions(&mut versions);
        if let Some((latest, older)) = versions.split_last() {
            for version in older {
                let released = version.is_released();
                for f in &version.files {
                    self.old_version_ids.insert(f.data_file.id);
                    self.records.insert(
                        f.data_file.id,
                        FileRecord {
                            path: f.path(),
                            is_released: released,
                            is_latest_version: false,
                        },
                    );
                }
            }
            let released = latest.is_released();
            for f in &latest.files {
                self.records.insert(
                    f.data_file.id,
                    FileRecord {
                        path: f.path(),
                        is_released: released,
                        is_latest_version: true,
                    },
                );
            }
        }
        self.expanded = true;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Resolve a path to a file id. With `latest_only`, only the latest
    /// version is searched; otherwise a miss there triggers the
    /// all-versions expansion before searching everything. The first match
    /// in insertion order wins.
    pub async fn get_fileid_from_path(
        &mut self,
        path: &str,
        latest_only: bool,
    ) -> Result<Option<i64>, RemoteError> {
        let mangled = self.mangled(path);
        self.ensure_latest().await?;
        let hit = self
            .records
            .iter()
            .find(|(_, r)| r.is_latest_version && r.path == mangled)
            .map(|(id, _)| *id);
        if hit.is_some() || latest_only {
            return Ok(hit);
        }
        self.ensure_expanded().await?;
        Ok(self
            .records
            .iter()
            .find(|(_, r)| r.path == mangled)
            .map(|(id, _)| *id))
    }

    pub async fn has_fileid(&mut self, fid: i64) -> Result<bool, RemoteError> {
        self.ensure_latest().await?;
        if self
            .records
            .get(&fid)
            .is_some_and(|r| r.is_latest_version)
        {
            return Ok(true);
        }
        self.ensure_expanded().await?;
        Ok(self.records.contains_key(&fid))
    }

    pub async fn has_fileid_in_latest_version(&mut self, fid: i64) -> Result<bool, RemoteError> {
        self.ensure_latest().await?;
        Ok(self
            .records
            .get(&fid)
            .is_some_and(|r| r.is_latest_version))
    }

    pub async fn has_path(&mut self, path: &str) -> Result<bool, RemoteError> {
        Ok(self.get_fileid_from_path(path, false).await?.is_some())
    }

    pub async fn has_path_in_latest_version(&mut self, path: &str) -> Result<bool, RemoteError> {
        Ok(self.get_fileid_from_path(path, true).await?.is_some())
    }

    /// Whether an id is pinned by a released version. True means delete
    /// and replace only detach it from the draft; the content stays
    /// reachable through history.
    pub async fn is_released_file(&mut self, fid: i64) -> Result<bool, RemoteError> {
        self.ensure_latest().await?;
        if self.records.get(&fid).is_some_and(|r| r.is_released) {
            return Ok(true);
        }
        self.ensure_expanded().await?;
        Ok(self.old_version_ids.contains(&fid))
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Stream a datafile to `local_path`, creating or truncating it.
    /// Chunk sizes are whatever the transport delivers; the file is never
    /// buffered whole.
    pub async fn download_file(&self, fid: i64, local_path: &Path) -> Result<(), RemoteError> {
        let resp = self.client.get_datafile(fid).await?;
        let mut stream = resp.bytes_stream();
        let mut out = tokio::fs::File::create(local_path).await?;
        while let Some(chunk) = stream.next().await {
            out.write_all(&chunk?).await?;
        }
        out.flush().await?;
        Ok(())
    }

    /// Upload `local_path` to `remote_path`, replacing `replace_id` if
    /// given (Dataverse renames colliding uploads instead of replacing, so
    /// the caller must resolve the id of an occupied path first). Returns
    /// the new file id. A duplicate-content rejection propagates as
    /// [`RemoteError::DuplicateContent`] for the caller to decide on.
    pub async fn upload_file(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        replace_id: Option<i64>,
    ) -> Result<i64, RemoteError> {
        let mangled = self.mangled(remote_path);
        let (_, name) = split_label(&mangled);
        let json_data = label_metadata(&mangled, &self.dsid);
        let content = tokio::fs::read(local_path).await?;
        let entry = match replace_id {
            Some(fid) => {
                self.client
                    .replace_datafile(fid, content, name, &json_data)
                    .await?
            }
            None => {
                self.client
                    .upload_datafile(&self.dsid, content, name, &json_data)
                    .await?
            }
        };

        // The upload may be the first cache touch (`git-annex-copy --fast`
        // skips checkpresent).
        self.ensure_latest().await?;
        if let Some(fid) = replace_id {
            self.drop_from_latest(fid);
        }
        let new_id = entry.data_file.id;
        self.records.insert(
            new_id,
            FileRecord {
                path: entry.path(),
                is_released: false,
                is_latest_version: true,
            },
        );
        Ok(new_id)
    }

    /// Point an existing datafile at a new path via a metadata update.
    /// Exactly one locator is needed; a missing id is resolved from
    /// `rename_path` against the latest version only (renames across
    /// released versions are rejected by Dataverse as modifications).
    pub async fn rename_file(
        &mut self,
        new_path: &str,
        rename_id: Option<i64>,
        rename_path: Option<&str>,
    ) -> Result<(), RemoteError> {
        let fid = match (rename_id, rename_path) {
            (Some(fid), _) => fid,
            (None, Some(path)) => self
                .get_fileid_from_path(path, true)
                .await?
                .ok_or_else(|| RemoteError::NotRenameable(path.to_string()))?,
            (None, None) => {
                return Err(RemoteError::Validation(
                    "rename needs a file id or a source path".into(),
                ));
            }
        };

        let mangled = self.mangled(new_path);
        let json_data = label_metadata(&mangled, &self.dsid);
        let body = self.client.update_datafile_metadata(fid, &json_data).await?;
        parse_metadata_update_reply(&body)?;

        self.ensure_latest().await?;
        self.records.insert(
            fid,
            FileRecord {
                path: mangled,
                is_released: false,
                is_latest_version: true,
            },
        );
        Ok(())
    }

    /// Delete a datafile from the draft. Released history is untouched;
    /// the id stays resolvable from older versions if it was published.
    pub async fn remove_file(&mut self, fid: i64) -> Result<(), RemoteError> {
        self.client.delete_datafile(fid).await?;
        // The delete may be the first cache touch (git-annex-export can
        // remove without a prior checkpresent).
        self.ensure_latest().await?;
        self.drop_from_latest(fid);
        Ok(())
    }

    /// Detach an id from the latest view. A record pinned by a released
    /// version survives with `is_latest_version` cleared; a draft-only
    /// record is gone for good.
    fn drop_from_latest(&mut self, fid: i64) {
        let pinned = self.old_version_ids.contains(&fid);
        match self.records.get_mut(&fid) {
            Some(rec) if rec.is_released || pinned => rec.is_latest_version = false,
            Some(_) => {
                self.records.shift_remove(&fid);
            }
            None => {}
        }
    }
}

/// Label metadata for upload/replace/rename. `label` and `filename` must
/// both be set (the model enforces `filename` even though `label` is the
/// effective one); `directoryLabel` is omitted for files at the root.
fn label_metadata(mangled_path: &str, dsid: &str) -> serde_json::Value {
    let (dir, name) = split_label(mangled_path);
    let mut json_data = serde_json::json!({
        "label": name,
        "filename": name,
        "pid": dsid,
    });
    if let Some(dir) = dir {
        json_data["directoryLabel"] = serde_json::Value::String(dir.to_string());
    }
    json_data
}

/// Order versions ascending so the latest (a DRAFT, when one exists, has
/// no version numbers) sorts last.
fn sort_versions(versions: &mut [DatasetVersion]) {
    versions.sort_by_key(|v| {
        (
            v.version_number.unwrap_or(i64::MAX),
            v.version_minor_number.unwrap_or(i64::MAX),
        )
    });
}

/// The metadata endpoint answers with prose wrapping a JSON object:
/// `File Metadata update has been completed: {...}`. Extract and check the
/// object so a surprise reply shape fails loudly instead of corrupting the
/// cache.
fn parse_metadata_update_reply(body: &str) -> Result<serde_json::Value, RemoteError> {
    let start = body.find('{').ok_or_else(|| RemoteError::Transport {
        status: None,
        message: format!(
            "unexpected metadata update reply: {}",
            body.chars().take(200).collect::<String>()
        ),
    })?;
    serde_json::from_str(body[start..].trim()).map_err(|e| RemoteError::Transport {
        status: None,
        message: format!("unparseable metadata update reply: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
