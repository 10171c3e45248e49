//! Per-key record of the Dataverse file ids that have represented an annex
//! key, persisted through the host's GETSTATE/SETSTATE channel as a
//! comma-separated decimal list.

use std::collections::BTreeSet;

use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::error::RemoteError;
use crate::protocol::AnnexIo;

/// Parse the stored id list. Whitespace around ids and empty segments are
/// tolerated; anything else is a validation error, not a silent skip.
pub fn parse_fileids(state: &str) -> Result<BTreeSet<i64>, RemoteError> {
    let mut ids = BTreeSet::new();
    for part in state.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let id: i64 = part.parse().map_err(|_| {
            RemoteError::Validation(format!("malformed fileid record entry {part:?}"))
        })?;
        ids.insert(id);
    }
    Ok(ids)
}

/// Serialize an id set, ascending, no whitespace.
pub fn encode_fileids(ids: &BTreeSet<i64>) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub async fn get<R, W>(
    annex: &mut AnnexIo<R, W>,
    key: &str,
) -> Result<BTreeSet<i64>, RemoteError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let state = annex.get_state(key).await?;
    parse_fileids(&state)
}

pub async fn set<R, W>(
    annex: &mut AnnexIo<R, W>,
    key: &str,
    ids: &BTreeSet<i64>,
) -> Result<(), RemoteError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    annex.set_state(key, &encode_fileids(ids)).await
}

/// Bind one more id to a key. Read-modify-write; no-op when already bound.
pub async fn add<R, W>(
    annex: &mut AnnexIo<R, W>,
    key: &str,
    id: i64,
) -> Result<(), RemoteError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut ids = get(annex, key).await?;
    if ids.insert(id) {
        set(annex, key, &ids).await?;
    }
    Ok(())
}

/// Drop an id from a key's binding. No-op when not bound.
pub async fn remove<R, W>(
    annex: &mut AnnexIo<R, W>,
    key: &str,
    id: i64,
) -> Result<(), RemoteError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut ids = get(annex, key).await?;
    if ids.remove(&id) {
        set(annex, key, &ids).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
