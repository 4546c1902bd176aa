//! Concrete `SourceSession` and `ReplicationSession` implementations over
//! `tokio_postgres`. This is the external-collaborator boundary the spec
//! keeps out of the core: the database client library and the WAL
//! streaming transport. Every other module talks only to the traits in
//! `crate::session`.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use futures::{SinkExt, StreamExt};
use tokio::sync::oneshot;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{info, warn};

use postgres_connection::ConnectionOptions;
use postgres_ffi::xlog_utils::xlog_file_name;
use utils::id::TimelineId;
use utils::lsn::Lsn;

use crate::error::{CatchupError, CatchupResult};
use crate::session::{PtrackInfo, ReplicationSession, SourceSession, StopBackupResult};

/// Opens the ordinary session used for identity, capability, and backup
/// protocol calls; spawns the connection's driver task in the background
/// the way the teacher spawns every `tokio_postgres::connect` driver.
pub async fn connect_source(options: &ConnectionOptions) -> CatchupResult<PgSourceSession> {
    let (client, connection) = tokio_postgres::connect(&options.connstring(), NoTls)
        .await
        .map_err(|e| CatchupError::DatabaseProtocolFailure(format!("connecting to source: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "source connection driver exited with an error");
        }
    });
    Ok(PgSourceSession { client })
}

pub struct PgSourceSession {
    client: Client,
}

async fn query_one_scalar<T>(client: &Client, sql: &str) -> CatchupResult<T>
where
    T: for<'a> tokio_postgres::types::FromSql<'a> + Send + Sync,
{
    let row = client
        .query_one(sql, &[])
        .await
        .map_err(|e| CatchupError::DatabaseProtocolFailure(format!("query {sql:?}: {e}")))?;
    row.try_get(0)
        .map_err(|e| CatchupError::DatabaseProtocolFailure(format!("decoding result of {sql:?}: {e}")))
}

#[async_trait]
impl SourceSession for PgSourceSession {
    async fn server_version(&self) -> CatchupResult<(u32, String)> {
        let num: i32 = query_one_scalar(&self.client, "SHOW server_version_num").await.unwrap_or(0);
        let text: String = query_one_scalar(&self.client, "SHOW server_version").await?;
        Ok((num as u32, text))
    }

    async fn is_replica(&self) -> CatchupResult<bool> {
        query_one_scalar(&self.client, "SELECT pg_is_in_recovery()").await
    }

    async fn has_elevated_rights(&self) -> CatchupResult<bool> {
        query_one_scalar(
            &self.client,
            "SELECT pg_has_role(current_user, 'pg_write_server_files', 'USAGE') OR (SELECT rolsuper FROM pg_roles WHERE rolname = current_user)",
        )
        .await
    }

    async fn system_identifier(&self) -> CatchupResult<u64> {
        let raw: String = query_one_scalar(&self.client, "SELECT system_identifier FROM pg_control_system()").await?;
        raw.parse().map_err(|e| CatchupError::DatabaseProtocolFailure(format!("non-numeric system identifier {raw:?}: {e}")))
    }

    async fn current_timeline(&self) -> CatchupResult<TimelineId> {
        let tli: i32 = query_one_scalar(&self.client, "SELECT timeline_id FROM pg_control_checkpoint()").await?;
        Ok(TimelineId(tli as u32))
    }

    async fn wal_segment_size(&self) -> CatchupResult<u64> {
        let bytes: i64 = query_one_scalar(&self.client, "SELECT wal_segment_size FROM pg_control_init()").await?;
        Ok(bytes as u64)
    }

    async fn checksum_version(&self) -> CatchupResult<u32> {
        let version: i32 = query_one_scalar(&self.client, "SELECT data_checksum_version FROM pg_control_init()").await?;
        Ok(version as u32)
    }

    async fn ptrack_info(&self) -> CatchupResult<PtrackInfo> {
        let row = self
            .client
            .query_opt("SELECT extversion, nspname FROM pg_extension e JOIN pg_namespace n ON n.oid = e.extnamespace WHERE extname = 'ptrack'", &[])
            .await
            .map_err(|e| CatchupError::DatabaseProtocolFailure(format!("querying ptrack extension: {e}")))?;

        let Some(row) = row else {
            return Ok(PtrackInfo::default());
        };
        let version_str: String = row.try_get(0).unwrap_or_default();
        let schema: String = row.try_get(1).unwrap_or_default();
        let enabled: bool = query_one_scalar(&self.client, "SHOW ptrack.map_size")
            .await
            .map(|size: String| size != "0")
            .unwrap_or(false);

        Ok(PtrackInfo { version: parse_version(&version_str), enabled, schema: Some(schema) })
    }

    async fn ptrack_lsn_since(&self, _dest_redo_lsn: Lsn) -> CatchupResult<Lsn> {
        let raw: String = query_one_scalar(&self.client, "SELECT ptrack_init_lsn()").await?;
        Lsn::from_str(&raw).map_err(|e| CatchupError::DatabaseProtocolFailure(format!("malformed ptrack lsn {raw:?}: {e}")))
    }

    async fn start_backup(&self, label: &str) -> CatchupResult<Lsn> {
        let raw: String = self
            .client
            .query_one("SELECT pg_backup_start($1, false)", &[&label])
            .await
            .map_err(|e| CatchupError::DatabaseProtocolFailure(format!("pg_backup_start: {e}")))?
            .try_get(0)
            .map_err(|e| CatchupError::DatabaseProtocolFailure(format!("decoding pg_backup_start result: {e}")))?;
        Lsn::from_str(&raw).map_err(|e| CatchupError::DatabaseProtocolFailure(format!("malformed start lsn {raw:?}: {e}")))
    }

    async fn stop_backup(&self) -> CatchupResult<StopBackupResult> {
        let row = self
            .client
            .query_one("SELECT lsn, labelfile, spcmapfile FROM pg_backup_stop(false)", &[])
            .await
            .map_err(|e| CatchupError::DatabaseProtocolFailure(format!("pg_backup_stop: {e}")))?;

        let stop_lsn_raw: String = row.try_get(0).map_err(|e| CatchupError::DatabaseProtocolFailure(format!("{e}")))?;
        let backup_label: String = row.try_get(1).unwrap_or_default();
        let tablespace_map: String = row.try_get(2).unwrap_or_default();
        let stop_lsn =
            Lsn::from_str(&stop_lsn_raw).map_err(|e| CatchupError::DatabaseProtocolFailure(format!("malformed stop lsn {stop_lsn_raw:?}: {e}")))?;

        let txid: i64 = query_one_scalar(&self.client, "SELECT txid_current()").await.unwrap_or(0);

        Ok(StopBackupResult {
            backup_label,
            tablespace_map,
            snapshot_txid: txid as u64,
            invocation_time: chrono::Utc::now(),
            stop_lsn,
        })
    }

    async fn issue_restore_point(&self, name: &str) -> CatchupResult<Lsn> {
        let raw: String = self
            .client
            .query_one("SELECT pg_create_restore_point($1)", &[&name])
            .await
            .map_err(|e| CatchupError::DatabaseProtocolFailure(format!("pg_create_restore_point: {e}")))?
            .try_get(0)
            .map_err(|e| CatchupError::DatabaseProtocolFailure(format!("{e}")))?;
        Lsn::from_str(&raw).map_err(|e| CatchupError::DatabaseProtocolFailure(format!("malformed restore point lsn {raw:?}: {e}")))
    }
}

fn parse_version(text: &str) -> Option<(u32, u32)> {
    let (major, minor) = text.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Opens a `replication=database` session. A separate physical connection
/// from the ordinary session, per libpq's replication protocol rules.
/// `dest_wal_dir` and `wal_seg_size` are fixed for the lifetime of the
/// session: both are already known (from the Source Probe and the
/// destination path in `Config`) by the time the engine needs to stream.
pub async fn connect_replication(options: &ConnectionOptions, dest_wal_dir: Utf8PathBuf, wal_seg_size: u64) -> CatchupResult<PgReplicationSession> {
    let (client, connection) = tokio_postgres::connect(&options.replication_connstring(), NoTls)
        .await
        .map_err(|e| CatchupError::DatabaseProtocolFailure(format!("connecting replication session: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "replication connection driver exited with an error");
        }
    });
    Ok(PgReplicationSession(Arc::new(Inner {
        client,
        flushed: AtomicU64::new(0),
        stop_tx: Mutex::new(None),
        dest_wal_dir,
        wal_seg_size,
    })))
}

struct Inner {
    client: Client,
    flushed: AtomicU64,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    dest_wal_dir: Utf8PathBuf,
    wal_seg_size: u64,
}

#[derive(Clone)]
pub struct PgReplicationSession(Arc<Inner>);

#[async_trait]
impl ReplicationSession for PgReplicationSession {
    async fn timeline_history(&self, tli: TimelineId) -> CatchupResult<String> {
        let messages = self
            .0
            .client
            .simple_query(&format!("TIMELINE_HISTORY {}", tli.0))
            .await
            .map_err(|e| CatchupError::DatabaseProtocolFailure(format!("TIMELINE_HISTORY {}: {e}", tli.0)))?;

        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                if let Some(content) = row.get(1) {
                    return Ok(content.to_string());
                }
            }
        }
        Err(CatchupError::DatabaseProtocolFailure("TIMELINE_HISTORY returned no rows".into()))
    }

    async fn start_streaming(&self, timeline: TimelineId, start_lsn: Lsn) -> CatchupResult<()> {
        let inner = self.0.clone();
        let (stop_tx, stop_rx) = oneshot::channel();
        *inner.stop_tx.lock().unwrap() = Some(stop_tx);
        tokio::spawn(async move {
            if let Err(e) = run_stream(inner, timeline, start_lsn, stop_rx).await {
                warn!(error = %e, "wal streaming task exited with an error");
            }
        });
        Ok(())
    }

    async fn flushed_lsn(&self) -> CatchupResult<Lsn> {
        Ok(Lsn(self.0.flushed.load(Ordering::SeqCst)))
    }

    async fn stop_streaming(&self) -> CatchupResult<()> {
        if let Some(tx) = self.0.stop_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}

/// Runs the physical replication stream into `inner.dest_wal_dir`, updating
/// `inner.flushed` as bytes land. Exits when `stop_rx` fires or the stream
/// ends.
async fn run_stream(inner: Arc<Inner>, timeline: TimelineId, start_lsn: Lsn, mut stop_rx: oneshot::Receiver<()>) -> CatchupResult<()> {
    let query = format!("START_REPLICATION PHYSICAL {start_lsn} TIMELINE {}", timeline.0);
    let duplex_stream = inner
        .client
        .copy_both_simple::<Bytes>(&query)
        .await
        .map_err(|e| CatchupError::StreamingFailure(format!("START_REPLICATION: {e}")))?;
    futures::pin_mut!(duplex_stream);

    let mut current_lsn = start_lsn;
    loop {
        tokio::select! {
            _ = &mut stop_rx => return Ok(()),
            next = duplex_stream.next() => {
                let Some(message) = next else {
                    return Err(CatchupError::StreamingFailure("replication stream ended unexpectedly".into()));
                };
                let message = message.map_err(|e| CatchupError::StreamingFailure(format!("reading replication message: {e}")))?;
                if let Some((new_lsn, ack_needed)) = handle_copy_data(&message, &inner.dest_wal_dir, timeline, inner.wal_seg_size, current_lsn)? {
                    current_lsn = new_lsn;
                    inner.flushed.store(current_lsn.0, Ordering::SeqCst);
                    if ack_needed {
                        let ack = standby_status_update(current_lsn);
                        duplex_stream.send(ack).await.map_err(|e| CatchupError::StreamingFailure(format!("sending status update: {e}")))?;
                    }
                }
            }
        }
    }
}

/// Parses one CopyData message from the replication stream: an XLogData
/// block (tag `w`) appends bytes at its declared LSN and advances the
/// flush watermark; a primary keepalive (tag `k`) with the reply-requested
/// bit set needs an immediate status update.
fn handle_copy_data(message: &Bytes, dest_wal_dir: &Utf8Path, timeline: TimelineId, wal_seg_size: u64, current_lsn: Lsn) -> CatchupResult<Option<(Lsn, bool)>> {
    if message.is_empty() {
        return Ok(None);
    }
    match message[0] {
        b'w' if message.len() >= 25 => {
            let start = Lsn(u64::from_be_bytes(message[1..9].try_into().unwrap()));
            let payload = &message[25..];
            append_wal_bytes(dest_wal_dir, timeline, wal_seg_size, start, payload)?;
            let end = start.checked_add(payload.len() as u64).unwrap_or(start);
            Ok(Some((end, false)))
        }
        b'k' if message.len() >= 18 => {
            let reply_requested = message[17] != 0;
            Ok(Some((current_lsn, reply_requested)))
        }
        _ => Ok(None),
    }
}

fn append_wal_bytes(dest_wal_dir: &Utf8Path, timeline: TimelineId, wal_seg_size: u64, start: Lsn, payload: &[u8]) -> CatchupResult<()> {
    use std::io::{Seek, SeekFrom, Write};

    let segno = start.segment_number(wal_seg_size);
    let offset = start.segment_offset(wal_seg_size);
    let path = dest_wal_dir.join(xlog_file_name(timeline, segno, wal_seg_size));

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path.as_std_path())
        .map_err(|e| CatchupError::io(&path, e))?;
    file.set_len(wal_seg_size).map_err(|e| CatchupError::io(&path, e))?;
    file.seek(SeekFrom::Start(offset)).map_err(|e| CatchupError::io(&path, e))?;
    file.write_all(payload).map_err(|e| CatchupError::io(&path, e))?;
    info!(segment = %path, bytes = payload.len(), "wrote wal bytes");
    Ok(())
}

fn standby_status_update(flushed: Lsn) -> Bytes {
    let mut buf = Vec::with_capacity(34);
    buf.push(b'r');
    buf.extend_from_slice(&flushed.0.to_be_bytes());
    buf.extend_from_slice(&flushed.0.to_be_bytes());
    buf.extend_from_slice(&flushed.0.to_be_bytes());
    buf.extend_from_slice(&0i64.to_be_bytes());
    buf.push(0);
    Bytes::from(buf)
}
