//! Chunked upload sessions.
//!
//! Each session owns one staging file under the staging directory. Chunks are
//! written at their explicit byte offset through a fresh file handle, so
//! chunks of one session may arrive in any order, be retried, or be written
//! concurrently. The per-session lock only guards range bookkeeping and is
//! never held across the byte write itself. A chunk reserves its range
//! while it verifies and writes; a second chunk touching a reserved range
//! waits for the first to land or fail before it is checked.

use crate::{
    models::upload::{ChunkAck, SessionStatus, UploadEvent},
    services::{
        backend::StorageLocations,
        byte_ranges::ByteRanges,
        key_allocator::{ObjectKey, ObjectKeyAllocator},
    },
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, VecDeque},
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::{Mutex, Notify, RwLock, broadcast},
};
use tracing::{debug, info, warn};

/// Number of recently expired keys remembered to answer `SessionExpired`.
const EXPIRED_KEY_MEMORY: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("storage location `{0}` is not configured")]
    InvalidStorageLocation(String),
    #[error("invalid range {start}-{end}/{total}: {reason}")]
    InvalidRange {
        start: u64,
        end: u64,
        total: u64,
        reason: String,
    },
    #[error("checksum mismatch for chunk {start}-{end} of session `{key}`")]
    ChecksumMismatch { key: String, start: u64, end: u64 },
    #[error("upload session `{0}` not found")]
    SessionNotFound(String),
    #[error("upload session `{0}` expired")]
    SessionExpired(String),
    #[error("upload session `{0}` is already finalized")]
    SessionFinalized(String),
    #[error("upload session `{key}` is incomplete: {received} of {total:?} bytes received")]
    IncompleteUpload {
        key: String,
        received: u64,
        total: Option<u64>,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// A chunk as received from the client. `end` is inclusive.
#[derive(Debug, Clone)]
pub struct ChunkWrite {
    pub start: u64,
    pub end: u64,
    pub total: u64,
    /// Ordinal supplied by the client; only logged.
    pub index: Option<u64>,
    pub payload: Bytes,
    /// Base64 MD5 of `payload`, verified when present.
    pub checksum: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub staging_dir: PathBuf,
    /// Sessions idle for longer than this are discarded by `sweep_expired`.
    pub session_timeout: Duration,
}

struct Progress {
    total_size: Option<u64>,
    received: ByteRanges,
    last_activity: DateTime<Utc>,
}

struct UploadSession {
    key: ObjectKey,
    storage_location_id: String,
    staging_path: PathBuf,
    created_at: DateTime<Utc>,
    promoting: AtomicBool,
    progress: Mutex<Progress>,
    /// Half-open ranges currently being verified or written.
    in_flight: std::sync::Mutex<Vec<(u64, u64)>>,
    released: Notify,
}

/// Holds a byte range of a session until dropped, including when the
/// request is cancelled mid-write.
struct Reservation {
    session: Arc<UploadSession>,
    range: (u64, u64),
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.session.in_flight.lock() {
            if let Some(pos) = in_flight.iter().position(|r| *r == self.range) {
                in_flight.swap_remove(pos);
            }
        }
        self.session.released.notify_waiters();
    }
}

impl UploadSession {
    async fn status(&self) -> SessionStatus {
        let progress = self.progress.lock().await;
        SessionStatus {
            key: self.key.to_string(),
            storage_location_id: self.storage_location_id.clone(),
            total_size: progress.total_size,
            received_bytes: progress.received.covered(),
            high_water_mark: progress.received.contiguous_from_zero(),
            complete: is_complete(&progress),
            created_at: self.created_at,
            last_activity: progress.last_activity,
        }
    }
}

fn is_complete(progress: &Progress) -> bool {
    progress
        .total_size
        .map(|total| progress.received.covers(total))
        .unwrap_or(false)
}

/// Exclusive right to promote a completed session, handed out at most once.
pub struct PromotionTicket {
    pub key: ObjectKey,
    pub storage_location_id: String,
    pub staging_path: PathBuf,
    pub total_size: u64,
}

struct Inner {
    config: AssemblerConfig,
    allocator: ObjectKeyAllocator,
    locations: Arc<StorageLocations>,
    sessions: RwLock<HashMap<ObjectKey, Arc<UploadSession>>>,
    expired: Mutex<VecDeque<ObjectKey>>,
    events: broadcast::Sender<UploadEvent>,
}

/// Registry of in-flight upload sessions.
#[derive(Clone)]
pub struct ChunkAssembler {
    inner: Arc<Inner>,
}

impl ChunkAssembler {
    pub async fn new(
        config: AssemblerConfig,
        locations: Arc<StorageLocations>,
    ) -> UploadResult<Self> {
        fs::create_dir_all(&config.staging_dir).await?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                allocator: ObjectKeyAllocator::new(),
                locations,
                sessions: RwLock::new(HashMap::new()),
                expired: Mutex::new(VecDeque::new()),
                events,
            }),
        })
    }

    pub fn staging_dir(&self) -> &PathBuf {
        &self.inner.config.staging_dir
    }

    /// Receive upload lifecycle events. Events sent while nobody listens are
    /// dropped.
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Open a new session, or resume the session named by `key`.
    pub async fn init_session(
        &self,
        storage_location_id: &str,
        key: Option<&str>,
        expected_total: Option<u64>,
    ) -> UploadResult<ObjectKey> {
        if !self.inner.locations.contains(storage_location_id) {
            return Err(UploadError::InvalidStorageLocation(
                storage_location_id.to_string(),
            ));
        }

        if let Some(raw) = key.filter(|k| !k.trim().is_empty()) {
            return self
                .resume_session(storage_location_id, raw, expected_total)
                .await;
        }

        let key = self.inner.allocator.allocate(storage_location_id);
        let staging_path = self
            .inner
            .config
            .staging_dir
            .join(format!("{}.part", key));
        File::create(&staging_path).await?;

        let now = Utc::now();
        let session = Arc::new(UploadSession {
            key: key.clone(),
            storage_location_id: storage_location_id.to_string(),
            staging_path,
            created_at: now,
            promoting: AtomicBool::new(false),
            progress: Mutex::new(Progress {
                total_size: expected_total,
                received: ByteRanges::new(),
                last_activity: now,
            }),
            in_flight: std::sync::Mutex::new(Vec::new()),
            released: Notify::new(),
        });
        self.inner
            .sessions
            .write()
            .await
            .insert(key.clone(), session);

        info!(
            "opened upload session {} for location {}",
            key, storage_location_id
        );
        self.emit(UploadEvent::Started {
            key: key.to_string(),
            storage_location_id: storage_location_id.to_string(),
        });
        Ok(key)
    }

    async fn resume_session(
        &self,
        storage_location_id: &str,
        raw: &str,
        expected_total: Option<u64>,
    ) -> UploadResult<ObjectKey> {
        let session = self.lookup(raw).await?;
        if session.promoting.load(Ordering::Acquire) {
            return Err(UploadError::SessionFinalized(raw.to_string()));
        }
        if session.storage_location_id != storage_location_id {
            return Err(UploadError::InvalidStorageLocation(
                storage_location_id.to_string(),
            ));
        }

        let mut progress = session.progress.lock().await;
        if let (Some(known), Some(expected)) = (progress.total_size, expected_total) {
            if known != expected {
                return Err(UploadError::InvalidRange {
                    start: 0,
                    end: 0,
                    total: expected,
                    reason: format!("session was started with total size {}", known),
                });
            }
        }
        if progress.total_size.is_none() {
            progress.total_size = expected_total;
        }
        progress.last_activity = Utc::now();
        debug!("resumed upload session {}", session.key);
        Ok(session.key.clone())
    }

    async fn lookup(&self, raw: &str) -> UploadResult<Arc<UploadSession>> {
        let key = ObjectKey::parse(raw).ok_or_else(|| UploadError::SessionNotFound(raw.into()))?;
        if let Some(session) = self.inner.sessions.read().await.get(&key) {
            return Ok(session.clone());
        }
        if self.inner.expired.lock().await.contains(&key) {
            Err(UploadError::SessionExpired(raw.to_string()))
        } else {
            Err(UploadError::SessionNotFound(raw.to_string()))
        }
    }

    /// Write one chunk at its byte offset and report session progress.
    pub async fn write_chunk(&self, raw_key: &str, chunk: ChunkWrite) -> UploadResult<ChunkAck> {
        let ChunkWrite {
            start,
            end,
            total,
            index,
            payload,
            checksum,
        } = chunk;
        validate_range(start, end, total, payload.len() as u64)?;

        if let Some(expected) = checksum.as_deref() {
            let matches = general_purpose::STANDARD
                .decode(expected.trim())
                .map(|decoded| decoded == md5::compute(&payload).0)
                .unwrap_or(false);
            if !matches {
                return Err(UploadError::ChecksumMismatch {
                    key: raw_key.to_string(),
                    start,
                    end,
                });
            }
        }

        let session = self.lookup(raw_key).await?;
        if session.promoting.load(Ordering::Acquire) {
            return Err(UploadError::SessionFinalized(raw_key.to_string()));
        }

        let (overlaps, _reservation) = loop {
            let released = session.released.notified();
            let mut progress = session.progress.lock().await;
            match progress.total_size {
                Some(known) if known != total => {
                    return Err(UploadError::InvalidRange {
                        start,
                        end,
                        total,
                        reason: format!("session total size is {}", known),
                    });
                }
                Some(_) => {}
                None => progress.total_size = Some(total),
            }
            progress.last_activity = Utc::now();

            let range = (start, end + 1);
            {
                let mut in_flight = session
                    .in_flight
                    .lock()
                    .map_err(|_| io::Error::other("chunk reservation lock poisoned"))?;
                if !in_flight.iter().any(|&(s, e)| s < range.1 && range.0 < e) {
                    in_flight.push(range);
                    let reservation = Reservation {
                        session: session.clone(),
                        range,
                    };
                    break (progress.received.overlaps(start, end + 1), reservation);
                }
            }
            drop(progress);
            debug!(
                "session {} bytes {}-{} wait for an overlapping chunk",
                session.key, start, end
            );
            released.await;
        };

        // Retried chunks must carry the bytes already on disk.
        for (s, e) in overlaps {
            let existing = read_range(&session.staging_path, s, e).await?;
            let offered = &payload[(s - start) as usize..(e - start) as usize];
            if existing != offered {
                return Err(UploadError::InvalidRange {
                    start,
                    end,
                    total,
                    reason: format!("bytes {}-{} differ from a previous chunk", s, e - 1),
                });
            }
        }

        let mut file = match OpenOptions::new()
            .write(true)
            .open(&session.staging_path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(UploadError::SessionExpired(raw_key.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        file.seek(SeekFrom::Start(start)).await?;
        file.write_all(&payload).await?;
        file.flush().await?;
        drop(file);

        let (ack, newly_complete) = {
            let mut progress = session.progress.lock().await;
            let was_complete = is_complete(&progress);
            progress.received.insert(start, end + 1);
            progress.last_activity = Utc::now();
            let complete = is_complete(&progress);
            (
                ChunkAck {
                    key: session.key.to_string(),
                    complete,
                    received_bytes: progress.received.covered(),
                    high_water_mark: progress.received.contiguous_from_zero(),
                },
                complete && !was_complete,
            )
        };

        debug!(
            "session {} chunk {:?} bytes {}-{}/{} written",
            session.key, index, start, end, total
        );
        self.emit(UploadEvent::ChunkWritten {
            key: ack.key.clone(),
            start,
            end,
        });
        if newly_complete {
            info!("upload session {} complete ({} bytes)", session.key, total);
            self.emit(UploadEvent::Completed {
                key: ack.key.clone(),
                total_size: total,
            });
        }
        Ok(ack)
    }

    pub async fn is_complete(&self, raw_key: &str) -> UploadResult<bool> {
        let session = self.lookup(raw_key).await?;
        let progress = session.progress.lock().await;
        Ok(is_complete(&progress))
    }

    pub async fn status(&self, raw_key: &str) -> UploadResult<SessionStatus> {
        Ok(self.lookup(raw_key).await?.status().await)
    }

    pub async fn active_sessions(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Drop a session right away instead of waiting for it to expire.
    pub async fn cancel(&self, raw_key: &str) -> UploadResult<()> {
        let session = self.lookup(raw_key).await?;
        if session.promoting.load(Ordering::Acquire) {
            return Err(UploadError::SessionFinalized(raw_key.to_string()));
        }
        self.inner.sessions.write().await.remove(&session.key);
        discard_staging(&session.staging_path).await;
        info!("cancelled upload session {}", session.key);
        self.emit(UploadEvent::Cancelled {
            key: session.key.to_string(),
        });
        Ok(())
    }

    /// Discard every session idle for longer than the configured timeout.
    /// Returns how many sessions were removed.
    pub async fn sweep_expired(&self) -> usize {
        let timeout = chrono::Duration::from_std(self.inner.config.session_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let candidates: Vec<Arc<UploadSession>> =
            self.inner.sessions.read().await.values().cloned().collect();
        let mut stale = Vec::new();
        for session in candidates {
            if session.promoting.load(Ordering::Acquire) {
                continue;
            }
            let last_activity = session.progress.lock().await.last_activity;
            if now.signed_duration_since(last_activity) >= timeout {
                stale.push(session);
            }
        }

        let mut removed = Vec::new();
        {
            let mut sessions = self.inner.sessions.write().await;
            for session in stale {
                // A promotion may have started since the scan.
                if session.promoting.load(Ordering::Acquire) {
                    continue;
                }
                if sessions.remove(&session.key).is_some() {
                    removed.push(session);
                }
            }
        }

        if !removed.is_empty() {
            let mut expired = self.inner.expired.lock().await;
            for session in &removed {
                expired.push_back(session.key.clone());
                while expired.len() > EXPIRED_KEY_MEMORY {
                    expired.pop_front();
                }
            }
        }

        for session in &removed {
            discard_staging(&session.staging_path).await;
            info!("expired idle upload session {}", session.key);
            self.emit(UploadEvent::Expired {
                key: session.key.to_string(),
            });
        }
        removed.len()
    }

    /// Claim a completed session for promotion. Only one caller can ever hold
    /// the ticket for a session.
    pub async fn begin_promotion(&self, raw_key: &str) -> UploadResult<PromotionTicket> {
        let session = self.lookup(raw_key).await?;
        let total_size = {
            let progress = session.progress.lock().await;
            if !is_complete(&progress) {
                return Err(UploadError::IncompleteUpload {
                    key: session.key.to_string(),
                    received: progress.received.covered(),
                    total: progress.total_size,
                });
            }
            progress.total_size.unwrap_or_default()
        };

        if session
            .promoting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(UploadError::SessionFinalized(raw_key.to_string()));
        }

        Ok(PromotionTicket {
            key: session.key.clone(),
            storage_location_id: session.storage_location_id.clone(),
            staging_path: session.staging_path.clone(),
            total_size,
        })
    }

    /// Forget a successfully promoted session.
    pub async fn finish_promotion(&self, ticket: PromotionTicket) {
        self.inner.sessions.write().await.remove(&ticket.key);
        self.emit(UploadEvent::Promoted {
            key: ticket.key.to_string(),
            storage_location_id: ticket.storage_location_id,
        });
    }

    /// Hand a session back after a failed promotion so it can be retried.
    pub async fn abort_promotion(&self, ticket: PromotionTicket) {
        if let Some(session) = self.inner.sessions.read().await.get(&ticket.key) {
            session.promoting.store(false, Ordering::Release);
            session.progress.lock().await.last_activity = Utc::now();
        }
    }
}

fn validate_range(start: u64, end: u64, total: u64, payload_len: u64) -> UploadResult<()> {
    let invalid = |reason: &str| UploadError::InvalidRange {
        start,
        end,
        total,
        reason: reason.to_string(),
    };
    if total == 0 {
        return Err(invalid("total size must be positive"));
    }
    if start > end {
        return Err(invalid("start is past end"));
    }
    if end >= total {
        return Err(invalid("end is past total size"));
    }
    if payload_len != end - start + 1 {
        return Err(invalid(&format!(
            "payload has {} bytes, range covers {}",
            payload_len,
            end - start + 1
        )));
    }
    Ok(())
}

async fn read_range(path: &Path, start: u64, end: u64) -> UploadResult<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; (end - start) as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn discard_staging(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("removed staging file {}", path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("failed to remove staging file {}: {}", path.display(), err),
    }
}
