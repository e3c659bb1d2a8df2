//! Multipart Session Manager (§4.E): tracks in-flight encrypted multipart
//! uploads. Holds the DEK and base IV for the session's lifetime and assigns
//! each part a deterministic CTR block offset so parts can be uploaded,
//! retried, or overwritten in any order — only the final ascending sequence
//! assembled at `Complete` matters. Session bodies themselves are never
//! buffered here; only small per-part bookkeeping (etag, byte count, block
//! offset) is kept in memory.

use crate::codec::streaming::{blocks_for, BaseIv};
use crate::keys::Dek;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use zeroize::Zeroize;

#[derive(Debug, thiserror::Error)]
pub enum MultipartError {
    #[error("no such upload: {0}")]
    NoSuchUpload(String),
    #[error("part number must be between 1 and 10000")]
    InvalidPartNumber,
    #[error("invalid part: {0}")]
    InvalidPart(String),
    #[error("parts must be listed in strictly ascending order with no duplicates")]
    InvalidPartOrder,
    #[error("you must specify at least one part")]
    EmptyPartList,
    #[error("upload is not accepting parts (state: {0})")]
    WrongState(&'static str),
}

/// State machine position of an [`UploadSession`] (§4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Accepting,
    Completing,
    Completed,
    Aborted,
}

impl SessionState {
    fn label(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Accepting => "accepting",
            SessionState::Completing => "completing",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
        }
    }
}

/// Bookkeeping for one accepted part. The ciphertext itself already lives in
/// the backend; only what's needed to validate `Complete` and recompute the
/// part's block offset is kept here.
#[derive(Debug, Clone)]
pub struct PartRecord {
    pub etag: String,
    pub plaintext_bytes: u64,
    pub block_offset: u64,
}

/// An in-flight (or just-finished) encrypted multipart upload.
pub struct UploadSession {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
    pub user_metadata: HashMap<String, String>,
    dek: Dek,
    pub encrypted_dek: Vec<u8>,
    pub key_fingerprint: String,
    pub base_iv: BaseIv,
    pub segment_size: u64,
    pub parts: HashMap<u32, PartRecord>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub touched_at: DateTime<Utc>,
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        self.dek.zeroize();
    }
}

/// Parameters an `UploadPart` call needs from the session before it can
/// encrypt the part body: a DEK clone (zeroized by the caller when done),
/// the base IV, this part's block offset, and the session's segment size
/// (every non-final part must equal this length exactly).
pub struct PartEncryptParams {
    pub dek: Dek,
    pub base_iv: BaseIv,
    pub block_offset: u64,
    pub segment_size: u64,
}

/// The validated, ready-to-finalize result of a `Complete` call: everything
/// [`crate::orchestrator`] needs to re-stream the assembled ciphertext
/// through a fresh HMAC and stamp final envelope metadata.
pub struct CompletionPlan {
    pub dek: Dek,
    pub encrypted_dek: Vec<u8>,
    pub key_fingerprint: String,
    pub base_iv: BaseIv,
    pub segment_size: u64,
    pub content_type: Option<String>,
    pub user_metadata: HashMap<String, String>,
    pub total_plaintext_len: u64,
    pub parts_count: u32,
}

#[derive(Debug, Clone)]
pub struct PartInfo {
    pub part_number: u32,
    pub etag: String,
    pub plaintext_bytes: u64,
}

/// Identifies a session the idle sweeper is about to abort, so the caller
/// can also abort the matching backend multipart upload.
pub struct ExpiredSession {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
}

/// Thread-safe store of in-flight multipart sessions. A per-map lock guards
/// insert/lookup/remove; a per-session lock serializes concurrent
/// `UploadPart` calls for the *same* `upload_id` (distinct upload IDs never
/// contend), per the concurrency model in SPEC_FULL.md §5.
pub struct MultipartSessionManager {
    sessions: RwLock<HashMap<String, Arc<Mutex<UploadSession>>>>,
}

impl Default for MultipartSessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartSessionManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// `Initiate`: allocate a session for `dek`/`base_iv`, already generated
    /// by the caller (the orchestrator). `upload_id` must be the ID the
    /// backend's own `CreateMultipartUpload` assigned — the session is keyed
    /// by it directly so later `UploadPart`/`Complete` calls from the client
    /// (which only ever see the backend's ID) resolve to this session.
    #[allow(clippy::too_many_arguments)]
    pub fn initiate(
        &self,
        upload_id: String,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        user_metadata: HashMap<String, String>,
        dek: Dek,
        encrypted_dek: Vec<u8>,
        key_fingerprint: String,
        base_iv: BaseIv,
        segment_size: u64,
    ) {
        let now = Utc::now();

        let session = UploadSession {
            upload_id: upload_id.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            content_type,
            user_metadata,
            dek,
            encrypted_dek,
            key_fingerprint,
            base_iv,
            segment_size,
            parts: HashMap::new(),
            state: SessionState::Accepting,
            created_at: now,
            touched_at: now,
        };

        self.sessions
            .write()
            .insert(upload_id, Arc::new(Mutex::new(session)));
    }

    fn get(&self, upload_id: &str) -> Result<Arc<Mutex<UploadSession>>, MultipartError> {
        self.sessions
            .read()
            .get(upload_id)
            .cloned()
            .ok_or_else(|| MultipartError::NoSuchUpload(upload_id.to_string()))
    }

    fn check_bucket_key(
        session: &UploadSession,
        bucket: &str,
        key: &str,
    ) -> Result<(), MultipartError> {
        if session.bucket != bucket || session.key != key {
            return Err(MultipartError::NoSuchUpload(session.upload_id.clone()));
        }
        Ok(())
    }

    /// `UploadPart(n, ...)` step one: fetch the crypto parameters for part
    /// `part_number`, computed from its position in the fixed-stride
    /// segment layout rather than upload order — see DESIGN.md.
    pub fn part_encrypt_params(
        &self,
        upload_id: &str,
        bucket: &str,
        key: &str,
        part_number: u32,
    ) -> Result<PartEncryptParams, MultipartError> {
        if !(1..=10000).contains(&part_number) {
            return Err(MultipartError::InvalidPartNumber);
        }
        let session = self.get(upload_id)?;
        let mut session = session.lock();
        Self::check_bucket_key(&session, bucket, key)?;
        if session.state != SessionState::Accepting {
            return Err(MultipartError::WrongState(session.state.label()));
        }
        session.touched_at = Utc::now();

        let stride_blocks = blocks_for(session.segment_size);
        let block_offset = stride_blocks * (part_number as u64 - 1);

        Ok(PartEncryptParams {
            dek: session.dek.clone(),
            base_iv: session.base_iv,
            block_offset,
            segment_size: session.segment_size,
        })
    }

    /// `UploadPart(n, ...)` step two: record the result once the part body
    /// has been encrypted and stored. Overwrites any prior record for the
    /// same part number (S3 overwrite semantics).
    pub fn record_part(
        &self,
        upload_id: &str,
        bucket: &str,
        key: &str,
        part_number: u32,
        etag: String,
        plaintext_bytes: u64,
        block_offset: u64,
    ) -> Result<(), MultipartError> {
        let session = self.get(upload_id)?;
        let mut session = session.lock();
        Self::check_bucket_key(&session, bucket, key)?;
        if session.state != SessionState::Accepting {
            return Err(MultipartError::WrongState(session.state.label()));
        }
        session.touched_at = Utc::now();
        session.parts.insert(
            part_number,
            PartRecord {
                etag,
                plaintext_bytes,
                block_offset,
            },
        );
        Ok(())
    }

    /// `Complete(submitted_parts)`: validate the client's part list against
    /// what was recorded, transition to `Completing`, and return everything
    /// needed to finalize. Does not itself talk to the backend or mutate
    /// terminal state — call [`Self::mark_completed`] or
    /// [`Self::abort`]/[`Self::mark_aborted`] once the caller knows the
    /// outcome.
    pub fn complete(
        &self,
        upload_id: &str,
        bucket: &str,
        key: &str,
        requested_parts: &[(u32, String)],
    ) -> Result<CompletionPlan, MultipartError> {
        if requested_parts.is_empty() {
            return Err(MultipartError::EmptyPartList);
        }

        let session = self.get(upload_id)?;
        let mut session = session.lock();
        Self::check_bucket_key(&session, bucket, key)?;
        if session.state != SessionState::Accepting {
            return Err(MultipartError::WrongState(session.state.label()));
        }

        let mut sorted = requested_parts.to_vec();
        sorted.sort_by_key(|(n, _)| *n);
        for window in sorted.windows(2) {
            if window[0].0 >= window[1].0 {
                return Err(MultipartError::InvalidPartOrder);
            }
        }

        let last_number = sorted.last().map(|(n, _)| *n).unwrap();
        let mut total_plaintext_len: u64 = 0;
        for (part_number, requested_etag) in &sorted {
            let record = session.parts.get(part_number).ok_or_else(|| {
                MultipartError::InvalidPart(format!("part {part_number} has not been uploaded"))
            })?;

            let requested_clean = requested_etag.trim_matches('"');
            if requested_clean != record.etag.trim_matches('"') {
                return Err(MultipartError::InvalidPart(format!(
                    "etag mismatch for part {part_number}"
                )));
            }

            if *part_number != last_number && record.plaintext_bytes != session.segment_size {
                return Err(MultipartError::InvalidPart(format!(
                    "part {part_number} is not the final part and must be exactly {} bytes",
                    session.segment_size
                )));
            }

            total_plaintext_len += record.plaintext_bytes;
        }

        session.state = SessionState::Completing;
        session.touched_at = Utc::now();

        Ok(CompletionPlan {
            dek: session.dek.clone(),
            encrypted_dek: session.encrypted_dek.clone(),
            key_fingerprint: session.key_fingerprint.clone(),
            base_iv: session.base_iv,
            segment_size: session.segment_size,
            content_type: session.content_type.clone(),
            user_metadata: session.user_metadata.clone(),
            total_plaintext_len,
            parts_count: sorted.len() as u32,
        })
    }

    /// Finalize a session after the backend assemble + metadata self-copy
    /// both succeeded. Removes the session, zeroizing its DEK on drop.
    pub fn mark_completed(&self, upload_id: &str) {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get(upload_id) {
            session.lock().state = SessionState::Completed;
        }
        sessions.remove(upload_id);
    }

    /// `Abort`: idempotent. A missing upload ID is treated as already
    /// aborted rather than an error.
    pub fn abort(&self, upload_id: &str, bucket: &str, key: &str) -> Result<(), MultipartError> {
        let removed = { self.sessions.write().remove(upload_id) };
        let Some(session) = removed else {
            return Ok(());
        };
        {
            let mut session = session.lock();
            Self::check_bucket_key(&session, bucket, key)?;
            session.state = SessionState::Aborted;
        }
        Ok(())
    }

    /// `ListParts`, ascending by part number.
    pub fn list_parts(
        &self,
        upload_id: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Vec<PartInfo>, MultipartError> {
        let session = self.get(upload_id)?;
        let session = session.lock();
        Self::check_bucket_key(&session, bucket, key)?;

        let mut parts: Vec<PartInfo> = session
            .parts
            .iter()
            .map(|(&part_number, record)| PartInfo {
                part_number,
                etag: record.etag.clone(),
                plaintext_bytes: record.plaintext_bytes,
            })
            .collect();
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    /// Number of sessions currently tracked (any state), for the
    /// `multipart_sessions_active` gauge.
    pub fn active_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Sweep sessions whose `touched_at` is older than `idle_ttl`, removing
    /// them (and zeroizing their DEKs) so only the map lock is held while
    /// collecting IDs — per-session cleanup and the backend abort call
    /// happen after this returns, in the caller.
    pub fn sweep_expired(&self, idle_ttl: StdDuration) -> Vec<ExpiredSession> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(idle_ttl).unwrap_or_else(|_| chrono::Duration::hours(1));

        let expired_ids: Vec<String> = {
            let sessions = self.sessions.read();
            sessions
                .iter()
                .filter(|(_, session)| {
                    let session = session.lock();
                    matches!(
                        session.state,
                        SessionState::Created | SessionState::Accepting | SessionState::Completing
                    ) && session.touched_at < cutoff
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut expired = Vec::with_capacity(expired_ids.len());
        let mut sessions = self.sessions.write();
        for id in expired_ids {
            if let Some(session) = sessions.remove(&id) {
                let mut session = session.lock();
                expired.push(ExpiredSession {
                    upload_id: session.upload_id.clone(),
                    bucket: session.bucket.clone(),
                    key: session.key.clone(),
                });
                session.state = SessionState::Aborted;
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_session(segment_size: u64) -> (MultipartSessionManager, String) {
        let manager = MultipartSessionManager::new();
        let upload_id = "upload-1".to_string();
        manager.initiate(
            upload_id.clone(),
            "bucket",
            "key.bin",
            None,
            HashMap::new(),
            vec![0x11; 32],
            vec![0xAA; 48],
            "fp-1".to_string(),
            BaseIv::from_bytes([0u8; 16]),
            segment_size,
        );
        (manager, upload_id)
    }

    #[test]
    fn part_offsets_are_order_independent() {
        let (manager, upload_id) = manager_with_session(64);
        let p3 = manager
            .part_encrypt_params(&upload_id, "bucket", "key.bin", 3)
            .unwrap();
        let p1 = manager
            .part_encrypt_params(&upload_id, "bucket", "key.bin", 1)
            .unwrap();
        assert_eq!(p1.block_offset, 0);
        assert_eq!(p3.block_offset, blocks_for(64) * 2);
    }

    #[test]
    fn rejects_out_of_range_part_number() {
        let (manager, upload_id) = manager_with_session(64);
        assert!(matches!(
            manager.part_encrypt_params(&upload_id, "bucket", "key.bin", 0),
            Err(MultipartError::InvalidPartNumber)
        ));
        assert!(matches!(
            manager.part_encrypt_params(&upload_id, "bucket", "key.bin", 10001),
            Err(MultipartError::InvalidPartNumber)
        ));
    }

    #[test]
    fn complete_validates_etag_and_order() {
        let (manager, upload_id) = manager_with_session(64);
        let p1 = manager
            .part_encrypt_params(&upload_id, "bucket", "key.bin", 1)
            .unwrap();
        manager
            .record_part(
                &upload_id,
                "bucket",
                "key.bin",
                1,
                "\"aaa\"".to_string(),
                64,
                p1.block_offset,
            )
            .unwrap();
        let p2 = manager
            .part_encrypt_params(&upload_id, "bucket", "key.bin", 2)
            .unwrap();
        manager
            .record_part(
                &upload_id,
                "bucket",
                "key.bin",
                2,
                "\"bbb\"".to_string(),
                10,
                p2.block_offset,
            )
            .unwrap();

        let err = manager
            .complete(
                &upload_id,
                "bucket",
                "key.bin",
                &[(1, "\"wrong\"".to_string()), (2, "\"bbb\"".to_string())],
            )
            .unwrap_err();
        assert!(matches!(err, MultipartError::InvalidPart(_)));

        let plan = manager
            .complete(
                &upload_id,
                "bucket",
                "key.bin",
                &[(1, "\"aaa\"".to_string()), (2, "\"bbb\"".to_string())],
            )
            .unwrap();
        assert_eq!(plan.total_plaintext_len, 74);
        assert_eq!(plan.parts_count, 2);
    }

    #[test]
    fn complete_rejects_non_final_short_part() {
        let (manager, upload_id) = manager_with_session(64);
        let p1 = manager
            .part_encrypt_params(&upload_id, "bucket", "key.bin", 1)
            .unwrap();
        manager
            .record_part(
                &upload_id,
                "bucket",
                "key.bin",
                1,
                "\"aaa\"".to_string(),
                10, // short, but not the final part
                p1.block_offset,
            )
            .unwrap();
        let p2 = manager
            .part_encrypt_params(&upload_id, "bucket", "key.bin", 2)
            .unwrap();
        manager
            .record_part(
                &upload_id,
                "bucket",
                "key.bin",
                2,
                "\"bbb\"".to_string(),
                10,
                p2.block_offset,
            )
            .unwrap();

        let err = manager
            .complete(
                &upload_id,
                "bucket",
                "key.bin",
                &[(1, "\"aaa\"".to_string()), (2, "\"bbb\"".to_string())],
            )
            .unwrap_err();
        assert!(matches!(err, MultipartError::InvalidPart(_)));
    }

    #[test]
    fn complete_rejects_duplicate_part_numbers() {
        let (manager, upload_id) = manager_with_session(64);
        let err = manager
            .complete(
                &upload_id,
                "bucket",
                "key.bin",
                &[(1, "\"a\"".to_string()), (1, "\"b\"".to_string())],
            )
            .unwrap_err();
        assert!(matches!(err, MultipartError::InvalidPartOrder));
    }

    #[test]
    fn complete_accepts_parts_submitted_out_of_order() {
        let (manager, upload_id) = manager_with_session(64);
        let p1 = manager
            .part_encrypt_params(&upload_id, "bucket", "key.bin", 1)
            .unwrap();
        manager
            .record_part(
                &upload_id,
                "bucket",
                "key.bin",
                1,
                "\"aaa\"".to_string(),
                64,
                p1.block_offset,
            )
            .unwrap();
        let p2 = manager
            .part_encrypt_params(&upload_id, "bucket", "key.bin", 2)
            .unwrap();
        manager
            .record_part(
                &upload_id,
                "bucket",
                "key.bin",
                2,
                "\"bbb\"".to_string(),
                10,
                p2.block_offset,
            )
            .unwrap();

        // Client lists parts in descending order; Complete sorts internally.
        let plan = manager
            .complete(
                &upload_id,
                "bucket",
                "key.bin",
                &[(2, "\"bbb\"".to_string()), (1, "\"aaa\"".to_string())],
            )
            .unwrap();
        assert_eq!(plan.total_plaintext_len, 74);
    }

    #[test]
    fn abort_is_idempotent() {
        let (manager, upload_id) = manager_with_session(64);
        manager.abort(&upload_id, "bucket", "key.bin").unwrap();
        manager.abort(&upload_id, "bucket", "key.bin").unwrap();
    }

    #[test]
    fn unknown_upload_is_not_found() {
        let manager = MultipartSessionManager::new();
        assert!(matches!(
            manager.part_encrypt_params("nope", "bucket", "key.bin", 1),
            Err(MultipartError::NoSuchUpload(_))
        ));
    }

    #[test]
    fn list_parts_sorted_ascending() {
        let (manager, upload_id) = manager_with_session(64);
        for n in [3u32, 1, 2] {
            let p = manager
                .part_encrypt_params(&upload_id, "bucket", "key.bin", n)
                .unwrap();
            manager
                .record_part(
                    &upload_id,
                    "bucket",
                    "key.bin",
                    n,
                    format!("\"etag-{n}\""),
                    64,
                    p.block_offset,
                )
                .unwrap();
        }
        let parts = manager.list_parts(&upload_id, "bucket", "key.bin").unwrap();
        let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn sweep_expired_removes_idle_sessions() {
        let (manager, upload_id) = manager_with_session(64);
        let expired = manager.sweep_expired(StdDuration::from_secs(0));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].upload_id, upload_id);
        assert!(manager.part_encrypt_params(&upload_id, "bucket", "key.bin", 1).is_err());
    }
}
