//! Chunked file download and upload.
//!
//! ## Download
//! [`Client::iter_download`] fetches 1 MiB chunks in order from the file's
//! DC. When the server redirects to a CDN, the iterator opens a temporary
//! CDN session, decrypts every chunk with AES-256-CTR and checks it against
//! the SHA-256 hashes the origin DC publishes for each range. Unverified
//! bytes are never returned.
//!
//! ## Upload
//! [`Client::upload`] splits the data into 512 KiB parts and sends them
//! concurrently, bounded by the client-wide upload permits. The resulting
//! [`UploadedFile`] goes into the caller's finalizing request through
//! [`Client::finalize_upload`], which re-sends a single part if the server
//! reports it missing.

use std::ops::ControlFlow;
use std::sync::Arc;

use ferrogram_crypto::{aes, random_array};
use ferrogram_tl::functions::upload;
use ferrogram_tl::{Blob, RemoteCall, enums, types};
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;

use crate::blocking::CryptoPool;
use crate::errors::InvocationError;
use crate::pool::{Mode, SessionPool};
use crate::session::Session;
use crate::Client;

/// Bytes requested per `upload.getFile` / `upload.getCdnFile`.
pub const DOWNLOAD_CHUNK_SIZE: i32 = 1024 * 1024;
/// Bytes per uploaded part.
pub const UPLOAD_PART_SIZE: usize = 512 * 1024;
/// Files larger than this are uploaded with `upload.saveBigFilePart`.
pub const BIG_FILE_THRESHOLD: usize = 10 * 1024 * 1024;
/// `FILE_PART_X_MISSING` answers tolerated by [`Client::finalize_upload`].
const FINALIZE_ATTEMPTS: u32 = 3;

/// Where a file lives: its DC and a serialized, boxed `InputFileLocation`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileLocation {
    pub dc_id: i32,
    pub location: Vec<u8>,
}

/// How a transfer with a progress callback ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferOutcome<T> {
    Complete(T),
    /// The progress callback asked to stop.
    Stopped,
}

// ─── Download ────────────────────────────────────────────────────────────────

struct CdnState {
    session: Session,
    dc_id: i32,
    file_token: Vec<u8>,
    key: [u8; 32],
    iv: [u8; 16],
    hashes: Vec<types::FileHash>,
    /// Decrypted bytes of a hash range the last chunk only partly covered.
    carry: Vec<u8>,
}

impl CdnState {
    fn add_hashes(&mut self, hashes: Vec<types::FileHash>) {
        for hash in hashes {
            if !self.hashes.iter().any(|h| h.offset == hash.offset) {
                self.hashes.push(hash);
            }
        }
    }

    fn hash_at(&self, offset: i64) -> Option<&types::FileHash> {
        self.hashes.iter().find(|h| h.offset == offset)
    }
}

/// Downloads a file chunk by chunk.
///
/// Call [`DownloadIter::next`] until it returns `None`. After an error the
/// iterator is finished.
pub struct DownloadIter {
    pool: Arc<SessionPool>,
    permits: Arc<Semaphore>,
    location: FileLocation,
    /// Bytes handed out.
    offset: i64,
    /// Bytes received from the network; ahead of `offset` while CDN bytes
    /// wait for the rest of their hash range.
    fetched: i64,
    size_hint: Option<u64>,
    done: bool,
    cdn: Option<CdnState>,
}

impl DownloadIter {
    /// Bytes handed out so far.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Fetch the next chunk. Returns `None` once the file is complete.
    pub async fn next(&mut self) -> Result<Option<Vec<u8>>, InvocationError> {
        let permits = Arc::clone(&self.permits);
        while !self.done {
            let _permit = permits.acquire().await.map_err(|_| InvocationError::SessionClosed)?;
            let fetched = match self.cdn.is_some() {
                false => self.fetch_origin().await,
                true => self.fetch_cdn().await,
            };
            let (chunk, received) = match fetched {
                Ok(fetched) => fetched,
                Err(e) => {
                    self.done = true;
                    return Err(e);
                }
            };

            self.fetched += received as i64;
            self.offset += chunk.len() as i64;
            if received < DOWNLOAD_CHUNK_SIZE as usize || self.reached_size_hint(self.fetched) {
                self.done = true;
            }
            tracing::debug!("[ferrogram] downloaded {} bytes, offset now {}", chunk.len(), self.offset);
            if !chunk.is_empty() {
                return Ok(Some(chunk));
            }
        }
        Ok(None)
    }

    fn reached_size_hint(&self, offset: i64) -> bool {
        self.size_hint.is_some_and(|size| offset as u64 >= size)
    }

    /// Returns the bytes to hand out and the number received.
    async fn fetch_origin(&mut self) -> Result<(Vec<u8>, usize), InvocationError> {
        let request = upload::GetFile {
            precise: false,
            cdn_supported: true,
            location: Blob(self.location.location.clone()),
            offset: self.fetched,
            limit: DOWNLOAD_CHUNK_SIZE,
        };
        match self.pool.invoke_on(self.location.dc_id, Mode::Media, &request).await? {
            enums::upload::File::File(file) => {
                let received = file.bytes.len();
                Ok((file.bytes, received))
            }
            enums::upload::File::CdnRedirect(redirect) => {
                tracing::info!("[ferrogram] file redirected to CDN DC{}", redirect.dc_id);
                self.cdn = Some(self.open_cdn(redirect).await?);
                self.fetch_cdn().await
            }
        }
    }

    async fn open_cdn(&self, redirect: types::upload::FileCdnRedirect) -> Result<CdnState, InvocationError> {
        let key: [u8; 32] = redirect
            .encryption_key
            .as_slice()
            .try_into()
            .map_err(|_| InvocationError::Security("CDN encryption key is not 32 bytes".into()))?;
        let iv: [u8; 16] = redirect
            .encryption_iv
            .as_slice()
            .try_into()
            .map_err(|_| InvocationError::Security("CDN encryption iv is not 16 bytes".into()))?;
        let session = self.pool.get_session(redirect.dc_id, Mode::Cdn).await?;
        let mut state = CdnState {
            session,
            dc_id: redirect.dc_id,
            file_token: redirect.file_token,
            key,
            iv,
            hashes: Vec::new(),
            carry: Vec::new(),
        };
        state.add_hashes(redirect.file_hashes);
        Ok(state)
    }

    /// Returns the verified bytes and the number received. A hash range
    /// that runs past a full chunk is held back until the next one.
    async fn fetch_cdn(&mut self) -> Result<(Vec<u8>, usize), InvocationError> {
        let origin = self.location.dc_id;
        let fetched = self.fetched;
        let size_hint = self.size_hint;
        let Some(cdn) = self.cdn.as_mut() else {
            return Err(InvocationError::Config("no CDN session".into()));
        };

        let bytes = loop {
            let request =
                upload::GetCdnFile { file_token: cdn.file_token.clone(), offset: fetched, limit: DOWNLOAD_CHUNK_SIZE };
            match cdn.session.invoke(&request).await? {
                enums::upload::CdnFile::File(file) => break file.bytes,
                enums::upload::CdnFile::ReuploadNeeded(needed) => {
                    tracing::info!("[ferrogram] CDN DC{} needs a reupload at offset {fetched}", cdn.dc_id);
                    let reupload = upload::ReuploadCdnFile {
                        file_token: cdn.file_token.clone(),
                        request_token: needed.request_token,
                    };
                    let hashes = self.pool.invoke_on(origin, Mode::Media, &reupload).await?;
                    cdn.add_hashes(hashes);
                }
            }
        };
        let received = bytes.len();
        let end = fetched + received as i64;
        let last = received < DOWNLOAD_CHUNK_SIZE as usize || size_hint.is_some_and(|size| end as u64 >= size);

        // Collect the ranges this chunk completes.
        let start = fetched - cdn.carry.len() as i64;
        let mut ranges = Vec::new();
        let mut at = start;
        while at < end {
            if cdn.hash_at(at).is_none() {
                let request = upload::GetCdnFileHashes { file_token: cdn.file_token.clone(), offset: at };
                let hashes = self.pool.invoke_on(origin, Mode::Media, &request).await?;
                cdn.add_hashes(hashes);
            }
            let Some(hash) = cdn.hash_at(at) else {
                return Err(InvocationError::CdnHashMismatch { offset: at });
            };
            if hash.limit <= 0 {
                return Err(InvocationError::CdnHashMismatch { offset: at });
            }
            if at + hash.limit as i64 > end && !last {
                break;
            }
            ranges.push(hash.clone());
            at += hash.limit as i64;
        }

        let chunk = CdnChunk { bytes, offset: fetched, carry: std::mem::take(&mut cdn.carry), ranges };
        let (verified, carry) = decrypt_and_verify(self.pool.crypto(), chunk, cdn.key, cdn.iv).await?;
        cdn.carry = carry;
        Ok((verified, received))
    }
}

/// The CTR iv for a chunk: the redirect iv with its last four bytes set to
/// `offset / 16`, big endian.
fn cdn_iv(iv: &[u8; 16], offset: i64) -> [u8; 16] {
    let mut out = *iv;
    out[12..].copy_from_slice(&((offset / 16) as u32).to_be_bytes());
    out
}

/// Encrypted CDN bytes received at `offset`, the decrypted bytes held back
/// before them, and the ranges to check.
struct CdnChunk {
    bytes: Vec<u8>,
    offset: i64,
    carry: Vec<u8>,
    ranges: Vec<types::FileHash>,
}

/// Decrypt a chunk and check every range in it. Returns the verified bytes
/// and whatever follows the last checked range.
async fn decrypt_and_verify(
    crypto: &CryptoPool,
    chunk: CdnChunk,
    key: [u8; 32],
    iv: [u8; 16],
) -> Result<(Vec<u8>, Vec<u8>), InvocationError> {
    crypto
        .run(move || {
            let CdnChunk { mut bytes, offset, carry, ranges } = chunk;
            aes::ctr_apply(&mut bytes, &key, &cdn_iv(&iv, offset));
            let start = offset - carry.len() as i64;
            let mut plain = carry;
            plain.extend_from_slice(&bytes);

            let mut verified = 0;
            for range in &ranges {
                let from = (range.offset - start) as usize;
                let to = (from + range.limit as usize).min(plain.len());
                let digest: [u8; 32] = Sha256::digest(&plain[from..to]).into();
                if digest.as_slice() != range.hash.as_slice() {
                    tracing::error!("[ferrogram] CDN chunk at {} failed verification", range.offset);
                    return Err(InvocationError::CdnHashMismatch { offset: range.offset });
                }
                verified = to;
            }
            let rest = plain.split_off(verified);
            Ok((plain, rest))
        })
        .await?
}

// ─── Upload ──────────────────────────────────────────────────────────────────

/// A file whose parts are all on the server, ready for a finalizing request.
#[derive(Clone, Debug)]
pub struct UploadedFile {
    pub id: i64,
    pub parts: i32,
    pub big: bool,
    pub name: String,
    data: Arc<Vec<u8>>,
}

impl UploadedFile {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The `InputFile` to put in the finalizing request.
    pub fn input_file(&self) -> enums::InputFile {
        if self.big {
            enums::InputFile::Big(types::InputFileBig { id: self.id, parts: self.parts, name: self.name.clone() })
        } else {
            enums::InputFile::File(types::InputFile {
                id: self.id,
                parts: self.parts,
                name: self.name.clone(),
                md5_checksum: String::new(),
            })
        }
    }
}

async fn send_part(
    pool: &SessionPool,
    file_id: i64,
    part: i32,
    total_parts: i32,
    big: bool,
    data: &[u8],
) -> Result<(), InvocationError> {
    let start = part as usize * UPLOAD_PART_SIZE;
    let bytes = data[start..(start + UPLOAD_PART_SIZE).min(data.len())].to_vec();
    let home = pool.home_dc_id()?;
    let saved = if big {
        let request = upload::SaveBigFilePart { file_id, file_part: part, file_total_parts: total_parts, bytes };
        pool.invoke_on(home, Mode::Media, &request).await?
    } else {
        let request = upload::SaveFilePart { file_id, file_part: part, bytes };
        pool.invoke_on(home, Mode::Media, &request).await?
    };
    if !saved {
        return Err(InvocationError::Io(std::io::Error::other(format!("server refused part {part}"))));
    }
    Ok(())
}

// ─── Client methods ──────────────────────────────────────────────────────────

impl Client {
    /// Download `location` chunk by chunk. `size_hint`, when known, stops
    /// the download without an extra empty request.
    pub fn iter_download(&self, location: FileLocation, size_hint: Option<u64>) -> DownloadIter {
        DownloadIter {
            pool: Arc::clone(&self.inner.pool),
            permits: Arc::clone(&self.inner.downloads),
            location,
            offset: 0,
            fetched: 0,
            size_hint,
            done: false,
            cdn: None,
        }
    }

    /// [`Client::iter_download`] as a [`Stream`] of chunks.
    pub fn stream_download(
        &self,
        location: FileLocation,
        size_hint: Option<u64>,
    ) -> impl Stream<Item = Result<Vec<u8>, InvocationError>> + Send + 'static {
        futures::stream::try_unfold(self.iter_download(location, size_hint), |mut iter| async move {
            Ok(iter.next().await?.map(|chunk| (chunk, iter)))
        })
    }

    /// Download a whole file. `progress(downloaded, size_hint)` runs after
    /// every chunk; returning `Break` stops the download.
    pub async fn download(
        &self,
        location: FileLocation,
        size_hint: Option<u64>,
        mut progress: impl FnMut(u64, Option<u64>) -> ControlFlow<()>,
    ) -> Result<TransferOutcome<Vec<u8>>, InvocationError> {
        let mut iter = self.iter_download(location, size_hint);
        let mut out = Vec::with_capacity(size_hint.unwrap_or(0).min(64 * 1024 * 1024) as usize);
        while let Some(chunk) = iter.next().await? {
            out.extend_from_slice(&chunk);
            if progress(out.len() as u64, size_hint).is_break() {
                tracing::info!("[ferrogram] download stopped at {} bytes", out.len());
                return Ok(TransferOutcome::Stopped);
            }
        }
        Ok(TransferOutcome::Complete(out))
    }

    /// Upload `data` as `name`. `progress(uploaded, total)` runs after every
    /// part; returning `Break` stops the upload.
    pub async fn upload(
        &self,
        data: Vec<u8>,
        name: &str,
        mut progress: impl FnMut(u64, u64) -> ControlFlow<()>,
    ) -> Result<TransferOutcome<UploadedFile>, InvocationError> {
        if data.is_empty() {
            return Err(InvocationError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "cannot upload an empty file",
            )));
        }
        let file_id = random_array::<8>()
            .map(i64::from_le_bytes)
            .map_err(|e| InvocationError::Io(std::io::Error::other(e)))?;
        let total = data.len();
        let parts = total.div_ceil(UPLOAD_PART_SIZE) as i32;
        let big = total > BIG_FILE_THRESHOLD;
        let data = Arc::new(data);

        let pool = &self.inner.pool;
        let permits = &self.inner.uploads;
        let mut inflight: FuturesUnordered<_> = (0..parts)
            .map(|part| {
                let data = Arc::clone(&data);
                async move {
                    let _permit = permits.acquire().await.map_err(|_| InvocationError::SessionClosed)?;
                    send_part(pool, file_id, part, parts, big, &data).await?;
                    let start = part as usize * UPLOAD_PART_SIZE;
                    Ok::<_, InvocationError>((start + UPLOAD_PART_SIZE).min(data.len()) - start)
                }
            })
            .collect();

        let mut uploaded = 0u64;
        while let Some(result) = inflight.next().await {
            uploaded += result? as u64;
            if progress(uploaded, total as u64).is_break() {
                tracing::info!("[ferrogram] upload of '{name}' stopped at {uploaded} bytes");
                return Ok(TransferOutcome::Stopped);
            }
        }
        drop(inflight);

        tracing::info!("[ferrogram] '{name}' uploaded ({total} bytes, {parts} parts, big: {big})");
        Ok(TransferOutcome::Complete(UploadedFile { id: file_id, parts, big, name: name.to_string(), data }))
    }

    /// Send the request that consumes an upload. When the server answers
    /// `FILE_PART_X_MISSING`, only part X is sent again before retrying.
    pub async fn finalize_upload<R, F>(&self, file: &UploadedFile, build: F) -> Result<R::Return, InvocationError>
    where
        R: RemoteCall,
        F: Fn(enums::InputFile) -> R,
    {
        let pool = &self.inner.pool;
        let mut attempt = 0;
        loop {
            let error = match pool.invoke(&build(file.input_file())).await {
                Ok(answer) => return Ok(answer),
                Err(e) => e,
            };
            let missing = match &error {
                InvocationError::Rpc(rpc) if rpc.is("FILE_PART_MISSING") => rpc.value,
                _ => None,
            };
            let Some(part) = missing else { return Err(error) };
            attempt += 1;
            if attempt > FINALIZE_ATTEMPTS || part as i32 >= file.parts {
                return Err(error);
            }
            tracing::warn!("[ferrogram] server lost part {part} of '{}', sending it again", file.name);
            send_part(pool, file.id, part as i32, file.parts, file.big, &file.data).await?;
        }
    }
}
