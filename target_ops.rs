//! Encryption of whole erase targets.
//!
//! This module provides [`TargetEncryptor`], which drives a [`CipherSession`]
//! over one of the two supported target shapes:
//!
//! - **File**: streamed into `<path><temp_suffix>` with PKCS#7 padding, synced,
//!   then renamed over the original. On any failure the temporary file is
//!   removed and the original is left as it was.
//! - **Block device**: read, encrypted and written back in place, chunk by
//!   chunk, without padding, so the device keeps its exact extent. A failure
//!   part way leaves the device partially encrypted.
//!
//! ## State machine
//!
//! ```text
//! Idle -> SessionOpened -> Streaming -> Finalizing -> CompletedFile | CompletedDevice
//!   \__________________________\______________\______-> Failed
//! ```
//!
//! An encryptor runs once; nothing is retried.

use crate::config::Config;
use crate::error::{EtdkError, Result};
use crate::key_manager::KeyMaterial;
use crate::platform::TargetKind;
use crate::streaming::{output_capacity, CipherSession, BLOCK_SIZE};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// A classified erase target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionTarget {
    /// Regular file, processed until end of stream
    File { path: PathBuf },
    /// Raw block device with its size queried up front
    BlockDevice { path: PathBuf, size: u64 },
}

impl EncryptionTarget {
    pub fn path(&self) -> &Path {
        match self {
            EncryptionTarget::File { path } | EncryptionTarget::BlockDevice { path, .. } => path,
        }
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            EncryptionTarget::File { .. } => TargetKind::File,
            EncryptionTarget::BlockDevice { .. } => TargetKind::BlockDevice,
        }
    }

    /// Known size, `None` for files.
    pub fn size(&self) -> Option<u64> {
        match self {
            EncryptionTarget::File { .. } => None,
            EncryptionTarget::BlockDevice { size, .. } => Some(*size),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptorState {
    Idle,
    SessionOpened,
    Streaming,
    Finalizing,
    CompletedFile,
    CompletedDevice,
    Failed,
}

/// Progress after a processed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub processed: u64,
    pub total: Option<u64>,
}

impl Progress {
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some(self.processed as f64 / total as f64),
            None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionOutcome {
    pub kind: TargetKind,
    /// Plaintext bytes read from the target
    pub bytes_processed: u64,
    /// Ciphertext bytes written back
    pub bytes_written: u64,
}

pub struct TargetEncryptor {
    file_chunk_size: usize,
    device_chunk_size: usize,
    temp_suffix: String,
    state: EncryptorState,
}

impl TargetEncryptor {
    pub fn new(config: &Config) -> Self {
        Self {
            file_chunk_size: config.file_chunk_size,
            device_chunk_size: config.device_chunk_size,
            temp_suffix: config.temp_suffix.clone(),
            state: EncryptorState::Idle,
        }
    }

    pub fn state(&self) -> EncryptorState {
        self.state
    }

    /// Encrypt `target` with `key`, reporting progress after every chunk.
    pub fn encrypt<F>(
        &mut self,
        target: &EncryptionTarget,
        key: &KeyMaterial,
        mut progress: F,
    ) -> Result<EncryptionOutcome>
    where
        F: FnMut(Progress),
    {
        self.begin()?;
        info!(path = %target.path().display(), kind = target.kind().label(), "encrypting target");

        let result = match target {
            EncryptionTarget::File { path } => self.file_pass(path, key, &mut progress),
            EncryptionTarget::BlockDevice { path, size } => {
                self.device_pass(path, *size, key, &mut progress)
            }
        };
        self.conclude(result, target.kind())
    }

    /// Encrypt everything `reader` yields into `writer`, padded. This is the
    /// file pipeline without the replace step.
    pub fn encrypt_stream<R, W, F>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        key: &KeyMaterial,
        mut progress: F,
    ) -> Result<EncryptionOutcome>
    where
        R: Read,
        W: Write,
        F: FnMut(Progress),
    {
        self.begin()?;
        let result = self.padded_pass(reader, writer, key, &mut progress);
        self.conclude(result, TargetKind::File)
    }

    /// Encrypt the first `size` bytes of `device` in place, unpadded. This is
    /// the device pipeline over any seekable handle.
    pub fn encrypt_in_place<D, F>(
        &mut self,
        device: &mut D,
        size: u64,
        key: &KeyMaterial,
        mut progress: F,
    ) -> Result<EncryptionOutcome>
    where
        D: Read + Write + Seek,
        F: FnMut(Progress),
    {
        self.begin()?;
        let result = self.raw_pass(device, size, key, &mut progress);
        self.conclude(result, TargetKind::BlockDevice)
    }

    fn begin(&mut self) -> Result<()> {
        if self.state != EncryptorState::Idle {
            return Err(EtdkError::invalid_input(format!(
                "target encryptor already used (state {:?})",
                self.state
            )));
        }
        Ok(())
    }

    fn transition(&mut self, next: EncryptorState) {
        debug!(from = ?self.state, to = ?next, "encryptor state");
        self.state = next;
    }

    fn conclude(
        &mut self,
        result: Result<EncryptionOutcome>,
        kind: TargetKind,
    ) -> Result<EncryptionOutcome> {
        match result {
            Ok(outcome) => {
                let done = match kind {
                    TargetKind::File => EncryptorState::CompletedFile,
                    TargetKind::BlockDevice => EncryptorState::CompletedDevice,
                };
                self.transition(done);
                info!(
                    processed = outcome.bytes_processed,
                    written = outcome.bytes_written,
                    "target encrypted"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.transition(EncryptorState::Failed);
                error!(error = %e, "target encryption failed");
                Err(e)
            }
        }
    }

    fn file_pass(
        &mut self,
        path: &Path,
        key: &KeyMaterial,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<EncryptionOutcome> {
        let temp_path = temp_path_for(path, &self.temp_suffix);

        let mut input = File::open(path)
            .map_err(|e| EtdkError::io(format!("opening {}: {}", path.display(), e)))?;
        let mut output = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .map_err(|e| EtdkError::io(format!("creating {}: {}", temp_path.display(), e)))?;
        let temp = TempFile::new(temp_path);

        let outcome = self
            .padded_pass(&mut input, &mut output, key, progress)
            .and_then(|outcome| {
                let permissions = input
                    .metadata()
                    .map_err(|e| EtdkError::io(format!("stat {}: {}", path.display(), e)))?
                    .permissions();
                output.set_permissions(permissions).map_err(|e| {
                    EtdkError::io(format!("chmod {}: {}", temp.path().display(), e))
                })?;
                output.sync_all().map_err(|e| {
                    EtdkError::io(format!("syncing {}: {}", temp.path().display(), e))
                })?;
                Ok(outcome)
            });

        // Handles are closed before the temporary file is removed or renamed.
        drop(output);
        drop(input);

        let outcome = outcome?;
        replace_original(temp, path)?;
        Ok(outcome)
    }

    fn device_pass(
        &mut self,
        path: &Path,
        size: u64,
        key: &KeyMaterial,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<EncryptionOutcome> {
        let mut device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| EtdkError::io(format!("opening device {}: {}", path.display(), e)))?;

        let outcome = self.raw_pass(&mut device, size, key, progress)?;
        device
            .sync_all()
            .map_err(|e| EtdkError::io(format!("syncing device {}: {}", path.display(), e)))?;
        Ok(outcome)
    }

    fn padded_pass<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        key: &KeyMaterial,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<EncryptionOutcome>
    where
        R: Read,
        W: Write,
    {
        let mut session = CipherSession::open(key)?;
        self.transition(EncryptorState::SessionOpened);

        let mut plain = Zeroizing::new(vec![0u8; self.file_chunk_size]);
        let mut cipher = vec![0u8; output_capacity(self.file_chunk_size)];
        let mut processed = 0u64;
        let mut written = 0u64;

        self.transition(EncryptorState::Streaming);
        loop {
            let n = read_chunk(reader, &mut plain)
                .map_err(|e| EtdkError::io(format!("reading input at offset {}: {}", processed, e)))?;
            if n == 0 {
                break;
            }

            let m = session.update(&plain[..n], &mut cipher)?;
            writer
                .write_all(&cipher[..m])
                .map_err(|e| EtdkError::io(format!("writing ciphertext: {}", e)))?;

            processed += n as u64;
            written += m as u64;
            progress(Progress {
                processed,
                total: None,
            });
        }

        self.transition(EncryptorState::Finalizing);
        let last = session.finalize_with_padding()?;
        writer
            .write_all(&last)
            .and_then(|_| writer.flush())
            .map_err(|e| EtdkError::io(format!("writing final block: {}", e)))?;
        written += last.len() as u64;

        Ok(EncryptionOutcome {
            kind: TargetKind::File,
            bytes_processed: processed,
            bytes_written: written,
        })
    }

    fn raw_pass<D>(
        &mut self,
        device: &mut D,
        size: u64,
        key: &KeyMaterial,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<EncryptionOutcome>
    where
        D: Read + Write + Seek,
    {
        let chunk = self.device_chunk_size;
        if chunk == 0 || chunk % BLOCK_SIZE != 0 {
            return Err(EtdkError::invalid_input(format!(
                "device chunk size {} is not a multiple of {}",
                chunk, BLOCK_SIZE
            )));
        }

        let mut session = CipherSession::open(key)?;
        self.transition(EncryptorState::SessionOpened);

        let mut plain = Zeroizing::new(vec![0u8; chunk]);
        let mut cipher = vec![0u8; output_capacity(chunk)];
        let mut offset = 0u64;
        let mut written = 0u64;

        device
            .seek(SeekFrom::Start(0))
            .map_err(|e| EtdkError::io(format!("seeking to device start: {}", e)))?;

        self.transition(EncryptorState::Streaming);
        while offset < size {
            let want = (size - offset).min(chunk as u64) as usize;
            device.read_exact(&mut plain[..want]).map_err(|e| {
                EtdkError::io(format!("reading {} bytes at offset {}: {}", want, offset, e))
            })?;

            // Every chunk but the last is block aligned, so only the final
            // chunk can leave a carried tail behind.
            let m = session.update(&plain[..want], &mut cipher)?;

            device
                .seek(SeekFrom::Start(offset))
                .map_err(|e| EtdkError::io(format!("seeking back to offset {}: {}", offset, e)))?;
            device
                .write_all(&cipher[..m])
                .and_then(|_| device.flush())
                .map_err(|e| EtdkError::io(format!("writing back at offset {}: {}", offset, e)))?;

            offset += want as u64;
            written += m as u64;
            progress(Progress {
                processed: offset,
                total: Some(size),
            });
        }

        self.transition(EncryptorState::Finalizing);
        let tail = session.finalize_raw()?;
        if !tail.is_empty() {
            let at = offset - tail.len() as u64;
            device
                .seek(SeekFrom::Start(at))
                .and_then(|_| device.write_all(&tail))
                .and_then(|_| device.flush())
                .map_err(|e| EtdkError::io(format!("writing final partial block at {}: {}", at, e)))?;
            written += tail.len() as u64;
            debug!(tail = tail.len(), "encrypted unaligned device tail");
        }

        Ok(EncryptionOutcome {
            kind: TargetKind::BlockDevice,
            bytes_processed: offset,
            bytes_written: written,
        })
    }
}

/// `<path><suffix>`, next to the original.
pub fn temp_path_for(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Fill `buf` from `reader`, stopping early only at end of stream.
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Encrypted temporary file, removed on drop unless it was renamed into place.
struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed temporary file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "could not remove temporary file"),
        }
    }
}

/// Rename the encrypted temporary file over `original`. The rename replaces
/// the destination in one step, so a failure leaves the original untouched
/// and the temporary file is cleaned up.
fn replace_original(mut temp: TempFile, original: &Path) -> Result<()> {
    fs::rename(temp.path(), original).map_err(|e| {
        EtdkError::io(format!(
            "replacing {} with {}: {}",
            original.display(),
            temp.path().display(),
            e
        ))
    })?;
    temp.armed = false;
    debug!(path = %original.display(), "original replaced with ciphertext");
    Ok(())
}
