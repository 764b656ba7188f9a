//! The encrypt-then-destroy-key pipeline.
//!
//! [`Eraser::run`] is the single call a front end needs: it generates the
//! session key, keeps it out of swap where the OS allows, encrypts the target,
//! shows the key once and destroys it. Destruction is attempted exactly once
//! on every path, whether encryption succeeded or not.

use crate::config::Config;
use crate::error::{EtdkError, Result};
use crate::key_manager::KeyMaterial;
use crate::platform::{Platform, TargetKind};
use crate::target_ops::{EncryptionOutcome, EncryptionTarget, Progress, TargetEncryptor};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

/// Receives the key material for its one-time display.
pub trait KeyPresenter {
    fn present(&mut self, key: &mut KeyMaterial) -> Result<()>;
}

/// Prints the key to stdout and pauses.
#[derive(Debug, Clone, Copy)]
pub struct ConsolePresenter {
    pause: Duration,
}

impl ConsolePresenter {
    pub fn new(pause: Duration) -> Self {
        Self { pause }
    }
}

impl KeyPresenter for ConsolePresenter {
    fn present(&mut self, key: &mut KeyMaterial) -> Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        key.display(&mut out, self.pause)
    }
}

pub type EraseReport = EncryptionOutcome;

pub struct Eraser<'p, P: Platform + ?Sized> {
    platform: &'p P,
    config: Config,
}

impl<'p, P: Platform + ?Sized> Eraser<'p, P> {
    pub fn new(platform: &'p P, config: Config) -> Self {
        Self { platform, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolve `path`, classify it and, for devices, query the size up front.
    ///
    /// Symbolic links are followed so the file or device they name is the one
    /// encrypted, not the link.
    pub fn target(&self, path: &Path) -> Result<EncryptionTarget> {
        if path.as_os_str().is_empty() {
            return Err(EtdkError::invalid_input("target path is empty"));
        }

        let resolved = resolve_target(path)?;
        let path = resolved.as_path();
        match self.platform.classify_target(path)? {
            TargetKind::File => Ok(EncryptionTarget::File {
                path: path.to_path_buf(),
            }),
            TargetKind::BlockDevice => {
                let size = self.platform.query_target_size(path)?;
                info!(path = %path.display(), size, "block device target");
                Ok(EncryptionTarget::BlockDevice {
                    path: path.to_path_buf(),
                    size,
                })
            }
        }
    }

    /// Encrypt `target`, present the key, destroy the key.
    ///
    /// The key is only presented when encryption succeeded. An encryption
    /// error takes precedence over a destruction error; a destruction error
    /// after successful encryption fails the run.
    pub fn run<K, F>(
        &self,
        target: &EncryptionTarget,
        presenter: &mut K,
        progress: F,
    ) -> Result<EraseReport>
    where
        K: KeyPresenter + ?Sized,
        F: FnMut(Progress),
    {
        let mut key = KeyMaterial::generate()?;
        self.run_with_key(target, &mut key, presenter, progress)
    }

    pub(crate) fn run_with_key<K, F>(
        &self,
        target: &EncryptionTarget,
        key: &mut KeyMaterial,
        presenter: &mut K,
        progress: F,
    ) -> Result<EraseReport>
    where
        K: KeyPresenter + ?Sized,
        F: FnMut(Progress),
    {
        let locked = match self.platform.lock_memory(key.memory_region()) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "could not lock key material in memory, continuing");
                false
            }
        };

        let result = self.encrypt_and_present(target, key, presenter, progress);

        let destroyed = key.destroy();
        if let Err(ref e) = destroyed {
            error!(error = %e, "key destruction reported a failure");
        }

        if locked {
            if let Err(e) = self.platform.unlock_memory(key.memory_region()) {
                warn!(error = %e, "could not unlock key material region");
            }
        }

        let report = result?;
        destroyed?;
        info!(path = %target.path().display(), "key material destroyed, target unrecoverable");
        Ok(report)
    }

    fn encrypt_and_present<K, F>(
        &self,
        target: &EncryptionTarget,
        key: &mut KeyMaterial,
        presenter: &mut K,
        progress: F,
    ) -> Result<EraseReport>
    where
        K: KeyPresenter + ?Sized,
        F: FnMut(Progress),
    {
        let mut encryptor = TargetEncryptor::new(&self.config);
        let report = encryptor.encrypt(target, key, progress)?;
        presenter.present(key)?;
        Ok(report)
    }
}

/// Physical location of `path`. Windows raw disk names are not filesystem
/// paths and are passed through unchanged.
fn resolve_target(path: &Path) -> Result<PathBuf> {
    if cfg!(windows) && path.to_string_lossy().starts_with(r"\\.\") {
        return Ok(path.to_path_buf());
    }
    fs::canonicalize(path)
        .map_err(|e| EtdkError::platform(format!("cannot access {}: {}", path.display(), e)))
}
