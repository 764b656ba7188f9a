//! Session key generation, one-time display and destruction.
//!
//! This module provides [`KeyMaterial`], the AES-256 key and CBC IV owned by a
//! single erase session.
//!
//! ## Security Features
//!
//! - Key and IV come from the operating system CSPRNG via `OsRng`
//! - The type is move-only: no `Clone`, no `Copy`, `Debug` is redacted
//! - Bytes live in one heap allocation so the region can be locked against swap
//! - [`KeyMaterial::destroy`] overwrites the region in five passes, the last
//!   through `zeroize`, and the same routine runs on drop

use crate::error::{EtdkError, Result};
use rand_core::{OsRng, RngCore};
use std::fmt;
use std::io::Write;
use std::ptr;
use std::sync::atomic::{compiler_fence, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

/// AES-256 key size in bytes
pub const KEY_SIZE: usize = 32;

/// CBC initialization vector size in bytes (one AES block)
pub const IV_SIZE: usize = 16;

const MATERIAL_SIZE: usize = KEY_SIZE + IV_SIZE;

/// Key and IV for one erase session. Layout of the region is `key || iv`.
pub struct KeyMaterial {
    bytes: Box<[u8; MATERIAL_SIZE]>,
    displayed: bool,
    destroy_count: u32,
}

impl KeyMaterial {
    /// Draw a fresh key and IV from the OS random source.
    pub fn generate() -> Result<Self> {
        let mut bytes = Box::new([0u8; MATERIAL_SIZE]);
        OsRng
            .try_fill_bytes(&mut bytes[..])
            .map_err(|e| EtdkError::crypto(format!("random source unavailable: {}", e)))?;

        debug!("generated session key material");
        Ok(Self {
            bytes,
            displayed: false,
            destroy_count: 0,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_parts(key: [u8; KEY_SIZE], iv: [u8; IV_SIZE]) -> Self {
        let mut bytes = Box::new([0u8; MATERIAL_SIZE]);
        bytes[..KEY_SIZE].copy_from_slice(&key);
        bytes[KEY_SIZE..].copy_from_slice(&iv);
        Self {
            bytes,
            displayed: false,
            destroy_count: 0,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.bytes[..KEY_SIZE]
    }

    pub fn iv(&self) -> &[u8] {
        &self.bytes[KEY_SIZE..]
    }

    /// The whole key material region, for swap locking.
    pub fn memory_region(&self) -> &[u8] {
        &self.bytes[..]
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroy_count > 0
    }

    /// Number of times [`KeyMaterial::destroy`] has run.
    pub fn destroy_count(&self) -> u32 {
        self.destroy_count
    }

    /// Render key and IV as hex to `out`, then block for `pause` so the
    /// operator can transcribe them. Only one display is allowed per session.
    pub fn display<W: Write>(&mut self, out: &mut W, pause: Duration) -> Result<()> {
        if self.is_destroyed() {
            return Err(EtdkError::invalid_input("key material has already been destroyed"));
        }
        if self.displayed {
            return Err(EtdkError::invalid_input("key material has already been displayed"));
        }
        self.displayed = true;

        let key_hex = Zeroizing::new(hex::encode(self.key()));
        let iv_hex = Zeroizing::new(hex::encode(self.iv()));

        writeln!(out, "---")?;
        writeln!(out, "ENCRYPTION KEY - SAVE NOW OR LOSE FOREVER")?;
        writeln!(out)?;
        writeln!(out, "Key: {}", key_hex.as_str())?;
        writeln!(out, "IV:  {}", iv_hex.as_str())?;
        writeln!(out)?;
        writeln!(out, "Key is stored in RAM only and will be wiped immediately.")?;
        writeln!(out, "Write it down now if you need to decrypt later (both hex values above).")?;
        writeln!(out, "---")?;
        out.flush()?;

        info!(pause_secs = pause.as_secs(), "key displayed, waiting before destruction");
        if !pause.is_zero() {
            thread::sleep(pause);
        }
        Ok(())
    }

    /// Overwrite every byte of the key material.
    ///
    /// Passes: `0x00`, `0xFF`, fresh random bytes, `0x00`, then a final
    /// `zeroize` pass. Each pass is written with volatile stores followed by a
    /// compiler fence. The region is never read back. Safe to call repeatedly.
    ///
    /// The region ends all-zero even when the random pass fails; that failure
    /// is still reported as [`EtdkError::Crypto`].
    pub fn destroy(&mut self) -> Result<()> {
        overwrite(&mut self.bytes[..], 0x00);
        overwrite(&mut self.bytes[..], 0xFF);

        let random_pass = {
            let mut noise = Zeroizing::new([0u8; MATERIAL_SIZE]);
            let drawn = OsRng.try_fill_bytes(&mut noise[..]);
            if drawn.is_ok() {
                overwrite_from(&mut self.bytes[..], &noise[..]);
            }
            drawn
        };

        overwrite(&mut self.bytes[..], 0x00);
        self.bytes.as_mut_slice().zeroize();

        let already = self.is_destroyed();
        self.destroy_count = self.destroy_count.saturating_add(1);

        match random_pass {
            Ok(()) => {
                debug!(repeat = already, "key material destroyed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "random overwrite pass failed, key material zeroed");
                Err(EtdkError::crypto(format!("random overwrite pass failed: {}", e)))
            }
        }
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            let _ = self.destroy();
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("bytes", &"[REDACTED]")
            .field("displayed", &self.displayed)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

fn overwrite(buf: &mut [u8], value: u8) {
    for byte in buf.iter_mut() {
        // SAFETY: `byte` is a valid, aligned, exclusive reference.
        unsafe { ptr::write_volatile(byte, value) };
    }
    compiler_fence(Ordering::SeqCst);
}

fn overwrite_from(buf: &mut [u8], src: &[u8]) {
    for (byte, value) in buf.iter_mut().zip(src) {
        // SAFETY: `byte` is a valid, aligned, exclusive reference.
        unsafe { ptr::write_volatile(byte, *value) };
    }
    compiler_fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_not_all_zero() {
        let km = KeyMaterial::generate().expect("generate");
        assert_eq!(km.key().len(), KEY_SIZE);
        assert_eq!(km.iv().len(), IV_SIZE);
        assert!(km.key().iter().any(|&b| b != 0));
        assert!(km.iv().iter().any(|&b| b != 0));
    }

    #[test]
    fn test_generate_differs_between_calls() {
        let a = KeyMaterial::generate().expect("generate");
        let b = KeyMaterial::generate().expect("generate");
        assert_ne!(a.key(), b.key());
        assert_ne!(a.iv(), b.iv());
    }

    #[test]
    fn test_destroy_zeroes_everything() {
        let mut km = KeyMaterial::generate().expect("generate");
        km.destroy().expect("destroy");
        assert!(km.is_destroyed());
        assert!(km.memory_region().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_destroy_twice_is_idempotent() {
        let mut km = KeyMaterial::from_parts([0xAB; KEY_SIZE], [0xCD; IV_SIZE]);
        km.destroy().expect("first destroy");
        km.destroy().expect("second destroy");
        assert!(km.key().iter().all(|&b| b == 0));
        assert!(km.iv().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_display_prints_hex_once() {
        let mut km = KeyMaterial::from_parts([0x11; KEY_SIZE], [0x22; IV_SIZE]);
        let mut out = Vec::new();
        km.display(&mut out, Duration::ZERO).expect("display");

        let text = String::from_utf8(out).expect("utf-8");
        assert!(text.contains(&format!("Key: {}", "11".repeat(KEY_SIZE))));
        assert!(text.contains(&format!("IV:  {}", "22".repeat(IV_SIZE))));

        let again = km.display(&mut Vec::new(), Duration::ZERO);
        assert!(matches!(again, Err(EtdkError::InvalidInput(_))));
    }

    #[test]
    fn test_display_refused_after_destroy() {
        let mut km = KeyMaterial::generate().expect("generate");
        km.destroy().expect("destroy");

        let mut out = Vec::new();
        assert!(km.display(&mut out, Duration::ZERO).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_debug_is_redacted() {
        let km = KeyMaterial::from_parts([0x5A; KEY_SIZE], [0x5A; IV_SIZE]);
        let rendered = format!("{:?}", km);
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("5a5a"));
        assert!(!rendered.contains("90, 90"));
    }
}
