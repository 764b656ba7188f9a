//! # ETDK - Encrypt-then-Delete-Key
//!
//! ETDK makes a file or a whole block device irrecoverable: the target is
//! encrypted in place with AES-256-CBC under a freshly generated key, the key
//! is shown to the operator once, and then it is destroyed.
//!
//! ## Features
//!
//! - **Fresh key per run**: 256-bit key and 128-bit IV from the OS CSPRNG
//! - **Streaming**: constant memory regardless of target size
//! - **Files**: padded ciphertext written to a temporary file, then renamed over the original
//! - **Devices**: unpadded ciphertext written back in place, exact extent preserved
//! - **Key destruction**: multi-pass volatile overwrite on every exit path, swap locking where available
//!
//! ## Quick Start
//!
//! ```no_run
//! use etdk::{config::Config, eraser::{ConsolePresenter, Eraser}, platform::NativePlatform};
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let cfg = Config::load_with_env(None)?;
//!     let mut presenter = ConsolePresenter::new(cfg.display_pause());
//!     let eraser = Eraser::new(&NativePlatform, cfg);
//!
//!     let target = eraser.target(Path::new("secret.txt"))?;
//!     eraser.run(&target, &mut presenter, |_| {})?;
//!     Ok(())
//! }
//! ```
//!
//! ## Output Format
//!
//! No header and no stored IV. Files hold raw CBC ciphertext with PKCS#7
//! padding; devices hold raw CBC ciphertext of exactly the original length.

pub mod config;
pub mod error;
pub mod eraser;
pub mod key_manager;
pub mod platform;
pub mod streaming;
pub mod target_ops;

// Re-export common types for convenience
pub use error::EtdkError;
