//! Streaming AES-256-CBC encryption in bounded memory.
//!
//! This module provides [`CipherSession`], an owned CBC encryption state bound
//! to one [`KeyMaterial`]. Plaintext is fed through [`CipherSession::update`]
//! in arbitrarily sized chunks; partial blocks are carried across calls, so
//! chunk boundaries never have to line up with the 16-byte block size.
//!
//! ## Finalization
//!
//! A session is finished exactly once, by value:
//!
//! - [`CipherSession::finalize_with_padding`] flushes the carried partial block
//!   with PKCS#7 padding. Output length is the input length rounded up to the
//!   next block (a full padding block when already aligned). Used for files.
//! - [`CipherSession::finalize_raw`] emits no padding so the output occupies
//!   exactly the input extent. Used for devices. A carried tail of `r < 16`
//!   bytes is XORed with `AES(C_last)`, where `C_last` is the last ciphertext
//!   block (the IV if no block was produced), so every byte is transformed and
//!   the tail is decryptable with the same key and IV.
//!
//! ```text
//! C_i  = AES_k(P_i ^ C_{i-1}),  C_0 = IV
//! tail = P_tail ^ AES_k(C_last)[..r]
//! ```

use crate::error::{EtdkError, Result};
use crate::key_manager::KeyMaterial;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes256Enc, Block as AesBlock};
use zeroize::Zeroize;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Required output capacity for an `update` call over `input_len` bytes.
pub const fn output_capacity(input_len: usize) -> usize {
    input_len + BLOCK_SIZE
}

/// CBC encryption state for one session. Not reusable after finalization.
pub struct CipherSession {
    cipher: Aes256Enc,
    chain: [u8; BLOCK_SIZE],
    scratch: AesBlock,
    pending: [u8; BLOCK_SIZE],
    pending_len: usize,
    bytes_in: u64,
    bytes_out: u64,
}

impl CipherSession {
    /// Bind a new CBC session to the key and IV of `key_material`.
    pub fn open(key_material: &KeyMaterial) -> Result<Self> {
        if key_material.is_destroyed() {
            return Err(EtdkError::crypto("cannot open cipher session on destroyed key material"));
        }

        let cipher = Aes256Enc::new_from_slice(key_material.key())
            .map_err(|e| EtdkError::crypto(format!("cipher init failed: {}", e)))?;

        let mut chain = [0u8; BLOCK_SIZE];
        chain.copy_from_slice(key_material.iv());

        Ok(Self {
            cipher,
            chain,
            scratch: AesBlock::default(),
            pending: [0u8; BLOCK_SIZE],
            pending_len: 0,
            bytes_in: 0,
            bytes_out: 0,
        })
    }

    /// Encrypt `input`, writing whole ciphertext blocks into `output`.
    ///
    /// `output` must hold at least [`output_capacity`]`(input.len())` bytes.
    /// Returns the number of bytes written, always a multiple of
    /// [`BLOCK_SIZE`]; any remainder is carried into the next call.
    pub fn update(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        if output.len() < output_capacity(input.len()) {
            return Err(EtdkError::crypto(format!(
                "output buffer too small: {} bytes for {} bytes of input",
                output.len(),
                input.len()
            )));
        }

        let mut rest = input;
        let mut written = 0usize;

        if self.pending_len > 0 {
            let take = (BLOCK_SIZE - self.pending_len).min(rest.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&rest[..take]);
            self.pending_len += take;
            rest = &rest[take..];

            if self.pending_len == BLOCK_SIZE {
                cbc_encrypt_block(
                    &self.cipher,
                    &mut self.chain,
                    &mut self.scratch,
                    &self.pending,
                    &mut output[..BLOCK_SIZE],
                );
                self.pending.zeroize();
                self.pending_len = 0;
                written = BLOCK_SIZE;
            }
        }

        let mut blocks = rest.chunks_exact(BLOCK_SIZE);
        for block in &mut blocks {
            cbc_encrypt_block(
                &self.cipher,
                &mut self.chain,
                &mut self.scratch,
                block,
                &mut output[written..written + BLOCK_SIZE],
            );
            written += BLOCK_SIZE;
        }

        let remainder = blocks.remainder();
        if !remainder.is_empty() {
            self.pending[..remainder.len()].copy_from_slice(remainder);
            self.pending_len = remainder.len();
        }

        self.bytes_in += input.len() as u64;
        self.bytes_out += written as u64;
        Ok(written)
    }

    /// Flush the carried partial block with PKCS#7 padding.
    pub fn finalize_with_padding(mut self) -> Result<Vec<u8>> {
        let pad = (BLOCK_SIZE - self.pending_len) as u8;
        self.pending[self.pending_len..].fill(pad);

        let mut out = vec![0u8; BLOCK_SIZE];
        cbc_encrypt_block(
            &self.cipher,
            &mut self.chain,
            &mut self.scratch,
            &self.pending,
            &mut out,
        );
        self.pending_len = 0;
        self.bytes_out += BLOCK_SIZE as u64;
        Ok(out)
    }

    /// Finish without padding. Returns the encrypted tail, empty when the
    /// stream was block aligned, otherwise shorter than one block.
    pub fn finalize_raw(mut self) -> Result<Vec<u8>> {
        if self.pending_len == 0 {
            return Ok(Vec::new());
        }

        let mut keystream = AesBlock::clone_from_slice(&self.chain);
        self.cipher.encrypt_block(&mut keystream);

        let tail: Vec<u8> = self.pending[..self.pending_len]
            .iter()
            .zip(keystream.iter())
            .map(|(p, k)| p ^ k)
            .collect();

        keystream.as_mut_slice().zeroize();
        self.bytes_out += tail.len() as u64;
        self.pending_len = 0;
        Ok(tail)
    }

    /// Plaintext bytes accepted so far.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Ciphertext bytes emitted so far.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Plaintext bytes carried for the next block.
    pub fn pending_len(&self) -> usize {
        self.pending_len
    }
}

impl Drop for CipherSession {
    fn drop(&mut self) {
        self.chain.zeroize();
        self.scratch.as_mut_slice().zeroize();
        self.pending.zeroize();
    }
}

/// One CBC step. `scratch` holds `P ^ C_prev` and is left zeroed.
fn cbc_encrypt_block(
    cipher: &Aes256Enc,
    chain: &mut [u8; BLOCK_SIZE],
    scratch: &mut AesBlock,
    plaintext: &[u8],
    out: &mut [u8],
) {
    for (i, byte) in scratch.iter_mut().enumerate() {
        *byte = plaintext[i] ^ chain[i];
    }
    cipher.encrypt_block(scratch);
    out.copy_from_slice(&scratch[..]);
    chain.copy_from_slice(&scratch[..]);
    scratch.as_mut_slice().zeroize();
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::key_manager::{IV_SIZE, KEY_SIZE};
    use aes::cipher::BlockDecrypt;
    use aes::Aes256Dec;

    /// CBC decryption without padding removal. A trailing partial block is
    /// undone with the same keystream rule as `finalize_raw`.
    pub(crate) fn decrypt_raw(key: &[u8], iv: &[u8], data: &[u8]) -> Vec<u8> {
        let dec = Aes256Dec::new_from_slice(key).expect("valid key");
        let enc = Aes256Enc::new_from_slice(key).expect("valid key");
        let mut prev = [0u8; BLOCK_SIZE];
        prev.copy_from_slice(iv);

        let mut out = Vec::with_capacity(data.len());
        let mut blocks = data.chunks_exact(BLOCK_SIZE);
        for block in &mut blocks {
            let mut b = AesBlock::clone_from_slice(block);
            dec.decrypt_block(&mut b);
            out.extend(b.iter().zip(prev.iter()).map(|(x, p)| x ^ p));
            prev.copy_from_slice(block);
        }

        let tail = blocks.remainder();
        if !tail.is_empty() {
            let mut ks = AesBlock::clone_from_slice(&prev);
            enc.encrypt_block(&mut ks);
            out.extend(tail.iter().zip(ks.iter()).map(|(c, k)| c ^ k));
        }
        out
    }

    pub(crate) fn decrypt_padded(key: &[u8], iv: &[u8], data: &[u8]) -> Vec<u8> {
        assert_eq!(data.len() % BLOCK_SIZE, 0, "padded ciphertext must be block aligned");
        let mut plain = decrypt_raw(key, iv, data);
        let pad = *plain.last().expect("non-empty ciphertext") as usize;
        assert!((1..=BLOCK_SIZE).contains(&pad), "invalid PKCS#7 padding");
        plain.truncate(plain.len() - pad);
        plain
    }

    fn encrypt_all(km: &KeyMaterial, data: &[u8], chunk: usize, padded: bool) -> Vec<u8> {
        let mut session = CipherSession::open(km).expect("open");
        let mut out = Vec::new();
        let mut buf = vec![0u8; output_capacity(chunk)];
        for piece in data.chunks(chunk) {
            let n = session.update(piece, &mut buf).expect("update");
            out.extend_from_slice(&buf[..n]);
        }
        let last = if padded {
            session.finalize_with_padding().expect("finalize")
        } else {
            session.finalize_raw().expect("finalize")
        };
        out.extend_from_slice(&last);
        out
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 + 7) as u8).collect()
    }

    #[test]
    fn test_known_answer_hello() {
        let km = KeyMaterial::from_parts([0u8; KEY_SIZE], [0u8; IV_SIZE]);
        let ct = encrypt_all(&km, b"HELLO", 4096, true);
        assert_eq!(ct.len(), 16);
        assert_eq!(hex::encode(&ct), "b88321f7a4bd8dc609bfd335cf25e503");
    }

    #[test]
    fn test_padded_round_trip_unaligned() {
        let km = KeyMaterial::generate().expect("generate");
        let data = sample(1000);
        let ct = encrypt_all(&km, &data, 4096, true);
        assert_eq!(ct.len(), 1008);
        assert_eq!(decrypt_padded(km.key(), km.iv(), &ct), data);
    }

    #[test]
    fn test_aligned_input_gets_full_padding_block() {
        let km = KeyMaterial::generate().expect("generate");
        let data = sample(64);
        let ct = encrypt_all(&km, &data, 4096, true);
        assert_eq!(ct.len(), 80);

        let raw = decrypt_raw(km.key(), km.iv(), &ct);
        assert!(raw[64..].iter().all(|&b| b == 16));
    }

    #[test]
    fn test_empty_input_padded() {
        let km = KeyMaterial::generate().expect("generate");
        let ct = encrypt_all(&km, &[], 4096, true);
        assert_eq!(ct.len(), BLOCK_SIZE);
        assert!(decrypt_padded(km.key(), km.iv(), &ct).is_empty());
    }

    #[test]
    fn test_chunk_boundaries_do_not_change_ciphertext() {
        let km = KeyMaterial::from_parts([0x42; KEY_SIZE], [0x24; IV_SIZE]);
        let data = sample(1000);
        let whole = encrypt_all(&km, &data, 4096, true);
        for chunk in [1, 7, 15, 16, 17, 333] {
            assert_eq!(encrypt_all(&km, &data, chunk, true), whole, "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_update_carries_partial_blocks() {
        let km = KeyMaterial::generate().expect("generate");
        let mut session = CipherSession::open(&km).expect("open");
        let mut buf = vec![0u8; output_capacity(32)];

        assert_eq!(session.update(&[1u8; 10], &mut buf).expect("update"), 0);
        assert_eq!(session.pending_len(), 10);

        assert_eq!(session.update(&[2u8; 10], &mut buf).expect("update"), 16);
        assert_eq!(session.pending_len(), 4);

        assert_eq!(session.update(&[3u8; 28], &mut buf).expect("update"), 32);
        assert_eq!(session.pending_len(), 0);
        assert_eq!(session.bytes_in(), 48);
        assert_eq!(session.bytes_out(), 48);
    }

    #[test]
    fn test_update_rejects_small_output() {
        let km = KeyMaterial::generate().expect("generate");
        let mut session = CipherSession::open(&km).expect("open");
        let mut buf = vec![0u8; 32];
        let err = session.update(&[0u8; 32], &mut buf).unwrap_err();
        assert!(matches!(err, EtdkError::Crypto(_)));
    }

    #[test]
    fn test_raw_aligned_emits_nothing_on_finalize() {
        let km = KeyMaterial::generate().expect("generate");
        let data = sample(4096);
        let ct = encrypt_all(&km, &data, 1024, false);
        assert_eq!(ct.len(), 4096);
        assert_ne!(ct, data);
        assert_eq!(decrypt_raw(km.key(), km.iv(), &ct), data);
    }

    #[test]
    fn test_raw_unaligned_tail_is_transformed() {
        let km = KeyMaterial::generate().expect("generate");
        let data = sample(4097);
        let ct = encrypt_all(&km, &data, 1024, false);
        assert_eq!(ct.len(), 4097);

        // The tail byte is the plaintext XOR AES(last ciphertext block).
        let enc = Aes256Enc::new_from_slice(km.key()).expect("valid key");
        let mut ks = AesBlock::clone_from_slice(&ct[4080..4096]);
        enc.encrypt_block(&mut ks);
        assert_eq!(ct[4096], data[4096] ^ ks[0]);

        assert_eq!(decrypt_raw(km.key(), km.iv(), &ct), data);
    }

    #[test]
    fn test_raw_shorter_than_one_block_uses_iv() {
        let km = KeyMaterial::from_parts([0u8; KEY_SIZE], [0u8; IV_SIZE]);
        let ct = encrypt_all(&km, b"HELLO", 4096, false);
        assert_eq!(ct.len(), 5);

        let enc = Aes256Enc::new_from_slice(km.key()).expect("valid key");
        let mut ks = AesBlock::default();
        enc.encrypt_block(&mut ks);
        let expected: Vec<u8> = b"HELLO".iter().zip(ks.iter()).map(|(p, k)| p ^ k).collect();
        assert_eq!(ct, expected);
    }

    #[test]
    fn test_identical_blocks_produce_different_ciphertext() {
        let km = KeyMaterial::generate().expect("generate");
        let data = [0x41u8; 64];
        let ct = encrypt_all(&km, &data, 4096, false);
        assert_ne!(ct[0..16], ct[16..32]);
        assert_ne!(ct[16..32], ct[32..48]);
    }

    #[test]
    fn test_block_step_leaves_scratch_zeroed() {
        let cipher = Aes256Enc::new_from_slice(&[0u8; KEY_SIZE]).expect("valid key");
        let mut chain = [0u8; BLOCK_SIZE];
        let mut scratch = AesBlock::default();
        let mut out = [0u8; BLOCK_SIZE];

        let mut plaintext = [0u8; BLOCK_SIZE];
        plaintext[..5].copy_from_slice(b"HELLO");
        plaintext[5..].fill(11);
        cbc_encrypt_block(&cipher, &mut chain, &mut scratch, &plaintext, &mut out);

        assert!(scratch.iter().all(|&b| b == 0));
        assert_eq!(chain, out);
        assert_eq!(hex::encode(out), "b88321f7a4bd8dc609bfd335cf25e503");
    }

    #[test]
    fn test_open_refuses_destroyed_key() {
        let mut km = KeyMaterial::generate().expect("generate");
        km.destroy().expect("destroy");
        assert!(matches!(CipherSession::open(&km), Err(EtdkError::Crypto(_))));
    }
}
