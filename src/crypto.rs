//! crypto holds the AES-256-GCM, Argon2id and HKDF-SHA256 primitives shared
//! by the value cache's envelope encryption and the encrypted-database page
//! path.

use std::path::Path;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Version};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::pager::{FilePager, Page, PageNum, PageSink, PageSource};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Authentication tag mismatch; the data was not produced under this key and context.")]
    Integrity,
    #[error("Key-derivation parameters are out of range.")]
    KdfParams,
}

/// Derive a 32-byte subkey from `master` for the given context string,
/// HKDF-SHA256 with a zero salt.
///
/// This is subkey separation, not password hardening.  A low-entropy
/// passphrase goes through [`stretch_master_key`] first.
pub fn derive_key(master: &[u8], info: &str) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(Some(&[0u8; KEY_LEN]), master);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(info.as_bytes(), &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// Argon2id cost parameters and salt for stretching a caller master key.
#[derive(Clone)]
pub struct KdfOptions {
    /// Memory cost in KiB (Argon2 `m`).
    pub memory_kib: u32,
    /// Pass count (Argon2 `t`).
    pub iterations: u32,
    /// Lane count (Argon2 `p`).
    pub parallelism: u32,
    /// At least 8 bytes.  The default is a fixed crate-wide salt; callers
    /// holding more than one database should set a per-database salt.
    pub salt: Vec<u8>,
}

impl Default for KdfOptions {
    fn default() -> KdfOptions {
        KdfOptions {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
            salt: b"sharcdb-kdf-salt".to_vec(),
        }
    }
}

/// Stretch a caller master key (realistically a passphrase) with Argon2id
/// under the given cost parameters.  Whole-database page keys start here;
/// [`derive_key`] then separates per-purpose subkeys from the stretched key.
pub fn stretch_master_key(master: &[u8], kdf: &KdfOptions) -> Result<[u8; KEY_LEN], Error> {
    let params = argon2::Params::new(
        kdf.memory_kib,
        kdf.iterations,
        kdf.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|_| Error::KdfParams)?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut okm = [0u8; KEY_LEN];
    argon
        .hash_password_into(master, &kdf.salt, &mut okm)
        .map_err(|_| Error::KdfParams)?;
    Ok(okm)
}

pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// AES-256-GCM encrypt; the returned buffer is ciphertext with the 16-byte
/// tag appended.
pub fn seal(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("key is 32 bytes");
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .expect("AES-GCM encryption is infallible for in-memory buffers")
}

/// Inverse of [`seal`]; a tag mismatch is an [`Error::Integrity`].
pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    sealed: &[u8],
) -> Result<Vec<u8>, Error> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("key is 32 bytes");
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload { msg: sealed, aad },
        )
        .map_err(|_| Error::Integrity)
}

// ------------------------------------------------------------------
// Encrypted page source.

/// Whole-database encryption settings.
///
/// The master key is stretched with Argon2id under the `kdf` cost
/// parameters before any page key is derived from it, so a passphrase
/// master key costs an attacker the full memory-hard work per guess.
///
/// Pages are sealed individually, so the on-disk file is frames of
/// `page_size + 16` bytes (page plus GCM tag) and is not byte-interchange
/// with plaintext SQLite files.  The nonce is the page number, which is
/// sound because every nonce is used by exactly one (page, key) pair and
/// rewrites of a page replace the old frame entirely.
#[derive(Clone)]
pub struct EncryptionOptions {
    pub master_key: Vec<u8>,
    /// Argon2id cost parameters and salt; must match the values the
    /// database was created with.
    pub kdf: KdfOptions,
    /// Frame geometry; must match the page size the database was created
    /// with (it cannot be read from the encrypted file).
    pub page_size: u32,
}

impl EncryptionOptions {
    pub fn new(master_key: impl Into<Vec<u8>>) -> EncryptionOptions {
        EncryptionOptions {
            master_key: master_key.into(),
            kdf: KdfOptions::default(),
            page_size: 4096,
        }
    }

    pub fn kdf(mut self, kdf: KdfOptions) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }
}

const PAGE_KEY_INFO: &str = "sharc-db-page";

fn page_nonce(pn: PageNum) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..4].copy_from_slice(&pn.to_be_bytes());
    nonce
}

/// A [`PageSource`]/[`PageSink`] whose backing file stores every page
/// AES-256-GCM-sealed under a key derived from the caller's master key.
pub struct EncryptedPager {
    inner: Arc<FilePager>,
    page_size: u32,
    key: [u8; KEY_LEN],
}

impl EncryptedPager {
    pub fn open(path: &Path, options: &EncryptionOptions, writable: bool) -> Result<Self, crate::pager::Error> {
        let stretched = stretch_master_key(&options.master_key, &options.kdf).map_err(|_| {
            crate::pager::Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "key-derivation parameters are out of range",
            ))
        })?;
        let frame_size = options.page_size + TAG_LEN as u32;
        let inner = if writable {
            FilePager::open_read_write(path, frame_size)?
        } else {
            FilePager::open_read_only(path, frame_size)?
        };
        Ok(EncryptedPager {
            inner: Arc::new(inner),
            page_size: options.page_size,
            key: derive_key(&stretched, PAGE_KEY_INFO),
        })
    }
}

fn integrity_to_io(pn: PageNum) -> crate::pager::Error {
    crate::pager::Error::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("page {pn} failed authentication"),
    ))
}

impl PageSource for EncryptedPager {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        self.inner.page_count()
    }

    fn page(&self, pn: PageNum) -> Result<Page, crate::pager::Error> {
        let frame = self.inner.page(pn)?;
        let plain = open(&self.key, &page_nonce(pn), &pn.to_be_bytes(), &frame)
            .map_err(|_| integrity_to_io(pn))?;
        Ok(Arc::from(plain.into_boxed_slice()))
    }
}

impl PageSink for EncryptedPager {
    fn write_page(&self, pn: PageNum, data: &[u8]) -> Result<(), crate::pager::Error> {
        let frame = seal(&self.key, &page_nonce(pn), &pn.to_be_bytes(), data);
        self.inner.write_page(pn, &frame)
    }

    fn truncate(&self, pages: u32) -> Result<(), crate::pager::Error> {
        self.inner.truncate(pages)
    }

    fn sync(&self) -> Result<(), crate::pager::Error> {
        self.inner.sync()
    }

    fn lock_exclusive(&self) -> Result<(), crate::pager::Error> {
        self.inner.lock_exclusive()
    }

    fn unlock(&self) -> Result<(), crate::pager::Error> {
        self.inner.unlock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let key = derive_key(b"master", "test");
        let nonce = random_nonce();
        let sealed = seal(&key, &nonce, b"aad", b"payload");
        assert_eq!(sealed.len(), b"payload".len() + TAG_LEN);
        assert_eq!(open(&key, &nonce, b"aad", &sealed).unwrap(), b"payload");
    }

    #[test]
    fn test_open_rejects_wrong_aad_key_or_tampering() {
        let key = derive_key(b"master", "test");
        let nonce = random_nonce();
        let mut sealed = seal(&key, &nonce, b"aad", b"payload");
        assert_eq!(open(&key, &nonce, b"other", &sealed), Err(Error::Integrity));
        let other_key = derive_key(b"master", "other-context");
        assert_eq!(open(&other_key, &nonce, b"aad", &sealed), Err(Error::Integrity));
        sealed[0] ^= 1;
        assert_eq!(open(&key, &nonce, b"aad", &sealed), Err(Error::Integrity));
    }

    #[test]
    fn test_derive_key_separates_contexts() {
        let a = derive_key(b"master", "ctx-a");
        let b = derive_key(b"master", "ctx-b");
        assert_ne!(a, b);
        assert_eq!(a, derive_key(b"master", "ctx-a"));
    }

    fn cheap_kdf() -> KdfOptions {
        KdfOptions {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
            salt: b"0123456789abcdef".to_vec(),
        }
    }

    #[test]
    fn test_master_key_stretch_is_deterministic_and_salted() {
        let kdf = cheap_kdf();
        let a = stretch_master_key(b"passphrase", &kdf).unwrap();
        assert_eq!(a, stretch_master_key(b"passphrase", &kdf).unwrap());
        assert_ne!(a, stretch_master_key(b"other", &kdf).unwrap());

        let mut resalted = cheap_kdf();
        resalted.salt = b"fedcba9876543210".to_vec();
        assert_ne!(a, stretch_master_key(b"passphrase", &resalted).unwrap());

        let mut recosted = cheap_kdf();
        recosted.iterations = 2;
        assert_ne!(a, stretch_master_key(b"passphrase", &recosted).unwrap());
    }

    #[test]
    fn test_stretch_rejects_bad_parameters() {
        let mut short_salt = cheap_kdf();
        short_salt.salt = b"x".to_vec();
        assert_eq!(
            stretch_master_key(b"passphrase", &short_salt),
            Err(Error::KdfParams)
        );
        let mut zero_passes = cheap_kdf();
        zero_passes.iterations = 0;
        assert_eq!(
            stretch_master_key(b"passphrase", &zero_passes),
            Err(Error::KdfParams)
        );
    }

    #[test]
    fn test_encrypted_pager_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enc.db");
        std::fs::File::create(&path).unwrap();
        let opts = EncryptionOptions::new(b"secret".to_vec())
            .page_size(512)
            .kdf(cheap_kdf());

        let pager = EncryptedPager::open(&path, &opts, true).unwrap();
        let page: Vec<u8> = (0..512).map(|i| (i % 256) as u8).collect();
        pager.write_page(1, &page).unwrap();
        pager.sync().unwrap();
        assert_eq!(pager.page_count(), 1);
        assert_eq!(&pager.page(1).unwrap()[..], &page[..]);

        // The raw file holds no plaintext page and is tag-expanded.
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), 512 + TAG_LEN);
        assert_ne!(&raw[..512], &page[..]);

        // A different master key under the same kdf cannot read it.
        let mut wrong_opts = opts.clone();
        wrong_opts.master_key = b"other".to_vec();
        let wrong = EncryptedPager::open(&path, &wrong_opts, false).unwrap();
        assert!(wrong.page(1).is_err());

        // Neither can the right key under a different salt.
        let mut resalted = opts;
        resalted.kdf.salt = b"fedcba9876543210".to_vec();
        let resalted = EncryptedPager::open(&path, &resalted, false).unwrap();
        assert!(resalted.page(1).is_err());
    }
}
