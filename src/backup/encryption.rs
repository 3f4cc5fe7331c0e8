use super::{BackupError, Result};
use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes256;
use base64::Engine as _;
use ghash::universal_hash::UniversalHash;
use ghash::GHash;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};

pub const FORMAT_VERSION: u32 = 1;
pub const ALGORITHM: &str = "aes-256-gcm";
pub const SALT_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;
pub const HEADER_LEN: usize = 4 + SALT_LEN + IV_LEN;
pub const PBKDF2_ITERATIONS: u32 = 100_000;

const KEY_LEN: usize = 32;
const CHUNK_SIZE: usize = 64 * 1024;
const MIN_MASTER_KEY_LEN: usize = 16;

type Aes256Ctr = ctr::Ctr32BE<Aes256>;

/// Everything needed to decrypt and authenticate an artifact, given the master key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionMetadata {
    pub version: u32,
    pub algorithm: String,
    pub key_id: String,
    pub salt_hex: String,
    pub iv_hex: String,
    pub auth_tag_hex: String,
}

/// Result of encrypting one artifact.
#[derive(Debug, Clone)]
pub struct EncryptionSummary {
    pub metadata: EncryptionMetadata,
    pub plaintext_bytes: u64,
    /// Size of the framed artifact, header and tag included
    pub artifact_bytes: u64,
}

/// The fixed-size prefix of an encrypted artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionHeader {
    pub version: u32,
    pub salt: [u8; SALT_LEN],
    pub iv: [u8; IV_LEN],
}

impl EncryptionHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.version.to_be_bytes());
        out[4..4 + SALT_LEN].copy_from_slice(&self.salt);
        out[4 + SALT_LEN..].copy_from_slice(&self.iv);
        out
    }

    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[..4]);
        let version = u32::from_be_bytes(version);
        if version != FORMAT_VERSION {
            return Err(BackupError::EncryptionError {
                message: format!("Unsupported encryption format version {version}"),
            });
        }

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[4..4 + SALT_LEN]);
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&bytes[4 + SALT_LEN..]);
        Ok(Self { version, salt, iv })
    }
}

/// Process-wide secret every per-artifact key is derived from.
pub struct MasterKey(Vec<u8>);

impl MasterKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < MIN_MASTER_KEY_LEN {
            return Err(BackupError::config(format!(
                "Master encryption key must be at least {MIN_MASTER_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| BackupError::config(format!("Master encryption key is not valid base64: {e}")))?;
        Self::new(bytes)
    }

    /// Stable, non-secret identifier: first 8 bytes of SHA-256 over the key.
    pub fn key_id(&self) -> String {
        let digest = Sha256::digest(&self.0);
        hex::encode(&digest[..8])
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MasterKey").field(&"<redacted>").finish()
    }
}

/// Streaming AES-256-GCM over the artifact framing
/// `version (4, BE) | salt (32) | iv (16) | ciphertext | tag (16)`.
///
/// Every encryption draws a fresh salt and IV; the key is
/// PBKDF2-HMAC-SHA256(master, salt, 100 000). Memory use is bounded by the
/// chunk size no matter how large the artifact is.
#[derive(Clone)]
pub struct EncryptionEngine {
    master: Arc<MasterKey>,
    key_id: String,
}

impl fmt::Debug for EncryptionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionEngine")
            .field("key_id", &self.key_id)
            .finish()
    }
}

impl EncryptionEngine {
    pub fn new(master: MasterKey) -> Self {
        let key_id = master.key_id();
        Self {
            master: Arc::new(master),
            key_id,
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Encrypt `input` into `output`. A partially written `output` is removed on failure.
    pub async fn encrypt_file(&self, input: &Path, output: &Path) -> Result<EncryptionSummary> {
        info!("Encrypting {} -> {}", input.display(), output.display());
        let reader = BufReader::new(File::open(input).await?);
        self.encrypt_to_file(reader, output).await
    }

    async fn encrypt_to_file<R>(&self, mut reader: R, output: &Path) -> Result<EncryptionSummary>
    where
        R: AsyncRead + Unpin,
    {
        let result = async {
            let mut writer = BufWriter::new(File::create(output).await?);
            let summary = self.encrypt_stream(&mut reader, &mut writer).await?;
            writer.into_inner().sync_all().await?;
            Ok::<_, BackupError>(summary)
        }
        .await;

        if result.is_err() {
            remove_partial(output).await;
        }
        result
    }

    /// Decrypt `input` into `output` and authenticate it. On any failure,
    /// including a tag mismatch, `output` is removed.
    pub async fn decrypt_file(&self, input: &Path, output: &Path) -> Result<u64> {
        info!("Decrypting {} -> {}", input.display(), output.display());

        let result = async {
            let mut reader = BufReader::new(File::open(input).await?);
            let mut writer = BufWriter::new(File::create(output).await?);
            let written = self.decrypt_stream(&mut reader, &mut writer).await?;
            writer.into_inner().sync_all().await?;
            Ok::<_, BackupError>(written)
        }
        .await;

        if result.is_err() {
            remove_partial(output).await;
        }
        result
    }

    pub async fn encrypt_stream<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<EncryptionSummary>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);

        let header = EncryptionHeader {
            version: FORMAT_VERSION,
            salt,
            iv,
        };
        let key = self.derive_key(salt).await?;
        let mut gcm = GcmStream::new(&key, &iv);

        writer.write_all(&header.to_bytes()).await?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut plaintext_bytes = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            gcm.encrypt(&mut buf[..n])?;
            writer.write_all(&buf[..n]).await?;
            plaintext_bytes += n as u64;
        }

        let tag = gcm.finalize();
        writer.write_all(&tag).await?;
        writer.flush().await?;

        debug!("Encrypted {} bytes with key {}", plaintext_bytes, self.key_id);

        Ok(EncryptionSummary {
            metadata: EncryptionMetadata {
                version: FORMAT_VERSION,
                algorithm: ALGORITHM.to_string(),
                key_id: self.key_id.clone(),
                salt_hex: hex::encode(salt),
                iv_hex: hex::encode(iv),
                auth_tag_hex: hex::encode(tag),
            },
            plaintext_bytes,
            artifact_bytes: plaintext_bytes + (HEADER_LEN + TAG_LEN) as u64,
        })
    }

    /// Decrypt a framed artifact. The trailing tag is found by holding back
    /// the last `TAG_LEN` bytes, so the input length need not be known.
    pub async fn decrypt_stream<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                truncated()
            } else {
                BackupError::Io(e)
            }
        })?;
        let header = EncryptionHeader::parse(&header)?;

        let key = self.derive_key(header.salt).await?;
        let mut gcm = GcmStream::new(&key, &header.iv);

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut carry: Vec<u8> = Vec::with_capacity(CHUNK_SIZE + TAG_LEN);
        let mut plaintext_bytes = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            carry.extend_from_slice(&buf[..n]);
            if carry.len() > TAG_LEN {
                let ready = carry.len() - TAG_LEN;
                gcm.decrypt(&mut carry[..ready])?;
                writer.write_all(&carry[..ready]).await?;
                carry.drain(..ready);
                plaintext_bytes += ready as u64;
            }
        }

        if carry.len() != TAG_LEN {
            return Err(truncated());
        }

        let expected = gcm.finalize();
        if !bool::from(expected[..].ct_eq(&carry[..])) {
            warn!("Authentication tag mismatch while decrypting artifact");
            return Err(BackupError::IntegrityError {
                message: "Authentication tag mismatch: artifact is corrupt, tampered with, or was encrypted with a different key".to_string(),
            });
        }

        writer.flush().await?;
        Ok(plaintext_bytes)
    }

    async fn derive_key(&self, salt: [u8; SALT_LEN]) -> Result<[u8; KEY_LEN]> {
        let master = Arc::clone(&self.master);
        tokio::task::spawn_blocking(move || {
            let mut key = [0u8; KEY_LEN];
            pbkdf2_hmac::<Sha256>(&master.0, &salt, PBKDF2_ITERATIONS, &mut key);
            key
        })
        .await
        .map_err(|e| BackupError::EncryptionError {
            message: format!("Key derivation task failed: {e}"),
        })
    }
}

/// Cheap structural check of an encrypted artifact: large enough to hold the
/// framing and carrying a known version.
pub async fn probe_encrypted_artifact(path: &Path) -> Result<EncryptionHeader> {
    let len = fs::metadata(path).await?.len();
    if len < (HEADER_LEN + TAG_LEN) as u64 {
        return Err(truncated());
    }
    let mut file = File::open(path).await?;
    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header).await?;
    EncryptionHeader::parse(&header)
}

fn truncated() -> BackupError {
    BackupError::IntegrityError {
        message: "Encrypted artifact is truncated".to_string(),
    }
}

async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {}: {}", path.display(), e),
    }
}

/// Incremental GCM: CTR keystream plus a running GHASH over the ciphertext.
struct GcmStream {
    ctr: Aes256Ctr,
    ghash: GHash,
    pending: [u8; 16],
    pending_len: usize,
    ciphertext_len: u64,
    tag_mask: [u8; 16],
}

impl GcmStream {
    fn new(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Self {
        let cipher = <Aes256 as KeyInit>::new(GenericArray::from_slice(key));

        let mut h = GenericArray::default();
        cipher.encrypt_block(&mut h);

        // J0 for a non-96-bit IV: GHASH_H(IV || 0^64 || [len(IV) in bits]_64)
        let mut j0_hash = <GHash as KeyInit>::new(&h);
        j0_hash.update_padded(iv);
        j0_hash.update(&[length_block(0, IV_LEN as u64 * 8)]);
        let j0 = j0_hash.finalize();

        let mut tag_mask = j0;
        cipher.encrypt_block(&mut tag_mask);

        let mut counter = [0u8; 16];
        counter.copy_from_slice(&j0);
        let mut low = [0u8; 4];
        low.copy_from_slice(&counter[12..]);
        counter[12..].copy_from_slice(&u32::from_be_bytes(low).wrapping_add(1).to_be_bytes());

        let mut mask = [0u8; 16];
        mask.copy_from_slice(&tag_mask);

        Self {
            ctr: <Aes256Ctr as KeyIvInit>::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(&counter),
            ),
            ghash: <GHash as KeyInit>::new(&h),
            pending: [0u8; 16],
            pending_len: 0,
            ciphertext_len: 0,
            tag_mask: mask,
        }
    }

    fn encrypt(&mut self, buf: &mut [u8]) -> Result<()> {
        self.ctr
            .try_apply_keystream(buf)
            .map_err(|_| keystream_exhausted())?;
        self.absorb(buf);
        Ok(())
    }

    fn decrypt(&mut self, buf: &mut [u8]) -> Result<()> {
        self.absorb(buf);
        self.ctr
            .try_apply_keystream(buf)
            .map_err(|_| keystream_exhausted())
    }

    fn absorb(&mut self, mut data: &[u8]) {
        self.ciphertext_len += data.len() as u64;

        if self.pending_len > 0 {
            let take = (16 - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len < 16 {
                return;
            }
            self.ghash.update(&[ghash::Block::clone_from_slice(&self.pending)]);
            self.pending_len = 0;
        }

        let whole = data.len() - data.len() % 16;
        let blocks: Vec<ghash::Block> = data[..whole]
            .chunks_exact(16)
            .map(ghash::Block::clone_from_slice)
            .collect();
        self.ghash.update(&blocks);

        let rest = &data[whole..];
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    fn finalize(mut self) -> [u8; TAG_LEN] {
        if self.pending_len > 0 {
            self.ghash.update_padded(&self.pending[..self.pending_len]);
        }
        self.ghash.update(&[length_block(0, self.ciphertext_len * 8)]);
        let s = self.ghash.finalize();

        let mut tag = [0u8; TAG_LEN];
        for (i, byte) in tag.iter_mut().enumerate() {
            *byte = s[i] ^ self.tag_mask[i];
        }
        tag
    }
}

/// The 32-bit block counter allows at most 2^32 - 2 blocks per artifact.
fn keystream_exhausted() -> BackupError {
    BackupError::EncryptionError {
        message: "plaintext exceeds GCM limit of 2^32 - 2 blocks per artifact".to_string(),
    }
}

fn length_block(aad_bits: u64, data_bits: u64) -> ghash::Block {
    let mut block = [0u8; 16];
    block[..8].copy_from_slice(&aad_bits.to_be_bytes());
    block[8..].copy_from_slice(&data_bits.to_be_bytes());
    ghash::Block::clone_from_slice(&block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::StreamCipherSeek;
    use aes_gcm::aead::consts::U16;
    use aes_gcm::aead::Aead;
    use aes_gcm::AesGcm;

    fn engine() -> EncryptionEngine {
        EncryptionEngine::new(MasterKey::new(vec![7u8; 32]).unwrap())
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_gcm_stream_matches_reference_aead() {
        let key = [0x42u8; 32];
        let iv: [u8; 16] = core::array::from_fn(|i| i as u8);
        let reference = AesGcm::<Aes256, U16>::new(GenericArray::from_slice(&key));

        for len in [0usize, 1, 15, 16, 17, 100, 4096 + 3] {
            let plaintext = pattern(len);
            let expected = reference
                .encrypt(GenericArray::from_slice(&iv), plaintext.as_slice())
                .unwrap();

            // feed in uneven pieces to exercise the partial block carry
            let mut gcm = GcmStream::new(&key, &iv);
            let mut ciphertext = plaintext.clone();
            let mut offset = 0;
            for step in [5usize, 11, 32, 7].iter().cycle() {
                if offset >= ciphertext.len() {
                    break;
                }
                let end = (offset + step).min(ciphertext.len());
                gcm.encrypt(&mut ciphertext[offset..end]).unwrap();
                offset = end;
            }
            let tag = gcm.finalize();

            assert_eq!(&expected[..len], ciphertext.as_slice(), "ciphertext len {len}");
            assert_eq!(&expected[len..], &tag[..], "tag len {len}");
        }
    }

    #[tokio::test]
    async fn test_round_trip_across_chunk_boundaries() {
        let engine = engine();
        for len in [0usize, 1, CHUNK_SIZE - 1, CHUNK_SIZE, 2 * CHUNK_SIZE + 17] {
            let plaintext = pattern(len);
            let mut artifact = Vec::new();
            let summary = engine
                .encrypt_stream(&mut plaintext.as_slice(), &mut artifact)
                .await
                .unwrap();
            assert_eq!(summary.plaintext_bytes, len as u64);
            assert_eq!(artifact.len() as u64, summary.artifact_bytes);

            let mut restored = Vec::new();
            let n = engine
                .decrypt_stream(&mut artifact.as_slice(), &mut restored)
                .await
                .unwrap();
            assert_eq!(n, len as u64);
            assert_eq!(restored, plaintext);
        }
    }

    #[tokio::test]
    async fn test_framing_layout() {
        let engine = engine();
        let plaintext = pattern(1000);
        let mut artifact = Vec::new();
        let summary = engine
            .encrypt_stream(&mut plaintext.as_slice(), &mut artifact)
            .await
            .unwrap();

        assert_eq!(&artifact[..4], &FORMAT_VERSION.to_be_bytes());
        assert_eq!(hex::encode(&artifact[4..36]), summary.metadata.salt_hex);
        assert_eq!(hex::encode(&artifact[36..52]), summary.metadata.iv_hex);
        assert_eq!(
            hex::encode(&artifact[artifact.len() - TAG_LEN..]),
            summary.metadata.auth_tag_hex
        );
        assert_eq!(summary.metadata.key_id, engine.key_id());
        assert_eq!(summary.metadata.algorithm, ALGORITHM);
    }

    #[tokio::test]
    async fn test_salt_and_iv_are_fresh_per_encryption() {
        let engine = engine();
        let plaintext = pattern(64);
        let mut a = Vec::new();
        let mut b = Vec::new();
        let first = engine.encrypt_stream(&mut plaintext.as_slice(), &mut a).await.unwrap();
        let second = engine.encrypt_stream(&mut plaintext.as_slice(), &mut b).await.unwrap();
        assert_ne!(first.metadata.salt_hex, second.metadata.salt_hex);
        assert_ne!(first.metadata.iv_hex, second.metadata.iv_hex);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_tampered_tag_and_wrong_key_are_rejected() {
        let engine = engine();
        let plaintext = pattern(300);
        let mut artifact = Vec::new();
        engine
            .encrypt_stream(&mut plaintext.as_slice(), &mut artifact)
            .await
            .unwrap();

        let mut tampered = artifact.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        let err = engine
            .decrypt_stream(&mut tampered.as_slice(), &mut Vec::<u8>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::IntegrityError { .. }));

        let other = EncryptionEngine::new(MasterKey::new(vec![9u8; 32]).unwrap());
        assert_ne!(other.key_id(), engine.key_id());
        let err = other
            .decrypt_stream(&mut artifact.as_slice(), &mut Vec::<u8>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::IntegrityError { .. }));
    }

    #[tokio::test]
    async fn test_unknown_version_and_truncation() {
        let engine = engine();
        let mut artifact = Vec::new();
        engine
            .encrypt_stream(&mut pattern(10).as_slice(), &mut artifact)
            .await
            .unwrap();

        let mut future_version = artifact.clone();
        future_version[..4].copy_from_slice(&2u32.to_be_bytes());
        let err = engine
            .decrypt_stream(&mut future_version.as_slice(), &mut Vec::<u8>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::EncryptionError { .. }));

        let short = &artifact[..HEADER_LEN + 4];
        let err = engine
            .decrypt_stream(&mut &short[..], &mut Vec::<u8>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::IntegrityError { .. }));

        let err = engine
            .decrypt_stream(&mut &artifact[..20], &mut Vec::<u8>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::IntegrityError { .. }));
    }

    #[test]
    fn test_exhausted_counter_is_an_error() {
        let mut gcm = GcmStream::new(&[0x42u8; 32], &[7u8; IV_LEN]);
        gcm.ctr.seek((u32::MAX as u64 - 1) * 16);

        let mut last_block = [0u8; 16];
        gcm.encrypt(&mut last_block).unwrap();

        let mut past_limit = [0u8; 64];
        let err = gcm.encrypt(&mut past_limit).unwrap_err();
        assert!(matches!(err, BackupError::EncryptionError { .. }));
        assert!(err.to_string().contains("GCM limit"));
        assert_eq!(past_limit, [0u8; 64]);
    }

    /// Yields `remaining` bytes, then fails.
    struct FailingSource {
        remaining: usize,
    }

    impl AsyncRead for FailingSource {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.remaining == 0 {
                return std::task::Poll::Ready(Err(std::io::Error::other("source went away")));
            }
            let n = self.remaining.min(buf.remaining());
            buf.put_slice(&vec![0xab; n]);
            self.remaining -= n;
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_failed_encryption_leaves_no_partial_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let output = dir.path().join("backup.sql.gz.enc");

        let err = engine()
            .encrypt_to_file(
                FailingSource {
                    remaining: 3 * CHUNK_SIZE + 5,
                },
                &output,
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("source went away"));
        assert!(!output.exists());
    }

    #[test]
    fn test_master_key_validation() {
        assert!(MasterKey::from_base64("not base64!").is_err());
        assert!(MasterKey::from_base64("c2hvcnQ=").is_err());
        let encoded = base64::engine::general_purpose::STANDARD.encode([3u8; 32]);
        let key = MasterKey::from_base64(&encoded).unwrap();
        assert_eq!(key.key_id().len(), 16);
        assert!(!format!("{key:?}").contains('3'));
    }
}
