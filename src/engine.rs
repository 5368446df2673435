/// Hybrid file encryption: ML-KEM key transport + ChaCha20-Poly1305
///
/// ```text
/// encrypt(file, pk):
///   (key_blob, ss) = KEM.encapsulate(pk)
///   key            = HKDF-SHA256(ikm = ss, info = "ShieldFileCrypt-AEAD-Key-v1")
///   container      = nonce(12) ‖ ChaCha20-Poly1305(key, nonce, file)
///
/// decrypt(container, key_blob, sk):
///   ss  = KEM.decapsulate(sk, key_blob)
///   key = HKDF-SHA256(ikm = ss, info = ...)
///   file = open(key, container)
/// ```
///
/// A wrong private key decapsulates to an unrelated secret (implicit
/// rejection), so wrong keys and corrupted data both surface as the same
/// `DecryptionFailed`.
use crate::config::{EngineConfig, KemParams};
use crate::error::{FileCryptError, Result};
use crate::kem::{fingerprint, KemFacade, KeyPair, SharedSecret};
use crate::module::ModuleManager;
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::time::Duration;
use zeroize::Zeroizing;

/// AEAD nonce size
pub const NONCE_BYTES: usize = 12;
/// Poly1305 tag size
pub const TAG_BYTES: usize = 16;
/// Smallest well-formed container (empty plaintext)
pub const MIN_CONTAINER_BYTES: usize = NONCE_BYTES + TAG_BYTES;

const AEAD_KEY_INFO: &[u8] = b"ShieldFileCrypt-AEAD-Key-v1";

// ─── Artifacts ───────────────────────────────────────────────────────────────

/// `nonce ‖ ciphertext ‖ tag`
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedContainer(Vec<u8>);

impl EncryptedContainer {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Nonce prefix, if the container is long enough to carry one
    pub fn nonce(&self) -> Option<&[u8]> {
        self.0.get(..NONCE_BYTES)
    }
}

impl std::fmt::Debug for EncryptedContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptedContainer({} bytes)", self.0.len())
    }
}

/// KEM ciphertext that transports the file key
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedKeyBlob(Vec<u8>);

impl EncryptedKeyBlob {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for EncryptedKeyBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptedKeyBlob({} bytes)", self.0.len())
    }
}

/// Output of [`HybridEngine::encrypt`]
#[derive(Debug, Clone)]
pub struct EncryptedFile {
    pub container: EncryptedContainer,
    pub key_blob: EncryptedKeyBlob,
}

// ─── Engine ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct HybridEngine {
    kem: KemFacade,
}

impl HybridEngine {
    pub fn new(kem: KemFacade) -> Self {
        Self { kem }
    }

    /// Engine over the native module stack described by `config`
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let manager = ModuleManager::native(config)?;
        Ok(Self::new(KemFacade::new(manager)))
    }

    pub fn kem(&self) -> &KemFacade {
        &self.kem
    }

    pub fn params(&self) -> KemParams {
        self.kem.params()
    }

    pub fn is_ready(&self) -> bool {
        self.kem.manager().is_ready()
    }

    /// Start initialization if needed and wait up to `timeout` for it
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        self.kem.manager().wait_for_ready(timeout).await
    }

    pub async fn generate_key_pair(&self) -> Result<KeyPair> {
        self.kem.generate_key_pair().await
    }

    /// Encrypt `file` to `public_key`.
    pub async fn encrypt(&self, file: &[u8], public_key: &[u8]) -> Result<EncryptedFile> {
        let encapsulated = self.kem.encapsulate(public_key).await?;
        let key = derive_aead_key(&encapsulated.shared_secret)?;

        let cipher = ChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|_| FileCryptError::KeyDerivationFailed)?;

        let mut nonce_bytes = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, file)
            .map_err(|_| FileCryptError::EncryptionFailed)?;

        let mut container = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        container.extend_from_slice(&nonce_bytes);
        container.extend_from_slice(&ciphertext);

        log::info!(
            "Encrypted {} bytes for {} ({} byte container)",
            file.len(),
            fingerprint(public_key),
            container.len()
        );

        Ok(EncryptedFile {
            container: EncryptedContainer(container),
            key_blob: EncryptedKeyBlob(encapsulated.ciphertext),
        })
    }

    /// Recover the plaintext. Any authentication failure is `DecryptionFailed`.
    pub async fn decrypt(
        &self,
        container: &EncryptedContainer,
        key_blob: &EncryptedKeyBlob,
        private_key: &[u8],
    ) -> Result<Vec<u8>> {
        if container.len() < MIN_CONTAINER_BYTES {
            return Err(FileCryptError::DecryptionFailed);
        }

        let shared_secret = self.kem.decapsulate(private_key, key_blob.as_bytes()).await?;
        let key = derive_aead_key(&shared_secret)?;

        let (nonce_bytes, ciphertext) = container.as_bytes().split_at(NONCE_BYTES);
        let nonce = Nonce::from_slice(nonce_bytes);

        let cipher = ChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|_| FileCryptError::KeyDerivationFailed)?;

        let plaintext = cipher.decrypt(nonce, ciphertext).map_err(|_| {
            log::warn!("Container authentication failed ({} bytes)", container.len());
            FileCryptError::DecryptionFailed
        })?;

        log::info!("Decrypted {} byte container", container.len());
        Ok(plaintext)
    }
}

/// HKDF-SHA256 of the KEM shared secret into the 32-byte AEAD key
fn derive_aead_key(shared_secret: &SharedSecret) -> Result<Zeroizing<[u8; 32]>> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(AEAD_KEY_INFO, &mut key[..])
        .map_err(|_| FileCryptError::KeyDerivationFailed)?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityLevel;
    use crate::module::testing::builtin_config;
    use std::collections::HashSet;

    fn engine() -> HybridEngine {
        HybridEngine::from_config(builtin_config()).unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip_sizes() {
        let engine = engine();
        let pair = engine.generate_key_pair().await.unwrap();

        for len in [0usize, 1, 4096, 100_000] {
            let file: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let enc = engine.encrypt(&file, &pair.public_key).await.unwrap();
            assert_eq!(enc.container.len(), len + MIN_CONTAINER_BYTES);
            assert_eq!(enc.key_blob.len(), 1088);

            let out = engine
                .decrypt(&enc.container, &enc.key_blob, &pair.private_key)
                .await
                .unwrap();
            assert_eq!(out, file);
        }
    }

    #[tokio::test]
    async fn test_hello_scenario_sizes() {
        let engine = engine();
        let pair = engine.generate_key_pair().await.unwrap();
        let enc = engine.encrypt(b"hello test", &pair.public_key).await.unwrap();

        assert_eq!(enc.container.len(), 38);
        assert_eq!(enc.key_blob.len(), 1088);

        let container = EncryptedContainer::from_bytes(enc.container.as_bytes().to_vec());
        let key_blob = EncryptedKeyBlob::from_bytes(enc.key_blob.clone().into_bytes());
        let out = engine.decrypt(&container, &key_blob, &pair.private_key).await.unwrap();
        assert_eq!(out, b"hello test");
    }

    #[tokio::test]
    async fn test_nonce_uniqueness() {
        let engine = engine();
        let pair = engine.generate_key_pair().await.unwrap();

        let mut nonces = HashSet::new();
        let mut blobs = HashSet::new();
        for _ in 0..256 {
            let enc = engine.encrypt(b"same file", &pair.public_key).await.unwrap();
            assert!(nonces.insert(enc.container.nonce().unwrap().to_vec()));
            assert!(blobs.insert(enc.key_blob.into_bytes()));
        }
        assert_eq!(nonces.len(), 256);
    }

    #[tokio::test]
    async fn test_tampering_detected() {
        let engine = engine();
        let pair = engine.generate_key_pair().await.unwrap();
        let enc = engine.encrypt(b"hello test", &pair.public_key).await.unwrap();
        let bytes = enc.container.as_bytes().to_vec();
        assert_eq!(bytes.len(), 38);

        for index in 0..bytes.len() {
            let mut tampered = bytes.clone();
            tampered[index] ^= 0x01;
            let err = engine
                .decrypt(
                    &EncryptedContainer::from_bytes(tampered),
                    &enc.key_blob,
                    &pair.private_key,
                )
                .await
                .unwrap_err();
            assert_eq!(err, FileCryptError::DecryptionFailed, "flip at {}", index);
        }

        let mut blob = enc.key_blob.as_bytes().to_vec();
        blob[10] ^= 0x80;
        let err = engine
            .decrypt(&enc.container, &EncryptedKeyBlob::from_bytes(blob), &pair.private_key)
            .await
            .unwrap_err();
        assert_eq!(err, FileCryptError::DecryptionFailed);
    }

    #[tokio::test]
    async fn test_wrong_private_key() {
        let engine = engine();
        let alice = engine.generate_key_pair().await.unwrap();
        let mallory = engine.generate_key_pair().await.unwrap();

        let enc = engine.encrypt(b"for alice", &alice.public_key).await.unwrap();
        let err = engine
            .decrypt(&enc.container, &enc.key_blob, &mallory.private_key)
            .await
            .unwrap_err();
        assert_eq!(err, FileCryptError::DecryptionFailed);
        assert_eq!(err.to_string(), "Decryption failed");
    }

    #[tokio::test]
    async fn test_short_container_rejected_before_kem() {
        let engine = engine();
        let short = EncryptedContainer::from_bytes(vec![0u8; MIN_CONTAINER_BYTES - 1]);
        let blob = EncryptedKeyBlob::from_bytes(vec![0u8; 1088]);

        let err = engine.decrypt(&short, &blob, &[0u8; 2400]).await.unwrap_err();
        assert_eq!(err, FileCryptError::DecryptionFailed);
        assert!(!engine.is_ready());
    }

    #[tokio::test]
    async fn test_invalid_key_lengths() {
        let engine = engine();
        let err = engine.encrypt(b"data", &[0u8; 32]).await.unwrap_err();
        assert!(matches!(err, FileCryptError::InvalidInputLength { what: "public key", .. }));

        let pair = engine.generate_key_pair().await.unwrap();
        let enc = engine.encrypt(b"data", &pair.public_key).await.unwrap();
        let short_blob = EncryptedKeyBlob::from_bytes(enc.key_blob.as_bytes()[..100].to_vec());
        let err = engine
            .decrypt(&enc.container, &short_blob, &pair.private_key)
            .await
            .unwrap_err();
        assert!(matches!(err, FileCryptError::InvalidInputLength { what: "ciphertext", .. }));
    }

    #[tokio::test]
    async fn test_no_leaked_allocations() {
        let engine = engine();
        let pair = engine.generate_key_pair().await.unwrap();
        let handle = engine.kem().manager().handle().unwrap();
        let stats = handle.stats();
        assert_eq!(stats.live_bytes(), 0);

        for _ in 0..5 {
            let enc = engine.encrypt(b"payload", &pair.public_key).await.unwrap();
            assert_eq!(stats.live_bytes(), 0);
            assert_eq!(stats.live_buffers(), 0);

            engine
                .decrypt(&enc.container, &enc.key_blob, &pair.private_key)
                .await
                .unwrap();
            assert_eq!(stats.live_bytes(), 0);
            assert_eq!(stats.live_buffers(), 0);
        }

        assert_eq!(stats.total_allocations(), 2 + 5 * 6);
        assert_eq!(stats.total_allocations(), stats.total_frees());
    }

    #[tokio::test]
    async fn test_level5_engine() {
        let config = EngineConfig {
            security_level: SecurityLevel::Level5,
            ..builtin_config()
        };
        let engine = HybridEngine::from_config(config).unwrap();
        let pair = engine.generate_key_pair().await.unwrap();
        assert_eq!(pair.public_key.len(), 1568);

        let enc = engine.encrypt(b"level five", &pair.public_key).await.unwrap();
        assert_eq!(enc.key_blob.len(), 1568);
        let out = engine
            .decrypt(&enc.container, &enc.key_blob, &pair.private_key)
            .await
            .unwrap();
        assert_eq!(out, b"level five");
    }

    #[tokio::test]
    async fn test_readiness_surface() {
        let engine = engine();
        assert!(!engine.is_ready());
        engine.wait_for_ready(Duration::from_secs(5)).await.unwrap();
        assert!(engine.is_ready());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_encryptions_share_module() {
        let engine = engine();
        let pair = engine.generate_key_pair().await.unwrap();

        let tasks: Vec<_> = (0..16u8)
            .map(|i| {
                let engine = engine.clone();
                let public_key = pair.public_key.clone();
                tokio::spawn(async move {
                    let file = vec![i; 1024];
                    let enc = engine.encrypt(&file, &public_key).await.unwrap();
                    (file, enc)
                })
            })
            .collect();

        for task in tasks {
            let (file, enc) = task.await.unwrap();
            let out = engine
                .decrypt(&enc.container, &enc.key_blob, &pair.private_key)
                .await
                .unwrap();
            assert_eq!(out, file);
        }
        assert_eq!(engine.kem().manager().attempts(), 1);
    }

    #[test]
    fn test_aead_key_is_domain_separated() {
        let secret = SharedSecret::from_slice(&[7u8; 32]).unwrap();
        let key = derive_aead_key(&secret).unwrap();
        assert_ne!(&key[..], &secret.as_bytes()[..]);
        assert_eq!(*key, *derive_aead_key(&secret).unwrap());
    }
}
