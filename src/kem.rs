/// KEM facade: key generation, encapsulation and decapsulation over the
/// loaded foreign module
///
/// Every operation validates input lengths against the configured parameter
/// set before touching the module, waits (bounded) for the module to be
/// ready, and then runs one marshaling scope under the module lock.
///
/// Sizes at the default level (ML-KEM-768):
/// - Public key:     1184 bytes
/// - Private key:    2400 bytes
/// - Ciphertext:     1088 bytes
/// - Shared secret:    32 bytes
use crate::config::{KemParams, SHARED_SECRET_BYTES};
use crate::error::{FileCryptError, Result};
use crate::marshal::{expect_len, MarshalScope, Primitive};
use crate::module::{ModuleHandle, ModuleManager};
use std::time::Duration;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// ML-KEM key pair
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    #[zeroize(skip)]
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &fingerprint(&self.public_key))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// 32-byte KEM shared secret, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_BYTES]);

impl SharedSecret {
    pub(crate) fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; SHARED_SECRET_BYTES] =
            bytes
                .try_into()
                .map_err(|_| FileCryptError::InvalidInputLength {
                    what: "shared secret",
                    expected: SHARED_SECRET_BYTES,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_BYTES] {
        &self.0
    }
}

/// Constant-time comparison
impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SharedSecret {}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// Ciphertext to transmit plus the shared secret it encapsulates
#[derive(Debug)]
pub struct EncapsulationResult {
    pub ciphertext: Vec<u8>,
    pub shared_secret: SharedSecret,
}

/// Short BLAKE3 fingerprint of a public key, for logs
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(&blake3::hash(public_key).as_bytes()[..8])
}

/// KEM operations over a [`ModuleManager`]
#[derive(Clone, Debug)]
pub struct KemFacade {
    manager: ModuleManager,
    ready_timeout: Duration,
}

impl KemFacade {
    pub fn new(manager: ModuleManager) -> Self {
        let ready_timeout = manager.config().ready_timeout();
        Self {
            manager,
            ready_timeout,
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn manager(&self) -> &ModuleManager {
        &self.manager
    }

    pub fn params(&self) -> KemParams {
        self.manager.config().params()
    }

    pub async fn generate_key_pair(&self) -> Result<KeyPair> {
        let handle = self.ready_handle().await?;
        let pair = keypair_in(&handle)?;
        log::debug!("Generated key pair {}", fingerprint(&pair.public_key));
        Ok(pair)
    }

    pub async fn encapsulate(&self, public_key: &[u8]) -> Result<EncapsulationResult> {
        let params = self.params();
        expect_len("public key", public_key, params.public_key_bytes)?;

        let handle = self.ready_handle().await?;
        let result = encapsulate_in(&handle, public_key)?;
        log::debug!("Encapsulated to {}", fingerprint(public_key));
        Ok(result)
    }

    pub async fn decapsulate(&self, private_key: &[u8], ciphertext: &[u8]) -> Result<SharedSecret> {
        let params = self.params();
        expect_len("private key", private_key, params.secret_key_bytes)?;
        expect_len("ciphertext", ciphertext, params.ciphertext_bytes)?;

        let handle = self.ready_handle().await?;
        decapsulate_in(&handle, ciphertext, private_key)
    }

    async fn ready_handle(&self) -> Result<ModuleHandle> {
        self.manager
            .wait_for_ready(self.ready_timeout)
            .await
            .map_err(|e| FileCryptError::ModuleNotReady(e.to_string()))?;
        self.manager
            .handle()
            .ok_or_else(|| FileCryptError::ModuleNotReady("no module instance".into()))
    }
}

// ─── Marshaled calls ─────────────────────────────────────────────────────────
//
// Synchronous: the module guard is never held across an await.

fn keypair_in(handle: &ModuleHandle) -> Result<KeyPair> {
    let params = *handle.params();
    let mut module = handle.lock()?;
    let mut scope = MarshalScope::new(&mut **module, handle.stats());

    let [pk, sk] = scope.allocate_all([params.public_key_bytes, params.secret_key_bytes])?;
    let status = scope.module().crypto_kem_keypair(pk.ptr(), sk.ptr());
    Primitive::KeyGen.check(status)?;

    Ok(KeyPair {
        public_key: scope.read(pk)?,
        private_key: scope.read(sk)?,
    })
}

fn encapsulate_in(handle: &ModuleHandle, public_key: &[u8]) -> Result<EncapsulationResult> {
    let params = *handle.params();
    let mut module = handle.lock()?;
    let mut scope = MarshalScope::new(&mut **module, handle.stats());

    let [ct, ss, pk] = scope.allocate_all([
        params.ciphertext_bytes,
        params.shared_secret_bytes,
        params.public_key_bytes,
    ])?;
    scope.write(pk, "public key", public_key)?;
    let status = scope.module().crypto_kem_enc(ct.ptr(), ss.ptr(), pk.ptr());
    Primitive::Encapsulate.check(status)?;

    let shared = Zeroizing::new(scope.read(ss)?);
    Ok(EncapsulationResult {
        ciphertext: scope.read(ct)?,
        shared_secret: SharedSecret::from_slice(&shared)?,
    })
}

fn decapsulate_in(handle: &ModuleHandle, ciphertext: &[u8], private_key: &[u8]) -> Result<SharedSecret> {
    let params = *handle.params();
    let mut module = handle.lock()?;
    let mut scope = MarshalScope::new(&mut **module, handle.stats());

    let [ss, ct, sk] = scope.allocate_all([
        params.shared_secret_bytes,
        params.ciphertext_bytes,
        params.secret_key_bytes,
    ])?;
    scope.write(ct, "ciphertext", ciphertext)?;
    scope.write(sk, "private key", private_key)?;
    let status = scope.module().crypto_kem_dec(ss.ptr(), ct.ptr(), sk.ptr());
    Primitive::Decapsulate.check(status)?;

    let shared = Zeroizing::new(scope.read(ss)?);
    SharedSecret::from_slice(&shared)
}
