/// Native reference KEM module
///
/// Implements the foreign function table in-process so the engine can run
/// without an external binary. The KEM itself is the RustCrypto `ml-kem`
/// crate (NIST FIPS 203); everything around it behaves like a separately
/// compiled module: callers see only pointers into a private linear memory,
/// a first-fit allocator, and integer status codes.
///
/// Status codes:
/// - `0`  success
/// - `-1` pointer/length outside linear memory
/// - `-2` primitive failure (malformed key or ciphertext encoding)
/// - `-3` entry point not exported by this instance

use super::{ForeignModule, ForeignPtr, REQUIRED_EXPORTS};
use crate::config::{KemParams, SecurityLevel};
use crate::error::{FileCryptError, Result};
use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{Encoded, EncodedSizeUser, KemCore, MlKem1024, MlKem512, MlKem768};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ops::Range;
use zeroize::{Zeroize, Zeroizing};

pub const STATUS_OK: i32 = 0;
pub const STATUS_BAD_POINTER: i32 = -1;
pub const STATUS_PRIMITIVE_FAILURE: i32 = -2;
pub const STATUS_NOT_EXPORTED: i32 = -3;

/// Linear memory grows in 64 KiB pages
pub const PAGE_SIZE: usize = 64 * 1024;
/// Default ceiling: 16 pages (1 MiB)
pub const DEFAULT_MAX_PAGES: usize = 16;

const HEAP_BASE: usize = 16;
const ALIGN: usize = 8;

fn align_up(value: usize, align: usize) -> Option<usize> {
    value.checked_add(align - 1).map(|v| v / align * align)
}

// ─── Linear memory ───────────────────────────────────────────────────────────

/// Byte-addressed heap with a first-fit allocator.
///
/// Offsets below `HEAP_BASE` are never handed out, so `0` stays null.
pub struct LinearMemory {
    bytes: Vec<u8>,
    max_bytes: usize,
    /// ptr -> reserved length
    allocations: BTreeMap<u32, usize>,
}

impl LinearMemory {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            bytes: vec![0u8; PAGE_SIZE.min(max_bytes.max(HEAP_BASE))],
            max_bytes,
            allocations: BTreeMap::new(),
        }
    }

    /// Reserve `size` bytes, returning `0` when the heap cannot grow further.
    pub fn allocate(&mut self, size: usize) -> u32 {
        let size = match align_up(size.max(1), ALIGN) {
            Some(size) => size,
            None => return 0,
        };

        let mut cursor = HEAP_BASE;
        for (&ptr, &len) in &self.allocations {
            if (ptr as usize).saturating_sub(cursor) >= size {
                break;
            }
            cursor = align_up(ptr as usize + len, ALIGN).unwrap_or(usize::MAX);
        }

        let end = match cursor.checked_add(size) {
            Some(end) if end <= u32::MAX as usize => end,
            _ => return 0,
        };
        if end > self.bytes.len() && !self.grow_to(end) {
            return 0;
        }

        self.allocations.insert(cursor as u32, size);
        cursor as u32
    }

    /// Release an allocation. Unknown pointers are ignored.
    pub fn release(&mut self, ptr: u32) -> bool {
        self.allocations.remove(&ptr).is_some()
    }

    fn grow_to(&mut self, end: usize) -> bool {
        let new_len = match align_up(end, PAGE_SIZE) {
            Some(len) if len <= self.max_bytes => len,
            _ => return false,
        };
        log::debug!(
            "Growing linear memory {} -> {} bytes",
            self.bytes.len(),
            new_len
        );
        self.bytes.resize(new_len, 0);
        true
    }

    /// Bytes currently reserved (after alignment)
    pub fn allocated_bytes(&self) -> usize {
        self.allocations.values().sum()
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn region(&self, ptr: ForeignPtr, len: usize) -> Option<Range<usize>> {
        if ptr == 0 {
            return None;
        }
        let start = ptr as usize;
        let end = start.checked_add(len)?;
        (end <= self.bytes.len()).then_some(start..end)
    }

    fn read(&self, ptr: ForeignPtr, len: usize) -> Option<&[u8]> {
        self.region(ptr, len).map(|r| &self.bytes[r])
    }

    fn write(&mut self, ptr: ForeignPtr, data: &[u8]) -> bool {
        match self.region(ptr, data.len()) {
            Some(r) => {
                self.bytes[r].copy_from_slice(data);
                true
            }
            None => false,
        }
    }
}

impl Drop for LinearMemory {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

// ─── Manifest ────────────────────────────────────────────────────────────────

/// Payload describing a module build: which parameter set it implements and
/// which entry points it exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub name: String,
    pub security_level: SecurityLevel,
    pub exports: Vec<String>,
}

impl ModuleManifest {
    /// Manifest of the in-crate module for `level`, exporting everything
    pub fn builtin(level: SecurityLevel) -> Self {
        Self {
            name: format!("shield-{}", level.algorithm().to_lowercase()),
            security_level: level,
            exports: REQUIRED_EXPORTS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| FileCryptError::ModuleLoadError(format!("invalid module manifest: {}", e)))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| FileCryptError::ModuleLoadError(format!("manifest encoding: {}", e)))
    }
}

// ─── Module ──────────────────────────────────────────────────────────────────

/// In-process ML-KEM module exposing the foreign function table.
pub struct NativeKemModule {
    params: KemParams,
    memory: LinearMemory,
    exports: HashSet<String>,
}

impl NativeKemModule {
    pub fn new(level: SecurityLevel) -> Self {
        Self::with_exports(level, &REQUIRED_EXPORTS)
    }

    pub fn with_exports(level: SecurityLevel, exports: &[&str]) -> Self {
        Self {
            params: level.params(),
            memory: LinearMemory::new(DEFAULT_MAX_PAGES * PAGE_SIZE),
            exports: exports.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn from_manifest(manifest: &ModuleManifest) -> Self {
        Self {
            params: manifest.security_level.params(),
            memory: LinearMemory::new(DEFAULT_MAX_PAGES * PAGE_SIZE),
            exports: manifest.exports.iter().cloned().collect(),
        }
    }

    /// Cap linear memory at `max_bytes` (rounded down to whole pages by growth)
    pub fn with_max_memory(mut self, max_bytes: usize) -> Self {
        self.memory = LinearMemory::new(max_bytes);
        self
    }

    pub fn params(&self) -> &KemParams {
        &self.params
    }

    pub fn allocated_bytes(&self) -> usize {
        self.memory.allocated_bytes()
    }

    fn exported(&self, name: &str) -> bool {
        self.exports.contains(name)
    }
}

impl ForeignModule for NativeKemModule {
    fn has_export(&self, name: &str) -> bool {
        self.exported(name)
    }

    fn malloc(&mut self, size: usize) -> ForeignPtr {
        if !self.exported(super::EXPORT_MALLOC) {
            return 0;
        }
        self.memory.allocate(size)
    }

    fn free(&mut self, ptr: ForeignPtr) {
        if ptr != 0 && !self.memory.release(ptr) {
            log::warn!("free_wrapper called with unknown pointer {:#x}", ptr);
        }
    }

    fn crypto_kem_keypair(&mut self, pk: ForeignPtr, sk: ForeignPtr) -> i32 {
        if !self.exported(super::EXPORT_KEYPAIR) {
            return STATUS_NOT_EXPORTED;
        }
        if self.memory.region(pk, self.params.public_key_bytes).is_none()
            || self.memory.region(sk, self.params.secret_key_bytes).is_none()
        {
            return STATUS_BAD_POINTER;
        }

        let (public_key, secret_key) = match self.params.level {
            SecurityLevel::Level1 => keypair::<MlKem512>(),
            SecurityLevel::Level3 => keypair::<MlKem768>(),
            SecurityLevel::Level5 => keypair::<MlKem1024>(),
        };
        if public_key.len() != self.params.public_key_bytes
            || secret_key.len() != self.params.secret_key_bytes
        {
            return STATUS_PRIMITIVE_FAILURE;
        }

        self.memory.write(pk, &public_key);
        self.memory.write(sk, &secret_key);
        STATUS_OK
    }

    fn crypto_kem_enc(&mut self, ct: ForeignPtr, ss: ForeignPtr, pk: ForeignPtr) -> i32 {
        if !self.exported(super::EXPORT_ENC) {
            return STATUS_NOT_EXPORTED;
        }
        if self.memory.region(ct, self.params.ciphertext_bytes).is_none()
            || self.memory.region(ss, self.params.shared_secret_bytes).is_none()
        {
            return STATUS_BAD_POINTER;
        }
        let public_key = match self.memory.read(pk, self.params.public_key_bytes) {
            Some(bytes) => bytes.to_vec(),
            None => return STATUS_BAD_POINTER,
        };

        let result = match self.params.level {
            SecurityLevel::Level1 => encapsulate::<MlKem512>(&public_key),
            SecurityLevel::Level3 => encapsulate::<MlKem768>(&public_key),
            SecurityLevel::Level5 => encapsulate::<MlKem1024>(&public_key),
        };
        let (ciphertext, shared_secret) = match result {
            Some(out) if out.0.len() == self.params.ciphertext_bytes => out,
            _ => return STATUS_PRIMITIVE_FAILURE,
        };

        self.memory.write(ct, &ciphertext);
        self.memory.write(ss, &shared_secret);
        STATUS_OK
    }

    fn crypto_kem_dec(&mut self, ss: ForeignPtr, ct: ForeignPtr, sk: ForeignPtr) -> i32 {
        if !self.exported(super::EXPORT_DEC) {
            return STATUS_NOT_EXPORTED;
        }
        if self.memory.region(ss, self.params.shared_secret_bytes).is_none() {
            return STATUS_BAD_POINTER;
        }
        let ciphertext = match self.memory.read(ct, self.params.ciphertext_bytes) {
            Some(bytes) => bytes.to_vec(),
            None => return STATUS_BAD_POINTER,
        };
        let secret_key = match self.memory.read(sk, self.params.secret_key_bytes) {
            Some(bytes) => Zeroizing::new(bytes.to_vec()),
            None => return STATUS_BAD_POINTER,
        };

        let result = match self.params.level {
            SecurityLevel::Level1 => decapsulate::<MlKem512>(&secret_key, &ciphertext),
            SecurityLevel::Level3 => decapsulate::<MlKem768>(&secret_key, &ciphertext),
            SecurityLevel::Level5 => decapsulate::<MlKem1024>(&secret_key, &ciphertext),
        };
        match result {
            Some(shared_secret) => {
                self.memory.write(ss, &shared_secret);
                STATUS_OK
            }
            None => STATUS_PRIMITIVE_FAILURE,
        }
    }

    fn memory(&self) -> &[u8] {
        &self.memory.bytes
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory.bytes
    }
}

// ─── ML-KEM primitives ───────────────────────────────────────────────────────

fn keypair<K: KemCore>() -> (Vec<u8>, Zeroizing<Vec<u8>>) {
    let (dk, ek) = K::generate(&mut OsRng);
    let public_key = ek.as_bytes().to_vec();
    let secret_key = Zeroizing::new(dk.as_bytes().to_vec());
    (public_key, secret_key)
}

fn encapsulate<K: KemCore>(public_key: &[u8]) -> Option<(Vec<u8>, Zeroizing<Vec<u8>>)> {
    let encoded = Encoded::<K::EncapsulationKey>::try_from(public_key).ok()?;
    let ek = K::EncapsulationKey::from_bytes(&encoded);
    let (ct, ss) = ek.encapsulate(&mut OsRng).ok()?;
    Some((ct.to_vec(), Zeroizing::new(ss.to_vec())))
}

fn decapsulate<K: KemCore>(secret_key: &[u8], ciphertext: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
    let encoded = Encoded::<K::DecapsulationKey>::try_from(secret_key).ok()?;
    let dk = K::DecapsulationKey::from_bytes(&encoded);
    let ct = ml_kem::Ciphertext::<K>::try_from(ciphertext).ok()?;
    let ss = dk.decapsulate(&ct).ok()?;
    Some(Zeroizing::new(ss.to_vec()))
}
