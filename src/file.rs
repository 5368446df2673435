/// File artifacts for the encrypt/decrypt flow
///
/// Encrypting `report.pdf` produces three files next to each other:
///
/// | File                         | Content                     |
/// |------------------------------|-----------------------------|
/// | `report.pdf.enc`             | container (nonce ‖ ct+tag)  |
/// | `report.pdf.encrypted.key`   | key blob (KEM ciphertext)   |
/// | `report.pdf.private.key`     | recipient private key       |
///
/// Decryption writes the plaintext under the container name minus `.enc`.
use crate::engine::{EncryptedContainer, EncryptedKeyBlob, HybridEngine};
use crate::error::{FileCryptError, Result};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const CONTAINER_SUFFIX: &str = ".enc";
const ENCRYPTED_KEY_SUFFIX: &str = ".encrypted.key";
const PRIVATE_KEY_SUFFIX: &str = ".private.key";
const DECRYPTED_SUFFIX: &str = ".decrypted";

/// Paths written by [`encrypt_file`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedArtifacts {
    pub container: PathBuf,
    pub encrypted_key: PathBuf,
    pub private_key: PathBuf,
}

pub fn container_name(file_name: &str) -> String {
    format!("{}{}", file_name, CONTAINER_SUFFIX)
}

pub fn encrypted_key_name(file_name: &str) -> String {
    format!("{}{}", file_name, ENCRYPTED_KEY_SUFFIX)
}

pub fn private_key_name(file_name: &str) -> String {
    format!("{}{}", file_name, PRIVATE_KEY_SUFFIX)
}

/// Output name for a decrypted container: strip a trailing `.enc`, or
/// append `.decrypted` when there is none to strip
pub fn decrypted_name(container_name: &str) -> String {
    match container_name.strip_suffix(CONTAINER_SUFFIX) {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => format!("{}{}", container_name, DECRYPTED_SUFFIX),
    }
}

/// Encrypt `input` to a freshly generated key pair and write the three
/// artifacts into `out_dir`.
pub async fn encrypt_file(engine: &HybridEngine, input: &Path, out_dir: &Path) -> Result<EncryptedArtifacts> {
    let name = file_name(input)?;
    let plaintext = Zeroizing::new(read(input).await?);

    let pair = engine.generate_key_pair().await?;
    let encrypted = engine.encrypt(&plaintext, &pair.public_key).await?;

    tokio::fs::create_dir_all(out_dir)
        .await
        .map_err(|e| FileCryptError::io(out_dir, e))?;

    let artifacts = EncryptedArtifacts {
        container: out_dir.join(container_name(&name)),
        encrypted_key: out_dir.join(encrypted_key_name(&name)),
        private_key: out_dir.join(private_key_name(&name)),
    };
    write(&artifacts.container, encrypted.container.as_bytes()).await?;
    write(&artifacts.encrypted_key, encrypted.key_blob.as_bytes()).await?;
    write(&artifacts.private_key, &pair.private_key).await?;

    log::info!("Wrote encrypted artifacts for {} to {}", name, out_dir.display());
    Ok(artifacts)
}

/// Decrypt a container with its key blob and private key, writing the
/// plaintext into `out_dir`. Nothing is written unless decryption succeeds.
pub async fn decrypt_file(
    engine: &HybridEngine,
    container: &Path,
    encrypted_key: &Path,
    private_key: &Path,
    out_dir: &Path,
) -> Result<PathBuf> {
    let name = file_name(container)?;
    let container_bytes = EncryptedContainer::from_bytes(read(container).await?);
    let key_blob = EncryptedKeyBlob::from_bytes(read(encrypted_key).await?);
    let private_key = Zeroizing::new(read(private_key).await?);

    let plaintext = Zeroizing::new(
        engine
            .decrypt(&container_bytes, &key_blob, &private_key)
            .await?,
    );

    tokio::fs::create_dir_all(out_dir)
        .await
        .map_err(|e| FileCryptError::io(out_dir, e))?;
    let output = out_dir.join(decrypted_name(&name));
    write(&output, &plaintext).await?;

    log::info!("Wrote {} decrypted bytes to {}", plaintext.len(), output.display());
    Ok(output)
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| FileCryptError::Io {
            path: path.display().to_string(),
            message: "path has no usable file name".into(),
        })
}

async fn read(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| FileCryptError::io(path, e))
}

async fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| FileCryptError::io(path, e))
}
