#![no_main]
use libfuzzer_sys::fuzz_target;
use shield_filecrypt::{
    EncryptedContainer, EncryptedKeyBlob, EngineConfig, FileCryptError, HybridEngine, KeyPair,
};
use std::sync::OnceLock;
use tokio::runtime::Runtime;

struct Harness {
    runtime: Runtime,
    engine: HybridEngine,
    pair: KeyPair,
    key_blob: EncryptedKeyBlob,
}

fn harness() -> &'static Harness {
    static HARNESS: OnceLock<Harness> = OnceLock::new();
    HARNESS.get_or_init(|| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let config = EngineConfig {
            module_locations: vec!["builtin:ml-kem".into()],
            ..EngineConfig::default()
        };
        let engine = HybridEngine::from_config(config).unwrap();
        let (pair, key_blob) = runtime.block_on(async {
            let pair = engine.generate_key_pair().await.unwrap();
            let sealed = engine.encrypt(b"seed", &pair.public_key).await.unwrap();
            (pair, sealed.key_blob)
        });
        Harness {
            runtime,
            engine,
            pair,
            key_blob,
        }
    })
}

fuzz_target!(|data: &[u8]| {
    let h = harness();

    // Arbitrary container under a valid key blob: only authentication can reject it
    let container = EncryptedContainer::from_bytes(data.to_vec());
    let result = h
        .runtime
        .block_on(h.engine.decrypt(&container, &h.key_blob, &h.pair.private_key));
    assert_eq!(result, Err(FileCryptError::DecryptionFailed));

    // Key blob taken from the input as well: must fail cleanly, never panic
    if data.len() > 1088 {
        let (blob, rest) = data.split_at(1088);
        let _ = h.runtime.block_on(h.engine.decrypt(
            &EncryptedContainer::from_bytes(rest.to_vec()),
            &EncryptedKeyBlob::from_bytes(blob.to_vec()),
            &h.pair.private_key,
        ));
    }

    let handle = h.engine.kem().manager().handle().unwrap();
    assert_eq!(handle.stats().live_bytes(), 0, "foreign buffers leaked");
});
