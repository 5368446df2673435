#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use shield_filecrypt::{EngineConfig, FileCryptError, KemFacade, ModuleManager};
use std::sync::OnceLock;
use tokio::runtime::Runtime;

#[derive(Debug, Arbitrary)]
struct Input {
    public_key_len: u16,
    private_key_len: u16,
    ciphertext_len: u16,
    fill: u8,
}

fn harness() -> &'static (Runtime, KemFacade) {
    static HARNESS: OnceLock<(Runtime, KemFacade)> = OnceLock::new();
    HARNESS.get_or_init(|| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let config = EngineConfig {
            module_locations: vec!["builtin:ml-kem".into()],
            ..EngineConfig::default()
        };
        let kem = KemFacade::new(ModuleManager::native(config).unwrap());
        runtime.block_on(kem.generate_key_pair()).unwrap();
        (runtime, kem)
    })
}

fuzz_target!(|input: Input| {
    let (runtime, kem) = harness();
    let params = kem.params();

    let public_key = vec![input.fill; input.public_key_len as usize];
    let private_key = vec![input.fill; input.private_key_len as usize];
    let ciphertext = vec![input.fill; input.ciphertext_len as usize];

    let enc = runtime.block_on(kem.encapsulate(&public_key));
    if public_key.len() != params.public_key_bytes {
        assert!(matches!(enc, Err(FileCryptError::InvalidInputLength { .. })));
    }

    let dec = runtime.block_on(kem.decapsulate(&private_key, &ciphertext));
    if private_key.len() != params.secret_key_bytes || ciphertext.len() != params.ciphertext_bytes {
        assert!(matches!(dec, Err(FileCryptError::InvalidInputLength { .. })));
    }

    let handle = kem.manager().handle().unwrap();
    assert_eq!(handle.stats().live_bytes(), 0, "foreign buffers leaked");
    assert_eq!(handle.stats().live_buffers(), 0);
});
