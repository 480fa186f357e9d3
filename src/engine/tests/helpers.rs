use crate::engine::{Engine, EngineConfig};
use crate::index::IndexBackend;
use crate::key::Key;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Resolver-backed in-memory index, shards large enough to never rotate.
pub fn in_memory_config() -> EngineConfig {
    init_tracing();
    EngineConfig::default()
}

/// Direct-indexing mode: integer keys are slots.
pub fn direct_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        backend: IndexBackend::InMemory { direct: true },
        ..EngineConfig::default()
    }
}

pub fn durable_int_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        backend: IndexBackend::DurableInt,
        commit_interval: 16,
        ..EngineConfig::default()
    }
}

pub fn durable_str_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        backend: IndexBackend::DurableStr,
        ..EngineConfig::default()
    }
}

/// Tiny shards that rotate every few values.
pub fn small_shard_config(shard_size: u64) -> EngineConfig {
    init_tracing();
    EngineConfig {
        shard_size,
        ..EngineConfig::default()
    }
}

/// Every backend paired with a key generator it accepts.
pub fn all_backends() -> Vec<(EngineConfig, fn(u32) -> Key)> {
    fn int_key(n: u32) -> Key {
        Key::Int(i64::from(n))
    }
    fn str_key(n: u32) -> Key {
        Key::from(format!("key-{n:05}"))
    }
    vec![
        (in_memory_config(), str_key),
        (in_memory_config(), int_key),
        (direct_config(), int_key),
        (durable_int_config(), int_key),
        (durable_str_config(), str_key),
    ]
}

/// Saves and closes `engine`, then loads it back from `dir`.
pub fn reopen(mut engine: Engine, dir: &Path, config: &EngineConfig) -> Engine {
    engine.close().expect("close");
    Engine::load(dir, config).expect("load")
}
