use followups::config::{ConfigError, ConfigLoader};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const TEST_KEY_B64: &str = "YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=";

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    let keys: Vec<String> = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("LOOM_"))
        .collect();
    unsafe {
        for key in keys {
            env::remove_var(key);
        }
    }
}

fn set_required_secrets() {
    unsafe {
        env::set_var("LOOM_CRYPTO_KEY", TEST_KEY_B64);
        env::set_var("LOOM_OPERATOR_TOKEN", "test-token");
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn empty_loader() -> (TempDir, ConfigLoader) {
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    (temp_dir, loader)
}

#[test]
fn loads_defaults_when_only_secrets_present() {
    let _guard = env_guard();
    clear_env();
    set_required_secrets();

    let (_dir, loader) = empty_loader();
    let cfg = loader.load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.log_format, "json");
    assert_eq!(cfg.operator_tokens, vec!["test-token".to_string()]);
    assert_eq!(cfg.crypto_key.as_ref().map(Vec::len), Some(32));

    assert_eq!(cfg.worker.tick_interval_seconds, 300);
    assert_eq!(cfg.worker.batch_size, 50);
    assert_eq!(cfg.worker.send_timeout_seconds, 30);
    assert_eq!(cfg.worker.stale_claim_seconds, 900);
    assert!(!cfg.worker.embedded);

    assert_eq!(cfg.drafts.model, "gpt-4o-mini");
    assert!(!cfg.drafts.is_enabled());
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "LOOM_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "LOOM_API_BIND_ADDR=192.168.0.10:5000\nLOOM_WORKER_BATCH_SIZE=10\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "LOOM_API_BIND_ADDR=10.0.0.5:6000\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        &format!(
            "LOOM_PROFILE=test\nLOOM_API_BIND_ADDR=127.0.0.1:4000\nLOOM_OPERATOR_TOKEN=layered-token\nLOOM_CRYPTO_KEY={}\n",
            TEST_KEY_B64
        ),
    );

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.worker.batch_size, 10);
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "LOOM_API_BIND_ADDR=127.0.0.1:3000\nLOOM_WORKER_TICK_INTERVAL_SECONDS=60\n",
    );

    set_required_secrets();
    unsafe {
        env::set_var("LOOM_API_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("LOOM_WORKER_TICK_INTERVAL_SECONDS", "15");
    }

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.worker.tick_interval_seconds, 15);

    clear_env();
}

#[test]
fn operator_tokens_accept_a_list() {
    let _guard = env_guard();
    clear_env();
    set_required_secrets();
    unsafe {
        env::set_var("LOOM_OPERATOR_TOKENS", "alpha, beta ,gamma");
    }

    let (_dir, loader) = empty_loader();
    let cfg = loader.load().expect("config loads");
    assert_eq!(cfg.operator_tokens, vec!["alpha", "beta", "gamma"]);

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();
    set_required_secrets();
    unsafe {
        env::set_var("LOOM_API_BIND_ADDR", "not-an-addr");
    }

    let (_dir, loader) = empty_loader();
    let err = loader.load().expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid api bind address"));

    clear_env();
}

#[test]
fn missing_crypto_key_is_rejected() {
    let _guard = env_guard();
    clear_env();
    unsafe {
        env::set_var("LOOM_OPERATOR_TOKEN", "test-token");
    }

    let (_dir, loader) = empty_loader();
    let err = loader.load().expect_err("crypto key is required");
    assert!(matches!(err, ConfigError::MissingCryptoKey));

    clear_env();
}

#[test]
fn short_crypto_key_is_rejected() {
    let _guard = env_guard();
    clear_env();
    set_required_secrets();
    unsafe {
        // 16 bytes
        env::set_var("LOOM_CRYPTO_KEY", "YWFhYWFhYWFhYWFhYWFhYQ==");
    }

    let (_dir, loader) = empty_loader();
    let err = loader.load().expect_err("short key should fail");
    assert!(matches!(
        err,
        ConfigError::InvalidCryptoKeyLength { length: 16 }
    ));

    clear_env();
}

#[test]
fn stale_claim_threshold_must_cover_send_timeout() {
    let _guard = env_guard();
    clear_env();
    set_required_secrets();
    unsafe {
        env::set_var("LOOM_WORKER_SEND_TIMEOUT_SECONDS", "60");
        env::set_var("LOOM_WORKER_STALE_CLAIM_SECONDS", "30");
    }

    let (_dir, loader) = empty_loader();
    let err = loader.load().expect_err("stale threshold below timeout");
    assert!(matches!(
        err,
        ConfigError::InvalidWorkerStaleClaim {
            value: 30,
            send_timeout: 60
        }
    ));

    clear_env();
}

#[test]
fn drafts_enabled_by_api_key() {
    let _guard = env_guard();
    clear_env();
    set_required_secrets();
    unsafe {
        env::set_var("LOOM_DRAFTS_API_KEY", "sk-test");
        env::set_var("LOOM_DRAFTS_MODEL", "gpt-4o");
    }

    let (_dir, loader) = empty_loader();
    let cfg = loader.load().expect("config loads");
    assert!(cfg.drafts.is_enabled());
    assert_eq!(cfg.drafts.model, "gpt-4o");

    let redacted = cfg.redacted_json().unwrap();
    assert!(!redacted.contains("sk-test"));
    assert!(!redacted.contains("test-token"));

    clear_env();
}
