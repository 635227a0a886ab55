use serial_test::serial;
use temp_env::with_vars;

use super::*;
use crate::ErrorKind;

fn cleanup_all_unikv_env_vars() {
    for (key, _) in std::env::vars() {
        if key.starts_with("UNIKV__") || key == CONFIG_PATH_ENV {
            std::env::remove_var(&key);
        }
    }
}

fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("unikv.toml");
    std::fs::write(&config_path, content).unwrap();
    (temp_dir, config_path)
}

#[test]
#[serial]
fn default_config_should_initialize_with_hardcoded_values() {
    let config = KvConfig::default();

    assert_eq!(config.backend, BackendKind::Memory);
    assert_eq!(config.codec, CodecKind::Proto);
    assert_eq!(config.etcd.endpoints, vec!["127.0.0.1:2379".to_string()]);
    assert_eq!(config.etcd.op_timeout, 3_000);
    assert_eq!(config.embedded.bucket_separator, "/");
    assert!(!config.embedded.split_key_to_buckets);
    assert!(!config.watch.filter_dup_notifs);
    assert!(!config.crypto.enabled());
}

#[test]
#[serial]
fn new_without_sources_should_fall_back_to_defaults() {
    cleanup_all_unikv_env_vars();
    let config = KvConfig::new().unwrap();

    assert_eq!(config.backend, BackendKind::Memory);
    assert_eq!(config.redis.endpoints, vec!["redis://127.0.0.1:6379".to_string()]);
}

#[test]
#[serial]
fn from_file_should_read_kebab_case_options() {
    cleanup_all_unikv_env_vars();
    let (_dir, path) = write_config(
        r#"
        backend = "etcd"
        codec = "json"

        [etcd]
        endpoints = ["10.0.0.1:2379", "10.0.0.2:2379"]
        dial-timeout = 250
        op-timeout = 700
        insecure-transport = true

        [watch]
        filter-dup-notifs = true
        "#,
    );

    let config = KvConfig::from_file(&path).unwrap().validate().unwrap();

    assert_eq!(config.backend, BackendKind::Etcd);
    assert_eq!(config.codec, CodecKind::Json);
    assert_eq!(config.etcd.endpoints.len(), 2);
    assert_eq!(config.etcd.dial_timeout, 250);
    assert!(config.etcd.tls.insecure_transport);
    assert!(config.watch.filter_dup_notifs);
    assert_eq!(config.op_timeout(), Duration::from_millis(700));
    assert_eq!(config.delivery_timeout(), Duration::from_millis(700));
}

#[test]
#[serial]
fn environment_should_override_file_settings() {
    cleanup_all_unikv_env_vars();
    let (_dir, path) = write_config(
        r#"
        backend = "embedded"

        [embedded]
        db-path = "/tmp/from-file"
        "#,
    );

    with_vars(
        vec![
            ("UNIKV__EMBEDDED__DB_PATH", Some("/tmp/from-env")),
            ("UNIKV__EMBEDDED__SPLIT_KEY_TO_BUCKETS", Some("true")),
        ],
        || {
            let config = KvConfig::from_file(&path).unwrap();

            assert_eq!(config.embedded.db_path, "/tmp/from-env");
            assert!(config.embedded.split_key_to_buckets);
        },
    );
}

#[test]
#[serial]
fn new_should_honour_config_path_variable() {
    cleanup_all_unikv_env_vars();
    let (_dir, path) = write_config(
        r#"
        backend = "filedb"

        [filedb]
        paths = ["/etc/unikv/data.json"]
        "#,
    );

    with_vars(vec![(CONFIG_PATH_ENV, Some(path.to_str().unwrap()))], || {
        let config = KvConfig::new().unwrap();
        assert_eq!(config.backend, BackendKind::Filedb);
        assert_eq!(config.filedb.paths, vec!["/etc/unikv/data.json".to_string()]);
    });
}

#[test]
fn validate_should_reject_empty_etcd_endpoints() {
    let mut config = KvConfig {
        backend: BackendKind::Etcd,
        ..Default::default()
    };
    config.etcd.endpoints.clear();

    let err = config.validate().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn validate_should_reject_half_configured_mutual_tls() {
    let mut config = KvConfig {
        backend: BackendKind::Etcd,
        ..Default::default()
    };
    config.etcd.tls.cert_file = Some("/tmp/client.pem".into());

    assert!(config.validate().is_err());
}

#[test]
fn validate_should_only_check_the_selected_backend() {
    let mut config = KvConfig::default();
    config.filedb.paths.clear();
    config.redis.endpoints.clear();

    assert!(config.validate().is_ok());
}

#[test]
fn validate_should_reject_zero_delivery_timeout() {
    let mut config = KvConfig::default();
    config.watch.delivery_timeout = Some(0);

    assert!(config.validate().is_err());
}

#[test]
fn validate_should_reject_zero_reconnect_timeout() {
    let mut config = KvConfig::default();
    config.watch.reconnect_timeout = Some(0);

    assert!(config.validate().is_err());
}

#[test]
fn reconnect_policy_spans_the_configured_window() {
    let mut config = KvConfig::default();
    assert_eq!(config.watch.reconnect_policy().timeout_ms, 30_000);

    config.watch.reconnect_timeout = Some(1_000);
    let policy = config.watch.reconnect_policy();
    assert_eq!(policy.timeout_ms, 1_000);
    assert_eq!(policy.base_delay_ms, 100);
    assert!(policy.max_retries > 1);
}

#[test]
fn validate_should_reject_missing_private_key_file() {
    let mut config = KvConfig::default();
    config.crypto.private_key_files = vec!["/definitely/not/here.pem".into()];

    assert!(config.crypto.enabled());
    assert!(config.validate().is_err());
}

#[test]
fn redis_cluster_mode_follows_endpoint_count() {
    let mut redis = RedisConfig::default();
    assert!(!redis.is_cluster());

    redis.endpoints.push("redis://127.0.0.1:7001".into());
    assert!(redis.is_cluster());
}

#[test]
#[serial]
fn file_config_source_should_report_missing_file_as_unconfigured() {
    let source = FileConfigSource::new("/definitely/not/here.toml");
    assert!(source.load("kv").unwrap().is_none());

    let source = FileConfigSource::default();
    assert!(source.load("kv").unwrap().is_none());
}

#[test]
fn env_key_to_path_should_produce_kebab_case_segments() {
    assert_eq!(env_key_to_path("ETCD__OP_TIMEOUT"), "etcd.op-timeout");
    assert_eq!(env_key_to_path("BACKEND"), "backend");
    assert_eq!(
        env_key_to_path("CRYPTO__PRIVATE_KEY_FILES"),
        "crypto.private-key-files"
    );
}

#[test]
#[serial]
fn list_options_should_split_on_commas() {
    cleanup_all_unikv_env_vars();
    with_vars(
        vec![("UNIKV__ETCD__ENDPOINTS", Some("10.0.0.1:2379, 10.0.0.2:2379"))],
        || {
            let config = KvConfig::new().unwrap();
            assert_eq!(
                config.etcd.endpoints,
                vec!["10.0.0.1:2379".to_string(), "10.0.0.2:2379".to_string()]
            );
        },
    );
}
