//! Config module tests

use std::io::Write;

use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;

use super::*;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("MQTTGATE_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${MQTTGATE_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("MQTTGATE_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    std::env::remove_var("MQTTGATE_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${MQTTGATE_TEST_VAR_UNSET:-fallback}\"");
    assert_eq!(result, "value = \"fallback\"");

    std::env::set_var("MQTTGATE_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${MQTTGATE_TEST_VAR_SET:-fallback}\"");
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("MQTTGATE_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("MQTTGATE_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${MQTTGATE_TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.log.level, "warn");
    assert_eq!(config.server.bind.port(), 1883);
    assert_eq!(config.server.accept_threads, 1);
    assert_eq!(config.server.io_threads, 0);
    assert_eq!(config.limits.max_packet_size, 102_400);
    assert_eq!(config.limits.max_queued_messages, 100_000);
    assert_eq!(config.limits.idle_timeout, Duration::from_secs(90));
    assert_eq!(config.codec.charset, Charset::Utf8);
    assert!(!config.auth.enabled);
    assert!(config.auth.allow_anonymous);
}

#[test]
fn test_parse_full_config() {
    let config = Config::parse(
        r#"
[log]
level = "debug"
filter = "mqttgate::gateway=trace"

[server]
bind = "127.0.0.1:2883"
accept_threads = 2
io_threads = 8

[server.tls]
cert = "/etc/mqttgate/server.pem"
key = "/etc/mqttgate/server.key"

[limits]
max_packet_size = 4096
max_queued_messages = 500
idle_timeout = "2m 30s"

[codec]
charset = "ISO-8859-1"

[auth]
enabled = true
allow_anonymous = false

[[auth.users]]
username = "alice"
password = "secret"
"#,
    )
    .unwrap();

    assert_eq!(config.log.level, "debug");
    assert_eq!(config.log.filter.as_deref(), Some("mqttgate::gateway=trace"));
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:2883");
    assert_eq!(config.server.accept_threads, 2);
    assert_eq!(config.server.io_threads, 8);
    assert_eq!(config.limits.max_packet_size, 4096);
    assert_eq!(config.limits.max_queued_messages, 500);
    assert_eq!(config.limits.idle_timeout, Duration::from_secs(150));
    assert_eq!(config.codec.charset, Charset::Latin1);
    assert!(config.auth.enabled);
    assert!(!config.auth.allow_anonymous);
    assert_eq!(config.auth.users.len(), 1);

    let tls = config.server.tls.as_ref().unwrap();
    assert_eq!(tls.cert, "/etc/mqttgate/server.pem");
    assert!(tls.ca_cert.is_none());
    assert!(!tls.require_client_cert);
}

#[test]
fn test_parse_partial_sections_keep_defaults() {
    let config = Config::parse(
        r#"
[limits]
idle_timeout = "5s"
"#,
    )
    .unwrap();

    assert_eq!(config.limits.idle_timeout, Duration::from_secs(5));
    assert_eq!(config.limits.max_packet_size, 102_400);
    assert_eq!(config.server.bind.port(), 1883);
}

#[test]
fn test_unknown_charset_rejected() {
    let result = Config::parse(
        r#"
[codec]
charset = "ebcdic"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_bad_duration_rejected() {
    let result = Config::parse(
        r#"
[limits]
idle_timeout = "soon"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_user_without_password_rejected() {
    let result = Config::parse(
        r#"
[[auth.users]]
username = "bob"
"#,
    );
    match result {
        Err(ConfigError::Validation(msg)) => assert!(msg.contains("bob")),
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn test_user_with_both_secrets_rejected() {
    let result = Config::parse(
        r#"
[[auth.users]]
username = "bob"
password = "x"
password_hash = "$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_non_argon2_hash_rejected() {
    let result = Config::parse(
        r#"
[[auth.users]]
username = "bob"
password_hash = "5f4dcc3b5aa765d61d8327deb882cf99"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_tls_requires_cert_and_key() {
    let result = Config::parse(
        r#"
[server.tls]
cert = ""
key = "server.key"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));

    let result = Config::parse(
        r#"
[server.tls]
cert = "server.pem"
key = "server.key"
require_client_cert = true
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_oversized_packet_limit_rejected() {
    let result = Config::parse(
        r#"
[limits]
max_packet_size = 300000000
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_to_gateway_config_normalizes() {
    let config = Config::parse(
        r#"
[server]
bind = "127.0.0.1:0"
accept_threads = 9
io_threads = 500

[limits]
max_packet_size = 0
max_queued_messages = 0
idle_timeout = "0s"

[server.tls]
cert = "cert.pem"
key = "key.pem"
ca_cert = "ca.pem"
"#,
    )
    .unwrap();

    let gateway = config.to_gateway_config();
    assert_eq!(gateway.bind_addr.to_string(), "127.0.0.1:0");
    assert_eq!(gateway.accept_threads, 5);
    assert_eq!(gateway.io_threads, 100);
    assert_eq!(gateway.max_packet_size, 102_400);
    assert_eq!(gateway.max_queued_messages, 100_000);
    assert_eq!(gateway.idle_timeout, Duration::from_secs(90));

    let tls = gateway.tls.unwrap();
    assert_eq!(tls.cert_path, PathBuf::from("cert.pem"));
    assert_eq!(tls.ca_cert_path, Some(PathBuf::from("ca.pem")));
}

#[test]
fn test_load_with_env_substitution() {
    std::env::set_var("MQTTGATE_TEST_BIND_HOST", "127.0.0.1");
    std::env::set_var("MQTTGATE_TEST_BIND_PORT", "1885");

    let file = write_config(
        r#"
[server]
bind = "${MQTTGATE_TEST_BIND_HOST}:${MQTTGATE_TEST_BIND_PORT}"
io_threads = ${MQTTGATE_TEST_IO_THREADS:-4}

[limits]
idle_timeout = "45s"
"#,
    );

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:1885");
    assert_eq!(config.server.io_threads, 4);
    assert_eq!(config.limits.idle_timeout, Duration::from_secs(45));
    assert_eq!(config.limits.max_queued_messages, 100_000);

    std::env::remove_var("MQTTGATE_TEST_BIND_HOST");
    std::env::remove_var("MQTTGATE_TEST_BIND_PORT");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.limits.idle_timeout, Duration::from_secs(90));
    assert_eq!(config.codec.charset, Charset::Utf8);
    assert!(config.auth.allow_anonymous);
}

#[test]
fn test_env_override() {
    std::env::set_var("MQTTGATE__LOG__FILTER", "mqttgate=debug");

    let file = write_config(
        r#"
[log]
level = "info"
"#,
    );
    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.log.filter.as_deref(), Some("mqttgate=debug"));

    std::env::remove_var("MQTTGATE__LOG__FILTER");
}

#[test]
fn test_load_invalid_toml() {
    let file = write_config("[server\nbind = ");
    assert!(matches!(
        Config::load(file.path()),
        Err(ConfigError::Config(_))
    ));
}
