use super::*;
use std::collections::HashMap;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn defaults_match_constants() {
    let cfg = ClientConfig::from_lookup(lookup_from(&[])).unwrap();
    assert_eq!(cfg, ClientConfig::default());
    assert_eq!(cfg.request_timeout, Duration::from_millis(5000));
    assert_eq!(cfg.connect_attempts, 3);
    assert_eq!(cfg.server_url, DEFAULT_WS_URL);
}

#[test]
fn overrides_are_parsed() {
    let cfg = ClientConfig::from_lookup(lookup_from(&[
        ("MESSENGER_WS_URL", "wss://chat.example.test/ws"),
        ("MESSENGER_REQUEST_TIMEOUT_MS", "250"),
        ("MESSENGER_CONNECT_ATTEMPTS", " 5 "),
        ("MESSENGER_RETRY_DELAY_MS", "10"),
        ("MESSENGER_SESSION_PATH", "/tmp/me.json"),
    ]))
    .unwrap();

    assert_eq!(cfg.server_url, "wss://chat.example.test/ws");
    assert_eq!(cfg.request_timeout, Duration::from_millis(250));
    assert_eq!(cfg.connect_attempts, 5);
    assert_eq!(cfg.retry_delay, Duration::from_millis(10));
    assert_eq!(cfg.session_path, PathBuf::from("/tmp/me.json"));
}

#[test]
fn invalid_numbers_fall_back_to_defaults() {
    let cfg = ClientConfig::from_lookup(lookup_from(&[("MESSENGER_REQUEST_TIMEOUT_MS", "soon")])).unwrap();
    assert_eq!(cfg.request_timeout, Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS));
}

#[test]
fn http_url_is_rejected() {
    let err = ClientConfig::from_lookup(lookup_from(&[("MESSENGER_WS_URL", "http://localhost:3000")])).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidUrl { .. }));
}

#[test]
fn zero_attempts_is_rejected() {
    let err = ClientConfig::from_lookup(lookup_from(&[("MESSENGER_CONNECT_ATTEMPTS", "0")])).unwrap_err();
    assert_eq!(err.to_string(), "MESSENGER_CONNECT_ATTEMPTS must be at least 1");
}

#[test]
fn from_env_reads_process_environment() {
    unsafe { std::env::set_var("MESSENGER_RETRY_DELAY_MS", "77") };
    let cfg = ClientConfig::from_env().unwrap();
    assert_eq!(cfg.retry_delay, Duration::from_millis(77));
    unsafe { std::env::remove_var("MESSENGER_RETRY_DELAY_MS") };
}
