use sa_domain::config::Config;

#[test]
fn default_session_store_path_is_under_data_dir() {
    let config = Config::default();
    assert_eq!(config.sessions.db_path.to_str().unwrap(), "./data/sessions.db");
}

#[test]
fn explicit_queue_overrides_parse() {
    let toml_str = r#"
[queue]
visibility_timeout_secs = 120
default_max_retries = 5
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.queue.visibility_timeout_secs, 120);
    assert_eq!(config.queue.default_max_retries, 5);
    assert!(config.validate().is_empty());
}

#[test]
fn empty_document_uses_every_default() {
    let config: Config = toml::from_str("").unwrap();
    assert!(config.validate().is_empty());
    assert_eq!(config.observability.service_name, "serialagent");
}
