use super::*;

use std::collections::HashMap;

fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn socket_url_targets_app_key_with_protocol_query() {
    let settings = RealtimeSettings {
        broker_host: "ws.gym.test".into(),
        broker_port: 443,
        broker_scheme: "wss".into(),
        app_key: "gym-key".into(),
        ..RealtimeSettings::default()
    };
    let url = settings.socket_url().expect("url");
    assert_eq!(url.scheme(), "wss");
    assert_eq!(url.path(), "/app/gym-key");
    let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
    assert_eq!(query.get("protocol").map(String::as_str), Some("7"));
    assert_eq!(query.get("flash").map(String::as_str), Some("false"));
}

#[test]
fn socket_url_requires_app_key_and_ws_scheme() {
    let missing_key = RealtimeSettings::default();
    assert!(matches!(
        missing_key.socket_url(),
        Err(ConfigError::MissingAppKey)
    ));

    let bad_scheme = RealtimeSettings {
        app_key: "k".into(),
        broker_scheme: "https".into(),
        ..RealtimeSettings::default()
    };
    assert!(matches!(
        bad_scheme.socket_url(),
        Err(ConfigError::UnsupportedScheme(scheme)) if scheme == "https"
    ));
}

#[test]
fn auth_url_appends_endpoint_once() {
    let settings = RealtimeSettings {
        api_base_url: "https://api.gym.test/api/".into(),
        ..RealtimeSettings::default()
    };
    assert_eq!(
        settings.auth_url().expect("auth url").as_str(),
        "https://api.gym.test/api/broadcasting/auth"
    );
}

#[test]
fn parses_partial_toml_over_defaults() {
    let settings = parse_settings(
        r#"
        app_key = "from-file"
        auth_timeout_ms = 2500

        [reconnect]
        max_attempts = 0
        "#,
    )
    .expect("settings");
    assert_eq!(settings.app_key, "from-file");
    assert_eq!(settings.auth_timeout(), Duration::from_millis(2500));
    assert_eq!(settings.broker_port, 8080);
    assert!(settings.reconnect.enabled);
    assert!(settings.reconnect.allows(1_000));
}

#[test]
fn app_prefixed_env_wins_over_reverb_names() {
    let mut settings = RealtimeSettings::default();
    apply_env_overrides(
        &mut settings,
        env_of(&[
            ("REVERB_HOST", "reverb.local"),
            ("APP__BROKER_HOST", "override.local"),
            ("REVERB_PORT", "6001"),
            ("REVERB_SCHEME", "https"),
            ("REVERB_APP_KEY", "env-key"),
            ("APP__RECONNECT_ENABLED", "false"),
            ("APP__AUTH_TIMEOUT_MS", "not-a-number"),
        ]),
    );
    assert_eq!(settings.broker_host, "override.local");
    assert_eq!(settings.broker_port, 6001);
    assert_eq!(settings.broker_scheme, "wss");
    assert_eq!(settings.app_key, "env-key");
    assert!(!settings.reconnect.enabled);
    assert_eq!(settings.auth_timeout_ms, 10_000);
}

#[test]
fn reconnect_delay_doubles_up_to_cap() {
    let policy = ReconnectPolicy {
        enabled: true,
        initial_delay_ms: 100,
        max_delay_ms: 1_000,
        max_attempts: 3,
    };
    assert_eq!(policy.delay_for(0), Duration::from_millis(100));
    assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    assert_eq!(policy.delay_for(10), Duration::from_millis(1_000));
    assert!(policy.allows(2));
    assert!(!policy.allows(3));
}

#[test]
fn announced_activity_timeout_is_capped_by_settings() {
    let settings = RealtimeSettings {
        activity_timeout_secs: 60,
        ..RealtimeSettings::default()
    };
    assert_eq!(settings.activity_timeout(Some(120)), Duration::from_secs(60));
    assert_eq!(settings.activity_timeout(Some(30)), Duration::from_secs(30));
    assert_eq!(settings.activity_timeout(None), Duration::from_secs(60));
}
