use std::collections::HashMap;

use super::*;

fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

const SAMPLE: &str = r#"
api_base_url = "https://proxy.example"
stream_idle_timeout_secs = 15
active_desk = "office"

[[desks]]
id = "home"
access_token = "home-token"

[[desks]]
id = "office"
name = "Office"
access_token = "office-token"
sitting_height = 65
standing_height = 110

[[desks.presets]]
height = 72
name = "Typing"

[[desks.presets]]
height = 110
order = 5

[[desks.presets]]
height = 90
"#;

#[test]
fn parses_desks_presets_and_limits() {
    let settings = parse_settings(SAMPLE, env(&[])).expect("settings");

    assert_eq!(settings.api_base_url.as_str(), "https://proxy.example/");
    assert_eq!(settings.stream_idle_timeout, Duration::from_secs(15));
    assert_eq!(settings.active_desk, Some(DeskId::new("office")));
    assert_eq!(settings.desks.len(), 2);

    let home = &settings.desks[0];
    assert_eq!(home.config.name, "home");
    assert_eq!(home.config.limits, HeightLimits::default());
    assert!(home.presets.is_empty());

    let office = &settings.desks[1];
    assert_eq!(office.config.name, "Office");
    assert_eq!(office.config.credentials.access_token, "office-token");
    assert_eq!(
        office.config.limits,
        HeightLimits {
            sitting_cm: 65,
            standing_cm: 110
        }
    );
    let orders: Vec<(i32, i32)> = office.presets.iter().map(|p| (p.height, p.order)).collect();
    assert_eq!(orders, vec![(72, 0), (110, 5), (90, 6)]);
    assert_eq!(office.presets[0].name.as_deref(), Some("Typing"));
}

#[test]
fn empty_config_uses_defaults() {
    let settings = parse_settings("", env(&[])).expect("settings");
    assert_eq!(settings.api_base_url.as_str(), "https://api.particle.io/");
    assert_eq!(settings.stream_idle_timeout, Duration::from_secs(30));
    assert!(settings.desks.is_empty());
    assert_eq!(settings.active_desk, None);
}

#[test]
fn environment_overrides_file_values() {
    let raw = r#"
api_base_url = "https://proxy.example"

[[desks]]
id = "home"

[[desks]]
id = "office"
access_token = "office-token"
"#;
    let settings = parse_settings(
        raw,
        env(&[
            ("DESKCTL_API_BASE_URL", "http://127.0.0.1:9000"),
            ("DESKCTL_ACCESS_TOKEN", "shared-token"),
            ("DESKCTL_STREAM_IDLE_TIMEOUT_SECS", "5"),
        ]),
    )
    .expect("settings");

    assert_eq!(settings.api_base_url.as_str(), "http://127.0.0.1:9000/");
    assert_eq!(settings.stream_idle_timeout, Duration::from_secs(5));
    assert_eq!(settings.desks[0].config.credentials.access_token, "shared-token");
    assert_eq!(settings.desks[1].config.credentials.access_token, "office-token");
}

#[test]
fn rejects_invalid_configs() {
    let cases = [
        ("[[desks]]\nid = \"a\"\n", "access_token"),
        (
            "[[desks]]\nid = \"a\"\naccess_token = \"t\"\n[[desks]]\nid = \"a\"\naccess_token = \"t\"\n",
            "more than once",
        ),
        (
            "active_desk = \"b\"\n[[desks]]\nid = \"a\"\naccess_token = \"t\"\n",
            "not a configured desk",
        ),
        (
            "[[desks]]\nid = \"a\"\naccess_token = \"t\"\n[[desks.presets]]\nheight = 60\n[[desks.presets]]\nheight = 100\norder = 0\n",
            "order 0",
        ),
        (
            "[[desks]]\nid = \"a\"\naccess_token = \"t\"\nsitting_height = 100\nstanding_height = 90\n",
            "below standing_height",
        ),
        ("stream_idle_timeout_secs = 0\n", "positive"),
        ("api_base_url = \"not a url\"\n", "not a valid URL"),
    ];

    for (raw, expected) in cases {
        let err = parse_settings(raw, env(&[])).expect_err(raw);
        let message = format!("{err:#}");
        assert!(message.contains(expected), "{message} should mention {expected}");
    }
}

#[test]
fn unordered_preset_after_max_order_is_a_duplicate() {
    let presets = vec![
        FilePreset {
            height: 100,
            name: None,
            order: Some(i32::MAX),
        },
        FilePreset {
            height: 70,
            name: None,
            order: None,
        },
    ];

    let err = assign_orders("a", presets).expect_err("no order left after i32::MAX");
    assert!(format!("{err:#}").contains(&format!("order {}", i32::MAX)));
}

#[test]
fn missing_explicit_file_is_an_error() {
    let missing = std::env::temp_dir().join("deskctl-missing-config-test.toml");
    assert!(load_settings(Some(&missing)).is_err());
}
