use std::collections::HashMap;
use std::io::Write as _;
use std::time::Duration;

use handoff::config::{PipelineSettings, StageProfiles};
use handoff::engine::StageConfig;
use handoff::model::Stage;

fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name: &str| vars.get(name).cloned()
}

#[test]
fn pipeline_settings_default_when_unset() {
    let settings = PipelineSettings::from_lookup(lookup(&[])).unwrap();
    assert_eq!(settings, PipelineSettings::default());
    assert_eq!(settings.ingress_queue, "pipeline_ingress");
    assert_eq!(settings.step1_queue, "pipeline_step_1");
    assert_eq!(settings.step2_queue, "pipeline_step_2");
    assert_eq!(settings.visibility_timeout, Duration::from_secs(30));
    assert!(settings.stages_file.is_none());
}

#[test]
fn pipeline_settings_read_overrides() {
    let settings = PipelineSettings::from_lookup(lookup(&[
        ("PIPELINE_STEP1_QUEUE", "orders_1"),
        ("PIPELINE_VISIBILITY_TIMEOUT_SECS", "45"),
        ("PIPELINE_RECEIVE_WAIT_SECS", " 8 "),
        ("PIPELINE_SEND_TIMEOUT_SECS", "3"),
        ("PIPELINE_STAGES_FILE", "/etc/handoff/stages.toml"),
    ]))
    .unwrap();

    assert_eq!(settings.step1_queue, "orders_1");
    assert_eq!(settings.ingress_queue, "pipeline_ingress");
    assert_eq!(settings.visibility_timeout, Duration::from_secs(45));
    assert_eq!(settings.receive_wait, Duration::from_secs(8));

    let stage = StageConfig::from(&settings);
    assert_eq!(stage.send_timeout, Duration::from_secs(3));
    assert_eq!(stage.retry_backoff, Duration::from_secs(5));
}

#[test]
fn malformed_number_fails_fast() {
    let err = PipelineSettings::from_lookup(lookup(&[("PIPELINE_RETRY_BACKOFF_SECS", "soon")]))
        .unwrap_err();
    assert!(err.to_string().contains("PIPELINE_RETRY_BACKOFF_SECS"));
}

#[test]
fn send_timeout_must_be_shorter_than_receive_wait() {
    let result = PipelineSettings::from_lookup(lookup(&[
        ("PIPELINE_RECEIVE_WAIT_SECS", "5"),
        ("PIPELINE_SEND_TIMEOUT_SECS", "5"),
    ]));
    assert!(result.is_err());
}

#[test]
fn stage_profiles_default_to_simulated_work() {
    let profiles = StageProfiles::default();
    assert_eq!(profiles.for_stage(Stage::One).work_ms, 20);
    assert_eq!(profiles.for_stage(Stage::Two).work_ms, 30);
    assert_eq!(profiles.for_stage(Stage::Three).work_ms, 40);
    assert_eq!(
        profiles.stage1.seed.as_deref(),
        Some("Initial data from stage1")
    );
    assert_eq!(profiles.stage2.marker.as_deref(), Some("Processed by stage2: "));
}

#[test]
fn stage_profiles_partial_file_keeps_defaults() {
    let profiles = StageProfiles::parse(
        r#"
[stage2]
work_ms = 5
marker = "checked: "
"#,
    )
    .unwrap();

    assert_eq!(profiles.stage2.work_ms, 5);
    assert_eq!(profiles.stage2.marker.as_deref(), Some("checked: "));
    assert_eq!(profiles.stage1, StageProfiles::default().stage1);
    assert_eq!(profiles.stage3.work_ms, 40);
}

#[test]
fn stage_profiles_load_from_configured_file() {
    let path = std::env::temp_dir().join(format!("handoff-stages-{}.toml", std::process::id()));
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "[stage1]\nwork_ms = 0\n\n[stage3]\nwork_ms = 1").unwrap();

    let path_str = path.to_string_lossy().to_string();
    let settings =
        PipelineSettings::from_lookup(lookup(&[("PIPELINE_STAGES_FILE", path_str.as_str())]))
            .unwrap();
    let profiles = settings.stage_profiles().unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(profiles.stage1.work_ms, 0);
    assert!(profiles.stage1.seed.is_none());
    assert_eq!(profiles.stage3.work_ms, 1);
}

#[test]
fn missing_profiles_file_is_a_config_error() {
    let settings = PipelineSettings::from_lookup(lookup(&[(
        "PIPELINE_STAGES_FILE",
        "/nonexistent/handoff/stages.toml",
    )]))
    .unwrap();
    assert!(settings.stage_profiles().is_err());
}
