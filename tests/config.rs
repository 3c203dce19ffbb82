#[path = "common/mod.rs"]
mod common;

use bucketail::{ConfigError, Durability, PollerOptions, Settings, Zone};
use common::*;
use std::time::Duration;

fn build(opts: PollerOptions) -> Result<Settings, ConfigError> {
    Settings::from_options(opts)
}

#[test]
fn defaults_and_prefix_normalisation() {
    let dir = tempfile::tempdir().unwrap();
    let s = settings(
        PollerOptions::default()
            .with_bucket("logs")
            .with_prefix("app")
            .with_format(LINE_FORMAT)
            .with_work_dir(dir.path()),
    );
    assert_eq!(s.prefix, "app/", "a trailing slash is added");
    assert_eq!(s.tag, "s3in.log");
    assert_eq!(s.zone, Zone::default());
    assert_eq!(s.durability, Durability::Durable);
    assert_eq!(s.refresh_interval, Duration::from_secs(300));
    assert_eq!(s.shutdown_timeout, Duration::from_secs(30));
    assert_eq!((s.download_threads, s.parse_threads), (5, 5));
    assert!(s.credentials.is_none());
    assert!(s.format.has_name("message"));
}

#[test]
fn options_load_from_json_with_defaults_for_missing_fields() {
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");
    let cfg = dir.path().join("config.json");
    let json = serde_json::json!({
        "bucket": "logs",
        "prefix": "app/",
        "format": LINE_FORMAT,
        "timezone": "Asia/Tokyo",
        "durability": "relaxed",
        "work_dir": work,
        "refresh_interval_secs": 5,
    });
    std::fs::write(&cfg, json.to_string()).unwrap();

    let opts = PollerOptions::from_json_file(&cfg).unwrap();
    assert_eq!(opts.tag, "s3in.log");
    assert_eq!(opts.download_threads, 5);
    let s = settings(opts);
    assert_eq!(s.durability, Durability::Relaxed);
    assert_eq!(s.refresh_interval, Duration::from_secs(5));
    assert_eq!(s.zone.to_string(), "Asia/Tokyo");
    assert!(work.is_dir(), "work dir is created during validation");
}

#[test]
fn missing_required_options_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let err = build(base_options(dir.path()).with_bucket("  ")).unwrap_err();
    assert!(matches!(err, ConfigError::Missing("bucket")), "{err}");

    let err = build(base_options(dir.path()).with_prefix("")).unwrap_err();
    assert!(matches!(err, ConfigError::Missing("prefix")), "{err}");

    let err = build(base_options(dir.path()).with_format("")).unwrap_err();
    assert!(matches!(err, ConfigError::Missing("format")), "{err}");
}

#[test]
fn credentials_must_come_in_pairs() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = base_options(dir.path());
    opts.access_key_id = Some("AKIA".into());
    assert!(matches!(build(opts).unwrap_err(), ConfigError::PartialCredentials));

    let s = settings(base_options(dir.path()).with_credentials("AKIA", "hunter2"));
    let creds = s.credentials.unwrap();
    assert_eq!(creds.access_key_id, "AKIA");
    assert_eq!(creds.secret_access_key, "hunter2");
    let shown = format!("{creds:?}");
    assert!(shown.contains("AKIA") && !shown.contains("hunter2"), "the secret is never logged: {shown}");
}

#[test]
fn format_must_be_delimited_and_have_named_captures() {
    let dir = tempfile::tempdir().unwrap();
    let err = build(base_options(dir.path()).with_format(r"^(?P<a>.*)$")).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidPattern { .. }), "{err}");

    let err = build(base_options(dir.path()).with_format(r"/^(.*)$/")).unwrap_err();
    assert!(matches!(err, ConfigError::NoNamedCaptures(_)), "{err}");

    let err = build(base_options(dir.path()).with_format(r"/(?P<a>[/")).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidPattern { .. }), "{err}");
}

#[test]
fn date_conditions_are_validated_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let keyed = || base_options(dir.path()).with_key_format(r"/app/(?P<date>\d{8})\.log/");

    let err = build(keyed().with_date_condition("date %Y%m%d ~ -86400")).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidOperator(ref op) if op == "~"), "{err}");

    let err = build(keyed().with_date_condition("date %Y%m%d >= yesterday")).unwrap_err();
    assert!(matches!(err, ConfigError::DateCondition { index: 1, .. }), "{err}");

    let err = build(keyed().with_date_condition("day %Y%m%d >= -86400")).unwrap_err();
    assert!(matches!(err, ConfigError::DateCondition { index: 1, .. }), "unknown group: {err}");

    let err = build(base_options(dir.path()).with_date_condition("date %Y%m%d >= -86400")).unwrap_err();
    assert!(matches!(err, ConfigError::Missing(_)), "conditions need key_format: {err}");

    let mut opts = keyed();
    for _ in 0..21 {
        opts = opts.with_date_condition("date %Y%m%d >= -86400");
    }
    assert!(matches!(build(opts).unwrap_err(), ConfigError::TooManyDateConditions(21)));

    let s = settings(keyed().with_date_condition("date %Y%m%d >= -86400"));
    assert_eq!(s.date_conditions.len(), 1);
}

#[test]
fn relative_bounds_outside_the_time_range_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let keyed = || base_options(dir.path()).with_key_format(r"/app/(?P<date>\d{8})\.log/");

    for bound in ["+9999999999999999", "-9223372036854775807"] {
        let err = build(keyed().with_date_condition(format!("date %Y%m%d >= {bound}"))).unwrap_err();
        assert!(matches!(err, ConfigError::DateCondition { index: 1, .. }), "{bound}: {err}");
    }

    let err = build(
        keyed()
            .with_date_condition("date %Y%m%d >= -86400")
            .with_date_condition("date %Y%m%d < +99999999999999999"),
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::DateCondition { index: 2, .. }), "{err}");

    // A ten-year window still resolves.
    let s = settings(keyed().with_date_condition("date %Y%m%d >= -315360000"));
    let filter = bucketail::KeyFilter::from_settings(&s);
    assert_eq!(filter.classify("app/20150601.log", chrono::Utc::now()), None);
}

#[test]
fn zone_names_in_time_formats_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let err = build(base_options(dir.path()).with_timestamp("time %Y-%m-%d %H:%M:%S %Z")).unwrap_err();
    assert!(matches!(err, ConfigError::ZoneNameInFormat(_)), "{err}");

    let err = build(
        base_options(dir.path())
            .with_key_format(r"/app/(?P<date>.+)\.log/")
            .with_date_condition("date %Y%m%d%Z >= -86400"),
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::DateCondition { index: 1, .. }), "{err}");

    // A literal percent sign followed by Z is not a directive.
    settings(base_options(dir.path()).with_timestamp("time %Y-%m-%dT%H:%M:%S%%Z"));
}

#[test]
fn timestamp_and_timezone_are_checked() {
    let dir = tempfile::tempdir().unwrap();
    let err = build(base_options(dir.path()).with_timestamp("when %Y")).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownTimestampGroup(ref g) if g == "when"), "{err}");

    let err = build(base_options(dir.path()).with_timezone("Mars/Olympus")).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownTimezone(_)), "{err}");

    let s = settings(base_options(dir.path()).with_timestamp("time %Y-%m-%dT%H:%M:%SZ").with_timezone("+09:00"));
    let ts = s.timestamp.unwrap();
    assert_eq!(ts.group, "time");
    assert_eq!(ts.format.as_deref(), Some("%Y-%m-%dT%H:%M:%SZ"));
}

#[test]
fn thread_counts_and_work_dir_are_checked() {
    let dir = tempfile::tempdir().unwrap();
    let err = build(base_options(dir.path()).with_threads(0, 2)).unwrap_err();
    assert!(matches!(err, ConfigError::ZeroThreads("download_threads")), "{err}");

    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"x").unwrap();
    let err = build(base_options(&file)).unwrap_err();
    assert!(matches!(err, ConfigError::WorkDir { .. }), "{err}");
}
