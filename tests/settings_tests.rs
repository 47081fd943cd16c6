use std::io::Write;
use std::net::SocketAddr;

use sa_token::retry::Backoff;
use sa_token::settings::{AppConfig, LogFormat};

#[test]
fn defaults_match_controller_timings() {
    let cfg = AppConfig::default();
    assert_eq!(cfg.logging.format, LogFormat::Text);
    assert_eq!(cfg.lease.holder_identity, "serviceaccounttoken-controller");
    assert_eq!(cfg.lease.duration_secs, 30);
    assert!(!cfg.lease.reclaim_expired);
    assert_eq!(cfg.lease.backoff, Backoff::lease());
    assert_eq!(cfg.populate.backoff, Backoff::populate());
    assert_eq!(cfg.metrics.addr, None);
}

#[test]
fn empty_file_is_the_default_config() {
    assert_eq!(AppConfig::parse("").unwrap(), AppConfig::default());
}

#[test]
fn partial_tables_keep_remaining_defaults() {
    let cfg = AppConfig::parse(
        r#"
[logging]
format = "json"

[lease]
holder_identity = "replica-2"

[lease.backoff]
steps = 10

[populate.backoff]
cap_ms = 250

[metrics]
addr = "127.0.0.1:9090"
"#,
    )
    .unwrap();

    assert_eq!(cfg.logging.format, LogFormat::Json);
    assert_eq!(cfg.lease.holder_identity, "replica-2");
    assert_eq!(cfg.lease.duration_secs, 30);
    assert_eq!(cfg.lease.backoff.steps, 10);
    assert_eq!(cfg.lease.backoff.initial_delay_ms, 500);
    assert_eq!(cfg.populate.backoff.cap_ms, Some(250));
    assert_eq!(cfg.populate.backoff.initial_delay_ms, 2);
    assert_eq!(cfg.populate.backoff.factor, 2.0);
    assert_eq!(
        cfg.metrics.addr,
        Some("127.0.0.1:9090".parse::<SocketAddr>().unwrap())
    );
}

#[test]
fn invalid_values_are_rejected() {
    let err = AppConfig::parse("[lease]\nduration_secs = 0\n").unwrap_err();
    assert!(err.to_string().contains("duration_secs"));

    let err = AppConfig::parse("[populate.backoff]\nsteps = 0\n").unwrap_err();
    assert!(err.to_string().contains("steps"));

    assert!(AppConfig::parse("[logging]\nformat = \"xml\"\n").is_err());

    // A takeover-enabled lease must outlive the longest population wait (about 4.4s).
    let err = AppConfig::parse("[lease]\nreclaim_expired = true\nduration_secs = 4\n").unwrap_err();
    assert!(err.to_string().contains("population wait"));
    assert!(AppConfig::parse("[lease]\nreclaim_expired = true\nduration_secs = 5\n").is_ok());
    assert!(AppConfig::parse("[lease]\nduration_secs = 1\n").is_ok());
    assert!(AppConfig::parse("[metrics]\naddr = \"not an addr\"\n").is_err());
}

#[test]
fn load_reads_file_or_falls_back_to_defaults() {
    assert_eq!(AppConfig::load(None).unwrap(), AppConfig::default());

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[lease]\nreclaim_expired = true").unwrap();
    let cfg = AppConfig::load(Some(file.path())).unwrap();
    assert!(cfg.lease.reclaim_expired);

    let missing = file.path().with_extension("missing");
    assert!(AppConfig::load(Some(&missing)).is_err());
}

#[test]
fn populate_factor_one_polls_at_a_constant_interval() {
    let cfg = AppConfig::parse("[populate.backoff]\nfactor = 1.0\n").unwrap();
    let backoff = &cfg.populate.backoff;
    assert_eq!(backoff.delay_for(0, 0.0), std::time::Duration::from_millis(2));
    assert_eq!(backoff.delay_for(40, 0.0), std::time::Duration::from_millis(2));
    assert_eq!(backoff.max_total_delay(), std::time::Duration::from_millis(98));
}
