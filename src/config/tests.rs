use std::io::Write;
use std::path::Path;

use clap::Parser;
use serial_test::serial;

use super::*;

#[test]
fn defaults_resolve() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.admin_addr.port(), DEFAULT_ADMIN_PORT);
    assert_eq!(settings.cache.duration.get(), DEFAULT_CACHE_DURATION_SECS);
    assert!(settings.cache.enabled);
    assert!(!settings.cache.force_on);
    assert_eq!(settings.cache.index, IndexBackend::Postgres);
    assert_eq!(settings.cache.sweep_interval, None);
    assert_eq!(settings.routing.admin_prefix, "/admin");
    assert_eq!(settings.routing.site_header, "x-site-id");
    assert!(settings.host.system_on);
    assert!(!settings.host.dev_mode);
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.admin_port = Some(4000);
    raw.logging.level = Some("info".to_string());
    raw.cache.duration_secs = Some(60);

    let overrides = ServeOverrides {
        admin_port: Some(4321),
        log_level: Some("debug".to_string()),
        cache: CacheOverrides {
            duration_secs: Some(120),
            ..Default::default()
        },
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.admin_addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.cache.duration.get(), 120);
}

#[test]
fn zero_duration_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.duration_secs = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero duration must fail");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.duration_secs",
            ..
        }
    ));
}

#[test]
fn unknown_index_backend_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.index = Some("redis".to_string());

    let err = Settings::from_raw(raw).expect_err("unknown backend must fail");
    assert!(matches!(err, LoadError::Invalid { key: "cache.index", .. }));
}

#[test]
fn one_shot_commands_require_shared_index() {
    let mut raw = RawSettings::default();
    raw.cache.index = Some("memory".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");

    let err = settings
        .cache
        .require_shared_index("invalidate")
        .expect_err("memory index cannot serve one-shot commands");
    assert!(matches!(err, LoadError::Invalid { key: "cache.index", .. }));

    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    assert!(settings.cache.require_shared_index("invalidate").is_ok());
}

#[test]
fn zero_sweep_interval_disables_sweeper() {
    let mut raw = RawSettings::default();
    raw.cache.sweep_interval_seconds = Some(0);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.sweep_interval, None);

    let mut raw = RawSettings::default();
    raw.cache.sweep_interval_seconds = Some(300);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.sweep_interval, Some(Duration::from_secs(300)));
}

#[test]
fn routing_prefix_must_be_absolute() {
    let mut raw = RawSettings::default();
    raw.routing.admin_prefix = Some("admin".to_string());

    let err = Settings::from_raw(raw).expect_err("relative prefix must fail");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "routing.admin_prefix",
            ..
        }
    ));
}

#[test]
fn blank_database_url_is_treated_as_missing() {
    let mut raw = RawSettings::default();
    raw.database.url = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.database.url.is_none());
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
#[serial]
fn config_file_layer_is_applied() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("tempfile");
    writeln!(
        file,
        "[cache]\nduration_secs = 900\nindex = \"memory\"\n\n[host]\nsystem_on = false"
    )
    .expect("write config");

    let args = CliArgs::parse_from([
        "pagecache",
        "--config-file",
        file.path().to_str().expect("utf-8 path"),
        "sweep",
    ]);
    let settings = load(&args).expect("valid settings");

    assert_eq!(settings.cache.duration.get(), 900);
    assert_eq!(settings.cache.index, IndexBackend::Memory);
    assert!(!settings.host.system_on);
}

#[test]
#[serial]
fn environment_layer_overrides_files() {
    // SAFETY: env-mutating tests are serialized.
    unsafe {
        std::env::set_var("PAGECACHE__CACHE__DURATION_SECS", "450");
        std::env::set_var("PAGECACHE__HOST__DEV_MODE", "true");
    }

    let args = CliArgs::parse_from(["pagecache", "flush"]);
    let result = load(&args);

    unsafe {
        std::env::remove_var("PAGECACHE__CACHE__DURATION_SECS");
        std::env::remove_var("PAGECACHE__HOST__DEV_MODE");
    }

    let settings = result.expect("valid settings");
    assert_eq!(settings.cache.duration.get(), 450);
    assert!(settings.host.dev_mode);
}

#[test]
#[serial]
fn cli_beats_environment() {
    unsafe {
        std::env::set_var("PAGECACHE__CACHE__DURATION_SECS", "450");
    }

    let args = CliArgs::parse_from(["pagecache", "sweep", "--cache-duration-seconds", "30"]);
    let result = load(&args);

    unsafe {
        std::env::remove_var("PAGECACHE__CACHE__DURATION_SECS");
    }

    assert_eq!(result.expect("valid settings").cache.duration.get(), 30);
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["pagecache"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_invalidate_arguments() {
    let args = CliArgs::parse_from([
        "pagecache",
        "invalidate",
        "--database-url",
        "postgres://example",
        "--cache-directory",
        "/tmp/pages",
        "42",
        "43",
    ]);

    match args.command.expect("invalidate command") {
        Command::Invalidate(invalidate) => {
            assert_eq!(
                invalidate.maintenance.database.database_url.as_deref(),
                Some("postgres://example")
            );
            assert_eq!(
                invalidate.maintenance.cache.directory.as_deref(),
                Some(Path::new("/tmp/pages"))
            );
            assert_eq!(invalidate.units, vec!["42".to_string(), "43".to_string()]);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn invalidate_requires_a_unit() {
    let result = CliArgs::try_parse_from(["pagecache", "invalidate"]);
    assert!(result.is_err());
}

#[test]
fn parse_flush_and_migrate_arguments() {
    let args = CliArgs::parse_from(["pagecache", "flush", "--cache-directory", "/tmp/pages"]);
    match args.command.expect("flush command") {
        Command::Flush(flush) => {
            assert_eq!(flush.cache.directory.as_deref(), Some(Path::new("/tmp/pages")));
        }
        _ => panic!("wrong command parsed"),
    }

    let args = CliArgs::parse_from(["pagecache", "migrate", "--database-url", "postgres://m"]);
    match args.command.expect("migrate command") {
        Command::Migrate(migrate) => {
            assert_eq!(migrate.database.database_url.as_deref(), Some("postgres://m"));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "pagecache",
        "serve",
        "--server-admin-host",
        "0.0.0.0",
        "--database-url",
        "postgres://override",
        "--cache-force-on",
        "true",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(
                serve.overrides.server_admin_host.as_deref(),
                Some("0.0.0.0")
            );
            assert_eq!(
                serve.overrides.database.database_url.as_deref(),
                Some("postgres://override")
            );
            assert_eq!(serve.overrides.cache_force_on, Some(true));
        }
        _ => panic!("wrong command parsed"),
    }
}
