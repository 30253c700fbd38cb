//! Loading the TOML tunables from disk.

use std::io::Write;

use statewright_common::config::load_config;
use statewright_common::Error;

#[test]
fn loads_engine_and_database_sections_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[engine]
max_workers = 4
timer_poll_interval_ms = 0
recovery_interval_ms = 250

[database]
max_connections = 3
run_migrations = false
"#
    )
    .unwrap();

    let config = load_config(file.path()).unwrap();
    assert_eq!(config.engine.max_workers, 4);
    assert!(config.engine.timer_poll_interval().is_none());
    assert_eq!(
        config.engine.recovery_interval(),
        Some(std::time::Duration::from_millis(250))
    );
    assert_eq!(config.database.max_connections, 3);
    assert!(!config.database.run_migrations);
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_config(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, Error::Config(msg) if msg.contains("absent.toml")));
}
