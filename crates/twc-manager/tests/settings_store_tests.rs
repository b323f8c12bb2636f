use primary::{PowerSettings, SettingsError, SettingsStore};
use twc_manager::TomlSettingsStore;

#[test]
fn saved_settings_are_restored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = TomlSettingsStore::new(dir.path().join("settings.toml"));
    assert!(store.load().expect("load").is_none());

    let settings = PowerSettings {
        available_amps: 18,
        power_offset_watts: -720,
        enable_solar: true,
        check_interval_minutes: 5,
        auto_start_stop: true,
    };
    store.save(&settings).expect("save");

    assert_eq!(store.load().expect("load"), Some(settings));
}

#[test]
fn partial_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("settings.toml");
    std::fs::write(&path, "available_amps = 12\n").expect("write");

    let loaded = TomlSettingsStore::new(path)
        .load()
        .expect("load")
        .expect("settings present");
    assert_eq!(loaded.available_amps, 12);
    assert_eq!(loaded.check_interval_minutes, 1);
    assert!(!loaded.enable_solar);
}

#[test]
fn save_reports_unwritable_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = TomlSettingsStore::new(dir.path().join("missing").join("settings.toml"));

    let err = store
        .save(&PowerSettings::default())
        .expect_err("directory does not exist");
    assert!(matches!(err, SettingsError::Write { .. }));
}
