#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use serial_test::serial;

    use crate::env::Settings;
    use crate::error::AppError;

    const KEYS: [&str; 4] = [
        "DATABASE_URL",
        "TRANSACTION_TIMEOUT_SECS",
        "HARD_DELETE_WINDOW_SECS",
        "FILE_STORE_DIR",
    ];

    #[test]
    #[serial]
    fn test_settings_defaults() {
        let unset: Vec<(&str, Option<&str>)> = KEYS.iter().map(|k| (*k, None)).collect();

        temp_env::with_vars(unset, || {
            let settings = Settings::from_env().unwrap();
            assert_eq!(settings, Settings::default());
            assert_eq!(settings.hard_delete_window, Duration::from_secs(600));
            assert_eq!(settings.transaction_timeout, Duration::from_secs(5));
        });
    }

    #[test]
    #[serial]
    fn test_settings_overrides() {
        temp_env::with_vars(
            [
                ("DATABASE_URL", Some("sqlite::memory:")),
                ("TRANSACTION_TIMEOUT_SECS", Some("2")),
                ("HARD_DELETE_WINDOW_SECS", Some(" 60 ")),
                ("FILE_STORE_DIR", Some("/tmp/learningbay")),
            ],
            || {
                let settings = Settings::from_env().unwrap();
                assert_eq!(settings.database_url, "sqlite::memory:");
                assert_eq!(settings.transaction_timeout, Duration::from_secs(2));
                assert_eq!(settings.hard_delete_window, Duration::from_secs(60));
                assert_eq!(settings.file_store_dir, PathBuf::from("/tmp/learningbay"));
            },
        );
    }

    #[test]
    #[serial]
    fn test_settings_rejects_bad_seconds() {
        temp_env::with_var("HARD_DELETE_WINDOW_SECS", Some("ten minutes"), || {
            match Settings::from_env() {
                Err(AppError::Validation(msg)) => {
                    assert!(msg.starts_with("HARD_DELETE_WINDOW_SECS"))
                }
                other => panic!("Expected validation error, got {:?}", other),
            }
        });
    }
}
