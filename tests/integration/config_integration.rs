//! Layered configuration loading.

use super::test_utils::with_env;
use archsheet::config::ConfigLoader;
use tempfile::TempDir;

#[test]
fn workspace_file_overrides_global_file() {
    let temp = TempDir::new().unwrap();
    let global_dir = temp.path().join("xdg").join("archsheet");
    std::fs::create_dir_all(&global_dir).unwrap();
    std::fs::write(
        global_dir.join("config.toml"),
        "[pacing]\nmin_interval_ms = 3000\nmax_queue_size = 64\n",
    )
    .unwrap();

    let workspace = temp.path().join("ws");
    std::fs::create_dir_all(workspace.join("config")).unwrap();
    std::fs::write(
        workspace.join("config").join("config.toml"),
        "[pacing]\nmin_interval_ms = 4000\n",
    )
    .unwrap();

    let config = with_env(&temp, &[], || ConfigLoader::load(&workspace).unwrap());
    assert_eq!(config.pacing.min_interval_ms, 4_000);
    assert_eq!(config.pacing.max_queue_size, 64);
}

#[test]
fn environment_file_and_variables_win() {
    let temp = TempDir::new().unwrap();
    let workspace = temp.path().join("ws");
    std::fs::create_dir_all(workspace.join("config")).unwrap();
    std::fs::write(
        workspace.join("config").join("config.toml"),
        "[gate]\nmax_retries = 1\n",
    )
    .unwrap();
    std::fs::write(
        workspace.join("config").join("ci.toml"),
        "[gate]\nmax_retries = 3\n",
    )
    .unwrap();

    let config = with_env(
        &temp,
        &[
            ("ARCHSHEET_ENV", "ci"),
            ("ARCHSHEET__EXECUTOR__MAX_ATTEMPTS", "7"),
        ],
        || ConfigLoader::load(&workspace).unwrap(),
    );
    assert_eq!(config.gate.max_retries, 3);
    assert_eq!(config.executor.max_attempts, 7);
}

#[test]
fn invalid_layered_values_fail_validation() {
    let temp = TempDir::new().unwrap();
    let workspace = temp.path().join("ws");
    std::fs::create_dir_all(workspace.join("config")).unwrap();
    std::fs::write(
        workspace.join("config").join("config.toml"),
        "[drift]\nmin_overall_score = 3.0\n",
    )
    .unwrap();

    let result = with_env(&temp, &[], || ConfigLoader::load(&workspace));
    let message = result.unwrap_err().to_string();
    assert!(message.contains("drift"));
}

#[test]
fn missing_files_yield_defaults() {
    let temp = TempDir::new().unwrap();
    let config = with_env(&temp, &[], || ConfigLoader::load(temp.path()).unwrap());
    assert_eq!(config.pacing.min_interval_ms, 6_000);
    assert_eq!(config.store.path.to_str(), Some(".archsheet/baselines"));
}
