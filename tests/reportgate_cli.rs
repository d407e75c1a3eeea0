use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Output},
};

fn write_config(dir: &Path, file_name: &str, env: &str, extra: &str) -> PathBuf {
    let data_dir = dir.join("data");
    fs::create_dir_all(&data_dir).expect("create data dir");

    let config_path = dir.join(file_name);
    fs::write(
        &config_path,
        format!(
            r#"
name = "reportgate-cli-test"
env = "{env}"
sqlite_path = "{sqlite}"

[bind.http]
ip = "127.0.0.1"
port = 39990

[access]
key = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"

[access.storage]
backend = "sqlite"

[access.storage.sqlite]
file_name = "report_access.db"

[observability.log]
output = "console"
{extra}
"#,
            sqlite = data_dir.display(),
        ),
    )
    .expect("write config");

    config_path
}

fn run_reportgate(args: &[&str], current_dir: Option<&Path>) -> Output {
    let mut cmd = Command::new(PathBuf::from(env!("CARGO_BIN_EXE_reportgate")));
    cmd.args(args);
    if let Some(dir) = current_dir {
        cmd.current_dir(dir);
    }
    cmd.output().expect("run reportgate command")
}

#[test]
fn keygen_prints_a_hex_encoded_256_bit_key() {
    let output = run_reportgate(&["keygen"], None);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let key = stdout.trim();
    assert_eq!(key.len(), 64, "unexpected key: {key}");
    assert!(key.chars().all(|c| c.is_ascii_hexdigit()));

    let second = run_reportgate(&["keygen"], None);
    assert_ne!(key, String::from_utf8_lossy(&second.stdout).trim());
}

#[test]
fn test_command_accepts_explicit_valid_config() {
    let temp = tempfile::tempdir().expect("temp dir");
    let config_path = write_config(temp.path(), "valid.toml", "dev", "");
    let output = run_reportgate(&["test", config_path.to_str().expect("utf8 path")], None);

    assert!(
        output.status.success(),
        "command should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn test_command_finds_default_config_in_current_directory() {
    let temp = tempfile::tempdir().expect("temp dir");
    write_config(temp.path(), "config.toml", "dev", "");
    let output = run_reportgate(&["test"], Some(temp.path()));

    assert!(
        output.status.success(),
        "command should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn test_command_fails_for_missing_custom_config_path() {
    let temp = tempfile::tempdir().expect("temp dir");
    let missing_path = temp.path().join("missing.toml");
    let output = run_reportgate(&["test", missing_path.to_str().expect("utf8 path")], None);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "command should fail");
    assert!(
        stderr.contains("Config file not found"),
        "unexpected stderr: {stderr}"
    );
}

#[test]
fn test_command_fails_for_invalid_config_content() {
    let temp = tempfile::tempdir().expect("temp dir");
    let bad_path = temp.path().join("bad.toml");
    fs::write(&bad_path, "name = \"broken\"\n[access\n").expect("write invalid toml");

    let output = run_reportgate(&["test", bad_path.to_str().expect("utf8 path")], None);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "command should fail");
    assert!(
        stderr.contains("配置解析失败"),
        "unexpected stderr: {stderr}"
    );
}

#[test]
fn test_command_fails_for_validation_errors() {
    let temp = tempfile::tempdir().expect("temp dir");
    let config_path = write_config(
        temp.path(),
        "invalid-otp.toml",
        "dev",
        "\n[access.otp]\nttl_seconds = 0\n",
    );
    let output = run_reportgate(&["test", config_path.to_str().expect("utf8 path")], None);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "command should fail");
    assert!(
        stderr.contains("配置验证失败"),
        "unexpected stderr: {stderr}"
    );
}

#[test]
fn test_command_succeeds_with_warning_only_config() {
    // 直接配置密钥和 log 投递方式只产生警告
    let temp = tempfile::tempdir().expect("temp dir");
    let config_path = write_config(temp.path(), "warning.toml", "prod", "");
    let output = run_reportgate(&["test", config_path.to_str().expect("utf8 path")], None);

    assert!(
        output.status.success(),
        "warning-only config should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn run_mode_fails_when_no_default_config_exists() {
    let temp = tempfile::tempdir().expect("temp dir");
    let output = run_reportgate(&[], Some(temp.path()));
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "run mode should fail");
    assert!(
        stderr.contains("No configuration file found"),
        "unexpected stderr: {stderr}"
    );
}

#[test]
fn run_mode_fails_for_validation_errors() {
    let temp = tempfile::tempdir().expect("temp dir");
    let config_path = write_config(
        temp.path(),
        "run-invalid.toml",
        "staging",
        "",
    );
    let output = run_reportgate(
        &["--config", config_path.to_str().expect("utf8 path")],
        None,
    );
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "run mode should fail");
    assert!(
        stderr.contains("配置验证失败") || stderr.contains("Invalid env"),
        "unexpected stderr: {stderr}"
    );
}
