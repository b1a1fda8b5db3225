//! Smoke tests -- verify the binary runs and key subcommands load.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("detquench")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains(
            "Quality-driven refinement loop",
        ));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("detquench")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("detquench"));
}

#[test]
fn test_refine_subcommand_exists() {
    Command::cargo_bin("detquench")
        .unwrap()
        .args(["refine", "--help"])
        .assert()
        .success();
}

#[test]
fn test_evaluate_subcommand_exists() {
    Command::cargo_bin("detquench")
        .unwrap()
        .args(["evaluate", "--help"])
        .assert()
        .success();
}

#[test]
fn test_check_backend_subcommand_exists() {
    Command::cargo_bin("detquench")
        .unwrap()
        .args(["check-backend", "--help"])
        .assert()
        .success();
}

#[test]
fn test_validate_rejects_unbalanced_query() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("broken.yml"),
        r#"
name: broken_rule
query: "(process.name:cmd.exe"
test_cases:
  - type: TP
    log_entry:
      process.name: cmd.exe
"#,
    )
    .unwrap();

    Command::cargo_bin("detquench")
        .unwrap()
        .args(["validate", "--rules-dir"])
        .arg(dir.path())
        .assert()
        .failure()
        .stdout(predicates::str::contains("error: broken_rule"));
}

#[test]
fn test_validate_accepts_well_formed_rules() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("shadow.yml"),
        r#"
name: shadow_copy_deletion
description: Shadow copy deletion via vssadmin
query: "process.name:*vssadmin* AND process.command_line:*delete*shadows*"
severity: high
test_cases:
  - type: TP
    description: standard deletion
    log_entry:
      process.name: vssadmin.exe
      process.command_line: vssadmin.exe delete shadows /all /quiet
  - type: TN
    description: unrelated process
    log_entry:
      process.name: explorer.exe
  - type: FP
    description: benign vssadmin use
    log_entry:
      process.name: vssadmin.exe
      process.command_line: vssadmin.exe list shadows
  - type: FN
    description: renamed binary evasion
    log_entry:
      process.name: vss.exe
      process.command_line: vss.exe delete shadows
"#,
    )
    .unwrap();

    Command::cargo_bin("detquench")
        .unwrap()
        .args(["validate", "--rules-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicates::str::contains("ok: shadow_copy_deletion"));
}

#[test]
fn test_evaluate_offline_reports_metrics() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("shadow.yml"),
        r#"
name: shadow_copy_deletion
query: "process.command_line:*delete*shadows*"
test_cases:
  - type: TP
    description: attack
    log_entry:
      process.command_line: vssadmin.exe delete shadows /all
  - type: TN
    description: benign
    log_entry:
      process.command_line: explorer.exe
"#,
    )
    .unwrap();

    Command::cargo_bin("detquench")
        .unwrap()
        .args(["evaluate", "--offline", "--rules-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicates::str::contains("precision: 1.0"))
        .stdout(predicates::str::contains("recall: 1.0"));
}
