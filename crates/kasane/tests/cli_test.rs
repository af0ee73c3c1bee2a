//! CLIの統合テスト
//!
//! Dockerデーモンを必要としない経路（一覧表示、Dockerfile書き出し、
//! 構造エラーの終了コード）だけを対象にする。

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

fn kasane() -> Command {
    Command::cargo_bin("kasane").unwrap()
}

fn write_makefile(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("kasane.yml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_list_shows_defined_targets() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_makefile(
        &dir,
        r#"
base:
  FROM: alpine:3.20
app:
  requires: [base]
  description: アプリ本体
"#,
    );

    kasane()
        .arg("--list")
        .arg("-f")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("base"))
        .stdout(predicate::str::contains("app"))
        .stdout(predicate::str::contains("アプリ本体"));
}

#[test]
fn test_no_build_writes_dockerfile_without_docker() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_makefile(
        &dir,
        r#"
base:
  FROM: alpine:3.20
  build: RUN echo base
app:
  requires: [base]
  build: RUN echo app
"#,
    );
    let out = dir.path().join("dockerfiles");

    kasane()
        .arg("app")
        .arg("-f")
        .arg(&path)
        .arg("--no-build")
        .arg("--dockerfile-dir")
        .arg(&out)
        .assert()
        .success();

    let text = fs::read_to_string(out.join("Dockerfile.app")).unwrap();
    assert!(text.starts_with("FROM alpine:3.20"));
    assert!(text.contains("echo base"));
    assert!(text.contains("echo app"));
    // FROM行は先頭の1回だけにマージされる
    assert_eq!(text.matches("FROM ").count(), 1);
}

#[test]
fn test_conflicting_base_exits_41() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_makefile(
        &dir,
        r#"
a:
  FROM: alpine
b:
  FROM: debian
app:
  requires: [a, b]
"#,
    );

    kasane()
        .arg("app")
        .arg("-f")
        .arg(&path)
        .arg("--no-build")
        .assert()
        .failure()
        .code(41);
}

#[test]
fn test_parse_failure_exits_50() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_makefile(&dir, "app: [not: a mapping\n");

    kasane()
        .arg("--list")
        .arg("-f")
        .arg(&path)
        .assert()
        .failure()
        .code(50);
}

#[test]
fn test_unknown_target_exits_55() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_makefile(&dir, "base:\n  FROM: alpine\n");

    kasane()
        .arg("nonexistent")
        .arg("-f")
        .arg(&path)
        .arg("--no-build")
        .assert()
        .failure()
        .code(55)
        .stderr(predicate::str::contains("nonexistent"));
}

#[test]
fn test_all_conflicts_with_positional_targets() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_makefile(&dir, "base:\n  FROM: alpine\n");

    kasane()
        .arg("base")
        .arg("--all")
        .arg("-f")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("--all"));
}

#[test]
fn test_print_dockerfiles_waits_for_successful_build() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_makefile(
        &dir,
        r#"
base:
  FROM: alpine:3.20
app:
  requires: [base]
  build: RUN echo app
"#,
    );
    let out = dir.path().join("dockerfiles");

    // 到達できないデーモンを指すのでビルドは必ず失敗する。
    // その場合はDockerfileも書き出されない
    kasane()
        .arg("app")
        .arg("-f")
        .arg(&path)
        .arg("--print-dockerfiles")
        .arg("--dockerfile-dir")
        .arg(&out)
        .env("DOCKER_HOST", "tcp://127.0.0.1:1")
        .current_dir(dir.path())
        .assert()
        .failure();

    assert!(!out.exists());
}

#[test]
fn test_no_targets_prints_hint_and_list() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_makefile(&dir, "base:\n  FROM: alpine\n");

    kasane()
        .arg("-f")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("--all"))
        .stdout(predicate::str::contains("base"));
}
