//! Smoke tests that run the built `tvm` binary against an isolated home.

use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Test context with an isolated tvm home
struct TestContext {
    temp_dir: TempDir,
    tvm_home: PathBuf,
}

impl TestContext {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let tvm_home = temp_dir.path().join(".tvm");
        std::fs::create_dir_all(&tvm_home).expect("failed to create tvm home");
        Self { temp_dir, tvm_home }
    }

    fn tvm_cmd(&self) -> Command {
        let bin_path = env!("CARGO_BIN_EXE_tvm");
        let mut cmd = Command::new(bin_path);
        cmd.env("HOME", self.temp_dir.path());
        cmd.env("TVM_HOME", &self.tvm_home);
        for var in ["TVM_MIRROR", "TVM_AUTO_MIRROR", "TVM_TIMEOUT", "TVM_MAX_RETRIES", "RUST_LOG"] {
            cmd.env_remove(var);
        }
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.tvm_cmd().args(args).output().expect("failed to run tvm")
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_help_command() {
    let ctx = TestContext::new();
    let output = ctx.run(&["--help"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Usage:"));
}

#[test]
fn test_version_command() {
    let ctx = TestContext::new();
    let output = ctx.run(&["--version"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("tvm"));
}

#[test]
fn test_list_on_empty_home() {
    let ctx = TestContext::new();
    let output = ctx.run(&["list"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("No versions installed"));
}

#[test]
fn test_sources_list_includes_builtin() {
    let ctx = TestContext::new();
    let output = ctx.run(&["sources", "list"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("official"));
    assert!(out.contains("built-in"));
}

#[test]
fn test_sources_add_and_remove() {
    let ctx = TestContext::new();

    let added = ctx.run(&["sources", "add", "corp", "https://mirror.corp.example/go/", "--priority", "5"]);
    assert!(added.status.success(), "{}", stderr(&added));
    assert!(ctx.tvm_home.join("mirrors.json").exists());

    let listed = stdout(&ctx.run(&["sources", "list"]));
    assert!(listed.contains("corp"));
    assert!(listed.contains("custom"));

    let duplicate = ctx.run(&["sources", "add", "corp", "https://other.example/"]);
    assert!(!duplicate.status.success());
    assert!(stderr(&duplicate).contains("already exists"));

    let removed = ctx.run(&["sources", "remove", "corp"]);
    assert!(removed.status.success(), "{}", stderr(&removed));
    assert!(!stdout(&ctx.run(&["sources", "list"])).contains("corp"));
}

#[test]
fn test_builtin_source_cannot_be_removed() {
    let ctx = TestContext::new();
    let output = ctx.run(&["sources", "remove", "official"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("built-in"));
}

#[test]
fn test_use_unknown_version_fails() {
    let ctx = TestContext::new();
    let output = ctx.run(&["use", "1.21.0"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("error:"));
}

#[test]
fn test_install_rejects_bad_version() {
    let ctx = TestContext::new();
    let output = ctx.run(&["install", "not-a-version"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Invalid version"));
    assert!(!ctx.tvm_home.join("versions.json").exists());
}
