use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ragi_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ragi");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("inbox")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/ragi.sqlite"

[paths]
watch_dir = "{root}/inbox"
archive_dir = "{root}/archive"

[watch]
settle_ms = 50
poll_interval_ms = 10
max_wait_secs = 10

[logging]
level = "warn"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("ragi.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn inbox(tmp: &TempDir) -> PathBuf {
    tmp.path().join("inbox")
}

fn run_ragi(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ragi_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RAGI_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ragi binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

const ALPHA: &str = "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.";

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ragi(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").join("ragi.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_ragi(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_ragi(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_ragi(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "stderr: {}", stderr);
}

#[test]
fn test_ingest_indexes_and_archives() {
    let (tmp, config_path) = setup_test_env();
    run_ragi(&config_path, &["init"]);

    let file = inbox(&tmp).join("alpha.md");
    fs::write(&file, ALPHA).unwrap();

    let (stdout, stderr, success) = run_ragi(&config_path, &["ingest", file.to_str().unwrap()]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("indexed alpha.md"), "stdout: {}", stdout);
    assert!(!file.exists());
    assert!(tmp.path().join("archive").join("alpha.md").exists());

    let (stdout, _, success) = run_ragi(&config_path, &["docs", "list"]);
    assert!(success);
    assert!(stdout.contains("alpha.md"));
}

#[test]
fn test_renamed_copy_is_a_duplicate() {
    let (tmp, config_path) = setup_test_env();
    run_ragi(&config_path, &["init"]);

    let first = inbox(&tmp).join("alpha.md");
    fs::write(&first, ALPHA).unwrap();
    run_ragi(&config_path, &["ingest", first.to_str().unwrap()]);

    let copy = inbox(&tmp).join("alpha-copy.md");
    fs::write(&copy, ALPHA).unwrap();
    let (stdout, _, success) = run_ragi(&config_path, &["ingest", copy.to_str().unwrap()]);
    assert!(success);
    assert!(
        stdout.contains("duplicate alpha-copy.md (same content as 'alpha.md')"),
        "stdout: {}",
        stdout
    );

    let (stdout, _, _) = run_ragi(&config_path, &["docs", "list"]);
    assert!(!stdout.contains("alpha-copy.md"));
}

#[test]
fn test_scan_processes_folder() {
    let (tmp, config_path) = setup_test_env();
    run_ragi(&config_path, &["init"]);

    fs::write(inbox(&tmp).join("alpha.md"), ALPHA).unwrap();
    fs::write(
        inbox(&tmp).join("beta.csv"),
        "name,role\nAda,engineer\nGrace,admiral\n",
    )
    .unwrap();
    fs::write(inbox(&tmp).join("empty.txt"), "").unwrap();

    let (stdout, stderr, success) = run_ragi(&config_path, &["scan"]);
    assert!(success, "scan failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("archived: 2"), "stdout: {}", stdout);
    assert!(stdout.contains("skipped: 1"), "stdout: {}", stdout);
    assert!(inbox(&tmp).join("empty.txt").exists());
}

#[test]
fn test_docs_delete_allows_reingest() {
    let (tmp, config_path) = setup_test_env();
    run_ragi(&config_path, &["init"]);

    let file = inbox(&tmp).join("alpha.md");
    fs::write(&file, ALPHA).unwrap();
    run_ragi(&config_path, &["ingest", file.to_str().unwrap()]);

    let (stdout, _, success) = run_ragi(&config_path, &["docs", "delete", "alpha.md"]);
    assert!(success);
    assert!(stdout.contains("Deleted 'alpha.md'"));

    fs::write(&file, ALPHA).unwrap();
    let (stdout, _, _) = run_ragi(&config_path, &["ingest", file.to_str().unwrap()]);
    assert!(stdout.contains("indexed alpha.md"), "stdout: {}", stdout);

    let (_, _, success) = run_ragi(&config_path, &["docs", "delete", "missing.md"]);
    assert!(!success);
}

#[test]
fn test_memory_store_twice_keeps_one_important_record() {
    let (_tmp, config_path) = setup_test_env();
    run_ragi(&config_path, &["init"]);

    let (stdout, _, success) = run_ragi(
        &config_path,
        &["memory", "store", "--query", "what is RAG?", "--response", "Retrieval-augmented generation."],
    );
    assert!(success);
    assert!(stdout.starts_with("stored "));

    let (stdout, _, success) = run_ragi(
        &config_path,
        &[
            "memory",
            "store",
            "--query",
            "what is RAG?",
            "--response",
            "Retrieval-augmented generation.",
            "--important",
        ],
    );
    assert!(success);
    assert!(stdout.contains("as important"), "stdout: {}", stdout);

    let (stdout, _, _) = run_ragi(&config_path, &["memory", "list"]);
    assert_eq!(stdout.matches("User: what is RAG?").count(), 1);
    assert!(stdout.contains("(important)"));

    let (stdout, _, success) = run_ragi(&config_path, &["memory", "recall", "RAG"]);
    assert!(success);
    assert!(stdout.contains("User: what is RAG?\nAI: Retrieval-augmented generation."));
}

#[test]
fn test_stats() {
    let (tmp, config_path) = setup_test_env();
    run_ragi(&config_path, &["init"]);

    let file = inbox(&tmp).join("alpha.md");
    fs::write(&file, ALPHA).unwrap();
    run_ragi(&config_path, &["ingest", file.to_str().unwrap()]);

    let (stdout, stderr, success) = run_ragi(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Sources:       1"), "stdout: {}", stdout);
    assert!(stdout.contains("1 files"));
    assert!(stdout.contains("alpha.md"));
}

#[test]
fn test_ingest_missing_file_fails() {
    let (tmp, config_path) = setup_test_env();
    run_ragi(&config_path, &["init"]);

    let missing = inbox(&tmp).join("nope.md");
    let (_, stderr, success) = run_ragi(&config_path, &["ingest", missing.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("Not a file"));
}
