use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn rag_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("rag");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    let docs_dir = root.join("docs");
    fs::create_dir_all(&docs_dir).unwrap();
    fs::write(
        docs_dir.join("solar.md"),
        "# Solar Power\n\nSolar panels convert sunlight into electricity.\n\nAn inverter converts direct current to alternating current.",
    )
    .unwrap();
    fs::write(
        docs_dir.join("storage.txt"),
        "Battery storage holds surplus solar energy overnight.\n\nCapacity is measured in kilowatt hours.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/rag.sqlite"

[chunking]
max_tokens = 200

[server]
bind = "127.0.0.1:7412"
"#,
        root.display()
    );

    let config_path = config_dir.join("rag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_rag(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = rag_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run rag binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_rag(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Initialized database"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_rag(&config_path, &["init"]);
    let (_, _, success2) = run_rag(&config_path, &["init"]);
    assert!(success1);
    assert!(success2);
}

#[test]
fn test_add_docs_and_list() {
    let (tmp, config_path) = setup_test_env();
    run_rag(&config_path, &["init"]);

    let docs_dir = tmp.path().join("docs");
    let (stdout, stderr, success) =
        run_rag(&config_path, &["add", docs_dir.to_str().unwrap()]);
    assert!(success, "add failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Added 2 document(s)"));

    let (stdout, _, success) = run_rag(&config_path, &["docs"]);
    assert!(success);
    assert!(stdout.contains("solar"));
    assert!(stdout.contains("storage"));
}

#[test]
fn test_add_missing_path_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_rag(&config_path, &["init"]);

    let (_, stderr, success) = run_rag(&config_path, &["add", "/nonexistent/nowhere"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_ask_answers_and_records_trace() {
    let (tmp, config_path) = setup_test_env();
    run_rag(&config_path, &["init"]);
    let docs_dir = tmp.path().join("docs");
    run_rag(&config_path, &["add", docs_dir.to_str().unwrap()]);

    let (stdout, stderr, success) = run_rag(
        &config_path,
        &["ask", "How do solar panels make electricity?"],
    );
    assert!(success, "ask failed: stdout={}, stderr={}", stdout, stderr);
    // No provider is configured, so the answer is the deterministic fallback
    assert!(stdout.contains("Sources:"));
    assert!(stdout.contains("trace "));
    assert!(stdout.contains("(fallback)"));

    let (stdout, _, success) = run_rag(&config_path, &["traces"]);
    assert!(success);
    assert!(stdout.contains("solar panels"));
}

#[test]
fn test_ask_json_output_has_steps() {
    let (tmp, config_path) = setup_test_env();
    run_rag(&config_path, &["init"]);
    let docs_dir = tmp.path().join("docs");
    run_rag(&config_path, &["add", docs_dir.to_str().unwrap()]);

    let (stdout, _, success) = run_rag(
        &config_path,
        &["ask", "What holds surplus energy?", "--json"],
    );
    assert!(success);
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let steps = json["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[0]["name"], "planning");
    assert_eq!(steps[1]["name"], "retrieval");
    assert_eq!(steps[2]["name"], "generation");
    assert_eq!(json["fallback"], true);
    assert!(json["trace_id"].as_str().unwrap().len() > 0);
}

#[test]
fn test_remove_document() {
    let (tmp, config_path) = setup_test_env();
    run_rag(&config_path, &["init"]);
    let solar = tmp.path().join("docs").join("solar.md");
    let (stdout, _, _) = run_rag(&config_path, &["add", solar.to_str().unwrap()]);

    // The add output prints "  <id> — <title> (N chunks)"
    let id = stdout
        .lines()
        .find(|l| l.contains("solar"))
        .and_then(|l| l.trim().split_whitespace().next())
        .expect("document id in add output")
        .to_string();

    let (stdout, _, success) = run_rag(&config_path, &["remove", &id]);
    assert!(success, "remove failed: {}", stdout);

    let (stdout, _, _) = run_rag(&config_path, &["docs"]);
    assert!(stdout.contains("No documents stored."));
}

#[test]
fn test_remove_unknown_id_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_rag(&config_path, &["init"]);

    let (_, stderr, success) = run_rag(&config_path, &["remove", "no-such-id"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_preset_list_and_apply() {
    let (_tmp, config_path) = setup_test_env();
    run_rag(&config_path, &["init"]);

    let (stdout, _, success) = run_rag(&config_path, &["preset"]);
    assert!(success);
    assert!(stdout.contains("fast"));
    assert!(stdout.contains("balanced"));
    assert!(stdout.contains("thorough"));

    let (stdout, _, success) = run_rag(&config_path, &["preset", "thorough"]);
    assert!(success);
    assert!(stdout.contains("Applied preset 'thorough'"));
    assert!(stdout.contains("top_n=10"));

    let (_, stderr, success) = run_rag(&config_path, &["preset", "turbo"]);
    assert!(!success);
    assert!(stderr.contains("Unknown preset"));
}

#[test]
fn test_eval_runs_question_file() {
    let (tmp, config_path) = setup_test_env();
    run_rag(&config_path, &["init"]);
    let docs_dir = tmp.path().join("docs");
    run_rag(&config_path, &["add", docs_dir.to_str().unwrap()]);

    let questions = tmp.path().join("questions.txt");
    fs::write(
        &questions,
        "How do solar panels work?\n\nWhat holds surplus energy?\n",
    )
    .unwrap();

    let (stdout, stderr, success) = run_rag(
        &config_path,
        &["eval", "smoke", questions.to_str().unwrap()],
    );
    assert!(success, "eval failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Evaluation 'smoke': 2 question(s)"));
}

#[test]
fn test_missing_config_fails() {
    let (_, stderr, success) = run_rag(Path::new("/nonexistent/rag.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
