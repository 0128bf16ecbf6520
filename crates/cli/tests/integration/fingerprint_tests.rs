//! Fingerprint command integration tests.

use predicates::prelude::*;

use super::common::TestEnv;

const FUNCTIONS_JSON: &str = r#"[
  {"name": "hello", "image_name": "hello"},
  {"name": "ext", "image_name": "ext", "image_source": "python:3.12"}
]"#;

fn staged() -> TestEnv {
  let env = TestEnv::new();
  env.stage("functions:\n  hello: {}\n", "routes: []\n", "resources: {}\n");
  env.write_file("out/functions/hello/Dockerfile", "FROM base\n");
  env.write_file("functions.json", FUNCTIONS_JSON);
  env
}

fn fingerprint(env: &TestEnv, digest: &str) -> String {
  let output = env
    .fnbox_cmd()
    .arg("fingerprint")
    .arg(env.output_path())
    .arg("--functions")
    .arg(env.root().join("functions.json"))
    .args(["--project", "demo", "--env", "dev", "--base-image-id", "sha256:base"])
    .arg("--digest")
    .arg(format!("python:3.12={digest}"))
    .output()
    .unwrap();
  assert!(output.status.success());
  String::from_utf8(output.stdout).unwrap().lines().next().unwrap().to_string()
}

#[test]
fn fingerprint_is_stable() {
  let env = staged();
  let first = fingerprint(&env, "sha256:aaa");
  let second = fingerprint(&env, "sha256:aaa");

  assert_eq!(first.len(), 8);
  assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
  assert_eq!(first, second);
}

#[test]
fn source_digest_changes_fingerprint() {
  let env = staged();
  assert_ne!(fingerprint(&env, "sha256:aaa"), fingerprint(&env, "sha256:bbb"));
}

#[test]
fn staged_file_change_changes_fingerprint() {
  let env = staged();
  let before = fingerprint(&env, "sha256:aaa");
  env.write_file("out/functions/hello/Dockerfile", "FROM base\nRUN true\n");
  assert_ne!(before, fingerprint(&env, "sha256:aaa"));
}

#[test]
fn missing_config_fails() {
  let env = TestEnv::new();
  env.write_file("out/functions/hello/Dockerfile", "FROM base\n");

  env
    .fnbox_cmd()
    .arg("fingerprint")
    .arg(env.output_path())
    .assert()
    .failure()
    .stderr(predicate::str::contains("config not found"));
}

#[test]
fn json_output_has_components() {
  let env = staged();

  env
    .fnbox_cmd()
    .args(["-o", "json", "fingerprint"])
    .arg(env.output_path())
    .assert()
    .success()
    .stdout(predicate::str::contains(r#""fingerprint""#))
    .stdout(predicate::str::contains(r#""sources": """#));
}
