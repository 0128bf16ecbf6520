//! Merge command integration tests.

use predicates::prelude::*;

use super::common::TestEnv;

const FUNCTIONS_V1: &str = "functions:\n  hello:\n    handler: app.handler\ndefaults:\n  timeout: 30\n";
const ROUTES_V1: &str = r#"routes:
  - path: /hello
    method: GET
    function: hello
  - path: /world
    method: POST
    function: world
"#;
const RESOURCES_V1: &str = "resources:\n  dynamodb:\n    - TableName: users\n";

#[test]
fn merge_into_empty_store() {
  let env = TestEnv::new();
  env.stage(FUNCTIONS_V1, ROUTES_V1, RESOURCES_V1);

  env
    .fnbox_cmd()
    .arg("merge")
    .arg(env.output_path())
    .arg(env.store_path())
    .assert()
    .success()
    .stdout(predicate::str::contains("Merged config"))
    .stdout(predicate::str::contains("Routes: 2"));

  assert!(env.read_file("store/functions.yml").contains("hello"));
  assert!(env.read_file("store/resources.yml").contains("users"));
}

#[test]
fn second_merge_updates_keeps_and_appends() {
  let env = TestEnv::new();
  env.stage(FUNCTIONS_V1, ROUTES_V1, RESOURCES_V1);
  env
    .fnbox_cmd()
    .arg("merge")
    .arg(env.output_path())
    .arg(env.store_path())
    .assert()
    .success();

  env.stage(
    "functions:\n  other: {}\ndefaults:\n  timeout: 60\n",
    "routes:\n  - {path: /hello, method: GET, function: hello-v2}\n  - {path: /new, function: fresh}\n",
    "resources:\n  s3:\n    - BucketName: assets\n",
  );
  env
    .fnbox_cmd()
    .args(["merge", "-o", "json"])
    .arg(env.output_path())
    .arg(env.store_path())
    .assert()
    .success()
    .stdout(predicate::str::contains(r#""routes": 3"#))
    .stdout(predicate::str::contains(r#""functions": 2"#))
    .stdout(predicate::str::contains(r#""tables": 1"#))
    .stdout(predicate::str::contains(r#""buckets": 1"#));

  let routing = env.read_file("store/routing.yml");
  assert!(routing.contains("hello-v2"));
  assert!(routing.contains("/world"));
  assert!(env.read_file("store/functions.yml").contains("timeout: 30"));
}

#[test]
fn malformed_store_fails_without_writing() {
  let env = TestEnv::new();
  env.stage(FUNCTIONS_V1, ROUTES_V1, RESOURCES_V1);
  env.write_file("store/functions.yml", "functions:\n  old: {}\n");
  env.write_file("store/resources.yml", "resources: [broken\n");

  env
    .fnbox_cmd()
    .arg("merge")
    .arg(env.output_path())
    .arg(env.store_path())
    .assert()
    .failure()
    .stderr(predicate::str::contains("resources.yml"));

  assert_eq!(env.read_file("store/functions.yml"), "functions:\n  old: {}\n");
  assert!(!env.store_path().join("routing.yml").exists());
}

#[test]
fn missing_rendered_config_fails() {
  let env = TestEnv::new();
  env.write_file("out/config/functions.yml", "functions: {}\n");

  env
    .fnbox_cmd()
    .arg("merge")
    .arg(env.output_path())
    .arg(env.store_path())
    .assert()
    .failure()
    .stderr(predicate::str::contains("config not found"));
}

#[test]
fn image_import_manifest_is_merged() {
  let env = TestEnv::new();
  env.stage(FUNCTIONS_V1, ROUTES_V1, RESOURCES_V1);
  env.write_file(
    "out/config/image-import.json",
    r#"{"version":"1","push_target":"127.0.0.1:5010","images":[{"function_name":"ext","image_source":"python:3.12","image_ref":"registry:5010/docker.io/library/python:3.12"}]}"#,
  );

  env
    .fnbox_cmd()
    .arg("merge")
    .arg(env.output_path())
    .arg(env.store_path())
    .assert()
    .success()
    .stdout(predicate::str::contains("Image imports: 1"));

  assert!(env.read_file("store/image-import.json").contains("127.0.0.1:5010"));
}
