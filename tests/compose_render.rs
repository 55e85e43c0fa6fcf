use std::fs;
use std::path::Path;

use stagecraft::compose::{render_environment, sha256_hex, ComposeFile};

const BASE: &str = r#"version: "3.9"
services:
  api:
    image: old:tag
    environment:
      EXISTING: original
  worker:
    build:
      context: .
volumes:
  app_data:
    driver: local
x-custom:
  foo: bar
"#;

const ENV_FILE: &str = "NEW=one\nEXISTING=keep_me\n";

fn write_project(dir: &Path) {
    fs::write(dir.join("docker-compose.yml"), BASE).unwrap();
    fs::write(dir.join(".env.staging"), ENV_FILE).unwrap();
}

#[test]
fn deterministic_compose_generation() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());

    let first = render_environment(
        dir.path(),
        Path::new("docker-compose.yml"),
        "staging",
        "myapp:v1",
        Some(Path::new(".env.staging")),
        &[],
    )
    .unwrap();
    let second = render_environment(
        dir.path(),
        Path::new("docker-compose.yml"),
        "staging",
        "myapp:v1",
        Some(Path::new(".env.staging")),
        &[],
    )
    .unwrap();

    assert_eq!(first.bytes, second.bytes);
    assert_eq!(first.sha256, second.sha256);
    assert_eq!(first.sha256, sha256_hex(&first.bytes));

    let rendered = String::from_utf8(first.bytes).unwrap();
    // Both services carry the injected tag; the old one is gone.
    assert_eq!(rendered.matches("image: myapp:v1").count(), 2);
    assert!(!rendered.contains("old:tag"));
    // Existing environment wins; merged variables are sorted.
    assert!(rendered.contains("EXISTING: original"));
    assert!(rendered.contains("NEW: one"));
    assert!(rendered.find("EXISTING").unwrap() < rendered.find("NEW").unwrap());
    // Untouched sections survive.
    assert!(rendered.contains("app_data"));
    assert!(rendered.contains("x-custom"));
    assert!(rendered.contains("build:"));
    // The worker had no environment of its own but still receives the
    // env-file variables.
    let worker = rendered.find("worker:").unwrap();
    assert!(rendered[worker..].contains("NEW: one"));
}

#[test]
fn output_is_independent_of_invocation_directory() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    write_project(dir_a.path());
    write_project(dir_b.path());

    let a = render_environment(
        dir_a.path(),
        Path::new("docker-compose.yml"),
        "staging",
        "myapp:v1",
        Some(Path::new(".env.staging")),
        &[],
    )
    .unwrap();
    let b = render_environment(
        dir_b.path(),
        Path::new("docker-compose.yml"),
        "staging",
        "myapp:v1",
        Some(Path::new(".env.staging")),
        &[],
    )
    .unwrap();

    assert_eq!(a.bytes, b.bytes);
    assert_eq!(a.sha256, b.sha256);
}

#[test]
fn artifact_lands_on_the_rendered_path() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());

    let rendered = render_environment(
        dir.path(),
        Path::new("docker-compose.yml"),
        "staging",
        "myapp:v1",
        None,
        &[],
    )
    .unwrap();
    assert_eq!(
        rendered.path,
        dir.path()
            .join(".stagecraft")
            .join("rendered")
            .join("staging")
            .join("docker-compose.yml")
    );
    assert_eq!(fs::read(&rendered.path).unwrap(), rendered.bytes);
}

#[test]
fn missing_env_file_is_a_silent_skip() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("docker-compose.yml"), BASE).unwrap();

    let rendered = render_environment(
        dir.path(),
        Path::new("docker-compose.yml"),
        "staging",
        "myapp:v1",
        Some(Path::new(".env.absent")),
        &[],
    )
    .unwrap();
    let text = String::from_utf8(rendered.bytes).unwrap();
    assert!(text.contains("image: myapp:v1"));
    assert!(!text.contains("NEW"));
}

#[test]
fn overlays_merge_recursively_with_overlay_winning() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());
    fs::write(
        dir.path().join("compose.staging.yml"),
        "services:\n  api:\n    environment:\n      EXISTING: overlaid\n    ports:\n      - '8080:80'\n",
    )
    .unwrap();

    let rendered = render_environment(
        dir.path(),
        Path::new("docker-compose.yml"),
        "staging",
        "myapp:v1",
        None,
        &["compose.staging.yml".to_string()],
    )
    .unwrap();
    let text = String::from_utf8(rendered.bytes).unwrap();
    // Overlay replaced the scalar; siblings from the base survive.
    assert!(text.contains("EXISTING: overlaid"));
    assert!(text.contains("8080:80"));
    assert!(text.contains("worker:"));
    assert!(text.contains("x-custom"));
}

#[test]
fn service_with_build_but_no_image_still_receives_the_tag() {
    let mut compose = ComposeFile::parse(BASE).unwrap();
    compose.set_service_images("myapp:v1");
    let rendered = compose.render().unwrap();
    let worker = rendered.find("worker:").unwrap();
    assert!(rendered[worker..].contains("image: myapp:v1"));
}
