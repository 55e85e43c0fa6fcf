use stagecraft::actions::{
    decode_strict, decode_validated, encode, ApplyComposeInputs, BuildInputs, KeyValue,
    RenderComposeInputs, StepInputs,
};
use stagecraft::StagecraftError;

fn sample_build() -> BuildInputs {
    BuildInputs {
        provider: "generic".to_string(),
        workdir: "apps/b".to_string(),
        dockerfile: "Dockerfile".to_string(),
        context: ".".to_string(),
        target: None,
        tags: vec!["shop:v2".to_string(), "shop:latest".to_string()],
        build_args: vec![KeyValue::new("NODE_ENV", "production")],
        labels: vec![KeyValue::new("org.opencontainers.image.version", "v2")],
    }
}

#[test]
fn unknown_field_is_a_hard_error() {
    let raw = br#"{"provider":"generic","workdir":"apps/b","dockerfile":"Dockerfile","context":".","unknown_field":"x"}"#;
    let err = decode_strict::<BuildInputs>(raw).unwrap_err();
    assert!(matches!(err, StagecraftError::StrictDecodeFailed(_)));
}

#[test]
fn trailing_values_are_a_hard_error() {
    let raw = br#"{"provider":"generic","workdir":"apps/b","dockerfile":"Dockerfile","context":".","tags":["a:b"]} 42"#;
    let err = decode_strict::<BuildInputs>(raw).unwrap_err();
    assert!(matches!(err, StagecraftError::StrictDecodeFailed(_)));
}

#[test]
fn round_trip_preserves_normalized_payloads() {
    let mut inputs = sample_build();
    let bytes = encode(&mut inputs).unwrap();
    let back: BuildInputs = decode_validated(&bytes).unwrap();
    assert_eq!(back, inputs);
    // Tags came back sorted because the producer normalized them.
    assert_eq!(back.tags, vec!["shop:latest", "shop:v2"]);

    // Marshal again: the payload is already canonical, so the bytes match.
    let mut again = back.clone();
    let bytes2 = encode(&mut again).unwrap();
    assert_eq!(bytes, bytes2);
}

#[test]
fn apply_compose_wire_scenario() {
    let raw = br#"{"environment":"prod","compose_path":"compose.yml","project_name":"app"}"#;
    let decoded: ApplyComposeInputs = decode_strict(raw).unwrap();
    let err = decoded.validate().unwrap_err();
    assert_eq!(err.field, "pull");

    let raw = br#"{"environment":"prod","compose_path":"compose.yml","project_name":"app","pull":true,"detach":true}"#;
    let decoded: ApplyComposeInputs = decode_strict(raw).unwrap();
    decoded.validate().unwrap();
}

#[test]
fn duplicate_keys_are_rejected_after_normalization() {
    let mut inputs = sample_build();
    inputs.build_args = vec![KeyValue::new("A", "1"), KeyValue::new("A", "2")];
    inputs.normalize();
    let err = inputs.validate().unwrap_err();
    assert_eq!(err.field, "build_args");
}

#[test]
fn sha256_normalization_boundaries() {
    let base = RenderComposeInputs {
        environment: "prod".to_string(),
        base_compose_path: Some("docker-compose.yml".to_string()),
        base_compose_inline: None,
        overlays: Vec::new(),
        variables: Vec::new(),
        output_path: "out/docker-compose.yml".to_string(),
        expected_compose_hash_alg: Some("sha256".to_string()),
        expected_compose_hash: None,
    };

    for (hash, ok) in [
        ("a".repeat(64), true),
        ("A".repeat(64), false),
        ("a".repeat(63), false),
        ("a".repeat(65), false),
    ] {
        let mut inputs = base.clone();
        inputs.expected_compose_hash = Some(hash);
        inputs.normalize();
        assert_eq!(inputs.validate().is_ok(), ok);
    }
}

#[test]
fn path_boundaries() {
    for (path, ok) in [
        (".", true),
        ("db/migrations", true),
        ("..", false),
        ("../up", false),
        ("/abs", false),
        ("~/home", false),
        ("C:/drive", false),
    ] {
        let mut inputs = sample_build();
        inputs.context = path.to_string();
        inputs.normalize();
        assert_eq!(inputs.validate().is_ok(), ok, "path {path}");
    }
}
