use stagecraft::config::Config;
use stagecraft::plan::{filter_services, plan_deploy, OperationKind};
use stagecraft::providers::{register_providers, Registries};

const CONFIG: &str = r#"
project:
  name: shop
backend:
  provider: generic
  providers:
    generic:
      dockerfile: docker/Dockerfile.api
      context: api
frontend:
  provider: generic
  providers:
    generic:
      dockerfile: docker/Dockerfile.web
      context: web
network:
  provider: tailscale
  providers:
    tailscale:
      tailnet_domain: tail1234.ts.net
databases:
  app:
    connection_env: DATABASE_URL
    migrations:
      engine: raw_sql
      path: db/migrations
      strategy: pre_deploy
  audit:
    connection_env: AUDIT_DATABASE_URL
    migrations:
      engine: raw_sql
      path: db/audit
      strategy: post_deploy
environments:
  staging:
    driver: docker
    env_file: .env.staging
    hosts:
      - name: web-1
        public_ip: 192.0.2.10
        tags: [web]
"#;

fn registries() -> Registries {
    let mut registries = Registries::default();
    register_providers(&mut registries);
    registries
}

#[tokio::test]
async fn repeated_planning_yields_identical_json() {
    let config = Config::from_yaml(CONFIG).unwrap();
    let registries = registries();
    let first = plan_deploy(&config, &registries, "staging", "abc").await.unwrap();
    let second = plan_deploy(&config, &registries, "staging", "abc").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
}

#[tokio::test]
async fn operations_follow_the_canonical_sequence() {
    let config = Config::from_yaml(CONFIG).unwrap();
    let plan = plan_deploy(&config, &registries(), "staging", "abc").await.unwrap();
    let kinds: Vec<OperationKind> = plan.operations.iter().map(|op| op.kind).collect();
    assert_eq!(
        kinds,
        vec![
            OperationKind::InfraProvision,
            OperationKind::Migration,
            OperationKind::Build,
            OperationKind::Build,
            OperationKind::Deploy,
            OperationKind::Migration,
            OperationKind::HealthCheck,
        ]
    );

    let pre = &plan.operations[1];
    assert_eq!(pre.meta("database"), Some("app"));
    assert_eq!(pre.meta("strategy"), Some("pre_deploy"));
    let post = &plan.operations[5];
    assert_eq!(post.meta("database"), Some("audit"));
    assert_eq!(post.meta("strategy"), Some("post_deploy"));
}

#[tokio::test]
async fn provider_plans_are_recorded_and_sorted_in_json() {
    let config = Config::from_yaml(CONFIG).unwrap();
    let plan = plan_deploy(&config, &registries(), "staging", "abc").await.unwrap();

    assert!(plan.provider_plan("generic").is_some());
    assert!(plan.provider_plan("raw_sql").is_some());
    assert!(plan.provider_plan("tailscale").is_some());

    let json = plan.to_json().unwrap();
    let generic = json.find("\"provider\": \"generic\"").unwrap();
    let raw_sql = json.find("\"provider\": \"raw_sql\"").unwrap();
    let tailscale = json.find("\"provider\": \"tailscale\"").unwrap();
    assert!(generic < raw_sql && raw_sql < tailscale);
}

#[tokio::test]
async fn unknown_environment_aborts_planning() {
    let config = Config::from_yaml(CONFIG).unwrap();
    let err = plan_deploy(&config, &registries(), "production", "abc")
        .await
        .unwrap_err();
    assert!(format!("{err}").contains("production"));
}

#[tokio::test]
async fn provider_plan_failure_returns_no_partial_plan() {
    // The backend provider rejects its config during plan; the whole
    // planning call must fail rather than return a partial plan.
    let raw = r#"
project:
  name: shop
backend:
  provider: generic
  providers:
    generic:
      not_a_field: true
environments:
  staging:
    driver: docker
"#;
    let config = Config::from_yaml(raw).unwrap();
    let err = plan_deploy(&config, &registries(), "staging", "abc")
        .await
        .unwrap_err();
    assert!(format!("{err}").contains("plan failed"));
}

#[tokio::test]
async fn service_filter_preserves_upstream_builds() {
    let config = Config::from_yaml(CONFIG).unwrap();
    let plan = plan_deploy(&config, &registries(), "staging", "abc").await.unwrap();

    let filtered = filter_services(&plan, &["frontend".to_string()]);
    let builds: Vec<&str> = filtered
        .operations
        .iter()
        .filter(|op| op.kind == OperationKind::Build)
        .filter_map(|op| op.meta("service"))
        .collect();
    // The deploy references backend too, so its build is retained.
    assert_eq!(builds, vec!["backend", "frontend"]);
}
