//! End-to-end generate scenarios against stub provisioners.

use score_ecs::core::error::{ConfigurationError, Error, ProvisionError};
use score_ecs::core::generate::{generate, GenerateConfig, GenerateReport, OutputTarget};
use score_ecs::core::parser::parse_workload;
use score_ecs::core::state::{load_state, state_file_path};
use score_ecs::core::types::{OutputValue, Provisioned, ResolvedResource, Service, WorkloadSpec};
use score_ecs::provisioners::{ProvisionRequest, Provisioner, ProvisionerRegistry};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Records every provision call across stubs.
#[derive(Default)]
struct CallLog {
    calls: Mutex<Vec<String>>,
}

impl CallLog {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

struct Stub {
    kind: &'static str,
    log: Arc<CallLog>,
    fail: bool,
}

#[async_trait::async_trait]
impl Provisioner for Stub {
    fn uri(&self) -> &str {
        self.kind
    }

    fn resource_type(&self) -> &str {
        self.kind
    }

    fn class(&self) -> Option<&str> {
        None
    }

    async fn provision(
        &self,
        request: &ProvisionRequest,
        _prior: Option<&ResolvedResource>,
    ) -> Result<Provisioned, ProvisionError> {
        self.log.calls.lock().unwrap().push(request.id.clone());
        if self.fail {
            return Err(ProvisionError::new(format!("{} is unavailable", request.id)));
        }
        let mut p = Provisioned::default();
        p.outputs
            .insert("host".to_string(), OutputValue::string(format!("{}-host", request.id)));
        p.outputs.insert(
            "port".to_string(),
            OutputValue::Value(serde_yaml_ng::Value::Number(5432.into())),
        );
        p.outputs
            .insert("id".to_string(), OutputValue::string(format!("{}-id", request.id)));
        p.outputs
            .insert("password".to_string(), OutputValue::secret(format!("arn:{}", request.id)));
        p.services.insert(
            format!("{}-svc", request.id),
            Service {
                image: Some(format!("{}:latest", self.kind)),
                ..Default::default()
            },
        );
        Ok(p)
    }
}

fn registry(log: &Arc<CallLog>, failing: &[&'static str]) -> ProvisionerRegistry {
    let mut r = ProvisionerRegistry::new();
    for kind in ["postgres", "redis", "network", "amqp"] {
        r.register(Arc::new(Stub {
            kind,
            log: Arc::clone(log),
            fail: failing.contains(&kind),
        }));
    }
    r
}

fn workload(yaml: &str) -> WorkloadSpec {
    parse_workload("score.yaml", yaml).unwrap()
}

async fn run(
    dir: &Path,
    workloads: &[WorkloadSpec],
    registry: &ProvisionerRegistry,
) -> Result<GenerateReport, Error> {
    generate(&GenerateConfig {
        workloads,
        registry,
        state_dir: &dir.join(".score-ecs"),
        output: OutputTarget::File(dir.join("compose.yaml")),
        parallelism: 4,
        event_log: true,
    })
    .await
}

fn compose(dir: &Path) -> String {
    std::fs::read_to_string(dir.join("compose.yaml")).unwrap()
}

fn manifest(dir: &Path) -> serde_yaml_ng::Value {
    serde_yaml_ng::from_str(&compose(dir)).unwrap()
}

const WEB: &str = r#"
apiVersion: score.dev/v1b1
metadata:
  name: web
containers:
  main:
    image: web:1
    variables:
      DATABASE_URL: postgres://${resources.db.host}:${resources.db.port}/app
      DB_PASSWORD: ${resources.db.password}
resources:
  db:
    type: postgres
"#;

const WORKER: &str = r#"
apiVersion: score.dev/v1b1
metadata:
  name: worker
containers:
  main:
    image: worker:1
    variables:
      DATABASE_URL: postgres://${resources.db.host}:${resources.db.port}/app
resources:
  db:
    type: postgres
"#;

#[tokio::test]
async fn shared_database_provisioned_once_and_reused() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(CallLog::default());
    let reg = registry(&log, &[]);
    let workloads = [workload(WEB), workload(WORKER)];

    let first = run(dir.path(), &workloads, &reg).await.unwrap();
    assert_eq!(log.calls(), vec!["db"]);
    assert_eq!(first.provisioned, 1);
    let first_compose = compose(dir.path());

    let m = manifest(dir.path());
    let web_url = &m["services"]["web-main"]["environment"]["DATABASE_URL"];
    let worker_url = &m["services"]["worker-main"]["environment"]["DATABASE_URL"];
    assert_eq!(web_url, "postgres://db-host:5432/app");
    assert_eq!(web_url, worker_url);
    assert_eq!(m["services"]["web-main"]["x-secrets"]["DB_PASSWORD"], "arn:db");
    assert_eq!(m["services"]["web-main"]["depends_on"][0], "db-svc");

    let second = run(dir.path(), &workloads, &reg).await.unwrap();
    assert_eq!(log.calls(), vec!["db"], "second run must not call the provisioner");
    assert_eq!(second.reused, 1);
    assert_eq!(compose(dir.path()), first_compose);
}

const NETWORKED: &str = r#"
apiVersion: score.dev/v1b1
metadata:
  name: consumer
containers:
  main:
    image: consumer:1
    variables:
      QUEUE: ${resources.queue.host}
resources:
  queue:
    type: amqp
    params:
      network: ${resources.network.id}
  network:
    type: network
"#;

const PRODUCER: &str = r#"
apiVersion: score.dev/v1b1
metadata:
  name: producer
containers:
  main:
    image: producer:1
resources:
  network:
    type: network
"#;

#[tokio::test]
async fn referenced_resource_resolves_first_regardless_of_input_order() {
    let mut outputs = Vec::new();
    for order in [[NETWORKED, PRODUCER], [PRODUCER, NETWORKED]] {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(CallLog::default());
        let workloads: Vec<_> = order.iter().map(|y| workload(y)).collect();
        run(dir.path(), &workloads, &registry(&log, &[])).await.unwrap();
        assert_eq!(log.calls(), vec!["network", "queue"]);
        outputs.push(compose(dir.path()));
    }
    assert_eq!(outputs[0], outputs[1]);
}

const API: &str = r#"
apiVersion: score.dev/v1b1
metadata:
  name: api
containers:
  main:
    image: api:1
    variables:
      CACHE: ${resources.cache.host}
      DB: ${resources.db.host}
resources:
  cache:
    type: redis
  db:
    type: postgres
"#;

const BATCH: &str = r#"
apiVersion: score.dev/v1b1
metadata:
  name: batch
containers:
  main:
    image: batch:1
    variables:
      DB: ${resources.db.host}
resources:
  db:
    type: postgres
"#;

#[tokio::test]
async fn failed_cache_blocks_only_its_workload() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(CallLog::default());
    let workloads = [workload(API), workload(BATCH)];

    let err = run(dir.path(), &workloads, &registry(&log, &["redis"])).await.unwrap_err();
    match &err {
        Error::Incomplete {
            failed,
            blocked,
            skipped_workloads,
            errors,
        } => {
            assert_eq!(failed, &vec!["cache".to_string()]);
            assert_eq!(errors.len(), 1);
            assert!(blocked.is_empty());
            assert_eq!(skipped_workloads, &vec!["api".to_string()]);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(err.to_string().contains("cache is unavailable"));

    let m = manifest(dir.path());
    assert!(m["services"].get("batch-main").is_some());
    assert!(m["services"].get("api-main").is_none());

    let state = load_state(&dir.path().join(".score-ecs")).unwrap();
    assert!(state.get("db").is_some());
    assert!(state.get("cache").is_none());
}

#[tokio::test]
async fn reference_cycle_fails_before_any_provisioning() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(CallLog::default());
    let cyclic = workload(
        r#"
apiVersion: score.dev/v1b1
metadata:
  name: loop
containers:
  main:
    image: loop:1
resources:
  a:
    type: amqp
    params:
      peer: ${resources.b.id}
  b:
    type: amqp
    params:
      peer: ${resources.c.id}
  c:
    type: amqp
    params:
      peer: ${resources.a.id}
"#,
    );

    let err = run(dir.path(), &[cyclic], &registry(&log, &[])).await.unwrap_err();
    match err {
        Error::Configuration(ConfigurationError::Cycle { mut members }) => {
            members.sort();
            assert_eq!(members, vec!["a", "b", "c"]);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(log.calls().is_empty());
    assert!(!state_file_path(&dir.path().join(".score-ecs")).exists());
    assert!(!dir.path().join("compose.yaml").exists());
}

#[tokio::test]
async fn removed_resource_is_dropped_from_state() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(CallLog::default());
    let reg = registry(&log, &[]);

    run(dir.path(), &[workload(API)], &reg).await.unwrap();
    let state = load_state(&dir.path().join(".score-ecs")).unwrap();
    assert!(state.get("cache").is_some());

    let without_cache = API
        .replace("      CACHE: ${resources.cache.host}\n", "")
        .replace("  cache:\n    type: redis\n", "");
    let report = run(dir.path(), &[workload(&without_cache)], &reg).await.unwrap();
    assert_eq!(report.dropped, vec!["cache"]);

    let state = load_state(&dir.path().join(".score-ecs")).unwrap();
    assert!(state.get("cache").is_none());
    assert!(state.get("db").is_some());
    assert!(!compose(dir.path()).contains("cache-svc"));
}

#[tokio::test]
async fn manifest_has_no_unresolved_placeholders() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(CallLog::default());
    let workloads = [workload(WEB), workload(WORKER), workload(NETWORKED), workload(PRODUCER)];
    run(dir.path(), &workloads, &registry(&log, &[])).await.unwrap();
    assert!(!compose(dir.path()).contains("${"));
}

#[tokio::test]
async fn default_provisioners_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let reg = ProvisionerRegistry::with_defaults().unwrap();
    let app = workload(
        r#"
apiVersion: score.dev/v1b1
metadata:
  name: app
service:
  ports:
    http:
      port: 8080
containers:
  main:
    image: app:1
    variables:
      REDIS_URL: redis://${resources.cache.username}:${resources.cache.password}@${resources.cache.host}:${resources.cache.port}
    volumes:
      - source: ${resources.data.source}
        target: /data
resources:
  cache:
    type: redis
  data:
    type: volume
"#,
    );
    run(dir.path(), &[app], &reg).await.unwrap();

    let m = manifest(dir.path());
    assert_eq!(m["services"]["app-main"]["ports"][0], "8080:8080");
    assert_eq!(m["services"]["app-main"]["volumes"][0], "vol-data:/data");
    assert!(m["volumes"].get("vol-data").is_some());
    assert_eq!(m["services"]["redis-cache"]["image"], "redis:7-alpine");
    let url = m["services"]["app-main"]["environment"]["REDIS_URL"].as_str().unwrap();
    assert!(url.starts_with("redis://default:"));
    assert!(url.ends_with("@redis-cache:6379"));
}
