//! End-to-end tests: a real dispatcher on an ephemeral port, real worker
//! runtimes, stub modules.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use evidence_queue::db::Db;
use evidence_queue::dispatch::{DispatchConfig, Dispatcher};
use evidence_queue::error::{Error, ModuleError};
use evidence_queue::hooks::NamePatternRules;
use evidence_queue::model::{
    Case, Evidence, Hook, HookTrigger, JobDescriptor, JobId, JobStatus, NewJob, PushJobRequest,
    WorkerToken,
};
use evidence_queue::module::{Module, ModuleRegistry};
use evidence_queue::server;
use evidence_queue::worker::{DispatcherClient, JobStream, WorkerRuntime};
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    base_url: String,
    dispatcher: Arc<Dispatcher>,
    db: Arc<Db>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
    }
}

async fn seeded_db() -> Arc<Db> {
    let db = Db::in_memory().await.unwrap();
    db.save_case(&Case {
        id: "C1".into(),
        name: "Case One".into(),
        sketch_id: 3,
    })
    .await
    .unwrap();
    db.save_evidence(&evidence("E1", "Security.evtx")).await.unwrap();
    Arc::new(db)
}

fn evidence(id: &str, name: &str) -> Evidence {
    Evidence {
        id: id.into(),
        case_id: "C1".into(),
        kind: "Logs".into(),
        name: name.into(),
        source: "DC01".into(),
        notes: String::new(),
        size: 0,
        hash: String::new(),
        added_at: Utc::now(),
    }
}

async fn start_server(db: Arc<Db>, api_key: Option<&str>) -> Harness {
    let dispatcher = Arc::new(
        Dispatcher::start(
            Arc::clone(&db),
            Arc::new(ModuleRegistry::catalog().unwrap()),
            Arc::new(NamePatternRules),
            DispatchConfig {
                poll_interval: Duration::from_millis(20),
                keepalive_interval: Duration::from_millis(50),
            },
        )
        .await
        .unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server::router(
        Arc::clone(&dispatcher),
        api_key.map(|k| SecretString::from(k.to_string())),
    );
    tokio::spawn(server::serve(listener, app, dispatcher.shutdown_token()));

    Harness {
        base_url: format!("http://{addr}"),
        dispatcher,
        db,
    }
}

/// Module that records the job status it observed, then succeeds, fails
/// with an exit code, or returns artifacts.
#[derive(Clone)]
struct StubModule {
    name: &'static str,
    db: Arc<Db>,
    exit_code: Option<i32>,
    artifacts: Vec<Evidence>,
    observed: Arc<Mutex<Vec<(String, JobStatus)>>>,
}

impl StubModule {
    fn new(name: &'static str, db: &Arc<Db>) -> Self {
        Self {
            name,
            db: Arc::clone(db),
            exit_code: None,
            artifacts: Vec::new(),
            observed: Arc::default(),
        }
    }

    fn exiting(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    fn producing(mut self, artifact: Evidence) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

#[async_trait]
impl Module for StubModule {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "stub"
    }

    fn supports(&self, _evidence: &Evidence) -> bool {
        true
    }

    async fn run(&self, job: &JobDescriptor) -> Result<Vec<Evidence>, ModuleError> {
        let status = self
            .db
            .get_job(&JobId(job.id.clone()))
            .await
            .map_err(|e| ModuleError::Failed(e.to_string()))?
            .status;
        self.observed.lock().unwrap().push((job.id.clone(), status));

        match self.exit_code {
            Some(code) => Err(ModuleError::Exited(code)),
            None => Ok(self.artifacts.clone()),
        }
    }
}

fn start_worker(
    base_url: &str,
    modules: Vec<StubModule>,
) -> (Arc<WorkerRuntime>, JoinHandle<evidence_queue::error::Result<()>>) {
    let mut registry = ModuleRegistry::new();
    for module in modules {
        registry.register(Arc::new(module)).unwrap();
    }
    let client = DispatcherClient::new(base_url, None, false).unwrap();
    let runtime = Arc::new(
        WorkerRuntime::new(client, Arc::new(registry), 2)
            .with_reconnect_delay(Duration::from_millis(50)),
    );
    let handle = tokio::spawn({
        let runtime = Arc::clone(&runtime);
        async move { runtime.run().await }
    });
    (runtime, handle)
}

async fn stop_worker(runtime: Arc<WorkerRuntime>, handle: JoinHandle<evidence_queue::error::Result<()>>) {
    runtime.shutdown();
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("worker did not stop")
        .unwrap()
        .unwrap();
}

async fn wait_for_status(db: &Db, id: &JobId, status: JobStatus) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let job = db.get_job(id).await.unwrap();
        if job.status == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} stuck in {} waiting for {status}",
            job.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Next descriptor that is not a heartbeat.
async fn next_job(stream: &mut JobStream) -> JobDescriptor {
    tokio::time::timeout(WAIT, async {
        loop {
            let descriptor = stream.next().await.unwrap().expect("stream ended");
            if !descriptor.is_keep_alive() {
                return descriptor;
            }
        }
    })
    .await
    .expect("no job dispatched")
}

#[tokio::test]
async fn worker_runs_job_and_acks_success() {
    let db = seeded_db().await;
    let harness = start_server(Arc::clone(&db), None).await;
    let job = db.enqueue(NewJob::new("C1", "E1", "Hayabusa")).await.unwrap();

    let module = StubModule::new("Hayabusa", &db);
    let observed = Arc::clone(&module.observed);
    let (runtime, handle) = start_worker(&harness.base_url, vec![module]);

    wait_for_status(&db, &job.id, JobStatus::Success).await;
    let done = db.get_job(&job.id).await.unwrap();
    assert!(done.error.is_empty());
    assert_eq!(
        observed.lock().unwrap().as_slice(),
        &[(job.id.to_string(), JobStatus::Running)]
    );

    stop_worker(runtime, handle).await;
}

#[tokio::test]
async fn disconnected_worker_job_is_rescheduled_and_run_elsewhere() {
    let db = seeded_db().await;
    let harness = start_server(Arc::clone(&db), None).await;
    let job = db.enqueue(NewJob::new("C1", "E1", "Hayabusa")).await.unwrap();

    // First worker claims the job and vanishes without acking.
    let client = DispatcherClient::new(&harness.base_url, None, false).unwrap();
    let mut stream = client.open_stream(&["Hayabusa".to_string()], 1).await.unwrap();
    let descriptor = next_job(&mut stream).await;
    assert_eq!(descriptor.id, job.id.as_str());
    assert_eq!(descriptor.case.as_ref().unwrap().sketch_id, 3);
    assert_eq!(descriptor.evidence.as_ref().unwrap().name, "Security.evtx");

    let running = db.get_job(&job.id).await.unwrap();
    assert_eq!(running.status, JobStatus::Running);
    assert_eq!(running.worker_token, descriptor.worker_token);
    drop(stream);

    wait_for_status(&db, &job.id, JobStatus::Scheduled).await;
    assert!(db.get_job(&job.id).await.unwrap().worker_token.is_empty());

    // A second worker picks it up and fails it.
    let (runtime, handle) = start_worker(
        &harness.base_url,
        vec![StubModule::new("Hayabusa", &db).exiting(1)],
    );
    wait_for_status(&db, &job.id, JobStatus::Failed).await;
    assert_eq!(db.get_job(&job.id).await.unwrap().error, "tool exited 1");

    stop_worker(runtime, handle).await;
}

#[tokio::test]
async fn module_failure_does_not_stop_later_jobs() {
    let db = seeded_db().await;
    let harness = start_server(Arc::clone(&db), None).await;
    let broken = db.enqueue(NewJob::new("C1", "E1", "Broken")).await.unwrap();
    let healthy = db.enqueue(NewJob::new("C1", "E1", "Hayabusa")).await.unwrap();
    let broken_again = db.enqueue(NewJob::new("C1", "E1", "Broken")).await.unwrap();

    let (runtime, handle) = start_worker(
        &harness.base_url,
        vec![
            StubModule::new("Broken", &db).exiting(3),
            StubModule::new("Hayabusa", &db),
        ],
    );

    wait_for_status(&db, &broken.id, JobStatus::Failed).await;
    wait_for_status(&db, &healthy.id, JobStatus::Success).await;
    wait_for_status(&db, &broken_again.id, JobStatus::Failed).await;
    assert_eq!(db.get_job(&broken.id).await.unwrap().error, "tool exited 3");

    stop_worker(runtime, handle).await;
}

#[tokio::test]
async fn artifacts_are_registered_and_fire_hooks() {
    let db = seeded_db().await;
    db.save_hook(&Hook {
        id: "h1".into(),
        trigger: HookTrigger::OnEvidenceAdded,
        name: "upload timelines".into(),
        module: "Timesketch Importer".into(),
        condition: "*.jsonl".into(),
        enabled: true,
    })
    .await
    .unwrap();
    let harness = start_server(Arc::clone(&db), None).await;
    let job = db.enqueue(NewJob::new("C1", "E1", "Hayabusa")).await.unwrap();

    let artifact = evidence("E2", "Security.evtx.jsonl");
    let (runtime, handle) = start_worker(
        &harness.base_url,
        vec![StubModule::new("Hayabusa", &db).producing(artifact)],
    );

    wait_for_status(&db, &job.id, JobStatus::Success).await;
    let stored = db.get_evidence("C1", "E2").await.unwrap();
    assert_eq!(stored.name, "Security.evtx.jsonl");

    let follow_up = db.list_jobs("E2").await.unwrap();
    assert_eq!(follow_up.len(), 1);
    assert_eq!(follow_up[0].module_name, "Timesketch Importer");
    assert_eq!(follow_up[0].status, JobStatus::Scheduled);

    stop_worker(runtime, handle).await;
}

#[tokio::test]
async fn stream_sends_keep_alives_and_tracks_sessions() {
    let db = seeded_db().await;
    let harness = start_server(Arc::clone(&db), None).await;

    let client = DispatcherClient::new(&harness.base_url, None, false).unwrap();
    let mut stream = client
        .open_stream(&["Hayabusa".to_string(), "Timesketch Importer".to_string()], 4)
        .await
        .unwrap();

    let heartbeat = tokio::time::timeout(WAIT, stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(heartbeat.is_keep_alive());

    let sessions = harness.dispatcher.workers().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].worker_token, WorkerToken(heartbeat.worker_token.clone()));
    assert_eq!(sessions[0].concurrency, 4);
    assert_eq!(
        sessions[0].supported_modules,
        vec!["Hayabusa".to_string(), "Timesketch Importer".to_string()]
    );

    drop(stream);
    let deadline = tokio::time::Instant::now() + WAIT;
    while !harness.dispatcher.workers().await.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "session never removed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn restart_reclaims_jobs_from_previous_instance() {
    let old = seeded_db().await;
    let job = old.enqueue(NewJob::new("C1", "E1", "Hayabusa")).await.unwrap();
    old.claim_next(&WorkerToken::generate(), &["Hayabusa".to_string()])
        .await
        .unwrap()
        .unwrap();

    let restarted = Arc::new(old.with_new_instance());
    let _harness = start_server(Arc::clone(&restarted), None).await;

    let job = restarted.get_job(&job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Scheduled);
    assert_eq!(job.server_token, restarted.instance_token().as_str());
}

#[tokio::test]
async fn shutdown_releases_claimed_jobs() {
    let db = seeded_db().await;
    let harness = start_server(Arc::clone(&db), None).await;
    let job = db.enqueue(NewJob::new("C1", "E1", "Hayabusa")).await.unwrap();

    let client = DispatcherClient::new(&harness.base_url, None, false).unwrap();
    let mut stream = client.open_stream(&["Hayabusa".to_string()], 1).await.unwrap();
    next_job(&mut stream).await;

    harness.dispatcher.shutdown();
    wait_for_status(&db, &job.id, JobStatus::Scheduled).await;

    // The stream ends once the connection task is gone.
    let ended = tokio::time::timeout(WAIT, async {
        loop {
            match stream.next().await {
                Ok(Some(d)) if d.is_keep_alive() => continue,
                other => return other,
            }
        }
    })
    .await
    .expect("stream still open after shutdown");
    assert!(!matches!(ended, Ok(Some(_))));
}

#[tokio::test]
async fn invalid_module_declaration_is_rejected() {
    let db = seeded_db().await;
    let harness = start_server(db, None).await;

    let client = DispatcherClient::new(&harness.base_url, None, false).unwrap();
    let err = client
        .open_stream(&["Hayabusa'; DROP TABLE jobs; --".to_string()], 1)
        .await
        .err()
        .expect("hostile module name accepted");
    assert!(matches!(err, Error::Http(e) if e.status() == Some(reqwest::StatusCode::BAD_REQUEST)));

    assert!(client.open_stream(&[], 1).await.is_err());
}

#[tokio::test]
async fn push_job_over_http() {
    let db = seeded_db().await;
    let harness = start_server(Arc::clone(&db), None).await;
    let http = reqwest::Client::new();

    let created = http
        .post(format!("{}/api/jobs", harness.base_url))
        .json(&PushJobRequest {
            case_id: "C1".into(),
            evidence_id: "E1".into(),
            module_name: "Hayabusa".into(),
        })
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), reqwest::StatusCode::CREATED);
    let job: evidence_queue::model::Job = created.json().await.unwrap();
    assert_eq!(job.status, JobStatus::Scheduled);

    let fetched: evidence_queue::model::Job = http
        .get(format!("{}/api/jobs/{}", harness.base_url, job.id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched.id, job.id);

    let unknown_module = http
        .post(format!("{}/api/jobs", harness.base_url))
        .json(&PushJobRequest {
            case_id: "C1".into(),
            evidence_id: "E1".into(),
            module_name: "Volatility".into(),
        })
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_module.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = unknown_module.json().await.unwrap();
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let unknown_evidence = http
        .post(format!("{}/api/jobs", harness.base_url))
        .json(&PushJobRequest {
            case_id: "C1".into(),
            evidence_id: "E404".into(),
            module_name: "Hayabusa".into(),
        })
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_evidence.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn ack_with_non_terminal_status_is_rejected() {
    let db = seeded_db().await;
    let harness = start_server(Arc::clone(&db), None).await;
    let job = db.enqueue(NewJob::new("C1", "E1", "Hayabusa")).await.unwrap();

    let response = reqwest::Client::new()
        .post(format!("{}/internal/jobs/ack", harness.base_url))
        .json(&serde_json::json!({ "id": job.id, "status": "Running", "error": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(db.get_job(&job.id).await.unwrap().status, JobStatus::Scheduled);
}

#[tokio::test]
async fn malformed_requests_get_json_errors() {
    let db = seeded_db().await;
    let harness = start_server(db, None).await;
    let http = reqwest::Client::new();

    let unknown_status = http
        .post(format!("{}/internal/jobs/ack", harness.base_url))
        .json(&serde_json::json!({ "id": "j1", "status": "Done" }))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_status.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
    let body: serde_json::Value = unknown_status.json().await.unwrap();
    assert_eq!(body["code"], "INVALID_REQUEST_BODY");
    assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));

    let missing_case = http
        .post(format!("{}/api/jobs", harness.base_url))
        .json(&serde_json::json!({ "evidenceId": "E1", "moduleName": "Hayabusa" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing_case.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
    let body: serde_json::Value = missing_case.json().await.unwrap();
    assert_eq!(body["code"], "INVALID_REQUEST_BODY");

    let bad_concurrency = http
        .get(format!("{}/internal/jobs?modules=Hayabusa&workers=many", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_concurrency.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = bad_concurrency.json().await.unwrap();
    assert_eq!(body["code"], "INVALID_QUERY");
}

#[tokio::test]
async fn registering_evidence_cannot_steal_another_cases_id() {
    let db = seeded_db().await;
    db.save_case(&Case {
        id: "C2".into(),
        name: "Case Two".into(),
        sketch_id: 0,
    })
    .await
    .unwrap();
    let harness = start_server(Arc::clone(&db), None).await;

    let mut stolen = evidence("E1", "Security.evtx");
    stolen.case_id = "C2".into();
    let response = reqwest::Client::new()
        .post(format!("{}/api/cases/C2/evidences", harness.base_url))
        .json(&stolen)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "VALIDATION_ERROR");

    assert!(db.get_evidence("C1", "E1").await.is_ok());
    assert!(matches!(
        db.get_evidence("C2", "E1").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn api_key_is_enforced_when_configured() {
    let db = seeded_db().await;
    let harness = start_server(db, Some("letmein")).await;
    let http = reqwest::Client::new();

    let health = http
        .get(format!("{}/health", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);

    let anonymous = http
        .get(format!("{}/internal/workers", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), reqwest::StatusCode::UNAUTHORIZED);

    let wrong = http
        .get(format!("{}/internal/workers", harness.base_url))
        .header(server::API_KEY_HEADER, "guess")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), reqwest::StatusCode::UNAUTHORIZED);

    let authorized = http
        .get(format!("{}/internal/workers", harness.base_url))
        .header(server::API_KEY_HEADER, "letmein")
        .send()
        .await
        .unwrap();
    assert_eq!(authorized.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn runnable_modules_report_latest_outcome() {
    let db = seeded_db().await;
    let harness = start_server(Arc::clone(&db), None).await;

    let job = db.enqueue(NewJob::new("C1", "E1", "Hayabusa")).await.unwrap();
    db.claim_next(&WorkerToken::generate(), &["Hayabusa".to_string()])
        .await
        .unwrap();
    db.ack(&job.id, JobStatus::Failed, "tool exited 2").await.unwrap();

    let runs = harness
        .dispatcher
        .runnable_modules("C1", "E1")
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].name, "Hayabusa");
    assert_eq!(runs[0].status, Some(JobStatus::Failed));
    assert_eq!(runs[0].error, "tool exited 2");

    let jobs = harness.dispatcher.evidence_jobs("C1", "E1").await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(matches!(
        harness.dispatcher.runnable_modules("C1", "E404").await,
        Err(Error::NotFound(_))
    ));
}
