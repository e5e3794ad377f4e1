//! End-to-end runs over loopback TCP: the fuzzing server against the echo
//! testee client, and the fuzzing client against the echo testee server.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use sockudo_wstest::logging::init_test_tracing;
use sockudo_wstest::report::{INDEX_FILE, SUMMARY_FILE};
use sockudo_wstest::session::SessionConfig;
use sockudo_wstest::testee::{bind_testee, run_testee_server, TesteeClient};
use sockudo_wstest::{run_fuzzing_client, CaseCatalog, CaseId, FuzzingServer, OutcomeTag, Spec};

const CASES: [&str; 4] = ["1.1.1", "1.1.2", "1.2.1", "2.1"];

fn catalog() -> Arc<CaseCatalog> {
    Arc::new(CaseCatalog::standard().unwrap())
}

fn cases_json() -> String {
    serde_json::to_string(&CASES).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fuzzing_server_against_echo_client() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let spec = Spec::from_json(&format!(
        r#"{{"url": "ws://127.0.0.1:0", "outdir": {:?}, "cases": {}}}"#,
        dir.path().display().to_string(),
        cases_json()
    ))
    .unwrap();

    let server = FuzzingServer::bind(&spec, catalog()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let ctx = server.context();
    let task = tokio::spawn(server.run());

    let client = TesteeClient::new(&format!("ws://{}", addr), "EchoClient", SessionConfig::default()).unwrap();
    assert_eq!(client.case_count().await.unwrap(), CASES.len());
    for index in 1..=CASES.len() {
        client.run_case(index).await.unwrap();
    }

    for raw in CASES {
        let id: CaseId = raw.parse().unwrap();
        let result = tokio::time::timeout(Duration::from_secs(10), ctx.results.listen("EchoClient", &id))
            .await
            .expect("case result in time")
            .unwrap();
        assert_eq!(result.behavior, OutcomeTag::Ok, "{}: {}", raw, result.result);
        assert!(result.is_server);
    }

    client.update_reports(true).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("server stops after updateReports")
        .unwrap()
        .unwrap();

    let index: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join(INDEX_FILE)).unwrap()).unwrap();
    assert_eq!(index["EchoClient"]["1.1.1"]["behavior"], "OK");
    assert!(dir.path().join("echoclient_case_1_1_1.json").exists());
    assert!(dir.path().join(SUMMARY_FILE).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fuzzing_client_against_echo_server() {
    init_test_tracing();
    let (listener, addr) = bind_testee("ws://127.0.0.1:0").await.unwrap();
    let (stop, _) = broadcast::channel(1);
    let testee = tokio::spawn(run_testee_server(listener, SessionConfig::default(), stop.clone()));

    let dir = tempfile::tempdir().unwrap();
    let spec = Spec::from_json(&format!(
        r#"{{"outdir": {:?}, "cases": {},
            "servers": [{{"agent": "EchoServer", "url": "ws://{}"}}]}}"#,
        dir.path().display().to_string(),
        cases_json(),
        addr
    ))
    .unwrap();

    let run = run_fuzzing_client(spec, catalog()).await.unwrap();
    let results = &run.results["EchoServer"];
    assert_eq!(results.len(), CASES.len());
    for result in results {
        assert_eq!(result.behavior, OutcomeTag::Ok, "{}: {}", result.id, result.result);
        assert!(!result.is_server);
        assert!(result.remote_agent.is_some());
    }
    assert!(run.reports.index.exists());

    stop.send(()).unwrap();
    testee.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_out_of_range_case_rejected() {
    let spec = Spec::from_json(r#"{"url": "ws://127.0.0.1:0", "cases": ["1.1.1"]}"#).unwrap();
    let server = FuzzingServer::bind(&spec, catalog()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let stop = server.shutdown_handle();
    let task = tokio::spawn(server.run());

    let client = TesteeClient::new(&format!("ws://{}", addr), "A", SessionConfig::default()).unwrap();
    assert!(client.run_case(2).await.is_err());

    stop.send(()).unwrap();
    task.await.unwrap().unwrap();
}
