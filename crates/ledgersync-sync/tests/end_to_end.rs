use std::collections::HashMap;
use std::path::PathBuf;

use ledgersync_core::EntityKind;
use ledgersync_sync::{PassStatus, SyncConfig, SyncPipeline};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(axonaut: &MockServer, notion: &MockServer, extra: &[(&str, &str)]) -> SyncConfig {
    let mut env: HashMap<String, String> = [
        ("AXONAUT_API_KEY", "axo-key"),
        ("NOTION_API_KEY", "notion-key"),
        ("NOTION_INVOICES_DB_ID", "db-inv"),
        ("NOTION_PAYMENTS_DB_ID", "db-pay"),
        ("HTTP_TIMEOUT_SECS", "5"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    env.insert("AXONAUT_API_BASE".into(), axonaut.uri());
    env.insert("NOTION_API_BASE".into(), format!("{}/v1", notion.uri()));
    for (k, v) in extra {
        env.insert(k.to_string(), v.to_string());
    }
    SyncConfig::from_lookup(|key| env.get(key).cloned()).expect("config")
}

async fn mount_axonaut(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/invoices"))
        .and(header("authorization", "Bearer axo-key"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 42, "number": "INV-001", "amount_ttc": 1200, "amount_ht": 1000,
              "date": "2025-01-10", "status": "paid" },
            { "id": 43, "number": "INV-002", "amount_ttc": "540.00", "date": "2025-01-12T09:30:00+01:00" },
            { "id": 44, "number": "INV-003", "amount_ttc": 80, "status": "late, reminded" }
        ])))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/payments"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 901, "reference": "PAY-2025-001", "invoice_id": 42, "amount": 1200,
              "date": "2025-01-28", "nature": "Virement" }
        ])))
        .mount(server)
        .await;
}

async fn mount_invoice_index(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/databases/db-inv/query"))
        .and(header("Notion-Version", "2022-06-28"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{
                "object": "page",
                "id": "page-inv-2",
                "properties": {
                    "Number": { "type": "title", "title": [{ "plain_text": "INV-002" }] }
                }
            }],
            "has_more": false,
            "next_cursor": null
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn run_isolates_record_and_pass_failures() {
    let axonaut = MockServer::start().await;
    let notion = MockServer::start().await;
    mount_axonaut(&axonaut).await;
    mount_invoice_index(&notion).await;

    Mock::given(method("POST"))
        .and(path("/v1/databases/db-pay/query"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&notion)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/pages"))
        .and(body_partial_json(json!({ "parent": { "database_id": "db-inv" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "new-page" })))
        .expect(2)
        .mount(&notion)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/v1/pages/page-inv-2"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .expect(1)
        .mount(&notion)
        .await;

    let reports = tempfile::tempdir().expect("tempdir");
    let reports_dir = reports.path().to_string_lossy().to_string();
    let config = config_for(&axonaut, &notion, &[("REPORTS_DIR", reports_dir.as_str())]);
    let pipeline = SyncPipeline::new(config).expect("pipeline");

    let report = pipeline.run_once().await;

    let invoices = report.pass(EntityKind::Invoices).expect("invoice pass");
    assert_eq!(invoices.status, PassStatus::Completed);
    assert_eq!(
        (invoices.fetched, invoices.created, invoices.updated, invoices.failed),
        (3, 2, 0, 1)
    );

    let payments = report.pass(EntityKind::Payments).expect("payment pass");
    assert_eq!(payments.status, PassStatus::Aborted);
    assert_eq!(payments.fetched, 1);
    assert!(payments.error.as_deref().unwrap_or_default().contains("502"));
    assert!(!report.all_passes_aborted());

    let written = pipeline.persist_report(&report).await.expect("report path");
    let summary: serde_json::Value =
        serde_json::from_slice(&std::fs::read(written).expect("read report")).expect("json");
    assert_eq!(summary["run_id"], report.run_id.to_string());
    assert_eq!(summary["passes"][1]["status"], "aborted");
}

#[tokio::test]
async fn dry_run_reads_but_never_writes() {
    let axonaut = MockServer::start().await;
    let notion = MockServer::start().await;
    mount_axonaut(&axonaut).await;
    mount_invoice_index(&notion).await;

    Mock::given(method("POST"))
        .and(path("/v1/databases/db-pay/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [], "has_more": false, "next_cursor": null
        })))
        .expect(1)
        .mount(&notion)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/pages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "never" })))
        .expect(0)
        .mount(&notion)
        .await;

    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&notion)
        .await;

    let config = config_for(&axonaut, &notion, &[("DRY_RUN", "yes")]);
    let pipeline = SyncPipeline::new(config).expect("pipeline");
    let report = pipeline.run_once().await;

    assert!(report.dry_run);
    let invoices = report.pass(EntityKind::Invoices).expect("invoice pass");
    assert_eq!((invoices.created, invoices.updated, invoices.failed), (2, 1, 0));
    let payments = report.pass(EntityKind::Payments).expect("payment pass");
    assert_eq!((payments.created, payments.updated), (1, 0));
}

#[tokio::test]
async fn fixture_source_runs_offline_against_destination() {
    let axonaut = MockServer::start().await;
    let notion = MockServer::start().await;
    mount_invoice_index(&notion).await;

    Mock::given(method("POST"))
        .and(path("/v1/databases/db-pay/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [], "has_more": false, "next_cursor": null
        })))
        .mount(&notion)
        .await;

    let fixtures = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/axonaut")
        .to_string_lossy()
        .to_string();
    let config = config_for(
        &axonaut,
        &notion,
        &[("AXONAUT_FIXTURES_DIR", fixtures.as_str()), ("DRY_RUN", "1")],
    );
    let pipeline = SyncPipeline::new(config).expect("pipeline");
    let report = pipeline.run_once().await;

    let invoices = report.pass(EntityKind::Invoices).expect("invoice pass");
    assert_eq!((invoices.fetched, invoices.created, invoices.updated), (3, 2, 1));
    let payments = report.pass(EntityKind::Payments).expect("payment pass");
    assert_eq!((payments.fetched, payments.created), (2, 2));
    assert!(axonaut.received_requests().await.unwrap_or_default().is_empty());
}
