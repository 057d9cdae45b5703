use leadsync_adapters::SessionHandle;
use leadsync_core::Cursor;
use leadsync_storage::AuthorizationError;
use leadsync_sync::{IngestConfig, IngestError, Ingestor};
use serde_json::{json, Value};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn config(server: &MockServer) -> IngestConfig {
    IngestConfig {
        access_token: Some("graph-token".to_string()),
        target_id: Some("ad-9".to_string()),
        destination_key: Some("sheet-1".to_string()),
        credentials_json: Some(r#"{"access_token":"sheets-token"}"#.to_string()),
        graph_base_url: server.uri(),
        sheets_base_url: server.uri(),
        page_delay_ms: 0,
        batch_delay_secs: 0,
        ..IngestConfig::default()
    }
}

async fn mount_sheet(server: &MockServer, row_count: u64) {
    Mock::given(method("GET"))
        .and(path("/v4/spreadsheets/sheet-1"))
        .and(header("authorization", "Bearer sheets-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sheets": [{"properties": {"title": "resiliation", "gridProperties": {"rowCount": row_count}}}]
        })))
        .mount(server)
        .await;
}

fn lead(id: &str, email: &str) -> Value {
    json!({
        "id": id,
        "created_time": "2024-06-01T08:00:00+0000",
        "field_data": [{"name": "Email Address", "values": [email]}]
    })
}

fn next_page(server: &MockServer) -> String {
    format!(
        "{}/v17.0/ad-9/leads/more?access_token=graph-token&after=c1",
        server.uri()
    )
}

fn appended_values(request: &Request) -> Value {
    let body: Value = serde_json::from_slice(&request.body).unwrap();
    body["values"].clone()
}

#[tokio::test]
async fn ingest_follows_pages_and_appends_header_then_rows() {
    let server = MockServer::start().await;
    mount_sheet(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/v17.0/ad-9/leads"))
        .and(query_param("access_token", "graph-token"))
        .and(query_param("limit", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [lead("1", "a@x.io")],
            "paging": {"next": next_page(&server)}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v17.0/ad-9/leads/more"))
        .and(query_param("after", "c1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [lead("2", "b@x.io"), lead("3", "c@x.io")]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v4/spreadsheets/sheet-1/values/resiliation:append"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&server)
        .await;

    let cfg = config(&server);
    let ingestor = Ingestor::from_config(cfg).unwrap();
    let summary = ingestor
        .ingest(&SessionHandle::new("graph-token"), "ad-9", "sheet-1", 10)
        .await
        .unwrap();

    assert_eq!(summary.pages_fetched, 2);
    assert_eq!(summary.records_fetched, 3);
    assert_eq!(summary.rows_written, 3);
    assert!(summary.header_written);
    assert_eq!(summary.columns, vec!["created_time", "id", "email_address"]);

    let appends: Vec<Value> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.method.as_str() == "POST")
        .map(appended_values)
        .collect();
    assert_eq!(appends[0], json!([["created_time", "id", "email_address"]]));
    assert_eq!(
        appends[1],
        json!([
            ["2024-06-01T08:00:00+0000", "1", "a@x.io"],
            ["2024-06-01T08:00:00+0000", "2", "b@x.io"],
            ["2024-06-01T08:00:00+0000", "3", "c@x.io"]
        ])
    );
}

#[tokio::test]
async fn ingest_into_populated_sheet_skips_header_and_truncates() {
    let server = MockServer::start().await;
    mount_sheet(&server, 40).await;
    Mock::given(method("GET"))
        .and(path("/v17.0/ad-9/leads"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [lead("1", "a@x.io"), lead("2", "b@x.io"), lead("3", "c@x.io")],
            "paging": {"next": format!("{}/v17.0/ad-9/leads/more", server.uri())}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v4/spreadsheets/sheet-1/values/resiliation:append"))
        .and(body_json(json!({
            "majorDimension": "ROWS",
            "values": [
                ["2024-06-01T08:00:00+0000", "1", "a@x.io"],
                ["2024-06-01T08:00:00+0000", "2", "b@x.io"]
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let ingestor = Ingestor::from_config(config(&server)).unwrap();
    let summary = ingestor.ingest_configured(2, None).await.unwrap();

    assert_eq!(summary.rows_written, 2);
    assert!(!summary.header_written);
    assert_eq!(summary.pages_fetched, 1);
}

#[tokio::test]
async fn rejected_credentials_fail_before_fetching() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v4/spreadsheets/sheet-1"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v17.0/ad-9/leads"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .expect(0)
        .mount(&server)
        .await;

    let ingestor = Ingestor::from_config(config(&server)).unwrap();
    let err = ingestor
        .ingest(&SessionHandle::new("graph-token"), "ad-9", "sheet-1", 5)
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Authorization(_)));
}

#[tokio::test]
async fn source_error_surfaces_without_leaking_token() {
    let server = MockServer::start().await;
    mount_sheet(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/v17.0/ad-9/leads"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "Invalid OAuth access token", "code": 190}
        })))
        .mount(&server)
        .await;

    let ingestor = Ingestor::from_config(config(&server)).unwrap();
    let err = ingestor
        .ingest(&SessionHandle::new("graph-token"), "ad-9", "sheet-1", 5)
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Fetch { rows_written: 0, .. }));
    assert!(!err.to_string().contains("graph-token"));
}

#[test]
fn missing_settings_are_rejected_up_front() {
    let err = match Ingestor::from_config(IngestConfig::default()) {
        Ok(_) => panic!("expected missing settings to be rejected"),
        Err(err) => err,
    };
    assert!(err.to_string().contains("FACEBOOK_ACCESS_TOKEN"));
}

#[tokio::test]
async fn reported_cursor_resumes_a_later_run_without_exposing_token() {
    let server = MockServer::start().await;
    mount_sheet(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/v17.0/ad-9/leads"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [lead("1", "a@x.io")],
            "paging": {"next": next_page(&server)}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v17.0/ad-9/leads/more"))
        .and(query_param("access_token", "graph-token"))
        .and(query_param("after", "c1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [lead("2", "b@x.io")]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v4/spreadsheets/sheet-1/values/resiliation:append"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let ingestor = Ingestor::from_config(config(&server)).unwrap();
    let first = ingestor.ingest_configured(1, None).await.unwrap();
    let reported = first.resume_cursor.as_ref().unwrap().resumable();
    assert!(!reported.contains("graph-token"));
    assert!(reported.contains("after=c1"));
    let serialized = serde_json::to_string(&first).unwrap();
    assert!(!serialized.contains("graph-token"));

    let second = ingestor
        .ingest_configured(5, Some(Cursor::new(reported)))
        .await
        .unwrap();

    assert_eq!(second.records_fetched, 1);
    assert_eq!(second.rows_written, 1);
    assert!(second.resume_cursor.is_none());
}

#[test]
fn unusable_credentials_are_an_authorization_error() {
    let config = IngestConfig {
        credentials_json: Some("not json".to_string()),
        ..config_without_server()
    };
    let err = match Ingestor::from_config(config) {
        Ok(_) => panic!("expected credentials to be rejected"),
        Err(err) => err,
    };
    assert!(matches!(
        err,
        IngestError::Authorization(AuthorizationError::InvalidCredentials(_))
    ));
}

fn config_without_server() -> IngestConfig {
    IngestConfig {
        access_token: Some("graph-token".to_string()),
        target_id: Some("ad-9".to_string()),
        destination_key: Some("sheet-1".to_string()),
        ..IngestConfig::default()
    }
}
