use base64::Engine as _;
use chrono::Utc;
use report_access::report::{DietSummary, FitnessSummary, MentalHealthSummary};
use report_access::{
    ACTION_NEW_OTP_SENT, AccessServiceConfig, AccessState, AccessStorage, GenerateReportResponse,
    HealthAggregate, ManualClock, OtpPurpose, OutboxNotifier, ReportCipher, StaticHealthData,
    create_router,
};
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;

struct TestServer {
    base_url: String,
    outbox: OutboxNotifier,
    clock: ManualClock,
    storage: AccessStorage,
    _temp_dir: TempDir,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn latest_code(&self, identifier: &str, purpose: OtpPurpose) -> String {
        self.outbox
            .latest_code(identifier, purpose)
            .expect("a code should have been delivered")
    }
}

fn sample_aggregate() -> HealthAggregate {
    HealthAggregate {
        period_days: 30,
        diet: DietSummary {
            meals_logged: 90,
            avg_daily_calories: 1750.0,
            calorie_target: 2200.0,
            avg_daily_protein_g: 70.0,
        },
        fitness: FitnessSummary {
            workouts: 12,
            weekly_active_minutes: 210,
            avg_daily_steps: 9100,
        },
        mental_health: MentalHealthSummary {
            check_ins: 28,
            avg_mood: 4.2,
            avg_stress: 5.0,
            avg_sleep_hours: 7.4,
        },
    }
}

async fn start_test_server(storage: Option<AccessStorage>) -> TestServer {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let storage = storage.unwrap_or_else(AccessStorage::memory);
    let outbox = OutboxNotifier::new();
    let clock = ManualClock::new(Utc::now());

    let health_data = StaticHealthData::new();
    health_data.insert("user_42", sample_aggregate());

    let cipher = ReportCipher::from_key(&ReportCipher::generate_key()).expect("valid key");
    let state = AccessState::new(
        &AccessServiceConfig::default(),
        storage.clone(),
        Arc::new(cipher),
        Arc::new(health_data),
        Arc::new(outbox.clone()),
        Arc::new(clock.clone()),
    );
    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Failed to read bound addr");
    let base_url = format!("http://{addr}");

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("Test server exited unexpectedly");
    });

    TestServer {
        base_url,
        outbox,
        clock,
        storage,
        _temp_dir: temp_dir,
        handle,
    }
}

async fn post(client: &reqwest::Client, url: String, body: Value) -> (StatusCode, Value) {
    let resp = client
        .post(url)
        .json(&body)
        .send()
        .await
        .expect("request failed");
    let status = resp.status();
    let body = resp.json().await.expect("response body should be json");
    (status, body)
}

async fn generate_report(
    client: &reqwest::Client,
    server: &TestServer,
    user_id: &str,
) -> GenerateReportResponse {
    let resp = client
        .post(server.url("/generate-report"))
        .json(&json!({ "user_id": user_id }))
        .send()
        .await
        .expect("generate request failed");
    assert_eq!(resp.status(), StatusCode::OK);
    resp.json().await.expect("generate response should parse")
}

fn wrong_code(code: &str) -> String {
    let value: u32 = code.parse().expect("numeric code");
    format!("{:06}", (value + 1) % 1_000_000)
}

#[tokio::test]
async fn test_email_mismatch_sends_new_code_then_succeeds() {
    let server = start_test_server(None).await;
    let client = reqwest::Client::new();

    let (status, body) = post(
        &client,
        server.url("/request-email-otp"),
        json!({ "identifier": "alice@example.com" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let first = server.latest_code("alice@example.com", OtpPurpose::EmailVerify);
    let (status, body) = post(
        &client,
        server.url("/verify-email-otp"),
        json!({ "identifier": "alice@example.com", "otp_code": wrong_code(&first) }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["action"], ACTION_NEW_OTP_SENT);
    assert_eq!(server.outbox.sent().len(), 2);

    let second = server.latest_code("alice@example.com", OtpPurpose::EmailVerify);
    let (status, body) = post(
        &client,
        server.url("/verify-email-otp"),
        json!({ "identifier": "alice@example.com", "otp_code": second }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    // 同一个验证码不能使用两次
    let (status, body) = post(
        &client,
        server.url("/verify-email-otp"),
        json!({ "identifier": "alice@example.com", "otp_code": second }),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_superseded_code_no_longer_verifies() {
    let server = start_test_server(None).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let (status, _) = post(
            &client,
            server.url("/request-email-otp"),
            json!({ "identifier": "bob@example.com" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let sent = server.outbox.sent();
    let (first, second) = (sent[0].code.clone(), sent[1].code.clone());
    if first != second {
        let (status, body) = post(
            &client,
            server.url("/verify-email-otp"),
            json!({ "identifier": "bob@example.com", "otp_code": first }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["action"], ACTION_NEW_OTP_SENT);
    }
}

#[tokio::test]
async fn test_token_decrypt_is_repeatable() {
    let server = start_test_server(None).await;
    let client = reqwest::Client::new();

    let generated = generate_report(&client, &server, "user_42").await;
    assert_eq!(generated.file_size, {
        base64::engine::general_purpose::STANDARD
            .decode(generated.ciphertext.as_bytes())
            .expect("ciphertext should be valid base64")
            .len()
    });

    let request = json!({
        "report_id": generated.report_id,
        "decryption_token": generated.decryption_token,
    });
    for _ in 0..2 {
        let (status, body) =
            post(&client, server.url("/decrypt-with-token"), request.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(
            body["decrypted_report"]["data_source"],
            "REAL_DATABASE_COLLECTIONS"
        );
        assert_eq!(body["decrypted_report"]["user_id"], "user_42");
    }

    let (status, body) = post(
        &client,
        server.url("/decrypt-with-token"),
        json!({ "report_id": generated.report_id, "decryption_token": "00".repeat(32) }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_both_paths_return_identical_report() {
    let server = start_test_server(None).await;
    let client = reqwest::Client::new();
    let generated = generate_report(&client, &server, "user_42").await;

    let (status, via_token) = post(
        &client,
        server.url("/decrypt-with-token"),
        json!({
            "report_id": generated.report_id,
            "decryption_token": generated.decryption_token,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = post(
        &client,
        server.url("/request-decrypt-otp"),
        json!({ "identifier": "alice@example.com", "report_id": generated.report_id }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let code = server.latest_code("alice@example.com", OtpPurpose::ReportDecrypt);

    let (status, via_otp) = post(
        &client,
        server.url("/verify-decrypt-otp"),
        json!({
            "identifier": "alice@example.com",
            "otp_code": code,
            "report_id": generated.report_id,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(via_otp["decrypted_report"], via_token["decrypted_report"]);

    let recommendations = via_otp["decrypted_report"]["recommendations"]
        .as_array()
        .expect("recommendations array");
    assert!(!recommendations.is_empty());
}

#[tokio::test]
async fn test_decrypt_code_rejected_after_21_minutes() {
    let server = start_test_server(None).await;
    let client = reqwest::Client::new();
    let generated = generate_report(&client, &server, "user_42").await;

    let (status, _) = post(
        &client,
        server.url("/request-decrypt-otp"),
        json!({ "identifier": "carol@example.com", "report_id": generated.report_id }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let code = server.latest_code("carol@example.com", OtpPurpose::ReportDecrypt);

    server.clock.advance(chrono::Duration::minutes(21));

    let (status, body) = post(
        &client,
        server.url("/verify-decrypt-otp"),
        json!({
            "identifier": "carol@example.com",
            "otp_code": code,
            "report_id": generated.report_id,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["success"], false);
    assert!(body.get("decrypted_report").is_none());
}

#[tokio::test]
async fn test_unknown_user_gets_demo_report() {
    let server = start_test_server(None).await;
    let client = reqwest::Client::new();
    let generated = generate_report(&client, &server, "user_without_data").await;

    let (status, body) = post(
        &client,
        server.url("/decrypt-with-token"),
        json!({
            "report_id": generated.report_id,
            "decryption_token": generated.decryption_token,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["decrypted_report"]["data_source"],
        "DEMO_DATA_USER_NOT_FOUND"
    );
}

#[tokio::test]
async fn test_malformed_code_and_unknown_report() {
    let server = start_test_server(None).await;
    let client = reqwest::Client::new();

    let (status, body) = post(
        &client,
        server.url("/verify-decrypt-otp"),
        json!({
            "identifier": "dave@example.com",
            "otp_code": "12-456",
            "report_id": "whatever",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);

    let (status, body) = post(
        &client,
        server.url("/decrypt-with-token"),
        json!({ "report_id": "missing-report", "decryption_token": "ab".repeat(32) }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(!body.to_string().contains("missing-report"));
}

#[tokio::test]
async fn test_notifier_failure_rolls_back_issuance() {
    let server = start_test_server(None).await;
    let client = reqwest::Client::new();
    server.outbox.fail_next(1);

    let (status, body) = post(
        &client,
        server.url("/request-email-otp"),
        json!({ "identifier": "erin@example.com" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["success"], false);

    let (status, _) = post(
        &client,
        server.url("/verify-email-otp"),
        json!({ "identifier": "erin@example.com", "otp_code": "123456" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sqlite_backend_full_flow() {
    let db_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let storage = AccessStorage::from_config(&Default::default(), db_dir.path())
        .await
        .expect("sqlite storage");
    let server = start_test_server(Some(storage)).await;
    let client = reqwest::Client::new();

    let generated = generate_report(&client, &server, "user_42").await;

    let (status, _) = post(
        &client,
        server.url("/request-decrypt-otp"),
        json!({ "identifier": "frank@example.com", "report_id": generated.report_id }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let code = server.latest_code("frank@example.com", OtpPurpose::ReportDecrypt);

    let (status, body) = post(
        &client,
        server.url("/verify-decrypt-otp"),
        json!({
            "identifier": "frank@example.com",
            "otp_code": code,
            "report_id": generated.report_id,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decrypted_report"]["report_id"], generated.report_id);

    let health: Value = client
        .get(server.url("/health"))
        .send()
        .await
        .expect("health request failed")
        .json()
        .await
        .expect("health body should be json");
    assert_eq!(health["backend"], server.storage.backend_name());
    assert_eq!(health["report_count"], 1);
}
