//! 报告访问服务 HTTP 处理器

use crate::{
    clock::{SharedClock, SystemClock},
    config::{AccessServiceConfig, NotifierConfig},
    crypto::ReportCipher,
    error::{AccessError, AccessResult},
    gateway::{DecryptionGateway, RevealedReport},
    metrics::{ERRORS_TOTAL, RequestTimer, export_metrics},
    notifier::{LogNotifier, Notifier, WebhookNotifier},
    otp::OtpService,
    report::{HealthDataSource, ReportGenerator, StaticHealthData},
    storage::{AccessStorage, OtpStore, ReportStore},
    types::{
        DecryptWithTokenRequest, DecryptedReportResponse, GenerateReportRequest,
        GenerateReportResponse, OperationResponse, OtpPurpose, RequestDecryptOtpRequest,
        RequestOtpRequest, VerifyDecryptOtpRequest, VerifyEmailOtpRequest,
    },
};
use axum::{
    Router,
    extract::{Json, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::prelude::*;
use std::path::Path;
use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};
use tracing::{debug, info, warn};

/// 惰性清理触发条件
const CLEANUP_CHECK_INTERVAL: u32 = 100; // 每 100 次请求检查一次

/// 报告访问服务状态
#[derive(Clone)]
pub struct AccessState {
    pub otp: OtpService,
    pub generator: ReportGenerator,
    pub gateway: DecryptionGateway,
    pub storage: AccessStorage,
    cipher: Arc<ReportCipher>,
    clock: SharedClock,
    /// 请求计数器（用于惰性清理触发）
    request_counter: Arc<AtomicU32>,
}

impl AccessState {
    pub fn new(
        config: &AccessServiceConfig,
        storage: AccessStorage,
        cipher: Arc<ReportCipher>,
        source: Arc<dyn HealthDataSource>,
        notifier: Arc<dyn Notifier>,
        clock: SharedClock,
    ) -> Self {
        let otp = OtpService::new(
            Arc::new(storage.clone()),
            notifier,
            config.otp.to_policy(),
            clock.clone(),
        );
        let generator = ReportGenerator::new(
            source,
            cipher.clone(),
            Arc::new(storage.clone()),
            clock.clone(),
            config.report_retention(),
        );
        let gateway = DecryptionGateway::new(
            otp.clone(),
            cipher.clone(),
            Arc::new(storage.clone()),
            clock.clone(),
        );

        Self {
            otp,
            generator,
            gateway,
            storage,
            cipher,
            clock,
            request_counter: Arc::new(AtomicU32::new(0)),
        }
    }

    /// 惰性清理：每 CLEANUP_CHECK_INTERVAL 次请求在后台清理一次过期记录
    fn maybe_cleanup_expired(&self) {
        let count = self.request_counter.fetch_add(1, Ordering::Relaxed);
        if count % CLEANUP_CHECK_INTERVAL != 0 {
            return;
        }

        // 在后台异步清理，不阻塞当前请求
        let storage = self.storage.clone();
        let now = self.clock.now();
        tokio::spawn(async move {
            match storage.cleanup_expired_otps(now).await {
                Ok(cleaned) if cleaned > 0 => {
                    info!("Lazy cleanup: removed {} expired or used codes", cleaned)
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to cleanup expired codes: {}", e),
            }

            match storage.cleanup_expired_reports(now).await {
                Ok(cleaned) if cleaned > 0 => {
                    info!("Lazy cleanup: removed {} reports past retention", cleaned)
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to cleanup expired reports: {}", e),
            }
        });
    }
}

/// 从服务配置创建 AccessState
pub async fn create_access_state(
    config: &AccessServiceConfig,
    sqlite_path: &Path,
) -> AccessResult<AccessState> {
    info!("Initializing report access state");

    let cipher = match config.get_key_source() {
        Some(source) => ReportCipher::from_key_source(&source)?,
        None => ReportCipher::ephemeral()?,
    };

    let storage = AccessStorage::from_config(&config.storage, sqlite_path).await?;

    let source: Arc<dyn HealthDataSource> = match &config.health_data_file {
        Some(path) => Arc::new(StaticHealthData::from_file(Path::new(path))?),
        None => {
            info!("No health data file configured, every report will use demo data");
            Arc::new(StaticHealthData::new())
        }
    };

    let notifier: Arc<dyn Notifier> = match &config.notifier {
        NotifierConfig::Log => Arc::new(LogNotifier),
        NotifierConfig::Webhook { url, bearer_token } => Arc::new(WebhookNotifier::new(
            url.clone(),
            bearer_token.clone(),
            std::time::Duration::from_millis(config.otp.notify_timeout_ms),
        )?),
    };
    info!(
        "Report access using {} storage and {} notifier",
        storage.backend_name(),
        notifier.name()
    );

    Ok(AccessState::new(
        config,
        storage,
        Arc::new(cipher),
        source,
        notifier,
        Arc::new(SystemClock),
    ))
}

/// 创建报告访问服务的路由
pub fn create_router(state: AccessState) -> Router {
    Router::new()
        .route("/request-email-otp", post(request_email_otp_handler))
        .route("/verify-email-otp", post(verify_email_otp_handler))
        .route("/generate-report", post(generate_report_handler))
        .route("/request-decrypt-otp", post(request_decrypt_otp_handler))
        .route("/verify-decrypt-otp", post(verify_decrypt_otp_handler))
        .route("/decrypt-with-token", post(decrypt_with_token_handler))
        .route("/health", get(health_check_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// 记录请求指标
fn observe<T>(timer: RequestTimer, result: AccessResult<T>) -> AccessResult<T> {
    let status = match &result {
        Ok(_) => StatusCode::OK.as_u16(),
        Err(e) => {
            ERRORS_TOTAL.with_label_values(&[e.kind()]).inc();
            e.status_code().as_u16()
        }
    };
    timer.observe(status);
    result
}

/// 请求体解析失败时同样返回统一的 JSON 错误格式
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> AccessResult<T> {
    payload
        .map(|Json(request)| request)
        .map_err(|e| AccessError::Validation(e.body_text()))
}

fn decrypted_response(revealed: RevealedReport) -> AccessResult<Json<DecryptedReportResponse>> {
    Ok(Json(DecryptedReportResponse {
        success: true,
        decrypted_report: revealed.report()?,
    }))
}

async fn request_email_otp_handler(
    State(state): State<AccessState>,
    payload: Result<Json<RequestOtpRequest>, JsonRejection>,
) -> Result<Json<OperationResponse>, AccessError> {
    let timer = RequestTimer::new("/request-email-otp");
    state.maybe_cleanup_expired();

    let result = async {
        let request = body(payload)?;
        let issued = state
            .otp
            .issue(&request.identifier, OtpPurpose::EmailVerify)
            .await?;
        Ok::<_, AccessError>(Json(OperationResponse {
            success: true,
            message: "Verification code sent to your email".to_string(),
            expires_at: Some(issued.expires_at),
        }))
    }
    .await;

    observe(timer, result)
}

async fn verify_email_otp_handler(
    State(state): State<AccessState>,
    payload: Result<Json<VerifyEmailOtpRequest>, JsonRejection>,
) -> Result<Json<OperationResponse>, AccessError> {
    let timer = RequestTimer::new("/verify-email-otp");
    state.maybe_cleanup_expired();

    let result = async {
        let request = body(payload)?;
        state
            .otp
            .verify(&request.identifier, OtpPurpose::EmailVerify, &request.otp_code)
            .await?
            .into_result()?;
        Ok::<_, AccessError>(Json(OperationResponse {
            success: true,
            message: "Email verified".to_string(),
            expires_at: None,
        }))
    }
    .await;

    observe(timer, result)
}

async fn generate_report_handler(
    State(state): State<AccessState>,
    payload: Result<Json<GenerateReportRequest>, JsonRejection>,
) -> Result<Json<GenerateReportResponse>, AccessError> {
    let timer = RequestTimer::new("/generate-report");
    state.maybe_cleanup_expired();

    let result = async {
        let request = body(payload)?;
        let generated = state.generator.generate(&request.user_id).await?;
        Ok::<_, AccessError>(Json(GenerateReportResponse {
            file_size: generated.report.ciphertext.len(),
            ciphertext: BASE64_STANDARD.encode(&generated.report.ciphertext),
            report_id: generated.report.report_id,
            decryption_token: generated.token,
            created_at: generated.report.created_at,
        }))
    }
    .await;

    observe(timer, result)
}

async fn request_decrypt_otp_handler(
    State(state): State<AccessState>,
    payload: Result<Json<RequestDecryptOtpRequest>, JsonRejection>,
) -> Result<Json<OperationResponse>, AccessError> {
    let timer = RequestTimer::new("/request-decrypt-otp");
    state.maybe_cleanup_expired();

    let result = async {
        let request = body(payload)?;
        let issued = state
            .gateway
            .request_otp(&request.identifier, &request.report_id)
            .await?;
        Ok::<_, AccessError>(Json(OperationResponse {
            success: true,
            message: "Decryption code sent to your email".to_string(),
            expires_at: Some(issued.expires_at),
        }))
    }
    .await;

    observe(timer, result)
}

async fn verify_decrypt_otp_handler(
    State(state): State<AccessState>,
    payload: Result<Json<VerifyDecryptOtpRequest>, JsonRejection>,
) -> Result<Json<DecryptedReportResponse>, AccessError> {
    let timer = RequestTimer::new("/verify-decrypt-otp");
    state.maybe_cleanup_expired();

    let result = async {
        let request = body(payload)?;
        let revealed = state
            .gateway
            .decrypt_with_otp(&request.identifier, &request.otp_code, &request.report_id)
            .await?;
        decrypted_response(revealed)
    }
    .await;

    observe(timer, result)
}

async fn decrypt_with_token_handler(
    State(state): State<AccessState>,
    payload: Result<Json<DecryptWithTokenRequest>, JsonRejection>,
) -> Result<Json<DecryptedReportResponse>, AccessError> {
    let timer = RequestTimer::new("/decrypt-with-token");
    state.maybe_cleanup_expired();

    let result = async {
        let request = body(payload)?;
        let revealed = state
            .gateway
            .decrypt_with_token(&request.report_id, request.decryption_token)
            .await?;
        decrypted_response(revealed)
    }
    .await;

    observe(timer, result)
}

async fn health_check_handler(
    State(state): State<AccessState>,
) -> Result<Json<serde_json::Value>, AccessError> {
    debug!("Health check requested");

    let otp_count = state.storage.otp_count().await?;
    let report_count = state.storage.report_count().await?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": "report-access",
        "backend": state.storage.backend_name(),
        "ephemeral_key": state.cipher.is_ephemeral(),
        "otp_count": otp_count,
        "report_count": report_count,
        "timestamp": state.clock.now().timestamp()
    })))
}

async fn metrics_handler() -> Response {
    match export_metrics() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => AccessError::Internal(format!("Failed to export metrics: {e}")).into_response(),
    }
}
