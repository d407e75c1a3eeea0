//! Report Access - 安全报告访问服务
//!
//! 提供以下功能：
//! 1. 邮箱验证码签发与校验（单次使用、20 分钟有效、校验失败自动重发）
//! 2. 健康报告生成，AES-256-GCM 加密后持久化，并签发解密令牌
//! 3. 报告解密：解密验证码或解密令牌两条授权路径，统一经过解密网关
//! 4. 多存储后端支持：内存、SQLite

pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod notifier;
pub mod otp;
pub mod report;
pub mod storage;
pub mod types;

// Re-export commonly used items
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{AccessServiceConfig, NotifierConfig, OtpConfig};
pub use crypto::{ReportCipher, ReportKeySource};
pub use error::{ACTION_NEW_OTP_SENT, AccessError, AccessResult};
pub use gateway::{
    AccessEvent, AccessPath, AccessPhase, Capability, Credential, DecryptionGateway,
    RevealedReport,
};
pub use handlers::{AccessState, create_access_state, create_router};
pub use metrics::register_metrics;
pub use notifier::{LogNotifier, Notifier, OtpDelivery, OutboxNotifier, WebhookNotifier};
pub use otp::{IssuedOtp, MismatchAction, OtpPolicy, OtpService, VerifyOutcome};
pub use report::{
    GeneratedReport, HealthAggregate, HealthDataSource, PlaintextReport, ReportGenerator,
    StaticHealthData,
};
pub use storage::{AccessStorage, OtpStore, ReportStore, StorageBackend, StorageConfig};
pub use types::{
    DataSource, DecryptWithTokenRequest, DecryptedReportResponse, DecryptionToken,
    EncryptedReport, GenerateReportRequest, GenerateReportResponse, OperationResponse,
    OtpPurpose, OtpRecord, RequestDecryptOtpRequest, RequestOtpRequest, StoredReport,
    VerifyDecryptOtpRequest, VerifyEmailOtpRequest,
};
