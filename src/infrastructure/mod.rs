//! 基础设施层：持有稀缺资源（配置库连接、厂商并发许可），只暴露能力

pub mod admission;
pub mod archive;
pub mod database;

pub use admission::{AdmissionPermit, AdmissionSnapshot, ProviderAdmission};
pub use archive::{unpack_submission, ArchiveKind};
pub use database::Database;
