pub mod cohort;
pub mod grading;
pub mod message;
pub mod provider;

pub use cohort::{Cohort, Student, StudentInfo, TaskHistory};
pub use grading::{GradeRecord, GradeStatus, GradingResult, SubScore};
pub use message::{ChatMessage, ContentPart, MessageContent, Role};
pub use provider::{Capability, ModelConfig, ProtocolKind, ProviderConfig};
