pub mod ai_dispatch;
pub mod provider_files;
pub mod routing;
pub mod score_document;

pub use ai_dispatch::{AiDispatcher, LimitSource};
pub use provider_files::FileUploader;
pub use routing::CapabilityRouter;
pub use score_document::ScoreDocumentWriter;
