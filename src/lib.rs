pub mod channel;
pub mod composer;
pub mod dedup;
pub mod dispatcher;
pub mod inference;
pub mod pipeline;
pub mod sources;
pub mod summarizer;
pub mod traits;
pub mod types;

pub use channel::SmtpChannel;
pub use dedup::DedupStore;
pub use dispatcher::Dispatcher;
pub use inference::HttpInferenceClient;
pub use pipeline::Pipeline;
pub use sources::ArxivSource;
pub use summarizer::Summarizer;
pub use types::*;
