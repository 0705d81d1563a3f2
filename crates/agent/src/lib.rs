//! The reasoning controller and its supporting pieces: intent detection,
//! smart truncation, decision parsing, the proactive researcher, and document
//! summarisation.

pub mod controller;
pub mod decision;
pub mod error;
pub mod intent;
pub mod researcher;
pub mod summarize;
pub mod truncate;

pub use controller::{Agent, InterruptSource, NoInterrupt, Role, Services, Utterance};
pub use decision::Decision;
pub use error::AgentError;
pub use intent::{IntentDetector, IntentInfo, IntentSource, Strategy};
pub use researcher::{deep_research, process_research_queue};
pub use summarize::summarize_document;
pub use truncate::smart_truncate;

#[cfg(test)]
pub(crate) mod testing;
