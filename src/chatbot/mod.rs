//! Chatbot module - debounces customer messages and routes replies across a
//! quota-limited pool of AI credentials.

pub mod buffer;
pub mod credentials;
pub mod database;
pub mod engine;
pub mod ledger;
pub mod message;
pub mod outcome;
pub mod router;
pub mod sequencer;
pub mod telegram;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;

pub use database::Database;
pub use engine::{ChatbotConfig, ChatbotEngine, system_prompt};
pub use ledger::UsageLedger;
pub use router::{CredentialPool, PoolConfig};
pub use sequencer::{DispatchSequencer, SequencerConfig};
pub use telegram::TelegramClient;
