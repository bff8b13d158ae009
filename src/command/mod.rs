//! Command Engine
//!
//! Natural-language preview and idempotent confirm for send / buy / sell /
//! reserve actions.

pub mod db;
pub mod engine;
pub mod intent;
pub mod parser;
pub mod types;

pub use db::PgIntentStore;
pub use engine::{COMMAND_SOURCE, CommandEngine};
pub use intent::{BeginOutcome, CommandIntent, IntentState, IntentStore, MemoryIntentStore};
pub use parser::{parse, parse_amount};
pub use types::{
    CommandAction, CommandFailure, CommandPreview, CommandResult, CommandStatus, ConfirmRequest,
    PreviewRequest,
};
