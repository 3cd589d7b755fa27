mod commands;

pub use commands::{handle_ask, handle_kbs, handle_models, handle_providers, AskArgs};
