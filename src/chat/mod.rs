// src/chat/mod.rs
// Conversation runtime: assembly, dispatch, service, titling

pub mod assembler;
mod service;
pub mod stream;
mod title;

pub use assembler::{AssembleRequest, AssemblerEvent, BuildProgress, build_prompt};
pub use service::{ChatOptions, ConversationService};
pub use stream::{ChatOutcome, ChatStreamEvent, TurnTarget, dispatch};
pub use title::{MAX_TITLE_CHARS, clean_title, generate_title};
