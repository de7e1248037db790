// src/context/mod.rs
// Background context maintenance

mod updater;
mod window;

pub use updater::{
    CONVERSATION_SUMMARY_UPDATE_THRESHOLD, ContextUpdater, MIN_MESSAGES_FOR_TITLE_GENERATION,
    PROJECT_SUMMARY_UPDATE_THRESHOLD, SUMMARY_UPDATE_DEBOUNCE_MS,
};
pub use window::{RECENT_WINDOW_SIZE, build_context_window, summary_is_meaningful};
