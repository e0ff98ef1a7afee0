pub mod state;

pub use state::{
    ChatSettings, DEFAULT_BASE_URL, DEFAULT_BLUEPRINT_ID, DEFAULT_HISTORY_LIMIT,
    DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_SYSTEM_PROMPT, DEFAULT_WELCOME_GREETING, SettingsError,
    SettingsStore,
};
