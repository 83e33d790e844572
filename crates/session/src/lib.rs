//! Session store implementations for Clinscribe.

pub mod file_store;
pub mod in_memory;

pub use file_store::FileSessionStore;
pub use in_memory::InMemorySessionStore;

use clinscribe_config::SessionConfig;
use clinscribe_core::session::SessionStore;
use std::sync::Arc;

/// Build the store selected by the `[session]` config section.
pub fn from_config(config: &SessionConfig) -> Arc<dyn SessionStore> {
    match config.backend.as_str() {
        "file" => Arc::new(FileSessionStore::new(config.resolved_path())),
        _ => Arc::new(InMemorySessionStore::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_selection() {
        let mut config = SessionConfig::default();
        assert_eq!(from_config(&config).name(), "in_memory");
        config.backend = "file".into();
        config.path = Some(std::env::temp_dir().join("clinscribe-sessions"));
        assert_eq!(from_config(&config).name(), "file");
    }
}
