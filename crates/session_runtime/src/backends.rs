use std::sync::Arc;

use agent_protocol::{BackendInitError, SessionBackend};
use agent_protocol_mock::{ScriptedBackend, MOCK_BACKEND_ID};

pub const DEFAULT_BACKEND_ID: &str = MOCK_BACKEND_ID;
pub const BACKEND_ENV_VAR: &str = "AGENT_SESSION_BACKEND";

pub fn backend_from_env() -> Result<Arc<dyn SessionBackend>, BackendInitError> {
    let backend_id = std::env::var(BACKEND_ENV_VAR)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    backend_for_id(backend_id.as_deref().unwrap_or(DEFAULT_BACKEND_ID))
}

pub fn backend_for_id(backend_id: &str) -> Result<Arc<dyn SessionBackend>, BackendInitError> {
    match backend_id {
        DEFAULT_BACKEND_ID => Ok(Arc::new(ScriptedBackend::default())),
        unknown => Err(BackendInitError::new(format!(
            "Unsupported backend '{unknown}'. Available backends: {DEFAULT_BACKEND_ID}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_for_id_supports_mock() {
        let backend = backend_for_id("mock").expect("mock backend should resolve");
        assert_eq!(backend.profile().backend_id, "mock");
    }

    #[test]
    fn backend_for_id_rejects_unknown_backend() {
        let error = match backend_for_id("custom") {
            Ok(_) => panic!("unknown backends should fail"),
            Err(error) => error,
        };

        assert!(error.message().contains("Unsupported backend 'custom'"));
    }
}
