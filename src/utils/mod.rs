//! The `utils` module provides definitions shared across the `geobroker`
//! application: the error taxonomy and logging initialization.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::error::{DecryptError, ProtocolError};
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("bogus");
    }

    #[test]
    fn decrypt_error_message_has_no_payload_bytes() {
        let err = ProtocolError::from(DecryptError::Authentication);
        assert_eq!(
            err.to_string(),
            "could not decrypt payload: authentication failed (wrong key or corrupted data)"
        );
    }
}
