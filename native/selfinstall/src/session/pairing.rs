use derive_more::Debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingInputError {
    #[error("Please enter code")]
    EmptyCode,
    #[error("Pairing code must contain only digits")]
    NonNumericCode,
    #[error("Invalid port number")]
    InvalidPort,
}

/// Validated pairing input as read from the device's "Pair device" dialog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    #[debug(skip)]
    code: String,
    port: u16,
}

impl PairingRequest {
    pub fn new(code: &str, port: i64) -> Result<Self, PairingInputError> {
        let code = Self::validate_code(code)?;
        let port = u16::try_from(port)
            .ok()
            .filter(|port| *port > 0)
            .ok_or(PairingInputError::InvalidPort)?;
        Ok(Self { code: code.to_string(), port })
    }

    /// Trimmed `code` if it looks like a pairing code
    pub fn validate_code(code: &str) -> Result<&str, PairingInputError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(PairingInputError::EmptyCode);
        }
        if !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(PairingInputError::NonNumericCode);
        }
        Ok(code)
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_trimmed() {
        let request = PairingRequest::new("  482910\n", 37_115).unwrap();
        assert_eq!(request.code(), "482910");
        assert_eq!(request.port(), 37_115);
    }

    #[test]
    fn invalid_input_is_rejected() {
        assert_eq!(PairingRequest::new("   ", 37_115), Err(PairingInputError::EmptyCode));
        assert_eq!(PairingRequest::new("12a456", 37_115), Err(PairingInputError::NonNumericCode));
        assert_eq!(PairingRequest::new("123456", 0), Err(PairingInputError::InvalidPort));
        assert_eq!(PairingRequest::new("123456", -1), Err(PairingInputError::InvalidPort));
        assert_eq!(PairingRequest::new("123456", 70_000), Err(PairingInputError::InvalidPort));
    }

    #[test]
    fn debug_output_hides_the_code() {
        let request = PairingRequest::new("482910", 37_115).unwrap();
        assert!(!format!("{request:?}").contains("482910"));
    }
}
