use derive_more::Display;

/// Connection state of the local ADB daemon as seen by this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionStatus {
    #[display("not connected")]
    NotConnected,
    #[display("connected")]
    Connected,
    #[display("needs pairing")]
    NeedsPairing,
    #[display("error")]
    Error,
}

impl Default for ConnectionStatus {
    // Nothing has been proven yet, so the safe assumption is that pairing is missing
    fn default() -> Self {
        Self::NeedsPairing
    }
}
