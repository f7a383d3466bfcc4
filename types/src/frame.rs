use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Envelope used by the Reliable Channel for every MCPL payload sent after
/// `mcpl/hello`. A frame with `seq == 0` and no payload is a bare ack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReliableFrame {
    pub seq: u64,
    pub ack: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ReliableFrame {
    pub fn bare_ack(ack: u64) -> Self {
        Self {
            seq: 0,
            ack,
            payload: None,
        }
    }

    pub fn is_bare_ack(&self) -> bool {
        self.seq == 0 && self.payload.is_none()
    }
}
