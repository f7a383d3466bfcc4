/// WebSocket close codes used by the Delegate Handler, beyond the standard
/// 1000-1015 range defined by RFC 6455.
pub struct CloseCode;

impl CloseCode {
    /// Authentication failure or delegateId validation failure.
    pub const AUTH_OR_VALIDATION: u16 = 1008;
    /// A connection already exists for this `(userId, delegateId)` pair.
    pub const NAME_COLLISION: u16 = 4001;
}
