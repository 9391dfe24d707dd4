//! The backhaul bridge transport is abstracted to its contract (spec.md §1,
//! glossary "Bridge transport"): publish bytes, receive bytes. Which backbone
//! (MQTT, a different pub/sub) is used is not part of this core.

/// Contract the backhaul transport exposes to `BridgeCore`.
pub trait BridgeTransport: Send {
    /// Best-effort publish; failures are not surfaced as errors (§4.10).
    fn publish(&mut self, bytes: &[u8]);

    /// Non-blocking poll for one inbound message, if any is buffered.
    fn try_recv(&mut self) -> Option<Vec<u8>>;

    fn is_connected(&self) -> bool;

    fn disconnect(&mut self);

    /// Attempts (re)connection using the currently configured credentials
    /// and topic. Returns whether the attempt succeeded.
    fn connect(&mut self) -> bool;
}
