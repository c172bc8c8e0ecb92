#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FakeError {
    OutOfBounds,
    Misaligned,
    /// Attempted to program cells that were not erased.
    NotErased,
    /// Injected power loss. Every operation fails until a power cycle.
    PowerLoss,
}
