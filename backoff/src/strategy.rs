/// Exponentially growing intervals with optional jitter.
pub mod exponential;
