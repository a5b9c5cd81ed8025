//! Configuration for pipe construction.

/// The initial (and minimum, absent a [`reserve`](crate::Pipe::reserve) call)
/// capacity of a freshly constructed pipe.
///
/// Kept small in debug builds so that resize logic gets exercised by ordinary
/// tests without needing thousands of pushes.
#[cfg(debug_assertions)]
pub const DEFAULT_MINCAP: usize = 2;

/// The initial (and minimum, absent a [`reserve`](crate::Pipe::reserve) call)
/// capacity of a freshly constructed pipe.
#[cfg(not(debug_assertions))]
pub const DEFAULT_MINCAP: usize = 32;

/// Optional behavior toggles for a [`crate::Pipe`].
///
/// `Pipe::new` uses [`PipeConfig::default`] (metrics disabled); `Pipe::with_config`
/// takes one of these explicitly.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipeConfig {
    /// Whether to track atomic push/pop counters (see [`crate::Metrics`]).
    ///
    /// Metrics are cheap (a handful of relaxed atomic increments per call), but
    /// default to off so `Pipe::new` matches the original zero-overhead-unless-asked
    /// constructor contract.
    pub enable_metrics: bool,
}

impl PipeConfig {
    /// Sets whether push/pop counters are tracked.
    pub fn with_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = enable;
        self
    }
}
