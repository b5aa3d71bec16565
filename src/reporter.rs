//! Progress narration for migration runs.
//!
//! Executors narrate what they do ("Applying ...", "Applied in 12ms") through
//! a [`Reporter`] handed to them at construction. The library default,
//! [`LogReporter`], forwards everything to the `log` facade; front-ends plug
//! in their own console rendering.

/// Receives human-readable progress messages from executors
pub trait Reporter: Send + Sync {
    /// A step has started or a neutral fact is worth telling
    fn progress(&self, message: &str);
    /// A step completed successfully
    fn success(&self, message: &str);
    /// Something the operator should look at, but the run continues
    fn warning(&self, message: &str);
    /// A step failed
    fn failure(&self, message: &str);
}

/// Reporter that writes through the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn progress(&self, message: &str) {
        log::info!("{message}");
    }

    fn success(&self, message: &str) {
        log::info!("{message}");
    }

    fn warning(&self, message: &str) {
        log::warn!("{message}");
    }

    fn failure(&self, message: &str) {
        log::error!("{message}");
    }
}
