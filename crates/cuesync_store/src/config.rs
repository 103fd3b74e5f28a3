//! Store configuration.

/// Options for opening a [`crate::LocalStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Whether to sync the journal on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Whether to truncate a torn record at the journal tail on open.
    ///
    /// When false, a torn tail fails the open with a storage fault.
    pub repair_torn_tail: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            repair_torn_tail: true,
        }
    }
}

impl StoreOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to sync the journal on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets whether to repair a torn journal tail on open.
    #[must_use]
    pub const fn repair_torn_tail(mut self, value: bool) -> Self {
        self.repair_torn_tail = value;
        self
    }
}
