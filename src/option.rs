//! Bit-fields for access and synchronization options.

use bitflags::bitflags;

bitflags! {
    /// Options that shape a single file system operation.
    ///
    /// Options are advisory for drivers that cannot honor them; e.g. the
    /// TAR driver ignores `COMPRESS`/`STORE` because TAR entries are never
    /// compressed individually.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccessOptions: u16 {
        /// Route reads and writes for the entry through the cache layer.
        const CACHE = 1 << 0;
        /// Create missing parent directories.
        const CREATE_PARENTS = 1 << 1;
        /// Prefer a compressed representation for the entry.
        const COMPRESS = 1 << 2;
        /// Prefer an uncompressed (stored) representation for the entry.
        const STORE = 1 << 3;
        /// Prefer an encrypted representation for the entry.
        const ENCRYPT = 1 << 4;
        /// Fail if the entry already exists.
        const EXCLUSIVE = 1 << 5;
        /// Append to existing content instead of replacing it.
        const APPEND = 1 << 6;
        /// Allow the archive to grow by appending updated entries instead
        /// of rewriting it.
        const GROW = 1 << 7;
    }
}

bitflags! {
    /// Options for the `sync` operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SyncOptions: u8 {
        /// Wait without timeout for open input resources of other threads.
        const WAIT_CLOSE_INPUT = 1 << 0;
        /// Wait without timeout for open output resources of other threads.
        const WAIT_CLOSE_OUTPUT = 1 << 1;
        /// Forcibly close open input resources.
        const FORCE_CLOSE_INPUT = 1 << 2;
        /// Forcibly close open output resources.
        const FORCE_CLOSE_OUTPUT = 1 << 3;
        /// Discard unsynchronized changes instead of committing them.
        const ABORT_CHANGES = 1 << 4;
        /// Evict all cache buffers for the file system.
        const CLEAR_CACHE = 1 << 5;
        /// Tear down the mounted state after committing.
        const UMOUNT = 1 << 6;
    }
}

impl SyncOptions {
    /// The option set used on application exit: force-close everything,
    /// clear caches and unmount.
    pub fn umount() -> Self {
        SyncOptions::FORCE_CLOSE_INPUT
            | SyncOptions::FORCE_CLOSE_OUTPUT
            | SyncOptions::CLEAR_CACHE
            | SyncOptions::UMOUNT
    }

    /// True if either `FORCE_CLOSE_*` flag is set.
    pub fn force_close(self) -> bool {
        self.intersects(SyncOptions::FORCE_CLOSE_INPUT | SyncOptions::FORCE_CLOSE_OUTPUT)
    }

    /// True if either `WAIT_CLOSE_*` flag is set.
    pub fn wait_close(self) -> bool {
        self.intersects(SyncOptions::WAIT_CLOSE_INPUT | SyncOptions::WAIT_CLOSE_OUTPUT)
    }

    /// Removes the `WAIT_CLOSE_*` flags, bounding any wait by the
    /// configured timeout.
    pub fn without_waiting(self) -> Self {
        self & !(SyncOptions::WAIT_CLOSE_INPUT | SyncOptions::WAIT_CLOSE_OUTPUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_umount_implies_force_and_clear() {
        let opts = SyncOptions::umount();
        assert!(opts.contains(SyncOptions::UMOUNT));
        assert!(opts.contains(SyncOptions::CLEAR_CACHE));
        assert!(opts.force_close());
    }

    #[test]
    fn test_without_waiting_strips_only_wait_flags() {
        let opts = SyncOptions::WAIT_CLOSE_INPUT
            | SyncOptions::WAIT_CLOSE_OUTPUT
            | SyncOptions::UMOUNT;
        let stripped = opts.without_waiting();
        assert!(!stripped.wait_close());
        assert!(stripped.contains(SyncOptions::UMOUNT));
    }

    #[test]
    fn test_default_is_empty() {
        assert!(AccessOptions::default().is_empty());
        assert!(SyncOptions::default().is_empty());
    }
}
