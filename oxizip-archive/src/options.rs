//! Archive-wide settings.

use crate::encoding::TextEncoding;

/// When ZIP64 records are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Zip64Option {
    /// Never; a save that needs ZIP64 fails with `Zip64Required`.
    Never,
    /// Only when a size, offset or count overflows its classic field.
    #[default]
    AsNecessary,
    /// Always, even for tiny archives.
    Always,
}

/// What to do when an extraction target already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractExistingFile {
    /// Fail with `TargetExists`.
    #[default]
    Throw,
    /// Replace the existing file.
    Overwrite,
    /// Leave the existing file and skip the entry.
    Skip,
    /// Ask the event sink through an `ExtractExisting` event.
    Ask,
}

/// Parallel deflate settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelDeflate {
    /// Entries at least this large are compressed in parallel. `None`
    /// disables parallel compression; `Some(0)` also covers entries whose
    /// length is unknown up front.
    pub threshold: Option<u64>,
    /// Bytes per independently compressed block.
    pub block_size: usize,
    /// Worker threads.
    pub max_threads: usize,
}

impl Default for ParallelDeflate {
    fn default() -> Self {
        Self {
            threshold: None,
            block_size: 128 * 1024,
            max_threads: std::thread::available_parallelism().map_or(4, |n| n.get()),
        }
    }
}

impl ParallelDeflate {
    /// Enable parallel compression for entries of at least `threshold` bytes.
    pub fn with_threshold(threshold: u64) -> Self {
        Self {
            threshold: Some(threshold),
            ..Self::default()
        }
    }

    /// Whether an entry of `len` bytes (`None` = unknown) qualifies.
    pub fn applies_to(&self, len: Option<u64>) -> bool {
        match (self.threshold, len) {
            (None, _) => false,
            (Some(0), _) => true,
            (Some(t), Some(len)) => len >= t,
            (Some(_), None) => false,
        }
    }
}

/// Options for opening an archive.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Default password for encrypted entries.
    pub password: Option<String>,
    /// Name and comment encoding.
    pub encoding: TextEncoding,
    /// Compare names case-sensitively.
    pub case_sensitive: bool,
}

impl ReadOptions {
    /// Set the default password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the text encoding.
    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallel_threshold() {
        assert!(!ParallelDeflate::default().applies_to(Some(u64::MAX)));

        let p = ParallelDeflate::with_threshold(1024);
        assert!(p.applies_to(Some(1024)));
        assert!(!p.applies_to(Some(1023)));
        assert!(!p.applies_to(None));

        let always = ParallelDeflate::with_threshold(0);
        assert!(always.applies_to(None));
    }
}
