// src/files/glob.rs

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// A compiled set of glob patterns matched against bucket-relative paths.
///
/// `*` does not cross `/`; use `**` to descend into directories.
#[derive(Debug, Clone)]
pub struct PatternSet {
    patterns: Vec<String>,
    set: GlobSet,
}

impl PatternSet {
    pub fn new<I, S>(patterns: I) -> Result<Self, globset::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = GlobBuilder::new(pattern).literal_separator(true).build()?;
            builder.add(glob);
            kept.push(pattern.to_string());
        }
        Ok(Self {
            patterns: kept,
            set: builder.build()?,
        })
    }

    pub fn is_match(&self, relative: &str) -> bool {
        self.set.is_match(relative)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
