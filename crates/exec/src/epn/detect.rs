// Embedded interpreter eligibility detection, cached per file and mtime.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use dashmap::DashMap;
use tracing::debug;

/// Shebang marker required on the first line
const SHEBANG_MARKER: &str = "/bin/perl";

/// Directive prefixes that opt a script in (`+`) or out (`-`)
const DIRECTIVE_PREFIXES: [&str; 3] = ["# nagios:", "# naemon:", "# icinga:"];

/// Number of lines scanned for a directive
const SCAN_LINES: usize = 10;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    mtime: SystemTime,
    uses_epn: bool,
}

/// Decides whether a plugin should run in the embedded interpreter
#[derive(Debug, Default)]
pub struct EpnDetector {
    /// Result used when a script carries no directive
    implicit: bool,
    cache: DashMap<PathBuf, CacheEntry>,
}

impl EpnDetector {
    pub fn new(implicit: bool) -> Self {
        Self {
            implicit,
            cache: DashMap::new(),
        }
    }

    /// Check a plugin path, reading the file only when its mtime changed
    pub fn uses_epn(&self, path: &str) -> bool {
        let path = Path::new(path);
        let mtime = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "stat failed");
                return false;
            }
        };

        if let Some(entry) = self.cache.get(path) {
            if entry.mtime == mtime {
                return entry.uses_epn;
            }
        }

        let uses_epn = self.detect(path);
        self.cache
            .insert(path.to_path_buf(), CacheEntry { mtime, uses_epn });
        uses_epn
    }

    /// Number of cached paths
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Forget all cached results
    pub fn clear(&self) {
        self.cache.clear();
    }

    fn detect(&self, path: &Path) -> bool {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "open failed");
                return false;
            }
        };

        let mut lines = BufReader::new(file).lines();
        match lines.next() {
            Some(Ok(first)) if first.contains(SHEBANG_MARKER) => {}
            _ => return false,
        }

        for line in lines.take(SCAN_LINES - 1) {
            let Ok(line) = line else {
                break;
            };
            for prefix in DIRECTIVE_PREFIXES {
                if let Some(rest) = line.strip_prefix(prefix) {
                    match rest.trim_start().chars().next() {
                        Some('+') => return true,
                        Some('-') => return false,
                        _ => {}
                    }
                }
            }
        }

        self.implicit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn script(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn path(file: &tempfile::NamedTempFile) -> String {
        file.path().to_string_lossy().into_owned()
    }

    #[test]
    fn test_directive_opt_in() {
        let file = script("#!/usr/bin/perl\n# some comment\n# nagios: +epn\nprint 1;\n");
        assert!(EpnDetector::new(false).uses_epn(&path(&file)));
    }

    #[test]
    fn test_directive_opt_out_wins_over_implicit() {
        let file = script("#!/usr/bin/perl\n# icinga: -epn\n");
        assert!(!EpnDetector::new(true).uses_epn(&path(&file)));
    }

    #[test]
    fn test_implicit_default_without_directive() {
        let file = script("#!/usr/bin/perl -w\nuse strict;\n");
        assert!(EpnDetector::new(true).uses_epn(&path(&file)));
        assert!(!EpnDetector::new(false).uses_epn(&path(&file)));
    }

    #[test]
    fn test_non_perl_is_never_epn() {
        let file = script("#!/bin/sh\n# nagios: +epn\n");
        assert!(!EpnDetector::new(true).uses_epn(&path(&file)));
    }

    #[test]
    fn test_directive_after_line_ten_is_ignored() {
        let mut content = String::from("#!/usr/bin/perl\n");
        for _ in 0..10 {
            content.push_str("print 1;\n");
        }
        content.push_str("# nagios: +epn\n");
        let file = script(&content);
        assert!(!EpnDetector::new(false).uses_epn(&path(&file)));
    }

    #[test]
    fn test_missing_file() {
        let detector = EpnDetector::new(true);
        assert!(!detector.uses_epn("/nonexistent/plugin"));
        assert_eq!(detector.cached(), 0);
    }

    #[test]
    fn test_result_is_cached() {
        let file = script("#!/usr/bin/perl\n# nagios: +epn\n");
        let detector = EpnDetector::new(false);
        assert!(detector.uses_epn(&path(&file)));
        assert!(detector.uses_epn(&path(&file)));
        assert_eq!(detector.cached(), 1);
    }
}
