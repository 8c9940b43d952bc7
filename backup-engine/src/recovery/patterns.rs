//! Glob selection of restorable files.
//!
//! `*` and `?` stay within one path component, `**` spans components. A
//! pattern without `/` is matched against the file name only.

use std::path::Path;

#[derive(Debug, Clone)]
pub struct PathPattern {
    pattern: Vec<char>,
    name_only: bool,
}

impl PathPattern {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.chars().collect(),
            name_only: !pattern.contains('/'),
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        let text = if self.name_only {
            match path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => return false,
            }
        } else {
            path.to_string_lossy().into_owned()
        };
        let text: Vec<char> = text.chars().collect();
        glob_match(&self.pattern, &text)
    }
}

/// True when `path` matches any pattern; an empty set matches everything.
pub fn matches_any(patterns: &[PathPattern], path: &Path) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| p.matches(path))
}

pub fn compile(patterns: &[String]) -> Vec<PathPattern> {
    patterns
        .iter()
        .filter(|p| !p.trim().is_empty())
        .map(|p| PathPattern::new(p.trim()))
        .collect()
}

fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some('*'), _) if pattern.get(1) == Some(&'*') => {
            // `**/` also matches zero directories.
            let rest = &pattern[2..];
            if rest.first() == Some(&'/') && glob_match(&rest[1..], text) {
                return true;
            }
            glob_match(rest, text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some('*'), _) => {
            glob_match(&pattern[1..], text)
                || (text.first().is_some_and(|c| *c != '/') && glob_match(pattern, &text[1..]))
        }
        (Some('?'), Some(t)) if *t != '/' => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, path: &str) -> bool {
        PathPattern::new(pattern).matches(Path::new(path))
    }

    #[test]
    fn test_name_patterns() {
        assert!(matches("*.txt", "/data/notes/a.txt"));
        assert!(matches("report-??.pdf", "/data/report-01.pdf"));
        assert!(!matches("*.txt", "/data/a.txt.bak"));
    }

    #[test]
    fn test_path_patterns() {
        assert!(matches("/data/*/a.txt", "/data/notes/a.txt"));
        assert!(!matches("/data/*.txt", "/data/notes/a.txt"));
        assert!(matches("/data/**/a.txt", "/data/notes/deep/a.txt"));
        assert!(matches("/data/**/a.txt", "/data/a.txt"));
        assert!(matches("/data/**", "/data/x/y/z"));
        assert!(!matches("/other/**", "/data/x"));
    }

    #[test]
    fn test_empty_set_matches_everything() {
        assert!(matches_any(&compile(&[]), Path::new("/anything")));
        assert!(matches_any(&compile(&["  ".into()]), Path::new("/anything")));
        let set = compile(&["*.db".into(), "*.txt".into()]);
        assert!(matches_any(&set, Path::new("/x/a.txt")));
        assert!(!matches_any(&set, Path::new("/x/a.png")));
    }
}
