//! Minimal profile (INI) file editor with `WritePrivateProfileString`
//! semantics: names compare case-insensitively, unrelated lines survive a
//! rewrite untouched, new keys go to the end of their section and new
//! sections to the end of the file.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Section { name: String, raw: String },
    Entry { key: String, raw: String },
    Other(String),
}

impl Line {
    fn parse(raw: &str) -> Line {
        let trimmed = raw.trim();
        if trimmed.starts_with(';') || trimmed.starts_with('#') {
            return Line::Other(raw.to_string());
        }
        if let Some(rest) = trimmed.strip_prefix('[') {
            if let Some(end) = rest.find(']') {
                return Line::Section {
                    name: rest[..end].trim().to_string(),
                    raw: raw.to_string(),
                };
            }
        }
        match trimmed.find('=') {
            Some(eq) => Line::Entry {
                key: trimmed[..eq].trim().to_string(),
                raw: raw.to_string(),
            },
            None => Line::Other(raw.to_string()),
        }
    }

    fn raw(&self) -> &str {
        match self {
            Line::Section { raw, .. } | Line::Entry { raw, .. } | Line::Other(raw) => raw,
        }
    }

    fn is_blank(&self) -> bool {
        matches!(self, Line::Other(raw) if raw.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct IniFile {
    lines: Vec<Line>,
}

impl IniFile {
    pub fn parse(text: &str) -> Self {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        IniFile {
            lines: text.lines().map(Line::parse).collect(),
        }
    }

    /// A file that does not exist yet is an empty document.
    pub fn load(path: &Path) -> io::Result<Self> {
        match fs::read(path) {
            Ok(bytes) => Ok(Self::parse(&String::from_utf8_lossy(&bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    // [start, end) of the section body, header excluded
    fn section_range(&self, section: &str) -> Option<(usize, usize)> {
        let header = self.lines.iter().position(|l| {
            matches!(l, Line::Section { name, .. } if name.eq_ignore_ascii_case(section))
        })?;
        let start = header + 1;
        let end = self.lines[start..]
            .iter()
            .position(|l| matches!(l, Line::Section { .. }))
            .map_or(self.lines.len(), |off| start + off);
        Some((start, end))
    }

    fn find_key(&self, start: usize, end: usize, key: &str) -> Option<usize> {
        (start..end).find(|&i| {
            matches!(&self.lines[i], Line::Entry { key: k, .. } if k.eq_ignore_ascii_case(key))
        })
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        let (start, end) = self.section_range(section)?;
        let idx = self.find_key(start, end, key)?;
        let raw = self.lines[idx].raw();
        raw.find('=').map(|eq| raw[eq + 1..].trim())
    }

    pub fn keys(&self, section: &str) -> Vec<&str> {
        match self.section_range(section) {
            Some((start, end)) => self.lines[start..end]
                .iter()
                .filter_map(|l| match l {
                    Line::Entry { key, .. } => Some(key.as_str()),
                    _ => None,
                })
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        let entry = Line::Entry {
            key: key.to_string(),
            raw: format!("{}={}", key, value),
        };

        let (start, end) = match self.section_range(section) {
            Some(range) => range,
            None => {
                self.lines.push(Line::Section {
                    name: section.to_string(),
                    raw: format!("[{}]", section),
                });
                self.lines.push(entry);
                return;
            }
        };

        if let Some(idx) = self.find_key(start, end, key) {
            self.lines[idx] = entry;
            return;
        }

        // after the last non-blank line of the section
        let at = (start..end)
            .rev()
            .find(|&i| !self.lines[i].is_blank())
            .map_or(start, |i| i + 1);
        self.lines.insert(at, entry);
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line.raw());
            out.push_str("\r\n");
        }
        out
    }

    /// Replace `path` with the current document through a temp file in the
    /// same directory.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(self.to_text().as_bytes())?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}
