//! On-disk output tree for compiled themes.
//!
//! Owns the output directory, the entry tree under `theme-data`, theme info
//! files and man pages (written plain plus a gzip-compressed sibling), and
//! the compile diagnostics sink: `Error:` and `Warning:` messages accumulate
//! on the tree and `success` records whether the pass may still succeed.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::defs;
use crate::strutil::make_printable;

/// Raised to abort a compile pass after a fatal syntax error. The message
/// has already been recorded on the tree when this is returned.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SyntaxAbort(pub String);

pub struct OutputTree {
    /// Output directory root.
    pub path: PathBuf,
    /// Entry tree root (`<path>/theme-data`).
    pub datapath: PathBuf,
    /// False once any error was recorded.
    pub success: bool,
    /// Ordered diagnostics for the whole pass.
    pub messages: Vec<String>,
}

impl OutputTree {
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if !path.exists() {
            fs::create_dir(path)?;
        }
        let datapath = path.join(defs::DATA_PATHNAME);
        if !datapath.exists() {
            fs::create_dir(&datapath)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            datapath,
            success: true,
            messages: Vec::new(),
        })
    }

    pub fn handle_error(&mut self, message: impl AsRef<str>) {
        self.success = false;
        self.messages.push(format!("Error: {}", message.as_ref()));
    }

    /// Record a fatal syntax error and hand back the abort value for the
    /// caller to return.
    pub fn handle_syntax_error(&mut self, message: impl AsRef<str>) -> SyntaxAbort {
        let output = format!("Syntax error: {}", message.as_ref());
        self.success = false;
        self.messages.push(output.clone());
        SyntaxAbort(output)
    }

    pub fn handle_warning(&mut self, message: impl AsRef<str>) {
        self.messages.push(format!("Warning: {}", message.as_ref()));
    }

    /// Create the directory chain for all but the last whitespace-separated
    /// part of `entry_name`. A file sitting where a directory is needed is
    /// an error.
    pub fn recursive_mkdir(
        &mut self,
        base_path: &Path,
        entry_name: &str,
        line_number_debug: &str,
    ) -> bool {
        let parts: Vec<&str> = entry_name.split_whitespace().collect();
        let mut current_path = base_path.to_path_buf();
        let mut current_entry = String::new();
        for part in parts.iter().take(parts.len().saturating_sub(1)) {
            current_entry.push_str(part);
            current_path.push(part);
            if current_path.is_file() {
                self.handle_error(format!(
                    "Line {line_number_debug}: Cannot create subsection \"{}\" because an entry \
                     with the same name already exists",
                    make_printable(current_entry.trim())
                ));
                return false;
            }
            if !current_path.is_dir() {
                if fs::create_dir(&current_path).is_err() {
                    self.handle_error(format!(
                        "Line {line_number_debug}: Cannot create subsection \"{}\"",
                        make_printable(current_entry.trim())
                    ));
                    return false;
                }
            }
            current_entry.push(' ');
        }
        true
    }

    /// Write one entry file under `base_path`, its name parts becoming the
    /// subdirectory chain. Overwriting an entry warns; colliding with a
    /// subsection is an error.
    pub fn add_entry(
        &mut self,
        base_path: &Path,
        entry_name: &str,
        entry_content: &str,
        line_number_debug: &str,
    ) {
        if !self.recursive_mkdir(base_path, entry_name, line_number_debug) {
            return;
        }
        let mut target = base_path.to_path_buf();
        for part in entry_name.split_whitespace() {
            target.push(part);
        }
        if target.is_dir() {
            self.handle_error(format!(
                "Line {line_number_debug}: Cannot create entry \"{}\" because a subsection with \
                 the same name already exists",
                make_printable(entry_name)
            ));
            return;
        }
        if target.is_file() {
            self.handle_warning(format!(
                "Line {line_number_debug}: Repeated entry \"{}\", overwriting",
                make_printable(entry_name)
            ));
        }
        if fs::write(&target, format!("{entry_content}\n")).is_err() {
            self.handle_error(format!(
                "Line {line_number_debug}: Cannot create entry \"{}\"",
                make_printable(entry_name)
            ));
        }
    }

    /// Write one info file; overwriting warns.
    pub fn write_infofile(
        &mut self,
        dir_path: &Path,
        filename: &str,
        content: &str,
        line_number_debug: usize,
        header_name_debug: &str,
    ) {
        self.write_infofile_raw(
            dir_path,
            filename,
            &format!("{content}\n"),
            line_number_debug,
            header_name_debug,
        );
    }

    /// Write a list info file, one phrase per line.
    pub fn write_infofile_newlines(
        &mut self,
        dir_path: &Path,
        filename: &str,
        content_phrases: &[String],
        line_number_debug: usize,
        header_name_debug: &str,
    ) {
        let mut body = String::new();
        for phrase in content_phrases {
            body.push_str(phrase);
            body.push('\n');
        }
        self.write_infofile_raw(dir_path, filename, &body, line_number_debug, header_name_debug);
    }

    fn write_infofile_raw(
        &mut self,
        dir_path: &Path,
        filename: &str,
        body: &str,
        line_number_debug: usize,
        header_name_debug: &str,
    ) {
        if !dir_path.is_dir() && fs::create_dir_all(dir_path).is_err() {
            self.handle_error(format!(
                "Line {line_number_debug}: Cannot create info directory for \"{}\"",
                make_printable(header_name_debug)
            ));
            return;
        }
        let target = dir_path.join(filename);
        if target.is_file() {
            self.handle_warning(format!(
                "Line {line_number_debug}: Repeated header info \"{}\", overwriting",
                make_printable(header_name_debug)
            ));
        }
        if fs::write(&target, body).is_err() {
            self.handle_error(format!(
                "Line {line_number_debug}: Cannot write info file \"{}\"",
                make_printable(header_name_debug)
            ));
        }
    }

    /// Write a man page plus its `.gz` sibling. Path parts become
    /// subdirectories; the last part is the file name. A `line_number_debug`
    /// of `None` silences diagnostics (used for migration sidecars).
    pub fn write_manpage_file(
        &mut self,
        file_path: &[String],
        content: &str,
        line_number_debug: Option<usize>,
        custom_parent_path: Option<&Path>,
    ) {
        let Some((file_name, subdirs)) = file_path.split_last() else {
            return;
        };
        let mut parent = custom_parent_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.path.join(defs::MANPAGE_PATHNAME));
        for part in subdirs {
            parent.push(part);
        }

        let conflict = |tree: &mut Self| {
            if let Some(line) = line_number_debug {
                tree.handle_error(format!(
                    "Line {line}: Conflicting files and subdirectories; please check previous \
                     definitions"
                ));
            }
        };

        if fs::create_dir_all(&parent).is_err() {
            conflict(self);
            return;
        }
        let full_path = parent.join(file_name);
        if full_path.is_file() {
            if let Some(line) = line_number_debug {
                self.handle_warning(format!("Line {line}: Repeated manpage file, overwriting"));
            }
        }
        if fs::write(&full_path, content).is_err() {
            conflict(self);
            return;
        }

        let gz_path = parent.join(format!("{file_name}.gz"));
        let write_gz = || -> std::io::Result<()> {
            let file = fs::File::create(&gz_path)?;
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(content.as_bytes())?;
            encoder.finish()?;
            Ok(())
        };
        if write_gz().is_err() {
            conflict(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn tree(dir: &TempDir) -> OutputTree {
        OutputTree::new(&dir.path().join("out")).unwrap()
    }

    #[test]
    fn entries_are_written_with_trailing_newline() {
        let dir = TempDir::new().unwrap();
        let mut t = tree(&dir);
        let datapath = t.datapath.clone();
        t.add_entry(&datapath, "section greeting", "hello", "3");
        let written = fs::read_to_string(datapath.join("section/greeting")).unwrap();
        assert_eq!(written, "hello\n");
        assert!(t.success);
    }

    #[test]
    fn repeated_entry_warns_and_overwrites() {
        let dir = TempDir::new().unwrap();
        let mut t = tree(&dir);
        let datapath = t.datapath.clone();
        t.add_entry(&datapath, "x", "one", "1");
        t.add_entry(&datapath, "x", "two", "2");
        assert_eq!(fs::read_to_string(datapath.join("x")).unwrap(), "two\n");
        assert!(t.messages.iter().any(|m| m.contains("Repeated entry")));
        assert!(t.success);
    }

    #[test]
    fn entry_under_existing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut t = tree(&dir);
        let datapath = t.datapath.clone();
        t.add_entry(&datapath, "x", "leaf", "1");
        t.add_entry(&datapath, "x y", "nested", "2");
        assert!(!t.success);
        assert!(t.messages.iter().any(|m| m.contains("Cannot create subsection")));
    }

    #[test]
    fn entry_over_existing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut t = tree(&dir);
        let datapath = t.datapath.clone();
        t.add_entry(&datapath, "x y", "nested", "1");
        t.add_entry(&datapath, "x", "leaf", "2");
        assert!(!t.success);
        assert!(t
            .messages
            .iter()
            .any(|m| m.contains("a subsection with the same name already exists")));
    }

    #[test]
    fn manpage_gets_gzip_sibling() {
        let dir = TempDir::new().unwrap();
        let mut t = tree(&dir);
        let path = vec!["man1".to_string(), "tool.1".to_string()];
        t.write_manpage_file(&path, ".TH TOOL 1\n", Some(5), None);

        let plain = t.path.join("manpages/man1/tool.1");
        assert_eq!(fs::read_to_string(&plain).unwrap(), ".TH TOOL 1\n");

        let gz = fs::File::open(t.path.join("manpages/man1/tool.1.gz")).unwrap();
        let mut decoder = GzDecoder::new(gz);
        let mut restored = String::new();
        decoder.read_to_string(&mut restored).unwrap();
        assert_eq!(restored, ".TH TOOL 1\n");
    }

    #[test]
    fn infofile_overwrite_warns() {
        let dir = TempDir::new().unwrap();
        let mut t = tree(&dir);
        let info = t.path.join("theme-info/1");
        t.write_infofile(&info, "clithemeinfo_name", "a", 1, "name");
        t.write_infofile(&info, "clithemeinfo_name", "b", 2, "name");
        assert!(t.messages.iter().any(|m| m.contains("Repeated header info")));
        assert_eq!(
            fs::read_to_string(info.join("clithemeinfo_name")).unwrap(),
            "b\n"
        );
    }
}
