//! SSH client config stanza rewriting.
//!
//! This is the heart of ssh-init. Given the text of `~/.ssh/config`, it finds
//! the `Host <alias>` block written by an earlier run (or by hand), comments
//! out every directive this tool manages, and inserts a fresh block in its
//! place. Everything else in the file is left byte-for-byte as it was.
//!
//! # Algorithm
//!
//! ```text
//! Searching --(Host <alias>)--> Active --(Host/Match <any>)--> Done
//!                                  |
//!                                  +-- managed directive: prefix '#'
//! ```
//!
//! - The first line `Host <alias>` (alias compared literally) opens the
//!   active region and is itself commented out.
//! - The next `Host` or `Match` line closes it. That index is the insertion
//!   point; with no closing line, or no matching stanza at all, the new block
//!   goes at end of file.
//! - Inside the region, `Host`, `user`, `ProxyCommand`, `IdentityFile`,
//!   `hostname` and `Port` lines are commented whatever their indentation.
//!   Anything else (`Compression yes`, `ForwardAgent`, comments) is kept.
//!
//! Running twice for the same alias therefore leaves exactly one active
//! `Host <alias>` line. Unmanaged lines from older stanzas accumulate as
//! inert leftovers above the new block; they are never deleted.

use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::args::ConnectionSettings;
use crate::config::{CONFIG_FILE_MODE, PRIVATE_DIR_MODE};

/// Directive keywords whose values this tool owns inside its stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagedDirective {
    Host,
    User,
    ProxyCommand,
    IdentityFile,
    Hostname,
    Port,
}

impl ManagedDirective {
    pub const ALL: [ManagedDirective; 6] = [
        ManagedDirective::Host,
        ManagedDirective::User,
        ManagedDirective::ProxyCommand,
        ManagedDirective::IdentityFile,
        ManagedDirective::Hostname,
        ManagedDirective::Port,
    ];

    /// Keyword as written in the generated stanza.
    pub fn keyword(self) -> &'static str {
        match self {
            ManagedDirective::Host => "Host",
            ManagedDirective::User => "user",
            ManagedDirective::ProxyCommand => "ProxyCommand",
            ManagedDirective::IdentityFile => "IdentityFile",
            ManagedDirective::Hostname => "hostname",
            ManagedDirective::Port => "Port",
        }
    }
}

/// Full text of a client config file, one entry per line.
///
/// Each line keeps its own terminator so that untouched lines are written
/// back exactly as read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDocument {
    lines: Vec<String>,
}

impl ConfigDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text(text: &str) -> Self {
        Self {
            lines: text.split_inclusive('\n').map(str::to_string).collect(),
        }
    }

    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn to_text(&self) -> String {
        self.lines.concat()
    }

    /// Index of the active `Host <alias>` line, if any.
    pub fn find_stanza(&self, alias: &str) -> Option<usize> {
        let matcher = LineMatcher::new(alias);
        self.lines.iter().position(|line| matcher.is_opening(line))
    }

    /// Read a config file; a missing file is an empty document.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Self::from_text(&text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "config file not found, starting empty");
                Ok(Self::new())
            }
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read SSH config: {}", path.display()))
            }
        }
    }

    /// Replace the file at `path` with this document.
    ///
    /// The text goes to a temporary file in the same directory which is then
    /// renamed over the original. An existing file keeps its permissions; a
    /// new one is created 0600. A missing parent directory is created 0700.
    /// If `path` is a symlink, its target is rewritten instead.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let path = resolve_symlink(path)?;
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        if !dir.exists() {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            fs::set_permissions(&dir, fs::Permissions::from_mode(PRIVATE_DIR_MODE))
                .with_context(|| format!("Failed to set permissions on {}", dir.display()))?;
        }

        let permissions = match fs::metadata(&path) {
            Ok(meta) => meta.permissions(),
            Err(_) => fs::Permissions::from_mode(CONFIG_FILE_MODE),
        };

        let mut tmp = NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
        tmp.write_all(self.to_text().as_bytes())
            .context("Failed to write SSH config")?;
        tmp.as_file()
            .sync_all()
            .context("Failed to flush SSH config")?;
        fs::set_permissions(tmp.path(), permissions)
            .context("Failed to set SSH config permissions")?;

        tmp.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace SSH config: {}", path.display()))?;

        debug!(path = %path.display(), lines = self.len(), "config written");
        Ok(())
    }
}

fn resolve_symlink(path: &Path) -> Result<PathBuf> {
    if path.is_symlink() {
        fs::canonicalize(path)
            .with_context(|| format!("Failed to resolve symlink: {}", path.display()))
    } else {
        Ok(path.to_path_buf())
    }
}

/// The block written for one alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    pub alias: String,
    pub host: String,
    pub user: Option<String>,
    pub port: String,
    pub bastion: Option<String>,
    pub identity_file: PathBuf,
}

impl Stanza {
    pub fn from_settings(settings: &ConnectionSettings, key_path: &Path) -> Self {
        Self {
            alias: settings.alias.clone(),
            host: settings.host.clone(),
            user: settings.user.clone(),
            port: settings.port.clone(),
            bastion: settings.bastion.clone(),
            identity_file: key_path.to_path_buf(),
        }
    }

    /// Lines of the block, in the fixed order, ending with a blank line.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![format!("{} {}\n", ManagedDirective::Host.keyword(), self.alias)];

        if let Some(bastion) = &self.bastion {
            lines.push(directive(
                ManagedDirective::ProxyCommand,
                &proxy_command(bastion, &self.host),
            ));
        }
        if let Some(user) = &self.user {
            lines.push(directive(ManagedDirective::User, user));
        }
        lines.push(directive(ManagedDirective::Port, &self.port));
        lines.push(directive(
            ManagedDirective::IdentityFile,
            &quote_path(&self.identity_file),
        ));
        lines.push(directive(ManagedDirective::Hostname, &self.host));
        lines.push("\n".to_string());

        lines
    }
}

/// `ssh <bastion> -W <host>:%p`, shared with the remote installer.
pub fn proxy_command(bastion: &str, host: &str) -> String {
    format!("ssh {} -W {}:%p", bastion, host)
}

fn directive(kind: ManagedDirective, value: &str) -> String {
    format!("    {} {}\n", kind.keyword(), value)
}

fn quote_path(path: &Path) -> String {
    let text = path.display().to_string();
    if text.chars().any(char::is_whitespace) {
        format!("\"{}\"", text)
    } else {
        text
    }
}

/// Line patterns for one alias.
struct LineMatcher {
    opening: Regex,
    block_start: Regex,
    managed: Regex,
}

impl LineMatcher {
    fn new(alias: &str) -> Self {
        // Keywords are case-insensitive in ssh_config and may be followed by
        // '=' instead of whitespace. The alias itself is compared literally.
        let opening = format!(r"^\s*(?i:host)(?:\s*=\s*|\s+){}\s*$", regex::escape(alias));
        let managed = ManagedDirective::ALL
            .iter()
            .map(|d| regex::escape(d.keyword()))
            .collect::<Vec<_>>()
            .join("|");

        Self {
            opening: Regex::new(&opening).expect("escaped alias forms a valid pattern"),
            block_start: Regex::new(r"^\s*(?i:host|match)(?:\s*=\s*|\s+)\S")
                .expect("static pattern"),
            managed: Regex::new(&format!(r"^\s*(?i:{})(?:\s|=)", managed))
                .expect("static keywords form a valid pattern"),
        }
    }

    fn is_opening(&self, line: &str) -> bool {
        self.opening.is_match(line)
    }

    fn is_block_start(&self, line: &str) -> bool {
        self.block_start.is_match(line)
    }

    fn is_managed(&self, line: &str) -> bool {
        self.managed.is_match(line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Searching,
    Active,
    Done,
}

/// Neutralize the stanza for `alias` and insert `new_stanza` in its place.
///
/// See the module documentation for the exact rules.
pub fn rewrite(document: ConfigDocument, alias: &str, new_stanza: &[String]) -> ConfigDocument {
    let matcher = LineMatcher::new(alias);
    let mut state = Scan::Searching;
    let mut terminus = None;
    let mut lines = Vec::with_capacity(document.lines.len() + new_stanza.len() + 1);

    for (index, line) in document.lines.into_iter().enumerate() {
        let line = match state {
            Scan::Searching if matcher.is_opening(&line) => {
                state = Scan::Active;
                comment_out(line)
            }
            Scan::Active if matcher.is_block_start(&line) => {
                state = Scan::Done;
                terminus = Some(index);
                line
            }
            Scan::Active if matcher.is_managed(&line) => comment_out(line),
            Scan::Searching | Scan::Active | Scan::Done => line,
        };
        lines.push(line);
    }

    debug!(alias, ?state, ?terminus, "scanned config");

    let at = match terminus {
        Some(index) => index,
        None => {
            // Appending: the old last line must end before the new block starts.
            if let Some(last) = lines.last_mut() {
                if !last.ends_with('\n') {
                    last.push('\n');
                }
            }
            lines.len()
        }
    };

    lines.splice(at..at, new_stanza.iter().cloned());
    ConfigDocument { lines }
}

fn comment_out(line: String) -> String {
    if line.trim_start().starts_with('#') {
        line
    } else {
        format!("#{}", line)
    }
}

/// Load the config at `path`, rewrite the stanza, and write it back.
///
/// Returns whether an existing stanza was replaced.
pub fn update_config_file(path: &Path, stanza: &Stanza) -> Result<bool> {
    let document = ConfigDocument::load(path)?;
    let replaced = document.find_stanza(&stanza.alias).is_some();

    let document = rewrite(document, &stanza.alias, &stanza.lines());
    document.persist(path)?;

    Ok(replaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stanza(alias: &str, user: Option<&str>, key: &str) -> Stanza {
        Stanza {
            alias: alias.to_string(),
            host: alias.to_string(),
            user: user.map(str::to_string),
            port: "22".to_string(),
            bastion: None,
            identity_file: PathBuf::from(key),
        }
    }

    fn active_hosts(doc: &ConfigDocument, alias: &str) -> usize {
        doc.lines()
            .iter()
            .filter(|l| l.trim_end() == format!("Host {}", alias))
            .count()
    }

    #[test]
    fn test_documented_example() {
        let doc = ConfigDocument::from_lines([
            "Host foo\n",
            "    user alice\n",
            "    IdentityFile /old/path\n",
            "Host bar\n",
        ]);
        let new = stanza("foo", Some("bob"), "/new/path");

        let out = rewrite(doc, "foo", &new.lines());

        assert_eq!(
            out.lines(),
            &[
                "#Host foo\n",
                "#    user alice\n",
                "#    IdentityFile /old/path\n",
                "Host foo\n",
                "    user bob\n",
                "    Port 22\n",
                "    IdentityFile /new/path\n",
                "    hostname foo\n",
                "\n",
                "Host bar\n",
            ]
        );
    }

    #[test]
    fn test_other_stanzas_untouched() {
        let before = "Host alpha\n  user a\n  Port 2200\n\nHost foo\n  user alice\n  IdentityFile /old\nHost bar\n  user b\n  IdentityFile /bar\n";
        let doc = ConfigDocument::from_text(before);

        let out = rewrite(doc, "foo", &stanza("foo", Some("bob"), "/new").lines());
        let text = out.to_text();

        assert!(text.starts_with("Host alpha\n  user a\n  Port 2200\n\n#Host foo\n#  user alice\n#  IdentityFile /old\n"));
        assert!(text.ends_with("\nHost bar\n  user b\n  IdentityFile /bar\n"));
    }

    #[test]
    fn test_absent_alias_appends() {
        let before = "Host bar\n    user b\n";
        let new = stanza("foo", None, "/k");

        let out = rewrite(ConfigDocument::from_text(before), "foo", &new.lines());

        let text = out.to_text();
        assert!(text.starts_with(before));
        assert_eq!(&text[before.len()..], new.lines().concat());
    }

    #[test]
    fn test_append_to_unterminated_last_line() {
        let out = rewrite(
            ConfigDocument::from_text("Host bar\n    user b"),
            "foo",
            &stanza("foo", None, "/k").lines(),
        );

        assert_eq!(out.lines()[1], "    user b\n");
        assert_eq!(out.lines()[2], "Host foo\n");
    }

    #[test]
    fn test_empty_document() {
        let new = stanza("foo", None, "/k");
        let out = rewrite(ConfigDocument::new(), "foo", &new.lines());
        assert_eq!(out.lines(), new.lines().as_slice());
    }

    #[test]
    fn test_stanza_at_end_of_file() {
        let out = rewrite(
            ConfigDocument::from_text("Host bar\nHost foo\n  user alice\n"),
            "foo",
            &stanza("foo", Some("bob"), "/k").lines(),
        );

        assert_eq!(out.lines()[0], "Host bar\n");
        assert_eq!(out.lines()[1], "#Host foo\n");
        assert_eq!(out.lines()[2], "#  user alice\n");
        assert_eq!(out.lines()[3], "Host foo\n");
        assert_eq!(active_hosts(&out, "foo"), 1);
    }

    #[test]
    fn test_match_on_last_line() {
        let out = rewrite(
            ConfigDocument::from_text("Host bar\nHost foo"),
            "foo",
            &stanza("foo", None, "/k").lines(),
        );

        assert_eq!(out.lines()[1], "#Host foo\n");
        assert_eq!(out.lines()[2], "Host foo\n");
    }

    #[test]
    fn test_idempotent() {
        let new = stanza("foo", Some("bob"), "/new").lines();
        let start = ConfigDocument::from_text("Host foo\n  user alice\nHost bar\n  user b\n");

        let once = rewrite(start, "foo", &new);
        assert_eq!(active_hosts(&once, "foo"), 1);

        let twice = rewrite(once.clone(), "foo", &new);
        assert_eq!(active_hosts(&twice, "foo"), 1);

        // The active block is the same both times; the second run only adds
        // commented lines and the previous block's blank separator.
        let block = |doc: &ConfigDocument| {
            let start = doc.find_stanza("foo").unwrap();
            doc.lines()[start..start + new.len()].to_vec()
        };
        assert_eq!(block(&once), new);
        assert_eq!(block(&twice), new);

        let active = |doc: &ConfigDocument| {
            doc.lines()
                .iter()
                .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
                .cloned()
                .collect::<Vec<_>>()
        };
        assert_eq!(active(&once), active(&twice));
        assert!(twice.to_text().ends_with("Host bar\n  user b\n"));
    }

    #[test]
    fn test_unmanaged_directive_preserved() {
        let out = rewrite(
            ConfigDocument::from_text("Host foo\n    Compression yes\n    user alice\n"),
            "foo",
            &stanza("foo", None, "/k").lines(),
        );

        assert_eq!(out.lines()[1], "    Compression yes\n");
        assert_eq!(out.lines()[2], "#    user alice\n");
    }

    #[test]
    fn test_managed_keywords_any_case_and_indent() {
        let before = "Host foo\n\tUser alice\nHostName 10.0.0.1\n  ProxyCommand ssh j -W x:%p\nport=2222\n  identityfile ~/.ssh/id\n";
        let out = rewrite(
            ConfigDocument::from_text(before),
            "foo",
            &stanza("foo", None, "/k").lines(),
        );

        for line in &out.lines()[..6] {
            assert!(line.starts_with('#'), "not commented: {:?}", line);
        }
    }

    #[test]
    fn test_comments_not_doubled() {
        let out = rewrite(
            ConfigDocument::from_text("Host foo\n#  user old\n  user alice\n"),
            "foo",
            &stanza("foo", None, "/k").lines(),
        );

        assert_eq!(out.lines()[1], "#  user old\n");
        assert_eq!(out.lines()[2], "#  user alice\n");
    }

    #[test]
    fn test_alias_matched_literally() {
        let doc = ConfigDocument::from_text("Host foo.example\n  user a\nHost fooXexample\n  user b\n");

        assert_eq!(doc.find_stanza("foo.example"), Some(0));
        assert_eq!(doc.find_stanza("fooXexample"), Some(2));
        assert_eq!(doc.find_stanza("foo"), None);
        assert_eq!(doc.find_stanza("example"), None);
    }

    #[test]
    fn test_multi_pattern_host_is_not_a_match() {
        let doc = ConfigDocument::from_text("Host foo bar\n  user a\n");
        assert_eq!(doc.find_stanza("foo"), None);

        let out = rewrite(doc, "foo", &stanza("foo", None, "/k").lines());
        assert_eq!(out.lines()[0], "Host foo bar\n");
        assert_eq!(out.lines()[2], "Host foo\n");
    }

    #[test]
    fn test_match_block_ends_region() {
        let out = rewrite(
            ConfigDocument::from_text("Host foo\n  user a\nMatch host foo\n  user c\n"),
            "foo",
            &stanza("foo", None, "/k").lines(),
        );

        assert_eq!(out.lines()[2], "Host foo\n");
        assert!(out.to_text().ends_with("Match host foo\n  user c\n"));
    }

    #[test]
    fn test_hostname_does_not_end_region() {
        let out = rewrite(
            ConfigDocument::from_text("Host foo\n  hostname foo.example\n  Compression yes\n"),
            "foo",
            &stanza("foo", None, "/k").lines(),
        );

        assert_eq!(out.lines()[1], "#  hostname foo.example\n");
        assert_eq!(out.lines()[2], "  Compression yes\n");
        assert_eq!(out.lines()[3], "Host foo\n");
    }

    #[test]
    fn test_crlf_lines_preserved() {
        let before = "Host bar\r\n  user b\r\n";
        let out = rewrite(
            ConfigDocument::from_text(before),
            "foo",
            &stanza("foo", None, "/k").lines(),
        );
        assert!(out.to_text().starts_with(before));

        let out = rewrite(
            ConfigDocument::from_text("Host foo\r\n  user a\r\n"),
            "foo",
            &stanza("foo", None, "/k").lines(),
        );
        assert_eq!(out.lines()[0], "#Host foo\r\n");
    }

    #[test]
    fn test_stanza_line_order() {
        let s = Stanza {
            alias: "db".to_string(),
            host: "10.1.2.3".to_string(),
            user: Some("postgres".to_string()),
            port: "2222".to_string(),
            bastion: Some("jump".to_string()),
            identity_file: PathBuf::from("/home/me/.ssh/auto/postgres@10.1.2.3"),
        };

        assert_eq!(
            s.lines(),
            vec![
                "Host db\n",
                "    ProxyCommand ssh jump -W 10.1.2.3:%p\n",
                "    user postgres\n",
                "    Port 2222\n",
                "    IdentityFile /home/me/.ssh/auto/postgres@10.1.2.3\n",
                "    hostname 10.1.2.3\n",
                "\n",
            ]
        );
    }

    #[test]
    fn test_identity_file_with_spaces_is_quoted() {
        let s = stanza("foo", None, "/home/a b/key");
        assert!(s.lines().contains(&"    IdentityFile \"/home/a b/key\"\n".to_string()));
    }

    #[test]
    fn test_load_missing_is_empty() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let doc = ConfigDocument::load(&temp_dir.path().join("config"))?;
        assert!(doc.is_empty());
        Ok(())
    }

    #[test]
    fn test_persist_new_file_mode() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join(".ssh/config");

        ConfigDocument::from_text("Host foo\n").persist(&path)?;

        assert_eq!(fs::read_to_string(&path)?, "Host foo\n");
        let file_mode = fs::metadata(&path)?.permissions().mode() & 0o777;
        assert_eq!(file_mode, CONFIG_FILE_MODE);
        let dir_mode = fs::metadata(temp_dir.path().join(".ssh"))?.permissions().mode() & 0o777;
        assert_eq!(dir_mode, PRIVATE_DIR_MODE);
        Ok(())
    }

    #[test]
    fn test_persist_keeps_existing_mode() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config");
        fs::write(&path, "Host old\n")?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;

        ConfigDocument::from_text("Host new\n").persist(&path)?;

        assert_eq!(fs::read_to_string(&path)?, "Host new\n");
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o644);
        Ok(())
    }

    #[test]
    fn test_persist_through_symlink() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let real = temp_dir.path().join("dotfiles-config");
        let link = temp_dir.path().join("config");
        fs::write(&real, "Host old\n")?;
        std::os::unix::fs::symlink(&real, &link)?;

        ConfigDocument::from_text("Host new\n").persist(&link)?;

        assert!(link.is_symlink());
        assert_eq!(fs::read_to_string(&real)?, "Host new\n");
        Ok(())
    }

    #[test]
    fn test_update_config_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config");
        let s = stanza("foo", Some("bob"), "/k");

        assert!(!update_config_file(&path, &s)?);
        assert!(update_config_file(&path, &s)?);

        let doc = ConfigDocument::load(&path)?;
        assert_eq!(active_hosts(&doc, "foo"), 1);
        Ok(())
    }
}
