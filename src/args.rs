//! Command-line parsing and settings resolution.
//!
//! Turns `ssh-init [user@]host[:port] [bastion] [-r] [-h alias] [-i identity] [-p]`
//! into a [`ConnectionSettings`]. Malformed input of any kind is reported as
//! [`ArgError::InvalidArgument`] and handed back to `main` rather than
//! exiting from inside the parser.

use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::DEFAULT_PORT;

/// Errors produced while resolving the command line.
#[derive(Debug, Error)]
pub enum ArgError {
    #[error("{0}")]
    InvalidArgument(String),

    /// `--help` or `--version` was requested; not a failure.
    #[error("{0}")]
    Display(clap::Error),

    #[error("failed to read passphrase from terminal")]
    Passphrase(#[source] io::Error),
}

impl ArgError {
    fn invalid(msg: impl Into<String>) -> Self {
        ArgError::InvalidArgument(msg.into())
    }
}

impl From<clap::Error> for ArgError {
    fn from(e: clap::Error) -> Self {
        match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ArgError::Display(e),
            _ => {
                // clap renders "error: <message>\n\nUsage: ..."; keep the message.
                let rendered = e.to_string();
                let msg = rendered
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .trim_start_matches("error: ")
                    .to_string();
                ArgError::InvalidArgument(msg)
            }
        }
    }
}

/// Raw command line.
///
/// The built-in `-h` help flag is disabled because `-h` names the alias;
/// help is only available as `--help`.
#[derive(Parser, Debug)]
#[command(name = "ssh-init")]
#[command(version, about = "Bootstrap passwordless SSH access to a host", long_about = None)]
#[command(disable_help_flag = true)]
pub struct Cli {
    /// Connection string: [user@]host[:port]
    #[arg(value_name = "TARGET")]
    pub target: String,

    /// Jump host to reach TARGET through
    #[arg(value_name = "BASTION")]
    pub bastion: Option<String>,

    /// Also install the key for root on the remote host
    #[arg(short = 'r', long = "root")]
    pub root: bool,

    /// Name of the Host stanza (defaults to the host)
    #[arg(short = 'h', long = "alias", value_name = "NAME")]
    pub alias: Option<String>,

    /// Identity to authenticate with while installing the key
    #[arg(short = 'i', long = "identity", value_name = "PATH")]
    pub identity: Option<PathBuf>,

    /// Prompt for a passphrase to encrypt the new key
    #[arg(short = 'p', long = "passphrase")]
    pub passphrase: bool,

    /// Client config file to rewrite (default: ~/.ssh/config)
    #[arg(long, value_name = "PATH")]
    pub ssh_config: Option<PathBuf>,

    /// Directory for generated keys (default: ~/.ssh/auto)
    #[arg(long, value_name = "DIR")]
    pub key_dir: Option<PathBuf>,

    /// Skip tool and reachability checks
    #[arg(long)]
    pub skip_preflight: bool,

    /// Show debug diagnostics
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    #[allow(dead_code)]
    help: Option<bool>,
}

impl Cli {
    /// Parse a full argument vector (program name first).
    pub fn try_parse_args<I, T>(args: I) -> Result<Self, ArgError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Ok(Cli::try_parse_from(args)?)
    }
}

/// Source of the new key's passphrase.
pub trait PassphraseSource {
    fn prompt(&mut self, message: &str) -> io::Result<String>;
}

/// Reads from the controlling terminal with echo disabled.
pub struct TerminalPrompt;

impl PassphraseSource for TerminalPrompt {
    fn prompt(&mut self, message: &str) -> io::Result<String> {
        rpassword::prompt_password(message)
    }
}

/// Normalized settings for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub user: Option<String>,
    pub host: String,
    pub port: String,
    /// Name of the Host stanza; never empty.
    pub alias: String,
    pub bastion: Option<String>,
    pub want_root: bool,
    pub key_passphrase: Option<String>,
    pub identity_file: Option<PathBuf>,
    /// Private key path, filled in once the key pair exists.
    pub key_path: Option<PathBuf>,
}

impl ConnectionSettings {
    /// Build settings from a parsed command line, prompting for a
    /// passphrase if `-p` was given.
    pub fn resolve(cli: &Cli, prompt: &mut dyn PassphraseSource) -> Result<Self, ArgError> {
        let (user, host, port) = parse_target(&cli.target)?;

        let alias = match &cli.alias {
            Some(alias) => {
                check_word("alias", alias)?;
                alias.clone()
            }
            None => host.clone(),
        };

        if let Some(bastion) = &cli.bastion {
            check_word("bastion", bastion)?;
        }

        let key_passphrase = if cli.passphrase {
            Some(read_passphrase(prompt)?)
        } else {
            None
        };

        Ok(Self {
            user,
            host,
            port,
            alias,
            bastion: cli.bastion.clone(),
            want_root: cli.root,
            key_passphrase,
            identity_file: cli.identity.clone(),
            key_path: None,
        })
    }

    /// `user@host`, or just `host` when no user was given.
    ///
    /// Used both as the ssh login target and as the key pair's name.
    pub fn target(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Whether the login user is already root.
    pub fn is_root_login(&self) -> bool {
        self.user.as_deref() == Some("root")
    }
}

/// Parse the arguments after the program name into settings.
pub fn resolve_args<I, T>(args: I, prompt: &mut dyn PassphraseSource) -> Result<ConnectionSettings, ArgError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let argv = std::iter::once(OsString::from("ssh-init")).chain(args.into_iter().map(Into::into));
    let cli = Cli::try_parse_args(argv)?;
    ConnectionSettings::resolve(&cli, prompt)
}

/// Split `[user@]host[:port]`.
pub fn parse_target(target: &str) -> Result<(Option<String>, String, String), ArgError> {
    let at_parts: Vec<&str> = target.split('@').collect();
    let (user, host_port) = match at_parts.as_slice() {
        [host_port] => (None, *host_port),
        [user, host_port] => {
            check_word("user", user)?;
            (Some(user.to_string()), *host_port)
        }
        _ => return Err(ArgError::invalid(format!("more than one '@' in '{}'", target))),
    };

    let colon_parts: Vec<&str> = host_port.split(':').collect();
    let (host, port) = match colon_parts.as_slice() {
        [host] => (*host, DEFAULT_PORT),
        [host, port] => (*host, *port),
        _ => return Err(ArgError::invalid(format!("more than one ':' in '{}'", target))),
    };

    check_word("host", host)?;

    match port.parse::<u16>() {
        Ok(p) if p > 0 => {}
        _ => return Err(ArgError::invalid(format!("invalid port '{}' in '{}'", port, target))),
    }

    Ok((user, host.to_string(), port.to_string()))
}

/// Reject values that cannot sit on one ssh_config line as a single token.
///
/// Whitespace or control characters would split the value or inject extra
/// directives into the stanza; a leading `-` would be read as an option by
/// `ssh`.
fn check_word(what: &str, value: &str) -> Result<(), ArgError> {
    if value.is_empty() {
        return Err(ArgError::invalid(format!("{} must not be empty", what)));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ArgError::invalid(format!(
            "{} {:?} contains whitespace or control characters",
            what, value
        )));
    }
    if value.starts_with('-') {
        return Err(ArgError::invalid(format!("{} '{}' must not start with '-'", what, value)));
    }
    Ok(())
}

fn read_passphrase(prompt: &mut dyn PassphraseSource) -> Result<String, ArgError> {
    let passphrase = prompt
        .prompt("Passphrase for new key: ")
        .map_err(ArgError::Passphrase)?;
    let confirm = prompt
        .prompt("Confirm passphrase: ")
        .map_err(ArgError::Passphrase)?;

    if passphrase != confirm {
        return Err(ArgError::invalid("passphrases do not match"));
    }
    Ok(passphrase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Answers prompts from a fixed queue.
    struct Scripted(VecDeque<String>);

    impl Scripted {
        fn new(answers: &[&str]) -> Self {
            Self(answers.iter().map(|s| s.to_string()).collect())
        }
    }

    impl PassphraseSource for Scripted {
        fn prompt(&mut self, _message: &str) -> io::Result<String> {
            self.0
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no input"))
        }
    }

    fn resolve(args: &[&str]) -> Result<ConnectionSettings, ArgError> {
        resolve_args(args.iter().copied(), &mut Scripted::new(&[]))
    }

    fn assert_invalid(args: &[&str]) {
        match resolve(args) {
            Err(ArgError::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument for {:?}, got {:?}", args, other),
        }
    }

    #[test]
    fn test_full_connection_string() {
        let s = resolve(&["alice@example.com:2222"]).unwrap();
        assert_eq!(s.user.as_deref(), Some("alice"));
        assert_eq!(s.host, "example.com");
        assert_eq!(s.port, "2222");
    }

    #[test]
    fn test_defaults() {
        let s = resolve(&["example.com"]).unwrap();
        assert_eq!(s.user, None);
        assert_eq!(s.port, "22");
        assert_eq!(s.alias, "example.com");
        assert_eq!(s.bastion, None);
        assert!(!s.want_root);
        assert_eq!(s.key_passphrase, None);
        assert_eq!(s.key_path, None);
    }

    #[test]
    fn test_various_connection_strings() {
        let cases = [
            ("bob@10.0.0.1:22", Some("bob"), "10.0.0.1", "22"),
            ("bob@10.0.0.1", Some("bob"), "10.0.0.1", "22"),
            ("db01:2200", None, "db01", "2200"),
            ("deploy@build-host.internal:65535", Some("deploy"), "build-host.internal", "65535"),
        ];
        for (input, user, host, port) in cases {
            let s = resolve(&[input]).unwrap();
            assert_eq!(s.user.as_deref(), user, "user of {}", input);
            assert_eq!(s.host, host, "host of {}", input);
            assert_eq!(s.port, port, "port of {}", input);
        }
    }

    #[test]
    fn test_flags() {
        let s = resolve(&["-r", "alice@web", "-h", "webbox", "-i", "/tmp/id_admin", "jump.example.com"]).unwrap();
        assert!(s.want_root);
        assert_eq!(s.alias, "webbox");
        assert_eq!(s.identity_file, Some(PathBuf::from("/tmp/id_admin")));
        assert_eq!(s.bastion.as_deref(), Some("jump.example.com"));
        assert_eq!(s.target(), "alice@web");
    }

    #[test]
    fn test_root_flag_alone_is_invalid() {
        assert_invalid(&["-r"]);
    }

    #[test]
    fn test_no_arguments_is_invalid() {
        assert_invalid(&[]);
    }

    #[test]
    fn test_malformed_input_is_invalid() {
        assert_invalid(&["a@b@c"]);
        assert_invalid(&["host:22:23"]);
        assert_invalid(&["@host"]);
        assert_invalid(&["user@"]);
        assert_invalid(&["host:"]);
        assert_invalid(&["host:ssh"]);
        assert_invalid(&["host:0"]);
        assert_invalid(&["host:70000"]);
    }

    #[test]
    fn test_missing_flag_value_is_invalid() {
        assert_invalid(&["host", "-h"]);
        assert_invalid(&["host", "-i"]);
    }

    #[test]
    fn test_unknown_flag_is_invalid() {
        assert_invalid(&["host", "-x"]);
        assert_invalid(&["host", "--frobnicate"]);
    }

    #[test]
    fn test_too_many_positionals_is_invalid() {
        assert_invalid(&["host", "bastion", "extra"]);
    }

    #[test]
    fn test_empty_alias_is_invalid() {
        assert_invalid(&["host", "-h", ""]);
    }

    #[test]
    fn test_values_that_break_the_stanza_are_invalid() {
        assert_invalid(&["db01", "-h", "foo\nProxyCommand nc evil 22"]);
        assert_invalid(&["db01", "-h", "two words"]);
        assert_invalid(&["db01", "--alias=-oProxyCommand=x"]);
        assert_invalid(&["bob@my host"]);
        assert_invalid(&["bob@db01\tx"]);
        assert_invalid(&["b ob@db01"]);
        assert_invalid(&["-bob@db01"]);
        assert_invalid(&["db01", "jump host"]);
        assert_invalid(&["db01", "jump\r"]);
        assert_invalid(&["db01", "--", "-oProxyCommand=x"]);
    }

    #[test]
    fn test_help_is_not_invalid() {
        assert!(matches!(resolve(&["--help"]), Err(ArgError::Display(_))));
    }

    #[test]
    fn test_passphrase_prompt() {
        let mut prompt = Scripted::new(&["s3cret", "s3cret"]);
        let s = resolve_args(["host", "-p"], &mut prompt).unwrap();
        assert_eq!(s.key_passphrase.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_passphrase_mismatch_is_invalid() {
        let mut prompt = Scripted::new(&["one", "two"]);
        let result = resolve_args(["host", "-p"], &mut prompt);
        assert!(matches!(result, Err(ArgError::InvalidArgument(_))));
    }

    #[test]
    fn test_passphrase_read_failure() {
        let mut prompt = Scripted::new(&[]);
        let result = resolve_args(["host", "-p"], &mut prompt);
        assert!(matches!(result, Err(ArgError::Passphrase(_))));
    }

    #[test]
    fn test_target_and_root_login() {
        let s = resolve(&["root@host"]).unwrap();
        assert_eq!(s.target(), "root@host");
        assert!(s.is_root_login());

        let s = resolve(&["host"]).unwrap();
        assert_eq!(s.target(), "host");
        assert!(!s.is_root_login());
    }
}
