//! ssh-init CLI
//!
//! Sets up key-based SSH access to a host in one step.
//!
//! # Usage
//!
//! ```bash
//! # Key for bob@db01, stanza "Host db01" in ~/.ssh/config
//! ssh-init bob@db01
//!
//! # Non-standard port, custom alias, reached through a jump host
//! ssh-init bob@10.0.4.12:2222 jump.example.com -h db
//!
//! # Also install the key for root, authenticating with an existing key
//! ssh-init admin@web01 -r -i ~/.ssh/id_admin
//!
//! # Encrypt the new key with a passphrase
//! ssh-init bob@db01 -p
//! ```
//!
//! # Steps
//!
//! | Step | Effect |
//! |------|--------|
//! | Preflight | `ssh`/`ssh-keygen` present, target port reachable |
//! | Key | `~/.ssh/auto/<user@host>` generated with `ssh-keygen` |
//! | Config | `Host <alias>` stanza rewritten in `~/.ssh/config` |
//! | Install | public key appended to the remote `authorized_keys` |
//! | Root | same for root through `sudo` (with `-r`) |

use anyhow::{bail, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ssh_init::args::{ArgError, Cli, ConnectionSettings, TerminalPrompt};
use ssh_init::config::SshPaths;
use ssh_init::install::{install_all, InstallRequest, Installer};
use ssh_init::keygen;
use ssh_init::preflight::PreflightChecker;
use ssh_init::stanza::{update_config_file, Stanza};

const USAGE: &str = "usage: ssh-init [user@]host[:port] [bastion] [-r] [-h alias] [-i identity_path] [-p]";

fn main() {
    let cli = match Cli::try_parse_args(std::env::args_os()) {
        Ok(cli) => cli,
        Err(e) => exit_on_arg_error(e),
    };

    init_logging(cli.verbose);

    let settings = match ConnectionSettings::resolve(&cli, &mut TerminalPrompt) {
        Ok(settings) => settings,
        Err(e) => exit_on_arg_error(e),
    };

    match run(&cli, settings) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn exit_on_arg_error(e: ArgError) -> ! {
    match e {
        ArgError::Display(e) => e.exit(),
        ArgError::InvalidArgument(msg) => {
            eprintln!("Error: {}", msg);
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
        e @ ArgError::Passphrase(_) => {
            eprintln!("Error: {:#}", anyhow::Error::new(e));
            std::process::exit(1);
        }
    }
}

/// Initialize logging
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Run every step. Returns `Ok(false)` if a remote install step failed.
fn run(cli: &Cli, mut settings: ConnectionSettings) -> Result<bool> {
    let paths = SshPaths::discover()?.with_overrides(cli.ssh_config.clone(), cli.key_dir.clone());
    let target = settings.target();

    println!("=== ssh-init {} ===\n", target);

    // 1. Preflight
    if !cli.skip_preflight {
        preflight(&settings)?;
        println!();
    }

    // 2. Key pair
    paths.ensure_ssh_dir()?;
    println!("Generating key pair...");
    let passphrase = settings.key_passphrase.as_deref().unwrap_or_default();
    let pair = keygen::generate_key_pair(&paths.key_dir, &target, passphrase)?;
    println!("  Key: {}", pair.private.display());
    settings.key_path = Some(pair.private.clone());

    // 3. Client config
    println!("\nUpdating {}...", paths.config_file.display());
    let stanza = Stanza::from_settings(&settings, &pair.private);
    let replaced = update_config_file(&paths.config_file, &stanza)
        .with_context(|| format!("Failed to update stanza for '{}'", settings.alias))?;
    if replaced {
        println!("  Replaced Host {} (old directives commented out)", settings.alias);
    } else {
        println!("  Added Host {}", settings.alias);
    }

    // 4. Remote install (5. root, with -r)
    println!();
    let public_key = pair.read_public()?;
    let request = InstallRequest::from_settings(&settings, public_key);
    let all_ok = install_all(
        &Installer::default(),
        &request,
        settings.want_root,
        settings.is_root_login(),
    )?;

    if all_ok {
        println!("\n=== Done ===");
        println!("  Connect with: ssh {}", settings.alias);
    } else {
        println!("\n=== Finished with errors ===");
        println!("  Config and key are in place; install the key manually or re-run.");
    }

    Ok(all_ok)
}

fn preflight(settings: &ConnectionSettings) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime for preflight checks")?;

    let checker = PreflightChecker::new(&settings.host, &settings.port, settings.bastion.clone());
    let report = runtime.block_on(checker.run_all());
    report.print_summary();

    if !report.is_ok() {
        bail!("{} preflight check(s) failed", report.errors().len());
    }
    Ok(())
}
