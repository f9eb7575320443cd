//! ssh-init library.
//!
//! Bootstraps passwordless SSH access to a host: a dedicated key pair, a
//! `Host` stanza in the client config, and the public key installed in the
//! remote `authorized_keys`. The stanza rewriter in [`stanza`] is the part
//! with real logic; key generation and remote installation call out to
//! `ssh-keygen` and `ssh`.

pub mod args;
pub mod config;
pub mod install;
pub mod keygen;
pub mod preflight;
pub mod process;
pub mod stanza;
