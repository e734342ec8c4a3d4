//! NAT redirect for DNS traffic leaving the namespace.
//!
//! Appends four rules to the `nat` table's `OUTPUT` chain:
//!
//! ```text
//! -p udp --dport 53 -m mark --mark 0x1 -j RETURN
//! -p tcp --dport 53 -m mark --mark 0x1 -j RETURN
//! -p udp --dport 53 -j REDIRECT --to-port <port>
//! -p tcp --dport 53 -j REDIRECT --to-port <port>
//! ```
//!
//! iptables evaluates rules in insertion order and the first match wins, so
//! the two `RETURN` rules must land before the two `REDIRECT` rules or the
//! proxy's own marked upstream queries get redirected back into it.
//!
//! Requires `CAP_NET_ADMIN` in the namespace. Rules are appended, never
//! checked or removed: calling [`install_redirect`] twice duplicates them, and
//! a failure part-way leaves the earlier rules installed.

use std::io;
use std::process::Command;

use tracing::{debug, info};

use crate::error::InstallError;
use crate::mark::bypass_mark_arg;
use crate::transport::Protocol;

const IPTABLES: &str = "iptables";
const NAT_TABLE: &str = "nat";
const OUTPUT_CHAIN: &str = "OUTPUT";
const DNS_PORT: &str = "53";

/// What a matching packet is made to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTarget {
    /// Leave the chain untouched (marked traffic).
    Bypass,
    /// Rewrite the destination to the local proxy port.
    Redirect { port: u16 },
}

/// One `OUTPUT` chain rule for DNS traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectRule {
    pub protocol: Protocol,
    pub target: RuleTarget,
}

impl RedirectRule {
    /// The rule body, as it appears after `-A OUTPUT` (and in `iptables -S`).
    pub fn spec(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-p", self.protocol.name(), "--dport", DNS_PORT]
            .into_iter()
            .map(String::from)
            .collect();

        match self.target {
            RuleTarget::Bypass => {
                args.extend(["-m", "mark", "--mark"].map(String::from));
                args.push(bypass_mark_arg());
                args.extend(["-j", "RETURN"].map(String::from));
            }
            RuleTarget::Redirect { port } => {
                args.extend(["-j", "REDIRECT", "--to-port"].map(String::from));
                args.push(port.to_string());
            }
        }

        args
    }

    /// Full argument list for appending this rule.
    pub fn append_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-t", NAT_TABLE, "-A", OUTPUT_CHAIN]
            .into_iter()
            .map(String::from)
            .collect();
        args.extend(self.spec());
        args
    }
}

/// The rule set for `port`, in installation order.
pub fn redirect_rules(port: u16) -> [RedirectRule; 4] {
    [
        RedirectRule {
            protocol: Protocol::Udp,
            target: RuleTarget::Bypass,
        },
        RedirectRule {
            protocol: Protocol::Tcp,
            target: RuleTarget::Bypass,
        },
        RedirectRule {
            protocol: Protocol::Udp,
            target: RuleTarget::Redirect { port },
        },
        RedirectRule {
            protocol: Protocol::Tcp,
            target: RuleTarget::Redirect { port },
        },
    ]
}

/// Result of running an external command to completion.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// stdout followed by stderr, lossily decoded.
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text.trim().to_string()
    }

    fn status(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "signal".to_string(),
        }
    }
}

/// Runs an external program synchronously and captures its output.
pub trait CommandRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

/// [`CommandRunner`] backed by real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Install the DNS redirect to `port`. Stops at the first failing rule.
pub fn install_redirect<R>(runner: &R, port: u16) -> Result<(), InstallError>
where
    R: CommandRunner + ?Sized,
{
    if port == 0 {
        return Err(InstallError::InvalidPort(port));
    }

    for rule in redirect_rules(port) {
        run_iptables(runner, &rule.append_args())?;
    }

    info!("installed DNS redirect to port {}", port);

    Ok(())
}

/// List the `nat` `OUTPUT` chain as `iptables -S` prints it.
pub fn list_output_rules<R>(runner: &R) -> Result<Vec<String>, InstallError>
where
    R: CommandRunner + ?Sized,
{
    let args: Vec<String> = ["-t", NAT_TABLE, "-S", OUTPUT_CHAIN]
        .into_iter()
        .map(String::from)
        .collect();
    let output = run_iptables(runner, &args)?;

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}

fn run_iptables<R>(runner: &R, args: &[String]) -> Result<CommandOutput, InstallError>
where
    R: CommandRunner + ?Sized,
{
    let command = format!("{} {}", IPTABLES, args.join(" "));
    debug!("Running: {}", command);

    let output = runner
        .run(IPTABLES, args)
        .map_err(|source| InstallError::Spawn {
            command: command.clone(),
            source,
        })?;

    if !output.success {
        return Err(InstallError::CommandFailed {
            status: output.status(),
            output: output.combined(),
            command,
        });
    }

    Ok(output)
}
