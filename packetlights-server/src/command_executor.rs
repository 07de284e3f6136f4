//! External network commands (ping, net-snmp tools)
//!
//! Commands are executed directly, never through a shell, with a timeout.
//! Their arguments come from HTTP query strings, so targets and communities
//! are validated first.

use std::process::Stdio;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;

/// Exit code reported when a command runs out of time
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const IF_NAME_OID: &str = "1.3.6.1.2.1.31.1.1.1.1";
const IF_ADMIN_STATUS_OID: &str = "1.3.6.1.2.1.2.2.1.7";
const IF_OPER_STATUS_OID: &str = "1.3.6.1.2.1.2.2.1.8";

/// Longest accepted hostname
const MAX_TARGET_LEN: usize = 253;

/// Outcome of one command
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CommandResult {
    pub cmd: String,
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    #[must_use]
    pub const fn ok(&self) -> bool {
        self.code == 0
    }
}

/// Reason a request was rejected before anything ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidInput(pub &'static str);

impl std::fmt::Display for InvalidInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for InvalidInput {}

/// Hostname or IP literal; rejects anything a tool could parse as an option
pub fn validate_target(target: &str) -> Result<&str, InvalidInput> {
    let target = target.trim();
    if target.is_empty() {
        return Err(InvalidInput("target required"));
    }
    if target.len() > MAX_TARGET_LEN
        || target.starts_with('-')
        || !target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '_'))
    {
        return Err(InvalidInput("invalid target"));
    }
    Ok(target)
}

pub fn validate_ifindex(ifindex: &str) -> Result<u32, InvalidInput> {
    let ifindex = ifindex.trim();
    if ifindex.is_empty() || !ifindex.chars().all(|c| c.is_ascii_digit()) {
        return Err(InvalidInput("target and numeric ifindex required"));
    }
    ifindex
        .parse()
        .map_err(|_| InvalidInput("target and numeric ifindex required"))
}

pub fn validate_community(community: &str) -> Result<&str, InvalidInput> {
    let community = community.trim();
    if community.is_empty()
        || community.starts_with('-')
        || !community.chars().all(|c| c.is_ascii_graphic())
    {
        return Err(InvalidInput("invalid community"));
    }
    Ok(community)
}

pub fn ping_argv(target: &str) -> Vec<String> {
    ["ping", "-c", "1", "-W", "2", target]
        .iter()
        .map(ToString::to_string)
        .collect()
}

pub fn snmpwalk_argv(community: &str, target: &str, oid: &str) -> Vec<String> {
    ["snmpwalk", "-v2c", "-c", community, target, oid]
        .iter()
        .map(ToString::to_string)
        .collect()
}

/// `snmpset` of ifAdminStatus: 1 = up, 2 = down
pub fn admin_status_argv(community: &str, target: &str, ifindex: u32, up: bool) -> Vec<String> {
    let oid = format!("{IF_ADMIN_STATUS_OID}.{ifindex}");
    let value = if up { "1" } else { "2" };
    ["snmpset", "-v2c", "-c", community, target, &oid, "i", value]
        .iter()
        .map(ToString::to_string)
        .collect()
}

/// `snmpget` of ifOperStatus, always with the read community
pub fn oper_status_argv(target: &str, ifindex: u32) -> Vec<String> {
    let oid = format!("{IF_OPER_STATUS_OID}.{ifindex}");
    ["snmpget", "-v2c", "-c", "public", target, &oid]
        .iter()
        .map(ToString::to_string)
        .collect()
}

pub fn if_names_argv(community: &str, target: &str) -> Vec<String> {
    snmpwalk_argv(community, target, IF_NAME_OID)
}

pub fn if_admin_argv(community: &str, target: &str) -> Vec<String> {
    snmpwalk_argv(community, target, IF_ADMIN_STATUS_OID)
}

pub fn if_oper_argv(community: &str, target: &str) -> Vec<String> {
    snmpwalk_argv(community, target, IF_OPER_STATUS_OID)
}

/// Run `argv` without a shell, killing it after `timeout`
pub async fn run(argv: &[String], timeout: Duration) -> CommandResult {
    let cmd = argv.join(" ");
    let Some((program, args)) = argv.split_first() else {
        return CommandResult {
            cmd,
            code: -1,
            stdout: String::new(),
            stderr: "empty command".to_string(),
        };
    };

    debug!("Running: {cmd}");
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let result = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => CommandResult {
            cmd,
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        },
        Ok(Err(e)) => {
            warn!("Failed to run {program}: {e}");
            let code = if e.kind() == std::io::ErrorKind::NotFound {
                127
            } else {
                -1
            };
            CommandResult {
                cmd,
                code,
                stdout: String::new(),
                stderr: e.to_string(),
            }
        }
        Err(_) => CommandResult {
            cmd,
            code: TIMEOUT_EXIT_CODE,
            stdout: String::new(),
            stderr: format!("timeout after {}s", timeout.as_secs()),
        },
    };
    info!("{program} exited with {}", result.code);
    result
}
