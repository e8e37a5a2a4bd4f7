//! Firewall adapter: the only place this crate shells out to a subprocess.
//!
//! Grounded on `mitigator.rs`'s `vpp_exec`/`bird_exec` pattern: spawn,
//! await with a hard timeout, log and degrade on failure rather than
//! panic. The default adapter shells to `iptables`/`ip6tables`; tests use
//! an in-memory adapter behind the same trait.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

use crate::error::{IpsError, IpsResult};

const EXEC_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the `IDS_Block_<addr_escaped>` rule name for `addr`, per spec
/// §4.7. Dots are escaped to underscores so the name survives as a single
/// shell token and as an `iptables` chain/comment identifier.
pub fn rule_name(addr: IpAddr) -> String {
    format!("IDS_Block_{}", addr.to_string().replace(['.', ':'], "_"))
}

/// Reverse `rule_name`, accepting only names that decode to a strict IP
/// literal. Used when reconciling firewall state at startup: rule names
/// read back from the live ruleset must never be treated as arbitrary
/// data, only as IP addresses.
pub fn parse_rule_name(name: &str) -> Option<IpAddr> {
    let rest = name.strip_prefix("IDS_Block_")?;
    // IPv4 dotted-quad rules are stored with underscores in place of dots;
    // IPv6 rule names (colons escaped to underscores) are not reversible
    // without ambiguity (`::` collapses indistinguishably from a run of
    // single colons) so only IPv4 round-trips here.
    let dotted = rest.replace('_', ".");
    dotted.parse::<std::net::Ipv4Addr>().ok().map(IpAddr::V4)
}

/// Firewall rule operations the defense module needs. Kept minimal and
/// idempotent: applying an already-applied rule, or retracting an
/// already-absent one, is not an error.
#[async_trait]
pub trait FirewallAdapter: Send + Sync {
    async fn block(&self, addr: IpAddr) -> IpsResult<()>;
    async fn unblock(&self, addr: IpAddr) -> IpsResult<()>;
    async fn rate_limit(&self, addr: IpAddr, packets_per_second: u32) -> IpsResult<()>;
    /// Confirm the rule for `addr` is actually present in the live
    /// ruleset, not just that `block` returned success.
    async fn verify_blocked(&self, addr: IpAddr) -> IpsResult<bool>;

    /// List the addresses this adapter currently believes are blocked, by
    /// scanning for rules named with the `IDS_Block_*` prefix. Used at
    /// startup to reconcile with the JSON block history. The default
    /// implementation reports nothing blocked, which is correct for
    /// adapters (like test mocks) that don't persist rules independently
    /// of the process.
    async fn scan_blocked(&self) -> IpsResult<Vec<IpAddr>> {
        Ok(Vec::new())
    }
}

async fn run_with_timeout(mut cmd: Command, label: &str) -> IpsResult<()> {
    let output = timeout(EXEC_TIMEOUT, cmd.output()).await;
    match output {
        Err(_) => {
            warn!(label, "firewall command timed out after {EXEC_TIMEOUT:?}");
            Err(IpsError::transient(format!("{label} timed out")))
        }
        Ok(Err(e)) => {
            warn!(label, error = %e, "failed to spawn firewall command");
            Err(IpsError::transient(format!("{label} spawn failed: {e}")))
        }
        Ok(Ok(out)) if !out.status.success() => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            warn!(label, status = ?out.status, stderr = %stderr, "firewall command exited non-zero");
            Err(IpsError::recoverable(format!(
                "{label} exited with {:?}: {stderr}",
                out.status
            )))
        }
        Ok(Ok(_)) => Ok(()),
    }
}

fn iptables_bin(addr: IpAddr) -> &'static str {
    if addr.is_ipv6() {
        "ip6tables"
    } else {
        "iptables"
    }
}

/// Shells to `iptables`/`ip6tables` to manage a single DROP chain rule per
/// blocked source and a `limit` match rule for rate limiting.
pub struct IptablesAdapter {
    chain: String,
}

impl IptablesAdapter {
    pub fn new(chain: impl Into<String>) -> Self {
        Self { chain: chain.into() }
    }
}

impl Default for IptablesAdapter {
    fn default() -> Self {
        Self::new("IPS_BLOCK")
    }
}

#[async_trait]
impl FirewallAdapter for IptablesAdapter {
    async fn block(&self, addr: IpAddr) -> IpsResult<()> {
        let bin = iptables_bin(addr);
        let name = rule_name(addr);

        // Inbound: drop traffic sourced from addr.
        let mut inbound = Command::new(bin);
        inbound
            .args(["-I", &self.chain, "-s"])
            .arg(addr.to_string())
            .args(["-m", "comment", "--comment"])
            .arg(&name)
            .args(["-j", "DROP"]);
        run_with_timeout(inbound, "iptables block inbound").await?;

        // Outbound: drop traffic destined to addr, so an isolated host
        // can't be reached even via a response to traffic it didn't send.
        let mut outbound = Command::new(bin);
        outbound
            .args(["-I", &self.chain, "-d"])
            .arg(addr.to_string())
            .args(["-m", "comment", "--comment"])
            .arg(&name)
            .args(["-j", "DROP"]);
        run_with_timeout(outbound, "iptables block outbound").await
    }

    async fn unblock(&self, addr: IpAddr) -> IpsResult<()> {
        let bin = iptables_bin(addr);
        let name = rule_name(addr);

        let mut inbound = Command::new(bin);
        inbound
            .args(["-D", &self.chain, "-s"])
            .arg(addr.to_string())
            .args(["-m", "comment", "--comment"])
            .arg(&name)
            .args(["-j", "DROP"]);
        run_with_timeout(inbound, "iptables unblock inbound").await.ok();

        let mut outbound = Command::new(bin);
        outbound
            .args(["-D", &self.chain, "-d"])
            .arg(addr.to_string())
            .args(["-m", "comment", "--comment"])
            .arg(&name)
            .args(["-j", "DROP"]);
        run_with_timeout(outbound, "iptables unblock outbound").await
    }

    async fn rate_limit(&self, addr: IpAddr, packets_per_second: u32) -> IpsResult<()> {
        let bin = iptables_bin(addr);
        let mut cmd = Command::new(bin);
        cmd.args(["-I", &self.chain, "-s"])
            .arg(addr.to_string())
            .args(["-m", "limit", "--limit"])
            .arg(format!("{packets_per_second}/second"))
            .args(["-j", "ACCEPT"]);
        run_with_timeout(cmd, "iptables rate-limit").await
    }

    async fn verify_blocked(&self, addr: IpAddr) -> IpsResult<bool> {
        let bin = iptables_bin(addr);
        let out = timeout(
            EXEC_TIMEOUT,
            Command::new(bin)
                .args(["-C", &self.chain, "-s"])
                .arg(addr.to_string())
                .args(["-j", "DROP"])
                .output(),
        )
        .await
        .map_err(|_| IpsError::transient("iptables verify timed out"))?
        .map_err(|e| IpsError::transient(format!("iptables verify spawn failed: {e}")))?;
        Ok(out.status.success())
    }

    async fn scan_blocked(&self) -> IpsResult<Vec<IpAddr>> {
        let bin = "iptables";
        let out = timeout(
            EXEC_TIMEOUT,
            Command::new(bin).args(["-S", &self.chain]).output(),
        )
        .await
        .map_err(|_| IpsError::transient("iptables scan timed out"))?
        .map_err(|e| IpsError::transient(format!("iptables scan spawn failed: {e}")))?;

        if !out.status.success() {
            return Ok(Vec::new());
        }

        let text = String::from_utf8_lossy(&out.stdout);
        let addrs = text
            .lines()
            .filter_map(|line| {
                line.split_whitespace()
                    .skip_while(|tok| *tok != "--comment")
                    .nth(1)
                    .and_then(parse_rule_name)
            })
            .collect();
        Ok(addrs)
    }
}
