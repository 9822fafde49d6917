//! Firewall reconciliation for per-instance client whitelists
//!
//! The desired rule set is every whitelisted address paired with the port of
//! the instance it was recorded for. Each pass diffs the firewall chain against
//! it and applies only the difference, so passes are idempotent and cheap to
//! trigger after every API call that changes the whitelist.
//!
//! The chain has to be jumped to from `INPUT` by the operator; this module
//! only manages the rules inside it.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use draupnir_common::{DraupnirError, InstanceId, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, instrument, warn};

use crate::process::{command, run};
use crate::records::RecordStore;

pub const DEFAULT_CHAIN: &str = "DRAUPNIR-WHITELIST";

/// One ACCEPT rule: new TCP connections from `source` to `port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FirewallRule {
    pub source: IpAddr,
    pub port: u16,
    pub instance_id: InstanceId,
}

#[async_trait]
pub trait Firewall: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether rules for this address family can be expressed at all
    fn supports(&self, address: &IpAddr) -> bool {
        let _ = address;
        true
    }

    async fn ensure_chain(&self) -> anyhow::Result<()>;

    /// Rules currently in the managed chain
    async fn rules(&self) -> anyhow::Result<Vec<FirewallRule>>;

    async fn add(&self, rule: &FirewallRule) -> anyhow::Result<()>;

    async fn remove(&self, rule: &FirewallRule) -> anyhow::Result<()>;
}

/// `iptables` chain holding one ACCEPT rule per whitelisted address.
///
/// IPv4 only; IPv6 clients are skipped by the reconciler.
pub struct IptablesFirewall {
    chain: String,
    use_sudo: bool,
}

impl IptablesFirewall {
    pub fn new(chain: impl Into<String>, use_sudo: bool) -> Self {
        Self {
            chain: chain.into(),
            use_sudo,
        }
    }

    fn rule_args(&self, action: &str, rule: &FirewallRule) -> Vec<String> {
        vec![
            action.to_string(),
            self.chain.clone(),
            "-p".into(),
            "tcp".into(),
            "-m".into(),
            "state".into(),
            "--state".into(),
            "NEW".into(),
            "-s".into(),
            rule.source.to_string(),
            "--dport".into(),
            rule.port.to_string(),
            "-m".into(),
            "comment".into(),
            "--comment".into(),
            format!("instance: {}", rule.instance_id),
            "-j".into(),
            "ACCEPT".into(),
        ]
    }
}

#[async_trait]
impl Firewall for IptablesFirewall {
    fn name(&self) -> &'static str {
        "iptables"
    }

    fn supports(&self, address: &IpAddr) -> bool {
        address.is_ipv4()
    }

    async fn ensure_chain(&self) -> anyhow::Result<()> {
        let mut list = command("iptables", self.use_sudo);
        list.args(["-S", &self.chain]);
        if run(list, "iptables list chain").await.is_ok() {
            return Ok(());
        }
        let mut create = command("iptables", self.use_sudo);
        create.args(["-N", &self.chain]);
        run(create, "iptables create chain").await?;
        info!(chain = %self.chain, "created whitelist chain");
        Ok(())
    }

    async fn rules(&self) -> anyhow::Result<Vec<FirewallRule>> {
        let mut cmd = command("iptables", self.use_sudo);
        cmd.args(["-S", &self.chain]);
        let output = run(cmd, "iptables list rules").await?;
        let listing = String::from_utf8(output.stdout).context("iptables output is not UTF-8")?;
        Ok(parse_rules(&listing, &self.chain))
    }

    async fn add(&self, rule: &FirewallRule) -> anyhow::Result<()> {
        let mut cmd = command("iptables", self.use_sudo);
        cmd.args(self.rule_args("-A", rule));
        run(cmd, "iptables append rule").await?;
        Ok(())
    }

    async fn remove(&self, rule: &FirewallRule) -> anyhow::Result<()> {
        let mut cmd = command("iptables", self.use_sudo);
        cmd.args(self.rule_args("-D", rule));
        run(cmd, "iptables delete rule").await?;
        Ok(())
    }
}

/// Parse `iptables -S <chain>` output, keeping only rules this module wrote.
pub fn parse_rules(listing: &str, chain: &str) -> Vec<FirewallRule> {
    let prefix = format!("-A {chain} ");
    listing
        .lines()
        .filter_map(|line| line.strip_prefix(&prefix))
        .filter_map(|rule| match parse_rule(rule) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(rule, error = %e, "ignoring unmanaged firewall rule");
                None
            }
        })
        .collect()
}

fn parse_rule(rule: &str) -> anyhow::Result<FirewallRule> {
    let tokens: Vec<&str> = rule.split_whitespace().collect();
    let value_after = |flag: &str| {
        tokens
            .iter()
            .position(|t| *t == flag)
            .and_then(|i| tokens.get(i + 1))
            .copied()
            .ok_or_else(|| anyhow!("missing {flag}"))
    };

    let source = value_after("-s")?;
    let source: IpAddr = source
        .strip_suffix("/32")
        .unwrap_or(source)
        .parse()
        .with_context(|| format!("bad source {source}"))?;
    let port: u16 = value_after("--dport")?.parse().context("bad port")?;

    let (_, comment) = rule
        .split_once("instance: ")
        .ok_or_else(|| anyhow!("missing instance comment"))?;
    let instance_id: InstanceId = comment
        .trim_start()
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or_default()
        .parse()
        .context("bad instance id in comment")?;

    Ok(FirewallRule {
        source,
        port,
        instance_id,
    })
}

/// Rules added and removed by one pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub added: Vec<FirewallRule>,
    pub removed: Vec<FirewallRule>,
}

/// Keeps the firewall chain in line with the whitelist records.
pub struct Whitelister {
    records: Arc<dyn RecordStore>,
    firewall: Arc<dyn Firewall>,
    wake: Notify,
    pass: Mutex<()>,
}

impl Whitelister {
    pub fn new(records: Arc<dyn RecordStore>, firewall: Arc<dyn Firewall>) -> Self {
        Self {
            records,
            firewall,
            wake: Notify::new(),
            pass: Mutex::new(()),
        }
    }

    /// Ask the background loop for a pass. Requests made while one is
    /// pending collapse into it.
    pub fn trigger(&self, source: &str) {
        debug!(source, "whitelist reconcile requested");
        self.wake.notify_one();
    }

    /// Bring the chain in line with the records.
    ///
    /// Individual rule failures are logged and skipped so one bad rule does
    /// not hold back the rest; the next pass retries them.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, source: &str) -> Result<ReconcileOutcome> {
        let _pass = self.pass.lock().await;
        let start = Instant::now();

        self.firewall
            .ensure_chain()
            .await
            .map_err(|e| firewall_error("prepare chain", e))?;

        let desired = self.desired_rules().await?;
        let existing: BTreeSet<FirewallRule> = self
            .firewall
            .rules()
            .await
            .map_err(|e| firewall_error("list rules", e))?
            .into_iter()
            .collect();

        let mut outcome = ReconcileOutcome::default();
        for rule in desired.difference(&existing) {
            match self.firewall.add(rule).await {
                Ok(()) => outcome.added.push(rule.clone()),
                Err(e) => error!(rule = ?rule, error = %e, "failed to add whitelist rule"),
            }
        }
        for rule in existing.difference(&desired) {
            match self.firewall.remove(rule).await {
                Ok(()) => outcome.removed.push(rule.clone()),
                Err(e) => error!(rule = ?rule, error = %e, "failed to remove whitelist rule"),
            }
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        if outcome.added.is_empty() && outcome.removed.is_empty() {
            debug!(elapsed_ms, "whitelist already in sync");
        } else {
            info!(
                added = outcome.added.len(),
                removed = outcome.removed.len(),
                elapsed_ms,
                "reconciled whitelist"
            );
        }
        Ok(outcome)
    }

    async fn desired_rules(&self) -> Result<BTreeSet<FirewallRule>> {
        let ports: BTreeMap<InstanceId, u16> = self
            .records
            .list_instances()
            .await?
            .into_iter()
            .map(|instance| (instance.id, instance.port))
            .collect();

        let mut desired = BTreeSet::new();
        for address in self.records.list_whitelisted_addresses().await? {
            let Some(&port) = ports.get(&address.instance_id) else {
                continue;
            };
            if !self.firewall.supports(&address.ip_address) {
                debug!(ip = %address.ip_address, firewall = self.firewall.name(), "address family not supported");
                continue;
            }
            desired.insert(FirewallRule {
                source: address.ip_address,
                port,
                instance_id: address.instance_id,
            });
        }
        Ok(desired)
    }

    /// Reconcile on every tick and whenever [`Whitelister::trigger`] fires.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        info!(interval_secs = interval.as_secs(), firewall = self.firewall.name(), "whitelist reconciler started");
        loop {
            let source = tokio::select! {
                _ = ticker.tick() => "timer",
                _ = self.wake.notified() => "trigger",
            };
            if let Err(e) = self.reconcile(source).await {
                error!(source, error = %e, "whitelist reconcile failed");
            }
        }
    }
}

fn firewall_error(action: &str, err: anyhow::Error) -> DraupnirError {
    DraupnirError::Storage(format!("firewall {action} failed: {err:#}"))
}
