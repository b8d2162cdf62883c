//! Subtree health walk with ghost-filling.
//!
//! The walk drives a streaming health RPC against each reachable rank and
//! renders a tree-shaped report.  Ranks hidden behind an offline or lost
//! ancestor cannot be probed; unless disabled, the walk synthesizes their
//! entries from the static topology, marked as ghosts and carrying the
//! ancestor's status.

use std::io::Write;
use std::pin::Pin;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use serde::Deserialize;
use serde_json::json;

use flux_core::{Handle, Message, RpcFlags, unpack_payload};

use crate::fsd;
use crate::hosts::HostMap;
use crate::idset::IdSet;
use crate::topology::{OverlayCtx, Topology};

const ANSI_DEFAULT: &str = "\x1b[39m";
const ANSI_RED: &str = "\x1b[31m";
const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_BLUE_BOLD: &str = "\x1b[01;34m";
const ANSI_RESET: &str = "\x1b[0m";
const ANSI_DARK_GRAY: &str = "\x1b[90m";

pub const WAIT_STATES: &[&str] = &["full", "partial", "degraded", "offline", "lost"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    Pipe,
    Tee,
    Elbow,
    Blank,
    Nil,
}

impl Connector {
    fn as_str(self) -> &'static str {
        match self {
            Connector::Pipe => "│  ",
            Connector::Tee => "├─ ",
            Connector::Elbow => "└─ ",
            Connector::Blank => "   ",
            Connector::Nil => "",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HealthResponse {
    pub rank: u32,
    pub status: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub children: Vec<HealthChild>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HealthChild {
    pub rank: u32,
    pub status: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub error: Option<String>,
}

/// One row of the report.
pub struct StatusNode {
    pub rank: u32,
    pub subtree_ranks: Option<IdSet>,
    pub status: String,
    pub duration: f64,
    pub ghost: bool,
    pub connector: Connector,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct StatusOptions {
    pub verbose: i32,
    /// `None` disables the per-probe timeout.
    pub timeout: Option<Duration>,
    pub color: bool,
    pub no_pretty: bool,
    pub no_ghost: bool,
    pub wait: Option<String>,
    pub highlight: IdSet,
}

impl Default for StatusOptions {
    fn default() -> Self {
        StatusOptions {
            verbose: 0,
            timeout: Some(Duration::from_millis(500)),
            color: false,
            no_pretty: false,
            no_ghost: false,
            wait: None,
            highlight: IdSet::new(),
        }
    }
}

/// Which rows to print and which subtrees to descend into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    /// Root subtree status only.
    Summary,
    /// Descend into partial/degraded subtrees, print the non-full nodes.
    Down,
    /// Print every node, descend everywhere alive.
    All,
}

pub struct Status<'a, W: Write> {
    ctx: &'a OverlayCtx,
    opts: StatusOptions,
    hostmap: HostMap,
    out: &'a mut W,
    stack: Vec<Connector>,
    rpc_start: Instant,
}

type MapFn<W> = fn(&mut Status<'_, W>, &StatusNode, bool, usize) -> bool;

/// Walk the subtree rooted at `rank` and render the report into `out`.
pub async fn status_report<W: Write>(
    ctx: &OverlayCtx,
    opts: StatusOptions,
    rank: u32,
    filter: StatusFilter,
    out: &mut W,
) -> Result<()> {
    if let Some(wait) = &opts.wait
        && !WAIT_STATES.contains(&wait.as_str())
    {
        bail!("invalid --wait state {:?}", wait);
    }
    let hostmap = ctx.hostmap().await?;
    let mut st = Status {
        ctx,
        opts,
        hostmap,
        out,
        stack: Vec::new(),
        rpc_start: Instant::now(),
    };
    let fun: MapFn<W> = match filter {
        StatusFilter::Summary => show_top::<W>,
        StatusFilter::Down => show_badtrees::<W>,
        StatusFilter::All => show_all::<W>,
    };
    healthwalk(&mut st, rank, 0, Connector::Nil, fun).await?;
    Ok(())
}

/// Resolve `--highlight` targets (rank idsets or hostlists) into ranks,
/// rejecting ranks outside the instance.
pub async fn highlight_ranks(ctx: &OverlayCtx, targets: &[String]) -> Result<IdSet> {
    let size: u32 = ctx.handle().attr_fetch("size").await?.parse()?;
    let all = IdSet::range(0, size - 1);
    let mut ids = IdSet::new();
    for target in targets {
        let idset = match IdSet::decode(target) {
            Ok(idset) => idset,
            Err(_) => {
                let map = ctx.hostmap().await?;
                IdSet::decode(&map.lookup(target)?)?
            }
        };
        ids.add_all(&idset);
    }
    let outside = ids.difference(&all);
    if !outside.is_empty() {
        bail!(
            "--highlight: rank{} {} not in set {}",
            if outside.len() > 1 { "s" } else { "" },
            outside.encode(),
            all.encode()
        );
    }
    Ok(ids)
}

/// Probe one rank, resetting a streaming RPC until the awaited state
/// arrives, all within the timeout budget.  The error string is what the
/// report prints for an unreachable rank.
pub(crate) async fn health_rpc(
    handle: &Handle,
    rank: u32,
    wait: Option<&str>,
    timeout: Option<Duration>,
) -> std::result::Result<HealthResponse, String> {
    let mut msg = Message::request("overlay.health").map_err(|e| e.to_string())?;
    let mut flags = RpcFlags::empty();
    if let Some(wait) = wait {
        msg.pack(&json!({ "wait": wait })).map_err(|e| e.to_string())?;
        flags = RpcFlags::STREAMING;
    }
    let rpc = handle
        .rpc_message(msg, rank, flags)
        .await
        .map_err(|e| e.to_string())?;
    let start = Instant::now();
    loop {
        let outcome = match timeout {
            Some(budget) => {
                let left = budget.saturating_sub(start.elapsed());
                rpc.wait_within(left).await
            }
            None => rpc.get().await,
        };
        let payload = outcome
            .map_err(|e| e.to_display_string())?
            .ok_or_else(|| "health response has no payload".to_string())?;
        let resp: HealthResponse =
            unpack_payload(&payload).map_err(|e| e.to_display_string())?;
        match wait {
            Some(wait) if wait != resp.status => rpc.reset(),
            _ => return Ok(resp),
        }
    }
}

/// Probe `rank` and map `fun` over it and its children, recursing where
/// `fun` says to.  `Ok(false)` means the probe failed and the caller
/// already saw the error line; a failure at level 0 is fatal.
fn healthwalk<'a, 'b: 'a, W: Write>(
    st: &'a mut Status<'b, W>,
    rank: u32,
    level: usize,
    connector: Connector,
    fun: MapFn<W>,
) -> Pin<Box<dyn Future<Output = Result<bool>> + 'a>> {
    Box::pin(async move {
        st.rpc_start = Instant::now();
        let wait = st.opts.wait.clone();
        let resp =
            match health_rpc(st.ctx.handle(), rank, wait.as_deref(), st.opts.timeout).await {
                Ok(resp) => resp,
                Err(errtext) => {
                    if level == 0 {
                        bail!("{}", errtext);
                    }
                    let probe = StatusNode {
                        rank,
                        subtree_ranks: None,
                        status: String::new(),
                        duration: -1.0,
                        ghost: false,
                        connector,
                        error: String::new(),
                    };
                    let indent = st.indent(level);
                    let name = st.name(&probe);
                    let rpctime = st.rpctime();
                    let _ = writeln!(
                        st.out,
                        "{}{}{}: {}{}",
                        indent,
                        connector.as_str(),
                        name,
                        errtext,
                        rpctime
                    );
                    return Ok(false);
                }
            };

        let node = StatusNode {
            rank: resp.rank,
            subtree_ranks: st.ctx.subtree_ranks(resp.rank).await.ok(),
            status: resp.status.clone(),
            duration: resp.duration,
            ghost: false,
            connector,
            error: String::new(),
        };
        if !fun(st, &node, true, level) {
            return Ok(true);
        }

        let total = resp.children.len();
        for (index, child) in resp.children.iter().enumerate() {
            let child_connector = if index == total - 1 {
                st.stack.push(Connector::Blank);
                Connector::Elbow
            } else {
                st.stack.push(Connector::Pipe);
                Connector::Tee
            };
            let cnode = StatusNode {
                rank: child.rank,
                subtree_ranks: st.ctx.subtree_ranks(child.rank).await.ok(),
                status: child.status.clone(),
                duration: child.duration,
                ghost: false,
                connector: child_connector,
                error: child.error.clone().unwrap_or_default(),
            };
            if fun(st, &cnode, false, level + 1) {
                let dead = cnode.status == "offline" || cnode.status == "lost";
                let walked = if dead {
                    false
                } else {
                    healthwalk(st, child.rank, level + 1, child_connector, fun).await?
                };
                if !walked && !st.opts.no_ghost {
                    let topo = st
                        .ctx
                        .topology()
                        .await
                        .ok()
                        .and_then(|t| t.subtree(child.rank).cloned());
                    if let Some(topo) = topo {
                        st.ghostwalk(&topo, level + 1, &cnode.status, fun);
                    }
                }
            }
            st.stack.pop();
        }
        Ok(true)
    })
}

impl<'a, W: Write> Status<'a, W> {
    /// Walk a ghost subtree from the fixed topology: every node inherits
    /// `status` and is marked synthesized.  No network traffic.
    fn ghostwalk(&mut self, topo: &Topology, level: usize, status: &str, fun: MapFn<W>) {
        let total = topo.children.len();
        for (index, child) in topo.children.iter().enumerate() {
            let connector = if index == total - 1 {
                self.stack.push(Connector::Blank);
                Connector::Elbow
            } else {
                self.stack.push(Connector::Pipe);
                Connector::Tee
            };
            let node = StatusNode {
                rank: child.rank,
                subtree_ranks: Some(child.subtree_ranks()),
                status: status.to_string(),
                duration: -1.0,
                ghost: true,
                connector,
                error: String::new(),
            };
            if fun(self, &node, false, level + 1) {
                self.ghostwalk(child, level + 1, status, fun);
            }
            self.stack.pop();
        }
    }

    /// Connector prefix for this row: everything on the stack up to the
    /// penultimate entry (the final connector belongs to the next level).
    fn indent(&self, level: usize) -> String {
        if self.opts.no_pretty || level == 0 {
            return String::new();
        }
        let take = self.stack.len().saturating_sub(1);
        self.stack.iter().take(take).map(|c| c.as_str()).collect()
    }

    /// `RANK HOSTNAME`, highlighted when the node's subtree intersects the
    /// requested ranks.
    fn name(&self, node: &StatusNode) -> String {
        let highlighted = node
            .subtree_ranks
            .as_ref()
            .map(|s| self.opts.highlight.intersects(s))
            .unwrap_or(false);
        let (start, end) = if highlighted {
            if self.opts.color {
                (ANSI_BLUE_BOLD, ANSI_RESET)
            } else {
                ("<<", ">>")
            }
        } else {
            ("", "")
        };
        let host = self.hostmap.host_by_rank(node.rank).unwrap_or("unknown");
        format!("{}{} {}{}", start, node.rank, host, end)
    }

    fn colorize(&self, status: &str, ghost: bool) -> String {
        if !self.opts.color {
            return status.to_string();
        }
        if ghost {
            format!("{}{}{}", ANSI_DARK_GRAY, status, ANSI_DEFAULT)
        } else if status == "lost" {
            format!("{}{}{}", ANSI_RED, status, ANSI_DEFAULT)
        } else if status == "offline" {
            format!("{}{}{}", ANSI_YELLOW, status, ANSI_DEFAULT)
        } else {
            status.to_string()
        }
    }

    /// ` for DURATION` at verbose >= 1.
    fn duration_str(&self, since: f64) -> String {
        if self.opts.verbose < 1 || since <= 0.0 {
            return String::new();
        }
        format!(" for {}", fsd::format_duration(since))
    }

    /// ` (N ms)` round-trip time at verbose >= 2.
    fn rpctime(&self) -> String {
        if self.opts.verbose < 2 {
            return String::new();
        }
        format!(" ({:.3} ms)", self.rpc_start.elapsed().as_secs_f64() * 1e3)
    }

    fn print(&mut self, node: &StatusNode, parent: bool, level: usize) {
        let connector = if self.opts.no_pretty {
            ""
        } else {
            node.connector.as_str()
        };
        let indent = self.indent(level);
        let name = self.name(node);
        let status = self.colorize(&node.status, node.ghost);
        let duration = self.duration_str(node.duration);
        let sep = if node.error.is_empty() { "" } else { " " };
        let rpctime = if parent {
            self.rpctime()
        } else {
            String::new()
        };
        let _ = writeln!(
            self.out,
            "{}{}{}: {}{}{}{}{}",
            indent, connector, name, status, duration, sep, node.error, rpctime
        );
    }

    fn print_noname(&mut self, node: &StatusNode, parent: bool, level: usize) {
        let indent = self.indent(level);
        let connector = node.connector.as_str();
        let status = self.colorize(&node.status, node.ghost);
        let duration = self.duration_str(node.duration);
        let rpctime = if parent {
            self.rpctime()
        } else {
            String::new()
        };
        let _ = writeln!(
            self.out,
            "{}{}{}{}{}",
            indent, connector, status, duration, rpctime
        );
    }
}

/// Print the first entry without adornment and stop the walk.
fn show_top<W: Write>(
    st: &mut Status<'_, W>,
    node: &StatusNode,
    parent: bool,
    level: usize,
) -> bool {
    st.print_noname(node, parent, level);
    false
}

/// Only follow degraded/partial subtrees, but print all non-full nodes.
fn show_badtrees<W: Write>(
    st: &mut Status<'_, W>,
    node: &StatusNode,
    parent: bool,
    level: usize,
) -> bool {
    if node.status == "full" {
        return false;
    }
    let have_children = node
        .subtree_ranks
        .as_ref()
        .map(|s| s.len() > 1)
        .unwrap_or(false);
    if parent
        || node.status == "lost"
        || node.status == "offline"
        || (!have_children && st.opts.verbose < 2)
    {
        st.print(node, parent, level);
    }
    have_children || st.opts.verbose >= 2
}

/// Follow all live brokers and print everything.
fn show_all<W: Write>(
    st: &mut Status<'_, W>,
    node: &StatusNode,
    parent: bool,
    level: usize,
) -> bool {
    let have_children = node
        .subtree_ranks
        .as_ref()
        .map(|s| s.len() > 1)
        .unwrap_or(false);
    if parent
        || node.status == "lost"
        || node.status == "offline"
        || (!have_children && st.opts.verbose < 2)
    {
        st.print(node, parent, level);
    }
    have_children || st.opts.verbose >= 2
}
