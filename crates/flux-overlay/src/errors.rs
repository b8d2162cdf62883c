//! Aggregate overlay errors by error text.
//!
//! For every rank whose parent reported it lost, the rank joins the group
//! keyed by the reported error string, and all of its descendants join a
//! "lost parent" group.  Offline ranks are deliberately not reported.

use std::collections::BTreeMap;
use std::io::Write;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;

use crate::health::health_rpc;
use crate::idset::IdSet;
use crate::topology::OverlayCtx;

const LOST_PARENT: &str = "lost parent";

/// Gather and print error groups as `HOSTLIST: TEXT` lines, one group per
/// line, ordered by error text.
pub async fn errors_report<W: Write>(
    ctx: &OverlayCtx,
    timeout: Option<Duration>,
    out: &mut W,
) -> Result<()> {
    let mut errhash: BTreeMap<String, IdSet> = BTreeMap::new();
    gather_errors(ctx, 0, timeout, &mut errhash).await?;
    let hostmap = ctx.hostmap().await?;
    for (error, ranks) in &errhash {
        let hosts = hostmap.hosts_for(ranks)?;
        writeln!(out, "{}: {}", hosts, error)?;
    }
    Ok(())
}

fn add_one(errhash: &mut BTreeMap<String, IdSet>, rank: u32, error: &str) {
    errhash.entry(error.to_string()).or_default().insert(rank);
}

/// File `rank`'s descendants (not `rank` itself) under "lost parent".
async fn add_children(
    ctx: &OverlayCtx,
    errhash: &mut BTreeMap<String, IdSet>,
    rank: u32,
) -> Result<()> {
    let mut ranks = ctx.subtree_ranks(rank).await?;
    ranks.remove(rank);
    if !ranks.is_empty() {
        errhash
            .entry(LOST_PARENT.to_string())
            .or_default()
            .add_all(&ranks);
    }
    Ok(())
}

fn gather_errors<'a>(
    ctx: &'a OverlayCtx,
    rank: u32,
    timeout: Option<Duration>,
    errhash: &'a mut BTreeMap<String, IdSet>,
) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>> {
    Box::pin(async move {
        let resp = match health_rpc(ctx.handle(), rank, None, timeout).await {
            Ok(resp) => resp,
            Err(error) => {
                add_one(errhash, rank, &error);
                add_children(ctx, errhash, rank).await?;
                return Ok(());
            }
        };
        for child in &resp.children {
            match child.status.as_str() {
                "lost" => {
                    let error = child.error.as_deref().unwrap_or("unknown error");
                    add_one(errhash, child.rank, error);
                    add_children(ctx, errhash, child.rank).await?;
                }
                "offline" => {}
                _ => gather_errors(ctx, child.rank, timeout, errhash).await?,
            }
        }
        Ok(())
    })
}
