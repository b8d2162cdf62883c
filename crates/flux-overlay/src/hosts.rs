//! Rank/hostname mapping from the broker `hostlist` attribute.
//!
//! Only the flat comma-separated hostlist form is understood here; a rank
//! maps to the host at its index, and a hostname maps back to the first
//! rank carrying it.

use anyhow::{Result, anyhow, bail};

use flux_core::Handle;

use crate::idset::IdSet;

#[derive(Debug, Clone)]
pub struct HostMap {
    hosts: Vec<String>,
}

impl HostMap {
    pub fn decode(hostlist: &str) -> Result<HostMap> {
        if hostlist.contains('[') {
            bail!("ranged hostlist encodings are not supported");
        }
        let hosts: Vec<String> = hostlist
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_owned)
            .collect();
        if hosts.is_empty() {
            bail!("hostlist is empty");
        }
        Ok(HostMap { hosts })
    }

    /// Build from the handle's `hostlist` attribute.
    pub fn from_handle(handle: &Handle) -> Result<HostMap> {
        let hostlist = handle
            .attr("hostlist")
            .ok_or_else(|| anyhow!("broker has no hostlist attribute"))?;
        HostMap::decode(&hostlist)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn host_by_rank(&self, rank: u32) -> Option<&str> {
        self.hosts.get(rank as usize).map(String::as_str)
    }

    /// First rank on the named host.
    pub fn rank_by_host(&self, host: &str) -> Option<u32> {
        self.hosts.iter().position(|h| h == host).map(|i| i as u32)
    }

    /// Translate a rank idset to a hostlist, or a hostlist to a rank
    /// idset.
    pub fn lookup(&self, targets: &str) -> Result<String> {
        if let Ok(ranks) = IdSet::decode(targets) {
            let mut hosts = Vec::new();
            for rank in ranks.iter() {
                match self.host_by_rank(rank) {
                    Some(host) => hosts.push(host.to_owned()),
                    None => bail!("rank {} is not in host map", rank),
                }
            }
            return Ok(hosts.join(","));
        }
        let mut ranks = IdSet::new();
        for host in targets.split(',').map(str::trim).filter(|h| !h.is_empty()) {
            match self.rank_by_host(host) {
                Some(rank) => ranks.insert(rank),
                None => bail!("host {} not found in host map", host),
            }
        }
        if ranks.is_empty() {
            bail!("target must be a valid idset or hostlist");
        }
        Ok(ranks.encode())
    }

    /// Ranks-to-hostnames for display, preserving rank order.
    pub fn hosts_for(&self, ranks: &IdSet) -> Result<String> {
        self.lookup(&ranks.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> HostMap {
        HostMap::decode("alpha,beta,gamma,beta").unwrap()
    }

    #[test]
    fn rank_host_mapping() {
        let m = map();
        assert_eq!(m.host_by_rank(0), Some("alpha"));
        assert_eq!(m.host_by_rank(3), Some("beta"));
        assert_eq!(m.host_by_rank(4), None);
    }

    #[test]
    fn first_rank_on_host_rule() {
        let m = map();
        assert_eq!(m.rank_by_host("beta"), Some(1));
        assert_eq!(m.rank_by_host("nope"), None);
    }

    #[test]
    fn lookup_both_directions() {
        let m = map();
        assert_eq!(m.lookup("0,2").unwrap(), "alpha,gamma");
        assert_eq!(m.lookup("gamma,alpha").unwrap(), "0,2");
        assert!(m.lookup("9").is_err());
        assert!(m.lookup("unknownhost").is_err());
    }

    #[test]
    fn ranged_encoding_rejected() {
        assert!(HostMap::decode("node[0-9]").is_err());
    }
}
