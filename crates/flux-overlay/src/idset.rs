//! Ordered rank sets with the compact ranged string form, e.g. `0-3,7`.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::{Context, Result, bail};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdSet {
    ids: BTreeSet<u32>,
}

impl IdSet {
    pub fn new() -> Self {
        IdSet::default()
    }

    pub fn range(lo: u32, hi: u32) -> Self {
        IdSet {
            ids: (lo..=hi).collect(),
        }
    }

    /// Parse a ranged idset, with or without surrounding brackets.
    pub fn decode(s: &str) -> Result<Self> {
        let s = s.trim();
        let s = s
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(s);
        if s.is_empty() {
            return Ok(IdSet::new());
        }
        let mut ids = BTreeSet::new();
        for part in s.split(',') {
            let part = part.trim();
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u32 = lo.trim().parse().context("bad idset range start")?;
                    let hi: u32 = hi.trim().parse().context("bad idset range end")?;
                    if lo > hi {
                        bail!("descending idset range {}-{}", lo, hi);
                    }
                    ids.extend(lo..=hi);
                }
                None => {
                    ids.insert(part.parse().context("bad idset member")?);
                }
            }
        }
        Ok(IdSet { ids })
    }

    /// Ranged string form: consecutive runs collapse to `lo-hi`.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let mut iter = self.ids.iter().copied().peekable();
        while let Some(lo) = iter.next() {
            let mut hi = lo;
            while let Some(&next) = iter.peek() {
                if next != hi + 1 {
                    break;
                }
                hi = next;
                iter.next();
            }
            if !out.is_empty() {
                out.push(',');
            }
            if lo == hi {
                out.push_str(&lo.to_string());
            } else {
                out.push_str(&format!("{}-{}", lo, hi));
            }
        }
        out
    }

    pub fn insert(&mut self, id: u32) {
        self.ids.insert(id);
    }

    pub fn remove(&mut self, id: u32) {
        self.ids.remove(&id);
    }

    pub fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn add_all(&mut self, other: &IdSet) {
        self.ids.extend(other.ids.iter().copied());
    }

    pub fn intersects(&self, other: &IdSet) -> bool {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        small.ids.iter().any(|id| large.ids.contains(id))
    }

    /// Members of `self` absent from `other`.
    pub fn difference(&self, other: &IdSet) -> IdSet {
        IdSet {
            ids: self.ids.difference(&other.ids).copied().collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ids.iter().copied()
    }
}

impl FromIterator<u32> for IdSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        IdSet {
            ids: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for IdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
