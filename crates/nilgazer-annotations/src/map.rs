//! The per-package annotation map.

use crate::{Site, Val};
use indexmap::IndexMap;
use nilgazer_hir::Pos;
use serde::{Deserialize, Serialize};

/// A mapping from [`Site`] to [`Val`], with call-site-indexed submaps for
/// the context-sensitive `CallSiteParam`/`CallSiteResult` sites.
///
/// A lookup miss yields [`Val::EMPTY`] with `found = false`; callers in
/// library positions treat misses optimistically (no trigger).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedMap {
    sites: IndexMap<Site, Val>,
    call_sites: IndexMap<Pos, IndexMap<Site, Val>>,
}

impl ObservedMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up `site`, returning the value and whether it was present.
    pub fn lookup(&self, site: &Site) -> (Val, bool) {
        let slot = match site {
            Site::CallSiteParam { loc, .. } | Site::CallSiteResult { loc, .. } => self
                .call_sites
                .get(loc)
                .and_then(|submap| submap.get(site)),
            _ => self.sites.get(site),
        };
        match slot {
            Some(val) => (*val, true),
            None => (Val::EMPTY, false),
        }
    }

    /// Inserts or merges a value for `site`. Set bits of an existing entry
    /// are preserved (literal annotations dominate).
    pub fn insert(&mut self, site: Site, val: Val) {
        let slot = match &site {
            Site::CallSiteParam { loc, .. } | Site::CallSiteResult { loc, .. } => self
                .call_sites
                .entry(loc.clone())
                .or_default()
                .entry(site)
                .or_insert(Val::EMPTY),
            _ => self.sites.entry(site).or_insert(Val::EMPTY),
        };
        if val.is_nilable_set {
            slot.set_nilable(val.is_nilable);
        }
        if val.is_deep_nilable_set {
            slot.set_deep_nilable(val.is_deep_nilable);
        }
        if !val.is_nilable_set && !val.is_deep_nilable_set {
            // A pure default only fills unset bits.
            *slot = slot.or_default(val);
        }
    }

    /// Applies a type default to `site` without disturbing set bits.
    pub fn apply_default(&mut self, site: Site, default: Val) {
        self.insert(site, default);
    }

    /// Absorbs every entry of `other`; used to combine imported package
    /// maps with the local one.
    pub fn absorb(&mut self, other: &ObservedMap) {
        for (site, val) in &other.sites {
            self.insert(site.clone(), *val);
        }
        for submap in other.call_sites.values() {
            for (site, val) in submap {
                self.insert(site.clone(), *val);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sites.len() + self.call_sites.values().map(IndexMap::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Site, &Val)> {
        self.sites
            .iter()
            .chain(self.call_sites.values().flat_map(IndexMap::iter))
    }

    /// Entries in site order; the deterministic iteration the fact encoder
    /// and the solver rely on.
    pub fn sorted_entries(&self) -> Vec<(Site, Val)> {
        let mut entries: Vec<(Site, Val)> =
            self.iter().map(|(s, v)| (s.clone(), *v)).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// The call-site submap at `loc`, if any annotation attached there.
    pub fn call_site(&self, loc: &Pos) -> Option<&IndexMap<Site, Val>> {
        self.call_sites.get(loc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nilgazer_hir::FuncId;

    fn param_site(index: usize) -> Site {
        Site::Param {
            func: FuncId::new("pkg", "f"),
            index,
        }
    }

    #[test]
    fn miss_yields_empty() {
        let map = ObservedMap::new();
        let (val, found) = map.lookup(&param_site(0));
        assert!(!found);
        assert_eq!(val, Val::EMPTY);
    }

    #[test]
    fn set_bits_survive_defaults() {
        let mut map = ObservedMap::new();
        map.insert(param_site(0), Val::nilable(true));
        map.apply_default(
            param_site(0),
            Val {
                is_nilable: false,
                ..Val::EMPTY
            },
        );
        let (val, found) = map.lookup(&param_site(0));
        assert!(found);
        assert!(val.is_nilable);
        assert!(val.is_nilable_set);
    }

    #[test]
    fn call_site_entries_are_keyed_by_location(){
        let mut map = ObservedMap::new();
        let loc = Pos::new("a.src", 9, 3);
        let site = Site::CallSiteParam {
            func: FuncId::new("pkg", "f"),
            index: 0,
            loc: loc.clone(),
        };
        map.insert(site.clone(), Val::nilable(true));
        let (val, found) = map.lookup(&site);
        assert!(found && val.is_nilable);
        assert!(map.call_site(&loc).is_some());
        // The declaration site is untouched.
        let (_, decl_found) = map.lookup(&param_site(0));
        assert!(!decl_found);
    }

    #[test]
    fn sorted_entries_are_deterministic() {
        let mut a = ObservedMap::new();
        a.insert(param_site(1), Val::nilable(true));
        a.insert(param_site(0), Val::nilable(false));
        let mut b = ObservedMap::new();
        b.insert(param_site(0), Val::nilable(false));
        b.insert(param_site(1), Val::nilable(true));
        assert_eq!(a.sorted_entries(), b.sorted_entries());
    }
}
