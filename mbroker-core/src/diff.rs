//! Set difference between a local and a remote collection.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Partition of two collections by key.
#[derive(Debug)]
pub struct Diff<L, R> {
    /// Remote-only entries.
    pub new: Vec<R>,
    /// Local-only entries.
    pub stale: Vec<L>,
    /// Entries present on both sides, paired.
    pub matching: Vec<(L, R)>,
}

impl<L, R> Diff<L, R> {
    pub fn is_converged(&self) -> bool {
        self.new.is_empty() && self.stale.is_empty()
    }
}

/// Key both collections and split them into new, stale and matching.
///
/// Local entries without a key (e.g. a record that never got a backend id)
/// are not part of the comparison. Duplicate remote keys keep the first
/// entry.
pub fn diff_by_key<L, R, K, FL, FR>(
    local: Vec<L>,
    remote: Vec<R>,
    local_key: FL,
    remote_key: FR,
) -> Diff<L, R>
where
    K: Eq + Hash + Clone,
    FL: Fn(&L) -> Option<K>,
    FR: Fn(&R) -> K,
{
    let mut remote_by_key: HashMap<K, R> = HashMap::with_capacity(remote.len());
    let mut remote_order = Vec::with_capacity(remote.len());
    for item in remote {
        let key = remote_key(&item);
        if !remote_by_key.contains_key(&key) {
            remote_order.push(key.clone());
            remote_by_key.insert(key, item);
        }
    }

    let mut stale = Vec::new();
    let mut matching = Vec::new();
    let mut matched_keys = HashSet::new();

    for item in local {
        let Some(key) = local_key(&item) else {
            continue;
        };
        if matched_keys.contains(&key) {
            continue;
        }
        match remote_by_key.remove(&key) {
            Some(remote_item) => {
                matched_keys.insert(key);
                matching.push((item, remote_item));
            }
            None => stale.push(item),
        }
    }

    let new = remote_order
        .into_iter()
        .filter_map(|key| remote_by_key.remove(&key))
        .collect();

    Diff {
        new,
        stale,
        matching,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition() {
        let local = vec![("A", Some("g1")), ("B", Some("g2")), ("C", None)];
        let remote = vec![("g1", "X"), ("g3", "Y")];

        let diff = diff_by_key(
            local,
            remote,
            |l| l.1.map(str::to_string),
            |r| r.0.to_string(),
        );

        assert_eq!(diff.new, vec![("g3", "Y")]);
        assert_eq!(diff.stale, vec![("B", Some("g2"))]);
        assert_eq!(diff.matching, vec![(("A", Some("g1")), ("g1", "X"))]);
        assert!(!diff.is_converged());
    }

    #[test]
    fn test_partition_covers_union() {
        let local: Vec<u32> = (0..20).filter(|n| n % 2 == 0).collect();
        let remote: Vec<u32> = (0..20).filter(|n| n % 3 == 0).collect();

        let diff = diff_by_key(local.clone(), remote.clone(), |l| Some(*l), |r| *r);

        let new: HashSet<u32> = diff.new.iter().copied().collect();
        let stale: HashSet<u32> = diff.stale.iter().copied().collect();
        let matching: HashSet<u32> = diff.matching.iter().map(|(l, _)| *l).collect();
        let l: HashSet<u32> = local.into_iter().collect();
        let r: HashSet<u32> = remote.into_iter().collect();

        assert_eq!(new, r.difference(&l).copied().collect());
        assert_eq!(stale, l.difference(&r).copied().collect());
        assert_eq!(matching, l.intersection(&r).copied().collect());
        assert!(new.is_disjoint(&stale) && new.is_disjoint(&matching));
        let union: HashSet<u32> = new.union(&stale).chain(matching.iter()).copied().collect();
        assert_eq!(union, l.union(&r).copied().collect());
    }

    #[test]
    fn test_empty_sides() {
        let diff = diff_by_key(Vec::<u8>::new(), vec![1u8, 2], |l| Some(*l), |r| *r);
        assert_eq!(diff.new, vec![1, 2]);
        let diff = diff_by_key(vec![1u8], Vec::<u8>::new(), |l| Some(*l), |r| *r);
        assert_eq!(diff.stale, vec![1]);
        assert!(diff.matching.is_empty());
    }
}
