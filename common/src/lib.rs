// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::collections::BTreeSet;
use std::iter::FromIterator;

pub mod logging;

/// Given two slices, return the items found only in the first and the items
/// found only in the second.
pub fn purge_common<T>(a: &[T], b: &[T]) -> (Vec<T>, Vec<T>)
where
    T: std::cmp::Ord + std::clone::Clone,
{
    let set_a = BTreeSet::from_iter(a.to_vec());
    let set_b = BTreeSet::from_iter(b.to_vec());
    let common: BTreeSet<T> = set_a.intersection(&set_b).cloned().collect();

    (
        a.iter().filter(|e| !common.contains(e)).cloned().collect(),
        b.iter().filter(|e| !common.contains(e)).cloned().collect(),
    )
}

#[test]
fn test_purge() {
    let a = vec![1u32, 2, 3, 4];
    let b = vec![3u32, 4, 5, 6];
    let (mut unique_a, mut unique_b) = purge_common(&a, &b);
    unique_a.sort();
    unique_b.sort();
    assert_eq!(unique_a, vec![1, 2]);
    assert_eq!(unique_b, vec![5, 6]);

    let a = vec![10, 9, 8, 7, 11, 12, 13];
    let b = vec![12, 9, 7, 4, 6];
    let (mut unique_a, mut unique_b) = purge_common(&a, &b);
    unique_a.sort();
    unique_b.sort();
    assert_eq!(unique_a, vec![8, 10, 11, 13]);
    assert_eq!(unique_b, vec![4, 6]);

    let (unique_a, unique_b) = purge_common::<u32>(&[], &[1, 2]);
    assert!(unique_a.is_empty());
    assert_eq!(unique_b, vec![1, 2]);
}

/// Return a random 64-bit value, suitable for tagging our own
/// transmissions so we can recognize them if they come back to us.
pub fn random_nonce() -> u64 {
    use rand::Rng;
    rand::thread_rng().gen()
}

#[test]
fn test_nonce() {
    // Two draws colliding would be a one in 2^64 event.
    assert_ne!(random_nonce(), random_nonce());
}
