//! Index bookkeeping for batched classification.
//!
//! Batches carry the positions of their rows so answers can be scattered back
//! into the caller's order no matter which batch finishes first.

/// Split `indices` into consecutive batches of at most `size`.
pub fn chunk_indices(indices: &[usize], size: usize) -> Vec<Vec<usize>> {
    indices.chunks(size.max(1)).map(<[usize]>::to_vec).collect()
}

/// Group row positions by key, keys in first-seen order, rows in input order.
pub fn group_by_key<K: PartialEq + Copy>(items: impl IntoIterator<Item = (usize, K)>) -> Vec<(K, Vec<usize>)> {
    let mut groups: Vec<(K, Vec<usize>)> = Vec::new();
    for (index, key) in items {
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(index),
            None => groups.push((key, vec![index])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_keep_order_and_remainder() {
        let idx: Vec<usize> = (0..7).collect();
        assert_eq!(chunk_indices(&idx, 5), vec![vec![0, 1, 2, 3, 4], vec![5, 6]]);
        assert_eq!(chunk_indices(&[], 5), Vec::<Vec<usize>>::new());
        assert_eq!(chunk_indices(&[3, 9], 0), vec![vec![3], vec![9]]);
    }

    #[test]
    fn groups_follow_first_seen_key() {
        let groups = group_by_key([(0, 'b'), (1, 'a'), (2, 'b'), (3, 'c'), (4, 'a')]);
        assert_eq!(
            groups,
            vec![('b', vec![0, 2]), ('a', vec![1, 4]), ('c', vec![3])]
        );
    }
}
