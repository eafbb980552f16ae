/// Generate minibatch intervals
/// * `ntot` - number of total samples
/// * `batch_size` - the size of each batch
pub fn generate_minibatch_intervals(ntot: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let batch_size = batch_size.max(1);
    let num_batches = ntot.div_ceil(batch_size);
    (0..num_batches)
        .map(|b| {
            let lb: usize = b * batch_size;
            let ub: usize = ((b + 1) * batch_size).min(ntot);
            (lb, ub)
        })
        .collect::<Vec<_>>()
}

/// Split `[0, ntot)` into at most `num_batches` contiguous intervals
/// of at most `ceil(ntot / num_batches)` elements
pub fn split_into_batches(ntot: usize, num_batches: usize) -> Vec<(usize, usize)> {
    if ntot == 0 {
        return vec![];
    }
    let num_batches = num_batches.clamp(1, ntot);
    generate_minibatch_intervals(ntot, ntot.div_ceil(num_batches))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minibatch_intervals_cover_everything() {
        assert_eq!(
            generate_minibatch_intervals(10, 3),
            vec![(0, 3), (3, 6), (6, 9), (9, 10)]
        );
        assert_eq!(generate_minibatch_intervals(1, 100), vec![(0, 1)]);
    }

    #[test]
    fn batches_hold_at_most_the_ceiling() {
        assert_eq!(split_into_batches(10, 3), vec![(0, 4), (4, 8), (8, 10)]);
        assert_eq!(split_into_batches(3, 5), vec![(0, 1), (1, 2), (2, 3)]);
        assert_eq!(split_into_batches(12, 4), vec![(0, 3), (3, 6), (6, 9), (9, 12)]);
        for (ntot, nb) in [(1000, 7), (5, 2), (99, 10)] {
            let jobs = split_into_batches(ntot, nb);
            assert!(jobs.len() <= nb);
            assert!(jobs.iter().all(|(lb, ub)| ub - lb <= ntot.div_ceil(nb)));
            assert_eq!(jobs.last().map(|x| x.1), Some(ntot));
        }
        assert!(split_into_batches(0, 4).is_empty());
    }
}
