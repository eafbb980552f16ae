//! Random on/off activation patterns over the GPCR panel

use crate::common::*;
use matrix_util::common_io::write_lines;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

pub struct ActivationPatterns {
    pub receptors: Vec<Box<str>>,
    /// one row per pattern, one flag per receptor
    pub patterns: Vec<Vec<bool>>,
}

/// Draw `n_patterns` distinct patterns, each receptor on with
/// probability one half
pub fn generate_patterns(
    receptors: &[Box<str>],
    n_patterns: usize,
    seed: u64,
) -> anyhow::Result<ActivationPatterns> {
    let nr = receptors.len();
    let capacity = if nr >= usize::BITS as usize {
        usize::MAX
    } else {
        1usize << nr
    };
    if n_patterns > capacity {
        return Err(LentilError::configuration(format!(
            "{} receptors allow only {} distinct patterns, {} requested",
            nr, capacity, n_patterns
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut seen: HashSet<Vec<bool>> = HashSet::with_capacity(n_patterns);
    let mut patterns = Vec::with_capacity(n_patterns);

    while patterns.len() < n_patterns {
        let pattern: Vec<bool> = (0..nr).map(|_| rng.random::<bool>()).collect();
        if seen.insert(pattern.clone()) {
            patterns.push(pattern);
        }
    }

    info!("{} activation patterns over {} receptors", n_patterns, nr);

    Ok(ActivationPatterns {
        receptors: receptors.to_vec(),
        patterns,
    })
}

impl ActivationPatterns {
    /// `pattern` column then one 0/1 column per receptor
    pub fn to_tsv(&self, file: &str) -> anyhow::Result<()> {
        let mut lines: Vec<Box<str>> = Vec::with_capacity(self.patterns.len() + 1);
        let header: Vec<&str> = std::iter::once("pattern")
            .chain(self.receptors.iter().map(|r| r.as_ref()))
            .collect();
        lines.push(header.join("\t").into_boxed_str());

        for (i, pattern) in self.patterns.iter().enumerate() {
            let mut line = format!("Pattern_{}", i + 1);
            for &on in pattern {
                line.push('\t');
                line.push(if on { '1' } else { '0' });
            }
            lines.push(line.into_boxed_str());
        }
        write_lines(&lines, file)
    }
}
