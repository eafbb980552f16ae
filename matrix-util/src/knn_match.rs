use indicatif::ParallelProgressIterator;
use instant_distance::{Builder, HnswMap, Search};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fmt::{Debug, Display};

/// Below this many points the neighbour search is exhaustive, so
/// small problems give exact and reproducible neighbours.
pub const EXACT_SEARCH_MAX_POINTS: usize = 3_000;

/// A dictionary for fast nearest neighbour look-up of named points.
/// Large point sets are indexed by a seeded HNSW graph; small ones
/// are scanned exhaustively.
pub struct ColumnDict<T> {
    index: NeighbourIndex<T>,
    pub data_vec: Vec<VecPoint>,
    pub names: Vec<T>,
    pub name2index: HashMap<T, usize>,
}

enum NeighbourIndex<T> {
    Exact,
    Hnsw(HnswMap<VecPoint, T>),
}

impl<T> ColumnDict<T>
where
    T: Clone + Eq + std::hash::Hash + Debug + Display + Send + Sync,
{
    pub fn names(&self) -> &[T] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.data_vec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_vec.is_empty()
    }

    pub fn is_exact(&self) -> bool {
        matches!(self.index, NeighbourIndex::Exact)
    }

    pub fn from_points(data_vec: Vec<VecPoint>, names: Vec<T>, seed: u64) -> anyhow::Result<Self> {
        if data_vec.len() != names.len() {
            anyhow::bail!(
                "{} points but {} names in the dictionary",
                data_vec.len(),
                names.len()
            );
        }

        let mut name2index = HashMap::<T, usize>::with_capacity(names.len());
        for (j, x) in names.iter().enumerate() {
            if name2index.insert(x.clone(), j).is_some() {
                anyhow::bail!("duplicate name {} in the dictionary", x);
            }
        }

        let index = if data_vec.len() <= EXACT_SEARCH_MAX_POINTS {
            NeighbourIndex::Exact
        } else {
            log::info!("building HNSW index over {} points", data_vec.len());
            NeighbourIndex::Hnsw(
                Builder::default()
                    .seed(seed)
                    .build(data_vec.clone(), names.clone()),
            )
        };

        Ok(ColumnDict {
            index,
            data_vec,
            names,
            name2index,
        })
    }

    /// k-nearest neighbours of a named point among the other points
    /// in this dictionary, closest first
    ///
    /// * `query_name` - the name of the point to match
    /// * `knn` - the number of nearest neighbours to return
    ///
    pub fn search_others(&self, query_name: &T, knn: usize) -> anyhow::Result<(Vec<T>, Vec<f32>)> {
        let Some(&self_idx) = self.name2index.get(query_name) else {
            anyhow::bail!("name {} not found", query_name);
        };
        let nquery = knn.min(self.len().saturating_sub(1));
        let query = &self.data_vec[self_idx];

        match &self.index {
            NeighbourIndex::Exact => {
                let mut dist: Vec<(f32, usize)> = self
                    .data_vec
                    .iter()
                    .enumerate()
                    .filter(|&(j, _)| j != self_idx)
                    .map(|(j, p)| (query.euclidean(p), j))
                    .collect();
                dist.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                dist.truncate(nquery);
                Ok(dist
                    .into_iter()
                    .map(|(d, j)| (self.names[j].clone(), d))
                    .unzip())
            }
            NeighbourIndex::Hnsw(dict) => {
                let mut search = Search::default();
                Ok(dict
                    .search(query, &mut search)
                    .filter(|item| item.value != query_name)
                    .take(nquery)
                    .map(|item| (item.value.clone(), item.distance))
                    .unzip())
            }
        }
    }
}

impl ColumnDict<usize> {
    /// Index the rows of a matrix by their row positions
    pub fn from_matrix_rows(data: &nalgebra::DMatrix<f32>, seed: u64) -> anyhow::Result<Self> {
        let nn = data.nrows();
        let points: Vec<VecPoint> = (0..nn)
            .into_par_iter()
            .progress_count(nn as u64)
            .map(|i| VecPoint {
                data: data.row(i).iter().copied().collect(),
            })
            .collect();
        Self::from_points(points, (0..nn).collect(), seed)
    }
}

#[derive(Clone, Debug)]
/// a wrapper for Vec<f32>
pub struct VecPoint {
    pub data: Vec<f32>,
}

impl VecPoint {
    pub fn euclidean(&self, other: &Self) -> f32 {
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }
}

impl instant_distance::Point for VecPoint {
    fn distance(&self, other: &Self) -> f32 {
        self.euclidean(other)
    }
}
