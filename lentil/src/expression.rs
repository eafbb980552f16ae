//! Cells × genes expression matrix with its identifiers and per-cell
//! annotations
//!
//! The container is narrowed (rows or columns removed) and its values
//! replaced as the pipeline advances, but the identifiers always move
//! together with the matrix rows and columns.

use crate::annotation::CellAnnotations;
use crate::common::*;
use nalgebra_sparse::CooMatrix;
use fnv::FnvHashMap as HashMap;

#[derive(Clone, Debug)]
pub enum ExpressionValues {
    /// raw counts before regression and scaling
    Counts(CsrMat),
    /// dense regressed and scaled values
    Scaled(Mat),
}

impl ExpressionValues {
    pub fn shape(&self) -> (usize, usize) {
        match self {
            ExpressionValues::Counts(x) => (x.nrows(), x.ncols()),
            ExpressionValues::Scaled(x) => x.shape(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExpressionContainer {
    cells: Vec<Box<str>>,
    genes: Vec<Box<str>>,
    gene_index: HashMap<Box<str>, usize>,
    values: ExpressionValues,
    pub annotations: CellAnnotations,
}

impl ExpressionContainer {
    /// Build from a sparse count matrix. Gene names are upper-cased;
    /// duplicated cell or gene names are an integrity error.
    pub fn from_counts(
        cells: Vec<Box<str>>,
        genes: Vec<Box<str>>,
        counts: CsrMat,
    ) -> anyhow::Result<Self> {
        let genes: Vec<Box<str>> = genes
            .into_iter()
            .map(|g| g.to_uppercase().into_boxed_str())
            .collect();

        let mut seen = std::collections::HashSet::with_capacity(cells.len());
        if let Some(dup) = cells.iter().find(|c| !seen.insert(*c)) {
            return Err(LentilError::integrity(
                Stage::Load,
                format!("cell identifier {} appears twice", dup),
            ));
        }

        let gene_index = build_gene_index(&genes)?;

        let ret = Self {
            annotations: CellAnnotations::new(cells.len()),
            cells,
            genes,
            gene_index,
            values: ExpressionValues::Counts(counts),
        };
        ret.check_integrity(Stage::Load)?;
        Ok(ret)
    }

    /// Build from `(cell, gene, count)` triplets; repeated entries add up
    pub fn from_triplets(
        cells: Vec<Box<str>>,
        genes: Vec<Box<str>>,
        triplets: &[(usize, usize, f32)],
    ) -> anyhow::Result<Self> {
        let (nrow, ncol) = (cells.len(), genes.len());
        let mut coo = CooMatrix::new(nrow, ncol);
        for &(i, j, x) in triplets {
            if i >= nrow || j >= ncol {
                return Err(LentilError::integrity(
                    Stage::Load,
                    format!("entry ({}, {}) outside {} x {}", i, j, nrow, ncol),
                ));
            }
            coo.push(i, j, x);
        }
        Self::from_counts(cells, genes, CsrMat::from(&coo))
    }

    pub fn cells(&self) -> &[Box<str>] {
        &self.cells
    }

    pub fn genes(&self) -> &[Box<str>] {
        &self.genes
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn num_genes(&self) -> usize {
        self.genes.len()
    }

    pub fn values(&self) -> &ExpressionValues {
        &self.values
    }

    pub fn counts(&self) -> Option<&CsrMat> {
        match &self.values {
            ExpressionValues::Counts(x) => Some(x),
            _ => None,
        }
    }

    pub fn scaled(&self) -> Option<&Mat> {
        match &self.values {
            ExpressionValues::Scaled(x) => Some(x),
            _ => None,
        }
    }

    /// Column of an upper-cased gene name
    pub fn gene_position(&self, gene: &str) -> Option<usize> {
        self.gene_index.get(gene).copied()
    }

    /// Matrix shape, identifier lengths and annotation lengths agree
    pub fn check_integrity(&self, stage: Stage) -> anyhow::Result<()> {
        let (nrow, ncol) = self.values.shape();
        if nrow != self.cells.len() || ncol != self.genes.len() {
            return Err(LentilError::integrity(
                stage,
                format!(
                    "matrix is {} x {} but there are {} cells and {} genes",
                    nrow,
                    ncol,
                    self.cells.len(),
                    self.genes.len()
                ),
            ));
        }
        if self.annotations.num_cells() != nrow {
            return Err(LentilError::integrity(
                stage,
                format!(
                    "annotations cover {} cells, matrix has {}",
                    self.annotations.num_cells(),
                    nrow
                ),
            ));
        }
        self.annotations.check_integrity(stage)
    }

    /// Keep the given cells (row positions, in order) with their
    /// annotations
    pub fn select_cells(self, rows: &[usize], stage: Stage) -> anyhow::Result<Self> {
        let values = match self.values {
            ExpressionValues::Counts(x) => ExpressionValues::Counts(subset_csr(&x, Some(rows), None)?),
            ExpressionValues::Scaled(x) => ExpressionValues::Scaled(x.select_rows(rows)),
        };
        let ret = Self {
            cells: rows.iter().map(|&i| self.cells[i].clone()).collect(),
            genes: self.genes,
            gene_index: self.gene_index,
            values,
            annotations: self.annotations.select_rows(rows),
        };
        ret.check_integrity(stage)?;
        Ok(ret)
    }

    /// Keep the given genes (column positions, in increasing order)
    pub fn select_genes(self, cols: &[usize], stage: Stage) -> anyhow::Result<Self> {
        let values = match self.values {
            ExpressionValues::Counts(x) => ExpressionValues::Counts(subset_csr(&x, None, Some(cols))?),
            ExpressionValues::Scaled(x) => ExpressionValues::Scaled(x.select_columns(cols)),
        };
        let genes: Vec<Box<str>> = cols.iter().map(|&j| self.genes[j].clone()).collect();
        let ret = Self {
            cells: self.cells,
            gene_index: build_gene_index(&genes)?,
            genes,
            values,
            annotations: self.annotations,
        };
        ret.check_integrity(stage)?;
        Ok(ret)
    }

    /// Swap in new values of the same shape
    pub fn replace_values(self, values: ExpressionValues, stage: Stage) -> anyhow::Result<Self> {
        let ret = Self { values, ..self };
        ret.check_integrity(stage)?;
        Ok(ret)
    }
}

fn build_gene_index(genes: &[Box<str>]) -> anyhow::Result<HashMap<Box<str>, usize>> {
    let mut gene_index = HashMap::with_capacity_and_hasher(genes.len(), Default::default());
    for (j, g) in genes.iter().enumerate() {
        if gene_index.insert(g.clone(), j).is_some() {
            return Err(LentilError::integrity(
                Stage::Load,
                format!("gene identifier {} appears twice (after upper-casing)", g),
            ));
        }
    }
    Ok(gene_index)
}

/// Sub-matrix of a CSR matrix. `cols` must be increasing so the
/// column order within each row stays sorted.
pub fn subset_csr(
    csr: &CsrMat,
    rows: Option<&[usize]>,
    cols: Option<&[usize]>,
) -> anyhow::Result<CsrMat> {
    let all_rows: Vec<usize>;
    let rows = match rows {
        Some(r) => r,
        None => {
            all_rows = (0..csr.nrows()).collect();
            &all_rows
        }
    };

    let col_map: Option<Vec<Option<usize>>> = cols.map(|cols| {
        let mut map = vec![None; csr.ncols()];
        for (new, &old) in cols.iter().enumerate() {
            map[old] = Some(new);
        }
        map
    });
    let ncol = cols.map(|c| c.len()).unwrap_or(csr.ncols());

    let mut offsets = Vec::with_capacity(rows.len() + 1);
    let mut indices = vec![];
    let mut data = vec![];
    offsets.push(0);

    for &i in rows {
        let row = csr.row(i);
        for (&j, &x) in row.col_indices().iter().zip(row.values()) {
            let j_new = match &col_map {
                Some(map) => map[j],
                None => Some(j),
            };
            if let Some(j_new) = j_new {
                indices.push(j_new);
                data.push(x);
            }
        }
        offsets.push(indices.len());
    }

    CsrMat::try_from_csr_data(rows.len(), ncol, offsets, indices, data)
        .map_err(|e| anyhow::anyhow!("failed to subset a sparse matrix: {}", e))
}
