use crate::annotation::*;
use crate::common::*;
use crate::expression::ExpressionContainer;
use crate::qc::MarkerLookup;

/// Unscaled expression of the markers found after filtering, captured
/// before the matrix is regressed and scaled. Rows follow the
/// container's cells at capture time.
#[derive(Clone, Debug, PartialEq)]
pub struct RawMarkerSnapshot {
    cells: Vec<Box<str>>,
    genes: Vec<Box<str>>,
    /// cells × markers
    values: Mat,
}

impl RawMarkerSnapshot {
    /// Copy the raw counts of every present marker
    pub fn capture(data: &ExpressionContainer, lookups: &[MarkerLookup]) -> anyhow::Result<Self> {
        let Some(counts) = data.counts() else {
            return Err(LentilError::integrity(
                Stage::Qc,
                "raw markers must be captured before scaling",
            ));
        };

        let present: Vec<(&Box<str>, usize)> = lookups
            .iter()
            .filter_map(|m| match m {
                MarkerLookup::Present { gene, column } => Some((gene, *column)),
                MarkerLookup::Absent { .. } => None,
            })
            .collect();

        let mut position = vec![None; data.num_genes()];
        for (k, &(_, j)) in present.iter().enumerate() {
            position[j] = Some(k);
        }

        let mut values = Mat::zeros(data.num_cells(), present.len());
        for (i, row) in counts.row_iter().enumerate() {
            for (&j, &x) in row.col_indices().iter().zip(row.values()) {
                if let Some(k) = position[j] {
                    values[(i, k)] = x;
                }
            }
        }

        info!(
            "captured raw values of {} markers over {} cells",
            present.len(),
            data.num_cells()
        );

        Ok(Self {
            cells: data.cells().to_vec(),
            genes: present.into_iter().map(|(g, _)| g.clone()).collect(),
            values,
        })
    }

    pub fn cells(&self) -> &[Box<str>] {
        &self.cells
    }

    pub fn genes(&self) -> &[Box<str>] {
        &self.genes
    }

    pub fn values(&self) -> &Mat {
        &self.values
    }

    pub fn gene_position(&self, gene: &str) -> Option<usize> {
        self.genes.iter().position(|g| g.as_ref() == gene)
    }

    /// The given genes that are in the snapshot, in the given order,
    /// with their cells × genes values
    pub fn restrict(&self, genes: &[Box<str>]) -> (Vec<Box<str>>, Mat) {
        let (names, columns): (Vec<Box<str>>, Vec<usize>) = genes
            .iter()
            .filter_map(|g| self.gene_position(g).map(|k| (g.clone(), k)))
            .unzip();
        (names, self.values.select_columns(&columns))
    }

    /// Add `{GENE}_raw` columns to the container's annotations
    pub fn record_annotations(&self, data: &mut ExpressionContainer) -> anyhow::Result<()> {
        if data.cells() != self.cells.as_slice() {
            return Err(LentilError::integrity(
                Stage::Qc,
                "raw marker snapshot and container list different cells",
            ));
        }
        for (k, gene) in self.genes.iter().enumerate() {
            data.annotations.insert(
                Stage::Qc,
                AnnotationKey::RawMarker(gene.clone()),
                AnnotationColumn::Numeric(self.values.column(k).iter().copied().collect()),
            )?;
        }
        Ok(())
    }
}
