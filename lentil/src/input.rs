//! Loading the expression matrix, cell labels and output paths

use crate::annotation::{AnnotationColumn, AnnotationKey};
use crate::common::*;
use crate::expression::ExpressionContainer;
use matrix_util::common_io::read_lines_of_words_delim;
use matrix_util::mtx_io::read_mtx_triplets;
use fnv::FnvHashMap as HashMap;

const MISSING_LABEL: &str = "NA";

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    /// the matrix lists cells in rows instead of the 10x genes-in-rows
    pub cells_by_genes: bool,
    /// `cell<TAB>label` lines
    pub label_file: Option<Box<str>>,
    /// keep only cells of this label
    pub select_label: Option<Box<str>>,
    /// keep only the first N cells
    pub max_cells: Option<usize>,
}

/// First tab-separated column of every line
fn read_first_column(file: &str) -> anyhow::Result<Vec<Box<str>>> {
    let table = read_lines_of_words_delim(file, '\t', -1)?;
    Ok(table
        .lines
        .into_iter()
        .filter_map(|words| words.into_iter().next())
        .map(|w| w.trim().to_string().into_boxed_str())
        .filter(|w| !w.is_empty())
        .collect())
}

/// `cell → label`
pub fn read_cell_labels(file: &str) -> anyhow::Result<HashMap<Box<str>, Box<str>>> {
    let table = read_lines_of_words_delim(file, '\t', -1)?;
    let mut ret = HashMap::with_capacity_and_hasher(table.lines.len(), Default::default());
    for words in table.lines {
        if let [cell, label, ..] = words.as_slice() {
            ret.insert(cell.trim().into(), label.trim().into());
        }
    }
    info!("read labels of {} cells from {}", ret.len(), file);
    Ok(ret)
}

/// Load a Matrix Market count matrix with its gene and cell names
pub fn load_expression(
    mtx_file: &str,
    genes_file: &str,
    cells_file: &str,
    options: &LoadOptions,
) -> anyhow::Result<ExpressionContainer> {
    let ((nrow, ncol), triplets) = read_mtx_triplets(mtx_file)?;
    let mut genes = read_first_column(genes_file)?;
    let mut cells = read_first_column(cells_file)?;

    let (n_cells, n_genes, mut triplets) = if options.cells_by_genes {
        (nrow, ncol, triplets)
    } else {
        let transposed = triplets.into_iter().map(|(g, c, x)| (c, g, x)).collect();
        (ncol, nrow, transposed)
    };

    if genes.len() != n_genes || cells.len() != n_cells {
        return Err(LentilError::integrity(
            Stage::Load,
            format!(
                "{} has {} cells x {} genes, but {} cell and {} gene names",
                mtx_file,
                n_cells,
                n_genes,
                cells.len(),
                genes.len()
            ),
        ));
    }

    if let Some(max_cells) = options.max_cells {
        if max_cells < cells.len() {
            info!("keeping the first {} of {} cells", max_cells, cells.len());
            cells.truncate(max_cells);
            triplets.retain(|&(i, _, _)| i < max_cells);
        }
    }

    genes.iter_mut().for_each(|g| *g = g.to_uppercase().into_boxed_str());

    let mut data = ExpressionContainer::from_triplets(cells, genes, &triplets)?;
    info!(
        "loaded {} cells x {} genes, {} non-zeros",
        data.num_cells(),
        data.num_genes(),
        triplets.len()
    );

    if let Some(label_file) = options.label_file.as_deref() {
        let labels = read_cell_labels(label_file)?;
        attach_labels(&mut data, &labels)?;
    }

    if let Some(label) = options.select_label.as_deref() {
        data = select_label(data, label)?;
    }

    Ok(data)
}

/// Add the `label` column by cell identifier; unlabelled cells get `NA`
pub fn attach_labels(
    data: &mut ExpressionContainer,
    labels: &HashMap<Box<str>, Box<str>>,
) -> anyhow::Result<()> {
    let mut n_missing = 0;
    let column: Vec<Box<str>> = data
        .cells()
        .iter()
        .map(|c| match labels.get(c) {
            Some(l) => l.clone(),
            None => {
                n_missing += 1;
                MISSING_LABEL.into()
            }
        })
        .collect();
    if n_missing > 0 {
        warn!("{} cells have no label", n_missing);
    }
    data.annotations.insert(
        Stage::Load,
        AnnotationKey::Label,
        AnnotationColumn::Categorical(column),
    )
}

/// Keep the cells of one label
pub fn select_label(data: ExpressionContainer, label: &str) -> anyhow::Result<ExpressionContainer> {
    let Some(labels) = data.annotations.categorical(&AnnotationKey::Label) else {
        return Err(LentilError::configuration(format!(
            "cannot select label {} without a label file",
            label
        )));
    };
    let rows: Vec<usize> = labels
        .iter()
        .enumerate()
        .filter(|(_, l)| l.as_ref() == label)
        .map(|(i, _)| i)
        .collect();
    if rows.is_empty() {
        return Err(LentilError::insufficient(Stage::Load, 1, 0));
    }
    info!("{} of {} cells carry label {}", rows.len(), data.num_cells(), label);
    data.select_cells(&rows, Stage::Load)
}

/// `dir/name.mtx[.gz]` → `dir/name_processed`
pub fn derive_output_header(input_file: &str) -> Box<str> {
    let mut stem = input_file;
    for ext in [".gz", ".mtx"] {
        if stem.len() > ext.len() && stem.to_ascii_lowercase().ends_with(ext) {
            stem = &stem[..stem.len() - ext.len()];
        }
    }
    format!("{}_processed", stem).into_boxed_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrix_util::common_io::write_lines;
    use matrix_util::mtx_io::write_mtx_triplets;

    fn write(path: &std::path::Path, lines: &[&str]) -> String {
        let file = path.to_string_lossy().to_string();
        let lines: Vec<Box<str>> = lines.iter().map(|&s| s.into()).collect();
        write_lines(&lines, &file).unwrap();
        file
    }

    #[test]
    fn output_header_drops_extensions() {
        assert_eq!(derive_output_header("d/x.mtx.gz").as_ref(), "d/x_processed");
        assert_eq!(derive_output_header("d/x.mtx").as_ref(), "d/x_processed");
        assert_eq!(derive_output_header("x").as_ref(), "x_processed");
    }

    #[test]
    fn ten_x_orientation_with_labels() {
        let dir = tempfile::tempdir().unwrap();
        let mtx = dir.path().join("m.mtx.gz").to_string_lossy().to_string();
        // 3 genes x 4 cells
        write_mtx_triplets(&[(0, 0, 1.), (1, 1, 2.), (2, 3, 7.), (0, 2, 4.)], 3, 4, &mtx)
            .unwrap();
        let genes_by_name = write(&dir.path().join("n.tsv"), &["Snap25\tx", "Gad1\ty", "mt-Co1\tz"]);
        let cells = write(&dir.path().join("c.tsv"), &["a", "b", "c", "d"]);
        let labels = write(&dir.path().join("l.tsv"), &["d\tneuron", "a\tglia", "c\tneuron"]);

        let options = LoadOptions {
            label_file: Some(labels.clone().into()),
            ..Default::default()
        };
        let data = load_expression(&mtx, &genes_by_name, &cells, &options).unwrap();
        assert_eq!((data.num_cells(), data.num_genes()), (4, 3));
        assert_eq!(data.genes()[2].as_ref(), "MT-CO1");
        let counts = data.counts().unwrap();
        assert_eq!(counts.get_entry(3, 2).map(|e| e.into_value()), Some(7.));
        let label_col = data.annotations.categorical(&AnnotationKey::Label).unwrap();
        assert_eq!(label_col[1].as_ref(), "NA");

        let options = LoadOptions {
            label_file: Some(labels.into()),
            select_label: Some("neuron".into()),
            max_cells: Some(3),
            ..Default::default()
        };
        let data = load_expression(&mtx, &genes_by_name, &cells, &options).unwrap();
        assert_eq!(data.cells(), &[Box::<str>::from("c")]);
        let counts = data.counts().unwrap();
        assert_eq!(counts.get_entry(0, 0).map(|e| e.into_value()), Some(4.));
    }

    #[test]
    fn labels_keep_the_last_entry_and_skip_short_lines() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(
            &dir.path().join("l.tsv.gz"),
            &["a\tglia", "lonely", " b \t neuron \textra", "a\tastro"],
        );
        let labels = read_cell_labels(&file).unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get("a").map(|x| x.as_ref()), Some("astro"));
        assert_eq!(labels.get("b").map(|x| x.as_ref()), Some("neuron"));
    }

    #[test]
    fn name_count_mismatch_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let mtx = dir.path().join("m.mtx").to_string_lossy().to_string();
        write_mtx_triplets(&[(0, 0, 1.)], 2, 2, &mtx).unwrap();
        let names = write(&dir.path().join("n.tsv"), &["A"]);
        let err = load_expression(&mtx, &names, &names, &LoadOptions::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LentilError>(),
            Some(LentilError::DataIntegrity { stage: Stage::Load, .. })
        ));
    }
}
