use matrix_util::common_io::{read_lines_of_words_delim, write_lines};
use matrix_util::mtx_io::{read_mtx_triplets, write_mtx_triplets};
use matrix_util::parquet::{peek_parquet_field_names, write_matrix_parquet, ParquetReader};
use matrix_util::traits::SampleOps;

#[test]
fn dmatrix_parquet_test() -> anyhow::Result<()> {
    let xx = nalgebra::DMatrix::<f32>::runif(5, 3, 42);
    let rows: Vec<Box<str>> = (0..5).map(|i| format!("cell{}", i).into()).collect();
    let cols: Vec<Box<str>> = (1..=3).map(|k| format!("PC{}", k).into()).collect();

    let dir = tempfile::tempdir()?;
    let file = dir.path().join("sub").join("pca.parquet");
    let file = file.to_str().unwrap();
    write_matrix_parquet(file, &xx, &rows, &cols)?;

    let names = peek_parquet_field_names(file)?;
    assert_eq!(names.len(), 4);
    assert_eq!(names[0].as_ref(), "row");
    assert_eq!(&names[1..], cols.as_slice());

    let back = ParquetReader::new(file)?;
    assert_eq!(back.row_names, rows);
    let yy = nalgebra::DMatrix::<f64>::from_row_slice(5, 3, &back.row_major_data);
    approx::assert_abs_diff_eq!(xx.cast::<f64>(), yy, epsilon = 1e-6);
    Ok(())
}

#[test]
fn mtx_test() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("counts.mtx.gz");
    let file = file.to_str().unwrap();

    let triplets = vec![(0, 0, 1.), (3, 1, 7.), (1, 2, 2.5)];
    write_mtx_triplets(&triplets, 4, 3, file)?;

    let ((nrow, ncol), back) = read_mtx_triplets(file)?;
    assert_eq!((nrow, ncol), (4, 3));
    assert_eq!(back, triplets);
    Ok(())
}

#[test]
fn csv_with_missing_fields_test() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("table.csv");
    let file = file.to_str().unwrap();

    let lines: Vec<Box<str>> = vec!["drug,A,B".into(), "X,1.5,".into(), "Y,,NA".into()];
    write_lines(&lines, file)?;

    let out = read_lines_of_words_delim(file, ',', 0)?;
    assert_eq!(out.header.len(), 3);
    assert_eq!(out.lines.len(), 2);
    assert!(out.lines.iter().all(|words| words.len() == 3));
    assert_eq!(out.lines[1][2].as_ref(), "NA");
    Ok(())
}
