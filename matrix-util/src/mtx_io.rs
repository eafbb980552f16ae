use crate::common_io::*;
use rayon::prelude::*;
use std::io::Write;

/// Write the triplets into a MatrixMarket file with 1-based indices
/// * `triplets` - the triplets to write
/// * `nrow` - number of rows
/// * `ncol` - number of columns
/// * `mtx_file` - the output file (e.g., "matrix.mtx.gz")
pub fn write_mtx_triplets(
    triplets: &[(usize, usize, f32)],
    nrow: usize,
    ncol: usize,
    mtx_file: &str,
) -> anyhow::Result<()> {
    mkdir(mtx_file)?;

    let mut buf = open_buf_writer(mtx_file)?;

    writeln!(buf, "%%MatrixMarket matrix coordinate real general")?;
    writeln!(buf, "{}\t{}\t{}", nrow, ncol, triplets.len())?;

    for (row, col, val) in triplets {
        writeln!(buf, "{}\t{}\t{}", row + 1, col + 1, val)?;
    }

    buf.flush()?;
    Ok(())
}

/// Read a matrix market file and return the shape and 0-based
/// triplets (row, col, val)
/// * `mtx_file` - Path to the matrix market file
pub fn read_mtx_triplets(
    mtx_file: &str,
) -> anyhow::Result<((usize, usize), Vec<(usize, usize, f32)>)> {
    let mtx_hdr_position = 0;
    let ReadLinesOut { lines, header } = read_lines_of_words(mtx_file, mtx_hdr_position)?;

    if header.len() != 3 {
        anyhow::bail!("failed to parse the mtx header of {}", mtx_file);
    }
    let nrow = header[0].parse::<usize>()?;
    let ncol = header[1].parse::<usize>()?;
    let nnz = header[2].parse::<usize>()?;

    fn parse_row_col_val(triplet: &[Box<str>]) -> Option<(usize, usize, f32)> {
        if triplet.len() != 3 {
            return None;
        }
        let row = triplet[0].parse::<usize>().ok()?.checked_sub(1)?;
        let col = triplet[1].parse::<usize>().ok()?.checked_sub(1)?;
        let val = triplet[2].parse::<f32>().ok()?;
        Some((row, col, val))
    }

    let triplets = lines
        .par_iter()
        .filter(|words| !words.is_empty())
        .map(|words| {
            parse_row_col_val(words)
                .filter(|&(r, c, _)| r < nrow && c < ncol)
                .ok_or_else(|| anyhow::anyhow!("bad mtx entry {:?} in {}", words, mtx_file))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    if triplets.len() != nnz {
        log::warn!(
            "{}: header says {} entries, found {}",
            mtx_file,
            nnz,
            triplets.len()
        );
    }

    Ok(((nrow, ncol), triplets))
}
