use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Header words and body rows of a text table
pub struct ReadLinesOut {
    pub lines: Vec<Vec<Box<str>>>,
    pub header: Vec<Box<str>>,
}

fn is_gzipped(file: &str) -> bool {
    Path::new(file)
        .extension()
        .is_some_and(|x| x.eq_ignore_ascii_case("gz"))
}

///
/// Open a file for reading, and return a buffered reader
/// * `input_file` - file name--either gzipped or not
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(input_file)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", input_file, e))?;
    if is_gzipped(input_file) {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

///
/// Open a file for writing, and return a buffered writer. `stdout`
/// and `stderr` name the standard streams.
/// * `output_file` - file name--either gzipped or not
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn Write>> {
    if output_file.eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(BufWriter::new(std::io::stdout())));
    }
    if output_file.eq_ignore_ascii_case("stderr") {
        return Ok(Box::new(BufWriter::new(std::io::stderr())));
    }

    let file = File::create(output_file)
        .map_err(|e| anyhow::anyhow!("failed to create {}: {}", output_file, e))?;
    if is_gzipped(output_file) {
        let encoder = GzEncoder::new(file, flate2::Compression::default());
        Ok(Box::new(BufWriter::new(encoder)))
    } else {
        Ok(Box::new(BufWriter::new(file)))
    }
}

///
/// Write every line into the output_file; a closed pipe ends the
/// output quietly
///
/// * `lines` - vector of lines
/// * `output_file` - file name--either gzipped or not
///
pub fn write_lines<T>(lines: &[T], output_file: &str) -> anyhow::Result<()>
where
    T: std::fmt::Display,
{
    let mut buf = open_buf_writer(output_file)?;
    for line in lines {
        match writeln!(buf, "{}", line) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => return Err(anyhow::anyhow!("{}: {}", output_file, e)),
        }
    }
    buf.flush()?;
    Ok(())
}

/// Read non-comment lines (`#` or `%` first) and split each one.
/// `hdr_line` counts from the first non-comment line; negative means
/// no header.
fn read_split_lines(
    input_file: &str,
    hdr_line: i64,
    split: impl Fn(&str) -> Vec<Box<str>> + Sync,
) -> anyhow::Result<ReadLinesOut> {
    let mut raw: Vec<String> = vec![];
    for line in open_buf_reader(input_file)?.lines() {
        let line = line?;
        if !(line.starts_with('#') || line.starts_with('%')) {
            raw.push(line);
        }
    }

    let (header, body) = match usize::try_from(hdr_line) {
        Ok(h) if h < raw.len() => (split(&raw[h]), &raw[(h + 1)..]),
        Ok(_) => anyhow::bail!("no header line {} in {}", hdr_line, input_file),
        Err(_) => (vec![], &raw[..]),
    };

    // splitting dominates on large tables
    let lines = body.par_iter().map(|s| split(s)).collect();
    Ok(ReadLinesOut { lines, header })
}

///
/// Read lines and split them into whitespace-separated words.
///
/// * `input_file` - file name--either gzipped or not
/// * `hdr_line` - location of a header line (-1 = no header line)
///
pub fn read_lines_of_words(input_file: &str, hdr_line: i64) -> anyhow::Result<ReadLinesOut> {
    read_split_lines(input_file, hdr_line, |line| {
        line.split_whitespace().map(Box::from).collect()
    })
}

///
/// Read lines and split them by a delimiter. Empty fields are kept,
/// so column positions line up with the header.
///
/// * `input_file` - file name--either gzipped or not
/// * `delim` - field separator
/// * `hdr_line` - location of a header line (-1 = no header line)
///
pub fn read_lines_of_words_delim(
    input_file: &str,
    delim: char,
    hdr_line: i64,
) -> anyhow::Result<ReadLinesOut> {
    read_split_lines(input_file, hdr_line, |line| {
        line.trim_end_matches('\r')
            .split(delim)
            .map(Box::from)
            .collect()
    })
}

///
/// Create the parent directory of a file if needed
/// * `file` - file name
///
pub fn mkdir(file: &str) -> anyhow::Result<()> {
    match Path::new(file).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => Ok(std::fs::create_dir_all(dir)?),
        _ => Ok(()),
    }
}
