use nalgebra::DMatrix;
use parquet::basic::Type as ParquetType;
use parquet::basic::{Compression, ConvertedType, Repetition, ZstdLevel};
use parquet::data_type::{ByteArray, ByteArrayType, DoubleType};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::file::writer::SerializedFileWriter;
use parquet::record::RowAccessor;
use parquet::schema::types::Type;
use std::fs::File;
use std::sync::Arc;

/// A named column of a data frame
pub enum ParquetColumn {
    Double(Box<str>, Vec<f64>),
    Utf8(Box<str>, Vec<Box<str>>),
}

impl ParquetColumn {
    pub fn name(&self) -> &str {
        match self {
            ParquetColumn::Double(name, _) | ParquetColumn::Utf8(name, _) => name,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ParquetColumn::Double(_, x) => x.len(),
            ParquetColumn::Utf8(_, x) => x.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn field(&self) -> anyhow::Result<Arc<Type>> {
        let builder = match self {
            ParquetColumn::Double(name, _) => {
                Type::primitive_type_builder(name, ParquetType::DOUBLE)
            }
            ParquetColumn::Utf8(name, _) => {
                Type::primitive_type_builder(name, ParquetType::BYTE_ARRAY)
                    .with_converted_type(ConvertedType::UTF8)
            }
        };
        Ok(Arc::new(
            builder.with_repetition(Repetition::REQUIRED).build()?,
        ))
    }
}

/// get field names by peeking into `file_path`
pub fn peek_parquet_field_names(file_path: &str) -> anyhow::Result<Vec<Box<str>>> {
    let file = File::open(file_path)?;
    let reader = SerializedFileReader::new(file)?;
    let metadata = reader.metadata();
    let fields = metadata.file_metadata().schema().get_fields();

    Ok(fields.iter().map(|f| f.name().into()).collect())
}

/// Write a data frame with a leading `row` name column and the given
/// columns, compressed with ZSTD.
///
/// * `file_path`: output file path
/// * `row_names`: one name per row
/// * `columns`: each column must have one value per row
pub fn write_parquet_frame(
    file_path: &str,
    row_names: &[Box<str>],
    columns: &[ParquetColumn],
) -> anyhow::Result<()> {
    let nrows = row_names.len();

    let row_column = ParquetColumn::Utf8("row".into(), row_names.to_vec());
    let mut fields = vec![row_column.field()?];
    for col in columns {
        if col.len() != nrows {
            anyhow::bail!(
                "column {} has {} values, expected {}",
                col.name(),
                col.len(),
                nrows
            );
        }
        fields.push(col.field()?);
    }

    let schema = Arc::new(
        Type::group_type_builder("frame")
            .with_fields(fields)
            .build()?,
    );

    let zstd_level = ZstdLevel::try_new(5)?;
    let writer_properties = Arc::new(
        WriterProperties::builder()
            .set_compression(Compression::ZSTD(zstd_level))
            .build(),
    );

    crate::common_io::mkdir(file_path)?;
    let file = File::create(file_path)?;
    let mut writer = SerializedFileWriter::new(file, schema, writer_properties)?;
    let mut row_group = writer.next_row_group()?;

    for col in std::iter::once(&row_column).chain(columns.iter()) {
        let Some(mut column_writer) = row_group.next_column()? else {
            anyhow::bail!("schema has fewer columns than {}", col.name());
        };
        match col {
            ParquetColumn::Double(_, values) => {
                column_writer
                    .typed::<DoubleType>()
                    .write_batch(values, None, None)?;
            }
            ParquetColumn::Utf8(_, values) => {
                let values: Vec<ByteArray> = values
                    .iter()
                    .map(|x| ByteArray::from(x.as_ref()))
                    .collect();
                column_writer
                    .typed::<ByteArrayType>()
                    .write_batch(&values, None, None)?;
            }
        }
        column_writer.close()?;
    }

    row_group.close()?;
    writer.close()?;
    Ok(())
}

/// Write a dense matrix with row and column names
pub fn write_matrix_parquet(
    file_path: &str,
    data: &DMatrix<f32>,
    row_names: &[Box<str>],
    column_names: &[Box<str>],
) -> anyhow::Result<()> {
    if row_names.len() != data.nrows() || column_names.len() != data.ncols() {
        anyhow::bail!(
            "names ({} x {}) do not match the matrix ({} x {})",
            row_names.len(),
            column_names.len(),
            data.nrows(),
            data.ncols()
        );
    }
    let columns: Vec<ParquetColumn> = data
        .column_iter()
        .zip(column_names)
        .map(|(x, name)| ParquetColumn::Double(name.clone(), x.iter().map(|&v| v as f64).collect()))
        .collect();
    write_parquet_frame(file_path, row_names, &columns)
}

/// Numeric columns of a data frame read back in row-major order
pub struct ParquetReader {
    pub row_major_data: Vec<f64>,
    pub row_names: Vec<Box<str>>,
    pub column_names: Vec<Box<str>>,
}

impl ParquetReader {
    /// Read all DOUBLE columns; the first column holds the row names
    pub fn new(file_path: &str) -> anyhow::Result<Self> {
        let file = File::open(file_path)?;
        let reader = SerializedFileReader::new(file)?;
        let metadata = reader.metadata();
        let fields = metadata.file_metadata().schema().get_fields();

        let select: Vec<usize> = fields
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, f)| f.get_physical_type() == ParquetType::DOUBLE)
            .map(|(j, _)| j)
            .collect();

        let column_names = select.iter().map(|&j| fields[j].name().into()).collect();

        let mut row_names = vec![];
        let mut row_major_data = vec![];
        for record in reader.get_row_iter(None)? {
            let row = record?;
            row_names.push(row.get_string(0)?.as_str().into());
            for &j in select.iter() {
                row_major_data.push(row.get_double(j)?);
            }
        }

        Ok(Self {
            row_major_data,
            row_names,
            column_names,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_keeps_names_and_values() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("obs.parquet");
        let file = file.to_str().unwrap();

        let rows: Vec<Box<str>> = vec!["c1".into(), "c2".into()];
        let columns = vec![
            ParquetColumn::Double("score".into(), vec![1.5, -2.0]),
            ParquetColumn::Utf8("label".into(), vec!["a".into(), "b".into()]),
        ];
        write_parquet_frame(file, &rows, &columns)?;

        let names = peek_parquet_field_names(file)?;
        assert_eq!(names, vec!["row".into(), "score".into(), Box::<str>::from("label")]);

        let back = ParquetReader::new(file)?;
        assert_eq!(back.row_names, rows);
        assert_eq!(back.column_names, vec![Box::<str>::from("score")]);
        assert_eq!(back.row_major_data, vec![1.5, -2.0]);
        Ok(())
    }

    #[test]
    fn mismatched_column_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bad.parquet");
        let rows: Vec<Box<str>> = vec!["c1".into()];
        let columns = vec![ParquetColumn::Double("x".into(), vec![1., 2.])];
        assert!(write_parquet_frame(file.to_str().unwrap(), &rows, &columns).is_err());
    }
}
