use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use polars::prelude::*;
use polars_io::parquet::ParquetWriter;

use crate::error::{Result, StrokeError};
use crate::records::StrokeRecord;

pub static RAW_DIR: &str = "raw";
pub static SILVER_DIR: &str = "silver";
pub static GOLD_DIR: &str = "gold";
pub static EDA_DIR: &str = "eda";
pub static MODELS_DIR: &str = "models";
pub static STROKE_FILE_NAME: &str = "stroke.parquet";
pub static GOLD_DEBUG_FILE_NAME: &str = "debug.csv";

/// Where every stage reads and writes under one output root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn raw(&self) -> PathBuf {
        self.root.join(RAW_DIR).join(STROKE_FILE_NAME)
    }

    pub fn silver(&self) -> PathBuf {
        self.root.join(SILVER_DIR).join(STROKE_FILE_NAME)
    }

    pub fn gold(&self) -> PathBuf {
        self.root.join(GOLD_DIR).join(STROKE_FILE_NAME)
    }

    pub fn gold_debug(&self) -> PathBuf {
        self.root.join(GOLD_DIR).join(GOLD_DEBUG_FILE_NAME)
    }

    pub fn eda_dir(&self) -> PathBuf {
        self.root.join(EDA_DIR)
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join(MODELS_DIR)
    }
}

pub async fn ensure_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| StrokeError::io(dir, e))
}

async fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir(parent).await,
        _ => Ok(()),
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| StrokeError::io(path, e))
}

async fn create(path: &Path) -> Result<File> {
    ensure_parent(path).await?;
    File::create(path).map_err(|e| StrokeError::io(path, e))
}

pub async fn read_parquet<P: AsRef<Path>>(path: P) -> Result<DataFrame> {
    let file = open(path.as_ref())?;
    Ok(ParquetReader::new(file).finish()?)
}

/// Read the source CSV with the raw schema; `bmi` stays text until silver.
pub async fn read_csv<P: AsRef<Path>>(path: P) -> Result<DataFrame> {
    let file = open(path.as_ref())?;
    Ok(CsvReader::new(file)
        .has_header(true)
        .with_dtypes(Option::from(Arc::new(StrokeRecord::raw_schema())))
        .finish()?)
}

pub async fn write_csv<P: AsRef<Path>>(path: P, df: &mut DataFrame) -> Result<()> {
    let mut file = create(path.as_ref()).await?;
    CsvWriter::new(&mut file).finish(df)?;
    Ok(())
}

pub async fn write_parquet<P: AsRef<Path>>(path: P, df: &mut DataFrame) -> Result<()> {
    let mut file = create(path.as_ref()).await?;
    ParquetWriter::new(&mut file).finish(df)?;
    Ok(())
}

/// Typed load of the source CSV. A malformed row fails with its line number.
pub fn load_records<P: AsRef<Path>>(path: P) -> Result<Vec<StrokeRecord>> {
    let file = open(path.as_ref())?;
    read_records(file)
}

pub fn read_records<R: std::io::Read>(reader: R) -> Result<Vec<StrokeRecord>> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut records = Vec::new();
    for row in reader.deserialize() {
        let record: StrokeRecord = row?;
        records.push(record);
    }
    if records.is_empty() {
        return Err(StrokeError::invalid("dataset has no rows"));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::fixtures::SAMPLE_CSV;
    use crate::records::{clean_silver, records_from_dataframe, records_to_dataframe};

    #[test]
    fn malformed_row_reports_line() {
        let broken = SAMPLE_CSV.replacen("228.69", "not-a-number", 1);
        let err = read_records(broken.as_bytes()).unwrap_err();
        match err {
            StrokeError::Record { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn header_only_is_rejected() {
        let header = SAMPLE_CSV.lines().next().unwrap();
        assert!(matches!(
            read_records(header.as_bytes()),
            Err(StrokeError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn raw_csv_keeps_bmi_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stroke.csv");
        std::fs::write(&path, SAMPLE_CSV).unwrap();

        let df = read_csv(&path).await.unwrap();
        assert_eq!(df.shape(), (10, 12));
        assert_eq!(df.column("bmi").unwrap().dtype(), &DataType::Utf8);
    }

    #[tokio::test]
    async fn silver_casts_missing_bmi_to_null() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stroke.csv");
        std::fs::write(&path, SAMPLE_CSV).unwrap();

        let silver = clean_silver(read_csv(&path).await.unwrap()).unwrap();
        let bmi = silver.column("bmi").unwrap();
        assert_eq!(bmi.dtype(), &DataType::Float64);
        assert_eq!(bmi.null_count(), 2);
        assert_eq!(
            records_from_dataframe(&silver).unwrap(),
            read_records(SAMPLE_CSV.as_bytes()).unwrap()
        );
    }

    #[tokio::test]
    async fn parquet_round_trip_through_layout() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let records = read_records(SAMPLE_CSV.as_bytes()).unwrap();
        let mut df = records_to_dataframe(&records).unwrap();

        write_parquet(layout.silver(), &mut df).await.unwrap();
        let back = read_parquet(layout.silver()).await.unwrap();
        assert_eq!(records_from_dataframe(&back).unwrap(), records);
    }
}
