use crate::error::ViwrapError;
use env_logger::{fmt::Color, Builder, Target};
use log::{Level, LevelFilter};
use needletail::parser::{write_fasta as write_fasta_record, LineEnding};
use needletail::{parse_fastx_file, FastxReader};
use niffler::get_reader;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Writer that duplicates the log stream into the run log file
struct TeeWriter {
    file: File,
}
impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()?;
        self.file.flush()
    }
}

pub fn init_logger(log_file: Option<&Path>, level: LevelFilter) -> Result<(), ViwrapError> {
    let mut builder = Builder::new();

    builder
        .format(|buf, record| {
            let timestamp = buf.timestamp();

            let mut red_style = buf.style();
            red_style.set_color(Color::Red).set_bold(true);
            let mut green_style = buf.style();
            green_style.set_color(Color::Green).set_bold(true);
            let mut white_style = buf.style();
            white_style.set_color(Color::White).set_bold(false);
            let mut orange_style = buf.style();
            orange_style
                .set_color(Color::Rgb(255, 102, 0))
                .set_bold(true);
            let mut apricot_style = buf.style();
            apricot_style
                .set_color(Color::Rgb(255, 195, 0))
                .set_bold(true);

            let msg = match record.level() {
                Level::Warn => (
                    orange_style.value(record.level()),
                    orange_style.value(record.args()),
                ),
                Level::Info => (
                    green_style.value(record.level()),
                    white_style.value(record.args()),
                ),
                Level::Debug => (
                    apricot_style.value(record.level()),
                    apricot_style.value(record.args()),
                ),
                Level::Error => (
                    red_style.value(record.level()),
                    red_style.value(record.args()),
                ),
                _ => (
                    white_style.value(record.level()),
                    white_style.value(record.args()),
                ),
            };

            writeln!(
                buf,
                "{} [{}] - {}",
                white_style.value(timestamp),
                msg.0,
                msg.1
            )
        })
        .filter(None, level);

    if let Some(path) = log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(Target::Pipe(Box::new(TeeWriter { file })));
    }

    builder.init();

    Ok(())
}

/// Enum to specify the type of file component to retrieve
pub enum FileComponent {
    /// The full file name including the extension
    FileName,
    /// The file name without the extension
    FileStem,
}

/// Extracts the specified file component from a path and returns it as a `String`.
pub fn get_file_component(path: &Path, component: FileComponent) -> Result<String, ViwrapError> {
    match component {
        FileComponent::FileName => {
            path.file_name()
                .ok_or(ViwrapError::FileNameConversionError)
                .and_then(|os_str| os_str.to_str().map(String::from).ok_or(ViwrapError::FileNameConversionError))
        }
        FileComponent::FileStem => {
            path.file_stem()
                .ok_or(ViwrapError::FileNameConversionError)
                .and_then(|os_str| os_str.to_str().map(String::from).ok_or(ViwrapError::FileNameConversionError))
        }
    }
}

pub fn is_file_empty<P: AsRef<Path>>(path: P) -> Result<bool, ViwrapError> {
    let file = File::open(&path)?;

    // Use niffler to get a reader for the (possibly compressed) file
    let (mut reader, _format) = match get_reader(Box::new(file)) {
        Ok(reader_format) => reader_format,
        Err(niffler::Error::FileTooShort) => return Ok(true),
        Err(e) => return Err(ViwrapError::NifflerError(e)),
    };
    // Try to read the first byte
    let mut buffer = [0; 1];
    match reader.read(&mut buffer) {
        Ok(0) => Ok(true),
        Ok(_) => Ok(false),
        Err(e) => Err(ViwrapError::IOError(e))
    }
}

pub fn parse_fastx_file_with_check<P: AsRef<Path>>(path: P) -> Result<Option<Box<dyn FastxReader>>, ViwrapError> {
    if is_file_empty(&path)? {
        Ok(None)
    } else {
        Ok(Some(parse_fastx_file(&path)?))
    }
}

/// First whitespace-delimited token of a sequence header
pub fn get_seq_id(id: &[u8]) -> Result<String, ViwrapError> {
    let header = std::str::from_utf8(id)?;
    Ok(header.split_whitespace().next().unwrap_or("").to_string())
}

/// Sequence record held in memory between stages
#[derive(Debug, Clone, PartialEq)]
pub struct FastaRecord {
    pub id: String,
    pub seq: Vec<u8>,
}
impl FastaRecord {
    pub fn new(id: &str, seq: &[u8]) -> Self {
        Self { id: id.to_string(), seq: seq.to_vec() }
    }
    pub fn len(&self) -> usize {
        self.seq.len()
    }
    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }
}

/// Read all records of a FASTA file, an empty file yields no records
pub fn read_fasta(path: &Path) -> Result<Vec<FastaRecord>, ViwrapError> {
    let mut reader = match parse_fastx_file_with_check(path)? {
        Some(reader) => reader,
        None => return Ok(Vec::new()),
    };

    let mut records = Vec::new();
    while let Some(rec) = reader.next() {
        let record = rec?;
        records.push(FastaRecord {
            id: get_seq_id(record.id())?,
            seq: record.seq().to_vec(),
        });
    }
    Ok(records)
}

pub fn write_fasta(records: &[FastaRecord], path: &Path) -> Result<(), ViwrapError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for record in records {
        write_fasta_record(record.id.as_bytes(), &record.seq, &mut writer, LineEnding::Unix)?;
    }
    writer.flush()?;
    Ok(())
}

/// Concatenate FASTA files into one, skipping missing or empty inputs
pub fn concatenate_fasta_files(inputs: &[PathBuf], output: &Path) -> Result<(), ViwrapError> {
    let mut records = Vec::new();
    for input in inputs {
        if input.exists() {
            records.extend(read_fasta(input)?);
        }
    }
    write_fasta(&records, output)
}

/// Number of records in a (possibly compressed) FASTQ or FASTA file
pub fn count_reads(path: &Path) -> Result<u64, ViwrapError> {
    let mut reader = match parse_fastx_file_with_check(path)? {
        Some(reader) => reader,
        None => return Ok(0),
    };
    let mut count = 0;
    while let Some(rec) = reader.next() {
        rec?;
        count += 1;
    }
    Ok(count)
}

pub fn read_table<T: DeserializeOwned>(path: &Path, delimiter: u8, header: bool) -> Result<Vec<T>, ViwrapError> {
    if is_file_empty(path)? {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(header)
        .flexible(true)
        .from_path(path)?;

    let mut records = Vec::new();
    for rec in reader.deserialize() {
        records.push(rec?);
    }
    Ok(records)
}

pub fn read_tsv<T: DeserializeOwned>(path: &Path, header: bool) -> Result<Vec<T>, ViwrapError> {
    read_table(path, b'\t', header)
}

pub fn write_table<T: Serialize>(records: &[T], path: &Path, delimiter: u8, header: bool) -> Result<(), ViwrapError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .has_headers(header)
        .from_path(path)?;
    for rec in records {
        writer.serialize(rec)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_tsv<T: Serialize>(records: &[T], path: &Path, header: bool) -> Result<(), ViwrapError> {
    write_table(records, path, b'\t', header)
}

/// Write a header-only table, used when a stage has no records
pub fn write_header(columns: &[&str], path: &Path) -> Result<(), ViwrapError> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    writer.write_record(columns)?;
    writer.flush()?;
    Ok(())
}

pub fn write_id_list(ids: &[String], path: &Path) -> Result<(), ViwrapError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for id in ids {
        writeln!(writer, "{id}")?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fasta_write_read_preserves_order_and_ids() -> Result<(), ViwrapError> {
        let dir = tempdir()?;
        let path = dir.path().join("scaffolds.fasta");
        let records = vec![
            FastaRecord::new("scaffold_2", b"ACGT"),
            FastaRecord::new("scaffold_1", b"GGCC"),
        ];
        write_fasta(&records, &path)?;

        let parsed = read_fasta(&path)?;
        assert_eq!(parsed, records);
        Ok(())
    }

    #[test]
    fn read_fasta_empty_file_is_empty_set() -> Result<(), ViwrapError> {
        let dir = tempdir()?;
        let path = dir.path().join("empty.fasta");
        File::create(&path)?;

        assert!(read_fasta(&path)?.is_empty());
        assert_eq!(count_reads(&path)?, 0);
        Ok(())
    }

    #[test]
    fn get_seq_id_strips_description() -> Result<(), ViwrapError> {
        assert_eq!(get_seq_id(b"scaffold_1 length=5000 cov=3.2")?, "scaffold_1");
        Ok(())
    }

    #[test]
    fn file_component_stem() -> Result<(), ViwrapError> {
        let path = PathBuf::from("/data/Lake_01.fasta");
        assert_eq!(get_file_component(&path, FileComponent::FileStem)?, "Lake_01");
        assert_eq!(get_file_component(&path, FileComponent::FileName)?, "Lake_01.fasta");
        Ok(())
    }
}
