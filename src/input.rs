use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};

use camino::Utf8Path;
use flate2::read::GzDecoder;
use md5::{Digest, Md5};
use tracing::debug;
use zip::ZipArchive;

use crate::error::GwasError;

/// Opens a GWAS summary table for line-based reading, transparently
/// decompressing `.gz`/`.gzip` and `.zip` inputs. Zip archives must contain
/// exactly one usable `.txt` or `.tsv` member. Tar and BCF containers are
/// rejected up front.
pub fn open_table(path: &Utf8Path) -> Result<Box<dyn BufRead>, GwasError> {
    let name = path.as_str().to_ascii_lowercase();
    if name.ends_with(".tar") || name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        return Err(GwasError::InputFormat(format!(
            "{path}: tar archives are not supported, extract the summary file first"
        )));
    }
    if name.ends_with(".bcf") {
        return Err(GwasError::InputFormat(format!(
            "{path}: BCF input is not supported, provide a tab-separated summary file"
        )));
    }

    if name.ends_with(".gz") || name.ends_with(".gzip") {
        debug!("reading gzip-compressed table {path}");
        let file = File::open(path.as_std_path())
            .map_err(|err| GwasError::Filesystem(format!("{path}: {err}")))?;
        return Ok(Box::new(BufReader::new(GzDecoder::new(file))));
    }

    if name.ends_with(".zip") {
        debug!("reading zip-archived table {path}");
        let file = File::open(path.as_std_path())
            .map_err(|err| GwasError::Filesystem(format!("{path}: {err}")))?;
        let mut archive = ZipArchive::new(file)
            .map_err(|err| GwasError::InputFormat(format!("{path}: {err}")))?;
        let member = (0..archive.len()).find(|&index| {
            archive
                .by_index(index)
                .map(|entry| {
                    let entry_name = entry.name().to_ascii_lowercase();
                    entry.is_file()
                        && (entry_name.ends_with(".txt") || entry_name.ends_with(".tsv"))
                })
                .unwrap_or(false)
        });
        let Some(index) = member else {
            return Err(GwasError::InputFormat(format!(
                "{path}: zip archive contains no .txt or .tsv member"
            )));
        };
        let mut entry = archive
            .by_index(index)
            .map_err(|err| GwasError::InputFormat(format!("{path}: {err}")))?;
        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|err| GwasError::InputFormat(format!("{path}: {err}")))?;
        return Ok(Box::new(Cursor::new(content)));
    }

    let file = File::open(path.as_std_path())
        .map_err(|err| GwasError::Filesystem(format!("{path}: {err}")))?;
    Ok(Box::new(BufReader::new(file)))
}

/// md5 of the raw file bytes, used to key run artifacts to their input.
pub fn file_md5(path: &Utf8Path) -> Result<String, GwasError> {
    let mut file = File::open(path.as_std_path())
        .map_err(|err| GwasError::Filesystem(format!("{path}: {err}")))?;
    let mut hasher = Md5::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| GwasError::Filesystem(format!("{path}: {err}")))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use camino::Utf8PathBuf;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    use super::*;

    fn temp_path(dir: &tempfile::TempDir, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join(name)).unwrap()
    }

    fn read_lines(reader: Box<dyn BufRead>) -> Vec<String> {
        reader.lines().map(|line| line.unwrap()).collect()
    }

    #[test]
    fn plain_text_reads_line_by_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "summary.tsv");
        std::fs::write(path.as_std_path(), "RSID\tChromosome\nrs1\t1\n").unwrap();
        let lines = read_lines(open_table(&path).unwrap());
        assert_eq!(lines, vec!["RSID\tChromosome", "rs1\t1"]);
    }

    #[test]
    fn gzip_is_transparently_decompressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "summary.tsv.gz");
        let file = File::create(path.as_std_path()).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(b"RSID\nrs1\n").unwrap();
        encoder.finish().unwrap();

        let lines = read_lines(open_table(&path).unwrap());
        assert_eq!(lines, vec!["RSID", "rs1"]);
    }

    #[test]
    fn zip_uses_the_first_tabular_member() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "summary.zip");
        let file = File::create(path.as_std_path()).unwrap();
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        writer.start_file("readme.md", options).unwrap();
        writer.write_all(b"not the data").unwrap();
        writer.start_file("summary.txt", options).unwrap();
        writer.write_all(b"RSID\nrs2\n").unwrap();
        writer.finish().unwrap();

        let lines = read_lines(open_table(&path).unwrap());
        assert_eq!(lines, vec!["RSID", "rs2"]);
    }

    #[test]
    fn zip_without_tabular_member_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "summary.zip");
        let file = File::create(path.as_std_path()).unwrap();
        let mut writer = ZipWriter::new(file);
        writer
            .start_file("data.csv", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"a,b\n").unwrap();
        writer.finish().unwrap();

        assert!(matches!(
            open_table(&path).map(|_| ()).unwrap_err(),
            GwasError::InputFormat(_)
        ));
    }

    #[test]
    fn tar_and_bcf_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["summary.tar", "summary.tar.gz", "summary.bcf"] {
            let path = temp_path(&dir, name);
            std::fs::write(path.as_std_path(), b"irrelevant").unwrap();
            assert!(matches!(
                open_table(&path).map(|_| ()).unwrap_err(),
                GwasError::InputFormat(_)
            ));
        }
    }

    #[test]
    fn file_md5_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "hello.txt");
        std::fs::write(path.as_std_path(), b"hello world").unwrap();
        assert_eq!(
            file_md5(&path).unwrap(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }
}
