//! Streaming inspection of plaintext artifacts: SQL dumps and the tar
//! archives of physical snapshots.

use super::{BackupError, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const READ_BUFFER: usize = 64 * 1024;
const TAR_BLOCK: u64 = 512;
const TAR_MAGIC_OFFSET: usize = 257;

/// SHA-256 over a file, read in fixed-size chunks.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub async fn file_size(path: &Path) -> Result<u64> {
    Ok(tokio::fs::metadata(path).await?.len())
}

pub async fn is_gzip(path: &Path) -> Result<bool> {
    let mut file = File::open(path).await?;
    let mut magic = [0u8; 2];
    let mut read = 0;
    while read < magic.len() {
        let n = file.read(&mut magic[read..]).await?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(magic == GZIP_MAGIC)
}

/// Decompress the whole stream and discard it. Returns the decompressed length.
pub async fn probe_decompression(path: &Path) -> Result<u64> {
    let path = path.to_path_buf();
    blocking(move || {
        let mut decoder = GzDecoder::new(std::fs::File::open(&path)?);
        std::io::copy(&mut decoder, &mut std::io::sink()).map_err(|e| BackupError::IntegrityError {
            message: format!("Decompression of {} failed: {e}", path.display()),
        })
    })
    .await
}

/// Decompress `input` into `output`, removing `output` if the stream is corrupt.
pub async fn decompress_to(input: &Path, output: &Path) -> Result<u64> {
    let input = input.to_path_buf();
    let output_path = output.to_path_buf();
    let result = blocking(move || {
        let mut decoder = GzDecoder::new(std::fs::File::open(&input)?);
        let mut out = std::fs::File::create(&output_path)?;
        std::io::copy(&mut decoder, &mut out).map_err(|e| BackupError::IntegrityError {
            message: format!("Decompression of {} failed: {e}", input.display()),
        })
    })
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(output).await;
    }
    result
}

/// Schema and data statements found in a SQL dump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpMarkers {
    pub tables: usize,
    pub sequences: usize,
    pub indexes: usize,
    pub data_statements: usize,
}

impl DumpMarkers {
    pub fn has_schema(&self) -> bool {
        self.tables > 0
    }

    pub fn has_data(&self) -> bool {
        self.data_statements > 0
    }
}

/// Count schema and data markers line by line, decompressing on the fly
/// when the artifact is gzip. Markers are matched at line starts, so a
/// statement never straddles two reads.
pub async fn scan_markers(path: &Path) -> Result<DumpMarkers> {
    let compressed = is_gzip(path).await?;
    let path: PathBuf = path.to_path_buf();
    blocking(move || {
        let file = std::fs::File::open(&path)?;
        let reader: Box<dyn Read> = if compressed {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        let mut reader = BufReader::with_capacity(READ_BUFFER, reader);

        let mut markers = DumpMarkers::default();
        let mut line = Vec::new();
        loop {
            line.clear();
            let n = reader
                .read_until(b'\n', &mut line)
                .map_err(|e| BackupError::IntegrityError {
                    message: format!("Failed to read {}: {e}", path.display()),
                })?;
            if n == 0 {
                break;
            }
            classify_line(&line, &mut markers);
        }
        Ok(markers)
    })
    .await
}

/// What a physical snapshot archive holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSummary {
    pub entries: usize,
    pub has_pg_version: bool,

    /// Regular files under `base/`, one per relation segment
    pub relation_files: usize,
}

fn open_plaintext(path: &Path, compressed: bool) -> Result<Box<dyn Read>> {
    let file = std::fs::File::open(path)?;
    Ok(if compressed {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    })
}

/// Whether the artifact is a tar archive, looking through gzip.
pub async fn is_tar_archive(path: &Path) -> Result<bool> {
    let compressed = is_gzip(path).await?;
    let path = path.to_path_buf();
    blocking(move || {
        let mut header = Vec::with_capacity(TAR_BLOCK as usize);
        open_plaintext(&path, compressed)?
            .take(TAR_BLOCK)
            .read_to_end(&mut header)
            .map_err(|e| BackupError::IntegrityError {
                message: format!("Failed to read {}: {e}", path.display()),
            })?;
        Ok(header.len() == TAR_BLOCK as usize
            && &header[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5] == b"ustar")
    })
    .await
}

/// Walk the archive entries without unpacking them.
pub async fn scan_archive(path: &Path) -> Result<ArchiveSummary> {
    let compressed = is_gzip(path).await?;
    let path = path.to_path_buf();
    blocking(move || {
        let unreadable = |e: std::io::Error| BackupError::IntegrityError {
            message: format!("Failed to read archive {}: {e}", path.display()),
        };
        let mut archive = tar::Archive::new(open_plaintext(&path, compressed)?);
        let mut summary = ArchiveSummary::default();
        for entry in archive.entries().map_err(unreadable)? {
            let entry = entry.map_err(unreadable)?;
            let name = entry.path().map_err(unreadable)?.to_string_lossy().into_owned();
            let name = name.trim_start_matches("./");
            summary.entries += 1;
            if name == "PG_VERSION" {
                summary.has_pg_version = true;
            } else if name.starts_with("base/") && entry.header().entry_type().is_file() {
                summary.relation_files += 1;
            }
        }
        Ok(summary)
    })
    .await
}

/// Unpack a snapshot archive into `destination`.
pub async fn unpack_archive(path: &Path, destination: &Path) -> Result<()> {
    let compressed = is_gzip(path).await?;
    let path = path.to_path_buf();
    let destination = destination.to_path_buf();
    blocking(move || {
        std::fs::create_dir_all(&destination)?;
        tar::Archive::new(open_plaintext(&path, compressed)?)
            .unpack(&destination)
            .map_err(|e| BackupError::IntegrityError {
                message: format!(
                    "Failed to unpack {} into {}: {e}",
                    path.display(),
                    destination.display()
                ),
            })
    })
    .await
}

fn classify_line(line: &[u8], markers: &mut DumpMarkers) {
    if line.starts_with(b"CREATE TABLE ") {
        markers.tables += 1;
    } else if line.starts_with(b"CREATE SEQUENCE ") {
        markers.sequences += 1;
    } else if line.starts_with(b"CREATE INDEX ") || line.starts_with(b"CREATE UNIQUE INDEX ") {
        markers.indexes += 1;
    } else if line.starts_with(b"COPY ") || line.starts_with(b"INSERT INTO ") {
        markers.data_statements += 1;
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    const DUMP: &str = "--\n-- PostgreSQL database dump\n--\n\
        CREATE SEQUENCE public.memories_id_seq;\n\
        CREATE TABLE public.memories (\n    id integer NOT NULL\n);\n\
        CREATE TABLE public.tags (\n    name text\n);\n\
        CREATE UNIQUE INDEX memories_pkey ON public.memories USING btree (id);\n\
        COPY public.memories (id) FROM stdin;\n1\n2\n\\.\n\
        INSERT INTO public.tags VALUES ('x');\n";

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn test_checksum_is_content_addressed() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.sql");
        let b = dir.path().join("b.sql");
        std::fs::write(&a, DUMP).unwrap();
        std::fs::write(&b, DUMP).unwrap();

        let first = sha256_file(&a).await.unwrap();
        assert_eq!(first, sha256_file(&a).await.unwrap());
        assert_eq!(first, sha256_file(&b).await.unwrap());
        assert_eq!(first, hex::encode(Sha256::digest(DUMP.as_bytes())));

        std::fs::write(&b, DUMP.replace("tags", "tagz")).unwrap();
        assert_ne!(first, sha256_file(&b).await.unwrap());
    }

    #[tokio::test]
    async fn test_markers_in_plain_and_gzip_dumps() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("dump.sql");
        let packed = dir.path().join("dump.sql.gz");
        std::fs::write(&plain, DUMP).unwrap();
        std::fs::write(&packed, gzip(DUMP.as_bytes())).unwrap();

        let expected = DumpMarkers {
            tables: 2,
            sequences: 1,
            indexes: 1,
            data_statements: 2,
        };
        assert!(!is_gzip(&plain).await.unwrap());
        assert!(is_gzip(&packed).await.unwrap());
        assert_eq!(scan_markers(&plain).await.unwrap(), expected);
        assert_eq!(scan_markers(&packed).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_marker_spanning_read_buffer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("padded.sql");
        // push the statement across the 64 KiB read boundary
        let mut body = "-".repeat(READ_BUFFER - 6);
        body.push('\n');
        body.push_str("CREATE TABLE public.split (id int);\n");
        std::fs::write(&path, body).unwrap();

        let markers = scan_markers(&path).await.unwrap();
        assert_eq!(markers.tables, 1);
        assert!(!markers.has_data());
    }

    #[tokio::test]
    async fn test_corrupt_gzip_fails_probe() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.sql.gz");
        let mut bytes = gzip(DUMP.as_bytes());
        bytes.truncate(bytes.len() / 2);
        std::fs::write(&path, bytes).unwrap();

        let err = probe_decompression(&path).await.unwrap_err();
        assert!(matches!(err, BackupError::IntegrityError { .. }));

        let out = dir.path().join("broken.sql");
        assert!(decompress_to(&path, &out).await.is_err());
        assert!(!out.exists());
    }

    fn snapshot_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, body) in [
            ("PG_VERSION", &b"16\n"[..]),
            ("global/pg_control", &[0u8; 64][..]),
            ("base/1/1259", &[1u8; 128][..]),
            ("base/1/2619", &[2u8; 128][..]),
        ] {
            let mut header = tar::Header::new_ustar();
            header.set_size(body.len() as u64);
            header.set_mode(0o600);
            header.set_cksum();
            builder.append_data(&mut header, name, body).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_archive_is_scanned_and_unpacked() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("base.tar");
        let packed = dir.path().join("base.tar.gz");
        std::fs::write(&plain, snapshot_tar()).unwrap();
        std::fs::write(&packed, gzip(&snapshot_tar())).unwrap();

        let expected = ArchiveSummary {
            entries: 4,
            has_pg_version: true,
            relation_files: 2,
        };
        for archive in [&plain, &packed] {
            assert!(is_tar_archive(archive).await.unwrap());
            assert_eq!(scan_archive(archive).await.unwrap(), expected);
        }

        let data = dir.path().join("data");
        unpack_archive(&packed, &data).await.unwrap();
        assert_eq!(std::fs::read(data.join("PG_VERSION")).unwrap(), b"16\n");
        assert!(data.join("base/1/2619").exists());
    }

    #[tokio::test]
    async fn test_sql_dump_is_not_an_archive() {
        let dir = TempDir::new().unwrap();
        let short = dir.path().join("short.sql");
        std::fs::write(&short, DUMP).unwrap();
        assert!(!is_tar_archive(&short).await.unwrap());

        let long = dir.path().join("long.sql.gz");
        std::fs::write(&long, gzip(DUMP.repeat(20).as_bytes())).unwrap();
        assert!(!is_tar_archive(&long).await.unwrap());
    }

    #[tokio::test]
    async fn test_decompress_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dump.sql.gz");
        std::fs::write(&path, gzip(DUMP.as_bytes())).unwrap();

        assert_eq!(probe_decompression(&path).await.unwrap(), DUMP.len() as u64);
        let out = dir.path().join("dump.sql");
        decompress_to(&path, &out).await.unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap(), DUMP);
    }
}
