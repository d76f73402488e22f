//! Image tarball spooling, hashing and extraction.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use podlite_shared::{PodliteError, PodliteResult};
use sha2::{Digest, Sha512};
use tar::Archive;
use tempfile::NamedTempFile;

/// Copies `reader` to a temp file while hashing it.
///
/// Returns the spooled file rewound to the start and the `sha512-<hex>` id.
pub fn spool_and_hash(reader: &mut dyn Read) -> PodliteResult<(NamedTempFile, String)> {
    let mut spool = NamedTempFile::new()
        .map_err(|e| PodliteError::Image(format!("Failed to create spool file: {}", e)))?;
    let mut hasher = Sha512::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PodliteError::Image(format!("Failed to read image: {}", e))),
        };
        hasher.update(&buffer[..n]);
        spool
            .write_all(&buffer[..n])
            .map_err(|e| PodliteError::Image(format!("Failed to spool image: {}", e)))?;
    }

    spool
        .as_file_mut()
        .seek(SeekFrom::Start(0))
        .map_err(|e| PodliteError::Image(format!("Failed to rewind spool file: {}", e)))?;

    let hash = format!("sha512-{}", hex::encode(hasher.finalize()));
    Ok((spool, hash))
}

/// Extracts a plain or gzip-compressed tarball into `dest`, preserving
/// permissions and ownership.
pub fn extract(file: &mut File, dest: &Path) -> PodliteResult<()> {
    let mut header = [0u8; 2];
    let is_gzip = match file.read_exact(&mut header) {
        Ok(()) => header == [0x1f, 0x8b],
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(PodliteError::Image(format!("Failed to read image header: {}", e))),
    };
    file.seek(SeekFrom::Start(0))
        .map_err(|e| PodliteError::Image(format!("Failed to rewind image: {}", e)))?;

    let reader: Box<dyn Read + '_> = if is_gzip {
        tracing::debug!(dest = %dest.display(), "Detected gzip compression");
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(true);
    archive.set_overwrite(true);
    archive
        .unpack(dest)
        .map_err(|e| PodliteError::Image(format!("failed to extract image filesystem: {}", e)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    /// Builds an image tarball holding `manifest` and the given rootfs files.
    pub(crate) fn image_tar(manifest: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut append = |path: &str, data: &[u8]| {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, data).unwrap();
        };
        append("manifest", manifest.as_bytes());
        for (path, data) in files {
            append(&format!("rootfs/{}", path), data);
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn hash_is_sha512_of_stream() {
        let data = b"hello image".to_vec();
        let (_spool, hash) = spool_and_hash(&mut &data[..]).unwrap();
        assert_eq!(
            hash,
            format!("sha512-{}", hex::encode(Sha512::digest(&data)))
        );
    }

    #[test]
    fn extracts_gzip_and_plain() {
        let tar = image_tar(r#"{"name":"x"}"#, &[("etc/hostname", b"x")]);
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&tar).unwrap();
        let gz = gz.finish().unwrap();

        for data in [tar, gz] {
            let dir = tempfile::tempdir().unwrap();
            let (mut spool, _) = spool_and_hash(&mut &data[..]).unwrap();
            extract(spool.as_file_mut(), dir.path()).unwrap();
            assert!(dir.path().join("manifest").exists());
            assert_eq!(
                std::fs::read(dir.path().join("rootfs/etc/hostname")).unwrap(),
                b"x"
            );
        }
    }
}
