//! Single-file bundle for shipping a TxHashSet snapshot over the wire.
//!
//! Layout: 8-byte magic, big-endian u32 entry count, then per entry a
//! u16-prefixed relative name and a u64-prefixed content blob.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::error::MmrError;

const MAGIC: &[u8; 8] = b"MWSNAP01";
const MAX_ENTRIES: u32 = 256;
const MAX_NAME_LEN: usize = 256;
const MAX_CONTENT_LEN: u64 = 1 << 32;

/// Packs `files` (relative name, source path) into a bundle at `dest`.
/// Missing source files are packed as empty entries so the receiver always
/// materializes the full file set.
pub fn pack(files: &[(String, PathBuf)], dest: &Path) -> Result<(), MmrError> {
    let mut out = BufWriter::new(File::create(dest)?);
    out.write_all(MAGIC)?;
    out.write_all(&(files.len() as u32).to_be_bytes())?;
    for (name, source) in files {
        let name_bytes = name.as_bytes();
        if name_bytes.len() > MAX_NAME_LEN {
            return Err(MmrError::Corrupt("bundle entry name too long"));
        }
        out.write_all(&(name_bytes.len() as u16).to_be_bytes())?;
        out.write_all(name_bytes)?;
        let content = match std::fs::read(source) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        out.write_all(&(content.len() as u64).to_be_bytes())?;
        out.write_all(&content)?;
    }
    out.flush()?;
    Ok(())
}

/// Unpacks a bundle into `dest_dir`, creating parent directories as needed.
pub fn unpack(bundle: &Path, dest_dir: &Path) -> Result<Vec<String>, MmrError> {
    let mut input = BufReader::new(File::open(bundle)?);
    let mut magic = [0u8; 8];
    input.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(MmrError::Corrupt("bad bundle magic"));
    }
    let mut count_bytes = [0u8; 4];
    input.read_exact(&mut count_bytes)?;
    let count = u32::from_be_bytes(count_bytes);
    if count > MAX_ENTRIES {
        return Err(MmrError::Corrupt("bundle entry count too large"));
    }

    std::fs::create_dir_all(dest_dir)?;
    let mut names = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut len_bytes = [0u8; 2];
        input.read_exact(&mut len_bytes)?;
        let name_len = u16::from_be_bytes(len_bytes) as usize;
        if name_len == 0 || name_len > MAX_NAME_LEN {
            return Err(MmrError::Corrupt("bundle entry name length invalid"));
        }
        let mut name_bytes = vec![0u8; name_len];
        input.read_exact(&mut name_bytes)?;
        let name = String::from_utf8(name_bytes)
            .map_err(|_| MmrError::Corrupt("bundle entry name not utf8"))?;
        let relative = sanitize(&name)?;

        let mut content_len_bytes = [0u8; 8];
        input.read_exact(&mut content_len_bytes)?;
        let content_len = u64::from_be_bytes(content_len_bytes);
        if content_len > MAX_CONTENT_LEN {
            return Err(MmrError::Corrupt("bundle entry too large"));
        }
        let mut content = vec![0u8; content_len as usize];
        input.read_exact(&mut content)?;

        let target = dest_dir.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, content)?;
        names.push(name);
    }
    Ok(names)
}

/// Entry names must stay inside the destination directory.
fn sanitize(name: &str) -> Result<PathBuf, MmrError> {
    let path = Path::new(name);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            _ => return Err(MmrError::Corrupt("bundle entry name escapes directory")),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(MmrError::Corrupt("bundle entry name empty"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("output")).unwrap();
        std::fs::write(src.path().join("output/pmmr_hash.bin"), [1u8; 64]).unwrap();
        std::fs::write(src.path().join("output/pmmr_leaf.bin"), [2u8; 10]).unwrap();

        let bundle = src.path().join("snapshot.bin");
        pack(
            &[
                (
                    "output/pmmr_hash.bin".to_string(),
                    src.path().join("output/pmmr_hash.bin"),
                ),
                (
                    "output/pmmr_leaf.bin".to_string(),
                    src.path().join("output/pmmr_leaf.bin"),
                ),
                (
                    "output/pmmr_prun.bin".to_string(),
                    src.path().join("output/pmmr_prun.bin"),
                ),
            ],
            &bundle,
        )
        .unwrap();

        let names = unpack(&bundle, dst.path()).unwrap();
        assert_eq!(names.len(), 3);
        assert_eq!(
            std::fs::read(dst.path().join("output/pmmr_hash.bin")).unwrap(),
            vec![1u8; 64]
        );
        // Missing source packed as empty.
        assert_eq!(
            std::fs::read(dst.path().join("output/pmmr_prun.bin")).unwrap(),
            Vec::<u8>::new()
        );
    }

    #[test]
    fn traversal_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("evil.bin");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&1u32.to_be_bytes());
        let name = b"../escape.bin";
        bytes.extend_from_slice(&(name.len() as u16).to_be_bytes());
        bytes.extend_from_slice(name);
        bytes.extend_from_slice(&0u64.to_be_bytes());
        std::fs::write(&bundle, bytes).unwrap();
        assert!(unpack(&bundle, dir.path()).is_err());
    }
}
