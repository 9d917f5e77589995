//! MD5 digests for data object registration.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};

use crate::error::DmeError;

const BUFFER_SIZE: usize = 64 * 1024;

/// Lowercase hex MD5 of a file, read in fixed-size chunks.
pub fn md5_file(path: &Path) -> Result<String, DmeError> {
    let mut file = File::open(path).map_err(|err| {
        DmeError::Filesystem(format!("failed to open {}: {err}", path.display()))
    })?;
    md5_reader(&mut file)
        .map_err(|err| DmeError::Filesystem(format!("failed to read {}: {err}", path.display())))
}

pub fn md5_reader<R: Read>(reader: &mut R) -> std::io::Result<String> {
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
