use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;

use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::Error;

/// Zip the contents of a code directory into an uploadable archive.
/// Entries are stored relative to the directory root, in a stable
/// sorted order so the same tree always produces the same layout.
pub fn zip_directory(function: &str, code_dir: &Path) -> Result<Vec<u8>, Error> {
    let package_error = |message: String| Error::Package {
        function: function.to_owned(),
        message,
    };

    if !code_dir.is_dir() {
        return Err(package_error(format!(
            "code directory {} does not exist",
            code_dir.display()
        )));
    }

    let mut entries: Vec<_> = WalkDir::new(code_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path() != code_dir)
        .collect();
    entries.sort_by(|a, b| a.path().cmp(b.path()));

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in entries {
        let relative = entry
            .path()
            .strip_prefix(code_dir)
            .map_err(|error| package_error(error.to_string()))?;
        let name = relative.to_string_lossy().replace('\\', "/");

        if entry.file_type().is_dir() {
            writer
                .add_directory(name, options)
                .map_err(|error| package_error(error.to_string()))?;
        } else if entry.file_type().is_file() {
            let contents =
                fs::read(entry.path()).map_err(|error| package_error(error.to_string()))?;
            writer
                .start_file(name, options)
                .map_err(|error| package_error(error.to_string()))?;
            writer
                .write_all(&contents)
                .map_err(|error| package_error(error.to_string()))?;
        }
    }

    let cursor = writer
        .finish()
        .map_err(|error| package_error(error.to_string()))?;
    Ok(cursor.into_inner())
}
