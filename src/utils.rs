use std::path::{Path, PathBuf};

use url::{ParseError, Url};

/// Last non-empty path segment of `url_str`, or a random `download_<uuid>`.
pub fn get_filename_from_url(url_str: &str) -> Result<String, ParseError> {
    let url = Url::parse(url_str)?;

    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.filter(|s| !s.is_empty()).last() {
            return Ok(filename.to_string());
        }
    }

    // Fallback if no filename found in path
    Ok(format!("download_{}", uuid::Uuid::new_v4()))
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

pub fn get_unique_filepath(dir: &Path, filename: &str) -> PathBuf {
    let mut path = dir.join(filename);
    let mut counter = 1;

    let base = Path::new(filename);
    let file_stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string());
    let extension = base
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();

    while path.exists() {
        let new_filename = if extension.is_empty() {
            format!("{}_{}", file_stem, counter)
        } else {
            format!("{}_{}.{}", file_stem, counter, extension)
        };

        path = dir.join(new_filename);
        counter += 1;
    }
    path
}

/// `name.ext` becomes `name.ext.part`.
pub fn part_path(filepath: &Path) -> PathBuf {
    let mut part_filepath = filepath.to_path_buf();
    if let Some(extension) = filepath.extension() {
        let mut ext = extension.to_os_string();
        ext.push(".part");
        part_filepath.set_extension(ext);
    } else {
        part_filepath.set_extension("part");
    }
    part_filepath
}
