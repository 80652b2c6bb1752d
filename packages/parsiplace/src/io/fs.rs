use eyre::{Report, WrapErr, eyre};
use flate2::read::MultiGzDecoder;
use std::env;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const BUF_SIZE: usize = 2 * 1024 * 1024;

pub fn absolute_path(path: impl AsRef<Path>) -> Result<PathBuf, Report> {
  let path = path.as_ref();

  let absolute_path = if path.is_absolute() {
    path.to_path_buf()
  } else {
    env::current_dir()?.join(path)
  };

  Ok(absolute_path)
}

pub fn ensure_dir(filepath: impl AsRef<Path>) -> Result<(), Report> {
  let filepath = filepath.as_ref();
  {
    let parent_dir = filepath
      .parent()
      .ok_or_else(|| eyre!("Unable to get parent path for {:#?}", filepath))?;

    let parent_path = absolute_path(parent_dir)?;

    fs::create_dir_all(&parent_path).wrap_err_with(|| format!("When creating directory '{parent_path:#?}'"))
  }
  .wrap_err_with(|| format!("When ensuring parent directory for '{filepath:#?}'"))
}

/// Reads entire file into a string.
/// Compared to `std::fs::read_to_string` uses buffered reader
pub fn read_file_to_string(filepath: impl AsRef<Path>) -> Result<String, Report> {
  let filepath = filepath.as_ref();

  let file = File::open(filepath).wrap_err_with(|| format!("When opening file: {filepath:#?}"))?;
  let mut reader = BufReader::with_capacity(BUF_SIZE, file);

  let mut data = String::new();
  reader
    .read_to_string(&mut data)
    .wrap_err_with(|| format!("When reading file: {filepath:#?}"))?;

  Ok(data)
}

/// Reads entire gzip-compressed file into a string
pub fn read_gz_file_to_string(filepath: impl AsRef<Path>) -> Result<String, Report> {
  let filepath = filepath.as_ref();

  let file = File::open(filepath).wrap_err_with(|| format!("When opening file: {filepath:#?}"))?;
  let mut decoder = MultiGzDecoder::new(BufReader::with_capacity(BUF_SIZE, file));

  let mut data = String::new();
  decoder
    .read_to_string(&mut data)
    .wrap_err_with(|| format!("When decompressing file: {filepath:#?}"))?;

  Ok(data)
}

/// Reads a file, decompressing when the path has a `.gz` extension
pub fn read_maybe_gz_file_to_string(filepath: impl AsRef<Path>) -> Result<String, Report> {
  let filepath = filepath.as_ref();
  if filepath.extension().is_some_and(|ext| ext == "gz") {
    read_gz_file_to_string(filepath)
  } else {
    read_file_to_string(filepath)
  }
}

/// Creates a file for writing, along with any missing parent directories
pub fn create_file(filepath: impl AsRef<Path>) -> Result<BufWriter<File>, Report> {
  let filepath = filepath.as_ref();
  ensure_dir(filepath)?;
  let file = File::create(filepath).wrap_err_with(|| format!("When creating file: {filepath:#?}"))?;
  Ok(BufWriter::with_capacity(BUF_SIZE, file))
}

pub fn write_file(filepath: impl AsRef<Path>, content: &str) -> Result<(), Report> {
  let filepath = filepath.as_ref();
  let mut file = create_file(filepath)?;
  file
    .write_all(content.as_bytes())
    .wrap_err_with(|| format!("When writing file: {filepath:#?}"))
}
