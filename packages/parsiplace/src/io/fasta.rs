use crate::alphabet::nuc::{Nuc, to_nuc_seq};
use crate::io::fs::read_maybe_gz_file_to_string;
use crate::make_error;
use crate::params::InputFormat;
use eyre::{Report, WrapErr};
use std::path::Path;

/// One named sequence row of an input alignment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeqRecord {
  pub seq_name: String,
  pub seq: Vec<Nuc>,
  pub index: usize,
}

/// Reads an alignment from FASTA or relaxed PHYLIP, detected from the first
/// non-empty line. Gzip-compressed files are transparently decompressed.
pub fn read_alignment_file(filepath: impl AsRef<Path>) -> Result<Vec<SeqRecord>, Report> {
  read_alignment_file_as(filepath, InputFormat::Auto)
}

pub fn read_alignment_file_as(filepath: impl AsRef<Path>, format: InputFormat) -> Result<Vec<SeqRecord>, Report> {
  let filepath = filepath.as_ref();
  let content = read_maybe_gz_file_to_string(filepath)?;
  read_alignment_str_as(&content, format).wrap_err_with(|| format!("When parsing alignment file: {filepath:#?}"))
}

pub fn read_alignment_str(content: &str) -> Result<Vec<SeqRecord>, Report> {
  read_alignment_str_as(content, InputFormat::Auto)
}

pub fn read_alignment_str_as(content: &str, format: InputFormat) -> Result<Vec<SeqRecord>, Report> {
  match format {
    InputFormat::Fasta => read_fasta(content),
    InputFormat::Phylip => read_phylip(content),
    InputFormat::Auto => {
      let first = content.lines().find(|line| !line.trim().is_empty());
      match first {
        None => make_error!("Alignment file contains no sequences"),
        Some(line) if line.trim_start().starts_with('>') => read_fasta(content),
        Some(_) => read_phylip(content),
      }
    }
  }
}

fn read_fasta(content: &str) -> Result<Vec<SeqRecord>, Report> {
  let mut records = Vec::new();
  let mut name: Option<String> = None;
  let mut seq = String::new();

  let flush = |name: &mut Option<String>, seq: &mut String, records: &mut Vec<SeqRecord>| -> Result<(), Report> {
    if let Some(seq_name) = name.take() {
      if seq.is_empty() {
        return make_error!("Sequence '{seq_name}' is empty");
      }
      let index = records.len();
      records.push(SeqRecord {
        seq_name,
        seq: to_nuc_seq(seq).wrap_err_with(|| format!("When reading sequence #{index}"))?,
        index,
      });
      seq.clear();
    }
    Ok(())
  };

  for line in content.lines() {
    let line = line.trim_end();
    if let Some(header) = line.strip_prefix('>') {
      flush(&mut name, &mut seq, &mut records)?;
      let seq_name = header.split_whitespace().next().unwrap_or_default().to_owned();
      if seq_name.is_empty() {
        return make_error!("FASTA header with empty sequence name");
      }
      name = Some(seq_name);
    } else if !line.is_empty() {
      if name.is_none() {
        return make_error!("Sequence data before the first FASTA header");
      }
      seq.push_str(line.trim());
    }
  }
  flush(&mut name, &mut seq, &mut records)?;

  check_equal_lengths(&records)?;
  Ok(records)
}

fn read_phylip(content: &str) -> Result<Vec<SeqRecord>, Report> {
  let mut lines = content.lines().filter(|line| !line.trim().is_empty());

  let header = lines.next().unwrap_or_default();
  let mut parts = header.split_whitespace();
  let (n_seq, n_site): (usize, usize) = match (parts.next(), parts.next()) {
    (Some(n), Some(m)) => (
      n.parse().wrap_err("When parsing PHYLIP sequence count")?,
      m.parse().wrap_err("When parsing PHYLIP site count")?,
    ),
    _ => return make_error!("Malformed PHYLIP header: '{header}'"),
  };

  let mut records = Vec::with_capacity(n_seq);
  for line in lines {
    let mut parts = line.split_whitespace();
    let seq_name = parts
      .next()
      .ok_or_else(|| crate::make_report!("Malformed PHYLIP row: '{line}'"))?
      .to_owned();
    let seq_str: String = parts.collect();
    let index = records.len();
    let seq = to_nuc_seq(&seq_str).wrap_err_with(|| format!("When reading sequence '{seq_name}'"))?;
    if seq.len() != n_site {
      return make_error!(
        "Sequence '{}' has {} sites, but the PHYLIP header declares {}",
        seq_name,
        seq.len(),
        n_site
      );
    }
    records.push(SeqRecord { seq_name, seq, index });
  }

  if records.len() != n_seq {
    return make_error!(
      "PHYLIP header declares {} sequences, but {} were found",
      n_seq,
      records.len()
    );
  }
  Ok(records)
}

fn check_equal_lengths(records: &[SeqRecord]) -> Result<(), Report> {
  if let Some(first) = records.first() {
    for record in records {
      if record.seq.len() != first.seq.len() {
        return make_error!(
          "Alignment rows differ in length: '{}' has {} sites while '{}' has {}",
          record.seq_name,
          record.seq.len(),
          first.seq_name,
          first.seq.len()
        );
      }
    }
  }
  Ok(())
}
