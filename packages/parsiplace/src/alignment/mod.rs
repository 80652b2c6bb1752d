use crate::alphabet::nuc::Nuc;
use crate::io::fasta::{SeqRecord, read_alignment_file};
use crate::make_error;
use crate::mutation::Mutation;
use eyre::Report;
use std::collections::HashMap;
use std::path::Path;

/// Mapping of variant (non-invariant) alignment columns to compressed positions.
///
/// `positions[c]` is the reference position of compressed column `c`; the vector is
/// ascending, so scans that follow it visit sites in reference order. The mapping is
/// built once per alignment and stays stable until the alignment itself is rebuilt.
#[derive(Clone, Debug, Default)]
pub struct PermCol {
  pub positions: Vec<usize>,
}

impl PermCol {
  pub fn num_compressed(&self) -> usize {
    self.positions.len()
  }
}

/// Input alignment split into the rows backing the base tree ("existing") and the
/// rows still to be placed ("missing"). The first row doubles as the reference for
/// mutation coordinates.
#[derive(Clone, Debug, Default)]
pub struct Alignment {
  rows: Vec<SeqRecord>,
  num_existing: usize,
  name_to_row: HashMap<String, usize>,
  perm_col: PermCol,
  pos_to_compressed: Vec<Option<usize>>,
}

impl Alignment {
  pub fn from_records(rows: Vec<SeqRecord>, num_start_rows: usize) -> Result<Self, Report> {
    if rows.is_empty() {
      return make_error!("Alignment contains no sequences");
    }
    if num_start_rows == 0 || num_start_rows > rows.len() {
      return make_error!(
        "Invalid number of starting rows: {} (alignment has {} rows)",
        num_start_rows,
        rows.len()
      );
    }
    let mut aln = Self {
      rows,
      num_existing: num_start_rows,
      ..Self::default()
    };
    aln.ungroup_site_pattern();
    Ok(aln)
  }

  pub fn read(filepath: impl AsRef<Path>, num_start_rows: usize) -> Result<Self, Report> {
    Self::from_records(read_alignment_file(filepath)?, num_start_rows)
  }

  /// Materialises the per-site column tables: the variant-column permutation and the
  /// reference-position-to-compressed-position map. A column is variant when some row
  /// cannot share an allele with the reference there.
  pub fn ungroup_site_pattern(&mut self) {
    let reference: Vec<Nuc> = self.rows[0].seq.clone();
    let num_sites = reference.len();

    let mut positions = Vec::new();
    let mut pos_to_compressed = vec![None; num_sites];
    for (position, &ref_allele) in reference.iter().enumerate() {
      let is_variant = self
        .rows
        .iter()
        .any(|row| !row.seq[position].shares_allele(ref_allele));
      if is_variant {
        pos_to_compressed[position] = Some(positions.len());
        positions.push(position);
      }
    }
    self.perm_col = PermCol { positions };
    self.pos_to_compressed = pos_to_compressed;

    self.name_to_row = self
      .rows
      .iter()
      .enumerate()
      .map(|(i, row)| (row.seq_name.clone(), i))
      .collect();
  }

  /// The variant-column permutation used for ordering scans
  pub fn find_perm_col(&self) -> &PermCol {
    &self.perm_col
  }

  pub fn compressed_position(&self, position: usize) -> Option<usize> {
    self.pos_to_compressed.get(position).copied().flatten()
  }

  pub fn reference(&self) -> &[Nuc] {
    &self.rows[0].seq
  }

  pub fn num_sites(&self) -> usize {
    self.rows[0].seq.len()
  }

  pub fn num_rows(&self) -> usize {
    self.rows.len()
  }

  pub fn num_existing(&self) -> usize {
    self.num_existing
  }

  pub fn num_missing(&self) -> usize {
    self.rows.len() - self.num_existing
  }

  pub fn row(&self, id: usize) -> &SeqRecord {
    &self.rows[id]
  }

  pub fn row_id(&self, name: &str) -> Option<usize> {
    self.name_to_row.get(name).copied()
  }

  /// Allele of an alignment row at a reference position
  pub fn allele(&self, row_id: usize, position: usize) -> Nuc {
    self.rows[row_id].seq[position]
  }

  /// Name of the i-th missing sample
  pub fn missing_name(&self, missing_index: usize) -> &str {
    &self.rows[self.num_existing + missing_index].seq_name
  }

  /// Alignment row id of the i-th missing sample
  pub fn missing_row_id(&self, missing_index: usize) -> usize {
    self.num_existing + missing_index
  }

  /// Sorted mutation list of a row relative to the reference. Sites whose (possibly
  /// ambiguous) allele can still denote the reference base carry no mutation.
  pub fn row_mutations(&self, row_id: usize) -> Vec<Mutation> {
    let row = &self.rows[row_id];
    self
      .perm_col
      .positions
      .iter()
      .enumerate()
      .filter_map(|(compressed_position, &position)| {
        let ref_allele = self.rows[0].seq[position];
        let alt_allele = row.seq[position];
        (!alt_allele.shares_allele(ref_allele)).then_some(Mutation {
          position,
          compressed_position,
          ref_allele,
          alt_allele,
          par_allele: ref_allele,
        })
      })
      .collect()
  }

  /// Sorted mutation list of the i-th missing sample relative to the reference
  pub fn missing_sample_mutations(&self, missing_index: usize) -> Vec<Mutation> {
    self.row_mutations(self.num_existing + missing_index)
  }

  /// Moves the first `count` missing rows into the existing set, after they have
  /// been placed on the tree, and rebuilds the column tables
  pub fn extend_with_placed(&mut self, count: usize) -> Result<(), Report> {
    if count > self.num_missing() {
      return make_error!(
        "Cannot extend alignment with {} placed rows: only {} are missing",
        count,
        self.num_missing()
      );
    }
    self.num_existing += count;
    self.ungroup_site_pattern();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alphabet::nuc::to_nuc_seq;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn record(name: &str, seq: &str, index: usize) -> SeqRecord {
    SeqRecord {
      seq_name: name.to_owned(),
      seq: to_nuc_seq(seq).unwrap(),
      index,
    }
  }

  fn example() -> Alignment {
    // positions:        0123456
    let rows = vec![
      record("A", "ACGTACG", 0),
      record("B", "ACGTACG", 1),
      record("C", "ACCTACG", 2),
      record("D", "ACGTACT", 3),
    ];
    Alignment::from_records(rows, 3).unwrap()
  }

  #[rstest]
  fn finds_variant_columns() {
    let aln = example();
    assert_eq!(aln.find_perm_col().positions, vec![2, 6]);
    assert_eq!(aln.compressed_position(2), Some(0));
    assert_eq!(aln.compressed_position(6), Some(1));
    assert_eq!(aln.compressed_position(0), None);
  }

  #[rstest]
  fn extracts_missing_sample_mutations() {
    let aln = example();
    let muts = aln.missing_sample_mutations(0);
    assert_eq!(muts.len(), 1);
    assert_eq!(muts[0].position, 6);
    assert_eq!(muts[0].compressed_position, 1);
    assert_eq!(muts[0].alt_allele, Nuc::T);
    assert_eq!(muts[0].par_allele, Nuc::G);
  }

  #[rstest]
  fn ambiguous_sites_compatible_with_reference_are_silent() {
    let rows = vec![
      record("A", "ACGT", 0),
      record("B", "ACGT", 1),
      record("D", "RCGT", 2), // R = A|G shares an allele with reference A
    ];
    let aln = Alignment::from_records(rows, 2).unwrap();
    assert_eq!(aln.num_missing(), 1);
    assert!(aln.missing_sample_mutations(0).is_empty());
  }

  #[rstest]
  fn promotes_placed_rows() -> Result<(), Report> {
    let mut aln = example();
    assert_eq!(aln.num_missing(), 1);
    aln.extend_with_placed(1)?;
    assert_eq!(aln.num_missing(), 0);
    assert_eq!(aln.num_existing(), 4);
    assert!(aln.extend_with_placed(1).is_err());
    Ok(())
  }

  #[rstest]
  fn rejects_bad_row_counts() {
    assert!(Alignment::from_records(vec![], 1).is_err());
    let rows = vec![record("A", "ACGT", 0)];
    assert!(Alignment::from_records(rows, 2).is_err());
  }
}
