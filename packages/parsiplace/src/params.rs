use clap::{Parser, ValueEnum, ValueHint};
use std::path::PathBuf;

#[derive(ValueEnum, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SequenceType {
  /// Nucleotide data (DNA/RNA)
  #[default]
  Dna,
}

#[derive(ValueEnum, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum InputFormat {
  /// Detect FASTA or relaxed PHYLIP from the file contents
  #[default]
  Auto,
  Fasta,
  Phylip,
}

/// Everything one placement run needs. Doubles as the CLI surface: the binary
/// flattens this struct into its argument parser.
#[derive(Parser, Debug, Clone)]
pub struct PlacementParams {
  /// Path to the base tree in Newick format
  #[clap(long = "tree", short = 't')]
  #[clap(value_hint = ValueHint::FilePath)]
  pub mutation_tree_file: PathBuf,

  /// Path to the alignment with the tree's leaves first and the samples to place after them (FASTA or relaxed PHYLIP)
  #[clap(long = "aln", short = 'a')]
  #[clap(value_hint = ValueHint::FilePath)]
  pub aln_file: PathBuf,

  /// Read the alignment from this gzip-compressed file instead of `--aln`
  #[clap(long)]
  #[clap(value_hint = ValueHint::FilePath)]
  pub alignment_zip_file: Option<PathBuf>,

  /// Read the tree from this gzip-compressed file instead of `--tree`
  #[clap(long)]
  #[clap(value_hint = ValueHint::FilePath)]
  pub tree_zip_file: Option<PathBuf>,

  /// Number of leading alignment rows that form the base tree's leaves.
  /// The remaining rows are the missing samples to place.
  #[clap(long, short = 'n')]
  pub num_start_rows: usize,

  /// Maximum number of missing samples to place (clamped to how many there are).
  /// All of them by default.
  #[clap(long, short = 'k')]
  pub num_add_rows: Option<usize>,

  /// Skip placement and run SPR refinement directly on the base tree
  #[clap(long = "orig-spr")]
  pub orig_spr: bool,

  /// After the run, compare the output tree against `--original-tree` and report
  /// whether the topologies match
  #[clap(long = "test-spr")]
  pub test_spr: bool,

  /// Reference tree for `--test-spr`
  #[clap(long)]
  #[clap(value_hint = ValueHint::FilePath)]
  pub original_tree_file: Option<PathBuf>,

  /// Alignment alphabet
  #[clap(long, value_enum, default_value_t = SequenceType::Dna)]
  pub sequence_type: SequenceType,

  /// Alignment file format
  #[clap(long, value_enum, default_value_t = InputFormat::Auto)]
  pub input_format: InputFormat,

  /// Treat the input tree as rooted instead of collapsing a bifurcating root
  #[clap(long)]
  pub is_rooted: bool,

  /// Seed for the sample-order search. Runs with the same seed and inputs
  /// reproduce each other exactly.
  #[clap(long, default_value_t = 1)]
  pub seed: u64,

  /// Place the samples in input order only, skipping the search over insertion
  /// orders
  #[clap(long)]
  pub skip_order_search: bool,

  /// Directory for the output tree files
  #[clap(long, short = 'd', default_value = ".")]
  #[clap(value_hint = ValueHint::DirPath)]
  pub output_dir: PathBuf,

  /// Number of threads for the order-search seed phase. Defaults to all cores.
  #[clap(long, short = 'j')]
  pub jobs: Option<usize>,
}
