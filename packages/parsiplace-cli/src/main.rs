use clap::Parser;
use ctor::ctor;
use eyre::Report;
use log::LevelFilter;
use parsiplace::params::PlacementParams;
use parsiplace::run::run;
use parsiplace::utils::global_init::{global_init, setup_logger};

#[ctor]
fn init() {
  global_init();
}

/// Maximum-parsimony phylogenetic placement.
///
/// Attaches new samples onto a mutation-annotated tree at the most parsimonious
/// branch, searches over insertion orders, and refines the result with
/// subtree-prune-and-regraft moves.
#[derive(Parser, Debug)]
#[command(name = "parsiplace", author, version, verbatim_doc_comment)]
pub struct ParsiplaceArgs {
  #[command(flatten)]
  pub params: PlacementParams,

  /// Verbosity level
  #[arg(long, global = true, default_value_t = LevelFilter::Info)]
  pub verbosity: LevelFilter,

  /// Disable all console output. Same as --verbosity=off
  #[arg(long, global = true, conflicts_with = "verbosity")]
  pub silent: bool,
}

fn main() -> Result<(), Report> {
  let args = ParsiplaceArgs::parse();
  let filter_level = if args.silent { LevelFilter::Off } else { args.verbosity };
  setup_logger(filter_level);
  run(&args.params)
}
