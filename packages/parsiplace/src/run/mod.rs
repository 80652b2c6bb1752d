use crate::alignment::Alignment;
use crate::io::fasta::read_alignment_file_as;
use crate::io::newick::{NewickFlags, read_newick_file, write_newick_file, write_newick_str};
use crate::make_error;
use crate::oracle::MutationOracle;
use crate::params::PlacementParams;
use crate::search::permutation::{OracleEvaluator, search_best_permutation};
use crate::tree::ancestral::init_mutations;
use crate::tree::placement::{PlacementScratch, place_sample};
use crate::tree::spr::{mark_all_spr_candidates, refine};
use crate::tree::tree::Tree;
use eyre::{Report, WrapErr};
use log::{info, warn};
use std::path::Path;
use std::time::Instant;

/// Output file contract: Newick snapshots written along the pipeline
pub const TREE_BEFORE_SPR_FILENAME: &str = "tree1.txt";
pub const TREE_AFTER_SPR_FILENAME: &str = "tree2.txt";
pub const ADDED_TREE_FILENAME: &str = "addedTree.txt";
pub const FINAL_TREE_FILENAME: &str = "newTree.txt";

/// Entry point for one run, from files to files
pub fn run(params: &PlacementParams) -> Result<(), Report> {
  if let Some(jobs) = params.jobs {
    if let Err(error) = rayon::ThreadPoolBuilder::new().num_threads(jobs).build_global() {
      warn!("Could not configure {jobs} worker threads: {error}");
    }
  }

  let aln_path = params.alignment_zip_file.as_ref().unwrap_or(&params.aln_file);
  let records = read_alignment_file_as(aln_path, params.input_format)?;
  let aln = Alignment::from_records(records, params.num_start_rows)
    .wrap_err_with(|| format!("When building the alignment from {aln_path:#?}"))?;

  if params.orig_spr {
    run_original_spr(params, &aln)
  } else {
    place_missing_samples(params, aln)
  }
}

fn read_tree(params: &PlacementParams) -> Result<Tree, Report> {
  let tree_path = params.tree_zip_file.as_ref().unwrap_or(&params.mutation_tree_file);
  read_newick_file(tree_path, params.is_rooted)
}

/// The placement pipeline: Fitch initialisation, in-order placement, optional
/// search over insertion orders, SPR refinement, output files
fn place_missing_samples(params: &PlacementParams, mut aln: Alignment) -> Result<(), Report> {
  let mut tree = read_tree(params)?;
  tree.config_leaf_ids(&aln)?;

  info!("========== Start placement core ==========");
  let start_time = Instant::now();

  let init_score = init_mutations(&mut tree, &aln).wrap_err("In stage initMutation")?;
  info!("Tree parsimony after init mutations: {init_score}");

  let num_samples = aln.num_missing().min(params.num_add_rows.unwrap_or(usize::MAX));
  let base_tree = tree.clone();

  let mut scratch = PlacementScratch::new(aln.find_perm_col().num_compressed());
  for i in 0..num_samples {
    place_sample(&mut tree, &aln, i, &mut scratch)
      .wrap_err_with(|| format!("When placing missing sample '{}'", aln.missing_name(i)))?;
  }
  info!("New tree's parsimony score: {}", tree.parsimony_score_mutation());
  info!("Time: {:.3} seconds", start_time.elapsed().as_secs_f64());
  write_newick_file(&tree, params.output_dir.join(ADDED_TREE_FILENAME), NewickFlags::sorted())?;

  let oracle = MutationOracle;
  if !params.skip_order_search && num_samples > 1 {
    let search_time = Instant::now();
    let evaluator = OracleEvaluator {
      oracle: &oracle,
      tree: &base_tree,
      aln: &aln,
      perm_col: aln.find_perm_col(),
    };
    let (best_score, best_perm) =
      search_best_permutation(&evaluator, num_samples, params.seed).wrap_err("In stage updatePermutation")?;
    info!("Best tree parsimony found after add more k rows: {best_score}");
    info!("Time: {:.3} seconds", search_time.elapsed().as_secs_f64());

    let (_, best_tree) = oracle.place_and_refine_tree(&base_tree, &aln, &best_perm, aln.find_perm_col())?;
    tree = best_tree;
  }

  aln.extend_with_placed(num_samples)?;
  run_spr_stage(&mut tree, &aln, params)?;

  write_newick_file(&tree, params.output_dir.join(FINAL_TREE_FILENAME), NewickFlags::sorted())?;
  info!("Final parsimony score: {}", tree.parsimony_score_mutation());

  maybe_check_tree(params, &tree)?;
  Ok(())
}

/// SPR-only mode: refine the base tree without placing anything
fn run_original_spr(params: &PlacementParams, aln: &Alignment) -> Result<(), Report> {
  let mut tree = read_tree(params)?;
  tree.config_leaf_ids(aln)?;
  init_mutations(&mut tree, aln).wrap_err("In stage initMutation")?;

  run_spr_stage(&mut tree, aln, params)?;

  write_newick_file(&tree, params.output_dir.join(FINAL_TREE_FILENAME), NewickFlags::sorted())?;
  maybe_check_tree(params, &tree)?;
  Ok(())
}

/// Writes the before/after snapshots around a full SPR pass over the tree
fn run_spr_stage(tree: &mut Tree, aln: &Alignment, params: &PlacementParams) -> Result<(), Report> {
  write_newick_file(tree, params.output_dir.join(TREE_BEFORE_SPR_FILENAME), NewickFlags::sorted())?;
  info!("tree's score before running spr: {}", tree.parsimony_score_mutation());

  let spr_time = Instant::now();
  let mut scratch = PlacementScratch::new(aln.find_perm_col().num_compressed());
  mark_all_spr_candidates(tree);
  let score = refine(tree, aln, &mut scratch).wrap_err("In stage sprRefinement")?;
  info!("tree's score after running spr: {score}");
  info!("Time running SPR: {:.3} seconds", spr_time.elapsed().as_secs_f64());

  write_newick_file(tree, params.output_dir.join(TREE_AFTER_SPR_FILENAME), NewickFlags::sorted())
}

fn maybe_check_tree(params: &PlacementParams, tree: &Tree) -> Result<(), Report> {
  if !params.test_spr {
    return Ok(());
  }
  let Some(original_tree_file) = &params.original_tree_file else {
    return make_error!("--test-spr requires --original-tree-file");
  };
  check_tree_against_reference(tree, original_tree_file)?;
  Ok(())
}

/// Topology regression check: roots both trees at the reference tree's first leaf
/// and compares canonical sorted Newick strings
pub fn check_tree_against_reference(tree: &Tree, original_tree_file: impl AsRef<Path>) -> Result<bool, Report> {
  info!("================= Check correct tree ================");
  let mut origin = read_newick_file(original_tree_file.as_ref(), false)?;
  let first_leaf = origin
    .leaves()
    .next()
    .and_then(|id| origin.node(id).name.clone())
    .ok_or_else(|| crate::make_report!("Reference tree has no named leaves"))?;

  let mut ours = tree.clone();
  ours
    .assign_root(&first_leaf)
    .wrap_err("When rooting the output tree at the reference taxon")?;
  origin.assign_root(&first_leaf)?;

  let same =
    write_newick_str(&ours, NewickFlags::topology()) == write_newick_str(&origin, NewickFlags::topology());
  if same {
    info!("Correct tree");
  } else {
    warn!("Wrong tree");
  }
  Ok(same)
}
