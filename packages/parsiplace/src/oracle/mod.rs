use crate::alignment::{Alignment, PermCol};
use crate::tree::placement::{PlacementScratch, place_sample};
use crate::tree::spr::refine;
use crate::tree::tree::Tree;
use eyre::{Report, WrapErr};
use log::warn;

/// Score of one placement-order evaluation. `Score` sorts before `Unplaceable`, so
/// a poisoned candidate loses against any real score.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlacementScore {
  Score(u32),
  Unplaceable,
}

impl PlacementScore {
  pub const fn is_unplaceable(self) -> bool {
    matches!(self, PlacementScore::Unplaceable)
  }
}

impl std::fmt::Display for PlacementScore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      PlacementScore::Score(score) => write!(f, "{score}"),
      PlacementScore::Unplaceable => write!(f, "unplaceable"),
    }
  }
}

/// Pluggable parsimony scoring backend. The engine treats the oracle as opaque:
/// any backend that can score a tree and evaluate a placement order qualifies.
pub trait ParsimonyOracle: Sync {
  fn score(&self, tree: &Tree, aln: &Alignment) -> u32;

  /// Places the missing samples in the given order on a deep copy of the tree,
  /// refines with SPR moves, and returns the resulting parsimony score
  fn place_and_refine(&self, tree: &Tree, aln: &Alignment, perm: &[usize], perm_col: &PermCol) -> PlacementScore;
}

/// The in-repo backend: placement and SPR both run on the mutation-annotated tree
#[derive(Clone, Copy, Debug, Default)]
pub struct MutationOracle;

impl MutationOracle {
  /// Like `place_and_refine`, but hands back the refined tree as well
  pub fn place_and_refine_tree(
    &self,
    tree: &Tree,
    aln: &Alignment,
    perm: &[usize],
    perm_col: &PermCol,
  ) -> Result<(u32, Tree), Report> {
    let mut work = tree.clone();
    let mut scratch = PlacementScratch::new(perm_col.num_compressed());
    for &missing_index in perm {
      place_sample(&mut work, aln, missing_index, &mut scratch)
        .wrap_err_with(|| format!("When placing missing sample #{missing_index}"))?;
    }
    let score = refine(&mut work, aln, &mut scratch).wrap_err("When running SPR refinement")?;
    Ok((score, work))
  }
}

impl ParsimonyOracle for MutationOracle {
  fn score(&self, tree: &Tree, _aln: &Alignment) -> u32 {
    tree.parsimony_score_mutation()
  }

  fn place_and_refine(&self, tree: &Tree, aln: &Alignment, perm: &[usize], perm_col: &PermCol) -> PlacementScore {
    match self.place_and_refine_tree(tree, aln, perm, perm_col) {
      Ok((score, _)) => PlacementScore::Score(score),
      Err(report) => {
        warn!("Treating permutation as unplaceable: {report:#}");
        PlacementScore::Unplaceable
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::io::fasta::read_alignment_str;
  use crate::io::newick::{NewickFlags, read_newick_str, write_newick_str};
  use crate::tree::ancestral::init_mutations;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn setup() -> Result<(Tree, Alignment), Report> {
    let fasta = ">A\nTCGATT\n>B\nTCGATA\n>C\nGCTATA\n>D\nGCTAAA\n>E\nGCGATA\n>F\nTCGTTT\n";
    let aln = Alignment::from_records(read_alignment_str(fasta)?, 4)?;
    let mut tree = read_newick_str("((A:1,B:1):1,(C:1,D:1):1);", false)?;
    tree.config_leaf_ids(&aln)?;
    init_mutations(&mut tree, &aln)?;
    Ok((tree, aln))
  }

  #[rstest]
  fn scores_sort_before_unplaceable() {
    assert!(PlacementScore::Score(10) < PlacementScore::Unplaceable);
    assert!(PlacementScore::Score(3) < PlacementScore::Score(4));
  }

  #[rstest]
  fn evaluation_leaves_the_callers_tree_untouched() -> Result<(), Report> {
    let (tree, aln) = setup()?;
    let before = write_newick_str(&tree, NewickFlags::sorted());
    let score_before = tree.parsimony_score_mutation();

    let oracle = MutationOracle;
    let score = oracle.place_and_refine(&tree, &aln, &[0, 1], aln.find_perm_col());
    assert!(!score.is_unplaceable());

    assert_eq!(write_newick_str(&tree, NewickFlags::sorted()), before);
    assert_eq!(tree.parsimony_score_mutation(), score_before);
    Ok(())
  }

  #[rstest]
  fn small_k_search_returns_the_brute_force_minimum() -> Result<(), Report> {
    use crate::search::permutation::{OracleEvaluator, search_best_permutation};
    use itertools::Itertools;

    let fasta = ">A\nTCGATT\n>B\nTCGATA\n>C\nGCTATA\n>D\nGCTAAA\n>E\nGCGATA\n>F\nTCGTTT\n>G\nGCTATT\n";
    let aln = Alignment::from_records(crate::io::fasta::read_alignment_str(fasta)?, 4)?;
    let mut tree = crate::io::newick::read_newick_str("((A:1,B:1):1,(C:1,D:1):1);", false)?;
    tree.config_leaf_ids(&aln)?;
    crate::tree::ancestral::init_mutations(&mut tree, &aln)?;

    let oracle = MutationOracle;
    let brute_force = (0..3)
      .permutations(3)
      .map(|perm| oracle.place_and_refine(&tree, &aln, &perm, aln.find_perm_col()))
      .min()
      .expect("six permutations");

    let evaluator = OracleEvaluator {
      oracle: &oracle,
      tree: &tree,
      aln: &aln,
      perm_col: aln.find_perm_col(),
    };
    let (best_score, best_perm) = search_best_permutation(&evaluator, 3, 7)?;
    assert_eq!(best_score, brute_force);
    assert_eq!(best_perm.len(), 3);
    Ok(())
  }

  #[rstest]
  fn refined_score_never_exceeds_placed_score() -> Result<(), Report> {
    let (tree, aln) = setup()?;
    let oracle = MutationOracle;

    // Place without refinement for comparison
    let mut placed = tree.clone();
    let mut scratch = PlacementScratch::new(aln.find_perm_col().num_compressed());
    for i in 0..aln.num_missing() {
      place_sample(&mut placed, &aln, i, &mut scratch)?;
    }
    let placed_score = placed.parsimony_score_mutation();

    let (refined_score, _) = oracle.place_and_refine_tree(&tree, &aln, &[0, 1], aln.find_perm_col())?;
    assert!(refined_score <= placed_score);
    Ok(())
  }
}
