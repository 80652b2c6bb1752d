use crate::alignment::Alignment;
use crate::alphabet::nuc::{Nuc, first_allele};
use crate::make_internal_error;
use crate::mutation::Mutation;
use crate::tree::tree::{MoveFlag, Neighbor, NodeId, Tree};
use eyre::Report;

/// Reusable per-scan buffers, indexed by compressed position.
///
/// Owned by the caller and passed into every scan explicitly; rewinding between
/// samples is handled by `load_sample`/`clear_sample`. Stale state across samples
/// is a correctness bug, so the sample loader asserts the buffers are clean.
#[derive(Clone, Debug)]
pub struct PlacementScratch {
  /// Sample alt mask per compressed position; 0 means "equal to reference"
  sample_alt: Vec<u8>,
  /// Whether the sample's allele at the position is an ambiguity code
  sample_ambiguous: Vec<bool>,
  /// Compressed positions the sample mutates, ascending
  sample_positions: Vec<usize>,
  /// Nearest path allele per compressed position, valid when stamped with the
  /// current epoch
  ancestral_alt: Vec<Nuc>,
  ancestral_epoch: Vec<u32>,
  epoch: u32,
}

impl PlacementScratch {
  pub fn new(num_compressed: usize) -> Self {
    Self {
      sample_alt: vec![0; num_compressed],
      sample_ambiguous: vec![false; num_compressed],
      sample_positions: Vec::new(),
      ancestral_alt: vec![Nuc::N; num_compressed],
      ancestral_epoch: vec![0; num_compressed],
      epoch: 0,
    }
  }

  pub fn load_sample(&mut self, sample_mutations: &[Mutation]) -> Result<(), Report> {
    if !self.sample_positions.is_empty() {
      return make_internal_error!("Placement scratch buffers were not rewound after the previous sample");
    }
    for m in sample_mutations {
      self.sample_alt[m.compressed_position] = m.alt_allele.mask();
      self.sample_ambiguous[m.compressed_position] = m.alt_allele.is_ambiguous();
      self.sample_positions.push(m.compressed_position);
    }
    Ok(())
  }

  pub fn clear_sample(&mut self) {
    for &cp in &self.sample_positions {
      self.sample_alt[cp] = 0;
      self.sample_ambiguous[cp] = false;
    }
    self.sample_positions.clear();
  }
}

/// Outcome of scanning one candidate branch
#[derive(Clone, Debug, Default)]
pub struct CandidateScore {
  pub set_difference: u32,
  pub excess_mutations: Vec<Mutation>,
  pub imputed_mutations: Vec<Mutation>,
  pub has_unique: bool,
}

/// The branch chosen for a sample, with everything attachment needs
#[derive(Clone, Debug)]
pub struct BestPlacement {
  pub j: usize,
  pub node: NodeId,
  pub parent: NodeId,
  pub set_difference: u32,
  pub num_leaves: usize,
  pub distance: usize,
  pub has_unique: bool,
  pub excess_mutations: Vec<Mutation>,
  pub imputed_mutations: Vec<Mutation>,
}

/// Reference alleles indexed by compressed position, shared by all scans over one
/// alignment
pub fn reference_alleles(aln: &Alignment) -> Vec<Nuc> {
  let reference = aln.reference();
  aln
    .find_perm_col()
    .positions
    .iter()
    .map(|&position| reference[position])
    .collect()
}

/// Scores one candidate branch: walks the root-to-branch path (branch included),
/// flattens it last-write-wins per position, and derives the mutations the sample
/// would need as a child hanging off this branch.
fn calculate_placement(
  tree: &Tree,
  node: NodeId,
  parent: NodeId,
  parents: &[Option<NodeId>],
  ref_alleles: &[Nuc],
  perm_positions: &[usize],
  scratch: &mut PlacementScratch,
) -> Result<CandidateScore, Report> {
  scratch.epoch += 1;
  let epoch = scratch.epoch;

  // Walk from the branch towards the root; the write nearest to the branch is the
  // last one along the root-to-branch direction, so first-seen wins here
  let mut path_positions: Vec<usize> = Vec::new();
  let mut cur = node;
  let mut par = Some(parent);
  while let Some(p) = par {
    let edge = tree
      .half_edge(p, cur)
      .ok_or_else(|| crate::make_internal_report!("Missing half-edge {p} -> {cur}"))?;
    for m in &edge.mutations {
      let cp = m.compressed_position;
      if scratch.ancestral_epoch[cp] != epoch {
        scratch.ancestral_epoch[cp] = epoch;
        scratch.ancestral_alt[cp] = m.alt_allele;
        path_positions.push(cp);
      }
    }
    cur = p;
    par = parents[p];
  }
  // The root's baseline sits above every edge, so it applies only where the path
  // has not already written
  for m in &tree.root_mutations {
    let cp = m.compressed_position;
    if scratch.ancestral_epoch[cp] != epoch {
      scratch.ancestral_epoch[cp] = epoch;
      scratch.ancestral_alt[cp] = m.alt_allele;
      path_positions.push(cp);
    }
  }
  path_positions.sort_unstable();

  let branch_mutations = &tree
    .half_edge(parent, node)
    .ok_or_else(|| crate::make_internal_report!("Missing half-edge {parent} -> {node}"))?
    .mutations;

  let mut score = CandidateScore::default();
  let push_position = |cp: usize, score: &mut CandidateScore| -> Result<(), Report> {
    let anc_allele = if scratch.ancestral_epoch[cp] == epoch {
      scratch.ancestral_alt[cp]
    } else {
      ref_alleles[cp]
    };
    let sample_mask = if scratch.sample_alt[cp] != 0 {
      scratch.sample_alt[cp]
    } else {
      ref_alleles[cp].mask()
    };

    if sample_mask & anc_allele.mask() == 0 {
      // The sample state cannot be explained by the path: a new mutation is needed
      let alt_allele = first_allele(sample_mask)
        .ok_or_else(|| crate::make_internal_report!("Empty sample allele mask at compressed position {cp}"))?;
      let mutation = Mutation {
        position: perm_positions[cp],
        compressed_position: cp,
        ref_allele: ref_alleles[cp],
        par_allele: anc_allele,
        alt_allele,
      };
      if !branch_mutations.iter().any(|m| m.matches(&mutation)) {
        score.has_unique = true;
      }
      score.excess_mutations.push(mutation);
      score.set_difference += 1;
      if scratch.sample_alt[cp] != 0 && scratch.sample_ambiguous[cp] {
        score.imputed_mutations.push(mutation);
      }
    } else if scratch.sample_alt[cp] != 0 && scratch.sample_ambiguous[cp] {
      // Ambiguous but compatible with the path: resolve towards the path allele
      let resolved = first_allele(sample_mask & anc_allele.mask())
        .ok_or_else(|| crate::make_internal_report!("Empty resolution mask at compressed position {cp}"))?;
      score.imputed_mutations.push(Mutation {
        position: perm_positions[cp],
        compressed_position: cp,
        ref_allele: ref_alleles[cp],
        par_allele: anc_allele,
        alt_allele: resolved,
      });
    }
    Ok(())
  };

  // Merge-walk the sample's positions with the path's, ascending, each visited once
  let (mut i, mut j) = (0, 0);
  while i < scratch.sample_positions.len() || j < path_positions.len() {
    let cp = match (scratch.sample_positions.get(i), path_positions.get(j)) {
      (Some(&s), Some(&p)) => {
        if s <= p {
          if s == p {
            j += 1;
          }
          i += 1;
          s
        } else {
          j += 1;
          p
        }
      }
      (Some(&s), None) => {
        i += 1;
        s
      }
      (None, Some(&p)) => {
        j += 1;
        p
      }
      (None, None) => break,
    };
    push_position(cp, &mut score)?;
  }

  Ok(score)
}

/// Scans every candidate branch in BFS order and returns the best placement.
///
/// Minimises `set_difference`; ties go to the branch with fewer leaves below it,
/// then smaller distance from the root, then the earlier BFS index. No randomness.
pub fn find_best_placement(
  tree: &Tree,
  sample_mutations: &[Mutation],
  aln: &Alignment,
  scratch: &mut PlacementScratch,
) -> Result<BestPlacement, Report> {
  let bfs = tree.breadth_first_expansion();
  if bfs.is_empty() {
    return make_internal_error!("Cannot place a sample on a tree without branches");
  }
  let leaf_counts = tree.subtree_leaf_counts(&bfs);
  let ref_alleles = reference_alleles(aln);
  let perm_positions = &aln.find_perm_col().positions;

  let mut parents: Vec<Option<NodeId>> = vec![None; tree.num_nodes()];
  for entry in &bfs {
    parents[entry.node] = Some(entry.parent);
  }

  scratch.load_sample(sample_mutations)?;

  let mut best: Option<BestPlacement> = None;
  for (j, entry) in bfs.iter().enumerate() {
    let score = calculate_placement(
      tree,
      entry.node,
      entry.parent,
      &parents,
      &ref_alleles,
      perm_positions,
      scratch,
    )?;

    let key = (score.set_difference, leaf_counts[entry.node], entry.distance);
    let is_better = best
      .as_ref()
      .is_none_or(|b| key < (b.set_difference, b.num_leaves, b.distance));
    if is_better {
      best = Some(BestPlacement {
        j,
        node: entry.node,
        parent: entry.parent,
        set_difference: score.set_difference,
        num_leaves: leaf_counts[entry.node],
        distance: entry.distance,
        has_unique: score.has_unique,
        excess_mutations: score.excess_mutations,
        imputed_mutations: score.imputed_mutations,
      });
    }
  }

  scratch.clear_sample();
  best.ok_or_else(|| crate::make_internal_report!("Branch scan selected no placement"))
}

/// Attaches a new sample at the chosen branch.
///
/// When the sample needs no mutations and matches an internal endpoint, it hangs
/// directly off that node with an empty edge. Otherwise the branch is split at a new
/// internal node `x`: branch mutations the sample agrees with stay above `x`,
/// contradicted ones move below, and the leaf edge carries the excess re-anchored at
/// `x`. Returns the new leaf's node id.
pub fn add_new_sample(
  tree: &mut Tree,
  best: &BestPlacement,
  sample_id: usize,
  name: &str,
  seq_id: usize,
) -> Result<NodeId, Report> {
  if best.excess_mutations.is_empty() && !tree.is_leaf(best.node) {
    let leaf = tree.add_node(Some(name.to_owned()));
    tree.node_mut(leaf).seq_id = Some(seq_id);
    tree.node_mut(leaf).missing_index = Some(sample_id);
    tree.connect(best.node, leaf, 0.0);
    mark_movable(tree, best.node, leaf);
    return Ok(leaf);
  }

  let parent = best.parent;
  let child = best.node;
  let Some(parent_idx) = tree.neighbor_index(parent, child) else {
    return make_internal_error!("addNewSample: nodes {parent} and {child} are not adjacent");
  };
  let Some(child_idx) = tree.neighbor_index(child, parent) else {
    return make_internal_error!("addNewSample: nodes {child} and {parent} are not adjacent");
  };

  let branch_mutations = tree.node(parent).neighbors[parent_idx].mutations.clone();
  let half_length = tree.node(parent).neighbors[parent_idx].length / 2.0;

  // Bisect the branch list around the excess positions: agreed mutations stay on
  // the upper half, contradicted ones sink below the split
  let has_excess_at = |position: usize| best.excess_mutations.iter().any(|e| e.position == position);
  let (lower, upper): (Vec<Mutation>, Vec<Mutation>) =
    branch_mutations.iter().partition(|m| has_excess_at(m.position));

  // Excess mutations were derived against the branch endpoint; re-anchor their
  // parent alleles at the split point
  let mut leaf_mutations = Vec::with_capacity(best.excess_mutations.len());
  for e in &best.excess_mutations {
    match lower.iter().find(|m| m.position == e.position) {
      Some(m) if e.alt_allele.shares_allele(m.par_allele) => {} // reversion of a sunk mutation: nothing left to explain
      Some(m) => leaf_mutations.push(Mutation {
        par_allele: m.par_allele,
        ..*e
      }),
      None => leaf_mutations.push(*e),
    }
  }

  let x = tree.add_node(None);
  tree.node_mut(x).missing_index = Some(sample_id);

  // Rewire in place so neighbour order, and hence BFS order, stays deterministic
  let upper_branch_id = tree.node(parent).neighbors[parent_idx].branch_id;
  let lower_branch_id = tree.next_branch_id();
  {
    let nb = &mut tree.node_mut(parent).neighbors[parent_idx];
    nb.node = x;
    nb.length = half_length;
    nb.mutations = upper;
  }
  {
    let nb = &mut tree.node_mut(child).neighbors[child_idx];
    nb.node = x;
    nb.length = half_length;
    nb.branch_id = lower_branch_id;
    debug_assert!(nb.mutations.is_empty());
  }
  tree.node_mut(x).neighbors.push(Neighbor::new(parent, half_length, upper_branch_id));
  let mut lower_half = Neighbor::new(child, half_length, lower_branch_id);
  lower_half.mutations = lower;
  tree.node_mut(x).neighbors.push(lower_half);

  let leaf = tree.add_node(Some(name.to_owned()));
  tree.node_mut(leaf).seq_id = Some(seq_id);
  tree.node_mut(leaf).missing_index = Some(sample_id);
  let leaf_branch_id = tree.next_branch_id();
  let mut leaf_half = Neighbor::new(leaf, 0.0, leaf_branch_id);
  leaf_half.mutations = leaf_mutations;
  tree.node_mut(x).neighbors.push(leaf_half);
  tree.node_mut(leaf).neighbors.push(Neighbor::new(x, 0.0, leaf_branch_id));
  mark_movable(tree, x, leaf);

  Ok(leaf)
}

fn mark_movable(tree: &mut Tree, a: NodeId, b: NodeId) {
  if let Some(nb) = tree.half_edge_mut(a, b) {
    nb.flag = MoveFlag::Movable { spr_eligible: true };
  }
  if let Some(nb) = tree.half_edge_mut(b, a) {
    nb.flag = MoveFlag::Movable { spr_eligible: true };
  }
}

/// Places one missing sample end to end: scan, attach, rewind
pub fn place_sample(
  tree: &mut Tree,
  aln: &Alignment,
  missing_index: usize,
  scratch: &mut PlacementScratch,
) -> Result<BestPlacement, Report> {
  let sample_mutations = aln.missing_sample_mutations(missing_index);
  let best = find_best_placement(tree, &sample_mutations, aln, scratch)?;
  add_new_sample(
    tree,
    &best,
    missing_index,
    aln.missing_name(missing_index),
    aln.missing_row_id(missing_index),
  )?;
  Ok(best)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::io::fasta::read_alignment_str;
  use crate::io::newick::{NewickFlags, read_newick_str, write_newick_str};
  use crate::tree::ancestral::init_mutations;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn setup(newick: &str, fasta: &str, num_start_rows: usize) -> Result<(Tree, Alignment, PlacementScratch), Report> {
    let aln = Alignment::from_records(read_alignment_str(fasta)?, num_start_rows)?;
    let mut tree = read_newick_str(newick, false)?;
    tree.config_leaf_ids(&aln)?;
    init_mutations(&mut tree, &aln)?;
    let scratch = PlacementScratch::new(aln.find_perm_col().num_compressed());
    Ok((tree, aln, scratch))
  }

  #[rstest]
  fn identical_sample_lands_on_matching_leaf_branch() -> Result<(), Report> {
    // D equals A at every position: zero excess, placed on the A leaf edge
    let (tree, aln, mut scratch) = setup(
      "((A:1,B:1):1,C:1);",
      ">A\nACGTT\n>B\nACGTA\n>C\nAGGTA\n>D\nACGTT\n",
      3,
    )?;
    let muts = aln.missing_sample_mutations(0);
    let best = find_best_placement(&tree, &muts, &aln, &mut scratch)?;
    assert_eq!(best.set_difference, 0);
    assert!(best.excess_mutations.is_empty());
    assert_eq!(tree.node(best.node).name.as_deref(), Some("A"));
    Ok(())
  }

  #[rstest]
  fn disjoint_sample_reports_unique_mutation() -> Result<(), Report> {
    // D carries a mutation no branch has
    let (tree, aln, mut scratch) = setup(
      "((A:1,B:1):1,C:1);",
      ">A\nACGTACGT\n>B\nACGTACGT\n>C\nACGAACGT\n>D\nACGTACCT\n",
      3,
    )?;
    let muts = aln.missing_sample_mutations(0);
    let best = find_best_placement(&tree, &muts, &aln, &mut scratch)?;
    assert_eq!(best.set_difference, 1);
    assert!(best.has_unique);
    Ok(())
  }

  #[rstest]
  fn tie_breaks_by_subtree_leaf_count() -> Result<(), Report> {
    // E needs exactly one extra mutation both at the (C,D) clade branch and at the
    // leaf branch below C; the leaf branch has fewer leaves below it and must win
    let (tree, aln, mut scratch) = setup(
      "((A:1,B:1):1,(C:1,D:1):1);",
      ">A\nTTTT\n>B\nTTTT\n>C\nATTT\n>D\nATAT\n>E\nATTG\n",
      4,
    )?;
    let muts = aln.missing_sample_mutations(0);
    let best = find_best_placement(&tree, &muts, &aln, &mut scratch)?;
    assert_eq!(best.set_difference, 1);
    assert_eq!(best.num_leaves, 1);
    assert_eq!(tree.node(best.node).name.as_deref(), Some("C"));
    Ok(())
  }

  #[rstest]
  fn ambiguous_site_is_imputed_from_the_path() -> Result<(), Report> {
    // D carries K = G|T at a site where the branch to C carries G: the site is
    // explained, and the ambiguity resolves to the path allele
    let (tree, aln, mut scratch) = setup(
      "((A:1,B:1):1,C:1);",
      ">A\nAAAA\n>B\nAAAA\n>C\nGAAA\n>D\nKAAA\n",
      3,
    )?;
    let muts = aln.missing_sample_mutations(0);
    assert_eq!(muts.len(), 1);
    assert!(muts[0].alt_allele.is_ambiguous());

    let best = find_best_placement(&tree, &muts, &aln, &mut scratch)?;
    assert_eq!(best.set_difference, 0);
    assert_eq!(tree.node(best.node).name.as_deref(), Some("C"));
    assert_eq!(best.imputed_mutations.len(), 1);
    assert_eq!(best.imputed_mutations[0].alt_allele, Nuc::G);
    Ok(())
  }

  #[rstest]
  fn placement_adds_one_internal_node_and_one_leaf() -> Result<(), Report> {
    let (mut tree, aln, mut scratch) = setup(
      "((A:1,B:1):1,C:1);",
      ">A\nACGTACGT\n>B\nACGTACGT\n>C\nACGAACGT\n>D\nACGTACCT\n",
      3,
    )?;
    let nodes_before = tree.num_nodes();
    let score_before = tree.parsimony_score_mutation();
    let best = place_sample(&mut tree, &aln, 0, &mut scratch)?;
    assert_eq!(tree.num_nodes(), nodes_before + 2);
    assert_eq!(tree.parsimony_score_mutation(), score_before + best.set_difference);
    let leaf = tree.find_by_name("D").expect("placed leaf missing");
    assert!(tree.is_leaf(leaf));
    assert_eq!(tree.node(leaf).missing_index, Some(0));
    Ok(())
  }

  #[rstest]
  fn placement_score_is_optimal_over_all_branches() -> Result<(), Report> {
    // The attached tree's score equals the pre-placement score plus the minimum
    // set-difference over every candidate branch
    let (mut tree, aln, mut scratch) = setup(
      "((A:1,B:1):1,(C:1,D:1):1);",
      ">A\nTCGATT\n>B\nTCGATA\n>C\nGCTATA\n>D\nGCTAAA\n>E\nGCGATA\n",
      4,
    )?;
    let muts = aln.missing_sample_mutations(0);

    let bfs = tree.breadth_first_expansion();
    let mut parents = vec![None; tree.num_nodes()];
    for entry in &bfs {
      parents[entry.node] = Some(entry.parent);
    }
    let ref_alleles = reference_alleles(&aln);
    let perm_positions = aln.find_perm_col().positions.clone();
    let mut all_scores = Vec::new();
    scratch.load_sample(&muts)?;
    for entry in &bfs {
      let score = calculate_placement(
        &tree,
        entry.node,
        entry.parent,
        &parents,
        &ref_alleles,
        &perm_positions,
        &mut scratch,
      )?;
      all_scores.push(score.set_difference);
    }
    scratch.clear_sample();
    let min_score = *all_scores.iter().min().expect("no candidate branches");

    let score_before = tree.parsimony_score_mutation();
    let best = place_sample(&mut tree, &aln, 0, &mut scratch)?;
    assert_eq!(best.set_difference, min_score);
    assert!(tree.parsimony_score_mutation() <= score_before + min_score);
    Ok(())
  }

  #[rstest]
  fn placement_is_deterministic() -> Result<(), Report> {
    let newick = "((A:1,B:1):1,(C:1,D:1):1);";
    let fasta = ">A\nTCGATT\n>B\nTCGATA\n>C\nGCTATA\n>D\nGCTAAA\n>E\nGCGATA\n>F\nTCGTTT\n";
    let run = || -> Result<String, Report> {
      let (mut tree, aln, mut scratch) = setup(newick, fasta, 4)?;
      for i in 0..aln.num_missing() {
        place_sample(&mut tree, &aln, i, &mut scratch)?;
      }
      Ok(write_newick_str(&tree, NewickFlags::sorted()))
    };
    assert_eq!(run()?, run()?);
    Ok(())
  }

  #[rstest]
  fn scratch_buffers_rewind_between_samples() -> Result<(), Report> {
    let (tree, aln, mut scratch) = setup(
      "((A:1,B:1):1,C:1);",
      ">A\nACGTACGT\n>B\nACGTACGT\n>C\nACGAACGT\n>D\nACGTACCT\n",
      3,
    )?;
    let muts = aln.missing_sample_mutations(0);
    let first = find_best_placement(&tree, &muts, &aln, &mut scratch)?;
    for _ in 0..3 {
      let again = find_best_placement(&tree, &muts, &aln, &mut scratch)?;
      assert_eq!(again.j, first.j);
      assert_eq!(again.set_difference, first.set_difference);
      assert_eq!(again.excess_mutations, first.excess_mutations);
    }
    Ok(())
  }

  #[rstest]
  fn detects_unrewound_scratch() -> Result<(), Report> {
    let (_tree, aln, mut scratch) = setup(
      "((A:1,B:1):1,C:1);",
      ">A\nACGTACGT\n>B\nACGTACGT\n>C\nACGAACGT\n>D\nACGTACCT\n",
      3,
    )?;
    let muts = aln.missing_sample_mutations(0);
    scratch.load_sample(&muts)?;
    assert!(scratch.load_sample(&muts).is_err());
    Ok(())
  }
}
