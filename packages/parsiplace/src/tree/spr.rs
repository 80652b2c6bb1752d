use crate::alignment::Alignment;
use crate::make_internal_error;
use crate::mutation::Mutation;
use crate::tree::placement::{BestPlacement, PlacementScratch, find_best_placement};
use crate::tree::tree::{MoveFlag, Neighbor, NodeId, Tree};
use eyre::Report;
use log::debug;

/// A full pass over the candidates stops improving eventually; this bounds the
/// number of passes either way
const MAX_SPR_ROUNDS: usize = 10;

/// Everything needed to put a pruned subtree back where it was
struct PruneUndo {
  x: NodeId,
  p: NodeId,
  c: NodeId,
  p_idx_in_x: usize,
  c_idx_in_x: usize,
  lower_mutations: Vec<Mutation>,
  upper_length: f64,
  lower_length: f64,
  lower_branch_id: usize,
}

/// Flattens two consecutive edge lists into the list of the merged edge.
/// A change undone further down cancels out entirely.
fn merge_edge_mutations(upper: &[Mutation], lower: &[Mutation]) -> Vec<Mutation> {
  let mut out = Vec::with_capacity(upper.len() + lower.len());
  let (mut i, mut j) = (0, 0);
  while i < upper.len() || j < lower.len() {
    if j >= lower.len() || (i < upper.len() && upper[i].position < lower[j].position) {
      out.push(upper[i]);
      i += 1;
    } else if i >= upper.len() || upper[i].position > lower[j].position {
      out.push(lower[j]);
      j += 1;
    } else {
      let combined = Mutation {
        par_allele: upper[i].par_allele,
        ..lower[j]
      };
      if !combined.alt_allele.shares_allele(combined.par_allele) {
        out.push(combined);
      }
      i += 1;
      j += 1;
    }
  }
  out
}

fn is_prunable(tree: &Tree, leaf: NodeId) -> bool {
  if !tree.is_leaf(leaf) || leaf == tree.root {
    return false;
  }
  let x = tree.node(leaf).neighbors[0].node;
  x != tree.root && tree.node(x).neighbors.len() == 3
}

/// Detaches the pendant pair (leaf + its attachment node `x`) from the tree,
/// merging the two flanking half-edges into one. The upper half-edge's previous
/// mutation list is kept in `saved_mutations` for rollback.
fn prune_leaf(tree: &mut Tree, leaf: NodeId, parents: &[Option<NodeId>]) -> Result<PruneUndo, Report> {
  let x = tree.node(leaf).neighbors[0].node;
  let Some(p) = parents[x] else {
    return make_internal_error!("SPR prune: attachment node {x} has no parent");
  };
  let Some(c) = tree
    .node(x)
    .neighbors
    .iter()
    .find_map(|nb| (nb.node != p && nb.node != leaf).then_some(nb.node))
  else {
    return make_internal_error!("SPR prune: attachment node {x} has no child to merge");
  };

  let p_idx_in_x = tree.neighbor_index(x, p).expect("x must neighbor its parent");
  let c_idx_in_x = tree.neighbor_index(x, c).expect("x must neighbor its child");
  let upper_length = tree.node(x).neighbors[p_idx_in_x].length;
  let lower_half = &tree.node(x).neighbors[c_idx_in_x];
  let lower_length = lower_half.length;
  let lower_branch_id = lower_half.branch_id;
  let lower_mutations = lower_half.mutations.clone();

  let upper_mutations = &tree
    .half_edge(p, x)
    .ok_or_else(|| crate::make_internal_report!("Missing half-edge {p} -> {x}"))?
    .mutations;
  let merged = merge_edge_mutations(upper_mutations, &lower_mutations);

  let p_idx = tree.neighbor_index(p, x).expect("parent must neighbor x");
  let merged_branch_id = tree.node(p).neighbors[p_idx].branch_id;
  {
    let nb = &mut tree.node_mut(p).neighbors[p_idx];
    nb.save_mutations();
    nb.node = c;
    nb.length = upper_length + lower_length;
    nb.mutations = merged;
  }
  {
    let c_idx = tree.neighbor_index(c, x).expect("child must neighbor x");
    let nb = &mut tree.node_mut(c).neighbors[c_idx];
    nb.node = p;
    nb.length = upper_length + lower_length;
    nb.branch_id = merged_branch_id;
  }

  // The pruned pair keeps only its internal leaf edge
  let neighbors = &mut tree.node_mut(x).neighbors;
  let (first, second) = if p_idx_in_x > c_idx_in_x {
    (p_idx_in_x, c_idx_in_x)
  } else {
    (c_idx_in_x, p_idx_in_x)
  };
  neighbors.remove(first);
  neighbors.remove(second);

  Ok(PruneUndo {
    x,
    p,
    c,
    p_idx_in_x,
    c_idx_in_x,
    lower_mutations,
    upper_length,
    lower_length,
    lower_branch_id,
  })
}

/// Puts a pruned pair back at its original location, restoring the saved edge lists
fn restore_pruned(tree: &mut Tree, undo: PruneUndo) -> Result<(), Report> {
  let PruneUndo {
    x,
    p,
    c,
    p_idx_in_x,
    c_idx_in_x,
    lower_mutations,
    upper_length,
    lower_length,
    lower_branch_id,
  } = undo;

  let upper_branch_id = {
    let p_idx = tree
      .neighbor_index(p, c)
      .ok_or_else(|| crate::make_internal_report!("SPR rollback: merged edge {p} -> {c} is gone"))?;
    let nb = &mut tree.node_mut(p).neighbors[p_idx];
    nb.node = x;
    nb.length = upper_length;
    nb.restore_mutations();
    nb.branch_id
  };
  {
    let c_idx = tree
      .neighbor_index(c, p)
      .ok_or_else(|| crate::make_internal_report!("SPR rollback: merged edge {c} -> {p} is gone"))?;
    let nb = &mut tree.node_mut(c).neighbors[c_idx];
    nb.node = x;
    nb.length = lower_length;
    nb.branch_id = lower_branch_id;
  }

  let mut upper_half = Neighbor::new(p, upper_length, upper_branch_id);
  upper_half.mutations = Vec::new();
  let mut lower_half = Neighbor::new(c, lower_length, lower_branch_id);
  lower_half.mutations = lower_mutations;
  let (first, second) = if p_idx_in_x < c_idx_in_x {
    ((p_idx_in_x, upper_half), (c_idx_in_x, lower_half))
  } else {
    ((c_idx_in_x, lower_half), (p_idx_in_x, upper_half))
  };
  tree.node_mut(x).neighbors.insert(first.0, first.1);
  tree.node_mut(x).neighbors.insert(second.0, second.1);
  Ok(())
}

/// Splices a pruned pair into the chosen branch, mirroring the placement split:
/// agreed branch mutations stay above the attachment node, contradicted ones sink
/// below, the leaf edge carries the re-anchored excess.
fn regraft(tree: &mut Tree, x: NodeId, leaf: NodeId, best: &BestPlacement) -> Result<(), Report> {
  let parent = best.parent;
  let child = best.node;
  let Some(parent_idx) = tree.neighbor_index(parent, child) else {
    return make_internal_error!("SPR regraft: nodes {parent} and {child} are not adjacent");
  };
  let Some(child_idx) = tree.neighbor_index(child, parent) else {
    return make_internal_error!("SPR regraft: nodes {child} and {parent} are not adjacent");
  };

  let branch_mutations = tree.node(parent).neighbors[parent_idx].mutations.clone();
  let half_length = tree.node(parent).neighbors[parent_idx].length / 2.0;

  let has_excess_at = |position: usize| best.excess_mutations.iter().any(|e| e.position == position);
  let (lower, upper): (Vec<Mutation>, Vec<Mutation>) =
    branch_mutations.iter().partition(|m| has_excess_at(m.position));

  let mut leaf_mutations = Vec::with_capacity(best.excess_mutations.len());
  for e in &best.excess_mutations {
    match lower.iter().find(|m| m.position == e.position) {
      Some(m) if e.alt_allele.shares_allele(m.par_allele) => {}
      Some(m) => leaf_mutations.push(Mutation {
        par_allele: m.par_allele,
        ..*e
      }),
      None => leaf_mutations.push(*e),
    }
  }

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
  }
  tree.node_mut(x).neighbors.push(Neighbor::new(parent, half_length, upper_branch_id));
  let mut lower_half = Neighbor::new(child, half_length, lower_branch_id);
  lower_half.mutations = lower;
  tree.node_mut(x).neighbors.push(lower_half);

  if let Some(nb) = tree.half_edge_mut(x, leaf) {
    nb.mutations = leaf_mutations;
  }
  Ok(())
}

/// Marks every leaf branch that can legally be pruned as SPR-eligible
pub fn mark_all_spr_candidates(tree: &mut Tree) {
  let leaves: Vec<NodeId> = tree.leaves().collect();
  for leaf in leaves {
    if is_prunable(tree, leaf) {
      let x = tree.node(leaf).neighbors[0].node;
      if let Some(nb) = tree.half_edge_mut(x, leaf) {
        nb.flag = MoveFlag::Movable { spr_eligible: true };
      }
      if let Some(nb) = tree.half_edge_mut(leaf, x) {
        nb.flag = MoveFlag::Movable { spr_eligible: true };
      }
    }
  }
}

/// One prune-and-regraft attempt for a single leaf. Keeps the move iff the total
/// parsimony score does not increase; otherwise rolls back to the saved edges.
/// Returns the score delta (never positive).
fn try_spr_move(
  tree: &mut Tree,
  aln: &Alignment,
  leaf: NodeId,
  scratch: &mut PlacementScratch,
) -> Result<i64, Report> {
  let score_before = i64::from(tree.parsimony_score_mutation());

  let bfs = tree.breadth_first_expansion();
  let mut parents: Vec<Option<NodeId>> = vec![None; tree.num_nodes()];
  for entry in &bfs {
    parents[entry.node] = Some(entry.parent);
  }

  let x = tree.node(leaf).neighbors[0].node;
  let undo = prune_leaf(tree, leaf, &parents)?;

  let Some(seq_id) = tree.node(leaf).seq_id else {
    return make_internal_error!("SPR: leaf {leaf} has no alignment row");
  };
  let sample_mutations = aln.row_mutations(seq_id);
  let best = find_best_placement(tree, &sample_mutations, aln, scratch)?;

  regraft(tree, x, leaf, &best)?;
  let score_after = i64::from(tree.parsimony_score_mutation());

  // Only strictly improving moves survive; an equal-score relocation is undone so
  // passes cannot cycle through neutral rearrangements
  if score_after >= score_before {
    let bfs = tree.breadth_first_expansion();
    let mut parents = vec![None; tree.num_nodes()];
    for entry in &bfs {
      parents[entry.node] = Some(entry.parent);
    }
    let _undo_retry = prune_leaf(tree, leaf, &parents)?;
    restore_pruned(tree, undo)?;
    return Ok(0);
  }

  Ok(score_after - score_before)
}

/// Runs prune-and-regraft passes over all SPR-eligible leaf branches until a full
/// pass yields no improvement. Returns the final parsimony score.
///
/// The score never increases: a worsening regraft is rolled back, and re-placement
/// at the original branch is always among the scanned candidates.
pub fn refine(tree: &mut Tree, aln: &Alignment, scratch: &mut PlacementScratch) -> Result<u32, Report> {
  for round in 1..=MAX_SPR_ROUNDS {
    let candidates: Vec<NodeId> = tree
      .breadth_first_expansion()
      .iter()
      .map(|entry| entry.node)
      .filter(|&node| {
        tree.is_leaf(node)
          && tree
            .half_edge(node, tree.node(node).neighbors[0].node)
            .is_some_and(|nb| nb.flag.can_do_spr())
      })
      .collect();

    let mut improved = false;
    for leaf in candidates {
      if !is_prunable(tree, leaf) {
        continue;
      }
      let delta = try_spr_move(tree, aln, leaf, scratch)?;
      if delta < 0 {
        improved = true;
      }
    }
    debug!("SPR round {round}: score {}", tree.parsimony_score_mutation());
    if !improved {
      break;
    }
  }
  Ok(tree.parsimony_score_mutation())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::io::fasta::read_alignment_str;
  use crate::io::newick::{NewickFlags, read_newick_str, write_newick_str};
  use crate::tree::ancestral::init_mutations;
  use crate::tree::placement::place_sample;
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
  fn merges_edge_lists_with_cancellation() {
    use crate::alphabet::nuc::Nuc;
    let m = |position: usize, par: Nuc, alt: Nuc| Mutation {
      position,
      compressed_position: position,
      ref_allele: Nuc::A,
      par_allele: par,
      alt_allele: alt,
    };
    // A change undone below cancels; a change altered below flattens
    let upper = vec![m(1, Nuc::A, Nuc::G), m(3, Nuc::A, Nuc::C)];
    let lower = vec![m(1, Nuc::G, Nuc::A), m(3, Nuc::C, Nuc::T), m(5, Nuc::A, Nuc::G)];
    let merged = merge_edge_mutations(&upper, &lower);
    assert_eq!(merged.len(), 2);
    assert_eq!((merged[0].position, merged[0].par_allele, merged[0].alt_allele), (3, Nuc::A, Nuc::T));
    assert_eq!(merged[1].position, 5);
  }

  #[rstest]
  fn spr_never_increases_the_score() -> Result<(), Report> {
    let (mut tree, aln, mut scratch) = setup(
      "((A:1,B:1):1,(C:1,D:1):1);",
      ">A\nTCGATT\n>B\nTCGATA\n>C\nGCTATA\n>D\nGCTAAA\n>E\nGCGATA\n>F\nTCGTTT\n",
      4,
    )?;
    for i in 0..aln.num_missing() {
      place_sample(&mut tree, &aln, i, &mut scratch)?;
    }
    let before = tree.parsimony_score_mutation();
    let after = refine(&mut tree, &aln, &mut scratch)?;
    assert!(after <= before);
    assert_eq!(after, tree.parsimony_score_mutation());
    Ok(())
  }

  #[rstest]
  fn spr_fixes_a_misplaced_leaf() -> Result<(), Report> {
    // D sits inside the (A,B) clade but matches the (C,E) clade: pruning and
    // regrafting it there removes its two private changes
    let (mut tree, aln, mut scratch) = setup(
      "(((A:1,D:1):1,B:1):1,(C:1,E:1):1);",
      ">A\nTTTTAA\n>B\nTTTTAA\n>C\nGGTTAA\n>E\nGGTTAA\n>D\nGGTTAA\n",
      5,
    )?;
    let before = tree.parsimony_score_mutation();
    assert_eq!(before, 4);
    mark_all_spr_candidates(&mut tree);
    let after = refine(&mut tree, &aln, &mut scratch)?;
    assert!(after < before);
    assert_eq!(after, 2);
    Ok(())
  }

  #[rstest]
  fn prune_then_restore_is_identity() -> Result<(), Report> {
    let (mut tree, aln, _scratch) = setup(
      "((A:1,B:1):1,(C:1,D:1):1);",
      ">A\nTCGATT\n>B\nTCGATA\n>C\nGCTATA\n>D\nGCTAAA\n",
      4,
    )?;
    let before_newick = write_newick_str(&tree, NewickFlags::topology());
    let before_score = tree.parsimony_score_mutation();

    let leaf = tree.find_by_name("C").expect("leaf C");
    let bfs = tree.breadth_first_expansion();
    let mut parents = vec![None; tree.num_nodes()];
    for entry in &bfs {
      parents[entry.node] = Some(entry.parent);
    }
    let undo = prune_leaf(&mut tree, leaf, &parents)?;
    assert!(tree.parsimony_score_mutation() <= before_score);
    restore_pruned(&mut tree, undo)?;

    assert_eq!(write_newick_str(&tree, NewickFlags::topology()), before_newick);
    assert_eq!(tree.parsimony_score_mutation(), before_score);
    Ok(())
  }

  #[rstest]
  fn refine_only_touches_eligible_branches() -> Result<(), Report> {
    // No branch is marked movable: the tree must come back untouched even though
    // a better topology exists
    let (mut tree, aln, mut scratch) = setup(
      "((A:1,D:1):1,(B:1,C:1):1);",
      ">A\nTTTTAA\n>B\nTTTTAA\n>C\nGGTTAA\n>D\nGGTTAA\n",
      4,
    )?;
    let before = write_newick_str(&tree, NewickFlags::topology());
    let score = refine(&mut tree, &aln, &mut scratch)?;
    assert_eq!(write_newick_str(&tree, NewickFlags::topology()), before);
    assert_eq!(score, tree.parsimony_score_mutation());
    Ok(())
  }
}
