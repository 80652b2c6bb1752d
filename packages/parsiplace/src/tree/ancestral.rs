use crate::alignment::Alignment;
use crate::alphabet::nuc::{Nuc, first_allele};
use crate::make_internal_error;
use crate::mutation::Mutation;
use crate::tree::tree::Tree;
use eyre::{Report, WrapErr};
use log::debug;

/// Assigns mutations to every edge from the leaf alignment with a Fitch-style pass,
/// one site at a time. Leaves contribute their observed allele masks; the post-order
/// sweep builds candidate sets (intersection where possible, union otherwise) and the
/// pre-order sweep fixes ancestral states, recording a mutation wherever parent and
/// child states differ. Returns the resulting parsimony score.
///
/// Post-condition: `tree.parsimony_score_mutation()` equals the Fitch score of the
/// input alignment on this topology.
pub fn init_mutations(tree: &mut Tree, aln: &Alignment) -> Result<u32, Report> {
  let bfs = tree.breadth_first_expansion();

  // Edge lists are rebuilt from scratch
  tree.root_mutations.clear();
  for id in 0..tree.num_nodes() {
    for nb in &mut tree.node_mut(id).neighbors {
      nb.mutations.clear();
      nb.saved_mutations.clear();
    }
  }

  let num_nodes = tree.num_nodes();
  let mut children: Vec<Vec<usize>> = vec![Vec::new(); num_nodes];
  for entry in &bfs {
    children[entry.parent].push(entry.node);
  }

  let perm_col = aln.find_perm_col().clone();
  let mut masks: Vec<u8> = vec![0; num_nodes];
  let mut states: Vec<Nuc> = vec![Nuc::N; num_nodes];
  let mut score = 0u32;

  for (compressed_position, &position) in perm_col.positions.iter().enumerate() {
    let ref_allele = aln.reference()[position];

    // Post-order: candidate allele sets, counting one change per union step
    for &node in bfs.iter().rev().map(|e| &e.node).chain(std::iter::once(&tree.root)) {
      masks[node] = if children[node].is_empty() {
        leaf_mask(tree, aln, node, position)?
      } else {
        let mut mask = 0u8;
        for &child in &children[node] {
          if mask == 0 {
            mask = masks[child];
          } else if mask & masks[child] != 0 {
            mask &= masks[child];
          } else {
            mask |= masks[child];
            score += 1;
          }
        }
        mask
      };
    }

    // Pre-order: fix states, preferring the parent's allele, and record a mutation
    // on each edge where the states differ
    let root_mask = masks[tree.root];
    let root_state = if ref_allele.mask() & root_mask != 0 {
      ref_allele
    } else {
      // The root's ancestral state cannot be the reference here; record the
      // baseline shift so placement scans read the correct path state
      let state = first_allele(root_mask).ok_or_else(|| crate::make_report!("Empty allele set at root, site {position}"))?;
      tree.root_mutations.push(Mutation {
        position,
        compressed_position,
        ref_allele,
        par_allele: ref_allele,
        alt_allele: state,
      });
      state
    };
    states[tree.root] = root_state;
    for entry in &bfs {
      let parent_state = states[entry.parent];
      if parent_state.mask() & masks[entry.node] != 0 {
        states[entry.node] = parent_state;
      } else {
        let child_state = first_allele(masks[entry.node])
          .ok_or_else(|| crate::make_report!("Empty allele set at node {}, site {position}", entry.node))?;
        states[entry.node] = child_state;
        let edge = tree
          .half_edge_mut(entry.parent, entry.node)
          .ok_or_else(|| crate::make_report!("Missing half-edge {} -> {}", entry.parent, entry.node))?;
        edge.mutations.push(Mutation {
          position,
          compressed_position,
          ref_allele,
          par_allele: parent_state,
          alt_allele: child_state,
        });
      }
    }
  }

  let total = tree.parsimony_score_mutation();
  if total != score {
    return make_internal_error!(
      "initMutation: edge mutation count {total} disagrees with the Fitch change count {score}"
    )
    .wrap_err("When initialising ancestral mutations");
  }
  debug!("Initialized ancestral mutations: {total} changes over {} sites", perm_col.num_compressed());
  Ok(total)
}

fn leaf_mask(tree: &Tree, aln: &Alignment, node: usize, position: usize) -> Result<u8, Report> {
  match tree.node(node).seq_id {
    Some(seq_id) => Ok(aln.allele(seq_id, position).mask()),
    None => make_internal_error!("Leaf node {node} has no alignment row assigned"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::io::fasta::read_alignment_str;
  use crate::io::newick::read_newick_str;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn setup(newick: &str, fasta: &str, num_start_rows: usize) -> Result<(Tree, Alignment), Report> {
    let aln = Alignment::from_records(read_alignment_str(fasta)?, num_start_rows)?;
    let mut tree = read_newick_str(newick, false)?;
    tree.config_leaf_ids(&aln)?;
    Ok((tree, aln))
  }

  #[rstest]
  fn single_site_single_change() -> Result<(), Report> {
    let (mut tree, aln) = setup("((A:1,B:1):1,C:1);", ">A\nACGT\n>B\nACGT\n>C\nACGA\n", 3)?;
    let score = init_mutations(&mut tree, &aln)?;
    assert_eq!(score, 1);
    assert_eq!(tree.parsimony_score_mutation(), 1);
    Ok(())
  }

  #[rstest]
  fn fitch_score_on_four_leaves() -> Result<(), Report> {
    // Site 0: A,B carry T while C,D carry G -- one change on the internal edge.
    // Site 3: D alone differs -- one change on its pendant edge.
    let (mut tree, aln) = setup(
      "((A:1,B:1):1,(C:1,D:1):1);",
      ">A\nTCGT\n>B\nTCGT\n>C\nGCGT\n>D\nGCGA\n",
      4,
    )?;
    let score = init_mutations(&mut tree, &aln)?;
    assert_eq!(score, 2);
    assert_eq!(tree.parsimony_score_mutation(), 2);
    Ok(())
  }

  #[rstest]
  fn incompatible_site_costs_two() -> Result<(), Report> {
    // Site pattern A=T, B=G, C=T, D=G on a ((A,B),(C,D)) topology needs two changes
    let (mut tree, aln) = setup(
      "((A:1,B:1):1,(C:1,D:1):1);",
      ">A\nTAAA\n>B\nGAAA\n>C\nTAAA\n>D\nGAAA\n",
      4,
    )?;
    assert_eq!(init_mutations(&mut tree, &aln)?, 2);
    Ok(())
  }

  #[rstest]
  fn ambiguous_leaf_follows_parent() -> Result<(), Report> {
    // R = A|G at sample B resolves to the reference allele A: no change anywhere
    let (mut tree, aln) = setup("((A:1,B:1):1,C:1);", ">A\nAAAA\n>B\nRAAA\n>C\nAAAA\n", 3)?;
    assert_eq!(init_mutations(&mut tree, &aln)?, 0);
    Ok(())
  }

  #[rstest]
  fn score_is_invariant_under_rerooting() -> Result<(), Report> {
    let (mut tree, aln) = setup(
      "((A:1,B:1):1,(C:1,D:1):1);",
      ">A\nTCGATT\n>B\nTCGATA\n>C\nGCTATA\n>D\nGCTAAA\n",
      4,
    )?;
    let score = init_mutations(&mut tree, &aln)?;
    tree.assign_root("D")?;
    assert_eq!(tree.parsimony_score_mutation(), score);
    Ok(())
  }

  #[rstest]
  fn edge_lists_stay_sorted_by_position() -> Result<(), Report> {
    let (mut tree, aln) = setup(
      "((A:1,B:1):1,C:1);",
      ">A\nACGTACGT\n>B\nACGTACGT\n>C\nTCGAACGA\n",
      3,
    )?;
    init_mutations(&mut tree, &aln)?;
    for (_, node) in tree.nodes() {
      for nb in &node.neighbors {
        assert!(nb.mutations.windows(2).all(|w| w[0].position < w[1].position));
      }
    }
    Ok(())
  }
}
