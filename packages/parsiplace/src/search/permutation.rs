use crate::alignment::{Alignment, PermCol};
use crate::make_error;
use crate::oracle::{ParsimonyOracle, PlacementScore};
use crate::tree::tree::Tree;
use eyre::Report;
use itertools::Itertools;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use rayon::prelude::*;

/// Sample counts up to this bound are searched exhaustively
const EXHAUSTIVE_LIMIT: usize = 5;
/// Number of random permutations generated in the seed phase
const NUM_SEED_PERMUTATIONS: usize = 100;
/// Size of the candidate pool carried between phases
const POOL_SIZE: usize = 5;
/// Local searches give up after this many sweeps
const MAX_LOCAL_LOOPS: usize = 10;
/// The improvement phase stops after this many consecutive non-improving rounds
const MAX_STALE_ROUNDS: usize = 10;

/// Evaluates one placement order. The seam lets tests plug in a synthetic scorer
/// and production code plug in the parsimony oracle.
pub trait PermutationEvaluator: Sync {
  fn evaluate(&self, perm: &[usize]) -> PlacementScore;
}

/// Production evaluator: the oracle places and refines on a deep copy per call
pub struct OracleEvaluator<'a, O: ParsimonyOracle> {
  pub oracle: &'a O,
  pub tree: &'a Tree,
  pub aln: &'a Alignment,
  pub perm_col: &'a PermCol,
}

impl<O: ParsimonyOracle> PermutationEvaluator for OracleEvaluator<'_, O> {
  fn evaluate(&self, perm: &[usize]) -> PlacementScore {
    self.oracle.place_and_refine(self.tree, self.aln, perm, self.perm_col)
  }
}

/// A candidate ordering together with its score
pub type Candidate = (Vec<usize>, PlacementScore);

/// Searches over orders of insertion for the `k` missing samples and returns the
/// best (score, permutation) found. Exhaustive for small `k`; otherwise a seeded
/// pool of locally-improved random permutations followed by an adjacent-swap
/// improvement phase. All randomness flows from `seed`.
pub fn search_best_permutation(
  evaluator: &dyn PermutationEvaluator,
  k: usize,
  seed: u64,
) -> Result<(PlacementScore, Vec<usize>), Report> {
  if k == 0 {
    return make_error!("Permutation search needs at least one missing sample");
  }

  if k <= EXHAUSTIVE_LIMIT {
    return exhaustive_search(evaluator, k);
  }

  let mut rng = StdRng::seed_from_u64(seed);
  let mut pool = seed_phase(evaluator, k, &mut rng);
  if pool.iter().all(|(_, score)| score.is_unplaceable()) {
    return make_error!("Permutation search failed: every candidate ordering is unplaceable");
  }
  let best_seed_score = pool.iter().map(|(_, score)| *score).min().unwrap_or(PlacementScore::Unplaceable);
  info!("Permutation search: best seed score {best_seed_score:?}");

  update_permutation(evaluator, &mut pool, &mut rng);

  let (perm, score) = pool
    .iter()
    .min_by_key(|(_, score)| *score)
    .map(|(perm, score)| (perm.clone(), *score))
    .ok_or_else(|| crate::make_internal_report!("Permutation pool is empty"))?;
  debug_assert!(score <= best_seed_score);
  Ok((score, perm))
}

fn exhaustive_search(evaluator: &dyn PermutationEvaluator, k: usize) -> Result<(PlacementScore, Vec<usize>), Report> {
  let mut best: Option<(PlacementScore, Vec<usize>)> = None;
  for perm in (0..k).permutations(k) {
    let score = evaluator.evaluate(&perm);
    if best.as_ref().is_none_or(|(best_score, _)| score < *best_score) {
      best = Some((score, perm));
    }
  }
  let (score, perm) = best.expect("at least one permutation exists");
  if score.is_unplaceable() {
    return make_error!("Permutation search failed: every candidate ordering is unplaceable");
  }
  Ok((score, perm))
}

/// Seed phase: 100 random permutations, each improved by block-move local search.
/// Evaluations are independent, so they fan out over the thread pool; every worker
/// owns a child RNG derived from the master seed, keeping results reproducible.
pub fn seed_phase(evaluator: &dyn PermutationEvaluator, k: usize, rng: &mut StdRng) -> Vec<Candidate> {
  let child_seeds: Vec<u64> = (0..NUM_SEED_PERMUTATIONS).map(|_| rng.next_u64()).collect();

  let results: Vec<Candidate> = child_seeds
    .into_par_iter()
    .map(|child_seed| {
      let mut child_rng = StdRng::seed_from_u64(child_seed);
      let mut perm: Vec<usize> = (0..k).collect();
      perm.shuffle(&mut child_rng);
      block_move_search(evaluator, perm, &mut child_rng)
    })
    .collect();

  let mut pool: Vec<Candidate> = Vec::with_capacity(POOL_SIZE + 1);
  for candidate in results {
    pool.push(candidate);
    if pool.len() > POOL_SIZE {
      evict_worst(&mut pool, rng);
    }
  }
  pool
}

/// Moves a contiguous block to a nearby insertion point, keeping strict
/// improvements and breaking ties by reservoir sampling
fn block_move_search(evaluator: &dyn PermutationEvaluator, mut perm: Vec<usize>, rng: &mut StdRng) -> Candidate {
  let k = perm.len();
  let max_dist = (k / 20).max(1);
  let max_len = (k / 20).max(2);
  let mut cur_score = evaluator.evaluate(&perm);
  let mut hit_count = 1u64;

  for _ in 0..MAX_LOCAL_LOOPS {
    let len = 2 + if max_len > 2 { rng.gen_range(0..max_len - 1) } else { 0 };
    let l = rng.gen_range(0..k - len);
    let r = l + len - 1;
    for i in 0..k {
      if (l..=r).contains(&i) {
        continue;
      }
      if (i.abs_diff(l)).min(i.abs_diff(r)) > max_dist {
        continue;
      }

      // Remove [l, r] and reinsert it right after position i
      let mut new_perm = Vec::with_capacity(k);
      for j in 0..=i {
        if !(l..=r).contains(&j) {
          new_perm.push(perm[j]);
        }
      }
      new_perm.extend_from_slice(&perm[l..=r]);
      for j in i + 1..k {
        if !(l..=r).contains(&j) {
          new_perm.push(perm[j]);
        }
      }
      debug_assert_eq!(new_perm.len(), k);

      let new_score = evaluator.evaluate(&new_perm);
      if new_score < cur_score {
        cur_score = new_score;
        perm = new_perm;
        hit_count = 1;
      } else if new_score == cur_score {
        hit_count += 1;
        if rng.gen_bool(1.0 / hit_count as f64) {
          perm = new_perm;
        }
      }
    }
  }
  (perm, cur_score)
}

/// Improvement phase: repeatedly pick a random pool member, run adjacent-swap local
/// search on it, and re-admit the result, evicting the worst candidate. Stops after
/// ten consecutive rounds without improvement. The best pool score never worsens.
pub fn update_permutation(evaluator: &dyn PermutationEvaluator, pool: &mut Vec<Candidate>, rng: &mut StdRng) {
  assert!(!pool.is_empty());
  let mut stale_rounds = 0;
  loop {
    let id = rng.gen_range(0..pool.len());
    let mut perm = pool[id].0.clone();
    let start_score = pool[id].1;
    let mut cur_score = start_score;
    let k = perm.len();
    let max_dist = (k / 20).max(1);
    let mut hit_count = 1u64;

    for _ in 0..MAX_LOCAL_LOOPS {
      for i in 0..k {
        for j in i + 1..=(k - 1).min(i + max_dist) {
          perm.swap(i, j);
          let new_score = evaluator.evaluate(&perm);
          if new_score < cur_score {
            cur_score = new_score;
            hit_count = 1;
          } else if new_score == cur_score {
            hit_count += 1;
            if !rng.gen_bool(1.0 / hit_count as f64) {
              perm.swap(i, j);
            }
          } else {
            perm.swap(i, j);
          }
        }
      }
    }

    if cur_score == start_score {
      stale_rounds += 1;
    } else {
      stale_rounds = 1;
    }
    debug!("update_permutation: round score {cur_score:?}, stale rounds {stale_rounds}");

    pool.push((perm, cur_score));
    evict_worst(pool, rng);

    if stale_rounds == MAX_STALE_ROUNDS {
      break;
    }
  }
}

/// Drops the worst-scoring candidate, breaking ties by fair coin
fn evict_worst(pool: &mut Vec<Candidate>, rng: &mut StdRng) {
  let mut choice = 0;
  for i in 0..pool.len() {
    if pool[i].1 > pool[choice].1 {
      choice = i;
    } else if i != choice && pool[i].1 == pool[choice].1 && rng.gen_bool(0.5) {
      choice = i;
    }
  }
  pool.remove(choice);
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  /// Synthetic scorer: counts pairwise inversions, so the identity order is the
  /// unique optimum and scores change under local moves
  struct InversionCount;

  impl PermutationEvaluator for InversionCount {
    fn evaluate(&self, perm: &[usize]) -> PlacementScore {
      let mut inversions = 0;
      for i in 0..perm.len() {
        for j in i + 1..perm.len() {
          if perm[i] > perm[j] {
            inversions += 1;
          }
        }
      }
      PlacementScore::Score(inversions)
    }
  }

  struct AlwaysUnplaceable;

  impl PermutationEvaluator for AlwaysUnplaceable {
    fn evaluate(&self, _perm: &[usize]) -> PlacementScore {
      PlacementScore::Unplaceable
    }
  }

  #[rstest]
  fn exhaustive_branch_finds_the_exact_minimum() -> Result<(), Report> {
    let (score, perm) = search_best_permutation(&InversionCount, 3, 42)?;
    assert_eq!(score, PlacementScore::Score(0));
    assert_eq!(perm, vec![0, 1, 2]);
    Ok(())
  }

  #[rstest]
  fn pool_is_capped_and_final_score_beats_every_seed() -> Result<(), Report> {
    let k = 12;
    let mut rng = StdRng::seed_from_u64(7);
    let pool = seed_phase(&InversionCount, k, &mut rng);
    assert_eq!(pool.len(), POOL_SIZE);
    let best_seed = pool.iter().map(|(_, score)| *score).min().unwrap();

    let mut pool = pool;
    update_permutation(&InversionCount, &mut pool, &mut rng);
    let final_score = pool.iter().map(|(_, score)| *score).min().unwrap();
    assert!(final_score <= best_seed);
    Ok(())
  }

  #[rstest]
  fn search_is_deterministic_for_a_fixed_seed() -> Result<(), Report> {
    let first = search_best_permutation(&InversionCount, 10, 1234)?;
    let second = search_best_permutation(&InversionCount, 10, 1234)?;
    assert_eq!(first, second);
    Ok(())
  }

  #[rstest]
  fn fails_when_every_ordering_is_unplaceable() {
    assert!(search_best_permutation(&AlwaysUnplaceable, 3, 0).is_err());
    assert!(search_best_permutation(&AlwaysUnplaceable, 10, 0).is_err());
  }

  #[rstest]
  fn rejects_empty_input() {
    assert!(search_best_permutation(&InversionCount, 0, 0).is_err());
  }
}
