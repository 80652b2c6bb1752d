use crate::alphabet::nuc::Nuc;
use crate::make_error;
use eyre::Report;
use std::fmt;

/// A single substitution relative to the reference, attached to a tree edge or a sample.
///
/// `position` is the site in the reference alignment; `compressed_position` is its index
/// after collapsing invariant sites. `alt_allele` may be an ambiguity code; two mutations
/// at the same position denote the same change iff their alt masks intersect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mutation {
  pub position: usize,
  pub compressed_position: usize,
  pub ref_allele: Nuc,
  pub alt_allele: Nuc,
  pub par_allele: Nuc,
}

impl Mutation {
  /// Same position and compatible alt alleles
  pub fn matches(&self, other: &Mutation) -> bool {
    self.position == other.position && self.alt_allele.shares_allele(other.alt_allele)
  }
}

impl fmt::Display for Mutation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}{}{}", self.par_allele, self.position + 1, self.alt_allele)
  }
}

fn is_sorted(muts: &[Mutation]) -> bool {
  muts.windows(2).all(|w| w[0].position < w[1].position)
}

/// Union of two sorted mutation lists. On a shared position the entry from `a` wins.
pub fn union(a: &[Mutation], b: &[Mutation]) -> Vec<Mutation> {
  debug_assert!(is_sorted(a) && is_sorted(b));
  let mut out = Vec::with_capacity(a.len() + b.len());
  let (mut i, mut j) = (0, 0);
  while i < a.len() && j < b.len() {
    match a[i].position.cmp(&b[j].position) {
      std::cmp::Ordering::Less => {
        out.push(a[i]);
        i += 1;
      }
      std::cmp::Ordering::Greater => {
        out.push(b[j]);
        j += 1;
      }
      std::cmp::Ordering::Equal => {
        out.push(a[i]);
        i += 1;
        j += 1;
      }
    }
  }
  out.extend_from_slice(&a[i..]);
  out.extend_from_slice(&b[j..]);
  out
}

/// Entries of `a` whose position carries a compatible mutation in `b`
pub fn intersection(a: &[Mutation], b: &[Mutation]) -> Vec<Mutation> {
  debug_assert!(is_sorted(a) && is_sorted(b));
  let mut out = Vec::new();
  let (mut i, mut j) = (0, 0);
  while i < a.len() && j < b.len() {
    match a[i].position.cmp(&b[j].position) {
      std::cmp::Ordering::Less => i += 1,
      std::cmp::Ordering::Greater => j += 1,
      std::cmp::Ordering::Equal => {
        if a[i].matches(&b[j]) {
          out.push(a[i]);
        }
        i += 1;
        j += 1;
      }
    }
  }
  out
}

/// Entries of `a` not matched by a compatible mutation in `b` (`a − b`)
pub fn difference(a: &[Mutation], b: &[Mutation]) -> Vec<Mutation> {
  debug_assert!(is_sorted(a) && is_sorted(b));
  let mut out = Vec::new();
  let (mut i, mut j) = (0, 0);
  while i < a.len() {
    if j >= b.len() || a[i].position < b[j].position {
      out.push(a[i]);
      i += 1;
    } else if a[i].position > b[j].position {
      j += 1;
    } else {
      if !a[i].matches(&b[j]) {
        out.push(a[i]);
      }
      i += 1;
      j += 1;
    }
  }
  out
}

/// Entries present in exactly one of the lists (incompatible same-position pairs count for both sides)
pub fn symmetric_difference(a: &[Mutation], b: &[Mutation]) -> Vec<Mutation> {
  debug_assert!(is_sorted(a) && is_sorted(b));
  let mut out = Vec::new();
  let (mut i, mut j) = (0, 0);
  while i < a.len() || j < b.len() {
    if j >= b.len() || (i < a.len() && a[i].position < b[j].position) {
      out.push(a[i]);
      i += 1;
    } else if i >= a.len() || a[i].position > b[j].position {
      out.push(b[j]);
      j += 1;
    } else {
      if !a[i].matches(&b[j]) {
        out.push(a[i]);
        out.push(b[j]);
      }
      i += 1;
      j += 1;
    }
  }
  out
}

/// Inserts `m` keeping the list sorted by position. A second mutation at an occupied
/// position is an invariant violation.
pub fn add(list: &mut Vec<Mutation>, m: Mutation) -> Result<(), Report> {
  match list.binary_search_by_key(&m.position, |x| x.position) {
    Ok(_) => make_error!("Duplicate mutation at position {}: {}", m.position, m),
    Err(idx) => {
      list.insert(idx, m);
      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn mutation(position: usize, par: Nuc, alt: Nuc) -> Mutation {
    Mutation {
      position,
      compressed_position: position,
      ref_allele: Nuc::A,
      alt_allele: alt,
      par_allele: par,
    }
  }

  #[rstest]
  fn unions_disjoint_lists() {
    let a = vec![mutation(1, Nuc::A, Nuc::C), mutation(5, Nuc::A, Nuc::G)];
    let b = vec![mutation(3, Nuc::A, Nuc::T)];
    let positions: Vec<usize> = union(&a, &b).iter().map(|m| m.position).collect();
    assert_eq!(positions, vec![1, 3, 5]);
  }

  #[rstest]
  fn union_prefers_left_on_shared_position() {
    let a = vec![mutation(2, Nuc::A, Nuc::C)];
    let b = vec![mutation(2, Nuc::A, Nuc::G)];
    assert_eq!(union(&a, &b), vec![mutation(2, Nuc::A, Nuc::C)]);
  }

  #[rstest]
  fn intersects_with_ambiguity() {
    // R = A|G intersects G but not C
    let a = vec![mutation(2, Nuc::A, Nuc::R), mutation(4, Nuc::A, Nuc::C)];
    let b = vec![mutation(2, Nuc::A, Nuc::G), mutation(4, Nuc::A, Nuc::G)];
    assert_eq!(intersection(&a, &b), vec![mutation(2, Nuc::A, Nuc::R)]);
  }

  #[rstest]
  fn difference_keeps_incompatible_same_position() {
    let a = vec![mutation(2, Nuc::A, Nuc::C), mutation(7, Nuc::A, Nuc::T)];
    let b = vec![mutation(2, Nuc::A, Nuc::G)];
    assert_eq!(difference(&a, &b), vec![mutation(2, Nuc::A, Nuc::C), mutation(7, Nuc::A, Nuc::T)]);
  }

  #[rstest]
  fn symmetric_difference_is_symmetric() {
    let a = vec![mutation(1, Nuc::A, Nuc::C), mutation(2, Nuc::A, Nuc::G)];
    let b = vec![mutation(2, Nuc::A, Nuc::G), mutation(9, Nuc::A, Nuc::T)];
    let d1 = symmetric_difference(&a, &b);
    let d2 = symmetric_difference(&b, &a);
    assert_eq!(d1.len(), 2);
    assert_eq!(d1.len(), d2.len());
  }

  #[rstest]
  fn add_preserves_order_and_rejects_duplicates() -> Result<(), Report> {
    let mut list = vec![mutation(1, Nuc::A, Nuc::C), mutation(5, Nuc::A, Nuc::G)];
    add(&mut list, mutation(3, Nuc::A, Nuc::T))?;
    let positions: Vec<usize> = list.iter().map(|m| m.position).collect();
    assert_eq!(positions, vec![1, 3, 5]);
    assert!(add(&mut list, mutation(3, Nuc::A, Nuc::C)).is_err());
    Ok(())
  }
}
