pub mod permutation;
