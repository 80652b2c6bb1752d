use crate::alignment::Alignment;
use crate::make_error;
use crate::mutation::Mutation;
use eyre::Report;
use std::collections::VecDeque;

pub type NodeId = usize;

/// Whether a branch may be detached and regrafted during refinement
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MoveFlag {
  #[default]
  NotMovable,
  Movable {
    spr_eligible: bool,
  },
}

impl MoveFlag {
  pub const fn can_move(self) -> bool {
    matches!(self, MoveFlag::Movable { .. })
  }

  pub const fn can_do_spr(self) -> bool {
    matches!(self, MoveFlag::Movable { spr_eligible: true })
  }
}

/// Directed half-edge from its owner node to `node`.
///
/// Each undirected edge is a pair of half-edges. The edge's mutation list lives on the
/// half-edge pointing away from the root; the opposite half-edge keeps an empty list.
#[derive(Clone, Debug)]
pub struct Neighbor {
  pub node: NodeId,
  pub length: f64,
  pub branch_id: usize,
  pub mutations: Vec<Mutation>,
  pub saved_mutations: Vec<Mutation>,
  pub flag: MoveFlag,
}

impl Neighbor {
  pub fn new(node: NodeId, length: f64, branch_id: usize) -> Self {
    Self {
      node,
      length,
      branch_id,
      mutations: Vec::new(),
      saved_mutations: Vec::new(),
      flag: MoveFlag::default(),
    }
  }

  pub fn save_mutations(&mut self) {
    self.saved_mutations = self.mutations.clone();
  }

  pub fn restore_mutations(&mut self) {
    self.mutations = std::mem::take(&mut self.saved_mutations);
  }
}

#[derive(Clone, Debug, Default)]
pub struct Node {
  pub name: Option<String>,
  /// Alignment row id; set for leaves after name reconciliation
  pub seq_id: Option<usize>,
  /// Set iff this node was created by sample placement
  pub missing_index: Option<usize>,
  pub neighbors: Vec<Neighbor>,
}

impl Node {
  pub fn is_leaf(&self) -> bool {
    self.neighbors.len() <= 1
  }
}

/// One entry of the breadth-first expansion: a node together with its incoming
/// half-edge, identified by the parent that owns it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BfsEntry {
  pub node: NodeId,
  pub parent: NodeId,
  pub distance: usize,
}

/// Unrooted mutation-annotated tree over a node arena.
///
/// `root` is a traversal anchor only; relocating it must not change any edge's
/// mutation set. Deep copy is `clone()`.
#[derive(Clone, Debug, Default)]
pub struct Tree {
  nodes: Vec<Node>,
  pub root: NodeId,
  /// Where the root's ancestral state differs from the reference: the baseline
  /// applied before any edge on a root-to-branch path. Not part of the parsimony
  /// score, which counts edge mutations only.
  pub root_mutations: Vec<Mutation>,
  next_branch_id: usize,
}

impl Tree {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_node(&mut self, name: Option<String>) -> NodeId {
    let id = self.nodes.len();
    self.nodes.push(Node {
      name,
      ..Node::default()
    });
    id
  }

  pub fn node(&self, id: NodeId) -> &Node {
    &self.nodes[id]
  }

  pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
    &mut self.nodes[id]
  }

  pub fn num_nodes(&self) -> usize {
    self.nodes.len()
  }

  pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
    self.nodes.iter().enumerate()
  }

  pub fn next_branch_id(&mut self) -> usize {
    let id = self.next_branch_id;
    self.next_branch_id += 1;
    id
  }

  /// Connects two nodes with a fresh undirected edge (two half-edges)
  pub fn connect(&mut self, a: NodeId, b: NodeId, length: f64) -> usize {
    let branch_id = self.next_branch_id();
    self.nodes[a].neighbors.push(Neighbor::new(b, length, branch_id));
    self.nodes[b].neighbors.push(Neighbor::new(a, length, branch_id));
    branch_id
  }

  pub fn neighbor_index(&self, from: NodeId, to: NodeId) -> Option<usize> {
    self.nodes[from].neighbors.iter().position(|nb| nb.node == to)
  }

  pub fn half_edge(&self, from: NodeId, to: NodeId) -> Option<&Neighbor> {
    self.nodes[from].neighbors.iter().find(|nb| nb.node == to)
  }

  pub fn half_edge_mut(&mut self, from: NodeId, to: NodeId) -> Option<&mut Neighbor> {
    self.nodes[from].neighbors.iter_mut().find(|nb| nb.node == to)
  }

  pub fn is_leaf(&self, id: NodeId) -> bool {
    self.nodes[id].is_leaf()
  }

  pub fn leaves(&self) -> impl Iterator<Item = NodeId> + '_ {
    (0..self.nodes.len()).filter(|&id| self.is_leaf(id))
  }

  pub fn leaf_names(&self) -> Vec<String> {
    self
      .leaves()
      .filter_map(|id| self.nodes[id].name.clone())
      .collect()
  }

  pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
    self
      .nodes
      .iter()
      .position(|node| node.name.as_deref() == Some(name))
  }

  /// Breadth-first expansion from the root: every non-root node paired with its
  /// incoming half-edge, in deterministic discovery order. The canonical traversal
  /// for candidate branch enumeration.
  pub fn breadth_first_expansion(&self) -> Vec<BfsEntry> {
    let mut entries = Vec::with_capacity(self.nodes.len().saturating_sub(1));
    let mut visited = vec![false; self.nodes.len()];
    let mut queue = VecDeque::new();
    visited[self.root] = true;
    queue.push_back((self.root, 0));
    while let Some((node, distance)) = queue.pop_front() {
      for nb in &self.nodes[node].neighbors {
        if !visited[nb.node] {
          visited[nb.node] = true;
          entries.push(BfsEntry {
            node: nb.node,
            parent: node,
            distance: distance + 1,
          });
          queue.push_back((nb.node, distance + 1));
        }
      }
    }
    entries
  }

  /// Number of leaves in the subtree below each node, w.r.t. the current root.
  /// Computed by accumulating the BFS expansion in reverse.
  pub fn subtree_leaf_counts(&self, bfs: &[BfsEntry]) -> Vec<usize> {
    let mut counts = vec![0usize; self.nodes.len()];
    for id in 0..self.nodes.len() {
      if self.is_leaf(id) {
        counts[id] = 1;
      }
    }
    for entry in bfs.iter().rev() {
      counts[entry.parent] += counts[entry.node];
    }
    counts
  }

  /// Re-roots traversal at the named taxon without touching any edge mutation set
  pub fn assign_root(&mut self, taxon_name: &str) -> Result<(), Report> {
    match self.find_by_name(taxon_name) {
      Some(id) => {
        self.root = id;
        Ok(())
      }
      None => make_error!("Cannot assign root: taxon '{taxon_name}' is not in the tree"),
    }
  }

  /// Total number of mutations across all edges: the parsimony score under the
  /// mutation model. Each edge's list is stored on exactly one half-edge, so a
  /// plain sum counts every edge once.
  pub fn parsimony_score_mutation(&self) -> u32 {
    self
      .nodes
      .iter()
      .flat_map(|node| &node.neighbors)
      .map(|nb| nb.mutations.len() as u32)
      .sum()
  }

  /// Reconciles leaf names with alignment row ids; the tree file stores names,
  /// not ids
  pub fn config_leaf_ids(&mut self, aln: &Alignment) -> Result<(), Report> {
    for id in 0..self.nodes.len() {
      if self.is_leaf(id) {
        let Some(name) = self.nodes[id].name.clone() else {
          return make_error!("Leaf node {id} has no name");
        };
        match aln.row_id(&name) {
          Some(seq_id) => self.nodes[id].seq_id = Some(seq_id),
          None => return make_error!("Leaf '{name}' is not present in the alignment"),
        }
      }
    }
    Ok(())
  }
}
