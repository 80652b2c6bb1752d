use crate::io::fs::{read_maybe_gz_file_to_string, write_file};
use crate::make_error;
use crate::tree::tree::{NodeId, Tree};
use eyre::{Report, WrapErr};
use std::path::Path;

/// Serialisation flags for Newick output
#[derive(Clone, Copy, Debug)]
pub struct NewickFlags {
  /// Order children by the lexicographically smallest leaf below them, making the
  /// output canonical for a given topology
  pub sort_taxa: bool,
  /// Terminate the string with a newline
  pub newline: bool,
  /// Include branch lengths
  pub lengths: bool,
}

impl NewickFlags {
  /// The flag set used for all output tree files
  pub const fn sorted() -> Self {
    Self {
      sort_taxa: true,
      newline: true,
      lengths: true,
    }
  }

  /// Canonical topology-only form, for tree comparison
  pub const fn topology() -> Self {
    Self {
      sort_taxa: true,
      newline: false,
      lengths: false,
    }
  }
}

/// Temporary recursive structure mirroring the Newick text; converted into the
/// flat node arena once parsing is done
#[derive(Debug)]
struct ParsedNode {
  name: Option<String>,
  length: f64,
  children: Vec<ParsedNode>,
}

impl ParsedNode {
  fn to_tree(self, tree: &mut Tree) -> NodeId {
    let id = tree.add_node(self.name);
    for child in self.children {
      let length = child.length;
      let child_id = child.to_tree(tree);
      tree.connect(id, child_id, length);
    }
    id
  }
}

struct Cursor<'a> {
  bytes: &'a [u8],
  pos: usize,
}

impl Cursor<'_> {
  fn peek(&self) -> Option<u8> {
    self.bytes.get(self.pos).copied()
  }

  fn bump(&mut self) -> Option<u8> {
    let b = self.peek();
    if b.is_some() {
      self.pos += 1;
    }
    b
  }

  fn skip_whitespace(&mut self) {
    while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
      self.pos += 1;
    }
  }

  fn expect(&mut self, expected: u8) -> Result<(), Report> {
    self.skip_whitespace();
    match self.bump() {
      Some(b) if b == expected => Ok(()),
      Some(b) => make_error!(
        "Expected '{}' at offset {}, found '{}'",
        expected as char,
        self.pos - 1,
        b as char
      ),
      None => make_error!("Expected '{}', found end of input", expected as char),
    }
  }

  fn parse_name(&mut self) -> Option<String> {
    self.skip_whitespace();
    let start = self.pos;
    while self
      .peek()
      .is_some_and(|b| !matches!(b, b'(' | b')' | b',' | b':' | b';') && !b.is_ascii_whitespace())
    {
      self.pos += 1;
    }
    if self.pos > start {
      Some(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    } else {
      None
    }
  }

  fn parse_length(&mut self) -> Result<f64, Report> {
    self.skip_whitespace();
    if self.peek() != Some(b':') {
      return Ok(0.0);
    }
    self.pos += 1;
    self.skip_whitespace();
    let start = self.pos;
    while self
      .peek()
      .is_some_and(|b| b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E'))
    {
      self.pos += 1;
    }
    let text = std::str::from_utf8(&self.bytes[start..self.pos]).expect("branch length is not valid UTF-8");
    text
      .parse::<f64>()
      .wrap_err_with(|| format!("When parsing branch length '{text}' at offset {start}"))
  }

  fn parse_subtree(&mut self) -> Result<ParsedNode, Report> {
    self.skip_whitespace();
    let mut node = ParsedNode {
      name: None,
      length: 0.0,
      children: Vec::new(),
    };
    if self.peek() == Some(b'(') {
      self.pos += 1;
      loop {
        node.children.push(self.parse_subtree()?);
        self.skip_whitespace();
        match self.peek() {
          Some(b',') => {
            self.pos += 1;
          }
          Some(b')') => {
            self.pos += 1;
            break;
          }
          _ => return make_error!("Expected ',' or ')' at offset {}", self.pos),
        }
      }
      node.name = self.parse_name();
    } else {
      node.name = self.parse_name();
      if node.name.is_none() {
        return make_error!("Expected a taxon name at offset {}", self.pos);
      }
    }
    node.length = self.parse_length()?;
    Ok(node)
  }
}

/// Parses a Newick string into a tree. When `is_rooted` is false a bifurcating
/// root is collapsed so the tree reads as unrooted (root trifurcation).
pub fn read_newick_str(content: &str, is_rooted: bool) -> Result<Tree, Report> {
  let mut cursor = Cursor {
    bytes: content.as_bytes(),
    pos: 0,
  };
  let mut parsed = cursor.parse_subtree().wrap_err("When parsing Newick tree")?;
  cursor.expect(b';')?;

  if !is_rooted && parsed.children.len() == 2 {
    // Graft one root child into the other; the root node of a rooted reading has
    // no counterpart in the unrooted topology
    let into = parsed.children.iter().position(|c| !c.children.is_empty());
    if let Some(into) = into {
      let mut other = parsed.children.remove(1 - into);
      let mut new_root = parsed.children.remove(0);
      other.length += new_root.length;
      new_root.length = 0.0;
      new_root.children.push(other);
      parsed = new_root;
    }
  }

  let mut tree = Tree::new();
  let root = parsed.to_tree(&mut tree);
  tree.root = root;
  Ok(tree)
}

pub fn read_newick_file(filepath: impl AsRef<Path>, is_rooted: bool) -> Result<Tree, Report> {
  let filepath = filepath.as_ref();
  let content = read_maybe_gz_file_to_string(filepath)?;
  read_newick_str(&content, is_rooted).wrap_err_with(|| format!("When reading tree file: {filepath:#?}"))
}

fn format_subtree(tree: &Tree, node: NodeId, parent: Option<NodeId>, flags: NewickFlags) -> (String, String) {
  let children: Vec<NodeId> = tree
    .node(node)
    .neighbors
    .iter()
    .filter(|nb| Some(nb.node) != parent)
    .map(|nb| nb.node)
    .collect();

  let length_suffix = |child: NodeId| -> String {
    if flags.lengths {
      let length = tree
        .half_edge(node, child)
        .map_or(0.0, |nb| nb.length);
      format!(":{length}")
    } else {
      String::new()
    }
  };

  if children.is_empty() {
    let name = tree.node(node).name.clone().unwrap_or_default();
    return (name.clone(), name);
  }

  let mut parts: Vec<(String, String)> = children
    .into_iter()
    .map(|child| {
      let (text, min_name) = format_subtree(tree, child, Some(node), flags);
      (format!("{text}{}", length_suffix(child)), min_name)
    })
    .collect();

  if flags.sort_taxa {
    parts.sort_by(|a, b| a.1.cmp(&b.1));
  }

  let min_name = parts.iter().map(|(_, name)| name.clone()).min().unwrap_or_default();
  let inner = parts.into_iter().map(|(text, _)| text).collect::<Vec<_>>().join(",");
  (format!("({inner})"), min_name)
}

pub fn write_newick_str(tree: &Tree, flags: NewickFlags) -> String {
  let (mut text, _) = format_subtree(tree, tree.root, None, flags);
  text.push(';');
  if flags.newline {
    text.push('\n');
  }
  text
}

pub fn write_newick_file(tree: &Tree, filepath: impl AsRef<Path>, flags: NewickFlags) -> Result<(), Report> {
  write_file(filepath, &write_newick_str(tree, flags))
}
