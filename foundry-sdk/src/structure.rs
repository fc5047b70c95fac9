//! Project blueprint: an ordered tree of directories and files.
//!
//! On the wire it is a plain JSON object. A nested object is a directory;
//! `null` (or a string, read as initial content) is a file. Key order is
//! preserved through a round-trip.

use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A node of the blueprint tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// A file, with optional seed content.
    File(Option<String>),
    Dir(ProjectStructure),
}

/// Ordered mapping of names to [`Node`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectStructure {
    entries: Vec<(String, Node)>,
}

impl ProjectStructure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry, keeping the original position on replace.
    pub fn insert(&mut self, name: impl Into<String>, node: Node) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = node,
            None => self.entries.push((name, node)),
        }
    }

    /// Builder-style [`insert`](Self::insert) of a file without content.
    pub fn with_file(mut self, name: impl Into<String>) -> Self {
        self.insert(name, Node::File(None));
        self
    }

    /// Builder-style [`insert`](Self::insert) of a subdirectory.
    pub fn with_dir(mut self, name: impl Into<String>, dir: ProjectStructure) -> Self {
        self.insert(name, Node::Dir(dir));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.entries.iter().map(|(n, node)| (n.as_str(), node))
    }

    /// Flatten into normalized, forward-slash file paths in tree order.
    ///
    /// Keys have `..` replaced by `_` and are trimmed; keys that end up
    /// empty are skipped along with everything beneath them.
    pub fn files(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_files("", &mut out);
        out
    }

    fn collect_files(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, node) in &self.entries {
            let clean = sanitize_segment(name);
            if clean.is_empty() {
                continue;
            }
            let path = normalize(&format!("{prefix}/{clean}"));
            if path.is_empty() {
                continue;
            }
            match node {
                Node::Dir(child) => child.collect_files(&path, out),
                Node::File(_) => {
                    if !out.contains(&path) {
                        out.push(path);
                    }
                }
            }
        }
    }
}

/// Neutralize traversal in a single key.
pub fn sanitize_segment(key: &str) -> String {
    key.replace("..", "_").trim().to_string()
}

/// Collapse separators and `.` segments into a relative forward-slash path.
pub fn normalize(path: &str) -> String {
    path.split(['/', '\\'])
        .map(str::trim)
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

// ── serde ──────────────────────────────────────────────────────────────

impl Serialize for ProjectStructure {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, node) in &self.entries {
            map.serialize_entry(name, node)?;
        }
        map.end()
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Node::File(None) => serializer.serialize_none(),
            Node::File(Some(content)) => serializer.serialize_str(content),
            Node::Dir(dir) => dir.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ProjectStructure {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(StructureVisitor)
    }
}

struct StructureVisitor;

impl<'de> Visitor<'de> for StructureVisitor {
    type Value = ProjectStructure;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a JSON object describing directories and files")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut structure = ProjectStructure::new();
        while let Some((name, node)) = access.next_entry::<String, Node>()? {
            structure.insert(name, node);
        }
        Ok(structure)
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(NodeVisitor)
    }
}

struct NodeVisitor;

impl<'de> Visitor<'de> for NodeVisitor {
    type Value = Node;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("null, a string, or a nested object")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Node, E> {
        Ok(Node::File(None))
    }

    fn visit_none<E: de::Error>(self) -> Result<Node, E> {
        Ok(Node::File(None))
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Node, D::Error> {
        deserializer.deserialize_any(NodeVisitor)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Node, E> {
        Ok(Node::File(Some(v.to_string())))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Node, E> {
        Ok(Node::File(Some(v)))
    }

    // Scalars other than strings carry no content; treat them as bare files.
    fn visit_bool<E: de::Error>(self, _: bool) -> Result<Node, E> {
        Ok(Node::File(None))
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> Result<Node, E> {
        Ok(Node::File(None))
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> Result<Node, E> {
        Ok(Node::File(None))
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> Result<Node, E> {
        Ok(Node::File(None))
    }

    fn visit_map<A: MapAccess<'de>>(self, access: A) -> Result<Node, A::Error> {
        StructureVisitor.visit_map(access).map(Node::Dir)
    }
}
