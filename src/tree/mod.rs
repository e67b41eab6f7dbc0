//! Compiled writer tree.
//!
//! The compiler builds an arena of [`WriterNode`]s, one per configuration tag.
//! Nodes refer to their parent and children by [`NodeId`]; the tree is frozen
//! once compilation finishes and shared behind an `Arc`.
//!
//! Every node carries a file slot. [`WriterTree::attach`] injects the open
//! file handle into all nodes when the file is created; [`WriterNode::store`]
//! fails with `DetachedNode` when its slot is empty.

use crate::data::{DataHolder, ElementType};
use crate::error::{WriterError, WriterResult};
use crate::nexus::{FieldSpec, FileHandle, NexusPath};
use crate::runner::Phase;
use crate::sources::Binding;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::RwLock;
use tracing::{debug, instrument};

/// Index of a node inside its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Concrete node kind, one per recognized tag.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// `<definition>`, the root
    Definition,
    /// `<group>`
    Group {
        /// NeXus base class
        nx_class: String,
    },
    /// `<field>`
    Field {
        /// Declared layout
        spec: FieldSpec,
    },
    /// `<attribute>` of the parent group or field
    Attribute {
        /// Attribute name
        name: String,
        /// Element type
        element_type: ElementType,
        /// Declared shape, if fully known
        shape: Option<Vec<usize>>,
    },
    /// `<link>`
    Link {
        /// Absolute target path
        target: NexusPath,
    },
    /// `<dimensions>` of the parent field or attribute
    Dimensions {
        /// Declared rank
        rank: Option<usize>,
    },
    /// `<dim>` entry of a dimensions block
    Dim {
        /// One-based axis index
        index: usize,
        /// Axis length, if given
        value: Option<usize>,
    },
    /// `<doc>` text of the parent
    Doc,
    /// `<strategy>` of the parent
    Strategy {
        /// Declared phase
        mode: Option<Phase>,
        /// Trigger gating STEP reads
        trigger: Option<String>,
    },
    /// `<datasource>`; its body is kept verbatim
    DataSource {
        /// Declared variant name, before overrides
        declared_type: String,
        /// Captured body
        fragment: CapturedFragment,
    },
}

impl NodeKind {
    /// Kinds that take part in the file layout.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            NodeKind::Definition
                | NodeKind::Group { .. }
                | NodeKind::Field { .. }
                | NodeKind::Attribute { .. }
                | NodeKind::Link { .. }
        )
    }
}

/// Verbatim span of a re-entrant tag: opening tag, inner content, closing tag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapturedFragment {
    /// Opening tag text
    pub pre: String,
    /// Everything between the opening and closing tags
    pub content: String,
    /// Closing tag text (empty for a self-closing tag)
    pub post: String,
}

impl fmt::Display for CapturedFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.pre, self.content, self.post)
    }
}

/// One node of the compiled configuration.
pub struct WriterNode {
    pub(crate) id: NodeId,
    pub(crate) tag: String,
    pub(crate) attributes: BTreeMap<String, String>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) doc: String,
    pub(crate) text: String,
    pub(crate) parent: Option<NodeId>,
    pub(crate) kind: NodeKind,
    pub(crate) path: NexusPath,
    pub(crate) literal: Option<DataHolder>,
    pub(crate) binding: Option<Binding>,
    file: RwLock<Option<FileHandle>>,
}

impl fmt::Debug for WriterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterNode")
            .field("id", &self.id)
            .field("path", &self.path.to_string())
            .field("kind", &self.kind)
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}

impl WriterNode {
    pub(crate) fn new(
        id: NodeId,
        tag: &str,
        attributes: BTreeMap<String, String>,
        parent: Option<NodeId>,
        kind: NodeKind,
        path: NexusPath,
    ) -> Self {
        Self {
            id,
            tag: tag.to_string(),
            attributes,
            children: Vec::new(),
            doc: String::new(),
            text: String::new(),
            parent,
            kind,
            path,
            literal: None,
            binding: None,
            file: RwLock::new(None),
        }
    }

    /// Node index.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Tag name.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// XML attributes of the tag.
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Children in document order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Parent, `None` for the root.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Text of the `<doc>` child, if any.
    pub fn doc(&self) -> &str {
        &self.doc
    }

    /// Literal character data of the tag.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Concrete kind.
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// File location: the object itself for groups, fields and links, the
    /// owner for attributes.
    pub fn path(&self) -> &NexusPath {
        &self.path
    }

    /// Data source binding, if the node declares one.
    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    /// Literal value written at materialization.
    pub fn literal(&self) -> Option<&DataHolder> {
        self.literal.as_ref()
    }

    /// Name used in failure reports: the file path, `owner@name` for attributes.
    pub fn label(&self) -> String {
        match &self.kind {
            NodeKind::Attribute { name, .. } => format!("{}@{name}", self.path),
            _ => self.path.to_string(),
        }
    }

    /// True while a file handle is injected.
    pub fn is_attached(&self) -> bool {
        self.file.read().map(|slot| slot.is_some()).unwrap_or(false)
    }

    pub(crate) fn attach(&self, handle: &FileHandle) {
        if let Ok(mut slot) = self.file.write() {
            *slot = Some(handle.clone());
        }
    }

    pub(crate) fn detach(&self) {
        if let Ok(mut slot) = self.file.write() {
            *slot = None;
        }
    }

    fn handle(&self) -> WriterResult<FileHandle> {
        self.file
            .read()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or_else(|| WriterError::DetachedNode(self.label()))
    }

    /// Write `value` into the file location of this node.
    ///
    /// Fields grow by one step when bound to the STEP phase and are replaced
    /// otherwise; attributes are (re)written on their owner. Structural-only
    /// kinds ignore the value.
    ///
    /// # Errors
    ///
    /// - `DetachedNode` when no file is attached
    /// - `ShapeMismatch` when the declared shape disagrees with the value
    /// - `SourceFormat` when the value cannot be converted to the declared type
    /// - `Storage` when the backend rejects the write
    pub async fn store(&self, value: &DataHolder) -> WriterResult<()> {
        match &self.kind {
            NodeKind::Field { spec } => {
                let value = self.conform(value, spec.element_type, spec.shape.as_deref())?;
                let handle = self.handle()?;
                let mut file = handle.lock().await;
                if spec.growing {
                    file.append_field(&self.path, &value)
                } else {
                    file.write_field(&self.path, &value)
                }
            }
            NodeKind::Attribute {
                name,
                element_type,
                shape,
            } => {
                let value = self.conform(value, *element_type, shape.as_deref())?;
                let handle = self.handle()?;
                let mut file = handle.lock().await;
                file.write_attribute(&self.path, name, &value)
            }
            _ => {
                self.handle()?;
                Ok(())
            }
        }
    }

    fn conform(
        &self,
        value: &DataHolder,
        element_type: ElementType,
        declared: Option<&[usize]>,
    ) -> WriterResult<DataHolder> {
        if let Some(declared) = declared {
            let actual = value.shape();
            // A single-element axis also accepts a scalar.
            let scalar_in_unit = declared == [1] && actual.is_empty();
            if declared != actual && !scalar_in_unit {
                return Err(WriterError::ShapeMismatch {
                    path: self.label(),
                    declared: declared.to_vec(),
                    actual: actual.to_vec(),
                });
            }
        }
        value
            .clone()
            .cast(element_type)
            .map_err(|e| WriterError::format(self.label(), e))
    }
}

/// Frozen arena of writer nodes.
#[derive(Debug)]
pub struct WriterTree {
    nodes: Vec<WriterNode>,
}

impl WriterTree {
    pub(crate) fn from_nodes(nodes: Vec<WriterNode>) -> Self {
        Self { nodes }
    }

    /// Root node id.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Node by id.
    ///
    /// Ids are only produced by the tree itself, so lookups never miss.
    pub fn node(&self, id: NodeId) -> &WriterNode {
        &self.nodes[id.0]
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True for a tree without nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in document order.
    pub fn iter(&self) -> impl Iterator<Item = &WriterNode> {
        self.nodes.iter()
    }

    /// Inject the file handle into every node.
    pub fn attach(&self, handle: &FileHandle) {
        for node in &self.nodes {
            node.attach(handle);
        }
    }

    /// Drop the file handle from every node.
    pub fn detach_all(&self) {
        for node in &self.nodes {
            node.detach();
        }
    }

    /// Create the file layout: groups with their `NX_class`, fields with their
    /// declared attributes, literal values and links.
    ///
    /// Bound nodes only get their layout here; their values arrive with their
    /// phase. Returns the number of structural nodes written.
    #[instrument(skip_all, fields(nodes = self.nodes.len()))]
    pub async fn materialize(&self) -> WriterResult<usize> {
        let handle = self.node(self.root()).handle()?;
        let mut file = handle.lock().await;
        let mut written = 0;
        // Links go last so their targets exist.
        let mut links = Vec::new();

        for node in &self.nodes {
            match &node.kind {
                NodeKind::Group { nx_class } => {
                    file.create_group(&node.path, nx_class)?;
                    if !node.doc.is_empty() {
                        let doc = DataHolder::scalar(node.doc.as_str());
                        file.write_attribute(&node.path, "doc", &doc)?;
                    }
                }
                NodeKind::Field { spec } => {
                    file.create_field(&node.path, spec)?;
                    let declared = node.attributes.iter().filter(|(k, _)| is_file_attribute(k));
                    for (key, value) in declared {
                        let value = DataHolder::scalar(value.as_str());
                        file.write_attribute(&node.path, key, &value)?;
                    }
                    if !node.doc.is_empty() {
                        let doc = DataHolder::scalar(node.doc.as_str());
                        file.write_attribute(&node.path, "doc", &doc)?;
                    }
                    if let (None, Some(literal)) = (&node.binding, &node.literal) {
                        file.write_field(&node.path, literal)?;
                    }
                }
                NodeKind::Attribute { name, .. } => {
                    if let (None, Some(literal)) = (&node.binding, &node.literal) {
                        file.write_attribute(&node.path, name, literal)?;
                    }
                }
                NodeKind::Link { target } => {
                    links.push((&node.path, target));
                    continue;
                }
                _ => continue,
            }
            written += 1;
        }
        for (path, target) in links {
            file.create_link(path, target)?;
            written += 1;
        }
        debug!(written, "structure materialized");
        Ok(written)
    }

    /// Indented outline of the tree, one node per line.
    pub fn outline(&self) -> String {
        let mut out = String::new();
        self.outline_node(self.root(), 0, &mut out);
        out
    }

    fn outline_node(&self, id: NodeId, depth: usize, out: &mut String) {
        let node = self.node(id);
        let indent = "  ".repeat(depth);
        let detail = match &node.kind {
            NodeKind::Definition => String::new(),
            NodeKind::Group { nx_class } => format!(" {} ({nx_class})", node.path),
            NodeKind::Field { spec } => format!(
                " {} {}{}",
                node.path,
                spec.element_type,
                spec.shape
                    .as_ref()
                    .map(|s| format!(" {s:?}"))
                    .unwrap_or_default()
            ),
            NodeKind::Attribute { name, element_type, .. } => {
                format!(" {}@{name} {element_type}", node.path)
            }
            NodeKind::Link { target } => format!(" {} -> {target}", node.path),
            NodeKind::DataSource { declared_type, .. } => format!(" {declared_type}"),
            _ => String::new(),
        };
        let bound = node
            .binding
            .as_ref()
            .map(|b| format!(" [{} {}]", b.phase, b.source.describe()))
            .unwrap_or_default();
        let _ = writeln!(out, "{indent}<{}>{detail}{bound}", node.tag);
        for &child in &node.children {
            self.outline_node(child, depth + 1, out);
        }
    }
}

/// Field tag attributes that become file attributes.
pub(crate) fn is_file_attribute(key: &str) -> bool {
    !matches!(key, "name" | "type")
}

/// Ordered node ids bound to each phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhasePartitions {
    /// Read once when the file opens
    pub init: Vec<NodeId>,
    /// Read on every record
    pub step: Vec<NodeId>,
    /// Read once when the entry closes
    pub final_: Vec<NodeId>,
}

impl PhasePartitions {
    /// Partition for `phase`.
    pub fn get(&self, phase: Phase) -> &[NodeId] {
        match phase {
            Phase::Init => &self.init,
            Phase::Step => &self.step,
            Phase::Final => &self.final_,
        }
    }

    pub(crate) fn push(&mut self, phase: Phase, id: NodeId) {
        match phase {
            Phase::Init => self.init.push(id),
            Phase::Step => self.step.push(id),
            Phase::Final => self.final_.push(id),
        }
    }

    /// Total number of bound nodes.
    pub fn len(&self) -> usize {
        self.init.len() + self.step.len() + self.final_.len()
    }

    /// True when no node is bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nexus::memory::MemoryNexusFile;
    use crate::nexus::NexusFile;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn field(
        id: usize,
        parent: usize,
        path: &str,
        shape: Option<Vec<usize>>,
        growing: bool,
    ) -> WriterNode {
        WriterNode::new(
            NodeId(id),
            "field",
            BTreeMap::new(),
            Some(NodeId(parent)),
            NodeKind::Field {
                spec: FieldSpec {
                    element_type: ElementType::Float64,
                    shape,
                    growing,
                },
            },
            path.parse().unwrap(),
        )
    }

    fn tree_with_field(shape: Option<Vec<usize>>, growing: bool) -> WriterTree {
        let root = WriterNode::new(
            NodeId(0),
            "definition",
            BTreeMap::new(),
            None,
            NodeKind::Definition,
            NexusPath::root(),
        );
        let group = WriterNode::new(
            NodeId(1),
            "group",
            BTreeMap::new(),
            Some(NodeId(0)),
            NodeKind::Group {
                nx_class: "NXentry".into(),
            },
            "/entry".parse().unwrap(),
        );
        WriterTree::from_nodes(vec![root, group, field(2, 1, "/entry/x", shape, growing)])
    }

    fn memory_handle() -> (FileHandle, crate::nexus::memory::MemoryFileView) {
        let file = MemoryNexusFile::new("t.nxs");
        let view = file.view();
        let boxed: Box<dyn NexusFile> = Box::new(file);
        (Arc::new(Mutex::new(boxed)), view)
    }

    #[test]
    fn debug_output_names_path_and_attachment() {
        let tree = tree_with_field(None, false);
        let (handle, _) = memory_handle();
        let detached = format!("{:?}", tree.node(NodeId(2)));
        assert!(detached.contains("/entry/x"));
        assert!(detached.contains("attached: false"));

        tree.attach(&handle);
        assert!(format!("{:?}", tree.node(NodeId(2))).contains("attached: true"));
        assert!(format!("{tree:?}").contains("WriterNode"));
    }

    #[tokio::test]
    async fn detached_node_refuses_to_store() {
        let tree = tree_with_field(None, false);
        let err = tree.node(NodeId(2)).store(&DataHolder::scalar(1.0)).await.unwrap_err();
        assert!(matches!(err, WriterError::DetachedNode(path) if path == "/entry/x"));
    }

    #[tokio::test]
    async fn growing_field_appends_steps() {
        let tree = tree_with_field(None, true);
        let (handle, view) = memory_handle();
        tree.attach(&handle);
        tree.materialize().await.unwrap();
        for x in [1.0, 2.0, 3.0] {
            tree.node(NodeId(2)).store(&DataHolder::scalar(x)).await.unwrap();
        }
        assert_eq!(view.field("/entry/x").unwrap().to_f64_vec(), vec![1.0, 2.0, 3.0]);
        tree.detach_all();
        assert!(!tree.node(NodeId(2)).is_attached());
    }

    #[tokio::test]
    async fn declared_shape_is_enforced() {
        let tree = tree_with_field(Some(vec![4]), false);
        let (handle, _view) = memory_handle();
        tree.attach(&handle);
        tree.materialize().await.unwrap();
        let short = DataHolder::from_json(&serde_json::json!([1, 2, 3])).unwrap();
        let err = tree.node(NodeId(2)).store(&short).await.unwrap_err();
        assert!(matches!(
            err,
            WriterError::ShapeMismatch { ref declared, ref actual, .. }
                if declared == &[4] && actual == &[3]
        ));
    }

    #[test]
    fn partitions_index_by_phase() {
        let mut partitions = PhasePartitions::default();
        partitions.push(Phase::Init, NodeId(3));
        partitions.push(Phase::Final, NodeId(5));
        partitions.push(Phase::Final, NodeId(4));
        assert_eq!(partitions.get(Phase::Final), &[NodeId(5), NodeId(4)]);
        assert_eq!(partitions.len(), 3);
        assert!(partitions.get(Phase::Step).is_empty());
    }
}
