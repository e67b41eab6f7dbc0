//! XML configuration compiler.
//!
//! Streams the configuration once, depth-first. Every opening tag creates the
//! matching [`WriterNode`] as the last child of the node on top of the stack
//! and pushes it; every closing tag pops it. When a popped field or attribute
//! declares a `<datasource>`, the node is bound and appended to the partition
//! of its phase. `<datasource>` bodies are not compiled: they are captured
//! verbatim by the [`inner`] handler and handed to the
//! [`SourceRegistry`](crate::sources::SourceRegistry).

mod inner;

use crate::data::{DataHolder, ElementType, Value};
use crate::error::{WriterError, WriterResult};
use crate::nexus::{FieldSpec, NexusPath};
use crate::runner::Phase;
use crate::sources::{Binding, CompileOverrides, SourceBody, SourceRegistry};
use crate::tree::{NodeId, NodeKind, PhasePartitions, WriterNode, WriterTree};
use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|_| unreachable!("static pattern"))
});

/// Result of compiling one configuration.
#[derive(Debug, Clone)]
pub struct CompiledConfig {
    /// Frozen node tree
    pub tree: Arc<WriterTree>,
    /// Bound nodes per phase, in document order
    pub partitions: PhasePartitions,
}

/// Compiles XML configurations against an immutable source registry.
#[derive(Debug, Clone)]
pub struct ConfigCompiler {
    registry: Arc<SourceRegistry>,
    overrides: CompileOverrides,
}

impl ConfigCompiler {
    /// Compiler resolving data sources through `registry`.
    pub fn new(registry: Arc<SourceRegistry>) -> Self {
        Self {
            registry,
            overrides: CompileOverrides::default(),
        }
    }

    /// Apply decoder and datasource overrides.
    pub fn with_overrides(mut self, overrides: CompileOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Compile `xml` into a tree and its phase partitions.
    ///
    /// # Errors
    ///
    /// `ConfigSyntax` for malformed XML, mismatched tags, unknown tags, types,
    /// phases or data source variants, unregistered decoders and invalid names.
    #[instrument(skip_all, fields(bytes = xml.len()))]
    pub fn compile(&self, xml: &str) -> WriterResult<CompiledConfig> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);
        reader.check_end_names(true);
        let mut handler = Handler::new(&self.registry, &self.overrides);

        loop {
            let open_start = reader.buffer_position();
            let event = reader.read_event()?;
            let open_end = reader.buffer_position();
            match event {
                Event::Start(start) => {
                    let tag = tag_name(&start);
                    let attrs = read_attributes(&start)?;
                    if tag == "datasource" {
                        let fragment = inner::capture(&mut reader, xml, open_start, open_end)?;
                        handler.datasource(attrs, fragment)?;
                    } else {
                        handler.start_element(&tag, attrs)?;
                    }
                }
                Event::Empty(start) => {
                    let tag = tag_name(&start);
                    let attrs = read_attributes(&start)?;
                    if tag == "datasource" {
                        let fragment = inner::empty(xml, open_start, open_end)?;
                        handler.datasource(attrs, fragment)?;
                    } else {
                        handler.start_element(&tag, attrs)?;
                        handler.end_element(&tag)?;
                    }
                }
                Event::End(end) => {
                    let tag = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                    handler.end_element(&tag)?;
                }
                Event::Text(text) => handler.characters(&text.unescape()?),
                Event::CData(data) => handler.characters(&String::from_utf8_lossy(&data)),
                Event::Eof => break,
                _ => {}
            }
        }

        let compiled = handler.finish()?;
        debug!(
            nodes = compiled.tree.len(),
            init = compiled.partitions.init.len(),
            step = compiled.partitions.step.len(),
            final_ = compiled.partitions.final_.len(),
            "configuration compiled"
        );
        Ok(compiled)
    }
}

fn tag_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

fn read_attributes(start: &BytesStart<'_>) -> WriterResult<BTreeMap<String, String>> {
    let mut attrs = BTreeMap::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| WriterError::ConfigSyntax(e.to_string()))?;
        attrs.insert(
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            attr.unescape_value()?.into_owned(),
        );
    }
    Ok(attrs)
}

/// Streaming handler state: node arena, open-tag stack and partitions.
struct Handler<'a> {
    registry: &'a SourceRegistry,
    overrides: &'a CompileOverrides,
    nodes: Vec<WriterNode>,
    stack: Vec<NodeId>,
    partitions: PhasePartitions,
    root_closed: bool,
}

impl<'a> Handler<'a> {
    fn new(registry: &'a SourceRegistry, overrides: &'a CompileOverrides) -> Self {
        Self {
            registry,
            overrides,
            nodes: Vec::new(),
            stack: Vec::new(),
            partitions: PhasePartitions::default(),
            root_closed: false,
        }
    }

    fn top(&self) -> Option<&WriterNode> {
        self.stack.last().map(|id| &self.nodes[id.0])
    }

    fn start_element(&mut self, tag: &str, attrs: BTreeMap<String, String>) -> WriterResult<()> {
        let parent = self.top();
        let parent_kind = parent.map(|p| p.kind.clone());
        let parent_path = parent.map(|p| p.path.clone()).unwrap_or_default();

        match (tag, &parent_kind) {
            ("definition", None) if !self.root_closed => {}
            ("definition", _) => return Err(syntax("<definition> must be the single root element")),
            (_, None) => return Err(syntax(format!("<{tag}> outside <definition>"))),
            ("group", Some(NodeKind::Definition | NodeKind::Group { .. })) => {}
            ("field" | "link", Some(NodeKind::Group { .. })) => {}
            (
                "attribute",
                Some(NodeKind::Definition | NodeKind::Group { .. } | NodeKind::Field { .. }),
            ) => {}
            ("dimensions", Some(NodeKind::Field { .. } | NodeKind::Attribute { .. })) => {}
            ("dim", Some(NodeKind::Dimensions { .. })) => {}
            ("strategy", Some(NodeKind::Field { .. } | NodeKind::Attribute { .. })) => {}
            ("doc", Some(_)) => {}
            (
                "group" | "field" | "link" | "attribute" | "dimensions" | "dim" | "strategy",
                Some(kind),
            ) => return Err(syntax(format!("<{tag}> is not allowed inside {}", kind_name(kind)))),
            (other, _) => return Err(syntax(format!("unknown tag <{other}>"))),
        }

        let (kind, path) = match tag {
            "definition" => (NodeKind::Definition, NexusPath::root()),
            "group" => {
                let nx_class = require(&attrs, tag, "type")?.to_string();
                let name = match attrs.get("name") {
                    Some(name) => name.clone(),
                    None => nx_class.strip_prefix("NX").unwrap_or(&nx_class).to_string(),
                };
                check_name(&name)?;
                (NodeKind::Group { nx_class }, parent_path.join(&name))
            }
            "field" => {
                let name = require(&attrs, tag, "name")?;
                check_name(name)?;
                let element_type = element_type(&attrs, ElementType::Float64)?;
                (
                    NodeKind::Field {
                        spec: FieldSpec {
                            element_type,
                            shape: None,
                            growing: false,
                        },
                    },
                    parent_path.join(name),
                )
            }
            "attribute" => {
                let name = require(&attrs, tag, "name")?;
                check_name(name)?;
                (
                    NodeKind::Attribute {
                        name: name.to_string(),
                        element_type: element_type(&attrs, ElementType::Text)?,
                        shape: None,
                    },
                    parent_path,
                )
            }
            "link" => {
                let name = require(&attrs, tag, "name")?;
                check_name(name)?;
                let target: NexusPath = require(&attrs, tag, "target")?.parse()?;
                (NodeKind::Link { target }, parent_path.join(name))
            }
            "dimensions" => {
                let rank = attrs.get("rank").map(|r| parse_usize(r, "rank")).transpose()?;
                (NodeKind::Dimensions { rank }, parent_path)
            }
            "dim" => {
                let index = parse_usize(require(&attrs, tag, "index")?, "index")?;
                let value = attrs.get("value").map(|v| parse_usize(v, "value")).transpose()?;
                (NodeKind::Dim { index, value }, parent_path)
            }
            "strategy" => {
                let mode = attrs.get("mode").map(|m| m.parse::<Phase>()).transpose()?;
                let trigger = attrs.get("trigger").cloned();
                (NodeKind::Strategy { mode, trigger }, parent_path)
            }
            _ => (NodeKind::Doc, parent_path),
        };
        self.push(tag, attrs, kind, path);
        Ok(())
    }

    fn push(
        &mut self,
        tag: &str,
        attrs: BTreeMap<String, String>,
        kind: NodeKind,
        path: NexusPath,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        let parent = self.stack.last().copied();
        self.nodes.push(WriterNode::new(id, tag, attrs, parent, kind, path));
        if let Some(parent) = parent {
            self.nodes[parent.0].children.push(id);
        }
        self.stack.push(id);
        id
    }

    /// A `<datasource>` is a leaf: pushed and popped around its captured body.
    fn datasource(
        &mut self,
        attrs: BTreeMap<String, String>,
        fragment: crate::tree::CapturedFragment,
    ) -> WriterResult<()> {
        let parent = self
            .top()
            .filter(|p| matches!(p.kind, NodeKind::Field { .. } | NodeKind::Attribute { .. }))
            .ok_or_else(|| syntax("<datasource> must be inside a <field> or <attribute>"))?;
        let has_source = parent
            .children
            .iter()
            .any(|c| matches!(self.nodes[c.0].kind, NodeKind::DataSource { .. }));
        if has_source {
            return Err(syntax(format!("{} declares more than one <datasource>", parent.label())));
        }
        let declared_type = require(&attrs, "datasource", "type")?.to_string();
        let path = parent.path.clone();
        self.push(
            "datasource",
            attrs,
            NodeKind::DataSource {
                declared_type,
                fragment,
            },
            path,
        );
        self.end_element("datasource")
    }

    fn characters(&mut self, text: &str) {
        if let Some(&id) = self.stack.last() {
            let node = &mut self.nodes[id.0];
            if !node.text.is_empty() {
                node.text.push(' ');
            }
            node.text.push_str(text.trim());
        }
    }

    fn end_element(&mut self, tag: &str) -> WriterResult<()> {
        let id = self
            .stack
            .pop()
            .ok_or_else(|| syntax(format!("unexpected closing tag </{tag}>")))?;
        if self.nodes[id.0].tag != tag {
            return Err(syntax(format!(
                "closing tag </{tag}> does not match <{}>",
                self.nodes[id.0].tag
            )));
        }
        let parent = self.stack.last().copied();

        match self.nodes[id.0].kind.clone() {
            NodeKind::Definition => self.root_closed = true,
            NodeKind::Doc => {
                let text = self.nodes[id.0].text.clone();
                if let Some(parent) = parent {
                    self.nodes[parent.0].doc = text;
                }
            }
            NodeKind::Dimensions { rank } => {
                let shape = self.declared_shape(id, rank)?;
                if let Some(parent) = parent {
                    match &mut self.nodes[parent.0].kind {
                        NodeKind::Field { spec } => spec.shape = shape,
                        NodeKind::Attribute { shape: declared, .. } => *declared = shape,
                        _ => {}
                    }
                }
            }
            NodeKind::Field { .. } | NodeKind::Attribute { .. } => self.close_value_node(id)?,
            _ => {}
        }
        Ok(())
    }

    /// Shape declared by a `<dimensions>` block, `None` when any axis is open.
    fn declared_shape(&self, id: NodeId, rank: Option<usize>) -> WriterResult<Option<Vec<usize>>> {
        let mut dims: Vec<(usize, Option<usize>)> = self.nodes[id.0]
            .children
            .iter()
            .filter_map(|c| match self.nodes[c.0].kind {
                NodeKind::Dim { index, value } => Some((index, value)),
                _ => None,
            })
            .collect();
        dims.sort_by_key(|(index, _)| *index);
        let rank = rank.unwrap_or(dims.len());
        if dims.len() > rank || dims.iter().enumerate().any(|(i, (index, _))| *index != i + 1) {
            return Err(syntax(format!(
                "dimensions of {} do not match rank {rank}",
                self.nodes[id.0].label()
            )));
        }
        if dims.len() < rank {
            return Ok(None);
        }
        Ok(dims.into_iter().map(|(_, value)| value).collect())
    }

    /// Resolve the binding or literal value of a closing field/attribute.
    fn close_value_node(&mut self, id: NodeId) -> WriterResult<()> {
        let node = &self.nodes[id.0];
        let mut strategy: (Option<Phase>, Option<String>) = (None, None);
        let mut datasource = None;
        for child in &node.children {
            match &self.nodes[child.0].kind {
                NodeKind::Strategy { mode, trigger } => strategy = (*mode, trigger.clone()),
                NodeKind::DataSource {
                    declared_type,
                    fragment,
                } => datasource = Some((child, declared_type.clone(), fragment.content.clone())),
                _ => {}
            }
        }

        let Some((ds_id, declared_type, content)) = datasource else {
            let text = node.text.trim();
            if !text.is_empty() {
                let element_type = match &node.kind {
                    NodeKind::Field { spec } => spec.element_type,
                    NodeKind::Attribute { element_type, .. } => *element_type,
                    _ => ElementType::Text,
                };
                let literal = literal_value(text, element_type)
                    .map_err(|e| syntax(format!("{}: {e}", node.label())))?;
                self.nodes[id.0].literal = Some(literal);
            }
            return Ok(());
        };

        let ds_attrs = &self.nodes[ds_id.0].attributes;
        let phase = match ds_attrs.get("strategy") {
            Some(mode) => mode.parse()?,
            None => strategy.0.unwrap_or(Phase::Step),
        };
        let name = ds_attrs.get("name").cloned();
        let variant = self.overrides.variant(&declared_type)?;
        let body = SourceBody::parse(&content)?;
        let source = self.registry.build_source(variant, &body, self.overrides)?;

        let node = &mut self.nodes[id.0];
        if let (Phase::Step, NodeKind::Field { spec }) = (phase, &mut node.kind) {
            spec.growing = true;
        }
        node.binding = Some(Binding {
            variant,
            phase,
            trigger: strategy.1,
            name,
            source,
        });
        self.partitions.push(phase, id);
        Ok(())
    }

    fn finish(self) -> WriterResult<CompiledConfig> {
        if let Some(open) = self.stack.last() {
            return Err(syntax(format!("unclosed tag <{}>", self.nodes[open.0].tag)));
        }
        if !self.root_closed {
            return Err(syntax("document has no <definition> root"));
        }
        Ok(CompiledConfig {
            tree: Arc::new(WriterTree::from_nodes(self.nodes)),
            partitions: self.partitions,
        })
    }
}

fn syntax(msg: impl Into<String>) -> WriterError {
    WriterError::ConfigSyntax(msg.into())
}

fn kind_name(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::Definition => "<definition>",
        NodeKind::Group { .. } => "<group>",
        NodeKind::Field { .. } => "<field>",
        NodeKind::Attribute { .. } => "<attribute>",
        NodeKind::Link { .. } => "<link>",
        NodeKind::Dimensions { .. } => "<dimensions>",
        NodeKind::Dim { .. } => "<dim>",
        NodeKind::Doc => "<doc>",
        NodeKind::Strategy { .. } => "<strategy>",
        NodeKind::DataSource { .. } => "<datasource>",
    }
}

fn require<'m>(attrs: &'m BTreeMap<String, String>, tag: &str, key: &str) -> WriterResult<&'m str> {
    attrs
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| syntax(format!("<{tag}> requires attribute '{key}'")))
}

fn check_name(name: &str) -> WriterResult<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(syntax(format!("invalid node name '{name}'")))
    }
}

fn element_type(
    attrs: &BTreeMap<String, String>,
    default: ElementType,
) -> WriterResult<ElementType> {
    match attrs.get("type") {
        None => Ok(default),
        Some(name) => ElementType::from_nx_type(name)
            .ok_or_else(|| syntax(format!("unknown type '{name}'"))),
    }
}

fn parse_usize(text: &str, what: &str) -> WriterResult<usize> {
    text.trim()
        .parse()
        .map_err(|_| syntax(format!("invalid {what} '{text}'")))
}

/// Literal tag text as a holder: whole text for strings, whitespace-separated
/// numbers otherwise (one number is a scalar, more a spectrum).
fn literal_value(text: &str, element_type: ElementType) -> Result<DataHolder, String> {
    if element_type == ElementType::Text {
        return Ok(DataHolder::scalar(text));
    }
    let values: Vec<Value> = text
        .split_whitespace()
        .map(|token| {
            Value::Text(token.to_string())
                .coerce(element_type)
                .ok_or_else(|| format!("'{token}' is not a valid {element_type}"))
        })
        .collect::<Result<_, _>>()?;
    match values.as_slice() {
        [single] => Ok(DataHolder::scalar(single.clone())),
        _ => DataHolder::spectrum(values).map_err(|e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XML: &str = r#"
<definition>
  <group type="NXentry" name="entry">
    <doc>Scan entry</doc>
    <field name="title" type="NX_CHAR">
      <strategy mode="INIT"/>
      <datasource type="CLIENT"><record name="title"/></datasource>
    </field>
    <group type="NXinstrument">
      <field name="counter" type="NX_FLOAT64" units="counts">
        <datasource type="CLIENT" name="ct01"><record name="ct01"/></datasource>
      </field>
      <field name="spectrum" type="NX_INT32">
        <dimensions rank="1"><dim index="1" value="2048"/></dimensions>
        <strategy mode="STEP" trigger="mca"/>
        <datasource type="TANGO">
          <device name="p09/mca/1" member="attribute"/>
          <record name="Data"/>
        </datasource>
      </field>
      <field name="wavelength" type="NX_FLOAT">1.54</field>
    </group>
    <field name="end_note" type="NX_CHAR">
      <datasource type="CLIENT" strategy="FINAL"><record name="note"/></datasource>
    </field>
    <group type="NXdata" name="data">
      <link name="counter" target="/entry/instrument/counter"/>
    </group>
  </group>
</definition>"#;

    fn compiler() -> ConfigCompiler {
        ConfigCompiler::new(Arc::new(SourceRegistry::default()))
    }

    fn labels(config: &CompiledConfig, phase: Phase) -> Vec<String> {
        config
            .partitions
            .get(phase)
            .iter()
            .map(|id| config.tree.node(*id).label())
            .collect()
    }

    #[test]
    fn builds_tree_and_partitions() {
        let config = compiler().compile(XML).unwrap();
        assert_eq!(labels(&config, Phase::Init), vec!["/entry/title"]);
        assert_eq!(
            labels(&config, Phase::Step),
            vec!["/entry/instrument/counter", "/entry/instrument/spectrum"]
        );
        assert_eq!(labels(&config, Phase::Final), vec!["/entry/end_note"]);

        let tree = &config.tree;
        let entry = tree.node(tree.node(tree.root()).children()[0]);
        assert_eq!(entry.doc(), "Scan entry");
        assert_eq!(entry.path().to_string(), "/entry");

        let spectrum = tree.node(config.partitions.step[1]);
        match spectrum.kind() {
            NodeKind::Field { spec } => {
                assert_eq!(spec.shape, Some(vec![2048]));
                assert!(spec.growing);
                assert_eq!(spec.element_type, ElementType::Int64);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert_eq!(spectrum.binding().unwrap().trigger.as_deref(), Some("mca"));

        let wavelength = tree
            .iter()
            .find(|n| n.path().to_string() == "/entry/instrument/wavelength")
            .unwrap();
        assert_eq!(wavelength.literal(), Some(&DataHolder::scalar(1.54)));
    }

    #[test]
    fn every_node_has_one_parent_except_the_root() {
        let config = compiler().compile(XML).unwrap();
        let tree = &config.tree;
        for node in tree.iter() {
            match node.parent() {
                None => assert_eq!(node.id(), tree.root()),
                Some(parent) => assert!(tree.node(parent).children().contains(&node.id())),
            }
        }
    }

    #[test]
    fn compilation_is_deterministic() {
        let a = compiler().compile(XML).unwrap();
        let b = compiler().compile(XML).unwrap();
        assert_eq!(a.partitions, b.partitions);
        assert_eq!(a.tree.outline(), b.tree.outline());
    }

    #[test]
    fn datasource_body_is_kept_verbatim() {
        let config = compiler().compile(XML).unwrap();
        let ds = config
            .tree
            .iter()
            .find(|n| matches!(n.kind(), NodeKind::DataSource { declared_type, .. } if declared_type == "TANGO"))
            .unwrap();
        match ds.kind() {
            NodeKind::DataSource { fragment, .. } => {
                assert_eq!(fragment.pre, r#"<datasource type="TANGO">"#);
                assert!(fragment.content.contains(r#"<device name="p09/mca/1" member="attribute"/>"#));
                assert_eq!(fragment.post, "</datasource>");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn group_name_defaults_to_class() {
        let config = compiler().compile(XML).unwrap();
        assert!(config
            .tree
            .iter()
            .any(|n| n.path().to_string() == "/entry/instrument"));
    }

    #[test]
    fn rejects_invalid_documents() {
        let cases = [
            ("<definition><group type=\"NXentry\"></field></definition>", "mismatched close"),
            ("<definition><group type=\"NXentry\">", "unclosed"),
            ("<definition><widget/></definition>", "unknown tag"),
            ("<definition><field name=\"x\"/></definition>", "field at root"),
            ("<definition><group type=\"NXentry\"><field name=\"x\" type=\"NX_COMPLEX\"/></group></definition>", "unknown type"),
            ("<definition><group type=\"NXentry\" name=\"1st\"/></definition>", "bad name"),
            (
                "<definition><group type=\"NXentry\"><field name=\"x\"><datasource type=\"PYEVAL\"><record name=\"x\"/></datasource></field></group></definition>",
                "unknown variant",
            ),
            (
                "<definition><group type=\"NXentry\"><field name=\"x\"><datasource type=\"CLIENT\" strategy=\"SOMETIMES\"><record name=\"x\"/></datasource></field></group></definition>",
                "unknown phase",
            ),
            (
                "<definition><group type=\"NXentry\"><field name=\"x\"><datasource type=\"PROGRAM\"><decoder name=\"nope\"/><record name=\"x\"/></datasource></field></group></definition>",
                "unregistered decoder",
            ),
            ("<definition/><definition/>", "two roots"),
            ("", "empty document"),
        ];
        for (xml, why) in cases {
            assert!(
                matches!(compiler().compile(xml), Err(WriterError::ConfigSyntax(_))),
                "expected ConfigSyntax for {why}"
            );
        }
    }

    #[test]
    fn overrides_apply_at_compile_time() {
        let xml = r#"<definition><group type="NXentry">
            <field name="x"><datasource type="PUSHED"><record name="x"/></datasource></field>
        </group></definition>"#;
        assert!(compiler().compile(xml).is_err());
        let overrides = CompileOverrides {
            datasources: [("PUSHED".to_string(), "CLIENT".to_string())].into(),
            ..CompileOverrides::default()
        };
        let config = compiler().with_overrides(overrides).compile(xml).unwrap();
        assert_eq!(config.partitions.step.len(), 1);
    }

    #[test]
    fn literal_values_follow_the_declared_type() {
        assert_eq!(literal_value("1 2 3", ElementType::Int64).unwrap().shape(), &[3]);
        assert_eq!(
            literal_value("hello world", ElementType::Text).unwrap(),
            DataHolder::scalar("hello world")
        );
        assert!(literal_value("abc", ElementType::Float64).is_err());
    }
}
