//! Generic XML node tree the loaders walk.
//!
//! The document is read once with `quick-xml` into an owned tree of
//! [`XmlNode`]s; formulas and quantities then pull attributes and children by
//! name during the load and finalize phases.

use std::str::FromStr;

use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{ModelError, Result};

/// Element and attribute names used by the model document.
pub mod names {
    pub const SIMULATION: &str = "Simulation";
    pub const FORMULA_LIST: &str = "FormulaList";
    pub const FORMULA: &str = "Formula";
    pub const PARAMETER_LIST: &str = "ParameterList";
    pub const VARIABLE_LIST: &str = "VariableList";
    pub const OBSERVER_LIST: &str = "ObserverList";
    pub const SWITCH_LIST: &str = "SwitchList";
    pub const SWITCH: &str = "Switch";
    pub const CHANGE: &str = "Change";

    pub const PARAMETER: &str = "Parameter";
    pub const SPECIES: &str = "Species";
    pub const OBSERVER: &str = "Observer";
    pub const VARIABLE: &str = "Variable";
    pub const REFERENCE: &str = "Reference";

    pub const SCALE_FACTOR: &str = "ScaleFactor";
    pub const RHS_FORMULA_LIST: &str = "RHSFormulaList";
    pub const RHS_FORMULA: &str = "RHSFormula";

    pub const ID: &str = "Id";
    pub const NAME: &str = "Name";
    pub const PATH: &str = "Path";
    pub const ALIAS: &str = "Alias";
    pub const VALUE: &str = "Value";
    pub const FORMULA_ID: &str = "FormulaId";
    pub const INITIAL_VALUE_FORMULA_ID: &str = "InitialValueFormulaId";
    pub const NEGATIVE_VALUES_ALLOWED: &str = "NegativeValuesAllowed";
    pub const CAN_BE_VARIED: &str = "CanBeVaried";
    pub const START_TIME: &str = "StartTime";
    pub const QUANTITY_ID: &str = "QuantityId";
    pub const NEW_FORMULA_ID: &str = "NewFormulaId";
}

/// One element of the document: name, attributes in document order, text and children.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XmlNode {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.push((key.into(), value.to_string()));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: XmlNode) -> Self {
        self.children.push(child);
        self
    }

    /// Parses a complete document and returns its root element.
    pub fn parse(input: &str) -> Result<XmlNode> {
        const ERROR_SOURCE: &str = "XmlNode::parse";

        let mut reader = Reader::from_str(input);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlNode> = Vec::new();
        let mut root: Option<XmlNode> = None;

        loop {
            let event = reader.read_event().map_err(|e| {
                ModelError::parse(
                    ERROR_SOURCE,
                    format!("malformed XML at position {}: {}", reader.buffer_position(), e),
                )
            })?;

            match event {
                Event::Start(start) => stack.push(node_from_start(&start)?),
                Event::Empty(start) => {
                    let node = node_from_start(&start)?;
                    attach(&mut stack, &mut root, node)?;
                }
                Event::End(_) => {
                    let node = stack.pop().ok_or_else(|| {
                        ModelError::parse(ERROR_SOURCE, "unbalanced closing tag")
                    })?;
                    attach(&mut stack, &mut root, node)?;
                }
                Event::Text(text) => {
                    if let Some(current) = stack.last_mut() {
                        let raw = std::str::from_utf8(&text).map_err(|e| {
                            ModelError::parse(ERROR_SOURCE, format!("invalid UTF-8 text: {e}"))
                        })?;
                        let value = unescape(raw).map_err(|e| {
                            ModelError::parse(ERROR_SOURCE, format!("invalid escape: {e}"))
                        })?;
                        current.text.push_str(&value);
                    }
                }
                Event::GeneralRef(reference) => {
                    if let Some(current) = stack.last_mut() {
                        let name = std::str::from_utf8(&reference).map_err(|e| {
                            ModelError::parse(ERROR_SOURCE, format!("invalid UTF-8 text: {e}"))
                        })?;
                        let entity = format!("&{name};");
                        let value = unescape(&entity).map_err(|e| {
                            ModelError::parse(ERROR_SOURCE, format!("invalid escape: {e}"))
                        })?;
                        current.text.push_str(&value);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(ModelError::parse(
                ERROR_SOURCE,
                format!("unclosed element <{}>", stack[stack.len() - 1].name),
            ));
        }
        root.ok_or_else(|| ModelError::parse(ERROR_SOURCE, "document has no root element"))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn children(&self) -> &[XmlNode] {
        &self.children
    }

    pub fn first_child(&self) -> Option<&XmlNode> {
        self.children.first()
    }

    /// First child element with the given name.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.has_name(name))
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Typed attribute lookup. Missing attributes yield `default`; present but
    /// unparsable ones are parse errors.
    pub fn attribute_or<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.attribute(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse::<T>().map_err(|_| {
                ModelError::parse(
                    "XmlNode::attribute_or",
                    format!("<{}>: cannot parse attribute {}=\"{}\"", self.name, key, raw),
                )
            }),
        }
    }

    /// Boolean attribute written either as `0`/`1` or `false`/`true`.
    pub fn bool_attribute_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.attribute(key).map(str::trim) {
            None => Ok(default),
            Some("1") | Some("true") | Some("True") => Ok(true),
            Some("0") | Some("false") | Some("False") => Ok(false),
            Some(raw) => Err(ModelError::parse(
                "XmlNode::bool_attribute_or",
                format!("<{}>: cannot parse attribute {}=\"{}\"", self.name, key, raw),
            )),
        }
    }

    /// Value of the text content of child `name`, or `default` when the child is absent.
    pub fn child_value_or<T: FromStr>(&self, name: &str, default: T) -> Result<T> {
        match self.child(name) {
            None => Ok(default),
            Some(child) => child.text.trim().parse::<T>().map_err(|_| {
                ModelError::parse(
                    "XmlNode::child_value_or",
                    format!("<{}>: cannot parse <{}> value \"{}\"", self.name, name, child.text),
                )
            }),
        }
    }
}

fn node_from_start(start: &BytesStart<'_>) -> Result<XmlNode> {
    const ERROR_SOURCE: &str = "XmlNode::parse";

    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(|e| ModelError::parse(ERROR_SOURCE, format!("invalid element name: {e}")))?
        .to_string();
    let mut node = XmlNode::new(name);

    for attr in start.attributes() {
        let attr = attr.map_err(|e| {
            ModelError::parse(ERROR_SOURCE, format!("<{}>: bad attribute: {e}", node.name))
        })?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| ModelError::parse(ERROR_SOURCE, format!("invalid attribute name: {e}")))?
            .to_string();
        let raw = std::str::from_utf8(&attr.value)
            .map_err(|e| ModelError::parse(ERROR_SOURCE, format!("invalid attribute value: {e}")))?;
        let value = unescape(raw)
            .map_err(|e| ModelError::parse(ERROR_SOURCE, format!("invalid escape: {e}")))?;
        node.attributes.push((key, value.into_owned()));
    }
    Ok(node)
}

fn attach(stack: &mut [XmlNode], root: &mut Option<XmlNode>, node: XmlNode) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => {
            if root.is_some() {
                return Err(ModelError::parse(
                    "XmlNode::parse",
                    "document has more than one root element",
                ));
            }
            *root = Some(node);
        }
    }
    Ok(())
}
