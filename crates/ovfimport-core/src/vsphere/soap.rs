//! Minimal vim25 SOAP encoding.
//!
//! Responses are parsed into a small [`Node`] tree keyed by local element
//! names. Requests are built as strings with escaped values.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Error, Result};
use crate::inventory::{ManagedObjectReference, ObjectKind};

/// vim25 namespace.
pub const VIM_NAMESPACE: &str = "urn:vim25";

/// One element of a parsed response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    /// Local element name.
    pub name: String,
    /// Attributes with their qualified names.
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Node>,
}

impl Node {
    /// Parse an XML document into its root node.
    pub fn parse(xml: &str) -> Result<Node> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<Node> = Vec::new();

        loop {
            let event = reader.read_event().map_err(|e| {
                Error::api(format!(
                    "invalid SOAP response at byte {}: {}",
                    reader.buffer_position(),
                    e
                ))
            })?;

            match event {
                Event::Start(ref e) => stack.push(node_from_start(e)?),
                Event::Empty(ref e) => {
                    let node = node_from_start(e)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => return Ok(node),
                    }
                }
                Event::Text(ref t) => {
                    if let Some(node) = stack.last_mut() {
                        let text = t
                            .unescape()
                            .map_err(|e| Error::api(format!("invalid SOAP text: {}", e)))?;
                        node.text.push_str(&text);
                    }
                }
                Event::CData(ref c) => {
                    if let Some(node) = stack.last_mut() {
                        node.text.push_str(&String::from_utf8_lossy(c));
                    }
                }
                Event::End(_) => {
                    let node = stack
                        .pop()
                        .ok_or_else(|| Error::api("unbalanced SOAP response"))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => return Ok(node),
                    }
                }
                Event::Eof => return Err(Error::api("truncated SOAP response")),
                _ => {}
            }
        }
    }

    /// First child named `name`.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children named `name`.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Follow a path of child names.
    pub fn find(&self, path: &[&str]) -> Option<&Node> {
        path.iter().try_fold(self, |node, name| node.child(name))
    }

    /// Attribute by qualified name, or by local name after the prefix.
    /// An exact match wins, so `type` is not shadowed by `xsi:type`.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .or_else(|| {
                self.attributes
                    .iter()
                    .find(|(key, _)| key.rsplit(':').next() == Some(name))
            })
            .map(|(_, value)| value.as_str())
    }

    /// Trimmed text content.
    pub fn text(&self) -> &str {
        self.text.trim()
    }

    /// Trimmed text of the first child named `name`.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(Node::text)
    }

    /// Read this node as a managed object reference (`type` attribute plus text).
    pub fn to_reference(&self) -> Option<ManagedObjectReference> {
        let kind = self.attribute("type")?;
        let value = self.text();
        if value.is_empty() {
            return None;
        }
        Some(ManagedObjectReference::new(kind, value))
    }

    /// Serialize back to XML under `tag`.
    ///
    /// Attributes keep their qualified names so `xsi:type` survives; the
    /// enclosing request must declare the prefixes.
    pub fn to_xml(&self, tag: &str) -> String {
        let mut out = String::new();
        self.write_xml(tag, &mut out);
        out
    }

    fn write_xml(&self, tag: &str, out: &mut String) {
        out.push('<');
        out.push_str(tag);
        for (key, value) in &self.attributes {
            if key == "xmlns" || key.starts_with("xmlns:") {
                continue;
            }
            out.push_str(&format!(" {}=\"{}\"", key, escape(value.as_str())));
        }
        out.push('>');
        out.push_str(&escape(self.text.as_str()));
        for child in &self.children {
            child.write_xml(&child.name, out);
        }
        out.push_str("</");
        out.push_str(tag);
        out.push('>');
    }
}

fn node_from_start(e: &BytesStart<'_>) -> Result<Node> {
    let mut node = Node {
        name: String::from_utf8_lossy(e.local_name().as_ref()).to_string(),
        ..Node::default()
    };
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::api(format!("invalid SOAP attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::api(format!("invalid SOAP attribute value: {}", e)))?
            .to_string();
        node.attributes.push((key, value));
    }
    Ok(node)
}

/// Wrap a body in a SOAP envelope.
pub fn envelope(body: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
            r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
            r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">"#,
            "<soapenv:Body>{}</soapenv:Body></soapenv:Envelope>"
        ),
        body
    )
}

/// A method call on `this` with pre-encoded parameters.
pub fn call(method: &str, this: &ManagedObjectReference, params: &str) -> String {
    format!(
        r#"<{method} xmlns="{ns}">{this}{params}</{method}>"#,
        method = method,
        ns = VIM_NAMESPACE,
        this = reference("_this", this),
        params = params
    )
}

/// `<tag>text</tag>` with the text escaped.
pub fn element(tag: &str, text: &str) -> String {
    format!("<{tag}>{}</{tag}>", escape(text), tag = tag)
}

/// `<tag type="Kind">value</tag>`.
pub fn reference(tag: &str, reference: &ManagedObjectReference) -> String {
    format!(
        r#"<{tag} type="{}">{}</{tag}>"#,
        escape(reference.kind.as_str()),
        escape(reference.value.as_str()),
        tag = tag
    )
}

/// Parse a response envelope, returning the first element of the body.
///
/// # Errors
///
/// SOAP faults become [`Error::ObjectNotFound`] for a missing managed object
/// and [`Error::Api`] otherwise.
pub fn parse_response(xml: &str) -> Result<Node> {
    let root = Node::parse(xml)?;
    let body = root
        .child("Body")
        .ok_or_else(|| Error::api("SOAP response has no Body"))?;

    if let Some(fault) = body.child("Fault") {
        return Err(fault_error(fault));
    }

    body.children
        .first()
        .cloned()
        .ok_or_else(|| Error::api("SOAP response body is empty"))
}

fn fault_error(fault: &Node) -> Error {
    let message = fault
        .child_text("faultstring")
        .unwrap_or("unknown SOAP fault")
        .to_string();

    let detail = fault.child("detail").and_then(|d| d.children.first());
    if let Some(detail) = detail {
        let fault_type = detail
            .attribute("xsi:type")
            .unwrap_or(detail.name.trim_end_matches("Fault"));
        if fault_type == "ManagedObjectNotFound" {
            let object = detail.child("obj").and_then(Node::to_reference);
            if let Some(object) = object {
                if let Some(kind) = ObjectKind::from_type_name(&object.kind) {
                    return Error::ObjectNotFound {
                        kind,
                        id: object.value,
                    };
                }
            }
        }
        return Error::api(format!("{} ({})", message, fault_type));
    }

    Error::api(message)
}

/// Message from a `LocalizedMethodFault`.
pub fn fault_message(node: &Node) -> String {
    if let Some(message) = node.child_text("localizedMessage").filter(|m| !m.is_empty()) {
        return message.to_string();
    }
    match node.child("fault") {
        Some(fault) => fault
            .attribute("xsi:type")
            .map(str::to_string)
            .unwrap_or_else(|| fault.name.clone()),
        None => node.text().to_string(),
    }
}
