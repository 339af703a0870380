//! Namespace-aware element index over an XML text. Elements keep their byte offsets so queries
//! can be extended in place without re-serializing the user's markup.

use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub(crate) struct MalformedXml(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct XmlElement {
    /// Qualified name as written.
    pub(crate) name: String,
    pub(crate) namespace: Option<String>,
    pub(crate) local_name: String,
    pub(crate) parent: Option<usize>,
    /// Offset of the `<` of the start tag.
    pub(crate) start: usize,
    /// Offset of the `<` of the end tag, or of the end of an empty element.
    pub(crate) end_tag_start: usize,
    /// Offset just past the element.
    pub(crate) end: usize,
    pub(crate) empty: bool,
    /// Direct text content.
    pub(crate) text: String,
}

impl XmlElement {
    pub(crate) fn is(&self, namespace: Option<&str>, local_name: &str) -> bool {
        self.namespace.as_deref() == namespace && self.local_name == local_name
    }
}

#[derive(Debug)]
pub(crate) struct XmlDocument {
    elements: Vec<XmlElement>,
}

fn namespace_of(resolved: ResolveResult<'_>) -> Result<Option<String>, MalformedXml> {
    match resolved {
        ResolveResult::Bound(ns) => Ok(Some(String::from_utf8_lossy(ns.0).into_owned())),
        ResolveResult::Unbound => Ok(None),
        ResolveResult::Unknown(prefix) => Err(MalformedXml(format!(
            "unbound namespace prefix '{}'",
            String::from_utf8_lossy(&prefix)
        ))),
    }
}

impl XmlDocument {
    pub(crate) fn parse(xml: &str) -> Result<Self, MalformedXml> {
        let mut reader = NsReader::from_str(xml);
        let mut elements: Vec<XmlElement> = Vec::new();
        let mut open: Vec<usize> = Vec::new();

        loop {
            let before = reader.buffer_position() as usize;
            let (namespace, event) = match reader.read_resolved_event() {
                Ok((resolved, event)) => (namespace_of(resolved)?, event),
                Err(e) => return Err(MalformedXml(e.to_string())),
            };
            let after = reader.buffer_position() as usize;

            match event {
                Event::Start(ref start) | Event::Empty(ref start) => {
                    if open.is_empty() && !elements.is_empty() {
                        return Err(MalformedXml("more than one root element".to_string()));
                    }
                    let empty = matches!(event, Event::Empty(_));
                    let index = elements.len();
                    elements.push(XmlElement {
                        name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                        namespace,
                        local_name: String::from_utf8_lossy(start.local_name().as_ref())
                            .into_owned(),
                        parent: open.last().copied(),
                        start: before,
                        end_tag_start: after,
                        end: after,
                        empty,
                        text: String::new(),
                    });
                    if !empty {
                        open.push(index);
                    }
                }
                Event::End(_) => {
                    let element = open
                        .pop()
                        .and_then(|index| elements.get_mut(index))
                        .ok_or_else(|| MalformedXml("unexpected end tag".to_string()))?;
                    element.end_tag_start = before;
                    element.end = after;
                }
                Event::Text(text) => {
                    let unescaped = text
                        .unescape()
                        .map_err(|e| MalformedXml(e.to_string()))?;
                    match open.last().and_then(|index| elements.get_mut(*index)) {
                        Some(element) => element.text.push_str(&unescaped),
                        None if unescaped.trim().is_empty() => {}
                        None => {
                            return Err(MalformedXml(
                                "text outside of the root element".to_string(),
                            ));
                        }
                    }
                }
                Event::CData(data) => {
                    if let Some(element) = open.last().and_then(|index| elements.get_mut(*index))
                    {
                        element
                            .text
                            .push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !open.is_empty() {
            return Err(MalformedXml("unclosed element".to_string()));
        }
        if elements.is_empty() {
            return Err(MalformedXml("no root element".to_string()));
        }
        Ok(Self { elements })
    }

    pub(crate) fn root(&self) -> Option<&XmlElement> {
        self.elements.first()
    }

    pub(crate) fn elements(&self) -> &[XmlElement] {
        &self.elements
    }

    /// Direct children of the root element.
    pub(crate) fn root_children(&self) -> impl Iterator<Item = &XmlElement> {
        self.elements.iter().filter(|e| e.parent == Some(0))
    }

    /// Elements from the root down to `element`.
    pub(crate) fn ancestry(&self, index: usize) -> Vec<&XmlElement> {
        let mut chain = Vec::new();
        let mut current = Some(index);
        while let Some(element) = current.and_then(|i| self.elements.get(i)) {
            chain.push(element);
            current = element.parent;
        }
        chain.reverse();
        chain
    }
}

/// Inserts `fragment` as the last child of `element`.
pub(crate) fn append_child(xml: &str, element: &XmlElement, fragment: &str) -> String {
    if !element.empty {
        let (head, tail) = xml.split_at(element.end_tag_start);
        return format!("{head}{fragment}{tail}");
    }

    let (head, rest) = xml.split_at(element.start);
    let (tag, tail) = rest.split_at(element.end - element.start);
    let open_tag = tag.trim_end_matches("/>").trim_end();
    format!("{head}{open_tag}>{fragment}</{}>{tail}", element.name)
}

/// Strips a leading XML declaration.
pub(crate) fn without_declaration(xml: &str) -> &str {
    let trimmed = xml.trim_start();
    if trimmed.starts_with("<?xml")
        && let Some(end) = trimmed.find("?>")
    {
        let (_, rest) = trimmed.split_at(end + 2);
        return rest.trim_start();
    }
    trimmed
}
