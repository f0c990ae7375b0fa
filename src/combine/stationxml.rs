//! StationXML document merging.
//!
//! Partial documents are parsed into a lightweight element tree, `Network`
//! elements are merged by code, `Station` elements by code within each
//! network (channels of duplicate stations are appended), and a single
//! document is emitted. Resource-metadata headers (`Source`, `Created`,
//! ...) come from the first partial only.

use crate::error::FederatorError;
use bytes::Bytes;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tracing::warn;

#[derive(Debug, Clone)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

#[derive(Debug, Clone)]
enum Node {
    Element(Element),
    Text(String),
}

/// Local part of a possibly prefixed element name.
fn local(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

fn attr_value<'a>(el: &'a Element, name: &str) -> Option<&'a str> {
    el.attrs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn parse_error(e: impl std::fmt::Display) -> FederatorError {
    FederatorError::Internal(format!("stationxml parse error: {}", e))
}

fn parse_document(bytes: &[u8]) -> Result<Element, FederatorError> {
    let mut reader = Reader::from_reader(bytes);
    let config = reader.config_mut();
    config.trim_text_start = true;
    config.trim_text_end = true;

    let mut buf = Vec::new();
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event_into(&mut buf).map_err(parse_error)? {
            Event::Start(start) => {
                stack.push(element_from_start(&start)?);
            }
            Event::Empty(start) => {
                let element = element_from_start(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(element)),
                    None => root = Some(element),
                }
            }
            Event::Text(text) => {
                if let Some(parent) = stack.last_mut() {
                    let text = text.unescape().map_err(parse_error)?;
                    if !text.trim().is_empty() {
                        parent.children.push(Node::Text(text.into_owned()));
                    }
                }
            }
            Event::CData(cdata) => {
                if let Some(parent) = stack.last_mut() {
                    let text = String::from_utf8_lossy(&cdata).into_owned();
                    parent.children.push(Node::Text(text));
                }
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| parse_error("unbalanced end tag"))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(element)),
                    None => root = Some(element),
                }
            }
            Event::Eof => break,
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(parse_error("unexpected end of document"));
    }
    root.ok_or_else(|| parse_error("empty document"))
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, FederatorError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(parse_error)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(parse_error)?.into_owned();
        attrs.push((key, value));
    }
    Ok(Element {
        name,
        attrs,
        children: Vec::new(),
    })
}

fn child_position(parent: &Element, local_name: &str, code: &str) -> Option<usize> {
    parent.children.iter().position(|node| match node {
        Node::Element(el) => local(&el.name) == local_name && attr_value(el, "code") == Some(code),
        Node::Text(_) => false,
    })
}

/// Fold `incoming`'s networks into `base`. Non-`Network` root children of
/// `incoming` (resource-metadata headers) are dropped.
fn merge_into(base: &mut Element, incoming: Element) {
    for node in incoming.children {
        let network = match node {
            Node::Element(el) if local(&el.name) == "Network" => el,
            _ => continue,
        };
        let code = attr_value(&network, "code").unwrap_or_default().to_string();
        match child_position(base, "Network", &code) {
            None => base.children.push(Node::Element(network)),
            Some(pos) => {
                if let Node::Element(existing) = &mut base.children[pos] {
                    merge_network(existing, network);
                }
            }
        }
    }
}

/// Fold `incoming`'s stations into an existing network element. Channels of
/// a station already present by code are appended to it.
fn merge_network(base: &mut Element, incoming: Element) {
    for node in incoming.children {
        let station = match node {
            Node::Element(el) if local(&el.name) == "Station" => el,
            _ => continue,
        };
        let code = attr_value(&station, "code").unwrap_or_default().to_string();
        match child_position(base, "Station", &code) {
            None => base.children.push(Node::Element(station)),
            Some(pos) => {
                if let Node::Element(existing) = &mut base.children[pos] {
                    for child in station.children {
                        if matches!(&child, Node::Element(el) if local(&el.name) == "Channel") {
                            existing.children.push(child);
                        }
                    }
                }
            }
        }
    }
}

fn write_element(writer: &mut Writer<Vec<u8>>, el: &Element) -> Result<(), FederatorError> {
    let mut start = BytesStart::new(el.name.as_str());
    for (key, value) in &el.attrs {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if el.children.is_empty() {
        writer.write_event(Event::Empty(start)).map_err(parse_error)?;
        return Ok(());
    }

    writer.write_event(Event::Start(start)).map_err(parse_error)?;
    for child in &el.children {
        match child {
            Node::Element(inner) => write_element(writer, inner)?,
            Node::Text(text) => writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(parse_error)?,
        }
    }
    writer
        .write_event(Event::End(BytesEnd::new(el.name.as_str())))
        .map_err(parse_error)?;
    Ok(())
}

fn serialize(root: &Element) -> Result<Bytes, FederatorError> {
    let mut writer = Writer::new(Vec::new());
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(parse_error)?;
    write_element(&mut writer, root)?;
    Ok(Bytes::from(writer.into_inner()))
}

/// Merge partial StationXML documents into one. Malformed partials are
/// dropped with a warning; the first parseable partial contributes the
/// document headers.
pub fn merge(parts: Vec<Bytes>) -> Result<Bytes, FederatorError> {
    let mut base: Option<Element> = None;
    for part in parts {
        match parse_document(&part) {
            Ok(doc) => match base.as_mut() {
                None => base = Some(doc),
                Some(b) => merge_into(b, doc),
            },
            Err(e) => warn!("combine: dropping malformed stationxml partial: {}", e),
        }
    }
    match base {
        Some(root) => serialize(&root),
        None => Err(FederatorError::NoData),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(networks: &str) -> Bytes {
        Bytes::from(format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<FDSNStationXML xmlns="http://www.fdsn.org/xml/station/1" schemaVersion="1.1">
  <Source>test</Source>
  <Created>2020-01-01T00:00:00</Created>
  {}
</FDSNStationXML>"#,
            networks
        ))
    }

    fn count(haystack: &[u8], needle: &str) -> usize {
        String::from_utf8_lossy(haystack).matches(needle).count()
    }

    #[test]
    fn test_distinct_networks_append() {
        let a = doc(r#"<Network code="GR"><Station code="WET"><Channel code="BHZ"/></Station></Network>"#);
        let b = doc(r#"<Network code="CH"><Station code="DAVOX"><Channel code="HHZ"/></Station></Network>"#);
        let merged = merge(vec![a, b]).unwrap();
        assert_eq!(count(&merged, "<Network"), 2);
        assert_eq!(count(&merged, "<Source>"), 1);
    }

    #[test]
    fn test_same_network_merges_stations() {
        let a = doc(r#"<Network code="GR"><Station code="WET"><Channel code="BHZ"/></Station></Network>"#);
        let b = doc(r#"<Network code="GR"><Station code="FUR"><Channel code="BHZ"/></Station></Network>"#);
        let merged = merge(vec![a, b]).unwrap();
        assert_eq!(count(&merged, "<Network"), 1);
        assert_eq!(count(&merged, "<Station"), 2);
    }

    #[test]
    fn test_same_station_appends_channels() {
        let a = doc(r#"<Network code="GR"><Station code="WET"><Channel code="BHZ"/></Station></Network>"#);
        let b = doc(r#"<Network code="GR"><Station code="WET"><Channel code="LHZ"/></Station></Network>"#);
        let merged = merge(vec![a, b]).unwrap();
        assert_eq!(count(&merged, "<Station"), 1);
        assert_eq!(count(&merged, "<Channel"), 2);
    }

    #[test]
    fn test_non_first_headers_dropped() {
        let a = doc(r#"<Network code="GR"/>"#);
        let b = doc(r#"<Network code="CH"/>"#);
        let merged = merge(vec![a, b]).unwrap();
        assert_eq!(count(&merged, "<Source>"), 1);
        assert_eq!(count(&merged, "<Created>"), 1);
    }

    #[test]
    fn test_malformed_partial_dropped() {
        let a = doc(r#"<Network code="GR"/>"#);
        let b = Bytes::from("<broken");
        let merged = merge(vec![a, b]).unwrap();
        assert_eq!(count(&merged, "<Network"), 1);
    }

    #[test]
    fn test_all_malformed_is_nodata() {
        assert!(matches!(
            merge(vec![Bytes::from("<broken")]),
            Err(FederatorError::NoData)
        ));
    }

    #[test]
    fn test_text_content_preserved() {
        let a = doc(r#"<Network code="GR"><Description>German Regional</Description></Network>"#);
        let merged = merge(vec![a]).unwrap();
        assert!(String::from_utf8_lossy(&merged).contains("German Regional"));
    }
}
