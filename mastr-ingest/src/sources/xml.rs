use std::collections::BTreeMap;

use quick_xml::{escape::escape, events::Event, Reader};

use super::soap::SoapError;

/// One record as delivered by the service: flattened field name to text.
pub type RawRecord = BTreeMap<String, String>;

const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

/// Build a document/literal request for `operation` with ordered parameters.
pub fn envelope(namespace: &str, operation: &str, params: &[(&str, &str)]) -> String {
    let mut body = String::new();
    for (name, value) in params {
        body.push_str(&format!("<m:{name}>{}</m:{name}>", escape(*value)));
    }

    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8"?>"#,
            r#"<soapenv:Envelope xmlns:soapenv="{env}" xmlns:m="{ns}">"#,
            "<soapenv:Header/><soapenv:Body><m:{op}>{body}</m:{op}></soapenv:Body></soapenv:Envelope>"
        ),
        env = SOAP_ENV_NS,
        ns = escape(namespace),
        op = operation,
        body = body,
    )
}

/// Field name for a leaf at `rel` below the record element. Nested elements
/// join with `_`; a trailing `Wert` collapses into its parent.
fn field_name(rel: &[String]) -> String {
    let rel = match rel.split_last() {
        Some((last, rest)) if last == "Wert" && !rest.is_empty() => rest,
        _ => rel,
    };
    rel.join("_")
}

fn local_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

/// Extract every `record_tag` element of a response as a flat record.
///
/// A SOAP fault anywhere in the document turns into `SoapError::Fault`.
pub fn parse_records(xml: &str, record_tag: &str) -> Result<Vec<RawRecord>, SoapError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    // Per open element: true until a child element shows up.
    let mut leaf: Vec<bool> = Vec::new();
    let mut record_depth: Option<usize> = None;
    let mut current = RawRecord::new();
    let mut text = String::new();
    let mut records = Vec::new();
    // (faultcode, faultstring) once a Fault element was seen
    let mut fault: Option<(String, String)> = None;

    loop {
        match reader.read_event() {
            Err(e) => {
                return Err(SoapError::Xml(format!(
                    "at position {}: {e}",
                    reader.buffer_position()
                )))
            }
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                let name = local_name(e.local_name().as_ref());
                if let Some(open) = leaf.last_mut() {
                    *open = false;
                }
                if name == "Fault" && fault.is_none() {
                    fault = Some((String::new(), String::new()));
                }
                path.push(name);
                leaf.push(true);
                text.clear();

                if record_depth.is_none() && path.last().map(String::as_str) == Some(record_tag) {
                    record_depth = Some(path.len());
                    current = RawRecord::new();
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(open) = leaf.last_mut() {
                    *open = false;
                }
                if let Some(depth) = record_depth {
                    path.push(local_name(e.local_name().as_ref()));
                    current.insert(field_name(&path[depth..]), String::new());
                    path.pop();
                }
            }
            Ok(Event::Text(t)) => {
                let s = t
                    .unescape()
                    .map_err(|e| SoapError::Xml(e.to_string()))?;
                text.push_str(&s);
            }
            Ok(Event::CData(c)) => {
                text.push_str(&String::from_utf8_lossy(&c.into_inner()));
            }
            Ok(Event::End(_)) => {
                let was_leaf = leaf.pop().unwrap_or(false);
                match record_depth {
                    Some(depth) if path.len() == depth => {
                        records.push(std::mem::take(&mut current));
                        record_depth = None;
                    }
                    Some(depth) if was_leaf && path.len() > depth => {
                        current.insert(field_name(&path[depth..]), std::mem::take(&mut text));
                    }
                    _ => {
                        if let (Some((code, message)), true) = (fault.as_mut(), was_leaf) {
                            // SOAP 1.1 faultcode/faultstring, SOAP 1.2 Code/Value and Reason/Text
                            match path.last().map(String::as_str) {
                                Some("faultcode") => *code = std::mem::take(&mut text),
                                Some("Value") if code.is_empty() => *code = std::mem::take(&mut text),
                                Some("faultstring") => *message = std::mem::take(&mut text),
                                Some("Text") if message.is_empty() => *message = std::mem::take(&mut text),
                                _ => {}
                            }
                        }
                    }
                }
                path.pop();
                text.clear();
            }
            Ok(_) => {}
        }
    }

    if let Some((code, message)) = fault {
        let message = if message.is_empty() { "unspecified fault".to_string() } else { message };
        return Err(SoapError::Fault { code, message });
    }

    Ok(records)
}
