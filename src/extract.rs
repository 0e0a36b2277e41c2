//! Parsers for raw source payloads: XML, CSV, and HTML tables.
//!
//! Connectors keep their raw responses as text (that is what the replay
//! cache stores) and turn them into JSON here. Each parser is tolerant of
//! what the sources actually emit and returns [`HarvestError::Parse`]
//! instead of panicking on anything else.

use std::collections::BTreeMap;

use harvest_core::{HarvestError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{json, Map, Value};

/// Key holding the text content of an element in [`xml_to_json`] output.
pub const TEXT_KEY: &str = "__text__";

struct XmlNode {
    tag: String,
    attrs: Map<String, Value>,
    text: String,
    children: Vec<(String, Value)>,
}

impl XmlNode {
    fn open(start: &BytesStart) -> Result<Self> {
        let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attrs = Map::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| HarvestError::Parse(format!("XML attribute: {}", e)))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| HarvestError::Parse(format!("XML attribute: {}", e)))?;
            attrs.insert(key, Value::String(value.into_owned()));
        }
        Ok(Self {
            tag,
            attrs,
            text: String::new(),
            children: Vec::new(),
        })
    }

    fn into_value(self) -> (String, Value) {
        let mut map = self.attrs;
        if !self.text.is_empty() {
            map.insert(TEXT_KEY.to_string(), Value::String(self.text));
        }
        for (tag, child) in self.children {
            let slot = map
                .entry(tag)
                .or_insert_with(|| Value::Array(Vec::new()));
            match slot {
                Value::Array(items) => items.push(child),
                other => *other = Value::Array(vec![child]),
            }
        }
        (self.tag, Value::Object(map))
    }
}

/// Convert an XML document into a JSON tree.
///
/// Attributes become string fields, child elements are grouped by tag into
/// arrays, and the text that precedes an element's first child is stored
/// under [`TEXT_KEY`]. The root element's object is returned.
pub fn xml_to_json(raw: &str) -> Result<Value> {
    let mut reader = Reader::from_str(raw);
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<Value> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| HarvestError::Parse(format!("XML stream {}", e)))?;

        match event {
            Event::Start(start) => stack.push(XmlNode::open(&start)?),
            Event::Empty(start) => {
                let node = XmlNode::open(&start)?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| HarvestError::Parse("XML stream has unbalanced tags".into()))?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    if top.children.is_empty() {
                        let text = text
                            .unescape()
                            .map_err(|e| HarvestError::Parse(format!("XML text: {}", e)))?;
                        top.text.push_str(&text);
                    }
                }
            }
            Event::CData(data) => {
                if let Some(top) = stack.last_mut() {
                    if top.children.is_empty() {
                        top.text.push_str(&String::from_utf8_lossy(&data));
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(HarvestError::Parse("XML stream ended inside an element".into()));
    }
    root.ok_or_else(|| HarvestError::Parse("XML stream has no root element".into()))
}

fn attach(stack: &mut [XmlNode], root: &mut Option<Value>, node: XmlNode) -> Result<()> {
    let (tag, value) = node.into_value();
    match stack.last_mut() {
        Some(parent) => parent.children.push((tag, value)),
        None if root.is_none() => *root = Some(value),
        None => {
            return Err(HarvestError::Parse(
                "XML stream has more than one root element".into(),
            ))
        }
    }
    Ok(())
}

/// Text of the first `tag` child under the [`TEXT_KEY`] convention.
pub fn first_text<'a>(node: &'a Value, tag: &str) -> Option<&'a str> {
    node.get(tag)?.get(0)?.get(TEXT_KEY)?.as_str()
}

/// Parse a CSV document with a header row into one map per record.
///
/// Fields may be quoted with `"`; a doubled quote inside a quoted field is a
/// literal quote, and quoted fields may span lines. Blank lines are skipped.
pub fn parse_csv(raw: &str) -> Result<Vec<BTreeMap<String, String>>> {
    let mut records = split_csv_records(raw)?.into_iter();

    let header = match records.next() {
        Some(header) => header,
        None => return Ok(Vec::new()),
    };

    let mut rows = Vec::new();
    for (n, record) in records.enumerate() {
        if record.len() > header.len() {
            return Err(HarvestError::Parse(format!(
                "CSV row {} has {} fields, header has {}",
                n + 1,
                record.len(),
                header.len()
            )));
        }
        let row = header
            .iter()
            .cloned()
            .zip(record.into_iter().chain(std::iter::repeat(String::new())))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

fn split_csv_records(raw: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                if !record.is_empty() || !field.is_empty() {
                    record.push(std::mem::take(&mut field));
                    records.push(std::mem::take(&mut record));
                }
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(HarvestError::Parse("CSV stream ends inside a quoted field".into()));
    }
    if !record.is_empty() || !field.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

const EMPTY_ACTIVITY: &str = "No changes have been made to this bug yet.";
const ACTIVITY_COLUMNS: usize = 5;

struct Cell {
    rowspan: Option<usize>,
    text: String,
}

/// Parse a Bugzilla `show_activity.cgi` page into activity events.
///
/// The activity lives in the first table whose header row has five columns
/// (Who, When, What, Removed, Added). `Who` and `When` cells carry a
/// `rowspan` telling how many changes were made at once; each change then
/// contributes one What/Removed/Added triple.
pub fn parse_bug_activity(raw_html: &str) -> Result<Vec<Value>> {
    if raw_html.contains(EMPTY_ACTIVITY) {
        return Ok(Vec::new());
    }

    let lower = raw_html.to_ascii_lowercase();
    let (start, end) = find_activity_table(&lower)
        .ok_or_else(|| HarvestError::Parse("Table of bug activity not found.".into()))?;
    let mut cells = collect_cells(&raw_html[start..end], &lower[start..end]).into_iter();

    let mut events = Vec::new();
    while let Some(who) = cells.next() {
        let when = next_cell(&mut cells)?;
        let changes = who.rowspan.unwrap_or(1);

        for _ in 0..changes {
            let what = next_cell(&mut cells)?;
            let removed = next_cell(&mut cells)?;
            let added = next_cell(&mut cells)?;
            events.push(json!({
                "Who": who.text,
                "When": when.text,
                "What": what.text,
                "Removed": removed.text,
                "Added": added.text,
            }));
        }
    }
    Ok(events)
}

fn next_cell(cells: &mut impl Iterator<Item = Cell>) -> Result<Cell> {
    cells
        .next()
        .ok_or_else(|| HarvestError::Parse("bug activity table is truncated".into()))
}

/// Position of the next `<name` tag (not a longer tag name) at or after `from`.
fn find_tag(lower: &str, name: &str, from: usize) -> Option<usize> {
    let needle = format!("<{}", name);
    let mut pos = from;
    while let Some(found) = lower.get(pos..)?.find(&needle) {
        let at = pos + found;
        match lower[at + needle.len()..].chars().next() {
            Some(c) if c == '>' || c == '/' || c.is_ascii_whitespace() => return Some(at),
            _ => pos = at + needle.len(),
        }
    }
    None
}

fn find_activity_table(lower: &str) -> Option<(usize, usize)> {
    let mut pos = 0;
    while let Some(start) = find_tag(lower, "table", pos) {
        let end = lower[start..]
            .find("</table>")
            .map_or(lower.len(), |e| start + e);
        let table = &lower[start..end];

        if let Some(tr) = find_tag(table, "tr", 0) {
            let tr_end = table[tr..].find("</tr>").map_or(table.len(), |e| tr + e);
            let row = &table[tr..tr_end];
            let mut headers = 0;
            let mut at = 0;
            while let Some(th) = find_tag(row, "th", at) {
                headers += 1;
                at = th + 3;
            }
            if headers == ACTIVITY_COLUMNS {
                return Some((start, end));
            }
        }
        pos = start + "<table".len();
    }
    None
}

fn collect_cells(html: &str, lower: &str) -> Vec<Cell> {
    let mut cells = Vec::new();
    let mut pos = 0;

    while let Some(start) = find_tag(lower, "td", pos) {
        let Some(open_end) = lower[start..].find('>').map(|e| start + e) else {
            break;
        };
        let close = lower[open_end..]
            .find("</td>")
            .map_or(lower.len(), |e| open_end + e);
        let close = match find_tag(lower, "td", open_end) {
            Some(next) if next < close => next,
            _ => close,
        };

        cells.push(Cell {
            rowspan: parse_rowspan(&lower[start..open_end]),
            text: format_text(&html[open_end + 1..close]),
        });
        pos = close;
    }
    cells
}

fn parse_rowspan(tag: &str) -> Option<usize> {
    let at = tag.find("rowspan")?;
    let rest = tag[at + "rowspan".len()..].trim_start();
    let rest = rest.strip_prefix('=')?.trim_start();
    let rest = rest.trim_start_matches(|c| c == '"' || c == '\'');
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Strip tags, decode entities, and collapse whitespace.
fn format_text(fragment: &str) -> String {
    let mut plain = String::with_capacity(fragment.len());
    let mut in_tag = false;
    for c in fragment.chars() {
        match c {
            '<' => {
                in_tag = true;
                plain.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => plain.push(c),
            _ => {}
        }
    }
    decode_entities(&plain)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_entities(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail.find(';').and_then(|semi| {
            let entity = &tail[1..semi];
            let c = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some(' '),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                    .and_then(char::from_u32),
            };
            c.map(|c| (c, semi))
        });

        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xml_groups_children_and_keeps_text() {
        let raw = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes" ?>
<bugzilla version="4.2.1" urlbase="http://example.com/">
  <bug>
    <bug_id>15</bug_id>
    <delta_ts>2015-08-12 18:32:10 +0000</delta_ts>
    <cc>one@example.com</cc>
    <cc>two@example.com</cc>
    <long_desc isprivate="0"><thetext>Fails &amp; crashes</thetext></long_desc>
    <flag name="review" status="+"/>
  </bug>
</bugzilla>"#;

        let tree = xml_to_json(raw).unwrap();
        assert_eq!(tree["version"], "4.2.1");

        let bug = &tree["bug"][0];
        assert_eq!(first_text(bug, "bug_id"), Some("15"));
        assert_eq!(first_text(bug, "delta_ts"), Some("2015-08-12 18:32:10 +0000"));
        assert_eq!(bug["cc"].as_array().unwrap().len(), 2);
        assert_eq!(bug["long_desc"][0]["isprivate"], "0");
        assert_eq!(first_text(&bug["long_desc"][0], "thetext"), Some("Fails & crashes"));
        assert_eq!(bug["flag"][0]["status"], "+");
        assert!(bug["flag"][0].get(TEXT_KEY).is_none());
    }

    #[test]
    fn xml_rejects_broken_streams() {
        assert!(matches!(
            xml_to_json("<bugzilla><bug></bugzilla>"),
            Err(HarvestError::Parse(_))
        ));
        assert!(xml_to_json("").is_err());
        assert!(xml_to_json("<a/><b/>").is_err());
    }

    #[test]
    fn csv_handles_quotes() {
        let raw = "bug_id,\"short_desc\",changeddate\n\
                   15,\"Crash, on \"\"save\"\"\",\"2009-07-30 11:35:33\"\n\
                   \n\
                   18,\"multi\nline\",\"2015-08-12 18:32:10\"\n";
        let rows = parse_csv(raw).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["bug_id"], "15");
        assert_eq!(rows[0]["short_desc"], "Crash, on \"save\"");
        assert_eq!(rows[1]["short_desc"], "multi\nline");
        assert_eq!(rows[1]["changeddate"], "2015-08-12 18:32:10");
    }

    #[test]
    fn csv_header_only_is_empty() {
        assert!(parse_csv("bug_id,changeddate\n").unwrap().is_empty());
        assert!(parse_csv("").unwrap().is_empty());
        assert!(parse_csv("a\n\"open").is_err());
    }

    const ACTIVITY: &str = r#"<html><body>
<table><tr><th>Navigation</th></tr></table>
<table border cellpadding="4">
  <tr>
    <th>Who</th><th>When</th><th>What</th><th>Removed</th><th>Added</th>
  </tr>
  <tr>
    <td rowspan="2" valign="top">sduenas&#64;example.com</td>
    <td rowspan="2" valign="top">2013-06-25 11:55:46 CEST</td>
    <td>Status</td><td>NEW</td><td>RESOLVED</td>
  </tr>
  <tr>
    <td>Resolution</td><td></td><td><a href="x">FIXED</a></td>
  </tr>
  <tr>
    <td rowspan="1">jdoe</td><td rowspan="1">2013-06-26 09:00:00 CEST</td>
    <td>CC</td><td>&lt;none&gt;</td><td>a&amp;b</td>
  </tr>
</table>
</body></html>"#;

    #[test]
    fn activity_rows_share_who_and_when() {
        let events = parse_bug_activity(ACTIVITY).unwrap();
        assert_eq!(events.len(), 3);

        assert_eq!(events[0]["Who"], "sduenas@example.com");
        assert_eq!(events[0]["When"], "2013-06-25 11:55:46 CEST");
        assert_eq!(events[0]["What"], "Status");
        assert_eq!(events[0]["Added"], "RESOLVED");

        assert_eq!(events[1]["Who"], "sduenas@example.com");
        assert_eq!(events[1]["What"], "Resolution");
        assert_eq!(events[1]["Removed"], "");
        assert_eq!(events[1]["Added"], "FIXED");

        assert_eq!(events[2]["Removed"], "<none>");
        assert_eq!(events[2]["Added"], "a&b");
    }

    #[test]
    fn activity_empty_and_missing() {
        let empty = "<html><body><p>No changes have been made to this bug yet.</p></body></html>";
        assert!(parse_bug_activity(empty).unwrap().is_empty());

        let missing = "<html><body><table><tr><th>A</th></tr></table></body></html>";
        assert!(matches!(
            parse_bug_activity(missing),
            Err(HarvestError::Parse(_))
        ));
    }
}
