// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Structured report of decoded syntax elements.
//!
//! The syntax decoder writes every field it decodes into a [`Dict`]. The
//! resulting tree keeps the decode order (and duplicated keys, which some
//! loops produce) and is serialized afterwards through `serde`, with the
//! rendering of hex and enumerated values selected by an [`OutputConfig`].

use std::io::Write;

use serde::ser::SerializeMap;
use serde::ser::SerializeSeq;
use serde::Serialize;
use serde::Serializer;

/// Rendering options for a report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputConfig {
    /// Render hex values as `"0xNN"` strings instead of decimal numbers.
    pub print_hex: bool,
    /// Render enumerated values as `"Name (N)"` instead of the bare number.
    pub explain_enum: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            print_hex: true,
            explain_enum: true,
        }
    }
}

/// A single reported value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Uint(u64),
    Hex(u64),
    Enum { name: &'static str, value: i64 },
    Str(String),
    Dict(Dict),
    List(List),
}

impl Value {
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Uint(v) | Value::Hex(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            Value::Enum { value, .. } => u64::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Uint(v) | Value::Hex(v) => i64::try_from(*v).ok(),
            Value::Enum { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }
}

/// An ordered group of named values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dict {
    entries: Vec<(String, Value)>,
}

impl Dict {
    pub fn new() -> Self {
        Default::default()
    }

    fn push(&mut self, key: &str, value: Value) -> &mut Value {
        self.entries.push((key.to_owned(), value));
        let last = self.entries.len() - 1;
        &mut self.entries[last].1
    }

    pub fn put_int<T: Into<i64>>(&mut self, key: &str, value: T) {
        self.push(key, Value::Int(value.into()));
    }

    pub fn put_uint<T: Into<u64>>(&mut self, key: &str, value: T) {
        self.push(key, Value::Uint(value.into()));
    }

    pub fn put_hex<T: Into<u64>>(&mut self, key: &str, value: T) {
        self.push(key, Value::Hex(value.into()));
    }

    pub fn put_enum<T: Into<i64>>(&mut self, key: &str, name: &'static str, value: T) {
        self.push(
            key,
            Value::Enum {
                name,
                value: value.into(),
            },
        );
    }

    pub fn put_str(&mut self, key: &str, value: &str) {
        self.push(key, Value::Str(value.to_owned()));
    }

    /// Opens a nested group under `key`.
    pub fn put_dict(&mut self, key: &str) -> &mut Dict {
        match self.push(key, Value::Dict(Dict::new())) {
            Value::Dict(dict) => dict,
            _ => unreachable!(),
        }
    }

    /// Opens a nested list under `key`.
    pub fn put_list(&mut self, key: &str) -> &mut List {
        match self.push(key, Value::List(List::new())) {
            Value::List(list) => list,
            _ => unreachable!(),
        }
    }

    /// Returns the first value reported under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_uint(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_uint)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }

    pub fn get_dict(&self, key: &str) -> Option<&Dict> {
        self.get(key).and_then(Value::as_dict)
    }

    pub fn get_list(&self, key: &str) -> Option<&List> {
        self.get(key).and_then(Value::as_list)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Keys in reporting order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn entries(&self) -> &[(String, Value)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns a serializable view of this dict using `config`.
    pub fn render<'a>(&'a self, config: &'a OutputConfig) -> Rendered<'a> {
        Rendered {
            node: Node::Dict(self),
            config,
        }
    }

    pub fn to_json_string(&self, config: &OutputConfig) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.render(config))
    }
}

/// An ordered sequence of unnamed values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct List {
    items: Vec<Value>,
}

impl List {
    pub fn new() -> Self {
        Default::default()
    }

    fn push(&mut self, value: Value) -> &mut Value {
        self.items.push(value);
        let last = self.items.len() - 1;
        &mut self.items[last]
    }

    pub fn put_int<T: Into<i64>>(&mut self, value: T) {
        self.push(Value::Int(value.into()));
    }

    pub fn put_uint<T: Into<u64>>(&mut self, value: T) {
        self.push(Value::Uint(value.into()));
    }

    pub fn put_hex<T: Into<u64>>(&mut self, value: T) {
        self.push(Value::Hex(value.into()));
    }

    pub fn put_enum<T: Into<i64>>(&mut self, name: &'static str, value: T) {
        self.push(Value::Enum {
            name,
            value: value.into(),
        });
    }

    pub fn put_str(&mut self, value: &str) {
        self.push(Value::Str(value.to_owned()));
    }

    pub fn put_dict(&mut self) -> &mut Dict {
        match self.push(Value::Dict(Dict::new())) {
            Value::Dict(dict) => dict,
            _ => unreachable!(),
        }
    }

    pub fn put_list(&mut self) -> &mut List {
        match self.push(Value::List(List::new())) {
            Value::List(list) => list,
            _ => unreachable!(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    /// Reopens the group at `index` to report more values into it.
    pub fn dict_mut(&mut self, index: usize) -> Option<&mut Dict> {
        match self.items.get_mut(index) {
            Some(Value::Dict(dict)) => Some(dict),
            _ => None,
        }
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn render<'a>(&'a self, config: &'a OutputConfig) -> Rendered<'a> {
        Rendered {
            node: Node::List(self),
            config,
        }
    }

    /// Writes the list as pretty printed JSON.
    pub fn write_json<W: Write>(&self, writer: W, config: &OutputConfig) -> serde_json::Result<()> {
        serde_json::to_writer_pretty(writer, &self.render(config))
    }
}

/// Writes a JSON array one element at a time, so reports of long streams
/// don't have to be kept in memory.
pub struct JsonListWriter<W: Write> {
    writer: W,
    config: OutputConfig,
    len: usize,
}

impl<W: Write> JsonListWriter<W> {
    pub fn new(mut writer: W, config: OutputConfig) -> serde_json::Result<Self> {
        writer.write_all(b"[").map_err(serde_json::Error::io)?;
        Ok(Self {
            writer,
            config,
            len: 0,
        })
    }

    /// Appends `dict` to the array.
    pub fn write_dict(&mut self, dict: &Dict) -> serde_json::Result<()> {
        let separator: &[u8] = if self.len == 0 { b"\n" } else { b",\n" };
        self.writer
            .write_all(separator)
            .map_err(serde_json::Error::io)?;
        serde_json::to_writer_pretty(&mut self.writer, &dict.render(&self.config))?;
        self.len += 1;
        Ok(())
    }

    /// Number of elements written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Closes the array and returns the underlying writer.
    pub fn finish(mut self) -> serde_json::Result<W> {
        self.writer
            .write_all(b"\n]\n")
            .and_then(|_| self.writer.flush())
            .map_err(serde_json::Error::io)?;
        Ok(self.writer)
    }
}

#[derive(Clone, Copy)]
enum Node<'a> {
    Value(&'a Value),
    Dict(&'a Dict),
    List(&'a List),
}

/// A [`Dict`] or [`List`] paired with the [`OutputConfig`] used to serialize
/// it.
#[derive(Clone, Copy)]
pub struct Rendered<'a> {
    node: Node<'a>,
    config: &'a OutputConfig,
}

impl<'a> Rendered<'a> {
    fn child(&self, node: Node<'a>) -> Self {
        Self {
            node,
            config: self.config,
        }
    }
}

impl Serialize for Rendered<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.node {
            Node::Dict(dict) => {
                let mut map = serializer.serialize_map(Some(dict.entries.len()))?;
                for (key, value) in &dict.entries {
                    map.serialize_entry(key, &self.child(Node::Value(value)))?;
                }
                map.end()
            }
            Node::List(list) => {
                let mut seq = serializer.serialize_seq(Some(list.items.len()))?;
                for value in &list.items {
                    seq.serialize_element(&self.child(Node::Value(value)))?;
                }
                seq.end()
            }
            Node::Value(value) => match value {
                Value::Int(v) => serializer.serialize_i64(*v),
                Value::Uint(v) => serializer.serialize_u64(*v),
                Value::Hex(v) if self.config.print_hex => {
                    serializer.serialize_str(&format!("0x{:X}", v))
                }
                Value::Hex(v) => serializer.serialize_u64(*v),
                Value::Enum { name, value } if self.config.explain_enum => {
                    serializer.serialize_str(&format!("{} ({})", name, value))
                }
                Value::Enum { value, .. } => serializer.serialize_i64(*value),
                Value::Str(s) => serializer.serialize_str(s),
                Value::Dict(dict) => self.child(Node::Dict(dict)).serialize(serializer),
                Value::List(list) => self.child(Node::List(list)).serialize(serializer),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dict {
        let mut dict = Dict::new();
        dict.put_uint("nal_length", 24u32);
        dict.put_hex("offset", 0x2au32);
        {
            let header = dict.put_dict("nal_unit_header");
            header.put_enum("nal_unit_type", "H265_NAL_TYPE_VPS_NUT", 32);
            header.put_uint("nuh_layer_id", 0u8);
        }
        {
            let list = dict.put_list("delta");
            list.put_int(-3);
            list.put_uint(true);
        }
        dict.put_str("error", "oops");
        dict
    }

    #[test]
    fn keeps_reporting_order() {
        let dict = sample();

        assert_eq!(
            dict.keys().collect::<Vec<_>>(),
            vec!["nal_length", "offset", "nal_unit_header", "delta", "error"]
        );
        assert_eq!(dict.get_uint("nal_length"), Some(24));
        assert_eq!(dict.get_uint("offset"), Some(0x2a));
        assert_eq!(
            dict.get_dict("nal_unit_header")
                .and_then(|h| h.get_uint("nal_unit_type")),
            Some(32)
        );
        assert_eq!(dict.get_list("delta").map(List::len), Some(2));
    }

    #[test]
    fn render_explained() {
        let json = sample().to_json_string(&OutputConfig::default()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["offset"], "0x2A");
        assert_eq!(
            value["nal_unit_header"]["nal_unit_type"],
            "H265_NAL_TYPE_VPS_NUT (32)"
        );
        assert_eq!(value["delta"][0], -3);
        assert_eq!(value["delta"][1], 1);
        assert_eq!(value["error"], "oops");
    }

    #[test]
    fn render_raw() {
        let config = OutputConfig {
            print_hex: false,
            explain_enum: false,
        };
        let json = sample().to_json_string(&config).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["offset"], 42);
        assert_eq!(value["nal_unit_header"]["nal_unit_type"], 32);
    }

    #[test]
    fn list_to_writer() {
        let mut list = List::new();
        list.put_dict().put_uint("a", 1u8);
        list.put_hex(255u8);

        let mut out = Vec::new();
        list.write_json(&mut out, &OutputConfig::default()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();

        assert_eq!(value[0]["a"], 1);
        assert_eq!(value[1], "0xFF");
    }

    #[test]
    fn list_writer_streams_dicts() {
        let mut list = List::new();
        *list.put_dict() = sample();
        list.put_dict().put_uint("b", 2u8);

        let config = OutputConfig {
            print_hex: false,
            explain_enum: true,
        };
        let mut writer = JsonListWriter::new(Vec::new(), config).unwrap();
        assert!(writer.is_empty());
        for item in list.items() {
            writer.write_dict(item.as_dict().unwrap()).unwrap();
        }
        assert_eq!(writer.len(), 2);
        let out = writer.finish().unwrap();

        let streamed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let mut whole = Vec::new();
        list.write_json(&mut whole, &config).unwrap();
        let whole: serde_json::Value = serde_json::from_slice(&whole).unwrap();

        assert_eq!(streamed, whole);
        assert_eq!(streamed[0]["offset"], 42);
        assert_eq!(streamed[1]["b"], 2);
    }

    #[test]
    fn empty_list_writer() {
        let writer = JsonListWriter::new(Vec::new(), OutputConfig::default()).unwrap();
        let out = writer.finish().unwrap();

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value, serde_json::json!([]));
    }
}
