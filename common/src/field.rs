/// A name/value pair. Duplicates with identical names are allowed and
/// carried through unchanged; order within a record is not significant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
	pub name: String,
	pub value: String,
}

impl Field {
	pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			value: value.into(),
		}
	}
}

pub const FIELD_MSG: &str = "_msg";
pub const FIELD_TIME: &str = "_time";
pub const FIELD_STREAM: &str = "_stream";

/// A timestamp (nanoseconds since Unix epoch) plus an ordered-but-unordered
/// set of fields. `AddField` does not deduplicate by design (see §9 open
/// questions): callers that want to overwrite a field must remove it first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
	pub timestamp: i64,
	pub fields: Vec<Field>,
}

impl Record {
	pub fn new(timestamp: i64) -> Self {
		Self {
			timestamp,
			fields: Vec::new(),
		}
	}

	/// Appends a field without checking for an existing one of the same name.
	pub fn add_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
		self.fields.push(Field::new(name, value));
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self.fields
			.iter()
			.find(|f| f.name == name)
			.map(|f| f.value.as_str())
	}

	/// True if a field with this name exists and is non-empty. Used by the
	/// `hostname` fallback, which only ever checks once before appending.
	pub fn has_nonempty(&self, name: &str) -> bool {
		self.fields
			.iter()
			.any(|f| f.name == name && !f.value.is_empty())
	}

	/// Renames the first field named `from` to `to`, leaving any duplicates
	/// of `from` untouched (mirrors `logstorage.RenameField`, which only
	/// ever encounters a single `message` field in practice).
	pub fn rename_field(&mut self, from: &str, to: &str) {
		if let Some(f) = self.fields.iter_mut().find(|f| f.name == from) {
			f.name = to.to_string();
		}
	}
}

/// An ordered mapping from tag name to value used to derive the canonical
/// `_stream` representation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamTags(Vec<Field>);

impl StreamTags {
	pub fn new() -> Self {
		Self(Vec::new())
	}

	pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
		self.0.push(Field::new(name, value));
	}

	/// Canonicalizes by sorting tags by name and escaping `"` and `\` inside
	/// values, then rendering as `{name1="value1",name2="value2"}`. Stream
	/// membership is defined solely by this string.
	pub fn canonical(&self) -> String {
		let mut tags = self.0.clone();
		tags.sort_by(|a, b| a.name.cmp(&b.name));
		let mut out = String::from("{");
		for (i, t) in tags.iter().enumerate() {
			if i > 0 {
				out.push(',');
			}
			out.push_str(&t.name);
			out.push_str("=\"");
			out.push_str(&escape_stream_value(&t.value));
			out.push('"');
		}
		out.push('}');
		out
	}
}

fn escape_stream_value(value: &str) -> String {
	let mut out = String::with_capacity(value.len());
	for c in value.chars() {
		if c == '"' || c == '\\' {
			out.push('\\');
		}
		out.push(c);
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn add_field_does_not_dedup() {
		let mut r = Record::new(0);
		r.add_field("a", "1");
		r.add_field("a", "2");
		assert_eq!(r.fields.len(), 2);
	}

	#[test]
	fn has_nonempty_ignores_empty_values() {
		let mut r = Record::new(0);
		r.add_field("hostname", "");
		assert!(!r.has_nonempty("hostname"));
		r.add_field("hostname", "host1");
		assert!(r.has_nonempty("hostname"));
	}

	#[test]
	fn rename_field_renames_first_match_only() {
		let mut r = Record::new(0);
		r.add_field("message", "hi");
		r.rename_field("message", FIELD_MSG);
		assert_eq!(r.get(FIELD_MSG), Some("hi"));
		assert_eq!(r.get("message"), None);
	}

	#[test]
	fn stream_tags_sort_by_name_and_escape() {
		let mut tags = StreamTags::new();
		tags.insert("b", "x\"y");
		tags.insert("a", "c\\d");
		assert_eq!(tags.canonical(), r#"{a="c\\d",b="x\"y"}"#);
	}
}
