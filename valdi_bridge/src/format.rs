use crate::{
    BridgeResult, Index, Marshaller, ObjectRef, PromiseState, TaggedValue,
};
use std::fmt::{self, Write};

const INDENT: &str = "  ";

impl Marshaller {
    /// Renders the value at `index`, optionally indented.
    pub fn to_string(&self, index: Index, indent: bool) -> BridgeResult<String> {
        let value = self.get(index)?;
        Ok(pretty_print(value, indent))
    }

    /// Renders every value of the current frame, one per line, top last.
    pub fn stack_to_string(&self) -> String {
        let values = self.values();
        let mut output = String::new();
        for (i, value) in values.iter().enumerate() {
            let _ = writeln!(&mut output, "[{i:02}] {value}");
        }
        output
    }
}

/// Renders `value` the way it would print on the scripting side. Map keys
/// are sorted so the output is stable.
pub fn pretty_print(value: &TaggedValue, indent: bool) -> String {
    let mut output = String::new();
    let _ = write_value(&mut output, value, indent, 0);
    output
}

fn write_indent(out: &mut impl Write, depth: usize) -> fmt::Result {
    for _ in 0..depth {
        out.write_str(INDENT)?;
    }
    Ok(())
}

fn write_value(
    out: &mut impl Write,
    value: &TaggedValue,
    indent: bool,
    depth: usize,
) -> fmt::Result {
    match value {
        TaggedValue::Undefined => out.write_str("undefined"),
        TaggedValue::Null => out.write_str("null"),
        TaggedValue::Bool(b) => write!(out, "{b}"),
        TaggedValue::Int(i) => write!(out, "{i}"),
        TaggedValue::Long(l) => write!(out, "{l}"),
        TaggedValue::Double(d) => write!(out, "{d}"),
        TaggedValue::String(s) => write!(out, "{:?}", s.as_str()),
        TaggedValue::Bytes(bytes) => write!(out, "<bytes:{}>", bytes.len()),
        TaggedValue::Ptr(ptr) => write!(out, "<ptr:{:#x}>", ptr.addr()),
        TaggedValue::Object(ObjectRef::Retained(object)) => {
            write!(out, "<object:{}>", object.type_name())
        }
        TaggedValue::Object(ObjectRef::Unretained(weak)) => match weak.upgrade()
        {
            Some(object) => write!(out, "<weak object:{}>", object.type_name()),
            None => out.write_str("<weak object:deallocated>"),
        },
        TaggedValue::Reference(reference) => write!(
            out,
            "<ref:{}:{}>",
            reference.id().index(),
            reference.id().salt()
        ),
        TaggedValue::Function(function) => {
            write!(out, "<function:{}>", function.function_type())
        }
        TaggedValue::Promise(promise) => {
            let state = match promise.state() {
                PromiseState::Pending => "pending",
                PromiseState::Fulfilled => "fulfilled",
                PromiseState::Rejected => "rejected",
            };
            write!(out, "<promise:{state}>")
        }
        TaggedValue::Error(error) => write!(out, "<error: {error}>"),
        TaggedValue::Array(items) => {
            if items.is_empty() {
                return out.write_str("[]");
            }
            out.write_str("[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.write_str(",")?;
                    if !indent {
                        out.write_str(" ")?;
                    }
                }
                if indent {
                    out.write_str("\n")?;
                    write_indent(out, depth + 1)?;
                }
                write_value(out, item, indent, depth + 1)?;
            }
            if indent {
                out.write_str("\n")?;
                write_indent(out, depth)?;
            }
            out.write_str("]")
        }
        TaggedValue::Map(map) => {
            if map.is_empty() {
                return out.write_str("{}");
            }
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.as_str().cmp(b.as_str()));

            out.write_str("{")?;
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.write_str(",")?;
                }
                if indent {
                    out.write_str("\n")?;
                    write_indent(out, depth + 1)?;
                } else {
                    out.write_str(" ")?;
                }
                write!(out, "{:?}: ", key.as_str())?;
                write_value(out, item, indent, depth + 1)?;
            }
            if indent {
                out.write_str("\n")?;
                write_indent(out, depth)?;
                out.write_str("}")
            } else {
                out.write_str(" }")
            }
        }
    }
}

impl fmt::Display for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_value(f, self, f.alternate(), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MarshallingError, intern, new_value_map};

    fn sample() -> TaggedValue {
        let mut map = new_value_map(3);
        map.insert(intern("name").into(), "Valdi".into());
        map.insert(
            intern("items").into(),
            TaggedValue::make_array(vec![1.into(), TaggedValue::Null]),
        );
        map.insert("count".into(), 2i64.into());
        TaggedValue::make_map(map)
    }

    #[test]
    fn compact_rendering_sorts_keys() {
        assert_eq!(
            pretty_print(&sample(), false),
            r#"{ "count": 2, "items": [1, null], "name": "Valdi" }"#
        );
    }

    #[test]
    fn indented_rendering() {
        let expected = "{\n  \"count\": 2,\n  \"items\": [\n    1,\n    null\n  ],\n  \"name\": \"Valdi\"\n}";
        assert_eq!(pretty_print(&sample(), true), expected);
        assert_eq!(format!("{:#}", sample()), expected);
    }

    #[test]
    fn opaque_values_render_as_markers() {
        let error = TaggedValue::from(MarshallingError::new("boom"));
        assert_eq!(error.to_string(), "<error: boom>");
        assert_eq!(TaggedValue::make_bytes(vec![1u8, 2, 3]).to_string(), "<bytes:3>");
        assert_eq!(TaggedValue::make_map(new_value_map(0)).to_string(), "{}");
    }

    #[test]
    fn stack_rendering_lists_the_frame() {
        let mut marshaller = Marshaller::default();
        marshaller.push_int(1);
        marshaller.push_string("two");
        assert_eq!(marshaller.stack_to_string(), "[00] 1\n[01] \"two\"\n");
    }
}
