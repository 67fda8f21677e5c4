use crate::error::{CompileError, Result};
use crate::types::{RecordSignature, Type};

impl RecordSignature {
    /// Flattened scalar cell count, recursing into nested records.
    pub fn size(&self) -> usize {
        self.fields
            .iter()
            .map(|f| match &f.ty {
                Type::Record(nested) => nested.size(),
                _ => 1,
            })
            .sum()
    }

    /// Cell offset of the field reached by `path`, relative to the record start.
    pub fn field_offset(&self, path: &[String]) -> Result<usize> {
        let (head, rest) = path
            .split_first()
            .ok_or_else(|| CompileError::Internal(format!("empty field path in {}", self.name)))?;
        let mut offset = 0;
        for f in &self.fields {
            if &f.name == head {
                if rest.is_empty() {
                    return Ok(offset);
                }
                return match &f.ty {
                    Type::Record(nested) => Ok(offset + nested.field_offset(rest)?),
                    _ => Err(CompileError::Internal(format!(
                        "field {head} of {} is not a record",
                        self.name
                    ))),
                };
            }
            offset += f.ty.size();
        }
        Err(CompileError::Internal(format!(
            "no field {head} in record {}",
            self.name
        )))
    }

    /// Scalar fields in storage order, labelled `prefix.field.sub`.
    pub fn flatten(&self, prefix: &str) -> Vec<(String, Type)> {
        let mut out = Vec::with_capacity(self.size());
        for f in &self.fields {
            let label = format!("{prefix}.{}", f.name);
            match &f.ty {
                Type::Record(nested) => out.extend(nested.flatten(&label)),
                scalar => out.push((label, scalar.clone())),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use crate::types::{RecordField, RecordSignature, Type};

    fn field(name: &str, ty: Type) -> RecordField {
        RecordField {
            name: name.to_string(),
            ty,
        }
    }

    fn path(p: &[&str]) -> Vec<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    fn nested() -> RecordSignature {
        let r2 = Rc::new(RecordSignature {
            name: "R2".into(),
            fields: vec![field("c", Type::Int(32)), field("d", Type::Int(32))],
        });
        RecordSignature {
            name: "R".into(),
            fields: vec![field("a", Type::Int(32)), field("b", Type::Record(r2))],
        }
    }

    #[test]
    fn nested_size_and_offset() {
        let r = nested();
        assert_eq!(r.size(), 3);
        assert_eq!(r.field_offset(&path(&["a"])).unwrap(), 0);
        assert_eq!(r.field_offset(&path(&["b"])).unwrap(), 1);
        assert_eq!(r.field_offset(&path(&["b", "c"])).unwrap(), 1);
        assert_eq!(r.field_offset(&path(&["b", "d"])).unwrap(), 2);
    }

    #[test]
    fn nested_record_before_scalar_shifts_offset() {
        let inner = Rc::new(nested());
        let outer = RecordSignature {
            name: "Outer".into(),
            fields: vec![field("r", Type::Record(inner)), field("flag", Type::Bool)],
        };
        assert_eq!(outer.size(), 4);
        assert_eq!(outer.field_offset(&path(&["flag"])).unwrap(), 3);
        assert_eq!(outer.field_offset(&path(&["r", "b", "d"])).unwrap(), 2);
    }

    #[test]
    fn malformed_paths_are_internal_errors() {
        let r = nested();
        assert!(r.field_offset(&path(&["zz"])).is_err());
        assert!(r.field_offset(&path(&["a", "c"])).is_err());
        assert!(r.field_offset(&[]).is_err());
    }

    #[test]
    fn flatten_labels_follow_storage_order() {
        let labels: Vec<String> = nested().flatten("v").into_iter().map(|(l, _)| l).collect();
        assert_eq!(labels, vec!["v.a", "v.b.c", "v.b.d"]);
    }
}
