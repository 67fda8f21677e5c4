use std::fmt;
use std::rc::Rc;

use crate::ast::{ChangeMode, FlowMode, MechMode};

#[derive(Debug, Clone)]
pub enum Type {
    Bool,
    /// Width in bits; a tag only, widths do not affect compatibility.
    Int(u32),
    Record(Rc<RecordSignature>),
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Type::Bool, Type::Bool) => true,
            (Type::Int(_), Type::Int(_)) => true,
            (Type::Record(a), Type::Record(b)) => a.name == b.name,
            _ => false,
        }
    }
}

impl Eq for Type {}

impl Type {
    pub fn is_record(&self) -> bool {
        matches!(self, Type::Record(_))
    }

    /// Storage cells occupied by a value of this type.
    pub fn size(&self) -> usize {
        match self {
            Type::Bool | Type::Int(_) => 1,
            Type::Record(sig) => sig.size(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => f.write_str("bool"),
            Type::Int(w) => write!(f, "int{w}"),
            Type::Record(sig) => write!(f, "record {}", sig.name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordField {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug)]
pub struct RecordSignature {
    pub name: String,
    pub fields: Vec<RecordField>,
}

impl RecordSignature {
    pub fn field(&self, name: &str) -> Option<&RecordField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Direct,
    Indirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeClass {
    Global,
    Local,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableSignature {
    pub ty: Type,
    pub flow: FlowMode,
    pub change: ChangeMode,
    pub mech: MechMode,
    pub scope: ScopeClass,
}

impl VariableSignature {
    pub fn new(ty: Type, change: ChangeMode, scope: ScopeClass) -> Self {
        Self {
            ty,
            flow: FlowMode::In,
            change,
            mech: MechMode::Copy,
            scope,
        }
    }

    pub fn access(&self) -> AccessMode {
        match self.mech {
            MechMode::Copy => AccessMode::Direct,
            MechMode::Ref => AccessMode::Indirect,
        }
    }

    /// Cells reserved in a frame: a REF slot only holds an address.
    pub fn slot_size(&self) -> usize {
        match self.mech {
            MechMode::Ref => 1,
            MechMode::Copy => self.ty.size(),
        }
    }
}

/// Signature of a procedure, or of a function when `ret` is set.
#[derive(Debug, Clone)]
pub struct RoutineSignature {
    pub name: String,
    pub params: Vec<(String, VariableSignature)>,
    pub imports: Vec<(String, VariableSignature)>,
    pub ret: Option<(String, VariableSignature)>,
}

impl RoutineSignature {
    pub fn is_function(&self) -> bool {
        self.ret.is_some()
    }

    pub fn ret_type(&self) -> Option<&Type> {
        self.ret.as_ref().map(|(_, sig)| &sig.ty)
    }

    pub fn param_area(&self) -> usize {
        self.params.iter().map(|(_, p)| p.slot_size()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(name: &str, fields: Vec<(&str, Type)>) -> Rc<RecordSignature> {
        Rc::new(RecordSignature {
            name: name.to_string(),
            fields: fields
                .into_iter()
                .map(|(n, ty)| RecordField {
                    name: n.to_string(),
                    ty,
                })
                .collect(),
        })
    }

    #[test]
    fn int_widths_are_compatible() {
        assert_eq!(Type::Int(32), Type::Int(1024));
        assert_ne!(Type::Int(32), Type::Bool);
    }

    #[test]
    fn records_compare_by_name() {
        let a = rec("P", vec![("x", Type::Int(32))]);
        let b = rec("P", vec![("y", Type::Bool)]);
        let c = rec("Q", vec![("x", Type::Int(32))]);
        assert_eq!(Type::Record(a.clone()), Type::Record(b));
        assert_ne!(Type::Record(a), Type::Record(c));
    }

    #[test]
    fn ref_slots_hold_one_cell() {
        let r = rec("P", vec![("x", Type::Int(32)), ("y", Type::Int(32))]);
        let mut sig = VariableSignature::new(Type::Record(r), ChangeMode::Var, ScopeClass::Local);
        assert_eq!(sig.slot_size(), 2);
        assert_eq!(sig.access(), AccessMode::Direct);
        sig.mech = MechMode::Ref;
        assert_eq!(sig.slot_size(), 1);
        assert_eq!(sig.access(), AccessMode::Indirect);
    }
}
