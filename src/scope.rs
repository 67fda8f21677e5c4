use std::collections::HashMap;

use crate::error::{CompileError, Result};
use crate::types::{ScopeClass, VariableSignature};

/// Identifier bindings of one declaration region.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    class: ScopeClass,
    entries: HashMap<String, VariableSignature>,
}

impl SymbolTable {
    pub fn new(class: ScopeClass) -> Self {
        Self {
            class,
            entries: HashMap::new(),
        }
    }

    pub fn class(&self) -> ScopeClass {
        self.class
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&VariableSignature> {
        self.entries.get(name)
    }

    pub fn lookup(&self, name: &str) -> Result<&VariableSignature> {
        self.entries
            .get(name)
            .ok_or_else(|| CompileError::context(format!("identifier not found: {name}")))
    }

    /// Binds `name`; rebinding within one region is a context error.
    pub fn declare(&mut self, name: &str, sig: VariableSignature) -> Result<()> {
        if self.entries.contains_key(name) {
            return Err(CompileError::context(format!(
                "identifier already declared: {name}"
            )));
        }
        self.entries.insert(name.to_string(), sig);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ChangeMode;
    use crate::types::Type;

    #[test]
    fn declare_then_lookup() {
        let mut t = SymbolTable::new(ScopeClass::Local);
        let sig = VariableSignature::new(Type::Int(32), ChangeMode::Var, ScopeClass::Local);
        t.declare("x", sig.clone()).unwrap();
        assert_eq!(t.lookup("x").unwrap(), &sig);
        assert_eq!(t.len(), 1);
        assert_eq!(t.class(), ScopeClass::Local);
    }

    #[test]
    fn redeclaration_and_missing_names_fail() {
        let mut t = SymbolTable::new(ScopeClass::Global);
        let sig = VariableSignature::new(Type::Bool, ChangeMode::Const, ScopeClass::Global);
        t.declare("b", sig.clone()).unwrap();
        assert!(matches!(t.declare("b", sig), Err(CompileError::Context(_))));
        match t.lookup("nope") {
            Err(CompileError::Context(msg)) => assert!(msg.contains("identifier not found")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
