//! Scoped symbol tables.
//!
//! An [`Env`] is an arena of scopes. Each scope points at its parent by
//! index, so a nested contract gets its own scope without borrowing the
//! enclosing one. Lookups walk outward from a scope to the root; the
//! innermost declaration wins.

use std::collections::BTreeMap;

use index_vec::IndexVec;
use liquidity_diag::{NotFound, SymbolKind};

use crate::{ContractSig, Datatype, EntrySig};

index_vec::define_index_type! {
    /// Index of a scope inside an [`Env`].
    pub struct ScopeId = u32;
}

/// Owning record, position and type of a record field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub record: String,
    pub index: usize,
    pub ty: Datatype,
}

/// Owning sum type, position and payload type of a constructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstrInfo {
    pub sum: String,
    pub index: usize,
    pub payload: Datatype,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvError {
    #[error("{kind} `{name}` is already declared in `{scope}`")]
    Duplicate {
        kind: SymbolKind,
        name: String,
        scope: String,
    },
}

#[derive(Debug, Clone)]
struct Scope {
    /// Qualified name of the contract owning this scope.
    path: String,
    parent: Option<ScopeId>,
    types: BTreeMap<String, Datatype>,
    contract_types: BTreeMap<String, ContractSig>,
    labels: BTreeMap<String, FieldInfo>,
    constrs: BTreeMap<String, ConstrInfo>,
}

impl Scope {
    fn new(path: String, parent: Option<ScopeId>) -> Self {
        Self {
            path,
            parent,
            types: BTreeMap::new(),
            contract_types: BTreeMap::new(),
            labels: BTreeMap::new(),
            constrs: BTreeMap::new(),
        }
    }

    fn qualify(&self, name: &str) -> String {
        format!("{}.{name}", self.path)
    }

    fn lift_name(&self, local: bool, name: &str) -> String {
        if local {
            self.qualify(name)
        } else {
            name.to_string()
        }
    }

    fn lift(&self, ty: &Datatype) -> Datatype {
        match ty {
            Datatype::Unit
            | Datatype::Bool
            | Datatype::Int
            | Datatype::Nat
            | Datatype::Tez
            | Datatype::String
            | Datatype::Bytes
            | Datatype::Timestamp
            | Datatype::Key
            | Datatype::KeyHash
            | Datatype::Signature
            | Datatype::Operation
            | Datatype::Address
            | Datatype::Fail => ty.clone(),
            Datatype::Tuple(ts) => Datatype::Tuple(ts.iter().map(|t| self.lift(t)).collect()),
            Datatype::Option(t) => Datatype::option(self.lift(t)),
            Datatype::List(t) => Datatype::list(self.lift(t)),
            Datatype::Set(t) => Datatype::set(self.lift(t)),
            Datatype::Map(k, v) => Datatype::map(self.lift(k), self.lift(v)),
            Datatype::BigMap(k, v) => Datatype::big_map(self.lift(k), self.lift(v)),
            Datatype::Or(l, r) => Datatype::or(self.lift(l), self.lift(r)),
            Datatype::Lambda(a, r) => Datatype::lambda(self.lift(a), self.lift(r)),
            Datatype::Closure { arg, env, ret } => Datatype::Closure {
                arg: Box::new(self.lift(arg)),
                env: Box::new(self.lift(env)),
                ret: Box::new(self.lift(ret)),
            },
            Datatype::Contract(sig) => Datatype::Contract(self.lift_sig(sig)),
            Datatype::Record { name, fields } => Datatype::Record {
                name: self.lift_name(self.types.contains_key(name), name),
                fields: fields
                    .iter()
                    .map(|(label, t)| {
                        (
                            self.lift_name(self.labels.contains_key(label), label),
                            self.lift(t),
                        )
                    })
                    .collect(),
            },
            Datatype::Sum { name, constrs } => Datatype::Sum {
                name: self.lift_name(self.types.contains_key(name), name),
                constrs: constrs
                    .iter()
                    .map(|(constr, t)| {
                        (
                            self.lift_name(self.constrs.contains_key(constr), constr),
                            self.lift(t),
                        )
                    })
                    .collect(),
            },
        }
    }

    fn lift_sig(&self, sig: &ContractSig) -> ContractSig {
        ContractSig {
            sig_name: sig.sig_name.as_ref().map(|name| {
                self.lift_name(self.contract_types.contains_key(name), name)
            }),
            entries_sig: sig
                .entries_sig
                .iter()
                .map(|entry| EntrySig {
                    parameter: self.lift(&entry.parameter),
                    ..entry.clone()
                })
                .collect(),
        }
    }
}

/// A chain of scopes, one per compilation unit or nested contract.
#[derive(Debug, Clone)]
pub struct Env {
    scopes: IndexVec<ScopeId, Scope>,
    root: ScopeId,
}

impl Env {
    /// New environment whose root scope belongs to the contract `name`.
    pub fn new(name: impl Into<String>) -> Self {
        let mut scopes = IndexVec::new();
        let root = scopes.push(Scope::new(name.into(), None));
        Self { scopes, root }
    }

    pub fn root(&self) -> ScopeId {
        self.root
    }

    /// Open a scope for the contract `name` nested in `parent`.
    pub fn enter(&mut self, parent: ScopeId, name: &str) -> ScopeId {
        let path = self.scopes[parent].qualify(name);
        self.scopes.push(Scope::new(path, Some(parent)))
    }

    pub fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.scopes[scope].parent
    }

    /// Qualified container name used when lifting this scope's types.
    pub fn path(&self, scope: ScopeId) -> &str {
        &self.scopes[scope].path
    }

    /// Declare a type. Record fields and sum constructors are registered
    /// alongside it.
    pub fn declare_type(
        &mut self,
        scope: ScopeId,
        name: &str,
        ty: Datatype,
    ) -> Result<(), EnvError> {
        let s = &mut self.scopes[scope];
        if s.types.contains_key(name) {
            return Err(duplicate(SymbolKind::Type, name, &s.path));
        }
        // Check every member before touching the scope so that a rejected
        // declaration leaves it unchanged.
        match &ty {
            Datatype::Record { fields, .. } => {
                for (index, (label, _)) in fields.iter().enumerate() {
                    if s.labels.contains_key(label) || fields[..index].iter().any(|(l, _)| l == label) {
                        return Err(duplicate(SymbolKind::Field, label, &s.path));
                    }
                }
                for (index, (label, field_ty)) in fields.iter().enumerate() {
                    s.labels.insert(
                        label.clone(),
                        FieldInfo {
                            record: name.to_string(),
                            index,
                            ty: field_ty.clone(),
                        },
                    );
                }
            }
            Datatype::Sum { constrs, .. } => {
                for (index, (constr, _)) in constrs.iter().enumerate() {
                    if s.constrs.contains_key(constr) || constrs[..index].iter().any(|(c, _)| c == constr) {
                        return Err(duplicate(SymbolKind::Constructor, constr, &s.path));
                    }
                }
                for (index, (constr, payload)) in constrs.iter().enumerate() {
                    s.constrs.insert(
                        constr.clone(),
                        ConstrInfo {
                            sum: name.to_string(),
                            index,
                            payload: payload.clone(),
                        },
                    );
                }
            }
            _ => {}
        }
        s.types.insert(name.to_string(), ty);
        Ok(())
    }

    pub fn declare_contract_type(
        &mut self,
        scope: ScopeId,
        name: &str,
        sig: ContractSig,
    ) -> Result<(), EnvError> {
        let s = &mut self.scopes[scope];
        if s.contract_types.contains_key(name) {
            return Err(duplicate(SymbolKind::ContractType, name, &s.path));
        }
        s.contract_types.insert(name.to_string(), sig);
        Ok(())
    }

    pub fn find_type(&self, scope: ScopeId, name: &str) -> Result<&Datatype, NotFound> {
        self.lookup(scope, SymbolKind::Type, name, |s| &s.types)
    }

    pub fn find_contract_type(&self, scope: ScopeId, name: &str) -> Result<&ContractSig, NotFound> {
        self.lookup(scope, SymbolKind::ContractType, name, |s| &s.contract_types)
    }

    pub fn find_label(&self, scope: ScopeId, name: &str) -> Result<&FieldInfo, NotFound> {
        self.lookup(scope, SymbolKind::Field, name, |s| &s.labels)
    }

    pub fn find_constr(&self, scope: ScopeId, name: &str) -> Result<&ConstrInfo, NotFound> {
        self.lookup(scope, SymbolKind::Constructor, name, |s| &s.constrs)
    }

    fn lookup<'a, V>(
        &'a self,
        scope: ScopeId,
        kind: SymbolKind,
        name: &str,
        table: impl Fn(&'a Scope) -> &'a BTreeMap<String, V>,
    ) -> Result<&'a V, NotFound> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let s = &self.scopes[id];
            if let Some(v) = table(s).get(name) {
                return Ok(v);
            }
            current = s.parent;
        }
        Err(NotFound::new(kind, name))
    }

    /// Qualify the record and sum names declared in `scope` as
    /// `container.name`, recursively through `ty`.
    ///
    /// Only the scope's own declarations are renamed. Names coming from an
    /// outer scope are already qualified and pass through unchanged.
    pub fn lift_type(&self, scope: ScopeId, ty: &Datatype) -> Datatype {
        self.scopes[scope].lift(ty)
    }
}

fn duplicate(kind: SymbolKind, name: &str, scope: &str) -> EnvError {
    EnvError::Duplicate {
        kind,
        name: name.to_string(),
        scope: scope.to_string(),
    }
}
