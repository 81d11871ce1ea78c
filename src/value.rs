use std::collections::BTreeMap;

use crate::ast::{DeclId, Type};
use crate::formula::FormulaId;

/// Identifier of a storage location within one analysis run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LocId(pub u32);

/// Identifier of an abstract value within one analysis run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ValueId(pub u32);

/// Storage location. Record locations track field children plus the
/// synthetic `ptr` field of supported smart pointers.
#[derive(Clone, Debug)]
pub enum Loc {
    Plain {
        ty: Type,
    },
    Record {
        ty: Type,
        children: BTreeMap<DeclId, LocId>,
        synthetic_ptr: Option<LocId>,
    },
}

impl Loc {
    pub fn ty(&self) -> &Type {
        match self {
            Loc::Plain { ty } | Loc::Record { ty, .. } => ty,
        }
    }
}

/// The two boolean properties tracked per pointer; `None` is "top".
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PointerNullState {
    pub from_nullable: Option<FormulaId>,
    pub is_null: Option<FormulaId>,
}

/// Abstract pointer: a pointee location plus the null state, which is
/// absent until the value is first initialized.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PointerValue {
    pub pointee: LocId,
    pub state: Option<PointerNullState>,
}

/// Abstract value stored in an environment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Value {
    Pointer(PointerValue),
    Bool(FormulaId),
    /// Boolean with no retained formula.
    TopBool,
    Opaque,
}

impl Value {
    pub fn as_pointer(&self) -> Option<&PointerValue> {
        match self {
            Value::Pointer(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_pointer_mut(&mut self) -> Option<&mut PointerValue> {
        match self {
            Value::Pointer(p) => Some(p),
            _ => None,
        }
    }
}

/// Value equivalence as the fixed point sees it: pointee identity plus
/// formula identity. Formula equivalence is deliberately not checked.
pub fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Pointer(x), Value::Pointer(y)) => {
            x.pointee == y.pointee
                && match (&x.state, &y.state) {
                    (None, None) => true,
                    (Some(sx), Some(sy)) => {
                        sx.from_nullable == sy.from_nullable && sx.is_null == sy.is_null
                    }
                    _ => false,
                }
        }
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::TopBool, Value::TopBool) => true,
        (Value::Opaque, Value::Opaque) => true,
        _ => false,
    }
}
