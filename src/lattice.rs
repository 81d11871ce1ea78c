use std::collections::BTreeMap;

use crate::ast::{DeclId, DeclKind, ExprId, TranslationUnit};
use crate::nullability::{slot_offsets, PointerNullability, TypeNullability};

/// Flow-insensitive state shared by all program points of one function
/// analysis: the expression nullability cache, computed bottom-up and
/// monotone, and per-declaration slot overrides.
///
/// The only flow-sensitive lattice component is the const-method memo,
/// which lives on [`crate::env::Environment`] and is cleared wholesale at
/// join points: the memo survives straight-line code but never a merge, so
/// a const accessor checked before a branch is re-fetched after it.
#[derive(Clone, Debug, Default)]
pub struct NonFlowSensitiveState {
    expr_nullability: BTreeMap<ExprId, TypeNullability>,
    decl_overrides: BTreeMap<DeclId, BTreeMap<usize, PointerNullability>>,
}

impl NonFlowSensitiveState {
    pub fn with_overrides(
        decl_overrides: BTreeMap<DeclId, BTreeMap<usize, PointerNullability>>,
    ) -> Self {
        Self {
            expr_nullability: BTreeMap::new(),
            decl_overrides,
        }
    }

    pub fn expr_nullability(&self, e: ExprId) -> Option<&TypeNullability> {
        self.expr_nullability.get(&e)
    }

    /// Caches a computed vector; the first computation wins, matching the
    /// monotone bottom-up order of the type transfer.
    pub fn insert_expr_nullability(&mut self, e: ExprId, v: TypeNullability) -> &TypeNullability {
        self.expr_nullability.entry(e).or_insert(v)
    }

    /// Assigns a symbolic or concrete nullability to a declaration slot
    /// whose annotation is being inferred. Keeps an existing assignment.
    pub fn assign_nullability_variable(
        &mut self,
        decl: DeclId,
        slot: usize,
        nullability: PointerNullability,
    ) -> PointerNullability {
        *self
            .decl_overrides
            .entry(decl)
            .or_default()
            .entry(slot)
            .or_insert(nullability)
    }

    /// Patches `n`, the vector of an access to `decl`, with any overrides.
    ///
    /// Function overrides are stored per slot and patched at each slot's
    /// top-level entry; parameter accesses resolve through the owning
    /// function's slot table.
    pub fn override_nullability_from_decl(
        &self,
        tu: &TranslationUnit,
        decl: DeclId,
        n: &mut TypeNullability,
    ) {
        if n.is_empty() {
            return;
        }
        match &tu.decl(decl).kind {
            DeclKind::Function(sig) => {
                let Some(slots) = self.decl_overrides.get(&decl) else {
                    return;
                };
                let offsets = slot_offsets(tu, sig);
                for (slot, nullability) in slots {
                    if let Some(offset) = offsets.get(*slot) {
                        if let Some(entry) = n.get_mut(*offset) {
                            *entry = *nullability;
                        }
                    }
                }
            }
            DeclKind::Param(param) => {
                let slot = param.index as usize + 1;
                if let Some(nullability) = self
                    .decl_overrides
                    .get(&param.owner)
                    .and_then(|slots| slots.get(&slot))
                {
                    n[0] = *nullability;
                }
            }
            DeclKind::Var(_) | DeclKind::Field(_) => {
                if let Some(nullability) = self
                    .decl_overrides
                    .get(&decl)
                    .and_then(|slots| slots.get(&0))
                {
                    n[0] = *nullability;
                }
            }
            DeclKind::Record(_) => {}
        }
    }

    /// Patches only the top-level entry of a call-result vector with the
    /// callee's return-slot override.
    pub fn override_callee_return(&self, callee: DeclId, n: &mut TypeNullability) {
        if n.is_empty() {
            return;
        }
        if let Some(nullability) = self
            .decl_overrides
            .get(&callee)
            .and_then(|slots| slots.get(&0))
        {
            n[0] = *nullability;
        }
    }
}
