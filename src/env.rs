use std::collections::BTreeMap;

use crate::ast::{DeclId, ExprId, Type};
use crate::formula::{FormulaArena, FormulaId};
use crate::nullability::{NullabilityKind, PointerNullability};
use crate::solver::{ProveResult, Solver};
use crate::value::{Loc, LocId, PointerNullState, PointerValue, Value, ValueId};

/// Arena tied to one analysis invocation. Owns every formula, storage
/// location and abstract value the run allocates, plus the solver.
#[derive(Clone, Debug)]
pub struct AnalysisContext {
    pub formulas: FormulaArena,
    pub solver: Solver,
    locs: Vec<Loc>,
    values: Vec<Value>,
    decl_locs: BTreeMap<DeclId, LocId>,
    top_locs: BTreeMap<Type, LocId>,
}

impl AnalysisContext {
    pub fn new(max_sat_iterations: u64) -> Self {
        Self {
            formulas: FormulaArena::new(),
            solver: Solver::new(max_sat_iterations),
            locs: Vec::new(),
            values: Vec::new(),
            decl_locs: BTreeMap::new(),
            top_locs: BTreeMap::new(),
        }
    }

    pub fn loc(&self, id: LocId) -> &Loc {
        &self.locs[id.0 as usize]
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.0 as usize]
    }

    pub fn value_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.values[id.0 as usize]
    }

    pub fn add_value(&mut self, value: Value) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(value);
        id
    }

    /// Creates a storage location for a type. Record types become record
    /// locations; supported smart pointers get their synthetic `ptr` field.
    pub fn create_loc(&mut self, ty: &Type) -> LocId {
        let loc = match ty.strip_references() {
            record @ Type::Record(_) => {
                let synthetic_ptr = record.underlying_raw_pointer().map(|raw| {
                    let id = LocId(self.locs.len() as u32);
                    self.locs.push(Loc::Plain { ty: raw });
                    id
                });
                Loc::Record {
                    ty: record.clone(),
                    children: BTreeMap::new(),
                    synthetic_ptr,
                }
            }
            other => Loc::Plain { ty: other.clone() },
        };
        let id = LocId(self.locs.len() as u32);
        self.locs.push(loc);
        id
    }

    /// Field child of a record location, created on first access.
    pub fn child_loc(&mut self, parent: LocId, member: DeclId, ty: &Type) -> LocId {
        if let Loc::Record { children, .. } = self.loc(parent) {
            if let Some(existing) = children.get(&member) {
                return *existing;
            }
        }
        let child = self.create_loc(ty);
        if let Loc::Record { children, .. } = &mut self.locs[parent.0 as usize] {
            children.insert(member, child);
        }
        child
    }

    pub fn record_children(&self, loc: LocId) -> Vec<(DeclId, LocId)> {
        match self.loc(loc) {
            Loc::Record { children, .. } => {
                children.iter().map(|(d, l)| (*d, *l)).collect()
            }
            Loc::Plain { .. } => Vec::new(),
        }
    }

    /// Synthetic `ptr` field of a smart pointer location.
    pub fn smart_ptr_loc(&self, loc: LocId) -> Option<LocId> {
        match self.loc(loc) {
            Loc::Record { synthetic_ptr, .. } => *synthetic_ptr,
            Loc::Plain { .. } => None,
        }
    }

    /// Stable location for a declaration within this run.
    pub fn decl_loc(&mut self, decl: DeclId, ty: &Type) -> LocId {
        if let Some(existing) = self.decl_locs.get(&decl) {
            return *existing;
        }
        let loc = self.create_loc(ty);
        self.decl_locs.insert(decl, loc);
        loc
    }

    /// Canonical placeholder pointee for widened values, one per type.
    pub fn top_loc(&mut self, ty: &Type) -> LocId {
        if let Some(existing) = self.top_locs.get(ty) {
            return *existing;
        }
        let loc = self.create_loc(ty);
        self.top_locs.insert(ty.clone(), loc);
        loc
    }

    /// Fresh abstract value for a type: pointers get a fresh pointee
    /// location and no null state yet, booleans a fresh atom.
    pub fn create_value(&mut self, ty: &Type) -> ValueId {
        match ty.strip_references() {
            Type::Pointer(p) => {
                let pointee = self.create_loc(&p.pointee.clone());
                self.add_value(Value::Pointer(PointerValue {
                    pointee,
                    state: None,
                }))
            }
            Type::Bool => {
                let atom = self.formulas.fresh();
                self.add_value(Value::Bool(atom))
            }
            _ => self.add_value(Value::Opaque),
        }
    }

    /// Fresh pointer carrying the null-literal state `(true, true)`.
    pub fn create_null_pointer(&mut self, pointee_ty: &Type) -> ValueId {
        let pointee = self.create_loc(pointee_ty);
        let t = self.formulas.literal(true);
        self.add_value(Value::Pointer(PointerValue {
            pointee,
            state: Some(PointerNullState {
                from_nullable: Some(t),
                is_null: Some(t),
            }),
        }))
    }

    /// Initializes the null state of a pointer value from a declared or
    /// inferred slot nullability. Does nothing if the state already exists.
    pub fn init_pointer_null_state(&mut self, value: ValueId, hint: Option<&PointerNullability>) {
        let has_state = matches!(
            self.value(value),
            Value::Pointer(PointerValue { state: Some(_), .. })
        );
        if has_state {
            return;
        }
        let state = match hint {
            Some(PointerNullability::Concrete(NullabilityKind::NonNull)) => PointerNullState {
                from_nullable: Some(self.formulas.literal(false)),
                is_null: Some(self.formulas.literal(false)),
            },
            Some(PointerNullability::Concrete(NullabilityKind::Nullable)) => PointerNullState {
                from_nullable: Some(self.formulas.literal(true)),
                is_null: Some(self.formulas.fresh()),
            },
            Some(PointerNullability::Symbolic { nullable, .. }) => {
                let nullable = *nullable;
                PointerNullState {
                    from_nullable: Some(self.formulas.atom_ref(nullable)),
                    is_null: Some(self.formulas.fresh()),
                }
            }
            Some(PointerNullability::Concrete(NullabilityKind::Unspecified)) | None => {
                PointerNullState {
                    from_nullable: Some(self.formulas.fresh()),
                    is_null: Some(self.formulas.fresh()),
                }
            }
        };
        if let Some(p) = self.value_mut(value).as_pointer_mut() {
            p.state = Some(state);
        }
    }

    /// Marks a pointer value as the null literal, if not yet initialized.
    pub fn init_null_pointer(&mut self, value: ValueId) {
        let has_state = matches!(
            self.value(value),
            Value::Pointer(PointerValue { state: Some(_), .. })
        );
        if has_state {
            return;
        }
        let t = self.formulas.literal(true);
        if let Some(p) = self.value_mut(value).as_pointer_mut() {
            p.state = Some(PointerNullState {
                from_nullable: Some(t),
                is_null: Some(t),
            });
        }
    }

    pub fn forget_is_null(&mut self, value: ValueId) {
        if let Some(p) = self.value_mut(value).as_pointer_mut() {
            if let Some(state) = &mut p.state {
                state.is_null = None;
            }
        }
    }

    pub fn forget_from_nullable(&mut self, value: ValueId) {
        if let Some(p) = self.value_mut(value).as_pointer_mut() {
            if let Some(state) = &mut p.state {
                state.from_nullable = None;
            }
        }
    }

    pub fn null_state(&self, value: ValueId) -> Option<PointerNullState> {
        self.value(value).as_pointer().and_then(|p| p.state)
    }

    /// Does `premise` entail `goal` within the solver budget?
    pub fn prove_under(&mut self, premise: FormulaId, goal: FormulaId) -> bool {
        let implication = self.formulas.implies(premise, goal);
        matches!(
            self.solver.prove(&mut self.formulas, implication),
            ProveResult::Yes
        )
    }
}

/// Per-program-point state: values at storage locations, expression values
/// and locations, the path's flow condition, and the const-method memo.
#[derive(Clone, Debug)]
pub struct Environment {
    pub(crate) values_at: BTreeMap<LocId, ValueId>,
    pub(crate) expr_values: BTreeMap<ExprId, ValueId>,
    pub(crate) expr_locs: BTreeMap<ExprId, LocId>,
    pub(crate) flow: FormulaId,
    pub(crate) const_method_returns: BTreeMap<(LocId, DeclId), ValueId>,
    pub(crate) this_loc: Option<LocId>,
}

impl Environment {
    pub fn new(ctx: &AnalysisContext) -> Self {
        Self {
            values_at: BTreeMap::new(),
            expr_values: BTreeMap::new(),
            expr_locs: BTreeMap::new(),
            flow: ctx.formulas.literal(true),
            const_method_returns: BTreeMap::new(),
            this_loc: None,
        }
    }

    pub fn flow_condition(&self) -> FormulaId {
        self.flow
    }

    pub fn assume(&mut self, ctx: &mut AnalysisContext, f: FormulaId) {
        self.flow = ctx.formulas.and(self.flow, f);
    }

    /// Does the flow condition prove `f`?
    pub fn proves(&self, ctx: &mut AnalysisContext, f: FormulaId) -> bool {
        ctx.prove_under(self.flow, f)
    }

    pub fn value_at(&self, loc: LocId) -> Option<ValueId> {
        self.values_at.get(&loc).copied()
    }

    pub fn set_value_at(&mut self, loc: LocId, value: ValueId) {
        self.values_at.insert(loc, value);
    }

    pub fn expr_value(&self, e: ExprId) -> Option<ValueId> {
        self.expr_values.get(&e).copied()
    }

    pub fn set_expr_value(&mut self, e: ExprId, value: ValueId) {
        self.expr_values.insert(e, value);
    }

    pub fn expr_loc(&self, e: ExprId) -> Option<LocId> {
        self.expr_locs.get(&e).copied()
    }

    pub fn set_expr_loc(&mut self, e: ExprId, loc: LocId) {
        self.expr_locs.insert(e, loc);
    }

    /// Value of an expression: a prvalue directly, a glvalue through its
    /// storage location.
    pub fn value_of_expr(&self, e: ExprId) -> Option<ValueId> {
        if let Some(v) = self.expr_value(e) {
            return Some(v);
        }
        self.expr_loc(e).and_then(|loc| self.value_at(loc))
    }

    /// Pointer value of an expression, if one is modeled.
    pub fn pointer_value_of(&self, ctx: &AnalysisContext, e: ExprId) -> Option<ValueId> {
        let v = self.value_of_expr(e)?;
        ctx.value(v).as_pointer().map(|_| v)
    }

    /// Does the flow condition prove the pointer is not null?
    pub fn proves_nonnull(&self, ctx: &mut AnalysisContext, value: ValueId) -> bool {
        let Some(state) = ctx.null_state(value) else {
            return false;
        };
        let Some(is_null) = state.is_null else {
            return false;
        };
        let not_null = ctx.formulas.not(is_null);
        self.proves(ctx, not_null)
    }

    /// Nullable at this program point: provably null, or from a nullable
    /// source without a proof of non-nullness on this path.
    pub fn is_nullable(&self, ctx: &mut AnalysisContext, value: ValueId) -> bool {
        let Some(state) = ctx.null_state(value) else {
            // A pointer without modeled null state is reported, not trusted.
            return true;
        };
        if let Some(is_null) = state.is_null {
            let not_null = ctx.formulas.not(is_null);
            if self.proves(ctx, not_null) {
                return false;
            }
            if self.proves(ctx, is_null) {
                return true;
            }
        }
        match state.from_nullable {
            Some(from_nullable) => self.proves(ctx, from_nullable),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_ptr() -> Type {
        Type::pointer(Type::Int)
    }

    #[test]
    fn nonnull_hint_pins_both_properties() {
        let mut ctx = AnalysisContext::new(1_000);
        let env = Environment::new(&ctx);
        let v = ctx.create_value(&int_ptr());
        ctx.init_pointer_null_state(
            v,
            Some(&PointerNullability::Concrete(NullabilityKind::NonNull)),
        );
        let state = ctx.null_state(v).expect("state");
        assert_eq!(state.from_nullable, Some(ctx.formulas.literal(false)));
        assert_eq!(state.is_null, Some(ctx.formulas.literal(false)));
        assert!(env.proves_nonnull(&mut ctx, v));
        assert!(!env.is_nullable(&mut ctx, v));
    }

    #[test]
    fn nullable_hint_is_nullable_until_checked() {
        let mut ctx = AnalysisContext::new(10_000);
        let mut env = Environment::new(&ctx);
        let v = ctx.create_value(&int_ptr());
        ctx.init_pointer_null_state(
            v,
            Some(&PointerNullability::Concrete(NullabilityKind::Nullable)),
        );
        assert!(env.is_nullable(&mut ctx, v));

        // Assume the null check succeeded on this path.
        let is_null = ctx.null_state(v).unwrap().is_null.unwrap();
        let not_null = ctx.formulas.not(is_null);
        env.assume(&mut ctx, not_null);
        assert!(!env.is_nullable(&mut ctx, v));
        assert!(env.proves_nonnull(&mut ctx, v));
    }

    #[test]
    fn unspecified_hint_is_neither_nullable_nor_provably_nonnull() {
        let mut ctx = AnalysisContext::new(10_000);
        let env = Environment::new(&ctx);
        let v = ctx.create_value(&int_ptr());
        ctx.init_pointer_null_state(v, None);
        assert!(!env.is_nullable(&mut ctx, v));
        assert!(!env.proves_nonnull(&mut ctx, v));
    }

    #[test]
    fn init_is_idempotent() {
        let mut ctx = AnalysisContext::new(1_000);
        let v = ctx.create_value(&int_ptr());
        ctx.init_null_pointer(v);
        let before = ctx.null_state(v);
        ctx.init_pointer_null_state(
            v,
            Some(&PointerNullability::Concrete(NullabilityKind::NonNull)),
        );
        assert_eq!(before, ctx.null_state(v));
    }

    #[test]
    fn smart_pointer_locations_carry_a_synthetic_ptr_field() {
        use crate::ast::{RecordType, SmartPointerKind};
        let mut ctx = AnalysisContext::new(1_000);
        let unique = Type::Record(RecordType {
            decl: DeclId(0),
            args: vec![Type::Int],
            smart: Some(SmartPointerKind::Unique),
            annotation: None,
        });
        let loc = ctx.create_loc(&unique);
        let ptr_loc = ctx.smart_ptr_loc(loc).expect("synthetic ptr");
        assert_eq!(ctx.loc(ptr_loc).ty(), &Type::pointer(Type::Int));
    }
}
