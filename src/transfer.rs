use tracing::debug;

use crate::ast::{
    count_pointers, BinaryOp, CastKind, CfgElement, DeclId, ExprId, ExprKind, FileId, Function,
    SmartPointerMethod, TemplateArg, TranslationUnit, Type, UnaryOp, ValueCategory,
};
use crate::env::{AnalysisContext, Environment};
use crate::lattice::NonFlowSensitiveState;
use crate::nullability::{
    decl_nullability, prepend, substitute_in_class_template, substitute_in_function_template,
    type_nullability, unspecified_nullability, Defaults, NullabilityKind, PointerNullability,
    TypeNullability,
};
use crate::value::{LocId, PointerValue, Value, ValueId};

/// Borrowed pieces the transfer functions operate on.
pub(crate) struct TransferState<'a> {
    pub tu: &'a TranslationUnit,
    pub func: &'a Function,
    pub defaults: &'a Defaults,
    /// File of the analyzed function, used for expression-level defaults.
    pub file: FileId,
    pub nfs: &'a mut NonFlowSensitiveState,
    pub ctx: &'a mut AnalysisContext,
}

/// Runs both sub-transfers, type first, for one CFG element.
pub(crate) fn transfer_element(state: &mut TransferState, env: &mut Environment, elt: &CfgElement) {
    match elt {
        CfgElement::Stmt(e) => {
            ensure_pointer_has_value(state, env, *e);
            transfer_type(state, *e);
            transfer_value(state, env, *e);
        }
        CfgElement::Decl { decl, init } => transfer_decl(state, env, *decl, *init),
        CfgElement::MemberInit { member, init } => transfer_member_init(state, env, *member, *init),
    }
}

/// Every raw-pointer prvalue gets a value so nullability can attach to it.
fn ensure_pointer_has_value(state: &mut TransferState, env: &mut Environment, e: ExprId) {
    let expr = state.func.expr(e);
    if expr.category != ValueCategory::PrValue || !expr.ty.is_raw_pointer() {
        return;
    }
    if env.value_of_expr(e).is_none() {
        let v = state.ctx.create_value(&expr.ty);
        env.set_expr_value(e, v);
    }
}

// ---------------------------------------------------------------------------
// Type transfer: fills the expression nullability cache bottom-up.
// ---------------------------------------------------------------------------

fn transfer_type(state: &mut TransferState, e: ExprId) {
    if state.nfs.expr_nullability(e).is_some() {
        return;
    }
    let func = state.func;
    let expr = func.expr(e);
    let mut v = match &expr.kind {
        ExprKind::DeclRef { decl, .. } => {
            let mut n = decl_nullability(state.tu, *decl, state.defaults);
            state.nfs.override_nullability_from_decl(state.tu, *decl, &mut n);
            n
        }
        ExprKind::Member {
            base,
            member,
            bound_member,
            ..
        } => {
            let base_vec = child_nullability(state, *base);
            let member_decl = state.tu.decl(*member);
            let member_ty = if *bound_member {
                member_decl
                    .function_sig()
                    .map(|sig| state.tu.function_type(sig))
                    .unwrap_or(Type::Void)
            } else {
                member_decl.value_type().cloned().unwrap_or(Type::Void)
            };
            let mut n = substitute_in_class_template(
                &member_ty,
                &base_vec,
                &func.expr(*base).ty,
                Some(state.file),
                state.defaults,
            );
            state.nfs.override_nullability_from_decl(state.tu, *member, &mut n);
            n
        }
        ExprKind::MemberCall { callee, .. } => {
            let callee_vec = child_nullability(state, *callee);
            let len = count_pointers(&expr.ty);
            callee_vec
                .get(..len)
                .map(<[_]>::to_vec)
                .unwrap_or_else(|| unspecified_nullability(len))
        }
        ExprKind::Call { callee, .. } => {
            let mut n = match callee_function(func, state.tu, *callee) {
                Some((decl, template_args)) => {
                    let primary = state
                        .tu
                        .decl(decl)
                        .function_sig()
                        .and_then(|sig| sig.primary_template);
                    let n = match primary {
                        Some(primary) => substitute_in_function_template(
                            &expr.ty,
                            primary,
                            template_args,
                            Some(state.file),
                            state.defaults,
                        ),
                        None => type_nullability(&expr.ty, Some(state.file), state.defaults),
                    };
                    let mut n = n;
                    state.nfs.override_callee_return(decl, &mut n);
                    n
                }
                None => type_nullability(&expr.ty, Some(state.file), state.defaults),
            };
            if n.len() != count_pointers(&expr.ty) {
                n = unspecified_nullability(count_pointers(&expr.ty));
            }
            n
        }
        ExprKind::Cast { kind, operand } => transfer_type_cast(state, e, *kind, *operand),
        ExprKind::Unary { op, operand } => match op {
            UnaryOp::AddrOf => prepend(
                PointerNullability::Concrete(NullabilityKind::NonNull),
                &child_nullability(state, *operand),
            ),
            UnaryOp::Deref => drop_front(child_nullability(state, *operand)),
            UnaryOp::Not => child_nullability(state, *operand),
        },
        ExprKind::Binary { op, lhs, .. } => match op {
            BinaryOp::Assign => child_nullability(state, *lhs),
            BinaryOp::Eq | BinaryOp::Ne => Vec::new(),
        },
        ExprKind::Subscript { base, .. } => {
            let base_vec = child_nullability(state, *base);
            if func.expr(*base).ty.is_raw_pointer() {
                drop_front(base_vec)
            } else {
                base_vec
            }
        }
        ExprKind::SmartDeref { object, .. } => drop_front(child_nullability(state, *object)),
        ExprKind::SmartCall { object, method, .. } => match method {
            // `get` and `release` surface the underlying raw pointer, whose
            // vector coincides with the smart pointer's own.
            SmartPointerMethod::Get | SmartPointerMethod::Release => {
                child_nullability(state, *object)
            }
            SmartPointerMethod::Reset | SmartPointerMethod::Swap => Vec::new(),
        },
        ExprKind::SmartFactory { .. } => {
            let mut n = type_nullability(&expr.ty, Some(state.file), state.defaults);
            if let Some(front) = n.first_mut() {
                *front = PointerNullability::Concrete(NullabilityKind::NonNull);
            }
            n
        }
        ExprKind::SmartSwap { .. } => Vec::new(),
        ExprKind::This => {
            let mut n = type_nullability(&expr.ty, Some(state.file), state.defaults);
            if let Some(front) = n.first_mut() {
                *front = PointerNullability::Concrete(NullabilityKind::NonNull);
            }
            n
        }
        ExprKind::New { may_return_null } => {
            let mut n = type_nullability(&expr.ty, Some(state.file), state.defaults);
            if let Some(front) = n.first_mut() {
                *front = PointerNullability::Concrete(if *may_return_null {
                    NullabilityKind::Nullable
                } else {
                    NullabilityKind::NonNull
                });
            }
            n
        }
        ExprKind::MaterializeTemporary { operand } => child_nullability(state, *operand),
        ExprKind::Construct { .. } => type_nullability(&expr.ty, Some(state.file), state.defaults),
        ExprKind::DefaultArgUse => type_nullability(&expr.ty, Some(state.file), state.defaults),
        ExprKind::OpaqueValue => unspecified_nullability(count_pointers(&expr.ty)),
        ExprKind::NullLiteral
        | ExprKind::BoolLiteral(_)
        | ExprKind::IntLiteral(_)
        | ExprKind::AssertNullability { .. } => Vec::new(),
    };

    let expected = count_pointers(&expr.ty);
    if v.len() != expected {
        // One entry per pointer in the type; a mismatch means some construct
        // was not fully modeled, so the vector cannot be interpreted.
        debug!(
            expr = e.0,
            got = v.len(),
            expected,
            "nullability vector length mismatch, refilling with unspecified"
        );
        v = unspecified_nullability(expected);
    }
    state.nfs.insert_expr_nullability(e, v);
}

fn transfer_type_cast(
    state: &mut TransferState,
    e: ExprId,
    kind: CastKind,
    operand: ExprId,
) -> TypeNullability {
    let expr_ty = state.func.expr(e).ty.clone();
    match kind {
        // Casts between equivalent types.
        CastKind::LValueToRValue
        | CastKind::NoOp
        | CastKind::AtomicToNonAtomic
        | CastKind::NonAtomicToAtomic
        | CastKind::AddressSpaceConversion => child_nullability(state, operand),

        // Casts between unrelated types preserve only the top-level
        // pointer chain; inner sugar is dropped.
        CastKind::BitCast
        | CastKind::LValueBitCast
        | CastKind::BaseToDerived
        | CastKind::DerivedToBase => preserve_top_level_pointers(state, e, operand),

        CastKind::UserDefinedConversion | CastKind::ConstructorConversion => {
            unspecified_nullability(count_pointers(&expr_ty))
        }

        // A dynamic_cast to pointer is null when the runtime check fails.
        CastKind::Dynamic => {
            let mut n = unspecified_nullability(count_pointers(&expr_ty));
            if expr_ty.is_raw_pointer() {
                if let Some(front) = n.first_mut() {
                    *front = PointerNullability::Concrete(NullabilityKind::Nullable);
                }
            }
            n
        }

        CastKind::NullToPointer => {
            let mut n = type_nullability(&expr_ty, Some(state.file), state.defaults);
            // The destination may be nullptr_t itself, which is no pointer.
            if !matches!(expr_ty, Type::NullPtr) {
                if let Some(front) = n.first_mut() {
                    *front = PointerNullability::Concrete(NullabilityKind::Nullable);
                }
            }
            n
        }

        // Pointers out of thin air, who knows?
        CastKind::IntegralToPointer => unspecified_nullability(count_pointers(&expr_ty)),

        // Decayed objects are never null.
        CastKind::ArrayToPointerDecay | CastKind::FunctionToPointerDecay => prepend(
            PointerNullability::Concrete(NullabilityKind::NonNull),
            &child_nullability(state, operand),
        ),

        CastKind::PointerToBoolean | CastKind::IntegralCast | CastKind::ToVoid => Vec::new(),
    }
}

fn preserve_top_level_pointers(
    state: &mut TransferState,
    e: ExprId,
    operand: ExprId,
) -> TypeNullability {
    let func = state.func;
    let mut v = unspecified_nullability(count_pointers(&func.expr(e).ty));
    let arg = child_nullability(state, operand);
    let mut src = &func.expr(operand).ty;
    let mut dst = &func.expr(e).ty;
    let mut index = 0;
    while let (Type::Pointer(sp), Type::Pointer(dp)) = (src, dst) {
        if index < v.len() && index < arg.len() {
            v[index] = arg[index];
        }
        src = &sp.pointee;
        dst = &dp.pointee;
        index += 1;
    }
    v
}

/// Computed nullability of a subexpression. Children run before parents, so
/// this is normally a cache hit; the fallback covers modeling gaps.
fn child_nullability(state: &mut TransferState, e: ExprId) -> TypeNullability {
    if let Some(v) = state.nfs.expr_nullability(e) {
        return v.clone();
    }
    debug!(expr = e.0, "missing child nullability, assuming unspecified");
    let v = unspecified_nullability(count_pointers(&state.func.expr(e).ty));
    state.nfs.insert_expr_nullability(e, v.clone());
    v
}

fn drop_front(v: TypeNullability) -> TypeNullability {
    v.get(1..).map(<[_]>::to_vec).unwrap_or_default()
}

/// Top-level nullability of an expression, from the cached vector.
pub(crate) fn expr_front_nullability(
    nfs: &NonFlowSensitiveState,
    e: ExprId,
) -> Option<PointerNullability> {
    nfs.expr_nullability(e).and_then(|v| v.first().copied())
}

/// Resolves a callee expression to a function declaration through casts.
pub(crate) fn callee_function<'f>(
    func: &'f Function,
    tu: &TranslationUnit,
    callee: ExprId,
) -> Option<(DeclId, &'f [TemplateArg])> {
    let mut current = callee;
    loop {
        match &func.expr(current).kind {
            ExprKind::Cast { operand, .. } => current = *operand,
            ExprKind::DeclRef {
                decl,
                template_args,
            } => {
                tu.decl(*decl).function_sig()?;
                return Some((*decl, template_args.as_slice()));
            }
            _ => return None,
        }
    }
}

// ---------------------------------------------------------------------------
// Value transfer: initializes and propagates pointer null states.
// ---------------------------------------------------------------------------

fn transfer_value(state: &mut TransferState, env: &mut Environment, e: ExprId) {
    let func = state.func;
    let expr = func.expr(e);
    match &expr.kind {
        ExprKind::DeclRef { decl, .. } => {
            let d = state.tu.decl(*decl);
            if let Some(ty) = d.value_type().cloned() {
                let loc = state.ctx.decl_loc(*decl, &ty);
                env.set_expr_loc(e, loc);
                if env.value_at(loc).is_none() {
                    let v = state.ctx.create_value(&ty);
                    env.set_value_at(loc, v);
                }
                if ty.is_supported_smart_pointer() {
                    init_smart_from_expr(state, env, e, loc);
                }
            }
        }
        ExprKind::Member {
            base,
            member,
            arrow,
            bound_member,
        } => {
            if !*bound_member {
                if let Some(parent) = record_loc_of_base(state, env, *base, *arrow) {
                    let member_ty = state.tu.decl(*member).value_type().cloned();
                    if let Some(ty) = member_ty {
                        let loc = state.ctx.child_loc(parent, *member, &ty);
                        env.set_expr_loc(e, loc);
                        if env.value_at(loc).is_none() {
                            let v = state.ctx.create_value(&ty);
                            env.set_value_at(loc, v);
                        }
                        if ty.is_supported_smart_pointer() {
                            init_smart_from_expr(state, env, e, loc);
                        }
                    }
                }
            }
        }
        ExprKind::Cast { kind, operand } => transfer_value_cast(state, env, e, *kind, *operand),
        ExprKind::Unary { op, operand } => match op {
            UnaryOp::AddrOf => {
                if let Some(loc) = env.expr_loc(*operand) {
                    let v = state.ctx.add_value(Value::Pointer(PointerValue {
                        pointee: loc,
                        state: None,
                    }));
                    state.ctx.init_pointer_null_state(
                        v,
                        Some(&PointerNullability::Concrete(NullabilityKind::NonNull)),
                    );
                    env.set_expr_value(e, v);
                } else if let Some(v) = env.expr_value(e) {
                    state.ctx.init_pointer_null_state(
                        v,
                        Some(&PointerNullability::Concrete(NullabilityKind::NonNull)),
                    );
                }
            }
            UnaryOp::Deref => {
                if let Some(v) = env.pointer_value_of(state.ctx, *operand) {
                    let pointee = state.ctx.value(v).as_pointer().expect("pointer").pointee;
                    env.set_expr_loc(e, pointee);
                    if env.value_at(pointee).is_none() {
                        let created = state.ctx.create_value(&expr.ty);
                        env.set_value_at(pointee, created);
                    }
                }
            }
            UnaryOp::Not => {
                let value = match env.value_of_expr(*operand).map(|v| *state.ctx.value(v)) {
                    Some(Value::Bool(f)) => {
                        let negated = state.ctx.formulas.not(f);
                        Value::Bool(negated)
                    }
                    _ => Value::TopBool,
                };
                let id = state.ctx.add_value(value);
                env.set_expr_value(e, id);
            }
        },
        ExprKind::Binary { op, lhs, rhs } => match op {
            BinaryOp::Assign => transfer_assign(state, env, e, *lhs, *rhs),
            BinaryOp::Eq | BinaryOp::Ne => {
                transfer_null_check_comparison(state, env, e, *op, *lhs, *rhs)
            }
        },
        ExprKind::Subscript { base, .. } => {
            if func.expr(*base).ty.is_raw_pointer() {
                if let Some(v) = env.pointer_value_of(state.ctx, *base) {
                    let pointee = state.ctx.value(v).as_pointer().expect("pointer").pointee;
                    env.set_expr_loc(e, pointee);
                }
            }
        }
        ExprKind::Call { callee, args } => {
            let callee_decl = callee_function(func, state.tu, *callee).map(|(d, _)| d);
            transfer_call_common(state, env, e, args, callee_decl);
        }
        ExprKind::MemberCall { callee, args } => transfer_member_call(state, env, e, *callee, args),
        ExprKind::Construct { ctor, args } => transfer_construct(state, env, e, *ctor, args),
        ExprKind::SmartFactory { .. } => {
            let loc = state.ctx.create_loc(&expr.ty);
            env.set_expr_loc(e, loc);
            set_smart_to_nonnull(state, env, loc);
        }
        ExprKind::SmartCall {
            object,
            method,
            args,
        } => transfer_smart_call(state, env, e, *object, *method, args),
        ExprKind::SmartSwap { lhs, rhs } => {
            let lhs_loc = env.expr_loc(*lhs);
            let rhs_loc = env.expr_loc(*rhs);
            if let (Some(l), Some(r)) = (lhs_loc, rhs_loc) {
                swap_smart_pointers(state, env, l, r);
            }
        }
        ExprKind::SmartDeref { object, .. } => {
            if let Some(obj_loc) = env.expr_loc(*object) {
                if let Some(v) = ensure_smart_value(state, env, obj_loc) {
                    let pointee = state.ctx.value(v).as_pointer().expect("pointer").pointee;
                    env.set_expr_loc(e, pointee);
                }
            }
        }
        ExprKind::This => {
            let record_ty = expr.ty.pointee().cloned().unwrap_or(Type::Void);
            let loc = match env.this_loc {
                Some(loc) => loc,
                None => {
                    let loc = state.ctx.create_loc(&record_ty);
                    env.this_loc = Some(loc);
                    loc
                }
            };
            let v = state.ctx.add_value(Value::Pointer(PointerValue {
                pointee: loc,
                state: None,
            }));
            state.ctx.init_pointer_null_state(
                v,
                Some(&PointerNullability::Concrete(NullabilityKind::NonNull)),
            );
            env.set_expr_value(e, v);
        }
        ExprKind::MaterializeTemporary { operand } => {
            if let Some(loc) = env.expr_loc(*operand) {
                env.set_expr_loc(e, loc);
            } else {
                let loc = state.ctx.create_loc(&expr.ty);
                if let Some(v) = env.value_of_expr(*operand) {
                    env.set_value_at(loc, v);
                }
                env.set_expr_loc(e, loc);
            }
        }
        ExprKind::BoolLiteral(b) => {
            let lit = state.ctx.formulas.literal(*b);
            let v = state.ctx.add_value(Value::Bool(lit));
            env.set_expr_value(e, v);
        }
        ExprKind::NullLiteral
        | ExprKind::IntLiteral(_)
        | ExprKind::New { .. }
        | ExprKind::AssertNullability { .. }
        | ExprKind::DefaultArgUse
        | ExprKind::OpaqueValue => {}
    }

    // Any modeled raw pointer ends up with null state drawn from its
    // declared (or overridden) nullability.
    if expr.ty.is_raw_pointer() {
        if let Some(v) = env.pointer_value_of(state.ctx, e) {
            let hint = expr_front_nullability(state.nfs, e);
            state.ctx.init_pointer_null_state(v, hint.as_ref());
            if let ExprKind::Cast {
                kind: CastKind::LValueToRValue,
                operand,
            } = &expr.kind
            {
                unpack_pointer_value(state, env, e, *operand, v);
            }
        }
    }
}

fn transfer_value_cast(
    state: &mut TransferState,
    env: &mut Environment,
    e: ExprId,
    kind: CastKind,
    operand: ExprId,
) {
    match kind {
        CastKind::LValueToRValue => {
            if let Some(loc) = env.expr_loc(operand) {
                let v = match env.value_at(loc) {
                    Some(v) => v,
                    None => {
                        let ty = state.func.expr(e).ty.clone();
                        let v = state.ctx.create_value(&ty);
                        env.set_value_at(loc, v);
                        v
                    }
                };
                env.set_expr_value(e, v);
            }
        }
        CastKind::NoOp
        | CastKind::AtomicToNonAtomic
        | CastKind::NonAtomicToAtomic
        | CastKind::AddressSpaceConversion
        | CastKind::IntegralCast => {
            if state.func.expr(e).category == ValueCategory::GlValue {
                if let Some(loc) = env.expr_loc(operand) {
                    env.set_expr_loc(e, loc);
                }
            } else if let Some(v) = env.value_of_expr(operand) {
                env.set_expr_value(e, v);
            }
        }
        CastKind::NullToPointer => {
            if let Some(v) = env.expr_value(e) {
                state.ctx.init_null_pointer(v);
            }
        }
        CastKind::PointerToBoolean => {
            let value = match env
                .pointer_value_of(state.ctx, operand)
                .and_then(|v| state.ctx.null_state(v))
                .and_then(|s| s.is_null)
            {
                Some(is_null) => {
                    let not_null = state.ctx.formulas.not(is_null);
                    Value::Bool(not_null)
                }
                None => Value::TopBool,
            };
            let id = state.ctx.add_value(value);
            env.set_expr_value(e, id);
        }
        // Remaining casts produce fresh values; their nullability comes
        // from the type transfer's vector.
        _ => {}
    }
}

fn transfer_assign(
    state: &mut TransferState,
    env: &mut Environment,
    e: ExprId,
    lhs: ExprId,
    rhs: ExprId,
) {
    let lhs_ty = state.func.expr(lhs).ty.strip_references().clone();
    if lhs_ty.is_supported_smart_pointer() {
        let Some(lhs_loc) = env.expr_loc(lhs) else {
            return;
        };
        let Some(inner) = state.ctx.smart_ptr_loc(lhs_loc) else {
            return;
        };
        let rhs_ty = state.func.expr(rhs).ty.clone();
        if matches!(rhs_ty.strip_references(), Type::NullPtr) {
            let pointee = pointee_of_smart(&lhs_ty);
            let null = state.ctx.create_null_pointer(&pointee);
            env.set_value_at(inner, null);
        } else if let Some(src_loc) = env.expr_loc(rhs) {
            if let Some(v) = ensure_smart_value(state, env, src_loc) {
                env.set_value_at(inner, v);
            }
            // Move assignment empties the source.
            if matches!(&rhs_ty, Type::Reference(r) if r.rvalue) {
                if let Some(src_inner) = state.ctx.smart_ptr_loc(src_loc) {
                    let pointee = pointee_of_smart(&lhs_ty);
                    let null = state.ctx.create_null_pointer(&pointee);
                    env.set_value_at(src_inner, null);
                }
            }
        }
        env.set_expr_loc(e, lhs_loc);
        return;
    }

    if let (Some(loc), Some(v)) = (env.expr_loc(lhs), env.value_of_expr(rhs)) {
        env.set_value_at(loc, v);
        env.set_expr_loc(e, loc);
    }
}

fn transfer_null_check_comparison(
    state: &mut TransferState,
    env: &mut Environment,
    e: ExprId,
    op: BinaryOp,
    lhs: ExprId,
    rhs: ExprId,
) {
    let func = state.func;
    let pointers =
        func.expr(lhs).ty.is_raw_pointer() && func.expr(rhs).ty.is_raw_pointer();
    if !pointers {
        let v = state.ctx.formulas.fresh();
        let id = state.ctx.add_value(Value::Bool(v));
        env.set_expr_value(e, id);
        return;
    }

    let lhs_val = env.pointer_value_of(state.ctx, lhs);
    let rhs_val = env.pointer_value_of(state.ctx, rhs);
    let (Some(lhs_val), Some(rhs_val)) = (lhs_val, rhs_val) else {
        return;
    };
    let (Some(lhs_state), Some(rhs_state)) =
        (state.ctx.null_state(lhs_val), state.ctx.null_state(rhs_val))
    else {
        return;
    };

    // If either null state is "top", the comparison result carries no
    // information and adds no constraints.
    let (Some(lhs_null), Some(rhs_null)) = (lhs_state.is_null, rhs_state.is_null) else {
        let id = state.ctx.add_value(Value::TopBool);
        env.set_expr_value(e, id);
        return;
    };

    let truth = state.ctx.formulas.literal(true);
    // Comparing against a literal nullptr propagates the other side.
    if lhs_null == truth || rhs_null == truth {
        let other = if lhs_null == truth { rhs_null } else { lhs_null };
        let result = if op == BinaryOp::Eq {
            other
        } else {
            state.ctx.formulas.not(other)
        };
        let id = state.ctx.add_value(Value::Bool(result));
        env.set_expr_value(e, id);
        return;
    }

    let result = state.ctx.formulas.fresh();
    let id = state.ctx.add_value(Value::Bool(result));
    env.set_expr_value(e, id);

    let not_result = state.ctx.formulas.not(result);
    let (pointer_eq, pointer_ne) = if op == BinaryOp::Eq {
        (result, not_result)
    } else {
        (not_result, result)
    };

    let formulas = &mut state.ctx.formulas;
    let not_lhs = formulas.not(lhs_null);
    let not_rhs = formulas.not(rhs_null);
    // nullptr == nullptr
    let both = formulas.and(lhs_null, rhs_null);
    let implied = formulas.implies(both, pointer_eq);
    env.assume(state.ctx, implied);
    // nullptr != notnull
    let left_only = state.ctx.formulas.and(lhs_null, not_rhs);
    let implied = state.ctx.formulas.implies(left_only, pointer_ne);
    env.assume(state.ctx, implied);
    // notnull != nullptr
    let right_only = state.ctx.formulas.and(not_lhs, rhs_null);
    let implied = state.ctx.formulas.implies(right_only, pointer_ne);
    env.assume(state.ctx, implied);
}

fn transfer_member_call(
    state: &mut TransferState,
    env: &mut Environment,
    e: ExprId,
    callee: ExprId,
    args: &[ExprId],
) {
    let func = state.func;
    let ExprKind::Member {
        base,
        member,
        arrow,
        ..
    } = &func.expr(callee).kind
    else {
        transfer_call_common(state, env, e, args, None);
        return;
    };
    let (base, member, arrow) = (*base, *member, *arrow);
    let Some(sig) = state.tu.decl(member).function_sig().cloned() else {
        transfer_call_common(state, env, e, args, None);
        return;
    };
    let receiver = record_loc_of_base(state, env, base, arrow);

    if !sig.is_const {
        // A non-const call may overwrite any pointer field of the receiver.
        if let Some(record) = receiver {
            for (field, field_loc) in state.ctx.record_children(record) {
                let field_ty = state.tu.decl(field).value_type().cloned();
                if let Some(ty) = field_ty {
                    if ty.is_raw_pointer() {
                        let v = state.ctx.create_value(&ty);
                        env.set_value_at(field_loc, v);
                    }
                }
            }
            env.const_method_returns.retain(|(loc, _), _| *loc != record);
        }
        transfer_call_common(state, env, e, args, Some(member));
        return;
    }

    let expr = func.expr(e);
    let memoizable = sig.params.is_empty()
        && expr.ty.is_raw_pointer()
        && expr.category == ValueCategory::PrValue;
    if memoizable {
        if let Some(record) = receiver {
            let key = (record, member);
            let v = match env.const_method_returns.get(&key) {
                Some(v) => *v,
                None => {
                    let v = state.ctx.create_value(&expr.ty);
                    let hint = expr_front_nullability(state.nfs, e);
                    state.ctx.init_pointer_null_state(v, hint.as_ref());
                    env.const_method_returns.insert(key, v);
                    v
                }
            };
            env.set_expr_value(e, v);
            return;
        }
    }
    transfer_call_common(state, env, e, args, Some(member));
}

fn transfer_call_common(
    state: &mut TransferState,
    env: &mut Environment,
    e: ExprId,
    args: &[ExprId],
    callee: Option<DeclId>,
) {
    let expr = state.func.expr(e);
    let glvalue_loc = if expr.category == ValueCategory::GlValue {
        // A fresh location every call: two calls never alias.
        let loc = state.ctx.create_loc(&expr.ty);
        env.set_expr_loc(e, loc);
        Some(loc)
    } else {
        None
    };

    if expr.ty.is_raw_pointer() {
        let v = match env.expr_value(e) {
            Some(v) => v,
            None => state.ctx.create_value(&expr.ty),
        };
        let hint = expr_front_nullability(state.nfs, e);
        state.ctx.init_pointer_null_state(v, hint.as_ref());
        match glvalue_loc {
            Some(loc) => env.set_value_at(loc, v),
            None => env.set_expr_value(e, v),
        }
    } else if expr.ty.is_supported_smart_pointer() && glvalue_loc.is_none() {
        let loc = state.ctx.create_loc(&expr.ty);
        env.set_expr_loc(e, loc);
        init_smart_from_expr(state, env, e, loc);
    }

    let Some(callee) = callee else {
        return;
    };
    let Some(sig) = state.tu.decl(callee).function_sig().cloned() else {
        return;
    };
    if sig.params.len() != args.len() {
        return;
    }
    for (param, arg) in sig.params.iter().zip(args) {
        let param_ty = state.tu.decl(*param).value_type().cloned();
        if let Some(param_ty) = param_ty {
            initialize_output_parameter(state, env, *arg, &param_ty);
        }
    }
}

/// A non-const pointer-to-pointer or reference-to-pointer parameter with
/// unspecified inner nullability may be overwritten by the callee; model
/// the callee storing a fresh unspecified pointer.
fn initialize_output_parameter(
    state: &mut TransferState,
    env: &mut Environment,
    arg: ExprId,
    param_ty: &Type,
) {
    let inner_ty = match param_ty {
        Type::Pointer(p) if !p.pointee_const && p.pointee.is_raw_pointer() => (*p.pointee).clone(),
        Type::Reference(r) if !r.referent_const && !r.rvalue && r.referent.is_raw_pointer() => {
            (*r.referent).clone()
        }
        _ => return,
    };
    let inner_nullability = type_nullability(&inner_ty, None, state.defaults);
    if inner_nullability
        .first()
        .map(PointerNullability::concrete)
        != Some(NullabilityKind::Unspecified)
    {
        return;
    }

    let loc = match param_ty {
        Type::Pointer(_) => env
            .pointer_value_of(state.ctx, arg)
            .and_then(|v| state.ctx.value(v).as_pointer().map(|p| p.pointee)),
        Type::Reference(_) => env.expr_loc(arg),
        _ => None,
    };
    let Some(loc) = loc else {
        return;
    };

    let v = state.ctx.create_value(&inner_ty);
    state.ctx.init_pointer_null_state(
        v,
        Some(&PointerNullability::Concrete(NullabilityKind::Unspecified)),
    );
    env.set_value_at(loc, v);
}

fn transfer_construct(
    state: &mut TransferState,
    env: &mut Environment,
    e: ExprId,
    ctor: Option<DeclId>,
    args: &[ExprId],
) {
    let expr_ty = state.func.expr(e).ty.clone();
    let loc = state.ctx.create_loc(&expr_ty);
    env.set_expr_loc(e, loc);
    if !expr_ty.is_supported_smart_pointer() {
        return;
    }
    let Some(inner) = state.ctx.smart_ptr_loc(loc) else {
        return;
    };
    let pointee = pointee_of_smart(&expr_ty);

    // Default and nullptr_t constructors.
    let first_ty = args
        .first()
        .map(|a| state.func.expr(*a).ty.strip_references().clone());
    match first_ty {
        None | Some(Type::NullPtr) => {
            let null = state.ctx.create_null_pointer(&pointee);
            env.set_value_at(inner, null);
        }
        Some(ty) if ty.is_raw_pointer() => {
            if let Some(v) = env.value_of_expr(args[0]) {
                env.set_value_at(inner, v);
            }
        }
        Some(ty) if ty.is_supported_smart_pointer() => {
            let src_loc = env.expr_loc(args[0]);
            let aliasing = args.len() == 2
                && state.func.expr(args[1]).ty.is_raw_pointer();
            if aliasing {
                if let Some(v) = env.value_of_expr(args[1]) {
                    env.set_value_at(inner, v);
                }
            } else if let Some(src) = src_loc {
                if let Some(v) = ensure_smart_value(state, env, src) {
                    env.set_value_at(inner, v);
                }
            }
            // Move construction empties the source.
            let moves = ctor
                .and_then(|c| state.tu.decl(c).function_sig().cloned())
                .and_then(|sig| sig.params.first().copied())
                .and_then(|p| state.tu.decl(p).value_type().cloned())
                .map(|ty| matches!(&ty, Type::Reference(r) if r.rvalue))
                .unwrap_or(false);
            if moves {
                if let Some(src) = src_loc {
                    if let Some(src_inner) = state.ctx.smart_ptr_loc(src) {
                        let null = state.ctx.create_null_pointer(&pointee);
                        env.set_value_at(src_inner, null);
                    }
                }
            }
        }
        Some(ty) if ty.is_weak_pointer() => {
            // Constructing from a weak pointer throws on empty, so the
            // result is non-null when the constructor returns.
            set_smart_to_nonnull(state, env, loc);
        }
        Some(_) => {}
    }
}

fn transfer_smart_call(
    state: &mut TransferState,
    env: &mut Environment,
    e: ExprId,
    object: ExprId,
    method: SmartPointerMethod,
    args: &[ExprId],
) {
    let Some(obj_loc) = env.expr_loc(object) else {
        return;
    };
    let Some(inner) = state.ctx.smart_ptr_loc(obj_loc) else {
        return;
    };
    let obj_ty = state.func.expr(object).ty.strip_references().clone();
    let pointee = pointee_of_smart(&obj_ty);
    match method {
        SmartPointerMethod::Get => {
            if let Some(v) = ensure_smart_value(state, env, obj_loc) {
                env.set_expr_value(e, v);
            }
        }
        SmartPointerMethod::Release => {
            if let Some(v) = ensure_smart_value(state, env, obj_loc) {
                env.set_expr_value(e, v);
            }
            let null = state.ctx.create_null_pointer(&pointee);
            env.set_value_at(inner, null);
        }
        SmartPointerMethod::Reset => {
            // A defaulted single argument behaves like the zero-arg
            // overload and nulls the pointer.
            let zero_arg = match args.first() {
                None => true,
                Some(arg) => {
                    let arg_expr = state.func.expr(*arg);
                    matches!(arg_expr.kind, ExprKind::DefaultArgUse)
                        || matches!(arg_expr.ty.strip_references(), Type::NullPtr)
                }
            };
            if zero_arg {
                let null = state.ctx.create_null_pointer(&pointee);
                env.set_value_at(inner, null);
            } else if let Some(v) = env.value_of_expr(args[0]) {
                env.set_value_at(inner, v);
            }
        }
        SmartPointerMethod::Swap => {
            if let Some(other) = args.first().and_then(|a| env.expr_loc(*a)) {
                swap_smart_pointers(state, env, obj_loc, other);
            }
        }
    }
}

fn swap_smart_pointers(
    state: &mut TransferState,
    env: &mut Environment,
    lhs: LocId,
    rhs: LocId,
) {
    let lhs_val = ensure_smart_value(state, env, lhs);
    let rhs_val = ensure_smart_value(state, env, rhs);
    let lhs_inner = state.ctx.smart_ptr_loc(lhs);
    let rhs_inner = state.ctx.smart_ptr_loc(rhs);
    if let (Some(inner), Some(v)) = (lhs_inner, rhs_val) {
        env.set_value_at(inner, v);
    }
    if let (Some(inner), Some(v)) = (rhs_inner, lhs_val) {
        env.set_value_at(inner, v);
    }
}

/// Value of the synthetic `ptr` field, created uninitialized on demand.
fn ensure_smart_value(
    state: &mut TransferState,
    env: &mut Environment,
    loc: LocId,
) -> Option<ValueId> {
    let inner = state.ctx.smart_ptr_loc(loc)?;
    if let Some(v) = env.value_at(inner) {
        return Some(v);
    }
    let ty = state.ctx.loc(inner).ty().clone();
    let v = state.ctx.create_value(&ty);
    env.set_value_at(inner, v);
    Some(v)
}

fn init_smart_from_expr(
    state: &mut TransferState,
    env: &mut Environment,
    e: ExprId,
    loc: LocId,
) {
    if let Some(v) = ensure_smart_value(state, env, loc) {
        let hint = expr_front_nullability(state.nfs, e);
        state.ctx.init_pointer_null_state(v, hint.as_ref());
    }
}

fn set_smart_to_nonnull(state: &mut TransferState, env: &mut Environment, loc: LocId) {
    let Some(inner) = state.ctx.smart_ptr_loc(loc) else {
        return;
    };
    let ty = state.ctx.loc(inner).ty().clone();
    let v = state.ctx.create_value(&ty);
    state.ctx.init_pointer_null_state(
        v,
        Some(&PointerNullability::Concrete(NullabilityKind::NonNull)),
    );
    env.set_value_at(inner, v);
}

fn pointee_of_smart(ty: &Type) -> Type {
    ty.underlying_raw_pointer()
        .and_then(|raw| raw.pointee().cloned())
        .unwrap_or(Type::Void)
}

fn record_loc_of_base(
    state: &mut TransferState,
    env: &Environment,
    base: ExprId,
    arrow: bool,
) -> Option<LocId> {
    if arrow {
        let v = env.pointer_value_of(state.ctx, base)?;
        state.ctx.value(v).as_pointer().map(|p| p.pointee)
    } else {
        env.expr_loc(base)
    }
}

/// Replaces "top" nullability properties with fresh atoms constrained to
/// equal the previous formulas, so later uses can specialize per path.
fn unpack_pointer_value(
    state: &mut TransferState,
    env: &mut Environment,
    e: ExprId,
    operand: ExprId,
    v: ValueId,
) {
    let Some(old) = state.ctx.null_state(v) else {
        return;
    };
    if old.from_nullable.is_some() && old.is_null.is_some() {
        return;
    }
    let pointee = state.ctx.value(v).as_pointer().expect("pointer").pointee;
    let fresh = state.ctx.add_value(Value::Pointer(PointerValue {
        pointee,
        state: None,
    }));
    state.ctx.init_pointer_null_state(fresh, None);
    let fresh_state = state.ctx.null_state(fresh).expect("initialized");

    if let (Some(new), Some(prev)) = (fresh_state.from_nullable, old.from_nullable) {
        let eq = state.ctx.formulas.iff(new, prev);
        env.assume(state.ctx, eq);
    }
    if let (Some(new), Some(prev)) = (fresh_state.is_null, old.is_null) {
        let eq = state.ctx.formulas.iff(new, prev);
        env.assume(state.ctx, eq);
    }
    if let Some(loc) = env.expr_loc(operand) {
        env.set_value_at(loc, fresh);
    }
    env.set_expr_value(e, fresh);
}

fn transfer_decl(
    state: &mut TransferState,
    env: &mut Environment,
    decl: DeclId,
    init: Option<ExprId>,
) {
    let Some(ty) = state.tu.decl(decl).value_type().cloned() else {
        return;
    };
    let loc = state.ctx.decl_loc(decl, &ty);
    match init {
        Some(init) if ty.is_supported_smart_pointer() => {
            if let Some(src) = env.expr_loc(init) {
                if let (Some(dst_inner), Some(v)) = (
                    state.ctx.smart_ptr_loc(loc),
                    ensure_smart_value(state, env, src),
                ) {
                    env.set_value_at(dst_inner, v);
                }
            }
        }
        Some(init) => {
            if let Some(v) = env.value_of_expr(init) {
                env.set_value_at(loc, v);
            } else {
                let v = state.ctx.create_value(&ty);
                env.set_value_at(loc, v);
            }
        }
        None => {
            let v = state.ctx.create_value(&ty);
            env.set_value_at(loc, v);
        }
    }
}

fn transfer_member_init(
    state: &mut TransferState,
    env: &mut Environment,
    member: DeclId,
    init: ExprId,
) {
    let Some(this_loc) = env.this_loc else {
        return;
    };
    let Some(ty) = state.tu.decl(member).value_type().cloned() else {
        return;
    };
    let loc = state.ctx.child_loc(this_loc, member, &ty);
    if let Some(v) = env.value_of_expr(init) {
        env.set_value_at(loc, v);
    }
}
