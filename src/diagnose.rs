use anyhow::Result;
use tracing::{debug, warn};

use crate::analysis::{FunctionAnalysis, WalkItem, MAX_BLOCK_VISITS, MAX_SAT_ITERATIONS};
use crate::ast::{
    count_pointers, CfgElement, DeclId, DeclKind, ExprId, ExprKind, FunctionType, SourceRange,
    Terminator, TranslationUnit, Type,
};
use crate::env::Environment;
use crate::lattice::NonFlowSensitiveState;
use crate::nullability::{
    decl_nullability, type_nullability, Defaults, NullabilityKind, PointerNullability,
};
use crate::transfer::callee_function;

/// Diagnostic error codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum ErrorCode {
    /// A nullable value was used where a non-null value is required.
    ExpectedNonNull,
    /// The engine failed to model the value; reported as unsafe.
    Untracked,
    /// An in-source `__assert_nullability` disagreed with the analysis.
    AssertFailed,
}

/// Context a diagnostic was produced in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum DiagnosticContext {
    NullableDereference,
    FunctionArgument,
    ReturnValue,
    Initializer,
    Other,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Diagnostic {
    pub code: ErrorCode,
    pub context: DiagnosticContext,
    pub range: SourceRange,
    pub param_name: Option<String>,
}

/// Diagnoses every function of the translation unit. Functions whose
/// analysis fails are skipped with a warning; their failure does not
/// suppress diagnostics elsewhere.
pub fn diagnose_translation_unit(tu: &TranslationUnit) -> Result<Vec<Diagnostic>> {
    let defaults = Defaults::from_translation_unit(tu);
    let mut diagnostics = Vec::new();
    for (index, decl) in tu.decls.iter().enumerate() {
        if !matches!(decl.kind, DeclKind::Function(_)) {
            continue;
        }
        let id = DeclId(index as u32);
        check_param_default_args(tu, &defaults, id, &mut diagnostics);
        if let Some(func) = tu.body_of(id) {
            match diagnose_body(tu, &defaults, func, NonFlowSensitiveState::default()) {
                Ok(diags) => diagnostics.extend(diags),
                Err(error) => {
                    warn!(function = decl.name.as_str(), %error, "skipping function");
                }
            }
        }
    }
    Ok(diagnostics)
}

/// Diagnoses one function declaration: its default arguments, and its body
/// when the provider supplied one.
pub fn diagnose_function(tu: &TranslationUnit, decl: DeclId) -> Result<Vec<Diagnostic>> {
    let defaults = Defaults::from_translation_unit(tu);
    let mut diagnostics = Vec::new();
    check_param_default_args(tu, &defaults, decl, &mut diagnostics);
    if let Some(func) = tu.body_of(decl) {
        diagnostics.extend(diagnose_body(
            tu,
            &defaults,
            func,
            NonFlowSensitiveState::default(),
        )?);
    }
    Ok(diagnostics)
}

pub(crate) fn diagnose_body(
    tu: &TranslationUnit,
    defaults: &Defaults,
    func: &crate::ast::Function,
    nfs: NonFlowSensitiveState,
) -> Result<Vec<Diagnostic>> {
    let mut analysis = FunctionAnalysis::new(tu, func, defaults, nfs, MAX_SAT_ITERATIONS);
    let envs = analysis.run(MAX_BLOCK_VISITS)?;
    let mut diagnostics = Vec::new();
    analysis.post_visit(&envs, |a, env, item| {
        check_item(a, env, item, &mut diagnostics);
    });
    if analysis.ctx.solver.reached_limit() {
        anyhow::bail!("SAT solver timed out");
    }
    Ok(diagnostics)
}

fn check_item(
    a: &mut FunctionAnalysis,
    env: &Environment,
    item: &WalkItem,
    out: &mut Vec<Diagnostic>,
) {
    match item {
        WalkItem::Element(CfgElement::Stmt(e)) => check_stmt(a, env, *e, out),
        WalkItem::Element(CfgElement::MemberInit { member, init }) => {
            let member_nullability =
                decl_nullability(a.tu, *member, a.defaults);
            if member_nullability.first().map(PointerNullability::concrete)
                == Some(NullabilityKind::NonNull)
            {
                out.extend(diagnose_nonnull_expected(
                    a,
                    env,
                    *init,
                    DiagnosticContext::Initializer,
                    None,
                ));
            }
        }
        WalkItem::Element(CfgElement::Decl { .. }) => {}
        WalkItem::Terminator(Terminator::Return { value: Some(value) }) => {
            check_return(a, env, *value, out);
        }
        WalkItem::Terminator(_) => {}
    }
}

fn check_stmt(
    a: &mut FunctionAnalysis,
    env: &Environment,
    e: ExprId,
    out: &mut Vec<Diagnostic>,
) {
    let func = a.func;
    match &func.expr(e).kind {
        ExprKind::Unary {
            op: crate::ast::UnaryOp::Deref,
            operand,
        } => out.extend(diagnose_nonnull_expected(
            a,
            env,
            *operand,
            DiagnosticContext::NullableDereference,
            None,
        )),
        ExprKind::Subscript { base, .. } if func.expr(*base).ty.is_raw_pointer() => {
            out.extend(diagnose_nonnull_expected(
                a,
                env,
                *base,
                DiagnosticContext::NullableDereference,
                None,
            ))
        }
        ExprKind::Member {
            base, arrow: true, ..
        } => out.extend(diagnose_nonnull_expected(
            a,
            env,
            *base,
            DiagnosticContext::NullableDereference,
            None,
        )),
        ExprKind::SmartDeref { object, .. } => check_smart_deref(a, env, e, *object, out),
        ExprKind::Call { callee, args } => check_call(a, env, *callee, args, out),
        ExprKind::MemberCall { callee, args } => check_member_call(a, env, *callee, args, out),
        ExprKind::Construct { ctor, args } => check_construct(a, env, *ctor, args, out),
        ExprKind::AssertNullability { expected, operand } => {
            check_assert(a, e, *operand, expected, out)
        }
        _ => {}
    }
}

/// Diagnoses whether an expression violates the expectation of being
/// non-null.
fn diagnose_nonnull_expected(
    a: &mut FunctionAnalysis,
    env: &Environment,
    e: ExprId,
    context: DiagnosticContext,
    param_name: Option<String>,
) -> Vec<Diagnostic> {
    let range = a.func.expr(e).range;
    let Some(value) = env.pointer_value_of(&a.ctx, e) else {
        debug!(
            expr = e.0,
            "no modeled pointer value; reporting the use as unsafe"
        );
        return vec![Diagnostic {
            code: ErrorCode::Untracked,
            context,
            range,
            param_name: None,
        }];
    };
    if env.is_nullable(&mut a.ctx, value) {
        return vec![Diagnostic {
            code: ErrorCode::ExpectedNonNull,
            context,
            range,
            param_name,
        }];
    }
    Vec::new()
}

fn check_smart_deref(
    a: &mut FunctionAnalysis,
    env: &Environment,
    e: ExprId,
    object: ExprId,
    out: &mut Vec<Diagnostic>,
) {
    let range = a.func.expr(e).range;
    let inner = env
        .expr_loc(object)
        .and_then(|loc| a.ctx.smart_ptr_loc(loc))
        .and_then(|inner| env.value_at(inner));
    let Some(value) = inner else {
        out.push(Diagnostic {
            code: ErrorCode::Untracked,
            context: DiagnosticContext::NullableDereference,
            range,
            param_name: None,
        });
        return;
    };
    if env.is_nullable(&mut a.ctx, value) {
        out.push(Diagnostic {
            code: ErrorCode::ExpectedNonNull,
            context: DiagnosticContext::NullableDereference,
            range,
            param_name: None,
        });
    }
}

fn check_call(
    a: &mut FunctionAnalysis,
    env: &Environment,
    callee: ExprId,
    args: &[ExprId],
    out: &mut Vec<Diagnostic>,
) {
    let Some(callee_nullability) = a.nfs.expr_nullability(callee).cloned() else {
        return;
    };
    let callee_ty = a.func.expr(callee).ty.clone();
    let mut slots = callee_nullability.as_slice();

    // A function-pointer callee is itself checked for null, then unwrapped.
    let proto: FunctionType = match &callee_ty {
        Type::Pointer(p) => {
            let Type::Function(proto) = p.pointee.as_ref() else {
                return;
            };
            let callee_diags = diagnose_nonnull_expected(
                a,
                env,
                callee,
                DiagnosticContext::Other,
                None,
            );
            if !callee_diags.is_empty() {
                out.extend(callee_diags);
                return;
            }
            slots = slots.get(1..).unwrap_or(&[]);
            (**proto).clone()
        }
        Type::Function(proto) => (**proto).clone(),
        _ => return,
    };

    let param_decls = callee_function(a.func, a.tu, callee)
        .and_then(|(decl, _)| a.tu.decl(decl).function_sig().map(|sig| sig.params.clone()))
        .unwrap_or_default();

    check_arguments(a, env, &proto, slots, &param_decls, args, out);
}

fn check_member_call(
    a: &mut FunctionAnalysis,
    env: &Environment,
    callee: ExprId,
    args: &[ExprId],
    out: &mut Vec<Diagnostic>,
) {
    let ExprKind::Member { member, .. } = &a.func.expr(callee).kind else {
        return;
    };
    let member = *member;
    let Some(sig) = a.tu.decl(member).function_sig().cloned() else {
        return;
    };
    let Some(callee_nullability) = a.nfs.expr_nullability(callee).cloned() else {
        return;
    };
    let Type::Function(proto) = a.tu.function_type(&sig) else {
        return;
    };
    check_arguments(
        a,
        env,
        &proto,
        &callee_nullability,
        &sig.params,
        args,
        out,
    );
}

/// Checks each fixed argument against the parameter's outer nullability.
fn check_arguments(
    a: &mut FunctionAnalysis,
    env: &Environment,
    proto: &FunctionType,
    slots: &[PointerNullability],
    param_decls: &[DeclId],
    args: &[ExprId],
    out: &mut Vec<Diagnostic>,
) {
    // C-style varargs cannot be annotated and are unchecked.
    let checked = args.len().min(proto.params.len());
    let mut remaining = slots.get(count_pointers(&proto.ret)..).unwrap_or(&[]);
    for index in 0..checked {
        let param_ty = &proto.params[index];
        let len = count_pointers(param_ty);
        let param_slots = remaining.get(..len).unwrap_or(&[]);
        remaining = remaining.get(len..).unwrap_or(&[]);

        let lhs = param_ty.strip_references();
        if !lhs.is_raw_pointer() && !lhs.is_supported_smart_pointer() {
            continue;
        }
        if param_slots.first().map(PointerNullability::concrete)
            != Some(NullabilityKind::NonNull)
        {
            continue;
        }
        let param_name = param_decls
            .get(index)
            .map(|p| a.tu.decl(*p).name.clone());
        out.extend(diagnose_nonnull_expected(
            a,
            env,
            args[index],
            DiagnosticContext::FunctionArgument,
            param_name,
        ));
    }
}

fn check_construct(
    a: &mut FunctionAnalysis,
    env: &Environment,
    ctor: Option<DeclId>,
    args: &[ExprId],
    out: &mut Vec<Diagnostic>,
) {
    let Some(ctor) = ctor else {
        return;
    };
    let Some(sig) = a.tu.decl(ctor).function_sig().cloned() else {
        return;
    };
    let Type::Function(proto) = a.tu.function_type(&sig) else {
        return;
    };
    // A constructor's type is void(args), so its nullability vector is the
    // arguments' nullability.
    let slots = decl_nullability(a.tu, ctor, a.defaults);
    check_arguments(a, env, &proto, &slots, &sig.params, args, out);
}

fn check_return(
    a: &mut FunctionAnalysis,
    env: &Environment,
    value: ExprId,
    out: &mut Vec<Diagnostic>,
) {
    let mut function_nullability = decl_nullability(a.tu, a.func.decl, a.defaults);
    a.nfs
        .override_nullability_from_decl(a.tu, a.func.decl, &mut function_nullability);
    let Some(sig) = a.tu.decl(a.func.decl).function_sig() else {
        return;
    };
    let ret = sig.ret.strip_references();
    if !ret.is_raw_pointer() && !ret.is_supported_smart_pointer() {
        return;
    }
    if function_nullability.first().map(PointerNullability::concrete)
        != Some(NullabilityKind::NonNull)
    {
        return;
    }
    out.extend(diagnose_nonnull_expected(
        a,
        env,
        value,
        DiagnosticContext::ReturnValue,
        None,
    ));
}

fn check_assert(
    a: &mut FunctionAnalysis,
    e: ExprId,
    operand: ExprId,
    expected: &[NullabilityKind],
    out: &mut Vec<Diagnostic>,
) {
    let range = a.func.expr(e).range;
    let Some(computed) = a.nfs.expr_nullability(operand) else {
        out.push(Diagnostic {
            code: ErrorCode::Untracked,
            context: DiagnosticContext::Other,
            range,
            param_name: None,
        });
        return;
    };
    let computed: Vec<NullabilityKind> =
        computed.iter().map(PointerNullability::concrete).collect();
    if computed != expected {
        debug!(?computed, ?expected, "__assert_nullability mismatch");
        out.push(Diagnostic {
            code: ErrorCode::AssertFailed,
            context: DiagnosticContext::Other,
            range,
            param_name: None,
        });
    }
}

/// Checks a non-null parameter whose default value is null or nullable.
/// Runs once per declaration, outside the CFG walk: default arguments are
/// absent from call-site CFGs.
fn check_param_default_args(
    tu: &TranslationUnit,
    defaults: &Defaults,
    decl: DeclId,
    out: &mut Vec<Diagnostic>,
) {
    let Some(sig) = tu.decl(decl).function_sig() else {
        return;
    };
    for param in &sig.params {
        let param_decl = tu.decl(*param);
        let DeclKind::Param(p) = &param_decl.kind else {
            continue;
        };
        let declared = type_nullability(&p.ty, Some(param_decl.file), defaults);
        if declared.first().map(PointerNullability::concrete)
            != Some(NullabilityKind::NonNull)
        {
            continue;
        }
        let Some(default) = &p.default_value else {
            continue;
        };
        let nullable_default = default.is_null_literal
            || type_nullability(&default.ty, Some(param_decl.file), defaults)
                .first()
                .map(PointerNullability::concrete)
                == Some(NullabilityKind::Nullable);
        if nullable_default {
            out.push(Diagnostic {
                code: ErrorCode::ExpectedNonNull,
                context: DiagnosticContext::Initializer,
                range: default.range,
                param_name: Some(param_decl.name.clone()),
            });
        }
    }
}
