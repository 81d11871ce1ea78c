use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::warn;

use crate::analysis::{FunctionAnalysis, WalkItem, MAX_BLOCK_VISITS, MAX_SAT_ITERATIONS};
use crate::ast::{
    CfgElement, Decl, DeclId, DeclKind, ExprId, ExprKind, Function, FunctionSig, SourceRange,
    Terminator, TranslationUnit, Type,
};
use crate::env::Environment;
use crate::lattice::NonFlowSensitiveState;
use crate::nullability::{
    type_nullability, Defaults, NullabilityKind, PointerNullability,
};
use crate::transfer::{callee_function, expr_front_nullability};

/// Kind of one observation about one declaration slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize)]
pub enum EvidenceKind {
    /// An explicit annotation on the declaration.
    Annotated(NullabilityKind),
    UncheckedDereference,
    NullableArgument,
    NonNullArgument,
    NullableAssignment,
    NullableReturn,
    NonNullReturn,
    DefaultMemberInitializerNull,
}

impl EvidenceKind {
    /// Direction and strength. Nullable-direction observations and
    /// dereferences are strong; non-null arguments and returns merely
    /// suggest, and the default-member-initializer observation is the
    /// weakest nullable signal.
    fn classify(self) -> Option<(NullabilityKind, Strength)> {
        match self {
            EvidenceKind::Annotated(NullabilityKind::NonNull) => {
                Some((NullabilityKind::NonNull, Strength::Strong))
            }
            EvidenceKind::Annotated(NullabilityKind::Nullable) => {
                Some((NullabilityKind::Nullable, Strength::Strong))
            }
            EvidenceKind::Annotated(NullabilityKind::Unspecified) => None,
            EvidenceKind::UncheckedDereference => {
                Some((NullabilityKind::NonNull, Strength::Strong))
            }
            EvidenceKind::NullableArgument
            | EvidenceKind::NullableAssignment
            | EvidenceKind::NullableReturn => Some((NullabilityKind::Nullable, Strength::Strong)),
            EvidenceKind::NonNullArgument | EvidenceKind::NonNullReturn => {
                Some((NullabilityKind::NonNull, Strength::Weak))
            }
            EvidenceKind::DefaultMemberInitializerNull => {
                Some((NullabilityKind::Nullable, Strength::Weak))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Strength {
    Strong,
    Weak,
}

/// One observation at one program point.
#[derive(Clone, Debug)]
pub struct Evidence {
    pub decl: DeclId,
    pub slot: usize,
    pub kind: EvidenceKind,
    pub range: SourceRange,
}

/// Sample observation attached to an inference slot.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct EvidenceSample {
    pub kind: EvidenceKind,
    pub file: String,
    pub line: u32,
}

/// Aggregated conclusion for one slot.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SlotInference {
    pub nullability: NullabilityKind,
    pub conflict: bool,
    pub samples: Vec<EvidenceSample>,
}

/// Aggregated conclusions for one declaration. Slot 0 is the return or
/// variable type, 1..=n the parameters.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Inference {
    pub usr: String,
    pub slots: BTreeMap<usize, SlotInference>,
}

/// Infers nullability annotations within one translation unit.
///
/// Each iteration re-analyzes every admitted function, feeding the
/// previous iteration's conclusions back as declaration overrides, so a
/// callee inferred non-null strengthens its callers.
pub fn infer_translation_unit(
    tu: &TranslationUnit,
    filter: Option<&dyn Fn(&Decl) -> bool>,
    iterations: u32,
) -> Result<Vec<Inference>> {
    let defaults = Defaults::from_translation_unit(tu);
    let groups = OverrideGroups::new(tu);
    let admits = |decl: DeclId| filter.map_or(true, |f| f(tu.decl(decl)));

    let mut evidence: BTreeMap<(DeclId, usize), Vec<Evidence>> = BTreeMap::new();
    let record = |store: &mut BTreeMap<(DeclId, usize), Vec<Evidence>>, e: Evidence| {
        store.entry((groups.rep(e.decl), e.slot)).or_default().push(e);
    };

    for ev in declaration_evidence(tu, &admits) {
        record(&mut evidence, ev);
    }

    let mut aggregated: BTreeMap<(DeclId, usize), (NullabilityKind, bool)> = BTreeMap::new();
    let mut overrides: BTreeMap<DeclId, BTreeMap<usize, PointerNullability>> = BTreeMap::new();
    for _ in 0..iterations.max(1) {
        for func in &tu.functions {
            if !admits(func.decl) {
                continue;
            }
            match collect_function_evidence(tu, &defaults, func, overrides.clone()) {
                Ok(collected) => {
                    for ev in collected {
                        record(&mut evidence, ev);
                    }
                }
                Err(error) if error.to_string().contains("SAT solver timed out") => {
                    // Partial results are not trustworthy past a timeout.
                    return Err(error);
                }
                Err(error) => {
                    let name = tu.decl(func.decl).name.as_str();
                    warn!(function = name, %error, "skipping function during inference");
                }
            }
        }
        aggregated = aggregate_all(&evidence);
        overrides = build_overrides(&aggregated, &groups);
    }

    Ok(render(tu, &admits, &groups, &evidence, &aggregated))
}

fn collect_function_evidence(
    tu: &TranslationUnit,
    defaults: &Defaults,
    func: &Function,
    overrides: BTreeMap<DeclId, BTreeMap<usize, PointerNullability>>,
) -> Result<Vec<Evidence>> {
    let nfs = NonFlowSensitiveState::with_overrides(overrides);
    let mut analysis = FunctionAnalysis::new(tu, func, defaults, nfs, MAX_SAT_ITERATIONS);

    // Slots under inference get symbolic nullability variables; concrete
    // overrides from previous iterations are kept.
    if let Some(sig) = tu.decl(func.decl).function_sig() {
        for (slot, slot_ty) in slot_types(tu, sig).into_iter().enumerate() {
            if !is_inferable_slot(&slot_ty) {
                continue;
            }
            let declared = type_nullability(&slot_ty, Some(tu.decl(func.decl).file), defaults);
            if declared.first().map(PointerNullability::concrete)
                != Some(NullabilityKind::Unspecified)
            {
                continue;
            }
            let nonnull = analysis.ctx.formulas.make_atom();
            let nullable = analysis.ctx.formulas.make_atom();
            analysis.nfs.assign_nullability_variable(
                func.decl,
                slot,
                PointerNullability::Symbolic { nonnull, nullable },
            );
        }
    }

    let envs = analysis.run(MAX_BLOCK_VISITS)?;
    let mut out = Vec::new();
    analysis.post_visit(&envs, |a, env, item| {
        collect_item(a, env, item, &mut out);
    });
    if analysis.ctx.solver.reached_limit() {
        bail!("SAT solver timed out");
    }
    Ok(out)
}

fn collect_item(
    a: &mut FunctionAnalysis,
    env: &Environment,
    item: &WalkItem,
    out: &mut Vec<Evidence>,
) {
    match item {
        WalkItem::Element(CfgElement::Stmt(e)) => collect_stmt(a, env, *e, out),
        WalkItem::Element(CfgElement::Decl {
            decl,
            init: Some(init),
        }) => {
            if is_null_literal(a.func, *init) {
                out.push(Evidence {
                    decl: *decl,
                    slot: 0,
                    kind: EvidenceKind::NullableAssignment,
                    range: a.func.expr(*init).range,
                });
            }
        }
        WalkItem::Element(CfgElement::MemberInit { member, init }) => {
            if is_null_literal(a.func, *init) {
                out.push(Evidence {
                    decl: *member,
                    slot: 0,
                    kind: EvidenceKind::NullableAssignment,
                    range: a.func.expr(*init).range,
                });
            }
        }
        WalkItem::Element(_) => {}
        WalkItem::Terminator(Terminator::Return { value: Some(value) }) => {
            collect_return(a, env, *value, out);
        }
        WalkItem::Terminator(_) => {}
    }
}

fn collect_stmt(
    a: &mut FunctionAnalysis,
    env: &Environment,
    e: ExprId,
    out: &mut Vec<Evidence>,
) {
    let func = a.func;
    let range = func.expr(e).range;
    match &func.expr(e).kind {
        ExprKind::Unary {
            op: crate::ast::UnaryOp::Deref,
            operand,
        } => dereference_evidence(a, env, *operand, range, out),
        ExprKind::Subscript { base, .. } if func.expr(*base).ty.is_raw_pointer() => {
            dereference_evidence(a, env, *base, range, out)
        }
        ExprKind::Member {
            base, arrow: true, ..
        } => dereference_evidence(a, env, *base, range, out),
        ExprKind::SmartDeref { object, .. } => {
            let Some((decl, slot)) = inference_target(func, a.tu, *object) else {
                return;
            };
            let guarded = env
                .expr_loc(*object)
                .and_then(|loc| a.ctx.smart_ptr_loc(loc))
                .and_then(|inner| env.value_at(inner))
                .map(|v| env.proves_nonnull(&mut a.ctx, v))
                .unwrap_or(false);
            if !guarded {
                out.push(Evidence {
                    decl,
                    slot,
                    kind: EvidenceKind::UncheckedDereference,
                    range,
                });
            }
        }
        ExprKind::Call { callee, args } => {
            let Some((decl, _)) = callee_function(func, a.tu, *callee) else {
                return;
            };
            let Some(sig) = a.tu.decl(decl).function_sig().cloned() else {
                return;
            };
            argument_evidence(a, env, decl, &sig, args, out);
        }
        ExprKind::MemberCall { callee, args } => {
            let ExprKind::Member { member, .. } = &func.expr(*callee).kind else {
                return;
            };
            let member = *member;
            let Some(sig) = a.tu.decl(member).function_sig().cloned() else {
                return;
            };
            argument_evidence(a, env, member, &sig, args, out);
        }
        ExprKind::Binary {
            op: crate::ast::BinaryOp::Assign,
            lhs,
            rhs,
        } => {
            if is_null_literal(func, *rhs) {
                if let Some((decl, slot)) = inference_target(func, a.tu, *lhs) {
                    out.push(Evidence {
                        decl,
                        slot,
                        kind: EvidenceKind::NullableAssignment,
                        range,
                    });
                }
            }
        }
        _ => {}
    }
}

/// An unchecked dereference is strong non-null evidence, whether or not
/// unrelated conditions gate it. A dereference the flow condition proves
/// safe (a checked dereference) says nothing about the annotation.
fn dereference_evidence(
    a: &mut FunctionAnalysis,
    env: &Environment,
    operand: ExprId,
    range: SourceRange,
    out: &mut Vec<Evidence>,
) {
    let Some((decl, slot)) = inference_target(a.func, a.tu, operand) else {
        return;
    };
    let guarded = env
        .pointer_value_of(&a.ctx, operand)
        .map(|v| env.proves_nonnull(&mut a.ctx, v))
        .unwrap_or(false);
    if !guarded {
        out.push(Evidence {
            decl,
            slot,
            kind: EvidenceKind::UncheckedDereference,
            range,
        });
    }
}

/// Argument nullability is read from the argument's computed type
/// nullability (annotations, null literals, decays); provably non-null
/// flow state also counts toward the non-null direction.
fn argument_evidence(
    a: &mut FunctionAnalysis,
    env: &Environment,
    callee: DeclId,
    sig: &FunctionSig,
    args: &[ExprId],
    out: &mut Vec<Evidence>,
) {
    let fixed = args.len().min(sig.params.len());
    for index in 0..fixed {
        let arg = args[index];
        let Some(param_ty) = a.tu.decl(sig.params[index]).value_type() else {
            continue;
        };
        if !is_inferable_slot(param_ty) {
            continue;
        }
        let range = a.func.expr(arg).range;
        let slot = index + 1;
        match expr_front_nullability(&a.nfs, arg).map(|p| p.concrete()) {
            Some(NullabilityKind::Nullable) => out.push(Evidence {
                decl: callee,
                slot,
                kind: EvidenceKind::NullableArgument,
                range,
            }),
            Some(NullabilityKind::NonNull) => out.push(Evidence {
                decl: callee,
                slot,
                kind: EvidenceKind::NonNullArgument,
                range,
            }),
            _ => {
                let provably_nonnull = env
                    .pointer_value_of(&a.ctx, arg)
                    .map(|v| env.proves_nonnull(&mut a.ctx, v))
                    .unwrap_or(false);
                if provably_nonnull {
                    out.push(Evidence {
                        decl: callee,
                        slot,
                        kind: EvidenceKind::NonNullArgument,
                        range,
                    });
                }
            }
        }
    }
}

fn collect_return(
    a: &mut FunctionAnalysis,
    env: &Environment,
    value: ExprId,
    out: &mut Vec<Evidence>,
) {
    let Some(sig) = a.tu.decl(a.func.decl).function_sig() else {
        return;
    };
    if !is_inferable_slot(&sig.ret) {
        return;
    }
    let range = a.func.expr(value).range;
    let decl = a.func.decl;
    if is_null_literal(a.func, value) {
        out.push(Evidence {
            decl,
            slot: 0,
            kind: EvidenceKind::NullableReturn,
            range,
        });
        return;
    }
    match expr_front_nullability(&a.nfs, value).map(|p| p.concrete()) {
        Some(NullabilityKind::Nullable) => out.push(Evidence {
            decl,
            slot: 0,
            kind: EvidenceKind::NullableReturn,
            range,
        }),
        Some(NullabilityKind::NonNull) => out.push(Evidence {
            decl,
            slot: 0,
            kind: EvidenceKind::NonNullReturn,
            range,
        }),
        _ => {
            let provably_nonnull = env
                .pointer_value_of(&a.ctx, value)
                .map(|v| env.proves_nonnull(&mut a.ctx, v))
                .unwrap_or(false);
            if provably_nonnull {
                out.push(Evidence {
                    decl,
                    slot: 0,
                    kind: EvidenceKind::NonNullReturn,
                    range,
                });
            }
        }
    }
}

/// Evidence carried by declarations themselves: explicit annotations and
/// null default member initializers.
fn declaration_evidence(tu: &TranslationUnit, admits: &dyn Fn(DeclId) -> bool) -> Vec<Evidence> {
    let mut out = Vec::new();
    for (index, decl) in tu.decls.iter().enumerate() {
        let id = DeclId(index as u32);
        if !admits(id) {
            continue;
        }
        let range = SourceRange::line(decl.file, 0);
        match &decl.kind {
            DeclKind::Function(sig) => {
                for (slot, slot_ty) in slot_types(tu, sig).into_iter().enumerate() {
                    if let Some(kind) = explicit_annotation(&slot_ty) {
                        out.push(Evidence {
                            decl: id,
                            slot,
                            kind: EvidenceKind::Annotated(kind),
                            range,
                        });
                    }
                }
            }
            DeclKind::Field(field) => {
                if let Some(kind) = explicit_annotation(&field.ty) {
                    out.push(Evidence {
                        decl: id,
                        slot: 0,
                        kind: EvidenceKind::Annotated(kind),
                        range,
                    });
                }
                if field.default_init_is_null {
                    out.push(Evidence {
                        decl: id,
                        slot: 0,
                        kind: EvidenceKind::DefaultMemberInitializerNull,
                        range,
                    });
                }
            }
            DeclKind::Var(var) => {
                if let Some(kind) = explicit_annotation(&var.ty) {
                    out.push(Evidence {
                        decl: id,
                        slot: 0,
                        kind: EvidenceKind::Annotated(kind),
                        range,
                    });
                }
            }
            DeclKind::Param(_) | DeclKind::Record(_) => {}
        }
    }
    out
}

fn aggregate_all(
    evidence: &BTreeMap<(DeclId, usize), Vec<Evidence>>,
) -> BTreeMap<(DeclId, usize), (NullabilityKind, bool)> {
    evidence
        .iter()
        .map(|(key, entries)| (*key, aggregate(entries)))
        .collect()
}

/// Folds one slot's evidence into a conclusion and conflict flag.
fn aggregate(entries: &[Evidence]) -> (NullabilityKind, bool) {
    let mut strong_nonnull = false;
    let mut strong_nullable = false;
    let mut weak_nonnull = false;
    let mut weak_nullable = false;
    let mut has_dereference = false;
    for entry in entries {
        if entry.kind == EvidenceKind::UncheckedDereference {
            has_dereference = true;
        }
        match entry.kind.classify() {
            Some((NullabilityKind::NonNull, Strength::Strong)) => strong_nonnull = true,
            Some((NullabilityKind::Nullable, Strength::Strong)) => strong_nullable = true,
            Some((NullabilityKind::NonNull, Strength::Weak)) => weak_nonnull = true,
            Some((NullabilityKind::Nullable, Strength::Weak)) => weak_nullable = true,
            _ => {}
        }
    }

    if strong_nonnull && strong_nullable {
        let kind = if has_dereference {
            NullabilityKind::NonNull
        } else {
            NullabilityKind::Nullable
        };
        return (kind, true);
    }
    if strong_nonnull {
        return (NullabilityKind::NonNull, false);
    }
    if strong_nullable {
        return (NullabilityKind::Nullable, false);
    }
    // Weak evidence decides only in the absence of strong evidence, and a
    // weak nullable signal outweighs weak non-null suggestions.
    if weak_nullable {
        return (NullabilityKind::Nullable, false);
    }
    if weak_nonnull {
        return (NullabilityKind::NonNull, false);
    }
    (NullabilityKind::Unspecified, false)
}

fn build_overrides(
    aggregated: &BTreeMap<(DeclId, usize), (NullabilityKind, bool)>,
    groups: &OverrideGroups,
) -> BTreeMap<DeclId, BTreeMap<usize, PointerNullability>> {
    let mut overrides: BTreeMap<DeclId, BTreeMap<usize, PointerNullability>> = BTreeMap::new();
    for ((rep, slot), (kind, _)) in aggregated {
        if *kind == NullabilityKind::Unspecified {
            continue;
        }
        for member in groups.members(*rep) {
            overrides
                .entry(member)
                .or_default()
                .insert(*slot, PointerNullability::Concrete(*kind));
        }
    }
    overrides
}

fn render(
    tu: &TranslationUnit,
    admits: &dyn Fn(DeclId) -> bool,
    groups: &OverrideGroups,
    evidence: &BTreeMap<(DeclId, usize), Vec<Evidence>>,
    aggregated: &BTreeMap<(DeclId, usize), (NullabilityKind, bool)>,
) -> Vec<Inference> {
    let samples_for = |key: (DeclId, usize)| -> Vec<EvidenceSample> {
        evidence
            .get(&key)
            .map(|entries| {
                entries
                    .iter()
                    .take(3)
                    .map(|e| EvidenceSample {
                        kind: e.kind,
                        file: tu.file(e.range.file).name.clone(),
                        line: e.range.start_line,
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut out = Vec::new();
    for (index, decl) in tu.decls.iter().enumerate() {
        let id = DeclId(index as u32);
        if !admits(id) {
            continue;
        }
        match &decl.kind {
            DeclKind::Function(sig) => {
                let rep = groups.rep(id);
                let has_evidence = evidence.keys().any(|(d, _)| *d == rep);
                if tu.body_of(id).is_none() && !has_evidence {
                    continue;
                }
                let mut slots = BTreeMap::new();
                for (slot, slot_ty) in slot_types(tu, sig).into_iter().enumerate() {
                    if !is_inferable_slot(&slot_ty) {
                        continue;
                    }
                    let (nullability, conflict) = aggregated
                        .get(&(rep, slot))
                        .copied()
                        .unwrap_or((NullabilityKind::Unspecified, false));
                    slots.insert(
                        slot,
                        SlotInference {
                            nullability,
                            conflict,
                            samples: samples_for((rep, slot)),
                        },
                    );
                }
                if !slots.is_empty() {
                    out.push(Inference {
                        usr: decl.usr.clone(),
                        slots,
                    });
                }
            }
            DeclKind::Var(_) | DeclKind::Field(_) => {
                if let Some((nullability, conflict)) = aggregated.get(&(id, 0)).copied() {
                    let mut slots = BTreeMap::new();
                    slots.insert(
                        0,
                        SlotInference {
                            nullability,
                            conflict,
                            samples: samples_for((id, 0)),
                        },
                    );
                    out.push(Inference {
                        usr: decl.usr.clone(),
                        slots,
                    });
                }
            }
            DeclKind::Param(_) | DeclKind::Record(_) => {}
        }
    }
    out
}

/// Slot types of a function declaration: return type, then parameters.
fn slot_types(tu: &TranslationUnit, sig: &FunctionSig) -> Vec<Type> {
    let mut types = Vec::with_capacity(sig.params.len() + 1);
    types.push(sig.ret.clone());
    for param in &sig.params {
        types.push(tu.decl(*param).value_type().cloned().unwrap_or(Type::Void));
    }
    types
}

/// A slot can be inferred when its top level is a pointer.
fn is_inferable_slot(ty: &Type) -> bool {
    match ty.strip_references() {
        Type::Pointer(_) => true,
        Type::Subst(s) => is_inferable_slot(&s.replacement),
        other => other.is_supported_smart_pointer(),
    }
}

/// Explicit top-level annotation of a slot type, if written.
fn explicit_annotation(ty: &Type) -> Option<NullabilityKind> {
    match ty.strip_references() {
        Type::Pointer(p) => p.annotation,
        Type::Subst(s) => explicit_annotation(&s.replacement),
        Type::Record(r) if ty.strip_references().is_supported_smart_pointer() => r.annotation,
        _ => None,
    }
}

fn is_null_literal(func: &Function, e: ExprId) -> bool {
    let mut current = e;
    loop {
        match &func.expr(current).kind {
            ExprKind::Cast { operand, .. }
            | ExprKind::MaterializeTemporary { operand } => current = *operand,
            ExprKind::NullLiteral => return true,
            _ => return false,
        }
    }
}

/// Declaration slot an expression reads from, through casts.
fn inference_target(
    func: &Function,
    tu: &TranslationUnit,
    e: ExprId,
) -> Option<(DeclId, usize)> {
    let mut current = e;
    loop {
        match &func.expr(current).kind {
            ExprKind::Cast { operand, .. }
            | ExprKind::MaterializeTemporary { operand } => current = *operand,
            ExprKind::DeclRef { decl, .. } => {
                return match &tu.decl(*decl).kind {
                    DeclKind::Param(p) => Some((p.owner, p.index as usize + 1)),
                    DeclKind::Var(_) => Some((*decl, 0)),
                    _ => None,
                };
            }
            ExprKind::Member { member, .. } => {
                return match &tu.decl(*member).kind {
                    DeclKind::Field(_) => Some((*member, 0)),
                    _ => None,
                };
            }
            _ => return None,
        }
    }
}

/// Virtual override groups: all override-related declarations pool their
/// evidence by slot and share the aggregated result.
struct OverrideGroups {
    parent: BTreeMap<DeclId, DeclId>,
    members: BTreeMap<DeclId, Vec<DeclId>>,
}

impl OverrideGroups {
    fn new(tu: &TranslationUnit) -> Self {
        let mut parent: BTreeMap<DeclId, DeclId> = BTreeMap::new();
        for (index, decl) in tu.decls.iter().enumerate() {
            let id = DeclId(index as u32);
            if let DeclKind::Function(sig) = &decl.kind {
                for overridden in &sig.overridden {
                    union(&mut parent, id, *overridden);
                }
            }
        }
        let mut members: BTreeMap<DeclId, Vec<DeclId>> = BTreeMap::new();
        for (index, decl) in tu.decls.iter().enumerate() {
            let id = DeclId(index as u32);
            if matches!(decl.kind, DeclKind::Function(_)) {
                members.entry(find(&parent, id)).or_default().push(id);
            }
        }
        Self { parent, members }
    }

    fn rep(&self, decl: DeclId) -> DeclId {
        find(&self.parent, decl)
    }

    fn members(&self, rep: DeclId) -> Vec<DeclId> {
        self.members.get(&rep).cloned().unwrap_or_else(|| vec![rep])
    }
}

fn find(parent: &BTreeMap<DeclId, DeclId>, mut decl: DeclId) -> DeclId {
    while let Some(next) = parent.get(&decl) {
        if *next == decl {
            break;
        }
        decl = *next;
    }
    decl
}

fn union(parent: &mut BTreeMap<DeclId, DeclId>, a: DeclId, b: DeclId) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra == rb {
        return;
    }
    // Deterministic representative: the smallest declaration id.
    let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
    parent.insert(child, root);
    parent.entry(root).or_insert(root);
}
