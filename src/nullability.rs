use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ast::{
    count_pointers, DeclId, DeclKind, FileId, FunctionSig, SubstType, TemplateArg,
    TranslationUnit, Type,
};
use crate::formula::Atom;

/// Declared nullability of one pointer slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum NullabilityKind {
    NonNull,
    Nullable,
    Unspecified,
}

impl fmt::Display for NullabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NullabilityKind::NonNull => "nonnull",
            NullabilityKind::Nullable => "nullable",
            NullabilityKind::Unspecified => "unspecified",
        };
        f.write_str(text)
    }
}

/// Nullability of one pointer slot: a written kind, or a symbolic pair of
/// atoms assigned while the slot's annotation is being inferred.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PointerNullability {
    Concrete(NullabilityKind),
    Symbolic { nonnull: Atom, nullable: Atom },
}

impl PointerNullability {
    /// The written kind, `Unspecified` for symbolic slots.
    pub fn concrete(&self) -> NullabilityKind {
        match self {
            PointerNullability::Concrete(kind) => *kind,
            PointerNullability::Symbolic { .. } => NullabilityKind::Unspecified,
        }
    }
}

impl From<NullabilityKind> for PointerNullability {
    fn from(kind: NullabilityKind) -> Self {
        PointerNullability::Concrete(kind)
    }
}

/// Ordered nullability vector: one entry per pointer slot of a type, in
/// pre-order of the type tree.
pub type TypeNullability = Vec<PointerNullability>;

/// Per-file pragma defaults for unannotated raw pointer slots.
#[derive(Clone, Debug, Default)]
pub struct Defaults {
    file_defaults: BTreeMap<FileId, NullabilityKind>,
}

impl Defaults {
    pub fn from_translation_unit(tu: &TranslationUnit) -> Self {
        let mut file_defaults = BTreeMap::new();
        for (index, file) in tu.files.iter().enumerate() {
            if let Some(kind) = file.nullability_default {
                file_defaults.insert(FileId(index as u32), kind);
            }
        }
        Self { file_defaults }
    }

    pub fn for_file(&self, file: Option<FileId>) -> NullabilityKind {
        file.and_then(|f| self.file_defaults.get(&f).copied())
            .unwrap_or(NullabilityKind::Unspecified)
    }
}

/// All-unspecified vector of the given length.
pub fn unspecified_nullability(len: usize) -> TypeNullability {
    vec![PointerNullability::Concrete(NullabilityKind::Unspecified); len]
}

pub fn prepend(head: PointerNullability, tail: &[PointerNullability]) -> TypeNullability {
    let mut result = Vec::with_capacity(tail.len() + 1);
    result.push(head);
    result.extend_from_slice(tail);
    result
}

/// Nullability vector of a type, with explicit annotations taking
/// precedence over the pragma default of `file`.
pub fn type_nullability(ty: &Type, file: Option<FileId>, defaults: &Defaults) -> TypeNullability {
    type_nullability_with_subst(ty, file, defaults, &mut |_| None)
}

/// Like [`type_nullability`], but consults `subst` for substituted template
/// parameters; a `None` from the callback falls through to the replacement
/// type as written.
pub fn type_nullability_with_subst(
    ty: &Type,
    file: Option<FileId>,
    defaults: &Defaults,
    subst: &mut dyn FnMut(&SubstType) -> Option<TypeNullability>,
) -> TypeNullability {
    let mut out = Vec::with_capacity(count_pointers(ty));
    walk(ty, file, defaults, subst, &mut out);
    out
}

fn walk(
    ty: &Type,
    file: Option<FileId>,
    defaults: &Defaults,
    subst: &mut dyn FnMut(&SubstType) -> Option<TypeNullability>,
    out: &mut TypeNullability,
) {
    match ty {
        Type::Pointer(p) => {
            out.push(slot(p.annotation, file, defaults));
            walk(&p.pointee, file, defaults, subst, out);
        }
        Type::Reference(r) => walk(&r.referent, file, defaults, subst, out),
        Type::Record(r) => {
            if ty.is_supported_smart_pointer() {
                out.push(slot(r.annotation, file, defaults));
            }
            for arg in &r.args {
                walk(arg, file, defaults, subst, out);
            }
        }
        Type::Function(f) => {
            walk(&f.ret, file, defaults, subst, out);
            for param in &f.params {
                walk(param, file, defaults, subst, out);
            }
        }
        Type::Subst(s) => {
            if let Some(v) = subst(s) {
                if v.len() == count_pointers(&s.replacement) {
                    out.extend(v);
                    return;
                }
            }
            walk(&s.replacement, file, defaults, subst, out);
        }
        Type::Void | Type::Bool | Type::Int | Type::NullPtr | Type::TemplateParam(_) => {}
    }
}

fn slot(
    annotation: Option<NullabilityKind>,
    file: Option<FileId>,
    defaults: &Defaults,
) -> PointerNullability {
    PointerNullability::Concrete(annotation.unwrap_or_else(|| defaults.for_file(file)))
}

/// Declared nullability of a declaration. For functions the vector covers
/// the return type followed by each parameter, each resolved against the
/// file the declaration was written in.
pub fn decl_nullability(tu: &TranslationUnit, decl: DeclId, defaults: &Defaults) -> TypeNullability {
    let d = tu.decl(decl);
    match &d.kind {
        DeclKind::Function(sig) => {
            let mut result = type_nullability(&sig.ret, Some(d.file), defaults);
            for param in &sig.params {
                let pd = tu.decl(*param);
                if let Some(ty) = pd.value_type() {
                    result.extend(type_nullability(ty, Some(pd.file), defaults));
                }
            }
            result
        }
        DeclKind::Param(p) => type_nullability(&p.ty, Some(d.file), defaults),
        DeclKind::Var(v) => type_nullability(&v.ty, Some(d.file), defaults),
        DeclKind::Field(f) => type_nullability(&f.ty, Some(d.file), defaults),
        DeclKind::Record(_) => Vec::new(),
    }
}

/// Offsets into a function declaration's vector for each slot: index 0 is
/// the return type, 1..=n the parameters.
pub fn slot_offsets(tu: &TranslationUnit, sig: &FunctionSig) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(sig.params.len() + 1);
    offsets.push(0);
    let mut offset = count_pointers(&sig.ret);
    for param in &sig.params {
        offsets.push(offset);
        if let Some(ty) = tu.decl(*param).value_type() {
            offset += count_pointers(ty);
        }
    }
    offsets
}

/// Class-template resugaring: replaces parameter uses in `member_ty` by the
/// matching slice of the base object's vector. Bails (per substitution) on
/// pack arguments and when the substitution's template is not the base
/// type's own specialization.
pub fn substitute_in_class_template(
    member_ty: &Type,
    base_nullability: &[PointerNullability],
    base_ty: &Type,
    file: Option<FileId>,
    defaults: &Defaults,
) -> TypeNullability {
    let base = base_ty.strip_references();
    let record = match base {
        Type::Record(record) if !record.args.is_empty() => record.clone(),
        _ => return type_nullability(member_ty, file, defaults),
    };
    let smart_offset = usize::from(base.is_supported_smart_pointer());
    type_nullability_with_subst(member_ty, file, defaults, &mut |st| {
        if st.associated != record.decl || st.pack_index.is_some() {
            return None;
        }
        let index = st.index as usize;
        if index >= record.args.len() {
            return None;
        }
        let offset = smart_offset
            + record.args[..index]
                .iter()
                .map(count_pointers)
                .sum::<usize>();
        let len = count_pointers(&record.args[index]);
        base_nullability.get(offset..offset + len).map(<[_]>::to_vec)
    })
}

/// Function-template resugaring: substitutes the nullability of written
/// template arguments; deduced arguments have no sugar and come out
/// unspecified.
pub fn substitute_in_function_template(
    ty: &Type,
    primary_template: DeclId,
    template_args: &[TemplateArg],
    file: Option<FileId>,
    defaults: &Defaults,
) -> TypeNullability {
    type_nullability_with_subst(ty, file, defaults, &mut |st| {
        if st.associated != primary_template || st.pack_index.is_some() {
            return None;
        }
        match template_args.get(st.index as usize) {
            Some(TemplateArg::Written(arg)) => Some(type_nullability(arg, file, defaults)),
            Some(TemplateArg::Deduced) => {
                Some(unspecified_nullability(count_pointers(&st.replacement)))
            }
            None => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FileInfo, RecordType};

    fn nk(kind: NullabilityKind) -> PointerNullability {
        PointerNullability::Concrete(kind)
    }

    fn concrete(v: &TypeNullability) -> Vec<NullabilityKind> {
        v.iter().map(PointerNullability::concrete).collect()
    }

    #[test]
    fn vector_length_matches_pointer_count() {
        let defaults = Defaults::default();
        let ty = Type::pointer(Type::annotated_pointer(Type::Int, NullabilityKind::NonNull));
        let v = type_nullability(&ty, None, &defaults);
        assert_eq!(v.len(), count_pointers(&ty));
        assert_eq!(
            concrete(&v),
            vec![NullabilityKind::Unspecified, NullabilityKind::NonNull]
        );
    }

    #[test]
    fn annotated_vectors_round_trip_through_the_declared_type() {
        // Writing a vector back onto a type of the same shape and reading
        // it again yields the original vector.
        fn annotate(ty: &Type, slots: &mut std::slice::Iter<'_, PointerNullability>) -> Type {
            match ty {
                Type::Pointer(p) => {
                    let annotation = slots.next().map(PointerNullability::concrete);
                    Type::Pointer(crate::ast::PointerType {
                        pointee: Box::new(annotate(&p.pointee, slots)),
                        annotation,
                        pointee_const: p.pointee_const,
                    })
                }
                other => other.clone(),
            }
        }

        let defaults = Defaults::default();
        let ty = Type::annotated_pointer(
            Type::annotated_pointer(Type::Int, NullabilityKind::Nullable),
            NullabilityKind::NonNull,
        );
        let v = type_nullability(&ty, None, &defaults);
        let rebuilt = annotate(&Type::pointer(Type::pointer(Type::Int)), &mut v.iter());
        assert_eq!(type_nullability(&rebuilt, None, &defaults), v);
    }

    #[test]
    fn pragma_default_fills_unannotated_slots_only() {
        let mut tu = TranslationUnit::default();
        tu.files.push(FileInfo {
            name: "a.cc".to_string(),
            nullability_default: Some(NullabilityKind::NonNull),
        });
        let defaults = Defaults::from_translation_unit(&tu);

        let plain = Type::pointer(Type::Int);
        let annotated = Type::annotated_pointer(Type::Int, NullabilityKind::Unspecified);
        assert_eq!(
            concrete(&type_nullability(&plain, Some(FileId(0)), &defaults)),
            vec![NullabilityKind::NonNull]
        );
        // Explicit unknown beats the pragma default.
        assert_eq!(
            concrete(&type_nullability(&annotated, Some(FileId(0)), &defaults)),
            vec![NullabilityKind::Unspecified]
        );
        assert_eq!(
            concrete(&type_nullability(&plain, None, &defaults)),
            vec![NullabilityKind::Unspecified]
        );
    }

    #[test]
    fn class_template_substitution_picks_argument_slice() {
        // pair<int*, int* NonNull> with a member of type `S*`, S the second
        // parameter: the member's vector is [Nullable written, NonNull].
        let defaults = Defaults::default();
        let pair_decl = DeclId(0);
        let base_ty = Type::Record(RecordType {
            decl: pair_decl,
            args: vec![
                Type::pointer(Type::Int),
                Type::annotated_pointer(Type::Int, NullabilityKind::NonNull),
            ],
            smart: None,
            annotation: None,
        });
        let base_vec = type_nullability(&base_ty, None, &defaults);
        assert_eq!(
            concrete(&base_vec),
            vec![NullabilityKind::Unspecified, NullabilityKind::NonNull]
        );

        let member_ty = Type::Pointer(crate::ast::PointerType {
            pointee: Box::new(Type::Subst(SubstType {
                associated: pair_decl,
                index: 1,
                pack_index: None,
                replacement: Box::new(Type::pointer(Type::Int)),
            })),
            annotation: Some(NullabilityKind::Nullable),
            pointee_const: false,
        });
        let v = substitute_in_class_template(&member_ty, &base_vec, &base_ty, None, &defaults);
        assert_eq!(
            concrete(&v),
            vec![NullabilityKind::Nullable, NullabilityKind::NonNull]
        );
    }

    #[test]
    fn class_template_substitution_bails_on_foreign_template() {
        let defaults = Defaults::default();
        let base_ty = Type::Record(RecordType {
            decl: DeclId(0),
            args: vec![Type::annotated_pointer(Type::Int, NullabilityKind::NonNull)],
            smart: None,
            annotation: None,
        });
        let base_vec = type_nullability(&base_ty, None, &defaults);
        let member_ty = Type::Subst(SubstType {
            associated: DeclId(9),
            index: 0,
            pack_index: None,
            replacement: Box::new(Type::pointer(Type::Int)),
        });
        let v = substitute_in_class_template(&member_ty, &base_vec, &base_ty, None, &defaults);
        assert_eq!(concrete(&v), vec![NullabilityKind::Unspecified]);
    }

    #[test]
    fn pack_substitutions_fall_through_to_replacement() {
        let defaults = Defaults::default();
        let base_ty = Type::Record(RecordType {
            decl: DeclId(0),
            args: vec![Type::annotated_pointer(Type::Int, NullabilityKind::NonNull)],
            smart: None,
            annotation: None,
        });
        let base_vec = type_nullability(&base_ty, None, &defaults);
        let member_ty = Type::Subst(SubstType {
            associated: DeclId(0),
            index: 0,
            pack_index: Some(0),
            replacement: Box::new(Type::pointer(Type::Int)),
        });
        let v = substitute_in_class_template(&member_ty, &base_vec, &base_ty, None, &defaults);
        assert_eq!(concrete(&v), vec![NullabilityKind::Unspecified]);
    }

    #[test]
    fn function_template_substitution_uses_written_arguments() {
        let defaults = Defaults::default();
        let primary = DeclId(3);
        let ty = Type::Subst(SubstType {
            associated: primary,
            index: 0,
            pack_index: None,
            replacement: Box::new(Type::pointer(Type::Int)),
        });

        let written = [TemplateArg::Written(Type::annotated_pointer(
            Type::Int,
            NullabilityKind::Nullable,
        ))];
        let v = substitute_in_function_template(&ty, primary, &written, None, &defaults);
        assert_eq!(concrete(&v), vec![NullabilityKind::Nullable]);

        let deduced = [TemplateArg::Deduced];
        let v = substitute_in_function_template(&ty, primary, &deduced, None, &defaults);
        assert_eq!(concrete(&v), vec![NullabilityKind::Unspecified]);
    }

    #[test]
    fn slot_offsets_cover_return_then_parameters() {
        let mut tu = TranslationUnit::default();
        tu.files.push(FileInfo {
            name: "a.cc".to_string(),
            nullability_default: None,
        });
        let param_ty = Type::pointer(Type::pointer(Type::Int));
        tu.decls.push(crate::ast::Decl {
            usr: "c:@p".to_string(),
            name: "p".to_string(),
            file: FileId(0),
            kind: DeclKind::Param(crate::ast::ParamDecl {
                ty: param_ty,
                owner: DeclId(1),
                index: 0,
                default_value: None,
            }),
        });
        let sig = FunctionSig {
            ret: Type::pointer(Type::Int),
            params: vec![DeclId(0)],
            variadic: false,
            is_member: false,
            is_const: false,
            receiver: None,
            overridden: Vec::new(),
            primary_template: None,
        };
        assert_eq!(slot_offsets(&tu, &sig), vec![0, 1]);
    }
}
