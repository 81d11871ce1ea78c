use anyhow::{bail, Result};

use crate::nullability::NullabilityKind;

/// Identifier of a source file within a translation unit.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FileId(pub u32);

/// Identifier of a declaration within a translation unit.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeclId(pub u32);

/// Identifier of an expression within one function body.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ExprId(pub u32);

/// Identifier of a basic block within one function body.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BlockId(pub u32);

/// Source range used for diagnostic locations.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct SourceRange {
    pub file: FileId,
    pub start_line: u32,
    pub end_line: u32,
}

impl SourceRange {
    pub fn line(file: FileId, line: u32) -> Self {
        Self {
            file,
            start_line: line,
            end_line: line,
        }
    }
}

/// Source file metadata, including the nullability pragma default if any.
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub name: String,
    pub nullability_default: Option<NullabilityKind>,
}

/// Parses a `#pragma nullability file_default {nonnull|nullable|unknown}` line.
///
/// Returns `None` for lines that are not a recognized nullability pragma.
pub fn parse_file_default(line: &str) -> Option<NullabilityKind> {
    let mut words = line.split_whitespace();
    if words.next()? != "#pragma" || words.next()? != "nullability" {
        return None;
    }
    if words.next()? != "file_default" {
        return None;
    }
    let kind = match words.next()? {
        "nonnull" => NullabilityKind::NonNull,
        "nullable" => NullabilityKind::Nullable,
        "unknown" => NullabilityKind::Unspecified,
        _ => return None,
    };
    if words.next().is_some() {
        return None;
    }
    Some(kind)
}

/// Smart pointer classification for record types.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum SmartPointerKind {
    Unique,
    Shared,
    Weak,
}

/// Raw pointer type, optionally carrying an explicit nullability annotation.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct PointerType {
    pub pointee: Box<Type>,
    pub annotation: Option<NullabilityKind>,
    pub pointee_const: bool,
}

/// Reference type; `rvalue` distinguishes `T&&` from `T&`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct ReferenceType {
    pub referent: Box<Type>,
    pub referent_const: bool,
    pub rvalue: bool,
}

/// Record type with template arguments in declaration order.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct RecordType {
    pub decl: DeclId,
    pub args: Vec<Type>,
    pub smart: Option<SmartPointerKind>,
    /// Annotation on the smart pointer slot itself (`Nullable<unique_ptr<T>>`).
    pub annotation: Option<NullabilityKind>,
}

/// Function prototype.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct FunctionType {
    pub ret: Type,
    pub params: Vec<Type>,
    pub variadic: bool,
}

/// Sugar node recording a template-parameter substitution.
///
/// `associated` is the template declaration the parameter belongs to,
/// `replacement` the type the parameter was substituted with.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct SubstType {
    pub associated: DeclId,
    pub index: u32,
    pub pack_index: Option<u32>,
    pub replacement: Box<Type>,
}

/// Type of an expression or declaration.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Type {
    Void,
    Bool,
    Int,
    /// `nullptr_t`: the type of the null pointer literal, itself not a pointer.
    NullPtr,
    Pointer(PointerType),
    Reference(ReferenceType),
    Record(RecordType),
    Function(Box<FunctionType>),
    /// Unsubstituted template parameter; only appears in uninstantiated code.
    TemplateParam(u32),
    Subst(SubstType),
}

impl Type {
    pub fn pointer(pointee: Type) -> Self {
        Type::Pointer(PointerType {
            pointee: Box::new(pointee),
            annotation: None,
            pointee_const: false,
        })
    }

    pub fn annotated_pointer(pointee: Type, annotation: NullabilityKind) -> Self {
        Type::Pointer(PointerType {
            pointee: Box::new(pointee),
            annotation: Some(annotation),
            pointee_const: false,
        })
    }

    pub fn is_raw_pointer(&self) -> bool {
        matches!(self, Type::Pointer(_))
    }

    /// Supported smart pointers carry a synthetic `ptr` field and model
    /// dereference; weak pointers do not.
    pub fn is_supported_smart_pointer(&self) -> bool {
        matches!(
            self,
            Type::Record(RecordType {
                smart: Some(SmartPointerKind::Unique | SmartPointerKind::Shared),
                ..
            })
        )
    }

    pub fn is_weak_pointer(&self) -> bool {
        matches!(
            self,
            Type::Record(RecordType {
                smart: Some(SmartPointerKind::Weak),
                ..
            })
        )
    }

    pub fn strip_references(&self) -> &Type {
        match self {
            Type::Reference(r) => r.referent.strip_references(),
            other => other,
        }
    }

    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Pointer(p) => Some(&p.pointee),
            _ => None,
        }
    }

    /// The raw pointer type underlying a supported smart pointer.
    pub fn underlying_raw_pointer(&self) -> Option<Type> {
        match self {
            Type::Record(r) if self.is_supported_smart_pointer() => {
                let pointee = r.args.first()?.clone();
                Some(Type::pointer(pointee))
            }
            _ => None,
        }
    }
}

/// Number of pointer slots in a type, in pre-order of the type tree.
pub fn count_pointers(ty: &Type) -> usize {
    match ty {
        Type::Pointer(p) => 1 + count_pointers(&p.pointee),
        Type::Reference(r) => count_pointers(&r.referent),
        Type::Record(r) => {
            let args: usize = r.args.iter().map(count_pointers).sum();
            if ty.is_supported_smart_pointer() {
                1 + args
            } else {
                args
            }
        }
        Type::Function(f) => {
            count_pointers(&f.ret) + f.params.iter().map(count_pointers).sum::<usize>()
        }
        Type::Subst(s) => count_pointers(&s.replacement),
        Type::Void | Type::Bool | Type::Int | Type::NullPtr | Type::TemplateParam(_) => 0,
    }
}

/// Default argument of a parameter, kept in signature form only.
#[derive(Clone, Debug)]
pub struct DefaultArg {
    pub is_null_literal: bool,
    pub ty: Type,
    pub range: SourceRange,
}

/// Function signature shared by declarations with and without a body.
#[derive(Clone, Debug)]
pub struct FunctionSig {
    pub ret: Type,
    pub params: Vec<DeclId>,
    pub variadic: bool,
    pub is_member: bool,
    pub is_const: bool,
    /// Record declaration of the receiver for member functions.
    pub receiver: Option<DeclId>,
    /// Directly overridden virtual declarations.
    pub overridden: Vec<DeclId>,
    /// Primary template for instantiations of a function template.
    pub primary_template: Option<DeclId>,
}

/// Parameter declaration; `owner` is the enclosing function.
#[derive(Clone, Debug)]
pub struct ParamDecl {
    pub ty: Type,
    pub owner: DeclId,
    pub index: u32,
    pub default_value: Option<DefaultArg>,
}

/// Variable declaration (local or namespace-scope).
#[derive(Clone, Debug)]
pub struct VarDecl {
    pub ty: Type,
}

/// Field declaration of a record.
#[derive(Clone, Debug)]
pub struct FieldDecl {
    pub ty: Type,
    /// The in-class default member initializer is a null literal.
    pub default_init_is_null: bool,
}

/// Record declaration.
#[derive(Clone, Debug)]
pub struct RecordDecl {
    pub template_params: u32,
    pub smart: Option<SmartPointerKind>,
}

#[derive(Clone, Debug)]
pub enum DeclKind {
    Function(FunctionSig),
    Param(ParamDecl),
    Var(VarDecl),
    Field(FieldDecl),
    Record(RecordDecl),
}

/// Declaration with its unique string identifier.
#[derive(Clone, Debug)]
pub struct Decl {
    pub usr: String,
    pub name: String,
    pub file: FileId,
    pub kind: DeclKind,
}

impl Decl {
    pub fn function_sig(&self) -> Option<&FunctionSig> {
        match &self.kind {
            DeclKind::Function(sig) => Some(sig),
            _ => None,
        }
    }

    /// Declared type of a value declaration (not functions or records).
    pub fn value_type(&self) -> Option<&Type> {
        match &self.kind {
            DeclKind::Param(p) => Some(&p.ty),
            DeclKind::Var(v) => Some(&v.ty),
            DeclKind::Field(f) => Some(&f.ty),
            DeclKind::Function(_) | DeclKind::Record(_) => None,
        }
    }
}

/// Written or deduced template argument at a call site.
#[derive(Clone, Debug)]
pub enum TemplateArg {
    Written(Type),
    Deduced,
}

/// Cast kinds distinguished by the type transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum CastKind {
    LValueToRValue,
    NoOp,
    AtomicToNonAtomic,
    NonAtomicToAtomic,
    AddressSpaceConversion,
    BitCast,
    LValueBitCast,
    BaseToDerived,
    DerivedToBase,
    UserDefinedConversion,
    ConstructorConversion,
    Dynamic,
    NullToPointer,
    IntegralToPointer,
    PointerToBoolean,
    IntegralCast,
    ArrayToPointerDecay,
    FunctionToPointerDecay,
    ToVoid,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum UnaryOp {
    AddrOf,
    Deref,
    Not,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum BinaryOp {
    Eq,
    Ne,
    Assign,
}

/// Form of a smart pointer dereference operator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum SmartDerefForm {
    Star,
    Arrow,
    Index,
}

/// Modeled smart pointer member calls.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum SmartPointerMethod {
    Get,
    Release,
    Reset,
    Swap,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum ValueCategory {
    PrValue,
    GlValue,
}

#[derive(Clone, Debug)]
pub enum ExprKind {
    DeclRef {
        decl: DeclId,
        template_args: Vec<TemplateArg>,
    },
    Member {
        base: ExprId,
        member: DeclId,
        arrow: bool,
        /// Callee of a member call; the member's declared type applies.
        bound_member: bool,
    },
    Call {
        callee: ExprId,
        args: Vec<ExprId>,
    },
    MemberCall {
        callee: ExprId,
        args: Vec<ExprId>,
    },
    Construct {
        ctor: Option<DeclId>,
        args: Vec<ExprId>,
    },
    Cast {
        kind: CastKind,
        operand: ExprId,
    },
    Unary {
        op: UnaryOp,
        operand: ExprId,
    },
    Binary {
        op: BinaryOp,
        lhs: ExprId,
        rhs: ExprId,
    },
    Subscript {
        base: ExprId,
        index: ExprId,
    },
    SmartDeref {
        object: ExprId,
        form: SmartDerefForm,
    },
    SmartCall {
        object: ExprId,
        method: SmartPointerMethod,
        args: Vec<ExprId>,
    },
    /// `make_unique` / `make_shared`-style factory call.
    SmartFactory {
        args: Vec<ExprId>,
    },
    /// Free `swap(a, b)` over smart pointers.
    SmartSwap {
        lhs: ExprId,
        rhs: ExprId,
    },
    NullLiteral,
    BoolLiteral(bool),
    IntLiteral(i64),
    This,
    New {
        may_return_null: bool,
    },
    MaterializeTemporary {
        operand: ExprId,
    },
    /// `__assert_nullability<NK...>(operand)`.
    AssertNullability {
        expected: Vec<NullabilityKind>,
        operand: ExprId,
    },
    /// Materialization of a defaulted argument at a call site.
    DefaultArgUse,
    /// Value the provider could not model.
    OpaqueValue,
}

/// Expression node; subexpressions are referenced by id.
#[derive(Clone, Debug)]
pub struct Expr {
    pub ty: Type,
    pub category: ValueCategory,
    pub kind: ExprKind,
    pub range: SourceRange,
}

/// CFG element: statements and constructor member initializers, in
/// evaluation order. Subexpressions always precede their parents.
#[derive(Clone, Debug)]
pub enum CfgElement {
    Stmt(ExprId),
    Decl { decl: DeclId, init: Option<ExprId> },
    MemberInit { member: DeclId, init: ExprId },
}

/// Block terminator. `Branch` successors are ordered (then, else).
#[derive(Clone, Debug)]
pub enum Terminator {
    Jump(BlockId),
    Branch {
        condition: ExprId,
        then_block: BlockId,
        else_block: BlockId,
    },
    Return {
        value: Option<ExprId>,
    },
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump(b) => vec![*b],
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            Terminator::Return { .. } => Vec::new(),
        }
    }
}

/// Basic block of a function CFG.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub elements: Vec<CfgElement>,
    pub terminator: Terminator,
}

/// Control-flow graph; block 0 is the entry.
#[derive(Clone, Debug)]
pub struct Cfg {
    pub blocks: Vec<BasicBlock>,
}

impl Cfg {
    /// Structural validation; a failure here is the "CFG construction
    /// failed" error path and skips the function.
    pub fn validate(&self, expr_count: usize) -> Result<()> {
        if self.blocks.is_empty() {
            bail!("CFG has no entry block");
        }
        let check_expr = |id: ExprId| -> Result<()> {
            if id.0 as usize >= expr_count {
                bail!("CFG references unknown expression {}", id.0);
            }
            Ok(())
        };
        for (index, block) in self.blocks.iter().enumerate() {
            for element in &block.elements {
                match element {
                    CfgElement::Stmt(e) => check_expr(*e)?,
                    CfgElement::Decl { init, .. } => {
                        if let Some(e) = init {
                            check_expr(*e)?;
                        }
                    }
                    CfgElement::MemberInit { init, .. } => check_expr(*init)?,
                }
            }
            if let Terminator::Branch { condition, .. } = &block.terminator {
                check_expr(*condition)?;
            }
            if let Terminator::Return { value: Some(e) } = &block.terminator {
                check_expr(*e)?;
            }
            for succ in block.terminator.successors() {
                if succ.0 as usize >= self.blocks.len() {
                    bail!("block {index} targets unknown block {}", succ.0);
                }
            }
        }
        Ok(())
    }
}

/// Analyzable function: a declaration plus an expression arena and CFG.
#[derive(Clone, Debug)]
pub struct Function {
    pub decl: DeclId,
    pub exprs: Vec<Expr>,
    pub cfg: Cfg,
}

impl Function {
    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }
}

/// Parsed translation unit handed to the engine by the AST provider.
#[derive(Clone, Debug, Default)]
pub struct TranslationUnit {
    pub files: Vec<FileInfo>,
    pub decls: Vec<Decl>,
    pub functions: Vec<Function>,
}

impl TranslationUnit {
    pub fn decl(&self, id: DeclId) -> &Decl {
        &self.decls[id.0 as usize]
    }

    pub fn file(&self, id: FileId) -> &FileInfo {
        &self.files[id.0 as usize]
    }

    /// Function body for a declaration, if the provider supplied one.
    pub fn body_of(&self, decl: DeclId) -> Option<&Function> {
        self.functions.iter().find(|f| f.decl == decl)
    }

    /// Reconstructs the prototype of a function declaration.
    pub fn function_type(&self, sig: &FunctionSig) -> Type {
        Type::Function(Box::new(FunctionType {
            ret: sig.ret.clone(),
            params: sig
                .params
                .iter()
                .map(|p| {
                    self.decl(*p)
                        .value_type()
                        .cloned()
                        .unwrap_or(Type::Void)
                })
                .collect(),
            variadic: sig.variadic,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_default_pragma() {
        assert_eq!(
            parse_file_default("#pragma nullability file_default nonnull"),
            Some(NullabilityKind::NonNull)
        );
        assert_eq!(
            parse_file_default("#pragma nullability file_default unknown"),
            Some(NullabilityKind::Unspecified)
        );
        assert_eq!(parse_file_default("#pragma nullability file_default"), None);
        assert_eq!(parse_file_default("#pragma once"), None);
        assert_eq!(
            parse_file_default("#pragma nullability file_default nullable extra"),
            None
        );
    }

    #[test]
    fn counts_pointers_in_preorder_structures() {
        let int_ptr = Type::pointer(Type::Int);
        assert_eq!(count_pointers(&Type::Int), 0);
        assert_eq!(count_pointers(&int_ptr), 1);
        assert_eq!(count_pointers(&Type::pointer(int_ptr.clone())), 2);

        let record = Type::Record(RecordType {
            decl: DeclId(0),
            args: vec![int_ptr.clone(), Type::Int, int_ptr.clone()],
            smart: None,
            annotation: None,
        });
        assert_eq!(count_pointers(&record), 2);

        let unique = Type::Record(RecordType {
            decl: DeclId(1),
            args: vec![int_ptr.clone()],
            smart: Some(SmartPointerKind::Unique),
            annotation: None,
        });
        assert_eq!(count_pointers(&unique), 2);

        let func = Type::Function(Box::new(FunctionType {
            ret: int_ptr.clone(),
            params: vec![int_ptr, Type::Bool],
            variadic: false,
        }));
        assert_eq!(count_pointers(&func), 2);
    }

    #[test]
    fn validates_cfg_structure() {
        let cfg = Cfg {
            blocks: vec![BasicBlock {
                elements: vec![CfgElement::Stmt(ExprId(0))],
                terminator: Terminator::Jump(BlockId(7)),
            }],
        };
        assert!(cfg.validate(1).is_err());

        let cfg = Cfg {
            blocks: vec![BasicBlock {
                elements: Vec::new(),
                terminator: Terminator::Return { value: None },
            }],
        };
        assert!(cfg.validate(0).is_ok());
    }
}
