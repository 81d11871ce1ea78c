//! AST builders shared by the engine's tests.
//!
//! Bodies are built the way the provider hands them to the engine: every
//! expression is appended to the current block as its own CFG element, so
//! subexpressions always precede their parents.

use crate::ast::{
    BasicBlock, BlockId, CastKind, Cfg, CfgElement, Decl, DeclId, DeclKind, DefaultArg, Expr,
    ExprId, ExprKind, FieldDecl, FileId, FileInfo, Function, FunctionSig, ParamDecl, RecordDecl,
    SmartPointerKind, SmartPointerMethod, SourceRange, TemplateArg, Terminator, TranslationUnit,
    Type, UnaryOp, ValueCategory, VarDecl,
};
use crate::ast::{BinaryOp, SmartDerefForm};
use crate::nullability::NullabilityKind;

/// Declaration handle for a built function.
#[derive(Clone, Debug)]
pub(crate) struct FnHandle {
    pub decl: DeclId,
    pub params: Vec<DeclId>,
}

pub(crate) struct TuBuilder {
    tu: TranslationUnit,
}

impl TuBuilder {
    pub fn new() -> Self {
        let mut tu = TranslationUnit::default();
        tu.files.push(FileInfo {
            name: "test.cc".to_string(),
            nullability_default: None,
        });
        Self { tu }
    }

    pub fn add_file(&mut self, name: &str, default: Option<NullabilityKind>) -> FileId {
        let id = FileId(self.tu.files.len() as u32);
        self.tu.files.push(FileInfo {
            name: name.to_string(),
            nullability_default: default,
        });
        id
    }

    fn push_decl(&mut self, decl: Decl) -> DeclId {
        let id = DeclId(self.tu.decls.len() as u32);
        self.tu.decls.push(decl);
        id
    }

    pub fn func(&mut self, name: &str, ret: Type, params: Vec<(&str, Type)>) -> FnHandle {
        self.func_in_file(FileId(0), name, ret, params)
    }

    pub fn func_in_file(
        &mut self,
        file: FileId,
        name: &str,
        ret: Type,
        params: Vec<(&str, Type)>,
    ) -> FnHandle {
        let decl = self.push_decl(Decl {
            usr: format!("c:@F@{name}"),
            name: name.to_string(),
            file,
            kind: DeclKind::Function(FunctionSig {
                ret,
                params: Vec::new(),
                variadic: false,
                is_member: false,
                is_const: false,
                receiver: None,
                overridden: Vec::new(),
                primary_template: None,
            }),
        });
        let param_ids = self.add_params(decl, file, name, params);
        FnHandle {
            decl,
            params: param_ids,
        }
    }

    pub fn method(
        &mut self,
        receiver: DeclId,
        name: &str,
        ret: Type,
        params: Vec<(&str, Type)>,
        is_const: bool,
    ) -> FnHandle {
        let receiver_name = self.tu.decl(receiver).name.clone();
        let decl = self.push_decl(Decl {
            usr: format!("c:@S@{receiver_name}@F@{name}"),
            name: name.to_string(),
            file: FileId(0),
            kind: DeclKind::Function(FunctionSig {
                ret,
                params: Vec::new(),
                variadic: false,
                is_member: true,
                is_const,
                receiver: Some(receiver),
                overridden: Vec::new(),
                primary_template: None,
            }),
        });
        let param_ids = self.add_params(decl, FileId(0), name, params);
        FnHandle {
            decl,
            params: param_ids,
        }
    }

    fn add_params(
        &mut self,
        decl: DeclId,
        file: FileId,
        func_name: &str,
        params: Vec<(&str, Type)>,
    ) -> Vec<DeclId> {
        let mut param_ids = Vec::new();
        for (index, (param_name, ty)) in params.into_iter().enumerate() {
            let id = self.push_decl(Decl {
                usr: format!("c:@F@{func_name}@{param_name}"),
                name: param_name.to_string(),
                file,
                kind: DeclKind::Param(ParamDecl {
                    ty,
                    owner: decl,
                    index: index as u32,
                    default_value: None,
                }),
            });
            param_ids.push(id);
        }
        if let DeclKind::Function(sig) = &mut self.tu.decls[decl.0 as usize].kind {
            sig.params = param_ids.clone();
        }
        param_ids
    }

    pub fn record(&mut self, name: &str) -> DeclId {
        self.record_with(name, 0, None)
    }

    pub fn record_with(
        &mut self,
        name: &str,
        template_params: u32,
        smart: Option<SmartPointerKind>,
    ) -> DeclId {
        self.push_decl(Decl {
            usr: format!("c:@S@{name}"),
            name: name.to_string(),
            file: FileId(0),
            kind: DeclKind::Record(RecordDecl {
                template_params,
                smart,
            }),
        })
    }

    pub fn field(&mut self, record: DeclId, name: &str, ty: Type, default_init_is_null: bool) -> DeclId {
        let record_name = self.tu.decl(record).name.clone();
        self.push_decl(Decl {
            usr: format!("c:@S@{record_name}@FI@{name}"),
            name: name.to_string(),
            file: FileId(0),
            kind: DeclKind::Field(FieldDecl {
                ty,
                default_init_is_null,
            }),
        })
    }

    pub fn var(&mut self, name: &str, ty: Type) -> DeclId {
        self.push_decl(Decl {
            usr: format!("c:@{name}"),
            name: name.to_string(),
            file: FileId(0),
            kind: DeclKind::Var(VarDecl { ty }),
        })
    }

    pub fn set_overridden(&mut self, derived: &FnHandle, base: &FnHandle) {
        if let DeclKind::Function(sig) = &mut self.tu.decls[derived.decl.0 as usize].kind {
            sig.overridden.push(base.decl);
        }
    }

    pub fn set_primary_template(&mut self, instantiation: &FnHandle, primary: &FnHandle) {
        if let DeclKind::Function(sig) = &mut self.tu.decls[instantiation.decl.0 as usize].kind {
            sig.primary_template = Some(primary.decl);
        }
    }

    pub fn set_param_default(&mut self, f: &FnHandle, index: usize, default: DefaultArg) {
        let param = f.params[index];
        if let DeclKind::Param(p) = &mut self.tu.decls[param.0 as usize].kind {
            p.default_value = Some(default);
        }
    }

    pub fn param_type(&self, f: &FnHandle, index: usize) -> Type {
        self.tu
            .decl(f.params[index])
            .value_type()
            .cloned()
            .expect("parameter type")
    }

    pub fn return_type(&self, f: &FnHandle) -> Type {
        self.tu
            .decl(f.decl)
            .function_sig()
            .map(|sig| sig.ret.clone())
            .expect("function signature")
    }

    pub fn function_type(&self, f: &FnHandle) -> Type {
        let sig = self.tu.decl(f.decl).function_sig().expect("signature");
        self.tu.function_type(sig)
    }

    pub fn body(&mut self, f: &FnHandle) -> BodyBuilder<'_> {
        BodyBuilder {
            decl: f.decl,
            file: self.tu.decl(f.decl).file,
            builder: self,
            exprs: Vec::new(),
            blocks: vec![BlockInProgress::default()],
            current: 0,
            line: 1,
        }
    }

    pub fn build(self) -> TranslationUnit {
        self.tu
    }
}

#[derive(Default)]
struct BlockInProgress {
    elements: Vec<CfgElement>,
    terminator: Option<Terminator>,
}

pub(crate) struct BodyBuilder<'a> {
    builder: &'a mut TuBuilder,
    decl: DeclId,
    file: FileId,
    exprs: Vec<Expr>,
    blocks: Vec<BlockInProgress>,
    current: usize,
    line: u32,
}

impl BodyBuilder<'_> {
    fn next_range(&mut self) -> SourceRange {
        let range = SourceRange::line(self.file, self.line);
        self.line += 1;
        range
    }

    /// Appends an expression and schedules it as a statement element.
    pub fn push_expr(&mut self, ty: Type, category: ValueCategory, kind: ExprKind) -> ExprId {
        let range = self.next_range();
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(Expr {
            ty,
            category,
            kind,
            range,
        });
        self.blocks[self.current].elements.push(CfgElement::Stmt(id));
        id
    }

    pub fn reserve_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockInProgress::default());
        id
    }

    pub fn start_block(&mut self, block: BlockId) {
        self.current = block.0 as usize;
    }

    fn terminate(&mut self, terminator: Terminator) {
        let block = &mut self.blocks[self.current];
        assert!(block.terminator.is_none(), "block already terminated");
        block.terminator = Some(terminator);
    }

    pub fn jump(&mut self, target: BlockId) {
        self.terminate(Terminator::Jump(target));
    }

    pub fn branch(&mut self, condition: ExprId, then_block: BlockId, else_block: BlockId) {
        self.terminate(Terminator::Branch {
            condition,
            then_block,
            else_block,
        });
    }

    pub fn ret(&mut self, value: Option<ExprId>) {
        self.terminate(Terminator::Return { value });
    }

    pub fn decl_ref(&mut self, decl: DeclId) -> ExprId {
        let d = self.builder.tu.decl(decl);
        let ty = match &d.kind {
            DeclKind::Function(sig) => self.builder.tu.function_type(sig),
            _ => d.value_type().cloned().expect("value declaration"),
        };
        self.push_expr(
            ty,
            ValueCategory::GlValue,
            ExprKind::DeclRef {
                decl,
                template_args: Vec::new(),
            },
        )
    }

    pub fn decl_ref_with_args(&mut self, decl: DeclId, template_args: Vec<TemplateArg>) -> ExprId {
        let d = self.builder.tu.decl(decl);
        let ty = match &d.kind {
            DeclKind::Function(sig) => self.builder.tu.function_type(sig),
            _ => d.value_type().cloned().expect("value declaration"),
        };
        self.push_expr(
            ty,
            ValueCategory::GlValue,
            ExprKind::DeclRef {
                decl,
                template_args,
            },
        )
    }

    /// Loads a glvalue, yielding the usual prvalue use of a variable.
    pub fn load(&mut self, operand: ExprId) -> ExprId {
        let ty = self.exprs[operand.0 as usize].ty.strip_references().clone();
        self.push_expr(
            ty,
            ValueCategory::PrValue,
            ExprKind::Cast {
                kind: CastKind::LValueToRValue,
                operand,
            },
        )
    }

    pub fn param_ref(&mut self, f: &FnHandle, index: usize) -> ExprId {
        self.decl_ref(f.params[index])
    }

    pub fn param_value(&mut self, f: &FnHandle, index: usize) -> ExprId {
        let r = self.param_ref(f, index);
        self.load(r)
    }

    pub fn local(&mut self, name: &str, ty: Type, init: Option<ExprId>) -> DeclId {
        let decl = self.builder.var(name, ty);
        self.blocks[self.current]
            .elements
            .push(CfgElement::Decl { decl, init });
        decl
    }

    pub fn member_init(&mut self, member: DeclId, init: ExprId) {
        self.blocks[self.current]
            .elements
            .push(CfgElement::MemberInit { member, init });
    }

    pub fn null(&mut self) -> ExprId {
        self.push_expr(Type::NullPtr, ValueCategory::PrValue, ExprKind::NullLiteral)
    }

    /// Null literal converted to a pointer type.
    pub fn null_to(&mut self, ty: Type) -> ExprId {
        let null = self.null();
        self.push_expr(
            ty,
            ValueCategory::PrValue,
            ExprKind::Cast {
                kind: CastKind::NullToPointer,
                operand: null,
            },
        )
    }

    pub fn bool_lit(&mut self, value: bool) -> ExprId {
        self.push_expr(
            Type::Bool,
            ValueCategory::PrValue,
            ExprKind::BoolLiteral(value),
        )
    }

    pub fn addr_of(&mut self, operand: ExprId) -> ExprId {
        let pointee = self.exprs[operand.0 as usize].ty.clone();
        self.push_expr(
            Type::pointer(pointee),
            ValueCategory::PrValue,
            ExprKind::Unary {
                op: UnaryOp::AddrOf,
                operand,
            },
        )
    }

    pub fn deref(&mut self, operand: ExprId) -> ExprId {
        let ty = self.exprs[operand.0 as usize]
            .ty
            .pointee()
            .cloned()
            .expect("pointer operand");
        self.push_expr(
            ty,
            ValueCategory::GlValue,
            ExprKind::Unary {
                op: UnaryOp::Deref,
                operand,
            },
        )
    }

    pub fn subscript(&mut self, base: ExprId, index: ExprId) -> ExprId {
        let ty = self.exprs[base.0 as usize]
            .ty
            .pointee()
            .cloned()
            .expect("pointer base");
        self.push_expr(
            ty,
            ValueCategory::GlValue,
            ExprKind::Subscript { base, index },
        )
    }

    pub fn int_lit(&mut self, value: i64) -> ExprId {
        self.push_expr(
            Type::Int,
            ValueCategory::PrValue,
            ExprKind::IntLiteral(value),
        )
    }

    pub fn ptr_to_bool(&mut self, operand: ExprId) -> ExprId {
        self.push_expr(
            Type::Bool,
            ValueCategory::PrValue,
            ExprKind::Cast {
                kind: CastKind::PointerToBoolean,
                operand,
            },
        )
    }

    pub fn not(&mut self, operand: ExprId) -> ExprId {
        self.push_expr(
            Type::Bool,
            ValueCategory::PrValue,
            ExprKind::Unary {
                op: UnaryOp::Not,
                operand,
            },
        )
    }

    pub fn eq(&mut self, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.push_expr(
            Type::Bool,
            ValueCategory::PrValue,
            ExprKind::Binary {
                op: BinaryOp::Eq,
                lhs,
                rhs,
            },
        )
    }

    pub fn ne(&mut self, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.push_expr(
            Type::Bool,
            ValueCategory::PrValue,
            ExprKind::Binary {
                op: BinaryOp::Ne,
                lhs,
                rhs,
            },
        )
    }

    pub fn assign(&mut self, lhs: ExprId, rhs: ExprId) -> ExprId {
        let ty = self.exprs[lhs.0 as usize].ty.clone();
        self.push_expr(
            ty,
            ValueCategory::GlValue,
            ExprKind::Binary {
                op: BinaryOp::Assign,
                lhs,
                rhs,
            },
        )
    }

    pub fn cast(&mut self, kind: CastKind, ty: Type, operand: ExprId) -> ExprId {
        self.push_expr(ty, ValueCategory::PrValue, ExprKind::Cast { kind, operand })
    }

    /// Call through a direct reference to `f`.
    pub fn call(&mut self, f: &FnHandle, args: Vec<ExprId>) -> ExprId {
        let callee = self.decl_ref(f.decl);
        self.finish_call(f, callee, args)
    }

    pub fn call_templated(
        &mut self,
        f: &FnHandle,
        template_args: Vec<TemplateArg>,
        args: Vec<ExprId>,
    ) -> ExprId {
        let callee = self.decl_ref_with_args(f.decl, template_args);
        self.finish_call(f, callee, args)
    }

    fn finish_call(&mut self, f: &FnHandle, callee: ExprId, args: Vec<ExprId>) -> ExprId {
        let ret = self.builder.return_type(f);
        let (ty, category) = match &ret {
            Type::Reference(r) => ((*r.referent).clone(), ValueCategory::GlValue),
            other => (other.clone(), ValueCategory::PrValue),
        };
        self.push_expr(ty, category, ExprKind::Call { callee, args })
    }

    pub fn member(&mut self, base: ExprId, member: DeclId, arrow: bool) -> ExprId {
        let ty = self
            .builder
            .tu
            .decl(member)
            .value_type()
            .cloned()
            .expect("field type");
        self.push_expr(
            ty,
            ValueCategory::GlValue,
            ExprKind::Member {
                base,
                member,
                arrow,
                bound_member: false,
            },
        )
    }

    pub fn member_call(&mut self, base: ExprId, method: &FnHandle, args: Vec<ExprId>) -> ExprId {
        let fn_ty = self.builder.function_type(method);
        let callee = self.push_expr(
            fn_ty,
            ValueCategory::GlValue,
            ExprKind::Member {
                base,
                member: method.decl,
                arrow: false,
                bound_member: true,
            },
        );
        let ret = self.builder.return_type(method);
        let (ty, category) = match &ret {
            Type::Reference(r) => ((*r.referent).clone(), ValueCategory::GlValue),
            other => (other.clone(), ValueCategory::PrValue),
        };
        self.push_expr(ty, category, ExprKind::MemberCall { callee, args })
    }

    pub fn construct(&mut self, ty: Type, ctor: Option<DeclId>, args: Vec<ExprId>) -> ExprId {
        self.push_expr(ty, ValueCategory::PrValue, ExprKind::Construct { ctor, args })
    }

    pub fn smart_call(
        &mut self,
        object: ExprId,
        method: SmartPointerMethod,
        args: Vec<ExprId>,
    ) -> ExprId {
        let object_ty = self.exprs[object.0 as usize].ty.strip_references().clone();
        let ty = match method {
            SmartPointerMethod::Get | SmartPointerMethod::Release => object_ty
                .underlying_raw_pointer()
                .expect("smart pointer object"),
            SmartPointerMethod::Reset | SmartPointerMethod::Swap => Type::Void,
        };
        self.push_expr(
            ty,
            ValueCategory::PrValue,
            ExprKind::SmartCall {
                object,
                method,
                args,
            },
        )
    }

    pub fn smart_swap(&mut self, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.push_expr(
            Type::Void,
            ValueCategory::PrValue,
            ExprKind::SmartSwap { lhs, rhs },
        )
    }

    pub fn smart_deref(&mut self, object: ExprId) -> ExprId {
        let object_ty = self.exprs[object.0 as usize].ty.strip_references().clone();
        let ty = object_ty
            .underlying_raw_pointer()
            .and_then(|raw| raw.pointee().cloned())
            .expect("smart pointer object");
        self.push_expr(
            ty,
            ValueCategory::GlValue,
            ExprKind::SmartDeref {
                object,
                form: SmartDerefForm::Star,
            },
        )
    }

    pub fn assert_nullability(&mut self, operand: ExprId, expected: Vec<NullabilityKind>) -> ExprId {
        self.push_expr(
            Type::Void,
            ValueCategory::PrValue,
            ExprKind::AssertNullability { expected, operand },
        )
    }

    pub fn opaque(&mut self, ty: Type) -> ExprId {
        self.push_expr(ty, ValueCategory::PrValue, ExprKind::OpaqueValue)
    }

    pub fn default_arg_use(&mut self, ty: Type) -> ExprId {
        self.push_expr(ty, ValueCategory::PrValue, ExprKind::DefaultArgUse)
    }

    pub fn finish(self) {
        let blocks = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(index, block)| BasicBlock {
                elements: block.elements,
                terminator: block
                    .terminator
                    .unwrap_or_else(|| panic!("block {index} has no terminator")),
            })
            .collect();
        self.builder.tu.functions.push(Function {
            decl: self.decl,
            exprs: self.exprs,
            cfg: Cfg { blocks },
        });
    }
}
