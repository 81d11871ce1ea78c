use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{bail, Result};

use crate::ast::{
    BlockId, CfgElement, FileId, Function, RecordDecl, RecordType, Terminator, TranslationUnit,
    Type,
};
use crate::env::{AnalysisContext, Environment};
use crate::formula::FormulaId;
use crate::lattice::NonFlowSensitiveState;
use crate::nullability::Defaults;
use crate::transfer::{transfer_element, TransferState};
use crate::value::{same_value, PointerNullState, PointerValue, Value, ValueId};

/// Rough line between "finite" and "effectively infinite" solver work.
pub const MAX_SAT_ITERATIONS: u64 = 2_000_000;

/// Cap on block visits before a function's analysis is abandoned.
pub const MAX_BLOCK_VISITS: u32 = 20_000;

/// One CFG position handed to post-fixpoint consumers.
pub(crate) enum WalkItem<'f> {
    Element(&'f CfgElement),
    Terminator(&'f Terminator),
}

/// Flow-sensitive analysis of one function: fixed point over the CFG with
/// merge at joins and widening at loop heads.
pub(crate) struct FunctionAnalysis<'a> {
    pub(crate) tu: &'a TranslationUnit,
    pub(crate) func: &'a Function,
    pub(crate) defaults: &'a Defaults,
    pub(crate) file: FileId,
    pub(crate) nfs: NonFlowSensitiveState,
    pub(crate) ctx: AnalysisContext,
}

impl<'a> FunctionAnalysis<'a> {
    pub(crate) fn new(
        tu: &'a TranslationUnit,
        func: &'a Function,
        defaults: &'a Defaults,
        nfs: NonFlowSensitiveState,
        max_sat_iterations: u64,
    ) -> Self {
        let file = tu.decl(func.decl).file;
        Self {
            tu,
            func,
            defaults,
            file,
            nfs,
            ctx: AnalysisContext::new(max_sat_iterations),
        }
    }

    pub(crate) fn transfer_state(&mut self) -> TransferState<'_> {
        TransferState {
            tu: self.tu,
            func: self.func,
            defaults: self.defaults,
            file: self.file,
            nfs: &mut self.nfs,
            ctx: &mut self.ctx,
        }
    }

    /// Runs to a fixed point and returns the entry environment per block.
    pub(crate) fn run(&mut self, max_block_visits: u32) -> Result<BTreeMap<BlockId, Environment>> {
        let func = self.func;
        func.cfg.validate(func.exprs.len())?;

        let order = reverse_post_order(func);
        let rpo_index: BTreeMap<BlockId, usize> = order
            .iter()
            .enumerate()
            .map(|(index, block)| (*block, index))
            .collect();
        let mut predecessors: BTreeMap<BlockId, Vec<BlockId>> = BTreeMap::new();
        let mut loop_heads: BTreeSet<BlockId> = BTreeSet::new();
        for (index, block) in func.cfg.blocks.iter().enumerate() {
            let from = BlockId(index as u32);
            for to in block.terminator.successors() {
                predecessors.entry(to).or_default().push(from);
                if let (Some(to_index), Some(from_index)) =
                    (rpo_index.get(&to), rpo_index.get(&from))
                {
                    if to_index <= from_index {
                        loop_heads.insert(to);
                    }
                }
            }
        }

        let entry = BlockId(0);
        let mut edge_envs: BTreeMap<(BlockId, BlockId), Environment> = BTreeMap::new();
        let mut in_envs: BTreeMap<BlockId, Environment> = BTreeMap::new();
        let mut queue = VecDeque::from([entry]);
        let mut visits = 0u32;

        while let Some(block) = queue.pop_front() {
            visits += 1;
            if visits > max_block_visits {
                bail!("maximum block visits ({max_block_visits}) exceeded");
            }

            let mut input = if block == entry {
                self.initial_env()
            } else {
                let mut merged: Option<Environment> = None;
                for pred in predecessors.get(&block).map(Vec::as_slice).unwrap_or(&[]) {
                    if let Some(env) = edge_envs.get(&(*pred, block)) {
                        merged = Some(match merged {
                            // A single available predecessor passes through
                            // unchanged, keeping the const-method memo alive
                            // across straight-line code.
                            None => env.clone(),
                            Some(existing) => self.join(&existing, env),
                        });
                    }
                }
                match merged {
                    Some(env) => env,
                    // No predecessor has produced a state yet.
                    None => continue,
                }
            };

            if loop_heads.contains(&block) {
                if let Some(previous) = in_envs.get(&block) {
                    let previous = previous.clone();
                    input = self.widen(&previous, input);
                }
            }
            if let Some(previous) = in_envs.get(&block) {
                let previous = previous.clone();
                if self.equivalent(&previous, &input) {
                    continue;
                }
            }
            in_envs.insert(block, input.clone());

            let mut env = input;
            let bb = &func.cfg.blocks[block.0 as usize];
            {
                let mut state = self.transfer_state();
                for element in &bb.elements {
                    transfer_element(&mut state, &mut env, element);
                }
            }

            match &bb.terminator {
                Terminator::Jump(target) => {
                    self.propagate_edge(&mut edge_envs, &mut queue, block, *target, env);
                }
                Terminator::Branch {
                    condition,
                    then_block,
                    else_block,
                } => {
                    let cond = match env.value_of_expr(*condition).map(|v| *self.ctx.value(v)) {
                        Some(Value::Bool(f)) => Some(f),
                        _ => None,
                    };
                    let mut then_env = env.clone();
                    let mut else_env = env;
                    if let Some(f) = cond {
                        then_env.assume(&mut self.ctx, f);
                        let negated = self.ctx.formulas.not(f);
                        else_env.assume(&mut self.ctx, negated);
                    }
                    self.propagate_edge(&mut edge_envs, &mut queue, block, *then_block, then_env);
                    self.propagate_edge(&mut edge_envs, &mut queue, block, *else_block, else_env);
                }
                Terminator::Return { .. } => {}
            }
        }

        if self.ctx.solver.reached_limit() {
            bail!("SAT solver timed out");
        }
        Ok(in_envs)
    }

    /// Replays the transfer over every reachable block, invoking `visit`
    /// after each element and once for the terminator.
    pub(crate) fn post_visit<F>(&mut self, in_envs: &BTreeMap<BlockId, Environment>, mut visit: F)
    where
        F: FnMut(&mut FunctionAnalysis<'a>, &Environment, &WalkItem),
    {
        let func = self.func;
        for (index, block) in func.cfg.blocks.iter().enumerate() {
            let Some(input) = in_envs.get(&BlockId(index as u32)) else {
                continue;
            };
            let mut env = input.clone();
            for element in &block.elements {
                {
                    let mut state = self.transfer_state();
                    transfer_element(&mut state, &mut env, element);
                }
                visit(self, &env, &WalkItem::Element(element));
            }
            visit(self, &env, &WalkItem::Terminator(&block.terminator));
        }
    }

    fn propagate_edge(
        &mut self,
        edge_envs: &mut BTreeMap<(BlockId, BlockId), Environment>,
        queue: &mut VecDeque<BlockId>,
        from: BlockId,
        to: BlockId,
        env: Environment,
    ) {
        let changed = match edge_envs.get(&(from, to)) {
            Some(previous) => {
                let previous = previous.clone();
                !self.equivalent(&previous, &env)
            }
            None => true,
        };
        edge_envs.insert((from, to), env);
        if changed {
            queue.push_back(to);
        }
    }

    fn initial_env(&mut self) -> Environment {
        let mut env = Environment::new(&self.ctx);
        let Some(sig) = self.tu.decl(self.func.decl).function_sig().cloned() else {
            return env;
        };
        for param in &sig.params {
            let Some(ty) = self.tu.decl(*param).value_type().cloned() else {
                continue;
            };
            let loc = self.ctx.decl_loc(*param, &ty);
            let v = self.ctx.create_value(&ty);
            env.set_value_at(loc, v);
        }
        if sig.is_member {
            if let Some(receiver) = sig.receiver {
                let smart = match &self.tu.decl(receiver).kind {
                    crate::ast::DeclKind::Record(RecordDecl { smart, .. }) => *smart,
                    _ => None,
                };
                let record_ty = Type::Record(RecordType {
                    decl: receiver,
                    args: Vec::new(),
                    smart,
                    annotation: None,
                });
                env.this_loc = Some(self.ctx.create_loc(&record_ty));
            }
        }
        env
    }

    /// Merge at join points. Values present in only one branch are dropped;
    /// matching values merge per property. The const-method memo does not
    /// survive a true join.
    fn join(&mut self, a: &Environment, b: &Environment) -> Environment {
        let mut merged = Environment::new(&self.ctx);
        merged.flow = self.ctx.formulas.or(a.flow, b.flow);
        merged.this_loc = a.this_loc.or(b.this_loc);

        let locs: Vec<_> = a.values_at.keys().copied().collect();
        for loc in locs {
            let (Some(va), Some(vb)) = (a.value_at(loc), b.value_at(loc)) else {
                continue;
            };
            if va == vb {
                merged.set_value_at(loc, va);
                continue;
            }
            let (val_a, val_b) = (*self.ctx.value(va), *self.ctx.value(vb));
            if same_value(&val_a, &val_b) {
                merged.set_value_at(loc, va);
                continue;
            }
            match (val_a, val_b) {
                (Value::Pointer(pa), Value::Pointer(pb)) => {
                    let v = self.merge_pointers(pa, pb, a, b, &mut merged);
                    merged.set_value_at(loc, v);
                }
                (Value::Bool(x), Value::Bool(y)) => {
                    let v = match self.merge_formulas(Some(x), a, Some(y), b, &mut merged) {
                        Some(f) => self.ctx.add_value(Value::Bool(f)),
                        None => self.ctx.add_value(Value::TopBool),
                    };
                    merged.set_value_at(loc, v);
                }
                (Value::TopBool, Value::Bool(_)) | (Value::Bool(_), Value::TopBool) => {
                    let v = self.ctx.add_value(Value::TopBool);
                    merged.set_value_at(loc, v);
                }
                _ => {}
            }
        }
        merged
    }

    fn merge_pointers(
        &mut self,
        pa: PointerValue,
        pb: PointerValue,
        env_a: &Environment,
        env_b: &Environment,
        merged: &mut Environment,
    ) -> ValueId {
        let pointee = if pa.pointee == pb.pointee {
            pa.pointee
        } else {
            let pointee_ty = self.ctx.loc(pa.pointee).ty().clone();
            self.ctx.create_loc(&pointee_ty)
        };
        let (Some(sa), Some(sb)) = (pa.state, pb.state) else {
            return self.ctx.add_value(Value::Pointer(PointerValue {
                pointee,
                state: None,
            }));
        };

        let v = self.ctx.add_value(Value::Pointer(PointerValue {
            pointee,
            state: None,
        }));
        self.ctx.init_pointer_null_state(v, None);
        let fresh = self.ctx.null_state(v).expect("initialized");

        match self.merge_formulas(sa.from_nullable, env_a, sb.from_nullable, env_b, merged) {
            Some(f) => {
                let eq = self
                    .ctx
                    .formulas
                    .iff(fresh.from_nullable.expect("fresh"), f);
                merged.assume(&mut self.ctx, eq);
            }
            None => self.ctx.forget_from_nullable(v),
        }
        let fresh = self.ctx.null_state(v).expect("initialized");
        match self.merge_formulas(sa.is_null, env_a, sb.is_null, env_b, merged) {
            Some(f) => {
                let eq = self.ctx.formulas.iff(fresh.is_null.expect("fresh"), f);
                merged.assume(&mut self.ctx, eq);
            }
            None => self.ctx.forget_is_null(v),
        }
        v
    }

    /// Merge of one boolean property across a join.
    ///
    /// Identical formulas and agreeing provable literals pass through;
    /// otherwise a fresh atom is tied to either side under its flow
    /// condition. A property that is "top" on either side stays top.
    fn merge_formulas(
        &mut self,
        f1: Option<FormulaId>,
        env1: &Environment,
        f2: Option<FormulaId>,
        env2: &Environment,
        merged: &mut Environment,
    ) -> Option<FormulaId> {
        let (f1, f2) = match (f1, f2) {
            (Some(f1), Some(f2)) => (f1, f2),
            _ => return None,
        };
        if f1 == f2 {
            return Some(f1);
        }
        if env1.proves(&mut self.ctx, f1) && env2.proves(&mut self.ctx, f2) {
            return Some(self.ctx.formulas.literal(true));
        }
        let n1 = self.ctx.formulas.not(f1);
        let n2 = self.ctx.formulas.not(f2);
        if env1.proves(&mut self.ctx, n1) && env2.proves(&mut self.ctx, n2) {
            return Some(self.ctx.formulas.literal(false));
        }

        let m = self.ctx.formulas.fresh();
        let eq1 = self.ctx.formulas.iff(m, f1);
        let side1 = self.ctx.formulas.and(env1.flow, eq1);
        let eq2 = self.ctx.formulas.iff(m, f2);
        let side2 = self.ctx.formulas.and(env2.flow, eq2);
        let either = self.ctx.formulas.or(side1, side2);
        merged.assume(&mut self.ctx, either);
        Some(m)
    }

    /// Widening at loop heads: stable properties are kept, unstable ones go
    /// to "top", and the pointee moves to the canonical top location so the
    /// widened value is itself stable.
    fn widen(&mut self, previous: &Environment, current: Environment) -> Environment {
        let mut out = current;
        let locs: Vec<_> = out.values_at.keys().copied().collect();
        for loc in locs {
            let (Some(vp), Some(vc)) = (previous.value_at(loc), out.value_at(loc)) else {
                continue;
            };
            if vp == vc {
                continue;
            }
            let (val_p, val_c) = (*self.ctx.value(vp), *self.ctx.value(vc));
            if same_value(&val_p, &val_c) {
                out.set_value_at(loc, vp);
                continue;
            }
            match (val_p, val_c) {
                (Value::Pointer(pp), Value::Pointer(pc)) => {
                    let widened = self.widen_pointer(pp, pc, vp, previous, &out);
                    out.set_value_at(loc, widened);
                }
                (Value::Bool(_) | Value::TopBool, Value::Bool(_) | Value::TopBool) => {
                    let v = self.ctx.add_value(Value::TopBool);
                    out.set_value_at(loc, v);
                }
                _ => {}
            }
        }
        out
    }

    fn widen_pointer(
        &mut self,
        pp: PointerValue,
        pc: PointerValue,
        vp: ValueId,
        prev_env: &Environment,
        cur_env: &Environment,
    ) -> ValueId {
        let (sp, sc) = match (pp.state, pc.state) {
            (Some(sp), Some(sc)) => (sp, sc),
            _ => {
                let pointee_ty = self.ctx.loc(pc.pointee).ty().clone();
                let top = self.ctx.top_loc(&pointee_ty);
                return self.ctx.add_value(Value::Pointer(PointerValue {
                    pointee: top,
                    state: None,
                }));
            }
        };

        let from_nullable =
            self.widen_property(sp.from_nullable, prev_env, sc.from_nullable, cur_env);
        let is_null = self.widen_property(sp.is_null, prev_env, sc.is_null, cur_env);

        let pointee_ty = self.ctx.loc(pc.pointee).ty().clone();
        let top = self.ctx.top_loc(&pointee_ty);

        // The previous value may already be the widened form; reusing it
        // keeps the fixed point stable.
        if pp.pointee == top
            && (from_nullable.is_some() || sp.from_nullable.is_none())
            && (is_null.is_some() || sp.is_null.is_none())
        {
            return vp;
        }

        // Stable properties keep their current-iteration formulas; the
        // rest are top.
        self.ctx.add_value(Value::Pointer(PointerValue {
            pointee: top,
            state: Some(PointerNullState {
                from_nullable,
                is_null,
            }),
        }))
    }

    /// A property is stable across iterations when both formulas are
    /// provably the same literal (or identical); otherwise it widens to top.
    fn widen_property(
        &mut self,
        prev: Option<FormulaId>,
        prev_env: &Environment,
        cur: Option<FormulaId>,
        cur_env: &Environment,
    ) -> Option<FormulaId> {
        let (prev, cur) = match (prev, cur) {
            (Some(p), Some(c)) => (p, c),
            _ => return None,
        };
        if prev == cur {
            return Some(cur);
        }
        if prev_env.proves(&mut self.ctx, prev) && cur_env.proves(&mut self.ctx, cur) {
            return Some(cur);
        }
        let np = self.ctx.formulas.not(prev);
        let nc = self.ctx.formulas.not(cur);
        if prev_env.proves(&mut self.ctx, np) && cur_env.proves(&mut self.ctx, nc) {
            return Some(cur);
        }
        None
    }

    /// Environment equivalence for the fixed point: same locations, values
    /// the compare relation considers the same. Flow conditions and
    /// expression scratch state are not compared.
    fn equivalent(&mut self, a: &Environment, b: &Environment) -> bool {
        if a.values_at.len() != b.values_at.len() {
            return false;
        }
        for (loc, va) in &a.values_at {
            let Some(vb) = b.value_at(*loc) else {
                return false;
            };
            if *va == vb {
                continue;
            }
            let (val_a, val_b) = (self.ctx.value(*va), self.ctx.value(vb));
            if !same_value(val_a, val_b) {
                return false;
            }
        }
        true
    }
}

/// Reverse post-order over successors, entry first.
fn reverse_post_order(func: &Function) -> Vec<BlockId> {
    let block_count = func.cfg.blocks.len();
    let mut visited = vec![false; block_count];
    let mut post = Vec::with_capacity(block_count);
    let mut stack: Vec<(BlockId, usize)> = vec![(BlockId(0), 0)];
    visited[0] = true;
    while let Some((block, next)) = stack.pop() {
        let successors = func.cfg.blocks[block.0 as usize].terminator.successors();
        if next < successors.len() {
            stack.push((block, next + 1));
            let succ = successors[next];
            if !visited[succ.0 as usize] {
                visited[succ.0 as usize] = true;
                stack.push((succ, 0));
            }
        } else {
            post.push(block);
        }
    }
    post.reverse();
    post
}
