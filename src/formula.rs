use std::collections::{BTreeMap, BTreeSet};

/// Boolean variable allocated by the arena.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Atom(pub u32);

/// Handle to a formula node. Literals and atom references are interned, so
/// handle equality is identity in the sense the analysis relies on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FormulaId(u32);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FormulaKind {
    True,
    False,
    Atom(Atom),
    Not(FormulaId),
    And(FormulaId, FormulaId),
    Or(FormulaId, FormulaId),
    Implies(FormulaId, FormulaId),
    Iff(FormulaId, FormulaId),
}

/// Arena of boolean formulas with constant folding on construction.
#[derive(Clone, Debug)]
pub struct FormulaArena {
    nodes: Vec<FormulaKind>,
    atom_refs: BTreeMap<Atom, FormulaId>,
    next_atom: u32,
}

const TRUE_ID: FormulaId = FormulaId(0);
const FALSE_ID: FormulaId = FormulaId(1);

impl Default for FormulaArena {
    fn default() -> Self {
        Self::new()
    }
}

impl FormulaArena {
    pub fn new() -> Self {
        Self {
            nodes: vec![FormulaKind::True, FormulaKind::False],
            atom_refs: BTreeMap::new(),
            next_atom: 0,
        }
    }

    pub fn literal(&self, value: bool) -> FormulaId {
        if value {
            TRUE_ID
        } else {
            FALSE_ID
        }
    }

    pub fn is_literal(&self, f: FormulaId, value: bool) -> bool {
        f == self.literal(value)
    }

    pub fn make_atom(&mut self) -> Atom {
        let atom = Atom(self.next_atom);
        self.next_atom += 1;
        atom
    }

    pub fn atom_ref(&mut self, atom: Atom) -> FormulaId {
        if let Some(id) = self.atom_refs.get(&atom) {
            return *id;
        }
        let id = self.push(FormulaKind::Atom(atom));
        self.atom_refs.insert(atom, id);
        id
    }

    /// Fresh atom wrapped in a formula reference.
    pub fn fresh(&mut self) -> FormulaId {
        let atom = self.make_atom();
        self.atom_ref(atom)
    }

    pub fn kind(&self, f: FormulaId) -> FormulaKind {
        self.nodes[f.0 as usize]
    }

    pub fn not(&mut self, f: FormulaId) -> FormulaId {
        match self.kind(f) {
            FormulaKind::True => FALSE_ID,
            FormulaKind::False => TRUE_ID,
            FormulaKind::Not(inner) => inner,
            _ => self.push(FormulaKind::Not(f)),
        }
    }

    pub fn and(&mut self, a: FormulaId, b: FormulaId) -> FormulaId {
        if a == TRUE_ID || a == b {
            return b;
        }
        if b == TRUE_ID {
            return a;
        }
        if a == FALSE_ID || b == FALSE_ID {
            return FALSE_ID;
        }
        self.push(FormulaKind::And(a, b))
    }

    pub fn or(&mut self, a: FormulaId, b: FormulaId) -> FormulaId {
        if a == FALSE_ID || a == b {
            return b;
        }
        if b == FALSE_ID {
            return a;
        }
        if a == TRUE_ID || b == TRUE_ID {
            return TRUE_ID;
        }
        self.push(FormulaKind::Or(a, b))
    }

    pub fn implies(&mut self, a: FormulaId, b: FormulaId) -> FormulaId {
        if a == TRUE_ID {
            return b;
        }
        if a == FALSE_ID || b == TRUE_ID || a == b {
            return TRUE_ID;
        }
        if b == FALSE_ID {
            return self.not(a);
        }
        self.push(FormulaKind::Implies(a, b))
    }

    pub fn iff(&mut self, a: FormulaId, b: FormulaId) -> FormulaId {
        if a == b {
            return TRUE_ID;
        }
        if a == TRUE_ID {
            return b;
        }
        if b == TRUE_ID {
            return a;
        }
        if a == FALSE_ID {
            return self.not(b);
        }
        if b == FALSE_ID {
            return self.not(a);
        }
        self.push(FormulaKind::Iff(a, b))
    }

    /// Collects the atoms a formula mentions.
    pub fn atoms_of(&self, f: FormulaId, out: &mut BTreeSet<Atom>) {
        match self.kind(f) {
            FormulaKind::True | FormulaKind::False => {}
            FormulaKind::Atom(a) => {
                out.insert(a);
            }
            FormulaKind::Not(x) => self.atoms_of(x, out),
            FormulaKind::And(a, b)
            | FormulaKind::Or(a, b)
            | FormulaKind::Implies(a, b)
            | FormulaKind::Iff(a, b) => {
                self.atoms_of(a, out);
                self.atoms_of(b, out);
            }
        }
    }

    /// Partial evaluation under an assignment; `None` when undetermined.
    pub fn eval(&self, f: FormulaId, assignment: &BTreeMap<Atom, bool>) -> Option<bool> {
        match self.kind(f) {
            FormulaKind::True => Some(true),
            FormulaKind::False => Some(false),
            FormulaKind::Atom(a) => assignment.get(&a).copied(),
            FormulaKind::Not(x) => self.eval(x, assignment).map(|v| !v),
            FormulaKind::And(a, b) => match (self.eval(a, assignment), self.eval(b, assignment)) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            FormulaKind::Or(a, b) => match (self.eval(a, assignment), self.eval(b, assignment)) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
            FormulaKind::Implies(a, b) => {
                match (self.eval(a, assignment), self.eval(b, assignment)) {
                    (Some(false), _) | (_, Some(true)) => Some(true),
                    (Some(true), Some(false)) => Some(false),
                    _ => None,
                }
            }
            FormulaKind::Iff(a, b) => match (self.eval(a, assignment), self.eval(b, assignment)) {
                (Some(x), Some(y)) => Some(x == y),
                _ => None,
            },
        }
    }

    fn push(&mut self, kind: FormulaKind) -> FormulaId {
        let id = FormulaId(self.nodes.len() as u32);
        self.nodes.push(kind);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_are_interned() {
        let arena = FormulaArena::new();
        assert_eq!(arena.literal(true), arena.literal(true));
        assert_ne!(arena.literal(true), arena.literal(false));
    }

    #[test]
    fn atom_refs_are_interned() {
        let mut arena = FormulaArena::new();
        let a = arena.make_atom();
        assert_eq!(arena.atom_ref(a), arena.atom_ref(a));
        let b = arena.make_atom();
        assert_ne!(arena.atom_ref(a), arena.atom_ref(b));
    }

    #[test]
    fn connectives_fold_literals() {
        let mut arena = FormulaArena::new();
        let t = arena.literal(true);
        let f = arena.literal(false);
        let a = arena.fresh();

        assert_eq!(arena.and(t, a), a);
        assert_eq!(arena.and(f, a), f);
        assert_eq!(arena.or(f, a), a);
        assert_eq!(arena.or(t, a), t);
        assert_eq!(arena.implies(a, a), t);
        assert_eq!(arena.iff(a, a), t);
        let na = arena.not(a);
        assert_eq!(arena.not(na), a);
    }

    #[test]
    fn eval_is_partial() {
        let mut arena = FormulaArena::new();
        let a = arena.make_atom();
        let b = arena.make_atom();
        let fa = arena.atom_ref(a);
        let fb = arena.atom_ref(b);
        let conj = arena.and(fa, fb);

        let mut assignment = BTreeMap::new();
        assert_eq!(arena.eval(conj, &assignment), None);
        assignment.insert(a, false);
        assert_eq!(arena.eval(conj, &assignment), Some(false));
        assignment.insert(a, true);
        assert_eq!(arena.eval(conj, &assignment), None);
        assignment.insert(b, true);
        assert_eq!(arena.eval(conj, &assignment), Some(true));
    }
}
