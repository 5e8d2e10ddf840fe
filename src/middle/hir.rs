//! The resolved intermediate representation. Specialization turns each
//! (callback, function instance) AST body into one of these: every expression
//! is typed, every branch that could be proven dead is already gone, generic
//! calls are resolved to concrete instances, and storage accesses are reduced
//! to (block, offset, dynamic-index) places. Definite assignment and code
//! generation both run over this form.

use crate::{
    backend::{blocks::Block, ops::Op},
    frontend::{
        Span,
        ast::{BinaryOperatorKind, UnaryOperatorKind},
        intern::InternedSymbol,
    },
    index::{IndexVec, simple_index},
    middle::ty::Type,
};

simple_index! {
    /// Identifies a local variable within one [`Body`]
    pub struct LocalId;
}

simple_index! {
    /// Identifies a specialized function instance within a compilation unit
    pub struct InstanceId;
}

#[derive(Debug)]
pub struct Body {
    pub locals: IndexVec<LocalId, Local>,
    pub statements: Vec<Stmt>,
    pub return_type: Type,
    pub span: Span,
}

#[derive(Debug)]
pub struct Local {
    pub name: InternedSymbol,
    pub ty: Type,
    pub span: Span,
    pub is_parameter: bool,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    /// A definition site of a local: `let x = e` or `x = e`. For non-scalar
    /// locals this binds the name to the storage produced by the value; it is
    /// the unit the single-live-definition rule counts.
    Assign {
        local: LocalId,
        value: Expr,
        span: Span,
    },
    /// `target.copy_from(value)` — an in-place overwrite of existing storage.
    /// Never a definition.
    CopyInto {
        target: Place,
        value: Expr,
        span: Span,
    },
    /// A scalar write through a place (`self.y = e`, `xs[i] = e`, `G.combo = e`)
    Store {
        place: Place,
        value: Expr,
        span: Span,
    },
    /// A write to an exported field; reaches the paired mode, never memory
    Export {
        key: u32,
        value: Expr,
        span: Span,
    },
    /// An expression evaluated for its effects
    Expr(Expr),
    If {
        condition: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Vec<Stmt>,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
        /// Runs after the body and on `continue`, before the condition is
        /// re-tested (loop-variable increments, condition support code)
        advance: Vec<Stmt>,
        /// Runs when the loop exits without `break`
        else_branch: Vec<Stmt>,
        span: Span,
    },
    Break(Span),
    Continue(Span),
    Return {
        value: Option<Expr>,
        span: Span,
    },
    Assert {
        condition: Expr,
        span: Span,
    },
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub ty: Type,
    pub span: Span,
    pub kind: ExprKind,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Const(f64),
    /// Read of a local; for aggregates this resolves to the storage of the
    /// local's single reaching definition
    ReadLocal(LocalId),
    /// Read through a computed place
    ReadPlace(Place),
    Unary {
        operator: UnaryOperatorKind,
        operand: Box<Expr>,
    },
    Binary {
        operator: BinaryOperatorKind,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Short-circuiting `and`/`or` whose condition did not fold
    Logical {
        is_and: bool,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// A direct engine op application (builtins, stream access, spawn, ...)
    Intrinsic {
        op: Op,
        arguments: Vec<Expr>,
    },
    /// A call to a specialized function instance. Non-scalar-returning
    /// instances are inlined at code generation; scalar ones share subgraphs
    /// through node deduplication.
    Call {
        instance: InstanceId,
        arguments: Vec<Expr>,
    },
    /// Constructor producing a fresh aggregate; `ty` names the record type
    MakeRecord {
        fields: Vec<Expr>,
    },
    /// `array(...)` constructor
    MakeArray {
        elements: Vec<Expr>,
    },
    /// The zero-initialized default value of `ty`
    Zero,
}

impl Expr {
    pub fn as_const(&self) -> Option<f64> {
        match self.kind {
            ExprKind::Const(value) => Some(value),
            _ => None,
        }
    }

    /// Whether evaluating this expression can observe or change runtime state
    pub fn has_side_effects(&self) -> bool {
        match &self.kind {
            ExprKind::Const(_) | ExprKind::Zero => false,
            ExprKind::ReadLocal(_) | ExprKind::ReadPlace(_) => false,
            ExprKind::Unary { operand, .. } => operand.has_side_effects(),
            ExprKind::Binary { lhs, rhs, .. } | ExprKind::Logical { lhs, rhs, .. } => {
                lhs.has_side_effects() || rhs.has_side_effects()
            }
            ExprKind::Intrinsic { op, arguments } => {
                op.has_side_effects() || arguments.iter().any(Expr::has_side_effects)
            }
            // Conservative: the instance body may have effects
            ExprKind::Call { .. } => true,
            ExprKind::MakeRecord { fields } => fields.iter().any(Expr::has_side_effects),
            ExprKind::MakeArray { elements } => elements.iter().any(Expr::has_side_effects),
        }
    }
}

/// A storage location: a base plus a constant cell offset and an optional
/// dynamic index expression. The final cell address is
/// `base + offset + dynamic`.
#[derive(Debug, Clone)]
pub struct Place {
    pub ty: Type,
    pub base: PlaceBase,
    pub offset: u32,
    pub dynamic: Option<Box<Expr>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceBase {
    /// Storage backing a local variable, assigned by the code generator
    Local(LocalId),
    /// A runtime block of the mode being compiled
    Block(Block),
    /// An exported field; write-only, addressed by key rather than memory
    ExportKey(u32),
}

impl Place {
    pub fn local(local: LocalId, ty: Type) -> Place {
        Place {
            ty,
            base: PlaceBase::Local(local),
            offset: 0,
            dynamic: None,
        }
    }

    pub fn block(block: Block, offset: u32, ty: Type) -> Place {
        Place {
            ty,
            base: PlaceBase::Block(block),
            offset,
            dynamic: None,
        }
    }
}
