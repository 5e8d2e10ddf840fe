use crate::frontend::{Span, intern::InternedSymbol};

#[derive(Debug)]
pub struct Module {
    /// Top level items in the module
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

#[derive(Debug)]
pub struct Item {
    pub id: NodeId,
    pub span: Span,
    pub kind: ItemKind,
}

#[derive(Debug)]
pub enum ItemKind {
    FunctionDefinition(Box<FunctionDefinition>),
    RecordDefinition(Box<RecordDefinition>),
    ArchetypeDefinition(Box<ArchetypeDefinition>),
    LevelGlobalDefinition(Box<LevelGlobalDefinition>),
    StreamsDefinition(Box<StreamsDefinition>),
}

#[derive(Debug)]
pub struct FunctionDefinition {
    pub id: NodeId,
    pub span: Span,
    pub name: Identifier,
    /// Parameters carry no type annotations; types are inferred per call site
    pub parameters: Vec<Identifier>,
    pub body: Block,
}

impl FunctionDefinition {
    /// Whether this is a method (declared inside a record or archetype with a
    /// leading `self` parameter)
    pub fn has_self_parameter(&self) -> bool {
        self.parameters
            .first()
            .is_some_and(|p| p.symbol.value() == "self")
    }
}

#[derive(Debug)]
pub struct RecordDefinition {
    pub id: NodeId,
    pub span: Span,
    pub name: Identifier,
    pub type_parameters: Vec<Identifier>,
    pub fields: Vec<FieldDefinition>,
    pub methods: Vec<FunctionDefinition>,
}

#[derive(Debug)]
pub struct FieldDefinition {
    pub id: NodeId,
    pub span: Span,
    pub name: Identifier,
    pub ty: Type,
}

#[derive(Debug)]
pub struct ArchetypeDefinition {
    pub id: NodeId,
    pub span: Span,
    pub name: Identifier,
    pub fields: Vec<ArchetypeFieldDefinition>,
    pub callbacks: Vec<FunctionDefinition>,
}

#[derive(Debug)]
pub struct ArchetypeFieldDefinition {
    pub id: NodeId,
    pub span: Span,
    pub storage: StorageClass,
    pub name: Identifier,
    pub ty: Type,
}

/// The storage class of an archetype field, as written in the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageClass {
    /// Loaded from level data; written during preprocess only
    Imported,
    /// Write-only judgment/result channel, read by the paired watch mode
    Exported,
    /// Derived per-entity constants; written during preprocess only
    EntityData,
    /// Private scratch of the owning entity
    EntityMemory,
    /// Visible to other entities; writable in sequential callbacks only
    SharedMemory,
}

impl core::fmt::Display for StorageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StorageClass::Imported => "imported",
            StorageClass::Exported => "exported",
            StorageClass::EntityData => "data",
            StorageClass::EntityMemory => "memory",
            StorageClass::SharedMemory => "shared",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelGlobalKind {
    /// `level_memory`: mutable in sequential callbacks, readable anywhere
    Memory,
    /// `level_data`: mutable during preprocess only, readable anywhere
    Data,
}

#[derive(Debug)]
pub struct LevelGlobalDefinition {
    pub id: NodeId,
    pub span: Span,
    pub kind: LevelGlobalKind,
    pub name: Identifier,
    pub fields: Vec<FieldDefinition>,
}

#[derive(Debug)]
pub struct StreamsDefinition {
    pub id: NodeId,
    pub span: Span,
    pub name: Identifier,
    pub entries: Vec<StreamEntry>,
}

#[derive(Debug)]
pub struct StreamEntry {
    pub id: NodeId,
    pub span: Span,
    pub name: Identifier,
    pub element: Type,
    pub capacity: Box<Expression>,
}

#[derive(Debug)]
pub struct Type {
    pub id: NodeId,
    pub span: Span,
    pub kind: TypeKind,
}

#[derive(Debug)]
pub enum TypeKind {
    /// `Scalar`, `Pair`, or a type parameter in scope
    Named(Identifier),
    /// `Pair[Scalar, [Scalar; 4]]`
    Generic {
        name: Identifier,
        arguments: Vec<Type>,
    },
    /// `[T; N]` where N must be a compile-time integer constant
    Array {
        element: Box<Type>,
        length: Box<Expression>,
    },
}

#[derive(Debug, Clone)]
pub struct Identifier {
    pub id: NodeId,
    pub span: Span,
    pub symbol: InternedSymbol,
}

#[derive(Debug)]
pub struct Block {
    pub id: NodeId,
    pub span: Span,
    pub statements: Vec<Statement>,
}

#[derive(Debug)]
pub struct Statement {
    pub id: NodeId,
    pub span: Span,
    pub kind: StatementKind,
}

#[derive(Debug)]
pub enum StatementKind {
    /// `let x = e;`
    Let {
        name: Identifier,
        value: Box<Expression>,
    },
    /// `x = e;`, `x.f += e;`, `x[i] = e;`
    Assign {
        target: Box<Expression>,
        operator: AssignmentOperator,
        value: Box<Expression>,
    },
    /// An expression evaluated for its effects
    Expression(Box<Expression>),
    If(Box<IfStatement>),
    While(Box<WhileStatement>),
    For(Box<ForStatement>),
    Match(Box<MatchStatement>),
    Break,
    Continue,
    Return(Option<Box<Expression>>),
    Assert(Box<Expression>),
    /// `pass;`
    Empty,
}

#[derive(Debug)]
pub struct IfStatement {
    pub condition: Box<Expression>,
    pub then_block: Block,
    /// For `else if`, a block containing a single nested `If`
    pub else_block: Option<Block>,
}

#[derive(Debug)]
pub struct WhileStatement {
    pub condition: Box<Expression>,
    pub body: Block,
    /// Runs when the loop exits without `break`
    pub else_block: Option<Block>,
}

#[derive(Debug)]
pub struct ForStatement {
    pub binding: Identifier,
    pub iterable: Box<Expression>,
    pub body: Block,
    pub else_block: Option<Block>,
}

#[derive(Debug)]
pub struct MatchStatement {
    pub subject: Box<Expression>,
    pub arms: Vec<MatchArm>,
}

#[derive(Debug)]
pub struct MatchArm {
    pub span: Span,
    pub pattern: Pattern,
    pub guard: Option<Box<Expression>>,
    pub body: Block,
}

#[derive(Debug)]
pub struct Pattern {
    pub id: NodeId,
    pub span: Span,
    pub kind: PatternKind,
}

#[derive(Debug)]
pub enum PatternKind {
    /// `_`
    Wildcard,
    /// `1.5`, `true`, `none`
    Literal(Literal),
    /// `name` — binds the subject in the arm body
    Binding(Identifier),
    /// `Pair(first, second)` — a type test plus field sub-patterns
    Record {
        name: Identifier,
        fields: Vec<Pattern>,
    },
}

#[derive(Debug)]
pub struct Expression {
    pub id: NodeId,
    pub span: Span,
    pub kind: ExpressionKind,
}

#[derive(Debug)]
pub enum ExpressionKind {
    Literal(Literal),
    Identifier(Identifier),
    Unary {
        operator: UnaryOperator,
        operand: Box<Expression>,
    },
    Binary {
        operator: BinaryOperator,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    /// `and` / `or`, short-circuiting
    Logical {
        operator: LogicalOperator,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    /// `x is none` / `x is not none`
    IsNone {
        operand: Box<Expression>,
        negated: bool,
    },
    Call {
        callee: Box<Expression>,
        arguments: Vec<Expression>,
    },
    Field {
        object: Box<Expression>,
        field: Identifier,
    },
    /// Value indexing, and also `Name[Args]` generic instantiation (the two
    /// are disambiguated once the object's compile-time kind is known)
    Index {
        object: Box<Expression>,
        index: Box<Expression>,
    },
    Tuple(Vec<Expression>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    Number(f64),
    Boolean(bool),
    None,
}

#[derive(Debug, Clone, Copy)]
pub struct UnaryOperator {
    pub span: Span,
    pub kind: UnaryOperatorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperatorKind {
    /// `-x`
    Negate,
    /// `not x`
    Not,
}

#[derive(Debug, Clone, Copy)]
pub struct BinaryOperator {
    pub span: Span,
    pub kind: BinaryOperatorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperatorKind {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulus,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl BinaryOperatorKind {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::Equal
                | Self::NotEqual
                | Self::LessThan
                | Self::LessThanOrEqual
                | Self::GreaterThan
                | Self::GreaterThanOrEqual
        )
    }

    /// The record method name that implements this operator, if operator
    /// methods are allowed for it
    pub fn method_name(&self) -> Option<&'static str> {
        match self {
            Self::Add => Some("add"),
            Self::Subtract => Some("sub"),
            Self::Multiply => Some("mul"),
            Self::Divide => Some("div"),
            Self::Modulus => Some("rem"),
            Self::Equal | Self::NotEqual => Some("eq"),
            Self::LessThan | Self::GreaterThan => Some("lt"),
            Self::LessThanOrEqual | Self::GreaterThanOrEqual => None,
        }
    }
}

impl core::fmt::Display for BinaryOperatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Modulus => "%",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy)]
pub struct AssignmentOperator {
    pub span: Span,
    pub kind: AssignmentOperatorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentOperatorKind {
    /// `=`
    Assign,
    /// `+=` and friends; `a op= b` behaves as `a = a op b`, except that on
    /// records it is the derived in-place variant of the operator method
    Compound(BinaryOperatorKind),
}
