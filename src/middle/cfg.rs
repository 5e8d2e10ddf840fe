//! Control-flow graphs over resolved bodies. The graph linearizes each body
//! into basic blocks of dataflow-relevant actions (definitions and uses of
//! non-scalar locals, returns) with explicit edges for branches, loop
//! back-edges, `break`, `continue`, and `return`, so the definite-assignment
//! analysis can run a standard worklist over arbitrary control flow.

use crate::{
    frontend::Span,
    index::{IndexVec, simple_index},
    middle::hir::{Body, Expr, ExprKind, LocalId, Place, PlaceBase, Stmt},
};

simple_index! {
    /// Identifies a CFG basic block
    pub struct BlockId;
}

#[derive(Debug)]
pub struct Cfg {
    pub blocks: IndexVec<BlockId, BasicBlock>,
    pub entry: BlockId,
    pub exit: BlockId,
    /// Every definition site in the body, indexed by the ids carried in
    /// [`Action::Define`]
    pub def_sites: Vec<DefSite>,
}

#[derive(Debug, Default)]
pub struct BasicBlock {
    pub actions: Vec<Action>,
    pub successors: Vec<BlockId>,
}

#[derive(Debug, Clone, Copy)]
pub enum Action {
    /// A definition of a non-scalar local (an `Assign`, or a parameter at
    /// entry)
    Define { local: LocalId, site: usize },
    /// A read of a non-scalar local
    Use { local: LocalId, span: Span },
}

#[derive(Debug, Clone, Copy)]
pub struct DefSite {
    pub local: LocalId,
    pub span: Span,
    pub is_parameter: bool,
}

struct Builder<'b> {
    body: &'b Body,
    blocks: IndexVec<BlockId, BasicBlock>,
    def_sites: Vec<DefSite>,
    exit: BlockId,
    current: BlockId,
    /// (advance target for `continue`, after target for `break`)
    loops: Vec<(BlockId, BlockId)>,
}

impl Cfg {
    pub fn build(body: &Body) -> Cfg {
        let mut blocks: IndexVec<BlockId, BasicBlock> = IndexVec::new();
        let entry = blocks.push(BasicBlock::default());
        let exit = blocks.push(BasicBlock::default());

        let mut builder = Builder {
            body,
            blocks,
            def_sites: Vec::new(),
            exit,
            current: entry,
            loops: Vec::new(),
        };

        // Parameters are defined on entry
        for (local, data) in body.locals.enumerate() {
            if data.is_parameter && !data.ty.is_scalar() {
                let site = builder.def_sites.len();
                builder.def_sites.push(DefSite {
                    local,
                    span: data.span,
                    is_parameter: true,
                });
                builder.blocks[entry]
                    .actions
                    .push(Action::Define { local, site });
            }
        }

        builder.lower_statements(&body.statements);

        // Falling off the end of the body reaches the exit
        let last = builder.current;
        builder.edge(last, exit);

        Cfg {
            blocks: builder.blocks,
            entry,
            exit,
            def_sites: builder.def_sites,
        }
    }

    /// Blocks reachable from the entry; unreachable blocks are skipped during
    /// validation
    pub fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.blocks.len()];
        let mut stack = vec![self.entry];

        while let Some(block) = stack.pop() {
            if std::mem::replace(&mut seen[block.0 as usize], true) {
                continue;
            }

            stack.extend(self.blocks[block].successors.iter().copied());
        }

        seen
    }
}

impl<'b> Builder<'b> {
    fn new_block(&mut self) -> BlockId {
        self.blocks.push(BasicBlock::default())
    }

    fn edge(&mut self, from: BlockId, to: BlockId) {
        if !self.blocks[from].successors.contains(&to) {
            self.blocks[from].successors.push(to);
        }
    }

    fn push(&mut self, action: Action) {
        let current = self.current;
        self.blocks[current].actions.push(action);
    }

    fn is_tracked(&self, local: LocalId) -> bool {
        !self.body.locals[local].ty.is_scalar()
    }

    fn lower_statements(&mut self, statements: &[Stmt]) {
        for statement in statements {
            self.lower_statement(statement);
        }
    }

    fn lower_statement(&mut self, statement: &Stmt) {
        match statement {
            Stmt::Assign { local, value, span } => {
                self.expr_uses(value);

                if self.is_tracked(*local) {
                    let site = self.def_sites.len();
                    self.def_sites.push(DefSite {
                        local: *local,
                        span: *span,
                        is_parameter: false,
                    });
                    self.push(Action::Define {
                        local: *local,
                        site,
                    });
                }
            }
            Stmt::CopyInto { target, value, .. } => {
                // copy_from reads the binding and overwrites its storage in
                // place; it is not a definition
                self.place_uses(target);
                self.expr_uses(value);
            }
            Stmt::Store { place, value, .. } => {
                self.place_uses(place);
                self.expr_uses(value);
            }
            Stmt::Export { value, .. } => self.expr_uses(value),
            Stmt::Expr(expr) => self.expr_uses(expr),
            Stmt::Assert { condition, .. } => self.expr_uses(condition),
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.expr_uses(condition);

                let branch_point = self.current;
                let join = self.new_block();

                let then_entry = self.new_block();
                self.edge(branch_point, then_entry);
                self.current = then_entry;
                self.lower_statements(then_branch);
                let then_end = self.current;
                self.edge(then_end, join);

                let else_entry = self.new_block();
                self.edge(branch_point, else_entry);
                self.current = else_entry;
                self.lower_statements(else_branch);
                let else_end = self.current;
                self.edge(else_end, join);

                self.current = join;
            }
            Stmt::While {
                condition,
                body,
                advance,
                else_branch,
                ..
            } => {
                let condition_block = self.new_block();
                let advance_block = self.new_block();
                let after = self.new_block();

                let pred = self.current;
                self.edge(pred, condition_block);

                self.current = condition_block;
                self.expr_uses(condition);

                // Condition false: the no-break exit path runs the else block
                let else_entry = self.new_block();
                self.edge(condition_block, else_entry);
                self.current = else_entry;
                self.lower_statements(else_branch);
                let else_end = self.current;
                self.edge(else_end, after);

                // Condition true: the body, then the advance, then back
                let body_entry = self.new_block();
                self.edge(condition_block, body_entry);
                self.current = body_entry;
                self.loops.push((advance_block, after));
                self.lower_statements(body);
                self.loops.pop();
                let body_end = self.current;
                self.edge(body_end, advance_block);

                self.current = advance_block;
                self.lower_statements(advance);
                let advance_end = self.current;
                self.edge(advance_end, condition_block);

                self.current = after;
            }
            Stmt::Break(_) => {
                let (_, after) = *self
                    .loops
                    .last()
                    .expect("break outside of a loop survived specialization");
                let current = self.current;
                self.edge(current, after);

                // Whatever follows is unreachable until the next join
                self.current = self.new_block();
            }
            Stmt::Continue(_) => {
                let (advance, _) = *self
                    .loops
                    .last()
                    .expect("continue outside of a loop survived specialization");
                let current = self.current;
                self.edge(current, advance);

                self.current = self.new_block();
            }
            Stmt::Return { value, .. } => {
                if let Some(value) = value {
                    self.expr_uses(value);
                }

                let current = self.current;
                let exit = self.exit;
                self.edge(current, exit);

                self.current = self.new_block();
            }
        }
    }

    fn expr_uses(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Const(_) | ExprKind::Zero => {}
            ExprKind::ReadLocal(local) => {
                if self.is_tracked(*local) {
                    self.push(Action::Use {
                        local: *local,
                        span: expr.span,
                    });
                }
            }
            ExprKind::ReadPlace(place) => self.place_uses(place),
            ExprKind::Unary { operand, .. } => self.expr_uses(operand),
            ExprKind::Binary { lhs, rhs, .. } | ExprKind::Logical { lhs, rhs, .. } => {
                self.expr_uses(lhs);
                self.expr_uses(rhs);
            }
            ExprKind::Intrinsic { arguments, .. } | ExprKind::Call { arguments, .. } => {
                for argument in arguments {
                    self.expr_uses(argument);
                }
            }
            ExprKind::MakeRecord { fields } => {
                for field in fields {
                    self.expr_uses(field);
                }
            }
            ExprKind::MakeArray { elements } => {
                for element in elements {
                    self.expr_uses(element);
                }
            }
        }
    }

    fn place_uses(&mut self, place: &Place) {
        if let PlaceBase::Local(local) = place.base
            && self.is_tracked(local)
        {
            let span = place
                .dynamic
                .as_ref()
                .map(|d| d.span)
                .unwrap_or(self.body.locals[local].span);

            self.push(Action::Use { local, span });
        }

        if let Some(dynamic) = &place.dynamic {
            self.expr_uses(dynamic);
        }
    }
}
