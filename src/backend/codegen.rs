//! Node-graph code generation. Each resolved callback body lowers to one
//! root node: statements become `Execute`/`Block` sequences, loops become
//! `While` nodes, and `break`/`continue`/`return` become `Break` markers
//! counting enclosing scopes (loop-body block, loop, function block). Every
//! call is flattened into the graph — the target has no call stack — with
//! scalar results passed through temporary cells and aggregate results
//! resolved to the callee's single return storage.

use hashbrown::HashMap;

use crate::{
    CompileOptions,
    backend::{
        blocks::Block,
        node::NodeTable,
        ops::Op,
    },
    diagnostics::{CompileResult, Diagnostic},
    frontend::{Span, ast::{BinaryOperatorKind, UnaryOperatorKind}},
    index::IndexVec,
    middle::{
        hir::{Body, Expr, ExprKind, InstanceId, LocalId, Place, PlaceBase, Stmt},
        specialize::{FunctionInstance, UnitCtx},
    },
};

pub struct Codegen<'a> {
    unit: UnitCtx<'a>,
    instances: &'a IndexVec<InstanceId, FunctionInstance>,
    nodes: &'a mut NodeTable,
    options: &'a CompileOptions,
    /// Bump allocator into the temporary memory block, reset per callback
    temp_top: u32,
    scopes: Vec<Scope>,
}

/// Runtime break scopes currently open. The emitted structure guarantees one
/// runtime scope per entry: a function body is a `Block`, a loop is a
/// `While`, a loop body is a `Block`.
enum Scope {
    Function { result: Option<u32> },
    Loop { broke_flag: Option<u32> },
    LoopBody,
}

#[derive(Default)]
struct Frame {
    slots: HashMap<LocalId, LocalSlot>,
    /// Where the single aggregate return of this body resolved to
    return_place: Option<ResolvedPlace>,
}

#[derive(Clone)]
enum LocalSlot {
    /// Storage in the temporary memory block
    Temp { offset: u32 },
    /// The local is a binding over existing storage
    Alias(ResolvedPlace),
}

/// A fully resolved storage address: block, constant offset, and an optional
/// dynamic index node re-evaluated at each reference
#[derive(Clone)]
struct ResolvedPlace {
    block: Block,
    offset: u32,
    dynamic: Option<usize>,
}

impl ResolvedPlace {
    /// Returns a copy of this place with its constant offset advanced by `extra`
    fn at_offset(&self, extra: u32) -> ResolvedPlace {
        ResolvedPlace {
            block: self.block,
            offset: self.offset + extra,
            dynamic: self.dynamic,
        }
    }
}

/// The value produced by an inlined call
enum CallValue {
    None,
    Scalar(usize),
    Aggregate(ResolvedPlace),
}

impl<'a> Codegen<'a> {
    pub fn new(
        unit: UnitCtx<'a>,
        instances: &'a IndexVec<InstanceId, FunctionInstance>,
        nodes: &'a mut NodeTable,
        options: &'a CompileOptions,
    ) -> Self {
        Self {
            unit,
            instances,
            nodes,
            options,
            temp_top: 0,
            scopes: Vec::new(),
        }
    }

    /// Lowers one callback body to its root node index
    pub fn lower_callback(&mut self, body: &Body) -> CompileResult<usize> {
        self.temp_top = 0;
        self.scopes.clear();

        let mut frame = Frame::default();

        let result = if body.return_type.is_scalar() {
            Some(self.alloc_temp(1))
        } else {
            None
        };

        self.scopes.push(Scope::Function { result });
        let statements = self.lower_statements(&mut frame, &body.statements)?;
        self.scopes.pop();

        let block = self.nodes.function(Op::Block, statements);

        Ok(match result {
            Some(cell) => {
                let value = self.read_temp(cell);
                self.nodes.function(Op::Execute, vec![block, value])
            }
            None => block,
        })
    }

    fn lower_statements(
        &mut self,
        frame: &mut Frame,
        statements: &[Stmt],
    ) -> CompileResult<Vec<usize>> {
        let mut nodes = Vec::with_capacity(statements.len());

        for statement in statements {
            if let Some(node) = self.lower_statement(frame, statement)? {
                nodes.push(node);
            }
        }

        Ok(nodes)
    }

    fn lower_statement(
        &mut self,
        frame: &mut Frame,
        statement: &Stmt,
    ) -> CompileResult<Option<usize>> {
        match statement {
            Stmt::Assign { local, value, span } => self.lower_assign(frame, *local, value, *span),
            Stmt::CopyInto { target, value, span } => {
                let target = self.resolve_place(frame, target)?;
                Ok(Some(self.write_into(frame, &target, value, *span)?))
            }
            Stmt::Store { place, value, span } => {
                let value = self.expr_value(frame, value)?;
                let place = self.resolve_place(frame, place)?;

                Ok(Some(self.write_cell(&place, 0, value, *span)?))
            }
            Stmt::Export { key, value, .. } => {
                let key = self.nodes.value(*key as f64);
                let value = self.expr_value(frame, value)?;

                Ok(Some(self.nodes.function(Op::ExportValue, vec![key, value])))
            }
            Stmt::Expr(expr) => self.lower_expr_statement(frame, expr),
            Stmt::Assert { condition, span } => self.lower_assert(frame, condition, *span),
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let condition = self.expr_value(frame, condition)?;

                let then_nodes = self.lower_statements(frame, then_branch)?;
                let then_node = self.nodes.function(Op::Execute, then_nodes);

                if else_branch.is_empty() {
                    return Ok(Some(
                        self.nodes.function(Op::If, vec![condition, then_node]),
                    ));
                }

                let else_nodes = self.lower_statements(frame, else_branch)?;
                let else_node = self.nodes.function(Op::Execute, else_nodes);

                Ok(Some(self.nodes.function(
                    Op::If,
                    vec![condition, then_node, else_node],
                )))
            }
            Stmt::While {
                condition,
                body,
                advance,
                else_branch,
                ..
            } => self.lower_while(frame, condition, body, advance, else_branch),
            Stmt::Break(_) => {
                let (levels, broke_flag) = self.levels_to_loop();

                let break_node = self.break_node(levels);

                Ok(Some(match broke_flag {
                    Some(flag) => {
                        let one = self.nodes.value(1.0);
                        let set = self.write_temp(flag, one);
                        self.nodes.function(Op::Execute, vec![set, break_node])
                    }
                    None => break_node,
                }))
            }
            Stmt::Continue(_) => {
                let levels = self.levels_to(|scope| matches!(scope, Scope::LoopBody));
                Ok(Some(self.break_node(levels)))
            }
            Stmt::Return { value, span } => self.lower_return(frame, value.as_ref(), *span),
        }
    }

    fn lower_assign(
        &mut self,
        frame: &mut Frame,
        local: LocalId,
        value: &Expr,
        span: Span,
    ) -> CompileResult<Option<usize>> {
        if value.ty.is_scalar() {
            let value_node = self.expr_value(frame, value)?;

            let offset = match frame.slots.get(&local) {
                Some(LocalSlot::Temp { offset }) => *offset,
                Some(LocalSlot::Alias(_)) => {
                    return Err(Diagnostic::internal(
                        "scalar local rebound over an alias slot",
                    ));
                }
                None => {
                    let offset = self.alloc_temp(1);
                    frame.slots.insert(local, LocalSlot::Temp { offset });
                    offset
                }
            };

            return Ok(Some(self.write_temp(offset, value_node)));
        }

        // Aggregate assignment binds the local to storage: existing storage
        // for place reads, fresh storage for constructed values
        match &value.kind {
            ExprKind::ReadPlace(place) => {
                let resolved = self.resolve_place(frame, place)?;
                frame.slots.insert(local, LocalSlot::Alias(resolved));

                Ok(None)
            }
            ExprKind::ReadLocal(source) => {
                let resolved = self.resolve_place(
                    frame,
                    &Place::local(*source, value.ty.clone()),
                )?;
                frame.slots.insert(local, LocalSlot::Alias(resolved));

                Ok(None)
            }
            ExprKind::Call { instance, arguments } => {
                // The call result is the callee's return storage; the local
                // binds to it directly
                let (effect, call_value) =
                    self.inline_call(frame, *instance, arguments, span)?;

                let CallValue::Aggregate(place) = call_value else {
                    return Err(Diagnostic::internal(
                        "scalar call lowered in an aggregate binding",
                    ));
                };

                frame.slots.insert(local, LocalSlot::Alias(place));

                Ok(Some(effect))
            }
            _ => {
                let size = self.unit.types.size_of(&value.ty, span)?;
                let offset = self.alloc_temp(size);
                let place = ResolvedPlace {
                    block: Block::TemporaryMemory,
                    offset,
                    dynamic: None,
                };

                let node = self.write_into(frame, &place, value, span)?;
                frame.slots.insert(local, LocalSlot::Alias(place));

                Ok(Some(node))
            }
        }
    }

    fn lower_while(
        &mut self,
        frame: &mut Frame,
        condition: &Expr,
        body: &[Stmt],
        advance: &[Stmt],
        else_branch: &[Stmt],
    ) -> CompileResult<Option<usize>> {
        let broke_flag = if else_branch.is_empty() {
            None
        } else {
            Some(self.alloc_temp(1))
        };

        let mut sequence = Vec::new();

        if let Some(flag) = broke_flag {
            let zero = self.nodes.value(0.0);
            sequence.push(self.write_temp(flag, zero));
        }

        self.scopes.push(Scope::Loop { broke_flag });

        let condition = self.expr_value(frame, condition)?;

        self.scopes.push(Scope::LoopBody);
        let body_nodes = self.lower_statements(frame, body);
        self.scopes.pop();
        let body_nodes = body_nodes?;

        let body_block = self.nodes.function(Op::Block, body_nodes);

        let advance_nodes = self.lower_statements(frame, advance)?;

        let loop_body = if advance_nodes.is_empty() {
            body_block
        } else {
            let mut args = vec![body_block];
            args.extend(advance_nodes);
            self.nodes.function(Op::Execute, args)
        };

        self.scopes.pop();

        sequence.push(self.nodes.function(Op::While, vec![condition, loop_body]));

        if let Some(flag) = broke_flag {
            let flag_value = self.read_temp(flag);
            let not_broken = self.nodes.function(Op::Not, vec![flag_value]);

            let else_nodes = self.lower_statements(frame, else_branch)?;
            let else_node = self.nodes.function(Op::Execute, else_nodes);

            sequence.push(self.nodes.function(Op::If, vec![not_broken, else_node]));
        }

        Ok(Some(if sequence.len() == 1 {
            sequence.pop().expect("one element")
        } else {
            self.nodes.function(Op::Execute, sequence)
        }))
    }

    fn lower_return(
        &mut self,
        frame: &mut Frame,
        value: Option<&Expr>,
        span: Span,
    ) -> CompileResult<Option<usize>> {
        match value {
            None => {
                let levels = self.levels_to(|scope| matches!(scope, Scope::Function { .. }));
                Ok(Some(self.break_node(levels)))
            }
            Some(expr) if expr.ty.is_scalar() => {
                let value_node = self.expr_value(frame, expr)?;

                let result = self
                    .scopes
                    .iter()
                    .rev()
                    .find_map(|scope| match scope {
                        Scope::Function { result } => Some(*result),
                        _ => None,
                    })
                    .flatten()
                    .ok_or_else(|| {
                        Diagnostic::internal("scalar return without a result cell")
                    })?;

                let set = self.write_temp(result, value_node);
                let levels = self.levels_to(|scope| matches!(scope, Scope::Function { .. }));
                let break_node = self.break_node(levels);

                Ok(Some(self.nodes.function(Op::Execute, vec![set, break_node])))
            }
            Some(expr) => {
                // Definite assignment guaranteed this is the body's single
                // unconditional exit; the produced storage becomes the call
                // result
                let (effect, place) = self.expr_place(frame, expr, span)?;
                frame.return_place = Some(place);

                Ok(effect)
            }
        }
    }

    fn lower_expr_statement(
        &mut self,
        frame: &mut Frame,
        expr: &Expr,
    ) -> CompileResult<Option<usize>> {
        match &expr.kind {
            ExprKind::Call { instance, arguments } => {
                let (effect, _) = self.inline_call(frame, *instance, arguments, expr.span)?;
                Ok(Some(effect))
            }
            ExprKind::Intrinsic { op, arguments } => {
                let arguments = arguments
                    .iter()
                    .map(|a| self.expr_value(frame, a))
                    .collect::<CompileResult<Vec<_>>>()?;

                Ok(Some(self.nodes.function(*op, arguments)))
            }
            _ => Ok(Some(self.expr_value(frame, expr)?)),
        }
    }

    fn lower_assert(
        &mut self,
        frame: &mut Frame,
        condition: &Expr,
        _span: Span,
    ) -> CompileResult<Option<usize>> {
        let failure = match self.options.asserts {
            crate::AssertMode::Halt => self.nodes.function(Op::Halt, vec![]),
            crate::AssertMode::Log => {
                let marker = self.nodes.value(0.0);
                self.nodes.function(Op::DebugLog, vec![marker])
            }
            crate::AssertMode::Off => return Ok(None),
        };

        let condition = self.expr_value(frame, condition)?;
        let failed = self.nodes.function(Op::Not, vec![condition]);

        Ok(Some(self.nodes.function(Op::If, vec![failed, failure])))
    }

    /* Expressions */

    /// Lowers a scalar-typed expression to its value node
    fn expr_value(&mut self, frame: &mut Frame, expr: &Expr) -> CompileResult<usize> {
        match &expr.kind {
            ExprKind::Const(value) => Ok(self.nodes.value(*value)),
            ExprKind::ReadLocal(local) => match frame.slots.get(local).cloned() {
                Some(LocalSlot::Temp { offset }) => Ok(self.read_temp(offset)),
                Some(LocalSlot::Alias(place)) => self.read_cell(&place, 0, expr.span),
                None => Err(Diagnostic::internal(
                    "local read before any storage was bound",
                )),
            },
            ExprKind::ReadPlace(place) => {
                let place = self.resolve_place(frame, place)?;
                self.read_cell(&place, 0, expr.span)
            }
            ExprKind::Unary { operator, operand } => {
                let operand = self.expr_value(frame, operand)?;

                Ok(match operator {
                    UnaryOperatorKind::Negate => {
                        let zero = self.nodes.value(0.0);
                        self.nodes.function(Op::Subtract, vec![zero, operand])
                    }
                    UnaryOperatorKind::Not => self.nodes.function(Op::Not, vec![operand]),
                })
            }
            ExprKind::Binary { operator, lhs, rhs } => {
                let lhs = self.expr_value(frame, lhs)?;
                let rhs = self.expr_value(frame, rhs)?;

                Ok(self.nodes.function(binary_op(*operator), vec![lhs, rhs]))
            }
            ExprKind::Logical { is_and, lhs, rhs } => {
                let lhs = self.expr_value(frame, lhs)?;
                let rhs = self.expr_value(frame, rhs)?;
                let op = if *is_and { Op::And } else { Op::Or };

                Ok(self.nodes.function(op, vec![lhs, rhs]))
            }
            ExprKind::Intrinsic { op, arguments } => {
                let arguments = arguments
                    .iter()
                    .map(|a| self.expr_value(frame, a))
                    .collect::<CompileResult<Vec<_>>>()?;

                Ok(self.nodes.function(*op, arguments))
            }
            ExprKind::Call { instance, arguments } => {
                let (effect, value) = self.inline_call(frame, *instance, arguments, expr.span)?;

                match value {
                    CallValue::Scalar(value) => {
                        Ok(self.nodes.function(Op::Execute, vec![effect, value]))
                    }
                    _ => Err(Diagnostic::internal(
                        "non-scalar call lowered in a scalar position",
                    )),
                }
            }
            ExprKind::MakeRecord { .. } | ExprKind::MakeArray { .. } | ExprKind::Zero => {
                Err(Diagnostic::internal(
                    "aggregate constructor lowered in a scalar position",
                ))
            }
        }
    }

    /// Lowers an aggregate-typed expression to storage, returning the effect
    /// node (if any) that must run first
    fn expr_place(
        &mut self,
        frame: &mut Frame,
        expr: &Expr,
        span: Span,
    ) -> CompileResult<(Option<usize>, ResolvedPlace)> {
        match &expr.kind {
            ExprKind::ReadPlace(place) => Ok((None, self.resolve_place(frame, place)?)),
            ExprKind::ReadLocal(local) => {
                let place = self.resolve_place(frame, &Place::local(*local, expr.ty.clone()))?;
                Ok((None, place))
            }
            ExprKind::Call { instance, arguments } => {
                let (effect, value) = self.inline_call(frame, *instance, arguments, span)?;

                match value {
                    CallValue::Aggregate(place) => Ok((Some(effect), place)),
                    _ => Err(Diagnostic::internal(
                        "scalar call lowered in an aggregate position",
                    )),
                }
            }
            ExprKind::MakeRecord { .. } | ExprKind::MakeArray { .. } | ExprKind::Zero => {
                let size = self.unit.types.size_of(&expr.ty, span)?;
                let offset = self.alloc_temp(size);
                let place = ResolvedPlace {
                    block: Block::TemporaryMemory,
                    offset,
                    dynamic: None,
                };

                let node = self.write_into(frame, &place, expr, span)?;

                Ok((Some(node), place))
            }
            _ => Err(Diagnostic::internal(
                "scalar expression lowered in an aggregate position",
            )),
        }
    }

    /// Writes a value of any shape into the given storage, cell by cell
    fn write_into(
        &mut self,
        frame: &mut Frame,
        target: &ResolvedPlace,
        value: &Expr,
        span: Span,
    ) -> CompileResult<usize> {
        if value.ty.is_scalar() {
            let node = self.expr_value(frame, value)?;
            return self.write_cell(target, 0, node, span);
        }

        match &value.kind {
            ExprKind::MakeRecord { fields } => {
                let mut nodes = Vec::with_capacity(fields.len());
                let mut cursor = 0;

                for field in fields {
                    let size = self.unit.types.size_of(&field.ty, span)?;
                    let sub_target = target.at_offset(cursor);

                    nodes.push(self.write_into(frame, &sub_target, field, span)?);
                    cursor += size;
                }

                Ok(self.nodes.function(Op::Execute, nodes))
            }
            ExprKind::MakeArray { elements } => {
                let mut nodes = Vec::with_capacity(elements.len());
                let mut cursor = 0;

                for element in elements {
                    let size = self.unit.types.size_of(&element.ty, span)?;
                    let sub_target = target.at_offset(cursor);

                    nodes.push(self.write_into(frame, &sub_target, element, span)?);
                    cursor += size;
                }

                Ok(self.nodes.function(Op::Execute, nodes))
            }
            ExprKind::Zero => {
                let size = self.unit.types.size_of(&value.ty, span)?;
                let zero = self.nodes.value(0.0);
                let mut nodes = Vec::with_capacity(size as usize);

                for cell in 0..size {
                    nodes.push(self.write_cell(target, cell, zero, span)?);
                }

                Ok(self.nodes.function(Op::Execute, nodes))
            }
            _ => {
                // Copy out of existing storage (or an inlined call's result)
                let (effect, source) = self.expr_place(frame, value, span)?;
                let size = self.unit.types.size_of(&value.ty, span)?;

                let mut nodes = Vec::new();
                nodes.extend(effect);

                for cell in 0..size {
                    let read = self.read_cell(&source, cell, span)?;
                    nodes.push(self.write_cell(target, cell, read, span)?);
                }

                Ok(self.nodes.function(Op::Execute, nodes))
            }
        }
    }

    /* Calls */

    fn inline_call(
        &mut self,
        frame: &mut Frame,
        instance: InstanceId,
        arguments: &[Expr],
        span: Span,
    ) -> CompileResult<(usize, CallValue)> {
        let instances = self.instances;
        let body = &instances[instance].body;

        let mut callee_frame = Frame::default();
        let mut entry = Vec::new();

        let parameters: Vec<LocalId> = body
            .locals
            .enumerate()
            .filter(|(_, local)| local.is_parameter)
            .map(|(id, _)| id)
            .collect();

        if parameters.len() != arguments.len() {
            return Err(Diagnostic::internal(
                "call arity mismatch survived specialization",
            ));
        }

        for (parameter, argument) in parameters.into_iter().zip(arguments) {
            if argument.ty.is_scalar() {
                let value = self.expr_value(frame, argument)?;
                let cell = self.alloc_temp(1);

                entry.push(self.write_temp(cell, value));
                callee_frame
                    .slots
                    .insert(parameter, LocalSlot::Temp { offset: cell });
            } else {
                let (effect, place) = self.expr_place(frame, argument, span)?;

                entry.extend(effect);
                callee_frame
                    .slots
                    .insert(parameter, LocalSlot::Alias(place));
            }
        }

        let result = if body.return_type.is_scalar() {
            Some(self.alloc_temp(1))
        } else {
            None
        };

        self.scopes.push(Scope::Function { result });
        let statements = self.lower_statements(&mut callee_frame, &body.statements);
        self.scopes.pop();

        entry.extend(statements?);

        let block = self.nodes.function(Op::Block, entry);

        let value = if let Some(cell) = result {
            CallValue::Scalar(self.read_temp(cell))
        } else if body.return_type.is_none() {
            CallValue::None
        } else {
            let place = callee_frame.return_place.ok_or_else(|| {
                Diagnostic::internal("aggregate-returning body produced no return storage")
            })?;

            CallValue::Aggregate(place)
        };

        Ok((block, value))
    }

    /* Storage access */

    fn resolve_place(&mut self, frame: &mut Frame, place: &Place) -> CompileResult<ResolvedPlace> {
        let dynamic = place
            .dynamic
            .as_ref()
            .map(|d| self.expr_value(frame, d))
            .transpose()?;

        let base = match place.base {
            PlaceBase::Block(block) => ResolvedPlace {
                block,
                offset: 0,
                dynamic: None,
            },
            PlaceBase::Local(local) => match frame.slots.get(&local).cloned() {
                Some(LocalSlot::Alias(resolved)) => resolved,
                Some(LocalSlot::Temp { offset }) => ResolvedPlace {
                    block: Block::TemporaryMemory,
                    offset,
                    dynamic: None,
                },
                None => {
                    return Err(Diagnostic::internal(
                        "place resolution reached an unbound local",
                    ));
                }
            },
            PlaceBase::ExportKey(_) => {
                return Err(Diagnostic::internal(
                    "export keys are not memory places",
                ));
            }
        };

        let combined_dynamic = match (base.dynamic, dynamic) {
            (None, d) => d,
            (d, None) => d,
            (Some(a), Some(b)) => Some(self.nodes.function(Op::Add, vec![a, b])),
        };

        Ok(ResolvedPlace {
            block: base.block,
            offset: base.offset + place.offset,
            dynamic: combined_dynamic,
        })
    }

    fn block_id_node(&mut self, block: Block, span: Span) -> CompileResult<usize> {
        let id = block.id_in(self.unit.mode).ok_or_else(|| {
            Diagnostic::spanned(
                crate::diagnostics::DiagnosticKind::InternalInvariant,
                span,
                format!("block {block:?} does not exist in {} mode", self.unit.mode),
            )
        })?;

        Ok(self.nodes.value(id as f64))
    }

    fn index_node(&mut self, place: &ResolvedPlace, extra: u32) -> usize {
        let offset = place.offset + extra;

        match place.dynamic {
            Some(dynamic) if offset == 0 => dynamic,
            Some(dynamic) => {
                let constant = self.nodes.value(offset as f64);
                self.nodes.function(Op::Add, vec![dynamic, constant])
            }
            None => self.nodes.value(offset as f64),
        }
    }

    fn read_cell(&mut self, place: &ResolvedPlace, extra: u32, span: Span) -> CompileResult<usize> {
        let block = self.block_id_node(place.block, span)?;
        let index = self.index_node(place, extra);

        Ok(self.nodes.function(Op::Get, vec![block, index]))
    }

    fn write_cell(
        &mut self,
        place: &ResolvedPlace,
        extra: u32,
        value: usize,
        span: Span,
    ) -> CompileResult<usize> {
        let block = self.block_id_node(place.block, span)?;
        let index = self.index_node(place, extra);

        Ok(self.nodes.function(Op::Set, vec![block, index, value]))
    }

    fn read_temp(&mut self, offset: u32) -> usize {
        let block = self
            .nodes
            .value(Block::TemporaryMemory.id_in(self.unit.mode).unwrap_or(10000) as f64);
        let index = self.nodes.value(offset as f64);

        self.nodes.function(Op::Get, vec![block, index])
    }

    fn write_temp(&mut self, offset: u32, value: usize) -> usize {
        let block = self
            .nodes
            .value(Block::TemporaryMemory.id_in(self.unit.mode).unwrap_or(10000) as f64);
        let index = self.nodes.value(offset as f64);

        self.nodes.function(Op::Set, vec![block, index, value])
    }

    fn alloc_temp(&mut self, size: u32) -> u32 {
        let offset = self.temp_top;
        self.temp_top += size;
        offset
    }

    /* Break scopes */

    fn break_node(&mut self, levels: u32) -> usize {
        let levels = self.nodes.value(levels as f64);
        let zero = self.nodes.value(0.0);

        self.nodes.function(Op::Break, vec![levels, zero])
    }

    fn levels_to(&self, matches: impl Fn(&Scope) -> bool) -> u32 {
        for (distance, scope) in self.scopes.iter().rev().enumerate() {
            if matches(scope) {
                return distance as u32 + 1;
            }
        }

        // Specialization rejects jumps without a target scope
        self.scopes.len() as u32
    }

    fn levels_to_loop(&self) -> (u32, Option<u32>) {
        for (distance, scope) in self.scopes.iter().rev().enumerate() {
            if let Scope::Loop { broke_flag } = scope {
                return (distance as u32 + 1, *broke_flag);
            }
        }

        (self.scopes.len() as u32, None)
    }
}

fn binary_op(operator: BinaryOperatorKind) -> Op {
    match operator {
        BinaryOperatorKind::Add => Op::Add,
        BinaryOperatorKind::Subtract => Op::Subtract,
        BinaryOperatorKind::Multiply => Op::Multiply,
        BinaryOperatorKind::Divide => Op::Divide,
        BinaryOperatorKind::Modulus => Op::Mod,
        BinaryOperatorKind::Equal => Op::Equal,
        BinaryOperatorKind::NotEqual => Op::NotEqual,
        BinaryOperatorKind::LessThan => Op::Less,
        BinaryOperatorKind::LessThanOrEqual => Op::LessOr,
        BinaryOperatorKind::GreaterThan => Op::Greater,
        BinaryOperatorKind::GreaterThanOrEqual => Op::GreaterOr,
    }
}
