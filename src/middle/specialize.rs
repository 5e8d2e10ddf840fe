//! Specialization: the pass that turns AST bodies into resolved [`hir`]
//! bodies, one per (function, argument-type tuple, callback) triple. Type
//! inference, compile-time evaluation, and branch pruning happen together in
//! a single forward walk: when a condition folds to a constant, the untaken
//! arm is never visited, so nothing in it is type-checked or counted as a
//! definition. Scalar locals are tracked through the constant lattice
//! flow-sensitively, with loop bodies re-analyzed until their entry state
//! stabilizes; the lattice only ever descends, which bounds the iteration.

use hashbrown::HashMap;

use crate::{
    backend::{
        blocks::{Block, ENTITY_ARRAY_STRIDE},
        layout::{ProgramLayout, block_for_storage},
        mode::{Callback, Mode},
        ops::Op,
    },
    diagnostics::{CompileResult, Diagnostic, DiagnosticKind},
    frontend::{
        Span, ast,
        ast::{
            AssignmentOperatorKind, BinaryOperatorKind, LevelGlobalKind, LogicalOperator,
            StorageClass, UnaryOperatorKind,
        },
        intern::InternedSymbol,
    },
    index::IndexVec,
    middle::{
        consteval::{self, Lattice},
        hir::{self, Body, Expr, ExprKind, InstanceId, LocalId, Place, PlaceBase, Stmt},
        program::{ArchetypeId, FunctionId, ItemRef, Program, RecordId},
        ty::{Type, TypeCtx, TypeKind, TypePattern},
    },
};

/// Shared, read-only context for one compilation unit (one mode)
#[derive(Clone, Copy)]
pub struct UnitCtx<'a> {
    pub types: TypeCtx<'a>,
    pub layout: &'a ProgramLayout,
    pub mode: Mode,
    /// Archetypes compiled in this unit, in project order; the position is
    /// the runtime archetype id used by `spawn`
    pub archetype_order: &'a [ArchetypeId],
}

impl<'a> UnitCtx<'a> {
    pub fn program(&self) -> &'a Program {
        self.types.program
    }

    fn archetype_number(&self, archetype: ArchetypeId) -> Option<u32> {
        self.archetype_order
            .iter()
            .position(|a| *a == archetype)
            .map(|i| i as u32)
    }
}

/// A specialized function instance
#[derive(Debug)]
pub struct FunctionInstance {
    pub function: FunctionId,
    pub argument_types: Vec<Type>,
    pub callback: Callback,
    pub body: Body,
}

/// Builds every specialized body of one compilation unit. Instances are
/// memoized by (function, argument types, callback); hitting the same key
/// twice returns the existing instance.
pub struct Specializer<'a> {
    unit: UnitCtx<'a>,
    pub instances: IndexVec<InstanceId, FunctionInstance>,
    instance_index: HashMap<(FunctionId, Vec<Type>, Callback), InstanceId>,
    /// Functions currently being specialized, for recursion detection
    active: Vec<FunctionId>,
}

/// What a name in scope denotes during specialization
#[derive(Debug, Clone)]
enum Binding {
    /// A runtime local of the current body
    Local(LocalId),
    /// A compile-time value
    Value(CtValue),
    /// Bound to different compile-time values on different control paths;
    /// reading it is ambiguous
    Poisoned(Span),
}

/// The compile-time denotation of an expression. Runtime values appear as
/// expressions or places; everything else exists only inside the compiler.
#[derive(Debug, Clone)]
enum CtValue {
    /// A runtime rvalue (always scalar, or an aggregate constructor/call)
    Rvalue(Expr),
    /// A runtime storage location
    Place(Place),
    /// `none`
    None,
    Tuple(Vec<CtValue>),
    Type(TypePattern),
    Function(FunctionId),
    Archetype(ArchetypeId),
    /// `self` inside a callback
    SelfEntity(ArchetypeId),
    /// `Arch.at(i)` — another entity of a known archetype
    EntityRef { archetype: ArchetypeId, index: Expr },
    LevelGlobal(LevelGlobalKind),
    /// The streams namespace object
    Streams,
    /// One declared stream (index into the stream layout)
    Stream(usize),
    /// `range(...)` — only consumable by `for`
    Range {
        start: Expr,
        stop: Expr,
        step: f64,
    },
    /// A record instance with at least one transient field value; exists
    /// only at compile time and can never be stored
    TransientRecord { ty: Type, fields: Vec<CtValue> },
    Builtin(Builtin),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Array,
    IsInstance,
    IsSubclass,
    Len,
    Abs,
    Sign,
    Floor,
    Ceil,
    Round,
    Frac,
    Min,
    Max,
    Clamp,
    Lerp,
    Sin,
    Cos,
    Range,
    Spawn,
    Random,
    RandomInteger,
    EntityIndex,
    DebugLog,
}

fn builtin_by_name(name: &str) -> Option<Builtin> {
    Some(match name {
        "array" => Builtin::Array,
        "isinstance" => Builtin::IsInstance,
        "issubclass" => Builtin::IsSubclass,
        "len" => Builtin::Len,
        "abs" => Builtin::Abs,
        "sign" => Builtin::Sign,
        "floor" => Builtin::Floor,
        "ceil" => Builtin::Ceil,
        "round" => Builtin::Round,
        "frac" => Builtin::Frac,
        "min" => Builtin::Min,
        "max" => Builtin::Max,
        "clamp" => Builtin::Clamp,
        "lerp" => Builtin::Lerp,
        "sin" => Builtin::Sin,
        "cos" => Builtin::Cos,
        "range" => Builtin::Range,
        "spawn" => Builtin::Spawn,
        "random" => Builtin::Random,
        "random_integer" => Builtin::RandomInteger,
        "entity_index" => Builtin::EntityIndex,
        "debug_log" => Builtin::DebugLog,
        _ => return None,
    })
}

impl Builtin {
    fn numeric_op(self) -> Option<(Op, usize)> {
        Some(match self {
            Builtin::Abs => (Op::Abs, 1),
            Builtin::Sign => (Op::Sign, 1),
            Builtin::Floor => (Op::Floor, 1),
            Builtin::Ceil => (Op::Ceil, 1),
            Builtin::Round => (Op::Round, 1),
            Builtin::Frac => (Op::Frac, 1),
            Builtin::Sin => (Op::Sin, 1),
            Builtin::Cos => (Op::Cos, 1),
            Builtin::Min => (Op::Min, 2),
            Builtin::Max => (Op::Max, 2),
            Builtin::Clamp => (Op::Clamp, 3),
            Builtin::Lerp => (Op::Lerp, 3),
            Builtin::Random => (Op::Random, 2),
            Builtin::RandomInteger => (Op::RandomInteger, 2),
            _ => return None,
        })
    }
}

impl<'a> Specializer<'a> {
    pub fn new(unit: UnitCtx<'a>) -> Self {
        Self {
            unit,
            instances: IndexVec::new(),
            instance_index: HashMap::new(),
            active: Vec::new(),
        }
    }

    pub fn instance(&self, id: InstanceId) -> &FunctionInstance {
        &self.instances[id]
    }

    /// Specializes one archetype callback into a resolved body
    pub fn specialize_callback(
        &mut self,
        archetype: ArchetypeId,
        callback: Callback,
        function: FunctionId,
    ) -> CompileResult<Body> {
        let item = self.unit.program().function(function);
        let span = item.name.span;

        let mut cx = BodyCx::new(self.unit, callback, span);

        // `self` is the entity the callback runs for
        cx.bind(
            item.parameters[0].symbol,
            Binding::Value(CtValue::SelfEntity(archetype)),
        );

        let body_ast = &self.unit.program().function(function).body;
        self.specialize_block(&mut cx, body_ast)?;

        let return_type = cx.unified_return_type()?;

        let expects_scalar_result = matches!(
            callback,
            Callback::SpawnOrder
                | Callback::ShouldSpawn
                | Callback::SpawnTime
                | Callback::DespawnTime
        );

        if expects_scalar_result && !return_type.is_scalar() {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                format!(
                    "callback `{}` must return a Scalar",
                    callback.engine_name()
                ),
            ));
        }

        if !expects_scalar_result && !return_type.is_none() {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                format!(
                    "callback `{}` cannot return a value",
                    callback.engine_name()
                ),
            ));
        }

        Ok(cx.finish(return_type))
    }

    /// Specializes (or reuses) a function instance for the given argument
    /// values, returning the call result
    fn specialize_call(
        &mut self,
        cx: &mut BodyCx<'a>,
        function: FunctionId,
        self_value: Option<CtValue>,
        argument_values: Vec<CtValue>,
        span: Span,
    ) -> CompileResult<CtValue> {
        let item = self.unit.program().function(function);
        let expected = item.parameters.len() - self_value.is_some() as usize;

        if argument_values.len() != expected {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                format!(
                    "function `{}` expects {expected} argument(s) but {} were supplied",
                    item.name.symbol,
                    argument_values.len()
                ),
            ));
        }

        if self.active.contains(&function) {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                format!(
                    "function `{}` is recursive; the target has no call stack to support recursion",
                    item.name.symbol
                ),
            ));
        }

        // Lower every argument to a runtime expression; transient values
        // cannot cross a call boundary because the instance is keyed by
        // argument types alone
        let mut arguments = Vec::new();

        for value in self_value.into_iter().chain(argument_values) {
            let expr = match value {
                CtValue::Rvalue(expr) => expr,
                CtValue::Place(place) if matches!(place.base, PlaceBase::ExportKey(_)) => {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::InvalidAccess,
                        span,
                        "exported fields are write-only",
                    ));
                }
                CtValue::Place(place) => read_place(place, span),
                other => {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        format!(
                            "cannot pass a {} to a function; only runtime values cross call boundaries",
                            describe_ct_value(&other)
                        ),
                    ));
                }
            };

            arguments.push(expr);
        }

        let argument_types: Vec<Type> = arguments.iter().map(|a| a.ty.clone()).collect();
        let key = (function, argument_types.clone(), cx.callback);

        let instance = if let Some(existing) = self.instance_index.get(&key) {
            *existing
        } else {
            self.active.push(function);

            let result = self.specialize_function_body(function, &argument_types, cx.callback, span);

            self.active.pop();

            let body = result?;
            let id = self.instances.push(FunctionInstance {
                function,
                argument_types: argument_types.clone(),
                callback: cx.callback,
                body,
            });

            self.instance_index.insert(key, id);
            id
        };

        let return_type = self.instances[instance].body.return_type.clone();

        let call = Expr {
            ty: return_type.clone(),
            span,
            kind: ExprKind::Call {
                instance,
                arguments,
            },
        };

        if return_type.is_none() {
            cx.push(Stmt::Expr(call));
            Ok(CtValue::None)
        } else {
            Ok(CtValue::Rvalue(call))
        }
    }

    fn specialize_function_body(
        &mut self,
        function: FunctionId,
        argument_types: &[Type],
        callback: Callback,
        span: Span,
    ) -> CompileResult<Body> {
        let item = self.unit.program().function(function);

        let mut cx = BodyCx::new(self.unit, callback, item.name.span);

        for (parameter, ty) in item.parameters.iter().zip(argument_types) {
            if ty.is_none() {
                return Err(Diagnostic::spanned(
                    DiagnosticKind::TypeResolution,
                    span,
                    format!(
                        "argument for parameter `{}` of `{}` is none",
                        parameter.symbol, item.name.symbol
                    ),
                ));
            }

            let local = cx.new_local(parameter.symbol, ty.clone(), parameter.span, true);
            cx.bind(parameter.symbol, Binding::Local(local));
            // Parameter constants are unknown: the instance is shared by
            // every call site with these argument types
            cx.consts.insert(local, Lattice::NotConstant);
        }

        let body_ast = &self.unit.program().function(function).body;
        self.specialize_block(&mut cx, body_ast)?;

        let return_type = cx.unified_return_type()?;

        Ok(cx.finish(return_type))
    }

    /* Statements */

    fn specialize_block(&mut self, cx: &mut BodyCx<'a>, block: &ast::Block) -> CompileResult<()> {
        cx.scopes.push(HashMap::new());

        let result = block
            .statements
            .iter()
            .try_for_each(|statement| self.specialize_statement(cx, statement));

        cx.scopes.pop();

        result
    }

    fn specialize_statement(
        &mut self,
        cx: &mut BodyCx<'a>,
        statement: &ast::Statement,
    ) -> CompileResult<()> {
        match &statement.kind {
            ast::StatementKind::Empty => Ok(()),
            ast::StatementKind::Let { name, value } => {
                let value = self.specialize_expression(cx, value)?;
                self.bind_let(cx, name, value, statement.span)
            }
            ast::StatementKind::Assign {
                target,
                operator,
                value,
            } => self.specialize_assign(cx, target, *operator, value, statement.span),
            ast::StatementKind::Expression(expression) => {
                let value = self.specialize_expression(cx, expression)?;

                if let CtValue::Rvalue(expr) = value
                    && expr.has_side_effects()
                {
                    cx.push(Stmt::Expr(expr));
                }

                Ok(())
            }
            ast::StatementKind::If(if_statement) => self.specialize_if(cx, if_statement),
            ast::StatementKind::While(while_statement) => {
                self.specialize_while(cx, while_statement, statement.span)
            }
            ast::StatementKind::For(for_statement) => {
                self.specialize_for(cx, for_statement, statement.span)
            }
            ast::StatementKind::Match(match_statement) => {
                self.specialize_match(cx, match_statement, statement.span)
            }
            ast::StatementKind::Break => {
                if cx.loop_depth == 0 {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::Syntax,
                        statement.span,
                        "`break` outside of a loop",
                    ));
                }

                cx.push(Stmt::Break(statement.span));
                Ok(())
            }
            ast::StatementKind::Continue => {
                if cx.loop_depth == 0 {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::Syntax,
                        statement.span,
                        "`continue` outside of a loop",
                    ));
                }

                cx.push(Stmt::Continue(statement.span));
                Ok(())
            }
            ast::StatementKind::Return(value) => {
                let value = value
                    .as_ref()
                    .map(|v| self.specialize_expression(cx, v))
                    .transpose()?;

                let expr = match value {
                    None | Some(CtValue::None) => None,
                    Some(CtValue::Rvalue(expr)) => Some(expr),
                    Some(CtValue::Place(place)) => Some(read_place(place, statement.span)),
                    Some(other) => {
                        return Err(Diagnostic::spanned(
                            DiagnosticKind::TypeResolution,
                            statement.span,
                            format!(
                                "functions cannot return a {}; only runtime values can be returned",
                                describe_ct_value(&other)
                            ),
                        ));
                    }
                };

                cx.return_types.push((
                    expr.as_ref().map(|e| e.ty.clone()).unwrap_or_else(Type::none),
                    statement.span,
                ));
                cx.push(Stmt::Return {
                    value: expr,
                    span: statement.span,
                });
                Ok(())
            }
            ast::StatementKind::Assert(condition) => {
                let condition = self.scalar_expression(cx, condition)?;

                if let Some(value) = condition.as_const() {
                    if consteval::is_truthy(value) {
                        return Ok(());
                    }

                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        statement.span,
                        "assertion is statically false",
                    ));
                }

                cx.push(Stmt::Assert {
                    condition,
                    span: statement.span,
                });
                Ok(())
            }
        }
    }

    fn bind_let(
        &mut self,
        cx: &mut BodyCx<'a>,
        name: &ast::Identifier,
        value: CtValue,
        span: Span,
    ) -> CompileResult<()> {
        match value {
            CtValue::Rvalue(expr) => {
                let local = cx.new_local(name.symbol, expr.ty.clone(), name.span, false);

                if expr.ty.is_scalar() {
                    let lattice = expr
                        .as_const()
                        .map(Lattice::Constant)
                        .unwrap_or(Lattice::NotConstant);
                    cx.consts.insert(local, lattice);
                }

                cx.push(Stmt::Assign {
                    local,
                    value: expr,
                    span,
                });
                cx.bind(name.symbol, Binding::Local(local));
            }
            CtValue::Place(place) => {
                let local = cx.new_local(name.symbol, place.ty.clone(), name.span, false);

                if place.ty.is_scalar() {
                    cx.consts.insert(local, Lattice::NotConstant);
                }

                cx.push(Stmt::Assign {
                    local,
                    value: read_place(place, span),
                    span,
                });
                cx.bind(name.symbol, Binding::Local(local));
            }
            transient => {
                cx.bind(name.symbol, Binding::Value(transient));
            }
        }

        Ok(())
    }

    fn specialize_assign(
        &mut self,
        cx: &mut BodyCx<'a>,
        target: &ast::Expression,
        operator: ast::AssignmentOperator,
        value: &ast::Expression,
        span: Span,
    ) -> CompileResult<()> {
        // Tuple destructuring: `(a, b) = (x, y)`
        if let ast::ExpressionKind::Tuple(targets) = &target.kind {
            if operator.kind != AssignmentOperatorKind::Assign {
                return Err(Diagnostic::spanned(
                    DiagnosticKind::Syntax,
                    span,
                    "compound assignment cannot destructure a tuple",
                ));
            }

            let value = self.specialize_expression(cx, value)?;

            let CtValue::Tuple(values) = value else {
                return Err(Diagnostic::spanned(
                    DiagnosticKind::TypeResolution,
                    span,
                    "tuple assignment requires a tuple value on the right-hand side",
                ));
            };

            if values.len() != targets.len() {
                return Err(Diagnostic::spanned(
                    DiagnosticKind::TypeResolution,
                    span,
                    format!(
                        "cannot unpack {} value(s) into {} target(s)",
                        values.len(),
                        targets.len()
                    ),
                ));
            }

            for (target, element) in targets.iter().zip(values) {
                self.assign_one(cx, target, AssignmentOperatorKind::Assign, element, span)?;
            }

            return Ok(());
        }

        let value = self.specialize_expression(cx, value)?;
        self.assign_one(cx, target, operator.kind, value, span)
    }

    fn assign_one(
        &mut self,
        cx: &mut BodyCx<'a>,
        target: &ast::Expression,
        operator: AssignmentOperatorKind,
        value: CtValue,
        span: Span,
    ) -> CompileResult<()> {
        // Assignment to a bare name rebinds the variable
        if let ast::ExpressionKind::Identifier(name) = &target.kind {
            match cx.lookup(name.symbol) {
                Some(Binding::Local(local)) => {
                    return self.assign_local(cx, local, name, operator, value, span);
                }
                Some(Binding::Value(_)) | Some(Binding::Poisoned(_)) => {
                    if operator != AssignmentOperatorKind::Assign {
                        return Err(Diagnostic::spanned(
                            DiagnosticKind::TypeResolution,
                            span,
                            "compound assignment requires a runtime variable",
                        ));
                    }

                    // Rebinding to a runtime value turns the name into a
                    // fresh runtime local; transient values stay compile-time
                    match value {
                        CtValue::Rvalue(expr) => {
                            let local =
                                cx.new_local(name.symbol, expr.ty.clone(), name.span, false);

                            if expr.ty.is_scalar() {
                                let lattice = expr
                                    .as_const()
                                    .map(Lattice::Constant)
                                    .unwrap_or(Lattice::NotConstant);
                                cx.consts.insert(local, lattice);
                            }

                            cx.push(Stmt::Assign {
                                local,
                                value: expr,
                                span,
                            });
                            cx.rebind(name.symbol, Binding::Local(local));
                        }
                        CtValue::Place(place) => {
                            let local =
                                cx.new_local(name.symbol, place.ty.clone(), name.span, false);

                            if place.ty.is_scalar() {
                                cx.consts.insert(local, Lattice::NotConstant);
                            }

                            cx.push(Stmt::Assign {
                                local,
                                value: read_place(place, span),
                                span,
                            });
                            cx.rebind(name.symbol, Binding::Local(local));
                        }
                        transient => cx.rebind(name.symbol, binding_for_value(transient)),
                    }

                    return Ok(());
                }
                None => {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        name.span,
                        format!(
                            "cannot assign to undeclared variable `{}`; declare it with `let`",
                            name.symbol
                        ),
                    ));
                }
            }
        }

        // Otherwise the target must resolve to a writable storage location
        let place = match self.specialize_expression(cx, target)? {
            CtValue::Place(place) => place,
            other => {
                return Err(Diagnostic::spanned(
                    DiagnosticKind::TypeResolution,
                    target.span,
                    format!("cannot assign to a {}", describe_ct_value(&other)),
                ));
            }
        };

        self.check_place_writable(cx, &place, span)?;

        // Exported fields never touch memory; the write lowers to an export op
        if let PlaceBase::ExportKey(key) = place.base {
            if operator != AssignmentOperatorKind::Assign {
                return Err(Diagnostic::spanned(
                    DiagnosticKind::InvalidAccess,
                    span,
                    "exported fields are write-only and cannot be updated in place",
                ));
            }

            let value_expr = self.runtime_value(cx, value, span)?;

            if !value_expr.ty.is_scalar() {
                return Err(self.type_mismatch(&Type::scalar(), &value_expr.ty, span));
            }

            cx.push(Stmt::Export {
                key,
                value: value_expr,
                span,
            });

            return Ok(());
        }

        let value_expr = self.runtime_value(cx, value, span)?;

        if place.ty.is_scalar() {
            if !value_expr.ty.is_scalar() {
                return Err(self.type_mismatch(&place.ty, &value_expr.ty, span));
            }

            let value_expr = match operator {
                AssignmentOperatorKind::Assign => value_expr,
                AssignmentOperatorKind::Compound(op) => self.fold_or_binary(
                    op,
                    read_place(place.clone(), span),
                    value_expr,
                    span,
                )?,
            };

            cx.push(Stmt::Store {
                place,
                value: value_expr,
                span,
            });
        } else {
            if value_expr.ty != place.ty {
                return Err(self.type_mismatch(&place.ty, &value_expr.ty, span));
            }

            let value_expr = match operator {
                AssignmentOperatorKind::Assign => value_expr,
                AssignmentOperatorKind::Compound(op) => {
                    // Derived in-place variant of the record operator method
                    let result = self.record_binary_op(
                        cx,
                        op,
                        CtValue::Place(place.clone()),
                        CtValue::Rvalue(value_expr),
                        span,
                    )?;
                    self.runtime_value(cx, result, span)?
                }
            };

            cx.push(Stmt::CopyInto {
                target: place,
                value: value_expr,
                span,
            });
        }

        Ok(())
    }

    fn assign_local(
        &mut self,
        cx: &mut BodyCx<'a>,
        local: LocalId,
        name: &ast::Identifier,
        operator: AssignmentOperatorKind,
        value: CtValue,
        span: Span,
    ) -> CompileResult<()> {
        let local_ty = cx.body_locals[local].ty.clone();

        if local_ty.is_scalar() {
            let value_expr = self.runtime_value(cx, value, span)?;

            if !value_expr.ty.is_scalar() {
                return Err(self.type_mismatch(&local_ty, &value_expr.ty, span));
            }

            let value_expr = match operator {
                AssignmentOperatorKind::Assign => value_expr,
                AssignmentOperatorKind::Compound(op) => {
                    let current = cx.read_scalar_local(local, name.span);
                    self.fold_or_binary(op, current, value_expr, span)?
                }
            };

            let lattice = value_expr
                .as_const()
                .map(Lattice::Constant)
                .unwrap_or(Lattice::NotConstant);
            cx.consts.insert(local, lattice);

            cx.push(Stmt::Assign {
                local,
                value: value_expr,
                span,
            });

            return Ok(());
        }

        match operator {
            AssignmentOperatorKind::Assign => {
                let value_expr = self.runtime_value(cx, value, span)?;

                if value_expr.ty != local_ty {
                    return Err(self.type_mismatch(&local_ty, &value_expr.ty, span));
                }

                // A fresh definition site; single-live-definition analysis
                // decides whether later reads remain unambiguous
                cx.push(Stmt::Assign {
                    local,
                    value: value_expr,
                    span,
                });
            }
            AssignmentOperatorKind::Compound(op) => {
                let result = self.record_binary_op(
                    cx,
                    op,
                    CtValue::Place(Place::local(local, local_ty.clone())),
                    value,
                    span,
                )?;
                let value_expr = self.runtime_value(cx, result, span)?;

                cx.push(Stmt::CopyInto {
                    target: Place::local(local, local_ty),
                    value: value_expr,
                    span,
                });
            }
        }

        Ok(())
    }

    fn specialize_if(&mut self, cx: &mut BodyCx<'a>, if_statement: &ast::IfStatement) -> CompileResult<()> {
        let condition = self.scalar_expression(cx, &if_statement.condition)?;

        // A constant condition prunes the untaken arm before it is visited
        if let Some(value) = condition.as_const() {
            return if consteval::is_truthy(value) {
                self.specialize_block(cx, &if_statement.then_block)
            } else if let Some(else_block) = &if_statement.else_block {
                self.specialize_block(cx, else_block)
            } else {
                Ok(())
            };
        }

        let entry_consts = cx.consts.clone();
        let entry_scopes = cx.snapshot_scopes();

        let then_branch = cx.collect(|cx| self.specialize_block(cx, &if_statement.then_block))?;
        let then_consts = std::mem::replace(&mut cx.consts, entry_consts);
        let then_scopes = cx.snapshot_scopes();
        cx.restore_scopes(entry_scopes.clone());

        let else_branch = match &if_statement.else_block {
            Some(else_block) => cx.collect(|cx| self.specialize_block(cx, else_block))?,
            None => Vec::new(),
        };

        cx.merge_consts(then_consts);
        cx.poison_diverging(&entry_scopes, &then_scopes);
        let else_scopes = cx.snapshot_scopes();
        cx.poison_diverging(&entry_scopes, &else_scopes);

        cx.push(Stmt::If {
            condition,
            then_branch,
            else_branch,
        });

        Ok(())
    }

    fn specialize_while(
        &mut self,
        cx: &mut BodyCx<'a>,
        while_statement: &ast::WhileStatement,
        span: Span,
    ) -> CompileResult<()> {
        // Probe the condition under the entry state; if it is constant-false
        // the loop body never runs and the else block (no-break exit) always
        // does
        let locals_mark = cx.body_locals.len();
        let (probe_statements, probe_condition) =
            cx.collect_with(|cx| self.scalar_expression(cx, &while_statement.condition))?;

        if let Some(value) = probe_condition.as_const()
            && !consteval::is_truthy(value)
        {
            // The condition is still evaluated once
            for statement in probe_statements {
                cx.push(statement);
            }

            if let Some(else_block) = &while_statement.else_block {
                return self.specialize_block(cx, else_block);
            }

            return Ok(());
        }

        cx.truncate_locals(locals_mark);

        self.stabilize_loop_state(cx, |this, cx| {
            this.specialize_block(cx, &while_statement.body)
        })?;

        // Emit under the stabilized state. Statements supporting the
        // condition (spills, bounds asserts) run once before the loop and
        // again before every re-test.
        let (condition_statements, condition) =
            cx.collect_with(|cx| self.scalar_expression(cx, &while_statement.condition))?;

        for statement in condition_statements.clone() {
            cx.push(statement);
        }

        cx.loop_depth += 1;
        let body = cx.collect(|cx| self.specialize_block(cx, &while_statement.body));
        cx.loop_depth -= 1;
        let body = body?;

        let else_branch = match &while_statement.else_block {
            Some(else_block) => cx.collect(|cx| self.specialize_block(cx, else_block))?,
            None => Vec::new(),
        };

        cx.push(Stmt::While {
            condition,
            body,
            advance: condition_statements,
            else_branch,
            span,
        });

        Ok(())
    }

    /// Re-analyzes a loop body until the scalar constant state at its head
    /// stops changing. Each pass merges the state after one body run into the
    /// entry state; the lattice only descends, so the iteration count is
    /// bounded by the number of tracked locals.
    fn stabilize_loop_state(
        &mut self,
        cx: &mut BodyCx<'a>,
        mut body: impl FnMut(&mut Self, &mut BodyCx<'a>) -> CompileResult<()>,
    ) -> CompileResult<()> {
        let max_passes = 2 * cx.body_locals.len() + 4;

        for _ in 0..max_passes {
            let entry = cx.consts.clone();
            let scopes = cx.snapshot_scopes();
            let locals_mark = cx.body_locals.len();

            cx.loop_depth += 1;
            let discarded = cx.collect(|cx| body(self, cx));
            cx.loop_depth -= 1;
            discarded?;

            cx.truncate_locals(locals_mark);
            let trial_scopes = cx.snapshot_scopes();
            cx.restore_scopes(scopes.clone());
            cx.poison_diverging(&scopes, &trial_scopes);

            let after = std::mem::replace(&mut cx.consts, entry.clone());
            cx.merge_consts(after);

            if cx.consts == entry {
                return Ok(());
            }
        }

        Err(Diagnostic::internal(
            "loop constant analysis failed to stabilize within its structural bound",
        ))
    }

    fn specialize_for(
        &mut self,
        cx: &mut BodyCx<'a>,
        for_statement: &ast::ForStatement,
        span: Span,
    ) -> CompileResult<()> {
        let iterable = self.specialize_expression(cx, &for_statement.iterable)?;

        match iterable {
            CtValue::Range { start, stop, step } => {
                self.lower_counted_for(cx, for_statement, start, stop, step, None, span)
            }
            CtValue::Place(place) => {
                let place_ty = place.ty.clone();
                let TypeKind::Array { element, length } = &*place_ty else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        for_statement.iterable.span,
                        "only arrays, tuples, and ranges can be iterated",
                    ));
                };

                let start = Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Const(0.0),
                };
                let stop = Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Const(*length as f64),
                };

                self.lower_counted_for(
                    cx,
                    for_statement,
                    start,
                    stop,
                    1.0,
                    Some((place, element.clone())),
                    span,
                )
            }
            CtValue::Tuple(elements) => {
                // Compile-time-fixed-length iteration unrolls the body once
                // per element; there is no runtime loop to break out of
                if let Some(offender) = find_loop_jump(&for_statement.body) {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::UnsupportedConstruct,
                        offender,
                        "`break`/`continue` inside tuple iteration; the loop is unrolled at compile time",
                    ));
                }

                for element in elements {
                    cx.scopes.push(HashMap::new());
                    cx.bind(
                        for_statement.binding.symbol,
                        binding_for_value(element),
                    );

                    let result = self.specialize_block(cx, &for_statement.body);
                    cx.scopes.pop();
                    result?;
                }

                if let Some(else_block) = &for_statement.else_block {
                    self.specialize_block(cx, else_block)?;
                }

                Ok(())
            }
            other => Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                for_statement.iterable.span,
                format!("cannot iterate a {}", describe_ct_value(&other)),
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_counted_for(
        &mut self,
        cx: &mut BodyCx<'a>,
        for_statement: &ast::ForStatement,
        start: Expr,
        stop: Expr,
        step: f64,
        element: Option<(Place, Type)>,
        span: Span,
    ) -> CompileResult<()> {
        // Evaluate the bound once
        let stop = cx.spill(stop, span);

        let induction = cx.new_local(
            InternedSymbol::new("__index"),
            Type::scalar(),
            span,
            false,
        );
        cx.consts.insert(induction, Lattice::NotConstant);
        cx.push(Stmt::Assign {
            local: induction,
            value: start,
            span,
        });

        let comparison = if step >= 0.0 {
            BinaryOperatorKind::LessThan
        } else {
            BinaryOperatorKind::GreaterThan
        };

        let condition = Expr {
            ty: Type::scalar(),
            span,
            kind: ExprKind::Binary {
                operator: comparison,
                lhs: Box::new(cx.read_scalar_local(induction, span)),
                rhs: Box::new(stop),
            },
        };

        cx.scopes.push(HashMap::new());

        match &element {
            Some((place, element_ty)) => {
                // The loop variable aliases the current element in place
                let mut element_place = place.clone();
                let element_size = self
                    .unit
                    .types
                    .size_of(element_ty, span)?;

                let scaled = Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Binary {
                        operator: BinaryOperatorKind::Multiply,
                        lhs: Box::new(cx.read_scalar_local(induction, span)),
                        rhs: Box::new(Expr {
                            ty: Type::scalar(),
                            span,
                            kind: ExprKind::Const(element_size as f64),
                        }),
                    },
                };

                element_place.ty = element_ty.clone();
                element_place.dynamic = Some(Box::new(match element_place.dynamic.take() {
                    Some(existing) => Expr {
                        ty: Type::scalar(),
                        span,
                        kind: ExprKind::Binary {
                            operator: BinaryOperatorKind::Add,
                            lhs: existing,
                            rhs: Box::new(scaled),
                        },
                    },
                    None => scaled,
                }));

                cx.bind(
                    for_statement.binding.symbol,
                    Binding::Value(CtValue::Place(element_place)),
                );
            }
            None => {
                cx.bind(for_statement.binding.symbol, Binding::Local(induction));
            }
        }

        let result = (|| {
            self.stabilize_loop_state(cx, |this, cx| {
                this.specialize_block(cx, &for_statement.body)
            })?;

            cx.loop_depth += 1;
            let body = cx.collect(|cx| self.specialize_block(cx, &for_statement.body));
            cx.loop_depth -= 1;
            let body = body?;

            let advance = vec![Stmt::Assign {
                local: induction,
                value: Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Binary {
                        operator: BinaryOperatorKind::Add,
                        lhs: Box::new(cx.read_scalar_local(induction, span)),
                        rhs: Box::new(Expr {
                            ty: Type::scalar(),
                            span,
                            kind: ExprKind::Const(step),
                        }),
                    },
                },
                span,
            }];

            cx.consts.insert(induction, Lattice::NotConstant);

            let else_branch = match &for_statement.else_block {
                Some(else_block) => cx.collect(|cx| self.specialize_block(cx, else_block))?,
                None => Vec::new(),
            };

            cx.push(Stmt::While {
                condition,
                body,
                advance,
                else_branch,
                span,
            });

            Ok(())
        })();

        cx.scopes.pop();
        result
    }

    fn specialize_match(
        &mut self,
        cx: &mut BodyCx<'a>,
        match_statement: &ast::MatchStatement,
        span: Span,
    ) -> CompileResult<()> {
        let subject = self.specialize_expression(cx, &match_statement.subject)?;

        // Aggregate and scalar subjects are pinned to storage so pattern
        // tests do not re-evaluate them
        let subject = match subject {
            CtValue::Rvalue(expr) => {
                let place = cx.spill_to_place(expr, span);
                CtValue::Place(place)
            }
            other => other,
        };

        self.lower_match_arms(cx, &match_statement.arms, &subject, span)
    }

    fn lower_match_arms(
        &mut self,
        cx: &mut BodyCx<'a>,
        arms: &[ast::MatchArm],
        subject: &CtValue,
        span: Span,
    ) -> CompileResult<()> {
        let Some((arm, rest)) = arms.split_first() else {
            return Ok(());
        };

        // A statically-false pattern is omitted entirely
        let test = self.pattern_test(cx, &arm.pattern, subject)?;

        let Some(test) = test else {
            return self.lower_match_arms(cx, rest, subject, span);
        };

        // Pattern bindings are visible to the guard and the arm body only
        cx.scopes.push(HashMap::new());

        let arm_result: CompileResult<Option<(Expr, Vec<Stmt>)>> = (|| {
            self.bind_pattern(cx, &arm.pattern, subject)?;

            let guard = arm
                .guard
                .as_ref()
                .map(|g| self.scalar_expression(cx, g))
                .transpose()?;

            let condition = match (test, guard) {
                (test, None) => test,
                (test, Some(guard)) => self.fold_and(test, guard, arm.span)?,
            };

            if let Some(value) = condition.as_const() {
                return if consteval::is_truthy(value) {
                    // This arm always matches: later arms are unreachable
                    self.specialize_block(cx, &arm.body)?;
                    Ok(Some((
                        Expr {
                            ty: Type::scalar(),
                            span: arm.span,
                            kind: ExprKind::Const(1.0),
                        },
                        Vec::new(),
                    )))
                } else {
                    // Statically-false arm: omitted entirely
                    Ok(None)
                };
            }

            let entry_consts = cx.consts.clone();
            let then_branch = cx.collect(|cx| self.specialize_block(cx, &arm.body))?;
            let then_consts = std::mem::replace(&mut cx.consts, entry_consts);
            cx.merge_consts(then_consts);

            Ok(Some((condition, then_branch)))
        })();

        cx.scopes.pop();

        match arm_result? {
            // Arm matched statically and was emitted inline; the remaining
            // arms are unreachable and contribute nothing
            Some((condition, _)) if condition.as_const().is_some() => Ok(()),
            Some((condition, then_branch)) => {
                let else_branch =
                    cx.collect(|cx| self.lower_match_arms(cx, rest, subject, span))?;

                cx.push(Stmt::If {
                    condition,
                    then_branch,
                    else_branch,
                });

                Ok(())
            }
            None => self.lower_match_arms(cx, rest, subject, span),
        }
    }

    /// The runtime test for a pattern, or None when the pattern can be proven
    /// never to match (the arm is then omitted). A constant-true test means
    /// the pattern always matches.
    fn pattern_test(
        &mut self,
        cx: &mut BodyCx<'a>,
        pattern: &ast::Pattern,
        subject: &CtValue,
    ) -> CompileResult<Option<Expr>> {
        let always = Expr {
            ty: Type::scalar(),
            span: pattern.span,
            kind: ExprKind::Const(1.0),
        };

        match &pattern.kind {
            ast::PatternKind::Wildcard | ast::PatternKind::Binding(_) => Ok(Some(always)),
            ast::PatternKind::Literal(ast::Literal::None) => Ok(match subject {
                CtValue::None => Some(always),
                _ => None,
            }),
            ast::PatternKind::Literal(literal) => {
                let value = match literal {
                    ast::Literal::Number(n) => *n,
                    ast::Literal::Boolean(b) => {
                        if *b {
                            1.0
                        } else {
                            0.0
                        }
                    }
                    ast::Literal::None => unreachable!("handled above"),
                };

                let subject_expr = match subject {
                    CtValue::Place(place) if place.ty.is_scalar() => {
                        read_place(place.clone(), pattern.span)
                    }
                    CtValue::Rvalue(expr) if expr.ty.is_scalar() => expr.clone(),
                    // A literal can never match a non-scalar subject
                    _ => return Ok(None),
                };

                let literal_expr = Expr {
                    ty: Type::scalar(),
                    span: pattern.span,
                    kind: ExprKind::Const(value),
                };

                Ok(Some(self.fold_or_binary(
                    BinaryOperatorKind::Equal,
                    subject_expr,
                    literal_expr,
                    pattern.span,
                )?))
            }
            ast::PatternKind::Record { name, fields } => {
                let subject_ty = match subject {
                    CtValue::Place(place) => place.ty.clone(),
                    CtValue::Rvalue(expr) => expr.ty.clone(),
                    CtValue::TransientRecord { ty, .. } => ty.clone(),
                    _ => return Ok(None),
                };

                // The type test resolves at compile time
                let Some(ItemRef::Record(def)) = self.unit.program().lookup(name.symbol) else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        name.span,
                        format!("`{}` is not a record", name.symbol),
                    ));
                };

                if !TypePattern::AnyRecord(def).matches(&subject_ty) {
                    return Ok(None);
                }

                let record = self.unit.program().record(def);

                if fields.len() != record.fields.len() {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        pattern.span,
                        format!(
                            "record `{}` has {} field(s) but the pattern names {}",
                            name.symbol,
                            record.fields.len(),
                            fields.len()
                        ),
                    ));
                }

                // Combine the sub-pattern tests over the destructured fields
                let mut combined = always;

                for (index, sub_pattern) in fields.iter().enumerate() {
                    let field_value = self.record_field_value(cx, subject, index, pattern.span)?;

                    let Some(test) = self.pattern_test(cx, sub_pattern, &field_value)? else {
                        return Ok(None);
                    };

                    combined = self.fold_and(combined, test, pattern.span)?;
                }

                Ok(Some(combined))
            }
        }
    }

    fn bind_pattern(
        &mut self,
        cx: &mut BodyCx<'a>,
        pattern: &ast::Pattern,
        subject: &CtValue,
    ) -> CompileResult<()> {
        match &pattern.kind {
            ast::PatternKind::Wildcard | ast::PatternKind::Literal(_) => Ok(()),
            ast::PatternKind::Binding(name) => {
                cx.bind(name.symbol, binding_for_value(subject.clone()));
                Ok(())
            }
            ast::PatternKind::Record { fields, .. } => {
                for (index, sub_pattern) in fields.iter().enumerate() {
                    let field_value = self.record_field_value(cx, subject, index, pattern.span)?;
                    self.bind_pattern(cx, sub_pattern, &field_value)?;
                }

                Ok(())
            }
        }
    }

    fn record_field_value(
        &mut self,
        cx: &mut BodyCx<'a>,
        subject: &CtValue,
        index: usize,
        span: Span,
    ) -> CompileResult<CtValue> {
        match subject {
            CtValue::Place(place) => {
                let field_ty = self
                    .unit
                    .types
                    .record_fields(&place.ty)
                    .ok_or_else(|| Diagnostic::internal("record place without instance"))?
                    .field_types[index]
                    .clone();
                let offset = self.unit.types.field_offset(&place.ty, index, span)?;

                let mut field_place = place.clone();
                field_place.ty = field_ty;
                field_place.offset += offset;

                Ok(CtValue::Place(field_place))
            }
            CtValue::TransientRecord { fields, .. } => Ok(fields[index].clone()),
            CtValue::Rvalue(expr) => {
                let place = cx.spill_to_place(expr.clone(), span);
                self.record_field_value(cx, &CtValue::Place(place), index, span)
            }
            _ => Err(Diagnostic::internal("field access on a non-record value")),
        }
    }

    /* Expressions */

    fn specialize_expression(
        &mut self,
        cx: &mut BodyCx<'a>,
        expression: &ast::Expression,
    ) -> CompileResult<CtValue> {
        let span = expression.span;

        match &expression.kind {
            ast::ExpressionKind::Literal(ast::Literal::Number(value)) => {
                Ok(CtValue::Rvalue(Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Const(*value),
                }))
            }
            ast::ExpressionKind::Literal(ast::Literal::Boolean(value)) => {
                Ok(CtValue::Rvalue(Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Const(if *value { 1.0 } else { 0.0 }),
                }))
            }
            ast::ExpressionKind::Literal(ast::Literal::None) => Ok(CtValue::None),
            ast::ExpressionKind::Identifier(name) => self.resolve_name(cx, name),
            ast::ExpressionKind::Unary { operator, operand } => {
                let operand = self.scalar_expression(cx, operand)?;

                if let Some(value) = operand.as_const() {
                    return Ok(CtValue::Rvalue(Expr {
                        ty: Type::scalar(),
                        span,
                        kind: ExprKind::Const(consteval::fold_unary(operator.kind, value)),
                    }));
                }

                Ok(CtValue::Rvalue(Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Unary {
                        operator: operator.kind,
                        operand: Box::new(operand),
                    },
                }))
            }
            ast::ExpressionKind::Binary { operator, lhs, rhs } => {
                let lhs = self.specialize_expression(cx, lhs)?;
                let rhs = self.specialize_expression(cx, rhs)?;
                self.binary_operation(cx, operator.kind, lhs, rhs, span)
            }
            ast::ExpressionKind::Logical { operator, lhs, rhs } => {
                let lhs = self.scalar_expression(cx, lhs)?;

                if let Some(value) = lhs.as_const() {
                    let truthy = consteval::is_truthy(value);

                    // Short-circuit: the untaken operand is never visited
                    return match (operator, truthy) {
                        (LogicalOperator::And, false) | (LogicalOperator::Or, true) => {
                            Ok(CtValue::Rvalue(lhs))
                        }
                        _ => Ok(CtValue::Rvalue(self.scalar_expression(cx, rhs)?)),
                    };
                }

                let rhs = self.scalar_expression(cx, rhs)?;

                Ok(CtValue::Rvalue(Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Logical {
                        is_and: *operator == LogicalOperator::And,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                }))
            }
            ast::ExpressionKind::IsNone { operand, negated } => {
                let operand = self.specialize_expression(cx, operand)?;
                let is_none = matches!(operand, CtValue::None);

                Ok(CtValue::Rvalue(Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Const(if is_none != *negated { 1.0 } else { 0.0 }),
                }))
            }
            ast::ExpressionKind::Tuple(elements) => {
                let elements = elements
                    .iter()
                    .map(|e| {
                        let value = self.specialize_expression(cx, e)?;

                        // Element effects happen once, at the literal site,
                        // even though tuple uses are expanded per element
                        Ok(match value {
                            CtValue::Rvalue(expr) if expr.has_side_effects() => {
                                if expr.ty.is_scalar() {
                                    CtValue::Rvalue(cx.spill(expr, span))
                                } else {
                                    CtValue::Place(cx.spill_to_place(expr, span))
                                }
                            }
                            other => other,
                        })
                    })
                    .collect::<CompileResult<Vec<_>>>()?;

                Ok(CtValue::Tuple(elements))
            }
            ast::ExpressionKind::Field { object, field } => {
                let object = self.specialize_expression(cx, object)?;
                self.field_access(cx, object, field, span)
            }
            ast::ExpressionKind::Index { object, index } => {
                let object = self.specialize_expression(cx, object)?;
                self.index_access(cx, object, index, span)
            }
            ast::ExpressionKind::Call { callee, arguments } => {
                self.specialize_call_expression(cx, callee, arguments, span)
            }
        }
    }

    fn resolve_name(&mut self, cx: &mut BodyCx<'a>, name: &ast::Identifier) -> CompileResult<CtValue> {
        if let Some(binding) = cx.lookup(name.symbol) {
            return match binding {
                Binding::Local(local) => {
                    let ty = cx.body_locals[local].ty.clone();

                    if ty.is_scalar() {
                        Ok(CtValue::Rvalue(cx.read_scalar_local(local, name.span)))
                    } else {
                        Ok(CtValue::Place(Place::local(local, ty)))
                    }
                }
                Binding::Value(value) => Ok(value),
                Binding::Poisoned(span) => Err(Diagnostic::spanned(
                    DiagnosticKind::AmbiguousDefinition,
                    name.span,
                    format!(
                        "`{}` is bound to different compile-time values on different control paths",
                        name.symbol
                    ),
                )
                .with_related("bound here", span)),
            };
        }

        if name.symbol.value() == "Scalar" {
            return Ok(CtValue::Type(TypePattern::Exact(Type::scalar())));
        }

        if let Some(builtin) = builtin_by_name(name.symbol.value()) {
            return Ok(CtValue::Builtin(builtin));
        }

        match self.unit.program().lookup(name.symbol) {
            Some(ItemRef::Record(def)) => {
                if self.unit.program().record(def).type_parameters.is_empty() {
                    let ty = self
                        .unit
                        .types
                        .instantiate_record(def, Vec::new(), name.span)?;
                    Ok(CtValue::Type(TypePattern::Exact(ty)))
                } else {
                    Ok(CtValue::Type(TypePattern::AnyRecord(def)))
                }
            }
            Some(ItemRef::Function(def)) => Ok(CtValue::Function(def)),
            Some(ItemRef::Archetype(def)) => Ok(CtValue::Archetype(def)),
            Some(ItemRef::LevelMemory) => Ok(CtValue::LevelGlobal(LevelGlobalKind::Memory)),
            Some(ItemRef::LevelData) => Ok(CtValue::LevelGlobal(LevelGlobalKind::Data)),
            Some(ItemRef::Streams) => Ok(CtValue::Streams),
            None => Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                name.span,
                format!("unknown name `{}`", name.symbol),
            )),
        }
    }

    fn field_access(
        &mut self,
        cx: &mut BodyCx<'a>,
        object: CtValue,
        field: &ast::Identifier,
        span: Span,
    ) -> CompileResult<CtValue> {
        match object {
            CtValue::SelfEntity(archetype) => {
                self.entity_field_place(cx, archetype, None, field, span)
            }
            CtValue::EntityRef { archetype, index } => {
                self.entity_field_place(cx, archetype, Some(index), field, span)
            }
            CtValue::LevelGlobal(kind) => {
                let (layout, block) = match kind {
                    LevelGlobalKind::Memory => {
                        (&self.unit.layout.level_memory, Block::LevelMemory)
                    }
                    LevelGlobalKind::Data => (&self.unit.layout.level_data, Block::LevelData),
                };

                let Some(slot) = layout.field(field.symbol) else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        field.span,
                        format!("no level global field named `{}`", field.symbol),
                    ));
                };

                self.check_block_readable(block, span)?;

                Ok(CtValue::Place(Place::block(
                    block,
                    slot.offset,
                    slot.ty.clone(),
                )))
            }
            CtValue::Streams => {
                let Some(index) = self
                    .unit
                    .layout
                    .streams
                    .iter()
                    .position(|s| s.name == field.symbol)
                else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        field.span,
                        format!("no stream named `{}`", field.symbol),
                    ));
                };

                Ok(CtValue::Stream(index))
            }
            CtValue::Place(place) => {
                let Some(instance) = self.unit.types.record_fields(&place.ty) else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        format!(
                            "type {} has no fields",
                            self.unit.types.render(&place.ty)
                        ),
                    ));
                };

                let record = self.unit.program().record(instance.def);

                let Some(index) = record.field_index(field.symbol) else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        field.span,
                        format!(
                            "record `{}` has no field `{}`",
                            record.name.symbol, field.symbol
                        ),
                    ));
                };

                let offset = self.unit.types.field_offset(&place.ty, index, span)?;
                let field_ty = instance.field_types[index].clone();

                let mut field_place = place;
                field_place.ty = field_ty;
                field_place.offset += offset;

                Ok(CtValue::Place(field_place))
            }
            CtValue::TransientRecord { ty, fields } => {
                let Some(instance) = self.unit.types.record_fields(&ty) else {
                    return Err(Diagnostic::internal("transient record without instance"));
                };

                let record = self.unit.program().record(instance.def);

                let Some(index) = record.field_index(field.symbol) else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        field.span,
                        format!(
                            "record `{}` has no field `{}`",
                            record.name.symbol, field.symbol
                        ),
                    ));
                };

                Ok(fields[index].clone())
            }
            CtValue::Rvalue(expr) if self.unit.types.record_fields(&expr.ty).is_some() => {
                let place = cx.spill_to_place(expr, span);
                self.field_access(cx, CtValue::Place(place), field, span)
            }
            other => Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                format!("a {} has no fields", describe_ct_value(&other)),
            )),
        }
    }

    fn entity_field_place(
        &mut self,
        cx: &mut BodyCx<'a>,
        archetype: ArchetypeId,
        other_index: Option<Expr>,
        field: &ast::Identifier,
        span: Span,
    ) -> CompileResult<CtValue> {
        let _ = cx;
        let layout = &self.unit.layout.archetypes[archetype];

        let Some(slot) = layout.field(field.symbol) else {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                field.span,
                format!(
                    "archetype `{}` has no field `{}`",
                    self.unit.program().archetype(archetype).name.symbol,
                    field.symbol
                ),
            ));
        };

        if slot.storage == StorageClass::Exported {
            if other_index.is_some() {
                return Err(Diagnostic::spanned(
                    DiagnosticKind::InvalidAccess,
                    span,
                    "exported fields of other entities are not accessible",
                ));
            }

            // Write-only; reads are rejected when the value is used
            return Ok(CtValue::Place(Place {
                ty: slot.ty.clone(),
                base: PlaceBase::ExportKey(slot.offset),
                offset: 0,
                dynamic: None,
            }));
        }

        let own_block = block_for_storage(slot.storage)
            .ok_or_else(|| Diagnostic::internal("storage class without a block"))?;

        match other_index {
            None => {
                self.check_block_readable(own_block, span)?;

                Ok(CtValue::Place(Place::block(
                    own_block,
                    slot.offset,
                    slot.ty.clone(),
                )))
            }
            Some(index) => {
                // Another entity's storage is reached through the array
                // views; entity memory has no such view and stays private
                let array_block = match slot.storage {
                    StorageClass::Imported | StorageClass::EntityData => Block::EntityDataArray,
                    StorageClass::SharedMemory => Block::EntitySharedMemoryArray,
                    StorageClass::EntityMemory => {
                        return Err(Diagnostic::spanned(
                            DiagnosticKind::InvalidAccess,
                            span,
                            format!(
                                "entity memory is private to its entity; `{}` cannot be read from another entity",
                                field.symbol
                            ),
                        ));
                    }
                    StorageClass::Exported => unreachable!("handled above"),
                };

                self.check_block_readable(array_block, span)?;

                let row = Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Binary {
                        operator: BinaryOperatorKind::Multiply,
                        lhs: Box::new(index),
                        rhs: Box::new(Expr {
                            ty: Type::scalar(),
                            span,
                            kind: ExprKind::Const(ENTITY_ARRAY_STRIDE as f64),
                        }),
                    },
                };

                Ok(CtValue::Place(Place {
                    ty: slot.ty.clone(),
                    base: PlaceBase::Block(array_block),
                    offset: slot.offset,
                    dynamic: Some(Box::new(row)),
                }))
            }
        }
    }

    fn index_access(
        &mut self,
        cx: &mut BodyCx<'a>,
        object: CtValue,
        index: &ast::Expression,
        span: Span,
    ) -> CompileResult<CtValue> {
        match object {
            // `Name[Args]` — generic instantiation in expression position
            CtValue::Type(TypePattern::AnyRecord(def)) => {
                let arguments = self.type_argument_list(cx, index)?;
                let ty = self.unit.types.instantiate_record(def, arguments, span)?;

                Ok(CtValue::Type(TypePattern::Exact(ty)))
            }
            CtValue::Place(place) => {
                let place_ty = place.ty.clone();
                let TypeKind::Array { element, length } = &*place_ty else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        format!(
                            "type {} cannot be indexed",
                            self.unit.types.render(&place.ty)
                        ),
                    ));
                };

                let index_expr = self.scalar_expression(cx, index)?;
                let element_size = self.unit.types.size_of(element, span)?;

                let mut element_place = place;
                element_place.ty = element.clone();

                if let Some(value) = index_expr.as_const() {
                    if value.fract() != 0.0 || value < 0.0 || value >= *length as f64 {
                        return Err(Diagnostic::spanned(
                            DiagnosticKind::TypeResolution,
                            span,
                            format!(
                                "index {value} is out of bounds for an array of length {length}"
                            ),
                        ));
                    }

                    element_place.offset += value as u32 * element_size;
                    return Ok(CtValue::Place(element_place));
                }

                // Runtime index: pin it, validate it, scale it
                let index_expr = cx.spill(index_expr, span);

                cx.push(Stmt::Assert {
                    condition: combine_and(
                        Expr {
                            ty: Type::scalar(),
                            span,
                            kind: ExprKind::Binary {
                                operator: BinaryOperatorKind::GreaterThanOrEqual,
                                lhs: Box::new(index_expr.clone()),
                                rhs: Box::new(Expr {
                                    ty: Type::scalar(),
                                    span,
                                    kind: ExprKind::Const(0.0),
                                }),
                            },
                        },
                        Expr {
                            ty: Type::scalar(),
                            span,
                            kind: ExprKind::Binary {
                                operator: BinaryOperatorKind::LessThan,
                                lhs: Box::new(index_expr.clone()),
                                rhs: Box::new(Expr {
                                    ty: Type::scalar(),
                                    span,
                                    kind: ExprKind::Const(*length as f64),
                                }),
                            },
                        },
                        span,
                    ),
                    span,
                });

                let scaled = Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Binary {
                        operator: BinaryOperatorKind::Multiply,
                        lhs: Box::new(index_expr),
                        rhs: Box::new(Expr {
                            ty: Type::scalar(),
                            span,
                            kind: ExprKind::Const(element_size as f64),
                        }),
                    },
                };

                element_place.dynamic = Some(Box::new(match element_place.dynamic.take() {
                    Some(existing) => Expr {
                        ty: Type::scalar(),
                        span,
                        kind: ExprKind::Binary {
                            operator: BinaryOperatorKind::Add,
                            lhs: existing,
                            rhs: Box::new(scaled),
                        },
                    },
                    None => scaled,
                }));

                Ok(CtValue::Place(element_place))
            }
            CtValue::Tuple(elements) => {
                let index_expr = self.scalar_expression(cx, index)?;

                let Some(value) = index_expr.as_const() else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        "tuples can only be indexed by compile-time constants",
                    ));
                };

                if value.fract() != 0.0 || value < 0.0 || value >= elements.len() as f64 {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        format!(
                            "index {value} is out of bounds for a tuple of length {}",
                            elements.len()
                        ),
                    ));
                }

                Ok(elements[value as usize].clone())
            }
            CtValue::Rvalue(expr) if matches!(&*expr.ty, TypeKind::Array { .. }) => {
                let place = cx.spill_to_place(expr, span);
                self.index_access(cx, CtValue::Place(place), index, span)
            }
            other => Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                format!("a {} cannot be indexed", describe_ct_value(&other)),
            )),
        }
    }

    /// Interprets an index expression as a list of type arguments
    fn type_argument_list(
        &mut self,
        cx: &mut BodyCx<'a>,
        index: &ast::Expression,
    ) -> CompileResult<Vec<Type>> {
        let values = match &index.kind {
            ast::ExpressionKind::Tuple(elements) => elements
                .iter()
                .map(|e| self.specialize_expression(cx, e))
                .collect::<CompileResult<Vec<_>>>()?,
            _ => vec![self.specialize_expression(cx, index)?],
        };

        values
            .into_iter()
            .map(|value| match value {
                CtValue::Type(TypePattern::Exact(ty)) => Ok(ty),
                other => Err(Diagnostic::spanned(
                    DiagnosticKind::TypeResolution,
                    index.span,
                    format!(
                        "expected a concrete type argument, found a {}",
                        describe_ct_value(&other)
                    ),
                )),
            })
            .collect()
    }

    fn specialize_call_expression(
        &mut self,
        cx: &mut BodyCx<'a>,
        callee: &ast::Expression,
        arguments: &[ast::Expression],
        span: Span,
    ) -> CompileResult<CtValue> {
        // Method calls resolve through the receiver
        if let ast::ExpressionKind::Field { object, field } = &callee.kind {
            let receiver = self.specialize_expression(cx, object)?;

            // Method calls on a constructed rvalue pin it to storage first
            let receiver = match receiver {
                CtValue::Rvalue(expr)
                    if self.unit.types.record_fields(&expr.ty).is_some() =>
                {
                    CtValue::Place(cx.spill_to_place(expr, span))
                }
                other => other,
            };

            match &receiver {
                CtValue::Archetype(archetype) => {
                    if field.symbol.value() == "at" {
                        let [index] = arguments else {
                            return Err(Diagnostic::spanned(
                                DiagnosticKind::TypeResolution,
                                span,
                                "`at` expects exactly one index argument",
                            ));
                        };

                        let index = self.scalar_expression(cx, index)?;
                        let index = cx.spill(index, span);

                        return Ok(CtValue::EntityRef {
                            archetype: *archetype,
                            index,
                        });
                    }
                }
                CtValue::Stream(slot) => {
                    return self.stream_method(cx, *slot, field, arguments, span);
                }
                CtValue::Place(place) => {
                    if field.symbol.value() == "copy_from" {
                        return self.copy_from_call(cx, place.clone(), arguments, span);
                    }

                    if let Some(instance) = self.unit.types.record_fields(&place.ty) {
                        let record = self.unit.program().record(instance.def);

                        if let Some(method) = record.methods.get(&field.symbol) {
                            let argument_values = arguments
                                .iter()
                                .map(|a| self.specialize_expression(cx, a))
                                .collect::<CompileResult<Vec<_>>>()?;

                            return self.specialize_call(
                                cx,
                                *method,
                                Some(receiver.clone()),
                                argument_values,
                                span,
                            );
                        }
                    }
                }
                _ => {}
            }

            // Not a method pattern: fall through to calling the field value
            let callee_value = self.field_access(cx, receiver, field, span)?;
            return self.call_value(cx, callee_value, arguments, span);
        }

        let callee_value = self.specialize_expression(cx, callee)?;
        self.call_value(cx, callee_value, arguments, span)
    }

    fn call_value(
        &mut self,
        cx: &mut BodyCx<'a>,
        callee: CtValue,
        arguments: &[ast::Expression],
        span: Span,
    ) -> CompileResult<CtValue> {
        match callee {
            CtValue::Function(def) => {
                let argument_values = arguments
                    .iter()
                    .map(|a| self.specialize_expression(cx, a))
                    .collect::<CompileResult<Vec<_>>>()?;

                self.specialize_call(cx, def, None, argument_values, span)
            }
            CtValue::Builtin(builtin) => self.builtin_call(cx, builtin, arguments, span),
            CtValue::Type(pattern) => self.constructor_call(cx, pattern, arguments, span),
            other => Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                format!("a {} is not callable", describe_ct_value(&other)),
            )),
        }
    }

    fn constructor_call(
        &mut self,
        cx: &mut BodyCx<'a>,
        pattern: TypePattern,
        arguments: &[ast::Expression],
        span: Span,
    ) -> CompileResult<CtValue> {
        let argument_values = arguments
            .iter()
            .map(|a| self.specialize_expression(cx, a))
            .collect::<CompileResult<Vec<_>>>()?;

        let ty = match pattern {
            TypePattern::Exact(ty) => ty,
            TypePattern::AnyRecord(def) => {
                // Infer type arguments by unifying field declarations against
                // the argument types
                self.infer_record_arguments(cx, def, &argument_values, span)?
            }
            TypePattern::AnyArray => {
                return Err(Diagnostic::spanned(
                    DiagnosticKind::TypeResolution,
                    span,
                    "arrays are constructed with `array(...)`",
                ));
            }
        };

        if argument_values.is_empty() {
            // Zero-initialized default instance
            return Ok(CtValue::Rvalue(Expr {
                ty,
                span,
                kind: ExprKind::Zero,
            }));
        }

        let Some(instance) = self.unit.types.record_fields(&ty) else {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                format!("{} is not constructible", self.unit.types.render(&ty)),
            ));
        };

        if argument_values.len() != instance.field_types.len() {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                format!(
                    "record `{}` has {} field(s) but {} argument(s) were supplied",
                    self.unit.program().record(instance.def).name.symbol,
                    instance.field_types.len(),
                    argument_values.len()
                ),
            ));
        }

        // If any field value is transient the whole instance is transient
        let any_transient = argument_values.iter().any(|v| {
            !matches!(v, CtValue::Rvalue(_) | CtValue::Place(_))
        });

        if any_transient {
            for (value, field_ty) in argument_values.iter().zip(instance.field_types.iter()) {
                if let Some(value_ty) =
                    runtime_type_of(value).or_else(|| transient_type_of(value))
                    && &value_ty != field_ty
                {
                    return Err(self.type_mismatch(field_ty, &value_ty, span));
                }
            }

            return Ok(CtValue::TransientRecord {
                ty,
                fields: argument_values,
            });
        }

        let mut fields = Vec::with_capacity(argument_values.len());

        for (value, field_ty) in argument_values.into_iter().zip(instance.field_types.iter()) {
            let expr = self.runtime_value(cx, value, span)?;

            if &expr.ty != field_ty {
                return Err(self.type_mismatch(field_ty, &expr.ty, span));
            }

            fields.push(expr);
        }

        Ok(CtValue::Rvalue(Expr {
            ty,
            span,
            kind: ExprKind::MakeRecord { fields },
        }))
    }

    /// Unifies a generic record's field annotations against constructor
    /// argument types to bind its parameters
    fn infer_record_arguments(
        &mut self,
        cx: &mut BodyCx<'a>,
        def: RecordId,
        argument_values: &[CtValue],
        span: Span,
    ) -> CompileResult<Type> {
        let record = self.unit.program().record(def);

        if argument_values.len() != record.fields.len() {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                format!(
                    "record `{}` has {} field(s) but {} argument(s) were supplied",
                    record.name.symbol,
                    record.fields.len(),
                    argument_values.len()
                ),
            ));
        }

        let mut bindings: HashMap<InternedSymbol, Type> = HashMap::new();

        for (field, value) in record.fields.iter().zip(argument_values) {
            let Some(value_ty) = runtime_type_of(value).or_else(|| transient_type_of(value)) else {
                return Err(Diagnostic::spanned(
                    DiagnosticKind::TypeResolution,
                    span,
                    format!(
                        "cannot infer a type argument from a {}",
                        describe_ct_value(value)
                    ),
                ));
            };

            self.unify(&field.ty, &value_ty, &mut bindings)?;
        }

        let arguments = record
            .type_parameters
            .iter()
            .map(|parameter| {
                bindings.get(&parameter.symbol).cloned().ok_or_else(|| {
                    Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        format!(
                            "cannot infer type argument `{}` of record `{}` from the constructor arguments",
                            parameter.symbol, record.name.symbol
                        ),
                    )
                })
            })
            .collect::<CompileResult<Vec<_>>>()?;

        let _ = cx;
        self.unit.types.instantiate_record(def, arguments, span)
    }

    fn unify(
        &self,
        annotation: &ast::Type,
        actual: &Type,
        bindings: &mut HashMap<InternedSymbol, Type>,
    ) -> CompileResult<()> {
        match &annotation.kind {
            ast::TypeKind::Named(name) => {
                // A parameter position binds; a concrete annotation constrains
                let is_parameter = name.symbol.value() != "Scalar"
                    && self.unit.program().lookup(name.symbol).is_none();

                if is_parameter {
                    if let Some(existing) = bindings.get(&name.symbol) {
                        if existing != actual {
                            return Err(Diagnostic::spanned(
                                DiagnosticKind::TypeResolution,
                                annotation.span,
                                format!(
                                    "conflicting bindings for type parameter `{}`",
                                    name.symbol
                                ),
                            ));
                        }
                    } else {
                        bindings.insert(name.symbol, actual.clone());
                    }
                }

                Ok(())
            }
            ast::TypeKind::Generic { arguments, .. } => {
                if let TypeKind::Record {
                    arguments: actual_arguments,
                    ..
                } = &**actual
                {
                    for (annotation, actual) in arguments.iter().zip(actual_arguments.iter()) {
                        self.unify(annotation, actual, bindings)?;
                    }
                }

                Ok(())
            }
            ast::TypeKind::Array { element, .. } => {
                if let TypeKind::Array {
                    element: actual_element,
                    ..
                } = &**actual
                {
                    self.unify(element, actual_element, bindings)?;
                }

                Ok(())
            }
        }
    }

    fn builtin_call(
        &mut self,
        cx: &mut BodyCx<'a>,
        builtin: Builtin,
        arguments: &[ast::Expression],
        span: Span,
    ) -> CompileResult<CtValue> {
        if let Some((op, arity)) = builtin.numeric_op() {
            if arguments.len() != arity {
                return Err(Diagnostic::spanned(
                    DiagnosticKind::TypeResolution,
                    span,
                    format!("expected {arity} argument(s)"),
                ));
            }

            let arguments = arguments
                .iter()
                .map(|a| self.scalar_expression(cx, a))
                .collect::<CompileResult<Vec<_>>>()?;

            if op.is_pure()
                && let Some(constants) = arguments
                    .iter()
                    .map(Expr::as_const)
                    .collect::<Option<Vec<_>>>()
                && let Some(folded) = consteval::fold_intrinsic(op, &constants)
            {
                return Ok(CtValue::Rvalue(Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Const(folded),
                }));
            }

            return Ok(CtValue::Rvalue(Expr {
                ty: Type::scalar(),
                span,
                kind: ExprKind::Intrinsic { op, arguments },
            }));
        }

        match builtin {
            Builtin::IsInstance => {
                let [value, expected] = arguments else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        "`isinstance` expects a value and a type",
                    ));
                };

                let value = self.specialize_expression(cx, value)?;
                let expected = self.specialize_expression(cx, expected)?;

                let CtValue::Type(pattern) = expected else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        "the second argument of `isinstance` must be a type",
                    ));
                };

                let Some(value_ty) = runtime_type_of(&value).or_else(|| transient_type_of(&value))
                else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        format!(
                            "`isinstance` cannot classify a {}",
                            describe_ct_value(&value)
                        ),
                    ));
                };

                Ok(CtValue::Rvalue(Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Const(if pattern.matches(&value_ty) { 1.0 } else { 0.0 }),
                }))
            }
            Builtin::IsSubclass => {
                let [sub, sup] = arguments else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        "`issubclass` expects two types",
                    ));
                };

                let sub = self.specialize_expression(cx, sub)?;
                let sup = self.specialize_expression(cx, sup)?;

                let (CtValue::Type(sub), CtValue::Type(sup)) = (sub, sup) else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        "both arguments of `issubclass` must be types",
                    ));
                };

                Ok(CtValue::Rvalue(Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Const(if sub.is_subpattern_of(&sup) { 1.0 } else { 0.0 }),
                }))
            }
            Builtin::Len => {
                let [value] = arguments else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        "`len` expects one argument",
                    ));
                };

                let value = self.specialize_expression(cx, value)?;

                let length = match &value {
                    CtValue::Tuple(elements) => elements.len() as f64,
                    CtValue::Place(place) => match &*place.ty {
                        TypeKind::Array { length, .. } => *length as f64,
                        _ => {
                            return Err(Diagnostic::spanned(
                                DiagnosticKind::TypeResolution,
                                span,
                                "`len` applies to arrays and tuples",
                            ));
                        }
                    },
                    CtValue::Rvalue(expr) => match &*expr.ty {
                        TypeKind::Array { length, .. } => *length as f64,
                        _ => {
                            return Err(Diagnostic::spanned(
                                DiagnosticKind::TypeResolution,
                                span,
                                "`len` applies to arrays and tuples",
                            ));
                        }
                    },
                    _ => {
                        return Err(Diagnostic::spanned(
                            DiagnosticKind::TypeResolution,
                            span,
                            "`len` applies to arrays and tuples",
                        ));
                    }
                };

                Ok(CtValue::Rvalue(Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Const(length),
                }))
            }
            Builtin::Array => {
                let elements = arguments
                    .iter()
                    .map(|a| {
                        let value = self.specialize_expression(cx, a)?;
                        self.runtime_value(cx, value, span)
                    })
                    .collect::<CompileResult<Vec<_>>>()?;

                let Some(first) = elements.first() else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        "`array` needs at least one element to determine its type",
                    ));
                };

                let element_ty = first.ty.clone();

                for element in &elements {
                    if element.ty != element_ty {
                        return Err(self.type_mismatch(&element_ty, &element.ty, element.span));
                    }
                }

                Ok(CtValue::Rvalue(Expr {
                    ty: Type::array(element_ty, elements.len() as u32),
                    span,
                    kind: ExprKind::MakeArray { elements },
                }))
            }
            Builtin::Range => {
                let make_scalar = |value: f64| Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Const(value),
                };

                let (start, stop, step) = match arguments {
                    [stop] => (make_scalar(0.0), self.scalar_expression(cx, stop)?, 1.0),
                    [start, stop] => (
                        self.scalar_expression(cx, start)?,
                        self.scalar_expression(cx, stop)?,
                        1.0,
                    ),
                    [start, stop, step] => {
                        let step = self.scalar_expression(cx, step)?;

                        let Some(step) = step.as_const() else {
                            return Err(Diagnostic::spanned(
                                DiagnosticKind::TypeResolution,
                                span,
                                "`range` step must be a compile-time constant",
                            ));
                        };

                        if step == 0.0 {
                            return Err(Diagnostic::spanned(
                                DiagnosticKind::TypeResolution,
                                span,
                                "`range` step cannot be zero",
                            ));
                        }

                        (
                            self.scalar_expression(cx, start)?,
                            self.scalar_expression(cx, stop)?,
                            step,
                        )
                    }
                    _ => {
                        return Err(Diagnostic::spanned(
                            DiagnosticKind::TypeResolution,
                            span,
                            "`range` expects between one and three arguments",
                        ));
                    }
                };

                Ok(CtValue::Range { start, stop, step })
            }
            Builtin::Spawn => {
                let [archetype, rest @ ..] = arguments else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        "`spawn` expects an archetype and its memory values",
                    ));
                };

                if cx.callback.is_parallel() {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::InvalidAccess,
                        span,
                        format!(
                            "`spawn` is only available in sequential callbacks, not `{}`",
                            cx.callback.engine_name()
                        ),
                    ));
                }

                let archetype_value = self.specialize_expression(cx, archetype)?;

                let CtValue::Archetype(archetype_id) = archetype_value else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        archetype.span,
                        "the first argument of `spawn` must be an archetype",
                    ));
                };

                let Some(number) = self.unit.archetype_number(archetype_id) else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        archetype.span,
                        format!(
                            "archetype `{}` is not part of the {} mode",
                            self.unit.program().archetype(archetype_id).name.symbol,
                            self.unit.mode
                        ),
                    ));
                };

                let expected = self.unit.layout.archetypes[archetype_id].entity_memory_size;

                if rest.len() as u32 != expected {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        format!(
                            "`spawn` of `{}` expects {expected} memory value(s) but {} were supplied",
                            self.unit.program().archetype(archetype_id).name.symbol,
                            rest.len()
                        ),
                    ));
                }

                let mut op_arguments = vec![Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Const(number as f64),
                }];

                for argument in rest {
                    op_arguments.push(self.scalar_expression(cx, argument)?);
                }

                cx.push(Stmt::Expr(Expr {
                    ty: Type::none(),
                    span,
                    kind: ExprKind::Intrinsic {
                        op: Op::Spawn,
                        arguments: op_arguments,
                    },
                }));

                Ok(CtValue::None)
            }
            Builtin::EntityIndex => {
                if !arguments.is_empty() {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        "`entity_index` takes no arguments",
                    ));
                }

                self.check_block_readable(Block::EntityInfo, span)?;

                Ok(CtValue::Place(Place::block(
                    Block::EntityInfo,
                    0,
                    Type::scalar(),
                )))
            }
            Builtin::DebugLog => {
                let [value] = arguments else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        "`debug_log` expects one scalar",
                    ));
                };

                let value = self.scalar_expression(cx, value)?;

                cx.push(Stmt::Expr(Expr {
                    ty: Type::none(),
                    span,
                    kind: ExprKind::Intrinsic {
                        op: Op::DebugLog,
                        arguments: vec![value],
                    },
                }));

                Ok(CtValue::None)
            }
            _ => Err(Diagnostic::internal(format!(
                "builtin {builtin:?} reached the generic call path"
            ))),
        }
    }

    fn stream_method(
        &mut self,
        cx: &mut BodyCx<'a>,
        slot_index: usize,
        method: &ast::Identifier,
        arguments: &[ast::Expression],
        span: Span,
    ) -> CompileResult<CtValue> {
        let slot = self.unit.layout.streams[slot_index].clone();

        match method.symbol.value() {
            "set" => {
                if !self.unit.mode.records_streams() {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::InvalidAccess,
                        span,
                        format!(
                            "streams are recorded during play; `{}` cannot write them in {} mode",
                            slot.name, self.unit.mode
                        ),
                    ));
                }

                if !cx.callback.is_sequential() {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::InvalidAccess,
                        span,
                        "streams can only be written from sequential callbacks",
                    ));
                }

                let [key, value] = arguments else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        "`set` expects a key and a value",
                    ));
                };

                let key = self.scalar_expression(cx, key)?;
                let key = cx.spill(key, span);
                let value = self.specialize_expression(cx, value)?;
                let value = self.runtime_value(cx, value, span)?;

                if value.ty != slot.element {
                    return Err(self.type_mismatch(&slot.element, &value.ty, span));
                }

                // One backing stream per cell of the element type
                let cells = self.unit.types.size_of(&slot.element, span)?;
                let source = cx.spill_to_place(value, span);

                for cell in 0..cells {
                    let mut cell_place = source.clone();
                    cell_place.ty = Type::scalar();
                    cell_place.offset += cell;

                    cx.push(Stmt::Expr(Expr {
                        ty: Type::none(),
                        span,
                        kind: ExprKind::Intrinsic {
                            op: Op::StreamSet,
                            arguments: vec![
                                Expr {
                                    ty: Type::scalar(),
                                    span,
                                    kind: ExprKind::Const((slot.start + cell) as f64),
                                },
                                key.clone(),
                                read_place(cell_place, span),
                            ],
                        },
                    }));
                }

                Ok(CtValue::None)
            }
            "get" => {
                if !self.unit.mode.replays_streams() {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::InvalidAccess,
                        span,
                        format!(
                            "streams replay during watch; `{}` cannot be read in {} mode",
                            slot.name, self.unit.mode
                        ),
                    ));
                }

                let [key] = arguments else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        "`get` expects a key",
                    ));
                };

                let key = self.scalar_expression(cx, key)?;
                let key = cx.spill(key, span);

                if slot.element.is_scalar() {
                    return Ok(CtValue::Rvalue(Expr {
                        ty: Type::scalar(),
                        span,
                        kind: ExprKind::Intrinsic {
                            op: Op::StreamGetValue,
                            arguments: vec![
                                Expr {
                                    ty: Type::scalar(),
                                    span,
                                    kind: ExprKind::Const(slot.start as f64),
                                },
                                key,
                            ],
                        },
                    }));
                }

                // Aggregate elements are materialized cell by cell
                let cells = self.unit.types.size_of(&slot.element, span)?;
                let target_local = cx.new_local(
                    InternedSymbol::new("__stream_value"),
                    slot.element.clone(),
                    span,
                    false,
                );
                cx.push(Stmt::Assign {
                    local: target_local,
                    value: Expr {
                        ty: slot.element.clone(),
                        span,
                        kind: ExprKind::Zero,
                    },
                    span,
                });

                for cell in 0..cells {
                    let mut cell_place = Place::local(target_local, slot.element.clone());
                    cell_place.ty = Type::scalar();
                    cell_place.offset += cell;

                    cx.push(Stmt::Store {
                        place: cell_place,
                        value: Expr {
                            ty: Type::scalar(),
                            span,
                            kind: ExprKind::Intrinsic {
                                op: Op::StreamGetValue,
                                arguments: vec![
                                    Expr {
                                        ty: Type::scalar(),
                                        span,
                                        kind: ExprKind::Const((slot.start + cell) as f64),
                                    },
                                    key.clone(),
                                ],
                            },
                        },
                        span,
                    });
                }

                Ok(CtValue::Place(Place::local(
                    target_local,
                    slot.element.clone(),
                )))
            }
            other => Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                method.span,
                format!("streams have no method `{other}`"),
            )),
        }
    }

    fn copy_from_call(
        &mut self,
        cx: &mut BodyCx<'a>,
        target: Place,
        arguments: &[ast::Expression],
        span: Span,
    ) -> CompileResult<CtValue> {
        let [source] = arguments else {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                "`copy_from` expects exactly one argument",
            ));
        };

        if target.ty.is_scalar() {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                "`copy_from` applies to records and arrays; assign scalars directly",
            ));
        }

        self.check_place_writable(cx, &target, span)?;

        let source = self.specialize_expression(cx, source)?;
        let source = self.runtime_value(cx, source, span)?;

        if source.ty != target.ty {
            return Err(self.type_mismatch(&target.ty, &source.ty, span));
        }

        cx.push(Stmt::CopyInto {
            target,
            value: source,
            span,
        });

        Ok(CtValue::None)
    }

    /* Operators */

    fn binary_operation(
        &mut self,
        cx: &mut BodyCx<'a>,
        operator: BinaryOperatorKind,
        lhs: CtValue,
        rhs: CtValue,
        span: Span,
    ) -> CompileResult<CtValue> {
        let lhs_scalar = runtime_type_of(&lhs).is_some_and(|t| t.is_scalar());
        let rhs_scalar = runtime_type_of(&rhs).is_some_and(|t| t.is_scalar());

        if lhs_scalar && rhs_scalar {
            let lhs = self.runtime_value(cx, lhs, span)?;
            let rhs = self.runtime_value(cx, rhs, span)?;

            return Ok(CtValue::Rvalue(self.fold_or_binary(operator, lhs, rhs, span)?));
        }

        self.record_binary_op(cx, operator, lhs, rhs, span)
    }

    /// Binary operators over records resolve to operator methods, falling
    /// back to structural equality for `==`/`!=`
    fn record_binary_op(
        &mut self,
        cx: &mut BodyCx<'a>,
        operator: BinaryOperatorKind,
        lhs: CtValue,
        rhs: CtValue,
        span: Span,
    ) -> CompileResult<CtValue> {
        let Some(lhs_ty) = runtime_type_of(&lhs) else {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                format!(
                    "operator `{operator}` is not defined for a {}",
                    describe_ct_value(&lhs)
                ),
            ));
        };

        let instance = self.unit.types.record_fields(&lhs_ty);

        // `a <= b` and `a >= b` derive from the swapped strict comparison
        let (method_name, swap, negate) = match operator {
            BinaryOperatorKind::LessThanOrEqual => ("lt", true, true),
            BinaryOperatorKind::GreaterThanOrEqual => ("lt", false, true),
            BinaryOperatorKind::GreaterThan => ("lt", true, false),
            BinaryOperatorKind::NotEqual => ("eq", false, true),
            _ => (
                operator.method_name().unwrap_or(""),
                false,
                false,
            ),
        };

        let method = instance.as_ref().and_then(|instance| {
            self.unit
                .program()
                .record(instance.def)
                .methods
                .get(&InternedSymbol::new(method_name))
                .copied()
        });

        let result = match method {
            Some(method) => {
                let (receiver, argument) = if swap { (rhs, lhs) } else { (lhs, rhs) };

                self.specialize_call(cx, method, Some(receiver), vec![argument], span)?
            }
            None if matches!(
                operator,
                BinaryOperatorKind::Equal | BinaryOperatorKind::NotEqual
            ) =>
            {
                // Structural equality: compare cell by cell
                let rhs_ty = runtime_type_of(&rhs).ok_or_else(|| {
                    Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        span,
                        format!(
                            "cannot compare a value with a {}",
                            describe_ct_value(&rhs)
                        ),
                    )
                })?;

                if rhs_ty != lhs_ty {
                    return Err(self.type_mismatch(&lhs_ty, &rhs_ty, span));
                }

                let lhs_expr = self.runtime_value(cx, lhs, span)?;
                let rhs_expr = self.runtime_value(cx, rhs, span)?;
                let lhs_place = cx.spill_to_place(lhs_expr, span);
                let rhs_place = cx.spill_to_place(rhs_expr, span);

                let cells = self.unit.types.size_of(&lhs_ty, span)?;
                let mut comparison: Option<Expr> = None;

                for cell in 0..cells {
                    let mut a = lhs_place.clone();
                    a.ty = Type::scalar();
                    a.offset += cell;

                    let mut b = rhs_place.clone();
                    b.ty = Type::scalar();
                    b.offset += cell;

                    let equal = Expr {
                        ty: Type::scalar(),
                        span,
                        kind: ExprKind::Binary {
                            operator: BinaryOperatorKind::Equal,
                            lhs: Box::new(read_place(a, span)),
                            rhs: Box::new(read_place(b, span)),
                        },
                    };

                    comparison = Some(match comparison {
                        Some(existing) => combine_and(existing, equal, span),
                        None => equal,
                    });
                }

                CtValue::Rvalue(comparison.unwrap_or(Expr {
                    ty: Type::scalar(),
                    span,
                    kind: ExprKind::Const(1.0),
                }))
            }
            None => {
                return Err(Diagnostic::spanned(
                    DiagnosticKind::TypeResolution,
                    span,
                    format!(
                        "type {} does not define operator `{operator}` (method `{method_name}`)",
                        self.unit.types.render(&lhs_ty)
                    ),
                ));
            }
        };

        if !negate {
            return Ok(result);
        }

        let expr = self.runtime_value(cx, result, span)?;

        if !expr.ty.is_scalar() {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                "comparison methods must return a Scalar",
            ));
        }

        if let Some(value) = expr.as_const() {
            return Ok(CtValue::Rvalue(Expr {
                ty: Type::scalar(),
                span,
                kind: ExprKind::Const(consteval::fold_unary(UnaryOperatorKind::Not, value)),
            }));
        }

        Ok(CtValue::Rvalue(Expr {
            ty: Type::scalar(),
            span,
            kind: ExprKind::Unary {
                operator: UnaryOperatorKind::Not,
                operand: Box::new(expr),
            },
        }))
    }

    fn fold_and(&self, lhs: Expr, rhs: Expr, span: Span) -> CompileResult<Expr> {
        match (lhs.as_const(), rhs.as_const()) {
            (Some(a), _) if !consteval::is_truthy(a) => Ok(lhs),
            (Some(_), _) => Ok(rhs),
            (None, Some(b)) if consteval::is_truthy(b) => Ok(lhs),
            _ => Ok(combine_and(lhs, rhs, span)),
        }
    }

    fn fold_or_binary(
        &self,
        operator: BinaryOperatorKind,
        lhs: Expr,
        rhs: Expr,
        span: Span,
    ) -> CompileResult<Expr> {
        if let (Some(a), Some(b)) = (lhs.as_const(), rhs.as_const()) {
            let Some(folded) = consteval::fold_binary(operator, a, b) else {
                return Err(Diagnostic::spanned(
                    DiagnosticKind::TypeResolution,
                    span,
                    format!("`{a} {operator} {b}` does not evaluate to a valid number"),
                ));
            };

            return Ok(Expr {
                ty: Type::scalar(),
                span,
                kind: ExprKind::Const(folded),
            });
        }

        Ok(Expr {
            ty: Type::scalar(),
            span,
            kind: ExprKind::Binary {
                operator,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
        })
    }

    /* Helpers */

    /// Specializes an expression that must produce a runtime scalar
    fn scalar_expression(
        &mut self,
        cx: &mut BodyCx<'a>,
        expression: &ast::Expression,
    ) -> CompileResult<Expr> {
        let value = self.specialize_expression(cx, expression)?;
        let expr = self.runtime_value(cx, value, expression.span)?;

        if !expr.ty.is_scalar() {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                expression.span,
                format!(
                    "expected a Scalar here, found {}",
                    self.unit.types.render(&expr.ty)
                ),
            ));
        }

        Ok(expr)
    }

    /// Lowers a compile-time value to a runtime expression, or fails for
    /// values that have no runtime form
    fn runtime_value(
        &mut self,
        cx: &mut BodyCx<'a>,
        value: CtValue,
        span: Span,
    ) -> CompileResult<Expr> {
        let _ = cx;
        match value {
            CtValue::Rvalue(expr) => Ok(expr),
            CtValue::Place(place) => {
                if matches!(place.base, PlaceBase::ExportKey(_)) {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::InvalidAccess,
                        span,
                        "exported fields are write-only",
                    ));
                }

                Ok(read_place(place, span))
            }
            other => Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                format!(
                    "a {} has no runtime value",
                    describe_ct_value(&other)
                ),
            )),
        }
    }

    fn check_place_writable(
        &self,
        cx: &BodyCx<'a>,
        place: &Place,
        span: Span,
    ) -> CompileResult<()> {
        match place.base {
            PlaceBase::Local(_) => Ok(()),
            PlaceBase::ExportKey(_) => {
                if self.unit.mode != Mode::Play {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::InvalidAccess,
                        span,
                        format!(
                            "exported fields are only written in play mode, not {}",
                            self.unit.mode
                        ),
                    ));
                }

                Ok(())
            }
            PlaceBase::Block(block) => {
                if !block.writable_in(self.unit.mode, cx.callback) {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::InvalidAccess,
                        span,
                        format!(
                            "this storage cannot be written from the `{}` callback",
                            cx.callback.engine_name()
                        ),
                    ));
                }

                Ok(())
            }
        }
    }

    fn check_block_readable(&self, block: Block, span: Span) -> CompileResult<()> {
        if block.id_in(self.unit.mode).is_none() {
            return Err(Diagnostic::spanned(
                DiagnosticKind::InvalidAccess,
                span,
                format!("this storage does not exist in {} mode", self.unit.mode),
            ));
        }

        Ok(())
    }

    fn type_mismatch(&self, expected: &Type, actual: &Type, span: Span) -> Diagnostic {
        Diagnostic::spanned(
            DiagnosticKind::TypeResolution,
            span,
            format!(
                "expected {} but found {}",
                self.unit.types.render(expected),
                self.unit.types.render(actual)
            ),
        )
    }
}

/* Body context */

/// Mutable state while specializing one body
struct BodyCx<'a> {
    callback: Callback,
    span: Span,
    body_locals: IndexVec<LocalId, hir::Local>,
    out: Vec<Vec<Stmt>>,
    scopes: Vec<HashMap<InternedSymbol, Binding>>,
    /// Flow-sensitive constant knowledge about scalar locals
    consts: HashMap<LocalId, Lattice>,
    return_types: Vec<(Type, Span)>,
    loop_depth: usize,
    _unit: core::marker::PhantomData<&'a ()>,
}

impl<'a> BodyCx<'a> {
    fn new(_unit: UnitCtx<'a>, callback: Callback, span: Span) -> Self {
        Self {
            callback,
            span,
            body_locals: IndexVec::new(),
            out: vec![Vec::new()],
            scopes: vec![HashMap::new()],
            consts: HashMap::new(),
            return_types: Vec::new(),
            loop_depth: 0,
            _unit: core::marker::PhantomData,
        }
    }

    fn new_local(
        &mut self,
        name: InternedSymbol,
        ty: Type,
        span: Span,
        is_parameter: bool,
    ) -> LocalId {
        self.body_locals.push(hir::Local {
            name,
            ty,
            span,
            is_parameter,
        })
    }

    fn truncate_locals(&mut self, len: usize) {
        while self.body_locals.len() > len {
            self.body_locals.pop();
        }
    }

    fn push(&mut self, statement: Stmt) {
        self.out
            .last_mut()
            .expect("an output frame is always open")
            .push(statement);
    }

    /// Runs `f` collecting emitted statements into a fresh list
    fn collect(
        &mut self,
        f: impl FnOnce(&mut Self) -> CompileResult<()>,
    ) -> CompileResult<Vec<Stmt>> {
        self.collect_with(f).map(|(statements, ())| statements)
    }

    /// Like [`Self::collect`] but also returns the closure's value
    fn collect_with<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> CompileResult<T>,
    ) -> CompileResult<(Vec<Stmt>, T)> {
        self.out.push(Vec::new());
        let result = f(self);
        let statements = self.out.pop().expect("frame pushed above");

        result.map(|value| (statements, value))
    }

    fn bind(&mut self, name: InternedSymbol, binding: Binding) {
        self.scopes
            .last_mut()
            .expect("a scope is always open")
            .insert(name, binding);
    }

    /// Updates an existing binding in whichever scope holds it
    fn rebind(&mut self, name: InternedSymbol, binding: Binding) {
        for scope in self.scopes.iter_mut().rev() {
            if scope.contains_key(&name) {
                scope.insert(name, binding);
                return;
            }
        }

        self.bind(name, binding);
    }

    fn lookup(&self, name: InternedSymbol) -> Option<Binding> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(&name).cloned())
    }

    fn snapshot_scopes(&self) -> Vec<HashMap<InternedSymbol, Binding>> {
        self.scopes.clone()
    }

    fn restore_scopes(&mut self, scopes: Vec<HashMap<InternedSymbol, Binding>>) {
        self.scopes = scopes;
    }

    /// Poisons transient bindings that were rebound on a control path, so a
    /// later read reports ambiguity instead of silently using one path's value
    fn poison_diverging(
        &mut self,
        before: &[HashMap<InternedSymbol, Binding>],
        after: &[HashMap<InternedSymbol, Binding>],
    ) {
        for (depth, (before_scope, after_scope)) in before.iter().zip(after.iter()).enumerate() {
            for (name, old_binding) in before_scope {
                let Some(new_binding) = after_scope.get(name) else {
                    continue;
                };

                let diverged = match (old_binding, new_binding) {
                    (Binding::Local(a), Binding::Local(b)) => a != b,
                    (Binding::Value(_), Binding::Value(_)) => {
                        !same_ct_binding(old_binding, new_binding)
                    }
                    (Binding::Poisoned(_), _) | (_, Binding::Poisoned(_)) => false,
                    _ => true,
                };

                if diverged && depth < self.scopes.len() {
                    self.scopes[depth].insert(*name, Binding::Poisoned(self.span));
                }
            }
        }
    }

    fn merge_consts(&mut self, other: HashMap<LocalId, Lattice>) {
        for (local, lattice) in other {
            let merged = self
                .consts
                .get(&local)
                .copied()
                .unwrap_or(Lattice::Unknown)
                .merge(lattice);
            self.consts.insert(local, merged);
        }
    }

    fn read_scalar_local(&self, local: LocalId, span: Span) -> Expr {
        if let Some(Lattice::Constant(value)) = self.consts.get(&local) {
            return Expr {
                ty: Type::scalar(),
                span,
                kind: ExprKind::Const(*value),
            };
        }

        Expr {
            ty: Type::scalar(),
            span,
            kind: ExprKind::ReadLocal(local),
        }
    }

    /// Pins a scalar expression to a temporary so it is evaluated exactly once
    fn spill(&mut self, expr: Expr, span: Span) -> Expr {
        if matches!(expr.kind, ExprKind::Const(_) | ExprKind::ReadLocal(_)) {
            return expr;
        }

        let ty = expr.ty.clone();
        let local = self.new_local(InternedSymbol::new("__tmp"), ty.clone(), span, false);
        self.consts.insert(local, Lattice::NotConstant);
        self.push(Stmt::Assign {
            local,
            value: expr,
            span,
        });

        Expr {
            ty,
            span,
            kind: ExprKind::ReadLocal(local),
        }
    }

    /// Materializes a value into local storage and returns its place
    fn spill_to_place(&mut self, expr: Expr, span: Span) -> Place {
        let ty = expr.ty.clone();
        let local = self.new_local(InternedSymbol::new("__tmp"), ty.clone(), span, false);

        if ty.is_scalar() {
            self.consts.insert(local, Lattice::NotConstant);
        }

        self.push(Stmt::Assign {
            local,
            value: expr,
            span,
        });

        Place::local(local, ty)
    }

    /// Unifies the recorded return types into the body's return type
    fn unified_return_type(&self) -> CompileResult<Type> {
        let mut result: Option<(Type, Span)> = None;

        for (ty, span) in &self.return_types {
            match &result {
                None => result = Some((ty.clone(), *span)),
                Some((existing, existing_span)) => {
                    if existing != ty {
                        return Err(Diagnostic::spanned(
                            DiagnosticKind::TypeResolution,
                            *span,
                            "function returns values of different types",
                        )
                        .with_related("previous return here", *existing_span));
                    }
                }
            }
        }

        Ok(result.map(|(ty, _)| ty).unwrap_or_else(Type::none))
    }

    fn finish(self, return_type: Type) -> Body {
        let mut out = self.out;
        let statements = out.pop().expect("the root frame remains");
        debug_assert!(out.is_empty());

        Body {
            locals: self.body_locals,
            statements,
            return_type,
            span: self.span,
        }
    }
}

/* Free helpers */

fn read_place(place: Place, span: Span) -> Expr {
    Expr {
        ty: place.ty.clone(),
        span,
        kind: ExprKind::ReadPlace(place),
    }
}

fn combine_and(lhs: Expr, rhs: Expr, span: Span) -> Expr {
    Expr {
        ty: Type::scalar(),
        span,
        kind: ExprKind::Logical {
            is_and: true,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
    }
}

fn binding_for_value(value: CtValue) -> Binding {
    Binding::Value(value)
}

/// The runtime type of a value, if it has one
fn runtime_type_of(value: &CtValue) -> Option<Type> {
    match value {
        CtValue::Rvalue(expr) => Some(expr.ty.clone()),
        CtValue::Place(place) => Some(place.ty.clone()),
        _ => None,
    }
}

/// The compile-time type of a transient value, for instance checks
fn transient_type_of(value: &CtValue) -> Option<Type> {
    match value {
        CtValue::None => Some(Type::none()),
        CtValue::Tuple(elements) => {
            let element_types = elements
                .iter()
                .map(|e| runtime_type_of(e).or_else(|| transient_type_of(e)))
                .collect::<Option<Vec<_>>>()?;
            Some(Type::tuple(element_types))
        }
        CtValue::Function(def) => Some(Type::function_ref(*def)),
        CtValue::EntityRef { archetype, .. } => Some(Type::entity_ref(*archetype)),
        CtValue::TransientRecord { ty, .. } => Some(ty.clone()),
        _ => None,
    }
}

fn describe_ct_value(value: &CtValue) -> &'static str {
    match value {
        CtValue::Rvalue(_) => "runtime value",
        CtValue::Place(_) => "storage location",
        CtValue::None => "none value",
        CtValue::Tuple(_) => "tuple",
        CtValue::Type(_) => "type",
        CtValue::Function(_) => "function reference",
        CtValue::Archetype(_) => "archetype",
        CtValue::SelfEntity(_) => "entity",
        CtValue::EntityRef { .. } => "entity reference",
        CtValue::LevelGlobal(_) => "level global namespace",
        CtValue::Streams => "streams namespace",
        CtValue::Stream(_) => "stream",
        CtValue::Range { .. } => "range",
        CtValue::TransientRecord { .. } => "transient record",
        CtValue::Builtin(_) => "builtin",
    }
}

/// Compares two compile-time bindings for control-flow merging. Only
/// identical denotations survive a join.
fn same_ct_binding(a: &Binding, b: &Binding) -> bool {
    match (a, b) {
        (Binding::Value(a), Binding::Value(b)) => match (a, b) {
            (CtValue::Type(x), CtValue::Type(y)) => x == y,
            (CtValue::Function(x), CtValue::Function(y)) => x == y,
            (CtValue::Archetype(x), CtValue::Archetype(y)) => x == y,
            (CtValue::SelfEntity(x), CtValue::SelfEntity(y)) => x == y,
            (CtValue::LevelGlobal(x), CtValue::LevelGlobal(y)) => x == y,
            (CtValue::Streams, CtValue::Streams) => true,
            (CtValue::Stream(x), CtValue::Stream(y)) => x == y,
            (CtValue::None, CtValue::None) => true,
            (CtValue::Builtin(x), CtValue::Builtin(y)) => x == y,
            _ => false,
        },
        _ => false,
    }
}

/// Scans a block for `break`/`continue` at the current loop level, for the
/// tuple-unrolling restriction
fn find_loop_jump(block: &ast::Block) -> Option<Span> {
    fn scan(statements: &[ast::Statement]) -> Option<Span> {
        for statement in statements {
            match &statement.kind {
                ast::StatementKind::Break | ast::StatementKind::Continue => {
                    return Some(statement.span);
                }
                ast::StatementKind::If(if_statement) => {
                    if let Some(span) = scan(&if_statement.then_block.statements) {
                        return Some(span);
                    }

                    if let Some(else_block) = &if_statement.else_block
                        && let Some(span) = scan(&else_block.statements)
                    {
                        return Some(span);
                    }
                }
                ast::StatementKind::Match(match_statement) => {
                    for arm in &match_statement.arms {
                        if let Some(span) = scan(&arm.body.statements) {
                            return Some(span);
                        }
                    }
                }
                // Nested loops own their jumps
                ast::StatementKind::While(_) | ast::StatementKind::For(_) => {}
                _ => {}
            }
        }

        None
    }

    scan(&block.statements)
}
