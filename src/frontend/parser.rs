use crate::{
    diagnostics::{CompileResult, Diagnostic, DiagnosticKind},
    frontend::{
        SourceFile, SourceId, Span,
        ast::{
            ArchetypeDefinition, ArchetypeFieldDefinition, AssignmentOperator,
            AssignmentOperatorKind, BinaryOperator, BinaryOperatorKind, Block, Expression,
            ExpressionKind, FieldDefinition, ForStatement, FunctionDefinition, Identifier,
            IfStatement, Item, ItemKind, LevelGlobalDefinition, LevelGlobalKind, Literal,
            LogicalOperator, MatchArm, MatchStatement, Module, NodeId, Pattern, PatternKind,
            RecordDefinition, Statement, StatementKind, StorageClass, StreamEntry,
            StreamsDefinition, Type, TypeKind, UnaryOperator, UnaryOperatorKind, WhileStatement,
        },
        intern::InternedSymbol,
        lexer::{Keyword, Lexer, Token, TokenKind},
    },
};

#[derive(Debug)]
pub struct Parser<'source> {
    lexer: Lexer<'source>,
    next_node_id: u32,
}

impl<'source> Parser<'source> {
    pub fn parse_module(
        source_file: &'source SourceFile,
        source_id: SourceId,
    ) -> CompileResult<Module> {
        let mut parser = Self {
            lexer: Lexer::new(source_file, source_id),
            next_node_id: 0,
        };

        let mut module = Module { items: Vec::new() };

        while parser.lexer.peek()?.is_some() {
            module.items.push(parser.parse_item()?);
        }

        Ok(module)
    }

    fn create_node_id(&mut self) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        id
    }

    fn error(&self, span: Span, message: impl Into<String>) -> Diagnostic {
        Diagnostic::spanned(DiagnosticKind::Syntax, span, message)
    }

    fn unsupported(&self, span: Span, construct: &str) -> Diagnostic {
        Diagnostic::spanned(
            DiagnosticKind::UnsupportedConstruct,
            span,
            format!("`{construct}` is not supported; the target runtime cannot express it"),
        )
    }

    fn expect_peek(&mut self, expecting: &str) -> CompileResult<Token> {
        self.lexer.peek()?.ok_or_else(|| {
            self.error(
                self.lexer.here(),
                format!("Expected {expecting} but reached end of file"),
            )
        })
    }

    fn expect_next(&mut self, expecting: &str) -> CompileResult<Token> {
        self.lexer.next()?.ok_or_else(|| {
            self.error(
                self.lexer.here(),
                format!("Expected {expecting} but reached end of file"),
            )
        })
    }

    fn expect_next_to_be(&mut self, kind: TokenKind) -> CompileResult<Token> {
        let token = self.expect_next(&format!("{kind:?}"))?;

        if token.kind != kind {
            return Err(self.error(
                token.span,
                format!(
                    "Expected {:?} but found {:?} ({})",
                    kind,
                    token.kind,
                    self.lexer.source().value_of_span(token.span)
                ),
            ));
        }

        Ok(token)
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> CompileResult<Token> {
        self.expect_next_to_be(TokenKind::Keyword(keyword))
    }

    fn eat(&mut self, kind: TokenKind) -> CompileResult<Option<Token>> {
        if self.lexer.peek()?.is_some_and(|t| t.kind == kind) {
            return Ok(self.lexer.next()?);
        }

        Ok(None)
    }

    fn peek_is(&mut self, kind: TokenKind) -> CompileResult<bool> {
        Ok(self.lexer.peek()?.is_some_and(|t| t.kind == kind))
    }

    /* Items */

    fn parse_item(&mut self) -> CompileResult<Item> {
        let peeked = self.expect_peek("item")?;

        match peeked.kind {
            TokenKind::Keyword(Keyword::Fn) => {
                let function = Box::new(self.parse_function_definition()?);

                Ok(Item {
                    id: self.create_node_id(),
                    span: function.span,
                    kind: ItemKind::FunctionDefinition(function),
                })
            }
            TokenKind::Keyword(Keyword::Record) => {
                let record = Box::new(self.parse_record_definition()?);

                Ok(Item {
                    id: self.create_node_id(),
                    span: record.span,
                    kind: ItemKind::RecordDefinition(record),
                })
            }
            TokenKind::Keyword(Keyword::Archetype) => {
                let archetype = Box::new(self.parse_archetype_definition()?);

                Ok(Item {
                    id: self.create_node_id(),
                    span: archetype.span,
                    kind: ItemKind::ArchetypeDefinition(archetype),
                })
            }
            TokenKind::Keyword(kw @ (Keyword::LevelMemory | Keyword::LevelData)) => {
                let global = Box::new(self.parse_level_global_definition(kw)?);

                Ok(Item {
                    id: self.create_node_id(),
                    span: global.span,
                    kind: ItemKind::LevelGlobalDefinition(global),
                })
            }
            TokenKind::Keyword(Keyword::Streams) => {
                let streams = Box::new(self.parse_streams_definition()?);

                Ok(Item {
                    id: self.create_node_id(),
                    span: streams.span,
                    kind: ItemKind::StreamsDefinition(streams),
                })
            }
            TokenKind::Keyword(kw) if kw.is_rejected() => Err(self.unsupported(
                peeked.span,
                self.lexer.source().value_of_span(peeked.span),
            )),
            _ => Err(self.error(
                peeked.span,
                format!(
                    "Expected item definition but found: {} ({:?})",
                    self.lexer.source().value_of_span(peeked.span),
                    peeked.kind
                ),
            )),
        }
    }

    /// fn name(param, param) { ... }
    fn parse_function_definition(&mut self) -> CompileResult<FunctionDefinition> {
        let fn_keyword = self.expect_keyword(Keyword::Fn)?;

        let name = self.parse_identifier()?;

        self.expect_next_to_be(TokenKind::OpenParen)?;

        let mut parameters = Vec::new();

        while !self.peek_is(TokenKind::CloseParen)? {
            parameters.push(self.parse_identifier()?);

            if self.eat(TokenKind::Comma)?.is_none() {
                break;
            }
        }

        self.expect_next_to_be(TokenKind::CloseParen)?;

        let body = self.parse_block()?;

        Ok(FunctionDefinition {
            id: self.create_node_id(),
            span: fn_keyword.span.to(body.span),
            name,
            parameters,
            body,
        })
    }

    /// record Name[T, U] { field: T; fn method(self) { ... } }
    fn parse_record_definition(&mut self) -> CompileResult<RecordDefinition> {
        let record_keyword = self.expect_keyword(Keyword::Record)?;

        let name = self.parse_identifier()?;

        let mut type_parameters = Vec::new();

        if self.eat(TokenKind::OpenBracket)?.is_some() {
            while !self.peek_is(TokenKind::CloseBracket)? {
                type_parameters.push(self.parse_identifier()?);

                if self.eat(TokenKind::Comma)?.is_none() {
                    break;
                }
            }

            self.expect_next_to_be(TokenKind::CloseBracket)?;
        }

        self.expect_next_to_be(TokenKind::OpenBrace)?;

        let mut fields = Vec::new();
        let mut methods = Vec::new();

        loop {
            let peeked = self.expect_peek("record field, method, or `}`")?;

            match peeked.kind {
                TokenKind::CloseBrace => break,
                TokenKind::Keyword(Keyword::Fn) => methods.push(self.parse_function_definition()?),
                TokenKind::Identifier => fields.push(self.parse_field_definition()?),
                _ => {
                    return Err(self.error(
                        peeked.span,
                        format!(
                            "Expected record field or method but found: {}",
                            self.lexer.source().value_of_span(peeked.span)
                        ),
                    ));
                }
            }
        }

        let close = self.expect_next_to_be(TokenKind::CloseBrace)?;

        Ok(RecordDefinition {
            id: self.create_node_id(),
            span: record_keyword.span.to(close.span),
            name,
            type_parameters,
            fields,
            methods,
        })
    }

    /// name: Type; (a trailing comma is accepted in place of the semicolon)
    fn parse_field_definition(&mut self) -> CompileResult<FieldDefinition> {
        let name = self.parse_identifier()?;

        self.expect_next_to_be(TokenKind::Colon)?;

        let ty = self.parse_type()?;

        let end = if let Some(t) = self.eat(TokenKind::Semicolon)? {
            t.span
        } else if let Some(t) = self.eat(TokenKind::Comma)? {
            t.span
        } else {
            ty.span
        };

        Ok(FieldDefinition {
            id: self.create_node_id(),
            span: name.span.to(end),
            name,
            ty,
        })
    }

    /// archetype Name { imported lane: Scalar; fn initialize(self) { ... } }
    fn parse_archetype_definition(&mut self) -> CompileResult<ArchetypeDefinition> {
        let archetype_keyword = self.expect_keyword(Keyword::Archetype)?;

        let name = self.parse_identifier()?;

        self.expect_next_to_be(TokenKind::OpenBrace)?;

        let mut fields = Vec::new();
        let mut callbacks = Vec::new();

        loop {
            let peeked = self.expect_peek("archetype field, callback, or `}`")?;

            let storage = match peeked.kind {
                TokenKind::CloseBrace => break,
                TokenKind::Keyword(Keyword::Fn) => {
                    callbacks.push(self.parse_function_definition()?);
                    continue;
                }
                TokenKind::Keyword(Keyword::Imported) => StorageClass::Imported,
                TokenKind::Keyword(Keyword::Exported) => StorageClass::Exported,
                TokenKind::Keyword(Keyword::Data) => StorageClass::EntityData,
                TokenKind::Keyword(Keyword::Memory) => StorageClass::EntityMemory,
                TokenKind::Keyword(Keyword::Shared) => StorageClass::SharedMemory,
                _ => {
                    return Err(self.error(
                        peeked.span,
                        format!(
                            "Expected storage class (imported, exported, data, memory, shared) or callback but found: {}",
                            self.lexer.source().value_of_span(peeked.span)
                        ),
                    ));
                }
            };

            let storage_token = self.expect_next("storage class")?;
            let field = self.parse_field_definition()?;

            fields.push(ArchetypeFieldDefinition {
                id: self.create_node_id(),
                span: storage_token.span.to(field.span),
                storage,
                name: field.name,
                ty: field.ty,
            });
        }

        let close = self.expect_next_to_be(TokenKind::CloseBrace)?;

        Ok(ArchetypeDefinition {
            id: self.create_node_id(),
            span: archetype_keyword.span.to(close.span),
            name,
            fields,
            callbacks,
        })
    }

    /// level_memory Name { field: Type; } / level_data Name { field: Type; }
    fn parse_level_global_definition(
        &mut self,
        keyword: Keyword,
    ) -> CompileResult<LevelGlobalDefinition> {
        let kw_token = self.expect_keyword(keyword)?;

        let kind = match keyword {
            Keyword::LevelMemory => LevelGlobalKind::Memory,
            Keyword::LevelData => LevelGlobalKind::Data,
            _ => unreachable!("caller checked the keyword"),
        };

        let name = self.parse_identifier()?;

        self.expect_next_to_be(TokenKind::OpenBrace)?;

        let mut fields = Vec::new();

        while !self.peek_is(TokenKind::CloseBrace)? {
            fields.push(self.parse_field_definition()?);
        }

        let close = self.expect_next_to_be(TokenKind::CloseBrace)?;

        Ok(LevelGlobalDefinition {
            id: self.create_node_id(),
            span: kw_token.span.to(close.span),
            kind,
            name,
            fields,
        })
    }

    /// streams Name { taps: stream[Scalar, 256]; }
    fn parse_streams_definition(&mut self) -> CompileResult<StreamsDefinition> {
        let streams_keyword = self.expect_keyword(Keyword::Streams)?;

        let name = self.parse_identifier()?;

        self.expect_next_to_be(TokenKind::OpenBrace)?;

        let mut entries = Vec::new();

        while !self.peek_is(TokenKind::CloseBrace)? {
            let entry_name = self.parse_identifier()?;

            self.expect_next_to_be(TokenKind::Colon)?;
            self.expect_keyword(Keyword::Stream)?;
            self.expect_next_to_be(TokenKind::OpenBracket)?;

            let element = self.parse_type()?;

            self.expect_next_to_be(TokenKind::Comma)?;

            let capacity = Box::new(self.parse_expression()?);

            let close_bracket = self.expect_next_to_be(TokenKind::CloseBracket)?;

            let end = if let Some(t) = self.eat(TokenKind::Semicolon)? {
                t.span
            } else {
                close_bracket.span
            };

            entries.push(StreamEntry {
                id: self.create_node_id(),
                span: entry_name.span.to(end),
                name: entry_name,
                element,
                capacity,
            });
        }

        let close = self.expect_next_to_be(TokenKind::CloseBrace)?;

        Ok(StreamsDefinition {
            id: self.create_node_id(),
            span: streams_keyword.span.to(close.span),
            name,
            entries,
        })
    }

    /* Types */

    /// Scalar | Name | Name[Args] | [T; N]
    fn parse_type(&mut self) -> CompileResult<Type> {
        let peeked = self.expect_peek("type")?;

        match peeked.kind {
            TokenKind::OpenBracket => {
                let open = self.expect_next_to_be(TokenKind::OpenBracket)?;

                let element = Box::new(self.parse_type()?);

                self.expect_next_to_be(TokenKind::Semicolon)?;

                let length = Box::new(self.parse_expression()?);

                let close = self.expect_next_to_be(TokenKind::CloseBracket)?;

                Ok(Type {
                    id: self.create_node_id(),
                    span: open.span.to(close.span),
                    kind: TypeKind::Array { element, length },
                })
            }
            TokenKind::Identifier => {
                let name = self.parse_identifier()?;

                if self.eat(TokenKind::OpenBracket)?.is_some() {
                    let mut arguments = Vec::new();

                    while !self.peek_is(TokenKind::CloseBracket)? {
                        arguments.push(self.parse_type()?);

                        if self.eat(TokenKind::Comma)?.is_none() {
                            break;
                        }
                    }

                    let close = self.expect_next_to_be(TokenKind::CloseBracket)?;

                    let span = name.span.to(close.span);

                    return Ok(Type {
                        id: self.create_node_id(),
                        span,
                        kind: TypeKind::Generic { name, arguments },
                    });
                }

                Ok(Type {
                    id: self.create_node_id(),
                    span: name.span,
                    kind: TypeKind::Named(name),
                })
            }
            _ => Err(self.error(
                peeked.span,
                format!(
                    "Expected type but found: {}",
                    self.lexer.source().value_of_span(peeked.span)
                ),
            )),
        }
    }

    fn parse_identifier(&mut self) -> CompileResult<Identifier> {
        let token = self.expect_next_to_be(TokenKind::Identifier)?;

        Ok(Identifier {
            id: self.create_node_id(),
            span: token.span,
            symbol: InternedSymbol::new(self.lexer.source().value_of_span(token.span)),
        })
    }

    /* Statements */

    fn parse_block(&mut self) -> CompileResult<Block> {
        let open = self.expect_next_to_be(TokenKind::OpenBrace)?;

        let mut statements = Vec::new();

        while !self.peek_is(TokenKind::CloseBrace)? {
            statements.push(self.parse_statement()?);
        }

        let close = self.expect_next_to_be(TokenKind::CloseBrace)?;

        Ok(Block {
            id: self.create_node_id(),
            span: open.span.to(close.span),
            statements,
        })
    }

    fn parse_statement(&mut self) -> CompileResult<Statement> {
        let peeked = self.expect_peek("statement")?;
        let start_span = peeked.span;

        let kind = match peeked.kind {
            TokenKind::Keyword(Keyword::Let) => {
                self.expect_keyword(Keyword::Let)?;

                let name = self.parse_identifier()?;

                self.expect_next_to_be(TokenKind::Equals)?;

                let value = Box::new(self.parse_expression()?);

                self.expect_next_to_be(TokenKind::Semicolon)?;

                StatementKind::Let { name, value }
            }
            TokenKind::Keyword(Keyword::If) => StatementKind::If(Box::new(self.parse_if()?)),
            TokenKind::Keyword(Keyword::While) => {
                self.expect_keyword(Keyword::While)?;

                let condition = Box::new(self.parse_expression()?);
                let body = self.parse_block()?;
                let else_block = self.parse_optional_else_block()?;

                StatementKind::While(Box::new(WhileStatement {
                    condition,
                    body,
                    else_block,
                }))
            }
            TokenKind::Keyword(Keyword::For) => {
                self.expect_keyword(Keyword::For)?;

                let binding = self.parse_identifier()?;

                self.expect_keyword(Keyword::In)?;

                let iterable = Box::new(self.parse_expression()?);
                let body = self.parse_block()?;
                let else_block = self.parse_optional_else_block()?;

                StatementKind::For(Box::new(ForStatement {
                    binding,
                    iterable,
                    body,
                    else_block,
                }))
            }
            TokenKind::Keyword(Keyword::Match) => {
                StatementKind::Match(Box::new(self.parse_match()?))
            }
            TokenKind::Keyword(Keyword::Break) => {
                self.expect_keyword(Keyword::Break)?;
                self.expect_next_to_be(TokenKind::Semicolon)?;

                StatementKind::Break
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.expect_keyword(Keyword::Continue)?;
                self.expect_next_to_be(TokenKind::Semicolon)?;

                StatementKind::Continue
            }
            TokenKind::Keyword(Keyword::Return) => {
                self.expect_keyword(Keyword::Return)?;

                let value = if self.peek_is(TokenKind::Semicolon)? {
                    None
                } else {
                    Some(Box::new(self.parse_expression()?))
                };

                self.expect_next_to_be(TokenKind::Semicolon)?;

                StatementKind::Return(value)
            }
            TokenKind::Keyword(Keyword::Assert) => {
                self.expect_keyword(Keyword::Assert)?;

                let condition = Box::new(self.parse_expression()?);

                self.expect_next_to_be(TokenKind::Semicolon)?;

                StatementKind::Assert(condition)
            }
            TokenKind::Keyword(Keyword::Pass) => {
                self.expect_keyword(Keyword::Pass)?;
                self.expect_next_to_be(TokenKind::Semicolon)?;

                StatementKind::Empty
            }
            TokenKind::Keyword(kw) if kw.is_rejected() => {
                return Err(self.unsupported(
                    peeked.span,
                    self.lexer.source().value_of_span(peeked.span),
                ));
            }
            _ => {
                let expression = self.parse_expression()?;

                let peeked = self.expect_peek("`;` or assignment operator")?;

                if let Some(operator) = Self::assignment_operator(peeked) {
                    self.expect_next("assignment operator")?;

                    let value = Box::new(self.parse_expression()?);

                    self.expect_next_to_be(TokenKind::Semicolon)?;

                    StatementKind::Assign {
                        target: Box::new(expression),
                        operator,
                        value,
                    }
                } else {
                    self.expect_next_to_be(TokenKind::Semicolon)?;

                    StatementKind::Expression(Box::new(expression))
                }
            }
        };

        Ok(Statement {
            id: self.create_node_id(),
            span: start_span,
            kind,
        })
    }

    fn assignment_operator(token: Token) -> Option<AssignmentOperator> {
        let kind = match token.kind {
            TokenKind::Equals => AssignmentOperatorKind::Assign,
            TokenKind::PlusEquals => AssignmentOperatorKind::Compound(BinaryOperatorKind::Add),
            TokenKind::MinusEquals => AssignmentOperatorKind::Compound(BinaryOperatorKind::Subtract),
            TokenKind::MultiplyEquals => {
                AssignmentOperatorKind::Compound(BinaryOperatorKind::Multiply)
            }
            TokenKind::DivideEquals => AssignmentOperatorKind::Compound(BinaryOperatorKind::Divide),
            TokenKind::ModulusEquals => {
                AssignmentOperatorKind::Compound(BinaryOperatorKind::Modulus)
            }
            _ => return None,
        };

        Some(AssignmentOperator {
            span: token.span,
            kind,
        })
    }

    fn parse_if(&mut self) -> CompileResult<IfStatement> {
        self.expect_keyword(Keyword::If)?;

        let condition = Box::new(self.parse_expression()?);
        let then_block = self.parse_block()?;

        let else_block = if self.eat(TokenKind::Keyword(Keyword::Else))?.is_some() {
            if self.peek_is(TokenKind::Keyword(Keyword::If))? {
                // `else if` becomes an else block holding a single nested if
                let nested_span = self.expect_peek("if")?.span;
                let nested = self.parse_if()?;

                let statement = Statement {
                    id: self.create_node_id(),
                    span: nested_span,
                    kind: StatementKind::If(Box::new(nested)),
                };

                Some(Block {
                    id: self.create_node_id(),
                    span: nested_span,
                    statements: vec![statement],
                })
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };

        Ok(IfStatement {
            condition,
            then_block,
            else_block,
        })
    }

    fn parse_optional_else_block(&mut self) -> CompileResult<Option<Block>> {
        if self.eat(TokenKind::Keyword(Keyword::Else))?.is_some() {
            Ok(Some(self.parse_block()?))
        } else {
            Ok(None)
        }
    }

    fn parse_match(&mut self) -> CompileResult<MatchStatement> {
        self.expect_keyword(Keyword::Match)?;

        let subject = Box::new(self.parse_expression()?);

        self.expect_next_to_be(TokenKind::OpenBrace)?;

        let mut arms = Vec::new();

        while !self.peek_is(TokenKind::CloseBrace)? {
            let pattern = self.parse_pattern()?;

            let guard = if self.eat(TokenKind::Keyword(Keyword::If))?.is_some() {
                Some(Box::new(self.parse_expression()?))
            } else {
                None
            };

            self.expect_next_to_be(TokenKind::FatArrow)?;

            let body = self.parse_block()?;

            arms.push(MatchArm {
                span: pattern.span.to(body.span),
                pattern,
                guard,
                body,
            });
        }

        self.expect_next_to_be(TokenKind::CloseBrace)?;

        Ok(MatchStatement { subject, arms })
    }

    fn parse_pattern(&mut self) -> CompileResult<Pattern> {
        let peeked = self.expect_peek("pattern")?;

        match peeked.kind {
            TokenKind::OpenBrace => Err(self.unsupported(peeked.span, "mapping pattern")),
            TokenKind::Minus | TokenKind::IntegerLiteral | TokenKind::FloatLiteral => {
                let negated = self.eat(TokenKind::Minus)?.is_some();
                let token = self.expect_next("number literal")?;

                if !matches!(
                    token.kind,
                    TokenKind::IntegerLiteral | TokenKind::FloatLiteral
                ) {
                    return Err(self.error(token.span, "Expected number literal in pattern"));
                }

                let value = self.parse_number_value(token)?;

                Ok(Pattern {
                    id: self.create_node_id(),
                    span: peeked.span.to(token.span),
                    kind: PatternKind::Literal(Literal::Number(if negated {
                        -value
                    } else {
                        value
                    })),
                })
            }
            TokenKind::BooleanLiteral => {
                let token = self.expect_next("boolean literal")?;
                let value = self.lexer.source().value_of_span(token.span) == "true";

                Ok(Pattern {
                    id: self.create_node_id(),
                    span: token.span,
                    kind: PatternKind::Literal(Literal::Boolean(value)),
                })
            }
            TokenKind::NoneLiteral => {
                let token = self.expect_next("none")?;

                Ok(Pattern {
                    id: self.create_node_id(),
                    span: token.span,
                    kind: PatternKind::Literal(Literal::None),
                })
            }
            TokenKind::Identifier => {
                let name = self.parse_identifier()?;

                if name.symbol.value() == "_" {
                    return Ok(Pattern {
                        id: self.create_node_id(),
                        span: name.span,
                        kind: PatternKind::Wildcard,
                    });
                }

                if self.eat(TokenKind::OpenParen)?.is_some() {
                    let mut fields = Vec::new();

                    while !self.peek_is(TokenKind::CloseParen)? {
                        if self.peek_is(TokenKind::Asterisk)? {
                            let star = self.expect_peek("pattern")?;
                            return Err(self.unsupported(star.span, "starred destructuring"));
                        }

                        fields.push(self.parse_pattern()?);

                        if self.eat(TokenKind::Comma)?.is_none() {
                            break;
                        }
                    }

                    let close = self.expect_next_to_be(TokenKind::CloseParen)?;

                    return Ok(Pattern {
                        id: self.create_node_id(),
                        span: name.span.to(close.span),
                        kind: PatternKind::Record { name, fields },
                    });
                }

                Ok(Pattern {
                    id: self.create_node_id(),
                    span: name.span,
                    kind: PatternKind::Binding(name),
                })
            }
            _ => Err(self.error(
                peeked.span,
                format!(
                    "Expected pattern but found: {}",
                    self.lexer.source().value_of_span(peeked.span)
                ),
            )),
        }
    }

    /* Expressions */

    pub fn parse_expression(&mut self) -> CompileResult<Expression> {
        self.parse_logical_or()
    }

    fn parse_logical_or(&mut self) -> CompileResult<Expression> {
        let mut lhs = self.parse_logical_and()?;

        while self.eat(TokenKind::Keyword(Keyword::Or))?.is_some() {
            let rhs = self.parse_logical_and()?;
            let span = lhs.span.to(rhs.span);

            lhs = Expression {
                id: self.create_node_id(),
                span,
                kind: ExpressionKind::Logical {
                    operator: LogicalOperator::Or,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            };
        }

        Ok(lhs)
    }

    fn parse_logical_and(&mut self) -> CompileResult<Expression> {
        let mut lhs = self.parse_logical_not()?;

        while self.eat(TokenKind::Keyword(Keyword::And))?.is_some() {
            let rhs = self.parse_logical_not()?;
            let span = lhs.span.to(rhs.span);

            lhs = Expression {
                id: self.create_node_id(),
                span,
                kind: ExpressionKind::Logical {
                    operator: LogicalOperator::And,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            };
        }

        Ok(lhs)
    }

    fn parse_logical_not(&mut self) -> CompileResult<Expression> {
        if let Some(not_token) = self.eat(TokenKind::Keyword(Keyword::Not))? {
            let operand = self.parse_logical_not()?;
            let span = not_token.span.to(operand.span);

            return Ok(Expression {
                id: self.create_node_id(),
                span,
                kind: ExpressionKind::Unary {
                    operator: UnaryOperator {
                        span: not_token.span,
                        kind: UnaryOperatorKind::Not,
                    },
                    operand: Box::new(operand),
                },
            });
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> CompileResult<Expression> {
        let mut lhs = self.parse_term()?;

        loop {
            let Some(peeked) = self.lexer.peek()? else {
                break;
            };

            if peeked.kind == TokenKind::Keyword(Keyword::Is) {
                self.expect_keyword(Keyword::Is)?;

                let negated = self.eat(TokenKind::Keyword(Keyword::Not))?.is_some();
                let none_token = self.expect_peek("`none`")?;

                if none_token.kind != TokenKind::NoneLiteral {
                    return Err(self.unsupported(none_token.span, "identity comparison"));
                }

                self.expect_next("none")?;

                let span = lhs.span.to(none_token.span);

                lhs = Expression {
                    id: self.create_node_id(),
                    span,
                    kind: ExpressionKind::IsNone {
                        operand: Box::new(lhs),
                        negated,
                    },
                };

                continue;
            }

            if !peeked.kind.is_comparison_operator() {
                break;
            }

            let token = self.expect_next("comparison operator")?;
            let operator = self.binary_operator(token);
            let rhs = self.parse_term()?;
            let span = lhs.span.to(rhs.span);

            lhs = Expression {
                id: self.create_node_id(),
                span,
                kind: ExpressionKind::Binary {
                    operator,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            };
        }

        Ok(lhs)
    }

    fn parse_term(&mut self) -> CompileResult<Expression> {
        let mut lhs = self.parse_factor()?;

        while self
            .lexer
            .peek()?
            .is_some_and(|t| t.kind.is_term_operator())
        {
            let token = self.expect_next("operator")?;
            let operator = self.binary_operator(token);
            let rhs = self.parse_factor()?;
            let span = lhs.span.to(rhs.span);

            lhs = Expression {
                id: self.create_node_id(),
                span,
                kind: ExpressionKind::Binary {
                    operator,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            };
        }

        Ok(lhs)
    }

    fn parse_factor(&mut self) -> CompileResult<Expression> {
        let mut lhs = self.parse_unary()?;

        while self
            .lexer
            .peek()?
            .is_some_and(|t| t.kind.is_factor_operator())
        {
            let token = self.expect_next("operator")?;
            let operator = self.binary_operator(token);
            let rhs = self.parse_unary()?;
            let span = lhs.span.to(rhs.span);

            lhs = Expression {
                id: self.create_node_id(),
                span,
                kind: ExpressionKind::Binary {
                    operator,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            };
        }

        Ok(lhs)
    }

    fn binary_operator(&self, token: Token) -> BinaryOperator {
        let kind = match token.kind {
            TokenKind::Plus => BinaryOperatorKind::Add,
            TokenKind::Minus => BinaryOperatorKind::Subtract,
            TokenKind::Asterisk => BinaryOperatorKind::Multiply,
            TokenKind::Divide => BinaryOperatorKind::Divide,
            TokenKind::Modulus => BinaryOperatorKind::Modulus,
            TokenKind::DoubleEquals => BinaryOperatorKind::Equal,
            TokenKind::NotEquals => BinaryOperatorKind::NotEqual,
            TokenKind::LessThan => BinaryOperatorKind::LessThan,
            TokenKind::LessThanOrEqualTo => BinaryOperatorKind::LessThanOrEqual,
            TokenKind::GreaterThan => BinaryOperatorKind::GreaterThan,
            TokenKind::GreaterThanOrEqualTo => BinaryOperatorKind::GreaterThanOrEqual,
            kind => unreachable!("token {kind:?} is not a binary operator"),
        };

        BinaryOperator {
            span: token.span,
            kind,
        }
    }

    fn parse_unary(&mut self) -> CompileResult<Expression> {
        if let Some(minus_token) = self.eat(TokenKind::Minus)? {
            let operand = self.parse_unary()?;
            let span = minus_token.span.to(operand.span);

            return Ok(Expression {
                id: self.create_node_id(),
                span,
                kind: ExpressionKind::Unary {
                    operator: UnaryOperator {
                        span: minus_token.span,
                        kind: UnaryOperatorKind::Negate,
                    },
                    operand: Box::new(operand),
                },
            });
        }

        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> CompileResult<Expression> {
        let mut expression = self.parse_primary()?;

        loop {
            let Some(peeked) = self.lexer.peek()? else {
                break;
            };

            match peeked.kind {
                TokenKind::OpenParen => {
                    self.expect_next_to_be(TokenKind::OpenParen)?;

                    let mut arguments = Vec::new();

                    while !self.peek_is(TokenKind::CloseParen)? {
                        if self.peek_is(TokenKind::Asterisk)? {
                            let star = self.expect_peek("argument")?;
                            return Err(self.unsupported(star.span, "starred argument"));
                        }

                        arguments.push(self.parse_expression()?);

                        if self.eat(TokenKind::Comma)?.is_none() {
                            break;
                        }
                    }

                    let close = self.expect_next_to_be(TokenKind::CloseParen)?;
                    let span = expression.span.to(close.span);

                    expression = Expression {
                        id: self.create_node_id(),
                        span,
                        kind: ExpressionKind::Call {
                            callee: Box::new(expression),
                            arguments,
                        },
                    };
                }
                TokenKind::Dot => {
                    self.expect_next_to_be(TokenKind::Dot)?;

                    let field = self.parse_identifier()?;
                    let span = expression.span.to(field.span);

                    expression = Expression {
                        id: self.create_node_id(),
                        span,
                        kind: ExpressionKind::Field {
                            object: Box::new(expression),
                            field,
                        },
                    };
                }
                TokenKind::OpenBracket => {
                    self.expect_next_to_be(TokenKind::OpenBracket)?;

                    let mut indexes = vec![self.parse_expression()?];

                    while self.eat(TokenKind::Comma)?.is_some() {
                        if self.peek_is(TokenKind::CloseBracket)? {
                            break;
                        }

                        indexes.push(self.parse_expression()?);
                    }

                    let close = self.expect_next_to_be(TokenKind::CloseBracket)?;
                    let span = expression.span.to(close.span);

                    let index = if indexes.len() == 1 {
                        indexes.pop().unwrap()
                    } else {
                        Expression {
                            id: self.create_node_id(),
                            span,
                            kind: ExpressionKind::Tuple(indexes),
                        }
                    };

                    expression = Expression {
                        id: self.create_node_id(),
                        span,
                        kind: ExpressionKind::Index {
                            object: Box::new(expression),
                            index: Box::new(index),
                        },
                    };
                }
                _ => break,
            }
        }

        Ok(expression)
    }

    fn parse_primary(&mut self) -> CompileResult<Expression> {
        let peeked = self.expect_peek("expression")?;

        match peeked.kind {
            TokenKind::IntegerLiteral | TokenKind::FloatLiteral => {
                let token = self.expect_next("number literal")?;
                let value = self.parse_number_value(token)?;

                Ok(Expression {
                    id: self.create_node_id(),
                    span: token.span,
                    kind: ExpressionKind::Literal(Literal::Number(value)),
                })
            }
            TokenKind::BooleanLiteral => {
                let token = self.expect_next("boolean literal")?;
                let value = self.lexer.source().value_of_span(token.span) == "true";

                Ok(Expression {
                    id: self.create_node_id(),
                    span: token.span,
                    kind: ExpressionKind::Literal(Literal::Boolean(value)),
                })
            }
            TokenKind::NoneLiteral => {
                let token = self.expect_next("none")?;

                Ok(Expression {
                    id: self.create_node_id(),
                    span: token.span,
                    kind: ExpressionKind::Literal(Literal::None),
                })
            }
            TokenKind::Identifier => {
                let identifier = self.parse_identifier()?;

                Ok(Expression {
                    id: self.create_node_id(),
                    span: identifier.span,
                    kind: ExpressionKind::Identifier(identifier),
                })
            }
            TokenKind::OpenParen => {
                let open = self.expect_next_to_be(TokenKind::OpenParen)?;

                let mut elements = Vec::new();
                let mut is_tuple = false;

                while !self.peek_is(TokenKind::CloseParen)? {
                    if self.peek_is(TokenKind::Asterisk)? {
                        let star = self.expect_peek("expression")?;
                        return Err(self.unsupported(star.span, "starred destructuring"));
                    }

                    elements.push(self.parse_expression()?);

                    if self.eat(TokenKind::Comma)?.is_some() {
                        is_tuple = true;
                    } else {
                        break;
                    }
                }

                let close = self.expect_next_to_be(TokenKind::CloseParen)?;
                let span = open.span.to(close.span);

                if !is_tuple && elements.len() == 1 {
                    // Parenthesized expression; keep the inner node
                    return Ok(elements.pop().unwrap());
                }

                Ok(Expression {
                    id: self.create_node_id(),
                    span,
                    kind: ExpressionKind::Tuple(elements),
                })
            }
            TokenKind::Keyword(kw) if kw.is_rejected() => Err(self.unsupported(
                peeked.span,
                self.lexer.source().value_of_span(peeked.span),
            )),
            _ => Err(self.error(
                peeked.span,
                format!(
                    "Expected expression but found: {} ({:?})",
                    self.lexer.source().value_of_span(peeked.span),
                    peeked.kind
                ),
            )),
        }
    }

    fn parse_number_value(&self, token: Token) -> CompileResult<f64> {
        let text = self.lexer.source().value_of_span(token.span);

        text.parse::<f64>()
            .map_err(|_| self.error(token.span, format!("Invalid number literal: {text}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{frontend::SourceFile, index::Index};

    fn parse(source: &str) -> CompileResult<Module> {
        let file = SourceFile::new_in_memory(source);
        Parser::parse_module(&file, SourceId::new(0))
    }

    #[test]
    fn parses_function_and_archetype() {
        let module = parse(
            "fn lerp(a, b, t) { return a + (b - a) * t; }\n\
             archetype Note {\n\
                 imported lane: Scalar;\n\
                 memory y: Scalar;\n\
                 fn initialize(self) { self.y = 1; }\n\
             }",
        )
        .unwrap();

        assert_eq!(module.items.len(), 2);

        let ItemKind::ArchetypeDefinition(archetype) = &module.items[1].kind else {
            panic!("expected archetype");
        };
        assert_eq!(archetype.fields.len(), 2);
        assert_eq!(archetype.fields[0].storage, StorageClass::Imported);
        assert_eq!(archetype.fields[1].storage, StorageClass::EntityMemory);
        assert_eq!(archetype.callbacks.len(), 1);
    }

    #[test]
    fn parses_generic_record_with_operator_method() {
        let module = parse(
            "record Pair[T] {\n\
                 first: T;\n\
                 second: T;\n\
                 fn add(self, other) { return Pair(self.first + other.first, self.second + other.second); }\n\
             }",
        )
        .unwrap();

        let ItemKind::RecordDefinition(record) = &module.items[0].kind else {
            panic!("expected record");
        };
        assert_eq!(record.type_parameters.len(), 1);
        assert_eq!(record.fields.len(), 2);
        assert_eq!(record.methods.len(), 1);
    }

    #[test]
    fn parses_streams_and_level_globals() {
        let module = parse(
            "streams Recording { taps: stream[Scalar, 256]; }\n\
             level_memory Globals { combo: Scalar; }\n\
             level_data Chart { note_count: Scalar; }",
        )
        .unwrap();

        assert_eq!(module.items.len(), 3);
        assert!(matches!(
            module.items[0].kind,
            ItemKind::StreamsDefinition(_)
        ));
    }

    #[test]
    fn else_if_nests() {
        let module = parse("fn f(x) { if x > 1 { return 1; } else if x > 0 { return 2; } else { return 3; } }").unwrap();

        let ItemKind::FunctionDefinition(function) = &module.items[0].kind else {
            panic!("expected function");
        };

        let StatementKind::If(if_statement) = &function.body.statements[0].kind else {
            panic!("expected if");
        };

        let else_block = if_statement.else_block.as_ref().unwrap();
        assert!(matches!(
            else_block.statements[0].kind,
            StatementKind::If(_)
        ));
    }

    #[test]
    fn parses_match_with_guard() {
        let module = parse(
            "fn f(x) { match x { 0 => { return 1; } n if n > 3 => { return n; } _ => { return 0; } } }",
        )
        .unwrap();

        let ItemKind::FunctionDefinition(function) = &module.items[0].kind else {
            panic!("expected function");
        };
        let StatementKind::Match(match_statement) = &function.body.statements[0].kind else {
            panic!("expected match");
        };

        assert_eq!(match_statement.arms.len(), 3);
        assert!(match_statement.arms[1].guard.is_some());
        assert!(matches!(
            match_statement.arms[2].pattern.kind,
            PatternKind::Wildcard
        ));
    }

    #[test]
    fn is_none_and_logical_operators() {
        let module = parse("fn f(x) { if x is not none and x > 0 { return x; } return 0; }").unwrap();

        let ItemKind::FunctionDefinition(function) = &module.items[0].kind else {
            panic!("expected function");
        };
        let StatementKind::If(if_statement) = &function.body.statements[0].kind else {
            panic!("expected if");
        };

        let ExpressionKind::Logical { operator, lhs, .. } = &if_statement.condition.kind else {
            panic!("expected logical");
        };
        assert_eq!(*operator, LogicalOperator::And);
        assert!(matches!(
            lhs.kind,
            ExpressionKind::IsNone { negated: true, .. }
        ));
    }

    #[test]
    fn rejects_try_and_starred_destructuring() {
        let error = parse("fn f() { try { pass; } except { pass; } }").unwrap_err();
        assert_eq!(error.kind, DiagnosticKind::UnsupportedConstruct);

        let error = parse("fn f(a) { (x, *rest) = a; }").unwrap_err();
        assert_eq!(error.kind, DiagnosticKind::UnsupportedConstruct);
    }

    #[test]
    fn rejects_global_statement() {
        let error = parse("fn f() { global combo; }").unwrap_err();
        assert_eq!(error.kind, DiagnosticKind::UnsupportedConstruct);
    }

    #[test]
    fn generic_constructor_call_parses_as_index_then_call() {
        let module = parse("fn f() { let p = Pair[Scalar](1, 2); return p.first; }").unwrap();

        let ItemKind::FunctionDefinition(function) = &module.items[0].kind else {
            panic!("expected function");
        };
        let StatementKind::Let { value, .. } = &function.body.statements[0].kind else {
            panic!("expected let");
        };
        let ExpressionKind::Call { callee, arguments } = &value.kind else {
            panic!("expected call");
        };
        assert_eq!(arguments.len(), 2);
        assert!(matches!(callee.kind, ExpressionKind::Index { .. }));
    }
}
