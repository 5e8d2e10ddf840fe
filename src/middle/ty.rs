//! The Pulse type system: a closed set of value categories over which every
//! later stage operates. Scalars are single runtime cells; arrays and records
//! are flat aggregates with compile-time layout; tuples, function references,
//! and entity references are transient compile-time values with no layout at
//! all. Generic records become concrete through the instantiation table,
//! keyed by (template, argument tuple) so each distinct tuple is instantiated
//! exactly once.

use std::sync::{Arc, RwLock};

use hashbrown::{HashMap, HashSet};
use once_cell::sync::Lazy;

use crate::{
    diagnostics::{CompileResult, Diagnostic, DiagnosticKind},
    frontend::{Span, ast, intern::InternedSymbol},
    index::{IndexVec, simple_index},
    middle::{
        consteval,
        program::{ArchetypeId, FunctionId, Program, RecordId},
    },
};

#[doc(hidden)]
mod private {
    #[doc(hidden)]
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct PrivateZst;
}

/// Thin pointer to an interned type kind. Do not construct directly; use the
/// `Type::*` constructors, which go through the interning table.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Type(Arc<TypeKind>, private::PrivateZst);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// A single 32-bit-float-backed number, also used as int and bool
    Scalar,
    /// The type of `none` and of bare returns
    None,
    /// `[T; N]`
    ///
    /// N elements of a concrete element type, laid out contiguously
    Array { element: Type, length: u32 },
    /// A record template applied to concrete (or transient) type arguments
    Record { def: RecordId, arguments: Arc<[Type]> },
    /// A compile-time-only heterogeneous sequence; unrolled, never stored
    Tuple(Arc<[Type]>),
    /// A function used as a value; resolves at compile time, no layout
    FunctionRef(FunctionId),
    /// A reference to an entity of a known archetype (`Arch.at(i)`)
    EntityRef(ArchetypeId),
    /// An unbound generic parameter inside a template body
    Param(InternedSymbol),
}

static TYPE_TABLE: Lazy<RwLock<HashSet<Arc<TypeKind>>>> = Lazy::new(Default::default);

fn intern(kind: TypeKind) -> Type {
    {
        let table = TYPE_TABLE.read().unwrap();

        if let Some(existing) = table.get(&kind) {
            return Type(existing.clone(), private::PrivateZst);
        }
    }

    let mut table = TYPE_TABLE.write().unwrap();
    let arc = table.get_or_insert(Arc::new(kind));

    Type(arc.clone(), private::PrivateZst)
}

impl Type {
    pub fn scalar() -> Type {
        intern(TypeKind::Scalar)
    }

    pub fn none() -> Type {
        intern(TypeKind::None)
    }

    pub fn array(element: Type, length: u32) -> Type {
        intern(TypeKind::Array { element, length })
    }

    pub fn record(def: RecordId, arguments: impl Into<Arc<[Type]>>) -> Type {
        intern(TypeKind::Record {
            def,
            arguments: arguments.into(),
        })
    }

    pub fn tuple(elements: impl Into<Arc<[Type]>>) -> Type {
        intern(TypeKind::Tuple(elements.into()))
    }

    pub fn function_ref(def: FunctionId) -> Type {
        intern(TypeKind::FunctionRef(def))
    }

    pub fn entity_ref(archetype: ArchetypeId) -> Type {
        intern(TypeKind::EntityRef(archetype))
    }

    pub fn param(name: InternedSymbol) -> Type {
        intern(TypeKind::Param(name))
    }

    pub fn is_scalar(&self) -> bool {
        matches!(**self, TypeKind::Scalar)
    }

    pub fn is_none(&self) -> bool {
        matches!(**self, TypeKind::None)
    }

    /// Transient values exist only at compile time and can never be stored
    pub fn is_transient(&self) -> bool {
        matches!(
            **self,
            TypeKind::Tuple(_)
                | TypeKind::FunctionRef(_)
                | TypeKind::EntityRef(_)
                | TypeKind::None
        )
    }

    /// Whether this type contains no unbound generic parameters
    pub fn is_fully_bound(&self) -> bool {
        match &**self {
            TypeKind::Scalar
            | TypeKind::None
            | TypeKind::FunctionRef(_)
            | TypeKind::EntityRef(_) => true,
            TypeKind::Param(_) => false,
            TypeKind::Array { element, .. } => element.is_fully_bound(),
            TypeKind::Record { arguments, .. } => arguments.iter().all(Type::is_fully_bound),
            TypeKind::Tuple(elements) => elements.iter().all(Type::is_fully_bound),
        }
    }
}

impl core::fmt::Debug for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Type").field(&self.0).finish()
    }
}

impl core::ops::Deref for Type {
    type Target = TypeKind;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

simple_index! {
    /// Index into the record instantiation arena
    pub struct RecordInstanceId;
}

#[derive(Debug)]
pub struct RecordInstance {
    pub def: RecordId,
    pub arguments: Vec<Type>,
    /// Field types with the template's parameters substituted
    pub field_types: Vec<Type>,
}

/// The arena of record instantiations, keyed by (template, argument tuple).
/// Read-through and populated at most once per key, so independently compiled
/// modes can share it across threads.
#[derive(Debug, Default)]
pub struct RecordInstances {
    inner: RwLock<RecordInstancesInner>,
}

#[derive(Debug, Default)]
struct RecordInstancesInner {
    instances: IndexVec<RecordInstanceId, Arc<RecordInstance>>,
    index: HashMap<(RecordId, Vec<Type>), RecordInstanceId>,
    /// Keys currently being instantiated, for recursion detection. Scoped to
    /// the instantiating thread so independently compiled modes never mistake
    /// each other's in-flight work for recursion.
    in_progress: HashSet<(std::thread::ThreadId, RecordId, Vec<Type>)>,
}

impl RecordInstances {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, def: RecordId, arguments: &[Type]) -> Option<Arc<RecordInstance>> {
        let inner = self.inner.read().unwrap();

        inner
            .index
            .get(&(def, arguments.to_vec()))
            .map(|id| inner.instances[*id].clone())
    }
}

/// Shared read context for type operations: the program's item tables plus
/// the instantiation arena
#[derive(Clone, Copy)]
pub struct TypeCtx<'a> {
    pub program: &'a Program,
    pub instances: &'a RecordInstances,
}

impl<'a> TypeCtx<'a> {
    pub fn new(program: &'a Program, instances: &'a RecordInstances) -> Self {
        Self { program, instances }
    }

    /// Instantiates a record template with the given argument tuple,
    /// resolving field types. Idempotent per distinct tuple.
    pub fn instantiate_record(
        &self,
        def: RecordId,
        arguments: Vec<Type>,
        span: Span,
    ) -> CompileResult<Type> {
        let record = self.program.record(def);

        if arguments.len() != record.type_parameters.len() {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                format!(
                    "record `{}` expects {} type argument(s) but {} were supplied",
                    record.name.symbol,
                    record.type_parameters.len(),
                    arguments.len()
                ),
            ));
        }

        let key = (def, arguments.clone());
        let progress_key = (std::thread::current().id(), def, arguments.clone());

        {
            let inner = self.instances.inner.read().unwrap();

            if inner.index.contains_key(&key) {
                return Ok(Type::record(def, arguments));
            }

            if inner.in_progress.contains(&progress_key) {
                return Err(Diagnostic::spanned(
                    DiagnosticKind::TypeResolution,
                    span,
                    format!(
                        "record `{}` is infinitely recursive; records cannot contain themselves",
                        record.name.symbol
                    ),
                ));
            }
        }

        self.instances
            .inner
            .write()
            .unwrap()
            .in_progress
            .insert(progress_key.clone());

        let bindings: HashMap<InternedSymbol, Type> = record
            .type_parameters
            .iter()
            .zip(arguments.iter())
            .map(|(param, arg)| (param.symbol, arg.clone()))
            .collect();

        let mut field_types = Vec::with_capacity(record.fields.len());
        let mut result = Ok(());

        for field in &record.fields {
            match self.resolve_type_with(&field.ty, &bindings) {
                Ok(ty) => field_types.push(ty),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        let mut inner = self.instances.inner.write().unwrap();
        inner.in_progress.remove(&progress_key);

        result?;

        if !inner.index.contains_key(&key) {
            let id = inner.instances.push(Arc::new(RecordInstance {
                def,
                arguments: arguments.clone(),
                field_types,
            }));
            inner.index.insert(key, id);
        }

        Ok(Type::record(def, arguments))
    }

    pub fn resolve_type(&self, ty: &ast::Type) -> CompileResult<Type> {
        self.resolve_type_with(ty, &HashMap::new())
    }

    /// Resolves a surface type annotation, looking up generic parameters in
    /// `bindings`
    pub fn resolve_type_with(
        &self,
        ty: &ast::Type,
        bindings: &HashMap<InternedSymbol, Type>,
    ) -> CompileResult<Type> {
        match &ty.kind {
            ast::TypeKind::Named(name) => {
                if name.symbol.value() == "Scalar" {
                    return Ok(Type::scalar());
                }

                if let Some(bound) = bindings.get(&name.symbol) {
                    return Ok(bound.clone());
                }

                match self.program.lookup(name.symbol) {
                    Some(crate::middle::program::ItemRef::Record(def)) => {
                        if !self.program.record(def).type_parameters.is_empty() {
                            return Err(Diagnostic::spanned(
                                DiagnosticKind::TypeResolution,
                                ty.span,
                                format!(
                                    "generic record `{}` must be fully instantiated here; supply type arguments",
                                    name.symbol
                                ),
                            ));
                        }

                        self.instantiate_record(def, Vec::new(), ty.span)
                    }
                    Some(_) => Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        ty.span,
                        format!("`{}` is not a type", name.symbol),
                    )),
                    None => Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        ty.span,
                        format!("unknown type `{}`", name.symbol),
                    )),
                }
            }
            ast::TypeKind::Generic { name, arguments } => {
                let Some(crate::middle::program::ItemRef::Record(def)) =
                    self.program.lookup(name.symbol)
                else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        ty.span,
                        format!("`{}` is not a generic record", name.symbol),
                    ));
                };

                let arguments = arguments
                    .iter()
                    .map(|arg| self.resolve_type_with(arg, bindings))
                    .collect::<CompileResult<Vec<_>>>()?;

                self.instantiate_record(def, arguments, ty.span)
            }
            ast::TypeKind::Array { element, length } => {
                let element = self.resolve_type_with(element, bindings)?;

                let Some(value) = consteval::eval_literal_expression(length) else {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        length.span,
                        "array length must be a compile-time integer constant",
                    ));
                };

                if value.fract() != 0.0 || value < 0.0 || value > u32::MAX as f64 {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        length.span,
                        format!("array length must be a non-negative integer, found {value}"),
                    ));
                }

                Ok(Type::array(element, value as u32))
            }
        }
    }

    /// The flat size of a type in runtime cells. Transient and unbound types
    /// have no layout and produce a type-resolution error.
    pub fn size_of(&self, ty: &Type, span: Span) -> CompileResult<u32> {
        match &**ty {
            TypeKind::Scalar => Ok(1),
            TypeKind::Array { element, length } => {
                Ok(self.size_of(element, span)? * *length)
            }
            TypeKind::Record { def, arguments } => {
                let instance = self
                    .instances
                    .get(*def, arguments)
                    .ok_or_else(|| {
                        Diagnostic::internal(format!(
                            "record `{}` was never instantiated before layout",
                            self.program.record(*def).name.symbol
                        ))
                    })?;

                let mut size = 0;

                for field_ty in &instance.field_types {
                    size += self.size_of(field_ty, span)?;
                }

                Ok(size)
            }
            TypeKind::None
            | TypeKind::Tuple(_)
            | TypeKind::FunctionRef(_)
            | TypeKind::EntityRef(_) => Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                format!(
                    "transient type {} has no layout and cannot be stored",
                    self.render(ty)
                ),
            )),
            TypeKind::Param(name) => Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                span,
                format!("unbound type parameter `{name}` in a layout position"),
            )),
        }
    }

    /// Field types of a record instantiation
    pub fn record_fields(&self, ty: &Type) -> Option<Arc<RecordInstance>> {
        match &**ty {
            TypeKind::Record { def, arguments } => self.instances.get(*def, arguments),
            _ => None,
        }
    }

    /// Cell offset of a field within a record instantiation
    pub fn field_offset(&self, ty: &Type, field_index: usize, span: Span) -> CompileResult<u32> {
        let instance = self.record_fields(ty).ok_or_else(|| {
            Diagnostic::internal("field_offset called on a non-record type")
        })?;

        let mut offset = 0;

        for field_ty in instance.field_types.iter().take(field_index) {
            offset += self.size_of(field_ty, span)?;
        }

        Ok(offset)
    }

    pub fn render(&self, ty: &Type) -> String {
        match &**ty {
            TypeKind::Scalar => "Scalar".to_owned(),
            TypeKind::None => "none".to_owned(),
            TypeKind::Array { element, length } => {
                format!("[{}; {length}]", self.render(element))
            }
            TypeKind::Record { def, arguments } => {
                let name = self.program.record(*def).name.symbol;

                if arguments.is_empty() {
                    name.value().to_owned()
                } else {
                    let arguments = arguments
                        .iter()
                        .map(|a| self.render(a))
                        .collect::<Vec<_>>()
                        .join(", ");

                    format!("{name}[{arguments}]")
                }
            }
            TypeKind::Tuple(elements) => {
                let elements = elements
                    .iter()
                    .map(|e| self.render(e))
                    .collect::<Vec<_>>()
                    .join(", ");

                format!("({elements})")
            }
            TypeKind::FunctionRef(def) => {
                format!("fn {}", self.program.function(*def).name.symbol)
            }
            TypeKind::EntityRef(archetype) => {
                format!("entity {}", self.program.archetype(*archetype).name.symbol)
            }
            TypeKind::Param(name) => name.value().to_owned(),
        }
    }
}

/// The compile-time denotation of a type used as a value, e.g. the second
/// argument of `isinstance`. A bare generic record or the bare `array` head
/// matches every instantiation; a concrete type matches exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypePattern {
    Exact(Type),
    AnyArray,
    AnyRecord(RecordId),
}

impl TypePattern {
    /// Structural instance check: does a value of type `ty` match?
    pub fn matches(&self, ty: &Type) -> bool {
        match self {
            TypePattern::Exact(expected) => ty == expected,
            TypePattern::AnyArray => matches!(**ty, TypeKind::Array { .. }),
            TypePattern::AnyRecord(def) => {
                matches!(&**ty, TypeKind::Record { def: d, .. } if d == def)
            }
        }
    }

    /// `issubclass` between two type denotations: every type matching `self`
    /// also matches `other`
    pub fn is_subpattern_of(&self, other: &TypePattern) -> bool {
        match (self, other) {
            (a, b) if a == b => true,
            (TypePattern::Exact(ty), TypePattern::AnyArray) => {
                matches!(**ty, TypeKind::Array { .. })
            }
            (TypePattern::Exact(ty), TypePattern::AnyRecord(def)) => {
                matches!(&**ty, TypeKind::Record { def: d, .. } if d == def)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frontend::{SourceFile, SourceId, parser::Parser},
        index::Index,
    };

    fn program(source: &str) -> Program {
        let file = SourceFile::new_in_memory(source);
        let module = Parser::parse_module(&file, SourceId::new(0)).unwrap();
        Program::from_modules(vec![module]).unwrap()
    }

    fn dummy_span() -> Span {
        Span::new(SourceId::new(0), 0, 0)
    }

    #[test]
    fn interning_deduplicates() {
        let a = Type::array(Type::scalar(), 4);
        let b = Type::array(Type::scalar(), 4);
        let c = Type::array(Type::scalar(), 5);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn instantiation_is_idempotent_per_argument_tuple() {
        let program = program("record Pair[T] { first: T; second: T; }");
        let instances = RecordInstances::new();
        let ctx = TypeCtx::new(&program, &instances);
        let def = match program.lookup(InternedSymbol::new("Pair")) {
            Some(crate::middle::program::ItemRef::Record(id)) => id,
            _ => panic!("expected record"),
        };

        ctx.instantiate_record(def, vec![Type::scalar()], dummy_span())
            .unwrap();
        ctx.instantiate_record(def, vec![Type::scalar()], dummy_span())
            .unwrap();
        ctx.instantiate_record(def, vec![Type::array(Type::scalar(), 3)], dummy_span())
            .unwrap();
        ctx.instantiate_record(def, vec![Type::array(Type::scalar(), 3)], dummy_span())
            .unwrap();

        assert_eq!(instances.len(), 2);
    }

    #[test]
    fn record_sizes_flatten_fields() {
        let program = program(
            "record Vec2 { x: Scalar; y: Scalar; }\n\
             record Quad { a: Vec2; b: Vec2; points: [Scalar; 4]; }",
        );
        let instances = RecordInstances::new();
        let ctx = TypeCtx::new(&program, &instances);

        let quad = match program.lookup(InternedSymbol::new("Quad")) {
            Some(crate::middle::program::ItemRef::Record(id)) => id,
            _ => panic!("expected record"),
        };

        let ty = ctx.instantiate_record(quad, vec![], dummy_span()).unwrap();
        assert_eq!(ctx.size_of(&ty, dummy_span()).unwrap(), 8);
        assert_eq!(ctx.field_offset(&ty, 2, dummy_span()).unwrap(), 4);
    }

    #[test]
    fn recursive_records_are_rejected() {
        let program = program("record Loop { next: Loop; }");
        let instances = RecordInstances::new();
        let ctx = TypeCtx::new(&program, &instances);

        let def = match program.lookup(InternedSymbol::new("Loop")) {
            Some(crate::middle::program::ItemRef::Record(id)) => id,
            _ => panic!("expected record"),
        };

        let error = ctx.instantiate_record(def, vec![], dummy_span()).unwrap_err();
        assert_eq!(error.kind, DiagnosticKind::TypeResolution);
    }

    #[test]
    fn instance_checks_are_structural() {
        let scalar = Type::scalar();
        let arr3 = Type::array(Type::scalar(), 3);
        let arr4 = Type::array(Type::scalar(), 4);

        assert!(TypePattern::Exact(arr3.clone()).matches(&arr3));
        assert!(!TypePattern::Exact(arr3.clone()).matches(&arr4));
        assert!(TypePattern::AnyArray.matches(&arr3));
        assert!(TypePattern::AnyArray.matches(&arr4));
        assert!(!TypePattern::AnyArray.matches(&scalar));

        assert!(TypePattern::Exact(arr4.clone()).is_subpattern_of(&TypePattern::AnyArray));
        assert!(!TypePattern::AnyArray.is_subpattern_of(&TypePattern::Exact(arr4)));
    }

    #[test]
    fn array_length_must_be_constant_integer() {
        let program = program("record Bad { xs: [Scalar; 2 + 3]; }");
        let instances = RecordInstances::new();
        let ctx = TypeCtx::new(&program, &instances);

        let def = match program.lookup(InternedSymbol::new("Bad")) {
            Some(crate::middle::program::ItemRef::Record(id)) => id,
            _ => panic!("expected record"),
        };

        // constant folding accepts a literal arithmetic length
        let ty = ctx.instantiate_record(def, vec![], dummy_span()).unwrap();
        assert_eq!(ctx.size_of(&ty, dummy_span()).unwrap(), 5);
    }
}
