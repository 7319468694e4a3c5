//! Owned GraphQL schema model
//!
//! Service SDL is parsed with `graphql-parser` and immediately converted into
//! the owned types below, which the merger, planner and introspection share.

use std::fmt;

use graphql_parser::schema::{self as ast, parse_schema};
use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::operation::{InputValue, OperationKind};

pub const BOUNDARY_DIRECTIVE: &str = "boundary";
pub const NAMESPACE_DIRECTIVE: &str = "namespace";
pub const SKIP_MERGE_DIRECTIVE: &str = "skipMerge";
pub const DEPRECATED_DIRECTIVE: &str = "deprecated";

pub const SERVICE_TYPE: &str = "Service";
pub const SERVICE_FIELD: &str = "service";
pub const ID_FIELD: &str = "id";
pub const ID_FIELD_TYPE: &str = "ID!";

pub const QUERY_TYPE: &str = "Query";
pub const MUTATION_TYPE: &str = "Mutation";
pub const SUBSCRIPTION_TYPE: &str = "Subscription";

pub const BUILTIN_SCALARS: [&str; 5] = ["Int", "Float", "String", "Boolean", "ID"];

/// Federation directives and the locations each must be declared on
const FEDERATION_DIRECTIVES: [(&str, &[&str]); 3] = [
    (BOUNDARY_DIRECTIVE, &["OBJECT", "FIELD_DEFINITION"]),
    (NAMESPACE_DIRECTIVE, &["OBJECT"]),
    (SKIP_MERGE_DIRECTIVE, &["FIELD_DEFINITION"]),
];

/// Field boundary types are identified by
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdField {
    pub name: String,
    /// Type as written in SDL, e.g. `ID!`
    pub ty: String,
}

impl Default for IdField {
    fn default() -> Self {
        IdField::new(ID_FIELD, ID_FIELD_TYPE)
    }
}

impl IdField {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        IdField {
            name: name.into(),
            ty: ty.into(),
        }
    }

    /// Scalar the id type is built from
    pub fn scalar(&self) -> &str {
        self.ty.trim_matches(|c| matches!(c, '[' | ']' | '!'))
    }
}

pub fn is_federation_directive(name: &str) -> bool {
    FEDERATION_DIRECTIVES.iter().any(|(directive, _)| *directive == name)
}

/// Names starting with `__` belong to introspection
pub fn is_introspection_name(name: &str) -> bool {
    name.starts_with("__")
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Named(String),
    List(Box<TypeRef>),
    NonNull(Box<TypeRef>),
}

impl TypeRef {
    pub fn from_ast(ty: &ast::Type<'_, String>) -> Self {
        match ty {
            ast::Type::NamedType(name) => TypeRef::Named(name.clone()),
            ast::Type::ListType(inner) => TypeRef::List(Box::new(TypeRef::from_ast(inner))),
            ast::Type::NonNullType(inner) => TypeRef::NonNull(Box::new(TypeRef::from_ast(inner))),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        TypeRef::Named(name.into())
    }

    pub fn non_null(inner: TypeRef) -> Self {
        TypeRef::NonNull(Box::new(inner))
    }

    pub fn list(inner: TypeRef) -> Self {
        TypeRef::List(Box::new(inner))
    }

    /// The innermost named type
    pub fn named_type(&self) -> &str {
        match self {
            TypeRef::Named(name) => name,
            TypeRef::List(inner) | TypeRef::NonNull(inner) => inner.named_type(),
        }
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, TypeRef::NonNull(_))
    }

    /// The type without its outermost non-null wrapper
    pub fn nullable(&self) -> &TypeRef {
        match self {
            TypeRef::NonNull(inner) => inner,
            other => other,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self.nullable(), TypeRef::List(_))
    }

    /// Element type of a (possibly non-null) list
    pub fn item_type(&self) -> Option<&TypeRef> {
        match self.nullable() {
            TypeRef::List(inner) => Some(inner),
            _ => None,
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::List(inner) => write!(f, "[{inner}]"),
            TypeRef::NonNull(inner) => write!(f, "{inner}!"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Scalar,
    Object,
    Interface,
    Union,
    Enum,
    InputObject,
}

impl TypeKind {
    /// Name used by the `__TypeKind` introspection enum
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeKind::Scalar => "SCALAR",
            TypeKind::Object => "OBJECT",
            TypeKind::Interface => "INTERFACE",
            TypeKind::Union => "UNION",
            TypeKind::Enum => "ENUM",
            TypeKind::InputObject => "INPUT_OBJECT",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Directive {
    pub name: String,
    pub arguments: Vec<(String, InputValue)>,
}

impl Directive {
    fn from_ast(directive: &ast::Directive<'_, String>) -> Self {
        Directive {
            name: directive.name.clone(),
            arguments: directive
                .arguments
                .iter()
                .map(|(name, value)| (name.clone(), InputValue::from_ast(value)))
                .collect(),
        }
    }
}

fn convert_directives(directives: &[ast::Directive<'_, String>]) -> Vec<Directive> {
    directives.iter().map(Directive::from_ast).collect()
}

fn has_directive(directives: &[Directive], name: &str) -> bool {
    directives.iter().any(|directive| directive.name == name)
}

/// `Some(reason)` when the element carries `@deprecated`
fn deprecation(directives: &[Directive]) -> Option<Option<String>> {
    directives
        .iter()
        .find(|directive| directive.name == DEPRECATED_DIRECTIVE)
        .map(|directive| {
            directive
                .arguments
                .iter()
                .find(|(name, _)| name == "reason")
                .and_then(|(_, value)| match value {
                    InputValue::String(reason) => Some(reason.clone()),
                    _ => None,
                })
                .or_else(|| Some("No longer supported".to_string()))
        })
}

#[derive(Clone, Debug, PartialEq)]
pub struct InputValueDefinition {
    pub name: String,
    pub description: Option<String>,
    pub ty: TypeRef,
    pub default_value: Option<InputValue>,
    pub directives: Vec<Directive>,
}

impl InputValueDefinition {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        InputValueDefinition {
            name: name.into(),
            description: None,
            ty,
            default_value: None,
            directives: Vec::new(),
        }
    }

    fn from_ast(value: &ast::InputValue<'_, String>) -> Self {
        InputValueDefinition {
            name: value.name.clone(),
            description: value.description.clone(),
            ty: TypeRef::from_ast(&value.value_type),
            default_value: value.default_value.as_ref().map(InputValue::from_ast),
            directives: convert_directives(&value.directives),
        }
    }

    /// Signature used when comparing definitions across services
    fn same_signature(&self, other: &Self) -> bool {
        self.name == other.name && self.ty == other.ty && self.default_value == other.default_value
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldDefinition {
    pub name: String,
    pub description: Option<String>,
    pub arguments: Vec<InputValueDefinition>,
    pub ty: TypeRef,
    pub directives: Vec<Directive>,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        FieldDefinition {
            name: name.into(),
            description: None,
            arguments: Vec::new(),
            ty,
            directives: Vec::new(),
        }
    }

    fn from_ast(field: &ast::Field<'_, String>) -> Self {
        FieldDefinition {
            name: field.name.clone(),
            description: field.description.clone(),
            arguments: field.arguments.iter().map(InputValueDefinition::from_ast).collect(),
            ty: TypeRef::from_ast(&field.field_type),
            directives: convert_directives(&field.directives),
        }
    }

    pub fn has_directive(&self, name: &str) -> bool {
        has_directive(&self.directives, name)
    }

    pub fn argument(&self, name: &str) -> Option<&InputValueDefinition> {
        self.arguments.iter().find(|arg| arg.name == name)
    }

    pub fn deprecation(&self) -> Option<Option<String>> {
        deprecation(&self.directives)
    }

    /// Same name, arguments and output type
    pub fn same_signature(&self, other: &Self) -> bool {
        self.name == other.name
            && self.ty == other.ty
            && self.arguments.len() == other.arguments.len()
            && self
                .arguments
                .iter()
                .zip(&other.arguments)
                .all(|(a, b)| a.same_signature(b))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnumValueDefinition {
    pub name: String,
    pub description: Option<String>,
    pub directives: Vec<Directive>,
}

impl EnumValueDefinition {
    pub fn deprecation(&self) -> Option<Option<String>> {
        deprecation(&self.directives)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeDefinition {
    pub name: String,
    pub kind: TypeKind,
    pub description: Option<String>,
    pub fields: IndexMap<String, FieldDefinition>,
    pub interfaces: Vec<String>,
    /// Union members
    pub possible_types: Vec<String>,
    pub enum_values: Vec<EnumValueDefinition>,
    pub input_fields: IndexMap<String, InputValueDefinition>,
    pub directives: Vec<Directive>,
}

impl TypeDefinition {
    pub fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        TypeDefinition {
            name: name.into(),
            kind,
            description: None,
            fields: IndexMap::new(),
            interfaces: Vec::new(),
            possible_types: Vec::new(),
            enum_values: Vec::new(),
            input_fields: IndexMap::new(),
            directives: Vec::new(),
        }
    }

    fn from_ast(definition: &ast::TypeDefinition<'_, String>) -> Self {
        match definition {
            ast::TypeDefinition::Scalar(scalar) => TypeDefinition {
                description: scalar.description.clone(),
                directives: convert_directives(&scalar.directives),
                ..TypeDefinition::new(scalar.name.clone(), TypeKind::Scalar)
            },
            ast::TypeDefinition::Object(object) => TypeDefinition {
                description: object.description.clone(),
                fields: convert_fields(&object.fields),
                interfaces: object.implements_interfaces.clone(),
                directives: convert_directives(&object.directives),
                ..TypeDefinition::new(object.name.clone(), TypeKind::Object)
            },
            ast::TypeDefinition::Interface(interface) => TypeDefinition {
                description: interface.description.clone(),
                fields: convert_fields(&interface.fields),
                interfaces: interface.implements_interfaces.clone(),
                directives: convert_directives(&interface.directives),
                ..TypeDefinition::new(interface.name.clone(), TypeKind::Interface)
            },
            ast::TypeDefinition::Union(union) => TypeDefinition {
                description: union.description.clone(),
                possible_types: union.types.clone(),
                directives: convert_directives(&union.directives),
                ..TypeDefinition::new(union.name.clone(), TypeKind::Union)
            },
            ast::TypeDefinition::Enum(enum_type) => TypeDefinition {
                description: enum_type.description.clone(),
                enum_values: enum_type
                    .values
                    .iter()
                    .map(|value| EnumValueDefinition {
                        name: value.name.clone(),
                        description: value.description.clone(),
                        directives: convert_directives(&value.directives),
                    })
                    .collect(),
                directives: convert_directives(&enum_type.directives),
                ..TypeDefinition::new(enum_type.name.clone(), TypeKind::Enum)
            },
            ast::TypeDefinition::InputObject(input) => TypeDefinition {
                description: input.description.clone(),
                input_fields: input
                    .fields
                    .iter()
                    .map(|field| (field.name.clone(), InputValueDefinition::from_ast(field)))
                    .collect(),
                directives: convert_directives(&input.directives),
                ..TypeDefinition::new(input.name.clone(), TypeKind::InputObject)
            },
        }
    }

    pub fn has_directive(&self, name: &str) -> bool {
        has_directive(&self.directives, name)
    }

    pub fn is_boundary(&self) -> bool {
        self.kind == TypeKind::Object && self.has_directive(BOUNDARY_DIRECTIVE)
    }

    pub fn is_namespace(&self) -> bool {
        self.kind == TypeKind::Object && self.has_directive(NAMESPACE_DIRECTIVE)
    }

    pub fn is_abstract(&self) -> bool {
        matches!(self.kind, TypeKind::Interface | TypeKind::Union)
    }

    /// Compares two definitions of a shared value type, returning a
    /// description of the first difference.
    pub fn signature_mismatch(&self, other: &Self) -> Option<String> {
        if self.kind != other.kind {
            return Some(format!(
                "kind {} differs from {}",
                self.kind.as_str(),
                other.kind.as_str()
            ));
        }
        if self.fields.len() != other.fields.len() {
            return Some("fields differ".to_string());
        }
        for (name, field) in &self.fields {
            match other.fields.get(name) {
                Some(other_field) if field.same_signature(other_field) => {}
                _ => return Some(format!("field \"{name}\" differs")),
            }
        }
        let mut members = self.possible_types.clone();
        let mut other_members = other.possible_types.clone();
        members.sort();
        other_members.sort();
        if members != other_members {
            return Some("union members differ".to_string());
        }
        let values: Vec<&str> = self.enum_values.iter().map(|v| v.name.as_str()).collect();
        let other_values: Vec<&str> = other.enum_values.iter().map(|v| v.name.as_str()).collect();
        if values != other_values {
            return Some("enum values differ".to_string());
        }
        if self.input_fields.len() != other.input_fields.len()
            || self.input_fields.iter().any(|(name, field)| {
                other
                    .input_fields
                    .get(name)
                    .is_none_or(|other_field| !field.same_signature(other_field))
            })
        {
            return Some("input fields differ".to_string());
        }
        None
    }
}

fn convert_fields(fields: &[ast::Field<'_, String>]) -> IndexMap<String, FieldDefinition> {
    fields
        .iter()
        .map(|field| (field.name.clone(), FieldDefinition::from_ast(field)))
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct DirectiveDefinition {
    pub name: String,
    pub description: Option<String>,
    pub arguments: Vec<InputValueDefinition>,
    pub locations: Vec<String>,
    pub repeatable: bool,
}

impl DirectiveDefinition {
    fn from_ast(directive: &ast::DirectiveDefinition<'_, String>) -> Self {
        DirectiveDefinition {
            name: directive.name.clone(),
            description: directive.description.clone(),
            arguments: directive.arguments.iter().map(InputValueDefinition::from_ast).collect(),
            locations: directive
                .locations
                .iter()
                .map(|location| location.as_str().to_string())
                .collect(),
            repeatable: directive.repeatable,
        }
    }

    fn builtin(name: &str, arguments: Vec<InputValueDefinition>, locations: &[&str]) -> Self {
        DirectiveDefinition {
            name: name.to_string(),
            description: None,
            arguments,
            locations: locations.iter().map(|l| l.to_string()).collect(),
            repeatable: false,
        }
    }
}

/// A complete schema, either a single service's or the merged one
#[derive(Clone, Debug, PartialEq)]
pub struct Schema {
    pub query_type: String,
    pub mutation_type: Option<String>,
    pub subscription_type: Option<String>,
    pub types: IndexMap<String, TypeDefinition>,
    pub directives: IndexMap<String, DirectiveDefinition>,
}

impl Default for Schema {
    fn default() -> Self {
        let mut schema = Schema {
            query_type: QUERY_TYPE.to_string(),
            mutation_type: None,
            subscription_type: None,
            types: IndexMap::new(),
            directives: IndexMap::new(),
        };
        schema.add_builtins();
        schema
    }
}

impl Schema {
    /// Parses the SDL of `service` into the owned model.
    ///
    /// Type extensions are folded into their base definitions, built-in
    /// scalars and directives are added and root types default to `Query`,
    /// `Mutation` and `Subscription` when no `schema` block is present.
    pub fn parse(service: &str, sdl: &str) -> Result<Self> {
        let document = parse_schema::<String>(sdl).map_err(|e| Error::SchemaParse {
            service: service.to_string(),
            message: e.to_string(),
        })?;

        let mut schema = Schema::default();
        let mut roots = (None, None, None);
        let mut extensions = Vec::new();

        for definition in &document.definitions {
            match definition {
                ast::Definition::SchemaDefinition(definition) => {
                    roots = (
                        definition.query.clone(),
                        definition.mutation.clone(),
                        definition.subscription.clone(),
                    );
                }
                ast::Definition::TypeDefinition(definition) => {
                    let definition = TypeDefinition::from_ast(definition);
                    if schema.types.contains_key(&definition.name)
                        && !BUILTIN_SCALARS.contains(&definition.name.as_str())
                    {
                        return Err(Error::SchemaValidation {
                            service: service.to_string(),
                            message: format!("type \"{}\" is defined twice", definition.name),
                        });
                    }
                    schema.types.insert(definition.name.clone(), definition);
                }
                ast::Definition::TypeExtension(extension) => extensions.push(extension),
                ast::Definition::DirectiveDefinition(definition) => {
                    let definition = DirectiveDefinition::from_ast(definition);
                    schema.directives.insert(definition.name.clone(), definition);
                }
            }
        }

        for extension in extensions {
            schema.apply_extension(service, extension)?;
        }

        let (query, mutation, subscription) = roots;
        schema.query_type = query.unwrap_or_else(|| QUERY_TYPE.to_string());
        schema.mutation_type = mutation
            .or_else(|| schema.types.contains_key(MUTATION_TYPE).then(|| MUTATION_TYPE.to_string()));
        schema.subscription_type = subscription.or_else(|| {
            schema
                .types
                .contains_key(SUBSCRIPTION_TYPE)
                .then(|| SUBSCRIPTION_TYPE.to_string())
        });

        if !schema.types.contains_key(&schema.query_type) {
            return Err(Error::SchemaValidation {
                service: service.to_string(),
                message: format!("query type \"{}\" is not defined", schema.query_type),
            });
        }
        Ok(schema)
    }

    fn apply_extension(
        &mut self,
        service: &str,
        extension: &ast::TypeExtension<'_, String>,
    ) -> Result<()> {
        let name = match extension {
            ast::TypeExtension::Scalar(ext) => &ext.name,
            ast::TypeExtension::Object(ext) => &ext.name,
            ast::TypeExtension::Interface(ext) => &ext.name,
            ast::TypeExtension::Union(ext) => &ext.name,
            ast::TypeExtension::Enum(ext) => &ext.name,
            ast::TypeExtension::InputObject(ext) => &ext.name,
        };
        let target = self.types.get_mut(name).ok_or_else(|| Error::SchemaValidation {
            service: service.to_string(),
            message: format!("cannot extend undefined type \"{name}\""),
        })?;

        match extension {
            ast::TypeExtension::Scalar(ext) => {
                target.directives.extend(convert_directives(&ext.directives));
            }
            ast::TypeExtension::Object(ext) => {
                target.fields.extend(convert_fields(&ext.fields));
                target.interfaces.extend(ext.implements_interfaces.iter().cloned());
                target.directives.extend(convert_directives(&ext.directives));
            }
            ast::TypeExtension::Interface(ext) => {
                target.fields.extend(convert_fields(&ext.fields));
                target.directives.extend(convert_directives(&ext.directives));
            }
            ast::TypeExtension::Union(ext) => {
                target.possible_types.extend(ext.types.iter().cloned());
                target.directives.extend(convert_directives(&ext.directives));
            }
            ast::TypeExtension::Enum(ext) => {
                target.enum_values.extend(ext.values.iter().map(|value| EnumValueDefinition {
                    name: value.name.clone(),
                    description: value.description.clone(),
                    directives: convert_directives(&value.directives),
                }));
                target.directives.extend(convert_directives(&ext.directives));
            }
            ast::TypeExtension::InputObject(ext) => {
                target.input_fields.extend(
                    ext.fields
                        .iter()
                        .map(|field| (field.name.clone(), InputValueDefinition::from_ast(field))),
                );
                target.directives.extend(convert_directives(&ext.directives));
            }
        }
        Ok(())
    }

    pub(crate) fn add_builtins(&mut self) {
        for scalar in BUILTIN_SCALARS {
            self.types
                .entry(scalar.to_string())
                .or_insert_with(|| TypeDefinition::new(scalar, TypeKind::Scalar));
        }

        let condition = || {
            vec![InputValueDefinition::new(
                "if",
                TypeRef::non_null(TypeRef::named("Boolean")),
            )]
        };
        let conditional_locations = ["FIELD", "FRAGMENT_SPREAD", "INLINE_FRAGMENT"];
        let mut reason = InputValueDefinition::new("reason", TypeRef::named("String"));
        reason.default_value = Some(InputValue::String("No longer supported".to_string()));

        let builtins = [
            DirectiveDefinition::builtin("skip", condition(), &conditional_locations),
            DirectiveDefinition::builtin("include", condition(), &conditional_locations),
            DirectiveDefinition::builtin(
                DEPRECATED_DIRECTIVE,
                vec![reason],
                &["FIELD_DEFINITION", "ARGUMENT_DEFINITION", "INPUT_FIELD_DEFINITION", "ENUM_VALUE"],
            ),
            DirectiveDefinition::builtin(
                "specifiedBy",
                vec![InputValueDefinition::new(
                    "url",
                    TypeRef::non_null(TypeRef::named("String")),
                )],
                &["SCALAR"],
            ),
        ];
        for directive in builtins {
            self.directives.entry(directive.name.clone()).or_insert(directive);
        }
    }

    pub fn get_type(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.get(name)
    }

    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&FieldDefinition> {
        self.types.get(type_name)?.fields.get(field_name)
    }

    pub fn input_field_type(&self, type_name: &str, field_name: &str) -> Option<&TypeRef> {
        self.types
            .get(type_name)?
            .input_fields
            .get(field_name)
            .map(|field| &field.ty)
    }

    pub fn root_type(&self, kind: OperationKind) -> Option<&str> {
        match kind {
            OperationKind::Query => Some(self.query_type.as_str()),
            OperationKind::Mutation => self.mutation_type.as_deref(),
            OperationKind::Subscription => self.subscription_type.as_deref(),
        }
    }

    pub fn is_root_type(&self, name: &str) -> bool {
        self.query_type == name
            || self.mutation_type.as_deref() == Some(name)
            || self.subscription_type.as_deref() == Some(name)
    }

    pub fn is_boundary(&self, name: &str) -> bool {
        self.types.get(name).is_some_and(TypeDefinition::is_boundary)
    }

    pub fn is_namespace(&self, name: &str) -> bool {
        self.types.get(name).is_some_and(TypeDefinition::is_namespace)
    }

    pub fn is_abstract(&self, name: &str) -> bool {
        self.types.get(name).is_some_and(TypeDefinition::is_abstract)
    }

    /// Object types a value of `name` can have at runtime
    pub fn possible_types(&self, name: &str) -> Vec<&str> {
        let Some(definition) = self.types.get(name) else {
            return Vec::new();
        };
        match definition.kind {
            TypeKind::Object => vec![definition.name.as_str()],
            TypeKind::Union => definition.possible_types.iter().map(String::as_str).collect(),
            TypeKind::Interface => self
                .types
                .values()
                .filter(|candidate| {
                    candidate.kind == TypeKind::Object
                        && candidate.interfaces.iter().any(|i| i == name)
                })
                .map(|candidate| candidate.name.as_str())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// True when a value of runtime type `concrete` satisfies `condition`
    pub fn is_subtype(&self, condition: &str, concrete: &str) -> bool {
        if condition == concrete {
            return true;
        }
        match self.types.get(condition).map(|definition| definition.kind) {
            Some(TypeKind::Union) => self.types[condition]
                .possible_types
                .iter()
                .any(|member| member == concrete),
            Some(TypeKind::Interface) => self
                .types
                .get(concrete)
                .is_some_and(|definition| definition.interfaces.iter().any(|i| i == condition)),
            _ => false,
        }
    }

    /// Checks federation directive usage in a single service schema.
    pub fn validate(&self, service: &str, id_field: &IdField) -> Result<()> {
        let invalid = |message: String| Error::SchemaValidation {
            service: service.to_string(),
            message,
        };

        for (directive, required) in FEDERATION_DIRECTIVES {
            if let Some(definition) = self.directives.get(directive) {
                if let Some(missing) = required
                    .iter()
                    .find(|location| !definition.locations.iter().any(|l| l == *location))
                {
                    return Err(invalid(format!(
                        "directive @{directive} must be declared on {missing}"
                    )));
                }
            }
        }

        if let Some(service_type) = self.types.get(SERVICE_TYPE) {
            for field in ["name", "version", "schema"] {
                let expected = TypeRef::non_null(TypeRef::named("String"));
                if service_type.fields.get(field).map(|f| &f.ty) != Some(&expected) {
                    return Err(invalid(format!(
                        "type {SERVICE_TYPE} must have field \"{field}: String!\""
                    )));
                }
            }
        }
        if let Some(field) = self.field(&self.query_type, SERVICE_FIELD) {
            if field.ty != TypeRef::non_null(TypeRef::named(SERVICE_TYPE)) {
                return Err(invalid(format!(
                    "field {}.{SERVICE_FIELD} must return \"{SERVICE_TYPE}!\"",
                    self.query_type
                )));
            }
        }

        for definition in self.types.values() {
            if definition.has_directive(BOUNDARY_DIRECTIVE) {
                if definition.kind != TypeKind::Object {
                    return Err(invalid(format!(
                        "@{BOUNDARY_DIRECTIVE} is only allowed on object types, found on \"{}\"",
                        definition.name
                    )));
                }
                let id = definition.fields.get(&id_field.name).map(|field| field.ty.to_string());
                if id.as_deref() != Some(id_field.ty.as_str()) {
                    return Err(invalid(format!(
                        "boundary type \"{}\" must have field \"{}: {}\"",
                        definition.name, id_field.name, id_field.ty
                    )));
                }
            }
            if definition.has_directive(NAMESPACE_DIRECTIVE) && definition.has_directive(BOUNDARY_DIRECTIVE) {
                return Err(invalid(format!(
                    "type \"{}\" cannot be both a namespace and a boundary type",
                    definition.name
                )));
            }
            for field in definition.fields.values() {
                if self.is_namespace(field.ty.named_type()) {
                    if !field.ty.is_non_null() || field.ty.is_list() || !field.arguments.is_empty() {
                        return Err(invalid(format!(
                            "namespace field {}.{} must be a non-null namespace type without arguments",
                            definition.name, field.name
                        )));
                    }
                }
            }
        }

        if let Some(query) = self.types.get(&self.query_type) {
            for field in query.fields.values() {
                if field.has_directive(BOUNDARY_DIRECTIVE) {
                    self.validate_boundary_query(field, id_field).map_err(invalid)?;
                }
            }
        }
        Ok(())
    }

    fn validate_boundary_query(
        &self,
        field: &FieldDefinition,
        id_field: &IdField,
    ) -> std::result::Result<(), String> {
        let returned = field.ty.named_type();
        if !self.is_boundary(returned) {
            return Err(format!(
                "boundary query \"{}\" must return a boundary type, got \"{}\"",
                field.name, field.ty
            ));
        }
        let [argument] = field.arguments.as_slice() else {
            return Err(format!(
                "boundary query \"{}\" must take exactly one argument",
                field.name
            ));
        };
        let id = TypeRef::named(id_field.scalar());
        let singular = argument.ty == TypeRef::non_null(id.clone()) && !field.ty.is_list();
        let batch = argument
            .ty
            .item_type()
            .is_some_and(|item| item == &TypeRef::non_null(id.clone()) || item == &id)
            && field.ty.is_list();
        if !singular && !batch {
            return Err(format!(
                "boundary query \"{}\" must be \"({}: {scalar}!): {returned}\" or \"(ids: [{scalar}!]): [{returned}]\"",
                field.name,
                id_field.name,
                scalar = id_field.scalar(),
            ));
        }
        Ok(())
    }
}
