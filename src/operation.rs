//! Client operations
//!
//! The gateway never plans against the raw `graphql-parser` AST: documents are
//! converted into an owned operation where named fragments are already
//! expanded into inline fragments and `@skip`/`@include` have been evaluated
//! against the request variables. The same types are used to build and print
//! the sub-queries sent to services.

use std::collections::HashMap;
use std::fmt::{self, Write as _};

use graphql_parser::query::{self as ast, parse_query};
use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};
use crate::schema::{Schema, TypeKind, TypeRef};

pub const TYPENAME_FIELD: &str = "__typename";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Pos {
    pub line: usize,
    pub column: usize,
}

impl From<graphql_parser::Pos> for Pos {
    fn from(pos: graphql_parser::Pos) -> Self {
        Pos {
            line: pos.line,
            column: pos.column,
        }
    }
}

/// A GraphQL input literal, possibly referencing a variable
#[derive(Clone, Debug, PartialEq)]
pub enum InputValue {
    Variable(String),
    Int(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Null,
    Enum(String),
    List(Vec<InputValue>),
    Object(Vec<(String, InputValue)>),
}

impl InputValue {
    pub fn from_ast(value: &ast::Value<'_, String>) -> Self {
        match value {
            ast::Value::Variable(name) => InputValue::Variable(name.clone()),
            ast::Value::Int(number) => InputValue::Int(number.as_i64().unwrap_or_default()),
            ast::Value::Float(float) => InputValue::Float(*float),
            ast::Value::String(string) => InputValue::String(string.clone()),
            ast::Value::Boolean(boolean) => InputValue::Boolean(*boolean),
            ast::Value::Null => InputValue::Null,
            ast::Value::Enum(name) => InputValue::Enum(name.clone()),
            ast::Value::List(items) => {
                InputValue::List(items.iter().map(InputValue::from_ast).collect())
            }
            ast::Value::Object(fields) => InputValue::Object(
                fields
                    .iter()
                    .map(|(name, value)| (name.clone(), InputValue::from_ast(value)))
                    .collect(),
            ),
        }
    }

    /// Builds a literal from a JSON variable value, using the expected input
    /// type to tell enum values apart from strings.
    pub fn from_json(value: &Value, ty: Option<&TypeRef>, schema: &Schema) -> Self {
        match value {
            Value::Null => InputValue::Null,
            Value::Bool(boolean) => InputValue::Boolean(*boolean),
            Value::Number(number) => match number.as_i64() {
                Some(int) => InputValue::Int(int),
                None => InputValue::Float(number.as_f64().unwrap_or_default()),
            },
            Value::String(string) => {
                let is_enum = ty
                    .and_then(|ty| schema.get_type(ty.named_type()))
                    .is_some_and(|def| def.kind == TypeKind::Enum);
                if is_enum {
                    InputValue::Enum(string.clone())
                } else {
                    InputValue::String(string.clone())
                }
            }
            Value::Array(items) => {
                let item_type = ty.and_then(TypeRef::item_type);
                InputValue::List(
                    items
                        .iter()
                        .map(|item| InputValue::from_json(item, item_type, schema))
                        .collect(),
                )
            }
            Value::Object(fields) => InputValue::Object(
                fields
                    .iter()
                    .map(|(name, value)| {
                        let field_type =
                            ty.and_then(|ty| schema.input_field_type(ty.named_type(), name));
                        (name.clone(), InputValue::from_json(value, field_type, schema))
                    })
                    .collect(),
            ),
        }
    }

    /// Replaces every variable reference with its literal value.
    pub fn inline_variables(
        &self,
        variables: &Map<String, Value>,
        ty: Option<&TypeRef>,
        schema: &Schema,
    ) -> Self {
        match self {
            InputValue::Variable(name) => variables
                .get(name)
                .map(|value| InputValue::from_json(value, ty, schema))
                .unwrap_or(InputValue::Null),
            InputValue::List(items) => {
                let item_type = ty.and_then(TypeRef::item_type);
                InputValue::List(
                    items
                        .iter()
                        .map(|item| item.inline_variables(variables, item_type, schema))
                        .collect(),
                )
            }
            InputValue::Object(fields) => InputValue::Object(
                fields
                    .iter()
                    .map(|(name, value)| {
                        let field_type =
                            ty.and_then(|ty| schema.input_field_type(ty.named_type(), name));
                        (
                            name.clone(),
                            value.inline_variables(variables, field_type, schema),
                        )
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn to_json(&self, variables: &Map<String, Value>) -> Value {
        match self {
            InputValue::Variable(name) => variables.get(name).cloned().unwrap_or(Value::Null),
            InputValue::Int(int) => Value::from(*int),
            InputValue::Float(float) => Number::from_f64(*float)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            InputValue::String(string) | InputValue::Enum(string) => Value::String(string.clone()),
            InputValue::Boolean(boolean) => Value::Bool(*boolean),
            InputValue::Null => Value::Null,
            InputValue::List(items) => {
                Value::Array(items.iter().map(|item| item.to_json(variables)).collect())
            }
            InputValue::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(name, value)| (name.clone(), value.to_json(variables)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for InputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputValue::Variable(name) => write!(f, "${name}"),
            InputValue::Int(int) => write!(f, "{int}"),
            InputValue::Float(float) => write!(f, "{float:?}"),
            // JSON string escapes are a subset of GraphQL's
            InputValue::String(string) => write!(f, "{}", Value::from(string.as_str())),
            InputValue::Boolean(boolean) => write!(f, "{boolean}"),
            InputValue::Null => f.write_str("null"),
            InputValue::Enum(name) => f.write_str(name),
            InputValue::List(items) => {
                f.write_char('[')?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_char(']')
            }
            InputValue::Object(fields) => {
                f.write_char('{')?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                f.write_char('}')
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub alias: Option<String>,
    pub name: String,
    pub arguments: Vec<(String, InputValue)>,
    pub selection_set: SelectionSet,
    pub position: Pos,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Field {
            alias: None,
            name: name.into(),
            arguments: Vec::new(),
            selection_set: Vec::new(),
            position: Pos::default(),
        }
    }

    pub fn aliased(alias: impl Into<String>, name: impl Into<String>) -> Self {
        Field {
            alias: Some(alias.into()),
            ..Field::new(name)
        }
    }

    /// Key under which the field appears in the response
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn argument(&self, name: &str) -> Option<&InputValue> {
        self.arguments
            .iter()
            .find(|(arg, _)| arg == name)
            .map(|(_, value)| value)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(alias) = &self.alias {
            write!(f, "{alias}: ")?;
        }
        f.write_str(&self.name)?;
        if !self.arguments.is_empty() {
            f.write_char('(')?;
            for (i, (name, value)) in self.arguments.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{name}: {value}")?;
            }
            f.write_char(')')?;
        }
        if !self.selection_set.is_empty() {
            f.write_char(' ')?;
            f.write_str(&format_selection_set(&self.selection_set))?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InlineFragment {
    pub type_condition: Option<String>,
    pub selection_set: SelectionSet,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    Field(Field),
    InlineFragment(InlineFragment),
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::Field(field) => write!(f, "{field}"),
            Selection::InlineFragment(fragment) => {
                f.write_str("...")?;
                if let Some(type_condition) = &fragment.type_condition {
                    write!(f, " on {type_condition}")?;
                }
                write!(f, " {}", format_selection_set(&fragment.selection_set))
            }
        }
    }
}

pub type SelectionSet = Vec<Selection>;

/// Prints a selection set on a single line, e.g. `{ movie(id: "1") { id } }`
pub fn format_selection_set(selection_set: &[Selection]) -> String {
    let mut out = String::from("{");
    for selection in selection_set {
        let _ = write!(out, " {selection}");
    }
    out.push_str(" }");
    out
}

/// True when a field with this response key is selected directly in the set
pub fn has_response_key(selection_set: &[Selection], key: &str) -> bool {
    selection_set.iter().any(|selection| match selection {
        Selection::Field(field) => field.response_key() == key,
        Selection::InlineFragment(_) => false,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct VariableDefinition {
    pub name: String,
    pub ty: TypeRef,
    pub default_value: Option<InputValue>,
}

/// A single executable operation, ready for planning
#[derive(Clone, Debug)]
pub struct Operation {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub variable_definitions: Vec<VariableDefinition>,
    /// Request variables with defaults applied
    pub variables: Map<String, Value>,
    pub selection_set: SelectionSet,
}

impl Operation {
    /// Parses `query`, selects the requested operation, expands fragments and
    /// drops every selection excluded by `@skip`/`@include`.
    pub fn prepare(
        query: &str,
        operation_name: Option<&str>,
        variables: Option<&Map<String, Value>>,
    ) -> Result<Self> {
        let document = parse_query::<String>(query)
            .map_err(|e| Error::InvalidQuery(format!("failed to parse query: {e}")))?;

        let mut fragments = HashMap::new();
        let mut operations = Vec::new();
        for definition in &document.definitions {
            match definition {
                ast::Definition::Fragment(fragment) => {
                    fragments.insert(fragment.name.as_str(), fragment);
                }
                ast::Definition::Operation(operation) => operations.push(operation),
            }
        }

        let operation = select_operation(&operations, operation_name)?;
        let (kind, name, variable_definitions, selection_set) = match operation {
            ast::OperationDefinition::SelectionSet(selection_set) => {
                (OperationKind::Query, None, &[][..], selection_set)
            }
            ast::OperationDefinition::Query(query) => (
                OperationKind::Query,
                query.name.clone(),
                &query.variable_definitions[..],
                &query.selection_set,
            ),
            ast::OperationDefinition::Mutation(mutation) => (
                OperationKind::Mutation,
                mutation.name.clone(),
                &mutation.variable_definitions[..],
                &mutation.selection_set,
            ),
            ast::OperationDefinition::Subscription(subscription) => (
                OperationKind::Subscription,
                subscription.name.clone(),
                &subscription.variable_definitions[..],
                &subscription.selection_set,
            ),
        };

        let variable_definitions: Vec<VariableDefinition> = variable_definitions
            .iter()
            .map(|definition| VariableDefinition {
                name: definition.name.clone(),
                ty: TypeRef::from_ast(&definition.var_type),
                default_value: definition.default_value.as_ref().map(InputValue::from_ast),
            })
            .collect();
        let variables = coerce_variables(&variable_definitions, variables)?;

        let expander = FragmentExpander {
            fragments: &fragments,
            variables: &variables,
        };
        let selection_set = expander.expand(selection_set, &mut Vec::new())?;

        Ok(Operation {
            kind,
            name,
            variable_definitions,
            variables,
            selection_set,
        })
    }
}

fn operation_name<'a>(operation: &'a ast::OperationDefinition<'_, String>) -> Option<&'a str> {
    match operation {
        ast::OperationDefinition::SelectionSet(_) => None,
        ast::OperationDefinition::Query(query) => query.name.as_deref(),
        ast::OperationDefinition::Mutation(mutation) => mutation.name.as_deref(),
        ast::OperationDefinition::Subscription(subscription) => subscription.name.as_deref(),
    }
}

fn select_operation<'a, 'q>(
    operations: &[&'a ast::OperationDefinition<'q, String>],
    requested: Option<&str>,
) -> Result<&'a ast::OperationDefinition<'q, String>> {
    match requested.filter(|name| !name.is_empty()) {
        Some(name) => operations
            .iter()
            .find(|operation| operation_name(operation) == Some(name))
            .copied()
            .ok_or_else(|| Error::InvalidQuery(format!("unknown operation named \"{name}\""))),
        None => match operations {
            [operation] => Ok(*operation),
            [] => Err(Error::InvalidQuery(
                "document does not contain any operation".to_string(),
            )),
            _ => Err(Error::InvalidQuery(
                "operation name is required when the document contains multiple operations"
                    .to_string(),
            )),
        },
    }
}

fn coerce_variables(
    definitions: &[VariableDefinition],
    provided: Option<&Map<String, Value>>,
) -> Result<Map<String, Value>> {
    let mut variables = provided.cloned().unwrap_or_default();
    for definition in definitions {
        if variables.contains_key(&definition.name) {
            continue;
        }
        match &definition.default_value {
            Some(default) => {
                let value = default.to_json(&Map::new());
                variables.insert(definition.name.clone(), value);
            }
            None if definition.ty.is_non_null() => {
                return Err(Error::InvalidQuery(format!(
                    "variable \"${}\" of required type \"{}\" was not provided",
                    definition.name, definition.ty
                )));
            }
            None => {}
        }
    }
    Ok(variables)
}

struct FragmentExpander<'a, 'q> {
    fragments: &'a HashMap<&'a str, &'a ast::FragmentDefinition<'q, String>>,
    variables: &'a Map<String, Value>,
}

impl<'q> FragmentExpander<'_, 'q> {
    fn expand(
        &self,
        selection_set: &ast::SelectionSet<'q, String>,
        visiting: &mut Vec<String>,
    ) -> Result<SelectionSet> {
        let mut out = Vec::with_capacity(selection_set.items.len());
        for item in &selection_set.items {
            match item {
                ast::Selection::Field(field) => {
                    if self.is_excluded(&field.directives)? {
                        continue;
                    }
                    out.push(Selection::Field(Field {
                        alias: field.alias.clone(),
                        name: field.name.clone(),
                        arguments: field
                            .arguments
                            .iter()
                            .map(|(name, value)| (name.clone(), InputValue::from_ast(value)))
                            .collect(),
                        selection_set: self.expand(&field.selection_set, visiting)?,
                        position: field.position.into(),
                    }));
                }
                ast::Selection::InlineFragment(fragment) => {
                    if self.is_excluded(&fragment.directives)? {
                        continue;
                    }
                    out.push(Selection::InlineFragment(InlineFragment {
                        type_condition: fragment.type_condition.as_ref().map(type_condition_name),
                        selection_set: self.expand(&fragment.selection_set, visiting)?,
                    }));
                }
                ast::Selection::FragmentSpread(spread) => {
                    if self.is_excluded(&spread.directives)? {
                        continue;
                    }
                    let name = spread.fragment_name.as_str();
                    let fragment = self.fragments.get(name).ok_or_else(|| {
                        Error::InvalidQuery(format!("unknown fragment \"{name}\""))
                    })?;
                    if visiting.iter().any(|visited| visited == name) {
                        return Err(Error::InvalidQuery(format!(
                            "fragment \"{name}\" spreads itself"
                        )));
                    }
                    visiting.push(name.to_string());
                    let selection_set = self.expand(&fragment.selection_set, visiting)?;
                    visiting.pop();
                    out.push(Selection::InlineFragment(InlineFragment {
                        type_condition: Some(type_condition_name(&fragment.type_condition)),
                        selection_set,
                    }));
                }
            }
        }
        Ok(out)
    }

    fn is_excluded(&self, directives: &[ast::Directive<'q, String>]) -> Result<bool> {
        for directive in directives {
            let excluded = match directive.name.as_str() {
                "skip" => self.condition(directive)?,
                "include" => !self.condition(directive)?,
                _ => false,
            };
            if excluded {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn condition(&self, directive: &ast::Directive<'q, String>) -> Result<bool> {
        let value = directive
            .arguments
            .iter()
            .find(|(name, _)| name == "if")
            .map(|(_, value)| value);
        match value {
            Some(ast::Value::Boolean(condition)) => Ok(*condition),
            Some(ast::Value::Variable(name)) => self
                .variables
                .get(name)
                .and_then(Value::as_bool)
                .ok_or_else(|| {
                    Error::InvalidQuery(format!(
                        "variable \"${name}\" used in @{} must be a boolean",
                        directive.name
                    ))
                }),
            _ => Err(Error::InvalidQuery(format!(
                "@{} requires a boolean \"if\" argument",
                directive.name
            ))),
        }
    }
}

fn type_condition_name(condition: &ast::TypeCondition<'_, String>) -> String {
    match condition {
        ast::TypeCondition::On(name) => name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prepare(query: &str, variables: Value) -> Operation {
        let variables = variables.as_object().cloned().unwrap_or_default();
        Operation::prepare(query, None, Some(&variables)).unwrap()
    }

    #[test]
    fn test_named_fragments_become_inline_fragments() {
        let operation = prepare(
            r#"
            query {
              snapshot(id: "1") { ...SnapshotFields }
            }
            fragment SnapshotFields on GizmoImplementation { name gizmos { id } }
            "#,
            json!({}),
        );

        assert_eq!(
            format_selection_set(&operation.selection_set),
            r#"{ snapshot(id: "1") { ... on GizmoImplementation { name gizmos { id } } } }"#
        );
    }

    #[test]
    fn test_skip_and_include_are_evaluated() {
        let operation = prepare(
            r#"
            query q($skipTitle: Boolean!, $withRelease: Boolean = false) {
              movie(id: "1") {
                id
                title @skip(if: $skipTitle)
                release @include(if: $withRelease)
                ... on Movie @include(if: true) { genre }
              }
            }
            "#,
            json!({ "skipTitle": true }),
        );

        assert_eq!(
            format_selection_set(&operation.selection_set),
            r#"{ movie(id: "1") { id ... on Movie { genre } } }"#
        );
        assert_eq!(operation.variables["withRelease"], json!(false));
    }

    #[test]
    fn test_missing_required_variable_is_rejected() {
        let result = Operation::prepare("query q($id: ID!) { movie(id: $id) { id } }", None, None);
        assert!(matches!(result, Err(Error::InvalidQuery(_))));
    }

    #[test]
    fn test_fragment_cycles_are_rejected() {
        let result = Operation::prepare(
            "{ movie { ...A } } fragment A on Movie { ...B } fragment B on Movie { ...A }",
            None,
            None,
        );
        assert!(matches!(result, Err(Error::InvalidQuery(message)) if message.contains("spreads itself")));
    }

    #[test]
    fn test_operation_selection_by_name() {
        let query = "query A { a } mutation B { b }";
        let operation = Operation::prepare(query, Some("B"), None).unwrap();
        assert_eq!(operation.kind, OperationKind::Mutation);
        assert_eq!(operation.name.as_deref(), Some("B"));
        assert!(Operation::prepare(query, None, None).is_err());
        assert!(Operation::prepare(query, Some("C"), None).is_err());

        let anonymous = Operation::prepare("{ a }", Some(""), None).unwrap();
        assert_eq!(anonymous.kind, OperationKind::Query);
    }

    #[test]
    fn test_input_values_print_as_graphql_literals() {
        let value = InputValue::Object(vec![
            ("id".to_string(), InputValue::String("say \"hi\"".to_string())),
            ("genre".to_string(), InputValue::Enum("ACTION".to_string())),
            (
                "ratings".to_string(),
                InputValue::List(vec![InputValue::Int(1), InputValue::Float(2.5)]),
            ),
        ]);
        assert_eq!(
            value.to_string(),
            r#"{id: "say \"hi\"", genre: ACTION, ratings: [1, 2.5]}"#
        );
    }

    #[test]
    fn test_positions_are_kept() {
        let operation = prepare("{\n  movie(id: \"1\") {\n    id\n  }\n}", json!({}));
        let Selection::Field(movie) = &operation.selection_set[0] else {
            panic!("expected a field");
        };
        assert_eq!(movie.position, Pos { line: 2, column: 3 });
    }
}
