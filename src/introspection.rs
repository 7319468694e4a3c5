//! Introspection over the merged schema, answered without calling services.

use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::operation::{Field, InputValue, Selection, TYPENAME_FIELD};
use crate::schema::{
    DirectiveDefinition, EnumValueDefinition, FieldDefinition, InputValueDefinition, Schema,
    TypeDefinition, TypeKind, TypeRef,
};

pub const SCHEMA_FIELD: &str = "__schema";
pub const TYPE_FIELD: &str = "__type";

const INTROSPECTION_SDL: &str = r#"
type __Schema {
  description: String
  types: [__Type!]!
  queryType: __Type!
  mutationType: __Type
  subscriptionType: __Type
  directives: [__Directive!]!
}

type __Type {
  kind: __TypeKind!
  name: String
  description: String
  specifiedByURL: String
  fields(includeDeprecated: Boolean = false): [__Field!]
  interfaces: [__Type!]
  possibleTypes: [__Type!]
  enumValues(includeDeprecated: Boolean = false): [__EnumValue!]
  inputFields(includeDeprecated: Boolean = false): [__InputValue!]
  ofType: __Type
  isOneOf: Boolean
}

enum __TypeKind { SCALAR OBJECT INTERFACE UNION ENUM INPUT_OBJECT LIST NON_NULL }

type __Field {
  name: String!
  description: String
  args(includeDeprecated: Boolean = false): [__InputValue!]!
  type: __Type!
  isDeprecated: Boolean!
  deprecationReason: String
}

type __InputValue {
  name: String!
  description: String
  type: __Type!
  defaultValue: String
  isDeprecated: Boolean!
  deprecationReason: String
}

type __EnumValue {
  name: String!
  description: String
  isDeprecated: Boolean!
  deprecationReason: String
}

type __Directive {
  name: String!
  description: String
  isRepeatable: Boolean!
  locations: [__DirectiveLocation!]!
  args(includeDeprecated: Boolean = false): [__InputValue!]!
}

enum __DirectiveLocation {
  QUERY MUTATION SUBSCRIPTION FIELD FRAGMENT_DEFINITION FRAGMENT_SPREAD INLINE_FRAGMENT
  VARIABLE_DEFINITION SCHEMA SCALAR OBJECT FIELD_DEFINITION ARGUMENT_DEFINITION INTERFACE
  UNION ENUM ENUM_VALUE INPUT_OBJECT INPUT_FIELD_DEFINITION
}

type Query { __placeholder: Boolean }
"#;

/// Adds the `__Schema`, `__Type`, ... definitions to a merged schema
pub fn add_introspection_types(schema: &mut Schema) -> Result<()> {
    let introspection = Schema::parse("__introspection", INTROSPECTION_SDL)?;
    for (name, definition) in introspection.types {
        if name.starts_with("__") {
            schema.types.insert(name, definition);
        }
    }
    Ok(())
}

pub fn is_introspection_root_field(name: &str) -> bool {
    name == SCHEMA_FIELD || name == TYPE_FIELD
}

/// A type as seen by introspection: a named definition or a wrapper
#[derive(Clone, Copy)]
enum TypeView<'a> {
    Named(&'a TypeDefinition),
    List(&'a TypeRef),
    NonNull(&'a TypeRef),
}

pub struct Introspector<'a> {
    schema: &'a Schema,
    variables: &'a Map<String, Value>,
}

impl<'a> Introspector<'a> {
    pub fn new(schema: &'a Schema, variables: &'a Map<String, Value>) -> Self {
        Introspector { schema, variables }
    }

    /// Resolves a root `__schema` or `__type` field
    pub fn resolve(&self, field: &Field) -> Result<Value> {
        match field.name.as_str() {
            SCHEMA_FIELD => self.resolve_schema(&field.selection_set),
            TYPE_FIELD => {
                let name = match field.argument("name") {
                    Some(value) => value.to_json(self.variables),
                    None => Value::Null,
                };
                let Some(name) = name.as_str() else {
                    return Err(Error::InvalidQuery(
                        "__type requires a \"name\" argument".to_string(),
                    ));
                };
                match self.schema.get_type(name) {
                    Some(definition) => {
                        self.resolve_type(TypeView::Named(definition), &field.selection_set)
                    }
                    None => Ok(Value::Null),
                }
            }
            other => Err(Error::InvalidQuery(format!(
                "unknown introspection field \"{other}\""
            ))),
        }
    }

    fn select(
        &self,
        type_name: &str,
        selection_set: &[Selection],
        resolve: &mut dyn FnMut(&Field) -> Result<Value>,
    ) -> Result<Value> {
        let mut out = Map::new();
        self.select_into(type_name, selection_set, resolve, &mut out)?;
        Ok(Value::Object(out))
    }

    fn select_into(
        &self,
        type_name: &str,
        selection_set: &[Selection],
        resolve: &mut dyn FnMut(&Field) -> Result<Value>,
        out: &mut Map<String, Value>,
    ) -> Result<()> {
        for selection in selection_set {
            match selection {
                Selection::Field(field) => {
                    let key = field.response_key();
                    if out.contains_key(key) {
                        continue;
                    }
                    let value = if field.name == TYPENAME_FIELD {
                        Value::String(type_name.to_string())
                    } else {
                        resolve(field)?
                    };
                    out.insert(key.to_string(), value);
                }
                Selection::InlineFragment(fragment) => {
                    if fragment
                        .type_condition
                        .as_deref()
                        .is_none_or(|condition| condition == type_name)
                    {
                        self.select_into(type_name, &fragment.selection_set, resolve, out)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn include_deprecated(&self, field: &Field) -> bool {
        field
            .argument("includeDeprecated")
            .map(|value| value.to_json(self.variables))
            .and_then(|value| value.as_bool())
            .unwrap_or(false)
    }

    fn named_type(&self, name: &str, selection_set: &[Selection]) -> Result<Value> {
        match self.schema.get_type(name) {
            Some(definition) => self.resolve_type(TypeView::Named(definition), selection_set),
            None => Ok(Value::Null),
        }
    }

    fn type_ref(&self, ty: &'a TypeRef, selection_set: &[Selection]) -> Result<Value> {
        match ty {
            TypeRef::Named(name) => self.named_type(name, selection_set),
            TypeRef::List(inner) => self.resolve_type(TypeView::List(inner), selection_set),
            TypeRef::NonNull(inner) => self.resolve_type(TypeView::NonNull(inner), selection_set),
        }
    }

    fn resolve_schema(&self, selection_set: &[Selection]) -> Result<Value> {
        let schema = self.schema;
        self.select("__Schema", selection_set, &mut |field| match field.name.as_str() {
            "description" => Ok(Value::Null),
            "types" => schema
                .types
                .values()
                .map(|definition| {
                    self.resolve_type(TypeView::Named(definition), &field.selection_set)
                })
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            "queryType" => self.named_type(&schema.query_type, &field.selection_set),
            "mutationType" => match &schema.mutation_type {
                Some(name) => self.named_type(name, &field.selection_set),
                None => Ok(Value::Null),
            },
            "subscriptionType" => match &schema.subscription_type {
                Some(name) => self.named_type(name, &field.selection_set),
                None => Ok(Value::Null),
            },
            "directives" => schema
                .directives
                .values()
                .map(|directive| self.resolve_directive(directive, &field.selection_set))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            _ => Ok(Value::Null),
        })
    }

    fn resolve_type(&self, view: TypeView<'a>, selection_set: &[Selection]) -> Result<Value> {
        self.select("__Type", selection_set, &mut |field| {
            let definition = match view {
                TypeView::Named(definition) => definition,
                TypeView::List(inner) => {
                    return match field.name.as_str() {
                        "kind" => Ok(json!("LIST")),
                        "ofType" => self.type_ref(inner, &field.selection_set),
                        _ => Ok(Value::Null),
                    };
                }
                TypeView::NonNull(inner) => {
                    return match field.name.as_str() {
                        "kind" => Ok(json!("NON_NULL")),
                        "ofType" => self.type_ref(inner, &field.selection_set),
                        _ => Ok(Value::Null),
                    };
                }
            };

            let include_deprecated = self.include_deprecated(field);
            match field.name.as_str() {
                "kind" => Ok(json!(definition.kind.as_str())),
                "name" => Ok(json!(definition.name)),
                "description" => Ok(json!(definition.description)),
                "specifiedByURL" => Ok(Value::Null),
                "isOneOf" => Ok(match definition.kind {
                    TypeKind::InputObject => json!(false),
                    _ => Value::Null,
                }),
                "fields" => match definition.kind {
                    TypeKind::Object | TypeKind::Interface => definition
                        .fields
                        .values()
                        .filter(|f| !f.name.starts_with("__"))
                        .filter(|f| include_deprecated || f.deprecation().is_none())
                        .map(|f| self.resolve_field(f, &field.selection_set))
                        .collect::<Result<Vec<_>>>()
                        .map(Value::Array),
                    _ => Ok(Value::Null),
                },
                "interfaces" => match definition.kind {
                    TypeKind::Object | TypeKind::Interface => definition
                        .interfaces
                        .iter()
                        .map(|name| self.named_type(name, &field.selection_set))
                        .collect::<Result<Vec<_>>>()
                        .map(Value::Array),
                    _ => Ok(Value::Null),
                },
                "possibleTypes" => match definition.kind {
                    TypeKind::Interface | TypeKind::Union => self
                        .schema
                        .possible_types(&definition.name)
                        .into_iter()
                        .map(|name| self.named_type(name, &field.selection_set))
                        .collect::<Result<Vec<_>>>()
                        .map(Value::Array),
                    _ => Ok(Value::Null),
                },
                "enumValues" => match definition.kind {
                    TypeKind::Enum => definition
                        .enum_values
                        .iter()
                        .filter(|v| include_deprecated || v.deprecation().is_none())
                        .map(|v| self.resolve_enum_value(v, &field.selection_set))
                        .collect::<Result<Vec<_>>>()
                        .map(Value::Array),
                    _ => Ok(Value::Null),
                },
                "inputFields" => match definition.kind {
                    TypeKind::InputObject => definition
                        .input_fields
                        .values()
                        .map(|input| self.resolve_input_value(input, &field.selection_set))
                        .collect::<Result<Vec<_>>>()
                        .map(Value::Array),
                    _ => Ok(Value::Null),
                },
                _ => Ok(Value::Null),
            }
        })
    }

    fn resolve_field(&self, definition: &'a FieldDefinition, selection_set: &[Selection]) -> Result<Value> {
        self.select("__Field", selection_set, &mut |field| match field.name.as_str() {
            "name" => Ok(json!(definition.name)),
            "description" => Ok(json!(definition.description)),
            "args" => definition
                .arguments
                .iter()
                .map(|arg| self.resolve_input_value(arg, &field.selection_set))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            "type" => self.type_ref(&definition.ty, &field.selection_set),
            "isDeprecated" => Ok(json!(definition.deprecation().is_some())),
            "deprecationReason" => Ok(json!(definition.deprecation().flatten())),
            _ => Ok(Value::Null),
        })
    }

    fn resolve_input_value(
        &self,
        definition: &'a InputValueDefinition,
        selection_set: &[Selection],
    ) -> Result<Value> {
        self.select("__InputValue", selection_set, &mut |field| match field.name.as_str() {
            "name" => Ok(json!(definition.name)),
            "description" => Ok(json!(definition.description)),
            "type" => self.type_ref(&definition.ty, &field.selection_set),
            "defaultValue" => Ok(json!(
                definition.default_value.as_ref().map(InputValue::to_string)
            )),
            "isDeprecated" => Ok(json!(false)),
            _ => Ok(Value::Null),
        })
    }

    fn resolve_enum_value(
        &self,
        definition: &EnumValueDefinition,
        selection_set: &[Selection],
    ) -> Result<Value> {
        self.select("__EnumValue", selection_set, &mut |field| match field.name.as_str() {
            "name" => Ok(json!(definition.name)),
            "description" => Ok(json!(definition.description)),
            "isDeprecated" => Ok(json!(definition.deprecation().is_some())),
            "deprecationReason" => Ok(json!(definition.deprecation().flatten())),
            _ => Ok(Value::Null),
        })
    }

    fn resolve_directive(
        &self,
        definition: &'a DirectiveDefinition,
        selection_set: &[Selection],
    ) -> Result<Value> {
        self.select("__Directive", selection_set, &mut |field| match field.name.as_str() {
            "name" => Ok(json!(definition.name)),
            "description" => Ok(json!(definition.description)),
            "isRepeatable" => Ok(json!(definition.repeatable)),
            "locations" => Ok(json!(definition.locations)),
            "args" => definition
                .arguments
                .iter()
                .map(|arg| self.resolve_input_value(arg, &field.selection_set))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            _ => Ok(Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use pretty_assertions::assert_eq;

    fn schema() -> Schema {
        let mut schema = Schema::parse(
            "test",
            r#"
            "A film"
            type Movie {
              id: ID!
              title: String @deprecated(reason: "use name")
              genres: [Genre!]!
            }
            enum Genre { ACTION DRAMA }
            type Query { movie(id: ID!): Movie }
            "#,
        )
        .unwrap();
        add_introspection_types(&mut schema).unwrap();
        schema
    }

    fn resolve(query: &str) -> Value {
        let schema = schema();
        let operation = Operation::prepare(query, None, None).unwrap();
        let Selection::Field(field) = &operation.selection_set[0] else {
            panic!("expected a field");
        };
        let variables = Map::new();
        Introspector::new(&schema, &variables).resolve(field).unwrap()
    }

    #[test]
    fn test_type_with_wrapped_fields() {
        let value = resolve(
            r#"{ __type(name: "Movie") {
                kind name description
                fields { name type { kind ofType { kind ofType { kind ofType { name } } } } }
            } }"#,
        );
        assert_eq!(
            value,
            json!({
                "kind": "OBJECT",
                "name": "Movie",
                "description": "A film",
                "fields": [
                    { "name": "id", "type": { "kind": "NON_NULL", "ofType": { "kind": "SCALAR", "ofType": null } } },
                    { "name": "genres", "type": { "kind": "NON_NULL", "ofType": { "kind": "LIST", "ofType": { "kind": "NON_NULL", "ofType": { "name": "Genre" } } } } }
                ]
            })
        );
    }

    #[test]
    fn test_include_deprecated() {
        let value = resolve(
            r#"{ __type(name: "Movie") { fields(includeDeprecated: true) { name isDeprecated deprecationReason } } }"#,
        );
        assert_eq!(
            value["fields"][1],
            json!({ "name": "title", "isDeprecated": true, "deprecationReason": "use name" })
        );
    }

    #[test]
    fn test_schema_root_types_and_fragments() {
        let value = resolve(
            "{ __schema { queryType { ...T } mutationType { name } } } fragment T on __Type { name __typename }",
        );
        assert_eq!(
            value,
            json!({ "queryType": { "name": "Query", "__typename": "__Type" }, "mutationType": null })
        );
    }

    #[test]
    fn test_unknown_type_is_null() {
        assert_eq!(resolve(r#"{ __type(name: "Nope") { name } }"#), Value::Null);
    }

    #[test]
    fn test_introspection_types_are_listed() {
        let value = resolve(r#"{ __type(name: "__Type") { kind } }"#);
        assert_eq!(value, json!({ "kind": "OBJECT" }));
    }
}
