//! GraphQL responses and the assembly of the client-facing result
//!
//! The executor hands over a merged tree that still carries routing tokens and
//! every speculatively requested fragment field. [`ResponseAssembler`] walks the
//! client selection set over that tree and produces the response the client
//! asked for, applying null propagation along the way.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::operation::{Field, Pos, Selection, TYPENAME_FIELD};
use crate::schema::{Schema, TypeKind, TypeRef, is_introspection_name};

pub const BRAMBLE_ID: &str = "_bramble_id";
pub const BRAMBLE_TYPENAME: &str = "_bramble__typename";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl From<Pos> for Location {
    fn from(pos: Pos) -> Self {
        Location {
            line: pos.line,
            column: pos.column,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

/// GraphQL error as returned to clients and as read from services
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<PathSegment>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = path;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLResponse {
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl GraphQLResponse {
    pub fn from_errors(errors: Vec<GraphQLError>) -> Self {
        GraphQLResponse {
            data: None,
            errors,
            extensions: Map::new(),
        }
    }
}

/// Marker for a null that must propagate to the nearest nullable parent
struct NullBubble;

pub struct ResponseAssembler<'a> {
    schema: &'a Schema,
    errors: Vec<GraphQLError>,
    path: Vec<PathSegment>,
}

impl<'a> ResponseAssembler<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        ResponseAssembler {
            schema,
            errors: Vec::new(),
            path: Vec::new(),
        }
    }

    /// Builds `data` for a root selection set. Returns `None` when a null
    /// propagated all the way up, together with the null errors raised.
    pub fn assemble(
        mut self,
        root_type: &str,
        selection_set: &[Selection],
        data: &Map<String, Value>,
    ) -> (Option<Value>, Vec<GraphQLError>) {
        let data = self
            .complete_object(root_type, selection_set, Some(data))
            .ok()
            .map(Value::Object);
        (data, self.errors)
    }

    fn complete_object(
        &mut self,
        static_type: &str,
        selection_set: &[Selection],
        source: Option<&Map<String, Value>>,
    ) -> Result<Map<String, Value>, NullBubble> {
        let runtime_type = source
            .and_then(|object| object.get(BRAMBLE_TYPENAME))
            .and_then(Value::as_str)
            .unwrap_or(static_type)
            .to_string();

        let mut grouped: IndexMap<&str, Vec<&Field>> = IndexMap::new();
        self.collect_fields(&runtime_type, selection_set, &mut grouped);

        let mut out = Map::new();
        for (key, fields) in grouped {
            let field = fields[0];
            if field.name == TYPENAME_FIELD {
                out.insert(key.to_string(), Value::String(runtime_type.clone()));
                continue;
            }
            let value = source.and_then(|object| object.get(key));
            if is_introspection_name(&field.name) {
                out.insert(key.to_string(), value.cloned().unwrap_or(Value::Null));
                continue;
            }

            let Some(field_type) = self
                .schema
                .field(&runtime_type, &field.name)
                .or_else(|| self.schema.field(static_type, &field.name))
                .map(|definition| definition.ty.clone())
            else {
                out.insert(key.to_string(), Value::Null);
                continue;
            };

            let sub_selection: Vec<Selection> = if fields.len() == 1 {
                field.selection_set.clone()
            } else {
                fields
                    .iter()
                    .flat_map(|f| f.selection_set.iter().cloned())
                    .collect()
            };

            self.path.push(PathSegment::Key(key.to_string()));
            let completed = self.complete_value(&field_type, value, &sub_selection, key);
            self.path.pop();
            out.insert(key.to_string(), completed?);
        }
        Ok(out)
    }

    fn collect_fields<'s>(
        &self,
        runtime_type: &str,
        selection_set: &'s [Selection],
        grouped: &mut IndexMap<&'s str, Vec<&'s Field>>,
    ) {
        for selection in selection_set {
            match selection {
                Selection::Field(field) => {
                    grouped.entry(field.response_key()).or_default().push(field);
                }
                Selection::InlineFragment(fragment) => {
                    let applies = fragment
                        .type_condition
                        .as_deref()
                        .is_none_or(|condition| self.schema.is_subtype(condition, runtime_type));
                    if applies {
                        self.collect_fields(runtime_type, &fragment.selection_set, grouped);
                    }
                }
            }
        }
    }

    fn complete_value(
        &mut self,
        ty: &TypeRef,
        value: Option<&Value>,
        selection_set: &[Selection],
        key: &str,
    ) -> Result<Value, NullBubble> {
        match ty {
            TypeRef::NonNull(inner) => {
                let completed = self.complete_nullable(inner, value, selection_set, key)?;
                if completed.is_null() {
                    self.errors.push(
                        GraphQLError::new(format!(
                            "got a null response for non-nullable field \"{key}\""
                        ))
                        .with_path(self.path.clone()),
                    );
                    return Err(NullBubble);
                }
                Ok(completed)
            }
            _ => Ok(self
                .complete_nullable(ty, value, selection_set, key)
                .unwrap_or(Value::Null)),
        }
    }

    fn complete_nullable(
        &mut self,
        ty: &TypeRef,
        value: Option<&Value>,
        selection_set: &[Selection],
        key: &str,
    ) -> Result<Value, NullBubble> {
        let value = value.filter(|value| !value.is_null());
        match ty {
            TypeRef::NonNull(_) => self.complete_value(ty, value, selection_set, key),
            TypeRef::List(item_type) => {
                let Some(Value::Array(items)) = value else {
                    return Ok(Value::Null);
                };
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    self.path.push(PathSegment::Index(index));
                    let completed = self.complete_value(item_type, Some(item), selection_set, key);
                    self.path.pop();
                    out.push(completed?);
                }
                Ok(Value::Array(out))
            }
            TypeRef::Named(name) => {
                let kind = self.schema.get_type(name).map(|definition| definition.kind);
                match kind {
                    Some(TypeKind::Object | TypeKind::Interface | TypeKind::Union) => {
                        match value {
                            Some(Value::Object(object)) => self
                                .complete_object(name, selection_set, Some(object))
                                .map(Value::Object),
                            // namespaces exist even when nothing below them was fetched
                            None if self.schema.is_namespace(name) => self
                                .complete_object(name, selection_set, None)
                                .map(Value::Object),
                            _ => Ok(Value::Null),
                        }
                    }
                    _ => Ok(value.cloned().unwrap_or(Value::Null)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SCHEMA: &str = r#"
        interface Gizmo { id: ID! name: String! }
        type Widget implements Gizmo { id: ID! name: String! size: Int }
        type Gadget implements Gizmo { id: ID! name: String! battery: Int }
        type Cinema @namespace { name: String }
        type Query {
          gizmos: [Gizmo!]!
          owner: Owner
          cinema: Cinema!
        }
        type Owner { id: ID! name: String! }
    "#;

    fn assemble(query: &str, data: Value) -> (Option<Value>, Vec<GraphQLError>) {
        let schema = Schema::parse("test", SCHEMA).unwrap();
        let operation = Operation::prepare(query, None, None).unwrap();
        ResponseAssembler::new(&schema).assemble(
            "Query",
            &operation.selection_set,
            data.as_object().unwrap(),
        )
    }

    #[test]
    fn test_fragments_follow_runtime_type() {
        let (data, errors) = assemble(
            "{ gizmos { __typename name ... on Widget { size } ... on Gadget { battery } } }",
            json!({
                "gizmos": [
                    { "_bramble__typename": "Widget", "name": "w", "size": 2, "battery": null },
                    { "_bramble__typename": "Gadget", "name": "g", "battery": 90 }
                ]
            }),
        );
        assert!(errors.is_empty());
        assert_eq!(
            data.unwrap().to_string(),
            json!({
                "gizmos": [
                    { "__typename": "Widget", "name": "w", "size": 2 },
                    { "__typename": "Gadget", "name": "g", "battery": 90 }
                ]
            })
            .to_string()
        );
    }

    #[test]
    fn test_null_propagates_to_nullable_parent() {
        let (data, errors) = assemble(
            "{ owner { id name } }",
            json!({ "owner": { "id": "1", "name": null } }),
        );
        assert_eq!(data, Some(json!({ "owner": null })));
        assert_eq!(
            errors[0].message,
            "got a null response for non-nullable field \"name\""
        );
        assert_eq!(errors[0].path, vec![PathSegment::from("owner"), PathSegment::from("name")]);
    }

    #[test]
    fn test_null_in_non_null_list_nulls_data() {
        let (data, errors) = assemble(
            "{ gizmos { id } }",
            json!({ "gizmos": [{ "_bramble__typename": "Widget", "id": "1" }, null] }),
        );
        assert_eq!(data, None);
        assert_eq!(errors[0].path, vec![PathSegment::from("gizmos"), PathSegment::from(1)]);
    }

    #[test]
    fn test_unfetched_namespace_renders() {
        let (data, errors) = assemble("{ cinema { __typename } }", json!({}));
        assert!(errors.is_empty());
        assert_eq!(data, Some(json!({ "cinema": { "__typename": "Cinema" } })));
    }

    #[test]
    fn test_duplicate_keys_are_merged_in_request_order() {
        let (data, _) = assemble(
            "{ owner { id } owner { name } }",
            json!({ "owner": { "id": "1", "name": "Ann", "_bramble_id": "1" } }),
        );
        assert_eq!(
            data.unwrap().to_string(),
            r#"{"owner":{"id":"1","name":"Ann"}}"#
        );
    }

    #[test]
    fn test_error_serialization_skips_empty_fields() {
        let error = GraphQLError::new("boom").with_path(vec!["movie".into(), 0.into()]);
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({ "message": "boom", "path": ["movie", 0] })
        );
    }
}
