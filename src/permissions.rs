//! Field allow-lists
//!
//! Permissions are supplied per request (usually by a plugin) and applied to
//! the prepared operation before planning. Denied fields are removed and
//! reported; everything else proceeds normally.

use std::collections::HashMap;

use serde::de::{self, Deserializer};
use serde::Deserialize;

use crate::operation::{Operation, OperationKind, Selection, SelectionSet, TYPENAME_FIELD};
use crate::response::{GraphQLError, Location};
use crate::schema::is_introspection_name;

/// Either every field, or the named fields with their own nested allow-list
///
/// Deserializes from `"*"` or from a list of dotted paths such as
/// `["movies.id", "movies.title", "cinema"]`. A path ending at a field allows
/// everything below it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllowedFields {
    AllowAll,
    Fields(HashMap<String, AllowedFields>),
}

impl Default for AllowedFields {
    fn default() -> Self {
        AllowedFields::Fields(HashMap::new())
    }
}

impl AllowedFields {
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed = AllowedFields::default();
        for path in paths {
            let segments: Vec<&str> = path.as_ref().split('.').collect();
            allowed.insert_path(&segments);
        }
        allowed
    }

    fn insert_path(&mut self, segments: &[&str]) {
        let AllowedFields::Fields(fields) = self else {
            return;
        };
        match segments.split_first() {
            None => {}
            Some((&"*", _)) => *self = AllowedFields::AllowAll,
            Some((segment, [])) => {
                fields.insert(segment.to_string(), AllowedFields::AllowAll);
            }
            Some((segment, rest)) => {
                fields.entry(segment.to_string()).or_default().insert_path(rest);
            }
        }
    }

    pub fn is_allowed(&self, field: &str) -> bool {
        match self {
            AllowedFields::AllowAll => true,
            AllowedFields::Fields(fields) => fields.contains_key(field),
        }
    }

    /// Allow-list for the children of `field`
    pub fn children(&self, field: &str) -> Option<&AllowedFields> {
        match self {
            AllowedFields::AllowAll => Some(self),
            AllowedFields::Fields(fields) => fields.get(field),
        }
    }
}

impl<'de> Deserialize<'de> for AllowedFields {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            All(String),
            Paths(Vec<String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::All(value) if value == "*" => Ok(AllowedFields::AllowAll),
            Raw::All(value) => Err(de::Error::custom(format!(
                "expected \"*\" or a list of field paths, got \"{value}\""
            ))),
            Raw::Paths(paths) => Ok(AllowedFields::from_paths(paths)),
        }
    }
}

/// Allowed root fields per operation type
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct OperationPermissions {
    #[serde(default)]
    pub query: AllowedFields,
    #[serde(default)]
    pub mutation: AllowedFields,
    #[serde(default)]
    pub subscription: AllowedFields,
}

impl OperationPermissions {
    pub fn allow_all() -> Self {
        OperationPermissions {
            query: AllowedFields::AllowAll,
            mutation: AllowedFields::AllowAll,
            subscription: AllowedFields::AllowAll,
        }
    }

    pub fn for_kind(&self, kind: OperationKind) -> &AllowedFields {
        match kind {
            OperationKind::Query => &self.query,
            OperationKind::Mutation => &self.mutation,
            OperationKind::Subscription => &self.subscription,
        }
    }
}

/// Removes every field the permissions deny from `operation`, returning one
/// error per denied field.
pub fn filter_operation(
    operation: &mut Operation,
    permissions: &OperationPermissions,
) -> Vec<GraphQLError> {
    let allowed = permissions.for_kind(operation.kind);
    let mut errors = Vec::new();
    let prefix = operation.kind.as_str().to_string();
    filter_selection_set(&mut operation.selection_set, allowed, &prefix, &mut errors);
    errors
}

fn filter_selection_set(
    selection_set: &mut SelectionSet,
    allowed: &AllowedFields,
    path: &str,
    errors: &mut Vec<GraphQLError>,
) {
    if *allowed == AllowedFields::AllowAll {
        return;
    }
    selection_set.retain_mut(|selection| match selection {
        Selection::Field(field) => {
            if field.name == TYPENAME_FIELD || is_introspection_name(&field.name) {
                return true;
            }
            let field_path = format!("{path}.{}", field.name);
            match allowed.children(&field.name) {
                Some(children) if allowed.is_allowed(&field.name) => {
                    if field.selection_set.is_empty() {
                        return true;
                    }
                    filter_selection_set(&mut field.selection_set, children, &field_path, errors);
                    // a composite field left without selections cannot be queried
                    !field.selection_set.is_empty()
                }
                _ => {
                    errors.push(GraphQLError {
                        locations: vec![Location::from(field.position)],
                        ..GraphQLError::new(format!(
                            "user do not have permission to access field {field_path}"
                        ))
                    });
                    false
                }
            }
        }
        Selection::InlineFragment(fragment) => {
            filter_selection_set(&mut fragment.selection_set, allowed, path, errors);
            !fragment.selection_set.is_empty()
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::format_selection_set;
    use serde_json::json;

    fn prepare(query: &str) -> Operation {
        Operation::prepare(query, None, None).unwrap()
    }

    #[test]
    fn test_deserialize_from_star_and_paths() {
        let permissions: OperationPermissions = serde_json::from_value(json!({
            "query": ["movies.id", "movies.title", "cinema"],
            "mutation": "*"
        }))
        .unwrap();

        assert_eq!(permissions.mutation, AllowedFields::AllowAll);
        assert_eq!(permissions.subscription, AllowedFields::default());
        let movies = permissions.query.children("movies").unwrap();
        assert!(movies.is_allowed("title"));
        assert!(!movies.is_allowed("release"));
        assert_eq!(
            permissions.query.children("cinema"),
            Some(&AllowedFields::AllowAll)
        );

        let invalid = serde_json::from_value::<AllowedFields>(json!("everything"));
        assert!(invalid.is_err());
    }

    #[test]
    fn test_denied_root_field() {
        let permissions: OperationPermissions =
            serde_json::from_value(json!({ "query": ["movies"] })).unwrap();
        let mut operation = prepare("{ movies { id } cinema { name } }");

        let errors = filter_operation(&mut operation, &permissions);

        assert_eq!(format_selection_set(&operation.selection_set), "{ movies { id } }");
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].message,
            "user do not have permission to access field query.cinema"
        );
    }

    #[test]
    fn test_nested_fields_and_fragments() {
        let permissions: OperationPermissions =
            serde_json::from_value(json!({ "query": ["movies.id"] })).unwrap();
        let mut operation = prepare("{ movies { __typename id ... on Movie { title } } }");

        let errors = filter_operation(&mut operation, &permissions);

        assert_eq!(
            format_selection_set(&operation.selection_set),
            "{ movies { __typename id } }"
        );
        assert_eq!(
            errors[0].message,
            "user do not have permission to access field query.movies.title"
        );
    }

    #[test]
    fn test_field_with_every_child_denied_is_dropped() {
        let permissions: OperationPermissions =
            serde_json::from_value(json!({ "query": ["movies.id", "cinema"] })).unwrap();
        let mut operation = prepare("{ movies { reviews { rating } } cinema { name } }");

        let errors = filter_operation(&mut operation, &permissions);

        assert_eq!(format_selection_set(&operation.selection_set), "{ cinema { name } }");
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].message,
            "user do not have permission to access field query.movies.reviews"
        );
    }

    #[test]
    fn test_all_root_fields_denied() {
        let mut operation = prepare("mutation { createMovie(title: \"x\") { id } }");
        let errors = filter_operation(&mut operation, &OperationPermissions::default());
        assert!(operation.selection_set.is_empty());
        assert_eq!(
            errors[0].message,
            "user do not have permission to access field mutation.createMovie"
        );
    }
}
