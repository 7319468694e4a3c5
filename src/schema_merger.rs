//! Combines service schemas into the gateway's merged schema and the routing
//! tables the planner works from.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::introspection::add_introspection_types;
use crate::schema::{
    FieldDefinition, IdField, Schema, SERVICE_FIELD, SERVICE_TYPE, SKIP_MERGE_DIRECTIVE,
    TypeDefinition, TypeKind, TypeRef, BOUNDARY_DIRECTIVE, BUILTIN_SCALARS, MUTATION_TYPE,
    QUERY_TYPE, SUBSCRIPTION_TYPE, is_federation_directive, is_introspection_name,
};
use crate::{FederatedSchema, ServiceMap};

/// Root query field a service exposes to look up a boundary type by id
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BoundaryQuery {
    pub field: String,
    pub argument: String,
    /// Takes a list of ids and returns a list
    pub array: bool,
}

/// Key of the location table
pub fn location_key(type_name: &str, field_name: &str) -> String {
    format!("{type_name}.{field_name}")
}

#[derive(Default)]
struct Owners {
    primary: Vec<String>,
    skipped: Vec<String>,
}

/// Merges every service schema. Fails on the first conflict.
pub fn merge(services: ServiceMap) -> Result<FederatedSchema> {
    merge_with(services, &IdField::default())
}

/// Like [`merge`], with boundary types identified by `id_field`
pub fn merge_with(services: ServiceMap, id_field: &IdField) -> Result<FederatedSchema> {
    if services.is_empty() {
        return Err(Error::merge("no services to merge"));
    }

    let mut merged = Schema::default();
    let mut owners: HashMap<String, Owners> = HashMap::new();
    let mut boundary_queries = HashMap::new();
    // type name -> services defining it
    let mut boundary_definitions: HashMap<String, Vec<String>> = HashMap::new();

    for (service_name, service) in &services {
        let schema = &service.schema;
        let queries = collect_boundary_queries(schema, id_field);
        let hidden_queries: Vec<&str> = queries
            .iter()
            .filter(|(_, (_, annotated))| *annotated)
            .map(|(_, (query, _))| query.field.as_str())
            .collect();

        for definition in schema.types.values() {
            if is_hidden_type(&definition.name) {
                continue;
            }
            let is_root = schema.is_root_type(&definition.name);
            if definition.is_boundary() {
                boundary_definitions
                    .entry(definition.name.clone())
                    .or_default()
                    .push(service_name.clone());
            }

            for field in definition.fields.values() {
                if is_root && definition.name == schema.query_type {
                    if field.name == SERVICE_FIELD && field.ty.named_type() == SERVICE_TYPE {
                        continue;
                    }
                    if hidden_queries.contains(&field.name.as_str()) {
                        continue;
                    }
                }
                if is_introspection_name(&field.name) {
                    continue;
                }
                let entry = owners.entry(location_key(&definition.name, &field.name)).or_default();
                if field.has_directive(SKIP_MERGE_DIRECTIVE) {
                    entry.skipped.push(service_name.clone());
                } else {
                    entry.primary.push(service_name.clone());
                }
            }

            if is_root || definition.is_namespace() || definition.is_boundary() {
                merge_composite(&mut merged, service_name, schema, definition, &hidden_queries)?;
            } else {
                merge_value_type(&mut merged, service_name, definition)?;
            }
        }

        for directive in schema.directives.values() {
            if !is_federation_directive(&directive.name) {
                merged
                    .directives
                    .entry(directive.name.clone())
                    .or_insert_with(|| directive.clone());
            }
        }

        boundary_queries.insert(
            service_name.clone(),
            queries
                .into_iter()
                .map(|(type_name, (query, _))| (type_name, query))
                .collect::<HashMap<_, _>>(),
        );
    }

    for (type_name, defining) in &boundary_definitions {
        let routable = services.keys().any(|service| {
            boundary_queries
                .get(service)
                .is_some_and(|queries: &HashMap<String, BoundaryQuery>| queries.contains_key(type_name))
        });
        if !routable {
            return Err(Error::merge(format!(
                "boundary type \"{type_name}\" is defined by services {} but no service provides a boundary query for it",
                defining.join(", ")
            )));
        }
    }

    if !merged.types.contains_key(QUERY_TYPE) {
        return Err(Error::merge("merged schema has no Query type"));
    }
    merged.query_type = QUERY_TYPE.to_string();
    merged.mutation_type = merged
        .types
        .contains_key(MUTATION_TYPE)
        .then(|| MUTATION_TYPE.to_string());
    merged.subscription_type = merged
        .types
        .contains_key(SUBSCRIPTION_TYPE)
        .then(|| SUBSCRIPTION_TYPE.to_string());
    add_introspection_types(&mut merged)?;

    let type_to_service_map: HashMap<String, Vec<String>> = owners
        .into_iter()
        .map(|(key, owners)| {
            let mut services = owners.primary;
            services.extend(owners.skipped);
            (key, services)
        })
        .collect();

    debug!(
        services = services.len(),
        types = merged.types.len(),
        locations = type_to_service_map.len(),
        "merged service schemas"
    );

    Ok(FederatedSchema {
        services,
        schema: merged,
        type_to_service_map,
        boundary_queries,
        id_field: id_field.clone(),
    })
}

fn is_hidden_type(name: &str) -> bool {
    name == SERVICE_TYPE || is_introspection_name(name) || BUILTIN_SCALARS.contains(&name)
}

/// Boundary queries of one service keyed by boundary type, with whether each
/// was annotated with `@boundary` (annotated queries are routing-only).
fn collect_boundary_queries(
    schema: &Schema,
    id_field: &IdField,
) -> HashMap<String, (BoundaryQuery, bool)> {
    let mut queries = HashMap::new();
    let Some(query) = schema.get_type(&schema.query_type) else {
        return queries;
    };

    for field in query.fields.values() {
        if !field.has_directive(BOUNDARY_DIRECTIVE) {
            continue;
        }
        if let Some(argument) = field.arguments.first() {
            queries.insert(
                field.ty.named_type().to_string(),
                (
                    BoundaryQuery {
                        field: field.name.clone(),
                        argument: argument.name.clone(),
                        array: field.ty.is_list(),
                    },
                    true,
                ),
            );
        }
    }

    for definition in schema.types.values().filter(|t| t.is_boundary()) {
        if queries.contains_key(&definition.name) {
            continue;
        }
        if let Some(query) = query
            .fields
            .values()
            .find_map(|field| fallback_boundary_query(field, &definition.name, id_field))
        {
            queries.insert(definition.name.clone(), (query, false));
        }
    }
    queries
}

/// `field(id: ID!): T` or `field(ids: [ID!]): [T]`, with the id name and
/// scalar taken from `id_field`
fn fallback_boundary_query(
    field: &FieldDefinition,
    type_name: &str,
    id_field: &IdField,
) -> Option<BoundaryQuery> {
    if field.ty.named_type() != type_name {
        return None;
    }
    let [argument] = field.arguments.as_slice() else {
        return None;
    };
    let id = TypeRef::named(id_field.scalar());
    let non_null_id = TypeRef::non_null(id.clone());
    if argument.name == id_field.name && argument.ty == non_null_id && !field.ty.is_list() {
        return Some(BoundaryQuery {
            field: field.name.clone(),
            argument: argument.name.clone(),
            array: false,
        });
    }
    let item_is_id = argument
        .ty
        .item_type()
        .is_some_and(|item| *item == non_null_id || *item == id);
    if argument.name == "ids" && item_is_id && field.ty.is_list() {
        return Some(BoundaryQuery {
            field: field.name.clone(),
            argument: argument.name.clone(),
            array: true,
        });
    }
    None
}

/// Root, namespace and boundary types are merged field by field.
fn merge_composite(
    merged: &mut Schema,
    service: &str,
    schema: &Schema,
    definition: &TypeDefinition,
    hidden_queries: &[&str],
) -> Result<()> {
    let is_query = definition.name == schema.query_type;
    let name = if is_query {
        QUERY_TYPE.to_string()
    } else {
        definition.name.clone()
    };

    let target = match merged.types.get_mut(&name) {
        Some(existing) => {
            if existing.kind != definition.kind {
                return Err(Error::merge(format!(
                    "type \"{name}\" is {} in service \"{service}\" but {} elsewhere",
                    definition.kind.as_str(),
                    existing.kind.as_str()
                )));
            }
            if existing.is_boundary() != definition.is_boundary()
                || existing.is_namespace() != definition.is_namespace()
            {
                return Err(Error::merge(format!(
                    "type \"{name}\" in service \"{service}\" does not match the federation directives used by other services"
                )));
            }
            existing
        }
        None => {
            let mut fresh = definition.clone();
            fresh.name = name.clone();
            fresh.fields.clear();
            merged.types.entry(name.clone()).or_insert(fresh)
        }
    };

    for interface in &definition.interfaces {
        if !target.interfaces.contains(interface) {
            target.interfaces.push(interface.clone());
        }
    }

    for field in definition.fields.values() {
        if is_introspection_name(&field.name) {
            continue;
        }
        if is_query
            && (hidden_queries.contains(&field.name.as_str())
                || (field.name == SERVICE_FIELD && field.ty.named_type() == SERVICE_TYPE))
        {
            continue;
        }

        let Some(existing) = target.fields.get(&field.name) else {
            target.fields.insert(field.name.clone(), field.clone());
            continue;
        };

        if target.kind == TypeKind::Object && target.is_boundary() {
            let existing_skipped = existing.has_directive(SKIP_MERGE_DIRECTIVE);
            let skipped = field.has_directive(SKIP_MERGE_DIRECTIVE);
            if existing_skipped && !skipped {
                target.fields.insert(field.name.clone(), field.clone());
            } else if !existing_skipped && !skipped && existing.ty != field.ty {
                return Err(Error::merge(format!(
                    "field \"{name}.{}\" has type \"{}\" in service \"{service}\" but \"{}\" elsewhere",
                    field.name, field.ty, existing.ty
                )));
            }
            continue;
        }

        // root and namespace types share a field only when it is a namespace
        let shared_namespace = existing.ty == field.ty && schema.is_namespace(field.ty.named_type());
        if !shared_namespace {
            return Err(Error::merge(format!(
                "field \"{name}.{}\" from service \"{service}\" is already defined by another service",
                field.name
            )));
        }
    }
    Ok(())
}

/// Value types shared between services must be identical
fn merge_value_type(merged: &mut Schema, service: &str, definition: &TypeDefinition) -> Result<()> {
    match merged.types.get(&definition.name) {
        Some(existing) => {
            if let Some(difference) = existing.signature_mismatch(definition) {
                return Err(Error::merge(format!(
                    "conflicting definitions of type \"{}\" in service \"{service}\": {difference}",
                    definition.name
                )));
            }
        }
        None => {
            merged
                .types
                .insert(definition.name.clone(), definition.clone());
        }
    }
    Ok(())
}
