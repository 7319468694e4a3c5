use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::introspection::is_introspection_root_field;
use crate::operation::{
    Field, InlineFragment, Operation, OperationKind, Selection, SelectionSet, TYPENAME_FIELD,
    has_response_key,
};
use crate::response::{BRAMBLE_ID, BRAMBLE_TYPENAME};
use crate::schema::Schema;
use crate::{FederatedSchema, QueryPlan, QueryPlanStep};

#[async_trait]
pub trait QueryPlanner {
    async fn plan_query(&self, operation: &Operation, schema: &FederatedSchema) -> Result<QueryPlan>;
}

/// Splits operations along service boundaries using the merged schema's
/// location table.
#[derive(Debug, Default, Clone, Copy)]
pub struct FederatedQueryPlanner;

impl FederatedQueryPlanner {
    pub fn new() -> Self {
        FederatedQueryPlanner
    }
}

#[async_trait]
impl QueryPlanner for FederatedQueryPlanner {
    async fn plan_query(&self, operation: &Operation, schema: &FederatedSchema) -> Result<QueryPlan> {
        let context = PlanningContext {
            federated: schema,
            schema: &schema.schema,
            variables: &operation.variables,
        };
        let plan = context.plan(operation)?;
        debug!(
            operation = operation.kind.as_str(),
            root_steps = plan.root_steps.len(),
            steps = plan.step_count(),
            "planned operation"
        );
        Ok(plan)
    }
}

struct PlanningContext<'a> {
    federated: &'a FederatedSchema,
    schema: &'a Schema,
    variables: &'a Map<String, Value>,
}

impl PlanningContext<'_> {
    fn plan(&self, operation: &Operation) -> Result<QueryPlan> {
        if operation.kind == OperationKind::Subscription {
            return Err(Error::plan("subscriptions are not supported"));
        }
        let root_type = self
            .schema
            .root_type(operation.kind)
            .ok_or_else(|| {
                Error::plan(format!(
                    "the schema does not support {} operations",
                    operation.kind.as_str()
                ))
            })?
            .to_string();

        let groups = self.route_root_selections(operation.kind, &root_type, &operation.selection_set)?;
        let mut root_steps = Vec::with_capacity(groups.len());
        for (service, selections) in groups {
            let (selection_set, then) = self.extract_selection_set(&service, &root_type, &selections, &[])?;
            root_steps.push(QueryPlanStep {
                service_url: self.service_url(&service)?,
                service_name: service,
                parent_type: root_type.clone(),
                selection_set,
                insertion_point: Vec::new(),
                boundary_query: None,
                then,
            });
        }

        Ok(QueryPlan {
            operation_kind: operation.kind,
            root_steps,
        })
    }

    fn service_url(&self, service: &str) -> Result<String> {
        self.federated
            .service_url(service)
            .map(str::to_string)
            .ok_or_else(|| Error::plan(format!("unknown service \"{service}\"")))
    }

    /// Groups root fields by owning service. Mutations only group consecutive
    /// fields so services are called in client order.
    fn route_root_selections(
        &self,
        kind: OperationKind,
        root_type: &str,
        selection_set: &[Selection],
    ) -> Result<Vec<(String, SelectionSet)>> {
        let mut fields = Vec::new();
        flatten_fields(selection_set, &mut fields);

        let mut groups: Vec<(String, SelectionSet)> = Vec::new();
        let mut push = |service: String, selection: Selection| {
            let existing = match kind {
                OperationKind::Mutation => groups.last_mut().filter(|(last, _)| *last == service),
                _ => groups.iter_mut().find(|(name, _)| *name == service),
            };
            match existing {
                Some((_, selections)) => selections.push(selection),
                None => groups.push((service, vec![selection])),
            }
        };

        for field in fields {
            if field.name == TYPENAME_FIELD || is_introspection_root_field(&field.name) {
                continue;
            }
            let definition = self.schema.field(root_type, &field.name).ok_or_else(|| {
                Error::plan(format!(
                    "field \"{}\" does not exist on type \"{root_type}\"",
                    field.name
                ))
            })?;
            let field_type = definition.ty.named_type();

            if self.schema.is_namespace(field_type) {
                for (service, children) in self.split_namespace(field_type, &field.selection_set)? {
                    push(
                        service,
                        Selection::Field(Field {
                            selection_set: children,
                            ..field.clone()
                        }),
                    );
                }
                continue;
            }

            let owner = self.owner(root_type, &field.name)?;
            push(owner, Selection::Field(field.clone()));
        }
        Ok(groups)
    }

    /// Distributes the children of a namespace field to the services owning
    /// them, recursing into nested namespaces.
    fn split_namespace(
        &self,
        namespace_type: &str,
        selection_set: &[Selection],
    ) -> Result<IndexMap<String, SelectionSet>> {
        let mut fields = Vec::new();
        flatten_fields(selection_set, &mut fields);

        let mut split: IndexMap<String, SelectionSet> = IndexMap::new();
        for field in fields {
            if field.name == TYPENAME_FIELD {
                continue;
            }
            let definition = self.schema.field(namespace_type, &field.name).ok_or_else(|| {
                Error::plan(format!(
                    "field \"{}\" does not exist on type \"{namespace_type}\"",
                    field.name
                ))
            })?;
            let field_type = definition.ty.named_type();
            if self.schema.is_namespace(field_type) {
                for (service, children) in self.split_namespace(field_type, &field.selection_set)? {
                    split.entry(service).or_default().push(Selection::Field(Field {
                        selection_set: children,
                        ..field.clone()
                    }));
                }
            } else {
                let owner = self.owner(namespace_type, &field.name)?;
                split.entry(owner).or_default().push(Selection::Field(field.clone()));
            }
        }
        Ok(split)
    }

    fn owner(&self, type_name: &str, field_name: &str) -> Result<String> {
        self.federated
            .owners(type_name, field_name)
            .first()
            .cloned()
            .ok_or_else(|| {
                Error::plan(format!("no service provides field \"{type_name}.{field_name}\""))
            })
    }

    /// Returns the part of `selection_set` that `service` resolves and cuts a
    /// child step for every group of fields owned by another service on a
    /// boundary type.
    fn extract_selection_set(
        &self,
        service: &str,
        parent_type: &str,
        selection_set: &[Selection],
        insertion_point: &[String],
    ) -> Result<(SelectionSet, Vec<QueryPlanStep>)> {
        let is_boundary = self.schema.is_boundary(parent_type);
        let id_field = &self.federated.id_field.name;
        let mut out = SelectionSet::new();
        let mut steps = Vec::new();
        let mut foreign: IndexMap<String, SelectionSet> = IndexMap::new();

        for selection in selection_set {
            match selection {
                Selection::Field(field) => {
                    if field.name == TYPENAME_FIELD {
                        out.push(selection.clone());
                        continue;
                    }
                    let definition = self.schema.field(parent_type, &field.name).ok_or_else(|| {
                        Error::plan(format!(
                            "field \"{}\" does not exist on type \"{parent_type}\"",
                            field.name
                        ))
                    })?;

                    if is_boundary && field.name != *id_field {
                        let owners = self.federated.owners(parent_type, &field.name);
                        if !owners.iter().any(|owner| owner == service) {
                            let owner = owners.first().ok_or_else(|| {
                                Error::plan(format!(
                                    "no service provides field \"{parent_type}.{}\"",
                                    field.name
                                ))
                            })?;
                            foreign.entry(owner.clone()).or_default().push(selection.clone());
                            continue;
                        }
                    }

                    let arguments = field
                        .arguments
                        .iter()
                        .map(|(name, value)| {
                            let ty = definition.argument(name).map(|arg| &arg.ty);
                            (name.clone(), value.inline_variables(self.variables, ty, self.schema))
                        })
                        .collect();

                    let selection_set = if field.selection_set.is_empty() {
                        Vec::new()
                    } else {
                        let mut path = insertion_point.to_vec();
                        path.push(field.response_key().to_string());
                        let (selection_set, children) = self.extract_selection_set(
                            service,
                            definition.ty.named_type(),
                            &field.selection_set,
                            &path,
                        )?;
                        steps.extend(children);
                        selection_set
                    };

                    out.push(Selection::Field(Field {
                        arguments,
                        selection_set,
                        ..field.clone()
                    }));
                }
                Selection::InlineFragment(fragment) => {
                    let condition = fragment.type_condition.as_deref().unwrap_or(parent_type);
                    let (selection_set, children) = self.extract_selection_set(
                        service,
                        condition,
                        &fragment.selection_set,
                        insertion_point,
                    )?;
                    steps.extend(children);
                    if !selection_set.is_empty() {
                        out.push(Selection::InlineFragment(InlineFragment {
                            type_condition: fragment.type_condition.clone(),
                            selection_set,
                        }));
                    }
                }
            }
        }

        if is_boundary && !has_response_key(&out, BRAMBLE_ID) {
            out.push(Selection::Field(Field::aliased(BRAMBLE_ID, id_field.as_str())));
        }
        if self.schema.is_abstract(parent_type) && !has_response_key(&out, BRAMBLE_TYPENAME) {
            out.push(Selection::Field(Field::aliased(BRAMBLE_TYPENAME, TYPENAME_FIELD)));
        }

        for (owner, selections) in foreign {
            let boundary_query = self
                .federated
                .boundary_query(&owner, parent_type)
                .cloned()
                .ok_or_else(|| {
                    Error::plan(format!(
                        "service \"{owner}\" has no boundary query for type \"{parent_type}\""
                    ))
                })?;
            let (selection_set, then) =
                self.extract_selection_set(&owner, parent_type, &selections, insertion_point)?;
            steps.push(QueryPlanStep {
                service_url: self.service_url(&owner)?,
                service_name: owner,
                parent_type: parent_type.to_string(),
                selection_set,
                insertion_point: insertion_point.to_vec(),
                boundary_query: Some(boundary_query),
                then,
            });
        }

        Ok((out, steps))
    }
}

/// Fields of a root or namespace selection set, with fragments flattened
fn flatten_fields<'s>(selection_set: &'s [Selection], out: &mut Vec<&'s Field>) {
    for selection in selection_set {
        match selection {
            Selection::Field(field) => out.push(field),
            Selection::InlineFragment(fragment) => flatten_fields(&fragment.selection_set, out),
        }
    }
}
