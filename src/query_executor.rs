use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, join_all};
use indexmap::IndexSet;
use reqwest::header::HeaderMap;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::graphql_client::{GraphQLClient, ServiceResponse};
use crate::operation::{Field, InputValue, OperationKind, Selection, format_selection_set};
use crate::response::{BRAMBLE_ID, BRAMBLE_TYPENAME, GraphQLError, Location, PathSegment};
use crate::{BoundaryQuery, FederatedSchema, QueryPlan, QueryPlanStep};

const BATCH_ALIAS: &str = "_result";

/// Per-operation execution state supplied by the gateway
#[derive(Clone, Debug, Default)]
pub struct ExecutionContext {
    /// Headers forwarded to every service
    pub headers: HeaderMap,
    pub cancellation: CancellationToken,
    pub deadline: Option<Instant>,
}

/// Merged data, still carrying routing tokens, and the errors of all steps
#[derive(Debug, Default)]
pub struct ExecutionResult {
    pub data: Map<String, Value>,
    pub errors: Vec<GraphQLError>,
}

#[async_trait]
pub trait QueryExecutor {
    async fn execute_plan(
        &self,
        plan: &QueryPlan,
        schema: &FederatedSchema,
        context: &ExecutionContext,
    ) -> Result<ExecutionResult>;
}

pub struct HttpQueryExecutor {
    client: GraphQLClient,
    max_requests_per_query: usize,
}

impl HttpQueryExecutor {
    pub fn new(client: GraphQLClient, max_requests_per_query: usize) -> Self {
        HttpQueryExecutor {
            client,
            max_requests_per_query,
        }
    }

    /// Runs a step, then its children against the objects it returned.
    fn execute_step<'a>(
        &'a self,
        kind: OperationKind,
        step: &'a QueryPlanStep,
        ids: Vec<String>,
        budget: &'a AtomicUsize,
        context: &'a ExecutionContext,
    ) -> BoxFuture<'a, StepOutput<'a>> {
        async move {
            let document = match &step.boundary_query {
                Some(boundary_query) => boundary_document(boundary_query, &ids, &step.selection_set),
                None => format!("{} {}", kind.as_str(), format_selection_set(&step.selection_set)),
            };

            let mut output = StepOutput {
                step,
                result: StepResult::Failed,
                errors: Vec::new(),
                children: Vec::new(),
            };

            if budget.fetch_add(1, Ordering::SeqCst) >= self.max_requests_per_query {
                output.errors = step_errors(step, &Error::TooManyRequests(self.max_requests_per_query));
                return output;
            }

            let started = Instant::now();
            let response = match self
                .client
                .request(&step.service_url, &document, &context.headers)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        service = %step.service_name,
                        url = %step.service_url,
                        error = %e,
                        "service request failed"
                    );
                    output.errors = step_errors(step, &e);
                    return output;
                }
            };
            debug!(
                service = %step.service_name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                errors = response.errors.len(),
                "step completed"
            );

            let ServiceResponse { data, errors } = response;
            output.errors = rewrite_service_errors(step, errors);
            output.result = match &step.boundary_query {
                Some(boundary_query) => {
                    StepResult::Entities(extract_entities(boundary_query, &ids, data))
                }
                None => StepResult::Root(match data {
                    Some(Value::Object(data)) => data,
                    _ => Map::new(),
                }),
            };

            let sources: Vec<&Map<String, Value>> = match &output.result {
                StepResult::Root(data) => vec![data],
                StepResult::Entities(entities) => {
                    entities.values().filter_map(Value::as_object).collect()
                }
                StepResult::Failed => Vec::new(),
            };
            let mut children = Vec::new();
            for child in &step.then {
                let relative = &child.insertion_point[step.insertion_point.len()..];
                let mut child_ids = IndexSet::new();
                for source in &sources {
                    collect_object_ids(source, relative, &child.parent_type, &mut child_ids);
                }
                if child_ids.is_empty() {
                    debug!(service = %child.service_name, "skipping step without parent ids");
                    continue;
                }
                children.push(self.execute_step(
                    OperationKind::Query,
                    child,
                    child_ids.into_iter().collect(),
                    budget,
                    context,
                ));
            }
            output.children = join_all(children).await;
            output
        }
        .boxed()
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn execute_plan(
        &self,
        plan: &QueryPlan,
        _schema: &FederatedSchema,
        context: &ExecutionContext,
    ) -> Result<ExecutionResult> {
        let budget = AtomicUsize::new(0);

        let run = async {
            let outputs = match plan.operation_kind {
                OperationKind::Mutation => {
                    let mut outputs = Vec::with_capacity(plan.root_steps.len());
                    for step in &plan.root_steps {
                        outputs.push(
                            self.execute_step(plan.operation_kind, step, Vec::new(), &budget, context)
                                .await,
                        );
                    }
                    outputs
                }
                _ => {
                    join_all(plan.root_steps.iter().map(|step| {
                        self.execute_step(plan.operation_kind, step, Vec::new(), &budget, context)
                    }))
                    .await
                }
            };

            let mut result = ExecutionResult::default();
            for output in outputs {
                merge_output(&mut result, output);
            }
            result
        };

        let deadline = async {
            match context.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = context.cancellation.cancelled() => Err(Error::Cancelled),
            _ = deadline => Err(Error::DeadlineExceeded),
            result = run => {
                debug!(requests = budget.load(Ordering::SeqCst), "plan executed");
                Ok(result)
            }
        }
    }
}

struct StepOutput<'p> {
    step: &'p QueryPlanStep,
    result: StepResult,
    errors: Vec<GraphQLError>,
    children: Vec<StepOutput<'p>>,
}

enum StepResult {
    Root(Map<String, Value>),
    /// Entities keyed by their stringified id
    Entities(HashMap<String, Value>),
    Failed,
}

/// Builds the lookup document for a boundary step
fn boundary_document(boundary_query: &BoundaryQuery, ids: &[String], selection_set: &[Selection]) -> String {
    let fields: Vec<Selection> = if boundary_query.array {
        vec![Selection::Field(Field {
            alias: Some(BATCH_ALIAS.to_string()),
            name: boundary_query.field.clone(),
            arguments: vec![(
                boundary_query.argument.clone(),
                InputValue::List(ids.iter().cloned().map(InputValue::String).collect()),
            )],
            selection_set: selection_set.to_vec(),
            position: Default::default(),
        })]
    } else {
        ids.iter()
            .enumerate()
            .map(|(index, id)| {
                Selection::Field(Field {
                    alias: Some(format!("_{index}")),
                    name: boundary_query.field.clone(),
                    arguments: vec![(boundary_query.argument.clone(), InputValue::String(id.clone()))],
                    selection_set: selection_set.to_vec(),
                    position: Default::default(),
                })
            })
            .collect()
    };
    format!("query {}", format_selection_set(&fields))
}

/// Entities of a boundary response keyed by id. Rows without an id token
/// fall back to the id requested at the same position.
fn extract_entities(
    boundary_query: &BoundaryQuery,
    ids: &[String],
    data: Option<Value>,
) -> HashMap<String, Value> {
    let Some(Value::Object(mut data)) = data else {
        return HashMap::new();
    };
    let rows: Vec<Value> = if boundary_query.array {
        match data.remove(BATCH_ALIAS) {
            Some(Value::Array(rows)) => rows,
            _ => Vec::new(),
        }
    } else {
        (0..ids.len())
            .map(|index| data.remove(&format!("_{index}")).unwrap_or(Value::Null))
            .collect()
    };

    let mut entities = HashMap::new();
    for (index, row) in rows.into_iter().enumerate() {
        if !row.is_object() {
            continue;
        }
        let id = row
            .get(BRAMBLE_ID)
            .and_then(id_string)
            .or_else(|| ids.get(index).cloned());
        if let Some(id) = id {
            entities.insert(id, row);
        }
    }
    entities
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// True unless the object carries a type token for a different type
fn matches_type(object: &Map<String, Value>, parent_type: &str) -> bool {
    object
        .get(BRAMBLE_TYPENAME)
        .and_then(Value::as_str)
        .is_none_or(|typename| typename == parent_type)
}

/// Collects the ids of the objects found at `path` below `value`
fn collect_ids(value: &Value, path: &[String], parent_type: &str, ids: &mut IndexSet<String>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_ids(item, path, parent_type, ids);
            }
        }
        Value::Object(object) => collect_object_ids(object, path, parent_type, ids),
        _ => {}
    }
}

fn collect_object_ids(
    object: &Map<String, Value>,
    path: &[String],
    parent_type: &str,
    ids: &mut IndexSet<String>,
) {
    match path.split_first() {
        None => {
            if matches_type(object, parent_type) {
                if let Some(id) = object.get(BRAMBLE_ID).and_then(id_string) {
                    ids.insert(id);
                }
            }
        }
        Some((key, rest)) => {
            if let Some(next) = object.get(key) {
                collect_ids(next, rest, parent_type, ids);
            }
        }
    }
}

/// Merges `entities` into every object at `path` whose id matches
fn splice(value: &mut Value, path: &[String], parent_type: &str, entities: &HashMap<String, Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                splice(item, path, parent_type, entities);
            }
        }
        Value::Object(object) => match path.split_first() {
            None => {
                if !matches_type(object, parent_type) {
                    return;
                }
                let entity = object
                    .get(BRAMBLE_ID)
                    .and_then(id_string)
                    .and_then(|id| entities.get(&id));
                if let Some(Value::Object(fields)) = entity {
                    for (key, field) in fields {
                        merge_field(object, key.clone(), field.clone());
                    }
                }
            }
            Some((key, rest)) => {
                if let Some(next) = object.get_mut(key) {
                    splice(next, rest, parent_type, entities);
                }
            }
        },
        _ => {}
    }
}

fn merge_field(object: &mut Map<String, Value>, key: String, value: Value) {
    match object.get_mut(&key) {
        Some(existing) => deep_merge(existing, value),
        None => {
            object.insert(key, value);
        }
    }
}

fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                merge_field(target, key, value);
            }
        }
        (Value::Array(target), Value::Array(source)) if target.len() == source.len() => {
            for (target, source) in target.iter_mut().zip(source) {
                deep_merge(target, source);
            }
        }
        (_, Value::Null) => {}
        (target, source) => *target = source,
    }
}

/// Applies step outputs in plan order: parents before children
fn merge_output(result: &mut ExecutionResult, output: StepOutput<'_>) {
    result.errors.extend(output.errors);
    match output.result {
        StepResult::Root(data) => {
            for (key, value) in data {
                merge_field(&mut result.data, key, value);
            }
        }
        StepResult::Entities(entities) => {
            let path = &output.step.insertion_point;
            if let Some((first, rest)) = path.split_first() {
                if let Some(next) = result.data.get_mut(first) {
                    splice(next, rest, &output.step.parent_type, &entities);
                }
            }
        }
        StepResult::Failed => {}
    }
    for child in output.children {
        merge_output(result, child);
    }
}

fn insertion_path(step: &QueryPlanStep) -> Vec<PathSegment> {
    step.insertion_point
        .iter()
        .map(|key| PathSegment::Key(key.clone()))
        .collect()
}

fn step_extensions(step: &QueryPlanStep, extensions: &mut Map<String, Value>) {
    extensions.insert("serviceName".to_string(), json!(step.service_name));
    extensions.insert("serviceUrl".to_string(), json!(step.service_url));
    extensions.insert(
        "selectionSet".to_string(),
        json!(format_selection_set(&step.selection_set)),
    );
}

/// Fields of the client document a step selects at its top level. Fields the
/// planner injected carry no position and are left out.
fn top_level_fields(selection_set: &[Selection]) -> Vec<&Field> {
    let mut fields = Vec::new();
    for selection in selection_set {
        match selection {
            Selection::Field(field) if field.position.line > 0 => fields.push(field),
            Selection::Field(_) => {}
            Selection::InlineFragment(fragment) => {
                fields.extend(top_level_fields(&fragment.selection_set));
            }
        }
    }
    fields
}

fn locations(fields: &[&Field]) -> Vec<Location> {
    fields.iter().map(|field| Location::from(field.position)).collect()
}

/// Error records for a step that produced no response. A root step reports
/// one record per top-level field at that field's path; a child step reports
/// one record at its insertion point.
fn step_errors(step: &QueryPlanStep, error: &Error) -> Vec<GraphQLError> {
    let fields = top_level_fields(&step.selection_set);
    let record = |path: Vec<PathSegment>, locations: Vec<Location>| {
        let mut record = error.to_graphql_error().with_path(path);
        record.locations = locations;
        step_extensions(step, &mut record.extensions);
        record
    };

    if step.boundary_query.is_some() || fields.is_empty() {
        return vec![record(insertion_path(step), locations(&fields))];
    }
    fields
        .iter()
        .map(|field| {
            let mut path = insertion_path(step);
            path.push(PathSegment::from(field.response_key()));
            record(path, vec![Location::from(field.position)])
        })
        .collect()
}

/// Service errors keep their message and code. Locations are replaced by the
/// positions of the client fields the step selected; paths of child steps
/// point at the insertion point.
fn rewrite_service_errors(step: &QueryPlanStep, errors: Vec<GraphQLError>) -> Vec<GraphQLError> {
    let fields = top_level_fields(&step.selection_set);
    errors
        .into_iter()
        .map(|mut error| {
            if step.boundary_query.is_some() {
                error.path = insertion_path(step);
                error.locations = locations(&fields);
            } else {
                let field = match error.path.first() {
                    Some(PathSegment::Key(key)) => {
                        fields.iter().find(|field| field.response_key() == key)
                    }
                    _ => None,
                };
                error.locations = match field {
                    Some(field) => vec![Location::from(field.position)],
                    None => locations(&fields),
                };
            }
            step_extensions(step, &mut error.extensions);
            error
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{InlineFragment, Pos};
    use pretty_assertions::assert_eq;

    fn step(insertion_point: &[&str], parent_type: &str, boundary_query: Option<BoundaryQuery>) -> QueryPlanStep {
        QueryPlanStep {
            service_name: "reviews".to_string(),
            service_url: "http://reviews/query".to_string(),
            parent_type: parent_type.to_string(),
            selection_set: vec![
                Selection::Field(Field::new("rating")),
                Selection::Field(Field::aliased(BRAMBLE_ID, "id")),
            ],
            insertion_point: insertion_point.iter().map(|s| s.to_string()).collect(),
            boundary_query,
            then: Vec::new(),
        }
    }

    fn batch() -> BoundaryQuery {
        BoundaryQuery {
            field: "movies".to_string(),
            argument: "ids".to_string(),
            array: true,
        }
    }

    #[test]
    fn test_boundary_documents() {
        let selection_set = step(&["movies"], "Movie", None).selection_set;
        let ids = vec!["1".to_string(), "2".to_string()];
        assert_eq!(
            boundary_document(&batch(), &ids, &selection_set),
            r#"query { _result: movies(ids: ["1", "2"]) { rating _bramble_id: id } }"#
        );

        let singular = BoundaryQuery {
            field: "movie".to_string(),
            argument: "id".to_string(),
            array: false,
        };
        assert_eq!(
            boundary_document(&singular, &ids, &selection_set),
            r#"query { _0: movie(id: "1") { rating _bramble_id: id } _1: movie(id: "2") { rating _bramble_id: id } }"#
        );
    }

    #[test]
    fn test_collect_ids_walks_lists_and_filters_by_type() {
        let data = json!({
            "movies": [
                { "_bramble_id": "1", "_bramble__typename": "Movie" },
                { "_bramble_id": "2", "_bramble__typename": "Series" },
                null,
                { "_bramble_id": 3 },
                { "_bramble_id": "1" }
            ]
        });
        let mut ids = IndexSet::new();
        collect_ids(&data, &["movies".to_string()], "Movie", &mut ids);
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["1", "3"]);
    }

    #[test]
    fn test_entities_fall_back_to_position() {
        let singular = BoundaryQuery {
            field: "movie".to_string(),
            argument: "id".to_string(),
            array: false,
        };
        let data = json!({ "_0": { "rating": 5 }, "_1": null });
        let entities = extract_entities(&singular, &["7".to_string(), "8".to_string()], Some(data));
        assert_eq!(entities.len(), 1);
        assert_eq!(entities["7"], json!({ "rating": 5 }));
    }

    #[test]
    fn test_merge_splices_children_into_duplicates() {
        let root = step(&[], "Query", None);
        let child = step(&["movies"], "Movie", Some(batch()));
        let output = StepOutput {
            step: &root,
            result: StepResult::Root(
                json!({ "movies": [{ "_bramble_id": "1", "title": "A" }, { "_bramble_id": "1", "title": "A" }] })
                    .as_object()
                    .cloned()
                    .unwrap(),
            ),
            errors: Vec::new(),
            children: vec![StepOutput {
                step: &child,
                result: StepResult::Entities(HashMap::from([(
                    "1".to_string(),
                    json!({ "_bramble_id": "1", "rating": 4 }),
                )])),
                errors: vec![GraphQLError::new("partial").with_path(vec!["_result".into(), 0.into()])],
                children: Vec::new(),
            }],
        };

        let mut result = ExecutionResult::default();
        merge_output(&mut result, output);

        assert_eq!(
            Value::Object(result.data),
            json!({ "movies": [
                { "_bramble_id": "1", "title": "A", "rating": 4 },
                { "_bramble_id": "1", "title": "A", "rating": 4 }
            ] })
        );
        assert_eq!(result.errors[0].message, "partial");
    }

    fn positioned(field: Field, line: usize, column: usize) -> Selection {
        Selection::Field(Field {
            position: Pos { line, column },
            ..field
        })
    }

    #[test]
    fn test_child_errors_point_at_insertion_point() {
        let mut child = step(&["movies"], "Movie", Some(batch()));
        child.selection_set[0] = positioned(Field::new("rating"), 3, 7);
        let mut error = GraphQLError::new("boom").with_path(vec!["_result".into(), 0.into()]);
        error.locations = vec![Location { line: 1, column: 40 }];
        error.extensions.insert("code".to_string(), json!("NOT_FOUND"));

        let rewritten = rewrite_service_errors(&child, vec![error]);

        assert_eq!(rewritten[0].path, vec![PathSegment::from("movies")]);
        assert_eq!(rewritten[0].locations, vec![Location { line: 3, column: 7 }]);
        assert_eq!(rewritten[0].extensions["code"], json!("NOT_FOUND"));
        assert_eq!(rewritten[0].extensions["serviceName"], json!("reviews"));
        assert_eq!(
            rewritten[0].extensions["selectionSet"],
            json!("{ rating _bramble_id: id }")
        );
    }

    #[test]
    fn test_root_errors_keep_service_path() {
        let mut root = step(&[], "Query", None);
        root.selection_set = vec![
            positioned(Field::new("movies"), 1, 3),
            positioned(Field::aliased("theatre", "cinema"), 2, 3),
        ];
        let error = GraphQLError::new("closed").with_path(vec!["theatre".into(), "name".into()]);

        let rewritten = rewrite_service_errors(&root, vec![error]);

        assert_eq!(
            rewritten[0].path,
            vec![PathSegment::from("theatre"), PathSegment::from("name")]
        );
        assert_eq!(rewritten[0].locations, vec![Location { line: 2, column: 3 }]);
    }

    #[test]
    fn test_failed_root_step_reports_every_field() {
        let mut root = step(&[], "Query", None);
        root.selection_set = vec![
            positioned(Field::new("movies"), 1, 3),
            Selection::InlineFragment(InlineFragment {
                type_condition: Some("Query".to_string()),
                selection_set: vec![positioned(Field::aliased("theatre", "cinema"), 2, 17)],
            }),
        ];

        let records = step_errors(&root, &Error::TooManyRequests(2));

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "exceeded max requests per query (2)");
        assert_eq!(records[0].path, vec![PathSegment::from("movies")]);
        assert_eq!(records[0].locations, vec![Location { line: 1, column: 3 }]);
        assert_eq!(records[1].path, vec![PathSegment::from("theatre")]);
        assert_eq!(records[1].locations, vec![Location { line: 2, column: 17 }]);
        assert_eq!(records[1].extensions["serviceUrl"], json!("http://reviews/query"));
    }

    #[test]
    fn test_failed_child_step_is_one_record_at_insertion_point() {
        let mut child = step(&["movies"], "Movie", Some(batch()));
        child.selection_set[0] = positioned(Field::new("rating"), 4, 5);

        let records = step_errors(&child, &Error::TooManyRequests(2));

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, vec![PathSegment::from("movies")]);
        assert_eq!(records[0].locations, vec![Location { line: 4, column: 5 }]);
    }
}
