//! Named queries and the typed query catalog.
//!
//! A named query is registered once, under a unique name, as a compiled plan:
//! declared parameters, a filter over typed entities, an optional ordering
//! and an optional row limit. Descriptors are validated when they are built
//! and registered, so a malformed query never reaches call time. Arguments
//! are still checked at call time against the declared parameters.

use crate::errors::{AccessError, AccessResult};
use crate::types::QueryValue;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// Declared type of a query parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "item", rename_all = "snake_case")]
pub enum ParamType {
    /// Any JSON value.
    Any,
    String,
    /// Whole number (signed or unsigned).
    Integer,
    /// Any number, integral or not.
    Number,
    Boolean,
    /// RFC 3339 timestamp string.
    Timestamp,
    /// Hyphenated UUID string.
    Uuid,
    /// Array whose items all have the given type (e.g. for `IN` filters).
    List(Box<ParamType>),
}

impl ParamType {
    /// Shorthand for `List(item)`.
    pub fn list_of(item: ParamType) -> Self {
        Self::List(Box::new(item))
    }

    /// Check whether a non-null value satisfies this type.
    pub fn accepts(&self, value: &QueryValue) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Timestamp => value
                .as_str()
                .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok()),
            Self::Uuid => value.as_str().is_some_and(|s| Uuid::parse_str(s).is_ok()),
            Self::List(item) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|v| item.accepts(v))),
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::String => write!(f, "string"),
            Self::Integer => write!(f, "integer"),
            Self::Number => write!(f, "number"),
            Self::Boolean => write!(f, "boolean"),
            Self::Timestamp => write!(f, "timestamp"),
            Self::Uuid => write!(f, "uuid"),
            Self::List(item) => write!(f, "list<{}>", item),
        }
    }
}

fn kind_of(value: &QueryValue) -> &'static str {
    match value {
        QueryValue::Null => "null",
        QueryValue::Bool(_) => "boolean",
        QueryValue::Number(_) => "number",
        QueryValue::String(_) => "string",
        QueryValue::Array(_) => "array",
        QueryValue::Object(_) => "object",
    }
}

/// A declared query parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDecl {
    pub name: String,
    pub param_type: ParamType,

    /// Whether `null` may be bound.
    #[serde(default)]
    pub nullable: bool,
}

impl ParamDecl {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            nullable: false,
        }
    }

    fn check(&self, query_name: &str, value: &QueryValue) -> AccessResult<()> {
        if value.is_null() {
            if self.nullable {
                return Ok(());
            }
        } else if self.param_type.accepts(value) {
            return Ok(());
        }

        Err(AccessError::parameter_mismatch(
            query_name,
            format!(
                "Parameter '{}' of query {} expects {}, got {}",
                self.name,
                query_name,
                self.param_type,
                kind_of(value)
            ),
        )
        .with_context("parameter", &self.name)
        .with_context("expected", self.param_type.to_string())
        .with_context("provided", kind_of(value)))
    }
}

/// Named arguments for a query, keyed by parameter name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedArgs(BTreeMap<String, QueryValue>);

impl NamedArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an argument.
    pub fn arg(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert an argument in place. Values that fail to serialize bind as `null`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Serialize) {
        let value = serde_json::to_value(value).unwrap_or(QueryValue::Null);
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&QueryValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, QueryValue)> for NamedArgs {
    fn from_iter<I: IntoIterator<Item = (K, QueryValue)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<HashMap<String, QueryValue>> for NamedArgs {
    fn from(map: HashMap<String, QueryValue>) -> Self {
        Self(map.into_iter().collect())
    }
}

impl From<BTreeMap<String, QueryValue>> for NamedArgs {
    fn from(map: BTreeMap<String, QueryValue>) -> Self {
        Self(map)
    }
}

/// Arguments bound to a query's declared parameters, in declaration order.
///
/// Filters read bindings by name or by position regardless of how the
/// caller supplied them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    values: Vec<(String, QueryValue)>,
}

impl Bindings {
    pub fn get(&self, name: &str) -> Option<&QueryValue> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Value bound at a zero-based position.
    pub fn at(&self, index: usize) -> Option<&QueryValue> {
        self.values.get(index).map(|(_, v)| v)
    }

    /// Get a parameter deserialized into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(QueryValue::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(QueryValue::as_i64)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(QueryValue::as_f64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(QueryValue::as_bool)
    }

    pub fn get_timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        self.get_str(name)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn get_uuid(&self, name: &str) -> Option<Uuid> {
        self.get_str(name).and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn get_list(&self, name: &str) -> Option<&[QueryValue]> {
        self.get(name)
            .and_then(QueryValue::as_array)
            .map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &QueryValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

type Filter<E> = Arc<dyn Fn(&E, &Bindings) -> bool + Send + Sync>;
type Comparator<E> = Arc<dyn Fn(&E, &E) -> Ordering + Send + Sync>;

/// A compiled, validated named query over entities of type `E`.
pub struct NamedQuery<E> {
    name: String,
    description: Option<String>,
    params: Vec<ParamDecl>,
    filter: Filter<E>,
    order: Option<Comparator<E>>,
    max_results: Option<usize>,
}

impl<E> Clone for NamedQuery<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            params: self.params.clone(),
            filter: Arc::clone(&self.filter),
            order: self.order.clone(),
            max_results: self.max_results,
        }
    }
}

impl<E> std::fmt::Debug for NamedQuery<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedQuery")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("ordered", &self.order.is_some())
            .field("max_results", &self.max_results)
            .finish()
    }
}

impl<E> NamedQuery<E> {
    /// Start building a query.
    pub fn builder(name: impl Into<String>) -> NamedQueryBuilder<E> {
        NamedQueryBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ParamDecl] {
        &self.params
    }

    pub fn max_results(&self) -> Option<usize> {
        self.max_results
    }

    /// Bind positional arguments to the declared parameters, in order.
    pub fn bind_positional(&self, args: &[QueryValue]) -> AccessResult<Bindings> {
        if args.len() != self.params.len() {
            return Err(AccessError::parameter_mismatch(
                &self.name,
                format!(
                    "Query {} declares {} parameter(s), {} positional argument(s) given",
                    self.name,
                    self.params.len(),
                    args.len()
                ),
            )
            .with_context("expected", self.params.len())
            .with_context("provided", args.len()));
        }

        let mut values = Vec::with_capacity(args.len());
        for (decl, value) in self.params.iter().zip(args) {
            decl.check(&self.name, value)?;
            values.push((decl.name.clone(), value.clone()));
        }
        Ok(Bindings { values })
    }

    /// Bind named arguments. Keys must match the declared names exactly.
    pub fn bind_named(&self, args: &NamedArgs) -> AccessResult<Bindings> {
        let declared: BTreeSet<&str> = self.params.iter().map(|p| p.name.as_str()).collect();
        let provided: BTreeSet<&str> = args.keys().collect();

        let missing: Vec<&str> = declared.difference(&provided).copied().collect();
        let unexpected: Vec<&str> = provided.difference(&declared).copied().collect();

        if !missing.is_empty() || !unexpected.is_empty() {
            let mut message = format!(
                "Arguments do not match the parameters of query {}",
                self.name
            );
            if !missing.is_empty() {
                message.push_str(&format!("; missing: {}", missing.join(", ")));
            }
            if !unexpected.is_empty() {
                message.push_str(&format!("; unexpected: {}", unexpected.join(", ")));
            }
            return Err(AccessError::parameter_mismatch(&self.name, message)
                .with_context("missing", &missing)
                .with_context("unexpected", &unexpected));
        }

        let mut values = Vec::with_capacity(self.params.len());
        for decl in &self.params {
            let value = args
                .get(&decl.name)
                .ok_or_else(|| AccessError::internal(format!("argument {} vanished", decl.name)))?;
            decl.check(&self.name, value)?;
            values.push((decl.name.clone(), value.clone()));
        }
        Ok(Bindings { values })
    }

    /// Does a single entity satisfy the filter?
    pub fn matches(&self, entity: &E, bindings: &Bindings) -> bool {
        (self.filter)(entity, bindings)
    }

    /// Run the plan over candidate rows given in store order.
    ///
    /// Filters, then applies the declared ordering (stable, so ties keep store
    /// order), then the row limit.
    pub fn apply(&self, rows: Vec<E>, bindings: &Bindings) -> Vec<E> {
        let mut matched: Vec<E> = rows
            .into_iter()
            .filter(|row| self.matches(row, bindings))
            .collect();

        if let Some(order) = &self.order {
            matched.sort_by(|a, b| order(a, b));
        }
        if let Some(limit) = self.max_results {
            matched.truncate(limit);
        }
        matched
    }

    /// Descriptor for listings.
    pub fn info(&self) -> QueryInfo {
        QueryInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            params: self.params.clone(),
            ordered: self.order.is_some(),
            max_results: self.max_results,
        }
    }
}

/// Builder for [`NamedQuery`].
pub struct NamedQueryBuilder<E> {
    name: String,
    description: Option<String>,
    params: Vec<ParamDecl>,
    filter: Option<Filter<E>>,
    order: Option<Comparator<E>>,
    max_results: Option<usize>,
}

impl<E> NamedQueryBuilder<E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            params: vec![],
            filter: None,
            order: None,
            max_results: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare a parameter. Declaration order is the positional order.
    pub fn param(mut self, name: impl Into<String>, param_type: ParamType) -> Self {
        self.params.push(ParamDecl::new(name, param_type));
        self
    }

    /// Declare a parameter that also accepts `null`.
    pub fn nullable_param(mut self, name: impl Into<String>, param_type: ParamType) -> Self {
        let mut decl = ParamDecl::new(name, param_type);
        decl.nullable = true;
        self.params.push(decl);
        self
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&E, &Bindings) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn order_by<F>(mut self, compare: F) -> Self
    where
        F: Fn(&E, &E) -> Ordering + Send + Sync + 'static,
    {
        self.order = Some(Arc::new(compare));
        self
    }

    pub fn max_results(mut self, limit: usize) -> Self {
        self.max_results = Some(limit);
        self
    }

    /// Validate and compile the query.
    pub fn build(self) -> AccessResult<NamedQuery<E>> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(AccessError::invalid_query(&self.name, "Query name must not be empty"));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(AccessError::invalid_query(
                &name,
                format!("Query name '{}' must not contain whitespace", name),
            ));
        }
        if self.max_results == Some(0) {
            return Err(AccessError::invalid_query(&name, "max_results must be at least 1"));
        }

        let mut seen = BTreeSet::new();
        for decl in &self.params {
            if decl.name.trim().is_empty() {
                return Err(AccessError::invalid_query(
                    &name,
                    format!("Query {} declares a parameter with an empty name", name),
                ));
            }
            if !seen.insert(decl.name.as_str()) {
                return Err(AccessError::invalid_query(
                    &name,
                    format!("Query {} declares parameter '{}' twice", name, decl.name),
                )
                .with_context("parameter", &decl.name));
            }
        }

        let filter = self.filter.ok_or_else(|| {
            AccessError::invalid_query(&name, format!("Query {} has no filter", name))
        })?;

        Ok(NamedQuery {
            name,
            description: self.description,
            params: self.params,
            filter,
            order: self.order,
            max_results: self.max_results,
        })
    }
}

/// Information about a registered query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryInfo {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub params: Vec<ParamDecl>,

    /// Whether the query declares its own ordering (otherwise store order).
    pub ordered: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
}

/// Registry of named queries for one entity type.
///
/// Shared between units of work; registration and lookup take `&self`.
pub struct QueryCatalog<E> {
    queries: RwLock<BTreeMap<String, Arc<NamedQuery<E>>>>,
}

impl<E> QueryCatalog<E> {
    pub fn new() -> Self {
        Self {
            queries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a compiled query. Names are unique.
    pub fn register(&self, query: NamedQuery<E>) -> AccessResult<()> {
        let mut queries = self.queries.write();
        if queries.contains_key(query.name()) {
            return Err(AccessError::duplicate_query(query.name()));
        }
        tracing::debug!(
            target: "entity_access::catalog",
            query = %query.name(),
            params = query.params().len(),
            "Named query registered"
        );
        queries.insert(query.name().to_string(), Arc::new(query));
        Ok(())
    }

    /// Build and register in one step.
    pub fn define(&self, builder: NamedQueryBuilder<E>) -> AccessResult<()> {
        self.register(builder.build()?)
    }

    /// Resolve a query by name.
    pub fn get(&self, name: &str) -> AccessResult<Arc<NamedQuery<E>>> {
        self.queries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AccessError::query_not_found(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queries.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.queries.read().keys().cloned().collect()
    }

    /// Descriptors of every registered query, sorted by name.
    pub fn info(&self) -> Vec<QueryInfo> {
        self.queries.read().values().map(|q| q.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.queries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.read().is_empty()
    }
}

impl<E> Default for QueryCatalog<E> {
    fn default() -> Self {
        Self::new()
    }
}
