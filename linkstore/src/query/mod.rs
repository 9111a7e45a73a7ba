// Query builder and the modifier scopes derived from a filter record

use crate::record::Record;
use rusqlite::types::Value;

/// A query transformation. Scopes own everything they capture, so the same
/// scope can be applied to any number of queries.
pub type Scope = Box<dyn Fn(Query) -> Query + Send + Sync>;

/// A SELECT against a single table, built up from scopes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    table: String,
    predicates: Vec<String>,
    params: Vec<Value>,
    orders: Vec<String>,
    limit: Option<u64>,
}

impl Query {
    pub fn table(name: &str) -> Self {
        Query {
            table: name.to_string(),
            ..Default::default()
        }
    }

    /// Add a predicate. It is ANDed with the existing ones and its `?`
    /// placeholders bind to `args` in order.
    pub fn filter(mut self, predicate: &str, args: Vec<Value>) -> Self {
        self.predicates.push(predicate.to_string());
        self.params.extend(args);
        self
    }

    pub fn order(mut self, clause: &str) -> Self {
        self.orders.push(clause.to_string());
        self
    }

    /// Drop any ordering and order by `clause` only.
    pub fn reorder(mut self, clause: &str) -> Self {
        self.orders.clear();
        self.orders.push(clause.to_string());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn scopes(self, scopes: &[Scope]) -> Self {
        scopes.iter().fold(self, |query, scope| scope(query))
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn to_select_sql(&self, columns: &[&str]) -> String {
        let cols = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!("SELECT {cols} FROM {}", quote_ident(&self.table));
        self.push_where(&mut sql);
        if !self.orders.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.orders.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql
    }

    /// Count rows matching the predicates. Ordering and limit do not apply.
    pub fn to_count_sql(&self) -> String {
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&self.table));
        self.push_where(&mut sql);
        sql
    }

    fn push_where(&self, sql: &mut String) {
        if self.predicates.is_empty() {
            return;
        }
        let clauses: Vec<String> = self.predicates.iter().map(|p| format!("({p})")).collect();
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Equality filter over every non-zero persistable field of `record`.
pub fn example_scope(record: &Record) -> Option<Scope> {
    let fields = record.non_zero_fields();
    if fields.is_empty() {
        return None;
    }
    let predicate = fields
        .iter()
        .map(|(name, _)| format!("{} = ?", quote_ident(name)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let args: Vec<Value> = fields.into_iter().map(|(_, v)| v).collect();
    Some(Box::new(move |q: Query| q.filter(&predicate, args.clone())))
}

/// Translate a filter record and its query params into scopes.
///
/// A raw expression replaces the query-by-example filter entirely; the other
/// params each add one independent scope.
pub fn query_modifiers(record: &Record) -> Vec<Scope> {
    let params = record.query_params();
    let mut scopes: Vec<Scope> = Vec::new();

    match params.expr.as_ref().filter(|e| !e.is_empty()) {
        Some(expr) => {
            let expr = expr.clone();
            scopes.push(Box::new(move |q: Query| q.filter(&expr.expr, expr.args.clone())));
        }
        None => scopes.extend(example_scope(record)),
    }

    if let Some(prefix) = params.key_starts_with.clone().filter(|p| !p.is_empty()) {
        let len = prefix.chars().count() as i64;
        scopes.push(Box::new(move |q: Query| {
            q.filter(
                "substr(\"key\", 1, ?) = ?",
                vec![Value::Integer(len), Value::Text(prefix.clone())],
            )
        }));
    }

    if let Some(order_by) = params.order_by.clone().filter(|o| !o.trim().is_empty()) {
        scopes.push(Box::new(move |q: Query| q.order(&order_by)));
    }

    if let Some(limit) = params.limit {
        scopes.push(Box::new(move |q: Query| q.limit(limit)));
    }

    scopes
}
